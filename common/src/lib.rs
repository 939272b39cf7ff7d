pub mod agent;
pub mod boot;
pub mod config;
pub mod failure;
pub mod flash;
pub mod hub;
pub mod link;
pub mod restart;
pub mod sensor;
pub mod stats;
pub mod telemetry;
pub mod topics;
pub mod transport;
pub mod types;
pub mod update;

pub use agent::{supervise, Agent};
pub use boot::{
    validate_boot_state, BootError, BootRecord, BootStateStore, BootStatus, FlashBootStore,
    FlashLayout, NO_PENDING_GENERATION,
};
pub use config::{AgentConfig, NetworkConfig, RuntimeConfig, SensorConfig, UpdateSourceConfig};
pub use failure::{FailureCounter, FailureVerdict};
pub use flash::{BlockDevice, FlashError, FlashRegion, MemFlash};
pub use hub::{parse_hub_line, HubReading, SensorHub};
pub use link::{ConnectivityGate, LinkState};
pub use restart::{CycleOutcome, DeviceRestart, Escalation};
pub use sensor::{SensorError, SensorId, SensorSample, SensorSource, SensorValue};
pub use stats::{LoopStats, LoopStatsSnapshot};
pub use telemetry::{TelemetryClient, TelemetryError, TelemetryService};
pub use topics::*;
pub use transport::TransportLock;
pub use types::{AgentStatus, StatusPayload};
pub use update::{
    hex_digest, PollOutcome, UpdateClient, UpdateError, UpdateManifest, UpdateService,
};

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::time::Instant;

use crate::{
    config::AgentConfig,
    failure::{FailureCounter, FailureVerdict},
    link::ConnectivityGate,
    restart::{CycleOutcome, Escalation},
    sensor::{sample_optional, sample_or_default, SensorId, SensorSource, DEFAULT_MCU_TEMP},
    stats::LoopStats,
    transport::TransportLock,
    types::StatusPayload,
};

pub const TELEMETRY_SERVICE: &str = "telemetry";

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry connect failed: {0}")]
    Connect(String),
    #[error("telemetry publish failed: {0}")]
    Publish(String),
    #[error("telemetry payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("telemetry session closed")]
    SessionClosed,
}

#[async_trait]
pub trait TelemetryClient: Send {
    type Session: Send;

    async fn init(&mut self) -> Result<Self::Session, TelemetryError>;

    async fn publish(
        &mut self,
        session: &mut Self::Session,
        payload: &StatusPayload,
    ) -> Result<(), TelemetryError>;

    async fn teardown(&mut self, session: Self::Session) -> Result<(), TelemetryError>;
}

#[derive(Debug)]
pub enum TelemetrySession<S> {
    Uninitialized,
    Active(S),
}

impl<S> Default for TelemetrySession<S> {
    fn default() -> Self {
        Self::Uninitialized
    }
}

impl<S> TelemetrySession<S> {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }

    fn take(&mut self) -> Option<S> {
        match std::mem::take(self) {
            Self::Active(session) => Some(session),
            Self::Uninitialized => None,
        }
    }
}

pub struct TelemetryService<T: TelemetryClient, S, G> {
    client: T,
    sensors: S,
    gate: G,
    lock: TransportLock,
    interval: Duration,
    failures: FailureCounter,
    session: TelemetrySession<T::Session>,
    stats: Arc<LoopStats>,
}

impl<T, S, G> TelemetryService<T, S, G>
where
    T: TelemetryClient,
    S: SensorSource,
    G: ConnectivityGate,
{
    pub fn new(client: T, sensors: S, gate: G, lock: TransportLock, config: &AgentConfig) -> Self {
        Self {
            client,
            sensors,
            gate,
            lock,
            interval: config.publish_interval(),
            failures: FailureCounter::new(config.max_consecutive_failures),
            session: TelemetrySession::Uninitialized,
            stats: Arc::new(LoopStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<LoopStats> {
        self.stats.clone()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.count()
    }

    pub fn session_active(&self) -> bool {
        self.session.is_active()
    }

    pub async fn run(mut self) -> Escalation {
        info!("starting telemetry service (publish every {:?})", self.interval);
        loop {
            tokio::time::sleep(self.interval).await;
            if let CycleOutcome::Escalate(escalation) = self.run_cycle().await {
                return escalation;
            }
        }
    }

    pub async fn run_cycle(&mut self) -> CycleOutcome {
        if !self.gate.is_link_up() {
            debug!("no network link, skipping telemetry publish");
            self.stats.record_skip();
            return CycleOutcome::Skipped;
        }

        let lock = self.lock.clone();
        let transport = lock.acquire(TELEMETRY_SERVICE).await;
        let held_since = Instant::now();

        let outcome = self.exchange().await;

        drop(transport);
        let held = held_since.elapsed();
        let cycle = self.stats.record_watermark(held);
        debug!("telemetry cycle {cycle} held the transport for {held:?}");
        outcome
    }

    async fn exchange(&mut self) -> CycleOutcome {
        if !self.session.is_active() {
            match self.client.init().await {
                Ok(session) => {
                    self.failures.record_success();
                    self.session = TelemetrySession::Active(session);
                    self.stats.set_session_active(true);
                    info!("telemetry session established");
                }
                Err(err) => return self.fail("init", &err),
            }
        }

        let primary = sample_or_default(&mut self.sensors, SensorId::McuTemp, DEFAULT_MCU_TEMP);
        let secondary = sample_optional(&mut self.sensors, SensorId::OffchipTemp);
        let payload = StatusPayload::compose(&primary, &secondary);

        let result = match &mut self.session {
            TelemetrySession::Active(session) => self.client.publish(session, &payload).await,
            TelemetrySession::Uninitialized => Err(TelemetryError::SessionClosed),
        };

        match result {
            Ok(()) => {
                debug!("published status {payload:?}");
                self.failures.record_success();
                self.stats.record_success();
                CycleOutcome::Completed
            }
            Err(err) => {
                // Any publish failure is treated as a broken session.
                if let Some(session) = self.session.take() {
                    if let Err(teardown_err) = self.client.teardown(session).await {
                        warn!("telemetry teardown failed: {teardown_err}");
                    }
                }
                self.stats.set_session_active(false);
                self.fail("publish", &err)
            }
        }
    }

    fn fail(&mut self, stage: &str, err: &TelemetryError) -> CycleOutcome {
        match self.failures.record_failure() {
            FailureVerdict::Retry { failures } => {
                warn!("telemetry {stage} failed (attempt {failures}): {err}");
                self.stats.record_failure(failures);
                CycleOutcome::Completed
            }
            FailureVerdict::Escalate { failures } => {
                error!("telemetry {stage} failed {failures} times in a row: {err}");
                self.stats.record_failure(failures);
                CycleOutcome::Escalate(Escalation::TelemetryFailures { failures })
            }
        }
    }
}

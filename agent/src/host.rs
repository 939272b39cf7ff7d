use std::{
    fs::{File, OpenOptions},
    io::{ErrorKind, Read, Seek, SeekFrom, Write},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Outgoing, QoS};
use sha2::{Digest, Sha256};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    net::{TcpListener, TcpStream},
};
use tracing::{debug, error, info, warn};

use fota_common::{
    availability_topic,
    config::NetworkConfig,
    flash::{check_erase_alignment, check_range, ERASED_BYTE},
    status_topic, supervise, Agent, AgentStatus, BlockDevice, BootError, BootRecord,
    BootStateStore, BootStatus, ConnectivityGate, DeviceRestart, Escalation, FlashBootStore,
    FlashError, LinkState, LoopStats, PollOutcome, RuntimeConfig, SensorError, SensorHub,
    SensorId, SensorSource, SensorValue, StatusPayload, TelemetryClient, TelemetryError,
    TransportLock, UpdateClient, UpdateError, UpdateManifest,
};

const HOST_FLASH_CAPACITY: u32 = 0x0010_0000;
const HOST_FLASH_ERASE_SIZE: u32 = 0x1000;
const MANIFEST_FILE: &str = "update.json";
const THERMAL_ZONE_PATH: &str = "/sys/class/thermal/thermal_zone0/temp";
const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(30);
const MQTT_ACK_TIMEOUT: Duration = Duration::from_secs(5);
const LINK_MONITOR: &str = "link-monitor";
const LINK_CHECK_TIMEOUT: Duration = Duration::from_secs(2);
// Exit status asking the process supervisor to start the agent again.
const RESTART_EXIT_CODE: i32 = 75;

#[derive(Clone)]
struct AppState {
    boot: BootRecord,
    link: LinkState,
    transport: TransportLock,
    update: Arc<LoopStats>,
    telemetry: Arc<LoopStats>,
}

#[derive(Clone)]
struct AppStore {
    data_dir: Arc<PathBuf>,
    runtime_path: Arc<PathBuf>,
    flash_path: Arc<PathBuf>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime, |name| std::env::var(name).ok());
    runtime.sanitize();

    let flash = FileFlash::open(&store.flash_path, HOST_FLASH_CAPACITY, HOST_FLASH_ERASE_SIZE)
        .with_context(|| format!("failed to open flash image {}", store.flash_path.display()))?;
    let mut boot_store =
        FlashBootStore::new(flash, runtime.flash).context("invalid flash layout")?;
    emulate_bootloader_swap(&mut boot_store).context("bootloader swap failed")?;

    let link = LinkState::new(false);
    let agent = Agent::new(runtime.agent.clone(), link.clone());
    let boot = agent
        .startup(&mut boot_store)
        .context("boot state validation failed")?;
    info!(
        "running generation {} ({})",
        boot.current_generation,
        boot.status.as_str()
    );

    spawn_link_monitor(link.clone(), agent.transport().clone(), &runtime.network);

    let hub = SensorHub::new(runtime.sensors.hub_max_age());
    if let Some(source) = std::env::var_os("FOTA_HUB_DEV") {
        spawn_hub_reader(hub.clone(), PathBuf::from(source));
    }
    let sensors = HostSensors {
        thermal_zone: PathBuf::from(THERMAL_ZONE_PATH),
        hub,
    };

    let drop_dir = store.data_dir.join(&runtime.update.drop_dir);
    info!("watching {} for update manifests", drop_dir.display());
    let update = agent.update_service(DirectoryUpdateBackend::new(drop_dir, boot_store));
    let telemetry = agent.telemetry_service(MqttTelemetry::new(&runtime.network), sensors);

    let app_state = AppState {
        boot,
        link,
        transport: agent.transport().clone(),
        update: update.stats(),
        telemetry: telemetry.stats(),
    };
    let port = std::env::var("FOTA_STATUS_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    spawn_status_server(app_state, port).await?;

    let escalation = supervise(update, telemetry, &ProcessRestart).await;
    Err(anyhow!("agent stopped: {escalation}"))
}

fn apply_env_overrides<F>(runtime: &mut RuntimeConfig, var: F)
where
    F: Fn(&str) -> Option<String>,
{
    let parsed = |name: &str| var(name).and_then(|value| value.trim().parse::<u64>().ok());

    if let Some(device_id) = var("FOTA_DEVICE_ID") {
        runtime.network.device_id = device_id;
    }
    if let Some(host) = var("MQTT_HOST") {
        runtime.network.mqtt_host = host;
    }
    if let Some(port) = var("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        runtime.network.mqtt_port = port;
    }
    if let Some(user) = var("MQTT_USER") {
        runtime.network.mqtt_user = user;
    }
    if let Some(pass) = var("MQTT_PASS") {
        runtime.network.mqtt_pass = pass;
    }
    if let Some(dir) = var("FOTA_UPDATE_DIR") {
        runtime.update.drop_dir = dir;
    }
    if let Some(secs) = parsed("FOTA_POLL_SECS") {
        runtime.agent.poll_interval_seconds = secs;
    }
    if let Some(secs) = parsed("FOTA_PUBLISH_SECS") {
        runtime.agent.publish_interval_seconds = secs;
    }
    if let Some(max) = parsed("FOTA_MAX_FAILURES") {
        runtime.agent.max_consecutive_failures = u32::try_from(max).unwrap_or(u32::MAX);
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("FOTA_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.fota"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            flash_path: Arc::new(data_dir.join("flash.img")),
            data_dir: Arc::new(data_dir),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

struct FileFlash {
    file: File,
    capacity: u32,
    erase_size: u32,
}

impl FileFlash {
    fn open(path: &Path, capacity: u32, erase_size: u32) -> Result<Self, FlashError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        // A new or short image reads as blank flash.
        let len = file.metadata()?.len();
        if len < u64::from(capacity) {
            file.seek(SeekFrom::Start(len))?;
            let fill = vec![ERASED_BYTE; (u64::from(capacity) - len) as usize];
            file.write_all(&fill)?;
            file.sync_data()?;
        }

        Ok(Self {
            file,
            capacity,
            erase_size,
        })
    }
}

impl BlockDevice for FileFlash {
    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn erase_size(&self) -> u32 {
        self.erase_size
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        check_range(self.capacity, offset, buf.len())?;
        self.file.seek(SeekFrom::Start(u64::from(offset)))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        check_range(self.capacity, offset, data.len())?;
        let mut current = vec![0_u8; data.len()];
        self.read(offset, &mut current)?;
        for (cell, byte) in current.iter_mut().zip(data) {
            *cell &= *byte;
        }
        self.file.seek(SeekFrom::Start(u64::from(offset)))?;
        self.file.write_all(&current)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn erase(&mut self, offset: u32, len: u32) -> Result<(), FlashError> {
        check_range(self.capacity, offset, len as usize)?;
        check_erase_alignment(self.erase_size, offset, len)?;
        let blank = vec![ERASED_BYTE; self.erase_size as usize];
        self.file.seek(SeekFrom::Start(u64::from(offset)))?;
        for _ in 0..len / self.erase_size {
            self.file.write_all(&blank)?;
        }
        self.file.sync_data()?;
        Ok(())
    }
}

fn emulate_bootloader_swap<D: BlockDevice>(
    store: &mut FlashBootStore<D>,
) -> Result<(), BootError> {
    let record = store.read()?;
    let Some(generation) = record.pending() else {
        return Ok(());
    };
    if record.status != BootStatus::Ongoing {
        return Ok(());
    }

    let active = store.active_bank();
    let alternate = store.alternate_bank();
    let device = store.device_mut();
    let mut chunk = vec![0_u8; device.erase_size() as usize];

    device.erase(active.offset, active.size)?;
    let len = active.size.min(alternate.size);
    let mut copied = 0_u32;
    while copied < len {
        let step = chunk.len().min((len - copied) as usize);
        device.read(alternate.offset + copied, &mut chunk[..step])?;
        device.write(active.offset + copied, &chunk[..step])?;
        copied += step as u32;
    }

    info!("bootloader: swapped generation {generation} into the active bank");
    Ok(())
}

struct DirectoryUpdateBackend<D> {
    drop_dir: PathBuf,
    store: FlashBootStore<D>,
}

impl<D: BlockDevice> DirectoryUpdateBackend<D> {
    fn new(drop_dir: PathBuf, store: FlashBootStore<D>) -> Self {
        Self { drop_dir, store }
    }

    fn write_alternate_bank(&mut self, image: &[u8]) -> Result<(), UpdateError> {
        let bank = self.store.alternate_bank();
        if image.is_empty() {
            return Err(UpdateError::Image("image is empty".into()));
        }
        if image.len() > bank.size as usize {
            return Err(UpdateError::Image(format!(
                "image of {} bytes does not fit the {:#x}-byte bank",
                image.len(),
                bank.size
            )));
        }

        let device = self.store.device_mut();
        device.erase(bank.offset, bank.size)?;
        device.write(bank.offset, image)?;
        Ok(())
    }
}

#[async_trait]
impl<D: BlockDevice + Send> UpdateClient for DirectoryUpdateBackend<D> {
    async fn poll_and_apply(&mut self) -> Result<PollOutcome, UpdateError> {
        match tokio::fs::metadata(&self.drop_dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(UpdateError::Unreachable(format!(
                    "{} is not a directory",
                    self.drop_dir.display()
                )))
            }
            Err(err) => {
                return Err(UpdateError::Unreachable(format!(
                    "{}: {err}",
                    self.drop_dir.display()
                )))
            }
        }

        let raw = match tokio::fs::read(self.drop_dir.join(MANIFEST_FILE)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(PollOutcome::NoUpdate),
            Err(err) => return Err(UpdateError::Unreachable(err.to_string())),
        };
        let manifest = UpdateManifest::parse(&raw)?;

        let record = self.store.read()?;
        if !manifest.is_newer_than(&record) {
            debug!("manifest generation {} already known", manifest.generation);
            return Ok(PollOutcome::NoUpdate);
        }

        let image_path = self.drop_dir.join(&manifest.image);
        let image = tokio::fs::read(&image_path)
            .await
            .map_err(|err| UpdateError::Image(format!("{}: {err}", image_path.display())))?;
        manifest.check_digest(&Sha256::digest(&image))?;

        self.write_alternate_bank(&image)?;
        self.store.stage_update(manifest.generation)?;
        info!(
            "generation {} written to the alternate bank ({} bytes)",
            manifest.generation,
            image.len()
        );
        Ok(PollOutcome::Staged {
            generation: manifest.generation,
        })
    }
}

struct MqttTelemetry {
    options: MqttOptions,
    status_topic: String,
    availability_topic: String,
    ack_timeout: Duration,
}

// The event loop is only polled from inside `init`, `publish` and
// `teardown`, so every socket read and write happens while the caller holds
// the transport.
struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl MqttTelemetry {
    fn new(network: &NetworkConfig) -> Self {
        let availability_topic = availability_topic(&network.device_id);

        let mut options = MqttOptions::new(
            network.device_id.clone(),
            network.mqtt_host.clone(),
            network.mqtt_port,
        );
        options.set_keep_alive(MQTT_KEEP_ALIVE);
        options.set_last_will(LastWill::new(
            availability_topic.clone(),
            "offline",
            QoS::AtLeastOnce,
            true,
        ));
        if !network.mqtt_user.is_empty() {
            options.set_credentials(network.mqtt_user.clone(), network.mqtt_pass.clone());
        }

        Self {
            options,
            status_topic: status_topic(&network.device_id),
            availability_topic,
            ack_timeout: MQTT_ACK_TIMEOUT,
        }
    }
}

impl MqttSession {
    // Drives the connection until the broker acknowledges the publish that
    // was just queued.
    async fn wait_for_puback(&mut self, limit: Duration) -> Result<(), String> {
        let delivery = tokio::time::timeout(limit, async {
            let mut sent = None;
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => sent = Some(pkid),
                    Ok(Event::Incoming(Incoming::PubAck(ack))) if Some(ack.pkid) == sent => {
                        return Ok(())
                    }
                    Ok(_) => {}
                    Err(err) => return Err(err.to_string()),
                }
            }
        })
        .await;
        delivery.unwrap_or_else(|_| Err(format!("no PUBACK within {limit:?}")))
    }
}

#[async_trait]
impl TelemetryClient for MqttTelemetry {
    type Session = MqttSession;

    async fn init(&mut self) -> Result<MqttSession, TelemetryError> {
        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), 8);

        let handshake = tokio::time::timeout(MQTT_CONNECT_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(err) => return Err(err),
                }
            }
        })
        .await;
        match handshake {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(TelemetryError::Connect(err.to_string())),
            Err(_) => {
                return Err(TelemetryError::Connect(format!(
                    "no CONNACK within {MQTT_CONNECT_TIMEOUT:?}"
                )))
            }
        }

        let mut session = MqttSession { client, eventloop };
        session
            .client
            .publish(&self.availability_topic, QoS::AtLeastOnce, true, "online")
            .await
            .map_err(|err| TelemetryError::Connect(err.to_string()))?;
        session
            .wait_for_puback(self.ack_timeout)
            .await
            .map_err(TelemetryError::Connect)?;

        Ok(session)
    }

    async fn publish(
        &mut self,
        session: &mut MqttSession,
        payload: &StatusPayload,
    ) -> Result<(), TelemetryError> {
        let body = payload.to_json()?;
        session
            .client
            .publish(&self.status_topic, QoS::AtLeastOnce, false, body)
            .await
            .map_err(|err| TelemetryError::Publish(err.to_string()))?;
        session
            .wait_for_puback(self.ack_timeout)
            .await
            .map_err(TelemetryError::Publish)
    }

    async fn teardown(&mut self, mut session: MqttSession) -> Result<(), TelemetryError> {
        session
            .client
            .disconnect()
            .await
            .map_err(|err| TelemetryError::Publish(err.to_string()))?;
        let _ = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match session.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        Ok(())
    }
}

// The link check connects to the broker, so it takes the transport like the
// service loops do.
fn spawn_link_monitor(link: LinkState, transport: TransportLock, network: &NetworkConfig) {
    let host = network.mqtt_host.clone();
    let port = network.mqtt_port;
    let every = Duration::from_secs(network.link_check_interval_seconds);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let _transport = transport.acquire(LINK_MONITOR).await;
            let reachable =
                tokio::time::timeout(LINK_CHECK_TIMEOUT, TcpStream::connect((host.as_str(), port)))
                    .await;
            link.set(matches!(reachable, Ok(Ok(_))));
        }
    });
}

struct HostSensors {
    thermal_zone: PathBuf,
    hub: SensorHub,
}

impl SensorSource for HostSensors {
    fn read(&mut self, id: SensorId) -> Result<Option<SensorValue>, SensorError> {
        match id {
            SensorId::McuTemp => read_thermal_zone(&self.thermal_zone),
            SensorId::OffchipTemp => self.hub.read(id),
        }
    }
}

fn read_thermal_zone(path: &Path) -> Result<Option<SensorValue>, SensorError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(SensorError::Fetch(format!("{}: {err}", path.display()))),
    };
    let milli = raw
        .trim()
        .parse::<i64>()
        .map_err(|err| SensorError::Channel(format!("bad thermal zone value {raw:?}: {err}")))?;
    Ok(Some(SensorValue::from_milli(milli)))
}

fn spawn_hub_reader(hub: SensorHub, source: PathBuf) {
    tokio::spawn(async move {
        let input: Box<dyn AsyncRead + Unpin + Send> = if source.as_os_str() == "-" {
            Box::new(tokio::io::stdin())
        } else {
            match tokio::fs::File::open(&source).await {
                Ok(file) => Box::new(file),
                Err(err) => {
                    warn!("failed to open sensor hub {}: {err}", source.display());
                    return;
                }
            }
        };

        let mut lines = BufReader::new(input).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let _ = hub.feed_line(&line);
                }
                Ok(None) => {
                    info!("sensor hub input closed");
                    break;
                }
                Err(err) => {
                    warn!("sensor hub read error: {err}");
                    break;
                }
            }
        }
    });
}

struct ProcessRestart;

impl DeviceRestart for ProcessRestart {
    fn restart_device(&self, reason: &Escalation) {
        error!("restarting agent: {reason}");
        std::process::exit(RESTART_EXIT_CODE);
    }
}

async fn spawn_status_server(app_state: AppState, port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status server at {addr}"))?;

    info!("status endpoint on http://{addr}/api/status");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!("status server stopped: {err}");
        }
    });
    Ok(())
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(AgentStatus {
        boot: state.boot,
        link_up: state.link.is_link_up(),
        transport_holder: state.transport.holder(),
        update: state.update.snapshot(),
        telemetry: state.telemetry.snapshot(),
    })
}

use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::Read,
    mqtt::client::{EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::BLOCK,
    gpio::AnyIOPin,
    uart::{config::Config as UartConfig, UartDriver},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    mqtt::client::{EspMqttClient, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    ota::EspOta,
    sys::EspError,
    wifi::{BlockingWifi, EspWifi},
};
use log::{error, info, warn};
use sha2::{Digest, Sha256};

use fota_common::{
    availability_topic, config::NetworkConfig, status_topic, supervise, Agent, BootError,
    BootRecord, BootStateStore, BootStatus, DeviceRestart, Escalation, FlashError, LinkState,
    PollOutcome, RuntimeConfig, SensorError, SensorHub, SensorId, SensorSource, SensorValue,
    StatusPayload, TelemetryClient, TelemetryError, UpdateClient, UpdateError, UpdateManifest,
};

const NVS_NAMESPACE: &str = "fota";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_BOOT_KEY: &str = "boot_record";

const HUB_BAUD: u32 = 115_200;
const MAX_HUB_LINE: usize = 64;
const MAX_MANIFEST_BYTES: usize = 4096;
const HTTP_CHUNK_SIZE: usize = 4096;
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MQTT_ACK_TIMEOUT: Duration = Duration::from_secs(5);
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime);
    runtime.sanitize();

    let link = LinkState::new(false);
    let agent = Agent::new(runtime.agent.clone(), link.clone());
    let mut boot_store = NvsBootStore {
        partition: nvs_partition.clone(),
    };
    let boot = agent
        .startup(&mut boot_store)
        .context("boot state validation failed")?;
    info!(
        "running generation {} ({})",
        boot.current_generation,
        boot.status.as_str()
    );

    let Peripherals {
        modem, pins, uart1, ..
    } = Peripherals::take()?;

    let _wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;
    disable_wifi_power_save();
    spawn_link_monitor(
        link,
        Duration::from_secs(runtime.network.link_check_interval_seconds),
    )?;

    let hub = SensorHub::new(runtime.sensors.hub_max_age());
    let uart = UartDriver::new(
        uart1,
        pins.gpio17,
        pins.gpio16,
        Option::<AnyIOPin>::None,
        Option::<AnyIOPin>::None,
        &UartConfig::new().baudrate(Hertz(HUB_BAUD)),
    )
    .context("failed to open sensor hub uart")?;
    spawn_hub_reader(hub.clone(), uart)?;

    let update = agent.update_service(HttpUpdateBackend {
        manifest_url: runtime.update.manifest_url.clone(),
        store: boot_store,
    });
    let telemetry = agent.telemetry_service(EspTelemetry::new(&runtime.network), EspSensors { hub });

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("failed to build async runtime")?;
    let escalation = rt.block_on(supervise(update, telemetry, &EspRestart));
    Err(anyhow!("agent stopped: {escalation}"))
}

struct NvsBootStore {
    partition: EspDefaultNvsPartition,
}

impl NvsBootStore {
    fn nvs(&self) -> Result<EspNvs<NvsDefault>, BootError> {
        EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true).map_err(store_error)
    }

    fn stage_update(&mut self, generation: u32) -> Result<BootRecord, BootError> {
        let mut record = self.read()?;
        record.pending_generation = generation;
        record.status = BootStatus::Ongoing;
        self.commit(&record)?;
        info!("staged generation {generation} for validation on next boot");
        Ok(record)
    }
}

impl BootStateStore for NvsBootStore {
    fn read(&mut self) -> Result<BootRecord, BootError> {
        let nvs = self.nvs()?;
        let mut buffer = [0_u8; 256];
        match nvs.get_str(NVS_BOOT_KEY, &mut buffer).map_err(store_error)? {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|err| BootError::Store(format!("corrupt boot record: {err}"))),
            None => Ok(BootRecord::default()),
        }
    }

    fn commit(&mut self, record: &BootRecord) -> Result<(), BootError> {
        let payload = serde_json::to_string(record)
            .map_err(|err| BootError::Store(format!("encoding boot record: {err}")))?;
        self.nvs()?
            .set_str(NVS_BOOT_KEY, &payload)
            .map_err(store_error)?;

        if record.status == BootStatus::Normal {
            EspOta::new()
                .and_then(|mut ota| ota.mark_running_slot_valid())
                .map_err(store_error)?;
        }
        Ok(())
    }

    fn erase_alternate_bank(&mut self) -> Result<(), BootError> {
        let mut ota = EspOta::new().map_err(store_error)?;
        // Beginning an update of unknown size erases the whole update slot.
        let update = ota.initiate_update().map_err(store_error)?;
        update.abort().map_err(store_error)?;
        Ok(())
    }
}

fn store_error(err: EspError) -> BootError {
    BootError::Store(err.to_string())
}

struct HttpUpdateBackend {
    manifest_url: String,
    store: NvsBootStore,
}

#[async_trait]
impl UpdateClient for HttpUpdateBackend {
    async fn poll_and_apply(&mut self) -> Result<PollOutcome, UpdateError> {
        if self.manifest_url.is_empty() {
            return Ok(PollOutcome::NoUpdate);
        }

        let mut raw = Vec::new();
        http_get(&self.manifest_url, |chunk| {
            if raw.len() + chunk.len() > MAX_MANIFEST_BYTES {
                return Err(UpdateError::Protocol("manifest too large".into()));
            }
            raw.extend_from_slice(chunk);
            Ok(())
        })?;
        let manifest = UpdateManifest::parse(&raw)?;

        if !manifest.is_newer_than(&self.store.read()?) {
            return Ok(PollOutcome::NoUpdate);
        }

        info!(
            "downloading generation {} from {}",
            manifest.generation, manifest.image
        );
        let written = download_image(&manifest)?;
        self.store.stage_update(manifest.generation)?;
        info!(
            "generation {} written to the update slot ({written} bytes)",
            manifest.generation
        );
        Ok(PollOutcome::Staged {
            generation: manifest.generation,
        })
    }
}

fn download_image(manifest: &UpdateManifest) -> Result<u64, UpdateError> {
    let mut ota = EspOta::new().map_err(ota_error)?;
    let mut update = ota.initiate_update().map_err(ota_error)?;
    let mut hasher = Sha256::new();

    let written = match http_get(&manifest.image, |chunk| {
        update.write(chunk).map_err(ota_error)?;
        hasher.update(chunk);
        Ok(())
    }) {
        Ok(written) => written,
        Err(err) => {
            let _ = update.abort();
            return Err(err);
        }
    };

    if written == 0 {
        let _ = update.abort();
        return Err(UpdateError::Image("image download is empty".into()));
    }
    if let Err(err) = manifest.check_digest(&hasher.finalize()) {
        let _ = update.abort();
        return Err(err);
    }

    update.complete().map_err(ota_error)?;
    Ok(written)
}

fn http_get<F>(url: &str, mut on_chunk: F) -> Result<u64, UpdateError>
where
    F: FnMut(&[u8]) -> Result<(), UpdateError>,
{
    let http_conf = HttpClientConfiguration {
        timeout: Some(HTTP_TIMEOUT),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let connection = EspHttpConnection::new(&http_conf).map_err(transport_error)?;
    let mut client = HttpClient::wrap(connection);
    let request = client
        .request(Method::Get, url, &[])
        .map_err(transport_error)?;
    let mut response = request.submit().map_err(transport_error)?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(UpdateError::Protocol(format!("GET {url} returned HTTP {status}")));
    }

    let mut chunk = [0_u8; HTTP_CHUNK_SIZE];
    let mut total = 0_u64;
    loop {
        let read = response.read(&mut chunk).map_err(transport_error)?;
        if read == 0 {
            break;
        }
        on_chunk(&chunk[..read])?;
        total = total.saturating_add(read as u64);
    }
    Ok(total)
}

fn transport_error<E: core::fmt::Debug>(err: E) -> UpdateError {
    UpdateError::Unreachable(format!("{err:?}"))
}

fn ota_error(err: EspError) -> UpdateError {
    UpdateError::Flash(FlashError::Device(format!("ota: {err}")))
}

struct EspTelemetry {
    url: String,
    client_id: String,
    user: String,
    pass: String,
    status_topic: String,
    availability_topic: String,
}

#[derive(Default)]
struct SessionFlags {
    connected: AtomicBool,
    closed: AtomicBool,
    acked: AtomicU32,
}

impl SessionFlags {
    // The esp-mqtt task owns the socket; holding the transport until the
    // broker's acknowledgement arrives keeps the exchange inside the cycle.
    async fn wait_acked(&self, id: u32, limit: Duration) -> Result<(), String> {
        let deadline = tokio::time::Instant::now() + limit;
        while self.acked.load(Ordering::Acquire) != id {
            if self.closed.load(Ordering::Acquire) {
                return Err("session closed".into());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(format!("no PUBACK within {limit:?}"));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }
}

struct EspSession {
    client: EspMqttClient<'static>,
    flags: Arc<SessionFlags>,
}

impl EspTelemetry {
    fn new(network: &NetworkConfig) -> Self {
        Self {
            url: format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port),
            client_id: network.device_id.clone(),
            user: network.mqtt_user.clone(),
            pass: network.mqtt_pass.clone(),
            status_topic: status_topic(&network.device_id),
            availability_topic: availability_topic(&network.device_id),
        }
    }
}

#[async_trait]
impl TelemetryClient for EspTelemetry {
    type Session = EspSession;

    async fn init(&mut self) -> Result<EspSession, TelemetryError> {
        let (mut client, mut connection) = {
            let conf = MqttClientConfiguration {
                client_id: Some(self.client_id.as_str()),
                username: (!self.user.is_empty()).then_some(self.user.as_str()),
                password: (!self.pass.is_empty()).then_some(self.pass.as_str()),
                ..Default::default()
            };
            EspMqttClient::new(&self.url, &conf)
                .map_err(|err| TelemetryError::Connect(err.to_string()))?
        };

        let flags = Arc::new(SessionFlags::default());
        let events = flags.clone();
        thread::Builder::new()
            .name("mqtt-session".to_string())
            .stack_size(6144)
            .spawn(move || loop {
                match connection.next() {
                    Ok(event) => match event.payload() {
                        EventPayload::Connected(_) => {
                            events.connected.store(true, Ordering::Release)
                        }
                        EventPayload::Disconnected => events.closed.store(true, Ordering::Release),
                        EventPayload::Published(id) => events.acked.store(id, Ordering::Release),
                        _ => {}
                    },
                    // The client was dropped.
                    Err(_) => {
                        events.closed.store(true, Ordering::Release);
                        break;
                    }
                }
            })
            .map_err(|err| TelemetryError::Connect(err.to_string()))?;

        let deadline = tokio::time::Instant::now() + MQTT_CONNECT_TIMEOUT;
        while !flags.connected.load(Ordering::Acquire) {
            if flags.closed.load(Ordering::Acquire) || tokio::time::Instant::now() >= deadline {
                return Err(TelemetryError::Connect(
                    "broker did not accept the connection".into(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let id = client
            .publish(&self.availability_topic, QoS::AtLeastOnce, true, b"online")
            .map_err(|err| TelemetryError::Connect(err.to_string()))?;
        flags
            .wait_acked(id, MQTT_ACK_TIMEOUT)
            .await
            .map_err(TelemetryError::Connect)?;

        Ok(EspSession { client, flags })
    }

    async fn publish(
        &mut self,
        session: &mut EspSession,
        payload: &StatusPayload,
    ) -> Result<(), TelemetryError> {
        if session.flags.closed.load(Ordering::Acquire) {
            return Err(TelemetryError::SessionClosed);
        }
        let body = payload.to_json()?;
        let id = session
            .client
            .publish(&self.status_topic, QoS::AtLeastOnce, false, body.as_bytes())
            .map_err(|err| TelemetryError::Publish(err.to_string()))?;
        session
            .flags
            .wait_acked(id, MQTT_ACK_TIMEOUT)
            .await
            .map_err(TelemetryError::Publish)
    }

    async fn teardown(&mut self, session: EspSession) -> Result<(), TelemetryError> {
        // Dropping the client closes the connection and ends the event thread.
        drop(session);
        Ok(())
    }
}

// No supported on-die temperature sensor on the classic ESP32.
struct EspSensors {
    hub: SensorHub,
}

impl SensorSource for EspSensors {
    fn read(&mut self, id: SensorId) -> Result<Option<SensorValue>, SensorError> {
        match id {
            SensorId::McuTemp => Ok(None),
            SensorId::OffchipTemp => self.hub.read(id),
        }
    }
}

fn spawn_hub_reader(hub: SensorHub, uart: UartDriver<'static>) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("sensor-hub".to_string())
        .stack_size(4096)
        .spawn(move || {
            let mut line = Vec::with_capacity(MAX_HUB_LINE);
            let mut byte = [0_u8; 1];
            loop {
                match uart.read(&mut byte, BLOCK) {
                    Ok(1) => match byte[0] {
                        b'\n' => {
                            if let Ok(text) = std::str::from_utf8(&line) {
                                let _ = hub.feed_line(text);
                            }
                            line.clear();
                        }
                        other if line.len() < MAX_HUB_LINE => line.push(other),
                        // Overlong line: drop it and resync on the next newline.
                        _ => line.clear(),
                    },
                    Ok(_) => {}
                    Err(err) => {
                        warn!("sensor hub uart error: {err:?}");
                        thread::sleep(Duration::from_secs(1));
                    }
                }
            }
        })?;
    Ok(())
}

fn spawn_link_monitor(link: LinkState, every: Duration) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("link-monitor".to_string())
        .stack_size(4096)
        .spawn(move || loop {
            let connected = is_wifi_station_connected();
            link.set(connected);
            if !connected {
                let rc = unsafe { esp_idf_svc::sys::esp_wifi_connect() };
                if rc != esp_idf_svc::sys::ESP_OK {
                    warn!("wifi reconnect request failed: esp_err_t={rc}");
                }
            }
            thread::sleep(every);
        })?;
    Ok(())
}

struct EspRestart;

impl DeviceRestart for EspRestart {
    fn restart_device(&self, reason: &Escalation) {
        error!("restarting device: {reason}");
        thread::sleep(Duration::from_millis(100));
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        runtime.network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or_default().to_string();
    }

    if runtime.network.wifi_pass.is_empty() {
        runtime.network.wifi_pass = option_env!("WIFI_PASS").unwrap_or_default().to_string();
    }
}

// A failed join is not fatal; the link monitor keeps retrying.
fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if network.wifi_ssid.trim().is_empty() {
        return Err(anyhow!("wifi ssid is not configured"));
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                if attempt < WIFI_CONNECT_ATTEMPTS {
                    let _ = wifi.disconnect();
                    thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
                }
            }
        }
    }

    drop(wifi);
    Ok(esp_wifi)
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

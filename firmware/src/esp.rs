use core::ffi::c_void;
use std::{
    ffi::CStr,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{delay::FreeRtos, modem::Modem, prelude::Peripherals};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    http::{
        client::{Configuration as HttpClientConfiguration, EspHttpConnection},
        server::{Configuration as HttpConfiguration, EspHttpServer, Request},
    },
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::EspOta,
    wifi::{BlockingWifi, EspWifi},
};
use esp_idf_sys::{
    esp_ota_abort, esp_ota_begin, esp_ota_end, esp_ota_get_next_update_partition,
    esp_ota_handle_t, esp_ota_set_boot_partition, esp_ota_write, esp_partition_t, EspError,
    ESP_ERR_OTA_VALIDATE_FAILED, ESP_OK,
};
use log::{debug, info, warn};
use serde::Serialize;

use hard_status_common::{
    BlockStorage, ClientUrl, ConfigUpdate, ConnectionError, Credential, Device, DeviceAction,
    DeviceSettings, FirmwareSlots, Indicator, OtaError, SlotError, StorageError,
    UpdateDescriptor, WifiRadio,
};

use crate::api::{self, PollReport, StatusResponse};

const NVS_NAMESPACE: &str = "hard-status";
const NVS_CONFIG_KEY: &str = "config";
const MAX_NVS_BLOB: usize = 4096;

const TICK_INTERVAL_MS: u32 = 100;
const MAX_HTTP_BODY: usize = 4096;
const OTA_CHUNK_SIZE: usize = 4096;
const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const RESTART_DELAY: Duration = Duration::from_millis(500);
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const WORKER_STACK_SIZE: usize = 16 * 1024;

type EspDevice = Device<NvsStorage, EspRadio, EspSlots>;
type SharedDevice = Arc<Mutex<EspDevice>>;
type HttpRequest<'a, 'b> = Request<&'a mut esp_idf_svc::http::server::EspHttpConnection<'b>>;

#[derive(Clone)]
struct Runtime {
    device: SharedDevice,
    last_poll: Arc<Mutex<Option<PollReport>>>,
}

impl Runtime {
    fn device(&self) -> MutexGuard<'_, EspDevice> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_poll(&self, report: PollReport) {
        *self.last_poll.lock().unwrap_or_else(PoisonError::into_inner) = Some(report);
    }

    fn last_poll(&self) -> Option<PollReport> {
        self.last_poll
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Config block in a single NVS blob. NVS commits a blob as a whole.
struct NvsStorage {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

fn nvs_error(context: &str, err: EspError) -> StorageError {
    StorageError::Io(format!("{context}: {err}"))
}

impl BlockStorage for NvsStorage {
    fn read_block(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| nvs_error("failed to open nvs namespace", err))?;
        let mut buffer = vec![0_u8; MAX_NVS_BLOB];

        let block = nvs
            .get_blob(NVS_CONFIG_KEY, &mut buffer)
            .map_err(|err| nvs_error("failed to read config blob", err))?;
        Ok(block.map(<[u8]>::to_vec))
    }

    fn write_block(&mut self, block: &[u8]) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| nvs_error("failed to open nvs namespace", err))?;
        nvs.set_blob(NVS_CONFIG_KEY, block)
            .map_err(|err| nvs_error("failed to write config blob", err))
    }
}

/// Station and hotspot on one radio. Both stay configured while the hotspot is
/// up so connection retries keep running during onboarding.
struct EspRadio {
    wifi: BlockingWifi<EspWifi<'static>>,
    station: Option<ClientConfiguration>,
    hotspot: Option<AccessPointConfiguration>,
}

fn radio_error(err: EspError) -> ConnectionError {
    ConnectionError::Radio(err.to_string())
}

fn auth_method(password: &str) -> AuthMethod {
    if password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    }
}

impl EspRadio {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
    ) -> anyhow::Result<Self> {
        let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))
            .context("failed to create wifi driver")?;
        let wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;
        Ok(Self {
            wifi,
            station: None,
            hotspot: None,
        })
    }

    fn apply(&mut self) -> Result<(), EspError> {
        let configuration = match (&self.station, &self.hotspot) {
            (Some(station), Some(hotspot)) => Configuration::Mixed(station.clone(), hotspot.clone()),
            (Some(station), None) => Configuration::Client(station.clone()),
            (None, Some(hotspot)) => Configuration::AccessPoint(hotspot.clone()),
            (None, None) => Configuration::None,
        };
        self.wifi.set_configuration(&configuration)?;
        if !self.wifi.is_started()? {
            self.wifi.start()?;
        }
        Ok(())
    }
}

impl WifiRadio for EspRadio {
    fn connect(&mut self, credential: &Credential, timeout_ms: u32) -> Result<(), ConnectionError> {
        let ssid = credential.login.as_str();
        let password = credential.password.as_str();
        self.station = Some(ClientConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| ConnectionError::Radio(format!("ssid `{ssid}` too long")))?,
            password: password
                .try_into()
                .map_err(|_| ConnectionError::Radio("wifi password too long".to_string()))?,
            auth_method: auth_method(password),
            ..Default::default()
        });
        self.apply().map_err(radio_error)?;

        self.wifi.wifi_mut().connect().map_err(radio_error)?;
        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
        while !self.wifi.is_connected().unwrap_or(false) {
            if Instant::now() >= deadline {
                let _ = self.wifi.wifi_mut().disconnect();
                return Err(ConnectionError::Timeout(timeout_ms));
            }
            feed_watchdog();
            FreeRtos::delay_ms(TICK_INTERVAL_MS);
        }

        self.wifi.wait_netif_up().map_err(radio_error)?;
        info!("wifi connected to `{ssid}`");
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Err(err) = self.wifi.wifi_mut().disconnect() {
            debug!("wifi disconnect: {err}");
        }
        self.station = None;
    }

    fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }

    fn start_hotspot(&mut self, credential: &Credential) -> Result<(), ConnectionError> {
        let ssid = credential.login.as_str();
        let password = credential.password.as_str();
        self.hotspot = Some(AccessPointConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| ConnectionError::Radio(format!("hotspot ssid `{ssid}` too long")))?,
            password: password
                .try_into()
                .map_err(|_| ConnectionError::Radio("hotspot password too long".to_string()))?,
            auth_method: auth_method(password),
            channel: 1,
            ..Default::default()
        });
        self.apply().map_err(radio_error)?;
        info!("hotspot `{ssid}` started");
        Ok(())
    }

    fn stop_hotspot(&mut self) {
        if self.hotspot.take().is_none() {
            return;
        }
        match self.apply() {
            Ok(()) => info!("hotspot stopped"),
            Err(err) => warn!("failed to stop hotspot: {err}"),
        }
    }
}

/// OTA partitions through the raw `esp_ota_*` calls. The update partition is
/// looked up on every use so no partition pointer is held across threads.
#[derive(Default)]
struct EspSlots {
    handle: Option<esp_ota_handle_t>,
}

enum SlotQuery {
    Running,
    Boot,
}

fn ota_slot_label(query: SlotQuery) -> String {
    let label = EspOta::new().ok().and_then(|ota| {
        let slot = match query {
            SlotQuery::Running => ota.get_running_slot().ok()?,
            SlotQuery::Boot => ota.get_boot_slot().ok()?,
        };
        Some(slot.label.as_str().to_string())
    });
    label.unwrap_or_else(|| "unknown".to_string())
}

fn next_update_partition() -> Result<*const esp_partition_t, SlotError> {
    let partition = unsafe { esp_ota_get_next_update_partition(core::ptr::null()) };
    if partition.is_null() {
        return Err(SlotError("no ota update partition".to_string()));
    }
    Ok(partition)
}

fn partition_label(partition: *const esp_partition_t) -> String {
    let label = unsafe { CStr::from_ptr((*partition).label.as_ptr()) };
    label.to_string_lossy().into_owned()
}

impl FirmwareSlots for EspSlots {
    fn running_slot(&self) -> String {
        ota_slot_label(SlotQuery::Running)
    }

    fn boot_slot(&self) -> String {
        ota_slot_label(SlotQuery::Boot)
    }

    fn capacity(&self) -> usize {
        next_update_partition()
            .map(|partition| unsafe { (*partition).size } as usize)
            .unwrap_or(0)
    }

    fn begin(&mut self, len: usize) -> Result<(), SlotError> {
        self.abort();
        let partition = next_update_partition()?;
        let mut handle = esp_ota_handle_t::default();
        let rc = unsafe { esp_ota_begin(partition, len as _, &mut handle) };
        if rc != ESP_OK {
            return Err(SlotError(format!("esp_ota_begin failed with code {rc}")));
        }
        info!("writing {len} bytes to `{}`", partition_label(partition));
        self.handle = Some(handle);
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), SlotError> {
        let handle = self
            .handle
            .ok_or_else(|| SlotError("no update in progress".to_string()))?;
        let rc = unsafe { esp_ota_write(handle, chunk.as_ptr() as *const c_void, chunk.len() as _) };
        if rc != ESP_OK {
            return Err(SlotError(format!("esp_ota_write failed with code {rc}")));
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), SlotError> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| SlotError("no update in progress".to_string()))?;
        let rc = unsafe { esp_ota_end(handle) };
        if rc == ESP_ERR_OTA_VALIDATE_FAILED as i32 {
            return Err(SlotError("image failed validation".to_string()));
        }
        if rc != ESP_OK {
            return Err(SlotError(format!("esp_ota_end failed with code {rc}")));
        }

        let partition = next_update_partition()?;
        let rc = unsafe { esp_ota_set_boot_partition(partition) };
        if rc != ESP_OK {
            return Err(SlotError(format!(
                "esp_ota_set_boot_partition failed with code {rc}"
            )));
        }
        info!("boot slot is now `{}`", partition_label(partition));
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            let rc = unsafe { esp_ota_abort(handle) };
            if rc != ESP_OK {
                warn!("esp_ota_abort failed with code {rc}");
            }
        }
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, .. } = Peripherals::take()?;

    let storage = NvsStorage {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };
    let radio = EspRadio::new(modem, sys_loop, nvs_partition).context("wifi startup failed")?;

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let device = Device::boot(
        storage,
        radio,
        EspSlots::default(),
        DeviceSettings::default(),
        monotonic_ms(),
    );
    let runtime = Runtime {
        device: Arc::new(Mutex::new(device)),
        last_poll: Arc::new(Mutex::new(None)),
    };

    // Keep the server alive for the program lifetime.
    let _server = create_http_server(runtime.clone())?;
    info!("web api started");

    let mut indicator = None;
    loop {
        feed_watchdog();

        let (actions, current) = {
            let mut device = runtime.device();
            let actions = device.tick(monotonic_ms());
            (actions, device.indicator())
        };

        if indicator != Some(current) {
            show_indicator(current);
            indicator = Some(current);
        }

        if !actions.is_empty() {
            execute_device_actions(&runtime, actions);
        }

        FreeRtos::delay_ms(TICK_INTERVAL_MS);
    }
}

// The LED strip renderer lives outside this crate; it reads the indicator from the log for now.
fn show_indicator(indicator: Indicator) {
    info!("indicator: {indicator:?}");
}

fn execute_device_actions(runtime: &Runtime, actions: Vec<DeviceAction>) {
    for action in actions {
        match action {
            DeviceAction::PollStatus { url } => {
                let runtime = runtime.clone();
                spawn_worker("status-poll", move || poll_status(&runtime, &url));
            }
            DeviceAction::CheckFirmware { url, auth } => {
                let worker = runtime.clone();
                let spawned = spawn_worker("firmware-check", move || {
                    check_firmware(&worker, &url, auth.as_deref())
                });
                if !spawned {
                    runtime
                        .device()
                        .firmware_check_failed("failed to spawn firmware check");
                }
            }
            DeviceAction::Restart => {
                spawn_worker("restart-request", || {
                    thread::sleep(RESTART_DELAY);
                    restart();
                });
            }
        }
    }
}

fn spawn_worker(name: &str, work: impl FnOnce() + Send + 'static) -> bool {
    let result = thread::Builder::new()
        .name(name.to_string())
        .stack_size(WORKER_STACK_SIZE)
        .spawn(work);
    if let Err(err) = result {
        warn!("failed to spawn {name} thread: {err}");
        return false;
    }
    true
}

fn restart() {
    info!("restarting");
    unsafe { esp_idf_svc::sys::esp_restart() };
}

fn http_client() -> anyhow::Result<HttpClient<EspHttpConnection>> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(HTTP_TIMEOUT),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    Ok(HttpClient::wrap(EspHttpConnection::new(&http_conf)?))
}

fn poll_status(runtime: &Runtime, url: &ClientUrl) {
    debug!("polling status api {url}");
    let report = match fetch_status(url) {
        Ok((status, bytes)) => {
            info!("status api answered {status} with {bytes} bytes");
            PollReport::success(status, bytes)
        }
        Err(err) => {
            warn!("status poll failed: {err:#}");
            PollReport::failure(format!("{err:#}"))
        }
    };
    runtime.record_poll(report);
}

fn fetch_status(url: &ClientUrl) -> anyhow::Result<(u16, usize)> {
    let mut client = http_client()?;
    let target = url.to_string();
    let request = client.request(Method::Get, &target, &[])?;
    let mut response = request.submit().map_err(|e| anyhow!("{e:?}"))?;
    let status = response.status();

    let mut bytes = 0_usize;
    let mut chunk = [0_u8; MAX_HTTP_BODY];
    loop {
        let read = response.read(&mut chunk).map_err(|e| anyhow!("{e:?}"))?;
        if read == 0 {
            break;
        }
        bytes = bytes.saturating_add(read);
    }
    Ok((status, bytes))
}

fn check_firmware(runtime: &Runtime, url: &ClientUrl, auth: Option<&str>) {
    match download_firmware(runtime, url, auth) {
        Ok(actions) if actions.contains(&DeviceAction::Restart) => {
            thread::sleep(RESTART_DELAY);
            restart();
        }
        Ok(_) => {}
        Err(err) => warn!("firmware update from {url} failed: {err:#}"),
    }
}

fn response_header<R: Headers>(response: &R, name: &str) -> Option<String> {
    response
        .header(name)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn download_firmware(
    runtime: &Runtime,
    url: &ClientUrl,
    auth: Option<&str>,
) -> anyhow::Result<Vec<DeviceAction>> {
    let running_version = runtime.device().firmware_version().to_string();
    let authorization = auth.map(|auth| format!("Basic {auth}"));

    let mut headers = vec![("x-firmware-version", running_version.as_str())];
    if let Some(authorization) = authorization.as_deref() {
        headers.push(("Authorization", authorization));
    }

    let target = url.to_string();
    let mut client = match http_client() {
        Ok(client) => client,
        Err(err) => {
            runtime.device().firmware_check_failed(&format!("{err:#}"));
            return Err(err.context("failed to create http client"));
        }
    };
    let submitted = client
        .request(Method::Get, &target, &headers)
        .map_err(|e| anyhow!("{e:?}"))
        .and_then(|request| request.submit().map_err(|e| anyhow!("{e:?}")));
    let mut response = match submitted {
        Ok(response) => response,
        Err(err) => {
            runtime.device().firmware_check_failed(&format!("{err:#}"));
            return Err(err.context("firmware check request failed"));
        }
    };

    let descriptor = UpdateDescriptor {
        status: response.status(),
        content_length: response_header(&response, "content-length")
            .and_then(|value| value.parse::<u64>().ok()),
        version: response_header(&response, "x-firmware-version"),
        sha256: response_header(&response, "x-firmware-sha256"),
    };

    match runtime.device().begin_firmware_update(descriptor) {
        Ok(()) => {}
        Err(OtaError::NoUpdate(reason)) => {
            debug!("firmware is current: {reason}");
            return Ok(Vec::new());
        }
        Err(err) => return Err(err.into()),
    }

    let mut chunk = vec![0_u8; OTA_CHUNK_SIZE];
    loop {
        let read = match response.read(&mut chunk) {
            Ok(read) => read,
            Err(err) => {
                let reason = format!("{err:?}");
                runtime.device().abort_firmware_update(&reason);
                return Err(anyhow!("firmware download interrupted: {reason}"));
            }
        };
        if read == 0 {
            break;
        }
        runtime.device().write_firmware_chunk(&chunk[..read])?;
    }

    let actions = runtime.device().complete_firmware_update()?;
    Ok(actions)
}

fn create_http_server(runtime: Runtime) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let runtime = runtime.clone();
        server.fn_handler::<anyhow::Error, _>("/api/status", Method::Get, move |req| {
            if !authorized(&runtime, &req) {
                return write_unauthorized(req);
            }
            let device = runtime.device().status(monotonic_ms());
            let last_poll = runtime.last_poll();
            write_json(req, 200, &StatusResponse { device, last_poll })
        })?;
    }

    {
        let runtime = runtime.clone();
        server.fn_handler::<anyhow::Error, _>("/api/config", Method::Get, move |req| {
            if !authorized(&runtime, &req) {
                return write_unauthorized(req);
            }
            let view = runtime.device().config_view();
            write_json(req, 200, &view)
        })?;
    }

    {
        let runtime = runtime.clone();
        server.fn_handler::<anyhow::Error, _>("/api/config", Method::Put, move |mut req| {
            if !authorized(&runtime, &req) {
                return write_unauthorized(req);
            }
            let body = match read_request_body(&mut req) {
                Ok(body) => body,
                Err(err) => return write_error(req, 413, &err.to_string()),
            };
            let update: ConfigUpdate = match serde_json::from_slice(&body) {
                Ok(update) => update,
                Err(err) => return write_error(req, 400, &format!("invalid config payload: {err}")),
            };

            let result = runtime.device().update_config(update, monotonic_ms());
            match result {
                Ok(outcome) => write_json(req, 200, &outcome),
                Err(err) => {
                    warn!("config update refused: {err}");
                    write_error(req, api::update_error_status(&err), &err.to_string())
                }
            }
        })?;
    }

    {
        let runtime = runtime.clone();
        server.fn_handler::<anyhow::Error, _>("/api/reset", Method::Post, move |req| {
            if !authorized(&runtime, &req) {
                return write_unauthorized(req);
            }
            let result = runtime.device().factory_reset(monotonic_ms());
            match result {
                Ok(outcome) => write_json(req, 200, &outcome),
                Err(err) => write_error(req, api::update_error_status(&err), &err.to_string()),
            }
        })?;
    }

    {
        let runtime = runtime.clone();
        server.fn_handler::<anyhow::Error, _>("/api/ota/status", Method::Get, move |req| {
            if !authorized(&runtime, &req) {
                return write_unauthorized(req);
            }
            let status = runtime.device().ota_status();
            write_json(req, 200, &status)
        })?;
    }

    {
        let runtime = runtime.clone();
        server.fn_handler::<anyhow::Error, _>("/api/ota/check", Method::Post, move |req| {
            if !authorized(&runtime, &req) {
                return write_unauthorized(req);
            }
            let result = runtime.device().request_firmware_check(monotonic_ms());
            match result {
                Ok(actions) => {
                    execute_device_actions(&runtime, actions);
                    let status = runtime.device().ota_status();
                    write_json(req, 202, &status)
                }
                Err(err) => write_error(req, api::update_error_status(&err), &err.to_string()),
            }
        })?;
    }

    {
        let runtime = runtime.clone();
        server.fn_handler::<anyhow::Error, _>("/api/ota/acknowledge", Method::Post, move |req| {
            if !authorized(&runtime, &req) {
                return write_unauthorized(req);
            }
            let result = {
                let mut device = runtime.device();
                device.acknowledge_ota_error().map(|()| device.ota_status())
            };
            match result {
                Ok(status) => write_json(req, 200, &status),
                Err(err) => write_error(req, api::ota_error_status(&err), &err.to_string()),
            }
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/restart", Method::Post, move |req| {
        if !authorized(&runtime, &req) {
            return write_unauthorized(req);
        }
        let result = runtime.device().request_restart();
        match result {
            Ok(actions) => {
                execute_device_actions(&runtime, actions);
                write_json(req, 202, &serde_json::json!({ "restarting": true }))
            }
            Err(err) => write_error(req, api::update_error_status(&err), &err.to_string()),
        }
    })?;

    Ok(server)
}

fn authorized(runtime: &Runtime, req: &HttpRequest<'_, '_>) -> bool {
    match api::parse_basic_auth(req.header("Authorization")) {
        Some((login, password)) => runtime.device().authorize(&login, &password),
        None => false,
    }
}

fn read_request_body(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body).map_err(|e| anyhow!("{e:?}"))?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: HttpRequest<'_, '_>,
    status_code: u16,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(req: HttpRequest<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
    let payload = api::ErrorBody {
        error: message.to_string(),
    };
    write_json(req, status_code, &payload)
}

fn write_unauthorized(req: HttpRequest<'_, '_>) -> anyhow::Result<()> {
    let payload = api::ErrorBody {
        error: "authentication required".to_string(),
    };
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        401,
        None,
        &[
            ("Content-Type", "application/json; charset=utf-8"),
            ("WWW-Authenticate", api::AUTH_CHALLENGE),
        ],
    )?
    .write_all(&body)?;
    Ok(())
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

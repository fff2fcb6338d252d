use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, WWW_AUTHENTICATE},
        HeaderValue, StatusCode,
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::{net::TcpListener, sync::Mutex};
use tracing::{debug, info, warn};

use hard_status_common::{
    BlockStorage, ClientUrl, ConfigUpdate, Device, DeviceAction, DeviceSettings, Indicator,
    MemorySlots, OtaError, SimulatedRadio, StorageError, UpdateDescriptor,
};

use crate::api::{self, ErrorBody, PollReport, StatusResponse};

const TICK_INTERVAL_MS: u64 = 250;
const HOST_SLOT_CAPACITY: usize = 0x1E_0000;
const HOST_RUNNING_IMAGE: &[u8] = b"hard-status host simulation image";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const RESTART_DELAY: Duration = Duration::from_millis(500);

type HostDevice = Device<FileStorage, SimulatedRadio, MemorySlots>;

#[derive(Clone)]
struct AppState {
    device: Arc<Mutex<HostDevice>>,
    last_poll: Arc<Mutex<Option<PollReport>>>,
    http: reqwest::Client,
}

/// The config block as a single file, replaced through a rename.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join("config.bin"),
        }
    }

    fn from_env() -> Self {
        let data_dir = std::env::var("HARD_STATUS_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.hard-status"));
        Self::new(data_dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn io_error(context: &str, err: std::io::Error) -> StorageError {
    StorageError::Io(format!("{context}: {err}"))
}

impl BlockStorage for FileStorage {
    fn read_block(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        match std::fs::read(&self.path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error("read", err)),
        }
    }

    fn write_block(&mut self, block: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| io_error("create data dir", err))?;
        }
        let staging = self.path.with_extension("bin.tmp");
        std::fs::write(&staging, block).map_err(|err| io_error("write", err))?;
        std::fs::rename(&staging, &self.path).map_err(|err| io_error("rename", err))
    }
}

/// `HARD_STATUS_SIM_NETWORKS="ssid:password,ssid2:password2"`
fn parse_sim_networks(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let (ssid, password) = entry.split_once(':').unwrap_or((entry, ""));
            Some((ssid.trim().to_string(), password.to_string()))
        })
        .collect()
}

fn simulated_radio() -> SimulatedRadio {
    let networks = std::env::var("HARD_STATUS_SIM_NETWORKS")
        .map(|raw| parse_sim_networks(&raw))
        .unwrap_or_default();
    if networks.is_empty() {
        warn!("HARD_STATUS_SIM_NETWORKS is empty; the device will stay in onboarding");
    }
    SimulatedRadio::new(
        networks
            .iter()
            .map(|(ssid, password)| (ssid.as_str(), password.as_str())),
    )
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let storage = FileStorage::from_env();
    info!("config block at {}", storage.path().display());

    let device = Device::boot(
        storage,
        simulated_radio(),
        MemorySlots::new(HOST_RUNNING_IMAGE, HOST_SLOT_CAPACITY),
        DeviceSettings {
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
            ..DeviceSettings::default()
        },
        monotonic_ms(),
    );

    let http = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .context("failed to build http client")?;

    let app_state = AppState {
        device: Arc::new(Mutex::new(device)),
        last_poll: Arc::new(Mutex::new(None)),
        http,
    };

    spawn_tick_loop(app_state.clone());

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/config", get(handle_get_config).put(handle_put_config))
        .route("/api/reset", post(handle_post_reset))
        .route("/api/ota/status", get(handle_get_ota_status))
        .route("/api/ota/check", post(handle_post_ota_check))
        .route("/api/ota/acknowledge", post(handle_post_ota_acknowledge))
        .route("/api/restart", post(handle_post_restart))
        .route_layer(middleware::from_fn_with_state(
            app_state.clone(),
            require_basic_auth,
        ))
        .with_state(app_state);

    let port = std::env::var("HARD_STATUS_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web server at {addr}"))?;

    info!("web api listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

fn spawn_tick_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));
        let mut indicator = None;

        loop {
            interval.tick().await;
            let now_ms = monotonic_ms();

            let (actions, current) = {
                let mut device = app_state.device.lock().await;
                let actions = device.tick(now_ms);
                (actions, device.indicator())
            };

            if indicator != Some(current) {
                show_indicator(current);
                indicator = Some(current);
            }

            if !actions.is_empty() {
                execute_device_actions(&app_state, actions);
            }
        }
    });
}

// The LED renderer is not part of the host build; the indicator is logged instead.
fn show_indicator(indicator: Indicator) {
    info!("indicator: {indicator:?}");
}

fn execute_device_actions(app_state: &AppState, actions: Vec<DeviceAction>) {
    for action in actions {
        match action {
            DeviceAction::PollStatus { url } => {
                tokio::spawn(poll_status(app_state.clone(), url));
            }
            DeviceAction::CheckFirmware { url, auth } => {
                tokio::spawn(check_firmware(app_state.clone(), url, auth));
            }
            DeviceAction::Restart => {
                tokio::spawn(async {
                    tokio::time::sleep(RESTART_DELAY).await;
                    restart();
                });
            }
        }
    }
}

fn restart() -> ! {
    info!("restart requested; exiting so the supervisor starts a fresh process");
    std::process::exit(0)
}

async fn poll_status(app_state: AppState, url: ClientUrl) {
    debug!("polling status api {url}");
    let report = match fetch_status(&app_state.http, &url).await {
        Ok((status, bytes)) => {
            info!("status api answered {status} with {bytes} bytes");
            PollReport::success(status, bytes)
        }
        Err(err) => {
            warn!("status poll failed: {err:#}");
            PollReport::failure(format!("{err:#}"))
        }
    };
    *app_state.last_poll.lock().await = Some(report);
}

async fn fetch_status(http: &reqwest::Client, url: &ClientUrl) -> anyhow::Result<(u16, usize)> {
    let response = http
        .get(url.to_string())
        .timeout(HTTP_TIMEOUT)
        .send()
        .await
        .context("request failed")?;
    let status = response.status().as_u16();
    let body = response.bytes().await.context("failed to read body")?;
    Ok((status, body.len()))
}

async fn check_firmware(app_state: AppState, url: ClientUrl, auth: Option<String>) {
    match download_firmware(&app_state, &url, auth.as_deref(), DOWNLOAD_IDLE_TIMEOUT).await {
        Ok(actions) if actions.contains(&DeviceAction::Restart) => {
            tokio::time::sleep(RESTART_DELAY).await;
            restart();
        }
        Ok(_) => {}
        Err(err) => warn!("firmware update from {url} failed: {err:#}"),
    }
}

fn header_string(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// `idle_timeout` bounds the wait for the response headers and for each body
/// chunk, not the whole transfer.
async fn download_firmware(
    app_state: &AppState,
    url: &ClientUrl,
    auth: Option<&str>,
    idle_timeout: Duration,
) -> anyhow::Result<Vec<DeviceAction>> {
    let running_version = app_state.device.lock().await.firmware_version().to_string();

    let mut request = app_state
        .http
        .get(url.to_string())
        .header("x-firmware-version", running_version);
    if let Some(auth) = auth {
        request = request.header(AUTHORIZATION, format!("Basic {auth}"));
    }

    let sent = match tokio::time::timeout(idle_timeout, request.send()).await {
        Ok(result) => result.map_err(anyhow::Error::from),
        Err(_) => Err(anyhow::anyhow!("no response within {idle_timeout:?}")),
    };
    let mut response = match sent {
        Ok(response) => response,
        Err(err) => {
            app_state
                .device
                .lock()
                .await
                .firmware_check_failed(&format!("{err:#}"));
            return Err(err.context("firmware check request failed"));
        }
    };

    let descriptor = UpdateDescriptor {
        status: response.status().as_u16(),
        content_length: response.content_length(),
        version: header_string(&response, "x-firmware-version"),
        sha256: header_string(&response, "x-firmware-sha256"),
    };

    match app_state
        .device
        .lock()
        .await
        .begin_firmware_update(descriptor)
    {
        Ok(()) => {}
        Err(OtaError::NoUpdate(reason)) => {
            debug!("firmware is current: {reason}");
            return Ok(Vec::new());
        }
        Err(err) => return Err(err.into()),
    }

    loop {
        let failure = match tokio::time::timeout(idle_timeout, response.chunk()).await {
            Ok(Ok(Some(chunk))) => {
                app_state
                    .device
                    .lock()
                    .await
                    .write_firmware_chunk(&chunk)?;
                continue;
            }
            Ok(Ok(None)) => break,
            Ok(Err(err)) => anyhow::Error::from(err),
            Err(_) => anyhow::anyhow!("no data for {idle_timeout:?}"),
        };
        app_state
            .device
            .lock()
            .await
            .abort_firmware_update(&format!("{failure:#}"));
        return Err(failure.context("firmware download interrupted"));
    }

    let actions = app_state
        .device
        .lock()
        .await
        .complete_firmware_update()?;
    Ok(actions)
}

async fn require_basic_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    let authorized = match api::parse_basic_auth(header) {
        Some((login, password)) => state.device.lock().await.authorize(&login, &password),
        None => false,
    };

    if !authorized {
        let mut response = error_response(StatusCode::UNAUTHORIZED, "authentication required");
        response.headers_mut().insert(
            WWW_AUTHENTICATE,
            HeaderValue::from_static(api::AUTH_CHALLENGE),
        );
        return response;
    }

    next.run(request).await
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let device = state.device.lock().await.status(monotonic_ms());
    let last_poll = state.last_poll.lock().await.clone();
    Json(StatusResponse { device, last_poll })
}

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.device.lock().await.config_view())
}

async fn handle_put_config(
    State(state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> impl IntoResponse {
    let result = state
        .device
        .lock()
        .await
        .update_config(update, monotonic_ms());

    match result {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => {
            warn!("config update refused: {err}");
            error_response(status_code(api::update_error_status(&err)), &err.to_string())
        }
    }
}

async fn handle_post_reset(State(state): State<AppState>) -> impl IntoResponse {
    let result = state.device.lock().await.factory_reset(monotonic_ms());

    match result {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => error_response(status_code(api::update_error_status(&err)), &err.to_string()),
    }
}

async fn handle_get_ota_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.device.lock().await.ota_status())
}

async fn handle_post_ota_check(State(state): State<AppState>) -> impl IntoResponse {
    let result = state
        .device
        .lock()
        .await
        .request_firmware_check(monotonic_ms());

    match result {
        Ok(actions) => {
            execute_device_actions(&state, actions);
            (
                StatusCode::ACCEPTED,
                Json(state.device.lock().await.ota_status()),
            )
                .into_response()
        }
        Err(err) => error_response(status_code(api::update_error_status(&err)), &err.to_string()),
    }
}

async fn handle_post_ota_acknowledge(State(state): State<AppState>) -> impl IntoResponse {
    let mut device = state.device.lock().await;
    match device.acknowledge_ota_error() {
        Ok(()) => Json(device.ota_status()).into_response(),
        Err(err) => error_response(status_code(api::ota_error_status(&err)), &err.to_string()),
    }
}

async fn handle_post_restart(State(state): State<AppState>) -> impl IntoResponse {
    let result = state.device.lock().await.request_restart();

    match result {
        Ok(actions) => {
            execute_device_actions(&state, actions);
            StatusCode::ACCEPTED.into_response()
        }
        Err(err) => error_response(status_code(api::update_error_status(&err)), &err.to_string()),
    }
}

fn status_code(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
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

#[cfg(test)]
mod tests {
    use super::*;
    use hard_status_common::config::{DEFAULT_WIFI0_PSK, DEFAULT_WIFI0_SSID};
    use hard_status_common::{layout, ConfigStore, DeviceConfig, FirmwareSlots, OtaState};

    #[test]
    fn file_storage_starts_empty_and_replaces_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path().join("nested"));

        assert_eq!(storage.read_block(), Ok(None));

        storage.write_block(b"first").unwrap();
        storage.write_block(b"second block").unwrap();

        assert_eq!(storage.read_block(), Ok(Some(b"second block".to_vec())));
        assert!(!storage.path().with_extension("bin.tmp").exists());
    }

    #[test]
    fn config_survives_a_restart_on_disk() {
        let dir = tempfile::tempdir().unwrap();

        let mut first = ConfigStore::new(FileStorage::new(dir.path()));
        let mut config = first.load();
        config.brightness = 11;
        first.save(&config).unwrap();

        let mut second = ConfigStore::new(FileStorage::new(dir.path()));
        assert_eq!(second.load(), config);

        std::fs::write(dir.path().join("config.bin"), b"garbage").unwrap();
        assert_eq!(second.load(), DeviceConfig::default());
        let raw = std::fs::read(dir.path().join("config.bin")).unwrap();
        assert_eq!(raw.len(), layout::RECORD_LEN);
    }

    /// Serves one firmware response, writing the body in `parts` with `gap` between them.
    fn serve_firmware(parts: &'static [&'static str], gap: Duration) -> String {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0_u8; 2048];
            let _ = stream.read(&mut request);

            let length: usize = parts.iter().map(|part| part.len()).sum();
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {length}\r\nx-firmware-version: 9.9.9\r\nconnection: close\r\n\r\n"
            );
            let _ = stream.write_all(head.as_bytes());
            for part in parts {
                let _ = stream.write_all(part.as_bytes());
                let _ = stream.flush();
                std::thread::sleep(gap);
            }
        });
        format!("http://{addr}/firmware.bin")
    }

    fn device_checking(url: &str) -> (AppState, MemorySlots, ClientUrl, Option<String>) {
        let dir = tempfile::tempdir().unwrap();
        let slots = MemorySlots::new(b"host image", 1024);
        let mut device = Device::boot(
            FileStorage::new(dir.path()),
            SimulatedRadio::new([(DEFAULT_WIFI0_SSID, DEFAULT_WIFI0_PSK)]),
            slots.clone(),
            DeviceSettings {
                firmware_version: "1.0.0".to_string(),
                ..DeviceSettings::default()
            },
            0,
        );
        device
            .update_config(
                ConfigUpdate {
                    ota_url: Some(url.to_string()),
                    ..Default::default()
                },
                0,
            )
            .unwrap();

        let actions = device.request_firmware_check(0).unwrap();
        let Some(DeviceAction::CheckFirmware { url, auth }) = actions.into_iter().next() else {
            panic!("expected a firmware check");
        };

        let state = AppState {
            device: Arc::new(Mutex::new(device)),
            last_poll: Arc::new(Mutex::new(None)),
            http: reqwest::Client::new(),
        };
        (state, slots, url, auth)
    }

    #[tokio::test]
    async fn slow_download_outlasting_idle_timeout_completes() {
        let url = serve_firmware(&["new-", "firm", "ware"], Duration::from_millis(150));
        let (state, slots, url, auth) = device_checking(&url);

        let actions = download_firmware(&state, &url, auth.as_deref(), Duration::from_millis(400))
            .await
            .unwrap();

        assert_eq!(actions, vec![DeviceAction::Restart]);
        assert_eq!(slots.region("ota_1"), Some(b"new-firmware".to_vec()));
    }

    #[tokio::test]
    async fn stalled_download_moves_to_error() {
        let url = serve_firmware(&["new-", "firmware"], Duration::from_millis(800));
        let (state, slots, url, auth) = device_checking(&url);

        let result = download_firmware(&state, &url, auth.as_deref(), Duration::from_millis(200)).await;

        assert!(result.is_err());
        assert_eq!(state.device.lock().await.ota_state(), OtaState::Error);
        assert_eq!(slots.boot_slot(), "ota_0");
    }

    #[test]
    fn parses_simulated_networks() {
        assert_eq!(
            parse_sim_networks("office:office-pass, guest , lab:a:b,"),
            vec![
                ("office".to_string(), "office-pass".to_string()),
                ("guest".to_string(), String::new()),
                ("lab".to_string(), "a:b".to_string()),
            ]
        );
        assert!(parse_sim_networks("").is_empty());
    }
}

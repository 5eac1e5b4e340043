use std::{
    convert::Infallible,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex as StdMutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::{net::TcpListener, sync::Mutex};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use monitor_common::{
    apply_led_command, ApiError, BodyReadError, ChipInfo, ConnectionOutcome, DeviceConfig, DeviceSnapshot,
    HttpConfig, LedCommandError, LedController, LedPin, LedState, MemoryInfo, RestartResponse, Restarter,
    TelemetrySource, WifiAction, WifiConfig, WifiConnectionManager, WifiEvent, WifiLinkInfo,
};

const INDEX_HTML: &str = include_str!("../web/index.html");
const SIM_LINK_LATENCY: Duration = Duration::from_millis(250);
const SIM_TOTAL_HEAP: u32 = 300_000;

#[derive(Clone)]
struct AppState {
    led: Arc<Mutex<LedController<SimulatedLedPin>>>,
    led_state: LedState,
    telemetry: Arc<dyn TelemetrySource + Send + Sync>,
    restarter: Arc<dyn Restarter>,
    http: HttpConfig,
}

struct SimulatedLedPin {
    pin: i32,
}

impl LedPin for SimulatedLedPin {
    type Error = Infallible;

    fn set_level(&mut self, high: bool) -> Result<(), Infallible> {
        info!("GPIO{} -> {}", self.pin, if high { "HIGH" } else { "LOW" });
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimulatedAccessPoint {
    AssignsIpAfter(u32),
    Unreachable,
}

struct SimulatedTelemetry {
    started: Instant,
    link: Arc<StdMutex<WifiLinkInfo>>,
    min_free_heap: AtomicU32,
}

struct ProcessRestarter;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = load_config();
    config.sanitize();
    let access_point = simulated_access_point();

    info!("ESP32 system monitor (host simulation)");

    let led = LedController::initialize(SimulatedLedPin {
        pin: config.led.pin,
    })
    .context("failed to initialize LED")?;

    let link = Arc::new(StdMutex::new(WifiLinkInfo::default()));
    let manager = WifiConnectionManager::new(config.wifi.max_retries);
    spawn_simulated_wifi(
        manager.clone(),
        access_point,
        config.wifi.ssid.clone(),
        link.clone(),
        SIM_LINK_LATENCY,
    );

    let timeout = Duration::from_millis(config.wifi.connect_timeout_ms);
    let waiter = manager.clone();
    let outcome = tokio::task::spawn_blocking(move || waiter.wait_settled(timeout))
        .await
        .context("wifi wait task failed")?;

    let state = AppState {
        led_state: led.state_cell(),
        led: Arc::new(Mutex::new(led)),
        telemetry: Arc::new(SimulatedTelemetry::new(link)),
        restarter: Arc::new(ProcessRestarter),
        http: config.http.clone(),
    };
    let app = start_server(outcome, &manager, &config.wifi, state);

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.http.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind monitor server at {addr}"))?;

    info!("monitor listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn load_config() -> DeviceConfig {
    let mut config = DeviceConfig::default();
    config.http.port = 8080;

    if let Ok(ssid) = std::env::var("WIFI_SSID") {
        config.wifi.ssid = ssid;
    }
    if let Ok(pass) = std::env::var("WIFI_PASS") {
        config.wifi.password = pass;
    }
    if let Some(retries) = env_parse::<u32>("WIFI_MAX_RETRIES") {
        config.wifi.max_retries = retries;
    }
    if let Some(timeout_ms) = env_parse::<u64>("WIFI_CONNECT_TIMEOUT_MS") {
        config.wifi.connect_timeout_ms = timeout_ms;
    }
    if let Some(port) = env_parse::<u16>("MONITOR_HTTP_PORT") {
        config.http.port = port;
    }

    config
}

fn simulated_access_point() -> SimulatedAccessPoint {
    match std::env::var("SIM_WIFI_DISCONNECTS") {
        Ok(value) if value.eq_ignore_ascii_case("never") => SimulatedAccessPoint::Unreachable,
        Ok(value) => SimulatedAccessPoint::AssignsIpAfter(value.parse().unwrap_or(0)),
        Err(_) => SimulatedAccessPoint::AssignsIpAfter(0),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

// Runs whatever the boot wait settled on; an unreachable network only warns.
fn start_server(
    outcome: ConnectionOutcome,
    manager: &WifiConnectionManager,
    wifi: &WifiConfig,
    state: AppState,
) -> Router {
    report_outcome(outcome, manager, wifi);
    build_router(state)
}

fn build_router(state: AppState) -> Router {
    let led_body_limit = DefaultBodyLimit::max(state.http.max_led_body_bytes);

    Router::new()
        .route("/", get(handle_index))
        .route("/api/data", get(handle_get_data))
        .route("/api/led", post(handle_post_led).layer(led_body_limit))
        .route("/api/restart", post(handle_post_restart))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn spawn_simulated_wifi(
    manager: WifiConnectionManager,
    access_point: SimulatedAccessPoint,
    ssid: String,
    link: Arc<StdMutex<WifiLinkInfo>>,
    latency: Duration,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut step = manager.handle_event(WifiEvent::StaStarted);
        info!("wifi: {}", step.transition);

        let mut disconnects = 0;
        while step.action == WifiAction::Connect {
            thread::sleep(latency);

            let event = match access_point {
                SimulatedAccessPoint::AssignsIpAfter(limit) if disconnects >= limit => {
                    *link.lock().unwrap_or_else(PoisonError::into_inner) = WifiLinkInfo {
                        ssid: ssid.clone(),
                        rssi: -52,
                        ip: Ipv4Addr::new(192, 168, 4, 2),
                        gateway: Ipv4Addr::new(192, 168, 4, 1),
                        netmask: Ipv4Addr::new(255, 255, 255, 0),
                    };
                    WifiEvent::GotIp
                }
                _ => {
                    disconnects += 1;
                    WifiEvent::Disconnected
                }
            };

            step = manager.handle_event(event);
            info!("wifi: {}", step.transition);
        }
    })
}

fn report_outcome(
    outcome: ConnectionOutcome,
    manager: &WifiConnectionManager,
    wifi: &WifiConfig,
) {
    debug!("wifi state after boot wait: {:?}", manager.state());
    match outcome {
        ConnectionOutcome::Connected => info!("connected to simulated AP `{}`", wifi.ssid),
        ConnectionOutcome::Failed => warn!(
            "failed to connect to `{}` after {} retries",
            wifi.ssid,
            manager.retry_count()
        ),
        ConnectionOutcome::TimedOut => warn!(
            "no connection to `{}` within {} ms",
            wifi.ssid, wifi.connect_timeout_ms
        ),
    }

    if !outcome.is_reachable() {
        warn!("starting HTTP server without network connectivity");
    }
}

async fn handle_index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn handle_get_data(State(state): State<AppState>) -> Json<DeviceSnapshot> {
    Json(DeviceSnapshot::capture(
        state.telemetry.as_ref(),
        &state.led_state,
    ))
}

async fn handle_post_led(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let limit = state.http.max_led_body_bytes;
    let result = match body {
        Ok(body) => {
            let mut led = state.led.lock().await;
            apply_led_command(&mut *led, &body, limit)
        }
        Err(rejection) => Err(body_rejection_error(&rejection, limit)),
    };

    match result {
        Ok(response) => {
            info!("LED {}", if response.led_state { "on" } else { "off" });
            Json(response).into_response()
        }
        Err(err) => {
            warn!("LED request rejected: {err}");
            error_response(&err)
        }
    }
}

async fn handle_post_restart(State(state): State<AppState>) -> Json<RestartResponse> {
    let delay = Duration::from_millis(state.http.restart_delay_ms);
    warn!("restart requested; exiting in {} ms", delay.as_millis());
    state.restarter.schedule_restart(delay);
    Json(RestartResponse::restarting())
}

fn body_rejection_error(rejection: &BytesRejection, limit: usize) -> ApiError {
    match rejection.status() {
        StatusCode::PAYLOAD_TOO_LARGE => LedCommandError::TooLarge { limit }.into(),
        StatusCode::REQUEST_TIMEOUT => BodyReadError::Timeout.into(),
        _ => BodyReadError::Io(rejection.body_text()).into(),
    }
}

fn error_response(err: &ApiError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.body())).into_response()
}

impl SimulatedTelemetry {
    fn new(link: Arc<StdMutex<WifiLinkInfo>>) -> Self {
        Self {
            started: Instant::now(),
            link,
            min_free_heap: AtomicU32::new(u32::MAX),
        }
    }
}

impl TelemetrySource for SimulatedTelemetry {
    fn chip_info(&self) -> ChipInfo {
        ChipInfo {
            model: "ESP32".to_string(),
            cores: 2,
            revision: 3,
            frequency: 240,
        }
    }

    fn wifi_info(&self) -> WifiLinkInfo {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn memory_info(&self) -> MemoryInfo {
        // Sawtooth between 300000 and ~292000 bytes over each minute.
        let seconds = self.started.elapsed().as_secs();
        let free_heap = SIM_TOTAL_HEAP - (seconds % 60) as u32 * 128;
        let previous_min = self.min_free_heap.fetch_min(free_heap, Ordering::Relaxed);

        MemoryInfo {
            free_heap,
            min_free_heap: previous_min.min(free_heap),
        }
    }

    fn uptime_us(&self) -> u64 {
        self.started
            .elapsed()
            .as_micros()
            .try_into()
            .unwrap_or(u64::MAX)
    }
}

impl Restarter for ProcessRestarter {
    fn schedule_restart(&self, delay: Duration) {
        thread::spawn(move || {
            thread::sleep(delay);
            warn!("simulated reboot: exiting process");
            std::process::exit(0);
        });
    }
}

use core::convert::TryInto;
use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyOutputPin, Output, PinDriver};
use esp_idf_svc::{
    eventloop::{EspSubscription, EspSystemEventLoop, System},
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    io::EspIOError,
    log::EspLogger,
    netif::IpEvent,
    nvs::EspDefaultNvsPartition,
    sys::{self, EspError},
    wifi::{EspWifi, WifiEvent as EspWifiEvent},
};
use log::{debug, error, info, warn};
use serde::Serialize;

use monitor_common::{
    api::{CONTENT_TYPE_HTML, CONTENT_TYPE_JSON},
    apply_led_command, read_body_limited, ApiError, BodyReadError, ChipInfo, ConnectionOutcome,
    DeviceConfig, DeviceSnapshot, HttpConfig, LedController, LedPin, LedState, MemoryInfo,
    RestartResponse, Restarter, TelemetrySource, WifiAction, WifiConfig, WifiConnectionManager,
    WifiEvent, WifiLinkInfo, WifiStep,
};

const INDEX_HTML: &str = include_str!("../web/index.html");
const HTTP_STACK_SIZE: usize = 10 * 1024;
const STA_IFKEY: &core::ffi::CStr = c"WIFI_STA_DEF";

type HttpRequest<'r, 'c> = Request<&'r mut EspHttpConnection<'c>>;

#[derive(Clone)]
struct SharedState {
    led: Arc<Mutex<LedController<EspLedPin>>>,
    led_state: LedState,
    telemetry: Arc<EspTelemetry>,
    restarter: Arc<EspRestarter>,
    http: HttpConfig,
}

struct EspLedPin {
    driver: PinDriver<'static, AnyOutputPin, Output>,
}

impl LedPin for EspLedPin {
    type Error = EspError;

    fn set_level(&mut self, high: bool) -> Result<(), EspError> {
        if high {
            self.driver.set_high()
        } else {
            self.driver.set_low()
        }
    }
}

struct WifiLink {
    wifi: EspWifi<'static>,
    _wifi_events: EspSubscription<'static, System>,
    _ip_events: EspSubscription<'static, System>,
}

struct EspTelemetry;

struct EspRestarter;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let mut config = load_config();
    config.sanitize();

    info!("===========================================");
    info!("  ESP32 system monitor");
    info!("===========================================");

    info!("initializing LED on GPIO{}", config.led.pin);
    let led = init_led(config.led.pin)?;
    let led_state = led.state_cell();

    // take() erases and re-initializes a full or outdated partition once.
    let nvs_partition = EspDefaultNvsPartition::take().context("failed to initialize NVS")?;
    let sys_loop = EspSystemEventLoop::take()?;
    let Peripherals { modem, .. } = Peripherals::take()?;

    if !config.wifi.has_credentials() {
        warn!("no WiFi SSID configured; set WIFI_SSID/WIFI_PASS at build time");
    }

    let manager = WifiConnectionManager::new(config.wifi.max_retries);
    let link = start_wifi(modem, sys_loop, nvs_partition, &config.wifi, &manager)
        .context("wifi startup failed")?;

    let timeout = Duration::from_millis(config.wifi.connect_timeout_ms);
    let outcome = manager.wait_settled(timeout);
    report_outcome(&link, &manager, outcome, &config.wifi);

    let state = SharedState {
        led: Arc::new(Mutex::new(led)),
        led_state,
        telemetry: Arc::new(EspTelemetry),
        restarter: Arc::new(EspRestarter),
        http: config.http.clone(),
    };

    let server = create_http_server(state).context("failed to start HTTP server")?;
    info!("HTTP server listening on port {}", config.http.port);

    // Keep services alive for the program lifetime.
    let _link = link;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(10));
    }
}

fn load_config() -> DeviceConfig {
    let mut config = DeviceConfig::default();

    if let Some(ssid) = option_env!("WIFI_SSID") {
        config.wifi.ssid = ssid.to_string();
    }

    if let Some(pass) = option_env!("WIFI_PASS") {
        config.wifi.password = pass.to_string();
    }

    config
}

fn init_led(pin: i32) -> anyhow::Result<LedController<EspLedPin>> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) }
        .with_context(|| format!("failed to configure GPIO{pin} as output"))?;
    sys::esp!(unsafe { sys::gpio_set_pull_mode(pin, sys::gpio_pull_mode_t_GPIO_FLOATING) })
        .with_context(|| format!("failed to disable pulls on GPIO{pin}"))?;

    LedController::initialize(EspLedPin { driver })
        .with_context(|| format!("failed to drive GPIO{pin} low"))
}

fn start_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    wifi_config: &WifiConfig,
    manager: &WifiConnectionManager,
) -> anyhow::Result<WifiLink> {
    let mut wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;

    let auth_method = if wifi_config.password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: wifi_config
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: wifi_config
            .password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    let wifi_events = {
        let manager = manager.clone();
        sys_loop.subscribe::<EspWifiEvent, _>(move |event| {
            let event = match event {
                EspWifiEvent::StaStarted => WifiEvent::StaStarted,
                EspWifiEvent::StaDisconnected(_) => WifiEvent::Disconnected,
                _ => return,
            };
            apply_wifi_step(manager.handle_event(event));
        })?
    };

    let ip_events = {
        let manager = manager.clone();
        sys_loop.subscribe::<IpEvent, _>(move |event| {
            if let IpEvent::DhcpIpAssigned(_) = event {
                apply_wifi_step(manager.handle_event(WifiEvent::GotIp));
            }
        })?
    };

    wifi.start()?;
    info!("wifi started, connecting to `{}`", wifi_config.ssid);

    Ok(WifiLink {
        wifi,
        _wifi_events: wifi_events,
        _ip_events: ip_events,
    })
}

fn apply_wifi_step(step: WifiStep) {
    info!("wifi: {}", step.transition);

    if step.action == WifiAction::Connect {
        if let Err(err) = sys::esp!(unsafe { sys::esp_wifi_connect() }) {
            warn!("esp_wifi_connect failed: {err}");
        }
    }
}

fn report_outcome(
    link: &WifiLink,
    manager: &WifiConnectionManager,
    outcome: ConnectionOutcome,
    wifi_config: &WifiConfig,
) {
    debug!("wifi state after boot wait: {:?}", manager.state());
    match outcome {
        ConnectionOutcome::Connected => {
            match link.wifi.sta_netif().get_ip_info() {
                Ok(ip_info) => info!(
                    "connected to `{}` with IP {} (gateway {})",
                    wifi_config.ssid, ip_info.ip, ip_info.subnet.gateway
                ),
                Err(err) => info!("connected to `{}`; IP unavailable: {err}", wifi_config.ssid),
            }
        }
        ConnectionOutcome::Failed => {
            warn!(
                "failed to connect to `{}` after {} retries",
                wifi_config.ssid,
                manager.retry_count()
            );
        }
        ConnectionOutcome::TimedOut => {
            warn!(
                "no connection to `{}` within {} ms",
                wifi_config.ssid, wifi_config.connect_timeout_ms
            );
        }
    }

    if !outcome.is_reachable() {
        warn!("starting HTTP server without network connectivity");
    }
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port: state.http.port,
        stack_size: HTTP_STACK_SIZE,
        lru_purge_enable: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_response(200, Some("OK"), &[("Content-Type", CONTENT_TYPE_HTML)])?
            .write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/data", Method::Get, move |req| {
            let snapshot = DeviceSnapshot::capture(state.telemetry.as_ref(), &state.led_state);
            let body = snapshot.to_json()?;
            req.into_response(200, Some("OK"), &[("Content-Type", CONTENT_TYPE_JSON)])?
                .write_all(&body)?;
            Ok(())
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/led", Method::Post, move |mut req| {
            let limit = state.http.max_led_body_bytes;
            let body = match read_request_body(&mut req, limit) {
                Ok(body) => body,
                Err(err) => {
                    warn!("LED request body unreadable: {err}");
                    return write_api_error(req, &ApiError::from(err));
                }
            };

            let result = {
                let mut led = lock(&state.led);
                apply_led_command(&mut *led, &body, limit)
            };
            match result {
                Ok(response) => {
                    info!("LED {}", if response.led_state { "on" } else { "off" });
                    write_json(req, &response)
                }
                Err(err) => {
                    warn!("LED request rejected: {err}");
                    write_api_error(req, &err)
                }
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/restart", Method::Post, move |req| {
            write_json(req, &RestartResponse::restarting())?;

            let delay = Duration::from_millis(state.http.restart_delay_ms);
            warn!("restart requested; rebooting in {} ms", delay.as_millis());
            state.restarter.schedule_restart(delay);
            Ok(())
        })?;
    }

    Ok(server)
}

fn read_request_body(req: &mut HttpRequest<'_, '_>, limit: usize) -> Result<Vec<u8>, BodyReadError> {
    if let Some(len) = req.content_len() {
        debug!("LED request declares {len} byte body");
    }

    read_body_limited(|buf| req.read(buf).map_err(classify_read_error), limit)
}

fn classify_read_error(err: EspIOError) -> BodyReadError {
    if err.0.code() == sys::HTTPD_SOCK_ERR_TIMEOUT as sys::esp_err_t {
        BodyReadError::Timeout
    } else {
        BodyReadError::Io(err.to_string())
    }
}

fn write_json<T: Serialize>(req: HttpRequest<'_, '_>, payload: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(200, Some("OK"), &[("Content-Type", CONTENT_TYPE_JSON)])?
        .write_all(&body)?;
    Ok(())
}

fn write_api_error(req: HttpRequest<'_, '_>, err: &ApiError) -> anyhow::Result<()> {
    let body = serde_json::to_vec(&err.body())?;
    req.into_response(err.status_code(), None, &[("Content-Type", CONTENT_TYPE_JSON)])?
        .write_all(&body)?;
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TelemetrySource for EspTelemetry {
    fn chip_info(&self) -> ChipInfo {
        let mut info = sys::esp_chip_info_t::default();
        unsafe { sys::esp_chip_info(&mut info) };
        let frequency = unsafe { sys::esp_rom_get_cpu_ticks_per_us() };

        ChipInfo {
            model: chip_model_name(info.model).to_string(),
            cores: info.cores,
            revision: info.revision,
            frequency,
        }
    }

    fn wifi_info(&self) -> WifiLinkInfo {
        let mut link = WifiLinkInfo::default();

        let mut ap_info = sys::wifi_ap_record_t::default();
        if unsafe { sys::esp_wifi_sta_get_ap_info(&mut ap_info) } == sys::ESP_OK {
            let ssid_len = ap_info
                .ssid
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(ap_info.ssid.len());
            link.ssid = String::from_utf8_lossy(&ap_info.ssid[..ssid_len]).into_owned();
            link.rssi = ap_info.rssi;
        }

        let netif = unsafe { sys::esp_netif_get_handle_from_ifkey(STA_IFKEY.as_ptr()) };
        if !netif.is_null() {
            let mut ip_info = sys::esp_netif_ip_info_t::default();
            if unsafe { sys::esp_netif_get_ip_info(netif, &mut ip_info) } == sys::ESP_OK {
                link.ip = ipv4_from_raw(ip_info.ip.addr);
                link.gateway = ipv4_from_raw(ip_info.gw.addr);
                link.netmask = ipv4_from_raw(ip_info.netmask.addr);
            }
        }

        link
    }

    fn memory_info(&self) -> MemoryInfo {
        MemoryInfo {
            free_heap: unsafe { sys::esp_get_free_heap_size() },
            min_free_heap: unsafe { sys::esp_get_minimum_free_heap_size() },
        }
    }

    fn uptime_us(&self) -> u64 {
        let now = unsafe { sys::esp_timer_get_time() };
        now.try_into().unwrap_or(0)
    }
}

fn chip_model_name(model: sys::esp_chip_model_t) -> &'static str {
    match model {
        sys::esp_chip_model_t_CHIP_ESP32S2 => "ESP32-S2",
        sys::esp_chip_model_t_CHIP_ESP32S3 => "ESP32-S3",
        sys::esp_chip_model_t_CHIP_ESP32C3 => "ESP32-C3",
        _ => "ESP32",
    }
}

// lwIP keeps addresses in network byte order.
fn ipv4_from_raw(addr: u32) -> Ipv4Addr {
    Ipv4Addr::from(addr.to_le_bytes())
}

impl Restarter for EspRestarter {
    fn schedule_restart(&self, delay: Duration) {
        let spawned = thread::Builder::new()
            .name("restart-request".into())
            .spawn(move || {
                thread::sleep(delay);
                unsafe { esp_idf_svc::sys::esp_restart() };
            });

        if let Err(err) = spawned {
            error!("failed to spawn restart thread ({err}); restarting now");
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
    }
}

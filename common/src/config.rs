use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_LED_PIN: i32 = 21;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WifiConfig {
    pub ssid: String,
    pub password: String,
    pub max_retries: u32,
    pub connect_timeout_ms: u64,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            connect_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LedConfig {
    pub pin: i32,
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            pin: DEFAULT_LED_PIN,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub max_led_body_bytes: usize,
    pub restart_delay_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 80,
            max_led_body_bytes: 100,
            restart_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    pub wifi: WifiConfig,
    pub led: LedConfig,
    pub http: HttpConfig,
}

impl WifiConfig {
    pub fn has_credentials(&self) -> bool {
        !self.ssid.trim().is_empty()
    }

    pub fn sanitize(&mut self) {
        self.max_retries = self.max_retries.min(20);
        self.connect_timeout_ms = self.connect_timeout_ms.clamp(1_000, 300_000);
    }
}

impl LedConfig {
    pub fn sanitize(&mut self) {
        if self.pin < 0 {
            self.pin = DEFAULT_LED_PIN;
        }
    }
}

impl HttpConfig {
    pub fn sanitize(&mut self) {
        if self.port == 0 {
            self.port = 80;
        }
        self.max_led_body_bytes = self.max_led_body_bytes.clamp(16, 4_096);
        self.restart_delay_ms = self.restart_delay_ms.min(10_000);
    }
}

impl DeviceConfig {
    pub fn sanitize(&mut self) {
        self.wifi.sanitize();
        self.led.sanitize();
        self.http.sanitize();
    }
}

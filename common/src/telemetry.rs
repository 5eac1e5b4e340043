use std::net::Ipv4Addr;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChipInfo {
    pub model: String,
    pub cores: u8,
    pub revision: u16,
    pub frequency: u32, // MHz
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WifiLinkInfo {
    pub ssid: String,
    pub rssi: i8,
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl Default for WifiLinkInfo {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            rssi: 0,
            ip: Ipv4Addr::UNSPECIFIED,
            gateway: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::UNSPECIFIED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub free_heap: u32,
    pub min_free_heap: u32,
}

pub trait TelemetrySource {
    fn chip_info(&self) -> ChipInfo;

    fn wifi_info(&self) -> WifiLinkInfo;

    fn memory_info(&self) -> MemoryInfo;

    fn uptime_us(&self) -> u64;

    // No sensor is wired up.
    fn temperature_c(&self) -> f32 {
        simulated_temperature(self.uptime_us())
    }
}

// Ramps from 45.0 to 55.0 inclusive over every ten seconds of uptime; f32
// rounding lands the last microsecond on 55.0 exactly.
pub fn simulated_temperature(uptime_us: u64) -> f32 {
    45.0 + (uptime_us % 10_000_000) as f32 / 1_000_000.0
}

pub fn format_uptime(seconds: u64) -> String {
    let hours = seconds / 3_600;
    let minutes = (seconds % 3_600) / 60;
    let secs = seconds % 60;
    format!("{hours:02}:{minutes:02}:{secs:02}")
}

use serde::{Serialize, Serializer};
use serde_json::value::RawValue;

use crate::{
    led::LedState,
    telemetry::{format_uptime, ChipInfo, TelemetrySource, WifiLinkInfo},
};

const BYTES_PER_MB: f32 = 1024.0 * 1024.0;

// Field order is the wire order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub chip: ChipInfo,
    #[serde(serialize_with = "two_decimals")]
    pub temperature: f32,
    pub wifi: WifiLinkInfo,
    pub memory: MemorySection,
    pub uptime: UptimeSection,
    pub led: LedSection,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemorySection {
    pub free_heap: u32,
    pub min_free_heap: u32,
    #[serde(serialize_with = "two_decimals")]
    pub free_heap_mb: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UptimeSection {
    pub seconds: u64,
    pub formatted: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedSection {
    pub state: bool,
}

impl DeviceSnapshot {
    pub fn capture<T: TelemetrySource + ?Sized>(source: &T, led: &LedState) -> Self {
        let uptime_us = source.uptime_us();
        let seconds = uptime_us / 1_000_000;
        let memory = source.memory_info();

        Self {
            chip: source.chip_info(),
            temperature: source.temperature_c(),
            wifi: source.wifi_info(),
            memory: MemorySection {
                free_heap: memory.free_heap,
                min_free_heap: memory.min_free_heap,
                free_heap_mb: memory.free_heap as f32 / BYTES_PER_MB,
            },
            uptime: UptimeSection {
                seconds,
                formatted: format_uptime(seconds),
            },
            led: LedSection { state: led.get() },
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

// Emits the number verbatim so `45.5` goes out as `45.50`.
fn two_decimals<S: Serializer>(value: &f32, serializer: S) -> Result<S::Ok, S::Error> {
    if !value.is_finite() {
        return serializer.serialize_none();
    }
    let raw = RawValue::from_string(format!("{value:.2}")).map_err(serde::ser::Error::custom)?;
    raw.serialize(serializer)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use pretty_assertions::assert_eq;
    use serde_json::Value;

    use super::*;
    use crate::{
        led::{testing::RecordingPin, LedController},
        telemetry::MemoryInfo,
    };

    struct FixedTelemetry {
        uptime_us: u64,
    }

    impl TelemetrySource for FixedTelemetry {
        fn chip_info(&self) -> ChipInfo {
            ChipInfo {
                model: "ESP32".to_string(),
                cores: 2,
                revision: 3,
                frequency: 240,
            }
        }

        fn wifi_info(&self) -> WifiLinkInfo {
            WifiLinkInfo {
                ssid: "workshop".to_string(),
                rssi: -61,
                ip: Ipv4Addr::new(192, 168, 1, 42),
                gateway: Ipv4Addr::new(192, 168, 1, 1),
                netmask: Ipv4Addr::new(255, 255, 255, 0),
            }
        }

        fn memory_info(&self) -> MemoryInfo {
            MemoryInfo {
                free_heap: 262_144,
                min_free_heap: 200_000,
            }
        }

        fn uptime_us(&self) -> u64 {
            self.uptime_us
        }
    }

    fn capture_json(source: &FixedTelemetry, led: &LedState) -> Value {
        let bytes = DeviceSnapshot::capture(source, led).to_json().unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn serializes_fixed_schema() {
        let led = LedController::initialize(RecordingPin::default()).unwrap();
        let source = FixedTelemetry {
            uptime_us: 3_661_500_000,
        };

        let snapshot = DeviceSnapshot::capture(&source, &led.state_cell());
        let json = String::from_utf8(snapshot.to_json().unwrap()).unwrap();

        assert_eq!(
            json,
            concat!(
                r#"{"chip":{"model":"ESP32","cores":2,"revision":3,"frequency":240},"#,
                r#""temperature":46.50,"#,
                r#""wifi":{"ssid":"workshop","rssi":-61,"ip":"192.168.1.42","#,
                r#""gateway":"192.168.1.1","netmask":"255.255.255.0"},"#,
                r#""memory":{"free_heap":262144,"min_free_heap":200000,"free_heap_mb":0.25},"#,
                r#""uptime":{"seconds":3661,"formatted":"01:01:01"},"#,
                r#""led":{"state":false}}"#
            )
        );
    }

    #[test]
    fn reports_current_led_state() {
        let mut led = LedController::initialize(RecordingPin::default()).unwrap();
        let source = FixedTelemetry { uptime_us: 0 };

        led.set_state(true).unwrap();
        let on = capture_json(&source, &led.state_cell());
        assert_eq!(on["led"]["state"], true);

        led.set_state(false).unwrap();
        let off = capture_json(&source, &led.state_cell());
        assert_eq!(off["led"]["state"], false);
    }

    #[test]
    fn floats_keep_two_decimals() {
        let led = LedState::default();
        let source = FixedTelemetry { uptime_us: 0 };

        let bytes = DeviceSnapshot::capture(&source, &led).to_json().unwrap();
        let json = String::from_utf8(bytes).unwrap();

        assert!(json.contains(r#""temperature":45.00"#));
        assert!(json.contains(r#""free_heap_mb":0.25"#));
    }
}

pub mod api;
pub mod config;
pub mod led;
pub mod snapshot;
pub mod telemetry;
pub mod wifi;

pub use api::{
    apply_led_command, decode_led_command, read_body_limited, ApiError, BodyReadError, ErrorBody,
    LedCommand, LedCommandError, LedResponse, Restarter, RestartResponse,
};
pub use config::{DeviceConfig, HttpConfig, LedConfig, WifiConfig};
pub use led::{LedController, LedPin, LedState};
pub use snapshot::DeviceSnapshot;
pub use telemetry::{
    format_uptime, simulated_temperature, ChipInfo, MemoryInfo, TelemetrySource, WifiLinkInfo,
};
pub use wifi::{
    ConnectionOutcome, ConnectionState, WifiAction, WifiConnectionManager, WifiEvent, WifiStep,
    WifiTransition,
};

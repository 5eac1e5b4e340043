use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::led::{LedController, LedPin};

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_HTML: &str = "text/html";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedCommand {
    pub state: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedResponse {
    pub status: &'static str,
    pub led_state: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RestartResponse {
    pub status: &'static str,
}

impl RestartResponse {
    pub const fn restarting() -> Self {
        Self {
            status: "restarting",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Error)]
pub enum LedCommandError {
    #[error("request body is empty")]
    Empty,
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("expected {{\"state\": true|false}}: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum BodyReadError {
    #[error("timed out reading request body")]
    Timeout,
    #[error("failed to read request body: {0}")]
    Io(String),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Body(#[from] BodyReadError),
    #[error(transparent)]
    Command(#[from] LedCommandError),
    #[error("failed to drive LED: {0}")]
    Led(String),
}

impl ApiError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Body(BodyReadError::Timeout) => 408,
            Self::Body(BodyReadError::Io(_)) => 500,
            Self::Command(LedCommandError::TooLarge { .. }) => 413,
            Self::Command(_) => 400,
            Self::Led(_) => 500,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.to_string(),
        }
    }
}

pub trait Restarter: Send + Sync {
    // Must return immediately.
    fn schedule_restart(&self, delay: Duration);
}

pub fn decode_led_command(body: &[u8], limit: usize) -> Result<LedCommand, LedCommandError> {
    if body.len() > limit {
        return Err(LedCommandError::TooLarge { limit });
    }
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(LedCommandError::Empty);
    }
    Ok(serde_json::from_slice(body)?)
}

pub fn apply_led_command<P: LedPin>(
    led: &mut LedController<P>,
    body: &[u8],
    limit: usize,
) -> Result<LedResponse, ApiError> {
    let command = decode_led_command(body, limit)?;
    led.set_state(command.state)
        .map_err(|err| ApiError::Led(err.to_string()))?;
    Ok(LedResponse {
        status: "ok",
        led_state: led.state(),
    })
}

// Reads at most limit + 1 bytes.
pub fn read_body_limited<F>(mut read: F, limit: usize) -> Result<Vec<u8>, BodyReadError>
where
    F: FnMut(&mut [u8]) -> Result<usize, BodyReadError>,
{
    let mut body = Vec::new();
    let mut chunk = [0_u8; 64];

    while body.len() <= limit {
        let want = chunk.len().min(limit + 1 - body.len());
        let read_len = read(&mut chunk[..want])?;
        if read_len == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read_len]);
    }

    Ok(body)
}

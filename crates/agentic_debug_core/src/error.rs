use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("{0}")]
    Precondition(String),

    #[error("Timeout waiting for {what} after {after:?}")]
    Timeout { what: String, after: Duration },

    #[error("No active debug session. Call debug_launch first.")]
    NoSession,

    #[error("No active session")]
    NotStarted,

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("DAP request '{command}' failed: {message}")]
    Transport { command: String, message: String },

    #[error("Debug adapter error: {0}")]
    Adapter(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            after,
        }
    }

    pub fn transport(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Stable machine-readable code surfaced to tool callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Precondition(_) => "PRECONDITION_FAILED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::NoSession | Self::NotStarted => "SESSION_NOT_STARTED",
            Self::InvalidParams(_) => "INVALID_PARAMS",
            Self::Transport { .. } | Self::Adapter(_) => "DAP_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "INVALID_PAYLOAD",
        }
    }

    pub fn to_payload(&self) -> Value {
        json!({
            "code": self.code(),
            "message": self.to_string(),
        })
    }
}

//! Outbound notifications about session progress and debug events.

use std::sync::Mutex;

use serde_json::Value;

use crate::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

pub trait NotificationSink: Send + Sync {
    fn progress(&self, token: &str, progress: u64, total: Option<u64>, message: Option<&str>);

    fn log(&self, level: LogLevel, message: &str, data: Option<&Value>);

    /// Called for every session state transition and lifecycle event.
    fn debug_event(&self, event: &str, details: &Value);
}

/// Writes notifications to `tracing` and keeps a one-line status summary.
#[derive(Debug, Default)]
pub struct TracingNotifier {
    status_line: Mutex<Option<String>>,
}

impl TracingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Short status text such as `Paused: breakpoint (thread 1)`; `None` when hidden.
    pub fn status_line(&self) -> Option<String> {
        lock(&self.status_line).clone()
    }
}

impl NotificationSink for TracingNotifier {
    fn progress(&self, token: &str, progress: u64, total: Option<u64>, message: Option<&str>) {
        tracing::info!(
            token,
            progress,
            total,
            "[progress] {}",
            message.unwrap_or_default()
        );
    }

    fn log(&self, level: LogLevel, message: &str, data: Option<&Value>) {
        match level {
            LogLevel::Debug => tracing::debug!(?data, "{message}"),
            LogLevel::Info => tracing::info!(?data, "{message}"),
            LogLevel::Warning => tracing::warn!(?data, "{message}"),
            LogLevel::Error => tracing::error!(?data, "{message}"),
        }
    }

    fn debug_event(&self, event: &str, details: &Value) {
        tracing::info!(event, %details, "debug event");

        let mut status = lock(&self.status_line);
        match event {
            "stopped" => {
                let reason = details.get("reason").and_then(Value::as_str).unwrap_or("unknown");
                let thread = details.get("threadId").and_then(Value::as_i64).unwrap_or(0);
                *status = Some(format!("Paused: {reason} (thread {thread})"));
            }
            "continued" => *status = Some("Running".to_string()),
            "terminated" => *status = None,
            _ => {}
        }
    }
}

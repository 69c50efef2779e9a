//! Normalized protocol envelopes shared by every backend.
//!
//! Both the host UI bridge and the headless adapter client present the same
//! `{seq, type, command|event, body, success}` shapes to their callers, so the
//! session state machine never needs to know which one it is talking to.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolRequest {
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl ProtocolRequest {
    pub fn new(seq: u64, command: impl Into<String>, arguments: Option<Value>) -> Self {
        Self {
            seq,
            kind: "request".to_string(),
            command: command.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolResponse {
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub request_seq: u64,
    pub command: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl ProtocolResponse {
    pub fn success(seq: u64, request_seq: u64, command: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            seq,
            kind: "response".to_string(),
            request_seq,
            command: command.into(),
            success: true,
            message: None,
            body,
        }
    }

    /// Body of the response, or `Value::Null` when the adapter sent none.
    pub fn body(&self) -> &Value {
        self.body.as_ref().unwrap_or(&Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolEvent {
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub event: String,
    #[serde(default)]
    pub body: Value,
}

impl ProtocolEvent {
    pub fn new(seq: u64, event: impl Into<String>, body: Value) -> Self {
        Self {
            seq,
            kind: "event".to_string(),
            event: event.into(),
            body,
        }
    }

    pub fn body_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    pub fn body_i64(&self, key: &str) -> Option<i64> {
        self.body.get(key).and_then(Value::as_i64)
    }

    pub fn body_bool(&self, key: &str) -> Option<bool> {
        self.body.get(key).and_then(Value::as_bool)
    }
}

/// Monotonic message sequence shared by requests, responses and events of one backend.
#[derive(Debug)]
pub struct SeqCounter(AtomicU64);

impl SeqCounter {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for SeqCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Capabilities reported by the synthetic `initialize` response.
pub fn bridge_capabilities() -> Value {
    json!({
        "supportsConfigurationDoneRequest": true,
        "supportsFunctionBreakpoints": true,
        "supportsConditionalBreakpoints": true,
        "supportsHitConditionalBreakpoints": true,
        "supportsEvaluateForHovers": true,
        "supportsSetVariable": true,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub id: i64,
    #[serde(default)]
    pub name: String,
}

/// Extracts `threads` from a `threads` response body; malformed entries are skipped.
pub fn threads_from_body(body: &Value) -> Vec<ThreadInfo> {
    body.get("threads")
        .and_then(Value::as_array)
        .map(|threads| {
            threads
                .iter()
                .filter_map(|t| serde_json::from_value(t.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

pub fn stack_frame_count(body: &Value) -> usize {
    body.get("stackFrames")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0)
}

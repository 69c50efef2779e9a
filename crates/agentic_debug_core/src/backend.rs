//! The operation set shared by every debug backend.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::{
    events::{EventHandler, EventRegistry, Subscription},
    protocol::{ProtocolEvent, ProtocolResponse},
    Result,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub alive: bool,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub session_id: Option<String>,
}

/// A protocol endpoint a [`crate::DebugSession`] can drive.
///
/// Implemented by [`crate::ProtocolBridge`] (the host's debug UI owns the adapter)
/// and [`crate::adapter::AdapterClient`] (the adapter runs headless).
#[async_trait]
pub trait DebugBackend: Send + Sync {
    async fn initialize(&self) -> Result<ProtocolResponse>;

    async fn launch(&self, args: Value) -> Result<ProtocolResponse>;

    async fn configuration_done(&self) -> Result<ProtocolResponse>;

    async fn send_request(&self, command: &str, args: Option<Value>) -> Result<ProtocolResponse>;

    async fn disconnect(&self) -> Result<()>;

    fn events(&self) -> &EventRegistry;

    fn is_alive(&self) -> bool;

    fn status(&self) -> BackendStatus;

    /// Last sequence number handed out.
    fn seq(&self) -> u64;

    fn on_event(&self, event: &str, handler: EventHandler) -> Subscription {
        self.events().on(event, handler)
    }

    fn on_any_event(&self, handler: EventHandler) -> Subscription {
        self.events().on_any(handler)
    }

    async fn wait_for_event(&self, event: &str, timeout: Duration) -> Result<ProtocolEvent> {
        self.events().wait_for(event, timeout).await
    }
}

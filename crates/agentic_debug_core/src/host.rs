//! The host's native debug API, seen through the narrow surface the bridge uses.
//!
//! A host runs debug sessions on its own terms: it starts them asynchronously,
//! reports start and termination through notifications, and only relays adapter
//! events it does not consume itself. Request/response traffic goes through
//! [`DebugHost::custom_request`].

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::Result;

/// Configuration key that tags sessions started by this bridge.
pub const AGENT_MARKER: &str = "__agentInitiated";

#[derive(Debug, Clone, PartialEq)]
pub struct HostSession {
    pub id: String,
    pub debug_type: String,
    pub name: String,
    pub configuration: Value,
}

impl HostSession {
    /// True for sessions of `debug_type` whose configuration carries [`AGENT_MARKER`].
    pub fn is_agent_initiated(&self, debug_type: &str) -> bool {
        self.debug_type == debug_type
            && self.configuration.get(AGENT_MARKER).and_then(Value::as_bool) == Some(true)
    }
}

#[derive(Debug, Clone)]
pub enum HostNotification {
    SessionStarted(HostSession),
    SessionTerminated(HostSession),
    CustomEvent {
        session: HostSession,
        event: String,
        body: Option<Value>,
    },
}

/// Workspace scope a session is started in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchScope {
    Workspace(PathBuf),
    Global,
}

#[async_trait]
pub trait DebugHost: Send + Sync {
    /// Every call returns an independent receiver; dropping it unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<HostNotification>;

    /// Asks the host to start a session. `Ok(false)` means the host refused.
    async fn start_debugging(&self, scope: LaunchScope, config: Value) -> Result<bool>;

    async fn stop_debugging(&self, session: &HostSession) -> Result<()>;

    /// Forwards a protocol command to the session and returns the response body.
    async fn custom_request(
        &self,
        session: &HostSession,
        command: &str,
        args: Option<Value>,
    ) -> Result<Value>;
}

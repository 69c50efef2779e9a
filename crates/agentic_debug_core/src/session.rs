//! Debug session state machine.
//!
//! A [`DebugSession`] owns the begin/terminate sequence for one launch and folds
//! backend events into a [`SessionState`]. The fold itself is the pure
//! [`transition`] function so it can be tested without a backend.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{sync::Notify, time::timeout};

use crate::{
    backend::DebugBackend,
    config::ResolvedConfig,
    events::Subscription,
    lock,
    notify::{LogLevel, NotificationSink},
    protocol::ProtocolEvent,
    Result,
};

/// How long `begin` waits for the adapter's `initialized` event.
pub const INITIALIZED_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    NotStarted,
    Launching,
    Listening,
    Connected,
    Paused,
    Terminated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Launching => "launching",
            Self::Listening => "listening",
            Self::Connected => "connected",
            Self::Paused => "paused",
            Self::Terminated => "terminated",
        }
    }

    /// What the agent should do next in this state.
    pub fn guidance(&self) -> &'static str {
        match self {
            Self::NotStarted => "No active session. Call debug_launch to start debugging.",
            Self::Launching => "Session is starting. Wait a moment and check again.",
            Self::Listening => "Listening for Xdebug connections. Trigger your PHP script now.",
            Self::Connected => {
                "Xdebug connected, execution running. Set breakpoints or call debug_pause."
            }
            Self::Paused => {
                "Execution paused. Inspect with debug_stack_trace, debug_variables, debug_evaluate. \
                 Step with debug_next/debug_step_in/debug_step_out. Resume with debug_continue."
            }
            Self::Terminated => "Session ended. Call debug_launch to start a new session.",
        }
    }

    fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Launching | Self::Listening | Self::Connected | Self::Paused
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why and where execution last paused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopInfo {
    pub reason: String,
    pub thread_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_threads_stopped: Option<bool>,
}

impl StopInfo {
    pub fn from_event(event: &ProtocolEvent) -> Self {
        Self {
            reason: event.body_str("reason").unwrap_or("unknown").to_string(),
            thread_id: event.body_i64("threadId").unwrap_or(0),
            description: event.body_str("description").map(str::to_string),
            all_threads_stopped: event.body_bool("allThreadsStopped"),
        }
    }
}

/// Next state after `event`. `Terminated` absorbs everything and events are
/// ignored until a launch is underway.
pub fn transition(state: SessionState, event: &ProtocolEvent) -> SessionState {
    if !state.is_active() {
        return state;
    }
    match event.event.as_str() {
        "thread" if state == SessionState::Listening && event.body_str("reason") == Some("started") => {
            SessionState::Connected
        }
        "stopped" => SessionState::Paused,
        "continued" => SessionState::Connected,
        "terminated" | "exited" => SessionState::Terminated,
        _ => state,
    }
}

/// The session object the controller delegates to.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    fn id(&self) -> &str;

    /// Runs initialize, launch and configurationDone against the backend.
    async fn begin(&self) -> Result<()>;

    async fn terminate(&self) -> Result<()>;

    fn state(&self) -> SessionState;

    fn stop_info(&self) -> Option<StopInfo>;
}

#[derive(Debug, Default)]
struct SessionCore {
    state: SessionState,
    stop_info: Option<StopInfo>,
}

pub struct DebugSession {
    id: String,
    config: ResolvedConfig,
    backend: Arc<dyn DebugBackend>,
    notifier: Arc<dyn NotificationSink>,
    core: Arc<Mutex<SessionCore>>,
    initialized: Arc<Notify>,
    subscription: Mutex<Option<Subscription>>,
}

impl DebugSession {
    pub fn new(
        config: ResolvedConfig,
        backend: Arc<dyn DebugBackend>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            config,
            backend,
            notifier,
            core: Arc::new(Mutex::new(SessionCore::default())),
            initialized: Arc::new(Notify::new()),
            subscription: Mutex::new(None),
        }
    }

    fn set_state(&self, next: SessionState) {
        let previous = std::mem::replace(&mut lock(&self.core).state, next);
        report_transition(self.notifier.as_ref(), previous, next);
    }

    /// Falls back to `NotStarted` unless an event already ended the session.
    fn reset_if_launching(&self) {
        let reset = {
            let mut core = lock(&self.core);
            if core.state == SessionState::Launching {
                core.state = SessionState::NotStarted;
                true
            } else {
                false
            }
        };
        if reset {
            report_transition(self.notifier.as_ref(), SessionState::Launching, SessionState::NotStarted);
        }
    }

    fn subscribe(&self) {
        let core = self.core.clone();
        let notifier = self.notifier.clone();
        let initialized = self.initialized.clone();

        let subscription = self.backend.on_any_event(Arc::new(move |event: &ProtocolEvent| {
            if event.event == "initialized" {
                initialized.notify_one();
                return;
            }

            let (previous, next) = {
                let mut core = lock(&core);
                let previous = core.state;
                let next = transition(previous, event);
                match next {
                    SessionState::Paused if event.event == "stopped" => {
                        core.stop_info = Some(StopInfo::from_event(event));
                    }
                    SessionState::Connected | SessionState::Terminated => core.stop_info = None,
                    _ => {}
                }
                core.state = next;
                (previous, next)
            };

            if matches!(
                event.event.as_str(),
                "stopped" | "continued" | "terminated" | "exited" | "thread"
            ) {
                notifier.debug_event(&event.event, &event.body);
            }
            report_transition(notifier.as_ref(), previous, next);
        }));

        if let Some(previous) = lock(&self.subscription).replace(subscription) {
            previous.dispose();
        }
    }

    fn unsubscribe(&self) {
        if let Some(subscription) = lock(&self.subscription).take() {
            subscription.dispose();
        }
    }

    async fn run_begin(&self) -> Result<()> {
        let token = self.id.as_str();

        self.notifier.progress(token, 0, Some(3), Some("Initializing debug adapter"));
        self.backend.initialize().await?;

        self.notifier.progress(token, 1, Some(3), Some("Launching debug session"));
        self.backend.launch(self.config.launch_arguments()).await?;

        if timeout(INITIALIZED_TIMEOUT, self.initialized.notified())
            .await
            .is_err()
        {
            tracing::warn!(
                "No initialized event within {:?}, continuing",
                INITIALIZED_TIMEOUT
            );
        }

        self.notifier.progress(token, 2, Some(3), Some("Sending configurationDone"));
        self.backend.configuration_done().await?;

        let moved = {
            let mut core = lock(&self.core);
            if core.state == SessionState::Launching {
                core.state = SessionState::Listening;
                true
            } else {
                false
            }
        };
        if moved {
            report_transition(self.notifier.as_ref(), SessionState::Launching, SessionState::Listening);
        }

        self.notifier.progress(
            token,
            3,
            Some(3),
            Some(format!("Listening on {}:{}", self.config.hostname, self.config.port).as_str()),
        );
        Ok(())
    }
}

fn report_transition(notifier: &dyn NotificationSink, previous: SessionState, next: SessionState) {
    if previous == next {
        return;
    }
    tracing::info!("[state] {previous} -> {next}");
    notifier.debug_event("state", &json!({ "from": previous, "to": next }));
}

#[async_trait]
impl SessionHandle for DebugSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn begin(&self) -> Result<()> {
        self.set_state(SessionState::Launching);
        lock(&self.core).stop_info = None;
        self.subscribe();

        let result = self.run_begin().await;
        if let Err(err) = &result {
            self.notifier.log(
                LogLevel::Error,
                &format!("Debug session failed to start: {err}"),
                Some(&err.to_payload()),
            );
            self.unsubscribe();
            self.reset_if_launching();
        }
        result
    }

    async fn terminate(&self) -> Result<()> {
        let result = self.backend.disconnect().await;
        if let Err(err) = &result {
            tracing::warn!(error = %err, "Backend disconnect failed");
        }

        lock(&self.core).stop_info = None;
        self.set_state(SessionState::Terminated);
        self.unsubscribe();
        result
    }

    fn state(&self) -> SessionState {
        lock(&self.core).state
    }

    fn stop_info(&self) -> Option<StopInfo> {
        lock(&self.core).stop_info.clone()
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

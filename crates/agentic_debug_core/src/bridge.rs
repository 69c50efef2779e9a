//! Backend that drives a session owned by the host's debug UI.
//!
//! The host starts the adapter, shows the session to the human, and relays only
//! the traffic it does not consume itself. [`ProtocolBridge`] presents that as a
//! plain protocol endpoint: requests become host custom requests, host
//! notifications become events, and the lifecycle events the host swallows
//! (`thread`, `stopped`, `continued`) are inferred by polling.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
    time::{interval, timeout, MissedTickBehavior},
};

use crate::{
    backend::{BackendStatus, DebugBackend},
    config::BridgeOptions,
    events::EventRegistry,
    host::{DebugHost, HostNotification, HostSession, LaunchScope, AGENT_MARKER},
    lock,
    probe::{HostProbe, PollTracker, SessionProbe},
    protocol::{bridge_capabilities, ProtocolEvent, ProtocolRequest, ProtocolResponse, SeqCounter},
    BridgeError, Result,
};

/// Launch fields the host's PHP debug configuration understands.
pub const HOST_LAUNCH_FIELDS: [&str; 22] = [
    "port",
    "hostname",
    "stopOnEntry",
    "pathMappings",
    "program",
    "args",
    "cwd",
    "runtimeExecutable",
    "runtimeArgs",
    "env",
    "envFile",
    "xdebugSettings",
    "maxConnections",
    "log",
    "noDebug",
    "skipFiles",
    "skipEntryPaths",
    "ignore",
    "ignoreExceptions",
    "proxy",
    "stream",
    "xdebugCloudToken",
];

/// Builds the host launch configuration from protocol `launch` arguments.
///
/// Only [`HOST_LAUNCH_FIELDS`] survive, null values are dropped and the
/// configuration is tagged with [`AGENT_MARKER`].
pub fn build_host_config(options: &BridgeOptions, args: &Value) -> Value {
    let mut config = Map::new();
    config.insert("type".into(), json!(options.debug_type));
    config.insert("request".into(), json!("launch"));
    config.insert("name".into(), json!(options.session_name));

    for field in HOST_LAUNCH_FIELDS {
        match args.get(field) {
            Some(Value::Null) | None => {}
            Some(value) => {
                config.insert(field.to_string(), value.clone());
            }
        }
    }

    config.insert(AGENT_MARKER.into(), Value::Bool(true));
    Value::Object(config)
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentSessionEntry {
    pub session_id: String,
    pub launch_timestamp: u128,
    pub native_session: HostSession,
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

#[derive(Default)]
struct BridgeState {
    session: Option<HostSession>,
    alive: bool,
    listener: Option<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
    tracker: PollTracker,
    agent_sessions: HashMap<String, AgentSessionEntry>,
}

struct BridgeInner {
    host: Arc<dyn DebugHost>,
    probe: Arc<dyn SessionProbe>,
    options: BridgeOptions,
    seq: SeqCounter,
    events: EventRegistry,
    state: Mutex<BridgeState>,
}

pub struct ProtocolBridge {
    inner: Arc<BridgeInner>,
}

impl ProtocolBridge {
    pub fn new(host: Arc<dyn DebugHost>, options: BridgeOptions) -> Self {
        let probe = Arc::new(HostProbe::new(host.clone()));
        Self::with_probe(host, probe, options)
    }

    pub fn with_probe(
        host: Arc<dyn DebugHost>,
        probe: Arc<dyn SessionProbe>,
        options: BridgeOptions,
    ) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                host,
                probe,
                options,
                seq: SeqCounter::new(),
                events: EventRegistry::new(),
                state: Mutex::new(BridgeState::default()),
            }),
        }
    }

    /// The host session currently attached, if any.
    pub fn session(&self) -> Option<HostSession> {
        lock(&self.inner.state).session.clone()
    }

    pub fn agent_session(&self, session_id: &str) -> Option<AgentSessionEntry> {
        lock(&self.inner.state).agent_sessions.get(session_id).cloned()
    }
}

impl BridgeInner {
    fn emit(&self, event: &str, body: Value) {
        let event = ProtocolEvent::new(self.seq.next(), event, body);
        tracing::debug!(seq = event.seq, event = %event.event, "<- bridge event");
        self.events.dispatch(&event);
    }

    fn attached_and_alive(&self) -> bool {
        let state = lock(&self.state);
        state.session.is_some() && state.alive
    }

    fn ensure_listener(self: &Arc<Self>) {
        let mut state = lock(&self.state);
        if state.listener.is_some() {
            return;
        }
        // Subscribe before spawning so nothing sent in between is missed.
        let rx = self.host.subscribe();
        state.listener = Some(tokio::spawn(listen(Arc::downgrade(self), rx)));
    }

    fn record_agent_session(&self, session: &HostSession) {
        lock(&self.state)
            .agent_sessions
            .entry(session.id.clone())
            .or_insert_with(|| AgentSessionEntry {
                session_id: session.id.clone(),
                launch_timestamp: timestamp_millis(),
                native_session: session.clone(),
            });
    }

    /// Attaches to `session` unless one is already attached.
    fn attach(self: &Arc<Self>, session: HostSession) {
        {
            let mut state = lock(&self.state);
            if state.session.is_some() {
                return;
            }
            tracing::info!(session_id = %session.id, name = %session.name, "Attached to host debug session");
            state.session = Some(session);
            state.alive = true;
            state.tracker.reset();
        }
        self.start_polling();
        self.emit("initialized", json!({}));
    }

    fn start_polling(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.options.poll_interval;
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.poll_once().await;
            }
        });

        let previous = lock(&self.state).poller.replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn stop_polling(&self) {
        let poller = lock(&self.state).poller.take();
        if let Some(poller) = poller {
            poller.abort();
        }
    }

    async fn poll_once(&self) {
        let Some(session) = lock(&self.state).session.clone() else {
            return;
        };

        let threads = match self.probe.threads(&session).await {
            Ok(threads) => threads,
            Err(err) => {
                tracing::debug!(error = %err, "Thread poll failed");
                return;
            }
        };

        let top_frames = match threads.first() {
            Some(first) => self.probe.top_frames(&session, first.id).await.ok(),
            None => None,
        };

        let inferred = {
            let mut state = lock(&self.state);
            if state.session.as_ref().map(|s| s.id.as_str()) != Some(session.id.as_str()) {
                return;
            }
            state.tracker.observe(&threads, top_frames)
        };

        for (event, body) in inferred {
            self.emit(&event, body);
        }
    }

    /// Runs once per attached session; later calls for the same id find nothing.
    fn handle_terminated(&self, session_id: &str) {
        let poller = {
            let mut state = lock(&self.state);
            if state.session.as_ref().map(|s| s.id.as_str()) != Some(session_id) {
                return;
            }
            state.session = None;
            state.alive = false;
            state.tracker.reset();
            state.agent_sessions.remove(session_id);
            state.poller.take()
        };
        if let Some(poller) = poller {
            poller.abort();
        }
        tracing::info!(session_id, "Host debug session terminated");
        self.emit("terminated", json!({}));
    }

    fn handle_notification(self: &Arc<Self>, notification: HostNotification) {
        match notification {
            HostNotification::SessionStarted(session) => {
                if !session.is_agent_initiated(&self.options.debug_type) {
                    return;
                }
                self.record_agent_session(&session);
                self.attach(session);
            }
            HostNotification::SessionTerminated(session) => self.handle_terminated(&session.id),
            HostNotification::CustomEvent {
                session,
                event,
                body,
            } => {
                let attached = lock(&self.state)
                    .session
                    .as_ref()
                    .is_some_and(|current| current.id == session.id);
                if attached {
                    self.emit(&event, body.unwrap_or_else(|| json!({})));
                }
            }
        }
    }

    async fn await_session_start(
        &self,
        rx: &mut broadcast::Receiver<HostNotification>,
    ) -> Result<HostSession> {
        let debug_type = self.options.debug_type.clone();
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(HostNotification::SessionStarted(session))
                        if session.is_agent_initiated(&debug_type) =>
                    {
                        return Ok(session);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Host notifications lagged during launch");
                    }
                    Err(RecvError::Closed) => {
                        return Err(BridgeError::Adapter(
                            "host notification channel closed".to_string(),
                        ));
                    }
                }
            }
        };

        let limit = self.options.session_start_timeout;
        match timeout(limit, wait).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BridgeError::timeout("debug session start", limit)),
        }
    }
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        let state = lock(&self.state);
        if let Some(poller) = &state.poller {
            poller.abort();
        }
        if let Some(listener) = &state.listener {
            listener.abort();
        }
    }
}

async fn listen(weak: Weak<BridgeInner>, mut rx: broadcast::Receiver<HostNotification>) {
    loop {
        let notification = match rx.recv().await {
            Ok(notification) => notification,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Host notifications lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(inner) = weak.upgrade() else {
            break;
        };
        inner.handle_notification(notification);
    }
}

#[async_trait]
impl DebugBackend for ProtocolBridge {
    async fn initialize(&self) -> Result<ProtocolResponse> {
        let request_seq = self.inner.seq.next();
        self.inner.ensure_listener();
        Ok(ProtocolResponse::success(
            self.inner.seq.next(),
            request_seq,
            "initialize",
            Some(bridge_capabilities()),
        ))
    }

    async fn launch(&self, args: Value) -> Result<ProtocolResponse> {
        let inner = &self.inner;
        let request_seq = inner.seq.next();
        inner.ensure_listener();

        if inner.attached_and_alive() {
            inner.start_polling();
            inner.emit("initialized", json!({}));
            return Ok(ProtocolResponse::success(inner.seq.next(), request_seq, "launch", None));
        }

        let config = build_host_config(&inner.options, &args);
        let mut rx = inner.host.subscribe();

        let mut scopes = Vec::new();
        if let Some(folder) = &inner.options.workspace_folder {
            scopes.push(LaunchScope::Workspace(folder.clone()));
        }
        scopes.push(LaunchScope::Global);

        let mut started = false;
        let mut refused = false;
        let mut last_error = None;
        for scope in scopes {
            match inner.host.start_debugging(scope.clone(), config.clone()).await {
                Ok(true) => {
                    started = true;
                    break;
                }
                Ok(false) => {
                    tracing::warn!(?scope, "Host refused to start debugging");
                    refused = true;
                }
                Err(err) => {
                    tracing::warn!(?scope, error = %err, "Host failed to start debugging");
                    last_error = Some(err);
                }
            }
        }
        if !started {
            // Every attempt errored: the host's reason beats a generic refusal.
            return Err(match last_error {
                Some(err) if !refused => err,
                _ => BridgeError::Adapter("Host refused to start the debug session".to_string()),
            });
        }

        let session = inner.await_session_start(&mut rx).await?;
        inner.record_agent_session(&session);
        inner.attach(session);

        Ok(ProtocolResponse::success(inner.seq.next(), request_seq, "launch", None))
    }

    async fn configuration_done(&self) -> Result<ProtocolResponse> {
        match self.send_request("configurationDone", None).await {
            Ok(response) => Ok(response),
            Err(err) => {
                tracing::warn!(error = %err, "configurationDone rejected");
                let request_seq = self.inner.seq.next();
                Ok(ProtocolResponse::success(
                    self.inner.seq.next(),
                    request_seq,
                    "configurationDone",
                    None,
                ))
            }
        }
    }

    async fn send_request(&self, command: &str, args: Option<Value>) -> Result<ProtocolResponse> {
        let inner = &self.inner;
        let session = lock(&inner.state)
            .session
            .clone()
            .ok_or(BridgeError::NoSession)?;

        let request = ProtocolRequest::new(inner.seq.next(), command, args.clone());
        tracing::debug!(seq = request.seq, command, arguments = ?request.arguments, "-> host request");

        let body = inner
            .host
            .custom_request(&session, command, args)
            .await
            .map_err(|err| match err {
                BridgeError::Transport { .. } => err,
                other => BridgeError::transport(command, other.to_string()),
            })?;

        let body = (!body.is_null()).then_some(body);
        let response = ProtocolResponse::success(inner.seq.next(), request.seq, command, body);
        tracing::debug!(seq = response.seq, request_seq = request.seq, command, "<- host response");
        Ok(response)
    }

    async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        inner.stop_polling();

        let session = lock(&inner.state).session.clone();
        if let Some(session) = session {
            if let Err(err) = inner.host.stop_debugging(&session).await {
                tracing::warn!(session_id = %session.id, error = %err, "Failed to stop host session");
            }
            inner.handle_terminated(&session.id);
        }

        let listener = {
            let mut state = lock(&inner.state);
            state.alive = false;
            state.listener.take()
        };
        if let Some(listener) = listener {
            listener.abort();
        }
        Ok(())
    }

    fn events(&self) -> &EventRegistry {
        &self.inner.events
    }

    fn is_alive(&self) -> bool {
        lock(&self.inner.state).alive
    }

    fn status(&self) -> BackendStatus {
        let state = lock(&self.inner.state);
        BackendStatus {
            alive: state.alive,
            pid: None,
            exit_code: None,
            session_id: state.session.as_ref().map(|s| s.id.clone()),
        }
    }

    fn seq(&self) -> u64 {
        self.inner.seq.current().saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::ThreadInfo,
        testing::{FakeHost, ScriptedProbe},
    };
    use std::time::Duration;

    fn options() -> BridgeOptions {
        BridgeOptions {
            poll_interval: Duration::from_millis(100),
            session_start_timeout: Duration::from_secs(2),
            workspace_folder: Some("/workspace".into()),
            ..BridgeOptions::default()
        }
    }

    fn record_events(bridge: &ProtocolBridge) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _subscription = bridge.on_any_event(Arc::new(move |e: &ProtocolEvent| {
            sink.lock().unwrap().push(e.event.clone());
        }));
        seen
    }

    fn thread() -> Vec<ThreadInfo> {
        vec![ThreadInfo {
            id: 7,
            name: "Request 1 (127.0.0.1)".into(),
        }]
    }

    #[test]
    fn test_host_config_keeps_allow_list_and_tags_origin() {
        let config = build_host_config(
            &BridgeOptions::default(),
            &json!({
                "port": 9003,
                "pathMappings": { "/app": "/local" },
                "program": null,
                "adapterPath": "/ext/out/phpDebug.js",
                "bogus": true,
            }),
        );

        assert_eq!(config["type"], "php");
        assert_eq!(config["request"], "launch");
        assert_eq!(config["name"], "Agentic Debug Session");
        assert_eq!(config["port"], 9003);
        assert_eq!(config["pathMappings"]["/app"], "/local");
        assert_eq!(config[AGENT_MARKER], true);
        assert!(config.get("program").is_none());
        assert!(config.get("adapterPath").is_none());
        assert!(config.get("bogus").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_reports_capabilities_without_host_traffic() {
        let host = Arc::new(FakeHost::new());
        let bridge = ProtocolBridge::new(host.clone(), options());

        let response = bridge.initialize().await.expect("initialize");
        assert!(response.success);
        assert_eq!(response.body()["supportsConfigurationDoneRequest"], true);
        assert_eq!(response.body()["supportsSetVariable"], true);
        assert!(host.started().is_empty());
        assert!(host.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_attaches_and_emits_initialized_once() {
        let host = Arc::new(FakeHost::new());
        let bridge = ProtocolBridge::with_probe(host.clone(), Arc::new(ScriptedProbe::new()), options());
        let seen = record_events(&bridge);

        bridge.initialize().await.expect("initialize");
        bridge
            .launch(json!({ "port": 9003, "stopOnEntry": true }))
            .await
            .expect("launch");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(bridge.is_alive());
        let session = bridge.session().expect("attached");
        assert!(bridge.agent_session(&session.id).is_some());
        assert_eq!(
            seen.lock().unwrap().iter().filter(|e| *e == "initialized").count(),
            1
        );

        let started = host.started();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].0, LaunchScope::Workspace("/workspace".into()));
        assert_eq!(started[0].1[AGENT_MARKER], true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_falls_back_to_global_scope() {
        let host = Arc::new(FakeHost::new());
        host.answer_start(false);
        let bridge = ProtocolBridge::with_probe(host.clone(), Arc::new(ScriptedProbe::new()), options());

        bridge.launch(json!({})).await.expect("launch");

        let scopes: Vec<LaunchScope> = host.started().into_iter().map(|(s, _)| s).collect();
        assert_eq!(
            scopes,
            vec![LaunchScope::Workspace("/workspace".into()), LaunchScope::Global]
        );
        assert!(bridge.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_fails_when_host_refuses_everywhere() {
        let host = Arc::new(FakeHost::new());
        host.answer_start(false);
        host.answer_start(false);
        let bridge = ProtocolBridge::with_probe(host.clone(), Arc::new(ScriptedProbe::new()), options());

        let err = bridge.launch(json!({})).await.expect_err("refused");
        assert_eq!(err.code(), "DAP_ERROR");
        assert!(!bridge.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_surfaces_host_error_when_every_attempt_fails() {
        let host = Arc::new(FakeHost::new());
        host.fail_start("node not found");
        host.fail_start("node not found");
        let bridge = ProtocolBridge::with_probe(host.clone(), Arc::new(ScriptedProbe::new()), options());

        let err = bridge.launch(json!({})).await.expect_err("start failed");
        assert_eq!(err.code(), "PRECONDITION_FAILED");
        assert!(err.to_string().contains("node not found"));
        assert_eq!(host.started().len(), 2);

        let host = Arc::new(FakeHost::new());
        host.fail_start("node not found");
        host.answer_start(false);
        let bridge = ProtocolBridge::with_probe(host, Arc::new(ScriptedProbe::new()), options());
        let err = bridge.launch(json!({})).await.expect_err("refused");
        assert_eq!(err.code(), "DAP_ERROR");
    }

    #[tokio::test(start_paused = true)]
    async fn test_relaunch_while_attached_reuses_session() {
        let host = Arc::new(FakeHost::new());
        let bridge = ProtocolBridge::with_probe(host.clone(), Arc::new(ScriptedProbe::new()), options());
        let seen = record_events(&bridge);

        bridge.launch(json!({})).await.expect("launch");
        let first = bridge.session().expect("attached");
        bridge.launch(json!({ "port": 9100 })).await.expect("relaunch");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(host.started().len(), 1);
        assert_eq!(bridge.session().expect("still attached").id, first.id);
        assert_eq!(
            seen.lock().unwrap().iter().filter(|e| *e == "initialized").count(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_done_swallows_host_rejection() {
        let host = Arc::new(FakeHost::new());
        host.fail("configurationDone");
        let bridge = ProtocolBridge::with_probe(host.clone(), Arc::new(ScriptedProbe::new()), options());
        bridge.launch(json!({})).await.expect("launch");

        let response = bridge.configuration_done().await.expect("swallowed");
        assert!(response.success);
        assert_eq!(response.command, "configurationDone");
        let commands: Vec<String> = host.requests().into_iter().map(|(c, _)| c).collect();
        assert!(commands.contains(&"configurationDone".to_string()));
        assert!(bridge.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_times_out_without_session_start() {
        let host = Arc::new(FakeHost::silent());
        let bridge = ProtocolBridge::with_probe(host, Arc::new(ScriptedProbe::new()), options());

        let err = bridge.launch(json!({})).await.expect_err("no session start");
        assert_eq!(err.code(), "TIMEOUT");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_without_marker_are_ignored() {
        let host = Arc::new(FakeHost::new());
        let bridge = ProtocolBridge::with_probe(host.clone(), Arc::new(ScriptedProbe::new()), options());
        bridge.initialize().await.expect("initialize");

        host.announce(HostSession {
            id: "human".into(),
            debug_type: "php".into(),
            name: "Listen for Xdebug".into(),
            configuration: json!({ "type": "php" }),
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(bridge.session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_request_without_session_fails_fast() {
        let host = Arc::new(FakeHost::new());
        let bridge = ProtocolBridge::new(host.clone(), options());

        let err = bridge.send_request("threads", None).await.expect_err("detached");
        assert_eq!(err.code(), "SESSION_NOT_STARTED");
        assert!(host.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_request_wraps_host_response() {
        let host = Arc::new(FakeHost::new());
        host.respond("evaluate", json!({ "result": "42" }));
        host.fail("next");
        let bridge = ProtocolBridge::with_probe(host.clone(), Arc::new(ScriptedProbe::new()), options());
        bridge.launch(json!({})).await.expect("launch");

        let response = bridge
            .send_request("evaluate", Some(json!({ "expression": "$x" })))
            .await
            .expect("evaluate");
        assert_eq!(response.command, "evaluate");
        assert!(response.request_seq < response.seq);
        assert_eq!(response.body()["result"], "42");

        let err = bridge.send_request("next", None).await.expect_err("host rejects");
        assert_eq!(err.code(), "DAP_ERROR");
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_infers_pause_and_resume() {
        let host = Arc::new(FakeHost::new());
        let probe = Arc::new(ScriptedProbe::new());
        probe.push(vec![], None);
        probe.push(thread(), None);
        probe.push(thread(), Some(1));
        probe.push(thread(), Some(0));
        let bridge = ProtocolBridge::with_probe(host, probe, options());
        let seen = record_events(&bridge);

        bridge.launch(json!({})).await.expect("launch");
        tokio::time::sleep(Duration::from_millis(650)).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["initialized", "thread", "stopped", "continued"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_termination_detaches_and_ignores_late_events() {
        let host = Arc::new(FakeHost::new());
        let bridge = ProtocolBridge::with_probe(host.clone(), Arc::new(ScriptedProbe::new()), options());
        let seen = record_events(&bridge);
        bridge.launch(json!({})).await.expect("launch");
        let session = bridge.session().expect("attached");

        host.relay(&session, "output", Some(json!({ "output": "hello" })));
        host.end(&session);
        host.relay(&session, "output", Some(json!({ "output": "late" })));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["initialized", "output", "terminated"]
        );
        assert!(!bridge.is_alive());
        assert!(bridge.session().is_none());
        assert!(bridge.agent_session(&session.id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_session_and_emits_terminated_once() {
        let host = Arc::new(FakeHost::new());
        let bridge = ProtocolBridge::with_probe(host.clone(), Arc::new(ScriptedProbe::new()), options());
        let seen = record_events(&bridge);
        bridge.launch(json!({})).await.expect("launch");
        let session = bridge.session().expect("attached");

        bridge.disconnect().await.expect("disconnect");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(host.stopped(), vec![session.id.clone()]);
        assert_eq!(
            seen.lock().unwrap().iter().filter(|e| *e == "terminated").count(),
            1
        );
        assert!(!bridge.is_alive());
        assert_eq!(bridge.status().session_id, None);
    }
}

//! Test doubles shared by the unit tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::{
    io::{duplex, split, AsyncWriteExt, BufReader, DuplexStream},
    sync::broadcast,
};

use crate::{
    backend::{BackendStatus, DebugBackend},
    config::{
        BackendMode, ConfigResolver, JsonSettings, LaunchFile, LaunchProfile, ResolvedConfig,
        StaticAdapterLocator,
    },
    controller::SessionFactory,
    events::EventRegistry,
    host::{DebugHost, HostNotification, HostSession, LaunchScope},
    notify::{LogLevel, NotificationSink},
    probe::SessionProbe,
    protocol::{bridge_capabilities, ProtocolEvent, ProtocolResponse, SeqCounter, ThreadInfo},
    session::{SessionHandle, SessionState, StopInfo},
    transport::{encode_dap_message, read_dap_message, AdapterProcess, ProcessFactory},
    BridgeError, Result,
};

pub const ADAPTER_PATH: &str = "/ext/xdebug.php-debug-1.35.0/out/phpDebug.js";

pub fn empty_settings() -> JsonSettings {
    JsonSettings::from_value(json!({}))
}

pub fn empty_profiles() -> LaunchFile {
    LaunchFile::from_profiles(Vec::<LaunchProfile>::new())
}

pub fn resolver_with(settings: Value, profiles: Vec<LaunchProfile>) -> ConfigResolver {
    ConfigResolver::new(
        Arc::new(JsonSettings::from_value(settings)),
        Arc::new(LaunchFile::from_profiles(profiles)),
        Arc::new(StaticAdapterLocator(ADAPTER_PATH.into())),
    )
}

fn take<T: Clone>(m: &Mutex<Vec<T>>) -> Vec<T> {
    m.lock().unwrap().clone()
}

/// Host that accepts every start request and announces the session immediately.
pub struct FakeHost {
    tx: broadcast::Sender<HostNotification>,
    auto_start: bool,
    answers: Mutex<VecDeque<std::result::Result<bool, String>>>,
    started: Mutex<Vec<(LaunchScope, Value)>>,
    stopped: Mutex<Vec<String>>,
    requests: Mutex<Vec<(String, Option<Value>)>>,
    responses: Mutex<HashMap<String, Value>>,
    failing: Mutex<HashSet<String>>,
    next_id: AtomicUsize,
}

impl FakeHost {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            tx,
            auto_start: true,
            answers: Mutex::new(VecDeque::new()),
            started: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            responses: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            next_id: AtomicUsize::new(1),
        }
    }

    /// Accepts start requests but never reports a session.
    pub fn silent() -> Self {
        Self {
            auto_start: false,
            ..Self::new()
        }
    }

    pub fn answer_start(&self, accepted: bool) {
        self.answers.lock().unwrap().push_back(Ok(accepted));
    }

    /// Makes the next start request fail with a precondition error.
    pub fn fail_start(&self, message: &str) {
        self.answers.lock().unwrap().push_back(Err(message.to_string()));
    }

    pub fn respond(&self, command: &str, body: Value) {
        self.responses.lock().unwrap().insert(command.to_string(), body);
    }

    pub fn fail(&self, command: &str) {
        self.failing.lock().unwrap().insert(command.to_string());
    }

    pub fn started(&self) -> Vec<(LaunchScope, Value)> {
        take(&self.started)
    }

    pub fn stopped(&self) -> Vec<String> {
        take(&self.stopped)
    }

    pub fn requests(&self) -> Vec<(String, Option<Value>)> {
        take(&self.requests)
    }

    pub fn announce(&self, session: HostSession) {
        let _ = self.tx.send(HostNotification::SessionStarted(session));
    }

    pub fn relay(&self, session: &HostSession, event: &str, body: Option<Value>) {
        let _ = self.tx.send(HostNotification::CustomEvent {
            session: session.clone(),
            event: event.to_string(),
            body,
        });
    }

    pub fn end(&self, session: &HostSession) {
        let _ = self.tx.send(HostNotification::SessionTerminated(session.clone()));
    }
}

#[async_trait]
impl DebugHost for FakeHost {
    fn subscribe(&self) -> broadcast::Receiver<HostNotification> {
        self.tx.subscribe()
    }

    async fn start_debugging(&self, scope: LaunchScope, config: Value) -> Result<bool> {
        self.started.lock().unwrap().push((scope, config.clone()));
        let accepted = self
            .answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(true))
            .map_err(BridgeError::Precondition)?;
        if accepted && self.auto_start {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.announce(HostSession {
                id: format!("host-{id}"),
                debug_type: config["type"].as_str().unwrap_or_default().to_string(),
                name: config["name"].as_str().unwrap_or_default().to_string(),
                configuration: config,
            });
        }
        Ok(accepted)
    }

    async fn stop_debugging(&self, session: &HostSession) -> Result<()> {
        self.stopped.lock().unwrap().push(session.id.clone());
        self.end(session);
        Ok(())
    }

    async fn custom_request(
        &self,
        _session: &HostSession,
        command: &str,
        args: Option<Value>,
    ) -> Result<Value> {
        self.requests.lock().unwrap().push((command.to_string(), args));
        if self.failing.lock().unwrap().contains(command) {
            return Err(BridgeError::transport(command, "rejected by host"));
        }
        Ok(self
            .responses
            .lock()
            .unwrap()
            .get(command)
            .cloned()
            .unwrap_or_else(|| json!({})))
    }
}

/// Probe that replays one `(threads, top frames)` observation per poll.
#[derive(Default)]
pub struct ScriptedProbe {
    script: Mutex<VecDeque<(Vec<ThreadInfo>, Option<usize>)>>,
    frames: Mutex<Option<usize>>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, threads: Vec<ThreadInfo>, frames: Option<usize>) {
        self.script.lock().unwrap().push_back((threads, frames));
    }
}

#[async_trait]
impl SessionProbe for ScriptedProbe {
    async fn threads(&self, _session: &HostSession) -> Result<Vec<ThreadInfo>> {
        let (threads, frames) = self.script.lock().unwrap().pop_front().unwrap_or_default();
        *self.frames.lock().unwrap() = frames;
        Ok(threads)
    }

    async fn top_frames(&self, _session: &HostSession, _thread_id: i64) -> Result<usize> {
        self.frames
            .lock()
            .unwrap()
            .ok_or_else(|| BridgeError::transport("stackTrace", "thread is running"))
    }
}

/// Backend that answers every request from a table and records it.
pub struct FakeBackend {
    events: EventRegistry,
    seq: SeqCounter,
    requests: Mutex<Vec<(String, Option<Value>)>>,
    responses: Mutex<HashMap<String, Value>>,
    failing: Mutex<HashSet<String>>,
    alive: AtomicBool,
    disconnects: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            events: EventRegistry::new(),
            seq: SeqCounter::new(),
            requests: Mutex::new(Vec::new()),
            responses: Mutex::new(HashMap::from([(
                "initialize".to_string(),
                bridge_capabilities(),
            )])),
            failing: Mutex::new(HashSet::new()),
            alive: AtomicBool::new(false),
            disconnects: AtomicUsize::new(0),
        }
    }

    pub fn respond(&self, command: &str, body: Value) {
        self.responses.lock().unwrap().insert(command.to_string(), body);
    }

    pub fn fail(&self, command: &str) {
        self.failing.lock().unwrap().insert(command.to_string());
    }

    pub fn requests(&self) -> Vec<(String, Option<Value>)> {
        take(&self.requests)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: &str, body: Value) {
        self.events
            .dispatch(&ProtocolEvent::new(self.seq.next(), event, body));
    }

    fn handle(&self, command: &str, args: Option<Value>) -> Result<ProtocolResponse> {
        self.requests.lock().unwrap().push((command.to_string(), args));
        if self.failing.lock().unwrap().contains(command) {
            return Err(BridgeError::transport(command, "rejected"));
        }
        let request_seq = self.seq.next();
        let body = self.responses.lock().unwrap().get(command).cloned();
        Ok(ProtocolResponse::success(self.seq.next(), request_seq, command, body))
    }
}

#[async_trait]
impl DebugBackend for FakeBackend {
    async fn initialize(&self) -> Result<ProtocolResponse> {
        self.handle("initialize", None)
    }

    async fn launch(&self, args: Value) -> Result<ProtocolResponse> {
        let response = self.handle("launch", Some(args))?;
        self.alive.store(true, Ordering::SeqCst);
        self.emit("initialized", json!({}));
        Ok(response)
    }

    async fn configuration_done(&self) -> Result<ProtocolResponse> {
        self.handle("configurationDone", None)
    }

    async fn send_request(&self, command: &str, args: Option<Value>) -> Result<ProtocolResponse> {
        self.handle(command, args)
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        self.emit("terminated", json!({}));
        Ok(())
    }

    fn events(&self) -> &EventRegistry {
        &self.events
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn status(&self) -> BackendStatus {
        BackendStatus {
            alive: self.is_alive(),
            ..BackendStatus::default()
        }
    }

    fn seq(&self) -> u64 {
        self.seq.current().saturating_sub(1)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(String, Value)>>,
    logs: Mutex<Vec<String>>,
    progress: Mutex<Vec<u64>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<(String, Value)> {
        take(&self.events)
    }

    pub fn logs(&self) -> Vec<String> {
        take(&self.logs)
    }

    pub fn progress(&self) -> Vec<u64> {
        take(&self.progress)
    }
}

impl NotificationSink for RecordingNotifier {
    fn progress(&self, _token: &str, progress: u64, _total: Option<u64>, _message: Option<&str>) {
        self.progress.lock().unwrap().push(progress);
    }

    fn log(&self, _level: LogLevel, message: &str, _data: Option<&Value>) {
        self.logs.lock().unwrap().push(message.to_string());
    }

    fn debug_event(&self, event: &str, details: &Value) {
        self.events
            .lock()
            .unwrap()
            .push((event.to_string(), details.clone()));
    }
}

/// Session double that only records what the controller asks of it.
pub struct FakeSession {
    id: String,
    state: Mutex<SessionState>,
    terminations: Arc<Mutex<Vec<String>>>,
    fail_terminate: bool,
}

#[async_trait]
impl SessionHandle for FakeSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn begin(&self) -> Result<()> {
        *self.state.lock().unwrap() = SessionState::Listening;
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        self.terminations.lock().unwrap().push(self.id.clone());
        *self.state.lock().unwrap() = SessionState::Terminated;
        if self.fail_terminate {
            return Err(BridgeError::transport("disconnect", "adapter wedged"));
        }
        Ok(())
    }

    fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    fn stop_info(&self) -> Option<StopInfo> {
        None
    }
}

/// Factory that counts constructions and terminate delegations.
#[derive(Default)]
pub struct CountingFactory {
    pub created: Mutex<Vec<String>>,
    pub configs: Mutex<Vec<ResolvedConfig>>,
    pub modes: Mutex<Vec<BackendMode>>,
    pub terminations: Arc<Mutex<Vec<String>>>,
    pub fail_terminate: AtomicBool,
}

impl CountingFactory {
    pub fn created(&self) -> Vec<String> {
        take(&self.created)
    }

    pub fn terminations(&self) -> Vec<String> {
        take(&self.terminations)
    }
}

impl SessionFactory for CountingFactory {
    fn create_backend(&self, _config: &ResolvedConfig, mode: BackendMode) -> Result<Arc<dyn DebugBackend>> {
        self.modes.lock().unwrap().push(mode);
        Ok(Arc::new(FakeBackend::new()))
    }

    fn create_session(
        &self,
        config: ResolvedConfig,
        _backend: Arc<dyn DebugBackend>,
        _notifier: Arc<dyn NotificationSink>,
    ) -> Arc<dyn SessionHandle> {
        let mut created = self.created.lock().unwrap();
        let id = format!("session-{}", created.len() + 1);
        created.push(id.clone());
        self.configs.lock().unwrap().push(config);
        Arc::new(FakeSession {
            id,
            state: Mutex::new(SessionState::NotStarted),
            terminations: self.terminations.clone(),
            fail_terminate: self.fail_terminate.load(Ordering::SeqCst),
        })
    }
}

/// Starts an in-memory PHP adapter. With `defer_launch` it answers `launch`
/// only after `configurationDone`.
pub fn fake_adapter_factory(defer_launch: bool) -> ProcessFactory {
    Arc::new(move |_cwd, on_event, on_exit| {
        let (client_io, adapter_io) = duplex(64 * 1024);
        let (reader, writer) = split(client_io);
        tokio::spawn(run_fake_adapter(adapter_io, defer_launch));
        Ok(AdapterProcess::from_io(reader, writer, on_event, on_exit))
    })
}

async fn run_fake_adapter(io: DuplexStream, defer_launch: bool) {
    let (read, mut write) = split(io);
    let mut reader = BufReader::new(read);
    let mut seq = 1000_u64;
    let mut deferred_launch: Option<u64> = None;
    let mut paused = false;

    while let Ok(request) = read_dap_message(&mut reader).await {
        let request_seq = request["seq"].as_u64().unwrap_or(0);
        let command = request["command"].as_str().unwrap_or_default().to_string();
        let mut out: Vec<Value> = Vec::new();
        let mut next_seq = || {
            seq += 1;
            seq
        };
        let ok = |seq: u64, request_seq: u64, command: &str, body: Value| {
            json!({
                "seq": seq,
                "type": "response",
                "request_seq": request_seq,
                "command": command,
                "success": true,
                "body": body,
            })
        };
        let event = |seq: u64, name: &str, body: Value| {
            json!({ "seq": seq, "type": "event", "event": name, "body": body })
        };

        let mut exit = false;
        match command.as_str() {
            "initialize" => out.push(ok(
                next_seq(),
                request_seq,
                "initialize",
                json!({ "supportsConfigurationDoneRequest": true }),
            )),
            "launch" => {
                out.push(event(next_seq(), "initialized", json!({})));
                if defer_launch {
                    deferred_launch = Some(request_seq);
                } else {
                    out.push(ok(next_seq(), request_seq, "launch", json!({})));
                }
            }
            "configurationDone" => {
                out.push(ok(next_seq(), request_seq, "configurationDone", json!({})));
                if let Some(launch_seq) = deferred_launch.take() {
                    out.push(ok(next_seq(), launch_seq, "launch", json!({})));
                }
            }
            "threads" => out.push(ok(
                next_seq(),
                request_seq,
                "threads",
                json!({ "threads": [{ "id": 1, "name": "Request 1 (127.0.0.1)" }] }),
            )),
            "stackTrace" if paused => out.push(ok(
                next_seq(),
                request_seq,
                "stackTrace",
                json!({
                    "stackFrames": [{
                        "id": 1,
                        "name": "{main}",
                        "line": 3,
                        "column": 1,
                        "source": { "name": "index.php", "path": "/var/www/index.php" },
                    }],
                    "totalFrames": 1,
                }),
            )),
            "pause" => {
                paused = true;
                out.push(ok(next_seq(), request_seq, "pause", json!({})));
                out.push(event(
                    next_seq(),
                    "stopped",
                    json!({ "reason": "pause", "threadId": 1, "allThreadsStopped": true }),
                ));
            }
            "continue" => {
                paused = false;
                out.push(ok(
                    next_seq(),
                    request_seq,
                    "continue",
                    json!({ "allThreadsContinued": true }),
                ));
                out.push(event(next_seq(), "continued", json!({ "threadId": 1 })));
            }
            "evaluate" => {
                out.push(ok(
                    next_seq(),
                    request_seq,
                    "evaluate",
                    json!({ "result": "42", "type": "int", "variablesReference": 0 }),
                ));
                out.push(event(next_seq(), "output", json!({ "output": "notice\n" })));
                out.push(event(next_seq(), "xdebugNotice", json!({ "message": "custom" })));
            }
            "disconnect" => {
                out.push(ok(next_seq(), request_seq, "disconnect", json!({})));
                out.push(event(next_seq(), "terminated", json!({})));
                exit = true;
            }
            "crash" => exit = true,
            "stackTrace" | "fail" => {
                let message = if command == "fail" { "boom" } else { "thread is running" };
                out.push(json!({
                    "seq": next_seq(),
                    "type": "response",
                    "request_seq": request_seq,
                    "command": command,
                    "success": false,
                    "message": message,
                }));
            }
            other => out.push(ok(next_seq(), request_seq, other, json!({}))),
        }

        for message in out {
            let Ok(framed) = encode_dap_message(&message) else {
                return;
            };
            if write.write_all(&framed).await.is_err() {
                return;
            }
        }
        if exit {
            return;
        }
    }
}

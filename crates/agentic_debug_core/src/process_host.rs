//! A [`DebugHost`] that runs one adapter process per session.
//!
//! It behaves the way an editor's debug service does: standard lifecycle events
//! are consumed by the host and only non-standard events are relayed to
//! subscribers. That keeps [`crate::ProtocolBridge`]'s polling inference honest
//! when no editor is around.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{
    sync::{broadcast, Notify},
    time::timeout,
};

use crate::{
    config::{AdapterLocator, DEBUG_TYPE},
    host::{DebugHost, HostNotification, HostSession, LaunchScope},
    lock,
    transport::{initialize_arguments, AdapterCommand, AdapterProcess, ExitSink, MessageSink, ProcessFactory},
    BridgeError, Result,
};

/// Adapter events the host handles itself instead of relaying.
pub const HOST_HANDLED_EVENTS: [&str; 12] = [
    "initialized",
    "stopped",
    "continued",
    "thread",
    "output",
    "breakpoint",
    "module",
    "loadedSource",
    "process",
    "capabilities",
    "terminated",
    "exited",
];

struct HostedSession {
    info: HostSession,
    process: AdapterProcess,
    terminated: Arc<AtomicBool>,
}

type Sessions = Arc<Mutex<HashMap<String, Arc<HostedSession>>>>;

pub struct ProcessHost {
    factory: ProcessFactory,
    request_timeout: Duration,
    tx: broadcast::Sender<HostNotification>,
    sessions: Sessions,
}

impl ProcessHost {
    /// Runs `node <adapter>`, locating the adapter at each start.
    pub fn new(locator: Arc<dyn AdapterLocator>, request_timeout: Duration) -> Self {
        let factory: ProcessFactory = Arc::new(move |cwd, on_event, on_exit| {
            let mut command = AdapterCommand::node(&locator.locate()?);
            if let Some(cwd) = cwd {
                command = command.with_cwd(cwd);
            }
            AdapterProcess::spawn(&command, on_event, on_exit)
        });
        Self::with_factory(factory, request_timeout)
    }

    pub fn with_factory(factory: ProcessFactory, request_timeout: Duration) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            factory,
            request_timeout,
            tx,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    fn find(&self, session: &HostSession) -> Result<Arc<HostedSession>> {
        lock(&self.sessions)
            .get(&session.id)
            .cloned()
            .ok_or_else(|| BridgeError::Adapter(format!("unknown debug session '{}'", session.id)))
    }

    async fn handshake(&self, process: &AdapterProcess, config: &Value, initialized: &Notify) -> Result<()> {
        let t = self.request_timeout;
        process
            .request("initialize", Some(initialize_arguments(DEBUG_TYPE)), t)
            .await?;

        let (launch_seq, launch_rx) = process.begin_request("launch", Some(config.clone())).await?;
        if timeout(t, initialized.notified()).await.is_err() {
            tracing::warn!("Adapter sent no initialized event within {t:?}");
        }
        process.request("configurationDone", None, t).await?;
        process.await_response("launch", launch_seq, launch_rx, t).await?;
        Ok(())
    }
}

fn announce_terminated(
    tx: &broadcast::Sender<HostNotification>,
    sessions: &Sessions,
    info: &HostSession,
    terminated: &AtomicBool,
) {
    if terminated.swap(true, Ordering::SeqCst) {
        return;
    }
    lock(sessions).remove(&info.id);
    tracing::info!(session_id = %info.id, "Debug session ended");
    let _ = tx.send(HostNotification::SessionTerminated(info.clone()));
}

#[async_trait]
impl DebugHost for ProcessHost {
    fn subscribe(&self) -> broadcast::Receiver<HostNotification> {
        self.tx.subscribe()
    }

    async fn start_debugging(&self, scope: LaunchScope, config: Value) -> Result<bool> {
        let cwd = match scope {
            LaunchScope::Workspace(dir) if !dir.is_dir() => {
                tracing::warn!(folder = %dir.display(), "Workspace folder does not exist");
                return Ok(false);
            }
            LaunchScope::Workspace(dir) => Some(dir),
            LaunchScope::Global => None,
        };

        let debug_type = config.get("type").and_then(Value::as_str).unwrap_or_default();
        if debug_type != DEBUG_TYPE {
            tracing::warn!(debug_type, "No adapter registered for debug type");
            return Ok(false);
        }

        let info = HostSession {
            id: uuid::Uuid::new_v4().to_string(),
            debug_type: debug_type.to_string(),
            name: config
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("Debug Session")
                .to_string(),
            configuration: config.clone(),
        };
        let terminated = Arc::new(AtomicBool::new(false));
        let initialized = Arc::new(Notify::new());

        let on_event: MessageSink = {
            let tx = self.tx.clone();
            let sessions = self.sessions.clone();
            let info = info.clone();
            let terminated = terminated.clone();
            let initialized = initialized.clone();
            Arc::new(move |message: Value| {
                let event = message.get("event").and_then(Value::as_str).unwrap_or_default();
                match event {
                    "initialized" => initialized.notify_one(),
                    "terminated" | "exited" => announce_terminated(&tx, &sessions, &info, &terminated),
                    handled if HOST_HANDLED_EVENTS.contains(&handled) => {}
                    custom => {
                        let _ = tx.send(HostNotification::CustomEvent {
                            session: info.clone(),
                            event: custom.to_string(),
                            body: message.get("body").cloned(),
                        });
                    }
                }
            })
        };
        let on_exit: ExitSink = {
            let tx = self.tx.clone();
            let sessions = self.sessions.clone();
            let info = info.clone();
            let terminated = terminated.clone();
            Arc::new(move || announce_terminated(&tx, &sessions, &info, &terminated))
        };

        let process = (self.factory)(cwd, on_event, on_exit)?;
        if let Err(err) = self.handshake(&process, &config, &initialized).await {
            // Silence the exit notification for a session nobody saw start.
            terminated.store(true, Ordering::SeqCst);
            process.shutdown().await;
            return Err(err);
        }

        let hosted = Arc::new(HostedSession {
            info: info.clone(),
            process,
            terminated,
        });
        lock(&self.sessions).insert(info.id.clone(), hosted);
        tracing::info!(session_id = %info.id, name = %info.name, "Debug session started");
        let _ = self.tx.send(HostNotification::SessionStarted(info));
        Ok(true)
    }

    async fn stop_debugging(&self, session: &HostSession) -> Result<()> {
        let Ok(hosted) = self.find(session) else {
            return Ok(());
        };
        hosted.process.shutdown().await;
        announce_terminated(&self.tx, &self.sessions, &hosted.info, &hosted.terminated);
        Ok(())
    }

    async fn custom_request(
        &self,
        session: &HostSession,
        command: &str,
        args: Option<Value>,
    ) -> Result<Value> {
        let hosted = self.find(session)?;
        let response = hosted
            .process
            .request(command, args, self.request_timeout)
            .await?;
        Ok(response.get("body").cloned().unwrap_or(Value::Null))
    }
}

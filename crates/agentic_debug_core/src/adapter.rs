//! Headless backend: talks to the debug adapter directly, with no host UI.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::{
    sync::{oneshot, Mutex as AsyncMutex},
    time::sleep,
};

use crate::{
    backend::{BackendStatus, DebugBackend},
    config::DEBUG_TYPE,
    events::EventRegistry,
    lock,
    protocol::{ProtocolEvent, ProtocolResponse},
    transport::{
        check_response, command_factory, initialize_arguments, AdapterCommand, AdapterProcess,
        ExitSink, MessageSink, ProcessFactory,
    },
    BridgeError, Result,
};

type DeferredResponse = (u64, oneshot::Receiver<Value>);

pub struct AdapterClient {
    factory: ProcessFactory,
    request_timeout: Duration,
    events: EventRegistry,
    process: Mutex<Option<Arc<AdapterProcess>>>,
    deferred_launch: AsyncMutex<Option<DeferredResponse>>,
    alive: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
}

impl AdapterClient {
    pub fn new(command: AdapterCommand, request_timeout: Duration) -> Self {
        Self::with_factory(command_factory(command), request_timeout)
    }

    pub fn with_factory(factory: ProcessFactory, request_timeout: Duration) -> Self {
        Self {
            factory,
            request_timeout,
            events: EventRegistry::new(),
            process: Mutex::new(None),
            deferred_launch: AsyncMutex::new(None),
            alive: Arc::new(AtomicBool::new(false)),
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    fn current_process(&self) -> Result<Arc<AdapterProcess>> {
        lock(&self.process).clone().ok_or(BridgeError::NoSession)
    }

    fn ensure_process(&self) -> Result<Arc<AdapterProcess>> {
        let mut slot = lock(&self.process);
        if let Some(process) = slot.as_ref().filter(|p| p.is_running()) {
            return Ok(process.clone());
        }

        self.alive.store(true, Ordering::SeqCst);
        self.terminated.store(false, Ordering::SeqCst);

        let on_event: MessageSink = {
            let events = self.events.clone();
            let alive = self.alive.clone();
            let terminated = self.terminated.clone();
            Arc::new(move |message: Value| {
                let event: ProtocolEvent = match serde_json::from_value(message) {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "Malformed event from adapter");
                        return;
                    }
                };
                if event.event == "terminated" {
                    if terminated.swap(true, Ordering::SeqCst) {
                        return;
                    }
                    alive.store(false, Ordering::SeqCst);
                }
                events.dispatch(&event);
            })
        };

        let on_exit: ExitSink = {
            let events = self.events.clone();
            let alive = self.alive.clone();
            let terminated = self.terminated.clone();
            Arc::new(move || {
                alive.store(false, Ordering::SeqCst);
                if !terminated.swap(true, Ordering::SeqCst) {
                    events.dispatch(&ProtocolEvent::new(
                        0,
                        "terminated",
                        json!({ "reason": "adapter exited" }),
                    ));
                }
            })
        };

        let process = Arc::new((self.factory)(None, on_event, on_exit)?);
        *slot = Some(process.clone());
        Ok(process)
    }
}

fn into_response(command: &str, value: Value) -> Result<ProtocolResponse> {
    let value = check_response(command, value)?;
    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl DebugBackend for AdapterClient {
    async fn initialize(&self) -> Result<ProtocolResponse> {
        let process = self.ensure_process()?;
        let response = process
            .request(
                "initialize",
                Some(initialize_arguments(DEBUG_TYPE)),
                self.request_timeout,
            )
            .await?;
        into_response("initialize", response)
    }

    /// Some adapters answer `launch` only after `configurationDone`. When
    /// `initialized` arrives first, the launch response is awaited later by
    /// [`DebugBackend::configuration_done`].
    async fn launch(&self, args: Value) -> Result<ProtocolResponse> {
        let process = self.current_process()?;

        let (init_tx, init_rx) = oneshot::channel::<()>();
        let init_tx = Mutex::new(Some(init_tx));
        let subscription = self.events.on(
            "initialized",
            Arc::new(move |_event: &ProtocolEvent| {
                if let Some(tx) = lock(&init_tx).take() {
                    let _ = tx.send(());
                }
            }),
        );

        let (seq, mut response_rx) = match process.begin_request("launch", Some(args)).await {
            Ok(started) => started,
            Err(err) => {
                subscription.dispose();
                return Err(err);
            }
        };

        let outcome = tokio::select! {
            response = &mut response_rx => Some(response),
            _ = init_rx => None,
            _ = sleep(self.request_timeout) => {
                subscription.dispose();
                return Err(BridgeError::timeout("response to 'launch'", self.request_timeout));
            }
        };
        subscription.dispose();

        match outcome {
            Some(Ok(value)) => into_response("launch", value),
            Some(Err(_)) => Err(BridgeError::Adapter(
                "debug adapter exited while waiting for 'launch'".to_string(),
            )),
            None => {
                *self.deferred_launch.lock().await = Some((seq, response_rx));
                Ok(ProtocolResponse::success(0, seq, "launch", None))
            }
        }
    }

    async fn configuration_done(&self) -> Result<ProtocolResponse> {
        let process = self.current_process()?;
        let response = process
            .request("configurationDone", None, self.request_timeout)
            .await?;

        let deferred = self.deferred_launch.lock().await.take();
        if let Some((seq, rx)) = deferred {
            process
                .await_response("launch", seq, rx, self.request_timeout)
                .await?;
        }

        into_response("configurationDone", response)
    }

    async fn send_request(&self, command: &str, args: Option<Value>) -> Result<ProtocolResponse> {
        let process = self.current_process()?;
        let response = process.request(command, args, self.request_timeout).await?;
        into_response(command, response)
    }

    async fn disconnect(&self) -> Result<()> {
        let process = lock(&self.process).take();
        let Some(process) = process else {
            return Ok(());
        };

        self.alive.store(false, Ordering::SeqCst);
        process.shutdown().await;
        self.deferred_launch.lock().await.take();

        if !self.terminated.swap(true, Ordering::SeqCst) {
            self.events
                .dispatch(&ProtocolEvent::new(0, "terminated", json!({})));
        }
        Ok(())
    }

    fn events(&self) -> &EventRegistry {
        &self.events
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn status(&self) -> BackendStatus {
        let process = lock(&self.process).clone();
        BackendStatus {
            alive: self.is_alive(),
            pid: process.as_ref().and_then(|p| p.pid()),
            exit_code: process.as_ref().and_then(|p| p.exit_code()),
            session_id: None,
        }
    }

    fn seq(&self) -> u64 {
        lock(&self.process)
            .as_ref()
            .map(|p| p.last_seq())
            .unwrap_or(0)
    }
}

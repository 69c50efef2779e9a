//! Singleton session controller.
//!
//! [`SessionController`] holds at most one [`SessionSlot`]. A new `launch`
//! tears down whatever is held before building a fresh backend, path mapper,
//! ledger and session, so callers never have to check for an existing session.

use std::{sync::Arc, time::Duration};

use serde::Serialize;

use crate::{
    adapter::AdapterClient,
    backend::{BackendStatus, DebugBackend},
    bridge::ProtocolBridge,
    config::{BackendMode, BridgeOptions, ConfigResolver, LaunchParams, ResolvedConfig},
    host::DebugHost,
    ledger::{BreakpointLedger, ForwardingLedger},
    notify::NotificationSink,
    path_map::{PathMapper, PrefixPathMapper},
    session::{DebugSession, SessionHandle, SessionState, StopInfo},
    transport::AdapterCommand,
    BridgeError, Result,
};

/// Builds the collaborators for one launch.
pub trait SessionFactory: Send + Sync {
    fn create_backend(&self, config: &ResolvedConfig, mode: BackendMode) -> Result<Arc<dyn DebugBackend>>;

    fn create_path_mapper(&self, config: &ResolvedConfig) -> Arc<dyn PathMapper> {
        Arc::new(PrefixPathMapper::from_config(&config.path_mappings))
    }

    fn create_ledger(
        &self,
        backend: Arc<dyn DebugBackend>,
        mapper: Arc<dyn PathMapper>,
    ) -> Arc<dyn BreakpointLedger> {
        Arc::new(ForwardingLedger::new(backend, mapper))
    }

    fn create_session(
        &self,
        config: ResolvedConfig,
        backend: Arc<dyn DebugBackend>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Arc<dyn SessionHandle>;
}

/// Production wiring: host UI bridge or headless adapter client.
pub struct DefaultSessionFactory {
    host: Arc<dyn DebugHost>,
    options: BridgeOptions,
    request_timeout: Duration,
}

impl DefaultSessionFactory {
    pub fn new(host: Arc<dyn DebugHost>, options: BridgeOptions, request_timeout: Duration) -> Self {
        Self {
            host,
            options,
            request_timeout,
        }
    }
}

impl SessionFactory for DefaultSessionFactory {
    fn create_backend(&self, config: &ResolvedConfig, mode: BackendMode) -> Result<Arc<dyn DebugBackend>> {
        let backend: Arc<dyn DebugBackend> = match mode {
            BackendMode::Ui => Arc::new(ProtocolBridge::new(self.host.clone(), self.options.clone())),
            BackendMode::Headless => {
                let mut command = AdapterCommand::node(&config.adapter_path);
                if let Some(folder) = &self.options.workspace_folder {
                    command = command.with_cwd(folder);
                }
                Arc::new(AdapterClient::new(command, self.request_timeout))
            }
        };
        Ok(backend)
    }

    fn create_session(
        &self,
        config: ResolvedConfig,
        backend: Arc<dyn DebugBackend>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Arc<dyn SessionHandle> {
        Arc::new(DebugSession::new(config, backend, notifier))
    }
}

/// Everything that lives and dies with one launch.
#[derive(Clone)]
pub struct SessionSlot {
    pub session: Arc<dyn SessionHandle>,
    pub backend: Arc<dyn DebugBackend>,
    pub ledger: Arc<dyn BreakpointLedger>,
    pub path_mapper: Arc<dyn PathMapper>,
    pub mode: BackendMode,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerStatus {
    pub state: SessionState,
    pub session_id: Option<String>,
    pub mode: Option<BackendMode>,
    pub stop_info: Option<StopInfo>,
    pub backend: Option<BackendStatus>,
    pub guidance: &'static str,
}

pub struct SessionController {
    resolver: ConfigResolver,
    factory: Arc<dyn SessionFactory>,
    notifier: Arc<dyn NotificationSink>,
    slot: Option<SessionSlot>,
}

impl SessionController {
    pub fn new(
        resolver: ConfigResolver,
        factory: Arc<dyn SessionFactory>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            resolver,
            factory,
            notifier,
            slot: None,
        }
    }

    /// Replaces any held session with a freshly launched one.
    ///
    /// The new session stays held even if `begin` fails, so its state can be
    /// inspected and a later `terminate` cleans it up.
    pub async fn launch(&mut self, params: &LaunchParams) -> Result<()> {
        if self.slot.is_some() {
            if let Err(err) = self.terminate().await {
                tracing::warn!(error = %err, "Previous session did not terminate cleanly");
            }
        }

        let config = self.resolver.resolve(params)?;
        let mode = params.backend_mode();
        let backend = self.factory.create_backend(&config, mode)?;
        let path_mapper = self.factory.create_path_mapper(&config);
        let ledger = self.factory.create_ledger(backend.clone(), path_mapper.clone());
        let session = self
            .factory
            .create_session(config, backend.clone(), self.notifier.clone());

        tracing::info!(session_id = session.id(), ?mode, "Launching debug session");
        self.slot = Some(SessionSlot {
            session: session.clone(),
            backend,
            ledger,
            path_mapper,
            mode,
        });

        session.begin().await
    }

    /// Terminates the held session. The slot is cleared whatever the outcome.
    pub async fn terminate(&mut self) -> Result<()> {
        let slot = self.slot.take().ok_or(BridgeError::NotStarted)?;
        tracing::info!(session_id = slot.session.id(), "Terminating debug session");
        slot.session.terminate().await
    }

    pub fn slot(&self) -> Option<&SessionSlot> {
        self.slot.as_ref()
    }

    pub fn session(&self) -> Option<Arc<dyn SessionHandle>> {
        self.slot.as_ref().map(|s| s.session.clone())
    }

    pub fn backend(&self) -> Option<Arc<dyn DebugBackend>> {
        self.slot.as_ref().map(|s| s.backend.clone())
    }

    pub fn ledger(&self) -> Option<Arc<dyn BreakpointLedger>> {
        self.slot.as_ref().map(|s| s.ledger.clone())
    }

    pub fn path_mapper(&self) -> Option<Arc<dyn PathMapper>> {
        self.slot.as_ref().map(|s| s.path_mapper.clone())
    }

    pub fn status(&self) -> ControllerStatus {
        let state = self
            .slot
            .as_ref()
            .map(|s| s.session.state())
            .unwrap_or_default();
        ControllerStatus {
            state,
            session_id: self.slot.as_ref().map(|s| s.session.id().to_string()),
            mode: self.slot.as_ref().map(|s| s.mode),
            stop_info: self.slot.as_ref().and_then(|s| s.session.stop_info()),
            backend: self.slot.as_ref().map(|s| s.backend.status()),
            guidance: state.guidance(),
        }
    }
}

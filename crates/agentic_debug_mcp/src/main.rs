use std::{path::PathBuf, sync::Arc, time::Duration};

use agentic_debug_core::{
    config::{ExtensionAdapterLocator, JsonSettings, LaunchFile},
    notify::TracingNotifier,
    process_host::ProcessHost,
    BackendMode, BridgeOptions, ConfigResolver, DefaultSessionFactory, SessionController,
};
use rmcp::{transport, ServiceExt};
use tracing_subscriber::EnvFilter;

mod server;

use server::AgenticDebugServer;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Process-level settings read once at startup.
#[derive(Debug, Clone)]
struct ServerConfig {
    bridge: BridgeOptions,
    default_mode: BackendMode,
    request_timeout: Duration,
}

impl ServerConfig {
    fn from_env() -> Self {
        let default_mode = match std::env::var("AGENTIC_DEBUG_BACKEND").as_deref() {
            Ok("headless") => BackendMode::Headless,
            _ => BackendMode::Ui,
        };
        let request_timeout = std::env::var("AGENTIC_DEBUG_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        Self {
            bridge: BridgeOptions::from_env(),
            default_mode,
            request_timeout,
        }
    }

    fn workspace(&self) -> PathBuf {
        self.bridge
            .workspace_folder
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

fn build_server(config: ServerConfig) -> AgenticDebugServer {
    let workspace = config.workspace();
    let locator = Arc::new(ExtensionAdapterLocator::from_env());
    let resolver = ConfigResolver::new(
        Arc::new(JsonSettings::discover(&workspace)),
        Arc::new(LaunchFile::in_workspace(&workspace)),
        locator.clone(),
    );

    let host = Arc::new(ProcessHost::new(locator, config.request_timeout));
    let factory = Arc::new(DefaultSessionFactory::new(
        host,
        config.bridge.clone(),
        config.request_timeout,
    ));
    let notifier = Arc::new(TracingNotifier::new());
    let controller = SessionController::new(resolver, factory, notifier.clone());

    AgenticDebugServer::new(controller, notifier, config.default_mode)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries the MCP transport.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let config = ServerConfig::from_env();
    tracing::info!(
        workspace = %config.workspace().display(),
        mode = ?config.default_mode,
        "Starting Agentic Debug MCP Server on stdio..."
    );

    let server = build_server(config);
    server.serve(transport::stdio()).await?.waiting().await?;

    Ok(())
}

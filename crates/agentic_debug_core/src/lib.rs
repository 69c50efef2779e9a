//! Agentic Debug Core
//!
//! Session lifecycle bridge that lets an agent drive a PHP/Xdebug debug session
//! while a human watches the same session in the host editor's debug UI.
//! Provides configuration resolution, a protocol bridge over the host's debug
//! API, a headless adapter client, the session state machine and the singleton
//! session controller that wires them together.

pub mod adapter;
pub mod backend;
pub mod bridge;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod host;
pub mod ledger;
pub mod notify;
pub mod path_map;
pub mod probe;
pub mod process_host;
pub mod protocol;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use backend::{BackendStatus, DebugBackend};
pub use bridge::ProtocolBridge;
pub use config::{BackendMode, BridgeOptions, ConfigResolver, LaunchParams, ResolvedConfig};
pub use controller::{DefaultSessionFactory, SessionController, SessionFactory};
pub use error::BridgeError;
pub use session::{DebugSession, SessionHandle, SessionState, StopInfo};

/// Result type alias using BridgeError
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Locks a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

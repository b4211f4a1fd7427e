//! WebSocket transport for live voice sessions.
//!
//! One connection is one session: the client streams 20ms PCM16 frames as
//! binary messages, and receives the session's event stream as JSON text
//! messages plus synthesized reply audio as binary messages. The crate also
//! wires configuration into a running [`SessionManager`](switchboard_orchestrator::SessionManager)
//! and keeps the agent scenario hot-reloadable from disk.

pub mod bootstrap;
pub mod connection;
pub mod hot_reload;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod server;

pub use bootstrap::build_manager;
pub use hot_reload::ScenarioWatcher;
pub use server::{AppState, router, start_server};

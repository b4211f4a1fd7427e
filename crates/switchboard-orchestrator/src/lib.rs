//! Conversation orchestration for Switchboard.
//!
//! [`SessionOrchestrator`] runs the per-utterance agent loop: model
//! calls, tool execution, and agent switches. [`SessionManager`] owns
//! the set of live sessions, wiring each one's speech pipeline to its
//! orchestrator task and retiring idle calls.

pub mod manager;
pub mod orchestrator;

pub use manager::{ManagerSettings, OpenSession, SessionManager};
pub use orchestrator::{SessionOrchestrator, TurnSettings};

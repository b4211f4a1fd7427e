//! Core types, config, errors, and session model for Switchboard.

pub mod config;
pub mod error;
pub mod events;
pub mod scenario;
pub mod session;
pub mod store;

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwitchboardError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Scenario error: {0}")]
    Scenario(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("pool exhausted: no {kind} resource available within {waited:?}")]
    PoolExhausted { kind: String, waited: Duration },

    #[error("handoff unresolved: no route for trigger '{0}'")]
    HandoffUnresolved(String),

    #[error("upstream {service} error: {message}")]
    UpstreamServiceError { service: String, message: String },

    #[error("state store unavailable: {0}")]
    StateStoreUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SwitchboardError {
    /// Short stable label for logs and event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Scenario(_) => "scenario",
            Self::Session(_) => "session",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::HandoffUnresolved(_) => "handoff_unresolved",
            Self::UpstreamServiceError { .. } => "upstream_service_error",
            Self::StateStoreUnavailable(_) => "state_store_unavailable",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, SwitchboardError>;

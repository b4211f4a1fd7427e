//! Session events: the ordered per-session stream consumed by transports.

use serde::{Deserialize, Serialize};

use crate::session::{HandoffKind, Usage};

/// Events emitted by the orchestrator during a session.
///
/// Delivered over a per-session channel in emission order; transports
/// may fan them out to any number of observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    /// The active agent changed.
    #[serde(rename = "agent_switched")]
    AgentSwitched {
        from: String,
        to: String,
        kind: HandoffKind,
    },

    /// A caller utterance was transcribed.
    #[serde(rename = "utterance_transcribed")]
    UtteranceTranscribed { text: String, is_final: bool },

    /// Finalized response text for the current turn.
    #[serde(rename = "response_text")]
    ResponseText { agent: String, text: String },

    /// A tool was invoked; `error` is set when execution failed.
    #[serde(rename = "tool_invoked")]
    ToolInvoked {
        name: String,
        args: serde_json::Value,
        result: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Token usage summary for an agent leaving the session (audit).
    #[serde(rename = "agent_usage")]
    AgentUsage { agent: String, usage: Usage },

    /// Caller interrupted synthesis; output was cancelled.
    #[serde(rename = "barge_in")]
    BargeIn,

    /// The session ended.
    #[serde(rename = "session_closed")]
    SessionClosed { reason: String },
}

//! Session model: per-call state, transcript storage, and handoff records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the caller reached us.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    Telephony,
    Browser,
}

/// Whether the receiving agent announces itself after a handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffKind {
    /// Target agent greets the caller before continuing.
    Announced,
    /// Target agent continues the turn as if it had always been active.
    Discrete,
}

/// A handoff attempt in flight. Constructed when a trigger fires, consumed
/// by the orchestrator's switch routine, then folded into
/// [`Session::pending_handoff`] for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffContext {
    pub source_agent: String,
    pub target_agent: String,
    pub reason: String,
    pub user_last_utterance: Option<String>,
    #[serde(default)]
    pub context_data: HashMap<String, serde_json::Value>,
    pub kind: HandoffKind,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of attempting a handoff. A pure value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandoffResult {
    pub fn ok(target: impl Into<String>, message: Option<String>) -> Self {
        Self {
            success: true,
            target_agent: Some(target.into()),
            message,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            target_agent: None,
            message: None,
            error: Some(error.into()),
        }
    }

    /// One-sentence rendering of the outcome, used verbatim as the
    /// handoff tool's result content.
    pub fn describe(&self) -> String {
        if self.success {
            let target = self.target_agent.as_deref().unwrap_or("the next agent");
            match &self.message {
                Some(message) => format!("Transferred to {target}. {message}"),
                None => format!("Transferred to {target}."),
            }
        } else {
            self.error.clone().unwrap_or_else(|| "Transfer failed.".to_string())
        }
    }
}

/// One active call. Owned exclusively by the orchestrator for the session's
/// lifetime and persisted at every mutation boundary (turn end, handoff).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub transport: TransportType,
    pub active_agent: String,
    /// Append-only, insertion-ordered, no duplicates.
    pub visited_agents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_handoff: Option<HandoffContext>,
    /// Opaque key/value bag; watched by state-based handoff routing.
    #[serde(default)]
    pub context_data: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub history: Vec<TranscriptEntry>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    /// Create a fresh session with a generated id.
    pub fn new(transport: TransportType, start_agent: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), transport, start_agent)
    }

    /// Create a session with a transport-supplied id (e.g. a telephony call id).
    pub fn with_id(
        session_id: impl Into<String>,
        transport: TransportType,
        start_agent: impl Into<String>,
    ) -> Self {
        let start_agent = start_agent.into();
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            transport,
            active_agent: start_agent.clone(),
            visited_agents: vec![start_agent],
            pending_handoff: None,
            context_data: HashMap::new(),
            history: Vec::new(),
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Record a visit to `agent`. Returns `true` if this is the first visit.
    pub fn visit(&mut self, agent: &str) -> bool {
        if self.visited_agents.iter().any(|a| a == agent) {
            return false;
        }
        self.visited_agents.push(agent.to_string());
        true
    }

    pub fn has_visited(&self, agent: &str) -> bool {
        self.visited_agents.iter().any(|a| a == agent)
    }

    pub fn append(&mut self, entry: TranscriptEntry) {
        self.history.push(entry);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Most recent user utterance, if any.
    pub fn last_user_text(&self) -> Option<&str> {
        self.history.iter().rev().find_map(|e| match e {
            TranscriptEntry::User { text, .. } => Some(text.as_str()),
            _ => None,
        })
    }

    pub fn idle_for(&self) -> chrono::Duration {
        Utc::now() - self.last_activity_at
    }
}

/// A single entry in the session transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TranscriptEntry {
    #[serde(rename = "user")]
    User { text: String, timestamp: DateTime<Utc> },
    #[serde(rename = "assistant")]
    Assistant {
        /// Agent that produced this response.
        agent: String,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "tool_call")]
    ToolCall {
        id: String,
        tool: String,
        params: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        tool: String,
        content: String,
        is_error: bool,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "system")]
    System {
        event: String,
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
}

impl TranscriptEntry {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(agent: impl Into<String>, text: impl Into<String>, usage: Option<Usage>) -> Self {
        Self::Assistant {
            agent: agent.into(),
            text: text.into(),
            usage,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

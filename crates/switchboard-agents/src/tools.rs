//! Tools exposed to agents during conversation turns.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use switchboard_providers::ToolDefinition;

/// Read-only view handed to a tool while it runs.
pub struct ToolContext {
    pub session_id: String,
    /// Agent on whose behalf the tool is executing.
    pub agent: String,
    /// Snapshot of the session's context data at invocation time.
    pub context_data: HashMap<String, serde_json::Value>,
}

/// Result of a tool execution.
///
/// `state_updates` is how a tool mutates session state: the orchestrator
/// applies the entries to the session's context data after the call,
/// which is also what arms state-based handoffs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub state_updates: HashMap<String, serde_json::Value>,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            state_updates: HashMap::new(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
            state_updates: HashMap::new(),
        }
    }

    pub fn with_state(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.state_updates.insert(key.into(), value);
        self
    }
}

/// A capability an agent can invoke mid-turn.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name as exposed to the LLM (e.g. "lookup_balance").
    fn name(&self) -> &str;

    /// Human-readable description for the LLM.
    fn description(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(
        &self,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput>;
}

/// Registry of available tools, filtered per agent by capability set.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Tool definitions for the subset of tools named in `capabilities`,
    /// in registration order.
    pub fn definitions_for(&self, capabilities: &[String]) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .filter(|t| capabilities.iter().any(|c| c == t.name()))
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters_schema: t.parameters_schema(),
            })
            .collect()
    }
}

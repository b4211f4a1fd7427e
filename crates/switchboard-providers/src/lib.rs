//! LLM client abstraction for conversation turns.
//!
//! Voice turns need the whole reply before synthesis starts, so the
//! interface is a single non-streamed completion per call: history and
//! tool definitions in, text plus requested tool calls out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use switchboard_core::error::Result;
use switchboard_core::session::{TranscriptEntry, Usage};

pub mod openai;
pub mod retry;

pub use openai::OpenAiCompatClient;
pub use retry::RetryClient;

/// A tool surfaced to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters_schema: serde_json::Value,
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A finished completion for one turn.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Usage,
}

impl Completion {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Everything a client needs for one turn. The client owns the mapping
/// from transcript entries to its wire format.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    pub history: Vec<TranscriptEntry>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider identifier, e.g. "openai" or "ollama".
    fn id(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
}

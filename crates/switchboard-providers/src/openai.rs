//! OpenAI-compatible chat-completions client. Also covers OpenRouter and
//! Ollama, which differ only in base URL and auth headers.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use switchboard_core::config::LlmConfig;
use switchboard_core::error::{Result, SwitchboardError};
use switchboard_core::session::{TranscriptEntry, Usage};

use crate::{Completion, CompletionRequest, LlmClient, ToolCallRequest, ToolDefinition};

/// Wire-level differences between OpenAI-compatible providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStyle {
    OpenAi,
    OpenRouter,
    Ollama,
}

impl ApiStyle {
    pub fn from_provider(provider: &str) -> Self {
        match provider {
            "openrouter" => Self::OpenRouter,
            "ollama" => Self::Ollama,
            _ => Self::OpenAi,
        }
    }
}

/// Default base URL for a provider id.
pub fn base_url_for(provider: &str) -> &'static str {
    match provider {
        "openrouter" => "https://openrouter.ai/api",
        "ollama" => "http://localhost:11434",
        _ => "https://api.openai.com",
    }
}

#[derive(Debug)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    id: String,
    base_url: String,
    api_key: Option<String>,
    style: ApiStyle,
    timeout: Duration,
}

impl OpenAiCompatClient {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        style: ApiStyle,
        timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            id: id.into(),
            base_url: base_url.into(),
            api_key,
            style,
            timeout,
        }
    }

    pub fn from_config(config: &LlmConfig, timeout: Duration) -> Result<Self> {
        let style = ApiStyle::from_provider(&config.provider);
        let api_key = config.resolve_api_key();
        if api_key.is_none() && style != ApiStyle::Ollama {
            return Err(SwitchboardError::Config(format!(
                "No API key configured for LLM provider '{}'",
                config.provider
            )));
        }
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| base_url_for(&config.provider).to_string());
        Ok(Self::new(
            config.provider.clone(),
            base_url,
            api_key,
            style,
            timeout,
        ))
    }

    /// Map tool definitions to the `function` tool format.
    pub fn format_tools(tools: &[ToolDefinition]) -> Vec<Value> {
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters_schema,
                    }
                })
            })
            .collect()
    }

    /// Map the transcript to chat messages. Consecutive tool-call entries
    /// fold into one assistant message, as the API expects; internal
    /// system markers are not replayed to the model.
    pub fn format_messages(system: &str, history: &[TranscriptEntry]) -> Vec<Value> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if !system.is_empty() {
            messages.push(json!({ "role": "system", "content": system }));
        }

        let mut pending_tool_calls: Vec<Value> = Vec::new();
        for entry in history {
            if !matches!(entry, TranscriptEntry::ToolCall { .. })
                && !pending_tool_calls.is_empty()
            {
                messages.push(json!({
                    "role": "assistant",
                    "tool_calls": std::mem::take(&mut pending_tool_calls),
                }));
            }
            match entry {
                TranscriptEntry::User { text, .. } => {
                    messages.push(json!({ "role": "user", "content": text }));
                }
                TranscriptEntry::Assistant { text, .. } => {
                    if !text.is_empty() {
                        messages.push(json!({ "role": "assistant", "content": text }));
                    }
                }
                TranscriptEntry::ToolCall {
                    id, tool, params, ..
                } => {
                    pending_tool_calls.push(json!({
                        "id": id,
                        "type": "function",
                        "function": {
                            "name": tool,
                            "arguments": params.to_string(),
                        }
                    }));
                }
                TranscriptEntry::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => {
                    messages.push(json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": content,
                    }));
                }
                TranscriptEntry::System { .. } => {}
            }
        }
        if !pending_tool_calls.is_empty() {
            messages.push(json!({
                "role": "assistant",
                "tool_calls": pending_tool_calls,
            }));
        }

        messages
    }

    fn upstream(&self, message: impl Into<String>) -> SwitchboardError {
        SwitchboardError::UpstreamServiceError {
            service: self.id.clone(),
            message: message.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Value>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Deserialize)]
struct ApiFunction {
    name: String,
    /// JSON-encoded argument object, per the chat-completions format.
    arguments: String,
}

#[derive(Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(Self::format_tools(&request.tools))
        };
        let body = ChatRequest {
            model: &request.model,
            messages: Self::format_messages(&request.system, &request.history),
            max_tokens: request.max_tokens,
            stream: false,
            temperature: request.temperature,
            tools,
        };

        debug!(
            provider = %self.id,
            model = %request.model,
            messages = body.messages.len(),
            "Requesting completion"
        );

        let mut builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json")
            .timeout(self.timeout);
        if let Some(key) = &self.api_key {
            builder = builder.header("authorization", format!("Bearer {key}"));
        }
        if self.style == ApiStyle::OpenRouter {
            builder = builder.header("HTTP-Referer", "https://github.com/switchboard");
        }

        let resp = builder
            .json(&body)
            .send()
            .await
            .map_err(|e| self.upstream(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(self.upstream(format!("chat API returned {status}: {text}")));
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| self.upstream(format!("malformed completion response: {e}")))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| self.upstream("completion response had no choices"))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| {
                let arguments = serde_json::from_str(&call.function.arguments)
                    .unwrap_or_else(|e| {
                        warn!(
                            tool = %call.function.name,
                            error = %e,
                            "Unparseable tool arguments; substituting empty object"
                        );
                        json!({})
                    });
                ToolCallRequest {
                    id: call.id,
                    name: call.function.name,
                    arguments,
                }
            })
            .collect();

        Ok(Completion {
            text: choice.message.content.unwrap_or_default(),
            tool_calls,
            usage: parsed
                .usage
                .map(|u| Usage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                })
                .unwrap_or_default(),
        })
    }
}

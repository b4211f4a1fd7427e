//! Turn orchestration: consume finalized utterances, drive the LLM/tool
//! loop for the active agent, and execute agent switches.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use switchboard_agents::{
    AgentRegistry, AgentSpec, HandoffRoute, HandoffSignal, ToolContext, ToolOutput, ToolRegistry,
};
use switchboard_core::config::Config;
use switchboard_core::error::{Result, SwitchboardError};
use switchboard_core::events::SessionEvent;
use switchboard_core::session::{
    HandoffContext, HandoffKind, HandoffResult, Session, TranscriptEntry, Usage,
};
use switchboard_core::store::SessionStateStore;
use switchboard_media::Speaker;
use switchboard_providers::{CompletionRequest, LlmClient, ToolCallRequest};

/// Transcript marker recording an agent switch.
const AGENT_SWITCHED_EVENT: &str = "agent_switched";

/// Transcript marker after which prior history is hidden from the model.
/// Written by switches whose route withholds context from the target.
const CONTEXT_BOUNDARY_EVENT: &str = "context_boundary";

/// Spoken when the model is unreachable after the retry.
const APOLOGY: &str =
    "I'm sorry, I'm having trouble on my end right now. Could you say that again in a moment?";

/// Spoken when an agent burns through its tool budget without answering.
const TOOL_BUDGET_REPLY: &str = "Let me stop there for a moment. What would you like me to do?";

/// Per-turn model knobs, resolved once at session start. Agents may
/// override the model per [`AgentSpec::model`].
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub max_tool_iterations: u32,
}

impl TurnSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.llm_model(),
            max_tokens: config.llm_max_tokens(),
            temperature: config.llm_temperature(),
            max_tool_iterations: config.max_tool_iterations(),
        }
    }
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What the rest of the turn does after a batch of tool calls.
enum ToolFlow {
    /// Results are in the transcript; call the model again.
    Continue,
    /// The turn is over, nothing further goes to the model.
    Done,
}

/// A switch decided while working through a batch of tool calls. The
/// switch itself runs only after every call in the batch has a result,
/// so the transcript never interleaves a greeting between results.
struct PendingSwitch {
    route: HandoffRoute,
    reason: Option<String>,
    origin: SwitchOrigin,
}

#[derive(Clone, Copy, PartialEq)]
enum SwitchOrigin {
    /// The model called a handoff tool; its result goes back to the
    /// model, so the loop continues under the target agent.
    Tool,
    /// A tool mutated the watched state key; the turn ends on switch.
    State,
}

/// Drives one session's conversation. Owns the [`Session`] for its
/// lifetime, processes one utterance at a time, and persists at every
/// mutation boundary (turn end, agent switch).
pub struct SessionOrchestrator {
    session: Session,
    registry: Arc<AgentRegistry>,
    tools: Arc<ToolRegistry>,
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn SessionStateStore>,
    /// Outbound voice. `None` for text-only harnesses.
    speaker: Option<Arc<Speaker>>,
    events: mpsc::Sender<SessionEvent>,
    settings: TurnSettings,
    /// Running token totals per agent, reported when an agent hands off.
    usage_by_agent: HashMap<String, Usage>,
}

impl SessionOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Session,
        registry: Arc<AgentRegistry>,
        tools: Arc<ToolRegistry>,
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn SessionStateStore>,
        speaker: Option<Arc<Speaker>>,
        events: mpsc::Sender<SessionEvent>,
        settings: TurnSettings,
    ) -> Self {
        Self {
            session,
            registry,
            tools,
            llm,
            store,
            speaker,
            events,
            settings,
            usage_by_agent: HashMap::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Greet the caller on a brand-new session. Resumed sessions already
    /// have history and get no fresh greeting.
    pub async fn open(&mut self) {
        if !self.session.history.is_empty() {
            return;
        }
        let Some(agent) = self.registry.get(&self.session.active_agent) else {
            warn!(
                session = %self.session.session_id,
                agent = %self.session.active_agent,
                "Active agent is not in the scenario; skipping greeting"
            );
            return;
        };
        let greeting = agent.greeting.clone();
        self.say(&agent, greeting, None).await;
        self.persist().await;
    }

    /// Run one turn for a finalized utterance. Never fails the session:
    /// upstream errors degrade to a spoken apology on the same agent.
    pub async fn process_turn(&mut self, transcript: &str) {
        if transcript.trim().is_empty() {
            debug!(session = %self.session.session_id, "Ignoring empty utterance");
            return;
        }
        info!(
            session = %self.session.session_id,
            agent = %self.session.active_agent,
            chars = transcript.len(),
            "Turn started"
        );
        self.emit(SessionEvent::UtteranceTranscribed {
            text: transcript.to_string(),
            is_final: true,
        })
        .await;
        self.session.append(TranscriptEntry::user(transcript));

        if let Err(e) = self.run_agent_loop().await {
            warn!(
                session = %self.session.session_id,
                agent = %self.session.active_agent,
                kind = e.kind(),
                error = %e,
                "Turn failed; apologizing and staying on the current agent"
            );
            match self.registry.get(&self.session.active_agent) {
                Some(agent) => self.say(&agent, APOLOGY.to_string(), None).await,
                None => {
                    self.emit(SessionEvent::ResponseText {
                        agent: self.session.active_agent.clone(),
                        text: APOLOGY.to_string(),
                    })
                    .await;
                }
            }
        }
        self.persist().await;
    }

    /// Forward a partial transcript to the event stream.
    pub async fn note_partial(&self, text: String) {
        self.emit(SessionEvent::UtteranceTranscribed {
            text,
            is_final: false,
        })
        .await;
    }

    /// Record a barge-in. The pipeline has already cancelled playback.
    pub async fn note_barge_in(&mut self) {
        self.session.touch();
        self.emit(SessionEvent::BargeIn).await;
    }

    /// Final persistence plus the closed event. Called once when the
    /// session's pipeline shuts down.
    pub async fn finish(&mut self, reason: &str) {
        self.session.touch();
        self.persist().await;
        self.emit(SessionEvent::SessionClosed {
            reason: reason.to_string(),
        })
        .await;
        info!(session = %self.session.session_id, reason, "Session finished");
    }

    /// The agent loop: call the model, work through its tool calls,
    /// repeat until it answers in plain text or the budget runs out.
    async fn run_agent_loop(&mut self) -> Result<()> {
        for iteration in 0..self.settings.max_tool_iterations {
            let Some(agent) = self.registry.get(&self.session.active_agent) else {
                return Err(SwitchboardError::Session(format!(
                    "active agent '{}' is not in scenario '{}'",
                    self.session.active_agent,
                    self.registry.scenario_name()
                )));
            };
            debug!(
                session = %self.session.session_id,
                agent = %agent.name,
                iteration,
                "Agent loop iteration"
            );

            let request = self.build_request(&agent);
            let completion = self.llm.complete(&request).await?;
            self.usage_by_agent
                .entry(agent.name.clone())
                .or_default()
                .add(&completion.usage);

            if !completion.has_tool_calls() {
                self.say(&agent, completion.text, Some(completion.usage))
                    .await;
                info!(
                    session = %self.session.session_id,
                    agent = %agent.name,
                    iterations = iteration + 1,
                    "Turn complete"
                );
                return Ok(());
            }

            // Text travelling with tool calls is voiced right away so the
            // caller is not listening to silence while tools run.
            if !completion.text.is_empty() {
                self.say(&agent, completion.text, Some(completion.usage))
                    .await;
            }

            match self.run_tool_calls(&agent, completion.tool_calls).await {
                ToolFlow::Continue => {}
                ToolFlow::Done => return Ok(()),
            }
        }

        warn!(
            session = %self.session.session_id,
            agent = %self.session.active_agent,
            budget = self.settings.max_tool_iterations,
            "Tool iteration budget exhausted"
        );
        if let Some(agent) = self.registry.get(&self.session.active_agent) {
            self.say(&agent, TOOL_BUDGET_REPLY.to_string(), None).await;
        }
        Ok(())
    }

    /// Work through one completion's tool calls in order. A handoff
    /// claims the batch: later calls get a "not executed" result so the
    /// transcript stays well formed, and the switch runs after the batch.
    async fn run_tool_calls(
        &mut self,
        agent: &Arc<AgentSpec>,
        calls: Vec<ToolCallRequest>,
    ) -> ToolFlow {
        let mut pending: Option<PendingSwitch> = None;

        for call in &calls {
            self.session.append(TranscriptEntry::ToolCall {
                id: call.id.clone(),
                tool: call.name.clone(),
                params: call.arguments.clone(),
                timestamp: Utc::now(),
            });

            if let Some(switch) = &pending {
                let content = format!(
                    "Not executed: the conversation was transferred to {}.",
                    switch.route.target
                );
                self.append_tool_result(call, content.clone(), true);
                self.emit(SessionEvent::ToolInvoked {
                    name: call.name.clone(),
                    args: call.arguments.clone(),
                    result: content.clone(),
                    error: Some(content),
                })
                .await;
                continue;
            }

            let signal = HandoffSignal::ToolCall {
                name: call.name.as_str(),
                arguments: &call.arguments,
            };
            if agent.is_handoff_trigger(&signal) {
                let outcome = match agent.resolve_handoff(&signal) {
                    Ok(route) => {
                        let reason = call
                            .arguments
                            .get("reason")
                            .and_then(|v| v.as_str())
                            .map(str::to_string);
                        let target = route.target.clone();
                        pending = Some(PendingSwitch {
                            route,
                            reason,
                            origin: SwitchOrigin::Tool,
                        });
                        HandoffResult::ok(target, None)
                    }
                    Err(e) => {
                        // Route table and trigger disagree. Tell the model
                        // and stay on the current agent.
                        warn!(
                            session = %self.session.session_id,
                            tool = %call.name,
                            error = %e,
                            "Handoff could not be resolved"
                        );
                        HandoffResult::failed(e.to_string())
                    }
                };
                let content = outcome.describe();
                self.append_tool_result(call, content.clone(), !outcome.success);
                self.emit(SessionEvent::ToolInvoked {
                    name: call.name.clone(),
                    args: call.arguments.clone(),
                    result: content,
                    error: outcome.error,
                })
                .await;
                continue;
            }

            let ToolOutput {
                content,
                is_error,
                state_updates,
            } = self.execute_tool(agent, call).await;
            let error = is_error.then(|| content.clone());
            self.append_tool_result(call, content.clone(), is_error);
            self.emit(SessionEvent::ToolInvoked {
                name: call.name.clone(),
                args: call.arguments.clone(),
                result: content,
                error,
            })
            .await;

            // Tools may leave state behind; the watched key routes
            // programmatic handoffs.
            for (key, value) in &state_updates {
                self.session
                    .context_data
                    .insert(key.clone(), value.clone());
            }
            for (key, value) in &state_updates {
                let signal = HandoffSignal::StateChange {
                    key: key.as_str(),
                    value,
                };
                if !agent.is_handoff_trigger(&signal) {
                    continue;
                }
                match agent.resolve_handoff(&signal) {
                    Ok(route) => {
                        // Consume the trigger so it cannot re-fire next turn.
                        self.session.context_data.remove(key);
                        pending = Some(PendingSwitch {
                            route,
                            reason: None,
                            origin: SwitchOrigin::State,
                        });
                        break;
                    }
                    Err(e) => {
                        warn!(
                            session = %self.session.session_id,
                            key = %key,
                            error = %e,
                            "State-change handoff could not be resolved"
                        );
                    }
                }
            }
        }

        match pending {
            Some(switch) => {
                let origin = switch.origin;
                self.switch_agent(switch.route, switch.reason).await;
                match origin {
                    SwitchOrigin::Tool => ToolFlow::Continue,
                    SwitchOrigin::State => ToolFlow::Done,
                }
            }
            None => ToolFlow::Continue,
        }
    }

    /// The switch procedure: stop the outgoing agent's audio, record its
    /// usage, move the session, and voice the arrival greeting when the
    /// route is announced.
    async fn switch_agent(&mut self, route: HandoffRoute, reason: Option<String>) {
        let source = self.session.active_agent.clone();
        let target = route.target.clone();

        // Whatever the outgoing agent was saying stops now.
        if let Some(speaker) = &self.speaker {
            speaker.cancel_current().await;
        }

        let usage = self
            .usage_by_agent
            .get(&source)
            .cloned()
            .unwrap_or_default();
        self.emit(SessionEvent::AgentUsage {
            agent: source.clone(),
            usage,
        })
        .await;

        let last_utterance = self.session.last_user_text().map(str::to_string);
        self.session.pending_handoff = Some(HandoffContext {
            source_agent: source.clone(),
            target_agent: target.clone(),
            reason: reason
                .clone()
                .unwrap_or_else(|| format!("handoff from {source}")),
            user_last_utterance: last_utterance.clone(),
            context_data: if route.share_context {
                self.session.context_data.clone()
            } else {
                HashMap::new()
            },
            kind: route.kind,
            timestamp: Utc::now(),
        });
        self.session.active_agent = target.clone();
        let first_visit = self.session.visit(&target);

        self.session.append(TranscriptEntry::System {
            event: AGENT_SWITCHED_EVENT.to_string(),
            data: json!({
                "from": source,
                "to": target,
                "kind": route.kind,
                "share_context": route.share_context,
            }),
            timestamp: Utc::now(),
        });
        if !route.share_context {
            let summary = handoff_summary(&source, reason.as_deref(), last_utterance.as_deref());
            self.session.append(TranscriptEntry::System {
                event: CONTEXT_BOUNDARY_EVENT.to_string(),
                data: json!({ "summary": summary }),
                timestamp: Utc::now(),
            });
        }

        info!(
            session = %self.session.session_id,
            from = %source,
            to = %target,
            kind = ?route.kind,
            first_visit,
            "Agent switched"
        );
        self.emit(SessionEvent::AgentSwitched {
            from: source,
            to: target.clone(),
            kind: route.kind,
        })
        .await;

        if route.kind == HandoffKind::Announced {
            if let Some(agent) = self.registry.get(&target) {
                let greeting = agent.arrival_greeting(!first_visit).to_string();
                self.say(&agent, greeting, None).await;
            }
        }

        // A switch is a durability boundary even mid-turn.
        self.persist().await;
    }

    fn build_request(&self, agent: &AgentSpec) -> CompletionRequest {
        let mut tools = self.tools.definitions_for(&agent.capabilities);
        tools.extend(agent.handoff_tool_definitions());

        let boundary = self.session.history.iter().rposition(|entry| {
            matches!(entry, TranscriptEntry::System { event, .. } if event == CONTEXT_BOUNDARY_EVENT)
        });
        let mut system = agent.system_prompt.clone();
        let history = match boundary {
            Some(index) => {
                if let TranscriptEntry::System { data, .. } = &self.session.history[index] {
                    if let Some(summary) = data.get("summary").and_then(|s| s.as_str()) {
                        system.push_str("\n\n");
                        system.push_str(summary);
                    }
                }
                self.session.history[index + 1..].to_vec()
            }
            None => self.session.history.clone(),
        };

        CompletionRequest {
            model: agent
                .model
                .clone()
                .unwrap_or_else(|| self.settings.model.clone()),
            system,
            history,
            tools,
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        }
    }

    /// Execute one regular tool. Failures become error payloads the model
    /// can recover from conversationally; they never abort the turn.
    async fn execute_tool(&self, agent: &AgentSpec, call: &ToolCallRequest) -> ToolOutput {
        if !agent.capabilities.iter().any(|c| c == &call.name) {
            return ToolOutput::error(format!(
                "Tool '{}' is not available to {}",
                call.name, agent.name
            ));
        }
        let Some(tool) = self.tools.get(&call.name) else {
            return ToolOutput::error(format!("Unknown tool: {}", call.name));
        };

        debug!(session = %self.session.session_id, tool = %call.name, "Executing tool");
        let context = ToolContext {
            session_id: self.session.session_id.clone(),
            agent: agent.name.to_string(),
            context_data: self.session.context_data.clone(),
        };
        match tool.execute(call.arguments.clone(), &context).await {
            Ok(output) => output,
            Err(e) => {
                warn!(
                    session = %self.session.session_id,
                    tool = %call.name,
                    error = %e,
                    "Tool execution failed"
                );
                ToolOutput::error(format!("Tool error: {e}"))
            }
        }
    }

    fn append_tool_result(&mut self, call: &ToolCallRequest, content: String, is_error: bool) {
        self.session.append(TranscriptEntry::ToolResult {
            tool_use_id: call.id.clone(),
            tool: call.name.clone(),
            content,
            is_error,
            timestamp: Utc::now(),
        });
    }

    /// Record, emit, and voice one assistant utterance.
    async fn say(&mut self, agent: &AgentSpec, text: String, usage: Option<Usage>) {
        if text.is_empty() {
            return;
        }
        self.session
            .append(TranscriptEntry::assistant(&agent.name, &text, usage));
        self.emit(SessionEvent::ResponseText {
            agent: agent.name.clone(),
            text: text.clone(),
        })
        .await;
        self.speak(agent, &text).await;
    }

    async fn speak(&self, agent: &AgentSpec, text: &str) {
        let Some(speaker) = &self.speaker else { return };
        match speaker.speak(text, &agent.voice).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(session = %self.session.session_id, "Playback cut short")
            }
            Err(e) => warn!(
                session = %self.session.session_id,
                error = %e,
                "Synthesis failed; continuing without audio"
            ),
        }
    }

    async fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event).await;
    }

    /// Best-effort save. Losing a write degrades durability, not the call.
    async fn persist(&self) {
        if let Err(e) = self.store.save(&self.session).await {
            warn!(
                session = %self.session.session_id,
                error = %e,
                "Session save failed; continuing in memory"
            );
        }
    }
}

fn handoff_summary(source: &str, reason: Option<&str>, last_utterance: Option<&str>) -> String {
    let mut summary = format!("The caller was transferred to you from {source}");
    if let Some(reason) = reason {
        summary.push_str(&format!(" regarding: {reason}"));
    } else if let Some(utterance) = last_utterance {
        summary.push_str(&format!(". Their last words were: \"{utterance}\""));
    }
    summary.push('.');
    summary
}

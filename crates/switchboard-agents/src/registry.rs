//! Agent registry: scenario documents resolved into runtime agent specs
//! with their handoff strategies attached.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tracing::info;

use switchboard_core::error::{Result, SwitchboardError};
use switchboard_core::scenario::{ScenarioDoc, VoiceConfig};
use switchboard_providers::ToolDefinition;

use crate::handoff::{
    HandoffRoute, HandoffSignal, HandoffStrategy, StateBasedStrategy, ToolBasedStrategy,
};

/// A scenario agent resolved for runtime use.
pub struct AgentSpec {
    pub name: String,
    pub system_prompt: String,
    pub greeting: String,
    pub return_greeting: String,
    /// Names of regular tools this agent may invoke.
    pub capabilities: Vec<String>,
    pub model: Option<String>,
    pub voice: VoiceConfig,
    /// Handoff tool name -> route, for surfacing tool definitions.
    handoff_tools: HashMap<String, HandoffRoute>,
    strategies: Vec<Box<dyn HandoffStrategy>>,
}

impl AgentSpec {
    /// Whether any of this agent's strategies claims the signal.
    pub fn is_handoff_trigger(&self, signal: &HandoffSignal) -> bool {
        self.strategies.iter().any(|s| s.is_handoff_trigger(signal))
    }

    /// Route a signal through the first strategy that claims it.
    pub fn resolve_handoff(&self, signal: &HandoffSignal) -> Result<HandoffRoute> {
        for strategy in &self.strategies {
            if strategy.is_handoff_trigger(signal) {
                return strategy.resolve_target(signal);
            }
        }
        Err(SwitchboardError::HandoffUnresolved(signal.describe()))
    }

    /// Definitions for this agent's handoff tools, surfaced to the LLM
    /// alongside its regular capabilities.
    pub fn handoff_tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .handoff_tools
            .iter()
            .map(|(tool, route)| ToolDefinition {
                name: tool.clone(),
                description: format!(
                    "Transfer the conversation to the {} agent. \
                     Call this as soon as the caller's need matches that agent.",
                    route.target
                ),
                parameters_schema: json!({
                    "type": "object",
                    "properties": {
                        "reason": {
                            "type": "string",
                            "description": "Why the conversation is being transferred",
                        }
                    },
                }),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Greeting for an announced arrival: `greeting` on first visit,
    /// `return_greeting` on a revisit. Agents that declare no return
    /// greeting repeat their regular one.
    pub fn arrival_greeting(&self, revisit: bool) -> &str {
        if revisit && !self.return_greeting.is_empty() {
            &self.return_greeting
        } else {
            &self.greeting
        }
    }
}

/// All agents of the active scenario, indexed by name.
pub struct AgentRegistry {
    scenario_name: String,
    start_agent: String,
    agents: HashMap<String, Arc<AgentSpec>>,
}

impl AgentRegistry {
    /// Resolve a checked scenario document into runtime specs. Each
    /// agent gets a tool-based strategy over its outbound routes plus a
    /// state-based strategy watching the default key.
    pub fn from_scenario(doc: &ScenarioDoc) -> Result<Self> {
        doc.check()?;

        let mut agents = HashMap::with_capacity(doc.agents.len());
        for def in &doc.agents {
            let mut handoff_tools = HashMap::new();
            let mut state_routes = HashMap::new();
            for handoff in doc.handoffs.iter().filter(|h| h.from == def.name) {
                let route = HandoffRoute {
                    target: handoff.to.clone(),
                    kind: handoff.kind,
                    share_context: handoff.share_context,
                };
                handoff_tools.insert(handoff.tool.clone(), route.clone());
                state_routes.insert(handoff.to.clone(), route);
            }

            let strategies: Vec<Box<dyn HandoffStrategy>> = vec![
                Box::new(ToolBasedStrategy::new(handoff_tools.clone())),
                Box::new(StateBasedStrategy::new(state_routes)),
            ];
            let spec = AgentSpec {
                name: def.name.clone(),
                system_prompt: def.system_prompt.clone(),
                greeting: def.greeting.clone(),
                return_greeting: def.return_greeting.clone(),
                capabilities: def.tools.clone(),
                model: def.model.clone(),
                voice: def.voice.clone(),
                handoff_tools,
                strategies,
            };
            agents.insert(def.name.clone(), Arc::new(spec));
        }

        info!(
            scenario = %doc.name,
            agents = agents.len(),
            handoffs = doc.handoffs.len(),
            "Agent registry built"
        );
        Ok(Self {
            scenario_name: doc.name.clone(),
            start_agent: doc.start_agent.clone(),
            agents,
        })
    }

    pub fn scenario_name(&self) -> &str {
        &self.scenario_name
    }

    pub fn start_agent(&self) -> &str {
        &self.start_agent
    }

    pub fn get(&self, name: &str) -> Option<Arc<AgentSpec>> {
        self.agents.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    pub fn agent_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.agents.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

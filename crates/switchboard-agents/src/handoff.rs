//! Handoff detection: deciding whether a signal moves the conversation
//! to another agent, and where it goes.

use std::collections::HashMap;

use serde_json::Value;

use switchboard_core::error::{Result, SwitchboardError};
use switchboard_core::session::HandoffKind;

/// State key watched by the state-based strategy unless configured
/// otherwise.
pub const DEFAULT_WATCHED_KEY: &str = "pending_handoff";

/// Something that might be a handoff: a tool call the model made, or a
/// context-data mutation left behind by tool execution.
#[derive(Debug, Clone)]
pub enum HandoffSignal<'a> {
    ToolCall { name: &'a str, arguments: &'a Value },
    StateChange { key: &'a str, value: &'a Value },
}

impl HandoffSignal<'_> {
    pub fn describe(&self) -> String {
        match self {
            HandoffSignal::ToolCall { name, .. } => format!("tool call '{name}'"),
            HandoffSignal::StateChange { key, value } => {
                format!("state change {key}={value}")
            }
        }
    }
}

/// Where a matched signal routes, and how the switch behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffRoute {
    pub target: String,
    pub kind: HandoffKind,
    /// Whether the target agent sees the full prior transcript or only a
    /// summary line.
    pub share_context: bool,
}

/// One way of recognizing and routing handoffs. Strategies are built per
/// agent from the scenario's routes for that agent.
pub trait HandoffStrategy: Send + Sync {
    fn is_handoff_trigger(&self, signal: &HandoffSignal) -> bool;

    /// Resolve a triggering signal to its route. Signals that do not
    /// trigger this strategy resolve to `HandoffUnresolved`.
    fn resolve_target(&self, signal: &HandoffSignal) -> Result<HandoffRoute>;
}

/// Routes on explicit handoff tool calls ("call function handoff_x").
pub struct ToolBasedStrategy {
    /// Handoff tool name -> route.
    routes: HashMap<String, HandoffRoute>,
}

impl ToolBasedStrategy {
    pub fn new(routes: HashMap<String, HandoffRoute>) -> Self {
        Self { routes }
    }

    pub fn route_for_tool(&self, tool: &str) -> Option<&HandoffRoute> {
        self.routes.get(tool)
    }
}

impl HandoffStrategy for ToolBasedStrategy {
    fn is_handoff_trigger(&self, signal: &HandoffSignal) -> bool {
        match signal {
            HandoffSignal::ToolCall { name, .. } => self.routes.contains_key(*name),
            HandoffSignal::StateChange { .. } => false,
        }
    }

    fn resolve_target(&self, signal: &HandoffSignal) -> Result<HandoffRoute> {
        if let HandoffSignal::ToolCall { name, .. } = signal {
            if let Some(route) = self.routes.get(*name) {
                return Ok(route.clone());
            }
        }
        Err(SwitchboardError::HandoffUnresolved(signal.describe()))
    }
}

/// Routes on a watched context-data key being set to a target agent
/// name. Lets deterministic code paths hand off without involving the
/// model's tool calling.
pub struct StateBasedStrategy {
    watched_key: String,
    /// Target agent name -> route.
    routes: HashMap<String, HandoffRoute>,
}

impl StateBasedStrategy {
    pub fn new(routes: HashMap<String, HandoffRoute>) -> Self {
        Self::with_watched_key(DEFAULT_WATCHED_KEY, routes)
    }

    pub fn with_watched_key(
        watched_key: impl Into<String>,
        routes: HashMap<String, HandoffRoute>,
    ) -> Self {
        Self {
            watched_key: watched_key.into(),
            routes,
        }
    }

    pub fn watched_key(&self) -> &str {
        &self.watched_key
    }

    fn target_of<'v>(&self, key: &str, value: &'v Value) -> Option<&'v str> {
        if key != self.watched_key {
            return None;
        }
        value.as_str()
    }
}

impl HandoffStrategy for StateBasedStrategy {
    fn is_handoff_trigger(&self, signal: &HandoffSignal) -> bool {
        match signal {
            HandoffSignal::StateChange { key, value } => self
                .target_of(key, value)
                .is_some_and(|target| self.routes.contains_key(target)),
            HandoffSignal::ToolCall { .. } => false,
        }
    }

    fn resolve_target(&self, signal: &HandoffSignal) -> Result<HandoffRoute> {
        if let HandoffSignal::StateChange { key, value } = signal {
            if let Some(route) = self
                .target_of(key, value)
                .and_then(|target| self.routes.get(target))
            {
                return Ok(route.clone());
            }
        }
        Err(SwitchboardError::HandoffUnresolved(signal.describe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn announced(target: &str) -> HandoffRoute {
        HandoffRoute {
            target: target.to_string(),
            kind: HandoffKind::Announced,
            share_context: true,
        }
    }

    fn tool_strategy() -> ToolBasedStrategy {
        let mut routes = HashMap::new();
        routes.insert("handoff_fraud_agent".to_string(), announced("FraudAgent"));
        ToolBasedStrategy::new(routes)
    }

    fn state_strategy() -> StateBasedStrategy {
        let mut routes = HashMap::new();
        routes.insert("FraudAgent".to_string(), announced("FraudAgent"));
        StateBasedStrategy::new(routes)
    }

    #[test]
    fn tool_strategy_matches_only_known_handoff_tools() {
        let strategy = tool_strategy();
        let args = json!({ "reason": "caller reported fraud" });

        let handoff = HandoffSignal::ToolCall {
            name: "handoff_fraud_agent",
            arguments: &args,
        };
        assert!(strategy.is_handoff_trigger(&handoff));
        let route = strategy.resolve_target(&handoff).unwrap();
        assert_eq!(route.target, "FraudAgent");
        assert_eq!(route.kind, HandoffKind::Announced);

        let plain = HandoffSignal::ToolCall {
            name: "lookup_balance",
            arguments: &args,
        };
        assert!(!strategy.is_handoff_trigger(&plain));
        let err = strategy.resolve_target(&plain).unwrap_err();
        assert_eq!(err.kind(), "handoff_unresolved");
    }

    #[test]
    fn repeated_resolution_is_deterministic() {
        let strategy = tool_strategy();
        let args = json!({ "reason": "caller reported fraud" });
        let signal = HandoffSignal::ToolCall {
            name: "handoff_fraud_agent",
            arguments: &args,
        };
        let first = strategy.resolve_target(&signal).unwrap();
        let second = strategy.resolve_target(&signal).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn tool_strategy_ignores_state_changes() {
        let strategy = tool_strategy();
        let value = json!("FraudAgent");
        let signal = HandoffSignal::StateChange {
            key: DEFAULT_WATCHED_KEY,
            value: &value,
        };
        assert!(!strategy.is_handoff_trigger(&signal));
    }

    #[test]
    fn state_strategy_watches_one_key() {
        let strategy = state_strategy();
        let value = json!("FraudAgent");

        let armed = HandoffSignal::StateChange {
            key: "pending_handoff",
            value: &value,
        };
        assert!(strategy.is_handoff_trigger(&armed));
        assert_eq!(
            strategy.resolve_target(&armed).unwrap().target,
            "FraudAgent"
        );

        let other_key = HandoffSignal::StateChange {
            key: "escalation_level",
            value: &value,
        };
        assert!(!strategy.is_handoff_trigger(&other_key));
    }

    #[test]
    fn state_strategy_rejects_unknown_targets() {
        let strategy = state_strategy();
        let value = json!("NoSuchAgent");
        let signal = HandoffSignal::StateChange {
            key: DEFAULT_WATCHED_KEY,
            value: &value,
        };
        assert!(!strategy.is_handoff_trigger(&signal));
        assert_eq!(
            strategy.resolve_target(&signal).unwrap_err().kind(),
            "handoff_unresolved"
        );
    }

    #[test]
    fn state_strategy_ignores_non_string_values() {
        let strategy = state_strategy();
        let value = json!({ "target": "FraudAgent" });
        let signal = HandoffSignal::StateChange {
            key: DEFAULT_WATCHED_KEY,
            value: &value,
        };
        assert!(!strategy.is_handoff_trigger(&signal));
    }
}

//! Scenario documents: YAML-defined agent rosters and handoff routes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SwitchboardError};
use crate::session::HandoffKind;

/// A scenario document loaded from a YAML file.
///
/// Declares the participating agents, the agent a fresh session starts
/// on, and the handoff routes between agents. Data, not code: loaded
/// once per scenario activation and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioDoc {
    /// Scenario name, for logs and validation output.
    pub name: String,

    /// Agent a fresh session starts on.
    pub start_agent: String,

    pub agents: Vec<AgentDef>,

    #[serde(default)]
    pub handoffs: Vec<HandoffDef>,

    /// Path to the source YAML file.
    #[serde(skip)]
    pub file_path: PathBuf,
}

/// One agent declared by a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDef {
    /// Unique agent name within the scenario.
    pub name: String,

    /// System prompt injected for this agent's turns.
    #[serde(default)]
    pub system_prompt: String,

    /// Spoken when this agent becomes active for the first time
    /// via an announced handoff (or at session start).
    #[serde(default)]
    pub greeting: String,

    /// Spoken when the caller returns to this agent via an
    /// announced handoff.
    #[serde(default)]
    pub return_greeting: String,

    /// Tool names this agent may invoke.
    #[serde(default)]
    pub tools: Vec<String>,

    /// Per-agent model override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default)]
    pub voice: VoiceConfig,
}

/// Voice parameters handed to the synthesizer for an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoiceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
}

/// One handoff route declared by a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffDef {
    pub from: String,
    pub to: String,
    /// Tool name whose invocation triggers this route.
    pub tool: String,
    #[serde(default = "default_handoff_kind")]
    pub kind: HandoffKind,
    /// Whether the target agent sees the full prior history.
    #[serde(default = "default_true")]
    pub share_context: bool,
}

fn default_handoff_kind() -> HandoffKind {
    HandoffKind::Announced
}

fn default_true() -> bool {
    true
}

impl ScenarioDoc {
    /// Load a scenario document from a YAML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut doc: ScenarioDoc = serde_yaml::from_str(&content)
            .map_err(|e| SwitchboardError::Scenario(e.to_string()))?;
        doc.file_path = path.to_path_buf();
        doc.check()?;
        Ok(doc)
    }

    /// Parse a scenario from a YAML string (no file path attached).
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let doc: ScenarioDoc = serde_yaml::from_str(yaml)
            .map_err(|e| SwitchboardError::Scenario(e.to_string()))?;
        doc.check()?;
        Ok(doc)
    }

    pub fn agent(&self, name: &str) -> Option<&AgentDef> {
        self.agents.iter().find(|a| a.name == name)
    }

    /// Cross-check the document: the start agent must exist, agent names
    /// must be unique, and every handoff route must connect declared
    /// agents via a tool its source agent does not already claim.
    pub fn check(&self) -> Result<()> {
        if self.agents.is_empty() {
            return Err(SwitchboardError::Scenario(format!(
                "scenario '{}' declares no agents",
                self.name
            )));
        }

        for (i, agent) in self.agents.iter().enumerate() {
            if self.agents[..i].iter().any(|a| a.name == agent.name) {
                return Err(SwitchboardError::Scenario(format!(
                    "duplicate agent name '{}'",
                    agent.name
                )));
            }
        }

        if self.agent(&self.start_agent).is_none() {
            return Err(SwitchboardError::Scenario(format!(
                "start_agent '{}' is not a declared agent",
                self.start_agent
            )));
        }

        for handoff in &self.handoffs {
            if self.agent(&handoff.from).is_none() {
                return Err(SwitchboardError::Scenario(format!(
                    "handoff '{}' names unknown source agent '{}'",
                    handoff.tool, handoff.from
                )));
            }
            if self.agent(&handoff.to).is_none() {
                return Err(SwitchboardError::Scenario(format!(
                    "handoff '{}' names unknown target agent '{}'",
                    handoff.tool, handoff.to
                )));
            }
            let duplicated = self
                .handoffs
                .iter()
                .filter(|h| h.from == handoff.from && h.tool == handoff.tool)
                .count();
            if duplicated > 1 {
                return Err(SwitchboardError::Scenario(format!(
                    "agent '{}' declares handoff tool '{}' more than once",
                    handoff.from, handoff.tool
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RETAIL_BANK: &str = r#"
name: retail-bank
start_agent: Concierge
agents:
  - name: Concierge
    system_prompt: You are the front-desk concierge for a retail bank.
    greeting: "Hello, thanks for calling. How can I help you today?"
    return_greeting: "You're back with the concierge. Anything else?"
    tools:
      - lookup_balance
  - name: FraudAgent
    system_prompt: You handle fraud reports.
    greeting: "This is the fraud desk. I can help you secure your account."
    return_greeting: "Fraud desk again. What else did you notice?"
    voice:
      voice_id: Bella
handoffs:
  - from: Concierge
    to: FraudAgent
    tool: handoff_fraud_agent
    kind: announced
  - from: FraudAgent
    to: Concierge
    tool: handoff_concierge
    kind: discrete
    share_context: false
"#;

    #[test]
    fn test_parse_scenario_yaml() {
        let doc = ScenarioDoc::from_yaml(RETAIL_BANK).unwrap();
        assert_eq!(doc.name, "retail-bank");
        assert_eq!(doc.start_agent, "Concierge");
        assert_eq!(doc.agents.len(), 2);
        assert_eq!(doc.handoffs.len(), 2);

        let fraud = doc.agent("FraudAgent").unwrap();
        assert_eq!(fraud.voice.voice_id.as_deref(), Some("Bella"));

        assert_eq!(doc.handoffs[0].kind, HandoffKind::Announced);
        assert!(doc.handoffs[0].share_context);
        assert_eq!(doc.handoffs[1].kind, HandoffKind::Discrete);
        assert!(!doc.handoffs[1].share_context);
    }

    #[test]
    fn test_parse_minimal_scenario() {
        let yaml = r#"
name: solo
start_agent: Only
agents:
  - name: Only
"#;
        let doc = ScenarioDoc::from_yaml(yaml).unwrap();
        assert_eq!(doc.agents.len(), 1);
        assert!(doc.handoffs.is_empty());
        assert!(doc.agent("Only").unwrap().tools.is_empty());
    }

    #[test]
    fn test_unknown_start_agent_rejected() {
        let yaml = r#"
name: broken
start_agent: Ghost
agents:
  - name: Only
"#;
        let err = ScenarioDoc::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("Ghost"));
    }

    #[test]
    fn test_handoff_to_unknown_agent_rejected() {
        let yaml = r#"
name: broken
start_agent: A
agents:
  - name: A
handoffs:
  - from: A
    to: Missing
    tool: handoff_missing
"#;
        let err = ScenarioDoc::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("Missing"));
    }

    #[test]
    fn test_duplicate_handoff_tool_rejected() {
        let yaml = r#"
name: broken
start_agent: A
agents:
  - name: A
  - name: B
handoffs:
  - from: A
    to: B
    tool: handoff_b
  - from: A
    to: B
    tool: handoff_b
"#;
        let err = ScenarioDoc::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenario.yaml");
        std::fs::write(&path, RETAIL_BANK).unwrap();

        let doc = ScenarioDoc::load_from_file(&path).unwrap();
        assert_eq!(doc.file_path, path);
        assert_eq!(doc.agents.len(), 2);
    }
}

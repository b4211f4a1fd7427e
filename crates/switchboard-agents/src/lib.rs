//! Agent roster, handoff routing, and the tool surface agents invoke.

pub mod handoff;
pub mod registry;
pub mod tools;

pub use handoff::{
    DEFAULT_WATCHED_KEY, HandoffRoute, HandoffSignal, HandoffStrategy, StateBasedStrategy,
    ToolBasedStrategy,
};
pub use registry::{AgentRegistry, AgentSpec};
pub use tools::{Tool, ToolContext, ToolOutput, ToolRegistry};

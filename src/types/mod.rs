pub mod agent;
pub mod result;
pub mod stats;

pub use agent::{AgentDecision, AgentEvent, AgentRecord, AgentTurn, PersonaTraits};
pub use result::{AgentResult, CycleResult};
pub use stats::SimulationStats;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type AgentId = Uuid;
pub type SessionId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OutcomeTag {
    Idle,
    Browsed,
    AddedToCart,
    CheckedOut,
    Failed,
    Custom(String),
}

impl OutcomeTag {
    pub fn as_str(&self) -> &str {
        match self {
            OutcomeTag::Idle => "idle",
            OutcomeTag::Browsed => "browsed",
            OutcomeTag::AddedToCart => "added_to_cart",
            OutcomeTag::CheckedOut => "checked_out",
            OutcomeTag::Failed => "failed",
            OutcomeTag::Custom(tag) => tag,
        }
    }

    pub fn parse(tag: &str) -> Self {
        match tag {
            "idle" => OutcomeTag::Idle,
            "browsed" => OutcomeTag::Browsed,
            "added_to_cart" => OutcomeTag::AddedToCart,
            "checked_out" => OutcomeTag::CheckedOut,
            "failed" => OutcomeTag::Failed,
            other => OutcomeTag::Custom(other.to_string()),
        }
    }
}

/// Which slice of the population a run drives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentSelection {
    All,
    Ids(Vec<AgentId>),
    Random(usize),
}

impl Default for AgentSelection {
    fn default() -> Self {
        AgentSelection::All
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    Parallel,
    Sequential,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Parallel
    }
}

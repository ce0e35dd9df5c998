use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::{AgentId, OutcomeTag};

/// Behavioral attributes of a persona. Fixed for the duration of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PersonaTraits {
    /// Probability of doing anything at all in a given simulated hour.
    pub shopping_frequency: f32,
    pub price_sensitivity: f32,
    pub impulse_factor: f32,
}

impl Default for PersonaTraits {
    fn default() -> Self {
        Self {
            shopping_frequency: 0.3,
            price_sensitivity: 0.5,
            impulse_factor: 0.2,
        }
    }
}

/// One simulated shopper, as loaded from the population source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub display_name: String,
    pub traits: PersonaTraits,
    pub created_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(display_name: impl Into<String>, traits: PersonaTraits) -> Self {
        Self {
            id: AgentId::new_v4(),
            display_name: display_name.into(),
            traits,
            created_at: Utc::now(),
        }
    }
}

/// Immutable input handed to the decision graph for one agent in one cycle.
#[derive(Debug, Clone)]
pub struct AgentTurn {
    pub agent: Arc<AgentRecord>,
    pub cycle: u64,
    pub simulated_time: Option<DateTime<Utc>>,
}

impl AgentTurn {
    pub fn agent_id(&self) -> AgentId {
        self.agent.id
    }
}

/// What the decision graph reports back after running an agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentDecision {
    pub did_act: bool,
    pub outcome: OutcomeTag,
    pub events_created: u32,
    /// Set when the graph ran to completion but the agent's work failed.
    pub failure: Option<String>,
}

impl AgentDecision {
    pub fn idle() -> Self {
        Self {
            did_act: false,
            outcome: OutcomeTag::Idle,
            events_created: 0,
            failure: None,
        }
    }

    pub fn acted(outcome: OutcomeTag, events_created: u32) -> Self {
        Self {
            did_act: true,
            outcome,
            events_created,
            failure: None,
        }
    }

    pub fn failed(outcome: OutcomeTag, reason: impl Into<String>) -> Self {
        Self {
            did_act: false,
            outcome,
            events_created: 0,
            failure: Some(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// A behavioral event written through an agent's session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub agent_id: AgentId,
    pub cycle: u64,
    pub kind: OutcomeTag,
    pub simulated_time: Option<DateTime<Utc>>,
    pub payload: Value,
}

impl AgentEvent {
    pub fn new(turn: &AgentTurn, kind: OutcomeTag) -> Self {
        Self {
            agent_id: turn.agent_id(),
            cycle: turn.cycle,
            kind,
            simulated_time: turn.simulated_time,
            payload: Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

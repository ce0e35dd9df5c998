use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{AgentDecision, AgentId, OutcomeTag};

/// Outcome of one agent in one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_id: AgentId,
    pub success: bool,
    pub did_act: bool,
    pub outcome_tag: OutcomeTag,
    pub events_created: u32,
    pub error: Option<String>,
    pub duration: Duration,
}

impl AgentResult {
    pub fn from_decision(agent_id: AgentId, decision: AgentDecision, duration: Duration) -> Self {
        Self {
            agent_id,
            success: decision.failure.is_none(),
            did_act: decision.did_act,
            outcome_tag: decision.outcome,
            events_created: decision.events_created,
            error: decision.failure,
            duration,
        }
    }

    pub fn failed(agent_id: AgentId, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            agent_id,
            success: false,
            did_act: false,
            outcome_tag: OutcomeTag::Failed,
            events_created: 0,
            error: Some(error.into()),
            duration,
        }
    }
}

/// Aggregated outcome of one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleResult {
    pub cycle_number: u64,
    pub agents_processed: usize,
    pub agents_acted: usize,
    pub errors: usize,
    pub duration: Duration,
    pub agent_results: Vec<AgentResult>,
}

impl CycleResult {
    pub fn empty(cycle_number: u64) -> Self {
        Self {
            cycle_number,
            agents_processed: 0,
            agents_acted: 0,
            errors: 0,
            duration: Duration::ZERO,
            agent_results: Vec::new(),
        }
    }

    pub fn from_results(
        cycle_number: u64,
        agent_results: Vec<AgentResult>,
        duration: Duration,
    ) -> Self {
        let agents_acted = agent_results.iter().filter(|r| r.did_act).count();
        let errors = agent_results.iter().filter(|r| !r.success).count();

        Self {
            cycle_number,
            agents_processed: agent_results.len(),
            agents_acted,
            errors,
            duration,
            agent_results,
        }
    }

    pub fn events_created(&self) -> u64 {
        self.agent_results
            .iter()
            .map(|r| r.events_created as u64)
            .sum()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.agent_results
            .iter()
            .rev()
            .find_map(|r| r.error.as_deref())
    }
}

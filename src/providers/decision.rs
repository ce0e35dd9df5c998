use anyhow::Result;
use rand::Rng;
use serde_json::json;

use crate::storage::AgentSession;
use crate::types::{AgentDecision, AgentEvent, AgentTurn, OutcomeTag};

/// Per-agent decision logic.
///
/// Runs synchronously on a blocking worker thread, once per agent per cycle.
/// Anything it writes must go through `session` so the executor can commit
/// or roll it back as a unit.
pub trait DecisionGraph: Send + Sync {
    fn invoke(&self, turn: &AgentTurn, session: &mut dyn AgentSession) -> Result<AgentDecision>;
}

/// Trait-weighted coin flips. Good enough to put load on the engine; not a
/// shopping policy.
#[derive(Debug, Clone, Default)]
pub struct HeuristicGraph;

impl HeuristicGraph {
    pub fn new() -> Self {
        Self
    }
}

impl DecisionGraph for HeuristicGraph {
    fn invoke(&self, turn: &AgentTurn, session: &mut dyn AgentSession) -> Result<AgentDecision> {
        let traits = turn.agent.traits;
        let mut rng = rand::thread_rng();

        if rng.gen::<f32>() >= traits.shopping_frequency {
            return Ok(AgentDecision::idle());
        }

        let mut events = 0;
        let mut outcome = OutcomeTag::Browsed;
        session.record_event(&AgentEvent::new(turn, OutcomeTag::Browsed))?;
        events += 1;

        if rng.gen::<f32>() < traits.impulse_factor + (1.0 - traits.price_sensitivity) * 0.3 {
            outcome = OutcomeTag::AddedToCart;
            session.record_event(
                &AgentEvent::new(turn, OutcomeTag::AddedToCart)
                    .with_payload(json!({ "quantity": 1 })),
            )?;
            events += 1;

            if rng.gen::<f32>() < 1.0 - traits.price_sensitivity {
                outcome = OutcomeTag::CheckedOut;
                session.record_event(&AgentEvent::new(turn, OutcomeTag::CheckedOut))?;
                events += 1;
            }
        }

        Ok(AgentDecision::acted(outcome, events))
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::CycleResult;

/// Run-wide counters. Only the orchestrator writes these, after a cycle's
/// gather has fully resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationStats {
    pub cycles_completed: u64,
    pub agents_processed: u64,
    pub agents_acted: u64,
    pub events_created: u64,
    pub errors: u64,
    pub outcomes: BTreeMap<String, u64>,
    pub total_cycle_secs: f64,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl SimulationStats {
    pub fn new() -> Self {
        Self {
            cycles_completed: 0,
            agents_processed: 0,
            agents_acted: 0,
            events_created: 0,
            errors: 0,
            outcomes: BTreeMap::new(),
            total_cycle_secs: 0.0,
            last_error: None,
            started_at: Utc::now(),
        }
    }

    pub fn record_cycle(&mut self, cycle: &CycleResult) {
        self.cycles_completed += 1;
        self.agents_processed += cycle.agents_processed as u64;
        self.agents_acted += cycle.agents_acted as u64;
        self.events_created += cycle.events_created();
        self.errors += cycle.errors as u64;
        self.total_cycle_secs += cycle.duration.as_secs_f64();

        for result in &cycle.agent_results {
            *self
                .outcomes
                .entry(result.outcome_tag.as_str().to_string())
                .or_insert(0) += 1;
        }

        if let Some(err) = cycle.last_error() {
            self.last_error = Some(err.to_string());
        }
    }

    pub fn average_cycle_secs(&self) -> f64 {
        if self.cycles_completed == 0 {
            return 0.0;
        }
        self.total_cycle_secs / self.cycles_completed as f64
    }

    pub fn error_rate(&self) -> f64 {
        if self.agents_processed == 0 {
            return 0.0;
        }
        self.errors as f64 / self.agents_processed as f64
    }
}

impl Default for SimulationStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentDecision, AgentId, AgentResult, OutcomeTag};
    use std::time::Duration;

    #[test]
    fn test_record_cycle_accumulates() {
        let mut stats = SimulationStats::new();
        let results = vec![
            AgentResult::from_decision(
                AgentId::new_v4(),
                AgentDecision::acted(OutcomeTag::CheckedOut, 3),
                Duration::from_millis(10),
            ),
            AgentResult::failed(AgentId::new_v4(), "db down", Duration::from_millis(2)),
        ];
        let cycle = CycleResult::from_results(1, results, Duration::from_secs(2));

        stats.record_cycle(&cycle);
        stats.record_cycle(&CycleResult::empty(2));

        assert_eq!(stats.cycles_completed, 2);
        assert_eq!(stats.agents_processed, 2);
        assert_eq!(stats.agents_acted, 1);
        assert_eq!(stats.events_created, 3);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.outcomes.get("checked_out"), Some(&1));
        assert_eq!(stats.outcomes.get("failed"), Some(&1));
        assert_eq!(stats.last_error.as_deref(), Some("db down"));
        assert!((stats.average_cycle_secs() - 1.0).abs() < 1e-9);
        assert!((stats.error_rate() - 0.5).abs() < 1e-9);
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::mpsc;

use crate::types::AgentId;

const RECENT_FAILURE_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub agent_id: AgentId,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// State transitions pushed to whoever is listening (dashboard, logs).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BreakerEvent {
    Opened {
        cycle_failures: u64,
        threshold: u64,
        at: DateTime<Utc>,
        last_error: Option<String>,
    },
    Reset {
        at: DateTime<Utc>,
    },
}

/// Serializable view of the breaker for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub threshold: u64,
    pub cycle_failures: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub opened_at: Option<DateTime<Utc>>,
    pub recent_failures: Vec<FailureRecord>,
}

/// Per-cycle failure-rate breaker.
///
/// Opens when more than `threshold` agents fail within one cycle and stays
/// open until `manual_reset`; there is no half-open probing.
pub struct CircuitBreaker {
    state: BreakerState,
    failure_pct: f64,
    threshold: u64,
    cycle_failures: u64,
    total_failures: u64,
    total_successes: u64,
    opened_at: Option<DateTime<Utc>>,
    recent_failures: VecDeque<FailureRecord>,
    events: Option<mpsc::UnboundedSender<BreakerEvent>>,
}

impl CircuitBreaker {
    pub fn new(total_agents: usize, failure_pct: f64) -> Self {
        Self {
            state: BreakerState::Closed,
            failure_pct,
            threshold: Self::derive_threshold(total_agents, failure_pct),
            cycle_failures: 0,
            total_failures: 0,
            total_successes: 0,
            opened_at: None,
            recent_failures: VecDeque::with_capacity(RECENT_FAILURE_LIMIT),
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<BreakerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn derive_threshold(total_agents: usize, failure_pct: f64) -> u64 {
        let raw = (total_agents as f64 * failure_pct / 100.0).floor();
        (raw as u64).max(1)
    }

    pub fn update_total_agents(&mut self, total_agents: usize) {
        self.threshold = Self::derive_threshold(total_agents, self.failure_pct);
        log::info!(
            "Circuit breaker threshold re-derived: {} failures per cycle ({} agents, {}%)",
            self.threshold,
            total_agents,
            self.failure_pct
        );
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == BreakerState::Open
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn cycle_failures(&self) -> u64 {
        self.cycle_failures
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }

    pub fn record_failure(&mut self, agent_id: AgentId, error: &str) {
        self.cycle_failures += 1;
        self.total_failures += 1;

        if self.recent_failures.len() == RECENT_FAILURE_LIMIT {
            self.recent_failures.pop_front();
        }
        self.recent_failures.push_back(FailureRecord {
            agent_id,
            error: error.to_string(),
            at: Utc::now(),
        });

        if self.state == BreakerState::Closed && self.cycle_failures > self.threshold {
            self.trip();
        }
    }

    pub fn record_success(&mut self) {
        self.total_successes += 1;
    }

    /// Called once per cycle before dispatch.
    pub fn reset_cycle(&mut self) {
        self.cycle_failures = 0;
    }

    pub fn manual_reset(&mut self) {
        log::info!(
            "Circuit breaker manually reset (was {:?}, {} total failures)",
            self.state,
            self.total_failures
        );
        self.state = BreakerState::Closed;
        self.opened_at = None;
        self.cycle_failures = 0;
        self.total_failures = 0;
        self.recent_failures.clear();
        self.notify(BreakerEvent::Reset { at: Utc::now() });
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            threshold: self.threshold,
            cycle_failures: self.cycle_failures,
            total_failures: self.total_failures,
            total_successes: self.total_successes,
            opened_at: self.opened_at,
            recent_failures: self.recent_failures.iter().cloned().collect(),
        }
    }

    fn trip(&mut self) {
        let now = Utc::now();
        self.state = BreakerState::Open;
        self.opened_at = Some(now);

        let last_error = self.recent_failures.back().map(|f| f.error.clone());
        log::error!(
            "Circuit breaker OPEN: {} failures this cycle exceeds threshold {} (last error: {})",
            self.cycle_failures,
            self.threshold,
            last_error.as_deref().unwrap_or("none")
        );

        self.notify(BreakerEvent::Opened {
            cycle_failures: self.cycle_failures,
            threshold: self.threshold,
            at: now,
            last_error,
        });
    }

    fn notify(&self, event: BreakerEvent) {
        let Some(events) = &self.events else {
            return;
        };
        if events.send(event).is_err() {
            log::warn!("Circuit breaker event listener is gone; notification skipped");
        }
    }
}

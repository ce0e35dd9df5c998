use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::types::AgentId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvanceOutcome {
    pub offers_assigned: u64,
    pub users_refreshed: u64,
    pub simulated_time: DateTime<Utc>,
}

/// Owner of simulated time. Rolls the clock forward once per cycle and
/// refreshes whatever per-user state is due at the new time.
#[async_trait]
pub trait TimeService: Send + Sync {
    async fn advance(&self, hours: f64, agent_filter: Option<&[AgentId]>) -> Result<AdvanceOutcome>;

    async fn current_time(&self) -> Result<DateTime<Utc>>;

    /// Reposition the clock, used when resuming from a checkpoint.
    async fn restore(&self, at: DateTime<Utc>) -> Result<()>;
}

/// In-process clock with no offer bookkeeping.
pub struct SimulatedClock {
    now: Mutex<DateTime<Utc>>,
}

impl SimulatedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl TimeService for SimulatedClock {
    async fn advance(&self, hours: f64, agent_filter: Option<&[AgentId]>) -> Result<AdvanceOutcome> {
        let mut now = self.now.lock().await;
        let millis = (hours * 3_600_000.0).round() as i64;
        *now += ChronoDuration::milliseconds(millis);

        Ok(AdvanceOutcome {
            offers_assigned: 0,
            users_refreshed: agent_filter.map(|ids| ids.len() as u64).unwrap_or(0),
            simulated_time: *now,
        })
    }

    async fn current_time(&self) -> Result<DateTime<Utc>> {
        Ok(*self.now.lock().await)
    }

    async fn restore(&self, at: DateTime<Utc>) -> Result<()> {
        *self.now.lock().await = at;
        Ok(())
    }
}

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{AgentEvent, AgentId, AgentRecord, AgentSelection};

/// A dedicated backend session checked out for one agent's unit of work.
///
/// `record_event` is synchronous so the decision graph can call it from a
/// blocking worker thread. Dropping a session without committing discards
/// everything written through it.
#[async_trait]
pub trait AgentSession: Send {
    fn record_event(&mut self, event: &AgentEvent) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Bounded pool handing out per-agent sessions.
#[async_trait]
pub trait SessionPool: Send + Sync {
    async fn checkout(&self) -> Result<Box<dyn AgentSession>>;

    /// Maximum number of sessions that can be checked out at once.
    fn capacity(&self) -> usize;
}

#[async_trait]
pub trait Storage: Send + Sync {
    // Population
    async fn load_agents(&self, selection: &AgentSelection) -> Result<Vec<AgentRecord>>;

    // Crash recovery
    async fn abandon_active_sessions(&self, note: &str) -> Result<u64>;
    async fn clear_carts(&self, agent_ids: &[AgentId]) -> Result<u64>;
}

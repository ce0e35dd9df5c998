use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::storage::traits::{AgentSession, SessionPool, Storage};
use crate::types::{AgentEvent, AgentId, AgentRecord, AgentSelection, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Active,
    Completed,
    Abandoned,
}

impl SessionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShoppingSession {
    pub id: SessionId,
    pub user_id: AgentId,
    pub status: SessionStatus,
    pub notes: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartItem {
    pub user_id: AgentId,
    pub product_id: String,
    pub quantity: u32,
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

/// Process-local store used by tests and `--in-memory` runs.
#[derive(Clone)]
pub struct InMemoryStore {
    agents: Arc<RwLock<Vec<AgentRecord>>>,
    sessions: Arc<RwLock<HashMap<SessionId, ShoppingSession>>>,
    carts: Arc<RwLock<Vec<CartItem>>>,
    events: Arc<RwLock<Vec<AgentEvent>>>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl InMemoryStore {
    pub const DEFAULT_CAPACITY: usize = 64;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            agents: Arc::new(RwLock::new(Vec::new())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            carts: Arc::new(RwLock::new(Vec::new())),
            events: Arc::new(RwLock::new(Vec::new())),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn add_agent(&self, agent: AgentRecord) -> Result<()> {
        self.agents.write().map_err(poisoned)?.push(agent);
        Ok(())
    }

    pub fn open_session(&self, user_id: AgentId) -> Result<SessionId> {
        let session = ShoppingSession {
            id: SessionId::new_v4(),
            user_id,
            status: SessionStatus::Active,
            notes: None,
            started_at: Utc::now(),
            ended_at: None,
        };
        let id = session.id;
        self.sessions.write().map_err(poisoned)?.insert(id, session);
        Ok(id)
    }

    pub fn get_session(&self, id: &SessionId) -> Result<Option<ShoppingSession>> {
        Ok(self.sessions.read().map_err(poisoned)?.get(id).cloned())
    }

    pub fn add_cart_item(&self, user_id: AgentId, product_id: &str, quantity: u32) -> Result<()> {
        self.carts.write().map_err(poisoned)?.push(CartItem {
            user_id,
            product_id: product_id.to_string(),
            quantity,
        });
        Ok(())
    }

    pub fn cart_items(&self, user_id: &AgentId) -> Result<Vec<CartItem>> {
        Ok(self
            .carts
            .read()
            .map_err(poisoned)?
            .iter()
            .filter(|c| &c.user_id == user_id)
            .cloned()
            .collect())
    }

    pub fn events(&self) -> Result<Vec<AgentEvent>> {
        Ok(self.events.read().map_err(poisoned)?.clone())
    }

    pub fn available_sessions(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStore {
    async fn load_agents(&self, selection: &AgentSelection) -> Result<Vec<AgentRecord>> {
        let agents = self.agents.read().map_err(poisoned)?;

        let selected = match selection {
            AgentSelection::All => agents.clone(),
            AgentSelection::Ids(ids) => agents
                .iter()
                .filter(|a| ids.contains(&a.id))
                .cloned()
                .collect(),
            AgentSelection::Random(count) => {
                let mut rng = rand::thread_rng();
                agents
                    .choose_multiple(&mut rng, *count)
                    .cloned()
                    .collect()
            }
        };

        Ok(selected)
    }

    async fn abandon_active_sessions(&self, note: &str) -> Result<u64> {
        let mut sessions = self.sessions.write().map_err(poisoned)?;
        let now = Utc::now();
        let mut abandoned = 0;

        for session in sessions.values_mut() {
            if session.status == SessionStatus::Active {
                session.status = SessionStatus::Abandoned;
                session.notes = Some(note.to_string());
                session.ended_at = Some(now);
                abandoned += 1;
            }
        }

        Ok(abandoned)
    }

    async fn clear_carts(&self, agent_ids: &[AgentId]) -> Result<u64> {
        let mut carts = self.carts.write().map_err(poisoned)?;
        let before = carts.len();
        carts.retain(|c| !agent_ids.contains(&c.user_id));
        Ok((before - carts.len()) as u64)
    }
}

/// Buffered session: events become visible only on commit.
pub struct MemorySession {
    pending: Vec<AgentEvent>,
    events: Arc<RwLock<Vec<AgentEvent>>>,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl AgentSession for MemorySession {
    fn record_event(&mut self, event: &AgentEvent) -> Result<()> {
        self.pending.push(event.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemorySession {
            pending, events, ..
        } = *self;
        events.write().map_err(poisoned)?.extend(pending);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SessionPool for InMemoryStore {
    async fn checkout(&self) -> Result<Box<dyn AgentSession>> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow!("session pool closed"))?;

        Ok(Box::new(MemorySession {
            pending: Vec::new(),
            events: self.events.clone(),
            _permit: permit,
        }))
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

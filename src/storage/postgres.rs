use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use tokio::runtime::Handle;

use crate::storage::traits::{AgentSession, SessionPool, Storage};
use crate::types::{AgentEvent, AgentId, AgentRecord, AgentSelection, PersonaTraits};

/// Connection pool sizing: `base` connections kept warm, up to `base + overflow` total.
#[derive(Debug, Clone, Copy)]
pub struct PoolSizing {
    pub base: u32,
    pub overflow: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolSizing {
    fn default() -> Self {
        Self {
            base: 20,
            overflow: 30,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolSizing {
    pub fn max_connections(&self) -> u32 {
        self.base + self.overflow
    }
}

pub struct PostgresStorage {
    pool: PgPool,
    capacity: usize,
}

impl PostgresStorage {
    pub async fn new(database_url: &str, sizing: PoolSizing) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(sizing.base)
            .max_connections(sizing.max_connections())
            .acquire_timeout(sizing.acquire_timeout)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool,
            capacity: sizing.max_connections() as usize,
        })
    }

    pub fn from_pool(pool: PgPool, capacity: usize) -> Self {
        Self { pool, capacity }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::raw_sql(include_str!("../../migrations/V001__initial_schema.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn agent_from_row(r: &PgRow) -> AgentRecord {
    AgentRecord {
        id: r.get("id"),
        display_name: r.get("display_name"),
        traits: PersonaTraits {
            shopping_frequency: r.get("shopping_frequency"),
            price_sensitivity: r.get("price_sensitivity"),
            impulse_factor: r.get("impulse_factor"),
        },
        created_at: r.get("created_at"),
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn load_agents(&self, selection: &AgentSelection) -> Result<Vec<AgentRecord>> {
        let rows = match selection {
            AgentSelection::All => {
                sqlx::query(
                    r#"
                    SELECT id, display_name, shopping_frequency, price_sensitivity,
                           impulse_factor, created_at
                    FROM agents
                    ORDER BY created_at, id
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
            AgentSelection::Ids(ids) => {
                sqlx::query(
                    r#"
                    SELECT id, display_name, shopping_frequency, price_sensitivity,
                           impulse_factor, created_at
                    FROM agents
                    WHERE id = ANY($1)
                    ORDER BY created_at, id
                    "#,
                )
                .bind(ids)
                .fetch_all(&self.pool)
                .await?
            }
            AgentSelection::Random(count) => {
                sqlx::query(
                    r#"
                    SELECT id, display_name, shopping_frequency, price_sensitivity,
                           impulse_factor, created_at
                    FROM agents
                    ORDER BY random()
                    LIMIT $1
                    "#,
                )
                .bind(*count as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.iter().map(agent_from_row).collect())
    }

    async fn abandon_active_sessions(&self, note: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE shopping_sessions
            SET status = 'abandoned',
                notes = COALESCE(notes || E'\n', '') || $1,
                ended_at = NOW()
            WHERE status = 'active'
            "#,
        )
        .bind(note)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn clear_carts(&self, agent_ids: &[AgentId]) -> Result<u64> {
        if agent_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM cart_items WHERE user_id = ANY($1)")
            .bind(agent_ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// One transaction per agent unit of work.
///
/// Sync calls from the blocking worker bridge back onto the runtime through
/// the captured handle. Dropping the session rolls the transaction back.
pub struct PgAgentSession {
    tx: Transaction<'static, Postgres>,
    handle: Handle,
}

#[async_trait]
impl AgentSession for PgAgentSession {
    fn record_event(&mut self, event: &AgentEvent) -> Result<()> {
        let query = sqlx::query(
            r#"
            INSERT INTO agent_events (agent_id, cycle, kind, simulated_time, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(event.agent_id)
        .bind(event.cycle as i64)
        .bind(event.kind.as_str())
        .bind(event.simulated_time)
        .bind(&event.payload);

        self.handle.block_on(query.execute(&mut *self.tx))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl SessionPool for PostgresStorage {
    async fn checkout(&self) -> Result<Box<dyn AgentSession>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgAgentSession {
            tx,
            handle: Handle::current(),
        }))
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

pub mod memory;
pub mod postgres;
pub mod traits;

pub use memory::InMemoryStore;
pub use postgres::{PoolSizing, PostgresStorage};
pub use traits::{AgentSession, SessionPool, Storage};

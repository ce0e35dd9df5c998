pub mod circuit_breaker;
pub mod executor;
pub mod orchestrator;
pub mod rate_limiter;
pub mod shutdown;
pub mod warmup;

pub use circuit_breaker::{BreakerEvent, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use executor::{ExecutorConfig, ParallelAgentExecutor};
pub use orchestrator::{
    Collaborators, Orchestrator, OrchestratorHandle, ResumeFrom, RunCommand, RunStatus,
};
pub use rate_limiter::TokenBucket;
pub use shutdown::StopSignal;
pub use warmup::WarmupController;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use crate::engine::circuit_breaker::CircuitBreaker;
use crate::engine::rate_limiter::TokenBucket;
use crate::engine::shutdown::StopSignal;
use crate::providers::DecisionGraph;
use crate::storage::SessionPool;
use crate::types::{
    AgentDecision, AgentId, AgentRecord, AgentResult, AgentTurn, CycleResult, ExecutionMode,
};

/// Configuration for the agent executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Blocking workers available to decision graphs at once
    pub worker_pool_size: usize,
    pub mode: ExecutionMode,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 16,
            mode: ExecutionMode::Parallel,
        }
    }
}

/// Everything a single agent task needs; shared by all tasks of a run.
struct TaskContext {
    rate_limiter: Arc<TokenBucket>,
    sessions: Arc<dyn SessionPool>,
    graph: Arc<dyn DecisionGraph>,
    workers: Arc<Semaphore>,
}

impl TaskContext {
    async fn run_agent(&self, turn: AgentTurn) -> AgentResult {
        let agent_id = turn.agent_id();
        let started = Instant::now();

        match self.process(turn).await {
            Ok(decision) => AgentResult::from_decision(agent_id, decision, started.elapsed()),
            Err(e) => {
                log::warn!("Agent {} failed: {:#}", agent_id, e);
                AgentResult::failed(agent_id, format!("{:#}", e), started.elapsed())
            }
        }
    }

    async fn process(&self, turn: AgentTurn) -> Result<AgentDecision> {
        self.rate_limiter.wait_and_acquire(1.0).await;

        let session = self
            .sessions
            .checkout()
            .await
            .context("session checkout failed")?;

        let permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .context("worker pool closed")?;

        let graph = self.graph.clone();
        let (session, outcome) = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let mut session = session;
            let outcome = graph.invoke(&turn, session.as_mut());
            (session, outcome)
        })
        .await
        .map_err(|e| anyhow!("decision worker failed: {}", e))?;

        match outcome {
            Ok(decision) if decision.is_success() => {
                session.commit().await.context("commit failed")?;
                Ok(decision)
            }
            Ok(decision) => {
                if let Err(e) = session.rollback().await {
                    log::warn!("Rollback after soft failure failed: {:#}", e);
                }
                Ok(decision)
            }
            Err(e) => {
                if let Err(rollback_err) = session.rollback().await {
                    log::warn!("Rollback after error failed: {:#}", rollback_err);
                }
                Err(e)
            }
        }
    }
}

/// Runs one cycle's agents concurrently and reports every one of them.
pub struct ParallelAgentExecutor {
    ctx: Arc<TaskContext>,
    stop: Arc<StopSignal>,
    config: ExecutorConfig,
}

impl ParallelAgentExecutor {
    pub fn new(
        rate_limiter: Arc<TokenBucket>,
        sessions: Arc<dyn SessionPool>,
        graph: Arc<dyn DecisionGraph>,
        stop: Arc<StopSignal>,
        config: ExecutorConfig,
    ) -> Self {
        let worker_pool_size = config.worker_pool_size.max(1);
        if sessions.capacity() < worker_pool_size {
            log::warn!(
                "Session pool capacity ({}) is below worker pool size ({}); workers may starve waiting for sessions",
                sessions.capacity(),
                worker_pool_size
            );
        }

        Self {
            ctx: Arc::new(TaskContext {
                rate_limiter,
                sessions,
                graph,
                workers: Arc::new(Semaphore::new(worker_pool_size)),
            }),
            stop,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute all `agents` for `cycle`.
    ///
    /// Failure accounting against `breaker` happens after every agent has
    /// resolved. If the run is stopped mid-cycle the in-flight tasks are
    /// cancelled and an empty result is returned; writes already committed
    /// by finished agents stay committed.
    pub async fn execute_cycle(
        &self,
        agents: &[Arc<AgentRecord>],
        cycle: u64,
        simulated_time: Option<DateTime<Utc>>,
        breaker: &mut CircuitBreaker,
    ) -> CycleResult {
        if self.stop.is_triggered() {
            return CycleResult::empty(cycle);
        }

        let started = Instant::now();
        let turns: Vec<AgentTurn> = agents
            .iter()
            .map(|agent| AgentTurn {
                agent: agent.clone(),
                cycle,
                simulated_time,
            })
            .collect();

        let results = match self.config.mode {
            ExecutionMode::Parallel => self.run_parallel(turns).await,
            ExecutionMode::Sequential => self.run_sequential(turns).await,
        };

        let Some(results) = results else {
            log::info!("Cycle {} cancelled; discarding partial results", cycle);
            return CycleResult::empty(cycle);
        };

        for result in &results {
            if result.success {
                breaker.record_success();
            } else {
                breaker.record_failure(
                    result.agent_id,
                    result.error.as_deref().unwrap_or("unknown error"),
                );
            }
        }

        let cycle_result = CycleResult::from_results(cycle, results, started.elapsed());
        log::debug!(
            "Cycle {}: {} processed, {} acted, {} errors in {:?}",
            cycle,
            cycle_result.agents_processed,
            cycle_result.agents_acted,
            cycle_result.errors,
            cycle_result.duration
        );
        cycle_result
    }

    async fn run_parallel(&self, turns: Vec<AgentTurn>) -> Option<Vec<AgentResult>> {
        let ids: Vec<AgentId> = turns.iter().map(|t| t.agent_id()).collect();

        let handles: Vec<_> = turns
            .into_iter()
            .map(|turn| {
                let ctx = self.ctx.clone();
                tokio::spawn(async move { ctx.run_agent(turn).await })
            })
            .collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        let gather = join_all(handles);
        tokio::pin!(gather);

        tokio::select! {
            joined = &mut gather => {
                let results = joined
                    .into_iter()
                    .zip(ids)
                    .map(|(joined, agent_id)| match joined {
                        Ok(result) => result,
                        Err(e) => AgentResult::failed(
                            agent_id,
                            format!("agent task failed: {}", e),
                            Duration::ZERO,
                        ),
                    })
                    .collect();
                Some(results)
            }
            () = self.stop.wait() => {
                for abort in &aborts {
                    abort.abort();
                }
                // Wait for cancellation to land before the next cycle can start.
                let _ = gather.await;
                None
            }
        }
    }

    async fn run_sequential(&self, turns: Vec<AgentTurn>) -> Option<Vec<AgentResult>> {
        let mut results = Vec::with_capacity(turns.len());

        for turn in turns {
            if self.stop.is_triggered() {
                return None;
            }
            tokio::select! {
                result = self.ctx.run_agent(turn) => results.push(result),
                () = self.stop.wait() => return None,
            }
        }

        Some(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{AgentSession, InMemoryStore};
    use crate::types::{AgentEvent, OutcomeTag, PersonaTraits};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct ScriptedGraph {
        errors: HashSet<AgentId>,
        soft_failures: HashSet<AgentId>,
        panics: HashSet<AgentId>,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl DecisionGraph for ScriptedGraph {
        fn invoke(
            &self,
            turn: &AgentTurn,
            session: &mut dyn AgentSession,
        ) -> Result<AgentDecision> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let id = turn.agent_id();
            session.record_event(&AgentEvent::new(turn, OutcomeTag::Browsed))?;

            if self.panics.contains(&id) {
                panic!("graph blew up");
            }
            if self.errors.contains(&id) {
                return Err(anyhow!("backend returned 500"));
            }
            if self.soft_failures.contains(&id) {
                return Ok(AgentDecision::failed(OutcomeTag::AddedToCart, "cart rejected"));
            }
            Ok(AgentDecision::acted(OutcomeTag::Browsed, 1))
        }
    }

    fn agents(count: usize) -> Vec<Arc<AgentRecord>> {
        (0..count)
            .map(|i| Arc::new(AgentRecord::new(format!("a{}", i), PersonaTraits::default())))
            .collect()
    }

    fn executor(
        store: &InMemoryStore,
        graph: Arc<ScriptedGraph>,
        stop: Arc<StopSignal>,
        config: ExecutorConfig,
    ) -> ParallelAgentExecutor {
        ParallelAgentExecutor::new(
            Arc::new(TokenBucket::per_second(10_000.0)),
            Arc::new(store.clone()),
            graph,
            stop,
            config,
        )
    }

    #[tokio::test]
    async fn test_errors_are_counted_not_dropped() {
        let population = agents(20);
        let failing: HashSet<AgentId> = population.iter().take(3).map(|a| a.id).collect();
        let graph = Arc::new(ScriptedGraph {
            errors: failing.clone(),
            ..Default::default()
        });
        let store = InMemoryStore::new();
        let exec = executor(&store, graph, Arc::new(StopSignal::new()), ExecutorConfig::default());
        let mut breaker = CircuitBreaker::new(20, 50.0);

        let result = exec.execute_cycle(&population, 1, None, &mut breaker).await;

        assert_eq!(result.agents_processed, 20);
        assert_eq!(result.errors, 3);
        assert_eq!(result.agents_acted, 17);
        assert_eq!(breaker.cycle_failures(), 3);
        for r in result.agent_results.iter().filter(|r| !r.success) {
            assert!(failing.contains(&r.agent_id));
            assert!(r.error.as_deref().unwrap().contains("backend returned 500"));
        }
        // Failed agents' writes were rolled back.
        assert_eq!(store.events().unwrap().len(), 17);
    }

    #[tokio::test]
    async fn test_soft_failure_rolls_back_and_counts() {
        let population = agents(4);
        let graph = Arc::new(ScriptedGraph {
            soft_failures: [population[0].id].into_iter().collect(),
            ..Default::default()
        });
        let store = InMemoryStore::new();
        let exec = executor(&store, graph, Arc::new(StopSignal::new()), ExecutorConfig::default());
        let mut breaker = CircuitBreaker::new(4, 5.0);

        let result = exec.execute_cycle(&population, 1, None, &mut breaker).await;

        assert_eq!(result.errors, 1);
        assert_eq!(breaker.cycle_failures(), 1);
        assert!(!breaker.is_open());
        assert_eq!(store.events().unwrap().len(), 3);
        assert_eq!(store.available_sessions(), InMemoryStore::DEFAULT_CAPACITY);
    }

    #[tokio::test]
    async fn test_panicking_agent_reported_as_failure() {
        let population = agents(5);
        let graph = Arc::new(ScriptedGraph {
            panics: [population[2].id].into_iter().collect(),
            ..Default::default()
        });
        let store = InMemoryStore::new();
        let exec = executor(&store, graph, Arc::new(StopSignal::new()), ExecutorConfig::default());
        let mut breaker = CircuitBreaker::new(5, 5.0);

        let result = exec.execute_cycle(&population, 2, None, &mut breaker).await;

        assert_eq!(result.agents_processed, 5);
        assert_eq!(result.errors, 1);
        let failed = result.agent_results.iter().find(|r| !r.success).unwrap();
        assert_eq!(failed.agent_id, population[2].id);
        assert_eq!(failed.outcome_tag, OutcomeTag::Failed);
        assert_eq!(store.available_sessions(), InMemoryStore::DEFAULT_CAPACITY);
    }

    #[tokio::test]
    async fn test_breaker_opens_on_failure_storm() {
        let population = agents(10);
        let graph = Arc::new(ScriptedGraph {
            errors: population.iter().map(|a| a.id).collect(),
            ..Default::default()
        });
        let store = InMemoryStore::new();
        let exec = executor(&store, graph, Arc::new(StopSignal::new()), ExecutorConfig::default());
        let mut breaker = CircuitBreaker::new(10, 10.0);

        exec.execute_cycle(&population, 1, None, &mut breaker).await;
        assert!(breaker.is_open());
    }

    #[tokio::test]
    async fn test_worker_pool_bounds_concurrency() {
        let population = agents(12);
        let graph = Arc::new(ScriptedGraph {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let store = InMemoryStore::new();
        let config = ExecutorConfig {
            worker_pool_size: 2,
            mode: ExecutionMode::Parallel,
        };
        let exec = executor(&store, graph.clone(), Arc::new(StopSignal::new()), config);
        let mut breaker = CircuitBreaker::new(12, 5.0);

        let result = exec.execute_cycle(&population, 1, None, &mut breaker).await;

        assert_eq!(result.agents_processed, 12);
        assert!(graph.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_sequential_mode_runs_everyone() {
        let population = agents(6);
        let graph = Arc::new(ScriptedGraph {
            delay: Duration::from_millis(2),
            ..Default::default()
        });
        let store = InMemoryStore::new();
        let config = ExecutorConfig {
            worker_pool_size: 8,
            mode: ExecutionMode::Sequential,
        };
        let exec = executor(&store, graph.clone(), Arc::new(StopSignal::new()), config);
        let mut breaker = CircuitBreaker::new(6, 5.0);

        let result = exec.execute_cycle(&population, 1, None, &mut breaker).await;

        assert_eq!(result.agents_processed, 6);
        assert_eq!(graph.max_in_flight.load(Ordering::SeqCst), 1);
        let order: Vec<_> = result.agent_results.iter().map(|r| r.agent_id).collect();
        let expected: Vec<_> = population.iter().map(|a| a.id).collect();
        assert_eq!(order, expected);
    }

    #[tokio::test]
    async fn test_stop_mid_cycle_returns_empty() {
        let population = agents(8);
        let graph = Arc::new(ScriptedGraph {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let store = InMemoryStore::new();
        let stop = Arc::new(StopSignal::new());
        let exec = executor(&store, graph, stop.clone(), ExecutorConfig {
            worker_pool_size: 1,
            mode: ExecutionMode::Parallel,
        });
        let mut breaker = CircuitBreaker::new(8, 5.0);

        let trigger = {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                stop.trigger();
            })
        };

        let started = Instant::now();
        let result = exec.execute_cycle(&population, 7, None, &mut breaker).await;
        trigger.await.unwrap();

        assert_eq!(result.cycle_number, 7);
        assert_eq!(result.agents_processed, 0);
        assert!(result.agent_results.is_empty());
        assert_eq!(breaker.total_failures(), 0);
        // Eight serialized 200ms agents would take 1.6s.
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_already_stopped_skips_dispatch() {
        let population = agents(3);
        let graph = Arc::new(ScriptedGraph::default());
        let store = InMemoryStore::new();
        let stop = Arc::new(StopSignal::new());
        stop.trigger();
        let exec = executor(&store, graph.clone(), stop, ExecutorConfig::default());
        let mut breaker = CircuitBreaker::new(3, 5.0);

        let result = exec.execute_cycle(&population, 1, None, &mut breaker).await;
        assert_eq!(result.agents_processed, 0);
        assert_eq!(graph.max_in_flight.load(Ordering::SeqCst), 0);
    }
}

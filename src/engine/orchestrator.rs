use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::checkpoint::{CheckpointManager, RecoveryReport, RunState};
use crate::config::SimConfig;
use crate::engine::circuit_breaker::{BreakerEvent, BreakerSnapshot, CircuitBreaker};
use crate::engine::executor::{ExecutorConfig, ParallelAgentExecutor};
use crate::engine::rate_limiter::TokenBucket;
use crate::engine::shutdown::StopSignal;
use crate::engine::warmup::WarmupController;
use crate::error::SimError;
use crate::lifecycle::{RunEvent, RunPhase, RunStateMachine};
use crate::providers::{DecisionGraph, SimulatedClock, TimeService};
use crate::storage::{InMemoryStore, SessionPool, Storage};
use crate::types::{AgentId, AgentRecord, SimulationStats};

const PAUSE_POLL: Duration = Duration::from_millis(500);
const EVENT_BUFFER: usize = 64;
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Requests the orchestrator accepts from outside its own task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCommand {
    ResetCircuitBreaker,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResumeFrom {
    #[default]
    Fresh,
    Latest,
    Path(PathBuf),
}

/// Read-only view of the run, republished after every state change.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub phase: RunPhase,
    pub cycle: u64,
    pub active_agents: usize,
    pub total_agents: usize,
    pub simulated_time: Option<DateTime<Utc>>,
    pub breaker: BreakerSnapshot,
    pub statistics: SimulationStats,
}

/// External collaborators the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub storage: Arc<dyn Storage>,
    pub sessions: Arc<dyn SessionPool>,
    pub time: Arc<dyn TimeService>,
    pub graph: Arc<dyn DecisionGraph>,
}

impl Collaborators {
    pub fn in_memory(store: InMemoryStore, graph: Arc<dyn DecisionGraph>) -> Self {
        let store = Arc::new(store);
        Self {
            storage: store.clone(),
            sessions: store,
            time: Arc::new(SimulatedClock::starting_now()),
            graph,
        }
    }
}

/// Cloneable control surface for a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::UnboundedSender<RunCommand>,
    status: watch::Receiver<RunStatus>,
    events: broadcast::Sender<BreakerEvent>,
    stop: Arc<StopSignal>,
}

impl OrchestratorHandle {
    pub fn status(&self) -> RunStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<RunStatus> {
        self.status.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    pub fn reset_circuit_breaker(&self) -> Result<()> {
        self.commands
            .send(RunCommand::ResetCircuitBreaker)
            .map_err(|_| anyhow::anyhow!("orchestrator is no longer running"))
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_triggered()
    }

    /// Stop the run, cancelling any cycle in flight.
    pub fn stop(&self) {
        self.stop.trigger();
        let _ = self.commands.send(RunCommand::Stop);
    }
}

pub struct Orchestrator {
    config: SimConfig,
    storage: Arc<dyn Storage>,
    time: Arc<dyn TimeService>,
    executor: ParallelAgentExecutor,
    checkpoints: CheckpointManager,
    rate_limiter: Arc<TokenBucket>,
    breaker: CircuitBreaker,
    warmup: WarmupController,
    state: RunState,
    phase: RunPhase,
    resume: ResumeFrom,
    agents: Vec<Arc<AgentRecord>>,
    stop: Arc<StopSignal>,
    commands: mpsc::UnboundedReceiver<RunCommand>,
    status_tx: watch::Sender<RunStatus>,
    breaker_rx: Option<mpsc::UnboundedReceiver<BreakerEvent>>,
    handle: OrchestratorHandle,
}

impl Orchestrator {
    pub fn new(config: SimConfig, collaborators: Collaborators) -> Result<Self, SimError> {
        config.validate()?;

        let Collaborators {
            storage,
            sessions,
            time,
            graph,
        } = collaborators;

        let stop = Arc::new(StopSignal::new());
        let rate_limiter = Arc::new(TokenBucket::per_second(config.rate_limit));
        let executor = ParallelAgentExecutor::new(
            rate_limiter.clone(),
            sessions,
            graph,
            stop.clone(),
            ExecutorConfig {
                worker_pool_size: config.worker_pool_size,
                mode: config.execution_mode,
            },
        );
        let checkpoints = CheckpointManager::from_config(&config, storage.clone());

        let (breaker_tx, breaker_rx) = mpsc::unbounded_channel();
        let breaker = CircuitBreaker::new(0, config.failure_threshold_pct).with_events(breaker_tx);
        let warmup = WarmupController::new(0, config.warmup_cycles);
        let state = RunState::new(config.clone());

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (status_tx, status_rx) = watch::channel(RunStatus {
            phase: RunPhase::Init,
            cycle: 0,
            active_agents: 0,
            total_agents: 0,
            simulated_time: None,
            breaker: breaker.snapshot(),
            statistics: state.statistics.clone(),
        });

        let handle = OrchestratorHandle {
            commands: commands_tx,
            status: status_rx,
            events: events_tx,
            stop: stop.clone(),
        };

        Ok(Self {
            config,
            storage,
            time,
            executor,
            checkpoints,
            rate_limiter,
            breaker,
            warmup,
            state,
            phase: RunPhase::Init,
            resume: ResumeFrom::Fresh,
            agents: Vec::new(),
            stop,
            commands,
            status_tx,
            breaker_rx: Some(breaker_rx),
            handle,
        })
    }

    pub fn with_resume(mut self, resume: ResumeFrom) -> Self {
        self.resume = resume;
        self
    }

    pub fn handle(&self) -> OrchestratorHandle {
        self.handle.clone()
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Load the population, size the controllers and optionally resume.
    pub async fn initialize(&mut self) -> Result<Option<RecoveryReport>> {
        let agents = match self.storage.load_agents(&self.config.selection).await {
            Ok(agents) if agents.is_empty() => {
                self.transition(RunEvent::InitFailed)?;
                return Err(SimError::AgentLoad("no agents matched the selection".into()).into());
            }
            Ok(agents) => agents,
            Err(e) => {
                self.transition(RunEvent::InitFailed)?;
                return Err(SimError::AgentLoad(format!("{:#}", e)).into());
            }
        };

        self.agents = agents.into_iter().map(Arc::new).collect();
        let total = self.agents.len();
        self.breaker.update_total_agents(total);
        self.warmup.set_total_agents(total);

        log::info!(
            "Loaded {} agents (breaker threshold {}, warmup {} cycles, rate limit {}/s)",
            total,
            self.breaker.threshold(),
            self.config.warmup_cycles,
            self.config.rate_limit
        );

        let report = match self.resume_path()? {
            Some(path) => {
                let ids: Vec<AgentId> = self.agents.iter().map(|a| a.id).collect();
                let report = self.checkpoints.resume(&path, &mut self.state, &ids).await?;
                self.warmup.set_cycle(self.state.cycle);
                if let Some(at) = self.state.simulated_time {
                    self.time.restore(at).await?;
                }
                Some(report)
            }
            None => None,
        };

        self.transition(RunEvent::AgentsLoaded)?;
        Ok(report)
    }

    fn resume_path(&self) -> Result<Option<PathBuf>, SimError> {
        match &self.resume {
            ResumeFrom::Fresh => Ok(None),
            ResumeFrom::Path(path) => Ok(Some(path.clone())),
            ResumeFrom::Latest => {
                let latest = self.checkpoints.find_latest()?;
                if latest.is_none() {
                    log::info!(
                        "No checkpoint found in {}; starting fresh",
                        self.checkpoints.dir().display()
                    );
                }
                Ok(latest)
            }
        }
    }

    /// Drive cycles until the duration elapses or a stop is requested.
    pub async fn run(mut self) -> Result<SimulationStats> {
        let consumer = self
            .breaker_rx
            .take()
            .map(|rx| spawn_event_consumer(rx, self.handle.events.clone()));

        let outcome = self.drive().await;
        let statistics = self.state.statistics.clone();

        // Closing the breaker's sender lets the consumer drain and exit.
        drop(self);
        if let Some(consumer) = consumer {
            let _ = consumer.await;
        }

        outcome.map(|()| statistics)
    }

    async fn drive(&mut self) -> Result<()> {
        if self.phase == RunPhase::Init {
            self.initialize().await?;
        }

        let run_for = self.config.run_duration()?;
        let deadline = saturating_add(Instant::now(), run_for);
        let target = self.config.target_interval()?;

        loop {
            self.drain_commands()?;

            if self.stop.is_triggered() {
                self.transition(RunEvent::StopRequested)?;
                break;
            }
            if Instant::now() >= deadline {
                log::info!("Run duration of {:.2}h reached", self.config.duration_hours);
                self.transition(RunEvent::DurationElapsed)?;
                break;
            }

            if self.phase == RunPhase::Paused {
                let stop = self.stop.clone();
                let command = tokio::select! {
                    _ = tokio::time::sleep(PAUSE_POLL) => None,
                    () = stop.wait() => None,
                    command = self.commands.recv() => command,
                };
                if let Some(command) = command {
                    self.apply(command)?;
                }
                continue;
            }

            let cycle_started = Instant::now();
            if !self.run_cycle().await? {
                continue;
            }

            let elapsed = cycle_started.elapsed();
            if elapsed > target {
                log::warn!(
                    "Cycle {} overran its {:?} interval by {:?}",
                    self.state.cycle,
                    target,
                    elapsed - target
                );
            } else {
                self.pace_until(saturating_add(cycle_started, target).min(deadline))
                    .await?;
            }
        }

        let stats = &self.state.statistics;
        log::info!(
            "Run finished after {} cycles: {} agents processed, {} acted, {} events, {} errors",
            stats.cycles_completed,
            stats.agents_processed,
            stats.agents_acted,
            stats.events_created,
            stats.errors
        );
        let limiter = self.rate_limiter.metrics().await;
        log::debug!(
            "Rate limiter: {} tokens, {:.2}s total wait, {:.3}s max wait",
            limiter.tokens_acquired,
            limiter.total_wait_secs,
            limiter.max_wait_secs
        );

        Ok(())
    }

    /// Returns false when the cycle was cancelled by a stop.
    async fn run_cycle(&mut self) -> Result<bool> {
        let cycle = self.state.cycle + 1;
        let active = self.warmup.get_active_agent_count();
        let ids: Vec<AgentId> = self.agents[..active].iter().map(|a| a.id).collect();

        match self.time.advance(1.0, Some(&ids)).await {
            Ok(outcome) => {
                self.state.simulated_time = Some(outcome.simulated_time);
                log::debug!(
                    "Advanced to {} ({} offers assigned, {} users refreshed)",
                    outcome.simulated_time,
                    outcome.offers_assigned,
                    outcome.users_refreshed
                );
            }
            Err(e) => log::warn!("Time advance failed for cycle {}: {:#}", cycle, e),
        }

        self.breaker.reset_cycle();
        let result = self
            .executor
            .execute_cycle(
                &self.agents[..active],
                cycle,
                self.state.simulated_time,
                &mut self.breaker,
            )
            .await;

        if self.stop.is_triggered() && result.agent_results.is_empty() {
            return Ok(false);
        }

        self.state.cycle = cycle;
        self.warmup.advance();
        self.state.statistics.record_cycle(&result);

        log::info!(
            "Cycle {} complete: {}/{} agents acted, {} errors, {:.2}s",
            cycle,
            result.agents_acted,
            result.agents_processed,
            result.errors,
            result.duration.as_secs_f64()
        );

        if self.breaker.is_open() && self.phase == RunPhase::Running {
            log::error!(
                "Circuit breaker open after {} failures in cycle {}; pausing until reset",
                self.breaker.cycle_failures(),
                cycle
            );
            self.transition(RunEvent::CircuitOpened)?;
        }

        if self.checkpoints.should_save(cycle) {
            if let Err(e) = self.checkpoints.persist(self.state.clone(), cycle).await {
                log::error!("Checkpoint for cycle {} failed: {}", cycle, e);
            }
        }

        self.publish_status();
        Ok(true)
    }

    async fn pace_until(&mut self, until: Instant) -> Result<(), SimError> {
        loop {
            let stop = self.stop.clone();
            let command = tokio::select! {
                _ = tokio::time::sleep_until(until) => return Ok(()),
                () = stop.wait() => return Ok(()),
                command = self.commands.recv() => command,
            };
            match command {
                Some(command) => self.apply(command)?,
                None => return Ok(()),
            }
        }
    }

    fn drain_commands(&mut self) -> Result<(), SimError> {
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command)?;
        }
        Ok(())
    }

    fn apply(&mut self, command: RunCommand) -> Result<(), SimError> {
        match command {
            RunCommand::ResetCircuitBreaker => {
                log::info!("Manual circuit breaker reset");
                self.breaker.manual_reset();
                if matches!(self.phase, RunPhase::Running | RunPhase::Paused) {
                    self.transition(RunEvent::ManualReset)?;
                } else {
                    self.publish_status();
                }
            }
            RunCommand::Stop => self.stop.trigger(),
        }
        Ok(())
    }

    fn transition(&mut self, event: RunEvent) -> Result<(), SimError> {
        let next = RunStateMachine::transition(self.phase, event)?;
        if next != self.phase {
            log::info!("Run {} -> {} ({:?})", self.phase.as_str(), next.as_str(), event);
        }
        self.phase = next;
        self.publish_status();
        Ok(())
    }

    fn publish_status(&self) {
        let active_agents = if self.agents.is_empty() {
            0
        } else {
            self.warmup.get_active_agent_count()
        };

        self.status_tx.send_replace(RunStatus {
            phase: self.phase,
            cycle: self.state.cycle,
            active_agents,
            total_agents: self.agents.len(),
            simulated_time: self.state.simulated_time,
            breaker: self.breaker.snapshot(),
            statistics: self.state.statistics.clone(),
        });
    }
}

fn spawn_event_consumer(
    mut rx: mpsc::UnboundedReceiver<BreakerEvent>,
    subscribers: broadcast::Sender<BreakerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match &event {
                BreakerEvent::Opened { at, .. } => {
                    log::debug!("Forwarding breaker open event ({})", at)
                }
                BreakerEvent::Reset { at } => log::debug!("Forwarding breaker reset event ({})", at),
            }
            // Nobody listening is fine.
            let _ = subscribers.send(event);
        }
    })
}

/// `start + span`, saturating about thirty years out.
fn saturating_add(start: Instant, span: Duration) -> Instant {
    start
        .checked_add(span)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

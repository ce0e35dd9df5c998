//! End-to-end runs of the orchestrator against the in-memory store.

use anyhow::Result;
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

use shopsim::api::{create_router, AppState};
use shopsim::checkpoint::{CheckpointManager, RunState};
use shopsim::engine::{BreakerState, Collaborators, Orchestrator, ResumeFrom};
use shopsim::lifecycle::RunPhase;
use shopsim::providers::DecisionGraph;
use shopsim::storage::memory::SessionStatus;
use shopsim::storage::{AgentSession, InMemoryStore};
use shopsim::types::{
    AgentDecision, AgentEvent, AgentRecord, AgentTurn, ExecutionMode, OutcomeTag, PersonaTraits,
};
use shopsim::SimConfig;

/// Records one event per agent and can be flipped into a failing backend.
#[derive(Default)]
struct ScriptedGraph {
    failing: AtomicBool,
    invocations: AtomicUsize,
}

impl DecisionGraph for ScriptedGraph {
    fn invoke(&self, turn: &AgentTurn, session: &mut dyn AgentSession) -> Result<AgentDecision> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        session.record_event(&AgentEvent::new(turn, OutcomeTag::Browsed))?;
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("checkout service returned 503");
        }
        Ok(AgentDecision::acted(OutcomeTag::Browsed, 1))
    }
}

fn seeded_store(count: usize) -> (InMemoryStore, Vec<AgentRecord>) {
    let store = InMemoryStore::new();
    let agents: Vec<AgentRecord> = (0..count)
        .map(|i| AgentRecord::new(format!("shopper-{}", i), PersonaTraits::default()))
        .collect();
    for agent in &agents {
        store.add_agent(agent.clone()).unwrap();
    }
    (store, agents)
}

fn base_config(dir: &TempDir) -> SimConfig {
    SimConfig {
        duration_hours: 0.02,
        warmup_cycles: 0,
        rate_limit: 10.0,
        checkpoint_interval: 0,
        checkpoint_dir: dir.path().to_path_buf(),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_sequential_run_commits_every_agent() {
    let dir = TempDir::new().unwrap();
    let (store, _) = seeded_store(6);
    let graph = Arc::new(ScriptedGraph::default());
    let config = SimConfig {
        execution_mode: ExecutionMode::Sequential,
        ..base_config(&dir)
    };

    let stats = Orchestrator::new(config, Collaborators::in_memory(store.clone(), graph.clone()))
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(stats.cycles_completed, 2);
    assert_eq!(stats.agents_processed, 12);
    assert_eq!(stats.events_created, 12);
    assert_eq!(stats.outcomes.get("browsed"), Some(&12));
    assert_eq!(graph.invocations.load(Ordering::SeqCst), 12);
    assert_eq!(store.events().unwrap().len(), 12);
}

#[tokio::test(start_paused = true)]
async fn test_failed_agents_leave_no_writes() {
    let dir = TempDir::new().unwrap();
    let (store, _) = seeded_store(4);
    let graph = Arc::new(ScriptedGraph::default());
    graph.failing.store(true, Ordering::SeqCst);
    let config = SimConfig {
        // Four failures never exceed a threshold of four.
        failure_threshold_pct: 100.0,
        ..base_config(&dir)
    };

    let stats = Orchestrator::new(config, Collaborators::in_memory(store.clone(), graph))
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(stats.cycles_completed, 2);
    assert_eq!(stats.errors, 8);
    assert!(stats.last_error.unwrap().contains("503"));
    assert!(store.events().unwrap().is_empty());
    assert_eq!(store.available_sessions(), InMemoryStore::DEFAULT_CAPACITY);
}

#[tokio::test(start_paused = true)]
async fn test_dashboard_reset_resumes_paused_run() {
    let dir = TempDir::new().unwrap();
    let (store, _) = seeded_store(10);
    let graph = Arc::new(ScriptedGraph::default());
    graph.failing.store(true, Ordering::SeqCst);
    let config = SimConfig {
        duration_hours: 10.0,
        time_scale: 3600.0,
        rate_limit: 1000.0,
        ..base_config(&dir)
    };

    let orchestrator =
        Orchestrator::new(config, Collaborators::in_memory(store, graph.clone())).unwrap();
    let handle = orchestrator.handle();
    let app = create_router(AppState {
        handle: handle.clone(),
    });
    let mut status = handle.watch_status();
    let run = tokio::spawn(orchestrator.run());

    status
        .wait_for(|s| s.phase == RunPhase::Paused)
        .await
        .unwrap();
    assert_eq!(handle.status().breaker.state, BreakerState::Open);

    graph.failing.store(false, Ordering::SeqCst);
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/circuit-breaker/reset")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    status
        .wait_for(|s| s.phase == RunPhase::Running && s.statistics.agents_acted >= 10)
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/stop")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let stats = run.await.unwrap().unwrap();
    assert!(stats.cycles_completed >= 2);
    assert_eq!(stats.errors, 10);
    assert_eq!(handle.status().phase, RunPhase::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_resume_cleans_up_after_crash() {
    let dir = TempDir::new().unwrap();
    let (store, agents) = seeded_store(3);
    let config = base_config(&dir);

    // State a crashed process would have left behind.
    let mut crashed = RunState::new(config.clone());
    crashed.cycle = 41;
    crashed.statistics.cycles_completed = 41;
    crashed.statistics.agents_processed = 123;
    let manager = CheckpointManager::from_config(&config, Arc::new(store.clone()));
    let checkpoint = manager.save(&crashed, crashed.cycle).unwrap();

    let stale_session = store.open_session(agents[0].id).unwrap();
    store.add_cart_item(agents[1].id, "sku-42", 3).unwrap();

    let mut orchestrator = Orchestrator::new(
        config,
        Collaborators::in_memory(store.clone(), Arc::new(ScriptedGraph::default())),
    )
    .unwrap()
    .with_resume(ResumeFrom::Path(checkpoint));

    let report = orchestrator.initialize().await.unwrap().unwrap();
    assert_eq!(report.cycle, 41);
    assert_eq!(report.sessions_abandoned, 1);
    assert_eq!(report.cart_items_cleared, 1);

    let session = store.get_session(&stale_session).unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Abandoned);
    assert!(session.notes.is_some());
    assert!(store.cart_items(&agents[1].id).unwrap().is_empty());

    let stats = orchestrator.run().await.unwrap();
    assert_eq!(stats.cycles_completed, 43);
    assert_eq!(stats.agents_processed, 129);
}

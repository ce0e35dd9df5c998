use serde::{Deserialize, Serialize};

use crate::error::SimError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    Init,     // Loading agents, sizing controllers
    Running,  // Dispatching cycles
    Paused,   // Circuit breaker open, waiting for an operator
    Stopped,  // Terminal
}

impl RunPhase {
    pub fn as_str(&self) -> &str {
        match self {
            RunPhase::Init => "Init",
            RunPhase::Running => "Running",
            RunPhase::Paused => "Paused",
            RunPhase::Stopped => "Stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == RunPhase::Stopped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunEvent {
    AgentsLoaded,
    InitFailed,
    CircuitOpened,
    ManualReset,
    DurationElapsed,
    StopRequested,
}

pub struct RunStateMachine;

impl RunStateMachine {
    pub fn transition(phase: RunPhase, event: RunEvent) -> Result<RunPhase, SimError> {
        let next = match (phase, event) {
            (RunPhase::Init, RunEvent::AgentsLoaded) => RunPhase::Running,
            (RunPhase::Init, RunEvent::InitFailed) => RunPhase::Stopped,

            (RunPhase::Running, RunEvent::CircuitOpened) => RunPhase::Paused,
            (RunPhase::Paused, RunEvent::ManualReset) => RunPhase::Running,
            // A reset while already running is harmless; the breaker may have
            // been closed before the pause was observed.
            (RunPhase::Running, RunEvent::ManualReset) => RunPhase::Running,

            (
                RunPhase::Init | RunPhase::Running | RunPhase::Paused,
                RunEvent::StopRequested | RunEvent::DurationElapsed,
            ) => RunPhase::Stopped,

            (RunPhase::Stopped, RunEvent::StopRequested) => RunPhase::Stopped,

            (from, event) => return Err(SimError::InvalidTransition { from, event }),
        };

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_to_running() {
        let next = RunStateMachine::transition(RunPhase::Init, RunEvent::AgentsLoaded).unwrap();
        assert_eq!(next, RunPhase::Running);
    }

    #[test]
    fn test_init_failure_stops() {
        let next = RunStateMachine::transition(RunPhase::Init, RunEvent::InitFailed).unwrap();
        assert_eq!(next, RunPhase::Stopped);
    }

    #[test]
    fn test_running_pauses_on_open_circuit() {
        let next =
            RunStateMachine::transition(RunPhase::Running, RunEvent::CircuitOpened).unwrap();
        assert_eq!(next, RunPhase::Paused);
    }

    #[test]
    fn test_paused_resumes_only_on_manual_reset() {
        let next = RunStateMachine::transition(RunPhase::Paused, RunEvent::ManualReset).unwrap();
        assert_eq!(next, RunPhase::Running);

        let result = RunStateMachine::transition(RunPhase::Paused, RunEvent::AgentsLoaded);
        assert!(result.is_err());
    }

    #[test]
    fn test_pause_requires_running() {
        assert!(RunStateMachine::transition(RunPhase::Init, RunEvent::CircuitOpened).is_err());
        assert!(RunStateMachine::transition(RunPhase::Stopped, RunEvent::CircuitOpened).is_err());
    }

    #[test]
    fn test_stop_from_any_live_phase() {
        for phase in [RunPhase::Init, RunPhase::Running, RunPhase::Paused] {
            let next = RunStateMachine::transition(phase, RunEvent::StopRequested).unwrap();
            assert_eq!(next, RunPhase::Stopped);
        }
    }

    #[test]
    fn test_stopped_is_terminal() {
        assert!(RunPhase::Stopped.is_terminal());
        assert!(RunStateMachine::transition(RunPhase::Stopped, RunEvent::ManualReset).is_err());
        assert!(RunStateMachine::transition(RunPhase::Stopped, RunEvent::AgentsLoaded).is_err());
    }
}

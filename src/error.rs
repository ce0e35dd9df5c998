use std::path::PathBuf;

use crate::lifecycle::{RunEvent, RunPhase};

/// Typed failures surfaced by the simulation engine.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("Checkpoint I/O error at {path}: {source}")]
    CheckpointIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint format error: {0}")]
    CheckpointFormat(#[from] serde_json::Error),

    #[error("Unsupported checkpoint version '{found}' (expected '{expected}')")]
    CheckpointVersion { found: String, expected: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to load agents: {0}")]
    AgentLoad(String),

    #[error("Invalid run transition from {from:?} on {event:?}")]
    InvalidTransition { from: RunPhase, event: RunEvent },
}

impl SimError {
    pub fn checkpoint_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SimError::CheckpointIo {
            path: path.into(),
            source,
        }
    }
}

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::config::SimConfig;
use crate::error::SimError;
use crate::storage::Storage;
use crate::types::{AgentId, SimulationStats};

pub const CHECKPOINT_VERSION: &str = "1.0";

const FILE_PREFIX: &str = "checkpoint_";
const FILE_SUFFIX: &str = ".json";
const RECOVERY_NOTE: &str = "abandoned during crash recovery";

/// Mutable state of a run that survives a restart.
#[derive(Debug, Clone)]
pub struct RunState {
    pub config: SimConfig,
    pub cycle: u64,
    pub simulated_time: Option<DateTime<Utc>>,
    pub statistics: SimulationStats,
}

impl RunState {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            cycle: 0,
            simulated_time: None,
            statistics: SimulationStats::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub cycle: u64,
    pub simulated_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub config: SimConfig,
    pub state: CheckpointState,
    pub statistics: SimulationStats,
}

/// What crash-recovery cleanup did on resume.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub cycle: u64,
    pub sessions_abandoned: u64,
    pub cart_items_cleared: u64,
}

#[derive(Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    interval: u64,
    max_checkpoints: usize,
    storage: Arc<dyn Storage>,
}

impl CheckpointManager {
    pub fn new(
        dir: impl Into<PathBuf>,
        interval: u64,
        max_checkpoints: usize,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            dir: dir.into(),
            interval,
            max_checkpoints: max_checkpoints.max(1),
            storage,
        }
    }

    pub fn from_config(config: &SimConfig, storage: Arc<dyn Storage>) -> Self {
        Self::new(
            config.checkpoint_dir.clone(),
            config.checkpoint_interval,
            config.max_checkpoints,
            storage,
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn should_save(&self, cycle: u64) -> bool {
        self.interval > 0 && cycle > 0 && cycle % self.interval == 0
    }

    pub fn save(&self, state: &RunState, cycle: u64) -> Result<PathBuf, SimError> {
        self.save_at(state, cycle, Utc::now())
    }

    /// `save` on the blocking pool, for callers on the async runtime.
    pub async fn persist(&self, state: RunState, cycle: u64) -> Result<PathBuf, SimError> {
        let manager = self.clone();
        tokio::task::spawn_blocking(move || manager.save(&state, cycle))
            .await
            .map_err(|e| SimError::checkpoint_io(&self.dir, std::io::Error::other(e)))?
    }

    fn save_at(&self, state: &RunState, cycle: u64, now: DateTime<Utc>) -> Result<PathBuf, SimError> {
        fs::create_dir_all(&self.dir).map_err(|e| SimError::checkpoint_io(&self.dir, e))?;

        let checkpoint = Checkpoint {
            version: CHECKPOINT_VERSION.to_string(),
            created_at: now,
            config: state.config.clone(),
            state: CheckpointState {
                cycle,
                simulated_time: state.simulated_time,
            },
            statistics: state.statistics.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&checkpoint)?;

        let name = format!(
            "{}{}_cycle_{:06}{}",
            FILE_PREFIX,
            now.format("%Y%m%d_%H%M%S"),
            cycle,
            FILE_SUFFIX
        );
        let path = self.dir.join(&name);
        let tmp = self
            .dir
            .join(format!(".{}.tmp.{}", name, std::process::id()));

        if let Err(e) = write_and_rename(&tmp, &path, &bytes) {
            let _ = fs::remove_file(&tmp);
            return Err(SimError::checkpoint_io(&path, e));
        }

        log::info!("Saved checkpoint for cycle {} to {}", cycle, path.display());

        if let Err(e) = self.enforce_retention() {
            log::warn!("Checkpoint retention failed: {}", e);
        }

        Ok(path)
    }

    /// All checkpoint files, newest first.
    pub fn list(&self) -> Result<Vec<PathBuf>, SimError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SimError::checkpoint_io(&self.dir, e)),
        };

        let mut found: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SimError::checkpoint_io(&self.dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(FILE_PREFIX) || !name.ends_with(FILE_SUFFIX) {
                continue;
            }
            let meta = entry
                .metadata()
                .map_err(|e| SimError::checkpoint_io(entry.path(), e))?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((modified, entry.path()));
        }

        found.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| cycle_from_name(&b.1).cmp(&cycle_from_name(&a.1)))
                .then_with(|| b.1.cmp(&a.1))
        });
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

    pub fn find_latest(&self) -> Result<Option<PathBuf>, SimError> {
        Ok(self.list()?.into_iter().next())
    }

    pub fn load(&self, path: &Path) -> Result<Checkpoint, SimError> {
        let raw = fs::read(path).map_err(|e| SimError::checkpoint_io(path, e))?;
        let checkpoint: Checkpoint = serde_json::from_slice(&raw)?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(SimError::CheckpointVersion {
                found: checkpoint.version,
                expected: CHECKPOINT_VERSION.to_string(),
            });
        }
        Ok(checkpoint)
    }

    /// Restore `state` from `path`, then clean up whatever the previous
    /// process left half-written: active sessions become abandoned and the
    /// carts of `active_agents` are emptied.
    pub async fn resume(
        &self,
        path: &Path,
        state: &mut RunState,
        active_agents: &[AgentId],
    ) -> Result<RecoveryReport> {
        let checkpoint = self.load(path)?;

        if checkpoint.config != state.config {
            log::info!("Checkpoint was written with different settings; keeping the current ones");
        }

        state.cycle = checkpoint.state.cycle;
        state.simulated_time = checkpoint.state.simulated_time;
        state.statistics = checkpoint.statistics;

        let sessions_abandoned = self.storage.abandon_active_sessions(RECOVERY_NOTE).await?;
        let cart_items_cleared = self.storage.clear_carts(active_agents).await?;

        log::info!(
            "Resumed from {} at cycle {} ({} sessions abandoned, {} cart items cleared)",
            path.display(),
            state.cycle,
            sessions_abandoned,
            cart_items_cleared
        );

        Ok(RecoveryReport {
            cycle: state.cycle,
            sessions_abandoned,
            cart_items_cleared,
        })
    }

    fn enforce_retention(&self) -> Result<(), SimError> {
        for stale in self.list()?.into_iter().skip(self.max_checkpoints) {
            fs::remove_file(&stale).map_err(|e| SimError::checkpoint_io(&stale, e))?;
            log::debug!("Removed old checkpoint {}", stale.display());
        }
        Ok(())
    }
}

fn write_and_rename(tmp: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(tmp, path)
}

fn cycle_from_name(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?.strip_suffix(FILE_SUFFIX)?;
    let (_, cycle) = name.rsplit_once("_cycle_")?;
    cycle.parse().ok()
}

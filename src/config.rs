use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SimError;
use crate::storage::PoolSizing;
use crate::types::{AgentSelection, ExecutionMode};

/// Settings for one simulation run. Stored inside every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Wall-clock length of the run
    pub duration_hours: f64,
    /// Simulated hours per real hour; one cycle is one simulated hour
    pub time_scale: f64,
    /// Backend requests per second across all agents
    pub rate_limit: f64,
    /// Save every N cycles; 0 disables
    pub checkpoint_interval: u64,
    pub max_checkpoints: usize,
    /// Cycles to ramp up to the full population; 0 disables
    pub warmup_cycles: u64,
    pub failure_threshold_pct: f64,
    pub worker_pool_size: usize,
    pub execution_mode: ExecutionMode,
    pub selection: AgentSelection,
    pub checkpoint_dir: PathBuf,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            duration_hours: 24.0,
            time_scale: 60.0,
            rate_limit: 10.0,
            checkpoint_interval: 10,
            max_checkpoints: 5,
            warmup_cycles: 5,
            failure_threshold_pct: 10.0,
            worker_pool_size: 16,
            execution_mode: ExecutionMode::Parallel,
            selection: AgentSelection::All,
            checkpoint_dir: PathBuf::from("checkpoints"),
        }
    }
}

impl SimConfig {
    /// Real seconds between cycle starts.
    pub fn target_interval_secs(&self) -> f64 {
        3600.0 / self.time_scale
    }

    /// Wall-clock length of the run.
    pub fn run_duration(&self) -> Result<Duration, SimError> {
        Duration::try_from_secs_f64(self.duration_hours * 3600.0).map_err(|_| {
            SimError::Config(format!("duration_hours {} is out of range", self.duration_hours))
        })
    }

    pub fn target_interval(&self) -> Result<Duration, SimError> {
        Duration::try_from_secs_f64(self.target_interval_secs()).map_err(|_| {
            SimError::Config(format!(
                "time_scale {} gives an out of range cycle interval",
                self.time_scale
            ))
        })
    }

    pub fn validate(&self) -> Result<(), SimError> {
        if !(self.duration_hours >= 0.0) {
            return Err(SimError::Config("duration_hours must be >= 0".into()));
        }
        if !(self.time_scale > 0.0) || !self.time_scale.is_finite() {
            return Err(SimError::Config("time_scale must be finite and > 0".into()));
        }
        self.run_duration()?;
        self.target_interval()?;
        if !(self.rate_limit > 0.0) {
            return Err(SimError::Config("rate_limit must be > 0".into()));
        }
        if self.max_checkpoints == 0 {
            return Err(SimError::Config("max_checkpoints must be at least 1".into()));
        }
        if !(0.0..=100.0).contains(&self.failure_threshold_pct) {
            return Err(SimError::Config(
                "failure_threshold_pct must be within 0..=100".into(),
            ));
        }
        if self.worker_pool_size == 0 {
            return Err(SimError::Config("worker_pool_size must be at least 1".into()));
        }
        Ok(())
    }
}

/// Process configuration: run settings plus connection details.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_url: Option<String>,
    pub db_pool_size: u32,
    pub db_max_overflow: u32,
    pub dashboard_port: Option<u16>,
    pub simulation: SimConfig,
}

impl Default for Config {
    fn default() -> Self {
        let sizing = PoolSizing::default();
        Self {
            database_url: None,
            db_pool_size: sizing.base,
            db_max_overflow: sizing.overflow,
            dashboard_port: None,
            simulation: SimConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Read a TOML file, then let environment variables override it.
    pub fn load(path: &Path) -> Result<Self, SimError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SimError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let mut config: Config = toml::from_str(&raw)
            .map_err(|e| SimError::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(rate) = env_parse::<f64>("SHOPSIM_RATE_LIMIT") {
            self.simulation.rate_limit = rate;
        }
        if let Ok(dir) = std::env::var("SHOPSIM_CHECKPOINT_DIR") {
            self.simulation.checkpoint_dir = PathBuf::from(dir);
        }
        if let Some(size) = env_parse::<u32>("SHOPSIM_DB_POOL_SIZE") {
            self.db_pool_size = size;
        }
        if let Some(overflow) = env_parse::<u32>("SHOPSIM_DB_MAX_OVERFLOW") {
            self.db_max_overflow = overflow;
        }
        if let Some(workers) = env_parse::<usize>("SHOPSIM_WORKERS") {
            self.simulation.worker_pool_size = workers;
        }
    }

    pub fn pool_sizing(&self) -> PoolSizing {
        PoolSizing {
            base: self.db_pool_size,
            overflow: self.db_max_overflow,
            ..PoolSizing::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring unparseable {}={:?}", key, raw);
            None
        }
    }
}

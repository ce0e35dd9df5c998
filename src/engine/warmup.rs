pub const DEFAULT_THRESHOLDS: [f64; 5] = [0.1, 0.25, 0.5, 0.75, 1.0];

/// Staged ramp of the active population over the first `warmup_cycles` cycles.
#[derive(Debug, Clone)]
pub struct WarmupController {
    total_agents: usize,
    warmup_cycles: u64,
    current_cycle: u64,
    thresholds: Vec<f64>,
}

impl WarmupController {
    pub fn new(total_agents: usize, warmup_cycles: u64) -> Self {
        Self::with_thresholds(total_agents, warmup_cycles, DEFAULT_THRESHOLDS.to_vec())
    }

    /// `thresholds` are sorted ascending; a trailing `1.0` is appended when missing.
    pub fn with_thresholds(total_agents: usize, warmup_cycles: u64, mut thresholds: Vec<f64>) -> Self {
        thresholds.retain(|t| *t > 0.0 && *t <= 1.0);
        thresholds.sort_by(|a, b| a.total_cmp(b));
        if thresholds.last() != Some(&1.0) {
            thresholds.push(1.0);
        }

        Self {
            total_agents,
            warmup_cycles,
            current_cycle: 0,
            thresholds,
        }
    }

    pub fn get_active_agent_count(&self) -> usize {
        if self.is_complete() {
            return self.total_agents;
        }

        let progress = self.current_cycle as f64 / self.warmup_cycles as f64;
        let fraction = self
            .thresholds
            .iter()
            .copied()
            .find(|t| progress < *t)
            .unwrap_or(1.0);

        let count = (self.total_agents as f64 * fraction).floor() as usize;
        count.max(1).min(self.total_agents)
    }

    pub fn advance(&mut self) {
        self.current_cycle += 1;
    }

    pub fn set_cycle(&mut self, cycle: u64) {
        self.current_cycle = cycle;
    }

    pub fn current_cycle(&self) -> u64 {
        self.current_cycle
    }

    pub fn is_complete(&self) -> bool {
        self.warmup_cycles == 0 || self.current_cycle >= self.warmup_cycles
    }

    pub fn set_total_agents(&mut self, total_agents: usize) {
        self.total_agents = total_agents;
    }
}

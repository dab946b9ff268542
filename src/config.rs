use crate::NodeWeight;
use crate::error::EngineError;
use crate::partitioned::Objective;

/// Which flavor of FM search the refiner runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FmAlgorithm {
    /// One search seeded with the whole boundary, applied globally.
    Boundary,
    /// Many concurrent localized searches with work stealing.
    #[default]
    Multitry,
}

#[derive(Clone, Debug)]
pub struct LpConfig {
    pub max_iterations: usize,
    /// Moves only activate neighbors through hyperedges up to this size.
    pub hyperedge_size_activation_threshold: usize,
    pub num_sub_rounds: usize,
    pub use_active_node_set: bool,
    /// Second apply pass: recalculate exact gains instead of sort-revert.
    pub recalculate_gains_on_second_apply: bool,
}

impl Default for LpConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            hyperedge_size_activation_threshold: 100,
            num_sub_rounds: 2,
            use_active_node_set: true,
            recalculate_gains_on_second_apply: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FmConfig {
    pub algorithm: FmAlgorithm,
    pub num_seed_nodes: usize,
    pub allow_zero_gain_moves: bool,
    /// Publish moves immediately instead of speculating on a delta overlay.
    pub perform_moves_global: bool,
    pub max_rounds: usize,
    pub min_relative_round_improvement: f64,
    /// Stop-rule spread multiplier.
    pub stop_alpha: f64,
    /// A search never exceeds this fraction of |V| in steps since its best.
    pub stop_step_fraction: f64,
}

impl Default for FmConfig {
    fn default() -> Self {
        Self {
            algorithm: FmAlgorithm::Multitry,
            num_seed_nodes: 25,
            allow_zero_gain_moves: false,
            perform_moves_global: false,
            max_rounds: 10,
            min_relative_round_improvement: 0.001,
            stop_alpha: 1.0,
            stop_step_fraction: 0.25,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FlowConfig {
    pub min_relative_improvement_per_round: f64,
    /// How many concurrent searches may touch the same block.
    pub max_searches_per_block: usize,
    pub num_threads_per_search: usize,
    pub max_cut_hyperedges_per_request: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            min_relative_improvement_per_round: 0.001,
            max_searches_per_block: 1,
            num_threads_per_search: 1,
            max_cut_hyperedges_per_request: 10,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SharedMemoryConfig {
    /// Worker threads; 0 means all available parallelism.
    pub num_threads: usize,
    /// Fixed chunk count for deterministic parallel primitives.
    pub static_balancing_work_packages: usize,
}

impl Default for SharedMemoryConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            static_balancing_work_packages: 128,
        }
    }
}

/// All knobs honoured by the refinement engine.
#[derive(Clone, Debug)]
pub struct RefinementConfig {
    pub k: u32,
    pub max_part_weights: Vec<NodeWeight>,
    pub objective: Objective,
    /// Every PRNG stream in the engine derives from this seed. With the
    /// deterministic refiner, output depends on nothing else.
    pub seed: u64,
    /// A full LP + FM (+ flow) pass repeats while it improves the objective
    /// by at least this fraction.
    pub min_relative_pass_improvement: f64,
    pub lp: LpConfig,
    pub fm: FmConfig,
    pub flow: FlowConfig,
    pub shared_memory: SharedMemoryConfig,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            k: 2,
            max_part_weights: Vec::new(),
            objective: Objective::Km1,
            seed: 0,
            min_relative_pass_improvement: 0.0025,
            lp: LpConfig::default(),
            fm: FmConfig::default(),
            flow: FlowConfig::default(),
            shared_memory: SharedMemoryConfig::default(),
        }
    }
}

impl RefinementConfig {
    /// Uniform balance constraint: every block may hold at most
    /// `(1 + epsilon) * ceil(total / k)`.
    pub fn with_balanced_part_weights(mut self, total_weight: NodeWeight, epsilon: f64) -> Self {
        let k = self.k as NodeWeight;
        let base = (total_weight + k - 1) / k;
        let max = ((1.0 + epsilon) * base as f64).floor() as NodeWeight;
        self.max_part_weights = vec![max.max(1); self.k as usize];
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.k < 2 {
            return Err(EngineError::TooFewBlocks(self.k));
        }
        if self.max_part_weights.len() != self.k as usize {
            return Err(EngineError::LengthMismatch {
                what: "max_part_weights",
                expected: self.k as usize,
                got: self.max_part_weights.len(),
            });
        }
        if self.max_part_weights.iter().any(|&w| w <= 0) {
            return Err(EngineError::NonPositiveWeight("max part weight"));
        }
        Ok(())
    }

    pub(crate) fn num_threads(&self) -> usize {
        if self.shared_memory.num_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.shared_memory.num_threads
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_weights_cover_total() {
        let config = RefinementConfig {
            k: 4,
            ..Default::default()
        }
        .with_balanced_part_weights(103, 0.03);
        assert_eq!(config.max_part_weights.len(), 4);
        let per_block = config.max_part_weights[0];
        assert!(per_block >= 26);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_catches_mistakes() {
        let config = RefinementConfig::default();
        assert!(config.validate().is_err()); // no max part weights

        let config = RefinementConfig {
            k: 1,
            max_part_weights: vec![10],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::TooFewBlocks(1))));
    }
}

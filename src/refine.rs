use std::sync::Arc;

use tracing::{debug, info};

use crate::config::RefinementConfig;
use crate::error::EngineError;
use crate::fm::MultiTryKWayFm;
use crate::lp::DeterministicLabelPropagation;
use crate::metrics::{self, Metrics};
use crate::partitioned::PartitionedHypergraph;
use crate::quotient::{QuotientGraph, TwoWayFlowRefiner, schedule_flow_searches};
use crate::{Gain, NodeId};

/// Capability surface shared by the refinement passes. The concrete set of
/// refiners is picked once at engine construction; the pass loop goes
/// through one indirection and never re-dispatches per move.
pub trait Refiner: Send {
    /// Improves the partition. Updates `metrics` and returns whether the
    /// objective improved.
    fn refine(
        &mut self,
        phg: &PartitionedHypergraph,
        seeds: &[NodeId],
        metrics: &mut Metrics,
    ) -> bool;
}

impl Refiner for DeterministicLabelPropagation {
    fn refine(
        &mut self,
        phg: &PartitionedHypergraph,
        _seeds: &[NodeId],
        metrics: &mut Metrics,
    ) -> bool {
        let improvement = self.refine_impl(phg);
        metrics.quality -= improvement;
        improvement > 0
    }
}

impl Refiner for MultiTryKWayFm {
    fn refine(
        &mut self,
        phg: &PartitionedHypergraph,
        seeds: &[NodeId],
        metrics: &mut Metrics,
    ) -> bool {
        let improvement = self.refine_impl(phg, seeds);
        metrics.quality -= improvement;
        improvement > 0
    }
}

/// The parallel refinement engine: label propagation, then localized FM,
/// then optionally one scheduled round of flow-based refinement, repeated
/// while a full pass still pays off.
pub struct RefinementEngine {
    config: Arc<RefinementConfig>,
    pool: rayon::ThreadPool,
    refiners: Vec<Box<dyn Refiner>>,
    quotient: QuotientGraph,
    flow_refiner: Option<Box<dyn TwoWayFlowRefiner + Send>>,
}

impl RefinementEngine {
    pub fn new(
        config: RefinementConfig,
        phg: &PartitionedHypergraph,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        if config.k != phg.k() {
            return Err(EngineError::LengthMismatch {
                what: "config.k",
                expected: phg.k() as usize,
                got: config.k as usize,
            });
        }
        let config = Arc::new(config);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_threads())
            .build()
            .map_err(|e| EngineError::ThreadPool(e.to_string()))?;

        let num_nodes = phg.num_nodes();
        let num_edges = phg.num_edges();
        let refiners: Vec<Box<dyn Refiner>> = vec![
            Box::new(DeterministicLabelPropagation::new(
                Arc::clone(&config),
                num_nodes,
                num_edges,
            )),
            Box::new(MultiTryKWayFm::new(
                Arc::clone(&config),
                num_nodes,
                config.num_threads(),
            )),
        ];

        Ok(Self {
            quotient: QuotientGraph::new(Arc::clone(&config)),
            refiners,
            pool,
            flow_refiner: None,
            config,
        })
    }

    /// Attaches the external flow solver. Without one, the flow round is
    /// skipped and only LP and FM run.
    pub fn with_flow_refiner(mut self, refiner: Box<dyn TwoWayFlowRefiner + Send>) -> Self {
        self.flow_refiner = Some(refiner);
        self
    }

    pub fn config(&self) -> &RefinementConfig {
        &self.config
    }

    /// Refines the partition in place. Returns true iff the objective
    /// improved.
    pub fn refine(
        &mut self,
        phg: &PartitionedHypergraph,
        seeds: &[NodeId],
        metrics: &mut Metrics,
    ) -> bool {
        let Self {
            config,
            pool,
            refiners,
            quotient,
            flow_refiner,
        } = self;
        let objective = config.objective;

        pool.install(|| {
            let initial_quality = metrics::quality(phg, objective);
            let mut current = initial_quality;
            metrics.quality = current;

            loop {
                let before_pass = current;
                for refiner in refiners.iter_mut() {
                    refiner.refine(phg, seeds, metrics);
                }
                if let Some(flow) = flow_refiner {
                    let flow_improvement: Gain = schedule_flow_searches(
                        phg,
                        quotient,
                        flow.as_ref(),
                        config,
                        metrics.quality,
                    );
                    debug!(flow_improvement, "flow round finished");
                }

                current = metrics::quality(phg, objective);
                metrics.quality = current;
                let pass_improvement = before_pass - current;
                debug!(pass_improvement, current, "refinement pass finished");
                if pass_improvement <= 0 {
                    break;
                }
                let relative = pass_improvement as f64 / before_pass.max(1) as f64;
                if relative < config.min_relative_pass_improvement {
                    break;
                }
            }

            debug_assert!(phg.verify_internal_state());
            metrics.quality = current;
            metrics.imbalance = metrics::imbalance(phg, &config.max_part_weights);
            info!(
                initial_quality,
                final_quality = current,
                imbalance = metrics.imbalance,
                "refinement finished"
            );
            current < initial_quality
        })
    }
}

//! # hypercut
//!
//! Parallel k-way refinement engine for partitioned hypergraphs.
//!
//! Given a hypergraph, a k-way assignment and per-block weight limits, the
//! engine improves the connectivity (km1) or cut objective with a sequence
//! of refinement passes:
//!
//! - deterministic synchronous label propagation, whose result for a fixed
//!   seed does not depend on the number of threads,
//! - localized k-way Fiduccia–Mattheyses searches running concurrently
//!   against one shared partition with an atomically maintained gain cache,
//! - optionally, flow-based refinement on block pairs scheduled through a
//!   quotient graph (the max-flow solver itself is supplied by the caller).
//!
//! ```
//! use hypercut::{Hypergraph, Metrics, PartitionedHypergraph, RefinementConfig, RefinementEngine};
//! use std::sync::Arc;
//!
//! let hg = Hypergraph::from_edges(
//!     4,
//!     &[vec![0, 1], vec![1, 2], vec![2, 3]],
//!     None,
//!     None,
//! )?;
//! let mut phg = PartitionedHypergraph::new(Arc::new(hg), 2)?;
//! phg.set_partition(&[0, 1, 0, 1])?;
//!
//! let config = RefinementConfig::default()
//!     .with_balanced_part_weights(phg.hypergraph().total_node_weight(), 0.03);
//! let mut engine = RefinementEngine::new(config, &phg)?;
//! let mut metrics = Metrics::default();
//! engine.refine(&phg, &[], &mut metrics);
//! # Ok::<(), hypercut::EngineError>(())
//! ```

pub mod config;
mod delta;
pub mod error;
pub mod fm;
pub mod gain;
pub mod hypergraph;
pub mod lp;
pub mod metrics;
pub mod moves;
mod parallel;
pub mod partitioned;
mod permutation;
mod pq;
pub mod prefix;
pub mod quotient;
pub mod refine;
pub mod work;

pub type NodeId = u32;
pub type EdgeId = u32;
pub type BlockId = u32;
pub type NodeWeight = i64;
pub type EdgeWeight = i64;
pub type Gain = i64;

pub use config::{FlowConfig, FmAlgorithm, FmConfig, LpConfig, RefinementConfig, SharedMemoryConfig};
pub use error::EngineError;
pub use fm::MultiTryKWayFm;
pub use gain::GainCache;
pub use lp::DeterministicLabelPropagation;
pub use hypergraph::Hypergraph;
pub use metrics::Metrics;
pub use moves::{Move, MoveId, MoveTracker, NodeTracker};
pub use partitioned::{Objective, PartitionedHypergraph, SyncEdgeUpdate};
pub use quotient::{BlockPair, QuotientGraph, TwoWayFlowRefiner};
pub use refine::{Refiner, RefinementEngine};
pub use work::WorkContainer;

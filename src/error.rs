use thiserror::Error;

/// Errors surfaced to the driver during construction and validation.
///
/// Runtime failures inside the refiners are not represented here: balance
/// violations are declined moves, scheduler contention yields an invalid
/// search id, and internal invariant violations abort the process.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("number of blocks must be at least 2, got {0}")]
    TooFewBlocks(u32),

    #[error("expected {expected} entries for `{what}`, got {got}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("hyperedge {edge} references pin {pin}, but the hypergraph has {num_nodes} nodes")]
    PinOutOfRange {
        edge: usize,
        pin: u32,
        num_nodes: usize,
    },

    #[error("hyperedge {0} is empty")]
    EmptyHyperedge(usize),

    #[error("node {node} is assigned to block {block}, but k = {k}")]
    BlockOutOfRange { node: u32, block: u32, k: u32 },

    #[error("{0} must be positive")]
    NonPositiveWeight(&'static str),

    #[error("failed to build worker pool: {0}")]
    ThreadPool(String),
}

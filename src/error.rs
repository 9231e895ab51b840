use thiserror::Error;

// Unified error types for metasched

/// Failures raised by a communicator backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommError {
    #[error("process tree was aborted")]
    Aborted,
    #[error("peer rank {0} is no longer reachable")]
    Disconnected(usize),
    #[error("rank {rank} is outside a group of size {size}")]
    InvalidRank { rank: usize, size: usize },
    #[error("failed to start process pool: {0}")]
    Spawn(String),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

#[derive(Error, Debug)]
pub enum SchedError {
    #[error("invalid problem setup: {0}")]
    Spec(String),
    #[error("partition infeasible: {available} process(es) available but each job needs at least {required}")]
    PartitionInfeasible { available: usize, required: usize },
    #[error("capability mismatch: {0}")]
    CapabilityMismatch(String),
    #[error("lifecycle violation: cannot move from {from} to {to}")]
    Lifecycle { from: &'static str, to: &'static str },
    #[error("communication error: {0}")]
    Comm(#[from] CommError),
    #[error("wire codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("{kind} message for job {job} is {len} bytes, negotiated capacity is {capacity}")]
    MessageOverflow {
        kind: &'static str,
        job: usize,
        len: usize,
        capacity: usize,
    },
    #[error("model error: {0}")]
    Model(String),
    #[error("job {job} produced no result")]
    MissingResult { job: usize },
    #[error("job {job} reported a result more than once")]
    DuplicateResult { job: usize },
    #[error("invalid problem description: {0}")]
    Config(#[from] serde_json::Error),
}

impl SchedError {
    /// True when this error only reports that another process aborted the tree.
    pub fn is_abort(&self) -> bool {
        matches!(self, SchedError::Comm(CommError::Aborted))
    }
}

//! metasched: hierarchical scheduling of nested optimization iterators
//!
//! A meta-iterator (multi-start, Pareto set, sequential / embedded / collaborative hybrid)
//! runs sub-iterators as jobs on a partition of its process group. Each level of nesting
//! splits its group into iterator servers and schedules jobs either from a dedicated
//! master or as a static peer distribution. Processes are threads of a local pool by
//! default, or MPI ranks with the `mpi` feature.

pub mod parallel;

pub mod config;
pub mod context;
pub mod core;
pub mod environment;
pub mod error;
pub mod iterator;
pub mod meta;
pub mod model;
pub mod scheduler;
pub mod solver;
pub mod utils;

// Re-exports for convenience
pub use config::*;
pub use context::*;
pub use environment::{Environment, RunSummary};
#[cfg(feature = "rayon")]
pub use environment::run_local;
pub use error::*;
pub use iterator::{Algorithm, AnyIterator, Capabilities, FinalSolutions};
pub use meta::{
    CollabHybridMetaIterator, CommState, ConcurrentKind, ConcurrentMetaIterator, EmbedHybridMetaIterator,
    SeqHybridMetaIterator,
};
pub use model::{AnyModel, Model};
pub use scheduler::*;

pub use utils::convergence::SolveStats;

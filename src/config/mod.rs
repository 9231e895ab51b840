//! Problem description and per-method scheduling options.

pub mod options;
pub mod problem;

pub use options::{SchedulerOptions, SchedulingChoice};
pub use problem::{
    resolve_single, ConcurrentSubMethod, EmbedHybridSpec, EvolutionSpec, HybridSpec, MethodBlock,
    MethodKind, ModelBlock, MultiStartSpec, NewtonSpec, ParetoSetSpec, PatternSearchSpec,
    ProblemDescription, SamplingSpec, SeqHybridSpec, SubMethod, TestFunction,
};

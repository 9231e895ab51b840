//! Meta-iterators: iterators whose work is scheduling other iterators.
//!
//! Each meta-iterator owns one or more [`IteratorScheduler`]s and the sub-iterators they
//! run. The shared part of the parallel lifecycle lives here: state checks around the
//! `derived_*` hooks of [`MetaIterator`], instantiation of sub-iterators only on live
//! server members, and propagation of set/free to them.

pub mod collab_hybrid;
pub mod concurrent;
pub mod embed_hybrid;
pub mod lifecycle;
pub mod seq_hybrid;

pub use collab_hybrid::CollabHybridMetaIterator;
pub use concurrent::{ConcurrentKind, ConcurrentMetaIterator};
pub use embed_hybrid::EmbedHybridMetaIterator;
pub use lifecycle::CommState;
pub use seq_hybrid::SeqHybridMetaIterator;

use crate::config::{MethodBlock, SchedulerOptions, SubMethod};
use crate::context::{Construction, IteratorFactory};
use crate::error::SchedError;
use crate::iterator::AnyIterator;
use crate::parallel::{Comm, Communicator, LevelId, ProcessTree};
use crate::scheduler::{
    best_of, max_procs_per_level, min_procs_per_level, IteratorScheduler, JobResultTable,
    ParamResponsePair, ProcessorEstimate,
};
use log::info;

/// State every meta-iterator carries.
#[derive(Debug, Clone)]
pub struct MetaCore {
    pub id: String,
    pub state: CommState,
    pub factory: IteratorFactory,
    pub options: SchedulerOptions,
    pub final_solutions: Vec<ParamResponsePair>,
    pub initial_points: Vec<Vec<f64>>,
}

impl MetaCore {
    pub fn new(factory: IteratorFactory, block: &MethodBlock) -> Self {
        Self {
            id: block.id.clone(),
            state: CommState::Uninitialized,
            factory,
            options: block.scheduling.clone(),
            final_solutions: Vec::new(),
            initial_points: Vec::new(),
        }
    }
}

pub trait MetaIterator {
    fn meta(&self) -> &MetaCore;
    fn meta_mut(&mut self) -> &mut MetaCore;

    fn derived_init(&mut self, tree: &mut ProcessTree, level: LevelId) -> Result<(), SchedError>;
    fn derived_set(&mut self, tree: &ProcessTree, level: LevelId) -> Result<(), SchedError>;
    fn derived_free(&mut self, tree: &mut ProcessTree, level: LevelId) -> Result<(), SchedError>;
    fn core_run(&mut self) -> Result<(), SchedError>;
}

fn guarded<M, F>(meta: &mut M, to: CommState, step: F) -> Result<(), SchedError>
where
    M: MetaIterator + ?Sized,
    F: FnOnce(&mut M) -> Result<(), SchedError>,
{
    meta.meta().state.check(to)?;
    match step(meta) {
        Ok(()) => {
            meta.meta_mut().state = to;
            Ok(())
        }
        Err(err) => {
            meta.meta_mut().state.abort();
            Err(err)
        }
    }
}

pub fn init_communicators<M: MetaIterator + ?Sized>(
    meta: &mut M,
    tree: &mut ProcessTree,
    level: LevelId,
) -> Result<(), SchedError> {
    guarded(meta, CommState::CommsInitialized, |m| m.derived_init(tree, level))
}

pub fn set_communicators<M: MetaIterator + ?Sized>(
    meta: &mut M,
    tree: &ProcessTree,
    level: LevelId,
) -> Result<(), SchedError> {
    guarded(meta, CommState::CommsSet, |m| m.derived_set(tree, level))
}

pub fn run<M: MetaIterator + ?Sized>(meta: &mut M) -> Result<(), SchedError> {
    guarded(meta, CommState::Running, |m| m.core_run())
}

pub fn free_communicators<M: MetaIterator + ?Sized>(
    meta: &mut M,
    tree: &mut ProcessTree,
    level: LevelId,
) -> Result<(), SchedError> {
    guarded(meta, CommState::CommsFreed, |m| m.derived_free(tree, level))
}

/// Processor range of a level that runs `subs` on up to `max_concurrency` servers.
pub(crate) fn level_estimate(
    factory: &IteratorFactory,
    subs: &[SubMethod],
    options: &SchedulerOptions,
    max_concurrency: usize,
) -> Result<ProcessorEstimate, SchedError> {
    let per_server = factory.estimate(subs)?;
    Ok(ProcessorEstimate::new(
        min_procs_per_level(per_server, options),
        max_procs_per_level(per_server, options, max_concurrency),
    ))
}

/// Fully build `subs` on live server members; everyone else holds empty stand-ins.
pub(crate) fn instantiate_subs(
    factory: &IteratorFactory,
    subs: &[SubMethod],
    scheduler: &IteratorScheduler,
    tree: &mut ProcessTree,
) -> Result<Vec<AnyIterator>, SchedError> {
    let level = match scheduler.server_level() {
        Some(level) if scheduler.is_server_member() => level,
        _ => return Ok(subs.iter().map(|_| AnyIterator::empty()).collect()),
    };
    let mut iterators = Vec::with_capacity(subs.len());
    for sub in subs {
        let mut iterator = factory.build(sub, Construction::Full)?;
        iterator.as_algorithm_mut().init_communicators(tree, level)?;
        iterators.push(iterator);
    }
    Ok(iterators)
}

pub(crate) fn set_subs(
    iterators: &mut [AnyIterator],
    scheduler: &mut IteratorScheduler,
    tree: &ProcessTree,
) -> Result<(), SchedError> {
    scheduler.set_iterator_parallelism(tree)?;
    if let Some(level) = scheduler.server_level().filter(|_| scheduler.is_server_member()) {
        for iterator in iterators.iter_mut() {
            iterator.as_algorithm_mut().set_communicators(tree, level)?;
        }
    }
    Ok(())
}

pub(crate) fn free_subs(
    iterators: &mut [AnyIterator],
    scheduler: &mut IteratorScheduler,
    tree: &mut ProcessTree,
) -> Result<(), SchedError> {
    if let Some(level) = scheduler.server_level().filter(|_| scheduler.is_server_member()) {
        for iterator in iterators.iter_mut().rev() {
            iterator.as_algorithm_mut().free_communicators(tree, level)?;
        }
    }
    scheduler.free_iterator_parallelism(tree)
}

pub(crate) fn total_evaluations(iterators: &[AnyIterator]) -> usize {
    iterators.iter().map(|it| it.as_algorithm().evaluations()).sum()
}

pub(crate) fn total_models(iterators: &[AnyIterator]) -> usize {
    iterators.iter().map(|it| it.as_algorithm().instantiated_models()).sum()
}

/// Replace `solutions` on every member of `comm` with the copy held by rank 0.
pub(crate) fn broadcast_solutions(
    comm: &Communicator,
    solutions: &mut Vec<ParamResponsePair>,
) -> Result<(), SchedError> {
    let mut buf = if comm.is_lead() { bincode::serialize(solutions)? } else { Vec::new() };
    comm.broadcast(0, &mut buf)?;
    *solutions = bincode::deserialize(&buf)?;
    Ok(())
}

/// Coordinator-side summary of a finished round.
pub(crate) fn log_round_summary(label: &str, scheduler: &IteratorScheduler, table: &JobResultTable) {
    if !scheduler.group_comm().is_some_and(|c| c.is_lead()) {
        return;
    }
    info!("{label}: {} job(s) completed", table.len());
    for job in 0..table.len() {
        if let Some(best) = table.get(job).and_then(|r| best_of(r)) {
            info!(
                "  job {:>3}: {} solution(s), best objective {:.6e} at {:?}",
                job + 1,
                table.get(job).map_or(0, Vec::len),
                best.objective(),
                best.variables
            );
        }
    }
}

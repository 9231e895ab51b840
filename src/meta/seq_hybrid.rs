//! Sequential hybrid: a chain of sub-iterators where the final solutions of one seed
//! the next.
//!
//! Round 0 runs one job from the hybrid's own starting points. Round k runs one job
//! when iterator k accepts several starting points and otherwise one job per final
//! solution of round k−1.
//!
//! In adaptive mode each iterator runs in batches of `batch_iterations` and is repeated
//! while the relative improvement of a batch stays at or above `progress_threshold`.
//! Adaptive runs hand solutions from batch to batch directly and therefore refuse a
//! partition that needs message passing between servers.

use super::{MetaCore, MetaIterator};
use crate::config::{MethodBlock, MethodKind, SeqHybridSpec, SubMethod};
use crate::context::{Construction, IteratorFactory, SubIteratorInfo};
use crate::error::SchedError;
use crate::iterator::{Algorithm, AnyIterator, Capabilities, FinalSolutions};
use crate::parallel::{Comm, Communicator, LevelId, ProcessTree};
use crate::scheduler::{best_of, IteratorJobs, IteratorScheduler, JobResult, ParamResponsePair, ProcessorEstimate};
use crate::utils::convergence::relative_improvement;
use log::{debug, info, warn};

/// Clamp a progress threshold into [0, 1], warning when it had to move.
pub fn clamp_progress_threshold(threshold: f64) -> f64 {
    if threshold.is_nan() {
        warn!("progress threshold is NaN, using 0");
        0.0
    } else if threshold > 1.0 {
        warn!("progress threshold {threshold} is above 1, using 1");
        1.0
    } else if threshold < 0.0 {
        warn!("progress threshold {threshold} is below 0, using 0");
        0.0
    } else {
        threshold
    }
}

#[derive(Debug)]
pub struct SeqHybridMetaIterator {
    core: MetaCore,
    spec: SeqHybridSpec,
    subs: Vec<SubMethod>,
    infos: Vec<SubIteratorInfo>,
    schedulers: Vec<IteratorScheduler>,
    iterators: Vec<AnyIterator>,
    group: Option<Communicator>,
    round_jobs: Vec<usize>,
}

impl SeqHybridMetaIterator {
    pub fn new(factory: IteratorFactory, block: &MethodBlock) -> Result<Self, SchedError> {
        let MethodKind::HybridSequential(spec) = &block.method else {
            return Err(SchedError::Spec(format!("method '{}' is not a sequential hybrid", block.id)));
        };
        let subs = spec.methods.resolve(factory.default_model(), factory.description())?;
        let infos = subs.iter().map(|sub| factory.probe(sub)).collect::<Result<Vec<_>, _>>()?;
        let mut spec = spec.clone();
        spec.progress_threshold = clamp_progress_threshold(spec.progress_threshold);
        spec.batch_iterations = spec.batch_iterations.max(1);
        spec.max_adaptive_cycles = spec.max_adaptive_cycles.max(1);
        Ok(Self {
            core: MetaCore::new(factory, block),
            spec,
            subs,
            infos,
            schedulers: Vec::new(),
            iterators: Vec::new(),
            group: None,
            round_jobs: Vec::new(),
        })
    }

    pub fn progress_threshold(&self) -> f64 {
        self.spec.progress_threshold
    }

    pub fn is_adaptive(&self) -> bool {
        self.spec.adaptive
    }

    pub fn sub_methods(&self) -> &[SubMethod] {
        &self.subs
    }

    /// Jobs dispatched in each round of the last run.
    pub fn round_job_counts(&self) -> &[usize] {
        &self.round_jobs
    }

    pub fn schedulers(&self) -> &[IteratorScheduler] {
        &self.schedulers
    }

    /// Upper bound on the jobs of each round.
    fn planned_jobs(&self) -> Vec<usize> {
        let mut planned = Vec::with_capacity(self.infos.len());
        let mut solutions = 1usize;
        for (k, info) in self.infos.iter().enumerate() {
            let jobs = if k == 0 || self.spec.adaptive || info.accepts_multiple_points() { 1 } else { solutions };
            solutions = jobs.saturating_mul(info.max_final_solutions.max(1));
            planned.push(jobs);
        }
        planned
    }

    /// Capabilities and result sizes of the fully built sub-iterators, probed on the
    /// group lead and shared with every member.
    fn probe_on_lead(&self, group: &Communicator) -> Result<Vec<SubIteratorInfo>, SchedError> {
        let mut buf = Vec::new();
        if group.is_lead() {
            let mut infos = Vec::with_capacity(self.subs.len());
            for sub in &self.subs {
                let iterator = self.core.factory.build(sub, Construction::Full)?;
                infos.push(SubIteratorInfo::of(iterator.as_algorithm())?);
            }
            buf = bincode::serialize(&infos)?;
        }
        group.broadcast(0, &mut buf)?;
        Ok(bincode::deserialize(&buf)?)
    }

    fn run_scheduled(&mut self) -> Result<Vec<ParamResponsePair>, SchedError> {
        let mut previous: Vec<ParamResponsePair> = Vec::new();
        for k in 0..self.iterators.len() {
            if k > 0 && previous.is_empty() {
                return Err(SchedError::Model(format!(
                    "'{}': {} returned no final solutions to seed {}",
                    self.core.id,
                    self.subs[k - 1],
                    self.subs[k]
                )));
            }
            let accepts = self.infos[k].accepts_multiple_points();
            let starts: Vec<Vec<Vec<f64>>> = if k == 0 {
                vec![self.core.initial_points.clone()]
            } else if accepts {
                vec![previous.iter().map(|p| p.variables.clone()).collect()]
            } else {
                previous.iter().map(|p| vec![p.variables.clone()]).collect()
            };
            let num_jobs = starts.len();
            let mut jobs = SeqJobs {
                iterator: &mut self.iterators[k],
                starts,
                representative: self.infos[k].representative_result(),
            };
            let table = self.schedulers[k].schedule_iterators(&mut jobs, num_jobs)?;
            self.round_jobs.push(num_jobs);
            previous = table.flatten();
            if self.group.as_ref().is_some_and(|g| g.is_lead()) {
                info!(
                    "sequential hybrid '{}': round {} ({}) ran {num_jobs} job(s), {} solution(s), best {:.6e}",
                    self.core.id,
                    k + 1,
                    self.subs[k],
                    previous.len(),
                    best_of(&previous).map_or(f64::INFINITY, |p| p.objective())
                );
            }
        }
        Ok(previous)
    }

    fn run_adaptive(&mut self) -> Result<Vec<ParamResponsePair>, SchedError> {
        let group = self
            .group
            .clone()
            .ok_or(SchedError::Lifecycle { from: "communicators freed", to: "running" })?;
        let mut previous: Vec<ParamResponsePair> = Vec::new();
        for k in 0..self.iterators.len() {
            let accepts = self.infos[k].accepts_multiple_points();
            let seed = |solutions: &[ParamResponsePair]| -> Vec<Vec<f64>> {
                if accepts {
                    solutions.iter().map(|p| p.variables.clone()).collect()
                } else {
                    best_of(solutions).map(|p| vec![p.variables.clone()]).unwrap_or_default()
                }
            };
            let mut starts = if k == 0 { self.core.initial_points.clone() } else { seed(&previous) };
            let mut before = best_of(&previous).map_or(f64::INFINITY, |p| p.objective());
            let mut solutions = Vec::new();

            if let Some(server) = self.schedulers[k].server_comm().cloned() {
                let iterator = self.iterators[k].as_algorithm_mut();
                iterator.set_max_iterations(self.spec.batch_iterations);
                for cycle in 1..=self.spec.max_adaptive_cycles {
                    iterator.set_initial_points(&starts)?;
                    iterator.run()?;
                    solutions = iterator.final_solutions().to_vec();
                    super::broadcast_solutions(&server, &mut solutions)?;
                    let after = best_of(&solutions).map_or(f64::INFINITY, |p| p.objective());
                    let progress = relative_improvement(before, after);
                    if server.is_lead() {
                        debug!(
                            "sequential hybrid '{}': {} batch {cycle} improved {before:.6e} -> {after:.6e} (progress {progress:.3})",
                            self.core.id, self.subs[k]
                        );
                    }
                    before = after;
                    if progress < self.spec.progress_threshold {
                        break;
                    }
                    starts = seed(&solutions);
                }
            }
            super::broadcast_solutions(&group, &mut solutions)?;
            self.round_jobs.push(1);
            previous = solutions;
        }
        Ok(previous)
    }
}

struct SeqJobs<'a> {
    iterator: &'a mut AnyIterator,
    starts: Vec<Vec<Vec<f64>>>,
    representative: JobResult,
}

impl IteratorJobs for SeqJobs<'_> {
    type Params = Vec<Vec<f64>>;

    fn job_params(&self, job: usize) -> Vec<Vec<f64>> {
        self.starts.get(job).cloned().unwrap_or_default()
    }

    fn representative_result(&self) -> JobResult {
        self.representative.clone()
    }

    fn initialize_job(&mut self, _job: usize, params: &Vec<Vec<f64>>) -> Result<(), SchedError> {
        self.iterator.as_algorithm_mut().set_initial_points(params)
    }

    fn run_job(&mut self, _job: usize) -> Result<(), SchedError> {
        self.iterator.as_algorithm_mut().run()
    }

    fn update_local_results(&mut self, _job: usize) -> Result<JobResult, SchedError> {
        Ok(self.iterator.as_algorithm().final_solutions().to_vec())
    }
}

impl MetaIterator for SeqHybridMetaIterator {
    fn meta(&self) -> &MetaCore {
        &self.core
    }

    fn meta_mut(&mut self) -> &mut MetaCore {
        &mut self.core
    }

    fn derived_init(&mut self, tree: &mut ProcessTree, level: LevelId) -> Result<(), SchedError> {
        let group = tree
            .comm(level)
            .cloned()
            .ok_or_else(|| SchedError::Spec(format!("'{}' runs on a level it is not a member of", self.core.id)))?;
        self.infos = self.probe_on_lead(&group)?;
        let planned = self.planned_jobs();

        for (k, sub) in self.subs.iter().enumerate() {
            let mut scheduler = IteratorScheduler::new(self.core.options.clone(), planned[k]);
            scheduler.init_iterator_parallelism(tree, level, planned[k], self.infos[k].estimate)?;
            let mut built = super::instantiate_subs(&self.core.factory, std::slice::from_ref(sub), &scheduler, tree)?;
            self.iterators.push(built.pop().unwrap_or_else(AnyIterator::empty));
            self.schedulers.push(scheduler);
        }

        if self.spec.adaptive {
            if let Some(k) = self
                .schedulers
                .iter()
                .position(|s| s.partition().is_some_and(|p| p.message_passing()))
            {
                return Err(SchedError::CapabilityMismatch(format!(
                    "adaptive sequential hybrid '{}' cannot run {} with message-passing scheduling",
                    self.core.id, self.subs[k]
                )));
            }
        }
        self.group = Some(group);
        Ok(())
    }

    fn derived_set(&mut self, tree: &ProcessTree, _level: LevelId) -> Result<(), SchedError> {
        for (iterator, scheduler) in self.iterators.iter_mut().zip(self.schedulers.iter_mut()) {
            super::set_subs(std::slice::from_mut(iterator), scheduler, tree)?;
        }
        Ok(())
    }

    fn derived_free(&mut self, tree: &mut ProcessTree, _level: LevelId) -> Result<(), SchedError> {
        for (iterator, scheduler) in self.iterators.iter_mut().zip(self.schedulers.iter_mut()).rev() {
            super::free_subs(std::slice::from_mut(iterator), scheduler, tree)?;
        }
        self.iterators.clear();
        self.schedulers.clear();
        self.group = None;
        Ok(())
    }

    fn core_run(&mut self) -> Result<(), SchedError> {
        self.round_jobs.clear();
        let solutions = if self.spec.adaptive { self.run_adaptive()? } else { self.run_scheduled()? };
        self.core.final_solutions = solutions;
        Ok(())
    }
}

impl Algorithm for SeqHybridMetaIterator {
    fn method_name(&self) -> &str {
        "hybrid_sequential"
    }

    fn estimate_processors(&self) -> Result<ProcessorEstimate, SchedError> {
        let concurrency = self.planned_jobs().into_iter().max().unwrap_or(1);
        super::level_estimate(&self.core.factory, &self.subs, &self.core.options, concurrency)
    }

    fn init_communicators(&mut self, tree: &mut ProcessTree, level: LevelId) -> Result<(), SchedError> {
        super::init_communicators(self, tree, level)
    }

    fn set_communicators(&mut self, tree: &ProcessTree, level: LevelId) -> Result<(), SchedError> {
        super::set_communicators(self, tree, level)
    }

    fn free_communicators(&mut self, tree: &mut ProcessTree, level: LevelId) -> Result<(), SchedError> {
        super::free_communicators(self, tree, level)
    }

    fn run(&mut self) -> Result<(), SchedError> {
        super::run(self)
    }

    fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::empty();
        if self.infos.first().is_some_and(|i| i.accepts_multiple_points()) {
            caps |= Capabilities::ACCEPTS_MULTIPLE_POINTS;
        }
        if self.max_final_solutions() > 1 {
            caps |= Capabilities::RETURNS_MULTIPLE_POINTS;
        }
        caps
    }

    fn num_final_solutions(&self) -> FinalSolutions {
        let planned = self.planned_jobs();
        let last = self.infos.last().map_or(1, |i| i.max_final_solutions.max(1));
        FinalSolutions::Fixed(planned.last().copied().unwrap_or(1).saturating_mul(last))
    }

    fn set_initial_points(&mut self, points: &[Vec<f64>]) -> Result<(), SchedError> {
        let accepts = self.infos.first().is_some_and(|i| i.accepts_multiple_points());
        if points.len() > 1 && !accepts {
            return Err(SchedError::CapabilityMismatch(format!(
                "first method of '{}' accepts a single starting point, got {}",
                self.core.id,
                points.len()
            )));
        }
        self.core.initial_points = points.to_vec();
        Ok(())
    }

    fn final_solutions(&self) -> &[ParamResponsePair] {
        &self.core.final_solutions
    }

    fn evaluations(&self) -> usize {
        super::total_evaluations(&self.iterators)
    }

    fn instantiated_models(&self) -> usize {
        super::total_models(&self.iterators)
    }

    fn result_shape(&self) -> (usize, usize) {
        self.infos.last().map_or((0, 0), |i| (i.num_variables, i.num_functions))
    }

    fn interface_id(&self) -> &str {
        self.infos.last().map_or("", |i| i.interface_id.as_str())
    }
}

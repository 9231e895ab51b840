//! Collaborative hybrid: N distinct sub-iterators run as N jobs of a single round.
//!
//! Each job runs its own iterator from the hybrid's starting points. Under peer
//! scheduling a server only builds the iterators of its own block. The iterators do
//! not yet share evaluations; the final solutions are the union of their results in
//! job order.

use super::{MetaCore, MetaIterator};
use crate::config::{MethodBlock, MethodKind, SubMethod};
use crate::context::{IteratorFactory, SubIteratorInfo};
use crate::error::SchedError;
use crate::iterator::{Algorithm, AnyIterator, Capabilities, FinalSolutions};
use crate::parallel::{LevelId, ProcessTree};
use crate::scheduler::{IteratorJobs, IteratorScheduler, JobResult, ParamResponsePair, ProcessorEstimate};

#[derive(Debug)]
pub struct CollabHybridMetaIterator {
    core: MetaCore,
    subs: Vec<SubMethod>,
    infos: Vec<SubIteratorInfo>,
    scheduler: IteratorScheduler,
    iterators: Vec<AnyIterator>,
}

impl CollabHybridMetaIterator {
    pub fn new(factory: IteratorFactory, block: &MethodBlock) -> Result<Self, SchedError> {
        let MethodKind::HybridCollaborative(spec) = &block.method else {
            return Err(SchedError::Spec(format!("method '{}' is not a collaborative hybrid", block.id)));
        };
        let subs = spec.resolve(factory.default_model(), factory.description())?;
        let infos = subs.iter().map(|sub| factory.probe(sub)).collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            scheduler: IteratorScheduler::new(block.scheduling.clone(), subs.len()),
            core: MetaCore::new(factory, block),
            subs,
            infos,
            iterators: Vec::new(),
        })
    }

    pub fn sub_methods(&self) -> &[SubMethod] {
        &self.subs
    }

    pub fn scheduler(&self) -> &IteratorScheduler {
        &self.scheduler
    }
}

struct CollabJobs<'a> {
    iterators: &'a mut [AnyIterator],
    starts: &'a [Vec<f64>],
    representative: JobResult,
}

impl CollabJobs<'_> {
    fn iterator(&mut self, job: usize) -> Result<&mut AnyIterator, SchedError> {
        self.iterators
            .get_mut(job)
            .ok_or_else(|| SchedError::Spec(format!("no sub-iterator for job {job}")))
    }
}

impl IteratorJobs for CollabJobs<'_> {
    type Params = Vec<Vec<f64>>;

    fn job_params(&self, _job: usize) -> Vec<Vec<f64>> {
        self.starts.to_vec()
    }

    fn representative_result(&self) -> JobResult {
        self.representative.clone()
    }

    fn initialize_job(&mut self, job: usize, params: &Vec<Vec<f64>>) -> Result<(), SchedError> {
        let iterator = self.iterator(job)?.as_algorithm_mut();
        if params.len() > 1 && !iterator.accepts_multiple_points() {
            return iterator.set_initial_points(&params[..1]);
        }
        iterator.set_initial_points(params)
    }

    fn run_job(&mut self, job: usize) -> Result<(), SchedError> {
        self.iterator(job)?.as_algorithm_mut().run()
    }

    fn update_local_results(&mut self, job: usize) -> Result<JobResult, SchedError> {
        Ok(self.iterator(job)?.as_algorithm().final_solutions().to_vec())
    }
}

impl MetaIterator for CollabHybridMetaIterator {
    fn meta(&self) -> &MetaCore {
        &self.core
    }

    fn meta_mut(&mut self) -> &mut MetaCore {
        &mut self.core
    }

    fn derived_init(&mut self, tree: &mut ProcessTree, level: LevelId) -> Result<(), SchedError> {
        let estimate = self.core.factory.estimate(&self.subs)?;
        self.scheduler.init_iterator_parallelism(tree, level, self.subs.len(), estimate)?;
        let assigned = self.scheduler.assigned_jobs(self.subs.len());
        self.iterators = Vec::with_capacity(self.subs.len());
        for (job, sub) in self.subs.iter().enumerate() {
            let built = if assigned.contains(&job) {
                super::instantiate_subs(&self.core.factory, std::slice::from_ref(sub), &self.scheduler, tree)?.pop()
            } else {
                None
            };
            self.iterators.push(built.unwrap_or_else(AnyIterator::empty));
        }
        Ok(())
    }

    fn derived_set(&mut self, tree: &ProcessTree, _level: LevelId) -> Result<(), SchedError> {
        super::set_subs(&mut self.iterators, &mut self.scheduler, tree)
    }

    fn derived_free(&mut self, tree: &mut ProcessTree, _level: LevelId) -> Result<(), SchedError> {
        super::free_subs(&mut self.iterators, &mut self.scheduler, tree)?;
        self.iterators.clear();
        Ok(())
    }

    fn core_run(&mut self) -> Result<(), SchedError> {
        let mut jobs = CollabJobs {
            iterators: &mut self.iterators,
            starts: &self.core.initial_points,
            representative: SubIteratorInfo::representative_of(&self.infos),
        };
        let table = self.scheduler.schedule_iterators(&mut jobs, self.subs.len())?;
        super::log_round_summary(&format!("collaborative hybrid '{}'", self.core.id), &self.scheduler, &table);
        self.core.final_solutions = table.flatten();
        Ok(())
    }
}

impl Algorithm for CollabHybridMetaIterator {
    fn method_name(&self) -> &str {
        "hybrid_collaborative"
    }

    fn estimate_processors(&self) -> Result<ProcessorEstimate, SchedError> {
        super::level_estimate(&self.core.factory, &self.subs, &self.core.options, self.subs.len())
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
        let mut caps = Capabilities::ACCEPTS_MULTIPLE_POINTS;
        if self.max_final_solutions() > 1 {
            caps |= Capabilities::RETURNS_MULTIPLE_POINTS;
        }
        caps
    }

    fn num_final_solutions(&self) -> FinalSolutions {
        FinalSolutions::Fixed(self.infos.iter().map(|i| i.max_final_solutions.max(1)).sum())
    }

    fn set_initial_points(&mut self, points: &[Vec<f64>]) -> Result<(), SchedError> {
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
        self.infos.first().map_or((0, 0), |i| (i.num_variables, i.num_functions))
    }

    fn interface_id(&self) -> &str {
        self.infos.first().map_or("", |i| i.interface_id.as_str())
    }
}

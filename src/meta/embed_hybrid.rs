//! Embedded hybrid: a global iterator with a local iterator co-resident on the same
//! servers. A run schedules a single job that drives the global iterator; the local
//! iterator is built and sized alongside it but is not yet handed points to refine.

use super::{MetaCore, MetaIterator};
use crate::config::{resolve_single, MethodBlock, MethodKind, SubMethod};
use crate::context::{IteratorFactory, SubIteratorInfo};
use crate::error::SchedError;
use crate::iterator::{Algorithm, AnyIterator, Capabilities, FinalSolutions};
use crate::parallel::{LevelId, ProcessTree};
use crate::scheduler::{IteratorJobs, IteratorScheduler, JobResult, ParamResponsePair, ProcessorEstimate};
use log::warn;

#[derive(Debug)]
pub struct EmbedHybridMetaIterator {
    core: MetaCore,
    subs: [SubMethod; 2],
    global_info: SubIteratorInfo,
    local_search_probability: f64,
    scheduler: IteratorScheduler,
    iterators: Vec<AnyIterator>,
}

impl EmbedHybridMetaIterator {
    pub fn new(factory: IteratorFactory, block: &MethodBlock) -> Result<Self, SchedError> {
        let MethodKind::HybridEmbedded(spec) = &block.method else {
            return Err(SchedError::Spec(format!("method '{}' is not an embedded hybrid", block.id)));
        };
        let description = factory.description();
        let meta_model = factory.default_model();
        let global = resolve_single(
            spec.global_method_pointer.as_deref(),
            spec.global_method_name.as_deref(),
            spec.global_model_pointer.as_deref(),
            meta_model,
            description,
        )?;
        let local = resolve_single(
            spec.local_method_pointer.as_deref(),
            spec.local_method_name.as_deref(),
            spec.local_model_pointer.as_deref(),
            meta_model,
            description,
        )?;
        let global_info = factory.probe(&global)?;
        factory.probe(&local)?;

        let mut probability = spec.local_search_probability;
        if !(0.0..=1.0).contains(&probability) {
            warn!("'{}': local search probability {probability} outside [0, 1], clamping", block.id);
            probability = if probability > 1.0 { 1.0 } else { 0.0 };
        }

        Ok(Self {
            scheduler: IteratorScheduler::new(block.scheduling.clone(), 1),
            core: MetaCore::new(factory, block),
            subs: [global, local],
            global_info,
            local_search_probability: probability,
            iterators: Vec::new(),
        })
    }

    pub fn local_search_probability(&self) -> f64 {
        self.local_search_probability
    }

    pub fn scheduler(&self) -> &IteratorScheduler {
        &self.scheduler
    }
}

struct GlobalJob<'a> {
    global: &'a mut AnyIterator,
    starts: &'a [Vec<f64>],
    representative: JobResult,
}

impl IteratorJobs for GlobalJob<'_> {
    type Params = Vec<Vec<f64>>;

    fn job_params(&self, _job: usize) -> Vec<Vec<f64>> {
        self.starts.to_vec()
    }

    fn representative_result(&self) -> JobResult {
        self.representative.clone()
    }

    fn initialize_job(&mut self, _job: usize, params: &Vec<Vec<f64>>) -> Result<(), SchedError> {
        self.global.as_algorithm_mut().set_initial_points(params)
    }

    fn run_job(&mut self, _job: usize) -> Result<(), SchedError> {
        self.global.as_algorithm_mut().run()
    }

    fn update_local_results(&mut self, _job: usize) -> Result<JobResult, SchedError> {
        Ok(self.global.as_algorithm().final_solutions().to_vec())
    }
}

impl MetaIterator for EmbedHybridMetaIterator {
    fn meta(&self) -> &MetaCore {
        &self.core
    }

    fn meta_mut(&mut self) -> &mut MetaCore {
        &mut self.core
    }

    fn derived_init(&mut self, tree: &mut ProcessTree, level: LevelId) -> Result<(), SchedError> {
        let estimate = self.core.factory.estimate(&self.subs)?;
        self.scheduler.init_iterator_parallelism(tree, level, 1, estimate)?;
        self.iterators = super::instantiate_subs(&self.core.factory, &self.subs, &self.scheduler, tree)?;
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
        let global = self
            .iterators
            .first_mut()
            .ok_or(SchedError::Lifecycle { from: "communicators freed", to: "running" })?;
        let mut job = GlobalJob {
            global,
            starts: &self.core.initial_points,
            representative: self.global_info.representative_result(),
        };
        let table = self.scheduler.schedule_iterators(&mut job, 1)?;
        super::log_round_summary(&format!("embedded hybrid '{}'", self.core.id), &self.scheduler, &table);
        self.core.final_solutions = table.flatten();
        Ok(())
    }
}

impl Algorithm for EmbedHybridMetaIterator {
    fn method_name(&self) -> &str {
        "hybrid_embedded"
    }

    fn estimate_processors(&self) -> Result<ProcessorEstimate, SchedError> {
        super::level_estimate(&self.core.factory, &self.subs, &self.core.options, 1)
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
        self.global_info.capabilities()
    }

    fn num_final_solutions(&self) -> FinalSolutions {
        FinalSolutions::Fixed(self.global_info.max_final_solutions.max(1))
    }

    fn set_initial_points(&mut self, points: &[Vec<f64>]) -> Result<(), SchedError> {
        if points.len() > 1 && !self.global_info.accepts_multiple_points() {
            return Err(SchedError::CapabilityMismatch(format!(
                "global method of '{}' accepts a single starting point",
                self.core.id
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
        (self.global_info.num_variables, self.global_info.num_functions)
    }

    fn interface_id(&self) -> &str {
        &self.global_info.interface_id
    }
}

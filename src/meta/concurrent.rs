//! Concurrent meta-iterator: one sub-iterator over many independent parameter sets.
//!
//! Multi-start runs the sub-iterator from each starting point; Pareto-set runs it once
//! per weight set, reducing the model's functions with those weights. User-listed sets
//! come first, seeded random sets after them. Every job is independent, so completion
//! order does not matter; a failing job fails the whole run.

use super::{MetaCore, MetaIterator};
use crate::config::{MethodBlock, MethodKind, ModelBlock, SubMethod};
use crate::error::SchedError;
use crate::iterator::{Algorithm, AnyIterator, Capabilities, FinalSolutions};
use crate::model::Model;
use crate::parallel::{LevelId, ProcessTree};
use crate::scheduler::{
    IteratorJobs, IteratorScheduler, JobResult, ParamResponsePair, ProcessorEstimate,
};
use crate::context::{IteratorFactory, SubIteratorInfo};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrentKind {
    MultiStart,
    ParetoSet,
}

#[derive(Debug)]
pub struct ConcurrentMetaIterator {
    core: MetaCore,
    kind: ConcurrentKind,
    sub_method: SubMethod,
    info: SubIteratorInfo,
    parameter_sets: Vec<Vec<f64>>,
    reference_point: Vec<f64>,
    scheduler: IteratorScheduler,
    sub: AnyIterator,
    job_results: Vec<JobResult>,
}

fn random_starts(model: &ModelBlock, count: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    (0..count)
        .map(|_| {
            model
                .lower_bounds
                .iter()
                .zip(&model.upper_bounds)
                .map(|(&lo, &hi)| if hi > lo { rng.gen_range(lo..=hi) } else { lo })
                .collect()
        })
        .collect()
}

fn random_weights(num_functions: usize, count: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    (0..count)
        .map(|_| {
            let raw: Vec<f64> = (0..num_functions).map(|_| rng.r#gen::<f64>() + f64::EPSILON).collect();
            let sum: f64 = raw.iter().sum();
            raw.into_iter().map(|w| w / sum).collect()
        })
        .collect()
}

impl ConcurrentMetaIterator {
    pub fn new(factory: IteratorFactory, block: &MethodBlock) -> Result<Self, SchedError> {
        let description = factory.description();
        let meta_model = factory.default_model();
        let (kind, sub_method, user_sets, random_count, seed) = match &block.method {
            MethodKind::MultiStart(spec) => (
                ConcurrentKind::MultiStart,
                spec.sub_method.resolve(meta_model, description)?,
                spec.starting_points.clone(),
                spec.random_starts,
                spec.seed,
            ),
            MethodKind::ParetoSet(spec) => (
                ConcurrentKind::ParetoSet,
                spec.sub_method.resolve(meta_model, description)?,
                spec.weight_sets.clone(),
                spec.random_weight_sets,
                spec.seed,
            ),
            _ => return Err(SchedError::Spec(format!("method '{}' is not a concurrent method", block.id))),
        };
        let info = factory.probe(&sub_method)?;
        let model = match &sub_method {
            SubMethod::Named { model, .. } => description.model(model)?,
            SubMethod::Pointer(id) => factory.model_for(description.method(id)?)?,
        };

        let mut rng = StdRng::seed_from_u64(seed);
        let mut parameter_sets = user_sets;
        match kind {
            ConcurrentKind::MultiStart => {
                if let Some(bad) = parameter_sets.iter().find(|p| p.len() != info.num_variables) {
                    return Err(SchedError::Spec(format!(
                        "'{}': starting point {bad:?} does not have {} entries",
                        block.id, info.num_variables
                    )));
                }
                parameter_sets.extend(random_starts(model, random_count, &mut rng));
            }
            ConcurrentKind::ParetoSet => {
                if let Some(bad) = parameter_sets.iter().find(|w| w.len() != info.num_functions) {
                    return Err(SchedError::Spec(format!(
                        "'{}': weight set {bad:?} does not match the {} objective(s) of model '{}'",
                        block.id, info.num_functions, model.id
                    )));
                }
                parameter_sets.extend(random_weights(info.num_functions, random_count, &mut rng));
            }
        }
        if parameter_sets.is_empty() {
            return Err(SchedError::Spec(format!("'{}' has no parameter sets to run", block.id)));
        }

        let scheduler = IteratorScheduler::new(block.scheduling.clone(), parameter_sets.len());
        Ok(Self {
            core: MetaCore::new(factory.clone(), block),
            kind,
            sub_method,
            info,
            parameter_sets,
            reference_point: model.initial_point.clone(),
            scheduler,
            sub: AnyIterator::empty(),
            job_results: Vec::new(),
        })
    }

    pub fn kind(&self) -> ConcurrentKind {
        self.kind
    }

    pub fn parameter_sets(&self) -> &[Vec<f64>] {
        &self.parameter_sets
    }

    pub fn scheduler(&self) -> &IteratorScheduler {
        &self.scheduler
    }

    /// Per-job results of the last run, in job order.
    pub fn job_results(&self) -> &[JobResult] {
        &self.job_results
    }
}

struct ConcurrentJobs<'a> {
    kind: ConcurrentKind,
    sub: &'a mut AnyIterator,
    parameter_sets: &'a [Vec<f64>],
    reference_point: &'a [f64],
    representative: JobResult,
}

impl IteratorJobs for ConcurrentJobs<'_> {
    type Params = Vec<f64>;

    fn job_params(&self, job: usize) -> Vec<f64> {
        self.parameter_sets.get(job).cloned().unwrap_or_default()
    }

    fn representative_result(&self) -> JobResult {
        self.representative.clone()
    }

    fn initialize_job(&mut self, _job: usize, params: &Vec<f64>) -> Result<(), SchedError> {
        let sub = self.sub.as_algorithm_mut();
        match self.kind {
            ConcurrentKind::MultiStart => sub.set_initial_points(std::slice::from_ref(params)),
            ConcurrentKind::ParetoSet => {
                let model = sub.model_mut().ok_or_else(|| {
                    SchedError::CapabilityMismatch("Pareto-set sub-iterator must own a model".to_string())
                })?;
                model.set_continuous_variables(self.reference_point)?;
                model.set_primary_weights(Some(params.clone()))
            }
        }
    }

    fn run_job(&mut self, _job: usize) -> Result<(), SchedError> {
        self.sub.as_algorithm_mut().run()
    }

    fn update_local_results(&mut self, _job: usize) -> Result<JobResult, SchedError> {
        Ok(self.sub.as_algorithm().final_solutions().to_vec())
    }
}

impl MetaIterator for ConcurrentMetaIterator {
    fn meta(&self) -> &MetaCore {
        &self.core
    }

    fn meta_mut(&mut self) -> &mut MetaCore {
        &mut self.core
    }

    fn derived_init(&mut self, tree: &mut ProcessTree, level: LevelId) -> Result<(), SchedError> {
        let estimate = self.core.factory.estimate(std::slice::from_ref(&self.sub_method))?;
        self.scheduler
            .init_iterator_parallelism(tree, level, self.parameter_sets.len(), estimate)?;
        let mut subs = super::instantiate_subs(
            &self.core.factory,
            std::slice::from_ref(&self.sub_method),
            &self.scheduler,
            tree,
        )?;
        self.sub = subs.pop().unwrap_or_else(AnyIterator::empty);
        if self.kind == ConcurrentKind::ParetoSet && !self.sub.is_empty() && self.sub.as_algorithm().model().is_none() {
            return Err(SchedError::CapabilityMismatch(format!(
                "'{}': Pareto-set sub-iterator {} does not own a model",
                self.core.id, self.sub_method
            )));
        }
        Ok(())
    }

    fn derived_set(&mut self, tree: &ProcessTree, _level: LevelId) -> Result<(), SchedError> {
        super::set_subs(std::slice::from_mut(&mut self.sub), &mut self.scheduler, tree)
    }

    fn derived_free(&mut self, tree: &mut ProcessTree, _level: LevelId) -> Result<(), SchedError> {
        super::free_subs(std::slice::from_mut(&mut self.sub), &mut self.scheduler, tree)?;
        self.sub = AnyIterator::empty();
        Ok(())
    }

    fn core_run(&mut self) -> Result<(), SchedError> {
        let mut jobs = ConcurrentJobs {
            kind: self.kind,
            sub: &mut self.sub,
            parameter_sets: &self.parameter_sets,
            reference_point: &self.reference_point,
            representative: self.info.representative_result(),
        };
        let table = self.scheduler.schedule_iterators(&mut jobs, self.parameter_sets.len())?;
        let label = match self.kind {
            ConcurrentKind::MultiStart => format!("multi-start '{}'", self.core.id),
            ConcurrentKind::ParetoSet => format!("Pareto set '{}'", self.core.id),
        };
        super::log_round_summary(&label, &self.scheduler, &table);
        self.core.final_solutions = table.flatten();
        self.job_results = table.into_results()?;
        Ok(())
    }
}

impl Algorithm for ConcurrentMetaIterator {
    fn method_name(&self) -> &str {
        match self.kind {
            ConcurrentKind::MultiStart => "multi_start",
            ConcurrentKind::ParetoSet => "pareto_set",
        }
    }

    fn estimate_processors(&self) -> Result<ProcessorEstimate, SchedError> {
        super::level_estimate(
            &self.core.factory,
            std::slice::from_ref(&self.sub_method),
            &self.core.options,
            self.scheduler.max_concurrency(),
        )
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
        Capabilities::RETURNS_MULTIPLE_POINTS
    }

    fn num_final_solutions(&self) -> FinalSolutions {
        FinalSolutions::Fixed(self.parameter_sets.len() * self.info.max_final_solutions.max(1))
    }

    fn set_initial_points(&mut self, points: &[Vec<f64>]) -> Result<(), SchedError> {
        match (self.kind, points) {
            (_, []) => Ok(()),
            (ConcurrentKind::ParetoSet, [reference]) if reference.len() == self.info.num_variables => {
                self.reference_point = reference.clone();
                Ok(())
            }
            _ => Err(SchedError::CapabilityMismatch(format!(
                "{} '{}' generates its own starting points",
                self.method_name(),
                self.core.id
            ))),
        }
    }

    fn final_solutions(&self) -> &[ParamResponsePair] {
        &self.core.final_solutions
    }

    fn evaluations(&self) -> usize {
        self.sub.as_algorithm().evaluations()
    }

    fn instantiated_models(&self) -> usize {
        self.sub.as_algorithm().instantiated_models()
    }

    fn result_shape(&self) -> (usize, usize) {
        (self.info.num_variables, self.info.num_functions)
    }

    fn interface_id(&self) -> &str {
        &self.info.interface_id
    }
}

//! Iterators: the algorithms a meta-iterator schedules.
//!
//! Every iterator, leaf or meta, implements [`Algorithm`]. The concrete set is closed
//! and collected in [`AnyIterator`], which is what the factory hands out and what
//! meta-iterators own.
//!
//! Leaf iterators do all of their numerical work on the lead process of the server
//! they are bound to; the other members of the server return immediately from `run`.

pub mod evolution;
pub mod newton;
pub mod pattern_search;
pub mod sampling;

pub use evolution::EvolutionStrategy;
pub use newton::NewtonCg;
pub use pattern_search::PatternSearch;
pub use sampling::RandomSampling;

use crate::error::SchedError;
use crate::meta::{CollabHybridMetaIterator, ConcurrentMetaIterator, EmbedHybridMetaIterator, SeqHybridMetaIterator};
use crate::model::{AnyModel, Model};
use crate::parallel::{Comm, Communicator, LevelId, ProcessTree};
use crate::scheduler::{best_of, ParamResponsePair, ProcessorEstimate, Response};
use bitflags::bitflags;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::hash::{DefaultHasher, Hash, Hasher};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u8 {
        /// Can start from several points at once.
        const ACCEPTS_MULTIPLE_POINTS = 0b01;
        /// Can return several final solutions.
        const RETURNS_MULTIPLE_POINTS = 0b10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalSolutions {
    Fixed(usize),
    /// Known once the instance exists; see [`Algorithm::population_size`].
    AlgorithmDefined,
}

pub trait Algorithm {
    fn method_name(&self) -> &str;

    fn estimate_processors(&self) -> Result<ProcessorEstimate, SchedError>;

    fn init_communicators(&mut self, tree: &mut ProcessTree, level: LevelId) -> Result<(), SchedError>;
    fn set_communicators(&mut self, tree: &ProcessTree, level: LevelId) -> Result<(), SchedError>;
    fn free_communicators(&mut self, tree: &mut ProcessTree, level: LevelId) -> Result<(), SchedError>;

    fn run(&mut self) -> Result<(), SchedError>;

    fn capabilities(&self) -> Capabilities;

    fn accepts_multiple_points(&self) -> bool {
        self.capabilities().contains(Capabilities::ACCEPTS_MULTIPLE_POINTS)
    }

    fn returns_multiple_points(&self) -> bool {
        self.capabilities().contains(Capabilities::RETURNS_MULTIPLE_POINTS)
    }

    fn num_final_solutions(&self) -> FinalSolutions;

    /// Size of the population an algorithm-defined solution count resolves to.
    fn population_size(&self) -> usize {
        1
    }

    /// Upper bound on the number of final solutions.
    fn max_final_solutions(&self) -> usize {
        match self.num_final_solutions() {
            FinalSolutions::Fixed(n) => n,
            FinalSolutions::AlgorithmDefined => self.population_size(),
        }
    }

    fn set_initial_points(&mut self, points: &[Vec<f64>]) -> Result<(), SchedError>;

    fn final_solutions(&self) -> &[ParamResponsePair];

    fn variables_results(&self) -> Option<&[f64]> {
        best_of(self.final_solutions()).map(|p| p.variables.as_slice())
    }

    fn response_results(&self) -> Option<&Response> {
        best_of(self.final_solutions()).map(|p| &p.response)
    }

    /// Cap the work of one `run`. Ignored by iterators without an iteration count.
    fn set_max_iterations(&mut self, _iterations: usize) {}

    fn evaluations(&self) -> usize;

    /// Number of full (evaluable) models this process holds.
    fn instantiated_models(&self) -> usize;

    fn model(&self) -> Option<&AnyModel> {
        None
    }

    fn model_mut(&mut self) -> Option<&mut AnyModel> {
        None
    }

    /// (variables, functions) of the records this iterator returns.
    fn result_shape(&self) -> (usize, usize);

    /// Interface id stamped on the records this iterator returns.
    fn interface_id(&self) -> &str;
}

/// State shared by every leaf iterator.
#[derive(Debug, Clone)]
pub struct LeafCore {
    pub model: AnyModel,
    comm: Option<Communicator>,
    initial_points: Vec<Vec<f64>>,
    final_solutions: Vec<ParamResponsePair>,
    max_iterations: Option<usize>,
}

impl LeafCore {
    pub fn new(model: AnyModel) -> Self {
        Self {
            model,
            comm: None,
            initial_points: Vec::new(),
            final_solutions: Vec::new(),
            max_iterations: None,
        }
    }

    /// Only the server lead (or an unbound iterator) computes.
    pub fn computes(&self) -> bool {
        self.comm.as_ref().is_none_or(|c| c.is_lead())
    }

    pub fn max_iterations(&self, default: usize) -> usize {
        self.max_iterations.unwrap_or(default)
    }

    /// Starting points, falling back to the model's current variables.
    pub fn start_points(&self) -> Vec<Vec<f64>> {
        let mut points = if self.initial_points.is_empty() {
            vec![self.model.continuous_variables().to_vec()]
        } else {
            self.initial_points.clone()
        };
        for p in points.iter_mut() {
            self.model.project(p);
        }
        points
    }

    pub fn evaluate(&mut self, x: &[f64]) -> Result<Response, SchedError> {
        self.model.evaluate_at(x)
    }

    pub fn record(&self, x: Vec<f64>, response: Response) -> ParamResponsePair {
        ParamResponsePair::new(x, self.model.interface_id(), response)
    }
}

/// Random stream for one run of a stochastic leaf.
///
/// Depends only on the configured seed and the starting points of the run, never on
/// earlier runs of the same instance.
pub(crate) fn run_rng(seed: u64, starts: &[Vec<f64>]) -> StdRng {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    for x in starts.iter().flatten() {
        x.to_bits().hash(&mut hasher);
    }
    StdRng::seed_from_u64(hasher.finish())
}

/// Numerical part of a leaf iterator; the rest of [`Algorithm`] comes from [`LeafCore`].
pub trait LeafMethod {
    const NAME: &'static str;
    const CAPABILITIES: Capabilities;

    fn core(&self) -> &LeafCore;
    fn core_mut(&mut self) -> &mut LeafCore;

    fn num_final_solutions(&self) -> FinalSolutions {
        FinalSolutions::Fixed(1)
    }

    fn population_size(&self) -> usize {
        1
    }

    /// Run from `starts`, returning the final solutions.
    fn iterate(&mut self, starts: Vec<Vec<f64>>) -> Result<Vec<ParamResponsePair>, SchedError>;
}

impl<T: LeafMethod> Algorithm for T {
    fn method_name(&self) -> &str {
        T::NAME
    }

    fn estimate_processors(&self) -> Result<ProcessorEstimate, SchedError> {
        Ok(self.core().model.estimate_processors())
    }

    fn init_communicators(&mut self, tree: &mut ProcessTree, level: LevelId) -> Result<(), SchedError> {
        tree.group(level).map(|_| ())
    }

    fn set_communicators(&mut self, tree: &ProcessTree, level: LevelId) -> Result<(), SchedError> {
        self.core_mut().comm = tree.group(level)?.comm().cloned();
        Ok(())
    }

    fn free_communicators(&mut self, _tree: &mut ProcessTree, _level: LevelId) -> Result<(), SchedError> {
        self.core_mut().comm = None;
        Ok(())
    }

    fn run(&mut self) -> Result<(), SchedError> {
        if !self.core().computes() {
            return Ok(());
        }
        let starts = self.core().start_points();
        let solutions = self.iterate(starts)?;
        if let Some(best) = best_of(&solutions) {
            log::debug!(
                "{} on '{}' finished with objective {:.6e}",
                T::NAME,
                self.core().model.id(),
                best.objective()
            );
        }
        self.core_mut().final_solutions = solutions;
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        T::CAPABILITIES
    }

    fn num_final_solutions(&self) -> FinalSolutions {
        LeafMethod::num_final_solutions(self)
    }

    fn population_size(&self) -> usize {
        LeafMethod::population_size(self)
    }

    fn set_initial_points(&mut self, points: &[Vec<f64>]) -> Result<(), SchedError> {
        let n = self.core().model.num_variables();
        if let Some(bad) = points.iter().find(|p| p.len() != n) {
            return Err(SchedError::Model(format!(
                "{}: starting point has {} entries, model '{}' has {n} variables",
                T::NAME,
                bad.len(),
                self.core().model.id()
            )));
        }
        if points.len() > 1 && !T::CAPABILITIES.contains(Capabilities::ACCEPTS_MULTIPLE_POINTS) {
            return Err(SchedError::CapabilityMismatch(format!(
                "{} accepts a single starting point, got {}",
                T::NAME,
                points.len()
            )));
        }
        self.core_mut().initial_points = points.to_vec();
        Ok(())
    }

    fn final_solutions(&self) -> &[ParamResponsePair] {
        &self.core().final_solutions
    }

    fn set_max_iterations(&mut self, iterations: usize) {
        self.core_mut().max_iterations = Some(iterations.max(1));
    }

    fn evaluations(&self) -> usize {
        self.core().model.evaluation_count()
    }

    fn instantiated_models(&self) -> usize {
        usize::from(!self.core().model.is_placeholder())
    }

    fn model(&self) -> Option<&AnyModel> {
        Some(&self.core().model)
    }

    fn model_mut(&mut self) -> Option<&mut AnyModel> {
        Some(&mut self.core_mut().model)
    }

    fn result_shape(&self) -> (usize, usize) {
        let model = &self.core().model;
        (model.num_variables(), model.num_functions())
    }

    fn interface_id(&self) -> &str {
        self.core().model.interface_id()
    }
}

/// Stand-in held by processes that run no sub-iterator (dedicated master, idle).
#[derive(Debug, Clone, Default)]
pub struct EmptyIterator {
    final_solutions: Vec<ParamResponsePair>,
}

impl Algorithm for EmptyIterator {
    fn method_name(&self) -> &str {
        "empty"
    }
    fn estimate_processors(&self) -> Result<ProcessorEstimate, SchedError> {
        Ok(ProcessorEstimate::serial())
    }
    fn init_communicators(&mut self, _tree: &mut ProcessTree, _level: LevelId) -> Result<(), SchedError> {
        Ok(())
    }
    fn set_communicators(&mut self, _tree: &ProcessTree, _level: LevelId) -> Result<(), SchedError> {
        Ok(())
    }
    fn free_communicators(&mut self, _tree: &mut ProcessTree, _level: LevelId) -> Result<(), SchedError> {
        Ok(())
    }
    fn run(&mut self) -> Result<(), SchedError> {
        Ok(())
    }
    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }
    fn num_final_solutions(&self) -> FinalSolutions {
        FinalSolutions::Fixed(0)
    }
    fn set_initial_points(&mut self, _points: &[Vec<f64>]) -> Result<(), SchedError> {
        Ok(())
    }
    fn final_solutions(&self) -> &[ParamResponsePair] {
        &self.final_solutions
    }
    fn evaluations(&self) -> usize {
        0
    }
    fn instantiated_models(&self) -> usize {
        0
    }
    fn result_shape(&self) -> (usize, usize) {
        (0, 0)
    }
    fn interface_id(&self) -> &str {
        ""
    }
}

pub enum AnyIterator {
    Empty(EmptyIterator),
    PatternSearch(PatternSearch),
    NewtonCg(NewtonCg),
    RandomSampling(RandomSampling),
    EvolutionStrategy(EvolutionStrategy),
    Concurrent(Box<ConcurrentMetaIterator>),
    SeqHybrid(Box<SeqHybridMetaIterator>),
    EmbedHybrid(Box<EmbedHybridMetaIterator>),
    CollabHybrid(Box<CollabHybridMetaIterator>),
}

impl AnyIterator {
    pub fn empty() -> Self {
        AnyIterator::Empty(EmptyIterator::default())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, AnyIterator::Empty(_))
    }

    pub fn as_algorithm(&self) -> &dyn Algorithm {
        match self {
            AnyIterator::Empty(it) => it,
            AnyIterator::PatternSearch(it) => it,
            AnyIterator::NewtonCg(it) => it,
            AnyIterator::RandomSampling(it) => it,
            AnyIterator::EvolutionStrategy(it) => it,
            AnyIterator::Concurrent(it) => &**it,
            AnyIterator::SeqHybrid(it) => &**it,
            AnyIterator::EmbedHybrid(it) => &**it,
            AnyIterator::CollabHybrid(it) => &**it,
        }
    }

    pub fn as_algorithm_mut(&mut self) -> &mut dyn Algorithm {
        match self {
            AnyIterator::Empty(it) => it,
            AnyIterator::PatternSearch(it) => it,
            AnyIterator::NewtonCg(it) => it,
            AnyIterator::RandomSampling(it) => it,
            AnyIterator::EvolutionStrategy(it) => it,
            AnyIterator::Concurrent(it) => &mut **it,
            AnyIterator::SeqHybrid(it) => &mut **it,
            AnyIterator::EmbedHybrid(it) => &mut **it,
            AnyIterator::CollabHybrid(it) => &mut **it,
        }
    }
}

impl std::fmt::Debug for AnyIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AnyIterator({})", self.as_algorithm().method_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelBlock, PatternSearchSpec, SamplingSpec, TestFunction};

    fn block() -> ModelBlock {
        ModelBlock::new("m", TestFunction::Rastrigin, vec![-2.0; 2], vec![2.0; 2], vec![1.0; 2])
    }

    #[test]
    fn capabilities_flow_through_the_enum() {
        let ps = AnyIterator::PatternSearch(PatternSearch::new(AnyModel::placeholder(&block()), PatternSearchSpec::default()));
        let rs = AnyIterator::RandomSampling(RandomSampling::new(
            AnyModel::placeholder(&block()),
            SamplingSpec { final_solutions: Some(4), ..SamplingSpec::default() },
        ));
        assert!(!ps.as_algorithm().accepts_multiple_points());
        assert!(rs.as_algorithm().returns_multiple_points());
        assert_eq!(rs.as_algorithm().max_final_solutions(), 4);
        assert_eq!(ps.as_algorithm().instantiated_models(), 0);
    }

    #[test]
    fn single_point_iterators_reject_several_starts() {
        let mut ps = PatternSearch::new(AnyModel::placeholder(&block()), PatternSearchSpec::default());
        let err = ps.set_initial_points(&[vec![0.0; 2], vec![1.0; 2]]).unwrap_err();
        assert!(matches!(err, SchedError::CapabilityMismatch(_)));
        assert!(ps.set_initial_points(&[vec![0.0; 3]]).is_err());
    }

    #[test]
    fn placeholder_run_fails_on_evaluation() {
        let mut ps = PatternSearch::new(AnyModel::placeholder(&block()), PatternSearchSpec::default());
        assert!(matches!(ps.run(), Err(SchedError::Model(_))));
    }
}

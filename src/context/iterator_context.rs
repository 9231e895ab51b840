//! Iterator factory.
//!
//! Builds iterators from the shared problem description. A `Lightweight` build binds
//! leaf iterators to a [`ModelStub`](crate::model::ModelStub) carrying only shape and
//! processor information; it is what estimation, dedicated masters and idle processes
//! use. A `Full` build instantiates the evaluable model.

use crate::config::{MethodBlock, MethodKind, ModelBlock, ProblemDescription, SubMethod};
use crate::error::SchedError;
use crate::iterator::{
    AnyIterator, Algorithm, Capabilities, EvolutionStrategy, NewtonCg, PatternSearch, RandomSampling,
};
use crate::meta::{CollabHybridMetaIterator, ConcurrentMetaIterator, EmbedHybridMetaIterator, SeqHybridMetaIterator};
use crate::model::AnyModel;
use crate::scheduler::{JobResult, ParamResponsePair, ProcessorEstimate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Method-pointer chains deeper than this are treated as cycles.
pub const MAX_NESTING_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Construction {
    Lightweight,
    Full,
}

/// What a parent needs to know about a sub-iterator without running it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubIteratorInfo {
    pub method_name: String,
    pub estimate: ProcessorEstimate,
    pub capabilities: u8,
    pub max_final_solutions: usize,
    pub num_variables: usize,
    pub num_functions: usize,
    pub interface_id: String,
}

impl SubIteratorInfo {
    pub fn of(iterator: &dyn Algorithm) -> Result<Self, SchedError> {
        let (num_variables, num_functions) = iterator.result_shape();
        Ok(Self {
            method_name: iterator.method_name().to_string(),
            estimate: iterator.estimate_processors()?,
            capabilities: iterator.capabilities().bits(),
            max_final_solutions: iterator.max_final_solutions(),
            num_variables,
            num_functions,
            interface_id: iterator.interface_id().to_string(),
        })
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::from_bits_truncate(self.capabilities)
    }

    pub fn accepts_multiple_points(&self) -> bool {
        self.capabilities().contains(Capabilities::ACCEPTS_MULTIPLE_POINTS)
    }

    /// Zero-filled result as large as any this sub-iterator returns.
    pub fn representative_result(&self) -> JobResult {
        vec![
            ParamResponsePair::placeholder(self.num_variables, self.num_functions, &self.interface_id);
            self.max_final_solutions.max(1)
        ]
    }

    /// Representative covering every entry of `infos`.
    pub fn representative_of(infos: &[SubIteratorInfo]) -> JobResult {
        let count = infos.iter().map(|i| i.max_final_solutions).max().unwrap_or(1).max(1);
        let nv = infos.iter().map(|i| i.num_variables).max().unwrap_or(0);
        let nf = infos.iter().map(|i| i.num_functions).max().unwrap_or(0);
        let id = infos.iter().map(|i| i.interface_id.as_str()).max_by_key(|s| s.len()).unwrap_or("");
        vec![ParamResponsePair::placeholder(nv, nf, id); count]
    }
}

#[derive(Debug, Clone)]
pub struct IteratorFactory {
    description: Arc<ProblemDescription>,
    depth: usize,
    default_model: Option<String>,
}

impl IteratorFactory {
    pub fn new(description: Arc<ProblemDescription>) -> Self {
        Self { description, depth: 0, default_model: None }
    }

    pub fn description(&self) -> &ProblemDescription {
        &self.description
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Factory for the sub-iterators of a meta-iterator whose own model is `model`.
    pub fn nested(&self, model: Option<&str>) -> Result<Self, SchedError> {
        if self.depth + 1 > MAX_NESTING_DEPTH {
            return Err(SchedError::Spec(format!(
                "method nesting deeper than {MAX_NESTING_DEPTH} levels; method pointers form a cycle"
            )));
        }
        Ok(Self {
            description: Arc::clone(&self.description),
            depth: self.depth + 1,
            default_model: model.map(str::to_string).or_else(|| self.default_model.clone()),
        })
    }

    pub fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    /// Model block a method block runs on.
    pub fn model_for(&self, block: &MethodBlock) -> Result<&ModelBlock, SchedError> {
        self.description.resolve_model(block.model_pointer.as_deref(), self.default_model.as_deref())
    }

    pub fn build(&self, sub: &SubMethod, construction: Construction) -> Result<AnyIterator, SchedError> {
        match sub {
            SubMethod::Pointer(id) => self.build_method(id, construction),
            SubMethod::Named { name, model } => {
                let kind = MethodKind::from_leaf_name(name)?;
                let model = self.description.model(model)?;
                Self::build_leaf(&kind, model, construction)
            }
        }
    }

    pub fn build_method(&self, id: &str, construction: Construction) -> Result<AnyIterator, SchedError> {
        let block = self.description.method(id)?;
        if !block.method.is_meta() {
            return Self::build_leaf(&block.method, self.model_for(block)?, construction);
        }
        let model = block.model_pointer.as_deref();
        let factory = self.nested(model)?;
        Ok(match &block.method {
            MethodKind::MultiStart(_) | MethodKind::ParetoSet(_) => {
                AnyIterator::Concurrent(Box::new(ConcurrentMetaIterator::new(factory, block)?))
            }
            MethodKind::HybridSequential(_) => {
                AnyIterator::SeqHybrid(Box::new(SeqHybridMetaIterator::new(factory, block)?))
            }
            MethodKind::HybridEmbedded(_) => {
                AnyIterator::EmbedHybrid(Box::new(EmbedHybridMetaIterator::new(factory, block)?))
            }
            MethodKind::HybridCollaborative(_) => {
                AnyIterator::CollabHybrid(Box::new(CollabHybridMetaIterator::new(factory, block)?))
            }
            _ => return Err(SchedError::Spec(format!("method '{id}' is not a meta-iterator"))),
        })
    }

    fn build_leaf(kind: &MethodKind, model: &ModelBlock, construction: Construction) -> Result<AnyIterator, SchedError> {
        let model = match construction {
            Construction::Lightweight => AnyModel::placeholder(model),
            Construction::Full => AnyModel::simulation(model)?,
        };
        Ok(match kind {
            MethodKind::PatternSearch(spec) => AnyIterator::PatternSearch(PatternSearch::new(model, spec.clone())),
            MethodKind::NewtonCg(spec) => AnyIterator::NewtonCg(NewtonCg::new(model, spec.clone())),
            MethodKind::RandomSampling(spec) => AnyIterator::RandomSampling(RandomSampling::new(model, spec.clone())),
            MethodKind::EvolutionStrategy(spec) => {
                AnyIterator::EvolutionStrategy(EvolutionStrategy::new(model, spec.clone()))
            }
            _ => return Err(SchedError::Spec("leaf construction requested for a meta-iterator".to_string())),
        })
    }

    /// Lightweight facts about one sub-iterator.
    pub fn probe(&self, sub: &SubMethod) -> Result<SubIteratorInfo, SchedError> {
        let iterator = self.build(sub, Construction::Lightweight)?;
        SubIteratorInfo::of(iterator.as_algorithm())
    }

    /// Aggregate processor estimate of a batch of sub-iterators.
    pub fn estimate(&self, subs: &[SubMethod]) -> Result<ProcessorEstimate, SchedError> {
        let mut estimates = Vec::with_capacity(subs.len());
        for sub in subs {
            estimates.push(self.probe(sub)?.estimate);
        }
        ProcessorEstimate::aggregate(estimates)
            .ok_or_else(|| SchedError::Spec("no sub-iterators to estimate".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HybridSpec, PatternSearchSpec, SchedulerOptions, SeqHybridSpec, TestFunction};

    fn block(id: &str, method: MethodKind) -> MethodBlock {
        MethodBlock { id: id.to_string(), model_pointer: None, scheduling: SchedulerOptions::default(), method }
    }

    #[test]
    fn lightweight_builds_hold_no_models() {
        let mut model = ModelBlock::new("m", TestFunction::Rastrigin, vec![-1.0; 2], vec![1.0; 2], vec![0.0; 2]);
        model.processors_per_evaluation = 2;
        model.evaluation_concurrency = 4;
        let description = ProblemDescription {
            top_method: "ps".into(),
            methods: vec![block("ps", MethodKind::PatternSearch(PatternSearchSpec::default()))],
            models: vec![model],
        };
        let factory = IteratorFactory::new(Arc::new(description));
        let light = factory.build_method("ps", Construction::Lightweight).unwrap();
        assert_eq!(light.as_algorithm().instantiated_models(), 0);
        let full = factory.build_method("ps", Construction::Full).unwrap();
        assert_eq!(full.as_algorithm().instantiated_models(), 1);
        let estimate = factory.estimate(&[SubMethod::Pointer("ps".into())]).unwrap();
        assert_eq!(estimate, ProcessorEstimate::new(2, 8));
    }

    #[test]
    fn pointer_cycles_are_rejected() {
        let model = ModelBlock::new("m", TestFunction::Rastrigin, vec![-1.0; 2], vec![1.0; 2], vec![0.0; 2]);
        let description = ProblemDescription {
            top_method: "a".into(),
            methods: vec![
                block("a", MethodKind::HybridSequential(SeqHybridSpec::new(HybridSpec::from_pointers(["b"])))),
                block("b", MethodKind::HybridSequential(SeqHybridSpec::new(HybridSpec::from_pointers(["a"])))),
            ],
            models: vec![model],
        };
        let factory = IteratorFactory::new(Arc::new(description));
        match factory.build_method("a", Construction::Lightweight) {
            Err(SchedError::Spec(msg)) => assert!(msg.contains("cycle")),
            other => panic!("unexpected {other:?}"),
        }
    }
}

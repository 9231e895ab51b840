//! Evaluation models bound to leaf iterators.
//!
//! Processes that only need shape and processor information (estimation, idle
//! processes, dedicated masters) hold a [`ModelStub`]; only processes inside a live
//! iterator server build a full [`SimulationModel`].

pub mod simulation;
pub use simulation::SimulationModel;

use crate::config::ModelBlock;
use crate::error::SchedError;
use crate::scheduler::{ProcessorEstimate, Response};

pub trait Model {
    fn id(&self) -> &str;

    /// Identifier stamped on parameter/response pairs.
    fn interface_id(&self) -> &str {
        self.id()
    }

    fn num_variables(&self) -> usize;
    fn num_functions(&self) -> usize;
    fn continuous_variables(&self) -> &[f64];
    fn set_continuous_variables(&mut self, x: &[f64]) -> Result<(), SchedError>;
    fn lower_bounds(&self) -> &[f64];
    fn upper_bounds(&self) -> &[f64];
    fn primary_weights(&self) -> Option<&[f64]>;
    fn set_primary_weights(&mut self, weights: Option<Vec<f64>>) -> Result<(), SchedError>;
    /// Evaluate at the current variables.
    fn evaluate(&mut self) -> Result<Response, SchedError>;
    fn evaluation_count(&self) -> usize;
    fn estimate_processors(&self) -> ProcessorEstimate;

    /// Set the variables and evaluate.
    fn evaluate_at(&mut self, x: &[f64]) -> Result<Response, SchedError> {
        self.set_continuous_variables(x)?;
        self.evaluate()
    }

    /// Clip `x` into the bounds.
    fn project(&self, x: &mut [f64]) {
        for ((xi, lo), hi) in x.iter_mut().zip(self.lower_bounds()).zip(self.upper_bounds()) {
            *xi = xi.clamp(*lo, *hi);
        }
    }
}

pub(crate) fn block_estimate(block: &ModelBlock) -> ProcessorEstimate {
    let ppe = block.processors_per_evaluation.max(1);
    ProcessorEstimate::new(ppe, ppe.saturating_mul(block.evaluation_concurrency.max(1)))
}

/// Shape and processor information of a model, nothing else.
#[derive(Debug, Clone)]
pub struct ModelStub {
    id: String,
    num_functions: usize,
    variables: Vec<f64>,
    lower: Vec<f64>,
    upper: Vec<f64>,
    weights: Option<Vec<f64>>,
    estimate: ProcessorEstimate,
}

impl ModelStub {
    pub fn from_block(block: &ModelBlock) -> Self {
        Self {
            id: block.id.clone(),
            num_functions: block.num_functions(),
            variables: block.initial_point.clone(),
            lower: block.lower_bounds.clone(),
            upper: block.upper_bounds.clone(),
            weights: block.weights.clone(),
            estimate: block_estimate(block),
        }
    }
}

impl Model for ModelStub {
    fn id(&self) -> &str {
        &self.id
    }
    fn num_variables(&self) -> usize {
        self.variables.len()
    }
    fn num_functions(&self) -> usize {
        self.num_functions
    }
    fn continuous_variables(&self) -> &[f64] {
        &self.variables
    }
    fn set_continuous_variables(&mut self, x: &[f64]) -> Result<(), SchedError> {
        if x.len() != self.variables.len() {
            return Err(SchedError::Model(format!("model '{}': wrong variable count", self.id)));
        }
        self.variables.copy_from_slice(x);
        Ok(())
    }
    fn lower_bounds(&self) -> &[f64] {
        &self.lower
    }
    fn upper_bounds(&self) -> &[f64] {
        &self.upper
    }
    fn primary_weights(&self) -> Option<&[f64]> {
        self.weights.as_deref()
    }
    fn set_primary_weights(&mut self, weights: Option<Vec<f64>>) -> Result<(), SchedError> {
        self.weights = weights;
        Ok(())
    }
    fn evaluate(&mut self) -> Result<Response, SchedError> {
        Err(SchedError::Model(format!("placeholder for model '{}' cannot be evaluated", self.id)))
    }
    fn evaluation_count(&self) -> usize {
        0
    }
    fn estimate_processors(&self) -> ProcessorEstimate {
        self.estimate
    }
}

#[derive(Debug, Clone)]
pub enum AnyModel {
    Placeholder(ModelStub),
    Simulation(SimulationModel),
}

impl AnyModel {
    pub fn placeholder(block: &ModelBlock) -> Self {
        AnyModel::Placeholder(ModelStub::from_block(block))
    }

    pub fn simulation(block: &ModelBlock) -> Result<Self, SchedError> {
        Ok(AnyModel::Simulation(SimulationModel::from_block(block)?))
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, AnyModel::Placeholder(_))
    }

    fn inner(&self) -> &dyn Model {
        match self {
            AnyModel::Placeholder(m) => m,
            AnyModel::Simulation(m) => m,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Model {
        match self {
            AnyModel::Placeholder(m) => m,
            AnyModel::Simulation(m) => m,
        }
    }
}

impl Model for AnyModel {
    fn id(&self) -> &str {
        self.inner().id()
    }
    fn num_variables(&self) -> usize {
        self.inner().num_variables()
    }
    fn num_functions(&self) -> usize {
        self.inner().num_functions()
    }
    fn continuous_variables(&self) -> &[f64] {
        self.inner().continuous_variables()
    }
    fn set_continuous_variables(&mut self, x: &[f64]) -> Result<(), SchedError> {
        self.inner_mut().set_continuous_variables(x)
    }
    fn lower_bounds(&self) -> &[f64] {
        self.inner().lower_bounds()
    }
    fn upper_bounds(&self) -> &[f64] {
        self.inner().upper_bounds()
    }
    fn primary_weights(&self) -> Option<&[f64]> {
        self.inner().primary_weights()
    }
    fn set_primary_weights(&mut self, weights: Option<Vec<f64>>) -> Result<(), SchedError> {
        self.inner_mut().set_primary_weights(weights)
    }
    fn evaluate(&mut self) -> Result<Response, SchedError> {
        self.inner_mut().evaluate()
    }
    fn evaluation_count(&self) -> usize {
        self.inner().evaluation_count()
    }
    fn estimate_processors(&self) -> ProcessorEstimate {
        self.inner().estimate_processors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TestFunction;

    #[test]
    fn placeholder_refuses_evaluation() {
        let mut block = ModelBlock::new("m", TestFunction::Rastrigin, vec![-1.0; 3], vec![1.0; 3], vec![0.5; 3]);
        block.processors_per_evaluation = 2;
        block.evaluation_concurrency = 3;
        let mut stub = AnyModel::placeholder(&block);
        assert!(stub.is_placeholder());
        assert_eq!(stub.estimate_processors(), ProcessorEstimate::new(2, 6));
        assert!(stub.evaluate().is_err());

        let mut x = vec![-4.0, 0.2, 9.0];
        stub.project(&mut x);
        assert_eq!(x, vec![-1.0, 0.2, 1.0]);
    }
}

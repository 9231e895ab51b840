//! Analytic simulation models.

use super::Model;
use crate::config::{ModelBlock, TestFunction};
use crate::core::traits::MatVec;
use crate::error::SchedError;
use crate::scheduler::{ProcessorEstimate, Response};
use faer::Mat;
use std::f64::consts::PI;

#[derive(Debug, Clone)]
enum Function {
    Quadratic { hessian: Mat<f64>, center: Vec<f64> },
    Rosenbrock,
    Rastrigin,
    Paraboloids { centers: Vec<Vec<f64>> },
}

impl Function {
    fn from_spec(spec: &TestFunction) -> Self {
        match spec {
            TestFunction::Quadratic { hessian, center } => {
                let n = center.len();
                Function::Quadratic {
                    hessian: Mat::from_fn(n, n, |i, j| hessian[i][j]),
                    center: center.clone(),
                }
            }
            TestFunction::Rosenbrock => Function::Rosenbrock,
            TestFunction::Rastrigin => Function::Rastrigin,
            TestFunction::Paraboloids { centers } => Function::Paraboloids { centers: centers.clone() },
        }
    }

    fn values(&self, x: &[f64]) -> Vec<f64> {
        match self {
            Function::Quadratic { hessian, center } => {
                let d: Vec<f64> = x.iter().zip(center).map(|(xi, ci)| xi - ci).collect();
                let mut hd = vec![0.0; d.len()];
                hessian.matvec(&d, &mut hd);
                vec![0.5 * d.iter().zip(&hd).map(|(a, b)| a * b).sum::<f64>()]
            }
            Function::Rosenbrock => vec![x
                .windows(2)
                .map(|w| 100.0 * (w[1] - w[0] * w[0]).powi(2) + (1.0 - w[0]).powi(2))
                .sum()],
            Function::Rastrigin => vec![
                10.0 * x.len() as f64
                    + x.iter().map(|xi| xi * xi - 10.0 * (2.0 * PI * xi).cos()).sum::<f64>(),
            ],
            Function::Paraboloids { centers } => centers
                .iter()
                .map(|c| x.iter().zip(c).map(|(xi, ci)| (xi - ci).powi(2)).sum())
                .collect(),
        }
    }
}

/// Bound-constrained analytic model with an evaluation counter.
#[derive(Debug, Clone)]
pub struct SimulationModel {
    id: String,
    function: Function,
    lower: Vec<f64>,
    upper: Vec<f64>,
    initial: Vec<f64>,
    variables: Vec<f64>,
    weights: Option<Vec<f64>>,
    num_functions: usize,
    evaluations: usize,
    estimate: ProcessorEstimate,
}

impl SimulationModel {
    pub fn from_block(block: &ModelBlock) -> Result<Self, SchedError> {
        block.validate()?;
        Ok(Self {
            id: block.id.clone(),
            function: Function::from_spec(&block.function),
            lower: block.lower_bounds.clone(),
            upper: block.upper_bounds.clone(),
            initial: block.initial_point.clone(),
            variables: block.initial_point.clone(),
            weights: block.weights.clone(),
            num_functions: block.num_functions(),
            evaluations: 0,
            estimate: super::block_estimate(block),
        })
    }

    pub fn initial_point(&self) -> &[f64] {
        &self.initial
    }

    fn objective(&self, functions: &[f64]) -> f64 {
        match &self.weights {
            Some(w) => w.iter().zip(functions).map(|(wi, fi)| wi * fi).sum(),
            None => functions.iter().sum::<f64>() / functions.len().max(1) as f64,
        }
    }
}

impl Model for SimulationModel {
    fn id(&self) -> &str {
        &self.id
    }

    fn num_variables(&self) -> usize {
        self.initial.len()
    }

    fn num_functions(&self) -> usize {
        self.num_functions
    }

    fn continuous_variables(&self) -> &[f64] {
        &self.variables
    }

    fn set_continuous_variables(&mut self, x: &[f64]) -> Result<(), SchedError> {
        if x.len() != self.variables.len() {
            return Err(SchedError::Model(format!(
                "model '{}' has {} variables, got {}",
                self.id,
                self.variables.len(),
                x.len()
            )));
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
        if let Some(w) = &weights {
            if w.len() != self.num_functions {
                return Err(SchedError::Model(format!(
                    "model '{}' has {} functions, got {} weights",
                    self.id,
                    self.num_functions,
                    w.len()
                )));
            }
        }
        self.weights = weights;
        Ok(())
    }

    fn evaluate(&mut self) -> Result<Response, SchedError> {
        let functions = self.function.values(&self.variables);
        if functions.iter().any(|f| f.is_nan()) {
            return Err(SchedError::Model(format!(
                "model '{}' produced NaN at {:?}",
                self.id, self.variables
            )));
        }
        self.evaluations += 1;
        let objective = self.objective(&functions);
        Ok(Response::new(functions, objective))
    }

    fn evaluation_count(&self) -> usize {
        self.evaluations
    }

    fn estimate_processors(&self) -> ProcessorEstimate {
        self.estimate
    }
}

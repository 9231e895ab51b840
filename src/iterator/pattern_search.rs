//! Compass pattern search.
//!
//! Polls ±step along each coordinate, moves to the first improving point, and
//! contracts the step when no poll point improves. Steps are scaled by the bound
//! range of each variable.

use super::{Capabilities, LeafCore, LeafMethod};
use crate::config::PatternSearchSpec;
use crate::error::SchedError;
use crate::model::{AnyModel, Model};
use crate::scheduler::ParamResponsePair;

#[derive(Debug, Clone)]
pub struct PatternSearch {
    core: LeafCore,
    spec: PatternSearchSpec,
}

impl PatternSearch {
    pub fn new(model: AnyModel, spec: PatternSearchSpec) -> Self {
        Self { core: LeafCore::new(model), spec }
    }
}

impl LeafMethod for PatternSearch {
    const NAME: &'static str = "pattern_search";
    const CAPABILITIES: Capabilities = Capabilities::empty();

    fn core(&self) -> &LeafCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut LeafCore {
        &mut self.core
    }

    fn iterate(&mut self, starts: Vec<Vec<f64>>) -> Result<Vec<ParamResponsePair>, SchedError> {
        let mut x = starts.into_iter().next().unwrap_or_default();
        let ranges: Vec<f64> = self
            .core
            .model
            .lower_bounds()
            .iter()
            .zip(self.core.model.upper_bounds())
            .map(|(lo, hi)| (hi - lo).max(f64::EPSILON))
            .collect();
        let mut best = self.core.evaluate(&x)?;
        let mut step = self.spec.initial_step;
        let max_iterations = self.core.max_iterations(self.spec.max_iterations);

        let mut iterations = 0;
        while iterations < max_iterations && step >= self.spec.min_step {
            iterations += 1;
            let mut improved = false;
            'poll: for i in 0..x.len() {
                for sign in [1.0, -1.0] {
                    let mut trial = x.clone();
                    trial[i] += sign * step * ranges[i];
                    self.core.model.project(&mut trial);
                    if trial[i] == x[i] {
                        continue;
                    }
                    let response = self.core.evaluate(&trial)?;
                    if response.objective < best.objective {
                        x = trial;
                        best = response;
                        improved = true;
                        break 'poll;
                    }
                }
            }
            if !improved {
                step *= self.spec.contraction;
            }
        }
        log::trace!("pattern search stopped after {iterations} iteration(s), step {step:.3e}");
        Ok(vec![self.core.record(x, best)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelBlock, TestFunction};
    use crate::iterator::Algorithm;
    use approx::assert_abs_diff_eq;

    #[test]
    fn finds_quadratic_minimum() {
        let block = ModelBlock::new(
            "q",
            TestFunction::Quadratic { hessian: vec![vec![2.0, 0.0], vec![0.0, 2.0]], center: vec![0.3, -0.4] },
            vec![-1.0; 2],
            vec![1.0; 2],
            vec![0.9, 0.9],
        );
        let mut ps = PatternSearch::new(AnyModel::simulation(&block).unwrap(), PatternSearchSpec::default());
        ps.run().unwrap();
        let x = ps.variables_results().unwrap();
        assert_abs_diff_eq!(x[0], 0.3, epsilon = 1e-4);
        assert_abs_diff_eq!(x[1], -0.4, epsilon = 1e-4);
        assert_eq!(ps.final_solutions().len(), 1);
        assert!(ps.evaluations() > 10);
    }
}

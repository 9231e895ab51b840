//! Bound-projected Newton method with finite-difference derivatives.
//!
//! The gradient comes from central differences, the Hessian from forward differences
//! of that gradient (symmetrized) and is assembled as a dense `faer::Mat`. The Newton
//! system is solved inexactly with truncated CG; a direction that is not a descent direction is
//! replaced by steepest descent. Steps are backtracked until the Armijo condition
//! holds on the projected point.

use super::{Capabilities, LeafCore, LeafMethod};
use crate::config::NewtonSpec;
use crate::core::traits::InnerProduct;
use crate::error::SchedError;
use crate::model::{AnyModel, Model};
use crate::scheduler::{ParamResponsePair, Response};
use crate::solver::{CgSolver, LinearSolver};
use faer::Mat;

const ARMIJO: f64 = 1e-4;
const MAX_BACKTRACKS: usize = 30;

#[derive(Debug, Clone)]
pub struct NewtonCg {
    core: LeafCore,
    spec: NewtonSpec,
}

impl NewtonCg {
    pub fn new(model: AnyModel, spec: NewtonSpec) -> Self {
        Self { core: LeafCore::new(model), spec }
    }

    fn step_size(&self, xi: f64) -> f64 {
        self.spec.fd_step * xi.abs().max(1.0)
    }

    fn gradient(&mut self, x: &[f64]) -> Result<Vec<f64>, SchedError> {
        let mut g = vec![0.0; x.len()];
        let mut probe = x.to_vec();
        for i in 0..x.len() {
            let h = self.step_size(x[i]);
            probe[i] = x[i] + h;
            let up = self.core.evaluate(&probe)?.objective;
            probe[i] = x[i] - h;
            let down = self.core.evaluate(&probe)?.objective;
            probe[i] = x[i];
            g[i] = (up - down) / (2.0 * h);
        }
        Ok(g)
    }

    fn hessian(&mut self, x: &[f64], g: &[f64]) -> Result<Mat<f64>, SchedError> {
        let n = x.len();
        let mut columns = Vec::with_capacity(n);
        let mut probe = x.to_vec();
        for j in 0..n {
            let h = 10.0 * self.step_size(x[j]);
            probe[j] = x[j] + h;
            let gj = self.gradient(&probe)?;
            probe[j] = x[j];
            columns.push(gj.iter().zip(g).map(|(a, b)| (a - b) / h).collect::<Vec<_>>());
        }
        Ok(Mat::from_fn(n, n, |i, j| 0.5 * (columns[j][i] + columns[i][j])))
    }

    fn direction(&self, hessian: &Mat<f64>, g: &[f64]) -> Result<Vec<f64>, SchedError> {
        let rhs: Vec<f64> = g.iter().map(|v| -v).collect();
        let mut p = vec![0.0; g.len()];
        let mut cg = CgSolver::new(1e-8, 10 * g.len().max(1));
        let stats = cg.solve(hessian, &rhs, &mut p)?;
        if !stats.converged {
            log::trace!("newton: inexact step after {} CG iteration(s)", stats.iterations);
        }
        if ().dot(&p, &g.to_vec()) < 0.0 {
            Ok(p)
        } else {
            Ok(rhs)
        }
    }
}

impl LeafMethod for NewtonCg {
    const NAME: &'static str = "newton_cg";
    const CAPABILITIES: Capabilities = Capabilities::empty();

    fn core(&self) -> &LeafCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut LeafCore {
        &mut self.core
    }

    fn iterate(&mut self, starts: Vec<Vec<f64>>) -> Result<Vec<ParamResponsePair>, SchedError> {
        let mut x = starts.into_iter().next().unwrap_or_default();
        let mut current: Response = self.core.evaluate(&x)?;
        let max_iterations = self.core.max_iterations(self.spec.max_iterations);

        for iteration in 0..max_iterations {
            let g = self.gradient(&x)?;
            let gnorm = ().norm(&g);
            if gnorm <= self.spec.gradient_tolerance {
                log::trace!("newton: gradient norm {gnorm:.3e} at iteration {iteration}");
                break;
            }
            let hessian = self.hessian(&x, &g)?;
            let p = self.direction(&hessian, &g)?;

            let mut alpha = 1.0;
            let mut accepted = None;
            for _ in 0..MAX_BACKTRACKS {
                let mut trial: Vec<f64> = x.iter().zip(&p).map(|(xi, pi)| xi + alpha * pi).collect();
                self.core.model.project(&mut trial);
                let decrease: f64 = g.iter().zip(trial.iter().zip(&x)).map(|(gi, (t, xi))| gi * (t - xi)).sum();
                let response = self.core.evaluate(&trial)?;
                if response.objective <= current.objective + ARMIJO * decrease.min(0.0) && trial != x {
                    accepted = Some((trial, response));
                    break;
                }
                alpha *= 0.5;
            }
            match accepted {
                Some((trial, response)) if response.objective < current.objective => {
                    x = trial;
                    current = response;
                }
                _ => break,
            }
        }
        Ok(vec![self.core.record(x, current)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelBlock, TestFunction};
    use crate::iterator::Algorithm;
    use approx::assert_abs_diff_eq;

    #[test]
    fn converges_on_rosenbrock() {
        let block = ModelBlock::new("r", TestFunction::Rosenbrock, vec![-2.0; 2], vec![2.0; 2], vec![-1.2, 1.0]);
        let mut newton = NewtonCg::new(AnyModel::simulation(&block).unwrap(), NewtonSpec { max_iterations: 200, ..NewtonSpec::default() });
        newton.run().unwrap();
        let x = newton.variables_results().unwrap();
        assert_abs_diff_eq!(x[0], 1.0, epsilon = 1e-2);
        assert_abs_diff_eq!(x[1], 1.0, epsilon = 2e-2);
    }

    #[test]
    fn stops_at_bound_constrained_minimum() {
        let block = ModelBlock::new(
            "q",
            TestFunction::Quadratic { hessian: vec![vec![1.0, 0.0], vec![0.0, 1.0]], center: vec![3.0, 0.0] },
            vec![-1.0; 2],
            vec![1.0; 2],
            vec![0.0, 0.5],
        );
        let mut newton = NewtonCg::new(AnyModel::simulation(&block).unwrap(), NewtonSpec::default());
        newton.run().unwrap();
        let x = newton.variables_results().unwrap();
        assert_abs_diff_eq!(x[0], 1.0, epsilon = 1e-8);
        assert_abs_diff_eq!(x[1], 0.0, epsilon = 1e-3);
    }
}

//! Truncated conjugate gradient per Saad §6.1.
//!
//! Newton steps solve `H p = -g` with a finite-difference Hessian that need not be
//! positive definite away from a minimizer. The iteration therefore stops as soon as a
//! search direction of non-positive curvature appears and returns the iterate reached
//! so far with `converged == false`.

use crate::core::traits::{InnerProduct, MatVec};
use crate::error::SchedError;
use crate::solver::LinearSolver;
use crate::utils::convergence::{Convergence, SolveStats};

pub struct CgSolver<T> {
    pub conv: Convergence<T>,
}

impl<T: Copy + num_traits::Float> CgSolver<T> {
    pub fn new(tol: T, max_iters: usize) -> Self {
        Self { conv: Convergence { tol, max_iters } }
    }
}

impl<M, V, T> LinearSolver<M, V> for CgSolver<T>
where
    M: MatVec<V>,
    (): InnerProduct<V, Scalar = T>,
    V: AsMut<[T]> + AsRef<[T]> + From<Vec<T>> + Clone,
    T: num_traits::Float + From<f64>,
{
    type Error = SchedError;
    type Scalar = T;

    fn solve(&mut self, a: &M, b: &V, x: &mut V) -> Result<SolveStats<T>, SchedError> {
        let n = b.as_ref().len();
        if x.as_ref().len() != n {
            return Err(SchedError::Model(format!(
                "conjugate gradient: iterate has length {}, right-hand side {n}",
                x.as_ref().len()
            )));
        }
        let ip = ();
        let mut r = {
            let mut ax = V::from(vec![T::zero(); n]);
            a.matvec(x, &mut ax);
            V::from(b.as_ref().iter().zip(ax.as_ref()).map(|(&bi, &axi)| bi - axi).collect::<Vec<_>>())
        };
        let mut p = r.clone();
        let mut rsq = ip.dot(&r, &r);
        let res0 = rsq.sqrt();
        let mut stats = SolveStats { iterations: 0, final_residual: res0, converged: res0 == T::zero() };
        if stats.converged {
            return Ok(stats);
        }

        let mut ap = V::from(vec![T::zero(); n]);
        for i in 1..=self.conv.max_iters {
            a.matvec(&p, &mut ap);
            let curvature = ip.dot(&p, &ap);
            if curvature <= T::zero() {
                log::trace!("conjugate gradient: non-positive curvature at iteration {i}");
                stats.converged = false;
                return Ok(stats);
            }
            let alpha = rsq / curvature;
            for (xj, &pj) in x.as_mut().iter_mut().zip(p.as_ref()) {
                *xj = *xj + alpha * pj;
            }
            for (rj, &apj) in r.as_mut().iter_mut().zip(ap.as_ref()) {
                *rj = *rj - alpha * apj;
            }
            let rsq_new = ip.dot(&r, &r);
            let (stop, s) = self.conv.check(rsq_new.sqrt(), res0, i);
            stats = s;
            if stop {
                return Ok(stats);
            }
            let beta = rsq_new / rsq;
            for (pj, &rj) in p.as_mut().iter_mut().zip(r.as_ref()) {
                *pj = rj + beta * *pj;
            }
            rsq = rsq_new;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::Mat;

    #[test]
    fn cg_solves_simple_spd() {
        // SPD system: [[4,1],[1,3]] x = [1,2]
        let a = Mat::from_fn(2, 2, |i, j| [[4.0, 1.0], [1.0, 3.0]][i][j]);
        let b = vec![1.0, 2.0];
        let mut x = vec![0.0, 0.0];
        let mut solver = CgSolver::new(1e-10, 20);
        let stats = solver.solve(&a, &b, &mut x).unwrap();
        let expected: [f64; 2] = [0.09090909090909091, 0.6363636363636364];
        for (xi, ei) in x.iter().zip(expected.iter()) {
            assert!((xi - ei).abs() < 1e-8, "xi = {}, expected = {}", xi, ei);
        }
        assert!(stats.converged, "CG did not converge");
    }

    #[test]
    fn cg_stops_on_indefinite_direction() {
        let a = Mat::from_fn(2, 2, |i, j| [[-1.0, 0.0], [0.0, 2.0]][i][j]);
        let b = vec![1.0, 0.0];
        let mut x = vec![0.0, 0.0];
        let stats = CgSolver::new(1e-10, 20).solve(&a, &b, &mut x).unwrap();
        assert!(!stats.converged);
        assert_eq!(x, vec![0.0, 0.0]);
    }
}

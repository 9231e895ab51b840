//! Stopping tests shared by the linear solver and the optimizers.

/// Stopping criteria & stats.
#[derive(Debug, Clone, Copy)]
pub struct Convergence<T> {
    pub tol: T,
    pub max_iters: usize,
}

#[derive(Clone, Debug)]
pub struct SolveStats<T> {
    pub iterations: usize,
    pub final_residual: T,
    pub converged: bool,
}

impl<T: Copy + num_traits::Float> Convergence<T> {
    /// Returns (should_stop, stats) given current `res_norm` and iteration `i`.
    pub fn check(&self, res_norm: T, res0_norm: T, i: usize) -> (bool, SolveStats<T>) {
        let rel = if res0_norm > T::zero() { res_norm / res0_norm } else { T::zero() };
        let converged = rel <= self.tol;
        (
            converged || i >= self.max_iters,
            SolveStats { iterations: i, final_residual: res_norm, converged },
        )
    }
}

/// Relative decrease of an objective from `before` to `after`, clamped to [0, 1].
///
/// Zero when nothing improved; one when the objective dropped by at least its own
/// magnitude.
pub fn relative_improvement(before: f64, after: f64) -> f64 {
    if !before.is_finite() || !after.is_finite() {
        return if after.is_finite() { 1.0 } else { 0.0 };
    }
    let scale = before.abs().max(f64::EPSILON);
    ((before - after) / scale).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn improvement_is_clamped() {
        assert_relative_eq!(relative_improvement(10.0, 5.0), 0.5);
        assert_eq!(relative_improvement(1.0, 2.0), 0.0);
        assert_eq!(relative_improvement(1.0, -4.0), 1.0);
        assert_eq!(relative_improvement(f64::INFINITY, 3.0), 1.0);
    }

    #[test]
    fn check_stops_at_iteration_cap_without_converging() {
        let conv = Convergence { tol: 1e-8, max_iters: 3 };
        let (stop, stats) = conv.check(0.5, 1.0, 3);
        assert!(stop);
        assert!(!stats.converged);
    }
}

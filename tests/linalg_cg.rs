//! Conjugate gradient against faer's direct LU on random SPD systems.
//!
//! The Newton-CG iterator solves its Hessian systems with this solver, so it must match
//! a direct factorization on well-conditioned problems.

use approx::assert_abs_diff_eq;
use faer::Mat;
use faer::linalg::solvers::SolveCore;
use metasched::solver::{CgSolver, LinearSolver};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// `A = Mᵀ M + I` for a random `M`, which is symmetric positive definite.
fn random_spd(n: usize, seed: u64) -> (Mat<f64>, Vec<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f64> = (0..n * n).map(|_| rng.r#gen()).collect();
    let m = Mat::from_fn(n, n, |i, j| data[j * n + i]);
    let m_t = m.transpose();
    let a = &m_t * &m + Mat::<f64>::identity(n, n);
    let b: Vec<f64> = (0..n).map(|_| rng.r#gen()).collect();
    (a, b)
}

#[test]
fn cg_vs_direct_on_spd() {
    let n = 10;
    let (a, b) = random_spd(n, 42);
    let mut x_cg = vec![0.0; n];
    let mut solver = CgSolver::new(1e-10, 1000);
    let stats = solver.solve(&a, &b, &mut x_cg).unwrap();
    assert!(stats.converged);

    let mut x_direct = b.clone();
    let lu = faer::linalg::solvers::FullPivLu::new(a.as_ref());
    let x_mat = faer::MatMut::from_column_major_slice_mut(&mut x_direct, n, 1);
    lu.solve_in_place_with_conj(faer::Conj::No, x_mat);
    for i in 0..n {
        assert_abs_diff_eq!(x_cg[i], x_direct[i], epsilon = 1e-6);
    }
}

#[test]
fn cg_flags_indefinite_systems() {
    let a = Mat::from_fn(2, 2, |i, j| if i == j { if i == 0 { 1.0 } else { -1.0 } } else { 0.0 });
    let b = vec![0.0, 1.0];
    let mut x = vec![0.0; 2];
    let stats = CgSolver::new(1e-10, 50).solve(&a, &b, &mut x).unwrap();
    assert!(!stats.converged);
}

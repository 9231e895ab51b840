//! Trait implementations for `faer` dense matrices and plain vectors.
//!
//! Hessians are assembled as `faer::Mat<f64>` and iterates are kept as `Vec<f64>`,
//! so these two impls are all the conjugate-gradient solver needs.

use crate::core::traits::{InnerProduct, MatVec};
use faer::Mat;
use num_traits::Float;

impl<T: Float> MatVec<Vec<T>> for Mat<T> {
    fn matvec(&self, x: &Vec<T>, y: &mut Vec<T>) {
        assert_eq!(self.nrows(), y.len(), "Output vector y has incorrect length");
        assert_eq!(self.ncols(), x.len(), "Input vector x has incorrect length");
        for (i, yi) in y.iter_mut().enumerate() {
            *yi = (0..self.ncols()).fold(T::zero(), |acc, j| acc + self[(i, j)] * x[j]);
        }
    }
}

/// Serial inner product; iterates here are a handful of design variables.
impl<T: Float + From<f64>> InnerProduct<Vec<T>> for () {
    type Scalar = T;

    fn dot(&self, x: &Vec<T>, y: &Vec<T>) -> T {
        assert_eq!(x.len(), y.len(), "Vectors must have the same length");
        x.iter().zip(y).fold(T::zero(), |acc, (&xi, &yi)| acc + xi * yi)
    }

    fn norm(&self, x: &Vec<T>) -> T {
        self.dot(x, x).sqrt()
    }
}

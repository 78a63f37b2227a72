//! This module defines the collaborator abstractions the restart calls out to.
//!
//! The restart never applies the operator itself: W = A V is carried along by linear
//! combination. It does need two services from the surrounding solver:
//!
//! 1.  **Preconditioning** of newly converged eigenvectors when skew projections are in
//!     use. [`Preconditioner`] is implemented for `faer`'s dense matrix types, so tests and
//!     small problems can use an explicit approximate inverse, and for
//!     [`IdentityPreconditioner`].
//! 2.  **Global reductions** of partial inner products when the rows of V are distributed
//!     across processes. [`GlobalSum`] sums a buffer in place across all processes;
//!     [`LocalSum`] is the serial implementation and does nothing.

use faer::{Mat, MatMut, MatRef, prelude::Reborrow};

/// Applies an approximate inverse of `A - σI` to a block of vectors.
pub trait Preconditioner {
    /// Writes the preconditioned `input` into `output`.
    ///
    /// # Panics
    ///
    /// Implementations may panic if `input` and `output` do not have the same shape.
    fn apply(&self, input: MatRef<'_, f64>, output: MatMut<'_, f64>);
}

/// A dense explicit preconditioner: `output = self * input`.
impl Preconditioner for MatRef<'_, f64> {
    #[inline]
    fn apply(&self, input: MatRef<'_, f64>, mut output: MatMut<'_, f64>) {
        assert_eq!(
            self.ncols(),
            input.nrows(),
            "Dimension mismatch: preconditioner columns ({}) do not match block rows ({}).",
            self.ncols(),
            input.nrows(),
        );
        let product = *self * input;
        output.copy_from(product.as_ref());
    }
}

impl Preconditioner for MatMut<'_, f64> {
    #[inline]
    fn apply(&self, input: MatRef<'_, f64>, output: MatMut<'_, f64>) {
        self.rb().apply(input, output)
    }
}

impl Preconditioner for Mat<f64> {
    #[inline]
    fn apply(&self, input: MatRef<'_, f64>, output: MatMut<'_, f64>) {
        self.as_ref().apply(input, output)
    }
}

/// No preconditioning: copies the input.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityPreconditioner;

impl Preconditioner for IdentityPreconditioner {
    #[inline]
    fn apply(&self, input: MatRef<'_, f64>, mut output: MatMut<'_, f64>) {
        output.copy_from(input);
    }
}

/// Sums a buffer of partial results across all processes holding rows of the basis.
pub trait GlobalSum {
    fn global_sum(&self, buffer: &mut [f64]);
}

/// The reduction for a basis stored entirely in this process.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalSum;

impl GlobalSum for LocalSum {
    #[inline]
    fn global_sum(&self, _buffer: &mut [f64]) {}
}

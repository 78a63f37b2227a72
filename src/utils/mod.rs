//! Dense helpers shared by the restart stages.
//!
//! - **`dense`**: projections `Xᵀ A X`, incremental updates of `Xᵀ Y`, in-place recombination
//!   of tall bases and matrix-valued global sums.
//! - **`permute`**: in-place gathers of values and matrix columns by a permutation.

pub mod dense;
pub mod permute;

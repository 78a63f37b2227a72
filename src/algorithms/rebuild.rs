//! Rebuilds the search basis after the restarted coefficient vectors are chosen.
//!
//! Given `h_vecs`, the new basis is `V h_vecs[:, 0..restart_size]` and its image is
//! `W h_vecs[:, 0..restart_size]`. In the same sweep the next block of candidate Ritz vectors
//! `X = V h_vecs[:, block]` and their residuals `R = W h_vecs[:, block] - X diag(h_vals[block])`
//! are formed and stored right after the restarted columns, so the outer iteration finds them at
//! `V[:, restart_size..]` and `W[:, restart_size..]`.
//!
//! The tall matrices are processed in row blocks of [`crate::utils::dense::ROW_BLOCK`] rows;
//! every row block is read completely before any of its rows is written, which is what allows
//! the outputs to overwrite the inputs.

use faer::mat::AsMatMut;
use crate::{operator::GlobalSum, utils::dense::ROW_BLOCK};
use faer::{
    Accum, MatMut, MatRef, Par,
    dyn_stack::{MemStack, StackReq},
    linalg::{matmul::matmul, temp_mat_scratch, temp_mat_zeroed},
    prelude::*,
};
use std::ops::Range;

/// Workspace for [`rebuild_basis`].
pub fn rebuild_basis_scratch(nrows: usize, restart_size: usize, block_size: usize) -> StackReq {
    let rows = nrows.min(ROW_BLOCK);
    temp_mat_scratch::<f64>(rows, restart_size + block_size)
        .and(temp_mat_scratch::<f64>(rows, restart_size + block_size))
        .and(StackReq::new::<f64>(block_size))
}

/// Replaces `V` and `W` by their restarted versions and extracts the next block.
///
/// # Arguments
/// * `v`, `w`: the basis and its image; the first `h_vecs.nrows()` columns are combined.
/// * `h_vecs`: the coefficient vectors, one row per current basis column.
/// * `h_vals`: the Ritz values matching the columns of `h_vecs`.
/// * `restart_size`: the number of leading columns of `h_vecs` forming the new basis.
/// * `block`: the columns of `h_vecs` whose Ritz vectors and residuals are extracted.
/// * `block_norms`: receives the residual norm of every column of `block`.
///
/// On return `V[:, restart_size..restart_size + block.len()]` holds the block vectors `X` and
/// `W[:, restart_size..restart_size + block.len()]` their residuals.
#[allow(clippy::too_many_arguments)]
pub fn rebuild_basis(
    mut v: MatMut<'_, f64>,
    mut w: MatMut<'_, f64>,
    h_vecs: MatRef<'_, f64>,
    h_vals: &[f64],
    restart_size: usize,
    block: Range<usize>,
    block_norms: &mut [f64],
    reduce: &dyn GlobalSum,
    stack: &mut MemStack,
) {
    let basis_size = h_vecs.nrows();
    let block_size = block.len();
    let total = restart_size + block_size;
    let nrows = v.nrows();
    debug_assert!(v.ncols() >= total.max(basis_size) && w.ncols() >= total.max(basis_size));
    debug_assert!(block_norms.len() >= block_size);

    let rows = nrows.min(ROW_BLOCK);
    let (mut tv, stack) = temp_mat_zeroed::<f64, _, _>(rows, total, stack);
    let mut tv = tv.as_mat_mut();
    let (mut tw, stack) = temp_mat_zeroed::<f64, _, _>(rows, total, stack);
    let mut tw = tw.as_mat_mut();
    let (mut squares, _) = stack.make_with(block_size, |_| 0.0f64);
    let squares = &mut *squares;

    let kept = h_vecs.get(.., 0..restart_size);
    let next = h_vecs.get(.., block.clone());

    let mut start = 0;
    while start < nrows {
        let len = rows.min(nrows - start);
        let mut tv = tv.rb_mut().get_mut(0..len, ..);
        let mut tw = tw.rb_mut().get_mut(0..len, ..);

        let v_rows = v.rb().get(start..start + len, 0..basis_size);
        matmul(tv.rb_mut().get_mut(.., 0..restart_size), Accum::Replace, v_rows, kept, 1.0, Par::Seq);
        matmul(tv.rb_mut().get_mut(.., restart_size..total), Accum::Replace, v_rows, next, 1.0, Par::Seq);

        let w_rows = w.rb().get(start..start + len, 0..basis_size);
        matmul(tw.rb_mut().get_mut(.., 0..restart_size), Accum::Replace, w_rows, kept, 1.0, Par::Seq);
        matmul(tw.rb_mut().get_mut(.., restart_size..total), Accum::Replace, w_rows, next, 1.0, Par::Seq);

        // Residuals of the block: W x - θ x.
        for (k, col) in (restart_size..total).enumerate() {
            let theta = h_vals[block.start + k];
            for r in 0..len {
                let value = tw[(r, col)] - theta * tv[(r, col)];
                tw[(r, col)] = value;
                squares[k] += value * value;
            }
        }

        v.rb_mut().get_mut(start..start + len, 0..total).copy_from(tv.rb());
        w.rb_mut().get_mut(start..start + len, 0..total).copy_from(tw.rb());
        start += len;
    }

    reduce.global_sum(squares);
    for (norm, &square) in block_norms.iter_mut().zip(squares.iter()) {
        *norm = square.sqrt();
    }
}

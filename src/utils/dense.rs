//! Dense kernels shared by the restart drivers.
//!
//! These are the building blocks that touch either the tall basis (`n_local` rows) or the
//! small projected matrices (`max_basis_size` rows):
//!
//! - [`compute_submatrix`]: `Xᵀ A X` for a small dense `A`.
//! - [`update_projection`]: grows a cross-projection `Z = Xᵀ Y` by newly appended columns.
//! - [`combine_columns`]: overwrites the leading columns of a tall matrix with linear
//!   combinations of its columns, streaming over row blocks so the scratch stays small.
//! - [`global_sum_mat`]: reduces a block of partial inner products across processes.
//!
//! Every routine draws its temporaries from a caller-provided [`MemStack`]; the matching
//! `*_scratch` function reports how much it needs.

use faer::mat::AsMatMut;
use crate::operator::GlobalSum;
use faer::{
    Accum, MatMut, MatRef, Par,
    dyn_stack::{MemStack, StackReq},
    linalg::{matmul::matmul, temp_mat_scratch, temp_mat_zeroed},
    prelude::*,
};

/// Number of basis rows processed at once when recombining tall matrices.
pub(crate) const ROW_BLOCK: usize = 512;

/// Workspace for [`compute_submatrix`] when `X` is `nrows × ncols`.
pub fn compute_submatrix_scratch(nrows: usize, ncols: usize) -> StackReq {
    temp_mat_scratch::<f64>(nrows, ncols)
}

/// Computes `out = Xᵀ A X`.
///
/// `out` must not alias `a`; callers that update a projection in place compute into scratch
/// first.
pub fn compute_submatrix(
    x: MatRef<'_, f64>,
    a: MatRef<'_, f64>,
    out: MatMut<'_, f64>,
    stack: &mut MemStack,
) {
    let (mut ax, _) = temp_mat_zeroed::<f64, _, _>(a.nrows(), x.ncols(), stack);
    let mut ax = ax.as_mat_mut();
    matmul(ax.rb_mut(), Accum::Replace, a, x, 1.0, Par::Seq);
    matmul(out, Accum::Replace, x.transpose(), ax.rb(), 1.0, Par::Seq);
}

/// Workspace for [`global_sum_mat`].
pub fn global_sum_mat_scratch(nrows: usize, ncols: usize) -> StackReq {
    StackReq::new::<f64>(nrows * ncols)
}

/// Sums every entry of `mat` across processes.
pub fn global_sum_mat(mut mat: MatMut<'_, f64>, reduce: &dyn GlobalSum, stack: &mut MemStack) {
    let (m, n) = (mat.nrows(), mat.ncols());
    if m * n == 0 {
        return;
    }
    let (mut buf, _) = stack.make_with(m * n, |k| mat[(k % m, k / m)]);
    let buf = &mut *buf;
    reduce.global_sum(buf);
    for (k, &value) in buf.iter().enumerate() {
        mat[(k % m, k / m)] = value;
    }
}

/// Workspace for [`update_projection`] with `total_cols = old_cols + new_cols`.
pub fn update_projection_scratch(total_cols: usize, new_cols: usize) -> StackReq {
    global_sum_mat_scratch(total_cols, new_cols).and(global_sum_mat_scratch(new_cols, total_cols))
}

/// Extends `Z = Xᵀ Y` after `new_cols` columns were appended to `X` and `Y`.
///
/// On return `Z[0..old+new, old..old+new] = X[:, 0..old+new]ᵀ Y[:, old..old+new]`. For a
/// symmetric projection the new rows `Z[old..old+new, 0..old]` are the transpose of the new
/// columns; otherwise they are computed as `X[:, old..]ᵀ Y[:, 0..old]`.
#[allow(clippy::too_many_arguments)]
pub fn update_projection(
    x: MatRef<'_, f64>,
    y: MatRef<'_, f64>,
    mut z: MatMut<'_, f64>,
    old_cols: usize,
    new_cols: usize,
    symmetric: bool,
    reduce: &dyn GlobalSum,
    stack: &mut MemStack,
) {
    if new_cols == 0 {
        return;
    }
    let total = old_cols + new_cols;

    {
        let mut block = z.rb_mut().get_mut(0..total, old_cols..total);
        matmul(
            block.rb_mut(),
            Accum::Replace,
            x.get(.., 0..total).transpose(),
            y.get(.., old_cols..total),
            1.0,
            Par::Seq,
        );
        global_sum_mat(block, reduce, stack);
    }

    if symmetric {
        for j in 0..old_cols {
            for i in old_cols..total {
                z[(i, j)] = z[(j, i)];
            }
        }
    } else if old_cols > 0 {
        let mut block = z.rb_mut().get_mut(old_cols..total, 0..old_cols);
        matmul(
            block.rb_mut(),
            Accum::Replace,
            x.get(.., old_cols..total).transpose(),
            y.get(.., 0..old_cols),
            1.0,
            Par::Seq,
        );
        global_sum_mat(block, reduce, stack);
    }
}

/// Workspace for [`combine_columns`] on a matrix with `nrows` rows producing `ncols` columns.
pub fn combine_columns_scratch(nrows: usize, ncols: usize) -> StackReq {
    temp_mat_scratch::<f64>(nrows.min(ROW_BLOCK), ncols)
}

/// Overwrites `mat[:, 0..k]` with `mat[:, 0..b] · coeffs`, where `coeffs` is `b × k`.
pub fn combine_columns(mut mat: MatMut<'_, f64>, coeffs: MatRef<'_, f64>, stack: &mut MemStack) {
    let (b, k) = (coeffs.nrows(), coeffs.ncols());
    let m = mat.nrows();
    if m == 0 || k == 0 {
        return;
    }
    let rows = m.min(ROW_BLOCK);
    let (mut tmp, _) = temp_mat_zeroed::<f64, _, _>(rows, k, stack);
    let mut tmp = tmp.as_mat_mut();

    let mut start = 0;
    while start < m {
        let len = rows.min(m - start);
        let mut chunk = tmp.rb_mut().get_mut(0..len, ..);
        matmul(
            chunk.rb_mut(),
            Accum::Replace,
            mat.rb().get(start..start + len, 0..b),
            coeffs,
            1.0,
            Par::Seq,
        );
        mat.rb_mut()
            .get_mut(start..start + len, 0..k)
            .copy_from(chunk.rb());
        start += len;
    }
}

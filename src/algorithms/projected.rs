//! Dense solves of the small projected problem.
//!
//! The restart only ever needs the projected problem on a few dozen columns, so these routines
//! favour clarity over blocking: they lean on `faer`'s dense eigen, singular value and QR
//! decompositions and reorder the results to match the requested [`Target`].
//!
//! - [`solve_projected`] dispatches on [`Projection`]: the symmetric eigenproblem of `H`
//!   (Rayleigh-Ritz), the SVD of `R` (refined) or the eigenproblem of `QV R⁻¹` (harmonic).
//! - [`target_order`] orders ascending eigenvalues by closeness to the target.
//! - [`prepare_vecs`] replaces clusters of poorly separated refined vectors by Rayleigh-Ritz
//!   vectors within their span.
//! - [`update_q`] recomputes `Q R = W - σV` from scratch with Cholesky-QR2.

use faer::mat::AsMatMut;
use crate::{
    algorithms::{ConvergenceFlag, RestartError, RestartErrorKind, Stage, ortho},
    config::{Projection, RestartParams, Target},
    operator::{GlobalSum, LocalSum},
    utils::{
        dense::{compute_submatrix, compute_submatrix_scratch, global_sum_mat, global_sum_mat_scratch},
        permute::{permute_columns, permute_values},
    },
};
use faer::{
    Accum, Mat, MatMut, MatRef, Par, Side,
    diag::Diag,
    dyn_stack::{MemStack, StackReq},
    linalg::{
        matmul::matmul,
        svd::{self, ComputeSvdVectors},
        temp_mat_scratch, temp_mat_zeroed,
        triangular_solve::{solve_lower_triangular_in_place, solve_upper_triangular_in_place},
    },
    prelude::*,
};
use rand::rngs::StdRng;
use std::f64::consts::SQRT_2;

/// Writes into `order` the gather permutation that sorts the ascending `values` by `target`.
///
/// After applying `order`, entry 0 is the most wanted value.
pub fn target_order(values: &[f64], target: Target, shift: f64, order: &mut [usize]) {
    let n = values.len();
    debug_assert!(order.len() >= n);
    let first_geq = values.iter().position(|&v| v >= shift).unwrap_or(n);

    match target {
        Target::Smallest => order[..n].iter_mut().enumerate().for_each(|(i, o)| *o = i),
        Target::Largest => order[..n].iter_mut().enumerate().for_each(|(i, o)| *o = n - 1 - i),
        Target::ClosestGeq => {
            for (o, i) in order.iter_mut().zip((first_geq..n).chain(0..first_geq)) {
                *o = i;
            }
        }
        Target::ClosestLeq => {
            let split = values.iter().rposition(|&v| v <= shift).map_or(0, |j| j + 1);
            for (o, i) in order.iter_mut().zip((0..split).rev().chain((split..n).rev())) {
                *o = i;
            }
        }
        Target::ClosestAbs => {
            // Merge outwards from the shift.
            let (mut below, mut above) = (first_geq, first_geq);
            for o in order[..n].iter_mut() {
                let take_below = below > 0
                    && (above >= n || (values[below - 1] - shift).abs() < (values[above] - shift).abs());
                if take_below {
                    below -= 1;
                    *o = below;
                } else {
                    *o = above;
                    above += 1;
                }
            }
        }
        Target::LargestAbs => {
            // Merge inwards from both ends.
            let (mut low, mut high) = (0, n);
            for o in order[..n].iter_mut() {
                if (values[high - 1] - shift).abs() > (values[low] - shift).abs() {
                    high -= 1;
                    *o = high;
                } else {
                    *o = low;
                    low += 1;
                }
            }
        }
    }
}

/// Symmetric eigenpairs of `h` (read from `side`), ordered by `target`.
pub(crate) fn ordered_eigen(
    h: MatRef<'_, f64>,
    side: Side,
    target: Target,
    shift: f64,
    mut vecs: MatMut<'_, f64>,
    vals: &mut [f64],
) -> Result<(), RestartError> {
    let n = h.nrows();
    if n == 0 {
        return Ok(());
    }
    let evd = h
        .self_adjoint_eigen(side)
        .map_err(|e| RestartError::from(RestartErrorKind::Evd(e)).pushed(Stage::SolveProjected))?;
    let u = evd.U();
    let s = evd.S();

    let ascending: Vec<f64> = (0..n).map(|i| s[i]).collect();
    let mut order = vec![0; n];
    target_order(&ascending, target, shift, &mut order);

    for (k, &i) in order.iter().enumerate() {
        vals[k] = ascending[i];
        vecs.rb_mut().col_mut(k).copy_from(u.col(i));
    }
    Ok(())
}

/// `vals[i] = vecs[:, i]ᵀ H vecs[:, i]`.
pub fn rayleigh_quotients(h: MatRef<'_, f64>, vecs: MatRef<'_, f64>, vals: &mut [f64]) {
    let hv = h * vecs;
    for (i, val) in vals.iter_mut().enumerate().take(vecs.ncols()) {
        *val = vecs.col(i).transpose() * hv.col(i);
    }
}

/// The matrices the projected problem is formed from.
#[derive(Clone, Copy)]
pub struct ProjectedProblem<'a> {
    /// `Vᵀ A V`.
    pub h: MatRef<'a, f64>,
    /// Upper triangular factor of `(A - σI) V`, for refined and harmonic extraction.
    pub r: Option<MatRef<'a, f64>>,
    /// `Qᵀ V`, for harmonic extraction.
    pub qv: Option<MatRef<'a, f64>>,
}

/// Where the solution of the projected problem is written.
pub struct ProjectedSolution<'a> {
    pub h_vecs: MatMut<'a, f64>,
    /// Left singular vectors (refined) or eigenvectors of `QV R⁻¹` (harmonic).
    pub h_u: Option<MatMut<'a, f64>>,
    pub h_vals: &'a mut [f64],
    pub h_svals: Option<&'a mut [f64]>,
}

/// Workspace for [`solve_projected`] on an `n × n` problem.
pub fn solve_projected_scratch(n: usize) -> StackReq {
    svd::svd_scratch::<f64>(
        n,
        n,
        ComputeSvdVectors::Full,
        ComputeSvdVectors::Full,
        Par::Seq,
        Default::default(),
    )
    .or(ortho::orthogonalize_scratch(n))
}

/// Solves the projected problem for the extraction method `projection`.
///
/// `shift` is the active target shift. Rayleigh-Ritz orders the eigenpairs of `H` by `target`.
/// Refined extraction computes the SVD of `R`, returns the right singular vectors in `h_vecs`
/// (ascending singular values for targets closest to the shift) and the Rayleigh quotients in
/// `h_vals`. Harmonic extraction solves the eigenproblem of `QV R⁻¹`, maps its eigenvectors
/// back through `R⁻¹` and orthonormalizes them.
///
/// # Errors
/// [`RestartErrorKind::Evd`] or [`RestartErrorKind::Svd`] if the dense decomposition fails,
/// and [`RestartErrorKind::InputError`] if a factor the method needs is missing.
pub fn solve_projected(
    projection: Projection,
    target: Target,
    shift: f64,
    problem: ProjectedProblem<'_>,
    solution: ProjectedSolution<'_>,
    rng: &mut StdRng,
    stack: &mut MemStack,
) -> Result<(), RestartError> {
    let n = problem.h.nrows();
    if n == 0 {
        return Ok(());
    }
    let ProjectedSolution {
        mut h_vecs,
        h_u,
        h_vals,
        h_svals,
    } = solution;

    let missing = |what: &str| {
        RestartError::from(RestartErrorKind::InputError(format!(
            "{what} is required by {projection:?} extraction."
        )))
        .pushed(Stage::SolveProjected)
    };

    match projection {
        Projection::RayleighRitz => {
            ordered_eigen(problem.h, Side::Lower, target, shift, h_vecs, h_vals)
        }
        Projection::Refined => {
            let r = problem.r.ok_or_else(|| missing("R"))?;
            let mut h_u = h_u.ok_or_else(|| missing("hU"))?;
            let h_svals = h_svals.ok_or_else(|| missing("hSVals"))?;

            let upper = Mat::from_fn(n, n, |i, j| if i <= j { r[(i, j)] } else { 0.0 });
            let mut singular = Diag::<f64>::zeros(n);
            let mut u = Mat::<f64>::zeros(n, n);
            let mut v = Mat::<f64>::zeros(n, n);
            svd::svd(
                upper.as_ref(),
                singular.as_mut(),
                Some(u.as_mut()),
                Some(v.as_mut()),
                Par::Seq,
                stack,
                Default::default(),
            )
            .map_err(|e| {
                RestartError::from(RestartErrorKind::Svd(format!("{e:?}")))
                    .pushed(Stage::SolveProjected)
            })?;

            let singular = singular.as_ref();
            let mut order: Vec<usize> = (0..n).collect();
            let ascending = matches!(
                target,
                Target::ClosestAbs | Target::ClosestGeq | Target::ClosestLeq
            );
            order.sort_by(|&a, &b| {
                let ord = singular[a].total_cmp(&singular[b]);
                if ascending { ord } else { ord.reverse() }
            });

            for (k, &i) in order.iter().enumerate() {
                h_svals[k] = singular[i];
                h_vecs.rb_mut().col_mut(k).copy_from(v.as_ref().col(i));
                h_u.rb_mut().col_mut(k).copy_from(u.as_ref().col(i));
            }
            rayleigh_quotients(problem.h, h_vecs.rb(), h_vals);
            Ok(())
        }
        Projection::Harmonic => {
            let r = problem.r.ok_or_else(|| missing("R"))?;
            let qv = problem.qv.ok_or_else(|| missing("QV"))?;
            let mut h_u = h_u.ok_or_else(|| missing("hU"))?;

            // QV R⁻¹, solved as R⁻ᵀ QVᵀ.
            let mut qaq = qv.to_owned();
            solve_lower_triangular_in_place(r.transpose(), qaq.as_mut().transpose_mut(), Par::Seq);

            let harmonic_target = match target {
                Target::ClosestGeq => Target::Largest,
                Target::ClosestLeq => Target::Smallest,
                _ => Target::LargestAbs,
            };
            ordered_eigen(qaq.as_ref(), Side::Upper, harmonic_target, 0.0, h_u.rb_mut(), h_vals)?;

            h_vecs.copy_from(h_u.rb());
            solve_upper_triangular_in_place(r, h_vecs.rb_mut(), Par::Seq);
            ortho::orthogonalize(h_vecs.rb_mut(), 0..n, &[], &LocalSum, rng, stack)?;
            rayleigh_quotients(problem.h, h_vecs.rb(), h_vals);
            Ok(())
        }
    }
}

/// Workspace for [`prepare_vecs`] on a projected problem of size `basis_size`.
pub fn prepare_vecs_scratch(basis_size: usize) -> StackReq {
    let n = basis_size;
    temp_mat_scratch::<f64>(n, n)
        .and(temp_mat_scratch::<f64>(n, n))
        .and(compute_submatrix_scratch(n, n))
        .and(StackReq::new::<usize>(n))
        .and(StackReq::new::<f64>(n))
        .and(StackReq::new::<bool>(n))
}

/// The part of the projected problem [`prepare_vecs`] inspects and rewrites.
pub struct PreparedVecs<'a> {
    pub h: MatRef<'a, f64>,
    pub h_vals: &'a mut [f64],
    pub h_svals: &'a mut [f64],
    pub h_vecs: MatMut<'a, f64>,
    pub h_u: Option<MatMut<'a, f64>>,
    pub flags: Option<&'a mut [ConvergenceFlag]>,
}

/// Checks that the refined vectors from `first` on are well enough conditioned to converge to
/// the requested accuracy, replacing poorly separated clusters by Rayleigh-Ritz vectors.
///
/// Two close singular values of `R` may belong to distinct eigenvalues of `A`. A cluster is
/// accepted as separated when the bound on the angle between the computed and exact right
/// singular vectors, `√2 ‖A‖ ε_mach / gap`, does not exceed the bound on the angle between the
/// approximate and exact eigenvectors. Clusters holding a candidate (or every cluster, when
/// `rr_for_all` is set) are replaced by the Rayleigh-Ritz vectors of `H` in their span and
/// `arbitrary_vecs` is raised past them.
///
/// At most `budget` candidates are examined. For [`Target::ClosestGeq`] and
/// [`Target::ClosestLeq`] the examined pairs are finally reordered so those on the wanted side of
/// the shift come first. When the basis spans the whole space every pair is replaced by a
/// Rayleigh-Ritz pair instead.
#[allow(clippy::too_many_arguments)]
pub fn prepare_vecs(
    params: &RestartParams,
    first: usize,
    budget: usize,
    num_locked: usize,
    shift: f64,
    arbitrary_vecs: &mut usize,
    rr_for_all: bool,
    vecs: PreparedVecs<'_>,
    stack: &mut MemStack,
) -> Result<(), RestartError> {
    let basis_size = vecs.h.nrows();
    if params.projection != Projection::Refined || basis_size == 0 {
        *arbitrary_vecs = 0;
        return Ok(());
    }
    let PreparedVecs {
        h,
        h_vals,
        h_svals,
        mut h_vecs,
        mut h_u,
        mut flags,
    } = vecs;

    let locked = if params.locking { num_locked } else { 0 };
    if basis_size + locked + params.num_ortho_const >= params.n {
        ordered_eigen(h, Side::Lower, params.target, shift, h_vecs, h_vals)?;
        *arbitrary_vecs = 0;
        return Ok(());
    }

    let eps_mach = f64::EPSILON;
    let a_norm = if params.a_norm > 0.0 {
        params.a_norm
    } else {
        h_vals[..basis_size]
            .iter()
            .fold(f64::MIN_POSITIVE, |acc, v| acc.max(v.abs()))
    };
    let largest_sval = h_svals[basis_size - 1];
    let one_sided = matches!(params.target, Target::ClosestGeq | Target::ClosestLeq);
    let on_wanted_side = |value: f64| match params.target {
        Target::ClosestLeq => value <= shift,
        Target::ClosestGeq => value >= shift,
        _ => true,
    };

    let mut candidates = 0;
    let mut end = (*arbitrary_vecs).min(basis_size);
    let mut j = first;
    while j < basis_size && candidates < budget {
        // Count the eligible pairs up to the end of the last cluster.
        while j < end {
            let eligible = match flags.as_deref() {
                None => true,
                Some(f) => f[j].is_unconverged() && on_wanted_side(h_vals[j]),
            };
            if eligible {
                candidates += 1;
            }
            j += 1;
        }
        if candidates >= budget {
            break;
        }

        // Find the first pair after j separated enough from its predecessor.
        let mut some_candidate = false;
        end = j + 1;
        while end < basis_size {
            let ip0 = h_vecs[(basis_size - 1, end - 1)].abs();
            let ip = if flags.is_some() && ip0 != 0.0 { ip0 } else { f64::INFINITY };
            let eval_bound = a_norm * params.eps / (h_vals[end] - h_vals[end - 1]).abs();
            let min_diff = SQRT_2 * largest_sval * eps_mach / ip.min(eval_bound);

            if flags.as_deref().is_none_or(|f| f[end - 1].is_unconverged()) {
                some_candidate = true;
            }
            if (h_svals[end] - h_svals[end - 1]).abs() >= min_diff
                && (h_vals[end - 1] - shift).abs() < h_svals[end - 1] + eps_mach * largest_sval
            {
                break;
            }
            end += 1;
        }
        end = end.min(basis_size);

        if end - j > 1 && (some_candidate || rr_for_all) {
            log::debug!("Replacing refined vectors {j}..{end} by Rayleigh-Ritz vectors.");
            rayleigh_ritz_cluster(h, h_vals, h_vecs.rb_mut(), j..end, params.target, shift, stack)?;
            *arbitrary_vecs = end;
            if let Some(f) = flags.as_deref_mut() {
                f[j..end].fill(ConvergenceFlag::Unconverged);
            }
        }
    }

    if !one_sided {
        return Ok(());
    }

    // Wanted pairs first, the rest after, both in their current order.
    let (mut perm, stack) = stack.make_with(end, |_| 0usize);
    let perm = &mut *perm;
    let wanted = (0..end).filter(|&i| on_wanted_side(h_vals[i]));
    let unwanted = (0..end).filter(|&i| !on_wanted_side(h_vals[i]));
    for (p, i) in perm.iter_mut().zip(wanted.chain(unwanted)) {
        *p = i;
    }

    let (mut column, stack) = stack.make_with(basis_size, |_| 0.0f64);
    let (mut marks, _) = stack.make_with(end, |_| false);
    permute_values(h_vals, perm, &mut *marks);
    permute_values(h_svals, perm, &mut *marks);
    permute_columns(h_vecs.rb_mut(), perm, &mut *column, &mut *marks);
    if let Some(h_u) = h_u.as_mut() {
        permute_columns(h_u.rb_mut(), perm, &mut *column, &mut *marks);
    }

    for (i, &p) in perm.iter().enumerate().skip(*arbitrary_vecs) {
        if p != i {
            *arbitrary_vecs = i + 1;
        }
    }
    Ok(())
}

/// Replaces `h_vecs[:, cols]` by the Rayleigh-Ritz vectors of `H` within their span.
fn rayleigh_ritz_cluster(
    h: MatRef<'_, f64>,
    h_vals: &mut [f64],
    mut h_vecs: MatMut<'_, f64>,
    cols: std::ops::Range<usize>,
    target: Target,
    shift: f64,
    stack: &mut MemStack,
) -> Result<(), RestartError> {
    let size = cols.len();
    let (mut sub_h, stack) = temp_mat_zeroed::<f64, _, _>(size, size, stack);
    let mut sub_h = sub_h.as_mat_mut();
    let (mut sub_vecs, stack) = temp_mat_zeroed::<f64, _, _>(size, size, stack);
    let mut sub_vecs = sub_vecs.as_mat_mut();

    compute_submatrix(h_vecs.rb().get(.., cols.clone()), h, sub_h.rb_mut(), stack);
    ordered_eigen(
        sub_h.rb(),
        Side::Lower,
        target,
        shift,
        sub_vecs.rb_mut(),
        &mut h_vals[cols.clone()],
    )?;

    let combined = h_vecs.rb().get(.., cols.clone()) * sub_vecs.rb();
    h_vecs.get_mut(.., cols).copy_from(combined.as_ref());
    Ok(())
}

/// Workspace for [`update_q`] with `ncols` columns.
pub fn update_q_scratch(ncols: usize) -> StackReq {
    temp_mat_scratch::<f64>(ncols, ncols)
        .and(temp_mat_scratch::<f64>(ncols, ncols))
        .and(global_sum_mat_scratch(ncols, ncols))
}

/// Recomputes `Q R = W - σ V` for the first `ncols` columns with Cholesky-QR2.
///
/// # Errors
/// [`RestartErrorKind::QFactor`] if `Qᵀ Q` is not numerically positive definite, i.e. the
/// shifted basis is rank deficient.
#[allow(clippy::too_many_arguments)]
pub fn update_q(
    v: MatRef<'_, f64>,
    w: MatRef<'_, f64>,
    mut q: MatMut<'_, f64>,
    mut r: MatMut<'_, f64>,
    shift: f64,
    ncols: usize,
    reduce: &dyn GlobalSum,
    stack: &mut MemStack,
) -> Result<(), RestartError> {
    let nrows = v.nrows();
    for j in 0..ncols {
        for i in 0..nrows {
            q[(i, j)] = w[(i, j)] - shift * v[(i, j)];
        }
    }

    let (mut gram, stack) = temp_mat_zeroed::<f64, _, _>(ncols, ncols, stack);
    let mut gram = gram.as_mat_mut();
    let (mut acc, stack) = temp_mat_zeroed::<f64, _, _>(ncols, ncols, stack);
    let mut acc = acc.as_mat_mut();
    for j in 0..ncols {
        acc[(j, j)] = 1.0;
    }

    for _ in 0..2 {
        let q_cols = q.rb().get(.., 0..ncols);
        matmul(gram.rb_mut(), Accum::Replace, q_cols.transpose(), q_cols, 1.0, Par::Seq);
        global_sum_mat(gram.rb_mut(), reduce, stack);

        let llt = gram.rb().llt(Side::Lower).map_err(|e| {
            RestartError::from(RestartErrorKind::QFactor(format!("{e:?}"))).pushed(Stage::UpdateQ)
        })?;
        let l = llt.L();

        // Q ← Q L⁻ᵀ and the accumulated R ← Lᵀ R.
        solve_lower_triangular_in_place(l, q.rb_mut().get_mut(.., 0..ncols).transpose_mut(), Par::Seq);
        let updated = l.transpose() * acc.rb();
        acc.copy_from(updated.as_ref());
    }

    let mut r = r.rb_mut().get_mut(0..ncols, 0..ncols);
    for j in 0..ncols {
        for i in 0..ncols {
            r[(i, j)] = if i <= j { acc[(i, j)] } else { 0.0 };
        }
    }
    Ok(())
}

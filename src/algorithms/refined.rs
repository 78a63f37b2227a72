//! Restart of refined and harmonic extraction.
//!
//! Both methods work with the QR factorization `Q R = W - σ V` of the shifted basis. When the
//! basis is restarted as `V hVecs`, the kept columns of `hVecs` are right singular vectors of
//! `R`, so `R hVecs` is already orthogonal there and only the retained previous vectors need a
//! small QR factorization:
//!
//! ```text
//!     R [kept | P | kept] = [U Σ | Qn Rn | U Σ]     =>     Q ← Q [U | Qn | U],
//! ```
//!
//! which keeps `Q` orthonormal and `R` upper triangular without touching `W`. Harmonic
//! extraction treats the whole restarted basis as "previous", which reduces to a QR of
//! `R hVecs`, and additionally carries `QV = Qᵀ V`.
//!
//! When the target shift changed since the factorization was computed, `Q` and `R` are
//! recomputed from scratch instead.

use faer::mat::AsMatMut;
use crate::{
    algorithms::{
        DriverOutcome, RestartError, RestartErrorKind, RestartPermutations, RestartState, Stage,
        projected::{
            PreparedVecs, ProjectedProblem, ProjectedSolution, prepare_vecs, prepare_vecs_scratch,
            solve_projected, solve_projected_scratch, update_q, update_q_scratch,
        },
    },
    config::RestartParams,
    utils::{
        dense::{
            combine_columns, combine_columns_scratch, compute_submatrix, compute_submatrix_scratch,
            update_projection, update_projection_scratch,
        },
        permute::{permute_columns, permute_columns_scratch, permute_values},
    },
};
use faer::{
    Accum, MatMut, Par,
    dyn_stack::{MemStack, StackReq},
    linalg::{matmul::matmul, temp_mat_scratch, temp_mat_zeroed},
    prelude::*,
};
use rand::rngs::StdRng;

/// Workspace for [`restart_refined`] with a basis of `n_local` rows.
pub fn restart_refined_scratch(params: &RestartParams, n_local: usize) -> StackReq {
    let m = params.max_basis_size;
    let projected = temp_mat_scratch::<f64>(m, m).and(compute_submatrix_scratch(m, m));
    let recompute = update_q_scratch(m)
        .or(update_projection_scratch(m, m))
        .or(solve_projected_scratch(m));
    let incremental = temp_mat_scratch::<f64>(m, m)
        .or(temp_mat_scratch::<f64>(m, m).and(permute_columns_scratch(m, m)))
        .or(combine_columns_scratch(n_local, m))
        .or(solve_projected_scratch(m))
        .or(prepare_vecs_scratch(m));
    projected.or(recompute).or(incremental)
}

/// Sets the leading `n × n` block of `mat` to the identity.
fn set_identity(mut mat: MatMut<'_, f64>, n: usize) {
    for j in 0..n {
        for i in 0..n {
            mat[(i, j)] = if i == j { 1.0 } else { 0.0 };
        }
    }
}

/// Zeroes column `j` of `r` and places `sval` on its diagonal.
fn set_singular_column(mut r: MatMut<'_, f64>, j: usize, sval: f64) {
    for i in 0..r.nrows() {
        r[(i, j)] = 0.0;
    }
    r[(j, j)] = sval;
}

/// Updates `H`, `Q`, `R`, `QV` and the projected solution to the restarted basis.
///
/// `V` and `W` must already hold the restarted basis. The retained previous vectors occupy
/// `layout.index_of_previous_vecs..+layout.num_prev_retained`; every other kept column is a
/// right singular vector of `R`, permuted by `restart_perm`. `R` is kept with zeros below its
/// diagonal.
///
/// # Errors
/// [`RestartErrorKind::InputError`] without `H`, the QR factors or `h_svals`;
/// [`RestartErrorKind::QFactor`] when the factorization is recomputed for a rank-deficient
/// basis; [`RestartErrorKind::InsertSubmatrix`] when the retained block cannot be solved.
pub fn restart_refined(
    params: &RestartParams,
    state: &mut RestartState<'_>,
    layout: &DriverOutcome,
    perms: &RestartPermutations<'_>,
    rng: &mut StdRng,
    stack: &mut MemStack,
) -> Result<(), RestartError> {
    let missing = |what: &str| {
        RestartError::from(RestartErrorKind::InputError(format!(
            "{what} is required to restart {:?} extraction.",
            params.projection
        )))
        .pushed(Stage::InsertSubmatrix)
    };
    let basis_size = state.basis_size;
    let restart_size = layout.restart_size;
    let prev = layout.index_of_previous_vecs..layout.index_of_previous_vecs + layout.num_prev_retained;

    let h = state.h.as_mut().ok_or_else(|| missing("H"))?;
    let qr = state.qr.as_mut().ok_or_else(|| missing("The QR factorization"))?;
    let h_svals = state.h_svals.as_deref_mut().ok_or_else(|| missing("hSVals"))?;

    // H ← hVecsᵀ H hVecs
    {
        let (mut projected, stack) = temp_mat_zeroed::<f64, _, _>(restart_size, restart_size, stack);
        let mut projected = projected.as_mat_mut();
        compute_submatrix(
            state.h_vecs.rb().get(0..basis_size, 0..restart_size),
            (*h).rb().get(0..basis_size, 0..basis_size),
            projected.rb_mut(),
            stack,
        );
        h.rb_mut()
            .get_mut(0..restart_size, 0..restart_size)
            .copy_from(projected.rb());
    }

    let shift_index = params.shift_index(state.num_converged);
    let shift = params.target_shift(state.num_converged);
    let stale = qr
        .target_shift_index
        .is_none_or(|old| params.target_shifts.get(old).copied() != Some(shift));
    if stale {
        log::debug!("Recomputing the QR factorization of W - σV for σ = {shift}.");
        qr.target_shift_index = Some(shift_index);
        update_q(
            state.v.rb(),
            state.w.rb(),
            qr.q.rb_mut(),
            qr.r.rb_mut(),
            shift,
            restart_size,
            state.reduce,
            stack,
        )?;
        if let Some(qv) = qr.qv.as_mut() {
            update_projection(
                qr.q.rb(),
                state.v.rb(),
                qv.rb_mut(),
                0,
                restart_size,
                false,
                state.reduce,
                stack,
            );
        }
        let all = 0..restart_size;
        return solve_projected(
            params.projection,
            params.target,
            shift,
            ProjectedProblem {
                h: (*h).rb().get(all.clone(), all.clone()),
                r: Some(qr.r.rb().get(all.clone(), all.clone())),
                qv: qr.qv.as_ref().map(|qv| qv.rb().get(all.clone(), all.clone())),
            },
            ProjectedSolution {
                h_vecs: state.h_vecs.rb_mut().get_mut(all.clone(), all.clone()),
                h_u: Some(qr.h_u.rb_mut().get_mut(all.clone(), all.clone())),
                h_vals: &mut state.h_vals[all.clone()],
                h_svals: Some(&mut h_svals[all]),
            },
            rng,
            stack,
        );
    }

    // QV ← QV hVecs
    if let Some(qv) = qr.qv.as_mut() {
        let (mut product, _) = temp_mat_zeroed::<f64, _, _>(basis_size, restart_size, stack);
        let mut product = product.as_mat_mut();
        matmul(
            product.rb_mut(),
            Accum::Replace,
            (*qv).rb().get(0..basis_size, 0..basis_size),
            state.h_vecs.rb().get(0..basis_size, 0..restart_size),
            1.0,
            Par::Seq,
        );
        qv.rb_mut()
            .get_mut(0..basis_size, 0..restart_size)
            .copy_from(product.rb());
    }

    {
        let restart_perm = &perms.restart_perm[..basis_size];
        let (mut shifted, stack) = temp_mat_zeroed::<f64, _, _>(basis_size, prev.len(), stack);
        let mut shifted = shifted.as_mat_mut();
        matmul(
            shifted.rb_mut(),
            Accum::Replace,
            qr.r.rb().get(0..basis_size, 0..basis_size),
            state.h_vecs.rb().get(0..basis_size, prev.clone()),
            1.0,
            Par::Seq,
        );

        // The kept columns map to the singular triplets, reordered like the basis.
        let (mut column, stack) = stack.make_with(basis_size, |_| 0.0f64);
        let (mut marks, _) = stack.make_with(basis_size, |_| false);
        permute_values(&mut h_svals[..basis_size], restart_perm, &mut *marks);
        permute_columns(
            qr.h_u.rb_mut().get_mut(0..basis_size, ..),
            restart_perm,
            &mut *column,
            &mut *marks,
        );
        for j in (0..prev.start).chain(prev.end..restart_size) {
            set_singular_column(qr.r.rb_mut(), j, h_svals[j]);
        }

        if !prev.is_empty() {
            let factors = shifted.rb().qr();
            let q_full = factors.compute_Q();
            let q_block = q_full.as_ref().get(.., 0..prev.len());
            let r_block = q_block.transpose() * shifted.rb();
            qr.h_u
                .rb_mut()
                .get_mut(0..basis_size, prev.clone())
                .copy_from(q_block);
            for (jj, j) in prev.clone().enumerate() {
                for i in 0..qr.r.nrows() {
                    let inside = i >= prev.start && i - prev.start <= jj;
                    qr.r[(i, j)] = if inside { r_block[(i - prev.start, jj)] } else { 0.0 };
                }
            }
        }
    }

    // Q ← Q hU
    combine_columns(
        qr.q.rb_mut(),
        qr.h_u.rb().get(0..basis_size, 0..restart_size),
        stack,
    );

    // QV ← hUᵀ QV
    if let Some(qv) = qr.qv.as_mut() {
        let (mut product, _) = temp_mat_zeroed::<f64, _, _>(restart_size, restart_size, stack);
        let mut product = product.as_mat_mut();
        matmul(
            product.rb_mut(),
            Accum::Replace,
            qr.h_u.rb().get(0..basis_size, 0..restart_size).transpose(),
            (*qv).rb().get(0..basis_size, 0..restart_size),
            1.0,
            Par::Seq,
        );
        qv.rb_mut()
            .get_mut(0..restart_size, 0..restart_size)
            .copy_from(product.rb());
    }

    set_identity(state.h_vecs.rb_mut(), restart_size);
    set_identity(qr.h_u.rb_mut(), restart_size);

    solve_projected(
        params.projection,
        params.target,
        shift,
        ProjectedProblem {
            h: (*h).rb().get(prev.clone(), prev.clone()),
            r: Some(qr.r.rb().get(prev.clone(), prev.clone())),
            qv: qr.qv.as_ref().map(|qv| qv.rb().get(prev.clone(), prev.clone())),
        },
        ProjectedSolution {
            h_vecs: state.h_vecs.rb_mut().get_mut(prev.clone(), prev.clone()),
            h_u: Some(qr.h_u.rb_mut().get_mut(prev.clone(), prev.clone())),
            h_vals: &mut state.h_vals[prev.clone()],
            h_svals: Some(&mut h_svals[prev.clone()]),
        },
        rng,
        stack,
    )
    .map_err(|e| e.escalate(RestartErrorKind::InsertSubmatrix, Stage::InsertSubmatrix))?;

    let mut arbitrary = 0;
    prepare_vecs(
        params,
        0,
        state.num_arbitrary_vecs,
        state.num_locked,
        shift,
        &mut arbitrary,
        true,
        PreparedVecs {
            h: (*h).rb().get(prev.clone(), prev.clone()),
            h_vals: &mut state.h_vals[prev.clone()],
            h_svals: &mut h_svals[prev.clone()],
            h_vecs: state.h_vecs.rb_mut().get_mut(prev.clone(), prev.clone()),
            h_u: Some(qr.h_u.rb_mut().get_mut(prev.clone(), prev.clone())),
            flags: None,
        },
        stack,
    )?;

    let perm = &perms.h_vecs_perm[..restart_size];
    let (mut column, stack) = stack.make_with(restart_size, |_| 0.0f64);
    let (mut marks, _) = stack.make_with(restart_size, |_| false);
    permute_values(&mut state.h_vals[..restart_size], perm, &mut *marks);
    permute_values(&mut h_svals[..restart_size], perm, &mut *marks);
    permute_columns(
        state.h_vecs.rb_mut().get_mut(0..restart_size, ..),
        perm,
        &mut *column,
        &mut *marks,
    );
    permute_columns(
        qr.h_u.rb_mut().get_mut(0..restart_size, ..),
        perm,
        &mut *column,
        &mut *marks,
    );
    Ok(())
}

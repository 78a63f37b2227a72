//! Restart without locking: converged Ritz vectors stay in the search basis.
//!
//! The restarted coefficient matrix is laid out as
//!
//! ```text
//!      kept        | previous vectors | candidates | next block
//!  [0, idx)        [idx, left)        [left, rs)   [rs, rs + block)
//! ```
//!
//! where `idx` is the index of the retained previous vectors, `left` the first candidate and
//! `rs` the restart size. Candidates are the leading unconverged pairs; the next block holds the
//! Ritz vectors and residuals of the first candidates.

use faer::mat::AsMatMut;
use crate::{
    algorithms::{
        ConvergenceFlag, DriverOutcome, RestartError, RestartPermutations, RestartState,
        ortho::{HarmonicFactors, ortho_coefficient_vectors, ortho_coefficient_vectors_scratch},
        rebuild::{rebuild_basis, rebuild_basis_scratch},
    },
    config::{Projection, RestartParams},
    utils::{
        dense::{compute_submatrix, compute_submatrix_scratch},
        permute::{invert_permutation, is_permutation, permute_columns, permute_columns_scratch, permute_values},
    },
};
use faer::{
    dyn_stack::{MemStack, StackReq},
    linalg::{temp_mat_scratch, temp_mat_zeroed},
    prelude::*,
};
use rand::rngs::StdRng;

/// Workspace for [`restart_soft_locking`] with a basis of `n_local` rows.
pub fn soft_locking_scratch(params: &RestartParams, n_local: usize) -> StackReq {
    let m = params.max_basis_size;
    let skew = params.num_ortho_const + params.num_evals;
    let permute = permute_columns_scratch(m, m);
    let packing = temp_mat_scratch::<f64>(skew, skew)
        .and(temp_mat_scratch::<f64>(skew, skew))
        .and(compute_submatrix_scratch(skew, skew));
    permute
        .or(ortho_coefficient_vectors_scratch(m, m))
        .or(rebuild_basis_scratch(n_local, m, params.max_block_size))
        .or(StackReq::new::<usize>(m))
        .or(packing)
}

/// Restarts the basis keeping converged Ritz vectors in it.
///
/// `restart_size` is the number of current Ritz vectors to keep; previous coefficient vectors
/// are added on top of it. Fills `perms` and returns the sizes of the restarted layout. Also
/// updates `state.num_converged`, `state.block`, `state.block_size` and
/// `state.num_prev_retained`, and compacts the skew projection store when present.
///
/// # Errors
/// Propagates [`crate::RestartErrorKind::Orthogonalization`] from the retained previous
/// vectors.
pub fn restart_soft_locking(
    params: &RestartParams,
    state: &mut RestartState<'_>,
    restart_size: usize,
    perms: &mut RestartPermutations<'_>,
    rng: &mut StdRng,
    stack: &mut MemStack,
) -> Result<DriverOutcome, RestartError> {
    let basis_size = state.basis_size;
    let max_basis_size = params.max_basis_size;
    let noc = params.num_ortho_const;
    debug_assert!(restart_size <= basis_size);

    // A pair whose Ritz value moved away from its converged eigenvalue is targeted again.
    if basis_size + noc < params.n {
        let checked = params
            .num_evals
            .min(basis_size)
            .min(state.evals.len())
            .min(state.res_norms.len());
        for i in 0..checked {
            if !state.flags[i].is_unconverged()
                && (state.h_vals[i] - state.evals[i]).abs() > state.res_norms[i]
            {
                log::debug!(
                    "Ritz value {} drifted from converged eigenvalue {}, targeting it again.",
                    state.h_vals[i],
                    state.evals[i]
                );
                state.flags[i] = ConvergenceFlag::Unconverged;
            }
        }
    }

    // Previous vectors have to be orthogonal to the kept ones in the projected space.
    let mut num_prev = (max_basis_size.min(restart_size + state.num_prev_retained))
        .saturating_sub(restart_size)
        .min(state.previous_h_vecs.ncols())
        .min(basis_size - restart_size);

    let arbitrary_unconverged = (0..state.num_arbitrary_vecs.min(restart_size))
        .filter(|&i| state.flags[i].is_unconverged())
        .count();
    let restart_size = restart_size + num_prev;

    let mut block_size = params
        .max_block_size
        .min((params.num_evals + 1).saturating_sub(state.num_converged))
        .min(max_basis_size - restart_size);
    let unconverged = state.flags[..basis_size]
        .iter()
        .filter(|f| f.is_unconverged())
        .count();
    let num_candidates = block_size
        .max(arbitrary_unconverged)
        .min(unconverged)
        .min(restart_size - num_prev);
    block_size = block_size.min(num_candidates);

    let index_of_prev = restart_size - num_candidates - num_prev;
    let left = restart_size - num_candidates;

    let restart_perm = &mut perms.restart_perm[..basis_size];
    let (mut j, mut k) = (0, 0);
    for i in 0..basis_size {
        if j < num_candidates && state.flags[i].is_unconverged() {
            restart_perm[left + j] = i;
            j += 1;
        } else if k < left {
            restart_perm[k] = i;
            k += 1;
        } else {
            restart_perm[num_candidates + k] = i;
            k += 1;
        }
    }
    debug_assert!(is_permutation(restart_perm));
    log::trace!("Soft-locking restart permutation: {restart_perm:?}");

    let num_converged = state.flags[..basis_size.min(params.num_evals)]
        .iter()
        .filter(|f| !f.is_unconverged())
        .count();

    {
        let (mut column, stack) = stack.make_with(basis_size, |_| 0.0f64);
        let (mut marks, _) = stack.make_with(basis_size, |_| false);
        permute_values(state.h_vals, restart_perm, &mut *marks);
        permute_columns(
            state.h_vecs.rb_mut().get_mut(0..basis_size, ..),
            restart_perm,
            &mut *column,
            &mut *marks,
        );
    }

    if num_prev > 0 {
        let rows = state.previous_h_vecs.nrows().min(basis_size);
        for j in 0..num_prev {
            for i in 0..basis_size {
                state.h_vecs[(i, index_of_prev + j)] = if i < rows {
                    state.previous_h_vecs[(i, j)]
                } else {
                    0.0
                };
            }
        }
    }

    let harmonic = match (params.projection, state.qr.as_mut()) {
        (Projection::Harmonic, Some(qr)) => Some(HarmonicFactors {
            h_u: qr.h_u.rb_mut(),
            r: qr.r.rb(),
            restart_perm,
        }),
        _ => None,
    };
    ortho_coefficient_vectors(
        state.h_vecs.rb_mut().get_mut(0..basis_size, ..),
        index_of_prev,
        num_prev,
        restart_size,
        harmonic,
        state.reduce,
        rng,
        stack,
    )?;

    rebuild_basis(
        state.v.rb_mut(),
        state.w.rb_mut(),
        state.h_vecs.rb().get(0..basis_size, ..),
        state.h_vals,
        restart_size,
        left..left + block_size,
        state.block_norms,
        state.reduce,
        stack,
    );

    // Restarted positions listed by increasing original column.
    {
        let (mut inverse, _) = stack.make_with(basis_size, |_| 0usize);
        let inverse = &mut *inverse;
        invert_permutation(restart_perm, inverse);
        let kept = inverse.iter().copied().filter(|&p| p < restart_size);
        for (slot, p) in perms.h_vecs_perm.iter_mut().zip(kept) {
            *slot = p;
        }
    }

    // Candidates that were arbitrary vectors are ordered like previous vectors.
    let arbitrary_candidates = restart_perm[left..restart_size]
        .iter()
        .filter(|&&p| p < state.num_arbitrary_vecs)
        .count();
    if arbitrary_candidates > 0 {
        log::debug!("Treating {arbitrary_candidates} arbitrary candidates as previous vectors.");
        let span = num_prev + arbitrary_candidates;
        for x in perms.h_vecs_perm[..restart_size].iter_mut() {
            if (index_of_prev..left + arbitrary_candidates).contains(&*x) {
                *x = (*x - index_of_prev + arbitrary_candidates) % span + index_of_prev;
            }
        }
        num_prev = span;
    }
    debug_assert!(is_permutation(&perms.h_vecs_perm[..restart_size]));

    for (slot, &p) in state.block.iter_mut().zip(&restart_perm[left..left + block_size]) {
        *slot = p;
    }
    debug_assert!(
        state.flags[..basis_size]
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_unconverged())
            .map(|(i, _)| i)
            .zip(&state.block[..block_size])
            .all(|(i, &b)| i == b)
    );

    if let Some(skew) = state.skew.as_mut() {
        let old_stored = skew.num_stored;
        let mut new_stored = 0;
        while new_stored < num_converged && restart_perm[new_stored] < old_stored {
            let (src, dst) = (restart_perm[new_stored] + noc, new_stored + noc);
            if src != dst {
                for r in 0..skew.evecs.nrows() {
                    skew.evecs[(r, dst)] = skew.evecs[(r, src)];
                }
                for r in 0..skew.evecs_hat.nrows() {
                    skew.evecs_hat[(r, dst)] = skew.evecs_hat[(r, src)];
                }
            }
            new_stored += 1;
        }

        // M ← Sᵀ M S with S selecting the packed columns.
        let (old_size, new_size) = (noc + old_stored, noc + new_stored);
        let (mut selection, stack) = temp_mat_zeroed::<f64, _, _>(old_size, new_size, stack);
        let mut selection = selection.as_mat_mut();
        for i in 0..noc {
            selection[(i, i)] = 1.0;
        }
        for (kk, &p) in restart_perm[..new_stored].iter().enumerate() {
            selection[(p + noc, kk + noc)] = 1.0;
        }
        let (mut packed, stack) = temp_mat_zeroed::<f64, _, _>(new_size, new_size, stack);
        let mut packed = packed.as_mat_mut();
        compute_submatrix(
            selection.rb(),
            skew.m.rb().get(0..old_size, 0..old_size),
            packed.rb_mut(),
            stack,
        );
        skew.m
            .rb_mut()
            .get_mut(0..new_size, 0..new_size)
            .copy_from(packed.rb());
        skew.num_stored = new_stored;
    }

    state.num_converged = num_converged;
    state.block_size = block_size;
    state.num_prev_retained = num_prev;

    Ok(DriverOutcome {
        restart_size,
        num_prev_retained: num_prev,
        index_of_previous_vecs: index_of_prev,
        block_size,
    })
}

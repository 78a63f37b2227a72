//! Regenerates the projected matrices after the basis was restarted.
//!
//! Dispatches on the extraction method:
//!
//! - Rayleigh-Ritz restarts `H` with [`restart_rr`].
//! - Refined extraction updates `H`, `Q` and `R` with [`restart_refined`].
//! - Harmonic extraction uses the same routine, treating every restarted column like a
//!   retained previous vector since none of them is a singular vector of `R`.
//!
//! With skew projections the newly converged eigenvectors are then preconditioned, the cross
//! projection `M = evecsᵀ evecs_hat` is extended and refactored.

use crate::{
    algorithms::{
        DriverOutcome, RestartError, RestartErrorKind, RestartPermutations, RestartState,
        SkewProjection, Stage,
        rayleigh_ritz::{restart_rr, restart_rr_scratch},
        refined::{restart_refined, restart_refined_scratch},
    },
    config::{Projection, RestartParams},
    operator::GlobalSum,
    utils::dense::{update_projection, update_projection_scratch},
};
use faer::{
    Side,
    dyn_stack::{MemStack, StackReq},
    prelude::*,
};
use rand::rngs::StdRng;

/// Workspace for [`restart_projection`] with a basis of `n_local` rows.
pub fn restart_projection_scratch(params: &RestartParams, n_local: usize) -> StackReq {
    let skew = params.num_ortho_const + params.num_evals;
    let projected = match params.projection {
        Projection::RayleighRitz => restart_rr_scratch(params.max_basis_size),
        Projection::Refined | Projection::Harmonic => restart_refined_scratch(params, n_local),
    };
    projected.or(update_projection_scratch(skew, params.num_evals))
}

/// Restarts `H` (and the QR structure for refined or harmonic extraction) for the layout a
/// restart driver chose, then refreshes the skew projection.
///
/// # Errors
/// Failures of the projected restart surface as [`RestartErrorKind::RestartProjection`], with
/// the inner stages kept in the trail. A skew projection matrix that is not positive definite
/// gives [`RestartErrorKind::Factorization`].
pub fn restart_projection(
    params: &RestartParams,
    state: &mut RestartState<'_>,
    layout: &DriverOutcome,
    perms: &mut RestartPermutations<'_>,
    rng: &mut StdRng,
    stack: &mut MemStack,
) -> Result<(), RestartError> {
    let restarted = match params.projection {
        Projection::RayleighRitz => restart_rr(params, state, layout, perms.h_vecs_perm, stack),
        Projection::Refined => restart_refined(params, state, layout, perms, rng, stack),
        Projection::Harmonic => {
            let layout = DriverOutcome {
                index_of_previous_vecs: 0,
                num_prev_retained: layout.restart_size,
                ..*layout
            };
            if state.h.is_some() {
                for (i, p) in perms.h_vecs_perm[..layout.restart_size].iter_mut().enumerate() {
                    *p = i;
                }
            }
            restart_refined(params, state, &layout, perms, rng, stack)
        }
    };
    restarted
        .map_err(|e| e.escalate(RestartErrorKind::RestartProjection, Stage::RestartProjection))?;

    if let Some(skew) = state.skew.as_mut() {
        refresh_skew_projection(params, skew, state.num_converged, state.reduce, stack)?;
    }
    Ok(())
}

/// Preconditions the eigenvectors stored since the last restart, extends `M` and recomputes
/// its `L D Lᵀ` factors.
///
/// Columns `noc + num_stored..noc + num_converged` of `evecs` must hold the newly converged
/// eigenvectors. `M` is factored through its Cholesky factor, so the preconditioner is
/// assumed symmetric positive definite.
fn refresh_skew_projection(
    params: &RestartParams,
    skew: &mut SkewProjection<'_>,
    num_converged: usize,
    reduce: &dyn GlobalSum,
    stack: &mut MemStack,
) -> Result<(), RestartError> {
    let noc = params.num_ortho_const;
    let stored = skew.num_stored;
    let recent = num_converged.saturating_sub(stored);
    if recent > 0 {
        let cols = noc + stored..noc + stored + recent;
        skew.preconditioner.apply(
            skew.evecs.rb().get(.., cols.clone()),
            skew.evecs_hat.rb_mut().get_mut(.., cols),
        );
        update_projection(
            skew.evecs.rb(),
            skew.evecs_hat.rb(),
            skew.m.rb_mut(),
            noc + stored,
            recent,
            true,
            reduce,
            stack,
        );
    }
    skew.num_stored = stored.max(num_converged);

    let size = noc + skew.num_stored;
    if size == 0 {
        return Ok(());
    }
    let llt = skew
        .m
        .rb()
        .get(0..size, 0..size)
        .llt(Side::Lower)
        .map_err(|e| {
            RestartError::from(RestartErrorKind::Factorization(format!("{e:?}")))
                .pushed(Stage::SkewProjection)
        })?;
    let l = llt.L();
    let mut ldlt = skew.ldlt.rb_mut().get_mut(0..size, 0..size);
    for j in 0..size {
        let pivot = l[(j, j)];
        for i in 0..size {
            ldlt[(i, j)] = match i.cmp(&j) {
                std::cmp::Ordering::Less => 0.0,
                std::cmp::Ordering::Equal => pivot * pivot,
                std::cmp::Ordering::Greater => l[(i, j)] / pivot,
            };
        }
    }
    log::trace!("Refactored the skew projection of {size} vectors.");
    Ok(())
}

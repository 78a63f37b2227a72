//! This module provides the high-level entry point of the restart, [`restart`].
//!
//! A restart runs in four steps:
//!
//! 1. Choose how many Ritz pairs survive ([`restart_size_policy`], possibly refined by the
//!    dynamic thick restart heuristic).
//! 2. Let a restart driver pick and order the surviving columns, rebuild V and W and extract
//!    the next block. Without locking this is the soft-locking driver; with locking it is the
//!    caller's [`LockingRestart`].
//! 3. Carry the Ritz values of the previous iteration along for interior targets.
//! 4. Regenerate the projected matrices for the restarted basis.

use crate::{
    algorithms::{
        ConvergenceFlag, DriverOutcome, RestartError, RestartErrorKind, RestartPermutations,
        RestartState, Stage,
        dtr::{dtr, dtr_scratch},
        locking::LockingRestart,
        projection::{restart_projection, restart_projection_scratch},
        soft_locking::{restart_soft_locking, soft_locking_scratch},
    },
    config::{RestartParams, RestartScheme, Target},
    utils::permute::permute_values,
};
use faer::{
    dyn_stack::{MemStack, StackReq},
    prelude::*,
};
use rand::{SeedableRng, rngs::StdRng};

/// How many Ritz pairs the restart keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizePolicy {
    /// The basis together with the locked vectors spans the whole space: everything is kept
    /// and the remaining pairs are declared converged.
    FullSpace,
    /// The basis still has room for a full block; nothing is discarded.
    NotFull,
    /// Dynamic thick restart leaving at least `num_free` columns free.
    Dynamic { num_free: usize },
    /// Thick restart keeping `restart_size` pairs.
    Thick { restart_size: usize },
}

/// The sizes of the restarted basis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartOutcome {
    /// Number of columns of the restarted basis.
    pub restart_size: usize,
    /// Number of coefficient vectors of the previous iteration kept in it.
    pub num_prev_retained: usize,
    /// First column of those vectors.
    pub index_of_previous_vecs: usize,
    /// Number of block vectors extracted after the restarted basis.
    pub block_size: usize,
}

impl From<DriverOutcome> for RestartOutcome {
    fn from(outcome: DriverOutcome) -> Self {
        Self {
            restart_size: outcome.restart_size,
            num_prev_retained: outcome.num_prev_retained,
            index_of_previous_vecs: outcome.index_of_previous_vecs,
            block_size: outcome.block_size,
        }
    }
}

/// Decides how many pairs survive a restart of a basis with `basis_size` columns.
///
/// Has no side effects.
pub fn restart_size_policy(
    params: &RestartParams,
    basis_size: usize,
    num_locked: usize,
    num_prev_retained: usize,
) -> SizePolicy {
    if basis_size + num_locked + params.num_ortho_const >= params.n {
        SizePolicy::FullSpace
    } else if basis_size <= params.max_basis_size.saturating_sub(params.max_block_size) {
        SizePolicy::NotFull
    } else if params.scheme == RestartScheme::Dynamic {
        SizePolicy::Dynamic {
            num_free: num_prev_retained + params.max_block_size.max(3),
        }
    } else {
        SizePolicy::Thick {
            restart_size: basis_size.min(params.min_restart_size),
        }
    }
}

/// Workspace for [`restart`] with a basis of `n_local` rows.
///
/// Pass the locking driver that will be given to [`restart`], if any.
pub fn restart_scratch(
    params: &RestartParams,
    n_local: usize,
    locking: Option<&dyn LockingRestart>,
) -> StackReq {
    let m = params.max_basis_size;
    let driver = match locking {
        Some(driver) if params.locking => driver.scratch(params, n_local),
        _ => soft_locking_scratch(params, n_local),
    };
    StackReq::new::<usize>(m)
        .and(StackReq::new::<usize>(m))
        .and(
            dtr_scratch(m)
                .or(driver)
                .or(StackReq::new::<bool>(m))
                .or(restart_projection_scratch(params, n_local)),
        )
}

/// Restarts the search basis of a Davidson-type eigensolver.
///
/// On return `V[:, 0..restart_size]` and `W[:, 0..restart_size]` hold the restarted basis
/// and its image, the next block follows them, and the projected matrices, coefficient
/// vectors and bookkeeping in `state` describe the restarted basis. `state.basis_size` is
/// set to the restart size.
///
/// # Arguments
/// * `params`: Sizes and method choices of the solver.
/// * `state`: The basis, projected problem and bookkeeping to restart.
/// * `locking`: The driver used when `params.locking` is set.
/// * `stack`: Workspace of at least [`restart_scratch`].
///
/// # Errors
/// [`RestartErrorKind::InputError`] for inconsistent parameters or a locking configuration
/// without driver; otherwise the error of the failing stage, unchanged.
pub fn restart(
    params: &RestartParams,
    state: &mut RestartState<'_>,
    locking: Option<&mut dyn LockingRestart>,
    stack: &mut MemStack,
) -> Result<RestartOutcome, RestartError> {
    restart_impl(params, state, locking, stack).inspect_err(|e| {
        log::error!("Restart failed: {e}");
        for diagnostic in e.trace() {
            log::error!("  in {diagnostic}");
        }
    })
}

fn restart_impl(
    params: &RestartParams,
    state: &mut RestartState<'_>,
    locking: Option<&mut dyn LockingRestart>,
    stack: &mut MemStack,
) -> Result<RestartOutcome, RestartError> {
    params.validate().map_err(|e| e.pushed(Stage::Restart))?;
    let basis_size = state.basis_size;

    let policy = restart_size_policy(
        params,
        basis_size,
        state.num_locked,
        state.num_prev_retained,
    );
    log::debug!("Restarting a basis of {basis_size} columns: {policy:?}.");
    let restart_size = match policy {
        SizePolicy::FullSpace => {
            for flag in state.flags[..basis_size].iter_mut() {
                if state.num_converged >= params.num_evals {
                    break;
                }
                if flag.is_unconverged() {
                    *flag = ConvergenceFlag::Converged;
                    state.num_converged += 1;
                }
            }
            state.num_prev_retained = 0;
            basis_size
        }
        SizePolicy::NotFull => basis_size,
        SizePolicy::Dynamic { num_free } => dtr(
            params,
            state.num_locked,
            state.h_vecs.rb_mut().get_mut(0..basis_size, ..),
            state.h_vals,
            state.flags,
            basis_size,
            num_free,
            &state.block[..state.block_size],
            stack,
        ),
        SizePolicy::Thick { restart_size } => restart_size,
    };

    let mut rng = StdRng::seed_from_u64(params.seed);
    let m = params.max_basis_size;
    let (mut restart_perm, stack) = stack.make_with(m, |i| i);
    let (mut h_vecs_perm, stack) = stack.make_with(m, |i| i);
    let mut perms = RestartPermutations {
        restart_perm: &mut restart_perm,
        h_vecs_perm: &mut h_vecs_perm,
    };

    let layout = if params.locking {
        let driver = locking.ok_or_else(|| {
            RestartError::from(RestartErrorKind::InputError(
                "locking is enabled but no locking driver was supplied.".to_string(),
            ))
            .pushed(Stage::LockingDriver)
        })?;
        driver
            .restart(params, state, restart_size, &mut perms, &mut rng, stack)
            .map_err(|e| e.pushed(Stage::LockingDriver))?
    } else {
        restart_soft_locking(params, state, restart_size, &mut perms, &mut rng, stack)?
    };

    if !matches!(params.target, Target::Smallest | Target::Largest) {
        if let Some(prev_ritz_vals) = state.prev_ritz_vals.as_deref_mut() {
            let (mut marks, _) = stack.make_with(basis_size, |_| false);
            permute_values(prev_ritz_vals, &perms.restart_perm[..basis_size], &mut *marks);
            permute_values(
                prev_ritz_vals,
                &perms.h_vecs_perm[..layout.restart_size],
                &mut *marks,
            );
            state.num_prev_ritz_vals = layout.restart_size;
        }
    }

    restart_projection(params, state, &layout, &mut perms, &mut rng, stack)?;
    state.basis_size = layout.restart_size;
    log::debug!(
        "Restarted to {} columns ({} previous, next block {}).",
        layout.restart_size,
        layout.num_prev_retained,
        layout.block_size
    );
    Ok(layout.into())
}

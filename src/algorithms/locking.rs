//! The contract of a restart driver that locks converged pairs out of the basis.
//!
//! Locking moves converged Ritz vectors to an external store and keeps them out of the search
//! space. How that store is organised belongs to the outer solver, so the restart only defines
//! the interface a locking driver implements; [`crate::solvers::restart`] calls it in place of
//! [`super::soft_locking::restart_soft_locking`] when [`RestartParams::locking`] is set.

use crate::{
    algorithms::{DriverOutcome, RestartError, RestartPermutations, RestartState},
    config::RestartParams,
};
use faer::dyn_stack::{MemStack, StackReq};
use rand::rngs::StdRng;

/// A restart driver that removes converged pairs from the basis.
///
/// An implementation must leave the state in the same shape as the soft-locking driver: the
/// restarted basis in `V[:, 0..restart_size]` and `W[:, 0..restart_size]`, the next block in
/// the columns after it, `restart_perm` a bijection on the old basis and `h_vecs_perm` a
/// bijection on `[0, restart_size)`. The building blocks in [`crate::algorithms`] (basis
/// rebuild, coefficient-vector orthogonalization) are public so implementations can reuse them.
pub trait LockingRestart {
    /// Workspace the driver needs for a basis of `n_local` rows.
    fn scratch(&self, params: &RestartParams, n_local: usize) -> StackReq;

    /// Restarts the basis keeping `restart_size` current Ritz vectors.
    fn restart(
        &mut self,
        params: &RestartParams,
        state: &mut RestartState<'_>,
        restart_size: usize,
        perms: &mut RestartPermutations<'_>,
        rng: &mut StdRng,
        stack: &mut MemStack,
    ) -> Result<DriverOutcome, RestartError>;
}

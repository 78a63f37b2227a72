//! Restart of the Rayleigh-Ritz projection.
//!
//! After the basis rebuild every kept column is a Ritz vector, so the restarted `H = Vᵀ A V` is
//! diagonal with the Ritz values on the diagonal, except for the block coupling the retained
//! previous vectors. Only that block is computed and solved again.

use faer::mat::AsMatMut;
use crate::{
    algorithms::{
        DriverOutcome, RestartError, RestartErrorKind, RestartState, Stage,
        projected::ordered_eigen,
    },
    config::RestartParams,
    utils::{
        dense::{compute_submatrix, compute_submatrix_scratch},
        permute::{permute_columns, permute_columns_scratch, permute_values},
    },
};
use faer::{
    Side,
    dyn_stack::{MemStack, StackReq},
    linalg::{temp_mat_scratch, temp_mat_zeroed},
    prelude::*,
};

/// Workspace for [`restart_rr`].
pub fn restart_rr_scratch(max_basis_size: usize) -> StackReq {
    let m = max_basis_size;
    temp_mat_scratch::<f64>(m, m).and(compute_submatrix_scratch(m, m).or(permute_columns_scratch(m, m)))
}

/// Updates `H`, `h_vecs` and `h_vals` to the restarted basis.
///
/// `H` holds the full symmetric projection of the old basis on entry and of the restarted
/// basis on return. `h_vecs[0..rs, 0..rs]` becomes the eigenvectors of the restarted `H` and
/// the eigenpairs are finally gathered by `h_vecs_perm`.
///
/// # Errors
/// [`RestartErrorKind::InsertSubmatrix`] if the block of the retained previous vectors cannot
/// be solved, and [`RestartErrorKind::InputError`] without `H`.
pub fn restart_rr(
    params: &RestartParams,
    state: &mut RestartState<'_>,
    layout: &DriverOutcome,
    h_vecs_perm: &[usize],
    stack: &mut MemStack,
) -> Result<(), RestartError> {
    let basis_size = state.basis_size;
    let restart_size = layout.restart_size;
    let prev = layout.index_of_previous_vecs..layout.index_of_previous_vecs + layout.num_prev_retained;
    let Some(h) = state.h.as_mut() else {
        return Err(RestartError::from(RestartErrorKind::InputError(
            "Rayleigh-Ritz restart requires H.".to_string(),
        ))
        .pushed(Stage::InsertSubmatrix));
    };

    let (mut block, stack) = temp_mat_zeroed::<f64, _, _>(prev.len(), prev.len(), stack);
    let mut block = block.as_mat_mut();
    compute_submatrix(
        state.h_vecs.rb().get(0..basis_size, prev.clone()),
        (*h).rb().get(0..basis_size, 0..basis_size),
        block.rb_mut(),
        stack,
    );

    let mut restarted = h.rb_mut().get_mut(0..restart_size, 0..restart_size);
    for j in 0..restart_size {
        for i in 0..restart_size {
            restarted[(i, j)] = 0.0;
        }
        if !prev.contains(&j) {
            restarted[(j, j)] = state.h_vals[j];
        }
    }
    restarted
        .rb_mut()
        .get_mut(prev.clone(), prev.clone())
        .copy_from(block.rb());

    let mut vecs = state.h_vecs.rb_mut().get_mut(0..restart_size, 0..restart_size);
    for j in 0..restart_size {
        for i in 0..restart_size {
            vecs[(i, j)] = if i == j { 1.0 } else { 0.0 };
        }
    }
    if !prev.is_empty() {
        ordered_eigen(
            block.rb(),
            Side::Lower,
            params.target,
            params.target_shift(state.num_converged),
            vecs.rb_mut().get_mut(prev.clone(), prev.clone()),
            &mut state.h_vals[prev.clone()],
        )
        .map_err(|e| e.escalate(RestartErrorKind::InsertSubmatrix, Stage::InsertSubmatrix))?;
    }

    let perm = &h_vecs_perm[..restart_size];
    let (mut column, stack) = stack.make_with(restart_size, |_| 0.0f64);
    let (mut marks, _) = stack.make_with(restart_size, |_| false);
    permute_values(state.h_vals, perm, &mut *marks);
    permute_columns(vecs, perm, &mut *column, &mut *marks);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        algorithms::{ConvergenceFlag, ortho::{orthogonalize, orthogonalize_scratch}},
        operator::LocalSum,
    };
    use faer::{Mat, dyn_stack::MemBuffer};
    use rand::{Rng, SeedableRng, rngs::StdRng};

    #[test]
    fn test_restart_rr_solves_retained_block() {
        let mut rng = StdRng::seed_from_u64(42);
        let (n, m) = (5, 6);
        let a = Mat::from_fn(n, n, |_, _| rng.random::<f64>() - 0.5);
        let h_old = &a + a.transpose();
        let mut h = Mat::<f64>::zeros(m, m);
        h.as_mut().get_mut(0..n, 0..n).copy_from(h_old.as_ref());

        let mut h_vecs = Mat::from_fn(m, m, |_, _| rng.random::<f64>() - 0.5);
        let mut mem = MemBuffer::new(orthogonalize_scratch(n).or(restart_rr_scratch(m)));
        orthogonalize(h_vecs.as_mut().get_mut(0..n, ..), 0..n, &[], &LocalSum, &mut rng, MemStack::new(&mut mem))
            .unwrap();
        let p = h_vecs.as_ref().get(0..n, 1..3).to_owned();
        let expected_block = p.transpose() * &h_old * &p;

        let mut h_vals = vec![10.0, 20.0, 30.0, 40.0, 50.0, 0.0];
        let (mut v, mut w) = (Mat::<f64>::zeros(1, m), Mat::<f64>::zeros(1, m));
        let mut flags = vec![ConvergenceFlag::Unconverged; m];
        let no_previous = Mat::<f64>::zeros(n, 0);
        let (mut block, mut block_norms) = (vec![0; m], vec![0.0; m]);
        let params = RestartParams {
            n: 100,
            max_basis_size: m,
            min_restart_size: 3,
            ..Default::default()
        };
        let mut state = RestartState {
            v: v.as_mut(),
            w: w.as_mut(),
            basis_size: n,
            h: Some(h.as_mut()),
            h_vecs: h_vecs.as_mut(),
            h_vals: &mut h_vals,
            h_svals: None,
            flags: &mut flags,
            block: &mut block,
            block_size: 0,
            block_norms: &mut block_norms,
            evals: &[],
            res_norms: &[],
            num_converged: 0,
            num_locked: 0,
            previous_h_vecs: no_previous.as_ref(),
            num_prev_retained: 2,
            num_arbitrary_vecs: 0,
            prev_ritz_vals: None,
            num_prev_ritz_vals: 0,
            qr: None,
            skew: None,
            reduce: &LocalSum,
        };
        let layout = DriverOutcome {
            restart_size: 4,
            num_prev_retained: 2,
            index_of_previous_vecs: 1,
            block_size: 0,
        };
        restart_rr(&params, &mut state, &layout, &[3, 0, 1, 2], MemStack::new(&mut mem)).unwrap();
        drop(state);

        let restarted = h.as_ref().get(0..4, 0..4);
        assert!((restarted.get(1..3, 1..3) - &expected_block).norm_l2() < 1e-12);
        assert_eq!(restarted[(0, 0)], 10.0);
        assert_eq!(restarted[(3, 3)], 40.0);
        assert_eq!(restarted[(0, 1)], 0.0);
        assert_eq!(restarted[(2, 3)], 0.0);

        // Gathered by [3, 0, 1, 2]: the pair of column 3 comes first.
        assert_eq!(h_vals[0], 40.0);
        assert_eq!(h_vals[1], 10.0);
        assert!(h_vals[2] <= h_vals[3]);
        let vecs = h_vecs.as_ref().get(0..4, 0..4);
        let diag = Mat::from_fn(4, 4, |i, j| if i == j { h_vals[i] } else { 0.0 });
        assert!((restarted * vecs - vecs * &diag).norm_l2() < 1e-12);
        assert!((vecs.transpose() * vecs - Mat::<f64>::identity(4, 4)).norm_l2() < 1e-12);
    }
}

//! Orthogonalization of basis and coefficient vectors.
//!
//! [`orthogonalize`] is classical Gram-Schmidt with DGKS re-orthogonalization. The partial
//! inner products of every pass are reduced through [`GlobalSum`], so the same routine serves
//! a distributed tall basis and the small, replicated coefficient matrices. A column that
//! cancels out completely is replaced by a random vector and orthogonalized again.
//!
//! [`ortho_coefficient_vectors`] splices the coefficient vectors kept from the previous
//! iteration into the restarted coefficient matrix.

use crate::{
    algorithms::{RestartError, RestartErrorKind, Stage},
    operator::GlobalSum,
    utils::permute::{permute_columns, permute_columns_scratch},
};
use faer::{
    MatMut, MatRef, Par,
    dyn_stack::{MemStack, StackReq},
    linalg::triangular_solve::solve_upper_triangular_in_place,
    prelude::*,
};
use rand::{Rng, rngs::StdRng};
use std::ops::Range;

/// Gram-Schmidt passes per column before it is declared dependent.
const MAX_PASSES: usize = 3;
/// A pass that keeps more than this fraction of the norm ends the column.
const DGKS_FACTOR: f64 = 0.75;
/// A column whose norm drops below this fraction of its starting norm is dependent.
const DEPENDENCE_TOL: f64 = 1e-10;
/// Random replacements tried for a dependent column before giving up.
pub const MAX_RANDOM_ATTEMPTS: usize = 3;

/// Workspace for [`orthogonalize`] when at most `ncols` columns are involved in total.
pub fn orthogonalize_scratch(ncols: usize) -> StackReq {
    StackReq::new::<f64>(ncols)
}

/// Orthonormalizes the columns `targets` of `basis` against the columns listed in `against`
/// and against each other.
///
/// The columns in `against` must already be orthonormal; they are read, never written.
///
/// # Errors
/// [`RestartErrorKind::Orthogonalization`] if a column is still dependent after
/// [`MAX_RANDOM_ATTEMPTS`] random replacements.
pub fn orthogonalize(
    mut basis: MatMut<'_, f64>,
    targets: Range<usize>,
    against: &[Range<usize>],
    reduce: &dyn GlobalSum,
    rng: &mut StdRng,
    stack: &mut MemStack,
) -> Result<(), RestartError> {
    let nrows = basis.nrows();
    let num_against: usize = against.iter().map(|r| r.len()).sum();
    let (mut coeffs, _) = stack.make_with(num_against + targets.len(), |_| 0.0f64);
    let coeffs = &mut *coeffs;

    for j in targets.clone() {
        let previous = || against.iter().cloned().flatten().chain(targets.start..j);
        let mut attempts = 0;

        'column: loop {
            let initial = column_norm(basis.rb(), j, reduce);
            let mut norm = initial;

            for _ in 0..MAX_PASSES {
                let mut count = 0;
                for k in previous() {
                    coeffs[count] = basis.rb().col(k).transpose() * basis.rb().col(j);
                    count += 1;
                }
                reduce.global_sum(&mut coeffs[..count]);

                for (&c, k) in coeffs[..count].iter().zip(previous()) {
                    for r in 0..nrows {
                        let value = basis[(r, k)];
                        basis[(r, j)] -= c * value;
                    }
                }

                let new_norm = column_norm(basis.rb(), j, reduce);
                if new_norm <= DEPENDENCE_TOL * initial {
                    break;
                }
                if new_norm > DGKS_FACTOR * norm {
                    let scale = new_norm.recip();
                    for r in 0..nrows {
                        basis[(r, j)] *= scale;
                    }
                    break 'column;
                }
                norm = new_norm;
            }

            if attempts == MAX_RANDOM_ATTEMPTS {
                return Err(RestartError::from(RestartErrorKind::Orthogonalization {
                    column: j,
                    attempts,
                })
                .pushed(Stage::Orthogonalize));
            }
            attempts += 1;
            log::debug!("Column {j} is numerically dependent, trying random replacement {attempts}.");
            for r in 0..nrows {
                basis[(r, j)] = rng.random::<f64>() - 0.5;
            }
        }
    }

    Ok(())
}

fn column_norm(basis: MatRef<'_, f64>, j: usize, reduce: &dyn GlobalSum) -> f64 {
    let local = basis.col(j).norm_l2();
    let mut sum = [local * local];
    reduce.global_sum(&mut sum);
    sum[0].sqrt()
}

/// The left singular vectors and triangular factor needed to orthogonalize retained
/// coefficient vectors under harmonic extraction.
pub struct HarmonicFactors<'a> {
    /// Left singular vectors of `r`, reordered by `restart_perm` on return.
    pub h_u: MatMut<'a, f64>,
    /// Upper triangular factor of the shifted basis.
    pub r: MatRef<'a, f64>,
    pub restart_perm: &'a [usize],
}

/// Workspace for [`ortho_coefficient_vectors`].
pub fn ortho_coefficient_vectors_scratch(basis_size: usize, restart_size: usize) -> StackReq {
    orthogonalize_scratch(restart_size).or(permute_columns_scratch(
        basis_size,
        basis_size.max(restart_size),
    ))
}

/// Orthonormalizes the retained previous vectors `h_vecs[:, first..first + num_prev]` against
/// the other columns of the restarted coefficient matrix `h_vecs[:, 0..restart_size]`.
///
/// `h_vecs` holds exactly `basis_size` rows. Under harmonic extraction the vectors are first
/// orthogonalized in the left singular basis `h_u` and mapped back through `R⁻¹`, so that
/// `R h_vecs` stays orthogonal as well.
#[allow(clippy::too_many_arguments)]
pub fn ortho_coefficient_vectors(
    mut h_vecs: MatMut<'_, f64>,
    first: usize,
    num_prev: usize,
    restart_size: usize,
    harmonic: Option<HarmonicFactors<'_>>,
    reduce: &dyn GlobalSum,
    rng: &mut StdRng,
    stack: &mut MemStack,
) -> Result<(), RestartError> {
    if num_prev == 0 {
        return Ok(());
    }
    let basis_size = h_vecs.nrows();
    let prev = first..first + num_prev;
    let others = [0..first, prev.end..restart_size];

    if let Some(HarmonicFactors {
        mut h_u,
        r,
        restart_perm,
    }) = harmonic
    {
        {
            let (mut column, stack) = stack.make_with(basis_size, |_| 0.0f64);
            let (mut marks, _) = stack.make_with(restart_perm.len(), |_| false);
            permute_columns(
                h_u.rb_mut().get_mut(0..basis_size, ..),
                restart_perm,
                &mut *column,
                &mut *marks,
            );
        }
        h_u.rb_mut()
            .get_mut(0..basis_size, prev.clone())
            .copy_from(h_vecs.rb().get(.., prev.clone()));
        orthogonalize(
            h_u.rb_mut().get_mut(0..basis_size, ..),
            prev.clone(),
            &others,
            reduce,
            rng,
            stack,
        )?;
        let mut block = h_vecs.rb_mut().get_mut(.., prev.clone());
        block.copy_from(h_u.rb().get(0..basis_size, prev.clone()));
        solve_upper_triangular_in_place(
            r.get(0..basis_size, 0..basis_size),
            block,
            Par::Seq,
        );
    }

    orthogonalize(h_vecs, prev, &others, reduce, rng, stack)
}

//! Dynamic thick restart.
//!
//! Instead of a fixed restart size, keep `l` Ritz pairs from the wanted end of the spectrum and
//! `r` from the other end, choosing `(l, r)` to maximize an estimate of the convergence rate of
//! the next cycle:
//!
//! ```text
//!     (basis_size - l - r) * sqrt((θ_cur - θ_{l+1}) / (θ_{l+1} - θ_{basis_size-1-r}))
//! ```
//!
//! where `θ_cur` is the Ritz value currently targeted by the block. Only splits leaving a
//! multiple of the block size free are considered.

use crate::{
    algorithms::ConvergenceFlag,
    config::RestartParams,
    utils::permute::{permute_columns, permute_columns_scratch, permute_values},
};
use faer::{
    MatMut,
    dyn_stack::{MemStack, StackReq},
};

/// Workspace for [`dtr`].
pub fn dtr_scratch(basis_size: usize) -> StackReq {
    permute_columns_scratch(basis_size, basis_size).and(StackReq::new::<usize>(basis_size))
}

/// Chooses the restart size with the dynamic thick restart heuristic and moves the retained
/// pairs to the front.
///
/// On return the first `l` columns of `h_vecs` (and entries of `h_vals`) are the leading pairs,
/// the next `r` are the trailing ones and the discarded middle follows. At least `num_free`
/// columns are left free. Every flag is reset to unconverged. Returns `l + r`.
#[allow(clippy::too_many_arguments)]
pub fn dtr(
    params: &RestartParams,
    num_locked: usize,
    h_vecs: MatMut<'_, f64>,
    h_vals: &mut [f64],
    flags: &mut [ConvergenceFlag],
    basis_size: usize,
    num_free: usize,
    block: &[usize],
    stack: &mut MemStack,
) -> usize {
    debug_assert!(num_free >= 1);
    let current = h_vals[block.first().copied().unwrap_or(0)];
    let max_index = basis_size - 1;

    let mut l_min = basis_size.min(params.min_restart_size);
    if params.locking {
        // Keep every converged target that has not been locked yet.
        let last_converged = (0..basis_size)
            .filter(|&l| !flags[l].is_unconverged() && num_locked + l < params.num_evals)
            .last()
            .unwrap_or(0);
        l_min = l_min.max(last_converged);
    }

    let (mut l_opt, mut r_opt) = (l_min, 0);
    let mut opt_val = 0.0;
    for l in l_min..basis_size.saturating_sub(num_free) {
        for r in 0..basis_size - l - num_free {
            let free = basis_size - l - r;
            if free % params.max_block_size != 0 {
                continue;
            }
            let value = free as f64
                * ((current - h_vals[l + 1]) / (h_vals[l + 1] - h_vals[max_index - r])).sqrt();
            if value > opt_val {
                opt_val = value;
                l_opt = l;
                r_opt = r;
            }
        }
    }
    let restart_size = l_opt + r_opt;
    log::debug!("DTR keeps l = {l_opt}, r = {r_opt} of {basis_size} columns.");

    // [0..l) stays, [basis_size - r, basis_size) follows, the middle goes last.
    let (mut perm, stack) = stack.make_with(basis_size, |i| i);
    let perm = &mut *perm;
    for (p, i) in perm[l_opt..]
        .iter_mut()
        .zip((basis_size - r_opt..basis_size).chain(l_opt..basis_size - r_opt))
    {
        *p = i;
    }
    let (mut column, stack) = stack.make_with(h_vecs.nrows(), |_| 0.0f64);
    let (mut marks, _) = stack.make_with(basis_size, |_| false);
    permute_columns(h_vecs, perm, &mut *column, &mut *marks);
    permute_values(h_vals, perm, &mut *marks);

    flags.fill(ConvergenceFlag::Unconverged);
    restart_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::{Mat, dyn_stack::MemBuffer};

    fn params(max_block_size: usize, locking: bool) -> RestartParams {
        RestartParams {
            n: 1000,
            num_evals: 3,
            max_basis_size: 12,
            min_restart_size: 3,
            max_block_size,
            locking,
            ..Default::default()
        }
    }

    fn spectrum() -> Vec<f64> {
        // Two clustered wanted values, a gap, then a slowly increasing tail.
        vec![0.1, 0.11, 1.0, 1.1, 1.2, 1.3, 1.4, 1.5, 1.6, 3.0, 6.0, 10.0]
    }

    fn brute_force(p: &RestartParams, vals: &[f64], num_free: usize) -> (usize, usize) {
        let bs = vals.len();
        let l_min = bs.min(p.min_restart_size);
        let mut best = (l_min, 0, 0.0);
        for l in l_min..bs - num_free {
            for r in 0..bs - l - num_free {
                if (bs - l - r) % p.max_block_size == 0 {
                    let v = (bs - l - r) as f64
                        * ((vals[0] - vals[l + 1]) / (vals[l + 1] - vals[bs - 1 - r])).sqrt();
                    if v > best.2 {
                        best = (l, r, v);
                    }
                }
            }
        }
        (best.0, best.1)
    }

    fn run(p: &RestartParams, flags: &mut [ConvergenceFlag], num_free: usize) -> (usize, Mat<f64>, Vec<f64>) {
        let mut vals = spectrum();
        let bs = vals.len();
        let mut h_vecs = Mat::from_fn(bs, bs, |i, j| (i * bs + j) as f64);
        let mut mem = MemBuffer::new(dtr_scratch(bs));
        let size = dtr(
            p,
            0,
            h_vecs.as_mut(),
            &mut vals,
            flags,
            bs,
            num_free,
            &[0],
            MemStack::new(&mut mem),
        );
        (size, h_vecs, vals)
    }

    #[test]
    fn test_dtr_matches_exhaustive_search() {
        for max_block_size in [1, 2, 3] {
            let p = params(max_block_size, false);
            let mut flags = [ConvergenceFlag::Unconverged; 12];
            let (size, h_vecs, vals) = run(&p, &mut flags, 3);
            let (l, r) = brute_force(&p, &spectrum(), 3);

            assert_eq!(size, l + r);
            assert!(size <= 12 - 3);
            assert_eq!((12 - size) % max_block_size, 0);
            let original = spectrum();
            assert_eq!(&vals[..l], &original[..l]);
            assert_eq!(&vals[l..size], &original[12 - r..]);
            // Column j of the original h_vecs has entries i * 12 + j.
            for k in 0..r {
                assert_eq!(h_vecs[(0, l + k)], (12 - r + k) as f64);
            }
        }
    }

    #[test]
    fn test_dtr_resets_flags() {
        let p = params(1, false);
        let mut flags = [ConvergenceFlag::Converged; 12];
        run(&p, &mut flags, 3);
        assert!(flags.iter().all(|f| f.is_unconverged()));
    }

    #[test]
    fn test_dtr_keeps_converged_targets_when_locking() {
        let p = RestartParams {
            num_evals: 8,
            ..params(1, true)
        };
        let mut flags = [ConvergenceFlag::Unconverged; 12];
        flags[6] = ConvergenceFlag::Converged;
        let (size, _, _) = run(&p, &mut flags, 3);
        assert!(size >= 6);
    }

    #[test]
    fn test_dtr_without_room_keeps_minimum() {
        let p = params(1, false);
        let mut flags = [ConvergenceFlag::Unconverged; 12];
        let (size, _, vals) = run(&p, &mut flags, 12);
        assert_eq!(size, 3);
        assert_eq!(vals, spectrum());
    }
}

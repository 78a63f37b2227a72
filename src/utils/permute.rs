//! Permutation utilities.
//!
//! Every permutation in the crate is a *gather*: applying `perm` to a vector or to the
//! columns of a matrix produces a new entry `i` equal to the old entry `perm[i]`. The
//! routines work in place by following the cycles of `perm`, so they only need one column
//! of scratch plus one mark per entry. Both buffers are supplied by the caller.

use faer::{MatMut, dyn_stack::StackReq};

/// Workspace for [`permute_columns`] on a matrix with `nrows` rows and `ncols` columns.
pub fn permute_columns_scratch(nrows: usize, ncols: usize) -> StackReq {
    StackReq::new::<f64>(nrows).and(StackReq::new::<bool>(ncols))
}

/// Returns `true` if `perm` is a bijection on `[0, perm.len())`.
pub fn is_permutation(perm: &[usize]) -> bool {
    let mut seen = vec![false; perm.len()];
    perm.iter().all(|&p| {
        if p >= seen.len() || seen[p] {
            return false;
        }
        seen[p] = true;
        true
    })
}

/// Writes the inverse of `perm` into `inverse`.
pub fn invert_permutation(perm: &[usize], inverse: &mut [usize]) {
    debug_assert_eq!(perm.len(), inverse.len());
    for (i, &p) in perm.iter().enumerate() {
        inverse[p] = i;
    }
}

/// Gathers `values` in place: the new `values[i]` is the old `values[perm[i]]`.
///
/// `marks` must hold at least `perm.len()` entries; its contents are overwritten.
pub fn permute_values<T: Copy>(values: &mut [T], perm: &[usize], marks: &mut [bool]) {
    let n = perm.len();
    debug_assert!(values.len() >= n && marks.len() >= n);
    debug_assert!(is_permutation(perm));
    marks[..n].fill(false);

    for start in 0..n {
        if marks[start] {
            continue;
        }
        marks[start] = true;
        if perm[start] == start {
            continue;
        }
        let saved = values[start];
        let mut dst = start;
        loop {
            let src = perm[dst];
            if src == start {
                values[dst] = saved;
                break;
            }
            values[dst] = values[src];
            marks[src] = true;
            dst = src;
        }
    }
}

/// Gathers the first `perm.len()` columns of `mat` in place: the new column `i` is the old
/// column `perm[i]`.
///
/// `column` must hold at least `mat.nrows()` entries and `marks` at least `perm.len()`.
pub fn permute_columns(
    mut mat: MatMut<'_, f64>,
    perm: &[usize],
    column: &mut [f64],
    marks: &mut [bool],
) {
    let n = perm.len();
    let m = mat.nrows();
    debug_assert!(mat.ncols() >= n && column.len() >= m && marks.len() >= n);
    debug_assert!(is_permutation(perm));
    marks[..n].fill(false);

    for start in 0..n {
        if marks[start] {
            continue;
        }
        marks[start] = true;
        if perm[start] == start {
            continue;
        }
        for (r, slot) in column[..m].iter_mut().enumerate() {
            *slot = mat[(r, start)];
        }
        let mut dst = start;
        loop {
            let src = perm[dst];
            if src == start {
                for (r, &value) in column[..m].iter().enumerate() {
                    mat[(r, dst)] = value;
                }
                break;
            }
            for r in 0..m {
                let value = mat[(r, src)];
                mat[(r, dst)] = value;
            }
            marks[src] = true;
            dst = src;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::Mat;
    use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

    #[test]
    fn test_permute_values_gathers() {
        let mut values = [10.0, 11.0, 12.0, 13.0, 14.0];
        let perm = [3, 0, 4, 1, 2];
        let mut marks = [false; 5];
        permute_values(&mut values, &perm, &mut marks);
        assert_eq!(values, [13.0, 10.0, 14.0, 11.0, 12.0]);
    }

    #[test]
    fn test_permute_values_prefix_only() {
        let mut values = [1, 2, 3, 4];
        let mut marks = [false; 2];
        permute_values(&mut values, &[1, 0], &mut marks);
        assert_eq!(values, [2, 1, 3, 4]);
    }

    #[test]
    fn test_permute_columns_matches_reference() {
        let mut rng = StdRng::seed_from_u64(42);
        for n in [1usize, 2, 5, 9] {
            let mut perm: Vec<usize> = (0..n).collect();
            perm.shuffle(&mut rng);
            let original = Mat::from_fn(4, n + 1, |i, j| (10 * j + i) as f64);
            let mut mat = original.clone();
            let mut column = vec![0.0; 4];
            let mut marks = vec![false; n];
            permute_columns(mat.as_mut(), &perm, &mut column, &mut marks);
            for (j, &p) in perm.iter().enumerate() {
                for i in 0..4 {
                    assert_eq!(mat[(i, j)], original[(i, p)]);
                }
            }
            // Columns past the permutation are untouched.
            for i in 0..4 {
                assert_eq!(mat[(i, n)], original[(i, n)]);
            }
        }
    }

    #[test]
    fn test_inverse_undoes_permutation() {
        let perm = [2, 0, 3, 1];
        let mut inverse = [0; 4];
        invert_permutation(&perm, &mut inverse);
        assert_eq!(inverse, [1, 3, 0, 2]);

        let mut values = [5, 6, 7, 8];
        let mut marks = [false; 4];
        permute_values(&mut values, &perm, &mut marks);
        permute_values(&mut values, &inverse, &mut marks);
        assert_eq!(values, [5, 6, 7, 8]);
    }

    #[test]
    fn test_is_permutation() {
        assert!(is_permutation(&[]));
        assert!(is_permutation(&[1, 2, 0]));
        assert!(!is_permutation(&[1, 1, 0]));
        assert!(!is_permutation(&[0, 3, 1]));
    }
}

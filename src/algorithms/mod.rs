//! Building blocks of the restart.
//!
//! ** NOTE: We recommend using the high-level method [`crate::solvers::restart`] instead.
//! The functions in these modules are public for solvers that need to drive individual
//! stages themselves (for instance a custom locking driver reusing the basis rebuild).
//!
//! All of them operate on caller-owned storage. The per-call view of that storage is
//! [`RestartState`]: it borrows the basis, the projected matrices and the bookkeeping arrays
//! for exactly one restart and owns nothing. Temporaries are carved from a
//! [`faer::dyn_stack::MemStack`] sized by the `*_scratch` companion of each function.
//!
//! - [`soft_locking`]: chooses the surviving columns and their order while converged
//!   vectors stay in the basis.
//! - [`locking`]: the contract a locking driver has to honor.
//! - [`dtr`]: dynamic thick restart sizing.
//! - [`rebuild`]: recombines V and W and extracts the next block and its residuals.
//! - [`ortho`]: orthogonalization of basis or coefficient vectors.
//! - [`projection`]: regenerates the projected matrices after the basis changed, through
//!   [`rayleigh_ritz`] or [`refined`].
//! - [`projected`]: dense solves of the small projected problem.

pub mod dtr;
pub mod locking;
pub mod ortho;
pub mod projected;
pub mod projection;
pub mod rayleigh_ritz;
pub mod rebuild;
pub mod refined;
pub mod soft_locking;

pub use crate::error::{RestartError, RestartErrorKind, Stage};

use crate::operator::{GlobalSum, Preconditioner};
use faer::{MatMut, MatRef};

/// Convergence state of one Ritz pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConvergenceFlag {
    #[default]
    Unconverged,
    Converged,
    /// Converged as far as the attainable accuracy allows.
    PracticallyConverged,
    /// Moved to the locked store.
    Locked,
}

impl ConvergenceFlag {
    #[inline]
    pub fn is_unconverged(self) -> bool {
        self == ConvergenceFlag::Unconverged
    }
}

/// The QR structure of the shifted basis used by refined and harmonic extraction.
///
/// `Q R = W - σ V` for the active target shift σ; `h_u` holds the left singular vectors of
/// `R` (in refined mode) and `qv = Qᵀ V` is only kept by harmonic extraction.
pub struct QrFactors<'a> {
    /// `n_local × max_basis_size`.
    pub q: MatMut<'a, f64>,
    /// `max_basis_size × max_basis_size`, upper triangular.
    pub r: MatMut<'a, f64>,
    /// `max_basis_size × max_basis_size`.
    pub qv: Option<MatMut<'a, f64>>,
    /// `max_basis_size × max_basis_size`.
    pub h_u: MatMut<'a, f64>,
    /// Index of the shift `q` and `r` were computed for; `None` before the first
    /// factorization.
    pub target_shift_index: Option<usize>,
}

/// Bookkeeping for skew projections with locked eigenvectors.
pub struct SkewProjection<'a> {
    /// Orthogonal constraints followed by converged eigenvectors, `n_local × (noc + num_evals)`.
    pub evecs: MatMut<'a, f64>,
    /// The preconditioned `evecs`.
    pub evecs_hat: MatMut<'a, f64>,
    /// `M = evecsᵀ evecs_hat`.
    pub m: MatMut<'a, f64>,
    /// `M = L D Lᵀ`: unit lower `L` below the diagonal, `D` on the diagonal.
    pub ldlt: MatMut<'a, f64>,
    /// Number of eigenvectors currently stored after the constraints.
    pub num_stored: usize,
    pub preconditioner: &'a dyn Preconditioner,
}

/// Everything one restart reads and rewrites.
pub struct RestartState<'a> {
    /// Search basis, `n_local × max_basis_size`.
    pub v: MatMut<'a, f64>,
    /// `A V`, same shape as `v`.
    pub w: MatMut<'a, f64>,
    pub basis_size: usize,
    /// Rayleigh quotient matrix `Vᵀ A V`, `max_basis_size × max_basis_size`.
    pub h: Option<MatMut<'a, f64>>,
    /// Coefficient vectors of the Ritz (or refined, harmonic) vectors.
    pub h_vecs: MatMut<'a, f64>,
    pub h_vals: &'a mut [f64],
    /// Singular values of `R` for refined and harmonic extraction.
    pub h_svals: Option<&'a mut [f64]>,
    pub flags: &'a mut [ConvergenceFlag],
    /// Indices of the pairs targeted by the next block.
    pub block: &'a mut [usize],
    pub block_size: usize,
    /// Residual norms of the next block, written by the basis rebuild.
    pub block_norms: &'a mut [f64],
    /// Ritz values recorded when the first `num_evals` pairs converged.
    pub evals: &'a [f64],
    /// Residual norms recorded with `evals`.
    pub res_norms: &'a [f64],
    pub num_converged: usize,
    pub num_locked: usize,
    /// Coefficient vectors kept from the previous iteration, zero padded to `basis_size`
    /// rows.
    pub previous_h_vecs: MatRef<'a, f64>,
    pub num_prev_retained: usize,
    /// Number of leading pairs that are not exact refined vectors.
    pub num_arbitrary_vecs: usize,
    pub prev_ritz_vals: Option<&'a mut [f64]>,
    pub num_prev_ritz_vals: usize,
    pub qr: Option<QrFactors<'a>>,
    pub skew: Option<SkewProjection<'a>>,
    pub reduce: &'a dyn GlobalSum,
}

/// The two permutations a restart driver produces.
pub struct RestartPermutations<'a> {
    /// `restart_perm[new] = old`: the column of the old basis that lands at `new`.
    pub restart_perm: &'a mut [usize],
    /// Reorders the restarted pairs back into the target ordering.
    pub h_vecs_perm: &'a mut [usize],
}

/// Sizes chosen by a restart driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverOutcome {
    /// Number of columns of the restarted basis, previous vectors included.
    pub restart_size: usize,
    pub num_prev_retained: usize,
    /// First column of the retained previous vectors in the restarted basis.
    pub index_of_previous_vecs: usize,
    /// Size of the block extracted after the restarted basis.
    pub block_size: usize,
}

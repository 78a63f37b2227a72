//! Restarting the search basis of Davidson-type eigensolvers.
//!
//! A Davidson-type method grows an orthonormal basis `V`, keeps `W = A V` and solves a small
//! projected eigenproblem on it. When the basis reaches its maximum size it must be
//! *restarted*: shrunk to a few well-chosen vectors while keeping every quantity the next
//! iteration relies on consistent. This crate implements that restart:
//!
//! - thick restart, keeping the Ritz pairs closest to the target, or dynamic thick restart,
//!   which also keeps pairs from the unwanted end of the spectrum when that is predicted to
//!   converge faster;
//! - retention of coefficient vectors from the previous iteration (the "+k" of GD+k and
//!   JDQMR), orthogonalized against the kept Ritz vectors;
//! - soft locking, where converged pairs stay in the basis, or a caller-supplied locking
//!   driver;
//! - Rayleigh-Ritz, refined and harmonic extraction, including the incremental update of the
//!   QR factorization `Q R = W - σ V` the latter two depend on;
//! - skew projections with converged eigenvectors for Jacobi-Davidson-type correction
//!   equations.
//!
//! The operator itself is never applied. All the storage belongs to the caller and is
//! borrowed through [`algorithms::RestartState`]; temporaries come from a
//! [`faer::dyn_stack::MemStack`] sized by [`restart_scratch`].
//!
//! ## Example Usage
//!
//! ```rust
//! use davidson_restart::{
//!     ConvergenceFlag, RestartParams, RestartState, restart, restart_scratch,
//!     operator::LocalSum,
//! };
//! use faer::{Mat, dyn_stack::{MemBuffer, MemStack}};
//!
//! // A diagonal operator and the first 6 unit vectors as the basis.
//! let (n, m) = (50, 6);
//! let mut v = Mat::<f64>::from_fn(n, m, |i, j| if i == j { 1.0 } else { 0.0 });
//! let mut w = Mat::<f64>::from_fn(n, m, |i, j| if i == j { (i + 1) as f64 } else { 0.0 });
//! let mut h = Mat::<f64>::from_fn(m, m, |i, j| if i == j { (i + 1) as f64 } else { 0.0 });
//! let mut h_vecs = Mat::<f64>::identity(m, m);
//! let mut h_vals: Vec<f64> = (1..=m).map(|x| x as f64).collect();
//! let mut flags = vec![ConvergenceFlag::Unconverged; m];
//! let (mut block, mut block_norms) = (vec![0; m], vec![0.0; m]);
//! let no_previous = Mat::<f64>::zeros(m, 0);
//!
//! let params = RestartParams {
//!     n,
//!     num_evals: 1,
//!     max_basis_size: m,
//!     min_restart_size: 3,
//!     max_block_size: 1,
//!     ..Default::default()
//! };
//! let mut state = RestartState {
//!     v: v.as_mut(),
//!     w: w.as_mut(),
//!     basis_size: m,
//!     h: Some(h.as_mut()),
//!     h_vecs: h_vecs.as_mut(),
//!     h_vals: &mut h_vals,
//!     h_svals: None,
//!     flags: &mut flags,
//!     block: &mut block,
//!     block_size: 0,
//!     block_norms: &mut block_norms,
//!     evals: &[],
//!     res_norms: &[],
//!     num_converged: 0,
//!     num_locked: 0,
//!     previous_h_vecs: no_previous.as_ref(),
//!     num_prev_retained: 0,
//!     num_arbitrary_vecs: 0,
//!     prev_ritz_vals: None,
//!     num_prev_ritz_vals: 0,
//!     qr: None,
//!     skew: None,
//!     reduce: &LocalSum,
//! };
//!
//! let mut mem = MemBuffer::new(restart_scratch(&params, n, None));
//! let outcome = restart(&params, &mut state, None, MemStack::new(&mut mem)).unwrap();
//!
//! // Three pairs survive and the residual of the first one forms the next block.
//! assert_eq!(outcome.restart_size, 3);
//! assert_eq!(outcome.block_size, 1);
//! assert_eq!(state.basis_size, 3);
//! assert_eq!(state.block[0], 0);
//! ```
//!
//! ## Distributed bases
//!
//! The rows of `V` may be distributed across processes. Every inner product is reduced
//! through the [`operator::GlobalSum`] the caller puts in the state; dense projected
//! quantities are replicated.

pub mod algorithms;
pub mod config;
pub mod error;
pub mod operator;
pub mod solvers;
pub mod utils;

pub use algorithms::{ConvergenceFlag, QrFactors, RestartState, SkewProjection};
pub use config::{Projection, RestartParams, RestartScheme, Target};
pub use error::{RestartError, RestartErrorKind};
pub use solvers::{RestartOutcome, SizePolicy, restart, restart_scratch, restart_size_policy};

//! Configuration of the restart subsystem.
//!
//! [`RestartParams`] gathers every externally chosen setting the restart has to honor:
//! problem and basis dimensions, the extraction method ([`Projection`]), the eigenvalue
//! ordering ([`Target`]), whether converged pairs are locked out of the basis, and the
//! restart-size scheme. The struct is `serde`-enabled so an outer solver can load it from
//! any format it likes; missing fields take the values of [`RestartParams::default`].

use crate::error::{RestartError, RestartErrorKind};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// How approximate eigenpairs are extracted from the search space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Projection {
    /// Standard Rayleigh-Ritz on H = Vᵀ A V.
    #[default]
    RayleighRitz,
    /// Refined vectors minimizing the residual through the SVD of R, with Q R = (A - σI) V.
    Refined,
    /// Harmonic Ritz vectors for interior eigenvalues.
    Harmonic,
}

/// Which eigenvalues are wanted, and therefore how Ritz pairs are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    #[default]
    Smallest,
    Largest,
    /// Closest to the shift from above.
    ClosestGeq,
    /// Closest to the shift from below.
    ClosestLeq,
    /// Closest to the shift in absolute distance.
    ClosestAbs,
    /// Farthest from the shift.
    LargestAbs,
}

impl Target {
    /// Targets defined relative to a shift.
    pub fn needs_shift(self) -> bool {
        !matches!(self, Target::Smallest | Target::Largest)
    }
}

/// How the restart size is chosen once the basis is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RestartScheme {
    /// Keep `min_restart_size` vectors.
    #[default]
    Thick,
    /// Choose low and high retention with the dynamic thick restart heuristic.
    Dynamic,
}

/// Settings of the restart subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartParams {
    /// Global dimension of the problem.
    pub n: usize,
    /// Number of wanted eigenpairs.
    pub num_evals: usize,
    /// Column capacity of V, W and the projected matrices.
    pub max_basis_size: usize,
    /// Restart size used by the thick scheme.
    pub min_restart_size: usize,
    /// Largest block of new directions added per iteration.
    pub max_block_size: usize,
    pub scheme: RestartScheme,
    /// Converged pairs leave the basis for a locked store.
    pub locking: bool,
    pub projection: Projection,
    pub target: Target,
    /// Shifts for interior targets; the i-th converged pair moves on to shift i + 1.
    pub target_shifts: Vec<f64>,
    /// Number of external orthogonality constraints stored ahead of the eigenvectors.
    pub num_ortho_const: usize,
    /// Estimate of the operator norm; non-positive means "estimate from the Ritz values".
    pub a_norm: f64,
    /// Requested relative residual tolerance.
    pub eps: f64,
    /// Seed for the random vectors that replace dependent columns.
    pub seed: u64,
}

impl Default for RestartParams {
    fn default() -> Self {
        Self {
            n: 0,
            num_evals: 1,
            max_basis_size: 20,
            min_restart_size: 8,
            max_block_size: 1,
            scheme: RestartScheme::Thick,
            locking: false,
            projection: Projection::RayleighRitz,
            target: Target::Smallest,
            target_shifts: Vec::new(),
            num_ortho_const: 0,
            a_norm: 0.0,
            eps: 1e-12,
            seed: 42,
        }
    }
}

impl RestartParams {
    /// Checks that the settings are mutually consistent.
    pub fn validate(&self) -> Result<(), RestartError> {
        let fail = |msg: &str| -> Result<(), RestartError> {
            Err(RestartErrorKind::InputError(msg.to_string()).into())
        };

        if self.max_basis_size < 2 {
            return fail("`max_basis_size` must be at least 2.");
        }
        if self.max_block_size == 0 || self.max_block_size >= self.max_basis_size {
            return fail("`max_block_size` must be in [1, max_basis_size).");
        }
        if self.min_restart_size == 0 || self.min_restart_size >= self.max_basis_size {
            return fail("`min_restart_size` must be in [1, max_basis_size).");
        }
        if self.num_evals == 0 || (self.n > 0 && self.num_evals > self.n) {
            return fail("`num_evals` must be in [1, n].");
        }
        if self.target.needs_shift() && self.target_shifts.is_empty() {
            return fail("interior targets need at least one target shift.");
        }
        if self.projection != Projection::RayleighRitz && self.target_shifts.is_empty() {
            return fail("refined and harmonic extraction need at least one target shift.");
        }
        if self.projection == Projection::Harmonic
            && matches!(self.target, Target::Smallest | Target::Largest | Target::LargestAbs)
        {
            return fail("harmonic extraction targets eigenvalues closest to a shift.");
        }
        // The heuristic reorders Ritz pairs only, not the singular triplets of R.
        if self.scheme == RestartScheme::Dynamic && self.projection != Projection::RayleighRitz {
            return fail("dynamic thick restart requires Rayleigh-Ritz extraction.");
        }
        Ok(())
    }

    /// Index of the shift in use once `num_converged` pairs have converged.
    pub fn shift_index(&self, num_converged: usize) -> usize {
        num_converged.min(self.target_shifts.len().saturating_sub(1))
    }

    /// The shift in use once `num_converged` pairs have converged (zero without shifts).
    pub fn target_shift(&self, num_converged: usize) -> f64 {
        self.target_shifts
            .get(self.shift_index(num_converged))
            .copied()
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RestartParams {
        RestartParams {
            n: 100,
            num_evals: 4,
            max_basis_size: 12,
            min_restart_size: 6,
            max_block_size: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_validates() {
        let p = RestartParams {
            n: 50,
            ..Default::default()
        };
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_min_restart_must_fit() {
        let p = RestartParams {
            min_restart_size: 12,
            ..params()
        };
        let err = p.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid input parameter: `min_restart_size` must be in [1, max_basis_size)."
        );
    }

    #[test]
    fn test_interior_target_needs_shift() {
        let p = RestartParams {
            target: Target::ClosestAbs,
            ..params()
        };
        assert!(p.validate().is_err());
        let p = RestartParams {
            target_shifts: vec![1.5],
            ..p
        };
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_harmonic_rejects_extremal_targets() {
        let p = RestartParams {
            projection: Projection::Harmonic,
            target_shifts: vec![0.0],
            ..params()
        };
        assert!(p.validate().is_err());
        let p = RestartParams {
            target: Target::ClosestGeq,
            ..p
        };
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_dynamic_restart_needs_rayleigh_ritz() {
        let p = RestartParams {
            scheme: RestartScheme::Dynamic,
            projection: Projection::Refined,
            target: Target::ClosestAbs,
            target_shifts: vec![0.5],
            ..params()
        };
        assert!(p.validate().is_err());
        let p = RestartParams {
            projection: Projection::RayleighRitz,
            ..p
        };
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_shift_index_saturates() {
        let p = RestartParams {
            target: Target::ClosestLeq,
            target_shifts: vec![1.0, 2.0, 3.0],
            ..params()
        };
        assert_eq!(p.shift_index(0), 0);
        assert_eq!(p.shift_index(2), 2);
        assert_eq!(p.shift_index(10), 2);
        assert_eq!(p.target_shift(10), 3.0);
        assert_eq!(params().target_shift(0), 0.0);
    }
}

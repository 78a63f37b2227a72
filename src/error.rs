//! This module defines the error types for the restart subsystem.
//!
//! Every failure is surfaced as a [`RestartError`], which couples a [`RestartErrorKind`]
//! with a diagnostic trail. Each layer that propagates an error (the small dense solves,
//! the Rayleigh-Ritz or refined restart, the projection coordinator, the orchestrator)
//! pushes a [`Diagnostic`] naming its [`Stage`] and the source location of the push, so the
//! caller can see exactly which path failed without the inner error being rewritten.
//!
//! Using the [`thiserror`] crate keeps the `Display` implementations declarative. Note that
//! the `faer` factorization errors other than [`faer::linalg::evd::EvdError`] are
//! recorded through their `Debug` representation.
use faer::linalg::evd::EvdError;
use std::{fmt, panic::Location};
use thiserror::Error;

/// Represents all possible errors that can occur while restarting the search basis.
#[derive(Error, Debug)]
#[error("{kind}")]
pub struct RestartError {
    kind: RestartErrorKind,
    trace: Vec<Diagnostic>,
}

/// The distinct kinds of restart failures.
#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum RestartErrorKind {
    /// The eigenpairs (or singular triplets) of the retained submatrix could not be
    /// computed while inserting it into the restarted projection.
    #[error("Failed to solve the retained submatrix while restarting the projected problem.")]
    InsertSubmatrix,

    /// The projection coordinator could not regenerate the projected matrices.
    #[error("Restarting the projected matrices failed.")]
    RestartProjection,

    /// A column stayed numerically dependent on the rest of the basis.
    #[error(
        "Orthogonalization failed: column {column} stayed numerically dependent after {attempts} random replacements."
    )]
    Orthogonalization { column: usize, attempts: usize },

    /// The symmetric factorization of the locked-vector cross-projection failed.
    #[error("Factorization of the skew-projection matrix failed: {0}")]
    Factorization(String),

    /// Wraps an error originating from [`faer`]'s eigendecomposition module.
    #[error("A numerical error occurred during the eigendecomposition of the projected matrix: {0:?}")]
    Evd(EvdError),

    /// The singular value decomposition of the projected factor did not converge.
    #[error("The SVD of the projected factor R failed: {0}")]
    Svd(String),

    /// The QR factorization of the shifted basis broke down.
    #[error("The QR factorization of the shifted basis failed: {0}")]
    QFactor(String),

    /// Indicates that an invalid input parameter was provided to a function.
    #[error("Invalid input parameter: {0}")]
    InputError(String),
}

/// The layer of the restart in which a diagnostic was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    SolveProjected,
    Orthogonalize,
    UpdateQ,
    InsertSubmatrix,
    RestartProjection,
    SkewProjection,
    LockingDriver,
    Restart,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::SolveProjected => "solve_projected",
            Stage::Orthogonalize => "orthogonalize",
            Stage::UpdateQ => "update_q",
            Stage::InsertSubmatrix => "insert_submatrix",
            Stage::RestartProjection => "restart_projection",
            Stage::SkewProjection => "skew_projection",
            Stage::LockingDriver => "locking_driver",
            Stage::Restart => "restart",
        };
        f.write_str(name)
    }
}

/// One entry of the diagnostic trail of a [`RestartError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Diagnostic {
    pub stage: Stage,
    pub location: &'static Location<'static>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{})",
            self.stage,
            self.location.file(),
            self.location.line()
        )
    }
}

impl RestartError {
    /// The kind of the outermost failure.
    pub fn kind(&self) -> &RestartErrorKind {
        &self.kind
    }

    /// The diagnostic trail, innermost layer first.
    pub fn trace(&self) -> &[Diagnostic] {
        &self.trace
    }

    /// A stable negative code for the outermost failure.
    pub fn code(&self) -> i32 {
        match self.kind {
            RestartErrorKind::InsertSubmatrix => -1,
            RestartErrorKind::RestartProjection => -2,
            RestartErrorKind::Orthogonalization { .. } => -3,
            RestartErrorKind::Factorization(_) => -4,
            RestartErrorKind::Evd(_) => -5,
            RestartErrorKind::Svd(_) => -6,
            RestartErrorKind::QFactor(_) => -7,
            RestartErrorKind::InputError(_) => -8,
        }
    }

    /// Records that `stage` propagated this error.
    #[track_caller]
    pub(crate) fn pushed(mut self, stage: Stage) -> Self {
        self.trace.push(Diagnostic {
            stage,
            location: Location::caller(),
        });
        self
    }

    /// Replaces the visible kind with `kind`, keeping the trail, and records `stage`.
    #[track_caller]
    pub(crate) fn escalate(mut self, kind: RestartErrorKind, stage: Stage) -> Self {
        self.kind = kind;
        self.pushed(stage)
    }
}

impl From<RestartErrorKind> for RestartError {
    fn from(kind: RestartErrorKind) -> Self {
        Self {
            kind,
            trace: Vec::new(),
        }
    }
}

// Two errors are equal when they report the same failure; the trail is diagnostic only.
impl PartialEq for RestartError {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_submatrix_error_message() {
        let error = RestartError::from(RestartErrorKind::InsertSubmatrix);
        assert_eq!(
            error.to_string(),
            "Failed to solve the retained submatrix while restarting the projected problem."
        );
        assert_eq!(error.code(), -1);
    }

    #[test]
    fn test_orthogonalization_error_message() {
        let error = RestartError::from(RestartErrorKind::Orthogonalization {
            column: 7,
            attempts: 3,
        });
        assert_eq!(
            error.to_string(),
            "Orthogonalization failed: column 7 stayed numerically dependent after 3 random replacements."
        );
    }

    #[test]
    fn test_evd_error_message() {
        let error = RestartError::from(RestartErrorKind::Evd(EvdError::NoConvergence));
        assert_eq!(
            error.to_string(),
            "A numerical error occurred during the eigendecomposition of the projected matrix: NoConvergence"
        );
        assert_eq!(error.code(), -5);
    }

    #[test]
    fn test_escalation_keeps_trail() {
        let error = RestartError::from(RestartErrorKind::Evd(EvdError::NoConvergence))
            .pushed(Stage::SolveProjected)
            .escalate(RestartErrorKind::InsertSubmatrix, Stage::InsertSubmatrix)
            .escalate(RestartErrorKind::RestartProjection, Stage::RestartProjection);

        assert_eq!(error.kind(), &RestartErrorKind::RestartProjection);
        assert_eq!(error.code(), -2);
        let stages: Vec<Stage> = error.trace().iter().map(|d| d.stage).collect();
        assert_eq!(
            stages,
            vec![
                Stage::SolveProjected,
                Stage::InsertSubmatrix,
                Stage::RestartProjection
            ]
        );
        assert!(error.trace()[0].to_string().starts_with("solve_projected ("));
    }

    #[test]
    fn test_equality_ignores_trail() {
        let a = RestartError::from(RestartErrorKind::Factorization("pivot".into()));
        let b = RestartError::from(RestartErrorKind::Factorization("pivot".into()))
            .pushed(Stage::SkewProjection);
        assert_eq!(a, b);
    }
}

//! Integration tests of the complete restart.
//!
//! # Test Methodology
//!
//! Every test builds the state a Davidson-type solver would hold just before a restart: an
//! orthonormal basis `V` of a random symmetric operator `A`, its image `W = A V`, the
//! projection `H = Vᵀ A V`, the solution of the projected problem and, for refined and
//! harmonic extraction, the factorization `Q R = W - σ V`. After [`restart`] the restarted
//! quantities must again describe one consistent basis:
//!
//! 1.  `Vᵀ V = I` and `W = A V` on the restarted columns,
//! 2.  `H = Vᵀ A V`, and for Rayleigh-Ritz `H hVecs = hVecs diag(hVals)`,
//! 3.  `Q R = W - σ V` with orthonormal `Q` and, for harmonic extraction, `QV = Qᵀ V`.
//!
//! The properties do not depend on which pairs were kept, so they are checked for every
//! combination of extraction method, target and retained previous vectors.

use anyhow::{Result, ensure};
use davidson_restart::{
    ConvergenceFlag, Projection, QrFactors, RestartError, RestartErrorKind, RestartOutcome,
    RestartParams, RestartScheme, RestartState, Target,
    algorithms::{
        DriverOutcome, RestartPermutations,
        locking::LockingRestart,
        ortho::{orthogonalize, orthogonalize_scratch},
        projected::{
            ProjectedProblem, ProjectedSolution, solve_projected, solve_projected_scratch,
            update_q, update_q_scratch,
        },
        soft_locking::{restart_soft_locking, soft_locking_scratch},
    },
    operator::LocalSum,
    restart, restart_scratch,
    utils::dense::{update_projection, update_projection_scratch},
};
use faer::{
    Mat, MatRef,
    dyn_stack::{MemBuffer, MemStack, StackReq},
    prelude::*,
};
use rand::{Rng, SeedableRng, rngs::StdRng};

const TOLERANCE: f64 = 1e-9;
const SHIFT: f64 = 0.2;

/// Everything a solver owns at the moment of a restart.
struct Problem {
    params: RestartParams,
    a: Mat<f64>,
    v: Mat<f64>,
    w: Mat<f64>,
    h: Mat<f64>,
    h_vecs: Mat<f64>,
    h_vals: Vec<f64>,
    h_u: Mat<f64>,
    h_svals: Vec<f64>,
    q: Mat<f64>,
    r: Mat<f64>,
    qv: Mat<f64>,
    flags: Vec<ConvergenceFlag>,
    block: Vec<usize>,
    block_norms: Vec<f64>,
    evals: Vec<f64>,
    res_norms: Vec<f64>,
    previous: Mat<f64>,
    prev_ritz_vals: Vec<f64>,
    num_prev_ritz_vals: usize,
    basis_size: usize,
    num_converged: usize,
    target_shift_index: Option<usize>,
}

fn params(projection: Projection, target: Target, scheme: RestartScheme) -> RestartParams {
    RestartParams {
        n: 60,
        num_evals: 2,
        max_basis_size: 10,
        min_restart_size: 4,
        max_block_size: 2,
        scheme,
        projection,
        target,
        target_shifts: vec![SHIFT],
        ..Default::default()
    }
}

fn orthonormality_error(q: MatRef<'_, f64>) -> f64 {
    (q.transpose() * q - Mat::<f64>::identity(q.ncols(), q.ncols())).norm_l2()
}

impl Problem {
    /// A full basis on a random symmetric operator with the first pair converged.
    fn new(params: RestartParams, num_previous: usize, seed: u64) -> Result<Self> {
        let (n, m) = (params.n, params.max_basis_size);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut mem = MemBuffer::new(
            orthogonalize_scratch(m)
                .or(update_q_scratch(m))
                .or(update_projection_scratch(m, m))
                .or(solve_projected_scratch(m)),
        );
        let stack = MemStack::new(&mut mem);

        let a = Mat::from_fn(n, n, |_, _| rng.random::<f64>() - 0.5);
        let a = &a + a.transpose();
        let mut v = Mat::from_fn(n, m, |_, _| rng.random::<f64>() - 0.5);
        orthogonalize(v.as_mut(), 0..m, &[], &LocalSum, &mut rng, stack)?;
        let w = &a * &v;
        let h = v.transpose() * &w;

        let refined = params.projection != Projection::RayleighRitz;
        let harmonic = params.projection == Projection::Harmonic;
        let (mut q, mut r, mut qv) = (Mat::zeros(n, m), Mat::zeros(m, m), Mat::zeros(m, m));
        if refined {
            update_q(v.as_ref(), w.as_ref(), q.as_mut(), r.as_mut(), SHIFT, m, &LocalSum, stack)?;
        }
        if harmonic {
            update_projection(q.as_ref(), v.as_ref(), qv.as_mut(), 0, m, false, &LocalSum, stack);
        }

        let (mut h_vecs, mut h_u) = (Mat::zeros(m, m), Mat::zeros(m, m));
        let (mut h_vals, mut h_svals) = (vec![0.0; m], vec![0.0; m]);
        solve_projected(
            params.projection,
            params.target,
            SHIFT,
            ProjectedProblem {
                h: h.as_ref(),
                r: if refined { Some(r.as_ref()) } else { None },
                qv: if harmonic { Some(qv.as_ref()) } else { None },
            },
            ProjectedSolution {
                h_vecs: h_vecs.as_mut(),
                h_u: if refined { Some(h_u.as_mut()) } else { None },
                h_vals: &mut h_vals,
                h_svals: if refined { Some(&mut h_svals) } else { None },
            },
            &mut rng,
            stack,
        )?;

        let mut flags = vec![ConvergenceFlag::Unconverged; m];
        flags[0] = ConvergenceFlag::Converged;
        let mut evals = vec![0.0; m];
        evals[0] = h_vals[0];

        Ok(Self {
            previous: Mat::from_fn(m, num_previous, |_, _| rng.random::<f64>() - 0.5),
            prev_ritz_vals: h_vals.clone(),
            num_prev_ritz_vals: 0,
            params,
            a,
            v,
            w,
            h,
            h_vecs,
            h_vals,
            h_u,
            h_svals,
            q,
            r,
            qv,
            flags,
            block: vec![0; m],
            block_norms: vec![0.0; m],
            evals,
            res_norms: vec![1e-10; m],
            basis_size: m,
            num_converged: 1,
            target_shift_index: if refined { Some(0) } else { None },
        })
    }

    fn restart(
        &mut self,
        locking: Option<&mut dyn LockingRestart>,
    ) -> Result<RestartOutcome, RestartError> {
        let refined = self.params.projection != Projection::RayleighRitz;
        let harmonic = self.params.projection == Projection::Harmonic;
        let scratch = restart_scratch(&self.params, self.params.n, locking.as_deref());
        let mut mem = MemBuffer::new(scratch);

        let mut state = RestartState {
            v: self.v.as_mut(),
            w: self.w.as_mut(),
            basis_size: self.basis_size,
            h: Some(self.h.as_mut()),
            h_vecs: self.h_vecs.as_mut(),
            h_vals: &mut self.h_vals,
            h_svals: if refined { Some(self.h_svals.as_mut_slice()) } else { None },
            flags: &mut self.flags,
            block: &mut self.block,
            block_size: 0,
            block_norms: &mut self.block_norms,
            evals: &self.evals,
            res_norms: &self.res_norms,
            num_converged: self.num_converged,
            num_locked: 0,
            previous_h_vecs: self.previous.as_ref(),
            num_prev_retained: self.previous.ncols(),
            num_arbitrary_vecs: 0,
            prev_ritz_vals: Some(self.prev_ritz_vals.as_mut_slice()),
            num_prev_ritz_vals: 0,
            qr: if refined {
                Some(QrFactors {
                    q: self.q.as_mut(),
                    r: self.r.as_mut(),
                    qv: if harmonic { Some(self.qv.as_mut()) } else { None },
                    h_u: self.h_u.as_mut(),
                    target_shift_index: self.target_shift_index,
                })
            } else {
                None
            },
            skew: None,
            reduce: &LocalSum,
        };
        let outcome = restart(&self.params, &mut state, locking, MemStack::new(&mut mem))?;

        self.basis_size = state.basis_size;
        self.num_converged = state.num_converged;
        self.num_prev_ritz_vals = state.num_prev_ritz_vals;
        if let Some(qr) = state.qr.as_ref() {
            self.target_shift_index = qr.target_shift_index;
        }
        Ok(outcome)
    }

    /// Checks that the restarted quantities describe the restarted basis.
    fn check(&self) -> Result<()> {
        let rs = self.basis_size;
        let basis = self.v.as_ref().get(.., 0..rs);
        let image = self.w.as_ref().get(.., 0..rs);

        let ortho = orthonormality_error(basis);
        ensure!(ortho < TOLERANCE, "V lost orthonormality: {ortho:e}");
        let w_err = (image - &self.a * basis).norm_l2();
        ensure!(w_err < TOLERANCE, "W differs from A V by {w_err:e}");
        let expected_h = basis.transpose() * &self.a * basis;
        let h = self.h.as_ref().get(0..rs, 0..rs);
        let h_err = (h - &expected_h).norm_l2();
        ensure!(h_err < TOLERANCE, "H differs from Vᵀ A V by {h_err:e}");

        match self.params.projection {
            Projection::RayleighRitz => {
                let vecs = self.h_vecs.as_ref().get(0..rs, 0..rs);
                let diag = Mat::from_fn(rs, rs, |i, j| if i == j { self.h_vals[i] } else { 0.0 });
                let eig_err = (h * vecs - vecs * &diag).norm_l2();
                ensure!(eig_err < TOLERANCE, "hVecs are not eigenvectors of H: {eig_err:e}");
                ensure!(orthonormality_error(vecs) < TOLERANCE, "hVecs are not orthonormal");
            }
            Projection::Refined | Projection::Harmonic => {
                let q = self.q.as_ref().get(.., 0..rs);
                ensure!(orthonormality_error(q) < TOLERANCE, "Q lost orthonormality");
                let shifted = Mat::from_fn(self.params.n, rs, |i, j| {
                    self.w[(i, j)] - SHIFT * self.v[(i, j)]
                });
                let qr_err = (q * self.r.as_ref().get(0..rs, 0..rs) - &shifted).norm_l2();
                ensure!(qr_err < TOLERANCE, "Q R differs from W - σV by {qr_err:e}");
                for j in 0..rs {
                    for i in j + 1..rs {
                        ensure!(self.r[(i, j)] == 0.0, "R is not upper triangular at ({i}, {j})");
                    }
                }
            }
        }
        if self.params.projection == Projection::Harmonic {
            let expected_qv = self.q.as_ref().get(.., 0..rs).transpose() * basis;
            let qv_err = (self.qv.as_ref().get(0..rs, 0..rs) - &expected_qv).norm_l2();
            ensure!(qv_err < TOLERANCE, "QV differs from Qᵀ V by {qv_err:e}");
        }
        Ok(())
    }
}

/// Generates a test restarting a full basis and checking the consistency of the result.
macro_rules! generate_restart_test {
    ($test_name:ident, $projection:expr, $target:expr, $scheme:expr, $num_previous:expr) => {
        #[test]
        fn $test_name() -> Result<()> {
            let mut problem = Problem::new(params($projection, $target, $scheme), $num_previous, 42)?;
            let outcome = problem.restart(None)?;

            ensure!(outcome.restart_size == problem.basis_size);
            ensure!(outcome.restart_size + outcome.block_size <= problem.params.max_basis_size);
            ensure!(outcome.num_prev_retained <= outcome.restart_size);
            ensure!(
                outcome.index_of_previous_vecs + outcome.num_prev_retained <= outcome.restart_size
            );
            if $target.needs_shift() {
                ensure!(problem.num_prev_ritz_vals == outcome.restart_size);
            } else {
                ensure!(problem.num_prev_ritz_vals == 0);
            }
            problem.check()
        }
    };
}

generate_restart_test!(
    test_rr_smallest,
    Projection::RayleighRitz,
    Target::Smallest,
    RestartScheme::Thick,
    0
);
generate_restart_test!(
    test_rr_smallest_with_previous,
    Projection::RayleighRitz,
    Target::Smallest,
    RestartScheme::Thick,
    2
);
generate_restart_test!(
    test_rr_largest_with_previous,
    Projection::RayleighRitz,
    Target::Largest,
    RestartScheme::Thick,
    1
);
generate_restart_test!(
    test_rr_closest_abs_with_previous,
    Projection::RayleighRitz,
    Target::ClosestAbs,
    RestartScheme::Thick,
    2
);
generate_restart_test!(
    test_rr_dynamic_with_previous,
    Projection::RayleighRitz,
    Target::Smallest,
    RestartScheme::Dynamic,
    1
);
generate_restart_test!(
    test_refined_closest_abs,
    Projection::Refined,
    Target::ClosestAbs,
    RestartScheme::Thick,
    0
);
generate_restart_test!(
    test_refined_closest_abs_with_previous,
    Projection::Refined,
    Target::ClosestAbs,
    RestartScheme::Thick,
    2
);
generate_restart_test!(
    test_harmonic_closest_abs,
    Projection::Harmonic,
    Target::ClosestAbs,
    RestartScheme::Thick,
    0
);
generate_restart_test!(
    test_harmonic_closest_geq_with_previous,
    Projection::Harmonic,
    Target::ClosestGeq,
    RestartScheme::Thick,
    2
);

#[test]
fn test_restart_is_repeatable() -> Result<()> {
    let p = params(Projection::RayleighRitz, Target::Smallest, RestartScheme::Thick);
    let mut first = Problem::new(p.clone(), 2, 7)?;
    let mut second = Problem::new(p, 2, 7)?;
    let a = first.restart(None)?;
    let b = second.restart(None)?;
    ensure!(a == b);
    ensure!((&first.v - &second.v).norm_l2() == 0.0);
    ensure!(first.h_vals == second.h_vals);
    Ok(())
}

#[test]
fn test_full_space_keeps_everything() -> Result<()> {
    let p = RestartParams {
        n: 10,
        ..params(Projection::RayleighRitz, Target::Smallest, RestartScheme::Thick)
    };
    let mut problem = Problem::new(p, 0, 42)?;
    let outcome = problem.restart(None)?;

    ensure!(outcome.restart_size == 10);
    ensure!(outcome.num_prev_retained == 0);
    ensure!(outcome.block_size == 0);
    ensure!(problem.num_converged == 2);
    ensure!(problem.flags[..2].iter().all(|f| !f.is_unconverged()));
    problem.check()
}

/// A locking driver that records its calls and otherwise restarts like soft locking.
#[derive(Default)]
struct RecordingDriver {
    calls: usize,
}

impl LockingRestart for RecordingDriver {
    fn scratch(&self, params: &RestartParams, n_local: usize) -> StackReq {
        soft_locking_scratch(params, n_local)
    }

    fn restart(
        &mut self,
        params: &RestartParams,
        state: &mut RestartState<'_>,
        restart_size: usize,
        perms: &mut RestartPermutations<'_>,
        rng: &mut StdRng,
        stack: &mut MemStack,
    ) -> Result<DriverOutcome, RestartError> {
        self.calls += 1;
        restart_soft_locking(params, state, restart_size, perms, rng, stack)
    }
}

#[test]
fn test_locking_dispatches_to_driver() -> Result<()> {
    let p = RestartParams {
        locking: true,
        ..params(Projection::RayleighRitz, Target::Smallest, RestartScheme::Thick)
    };
    let mut problem = Problem::new(p, 1, 42)?;
    let mut driver = RecordingDriver::default();
    problem.restart(Some(&mut driver))?;
    ensure!(driver.calls == 1, "driver called {} times", driver.calls);
    problem.check()
}

#[test]
fn test_locking_without_driver_is_rejected() -> Result<()> {
    let p = RestartParams {
        locking: true,
        ..params(Projection::RayleighRitz, Target::Smallest, RestartScheme::Thick)
    };
    let mut problem = Problem::new(p, 0, 42)?;
    let err = match problem.restart(None) {
        Ok(_) => anyhow::bail!("restart succeeded without a locking driver"),
        Err(err) => err,
    };
    ensure!(matches!(err.kind(), RestartErrorKind::InputError(_)));
    ensure!(err.code() == -8);
    ensure!(problem.basis_size == 10, "the basis must be left untouched");
    Ok(())
}

#[test]
fn test_invalid_params_are_rejected() -> Result<()> {
    let mut problem = Problem::new(
        params(Projection::RayleighRitz, Target::Smallest, RestartScheme::Thick),
        0,
        42,
    )?;
    problem.params.min_restart_size = 10;
    let err = match problem.restart(None) {
        Ok(_) => anyhow::bail!("restart accepted min_restart_size == max_basis_size"),
        Err(err) => err,
    };
    ensure!(matches!(err.kind(), RestartErrorKind::InputError(_)));
    Ok(())
}

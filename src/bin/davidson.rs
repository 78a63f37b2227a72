//! Generalized Davidson Runner.
//!
//! This executable computes a few eigenpairs of the classic Davidson test matrix,
//! `diag(1, 2, ..., n)` plus a small random symmetric perturbation, with a generalized
//! Davidson iteration (GD+k). Corrections are the residuals preconditioned by the inverse of
//! the shifted diagonal. Whenever the basis cannot take another block it is restarted
//! through [`davidson_restart::restart`], keeping the coefficient vectors of the previous
//! iteration. The convergence history is written to a CSV file.

use anyhow::{Result, anyhow, ensure};
use clap::Parser;
use davidson_restart::{
    ConvergenceFlag, Projection, QrFactors, RestartOutcome, RestartParams, RestartScheme,
    RestartState, Target,
    algorithms::{
        ortho::{orthogonalize, orthogonalize_scratch},
        projected::{
            ProjectedProblem, ProjectedSolution, solve_projected, solve_projected_scratch,
            update_q, update_q_scratch,
        },
    },
    operator::LocalSum,
    restart, restart_scratch,
    utils::dense::{update_projection, update_projection_scratch},
};
use faer::{
    Mat, MatMut, MatRef, Scale,
    dyn_stack::{MemBuffer, MemStack},
    prelude::*,
};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::Serialize;
use std::{ops::Range, path::PathBuf};

/// Command-line arguments for the Davidson run.
#[derive(Parser, Debug)]
#[clap(
    name = "davidson-runner",
    about = "Runs a restarted generalized Davidson eigensolver on a dense test matrix."
)]
struct DavidsonArgs {
    /// Dimension of the test matrix.
    #[clap(long, default_value_t = 1000)]
    n: usize,

    /// Number of wanted eigenpairs.
    #[clap(long, default_value_t = 4)]
    num_evals: usize,

    /// Maximum number of basis vectors.
    #[clap(long, default_value_t = 20)]
    max_basis_size: usize,

    /// Number of Ritz vectors kept by a thick restart.
    #[clap(long, default_value_t = 8)]
    min_restart_size: usize,

    /// Number of corrections added per iteration.
    #[clap(long, default_value_t = 1)]
    block_size: usize,

    /// Coefficient vectors of the previous iteration kept at restart (the "+k" of GD+k).
    #[clap(long, default_value_t = 1)]
    prev: usize,

    /// Extraction method.
    #[clap(long, value_enum, default_value_t = Projection::RayleighRitz)]
    projection: Projection,

    /// Wanted part of the spectrum.
    #[clap(long, value_enum, default_value_t = Target::Smallest)]
    target: Target,

    /// Target shift for interior eigenvalues and refined or harmonic extraction.
    #[clap(long, default_value_t = 0.0)]
    shift: f64,

    /// Choose the restart size with the dynamic thick restart heuristic.
    #[clap(long)]
    dynamic: bool,

    /// Residual tolerance relative to the estimated norm of the matrix.
    #[clap(long, default_value_t = 1e-8)]
    tol: f64,

    /// Maximum number of iterations.
    #[clap(long, default_value_t = 2000)]
    max_iterations: usize,

    /// Seed of the test matrix and the initial block.
    #[clap(long, default_value_t = 42)]
    seed: u64,

    /// Path to the output CSV file where the convergence history will be written.
    #[clap(long, value_name = "PATH")]
    output: PathBuf,
}

/// One row of the convergence history.
#[derive(Debug, Serialize)]
struct IterationRecord {
    iteration: usize,
    basis_size: usize,
    num_converged: usize,
    restarts: usize,
    /// Ritz value of the first unconverged wanted pair.
    ritz_value: f64,
    /// Largest residual norm among the wanted pairs.
    max_residual: f64,
}

/// The search space and everything projected on it.
struct Basis {
    size: usize,
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
}

impl Basis {
    fn new(n: usize, m: usize) -> Self {
        Self {
            size: 0,
            v: Mat::zeros(n, m),
            w: Mat::zeros(n, m),
            h: Mat::zeros(m, m),
            h_vecs: Mat::zeros(m, m),
            h_vals: vec![0.0; m],
            h_u: Mat::zeros(m, m),
            h_svals: vec![0.0; m],
            q: Mat::zeros(n, m),
            r: Mat::zeros(m, m),
            qv: Mat::zeros(m, m),
        }
    }

    /// Orthonormalizes the new columns `cols` of V against the basis and extends W and H.
    fn expand(
        &mut self,
        a: &Mat<f64>,
        cols: Range<usize>,
        rng: &mut StdRng,
        stack: &mut MemStack,
    ) -> Result<()> {
        orthogonalize(
            self.v.as_mut(),
            cols.clone(),
            &[0..cols.start],
            &LocalSum,
            rng,
            stack,
        )?;
        let image = a * self.v.as_ref().get(.., cols.clone());
        self.w.as_mut().get_mut(.., cols.clone()).copy_from(image.as_ref());
        update_projection(
            self.v.as_ref(),
            self.w.as_ref(),
            self.h.as_mut(),
            cols.start,
            cols.len(),
            true,
            &LocalSum,
            stack,
        );
        self.size = cols.end;
        Ok(())
    }

    /// Solves the projected problem; refined and harmonic extraction refactor `W - σV` first.
    fn solve(
        &mut self,
        params: &RestartParams,
        shift: f64,
        rng: &mut StdRng,
        stack: &mut MemStack,
    ) -> Result<()> {
        let all = 0..self.size;
        let refined = params.projection != Projection::RayleighRitz;
        let harmonic = params.projection == Projection::Harmonic;
        if refined {
            update_q(
                self.v.as_ref(),
                self.w.as_ref(),
                self.q.as_mut(),
                self.r.as_mut(),
                shift,
                self.size,
                &LocalSum,
                stack,
            )?;
        }
        if harmonic {
            update_projection(
                self.q.as_ref(),
                self.v.as_ref(),
                self.qv.as_mut(),
                0,
                self.size,
                false,
                &LocalSum,
                stack,
            );
        }

        let problem = ProjectedProblem {
            h: self.h.as_ref().get(all.clone(), all.clone()),
            r: if refined {
                Some(self.r.as_ref().get(all.clone(), all.clone()))
            } else {
                None
            },
            qv: if harmonic {
                Some(self.qv.as_ref().get(all.clone(), all.clone()))
            } else {
                None
            },
        };
        let solution = ProjectedSolution {
            h_vecs: self.h_vecs.as_mut().get_mut(all.clone(), all.clone()),
            h_u: if refined {
                Some(self.h_u.as_mut().get_mut(all.clone(), all.clone()))
            } else {
                None
            },
            h_vals: &mut self.h_vals[all.clone()],
            h_svals: if refined {
                Some(&mut self.h_svals[all])
            } else {
                None
            },
        };
        solve_projected(params.projection, params.target, shift, problem, solution, rng, stack)?;
        Ok(())
    }

    /// The residual `A x - θ x` of the `i`-th approximate pair.
    fn residual(&self, i: usize) -> Mat<f64> {
        let coeffs = self.h_vecs.as_ref().get(0..self.size, i..i + 1);
        let x = self.v.as_ref().get(.., 0..self.size) * coeffs;
        let ax = self.w.as_ref().get(.., 0..self.size) * coeffs;
        &ax - &x * Scale(self.h_vals[i])
    }
}

/// Builds the Davidson test matrix: a graded diagonal plus a small symmetric perturbation.
fn test_matrix(n: usize, rng: &mut StdRng) -> Mat<f64> {
    let noise = Mat::from_fn(n, n, |_, _| 1e-3 * (rng.random::<f64>() - 0.5));
    Mat::from_fn(n, n, |i, j| {
        let base = if i == j { (i + 1) as f64 } else { 0.0 };
        base + noise[(i, j)] + noise[(j, i)]
    })
}

/// Applies `(diag(A) - θ I)⁻¹` to `residual`.
fn precondition(residual: MatRef<'_, f64>, diag: &[f64], theta: f64, mut out: MatMut<'_, f64>) {
    for (i, &d) in diag.iter().enumerate() {
        let shifted = d - theta;
        let shifted = if shifted.abs() < 1e-10 {
            1e-10_f64.copysign(shifted)
        } else {
            shifted
        };
        out[(i, 0)] = residual[(i, 0)] / shifted;
    }
}

#[allow(clippy::too_many_arguments)]
fn restart_basis(
    params: &RestartParams,
    basis: &mut Basis,
    flags: &mut [ConvergenceFlag],
    evals: &[f64],
    res_norms: &[f64],
    num_converged: usize,
    previous: &Mat<f64>,
    target_shift_index: Option<usize>,
    stack: &mut MemStack,
) -> Result<RestartOutcome> {
    let m = params.max_basis_size;
    let refined = params.projection != Projection::RayleighRitz;
    let harmonic = params.projection == Projection::Harmonic;
    let (mut block, mut block_norms) = (vec![0; m], vec![0.0; m]);

    let mut state = RestartState {
        v: basis.v.as_mut(),
        w: basis.w.as_mut(),
        basis_size: basis.size,
        h: Some(basis.h.as_mut()),
        h_vecs: basis.h_vecs.as_mut(),
        h_vals: &mut basis.h_vals,
        h_svals: if refined {
            Some(&mut basis.h_svals)
        } else {
            None
        },
        flags,
        block: &mut block,
        block_size: 0,
        block_norms: &mut block_norms,
        evals,
        res_norms,
        num_converged,
        num_locked: 0,
        previous_h_vecs: previous.as_ref(),
        num_prev_retained: previous.ncols(),
        num_arbitrary_vecs: 0,
        prev_ritz_vals: None,
        num_prev_ritz_vals: 0,
        qr: if refined {
            Some(QrFactors {
                q: basis.q.as_mut(),
                r: basis.r.as_mut(),
                qv: if harmonic {
                    Some(basis.qv.as_mut())
                } else {
                    None
                },
                h_u: basis.h_u.as_mut(),
                target_shift_index,
            })
        } else {
            None
        },
        skew: None,
        reduce: &LocalSum,
    };
    let outcome = restart(params, &mut state, None, stack)?;
    let size = state.basis_size;
    basis.size = size;
    Ok(outcome)
}

fn main() -> Result<()> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .try_init()?;

    let args = DavidsonArgs::parse();
    let (n, m) = (args.n, args.max_basis_size);
    ensure!(m <= n, "The basis cannot be larger than the matrix.");
    ensure!(
        args.prev < args.min_restart_size,
        "Keep fewer previous vectors than Ritz vectors at restart."
    );

    let needs_shift = args.target.needs_shift() || args.projection != Projection::RayleighRitz;
    let mut params = RestartParams {
        n,
        num_evals: args.num_evals,
        max_basis_size: m,
        min_restart_size: args.min_restart_size,
        max_block_size: args.block_size,
        scheme: if args.dynamic {
            RestartScheme::Dynamic
        } else {
            RestartScheme::Thick
        },
        projection: args.projection,
        target: args.target,
        target_shifts: if needs_shift { vec![args.shift] } else { Vec::new() },
        eps: args.tol,
        seed: args.seed,
        ..Default::default()
    };
    params
        .validate()
        .map_err(|e| anyhow!("Invalid solver settings: {e}"))?;

    log::info!(
        "Computing {} eigenpairs of a {n}x{n} matrix with {:?} extraction, basis {m}, restart {}.",
        args.num_evals,
        args.projection,
        args.min_restart_size
    );

    let mut rng = StdRng::seed_from_u64(args.seed);
    let a = test_matrix(n, &mut rng);
    let diag: Vec<f64> = (0..n).map(|i| a[(i, i)]).collect();

    let mut mem = MemBuffer::new(
        orthogonalize_scratch(m)
            .or(update_projection_scratch(m, m))
            .or(update_q_scratch(m))
            .or(solve_projected_scratch(m))
            .or(restart_scratch(&params, n, None)),
    );
    let stack = MemStack::new(&mut mem);

    let mut basis = Basis::new(n, m);
    for j in 0..args.block_size {
        for i in 0..n {
            basis.v[(i, j)] = rng.random::<f64>() - 0.5;
        }
    }
    basis.expand(&a, 0..args.block_size, &mut rng, stack)?;

    let mut flags = vec![ConvergenceFlag::Unconverged; m];
    let (mut evals, mut res_norms) = (vec![0.0; m], vec![0.0; m]);
    let mut previous = Mat::<f64>::zeros(m, 0);
    let mut restarts = 0;
    let mut history = Vec::new();
    let mut num_converged = 0;

    for iteration in 0..args.max_iterations {
        let shift_index = params.shift_index(num_converged);
        let shift = params.target_shift(num_converged);
        basis.solve(&params, shift, &mut rng, stack)?;
        params.a_norm = basis.h_vals[..basis.size]
            .iter()
            .fold(0.0_f64, |acc, x| acc.max(x.abs()));

        // Convergence of the wanted pairs and residuals of the next block.
        let wanted = args.num_evals.min(basis.size);
        let mut block = Vec::with_capacity(args.block_size);
        let mut max_residual = 0.0_f64;
        num_converged = 0;
        for (i, flag) in flags[..basis.size].iter_mut().enumerate() {
            if i >= wanted && block.len() == args.block_size {
                *flag = ConvergenceFlag::Unconverged;
                continue;
            }
            let residual = basis.residual(i);
            let norm = residual.norm_l2();
            if i < wanted {
                max_residual = max_residual.max(norm);
            }
            if i < wanted && norm <= args.tol * params.a_norm {
                *flag = ConvergenceFlag::Converged;
                evals[i] = basis.h_vals[i];
                res_norms[i] = norm;
                num_converged += 1;
            } else {
                *flag = ConvergenceFlag::Unconverged;
                if block.len() < args.block_size {
                    block.push((basis.h_vals[i], residual));
                }
            }
        }

        let ritz_value = flags[..wanted]
            .iter()
            .position(|f| f.is_unconverged())
            .map_or(f64::NAN, |i| basis.h_vals[i]);
        history.push(IterationRecord {
            iteration,
            basis_size: basis.size,
            num_converged,
            restarts,
            ritz_value,
            max_residual,
        });
        if iteration % 50 == 0 {
            log::info!(
                "Iteration {iteration}: basis {}, converged {num_converged}, max residual {max_residual:.3e}",
                basis.size
            );
        }
        if num_converged == args.num_evals {
            log::info!("All {num_converged} eigenpairs converged after {iteration} iterations.");
            break;
        }

        if basis.size + block.len() > m {
            let outcome = restart_basis(
                &params,
                &mut basis,
                &mut flags,
                &evals,
                &res_norms,
                num_converged,
                &previous,
                Some(shift_index),
                stack,
            )?;
            log::debug!("Restart {restarts}: {outcome:?}");
            restarts += 1;
            previous = Mat::zeros(m, 0);
            continue;
        }

        let keep = args.prev.min(basis.size);
        previous = basis.h_vecs.as_ref().get(0..basis.size, 0..keep).to_owned();

        let first = basis.size;
        for (j, (theta, residual)) in block.iter().enumerate() {
            precondition(
                residual.as_ref(),
                &diag,
                *theta,
                basis.v.as_mut().get_mut(.., first + j..first + j + 1),
            );
        }
        basis.expand(&a, first..first + block.len(), &mut rng, stack)?;
    }

    for i in 0..args.num_evals.min(basis.size) {
        log::info!(
            "λ[{i}] = {:.12} (residual {:.3e})",
            basis.h_vals[i],
            basis.residual(i).norm_l2()
        );
    }

    log::info!("Writing the convergence history to {:?}...", &args.output);
    let mut writer = csv::Writer::from_path(&args.output)?;
    for record in history {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

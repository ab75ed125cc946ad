// Source location solver
//
// Levenberg-Marquardt least squares over (time, x, y, z). The residual
// function is supplied by the caller, so the solver knows nothing about
// stations or propagation.

use nalgebra as na;
use na::{DMatrix, DVector};
use tracing::debug;

use crate::constants::SOLVER_MAX_ITERATIONS;
use crate::error::{LmaError, Result};

/// Number of unknowns: source time (ns) and ECEF x, y, z (m).
pub const PARAMS: usize = 4;

/// Finite difference step per parameter: 1 ns, 1 m, 1 m, 1 m
const JACOBIAN_STEP: [f64; PARAMS] = [1.0, 1.0, 1.0, 1.0];

const INITIAL_DAMPING: f64 = 0.1;
const MAX_DAMPING: f64 = 1e10;
const MIN_DAMPING: f64 = 1e-10;

/// Steps shorter than this (ns or m) end the iteration.
const STEP_TOLERANCE: f64 = 1e-6;

/// Result of a fit.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverFit {
    /// [time_ns, x, y, z]
    pub params: [f64; PARAMS],
    /// False if the iteration limit was hit or the problem is underdetermined
    pub success: bool,
    /// RMS of the residuals at `params` (ns)
    pub rms_ns: f64,
    pub iterations: usize,
}

impl SolverFit {
    pub fn time_ns(&self) -> f64 {
        self.params[0]
    }

    pub fn position(&self) -> (f64, f64, f64) {
        (self.params[1], self.params[2], self.params[3])
    }
}

fn evaluate<F>(residuals: &F, params: &[f64; PARAMS]) -> Result<DVector<f64>>
where
    F: Fn(&[f64; PARAMS]) -> Vec<f64>,
{
    let res = DVector::from_vec(residuals(params));
    if res.iter().all(|r| r.is_finite()) {
        Ok(res)
    } else {
        Err(LmaError::Solver(format!("non-finite residual at {:?}", params)))
    }
}

fn rms(res: &DVector<f64>) -> f64 {
    if res.is_empty() {
        0.0
    } else {
        res.norm() / (res.len() as f64).sqrt()
    }
}

/// Forward-difference Jacobian of the residuals at `params`.
fn compute_jacobian<F>(residuals: &F, params: &[f64; PARAMS], at: &DVector<f64>) -> Result<DMatrix<f64>>
where
    F: Fn(&[f64; PARAMS]) -> Vec<f64>,
{
    let mut jacobian = DMatrix::zeros(at.len(), PARAMS);
    for (j, step) in JACOBIAN_STEP.iter().enumerate() {
        let mut shifted = *params;
        shifted[j] += step;
        let res = evaluate(residuals, &shifted)?;
        jacobian.set_column(j, &((res - at) / *step));
    }
    Ok(jacobian)
}

/// Minimizes the sum of squared residuals starting from `initial`.
///
/// # Arguments
/// * `residuals` - Residual vector (ns) for a parameter set [time_ns, x, y, z]
/// * `initial` - Starting parameters
///
/// # Returns
/// * `Ok(SolverFit)` with `success` telling whether the iteration converged
/// * `Err(LmaError::Solver)` if the residual function produced NaN or infinity
pub fn solve<F>(residuals: F, initial: [f64; PARAMS]) -> Result<SolverFit>
where
    F: Fn(&[f64; PARAMS]) -> Vec<f64>,
{
    solve_with_limit(residuals, initial, SOLVER_MAX_ITERATIONS)
}

pub fn solve_with_limit<F>(residuals: F, initial: [f64; PARAMS], max_iterations: usize) -> Result<SolverFit>
where
    F: Fn(&[f64; PARAMS]) -> Vec<f64>,
{
    let mut x = initial;
    let mut res = evaluate(&residuals, &x)?;

    if res.len() < PARAMS {
        return Ok(SolverFit { params: x, success: false, rms_ns: rms(&res), iterations: 0 });
    }

    let mut lambda = INITIAL_DAMPING;
    let mut cost = res.norm_squared();

    for iter in 0..max_iterations {
        if cost == 0.0 {
            return Ok(SolverFit { params: x, success: true, rms_ns: 0.0, iterations: iter });
        }

        let jacobian = compute_jacobian(&residuals, &x, &res)?;
        let jt = jacobian.transpose();
        let jtj = &jt * &jacobian;
        let jtr = &jt * &res;

        // (J^T J + λI) Δx = -J^T r, raising λ until the step helps
        let mut improved = None;
        while lambda <= MAX_DAMPING {
            let mut damped = jtj.clone();
            for i in 0..PARAMS {
                damped[(i, i)] += lambda;
            }
            let Some(inverse) = damped.try_inverse() else {
                lambda *= 10.0;
                continue;
            };
            let step = inverse * (-&jtr);

            let mut trial = x;
            for (p, s) in trial.iter_mut().zip(step.iter()) {
                *p += s;
            }
            let trial_res = evaluate(&residuals, &trial)?;
            let trial_cost = trial_res.norm_squared();
            if trial_cost < cost {
                improved = Some((trial, trial_res, trial_cost, step.amax()));
                lambda = (lambda * 0.1).max(MIN_DAMPING);
                break;
            }
            lambda *= 10.0;
        }

        // No damping found a downhill step: we are at a minimum
        let Some((next, next_res, next_cost, step_size)) = improved else {
            debug!("solver stalled after {} iterations, rms {:.1} ns", iter, rms(&res));
            return Ok(SolverFit { params: x, success: true, rms_ns: rms(&res), iterations: iter });
        };

        x = next;
        res = next_res;
        cost = next_cost;

        if step_size < STEP_TOLERANCE {
            return Ok(SolverFit { params: x, success: true, rms_ns: rms(&res), iterations: iter + 1 });
        }
    }

    debug!("solver hit {} iterations, rms {:.1} ns", max_iterations, rms(&res));
    Ok(SolverFit { params: x, success: false, rms_ns: rms(&res), iterations: max_iterations })
}

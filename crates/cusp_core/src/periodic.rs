//! Periodic orbits by single shooting, seeded from Hopf points.

use crate::equilibrium::FixedPoint;
use crate::error::{DynamicsError, Result};
use crate::integrator::{integrate_values, IntegratorOptions, VariationalModel};
use crate::jacobian::{evaluate, DEFAULT_FD_STEP};
use crate::linalg;
use crate::params::Parameters;
use crate::stability::{critical_pair, nontrivial_multipliers};
use crate::traits::Model;
use crate::{bail_input, ensure_input};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Starting point and period for [`shoot_limit_cycle`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitCycleGuess {
    pub state: Vec<f64>,
    pub period: f64,
}

/// A converged periodic orbit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitCycle {
    pub period: f64,
    /// `samples + 1` states evenly spaced in time over one period.
    pub samples: Vec<Vec<f64>>,
    /// Eigenvalues of the monodromy matrix, including the trivial one.
    pub floquet_multipliers: Vec<Complex<f64>>,
    pub parameters: Parameters,
    /// Largest half peak-to-peak extent over all components.
    pub amplitude: f64,
    pub stable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShootingSettings {
    pub max_iterations: usize,
    /// Converged when the norm of the periodicity and phase residual drops below this.
    pub tolerance: f64,
    pub samples: usize,
    pub integrator: IntegratorOptions,
}

impl Default for ShootingSettings {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            tolerance: 1e-8,
            samples: 200,
            integrator: IntegratorOptions {
                atol: 1e-11,
                rtol: 1e-10,
                ..IntegratorOptions::default()
            },
        }
    }
}

impl ShootingSettings {
    pub fn validate(&self) -> Result<()> {
        ensure_input!(self.max_iterations > 0, "max_iterations must be greater than zero");
        ensure_input!(
            self.tolerance.is_finite() && self.tolerance > 0.0,
            "shooting tolerance must be positive, got {}",
            self.tolerance
        );
        ensure_input!(self.samples >= 2, "samples must be at least 2, got {}", self.samples);
        self.integrator.validate()
    }
}

/// Seeds a cycle near a Hopf point: the equilibrium displaced by `amplitude`
/// along the real part of the critical eigenvector, with period `2π/ω`.
pub fn limit_cycle_guess_from_hopf(point: &FixedPoint, amplitude: f64) -> Result<LimitCycleGuess> {
    ensure_input!(
        amplitude.is_finite() && amplitude > 0.0,
        "amplitude must be positive, got {}",
        amplitude
    );
    let Some(lambda) = critical_pair(&point.eigenvalues) else {
        bail_input!("equilibrium has no complex-conjugate eigenvalue pair");
    };
    let eigenvector = linalg::eigenvector(&point.jacobian_matrix(), lambda)?;
    let real_part: Vec<f64> = eigenvector.iter().map(|c| c.re).collect();
    let real_norm = linalg::norm(&real_part);
    ensure_input!(
        real_norm > 0.0,
        "real part of the Hopf eigenvector vanished"
    );

    let state = point
        .state
        .iter()
        .zip(&real_part)
        .map(|(x, v)| x + amplitude * v / real_norm)
        .collect();
    Ok(LimitCycleGuess {
        state,
        period: 2.0 * PI / lambda.im.abs(),
    })
}

/// Finds a periodic orbit through the hyperplane `f(x_ref)·(x − x_ref) = 0`
/// with `x_ref = guess.state`.
///
/// Newton iterates on `(x0, T)` using the monodromy matrix from the
/// variational equations. The returned Floquet multipliers are the
/// eigenvalues of the monodromy at the converged orbit.
pub fn shoot_limit_cycle<M: Model + ?Sized>(
    model: &M,
    params: &Parameters,
    guess: &LimitCycleGuess,
    settings: &ShootingSettings,
) -> Result<LimitCycle> {
    settings.validate()?;
    let parameters = params.aligned_to(model)?;
    let p = parameters.values();
    let n = model.dimension();
    ensure_input!(n > 0, "model has zero dimension");
    ensure_input!(
        guess.state.len() == n,
        "guess has length {}, model dimension is {}",
        guess.state.len(),
        n
    );
    ensure_input!(
        guess.state.iter().all(|v| v.is_finite()),
        "guess contains non-finite values"
    );
    ensure_input!(
        guess.period.is_finite() && guess.period > 0.0,
        "period must be positive, got {}",
        guess.period
    );

    let x_ref = guess.state.clone();
    let f_ref = evaluate(model, 0.0, &x_ref, p);
    ensure_input!(
        linalg::norm(&f_ref) > 0.0,
        "guess is an equilibrium; the phase condition is undefined"
    );

    let variational = VariationalModel::new(model, DEFAULT_FD_STEP);
    let mut x0 = x_ref.clone();
    let mut period = guess.period;
    let mut residual_norm = f64::INFINITY;

    for iteration in 0..settings.max_iterations {
        let (x_t, monodromy) = flow_with_monodromy(&variational, &x0, p, period, &settings.integrator)?;
        let mut residual = DVector::zeros(n + 1);
        for i in 0..n {
            residual[i] = x_t[i] - x0[i];
        }
        residual[n] = f_ref
            .iter()
            .zip(x0.iter().zip(&x_ref))
            .map(|(f, (x, r))| f * (x - r))
            .sum();
        residual_norm = residual.norm();
        log::debug!(
            "shooting iteration {iteration}: residual {residual_norm:e}, period {period}"
        );

        if residual_norm < settings.tolerance {
            let multipliers = linalg::eigenvalues(&monodromy)?;
            return finish(model, x0, period, multipliers, parameters, &settings.integrator, settings.samples);
        }

        let f_end = evaluate(model, 0.0, &x_t, p);
        let mut jac = DMatrix::zeros(n + 1, n + 1);
        for i in 0..n {
            for j in 0..n {
                jac[(i, j)] = monodromy[(i, j)] - if i == j { 1.0 } else { 0.0 };
            }
            jac[(i, n)] = f_end[i];
            jac[(n, i)] = f_ref[i];
        }

        let delta = match linalg::solve(&jac, &(-residual)) {
            Ok(delta) => delta,
            Err(DynamicsError::SingularMatrix { .. }) => {
                return Err(DynamicsError::SingularJacobian {
                    iteration: iteration + 1,
                })
            }
            Err(err) => return Err(err),
        };

        // Keep the period positive by shortening the update.
        let mut lambda = 1.0;
        while period + lambda * delta[n] <= 0.0 && lambda > 1e-6 {
            lambda *= 0.5;
        }
        for i in 0..n {
            x0[i] += lambda * delta[i];
        }
        period += lambda * delta[n];
        if period <= 0.0 || !period.is_finite() {
            break;
        }
    }

    Err(DynamicsError::NoConvergence {
        iterations: settings.max_iterations,
        residual_norm,
    })
}

/// `φ_T(x0)` and `∂φ_T/∂x0`.
fn flow_with_monodromy<M: Model + ?Sized>(
    variational: &VariationalModel<'_, M>,
    x0: &[f64],
    params: &[f64],
    period: f64,
    options: &IntegratorOptions,
) -> Result<(Vec<f64>, DMatrix<f64>)> {
    let options = IntegratorOptions {
        sample_interval: Some(period),
        ..*options
    };
    let trajectory = integrate_values(
        variational,
        &variational.initial_state(x0),
        params,
        (0.0, period),
        &options,
    )?;
    let (_, end) = trajectory
        .last()
        .ok_or_else(|| DynamicsError::InvalidInput("integration produced no samples".to_string()))?;
    Ok(variational.split(end))
}

fn finish<M: Model + ?Sized>(
    model: &M,
    x0: Vec<f64>,
    period: f64,
    floquet_multipliers: Vec<Complex<f64>>,
    parameters: Parameters,
    options: &IntegratorOptions,
    samples: usize,
) -> Result<LimitCycle> {
    let options = IntegratorOptions {
        sample_interval: Some(period / samples as f64),
        ..*options
    };
    let trajectory = integrate_values(model, &x0, parameters.values(), (0.0, period), &options)?;

    let n = model.dimension();
    let amplitude = (0..n)
        .map(|i| {
            let (lo, hi) = trajectory
                .states
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
                    (lo.min(s[i]), hi.max(s[i]))
                });
            0.5 * (hi - lo)
        })
        .fold(0.0, f64::max);
    let stable = nontrivial_multipliers(&floquet_multipliers)
        .iter()
        .all(|m| m.norm() < 1.0);

    log::info!(
        "limit cycle converged: period {period}, amplitude {amplitude:e}, {}",
        if stable { "stable" } else { "unstable" }
    );
    Ok(LimitCycle {
        period,
        samples: trajectory.states,
        floquet_multipliers,
        parameters,
        amplitude,
        stable,
    })
}

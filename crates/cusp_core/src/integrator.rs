//! Trajectory integration with adaptive error control and dense output.

use crate::ensure_input;
use crate::error::{DynamicsError, Result};
use crate::jacobian::{state_jacobian_or_fd, DEFAULT_FD_STEP};
use crate::params::Parameters;
use crate::solvers::{AdaptiveStepper, Bdf2, DormandPrince45, StepEstimate, Tolerance, RK4};
use crate::traits::{Model, Steppable};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::cell::Cell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Method {
    /// Dormand–Prince 5(4).
    #[default]
    Rk45,
    /// Variable-step BDF2 for stiff problems.
    Bdf,
    /// Fixed-step classic Runge–Kutta; `initial_step` is the step.
    Rk4,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorOptions {
    pub method: Method,
    pub atol: f64,
    pub rtol: f64,
    /// `None` picks `1e-3` of the span.
    pub initial_step: Option<f64>,
    pub min_step: f64,
    /// `None` allows steps up to the whole span.
    pub max_step: Option<f64>,
    pub max_steps: usize,
    /// Record samples on the grid `t0 + k·dt` instead of at accepted steps.
    pub sample_interval: Option<f64>,
    pub safety: f64,
    pub rejection_factor: f64,
    pub min_rejection_factor: f64,
    pub max_growth: f64,
}

impl Default for IntegratorOptions {
    fn default() -> Self {
        Self {
            method: Method::Rk45,
            atol: 1e-8,
            rtol: 1e-6,
            initial_step: None,
            min_step: 1e-12,
            max_step: None,
            max_steps: 100_000,
            sample_interval: None,
            safety: 0.9,
            rejection_factor: 0.5,
            min_rejection_factor: 0.1,
            max_growth: 5.0,
        }
    }
}

impl IntegratorOptions {
    pub fn validate(&self) -> Result<()> {
        ensure_input!(
            self.atol.is_finite() && self.atol > 0.0,
            "atol must be positive, got {}",
            self.atol
        );
        ensure_input!(
            self.rtol.is_finite() && self.rtol >= 0.0,
            "rtol must be non-negative, got {}",
            self.rtol
        );
        ensure_input!(
            self.min_step.is_finite() && self.min_step > 0.0,
            "min_step must be positive, got {}",
            self.min_step
        );
        if let Some(h) = self.initial_step {
            ensure_input!(h.is_finite() && h > 0.0, "initial_step must be positive, got {}", h);
        }
        if let Some(h) = self.max_step {
            ensure_input!(
                h.is_finite() && h >= self.min_step,
                "max_step must be at least min_step ({}), got {}",
                self.min_step,
                h
            );
        }
        if let Some(dt) = self.sample_interval {
            ensure_input!(
                dt.is_finite() && dt > 0.0,
                "sample_interval must be positive, got {}",
                dt
            );
        }
        ensure_input!(self.max_steps > 0, "max_steps must be greater than zero");
        ensure_input!(
            self.safety > 0.0 && self.safety <= 1.0,
            "safety factor must lie in (0, 1], got {}",
            self.safety
        );
        ensure_input!(
            self.min_rejection_factor > 0.0
                && self.min_rejection_factor <= self.rejection_factor
                && self.rejection_factor < 1.0,
            "rejection factors must satisfy 0 < min_rejection_factor <= rejection_factor < 1"
        );
        ensure_input!(
            self.max_growth.is_finite() && self.max_growth >= 1.0,
            "max_growth must be at least 1, got {}",
            self.max_growth
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationStats {
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    pub rhs_evaluations: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub times: Vec<f64>,
    pub states: Vec<Vec<f64>>,
    pub stats: IntegrationStats,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn last(&self) -> Option<(f64, &[f64])> {
        self.times
            .last()
            .zip(self.states.last())
            .map(|(t, s)| (*t, s.as_slice()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, &[f64])> + '_ {
        self.times
            .iter()
            .copied()
            .zip(self.states.iter().map(Vec::as_slice))
    }
}

/// Integrates `model` from `state0` over `t_span = (t0, t1)`.
pub fn integrate<M: Model + ?Sized>(
    model: &M,
    state0: &[f64],
    params: &Parameters,
    t_span: (f64, f64),
    options: &IntegratorOptions,
) -> Result<Trajectory> {
    let aligned = params.aligned_to(model)?;
    integrate_values(model, state0, aligned.values(), t_span, options)
}

/// End state of [`integrate`] without keeping the samples.
pub fn integrate_final<M: Model + ?Sized>(
    model: &M,
    state0: &[f64],
    params: &Parameters,
    t_span: (f64, f64),
    options: &IntegratorOptions,
) -> Result<Vec<f64>> {
    let aligned = params.aligned_to(model)?;
    let mut options = *options;
    // Only the end point is needed.
    options.sample_interval = Some(t_span.1 - t_span.0);
    let trajectory = integrate_values(model, state0, aligned.values(), t_span, &options)?;
    trajectory
        .states
        .into_iter()
        .last()
        .ok_or_else(|| DynamicsError::InvalidInput("integration produced no samples".to_string()))
}

/// [`integrate`] with parameter values already in model order.
pub(crate) fn integrate_values<M: Model + ?Sized>(
    model: &M,
    state0: &[f64],
    params: &[f64],
    t_span: (f64, f64),
    options: &IntegratorOptions,
) -> Result<Trajectory> {
    options.validate()?;
    let dim = model.dimension();
    let (t0, t1) = t_span;
    ensure_input!(dim > 0, "model has zero dimension");
    ensure_input!(
        state0.len() == dim,
        "initial state has length {}, model dimension is {}",
        state0.len(),
        dim
    );
    ensure_input!(
        state0.iter().all(|v| v.is_finite()),
        "initial state contains non-finite values"
    );
    ensure_input!(
        params.len() == model.parameter_names().len(),
        "model expects {} parameters, got {}",
        model.parameter_names().len(),
        params.len()
    );
    ensure_input!(
        params.iter().all(|v| v.is_finite()),
        "parameter values must be finite"
    );
    ensure_input!(
        t0.is_finite() && t1.is_finite() && t1 > t0,
        "time span must satisfy t0 < t1, got ({}, {})",
        t0,
        t1
    );

    let counting = CountingModel::new(model);
    let mut trajectory = match options.method {
        Method::Rk4 => integrate_fixed(&counting, state0, params, t_span, options)?,
        Method::Rk45 => {
            let stepper = AdaptiveStepper::DormandPrince(DormandPrince45::new(dim));
            integrate_adaptive(&counting, stepper, state0, params, t_span, options)?
        }
        Method::Bdf => {
            let stepper = AdaptiveStepper::Bdf(Bdf2::new(dim, DEFAULT_FD_STEP));
            integrate_adaptive(&counting, stepper, state0, params, t_span, options)?
        }
    };
    trajectory.stats.rhs_evaluations = counting.calls.get();

    log::debug!(
        "integrated over [{}, {}] with {:?}: {} accepted, {} rejected, {} rhs evaluations",
        t0,
        t1,
        options.method,
        trajectory.stats.accepted_steps,
        trajectory.stats.rejected_steps,
        trajectory.stats.rhs_evaluations
    );
    Ok(trajectory)
}

fn integrate_adaptive<M: Model + ?Sized>(
    model: &M,
    mut stepper: AdaptiveStepper,
    state0: &[f64],
    params: &[f64],
    (t0, t1): (f64, f64),
    options: &IntegratorOptions,
) -> Result<Trajectory> {
    let dim = state0.len();
    let span = t1 - t0;
    let max_step = options.max_step.unwrap_or(span).min(span);
    let tol = Tolerance {
        atol: options.atol,
        rtol: options.rtol,
    };

    let mut t = t0;
    let mut y = state0.to_vec();
    let mut y_prev = y.clone();
    let mut f = vec![0.0; dim];
    model.evaluate(t, &y, params, &mut f);
    ensure_input!(
        f.iter().all(|v| v.is_finite()),
        "vector field is not finite at t = {}",
        t0
    );

    let mut h = options
        .initial_step
        .unwrap_or(1e-3 * span)
        .max(options.min_step)
        .min(max_step);
    let mut recorder = Recorder::new(t0, t1, options.sample_interval, &y);
    let mut stats = IntegrationStats::default();
    let mut attempts = 0usize;

    while t < t1 {
        if attempts >= options.max_steps {
            return Err(DynamicsError::StepBudgetExhausted {
                steps: attempts,
                t,
            });
        }
        attempts += 1;

        let remaining = t1 - t;
        let last = h >= remaining - 1e-12 * span;
        let h_try = if last { remaining } else { h };

        // BDF raises its order after the first step.
        let exponent = controller_exponent(&stepper);
        let estimate = stepper.attempt(model, params, t, &y, &f, h_try, tol);
        match estimate {
            StepEstimate::Error(err) if err <= 1.0 => {
                let t_new = if last { t1 } else { t + h_try };
                {
                    let (y_new, f_new) = stepper.proposal();
                    ensure_input!(
                        y_new.iter().all(|v| v.is_finite()),
                        "solution diverged at t = {}",
                        t_new
                    );
                    recorder.record_step(t, &y, &f, t_new, y_new, f_new);
                    y_prev.copy_from_slice(&y);
                    y.copy_from_slice(y_new);
                    f.copy_from_slice(f_new);
                }
                stepper.accept(&y_prev, h_try);
                t = t_new;
                stats.accepted_steps += 1;

                let factor = if err == 0.0 {
                    options.max_growth
                } else {
                    (options.safety * err.powf(exponent)).clamp(0.2, options.max_growth)
                };
                let factor = factor.min(stepper.growth_cap());
                h = (h_try * factor).max(options.min_step).min(max_step);
            }
            other => {
                stats.rejected_steps += 1;
                let factor = match other {
                    StepEstimate::Error(err) => (options.safety * err.powf(exponent))
                        .clamp(options.min_rejection_factor, options.rejection_factor),
                    StepEstimate::SolveFailed => options.rejection_factor,
                };
                let factor = if factor.is_finite() {
                    factor
                } else {
                    options.min_rejection_factor
                };
                h = h_try * factor;
                log::trace!("rejected step at t = {}: retrying with h = {:e}", t, h);
                if h < options.min_step {
                    return Err(DynamicsError::StepSizeUnderflow {
                        t,
                        step: h,
                        min_step: options.min_step,
                    });
                }
            }
        }
    }

    Ok(recorder.finish(stats))
}

/// `-1/(q+1)` for the order `q` of the stepper's current error estimate.
fn controller_exponent(stepper: &AdaptiveStepper) -> f64 {
    -1.0 / (stepper.error_order() as f64 + 1.0)
}

fn integrate_fixed<M: Model + ?Sized>(
    model: &M,
    state0: &[f64],
    params: &[f64],
    (t0, t1): (f64, f64),
    options: &IntegratorOptions,
) -> Result<Trajectory> {
    let dim = state0.len();
    let span = t1 - t0;
    let requested = options
        .initial_step
        .unwrap_or(1e-3 * span)
        .min(options.max_step.unwrap_or(span))
        .min(span);
    let steps = ((span / requested) - 1e-9).ceil().max(1.0) as usize;
    if steps > options.max_steps {
        return Err(DynamicsError::StepBudgetExhausted {
            steps: options.max_steps,
            t: t0,
        });
    }
    let dt = span / steps as f64;

    let mut solver = RK4::new(dim);
    let mut y = state0.to_vec();
    let mut f = vec![0.0; dim];
    let mut f_new = vec![0.0; dim];
    model.evaluate(t0, &y, params, &mut f);
    let mut recorder = Recorder::new(t0, t1, options.sample_interval, &y);
    let mut stats = IntegrationStats::default();

    for k in 0..steps {
        let t_start = t0 + k as f64 * dt;
        let mut t = t_start;
        let y_old = y.clone();
        solver.step(model, params, &mut t, &mut y, dt);
        let t_new = if k + 1 == steps { t1 } else { t };
        ensure_input!(
            y.iter().all(|v| v.is_finite()),
            "solution diverged at t = {}",
            t_new
        );
        model.evaluate(t_new, &y, params, &mut f_new);
        recorder.record_step(t_start, &y_old, &f, t_new, &y, &f_new);
        std::mem::swap(&mut f, &mut f_new);
        stats.accepted_steps += 1;
    }

    Ok(recorder.finish(stats))
}

/// Collects output samples, either at every accepted step or on a fixed grid
/// by cubic Hermite interpolation across the bracketing step.
struct Recorder {
    t0: f64,
    t1: f64,
    interval: Option<f64>,
    next_sample: usize,
    times: Vec<f64>,
    states: Vec<Vec<f64>>,
}

impl Recorder {
    fn new(t0: f64, t1: f64, interval: Option<f64>, y0: &[f64]) -> Self {
        Self {
            t0,
            t1,
            interval,
            next_sample: 1,
            times: vec![t0],
            states: vec![y0.to_vec()],
        }
    }

    fn record_step(&mut self, ta: f64, ya: &[f64], fa: &[f64], tb: f64, yb: &[f64], fb: &[f64]) {
        let Some(dt) = self.interval else {
            self.times.push(tb);
            self.states.push(yb.to_vec());
            return;
        };

        // Grid points within round-off of t1 are replaced by t1 itself.
        let end_guard = self.t1 - 1e-12 * (self.t1 - self.t0);
        loop {
            let ts = self.t0 + self.next_sample as f64 * dt;
            if ts > tb || ts >= end_guard {
                break;
            }
            self.times.push(ts);
            self.states.push(hermite(ta, ya, fa, tb, yb, fb, ts));
            self.next_sample += 1;
        }
        if tb == self.t1 {
            self.times.push(tb);
            self.states.push(yb.to_vec());
        }
    }

    fn finish(self, stats: IntegrationStats) -> Trajectory {
        Trajectory {
            times: self.times,
            states: self.states,
            stats,
        }
    }
}

fn hermite(ta: f64, ya: &[f64], fa: &[f64], tb: f64, yb: &[f64], fb: &[f64], t: f64) -> Vec<f64> {
    let h = tb - ta;
    let s = (t - ta) / h;
    let s2 = s * s;
    let s3 = s2 * s;
    let h00 = 2.0 * s3 - 3.0 * s2 + 1.0;
    let h10 = s3 - 2.0 * s2 + s;
    let h01 = -2.0 * s3 + 3.0 * s2;
    let h11 = s3 - s2;
    (0..ya.len())
        .map(|i| h00 * ya[i] + h10 * h * fa[i] + h01 * yb[i] + h11 * h * fb[i])
        .collect()
}

/// Counts right-hand-side evaluations for [`IntegrationStats`].
struct CountingModel<'a, M: ?Sized> {
    inner: &'a M,
    calls: Cell<usize>,
}

impl<'a, M: Model + ?Sized> CountingModel<'a, M> {
    fn new(inner: &'a M) -> Self {
        Self {
            inner,
            calls: Cell::new(0),
        }
    }
}

impl<'a, M: Model + ?Sized> Model for CountingModel<'a, M> {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn parameter_names(&self) -> Vec<String> {
        self.inner.parameter_names()
    }

    fn evaluate(&self, t: f64, state: &[f64], params: &[f64], out: &mut [f64]) {
        self.calls.set(self.calls.get() + 1);
        self.inner.evaluate(t, state, params, out)
    }

    fn jacobian(&self, state: &[f64], params: &[f64]) -> Option<DMatrix<f64>> {
        self.inner.jacobian(state, params)
    }
}

/// The flow together with its first variational equation:
/// `x' = f(x)`, `Φ' = J(x) Φ`, with `Φ` stored row-major after `x`.
pub struct VariationalModel<'a, M: ?Sized> {
    model: &'a M,
    fd_step: f64,
}

impl<'a, M: Model + ?Sized> VariationalModel<'a, M> {
    pub fn new(model: &'a M, fd_step: f64) -> Self {
        Self { model, fd_step }
    }

    /// `[x0, I]`.
    pub fn initial_state(&self, x0: &[f64]) -> Vec<f64> {
        let n = self.model.dimension();
        let mut state = vec![0.0; n + n * n];
        state[..n].copy_from_slice(x0);
        for i in 0..n {
            state[n + i * n + i] = 1.0;
        }
        state
    }

    /// Splits an augmented state into the point and the fundamental matrix.
    pub fn split(&self, state: &[f64]) -> (Vec<f64>, DMatrix<f64>) {
        let n = self.model.dimension();
        (
            state[..n].to_vec(),
            DMatrix::from_row_slice(n, n, &state[n..n + n * n]),
        )
    }
}

impl<'a, M: Model + ?Sized> Model for VariationalModel<'a, M> {
    fn dimension(&self) -> usize {
        let n = self.model.dimension();
        n + n * n
    }

    fn parameter_names(&self) -> Vec<String> {
        self.model.parameter_names()
    }

    fn evaluate(&self, t: f64, state: &[f64], params: &[f64], out: &mut [f64]) {
        let n = self.model.dimension();
        let x = &state[..n];
        self.model.evaluate(t, x, params, &mut out[..n]);
        let jac = state_jacobian_or_fd(self.model, t, x, params, self.fd_step);
        let phi = &state[n..];
        for i in 0..n {
            for j in 0..n {
                let mut acc = 0.0;
                for k in 0..n {
                    acc += jac[(i, k)] * phi[k * n + j];
                }
                out[n + i * n + j] = acc;
            }
        }
    }
}

use crate::jacobian::state_jacobian_or_fd;
use crate::linalg;
use crate::traits::{Model, Steppable};
use nalgebra::{DMatrix, DVector};

/// Classic Runge-Kutta 4th Order Solver
pub struct RK4 {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    tmp: Vec<f64>,
}

impl RK4 {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![0.0; dim],
            k2: vec![0.0; dim],
            k3: vec![0.0; dim],
            k4: vec![0.0; dim],
            tmp: vec![0.0; dim],
        }
    }
}

impl Steppable for RK4 {
    fn step<M: Model + ?Sized>(
        &mut self,
        model: &M,
        params: &[f64],
        t: &mut f64,
        state: &mut [f64],
        dt: f64,
    ) {
        let t0 = *t;

        // k1 = f(t, y)
        model.evaluate(t0, state, params, &mut self.k1);

        // k2 = f(t + dt/2, y + dt*k1/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k1[i] * 0.5;
        }
        model.evaluate(t0 + dt * 0.5, &self.tmp, params, &mut self.k2);

        // k3 = f(t + dt/2, y + dt*k2/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k2[i] * 0.5;
        }
        model.evaluate(t0 + dt * 0.5, &self.tmp, params, &mut self.k3);

        // k4 = f(t + dt, y + dt*k3)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k3[i];
        }
        model.evaluate(t0 + dt, &self.tmp, params, &mut self.k4);

        // y_next = y + dt/6 * (k1 + 2k2 + 2k3 + k4)
        for i in 0..state.len() {
            state[i] += dt / 6.0 * (self.k1[i] + 2.0 * self.k2[i] + 2.0 * self.k3[i] + self.k4[i]);
        }

        *t = t0 + dt;
    }
}

/// Absolute/relative tolerance pair used to scale local error estimates.
#[derive(Debug, Clone, Copy)]
pub struct Tolerance {
    pub atol: f64,
    pub rtol: f64,
}

impl Tolerance {
    /// Max over components of `|err_i| / (atol + rtol * max(|y_i|, |y_new_i|))`.
    /// NaN anywhere makes the error infinite.
    pub fn scaled_error(&self, err: &[f64], y: &[f64], y_new: &[f64]) -> f64 {
        let mut worst = 0.0f64;
        for (e, (a, b)) in err.iter().zip(y.iter().zip(y_new.iter())) {
            let scaled = e.abs() / (self.atol + self.rtol * a.abs().max(b.abs()));
            if scaled.is_nan() {
                return f64::INFINITY;
            }
            worst = worst.max(scaled);
        }
        worst
    }
}

/// Outcome of one trial step of an adaptive method.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepEstimate {
    /// Scaled local error; the step is acceptable when it is at most 1.
    Error(f64),
    /// The implicit stage equations could not be solved at this step size.
    SolveFailed,
}

/// Embedded-pair explicit and BDF implicit steppers behind one interface.
///
/// After a trial step the proposed state and its derivative are available
/// through `proposal`; `accept` commits the step's history.
pub enum AdaptiveStepper {
    DormandPrince(DormandPrince45),
    Bdf(Bdf2),
}

impl AdaptiveStepper {
    /// Order `q` of the error estimate, used in the `E^(-1/(q+1))` controller.
    pub fn error_order(&self) -> usize {
        match self {
            AdaptiveStepper::DormandPrince(_) => 4,
            AdaptiveStepper::Bdf(s) => s.current_order(),
        }
    }

    /// Upper bound on the per-step growth factor for zero-stability.
    pub fn growth_cap(&self) -> f64 {
        match self {
            AdaptiveStepper::DormandPrince(_) => f64::INFINITY,
            AdaptiveStepper::Bdf(_) => 2.0,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn attempt<M: Model + ?Sized>(
        &mut self,
        model: &M,
        params: &[f64],
        t: f64,
        y: &[f64],
        f: &[f64],
        h: f64,
        tol: Tolerance,
    ) -> StepEstimate {
        match self {
            AdaptiveStepper::DormandPrince(s) => s.attempt(model, params, t, y, f, h, tol),
            AdaptiveStepper::Bdf(s) => s.attempt(model, params, t, y, f, h, tol),
        }
    }

    /// Proposed `(y_new, f(y_new))` of the last trial step.
    pub fn proposal(&self) -> (&[f64], &[f64]) {
        match self {
            AdaptiveStepper::DormandPrince(s) => (&s.y_new, &s.k7),
            AdaptiveStepper::Bdf(s) => (&s.y_new, &s.f_new),
        }
    }

    pub fn accept(&mut self, y_prev: &[f64], h: f64) {
        if let AdaptiveStepper::Bdf(s) = self {
            s.history = Some((y_prev.to_vec(), h));
        }
    }
}

// Dormand–Prince 5(4) coefficients
const A21: f64 = 1.0 / 5.0;
const A31: f64 = 3.0 / 40.0;
const A32: f64 = 9.0 / 40.0;
const A41: f64 = 44.0 / 45.0;
const A42: f64 = -56.0 / 15.0;
const A43: f64 = 32.0 / 9.0;
const A51: f64 = 19372.0 / 6561.0;
const A52: f64 = -25360.0 / 2187.0;
const A53: f64 = 64448.0 / 6561.0;
const A54: f64 = -212.0 / 729.0;
const A61: f64 = 9017.0 / 3168.0;
const A62: f64 = -355.0 / 33.0;
const A63: f64 = 46732.0 / 5247.0;
const A64: f64 = 49.0 / 176.0;
const A65: f64 = -5103.0 / 18656.0;

// 5th-order weights (advancing solution)
const B1: f64 = 35.0 / 384.0;
const B3: f64 = 500.0 / 1113.0;
const B4: f64 = 125.0 / 192.0;
const B5: f64 = -2187.0 / 6784.0;
const B6: f64 = 11.0 / 84.0;

// Difference between 5th- and embedded 4th-order weights
const E1: f64 = B1 - 5179.0 / 57600.0;
const E3: f64 = B3 - 7571.0 / 16695.0;
const E4: f64 = B4 - 393.0 / 640.0;
const E5: f64 = B5 - -92097.0 / 339200.0;
const E6: f64 = B6 - 187.0 / 2100.0;
const E7: f64 = -1.0 / 40.0;

/// Dormand–Prince 5(4) with first-same-as-last stage reuse.
pub struct DormandPrince45 {
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    k5: Vec<f64>,
    k6: Vec<f64>,
    k7: Vec<f64>,
    tmp: Vec<f64>,
    err: Vec<f64>,
    y_new: Vec<f64>,
}

impl DormandPrince45 {
    pub fn new(dim: usize) -> Self {
        Self {
            k2: vec![0.0; dim],
            k3: vec![0.0; dim],
            k4: vec![0.0; dim],
            k5: vec![0.0; dim],
            k6: vec![0.0; dim],
            k7: vec![0.0; dim],
            tmp: vec![0.0; dim],
            err: vec![0.0; dim],
            y_new: vec![0.0; dim],
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn attempt<M: Model + ?Sized>(
        &mut self,
        model: &M,
        params: &[f64],
        t: f64,
        y: &[f64],
        k1: &[f64],
        h: f64,
        tol: Tolerance,
    ) -> StepEstimate {
        let n = y.len();

        for i in 0..n {
            self.tmp[i] = y[i] + h * A21 * k1[i];
        }
        model.evaluate(t + h / 5.0, &self.tmp, params, &mut self.k2);

        for i in 0..n {
            self.tmp[i] = y[i] + h * (A31 * k1[i] + A32 * self.k2[i]);
        }
        model.evaluate(t + 3.0 * h / 10.0, &self.tmp, params, &mut self.k3);

        for i in 0..n {
            self.tmp[i] = y[i] + h * (A41 * k1[i] + A42 * self.k2[i] + A43 * self.k3[i]);
        }
        model.evaluate(t + 4.0 * h / 5.0, &self.tmp, params, &mut self.k4);

        for i in 0..n {
            self.tmp[i] = y[i]
                + h * (A51 * k1[i] + A52 * self.k2[i] + A53 * self.k3[i] + A54 * self.k4[i]);
        }
        model.evaluate(t + 8.0 * h / 9.0, &self.tmp, params, &mut self.k5);

        for i in 0..n {
            self.tmp[i] = y[i]
                + h * (A61 * k1[i]
                    + A62 * self.k2[i]
                    + A63 * self.k3[i]
                    + A64 * self.k4[i]
                    + A65 * self.k5[i]);
        }
        model.evaluate(t + h, &self.tmp, params, &mut self.k6);

        for i in 0..n {
            self.y_new[i] = y[i]
                + h * (B1 * k1[i]
                    + B3 * self.k3[i]
                    + B4 * self.k4[i]
                    + B5 * self.k5[i]
                    + B6 * self.k6[i]);
        }

        // FSAL: k7 is f(t + h, y_new) and becomes k1 of the next step.
        model.evaluate(t + h, &self.y_new, params, &mut self.k7);

        for i in 0..n {
            self.err[i] = h
                * (E1 * k1[i]
                    + E3 * self.k3[i]
                    + E4 * self.k4[i]
                    + E5 * self.k5[i]
                    + E6 * self.k6[i]
                    + E7 * self.k7[i]);
        }

        let scaled = tol.scaled_error(&self.err, y, &self.y_new);
        if scaled.is_finite() && self.y_new.iter().all(|v| v.is_finite()) {
            StepEstimate::Error(scaled)
        } else {
            StepEstimate::Error(f64::INFINITY)
        }
    }
}

const NEWTON_ITERATIONS: usize = 10;
/// Newton corrections must shrink below this fraction of the error scale.
const NEWTON_TOLERANCE: f64 = 1e-3;

/// Variable-step BDF2, started with one implicit Euler step.
///
/// The stage equation is solved by Newton iteration started from an explicit
/// predictor. Local error is estimated from the predictor-corrector
/// difference (Milne's device).
pub struct Bdf2 {
    fd_step: f64,
    history: Option<(Vec<f64>, f64)>,
    y_pred: Vec<f64>,
    y_new: Vec<f64>,
    f_new: Vec<f64>,
    residual: Vec<f64>,
    err: Vec<f64>,
}

impl Bdf2 {
    pub fn new(dim: usize, fd_step: f64) -> Self {
        Self {
            fd_step,
            history: None,
            y_pred: vec![0.0; dim],
            y_new: vec![0.0; dim],
            f_new: vec![0.0; dim],
            residual: vec![0.0; dim],
            err: vec![0.0; dim],
        }
    }

    fn current_order(&self) -> usize {
        if self.history.is_some() {
            2
        } else {
            1
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn attempt<M: Model + ?Sized>(
        &mut self,
        model: &M,
        params: &[f64],
        t: f64,
        y: &[f64],
        f: &[f64],
        h: f64,
        tol: Tolerance,
    ) -> StepEstimate {
        let n = y.len();
        // Stage equation: y_new - constant - gamma * h * f(t + h, y_new) = 0
        let mut constant = vec![0.0; n];
        let (gamma, error_constant) = match &self.history {
            None => {
                for i in 0..n {
                    constant[i] = y[i];
                    self.y_pred[i] = y[i] + h * f[i];
                }
                (1.0, 0.5)
            }
            Some((y_prev, h_prev)) => {
                let w = h / h_prev;
                let a1 = (1.0 + w) * (1.0 + w) / (1.0 + 2.0 * w);
                let a2 = w * w / (1.0 + 2.0 * w);
                for i in 0..n {
                    constant[i] = a1 * y[i] - a2 * y_prev[i];
                    // Quadratic through y_prev and y with slope f at t.
                    let c = (y_prev[i] - y[i] + h_prev * f[i]) / (h_prev * h_prev);
                    self.y_pred[i] = y[i] + h * f[i] + h * h * c;
                }
                ((1.0 + w) / (1.0 + 2.0 * w), 0.4)
            }
        };

        let t_new = t + h;
        self.y_new.copy_from_slice(&self.y_pred);
        let mut converged = false;
        for _ in 0..NEWTON_ITERATIONS {
            let jac = state_jacobian_or_fd(model, t_new, &self.y_new, params, self.fd_step);
            let iteration_matrix = DMatrix::<f64>::identity(n, n) - jac * (gamma * h);
            model.evaluate(t_new, &self.y_new, params, &mut self.f_new);
            for i in 0..n {
                self.residual[i] = -(self.y_new[i] - constant[i] - gamma * h * self.f_new[i]);
            }
            let rhs = DVector::from_column_slice(&self.residual);
            let delta = match linalg::solve(&iteration_matrix, &rhs) {
                Ok(delta) => delta,
                Err(_) => return StepEstimate::SolveFailed,
            };
            for i in 0..n {
                self.y_new[i] += delta[i];
            }
            let size = tol.scaled_error(delta.as_slice(), y, &self.y_new);
            if !size.is_finite() {
                return StepEstimate::SolveFailed;
            }
            if size <= NEWTON_TOLERANCE {
                converged = true;
                break;
            }
        }
        if !converged {
            return StepEstimate::SolveFailed;
        }

        model.evaluate(t_new, &self.y_new, params, &mut self.f_new);
        for i in 0..n {
            self.err[i] = error_constant * (self.y_new[i] - self.y_pred[i]);
        }
        StepEstimate::Error(tol.scaled_error(&self.err, y, &self.y_new))
    }
}

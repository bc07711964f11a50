use crate::error::{DynamicsError, Result};
use crate::jacobian::{evaluate, state_jacobian, DEFAULT_FD_STEP};
use crate::linalg;
use crate::params::Parameters;
use crate::stability::{
    classify, FixedPointKind, TestFunctionValues, DEFAULT_STABILITY_TOLERANCE,
};
use crate::traits::Model;
use crate::ensure_input;
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonSettings {
    pub max_iterations: usize,
    /// Converged when `‖f(x)‖ < ftol`.
    pub ftol: f64,
    /// Converged when the undamped Newton step is shorter than `xtol`.
    pub xtol: f64,
    pub max_damping_halvings: usize,
    pub fd_step: f64,
    /// Half-width of the band around the imaginary axis treated as marginal.
    pub stability_tolerance: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            ftol: 1e-10,
            xtol: 1e-12,
            max_damping_halvings: 10,
            fd_step: DEFAULT_FD_STEP,
            stability_tolerance: DEFAULT_STABILITY_TOLERANCE,
        }
    }
}

impl NewtonSettings {
    pub fn validate(&self) -> Result<()> {
        ensure_input!(self.max_iterations > 0, "max_iterations must be greater than zero");
        ensure_input!(
            self.ftol.is_finite() && self.ftol > 0.0,
            "ftol must be positive, got {}",
            self.ftol
        );
        ensure_input!(
            self.xtol.is_finite() && self.xtol > 0.0,
            "xtol must be positive, got {}",
            self.xtol
        );
        ensure_input!(
            self.fd_step.is_finite() && self.fd_step > 0.0,
            "fd_step must be positive, got {}",
            self.fd_step
        );
        ensure_input!(
            self.stability_tolerance.is_finite() && self.stability_tolerance > 0.0,
            "stability_tolerance must be positive, got {}",
            self.stability_tolerance
        );
        Ok(())
    }
}

/// A converged equilibrium together with its linearization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedPoint {
    pub state: Vec<f64>,
    pub parameters: Parameters,
    /// `∂f/∂x` at `state`, row-major.
    pub jacobian: Vec<f64>,
    pub eigenvalues: Vec<Complex<f64>>,
    pub stable: bool,
    pub marginal: bool,
    pub kind: FixedPointKind,
    pub residual_norm: f64,
    pub iterations: usize,
}

impl FixedPoint {
    pub fn dimension(&self) -> usize {
        self.state.len()
    }

    pub fn jacobian_matrix(&self) -> DMatrix<f64> {
        let n = self.dimension();
        DMatrix::from_row_slice(n, n, &self.jacobian)
    }

    pub fn test_functions(&self) -> TestFunctionValues {
        TestFunctionValues::from_spectrum(
            linalg::determinant(&self.jacobian_matrix()),
            &self.eigenvalues,
        )
    }
}

/// Locates an equilibrium of `model` near `guess` by damped Newton iteration
/// and classifies its stability.
pub fn find_fixed_point<M: Model + ?Sized>(
    model: &M,
    guess: &[f64],
    params: &Parameters,
    settings: &NewtonSettings,
) -> Result<FixedPoint> {
    settings.validate()?;
    let params = params.aligned_to(model)?;
    let dim = model.dimension();
    ensure_input!(dim > 0, "model has zero dimension");
    ensure_input!(
        guess.len() == dim,
        "initial guess has length {}, model dimension is {}",
        guess.len(),
        dim
    );
    ensure_input!(
        guess.iter().all(|v| v.is_finite()),
        "initial guess contains non-finite values"
    );

    let outcome = newton_solve(model, guess, params.values(), settings)?;
    log::debug!(
        "Newton converged in {} iterations (‖f‖ = {:e})",
        outcome.iterations,
        outcome.residual_norm
    );
    assemble_fixed_point(model, outcome, params, settings)
}

pub(crate) struct NewtonOutcome {
    pub state: Vec<f64>,
    pub residual_norm: f64,
    pub iterations: usize,
}

/// Damped Newton on `f(x) = 0` with parameter values in model order.
pub(crate) fn newton_solve<M: Model + ?Sized>(
    model: &M,
    guess: &[f64],
    params: &[f64],
    settings: &NewtonSettings,
) -> Result<NewtonOutcome> {
    let mut x = guess.to_vec();
    let mut f = evaluate(model, 0.0, &x, params);
    let mut f_norm = linalg::norm(&f);
    if f_norm < settings.ftol {
        return Ok(NewtonOutcome {
            state: x,
            residual_norm: f_norm,
            iterations: 0,
        });
    }
    if !f_norm.is_finite() {
        return Err(DynamicsError::NoConvergence {
            iterations: 0,
            residual_norm: f_norm,
        });
    }

    let mut last_step: Option<Vec<f64>> = None;
    for iteration in 1..=settings.max_iterations {
        let jac = state_jacobian(model, 0.0, &x, params, settings.fd_step)?;
        let rhs = DVector::from_iterator(f.len(), f.iter().map(|v| -v));
        let dx = match linalg::solve(&jac, &rhs) {
            Ok(dx) => dx,
            Err(DynamicsError::SingularMatrix { .. }) => {
                let Some(step) = last_step.as_ref() else {
                    return Err(DynamicsError::SingularJacobian { iteration });
                };
                let recovered = back_off(model, &x, step, params, settings)
                    .ok_or(DynamicsError::SingularJacobian { iteration })?;
                log::debug!("singular Jacobian at iteration {iteration}, backed off along last step");
                x = recovered;
                f = evaluate(model, 0.0, &x, params);
                f_norm = linalg::norm(&f);
                last_step = None;
                continue;
            }
            Err(DynamicsError::InvalidInput(_)) => {
                // Non-finite Jacobian entries.
                return Err(DynamicsError::NoConvergence {
                    iterations: iteration,
                    residual_norm: f_norm,
                });
            }
            Err(other) => return Err(other),
        };

        let mut damping = 1.0;
        let mut trial: Vec<f64> = x.iter().zip(dx.iter()).map(|(a, d)| a + d).collect();
        let mut f_trial = evaluate(model, 0.0, &trial, params);
        let mut trial_norm = linalg::norm(&f_trial);
        let mut halvings = 0;
        while !(trial_norm < f_norm) && halvings < settings.max_damping_halvings {
            damping *= 0.5;
            halvings += 1;
            for i in 0..x.len() {
                trial[i] = x[i] + damping * dx[i];
            }
            f_trial = evaluate(model, 0.0, &trial, params);
            trial_norm = linalg::norm(&f_trial);
        }

        last_step = Some(x.iter().zip(trial.iter()).map(|(a, b)| b - a).collect());
        x = trial;
        f = f_trial;
        f_norm = trial_norm;

        if !f_norm.is_finite() {
            return Err(DynamicsError::NoConvergence {
                iterations: iteration,
                residual_norm: f_norm,
            });
        }
        if f_norm < settings.ftol || dx.norm() < settings.xtol {
            return Ok(NewtonOutcome {
                state: x,
                residual_norm: f_norm,
                iterations: iteration,
            });
        }
    }

    Err(DynamicsError::NoConvergence {
        iterations: settings.max_iterations,
        residual_norm: f_norm,
    })
}

/// Retreats from `x` along the last accepted step with halving fractions
/// until the Jacobian becomes nonsingular.
fn back_off<M: Model + ?Sized>(
    model: &M,
    x: &[f64],
    step: &[f64],
    params: &[f64],
    settings: &NewtonSettings,
) -> Option<Vec<f64>> {
    let mut fraction = 0.5;
    for _ in 0..settings.max_damping_halvings.max(1) {
        let candidate: Vec<f64> = x.iter().zip(step.iter()).map(|(a, s)| a - fraction * s).collect();
        if let Ok(jac) = state_jacobian(model, 0.0, &candidate, params, settings.fd_step) {
            let probe = DVector::from_element(x.len(), 1.0);
            if linalg::solve(&jac, &probe).is_ok() {
                return Some(candidate);
            }
        }
        fraction *= 0.5;
    }
    None
}

/// Evaluates the Jacobian at a converged state and attaches the stability data.
pub(crate) fn assemble_fixed_point<M: Model + ?Sized>(
    model: &M,
    outcome: NewtonOutcome,
    parameters: Parameters,
    settings: &NewtonSettings,
) -> Result<FixedPoint> {
    let jac = state_jacobian(model, 0.0, &outcome.state, parameters.values(), settings.fd_step)?;
    let report = classify(&jac, settings.stability_tolerance)?;
    let n = jac.nrows();
    let mut jacobian = Vec::with_capacity(n * n);
    for i in 0..n {
        for j in 0..n {
            jacobian.push(jac[(i, j)]);
        }
    }

    Ok(FixedPoint {
        state: outcome.state,
        parameters,
        jacobian,
        eigenvalues: report.eigenvalues,
        stable: report.stable,
        marginal: report.marginal,
        kind: report.kind,
        residual_norm: outcome.residual_norm,
        iterations: outcome.iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LinearDecay, Lorenz, SaddleNodeNormalForm};
    use crate::traits::FnModel;

    fn lorenz_params() -> Parameters {
        Parameters::new([("sigma", 10.0), ("rho", 28.0), ("beta", 8.0 / 3.0)]).expect("params")
    }

    #[test]
    fn linear_sink_converges_to_origin() {
        let model = FnModel::new(2, &[], |_t, x, _p, out| {
            out[0] = -x[0];
            out[1] = -2.0 * x[1];
        });
        let point = find_fixed_point(&model, &[3.0, -1.0], &Parameters::empty(), &NewtonSettings::default())
            .expect("converges");
        assert!(point.state.iter().all(|v| v.abs() < 1e-12));
        assert!(point.stable);
        assert!(!point.marginal);
        assert_eq!(point.kind, FixedPointKind::StableNode);
        assert_eq!(point.iterations, 1);
    }

    #[test]
    fn linear_decay_reaches_origin_from_any_guess() {
        let params = Parameters::new([("k", 1.0)]).expect("params");
        for guess in [1e-3, -1e-3, 5.0, -1e6] {
            let point = find_fixed_point(&LinearDecay, &[guess], &params, &NewtonSettings::default())
                .unwrap_or_else(|err| panic!("guess {guess}: {err}"));
            assert!(point.state[0].abs() < 1e-12, "guess {guess}: {:?}", point.state);
            assert!(point.stable);
            assert_eq!(point.eigenvalues, vec![Complex::new(-1.0, 0.0)]);
        }
    }

    #[test]
    fn lorenz_equilibria_and_stability() {
        let model = Lorenz;
        let params = lorenz_params();
        let settings = NewtonSettings::default();

        let origin = find_fixed_point(&model, &[0.1, -0.1, 0.2], &params, &settings).expect("origin");
        assert!(origin.state.iter().all(|v| v.abs() < 1e-9), "{:?}", origin.state);
        assert!(!origin.stable);
        assert_eq!(origin.kind, FixedPointKind::Saddle);

        let c = (8.0f64 / 3.0 * 27.0).sqrt();
        for sign in [1.0, -1.0] {
            let guess = [sign * 8.0, sign * 8.0, 26.0];
            let point = find_fixed_point(&model, &guess, &params, &settings).expect("C±");
            assert!((point.state[0] - sign * c).abs() < 1e-8);
            assert!((point.state[1] - sign * c).abs() < 1e-8);
            assert!((point.state[2] - 27.0).abs() < 1e-8);
            assert!(!point.stable);

            let real: Vec<_> = point.eigenvalues.iter().filter(|l| l.im == 0.0).collect();
            let complex: Vec<_> = point.eigenvalues.iter().filter(|l| l.im != 0.0).collect();
            assert_eq!(real.len(), 1);
            assert!(real[0].re < 0.0);
            assert_eq!(complex.len(), 2);
            assert!(complex.iter().all(|l| l.re > 0.0));
            assert_eq!(*complex[0], complex[1].conj());
        }
    }

    #[test]
    fn results_are_bit_reproducible() {
        let model = Lorenz;
        let params = lorenz_params();
        let settings = NewtonSettings::default();
        let a = find_fixed_point(&model, &[7.0, 9.0, 25.0], &params, &settings).expect("first");
        let b = find_fixed_point(&model, &[7.0, 9.0, 25.0], &params, &settings).expect("second");
        assert_eq!(a, b);
    }

    #[test]
    fn no_real_root_reports_no_convergence() {
        // x' = 1 + x² has no equilibrium.
        let model = FnModel::new(1, &[], |_t, x, _p, out| out[0] = 1.0 + x[0] * x[0]);
        let settings = NewtonSettings {
            max_iterations: 20,
            ..NewtonSettings::default()
        };
        match find_fixed_point(&model, &[0.5], &Parameters::empty(), &settings) {
            Err(DynamicsError::NoConvergence { iterations, residual_norm }) => {
                assert_eq!(iterations, 20);
                assert!(residual_norm >= 1.0);
            }
            other => panic!("expected NoConvergence, got {other:?}"),
        }
    }

    #[test]
    fn singular_first_jacobian_is_reported() {
        // f'(0) = 0 for p - x² at the initial guess.
        let model = SaddleNodeNormalForm;
        let params = Parameters::new([("p", 1.0)]).expect("params");
        match find_fixed_point(&model, &[0.0], &params, &NewtonSettings::default()) {
            Err(DynamicsError::SingularJacobian { iteration }) => assert_eq!(iteration, 1),
            other => panic!("expected SingularJacobian, got {other:?}"),
        }
    }

    #[test]
    fn rejects_invalid_input() {
        let model = SaddleNodeNormalForm;
        let params = Parameters::new([("p", 1.0)]).expect("params");
        let settings = NewtonSettings::default();
        assert!(matches!(
            find_fixed_point(&model, &[1.0, 2.0], &params, &settings),
            Err(DynamicsError::InvalidInput(_))
        ));
        let bad = NewtonSettings {
            ftol: -1.0,
            ..settings
        };
        assert!(matches!(
            find_fixed_point(&model, &[1.0], &params, &bad),
            Err(DynamicsError::InvalidInput(_))
        ));
        assert!(matches!(
            find_fixed_point(&model, &[1.0], &Parameters::empty(), &settings),
            Err(DynamicsError::InvalidInput(_))
        ));
    }

    #[test]
    fn saddle_node_branches_have_opposite_stability() {
        let model = SaddleNodeNormalForm;
        let params = Parameters::new([("p", 4.0)]).expect("params");
        let settings = NewtonSettings::default();
        let upper = find_fixed_point(&model, &[1.5], &params, &settings).expect("upper");
        let lower = find_fixed_point(&model, &[-1.5], &params, &settings).expect("lower");
        assert!((upper.state[0] - 2.0).abs() < 1e-10);
        assert!(upper.stable);
        assert!((lower.state[0] + 2.0).abs() < 1e-10);
        assert!(!lower.stable);
        assert!(upper.test_functions().fold * lower.test_functions().fold < 0.0);
    }
}

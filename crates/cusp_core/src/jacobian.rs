//! Jacobians of a [`Model`]: analytic when supplied, central differences otherwise.

use crate::ensure_input;
use crate::error::Result;
use crate::traits::Model;
use nalgebra::{DMatrix, DVector};

/// Default relative step for central differences: `h_i = 1e-6 * max(1, |x_i|)`.
pub const DEFAULT_FD_STEP: f64 = 1e-6;

/// Evaluates `f(t, state)` into a fresh vector.
pub fn evaluate<M: Model + ?Sized>(model: &M, t: f64, state: &[f64], params: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; model.dimension()];
    model.evaluate(t, state, params, &mut out);
    out
}

/// `∂f/∂x` at `(state, params)`.
///
/// Uses the model's analytic Jacobian when available and rejects one with
/// the wrong shape.
pub fn state_jacobian<M: Model + ?Sized>(
    model: &M,
    t: f64,
    state: &[f64],
    params: &[f64],
    fd_step: f64,
) -> Result<DMatrix<f64>> {
    let dim = model.dimension();
    if let Some(jac) = model.jacobian(state, params) {
        ensure_input!(
            jac.nrows() == dim && jac.ncols() == dim,
            "analytic Jacobian is {}x{}, expected {}x{}",
            jac.nrows(),
            jac.ncols(),
            dim,
            dim
        );
        return Ok(jac);
    }
    Ok(finite_difference_jacobian(model, t, state, params, fd_step))
}

/// Like [`state_jacobian`] but never fails: a malformed analytic Jacobian is
/// replaced by finite differences. Used inside right-hand sides that cannot
/// propagate errors.
pub(crate) fn state_jacobian_or_fd<M: Model + ?Sized>(
    model: &M,
    t: f64,
    state: &[f64],
    params: &[f64],
    fd_step: f64,
) -> DMatrix<f64> {
    let dim = model.dimension();
    match model.jacobian(state, params) {
        Some(jac) if jac.nrows() == dim && jac.ncols() == dim => jac,
        _ => finite_difference_jacobian(model, t, state, params, fd_step),
    }
}

pub fn finite_difference_jacobian<M: Model + ?Sized>(
    model: &M,
    t: f64,
    state: &[f64],
    params: &[f64],
    fd_step: f64,
) -> DMatrix<f64> {
    let dim = model.dimension();
    let mut jac = DMatrix::zeros(dim, dim);
    let mut perturbed = state.to_vec();
    let mut plus = vec![0.0; dim];
    let mut minus = vec![0.0; dim];

    for j in 0..dim {
        let h = fd_step * state[j].abs().max(1.0);
        perturbed[j] = state[j] + h;
        model.evaluate(t, &perturbed, params, &mut plus);
        perturbed[j] = state[j] - h;
        model.evaluate(t, &perturbed, params, &mut minus);
        perturbed[j] = state[j];
        for i in 0..dim {
            jac[(i, j)] = (plus[i] - minus[i]) / (2.0 * h);
        }
    }
    jac
}

/// `∂f/∂p_index` by central differences.
pub fn parameter_derivative<M: Model + ?Sized>(
    model: &M,
    t: f64,
    state: &[f64],
    params: &[f64],
    index: usize,
    fd_step: f64,
) -> DVector<f64> {
    let dim = model.dimension();
    let mut perturbed = params.to_vec();
    let h = fd_step * params[index].abs().max(1.0);
    let mut plus = vec![0.0; dim];
    let mut minus = vec![0.0; dim];

    perturbed[index] = params[index] + h;
    model.evaluate(t, state, &perturbed, &mut plus);
    perturbed[index] = params[index] - h;
    model.evaluate(t, state, &perturbed, &mut minus);

    DVector::from_iterator(
        dim,
        plus.iter().zip(minus.iter()).map(|(p, m)| (p - m) / (2.0 * h)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::FnModel;

    fn cubic() -> FnModel {
        // f(x, y) = (x^3 + a*y, sin(x) * y)
        FnModel::new(2, &["a"], |_t, x, p, out| {
            out[0] = x[0].powi(3) + p[0] * x[1];
            out[1] = x[0].sin() * x[1];
        })
    }

    #[test]
    fn finite_differences_match_analytic_derivatives() {
        let model = cubic();
        let state = [1.3, -0.7];
        let jac = state_jacobian(&model, 0.0, &state, &[2.0], DEFAULT_FD_STEP).expect("jacobian");
        assert!((jac[(0, 0)] - 3.0 * 1.3f64.powi(2)).abs() < 1e-7);
        assert!((jac[(0, 1)] - 2.0).abs() < 1e-8);
        assert!((jac[(1, 0)] - 1.3f64.cos() * -0.7).abs() < 1e-8);
        assert!((jac[(1, 1)] - 1.3f64.sin()).abs() < 1e-8);
    }

    #[test]
    fn parameter_derivative_by_central_difference() {
        let model = cubic();
        let dp = parameter_derivative(&model, 0.0, &[1.0, -0.7], &[2.0], 0, DEFAULT_FD_STEP);
        assert!((dp[0] + 0.7).abs() < 1e-8);
        assert!(dp[1].abs() < 1e-12);
    }

    #[test]
    fn analytic_jacobian_shape_is_checked() {
        let model = FnModel::new(2, &[], |_t, x, _p, out| {
            out[0] = x[1];
            out[1] = -x[0];
        })
        .with_jacobian(|_x, _p| DMatrix::zeros(3, 3));

        let err = state_jacobian(&model, 0.0, &[0.0, 0.0], &[], DEFAULT_FD_STEP)
            .expect_err("shape mismatch");
        assert!(format!("{err}").contains("expected 2x2"));

        let fallback = state_jacobian_or_fd(&model, 0.0, &[0.0, 0.0], &[], DEFAULT_FD_STEP);
        assert!((fallback[(0, 1)] - 1.0).abs() < 1e-9);
        assert!((fallback[(1, 0)] + 1.0).abs() < 1e-9);
    }
}

//! Reference vector fields with analytic Jacobians.
//!
//! Each model is a unit struct; parameter order is given by
//! [`Model::parameter_names`].

use crate::traits::Model;
use nalgebra::DMatrix;

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// `x' = y, y' = -ω² x`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HarmonicOscillator;

impl Model for HarmonicOscillator {
    fn dimension(&self) -> usize {
        2
    }

    fn parameter_names(&self) -> Vec<String> {
        names(&["omega"])
    }

    fn evaluate(&self, _t: f64, x: &[f64], p: &[f64], out: &mut [f64]) {
        out[0] = x[1];
        out[1] = -p[0] * p[0] * x[0];
    }

    fn jacobian(&self, _x: &[f64], p: &[f64]) -> Option<DMatrix<f64>> {
        Some(DMatrix::from_row_slice(2, 2, &[0.0, 1.0, -p[0] * p[0], 0.0]))
    }
}

/// `x' = -k x`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearDecay;

impl Model for LinearDecay {
    fn dimension(&self) -> usize {
        1
    }

    fn parameter_names(&self) -> Vec<String> {
        names(&["k"])
    }

    fn evaluate(&self, _t: f64, x: &[f64], p: &[f64], out: &mut [f64]) {
        out[0] = -p[0] * x[0];
    }

    fn jacobian(&self, _x: &[f64], p: &[f64]) -> Option<DMatrix<f64>> {
        Some(DMatrix::from_element(1, 1, -p[0]))
    }
}

/// Saddle-node normal form `x' = p - x²`: two equilibria `±√p` for `p > 0`
/// that collide at `p = 0`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SaddleNodeNormalForm;

impl Model for SaddleNodeNormalForm {
    fn dimension(&self) -> usize {
        1
    }

    fn parameter_names(&self) -> Vec<String> {
        names(&["p"])
    }

    fn evaluate(&self, _t: f64, x: &[f64], p: &[f64], out: &mut [f64]) {
        out[0] = p[0] - x[0] * x[0];
    }

    fn jacobian(&self, x: &[f64], _p: &[f64]) -> Option<DMatrix<f64>> {
        Some(DMatrix::from_element(1, 1, -2.0 * x[0]))
    }
}

/// Supercritical Hopf normal form with unit frequency:
///
/// ```text
/// x' = p x - y - x (x² + y²)
/// y' = x + p y - y (x² + y²)
/// ```
///
/// The origin loses stability at `p = 0`; for `p > 0` the stable cycle has
/// radius `√p` and period `2π`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HopfNormalForm;

impl Model for HopfNormalForm {
    fn dimension(&self) -> usize {
        2
    }

    fn parameter_names(&self) -> Vec<String> {
        names(&["p"])
    }

    fn evaluate(&self, _t: f64, x: &[f64], p: &[f64], out: &mut [f64]) {
        let r2 = x[0] * x[0] + x[1] * x[1];
        out[0] = p[0] * x[0] - x[1] - x[0] * r2;
        out[1] = x[0] + p[0] * x[1] - x[1] * r2;
    }

    fn jacobian(&self, x: &[f64], p: &[f64]) -> Option<DMatrix<f64>> {
        let (u, v) = (x[0], x[1]);
        Some(DMatrix::from_row_slice(
            2,
            2,
            &[
                p[0] - 3.0 * u * u - v * v,
                -1.0 - 2.0 * u * v,
                1.0 - 2.0 * u * v,
                p[0] - u * u - 3.0 * v * v,
            ],
        ))
    }
}

/// Lorenz system with parameters `sigma, rho, beta`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lorenz;

impl Model for Lorenz {
    fn dimension(&self) -> usize {
        3
    }

    fn parameter_names(&self) -> Vec<String> {
        names(&["sigma", "rho", "beta"])
    }

    fn evaluate(&self, _t: f64, x: &[f64], p: &[f64], out: &mut [f64]) {
        let (sigma, rho, beta) = (p[0], p[1], p[2]);
        out[0] = sigma * (x[1] - x[0]);
        out[1] = x[0] * (rho - x[2]) - x[1];
        out[2] = x[0] * x[1] - beta * x[2];
    }

    fn jacobian(&self, x: &[f64], p: &[f64]) -> Option<DMatrix<f64>> {
        let (sigma, rho, beta) = (p[0], p[1], p[2]);
        Some(DMatrix::from_row_slice(
            3,
            3,
            &[
                -sigma, sigma, 0.0,
                rho - x[2], -1.0, -x[0],
                x[1], x[0], -beta,
            ],
        ))
    }
}

/// FitzHugh–Nagumo neuron with parameters `a, b, epsilon, current`:
///
/// ```text
/// v' = v - v³/3 - w + current
/// w' = epsilon (v + a - b w)
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct FitzHughNagumo;

impl Model for FitzHughNagumo {
    fn dimension(&self) -> usize {
        2
    }

    fn parameter_names(&self) -> Vec<String> {
        names(&["a", "b", "epsilon", "current"])
    }

    fn evaluate(&self, _t: f64, x: &[f64], p: &[f64], out: &mut [f64]) {
        let (v, w) = (x[0], x[1]);
        out[0] = v - v * v * v / 3.0 - w + p[3];
        out[1] = p[2] * (v + p[0] - p[1] * w);
    }

    fn jacobian(&self, x: &[f64], p: &[f64]) -> Option<DMatrix<f64>> {
        Some(DMatrix::from_row_slice(
            2,
            2,
            &[1.0 - x[0] * x[0], -1.0, p[2], -p[2] * p[1]],
        ))
    }
}

/// Van der Pol oscillator `x' = y, y' = mu (1 - x²) y - x`; stiff for large `mu`.
#[derive(Debug, Clone, Copy, Default)]
pub struct VanDerPol;

impl Model for VanDerPol {
    fn dimension(&self) -> usize {
        2
    }

    fn parameter_names(&self) -> Vec<String> {
        names(&["mu"])
    }

    fn evaluate(&self, _t: f64, x: &[f64], p: &[f64], out: &mut [f64]) {
        out[0] = x[1];
        out[1] = p[0] * (1.0 - x[0] * x[0]) * x[1] - x[0];
    }

    fn jacobian(&self, x: &[f64], p: &[f64]) -> Option<DMatrix<f64>> {
        let mu = p[0];
        Some(DMatrix::from_row_slice(
            2,
            2,
            &[0.0, 1.0, -2.0 * mu * x[0] * x[1] - 1.0, mu * (1.0 - x[0] * x[0])],
        ))
    }
}

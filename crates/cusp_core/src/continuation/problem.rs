use crate::equilibrium::FixedPoint;
use crate::error::Result;
use crate::stability::TestFunctionValues;
use nalgebra::{DMatrix, DVector};

/// Diagnostics reported by a continuation problem at a given point.
#[derive(Debug, Clone)]
pub struct PointDiagnostics {
    pub fixed_point: FixedPoint,
    pub test_values: TestFunctionValues,
}

/// Core interface implemented by any system that can be continued via PALC.
///
/// Augmented states are `[p, x_1, .., x_n]`.
pub trait ContinuationProblem {
    /// Number of state variables (excluding the continuation parameter).
    fn dimension(&self) -> usize;

    /// Evaluate the residual F(aug_state).
    fn residual(&self, aug_state: &DVector<f64>) -> Result<DVector<f64>>;

    /// Compute the extended Jacobian `[∂F/∂p | ∂F/∂x]`.
    fn extended_jacobian(&self, aug_state: &DVector<f64>) -> Result<DMatrix<f64>>;

    /// Linearization, stability and test functions at a point on the curve.
    fn diagnostics(&self, aug_state: &DVector<f64>) -> Result<PointDiagnostics>;

    /// Solves `F(p, x) = 0` for `x` with `p` held fixed.
    fn solve_at_parameter(&self, param: f64, guess: &[f64]) -> Result<DVector<f64>>;
}

//! Error taxonomy shared by every analysis entry point.

use thiserror::Error;

/// Failure conditions surfaced by the numerical core.
///
/// Recoverable conditions (rejected integration steps, damped Newton retries,
/// halved continuation steps) are handled internally and never reach callers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DynamicsError {
    #[error("matrix is singular: pivot {pivot:e} below tolerance {tolerance:e}")]
    SingularMatrix { pivot: f64, tolerance: f64 },

    #[error("step size underflow at t = {t}: step {step:e} below minimum {min_step:e}")]
    StepSizeUnderflow { t: f64, step: f64, min_step: f64 },

    #[error("integration exhausted its budget of {steps} steps at t = {t}")]
    StepBudgetExhausted { steps: usize, t: f64 },

    #[error("Newton solver failed to converge in {iterations} steps (‖f(x)‖ = {residual_norm:e})")]
    NoConvergence { iterations: usize, residual_norm: f64 },

    #[error("Jacobian is singular at Newton iteration {iteration}")]
    SingularJacobian { iteration: usize },

    #[error("branch stalled after {points} points at step size {step_size:e}: {reason}")]
    StalledBranch {
        points: usize,
        step_size: f64,
        reason: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, DynamicsError>;

/// Returns early with [`DynamicsError::InvalidInput`] when the condition fails.
#[macro_export]
macro_rules! ensure_input {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::DynamicsError::InvalidInput(format!($($arg)+)));
        }
    };
}

/// Returns early with [`DynamicsError::InvalidInput`].
#[macro_export]
macro_rules! bail_input {
    ($($arg:tt)+) => {
        return Err($crate::error::DynamicsError::InvalidInput(format!($($arg)+)))
    };
}

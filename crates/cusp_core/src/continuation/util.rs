//! Utility functions for continuation analysis.
//!
//! Tangent computation and conversions between branch points and augmented
//! vectors `[p, x...]`.

use crate::error::{DynamicsError, Result};
use crate::linalg;
use crate::{bail_input, ensure_input};
use nalgebra::{DMatrix, DVector, SymmetricEigen};

/// Computes the unit null space tangent of an `n×(n+1)` extended Jacobian.
///
/// Uses the Gram matrix eigendecomposition first, falling back to bordered
/// linear solves if that fails.
pub fn compute_nullspace_tangent(j_ext: &DMatrix<f64>) -> Result<DVector<f64>> {
    let dim = j_ext.nrows();
    ensure_input!(dim > 0, "failed to compute tangent: zero-dimensional system");
    ensure_input!(
        j_ext.ncols() == dim + 1,
        "failed to compute tangent: expected {} columns, got {}",
        dim + 1,
        j_ext.ncols()
    );
    let mut tangent = match try_gram_eigen(j_ext) {
        Some(vec) => vec,
        None => compute_tangent_linear_solve(j_ext)?,
    };
    tangent.normalize_mut();
    Ok(tangent)
}

/// Attempts to compute the tangent via Gram matrix eigendecomposition.
fn try_gram_eigen(j_ext: &DMatrix<f64>) -> Option<DVector<f64>> {
    let gram = j_ext.transpose() * j_ext;
    if gram.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let eig = SymmetricEigen::new(gram);
    let (min_idx, min_val) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .min_by(|(_, a), (_, b)| a.total_cmp(b))?;

    // The kernel must be one-dimensional: the next eigenvalue has to be
    // clearly separated from the smallest one.
    let scale = eig.eigenvalues.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    let separated = eig
        .eigenvalues
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != min_idx)
        .all(|(_, v)| *v - *min_val > 1e-12 * scale.max(1.0));
    if !separated {
        return None;
    }

    let vec = eig.eigenvectors.column(min_idx).into_owned();
    if vec.norm_squared() == 0.0 || vec.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Some(vec)
}

/// Computes the tangent via bordered linear system solve.
fn compute_tangent_linear_solve(j_ext: &DMatrix<f64>) -> Result<DVector<f64>> {
    let dim = j_ext.nrows();
    let mut a = DMatrix::zeros(dim + 1, dim + 1);
    a.view_mut((0, 0), (dim, dim + 1)).copy_from(j_ext);
    let mut rhs = DVector::zeros(dim + 1);
    rhs[dim] = 1.0;

    for col in 0..=dim {
        for j in 0..=dim {
            a[(dim, j)] = 0.0;
        }
        a[(dim, col)] = 1.0;

        if let Ok(solution) = linalg::solve(&a, &rhs) {
            if solution.iter().all(|v| v.is_finite()) && solution.norm_squared() != 0.0 {
                return Ok(solution);
            }
        }
    }

    Err(DynamicsError::SingularMatrix {
        pivot: 0.0,
        tolerance: linalg::PIVOT_RTOL * linalg::inf_norm(j_ext),
    })
}

/// Flips `tangent` so that it points the same way as `reference`.
pub fn orient_along(mut tangent: DVector<f64>, reference: &DVector<f64>) -> DVector<f64> {
    if tangent.dot(reference) < 0.0 {
        tangent.neg_mut();
    }
    tangent
}

/// Flips `tangent` so its parameter component has sign `sign`; a tangent
/// without parameter component is oriented by its largest state component.
pub fn orient_by_parameter(mut tangent: DVector<f64>, sign: f64) -> DVector<f64> {
    let pivot = if tangent[0] != 0.0 {
        tangent[0]
    } else {
        tangent
            .iter()
            .copied()
            .max_by(|a, b| a.abs().total_cmp(&b.abs()))
            .unwrap_or(0.0)
    };
    if pivot * sign < 0.0 {
        tangent.neg_mut();
    }
    tangent
}

/// Packs a parameter value and a state into `[p, x...]`.
pub fn to_aug(param: f64, state: &[f64]) -> DVector<f64> {
    let mut aug = DVector::zeros(state.len() + 1);
    aug[0] = param;
    for (i, &val) in state.iter().enumerate() {
        aug[i + 1] = val;
    }
    aug
}

/// State part of an augmented vector.
pub fn aug_state(aug: &DVector<f64>) -> Vec<f64> {
    aug.rows(1, aug.len() - 1).iter().cloned().collect()
}

/// Checks that an augmented vector is finite and has the expected size.
pub fn check_aug(aug: &DVector<f64>, dim: usize) -> Result<()> {
    if aug.len() != dim + 1 {
        bail_input!("augmented state has length {}, expected {}", aug.len(), dim + 1);
    }
    ensure_input!(
        aug.iter().all(|v| v.is_finite()),
        "augmented state contains non-finite values"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn compute_nullspace_tangent_finds_null_vector() {
        let mat = DMatrix::from_row_slice(2, 3, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        let tangent = compute_nullspace_tangent(&mat).expect("tangent should compute");
        let residual = &mat * &tangent;
        assert!((tangent.norm() - 1.0).abs() < 1e-12);
        assert!(residual.iter().all(|v| v.abs() < 1e-9));
        assert!((tangent[2].abs() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn compute_nullspace_tangent_rejects_invalid_shape() {
        let j_ext = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 1.0]);
        assert_err_contains(compute_nullspace_tangent(&j_ext), "expected 3 columns");
        assert_err_contains(
            compute_nullspace_tangent(&DMatrix::<f64>::zeros(0, 0)),
            "zero-dimensional system",
        );
    }

    #[test]
    fn compute_tangent_linear_solve_returns_null_vector() {
        let j_ext = DMatrix::from_row_slice(1, 2, &[1.0, 2.0]);
        let tangent = compute_tangent_linear_solve(&j_ext).expect("tangent should compute");
        let residual = 1.0 * tangent[0] + 2.0 * tangent[1];
        assert!(residual.abs() < 1e-12);
    }

    #[test]
    fn compute_tangent_linear_solve_errors_on_singular_system() {
        let j_ext = DMatrix::<f64>::zeros(1, 2);
        assert!(matches!(
            compute_tangent_linear_solve(&j_ext),
            Err(DynamicsError::SingularMatrix { .. })
        ));
    }

    #[test]
    fn degenerate_kernel_falls_back_to_bordered_solve() {
        // Two-dimensional kernel: the Gram matrix has a repeated zero eigenvalue.
        let j_ext = DMatrix::from_row_slice(1, 2, &[0.0, 0.0]);
        assert!(try_gram_eigen(&j_ext).is_none());
    }

    #[test]
    fn orientation_helpers() {
        let t = DVector::from_vec(vec![-0.6, 0.8]);
        let oriented = orient_by_parameter(t.clone(), 1.0);
        assert_eq!(oriented.as_slice(), &[0.6, -0.8]);

        let reference = DVector::from_vec(vec![-1.0, 0.0]);
        assert_eq!(orient_along(oriented, &reference).as_slice(), &[-0.6, 0.8]);

        let fold = DVector::from_vec(vec![0.0, -1.0]);
        assert_eq!(orient_by_parameter(fold, 1.0).as_slice(), &[0.0, 1.0]);
    }

    #[test]
    fn aug_round_trip_puts_param_first() {
        let aug = to_aug(3.0, &[1.0, 2.0]);
        assert_eq!(aug.as_slice(), &[3.0, 1.0, 2.0]);
        assert_eq!(aug_state(&aug), vec![1.0, 2.0]);
        assert!(check_aug(&aug, 2).is_ok());
        assert!(check_aug(&aug, 3).is_err());
    }
}

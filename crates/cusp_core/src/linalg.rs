//! Dense linear algebra used by every solver in the crate.
//!
//! All functions are pure: identical inputs give bit-identical outputs.

use crate::ensure_input;
use crate::error::{DynamicsError, Result};
use nalgebra::linalg::SVD;
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;

/// Pivots below `PIVOT_RTOL * ‖A‖_∞` are treated as zero.
pub const PIVOT_RTOL: f64 = 1e-13;

/// Imaginary parts below this fraction of the spectral scale are snapped to zero.
const IMAG_SNAP_RTOL: f64 = 1e-12;

/// Maximum absolute row sum.
pub fn inf_norm(a: &DMatrix<f64>) -> f64 {
    a.row_iter()
        .map(|row| row.iter().map(|v| v.abs()).sum::<f64>())
        .fold(0.0, f64::max)
}

/// Solves `A x = b` by LU factorization with partial pivoting.
pub fn solve(a: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>> {
    let n = a.nrows();
    ensure_input!(n > 0, "cannot solve an empty linear system");
    ensure_input!(
        a.ncols() == n,
        "linear solve requires a square matrix, got {}x{}",
        n,
        a.ncols()
    );
    ensure_input!(
        b.len() == n,
        "right-hand side has length {}, expected {}",
        b.len(),
        n
    );
    ensure_input!(
        a.iter().chain(b.iter()).all(|v| v.is_finite()),
        "linear system contains non-finite entries"
    );

    let scale = inf_norm(a);
    let tolerance = PIVOT_RTOL * scale;
    let lu = a.clone().lu();
    let min_pivot = lu
        .u()
        .diagonal()
        .iter()
        .fold(f64::INFINITY, |acc, v| acc.min(v.abs()));
    if scale == 0.0 || min_pivot <= tolerance {
        return Err(DynamicsError::SingularMatrix {
            pivot: min_pivot,
            tolerance,
        });
    }

    lu.solve(b).ok_or(DynamicsError::SingularMatrix {
        pivot: min_pivot,
        tolerance,
    })
}

/// Eigenvalues of a general real matrix.
///
/// Complex eigenvalues come out as exact conjugate pairs, adjacent to each
/// other with the positive imaginary part first. The list is sorted by real
/// part (descending), then by magnitude of the imaginary part.
pub fn eigenvalues(a: &DMatrix<f64>) -> Result<Vec<Complex<f64>>> {
    ensure_input!(
        a.nrows() == a.ncols(),
        "eigenvalues require a square matrix, got {}x{}",
        a.nrows(),
        a.ncols()
    );
    if a.nrows() == 0 {
        return Ok(Vec::new());
    }
    ensure_input!(
        a.iter().all(|v| v.is_finite()),
        "matrix contains non-finite entries"
    );

    let raw: Vec<Complex<f64>> = a.complex_eigenvalues().iter().cloned().collect();
    let mut values = pair_conjugates(raw);
    sort_spectrum(&mut values);
    Ok(values)
}

fn pair_conjugates(mut values: Vec<Complex<f64>>) -> Vec<Complex<f64>> {
    let scale = values.iter().map(|v| v.norm()).fold(1.0, f64::max);
    let snap = IMAG_SNAP_RTOL * scale;
    for v in values.iter_mut() {
        if v.im.abs() <= snap {
            v.im = 0.0;
        }
    }

    let mut used = vec![false; values.len()];
    for i in 0..values.len() {
        if used[i] || values[i].im <= 0.0 {
            continue;
        }
        let target = values[i].conj();
        let partner = (0..values.len())
            .filter(|&j| !used[j] && j != i && values[j].im < 0.0)
            .min_by(|&a, &b| {
                (values[a] - target)
                    .norm()
                    .total_cmp(&(values[b] - target).norm())
            });
        if let Some(j) = partner {
            let re = 0.5 * (values[i].re + values[j].re);
            let im = 0.5 * (values[i].im - values[j].im);
            values[i] = Complex::new(re, im);
            values[j] = Complex::new(re, -im);
            used[i] = true;
            used[j] = true;
        }
    }
    values
}

fn sort_spectrum(values: &mut [Complex<f64>]) {
    values.sort_by(|a, b| {
        b.re.total_cmp(&a.re)
            .then(b.im.abs().total_cmp(&a.im.abs()))
            .then(b.im.total_cmp(&a.im))
    });
}

/// Unit eigenvector of `a` for the eigenvalue `lambda`, taken as the right
/// singular vector of `A - λI` with the smallest singular value.
///
/// The phase is fixed so the largest component is real and positive.
pub fn eigenvector(a: &DMatrix<f64>, lambda: Complex<f64>) -> Result<Vec<Complex<f64>>> {
    let n = a.nrows();
    ensure_input!(
        n > 0 && a.ncols() == n,
        "eigenvector requires a non-empty square matrix"
    );

    let mut shifted = a.map(|v| Complex::new(v, 0.0));
    for i in 0..n {
        shifted[(i, i)] -= lambda;
    }

    let svd = SVD::new(shifted, false, true);
    let v_t = svd.v_t.ok_or_else(|| {
        DynamicsError::InvalidInput("SVD did not produce right singular vectors".to_string())
    })?;
    let (min_idx, _) = svd.singular_values.iter().enumerate().fold(
        (0usize, f64::INFINITY),
        |(idx_min, val_min), (idx, &val)| {
            if val < val_min {
                (idx, val)
            } else {
                (idx_min, val_min)
            }
        },
    );

    let mut vector: Vec<Complex<f64>> = v_t.row(min_idx).iter().map(|c| c.conj()).collect();
    let norm = vector.iter().map(|c| c.norm_sqr()).sum::<f64>().sqrt();
    ensure_input!(norm > 0.0, "eigenvector for {} vanished", lambda);

    let pivot = vector
        .iter()
        .copied()
        .max_by(|a, b| a.norm().total_cmp(&b.norm()))
        .unwrap_or(Complex::new(1.0, 0.0));
    let phase = pivot.conj() / pivot.norm();
    for entry in vector.iter_mut() {
        *entry = *entry * phase / norm;
    }
    Ok(vector)
}

pub fn determinant(a: &DMatrix<f64>) -> f64 {
    if a.nrows() == 0 {
        return 1.0;
    }
    a.determinant()
}

pub fn dot(u: &[f64], v: &[f64]) -> f64 {
    debug_assert_eq!(u.len(), v.len());
    u.iter().zip(v.iter()).map(|(a, b)| a * b).sum()
}

/// Euclidean norm.
pub fn norm(v: &[f64]) -> f64 {
    dot(v, v).sqrt()
}

pub fn max_norm(v: &[f64]) -> f64 {
    v.iter().fold(0.0, |acc, x| acc.max(x.abs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solve_recovers_known_solution() {
        let a = DMatrix::from_row_slice(3, 3, &[4.0, -2.0, 1.0, -2.0, 4.0, -2.0, 1.0, -2.0, 4.0]);
        let x_true = DVector::from_vec(vec![1.0, -1.0, 2.0]);
        let b = &a * &x_true;
        let x = solve(&a, &b).expect("solve should succeed");
        assert!((x - x_true).norm() < 1e-12);
    }

    #[test]
    fn solve_needs_pivoting() {
        let a = DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 1.0, 0.0]);
        let b = DVector::from_vec(vec![3.0, 5.0]);
        let x = solve(&a, &b).expect("pivoted solve");
        assert_eq!(x.as_slice(), &[5.0, 3.0]);
    }

    #[test]
    fn solve_reports_singular_matrix() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        let b = DVector::from_vec(vec![1.0, 1.0]);
        match solve(&a, &b) {
            Err(DynamicsError::SingularMatrix { tolerance, .. }) => assert!(tolerance > 0.0),
            other => panic!("expected SingularMatrix, got {other:?}"),
        }

        let zero = DMatrix::<f64>::zeros(2, 2);
        assert!(matches!(
            solve(&zero, &b),
            Err(DynamicsError::SingularMatrix { .. })
        ));
    }

    #[test]
    fn solve_scales_tolerance_with_norm() {
        let a = DMatrix::from_row_slice(2, 2, &[1e-20, 0.0, 0.0, 1e-20]);
        let b = DVector::from_vec(vec![1e-20, 2e-20]);
        let x = solve(&a, &b).expect("uniformly small matrix is well conditioned");
        assert!((x[0] - 1.0).abs() < 1e-12);
        assert!((x[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn solve_rejects_mismatched_dimensions() {
        let a = DMatrix::<f64>::identity(2, 2);
        let b = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        assert!(matches!(solve(&a, &b), Err(DynamicsError::InvalidInput(_))));
    }

    #[test]
    fn eigenvalues_pair_conjugates() {
        // Block diagonal: rotation-scaling block and a real eigenvalue.
        let a = DMatrix::from_row_slice(
            3,
            3,
            &[0.5, -2.0, 0.0, 2.0, 0.5, 0.0, 0.0, 0.0, -3.0],
        );
        let values = eigenvalues(&a).expect("eigenvalues");
        assert_eq!(values.len(), 3);
        assert_eq!(values[0], values[1].conj());
        assert!((values[0].re - 0.5).abs() < 1e-12);
        assert!((values[0].im - 2.0).abs() < 1e-12);
        assert_eq!(values[2].im, 0.0);
        assert!((values[2].re + 3.0).abs() < 1e-12);
    }

    #[test]
    fn eigenvalues_are_sorted_and_reproducible() {
        let a = DMatrix::from_row_slice(3, 3, &[-10.0, 10.0, 0.0, 28.0, -1.0, 0.0, 0.0, 0.0, -8.0 / 3.0]);
        let first = eigenvalues(&a).expect("eigenvalues");
        let second = eigenvalues(&a).expect("eigenvalues");
        assert_eq!(first, second);
        for pair in first.windows(2) {
            assert!(pair[0].re >= pair[1].re);
        }
    }

    #[test]
    fn eigenvector_satisfies_definition() {
        let a = DMatrix::from_row_slice(2, 2, &[0.0, -1.0, 1.0, 0.0]);
        let lambda = Complex::new(0.0, 1.0);
        let v = eigenvector(&a, lambda).expect("eigenvector");
        let av0 = a[(0, 0)] * v[0] + a[(0, 1)] * v[1];
        let av1 = a[(1, 0)] * v[0] + a[(1, 1)] * v[1];
        assert!((av0 - lambda * v[0]).norm() < 1e-10);
        assert!((av1 - lambda * v[1]).norm() < 1e-10);
        let norm: f64 = v.iter().map(|c| c.norm_sqr()).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-12);
    }

    #[test]
    fn norms_and_dot() {
        assert_eq!(dot(&[1.0, 2.0], &[3.0, 4.0]), 11.0);
        assert_eq!(norm(&[3.0, 4.0]), 5.0);
        assert_eq!(max_norm(&[-7.0, 4.0]), 7.0);
        let a = DMatrix::from_row_slice(2, 2, &[1.0, -2.0, 3.0, 4.0]);
        assert_eq!(inf_norm(&a), 7.0);
        assert!((determinant(&a) - 10.0).abs() < 1e-12);
    }
}

//! Eigenvalue-based stability classification and bifurcation test functions.

use crate::ensure_input;
use crate::error::Result;
use crate::linalg;
use nalgebra::DMatrix;
use num_complex::Complex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_STABILITY_TOLERANCE: f64 = 1e-8;

/// Eigenvalues with |Im| below this are treated as real when pairing.
const IMAG_EPS: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stability {
    Stable,
    Unstable,
    /// At least one eigenvalue has a real part inside `[-tol, tol]` and none is
    /// clearly unstable.
    Marginal,
}

/// Phase-portrait type of an equilibrium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixedPointKind {
    StableNode,
    UnstableNode,
    StableFocus,
    UnstableFocus,
    Saddle,
    NonHyperbolic,
}

/// Test functions whose sign changes signal bifurcations of equilibria.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestFunctionValues {
    /// det(J); changes sign when a real eigenvalue crosses zero.
    pub fold: f64,
    /// Product of Re(λ + λ̄) over complex-conjugate pairs, 1.0 without pairs.
    pub hopf: f64,
    /// min |Re(λ + λ̄)| over conjugate pairs.
    pub hopf_margin: Option<f64>,
    pub conjugate_pairs: usize,
}

impl TestFunctionValues {
    pub fn from_spectrum(determinant: f64, eigenvalues: &[Complex<f64>]) -> Self {
        let pairs = conjugate_pairs(eigenvalues);
        let hopf = if pairs.is_empty() {
            1.0
        } else {
            pairs.iter().map(|l| 2.0 * l.re).product::<f64>()
        };
        let hopf_margin = pairs
            .iter()
            .map(|l| (2.0 * l.re).abs())
            .reduce(f64::min);
        Self {
            fold: determinant,
            hopf,
            hopf_margin,
            conjugate_pairs: pairs.len(),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.fold.is_finite() && self.hopf.is_finite()
    }
}

/// Test functions for a periodic orbit, computed from its nontrivial Floquet
/// multipliers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CycleTestValues {
    /// Product of (μ - 1) over real nontrivial multipliers.
    pub limit_point: f64,
    /// Product of (μ + 1) over real nontrivial multipliers.
    pub period_doubling: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilityReport {
    pub eigenvalues: Vec<Complex<f64>>,
    pub stability: Stability,
    pub stable: bool,
    pub marginal: bool,
    pub kind: FixedPointKind,
    pub test_functions: TestFunctionValues,
}

/// Classifies the equilibrium whose Jacobian is `jacobian`.
pub fn classify(jacobian: &DMatrix<f64>, tolerance: f64) -> Result<StabilityReport> {
    ensure_input!(
        tolerance.is_finite() && tolerance > 0.0,
        "stability tolerance must be positive, got {}",
        tolerance
    );
    ensure_input!(
        jacobian.nrows() == jacobian.ncols(),
        "Jacobian must be square, got {}x{}",
        jacobian.nrows(),
        jacobian.ncols()
    );

    let eigenvalues = linalg::eigenvalues(jacobian)?;
    let (stability, kind) = classify_spectrum(&eigenvalues, tolerance);
    let marginal = eigenvalues.iter().any(|l| l.re.abs() <= tolerance);
    let test_functions =
        TestFunctionValues::from_spectrum(linalg::determinant(jacobian), &eigenvalues);

    Ok(StabilityReport {
        eigenvalues,
        stability,
        stable: stability == Stability::Stable,
        marginal,
        kind,
        test_functions,
    })
}

pub fn classify_spectrum(eigenvalues: &[Complex<f64>], tolerance: f64) -> (Stability, FixedPointKind) {
    let any_marginal = eigenvalues.iter().any(|l| l.re.abs() <= tolerance);
    let any_unstable = eigenvalues.iter().any(|l| l.re > tolerance);
    let all_stable = eigenvalues.iter().all(|l| l.re < -tolerance);
    let oscillatory = eigenvalues.iter().any(|l| l.im.abs() > IMAG_EPS);

    let stability = if any_unstable {
        Stability::Unstable
    } else if any_marginal {
        Stability::Marginal
    } else {
        Stability::Stable
    };

    let kind = if any_marginal {
        FixedPointKind::NonHyperbolic
    } else if all_stable {
        if oscillatory {
            FixedPointKind::StableFocus
        } else {
            FixedPointKind::StableNode
        }
    } else if eigenvalues.iter().all(|l| l.re > tolerance) {
        if oscillatory {
            FixedPointKind::UnstableFocus
        } else {
            FixedPointKind::UnstableNode
        }
    } else {
        FixedPointKind::Saddle
    };

    (stability, kind)
}

/// One representative (positive imaginary part) of every complex-conjugate pair.
fn conjugate_pairs(eigenvalues: &[Complex<f64>]) -> Vec<Complex<f64>> {
    let mut pairs = Vec::new();
    let mut used = vec![false; eigenvalues.len()];
    for i in 0..eigenvalues.len() {
        let lambda = eigenvalues[i];
        if used[i] || lambda.im <= IMAG_EPS {
            continue;
        }
        let partner = (0..eigenvalues.len())
            .filter(|&j| !used[j] && eigenvalues[j].im < -IMAG_EPS)
            .min_by(|&a, &b| {
                (eigenvalues[a] - lambda.conj())
                    .norm()
                    .total_cmp(&(eigenvalues[b] - lambda.conj()).norm())
            });
        if let Some(j) = partner {
            used[i] = true;
            used[j] = true;
            pairs.push(lambda);
        }
    }
    pairs
}

/// The conjugate pair closest to the imaginary axis (positive imaginary part).
pub fn critical_pair(eigenvalues: &[Complex<f64>]) -> Option<Complex<f64>> {
    conjugate_pairs(eigenvalues)
        .into_iter()
        .min_by(|a, b| a.re.abs().total_cmp(&b.re.abs()))
}

/// Cycle test functions with the trivial multiplier (the one nearest 1) removed.
pub fn cycle_test_functions(multipliers: &[Complex<f64>]) -> CycleTestValues {
    let nontrivial = nontrivial_multipliers(multipliers);
    let real: Vec<f64> = nontrivial
        .iter()
        .filter(|m| m.im.abs() <= IMAG_EPS)
        .map(|m| m.re)
        .collect();
    CycleTestValues {
        limit_point: real.iter().map(|m| m - 1.0).product(),
        period_doubling: real.iter().map(|m| m + 1.0).product(),
    }
}

pub(crate) fn nontrivial_multipliers(multipliers: &[Complex<f64>]) -> Vec<Complex<f64>> {
    let trivial = multipliers
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            (**a - 1.0).norm().total_cmp(&(**b - 1.0).norm())
        })
        .map(|(idx, _)| idx);
    multipliers
        .iter()
        .enumerate()
        .filter(|(idx, _)| Some(*idx) != trivial)
        .map(|(_, m)| *m)
        .collect()
}

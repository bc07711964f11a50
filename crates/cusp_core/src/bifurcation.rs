//! Detection and refinement of codimension-one bifurcations.
//!
//! Equilibrium events come from sign changes of the test functions stored on
//! consecutive branch points. A detected bracket is narrowed by bisection,
//! either on the parameter itself (when it is monotone across the bracket)
//! or on the secant between the two points with each midpoint corrected back
//! onto the branch. Branch points are never modified; the refined point lives
//! on the event.

use crate::continuation::problem::{ContinuationProblem, PointDiagnostics};
use crate::continuation::util::to_aug;
use crate::continuation::{
    correct_on_hyperplane, tangent_at, Branch, BranchPoint, ContinuationSettings,
    EquilibriumContinuationProblem,
};
use crate::equilibrium::FixedPoint;
use crate::error::{DynamicsError, Result};
use crate::periodic::{limit_cycle_guess_from_hopf, LimitCycle, LimitCycleGuess};
use crate::stability::{critical_pair, cycle_test_functions, TestFunctionValues};
use crate::traits::Model;
use crate::{bail_input, ensure_input};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BifurcationKind {
    /// A real eigenvalue crosses zero (fold of equilibria).
    SaddleNode,
    /// A complex-conjugate pair crosses the imaginary axis.
    Hopf,
    /// A nontrivial Floquet multiplier crosses +1.
    LimitPointOfCycles,
    /// A Floquet multiplier crosses -1.
    PeriodDoubling,
}

impl BifurcationKind {
    /// The equilibrium test function monitored for this kind.
    fn equilibrium_test(self, values: &TestFunctionValues) -> Option<f64> {
        match self {
            BifurcationKind::SaddleNode => Some(values.fold),
            BifurcationKind::Hopf => Some(values.hopf),
            BifurcationKind::LimitPointOfCycles | BifurcationKind::PeriodDoubling => None,
        }
    }
}

/// Settings for bisection refinement of detected events.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    pub max_bisections: usize,
    /// Refinement stops once `|g| < test_tolerance` at the midpoint.
    pub test_tolerance: f64,
    /// Refinement stops once the bracket is narrower than this.
    pub parameter_tolerance: f64,
    /// Radius of the cycle seed placed around a Hopf point.
    pub hopf_amplitude: f64,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            max_bisections: 40,
            test_tolerance: 1e-10,
            parameter_tolerance: 1e-10,
            hopf_amplitude: 1e-2,
        }
    }
}

impl DetectionSettings {
    pub fn validate(&self) -> Result<()> {
        ensure_input!(self.max_bisections > 0, "max_bisections must be greater than zero");
        ensure_input!(
            self.test_tolerance.is_finite() && self.test_tolerance > 0.0,
            "test_tolerance must be positive, got {}",
            self.test_tolerance
        );
        ensure_input!(
            self.parameter_tolerance.is_finite() && self.parameter_tolerance > 0.0,
            "parameter_tolerance must be positive, got {}",
            self.parameter_tolerance
        );
        ensure_input!(
            self.hopf_amplitude.is_finite() && self.hopf_amplitude > 0.0,
            "hopf_amplitude must be positive, got {}",
            self.hopf_amplitude
        );
        Ok(())
    }
}

/// A bifurcation located between two consecutive branch points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BifurcationEvent {
    pub kind: BifurcationKind,
    /// Index of the first point past the crossing, in traversal order.
    pub branch_index: i32,
    pub parameter_value: f64,
    pub state: Vec<f64>,
    /// Indices of the bracketing points, smaller first.
    pub bracket: (i32, i32),
    /// Test function value at the reported location.
    pub test_value: f64,
    /// `None` when refinement failed and the location is interpolated.
    pub refined_point: Option<FixedPoint>,
    /// `2π/|Im λ|` of the crossing pair (Hopf only).
    pub period_estimate: Option<f64>,
    pub cycle_guess: Option<LimitCycleGuess>,
}

/// Sign change with both values finite. Zero counts as positive.
fn crosses(a: f64, b: f64) -> bool {
    a.is_finite() && b.is_finite() && ((a < 0.0) != (b < 0.0))
}

/// Events bracketed by two consecutive equilibrium points.
pub fn detect(a: &TestFunctionValues, b: &TestFunctionValues) -> Vec<BifurcationKind> {
    let mut kinds = Vec::new();
    if crosses(a.fold, b.fold) {
        kinds.push(BifurcationKind::SaddleNode);
    }
    // A pair count change means eigenvalues collided on the real axis; the
    // Hopf product is not comparable across it.
    if a.conjugate_pairs > 0 && a.conjugate_pairs == b.conjugate_pairs && crosses(a.hopf, b.hopf) {
        kinds.push(BifurcationKind::Hopf);
    }
    kinds
}

/// Events bracketed by two limit cycles of a periodic branch.
pub fn cycle_events(a: &LimitCycle, b: &LimitCycle) -> Vec<BifurcationKind> {
    let ta = cycle_test_functions(&a.floquet_multipliers);
    let tb = cycle_test_functions(&b.floquet_multipliers);
    let mut kinds = Vec::new();
    if crosses(ta.limit_point, tb.limit_point) {
        kinds.push(BifurcationKind::LimitPointOfCycles);
    }
    if crosses(ta.period_doubling, tb.period_doubling) {
        kinds.push(BifurcationKind::PeriodDoubling);
    }
    kinds
}

/// Refines the event of `kind` between the branch points with indices
/// `a_index` and `b_index`, treating `b_index` as the point past the crossing.
pub fn refine<M: Model + ?Sized>(
    model: &M,
    branch: &Branch,
    a_index: i32,
    b_index: i32,
    kind: BifurcationKind,
    settings: &ContinuationSettings,
) -> Result<BifurcationEvent> {
    settings.validate()?;
    ensure_input!(a_index != b_index, "bracket indices must differ");
    let (Some(a), Some(b)) = (branch.point(a_index), branch.point(b_index)) else {
        bail_input!("branch has no points with indices {} and {}", a_index, b_index);
    };
    let Some(ga) = kind.equilibrium_test(&a.test_functions) else {
        bail_input!("{:?} is not an equilibrium bifurcation", kind);
    };
    let gb = kind.equilibrium_test(&b.test_functions).unwrap_or(f64::NAN);
    ensure_input!(
        crosses(ga, gb),
        "{:?} test function does not change sign between points {} and {}",
        kind,
        a_index,
        b_index
    );

    let base = a.fixed_point.parameters.aligned_to(model)?;
    ensure_input!(
        base.names().get(branch.parameter_index) == Some(&branch.parameter_name),
        "branch parameter '{}' does not match the model",
        branch.parameter_name
    );
    ensure_input!(
        a.fixed_point.state.len() == model.dimension() && b.fixed_point.state.len() == model.dimension(),
        "branch states do not match model dimension {}",
        model.dimension()
    );
    let problem =
        EquilibriumContinuationProblem::new(model, base, branch.parameter_index, settings.newton);
    let za = to_aug(a.param_value, &a.fixed_point.state);
    let zb = to_aug(b.param_value, &b.fixed_point.state);
    let secant = &zb - &za;
    let ta = tangent_at(&problem, &za, &secant)?;
    let tb = tangent_at(&problem, &zb, &secant)?;

    let refined = try_refine(&problem, (a, &ta), (b, &tb), kind, settings)?;
    Ok(event_from_refined(a, b, kind, refined, &settings.detection))
}

/// Refines a detected event, falling back to the interpolated zero of the
/// test function when bisection fails.
pub(crate) fn locate<P: ContinuationProblem>(
    problem: &P,
    a: (&BranchPoint, &DVector<f64>),
    b: (&BranchPoint, &DVector<f64>),
    kind: BifurcationKind,
    settings: &ContinuationSettings,
) -> BifurcationEvent {
    match try_refine(problem, a, b, kind, settings) {
        Ok(refined) => event_from_refined(a.0, b.0, kind, refined, &settings.detection),
        Err(err) => {
            log::warn!(
                "refinement of {:?} between points {} and {} failed: {}; reporting interpolated location",
                kind,
                a.0.index,
                b.0.index,
                err
            );
            interpolated_event(problem, a.0, b.0, kind)
        }
    }
}

struct Refined {
    aug: DVector<f64>,
    diagnostics: PointDiagnostics,
    test_value: f64,
}

fn try_refine<P: ContinuationProblem>(
    problem: &P,
    (a, ta): (&BranchPoint, &DVector<f64>),
    (b, tb): (&BranchPoint, &DVector<f64>),
    kind: BifurcationKind,
    settings: &ContinuationSettings,
) -> Result<Refined> {
    let monotone = ta[0] * tb[0] > 0.0 && a.param_value != b.param_value;
    if kind == BifurcationKind::Hopf && monotone {
        match bisect_parameter(problem, a, b, kind, settings) {
            Ok(refined) => return Ok(refined),
            Err(err) => log::debug!("parameter bisection failed ({err}); bisecting along the secant"),
        }
    }
    bisect_secant(problem, a, b, kind, settings)
}

fn test_at(kind: BifurcationKind, diagnostics: &PointDiagnostics) -> Result<f64> {
    match kind.equilibrium_test(&diagnostics.test_values) {
        Some(g) if g.is_finite() => Ok(g),
        Some(g) => Err(DynamicsError::InvalidInput(format!(
            "{kind:?} test function is not finite ({g}) during refinement"
        ))),
        None => Err(DynamicsError::InvalidInput(format!(
            "{kind:?} is not an equilibrium bifurcation"
        ))),
    }
}

/// Bisection on the parameter, solving for the equilibrium at each midpoint.
fn bisect_parameter<P: ContinuationProblem>(
    problem: &P,
    a: &BranchPoint,
    b: &BranchPoint,
    kind: BifurcationKind,
    settings: &ContinuationSettings,
) -> Result<Refined> {
    let detection = &settings.detection;
    let (mut pa, mut xa) = (a.param_value, a.fixed_point.state.clone());
    let (mut pb, mut xb) = (b.param_value, b.fixed_point.state.clone());
    let mut ga = kind.equilibrium_test(&a.test_functions).unwrap_or(f64::NAN);
    let mut best = None;

    for _ in 0..detection.max_bisections {
        let pm = 0.5 * (pa + pb);
        let w = (pm - pa) / (pb - pa);
        let guess: Vec<f64> = xa.iter().zip(&xb).map(|(u, v)| u + w * (v - u)).collect();
        let aug = problem.solve_at_parameter(pm, &guess)?;
        let diagnostics = problem.diagnostics(&aug)?;
        let gm = test_at(kind, &diagnostics)?;
        let state = diagnostics.fixed_point.state.clone();

        if crosses(ga, gm) {
            pb = pm;
            xb = state;
        } else {
            pa = pm;
            xa = state;
            ga = gm;
        }
        let done = gm.abs() < detection.test_tolerance || (pb - pa).abs() < detection.parameter_tolerance;
        best = Some(Refined {
            aug,
            diagnostics,
            test_value: gm,
        });
        if done {
            break;
        }
    }
    best.ok_or_else(|| DynamicsError::InvalidInput("no bisection steps were taken".to_string()))
}

/// Bisection on the secant fraction θ, correcting each midpoint onto the
/// branch within the hyperplane orthogonal to the secant.
fn bisect_secant<P: ContinuationProblem>(
    problem: &P,
    a: &BranchPoint,
    b: &BranchPoint,
    kind: BifurcationKind,
    settings: &ContinuationSettings,
) -> Result<Refined> {
    let detection = &settings.detection;
    let za = to_aug(a.param_value, &a.fixed_point.state);
    let zb = to_aug(b.param_value, &b.fixed_point.state);
    let secant = &zb - &za;
    let length = secant.norm();
    ensure_input!(length > 0.0, "bracketing points coincide");
    let normal = &secant / length;

    let (mut lo, mut hi) = (0.0f64, 1.0f64);
    let mut g_lo = kind.equilibrium_test(&a.test_functions).unwrap_or(f64::NAN);
    let mut best = None;

    for _ in 0..detection.max_bisections {
        let mid = 0.5 * (lo + hi);
        let anchor = &za + &secant * mid;
        let corrected = correct_on_hyperplane(problem, &anchor, &anchor, &normal, settings)?;
        let diagnostics = problem.diagnostics(&corrected.aug)?;
        let gm = test_at(kind, &diagnostics)?;

        if crosses(g_lo, gm) {
            hi = mid;
        } else {
            lo = mid;
            g_lo = gm;
        }
        let done = gm.abs() < detection.test_tolerance || (hi - lo) * length < detection.parameter_tolerance;
        best = Some(Refined {
            aug: corrected.aug,
            diagnostics,
            test_value: gm,
        });
        if done {
            break;
        }
    }
    best.ok_or_else(|| DynamicsError::InvalidInput("no bisection steps were taken".to_string()))
}

fn period_of(fixed_point: &FixedPoint) -> Option<f64> {
    critical_pair(&fixed_point.eigenvalues)
        .filter(|pair| pair.im.abs() > 0.0)
        .map(|pair| 2.0 * PI / pair.im.abs())
}

fn bracket(a: &BranchPoint, b: &BranchPoint) -> (i32, i32) {
    (a.index.min(b.index), a.index.max(b.index))
}

fn event_from_refined(
    a: &BranchPoint,
    b: &BranchPoint,
    kind: BifurcationKind,
    refined: Refined,
    detection: &DetectionSettings,
) -> BifurcationEvent {
    let fixed_point = refined.diagnostics.fixed_point;
    let (period_estimate, cycle_guess) = if kind == BifurcationKind::Hopf {
        let period = period_of(&fixed_point).or_else(|| period_of(&a.fixed_point));
        let guess = match limit_cycle_guess_from_hopf(&fixed_point, detection.hopf_amplitude) {
            Ok(guess) => Some(guess),
            Err(err) => {
                log::debug!("no cycle seed at Hopf point: {err}");
                None
            }
        };
        (period, guess)
    } else {
        (None, None)
    };

    BifurcationEvent {
        kind,
        branch_index: b.index,
        parameter_value: refined.aug[0],
        state: fixed_point.state.clone(),
        bracket: bracket(a, b),
        test_value: refined.test_value,
        refined_point: Some(fixed_point),
        period_estimate,
        cycle_guess,
    }
}

/// Event at the linear zero of the test function along the secant.
///
/// `test_value` is the test function evaluated at that unconverged point, or
/// the linear interpolant when it cannot be evaluated there.
fn interpolated_event<P: ContinuationProblem>(
    problem: &P,
    a: &BranchPoint,
    b: &BranchPoint,
    kind: BifurcationKind,
) -> BifurcationEvent {
    let ga = kind.equilibrium_test(&a.test_functions).unwrap_or(f64::NAN);
    let gb = kind.equilibrium_test(&b.test_functions).unwrap_or(f64::NAN);
    let theta = if ga.is_finite() && gb.is_finite() && ga != gb {
        (ga / (ga - gb)).clamp(0.0, 1.0)
    } else {
        0.5
    };
    let za = to_aug(a.param_value, &a.fixed_point.state);
    let zb = to_aug(b.param_value, &b.fixed_point.state);
    let z = &za + (&zb - &za) * theta;
    let test_value = problem
        .diagnostics(&z)
        .ok()
        .and_then(|diag| kind.equilibrium_test(&diag.test_values))
        .filter(|g| g.is_finite())
        .unwrap_or(ga + theta * (gb - ga));

    let period_estimate = if kind == BifurcationKind::Hopf {
        match (period_of(&a.fixed_point), period_of(&b.fixed_point)) {
            (Some(pa), Some(pb)) => Some(pa + theta * (pb - pa)),
            (pa, pb) => pa.or(pb),
        }
    } else {
        None
    };

    BifurcationEvent {
        kind,
        branch_index: b.index,
        parameter_value: z[0],
        state: z.iter().skip(1).copied().collect(),
        bracket: bracket(a, b),
        test_value,
        refined_point: None,
        period_estimate,
        cycle_guess: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::{trace_branch, Direction};
    use crate::equilibrium::{find_fixed_point, NewtonSettings};
    use crate::models::{HopfNormalForm, SaddleNodeNormalForm};
    use crate::params::Parameters;
    use crate::traits::FnModel;
    use nalgebra::DMatrix;
    use num_complex::Complex;

    fn values(fold: f64, hopf: f64, pairs: usize) -> TestFunctionValues {
        TestFunctionValues {
            fold,
            hopf,
            hopf_margin: if pairs > 0 { Some(hopf.abs()) } else { None },
            conjugate_pairs: pairs,
        }
    }

    #[test]
    fn detect_reports_fold_and_hopf_sign_changes() {
        assert_eq!(
            detect(&values(1.0, 1.0, 0), &values(-1.0, 1.0, 0)),
            vec![BifurcationKind::SaddleNode]
        );
        assert_eq!(
            detect(&values(1.0, -0.2, 1), &values(1.0, 0.3, 1)),
            vec![BifurcationKind::Hopf]
        );
        assert!(detect(&values(1.0, 0.2, 1), &values(2.0, 0.3, 1)).is_empty());
    }

    #[test]
    fn pair_collision_is_not_a_hopf() {
        // A pair turning into two real eigenvalues switches `hopf` from the
        // pair product to 1.0 without any crossing of the imaginary axis.
        assert!(detect(&values(1.0, -0.4, 1), &values(1.0, 1.0, 0)).is_empty());
        assert!(detect(&values(1.0, -0.4, 2), &values(1.0, 0.4, 1)).is_empty());
    }

    #[test]
    fn non_finite_values_never_cross() {
        assert!(!crosses(f64::NAN, 1.0));
        assert!(!crosses(-1.0, f64::INFINITY));
        assert!(crosses(-1.0, 0.0));
    }

    #[test]
    fn cycle_events_follow_multiplier_crossings() {
        let cycle = |mu: f64| LimitCycle {
            period: 1.0,
            samples: Vec::new(),
            floquet_multipliers: vec![Complex::new(1.0, 0.0), Complex::new(mu, 0.0)],
            parameters: Parameters::empty(),
            amplitude: 1.0,
            stable: mu.abs() < 1.0,
        };
        assert_eq!(
            cycle_events(&cycle(-0.9), &cycle(-1.1)),
            vec![BifurcationKind::PeriodDoubling]
        );
        assert!(cycle_events(&cycle(0.3), &cycle(0.5)).is_empty());
    }

    #[test]
    fn refine_matches_event_found_during_tracing() {
        let model = SaddleNodeNormalForm;
        let params = Parameters::new([("p", 1.0)]).expect("params");
        let start = find_fixed_point(&model, &[1.0], &params, &NewtonSettings::default()).expect("start");
        let settings = ContinuationSettings {
            direction: Direction::Backward,
            ..ContinuationSettings::default()
        };
        let branch = trace_branch(&model, &start, "p", (-0.5, 1.5), &settings).expect("branch");
        let event = branch
            .events_of_kind(BifurcationKind::SaddleNode)
            .next()
            .expect("fold")
            .clone();
        let (lo, hi) = event.bracket;
        let other = if event.branch_index == lo { hi } else { lo };

        let refined = refine(&model, &branch, other, event.branch_index, BifurcationKind::SaddleNode, &settings)
            .expect("refine");
        assert!((refined.parameter_value - event.parameter_value).abs() < 1e-8);
        assert_eq!(refined.bracket, event.bracket);
        assert!(refined.refined_point.is_some());
    }

    #[test]
    fn refine_rejects_brackets_without_sign_change() {
        let model = HopfNormalForm;
        let params = Parameters::new([("p", -0.5)]).expect("params");
        let start = find_fixed_point(&model, &[0.0, 0.0], &params, &NewtonSettings::default()).expect("start");
        let settings = ContinuationSettings::default();
        let branch = trace_branch(&model, &start, "p", (-0.5, 0.5), &settings).expect("branch");
        let result = refine(&model, &branch, 0, 1, BifurcationKind::Hopf, &settings);
        assert!(matches!(result, Err(DynamicsError::InvalidInput(_))));
        let result = refine(&model, &branch, 0, 1, BifurcationKind::PeriodDoubling, &settings);
        assert!(matches!(result, Err(DynamicsError::InvalidInput(_))));
    }

    #[test]
    fn refine_rejects_branch_from_another_parameterization() {
        let model = SaddleNodeNormalForm;
        let params = Parameters::new([("p", 1.0)]).expect("params");
        let start = find_fixed_point(&model, &[1.0], &params, &NewtonSettings::default()).expect("start");
        let settings = ContinuationSettings {
            direction: Direction::Backward,
            ..ContinuationSettings::default()
        };
        let branch = trace_branch(&model, &start, "p", (-1.0, 2.0), &settings).expect("branch");
        let event = branch
            .events
            .iter()
            .find(|e| e.kind == BifurcationKind::SaddleNode)
            .expect("fold event");
        let (a, b) = event.bracket;

        let mut shifted = branch.clone();
        shifted.parameter_index = 3;
        let result = refine(&model, &shifted, a, b, BifurcationKind::SaddleNode, &settings);
        assert!(matches!(result, Err(DynamicsError::InvalidInput(_))), "{result:?}");

        let mut renamed = branch;
        renamed.parameter_name = "q".to_string();
        let result = refine(&model, &renamed, a, b, BifurcationKind::SaddleNode, &settings);
        assert!(matches!(result, Err(DynamicsError::InvalidInput(_))), "{result:?}");
    }

    #[test]
    fn interpolated_event_sits_at_linear_zero() {
        let model = SaddleNodeNormalForm;
        let settings = NewtonSettings::default();
        let point = |index: i32, p: f64, x: f64| {
            let params = Parameters::new([("p", p)]).expect("params");
            let fp = find_fixed_point(&model, &[x], &params, &settings).expect("fp");
            BranchPoint {
                index,
                param_value: p,
                test_functions: fp.test_functions(),
                fixed_point: fp,
            }
        };
        let a = point(3, 0.25, 0.5);
        let b = point(4, 0.0625, -0.25);
        let base = Parameters::new([("p", 0.25)]).expect("params");
        let problem = EquilibriumContinuationProblem::new(&model, base, 0, settings);
        let event = interpolated_event(&problem, &a, &b, BifurcationKind::SaddleNode);
        // det goes from -1.0 to 0.5, so the zero is two thirds along.
        assert!((event.state[0] - (0.5 - 0.75 * 2.0 / 3.0)).abs() < 1e-9);
        assert_eq!(event.bracket, (3, 4));
        assert_eq!(event.branch_index, 4);
        assert!(event.refined_point.is_none());
        // det = -2x is linear in x, so the interpolated zero is exact.
        assert!(event.test_value.abs() < 1e-9, "test value {}", event.test_value);
    }

    #[test]
    fn interpolated_event_reports_residual_test_value() {
        // x' = p - x⁴/4 has det = -x³, which is not linear along the secant.
        let model = FnModel::new(1, &["p"], |_t, x, p, out| out[0] = p[0] - 0.25 * x[0].powi(4))
            .with_jacobian(|x, _p| DMatrix::from_element(1, 1, -x[0].powi(3)));
        let settings = NewtonSettings::default();
        let point = |index: i32, p: f64, x: f64| {
            let params = Parameters::new([("p", p)]).expect("params");
            let fp = find_fixed_point(&model, &[x], &params, &settings).expect("fp");
            BranchPoint {
                index,
                param_value: p,
                test_functions: fp.test_functions(),
                fixed_point: fp,
            }
        };
        let a = point(0, 0.25, 1.0);
        let b = point(1, 0.015625, -0.5);
        let base = Parameters::new([("p", 0.25)]).expect("params");
        let problem = EquilibriumContinuationProblem::new(&model, base, 0, settings);
        let event = interpolated_event(&problem, &a, &b, BifurcationKind::SaddleNode);
        // det goes from -1 to 1/8, so the secant zero is at x = -1/3 where det = 1/27.
        assert!((event.state[0] + 1.0 / 3.0).abs() < 1e-12);
        assert!((event.test_value - 1.0 / 27.0).abs() < 1e-12, "test value {}", event.test_value);
        assert!(event.refined_point.is_none());
    }
}

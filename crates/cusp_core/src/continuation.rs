//! Pseudo-arclength continuation of equilibrium branches.
//!
//! A branch is traced on the augmented vector `z = [p, x]`. Each step
//! predicts along the unit tangent, corrects on the hyperplane orthogonal to
//! that tangent, and accepts the point only if the corrector converged, the
//! point moved at most twice the step length and the tangent turned by at
//! most `max_angle`. Rejected steps are retried from the last accepted point
//! with half the step length.

pub mod equilibrium;
pub mod problem;
pub mod types;
pub mod util;

pub use equilibrium::{extend_branch, trace_branch, EquilibriumContinuationProblem};
pub use types::{Branch, BranchPoint, BranchTermination, ContinuationSettings, Direction};

use crate::bifurcation::{self, BifurcationEvent};
use crate::error::{DynamicsError, Result};
use crate::linalg;
use nalgebra::{DMatrix, DVector};
use problem::ContinuationProblem;
use util::{compute_nullspace_tangent, orient_along};

/// Converged output of [`correct_on_hyperplane`].
pub(crate) struct Corrected {
    pub aug: DVector<f64>,
    pub iterations: usize,
}

/// Newton on `[F(z); n·(z − anchor)] = 0` starting from `start`.
///
/// With `start = anchor = z_pred` and `n` the tangent this is the
/// pseudo-arclength corrector; bifurcation refinement reuses it with the
/// secant as normal.
pub(crate) fn correct_on_hyperplane<P: ContinuationProblem>(
    problem: &P,
    start: &DVector<f64>,
    anchor: &DVector<f64>,
    normal: &DVector<f64>,
    settings: &ContinuationSettings,
) -> Result<Corrected> {
    let dim = problem.dimension();
    let mut current = start.clone();
    let mut residual_norm = f64::INFINITY;

    for iteration in 0..=settings.corrector_steps {
        let f_val = problem.residual(&current)?;
        let constraint = normal.dot(&(&current - anchor));
        let mut rhs = DVector::zeros(dim + 1);
        for i in 0..dim {
            rhs[i] = -f_val[i];
        }
        rhs[dim] = -constraint;

        residual_norm = rhs.norm();
        if !residual_norm.is_finite() {
            break;
        }
        if residual_norm < settings.corrector_tolerance {
            return Ok(Corrected {
                aug: current,
                iterations: iteration,
            });
        }
        if iteration == settings.corrector_steps {
            break;
        }

        let j_ext = problem.extended_jacobian(&current)?;
        let mut a = DMatrix::zeros(dim + 1, dim + 1);
        a.view_mut((0, 0), (dim, dim + 1)).copy_from(&j_ext);
        for i in 0..dim + 1 {
            a[(dim, i)] = normal[i];
        }

        let delta = linalg::solve(&a, &rhs)?;
        current += &delta;

        if delta.norm() < settings.step_tolerance {
            // A vanishing update only counts when the residual is small too.
            let f_norm = problem.residual(&current)?.norm();
            if f_norm < settings.corrector_tolerance.sqrt() {
                return Ok(Corrected {
                    aug: current,
                    iterations: iteration + 1,
                });
            }
            residual_norm = f_norm;
            break;
        }
    }

    Err(DynamicsError::NoConvergence {
        iterations: settings.corrector_steps,
        residual_norm,
    })
}

/// Unit tangent at `aug`, oriented along `reference`.
pub(crate) fn tangent_at<P: ContinuationProblem>(
    problem: &P,
    aug: &DVector<f64>,
    reference: &DVector<f64>,
) -> Result<DVector<f64>> {
    let j_ext = problem.extended_jacobian(aug)?;
    let tangent = compute_nullspace_tangent(&j_ext)?;
    Ok(orient_along(tangent, reference))
}

/// Step length along the tangent and the current run of easy corrections.
struct StepControl {
    h: f64,
    streak: usize,
}

impl StepControl {
    fn new(settings: &ContinuationSettings) -> Self {
        Self {
            h: settings.step_size,
            streak: 0,
        }
    }

    fn accepted(&mut self, iterations: usize, detected: bool, settings: &ContinuationSettings) {
        if detected {
            self.streak = 0;
            self.h = (self.h * 0.5).max(settings.min_step_size);
        } else if iterations <= settings.easy_corrections {
            self.streak += 1;
            if self.streak >= settings.easy_streak {
                self.streak = 0;
                self.h = (self.h * settings.growth_factor).min(settings.max_step_size);
            }
        } else {
            self.streak = 0;
        }
    }

    fn rejected(&mut self) {
        self.streak = 0;
        self.h *= 0.5;
    }
}

/// Result of walking along a branch from one endpoint.
pub(crate) struct Walk {
    /// New points in traversal order.
    pub points: Vec<BranchPoint>,
    pub events: Vec<BifurcationEvent>,
    pub termination: BranchTermination,
}

/// Walks from `start` along `tangent` adding at most `budget` points.
///
/// Indices advance by `index_step` (+1 or -1) from `start.index`.
pub(crate) fn walk<P: ContinuationProblem>(
    problem: &P,
    start: &BranchPoint,
    tangent: DVector<f64>,
    range: (f64, f64),
    settings: &ContinuationSettings,
    budget: usize,
    index_step: i32,
) -> Walk {
    let mut points: Vec<BranchPoint> = Vec::new();
    let mut events = Vec::new();
    let mut prev = start.clone();
    let mut z = util::to_aug(start.param_value, &start.fixed_point.state);
    let mut t = tangent;
    let mut step = StepControl::new(settings);

    let termination = loop {
        if points.len() >= budget {
            break BranchTermination::MaxPoints;
        }

        let h = step.h;
        let z_pred = &z + &t * h;
        let attempt = correct_on_hyperplane(problem, &z_pred, &z_pred, &t, settings).and_then(|c| {
            let t_new = tangent_at(problem, &c.aug, &t)?;
            let diag = problem.diagnostics(&c.aug)?;
            Ok((c, t_new, diag))
        });

        let rejection = match attempt {
            Ok((corrected, t_new, diag)) => {
                let distance = (&corrected.aug - &z).norm();
                let angle = t_new.dot(&t).clamp(-1.0, 1.0).acos();
                if distance > 2.0 * h {
                    format!("corrected point moved {distance:e}, more than twice the step {h:e}")
                } else if angle > settings.max_angle {
                    format!(
                        "tangent turned by {angle:.3} rad, limit is {:.3}",
                        settings.max_angle
                    )
                } else if !diag.test_values.is_finite() {
                    "test functions are not finite".to_string()
                } else {
                    let p = corrected.aug[0];
                    if p < range.0 || p > range.1 {
                        log::debug!("parameter {p} left range [{}, {}]", range.0, range.1);
                        break BranchTermination::ParameterRange;
                    }

                    let mut fixed_point = diag.fixed_point;
                    fixed_point.iterations = corrected.iterations;
                    let point = BranchPoint {
                        index: prev.index + index_step,
                        param_value: p,
                        fixed_point,
                        test_functions: diag.test_values,
                    };

                    let kinds = bifurcation::detect(&prev.test_functions, &point.test_functions);
                    for kind in &kinds {
                        let event = bifurcation::locate(
                            problem,
                            (&prev, &t),
                            (&point, &t_new),
                            *kind,
                            settings,
                        );
                        log::info!(
                            "{:?} detected between points {} and {} at parameter {:.8}",
                            event.kind,
                            prev.index,
                            point.index,
                            event.parameter_value
                        );
                        events.push(event);
                    }

                    step.accepted(corrected.iterations, !kinds.is_empty(), settings);

                    z = corrected.aug;
                    t = t_new;
                    prev = point.clone();
                    points.push(point);
                    continue;
                }
            }
            Err(err) => err.to_string(),
        };

        step.rejected();
        let h = step.h;
        log::debug!("rejected continuation step ({rejection}); retrying with h = {h:e}");
        if h < settings.min_step_size {
            log::warn!(
                "branch stalled after {} new points at step size {h:e}: {rejection}",
                points.len()
            );
            break BranchTermination::Stalled {
                points: points.len(),
                step_size: h,
                reason: rejection,
            };
        }
    };

    Walk {
        points,
        events,
        termination,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bifurcation::BifurcationKind;
    use crate::equilibrium::{find_fixed_point, NewtonSettings};
    use crate::models::{HopfNormalForm, SaddleNodeNormalForm};
    use crate::params::Parameters;
    use crate::traits::FnModel;
    use std::f64::consts::PI;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn start_point(model: &dyn crate::traits::Model, guess: &[f64], params: &[(&str, f64)]) -> crate::equilibrium::FixedPoint {
        let params = Parameters::new(params.iter().map(|(n, v)| (*n, *v))).expect("params");
        find_fixed_point(model, guess, &params, &NewtonSettings::default()).expect("start point")
    }

    #[test]
    fn saddle_node_branch_turns_around_fold() {
        init_logger();
        let model = SaddleNodeNormalForm;
        let start = start_point(&model, &[1.0], &[("p", 1.0)]);
        let settings = ContinuationSettings {
            direction: Direction::Backward,
            ..ContinuationSettings::default()
        };
        let branch = trace_branch(&model, &start, "p", (-0.5, 1.5), &settings).expect("branch");

        assert_eq!(branch.termination, BranchTermination::ParameterRange);
        let folds: Vec<_> = branch.events_of_kind(BifurcationKind::SaddleNode).collect();
        assert_eq!(folds.len(), 1, "events: {:?}", branch.events);
        assert!(folds[0].parameter_value.abs() < 1e-6);
        assert!(folds[0].state[0].abs() < 1e-4);
        assert!(folds[0].refined_point.is_some());
        assert_eq!(branch.events_of_kind(BifurcationKind::Hopf).count(), 0);

        // Indices are contiguous and the branch visits both sides of the fold.
        for pair in branch.points.windows(2) {
            assert_eq!(pair[1].index, pair[0].index + 1);
        }
        assert_eq!(branch.points.last().map(|p| p.index), Some(0));
        let params = branch.parameter_values();
        let min = params.iter().cloned().fold(f64::INFINITY, f64::min);
        assert!(min < 0.05 && min > -1e-8);
        let first = branch.points.first().expect("points");
        assert!(first.fixed_point.state[0] < 0.0);
        assert!(!first.fixed_point.stable);
        assert!(params.iter().all(|p| *p >= -0.5 && *p <= 1.5));
    }

    #[test]
    fn hopf_normal_form_reports_period() {
        init_logger();
        let model = HopfNormalForm;
        let start = start_point(&model, &[0.0, 0.0], &[("p", -0.5)]);
        let settings = ContinuationSettings::default();
        let branch = trace_branch(&model, &start, "p", (-0.5, 0.5), &settings).expect("branch");

        assert_eq!(branch.termination, BranchTermination::ParameterRange);
        let hopfs: Vec<_> = branch.events_of_kind(BifurcationKind::Hopf).collect();
        assert_eq!(hopfs.len(), 1);
        let hopf = hopfs[0];
        assert!(hopf.parameter_value.abs() < 1e-8, "p = {}", hopf.parameter_value);
        let period = hopf.period_estimate.expect("period");
        assert!((period - 2.0 * PI).abs() < 1e-6);
        let guess = hopf.cycle_guess.as_ref().expect("cycle guess");
        let radius = guess.state.iter().map(|v| v * v).sum::<f64>().sqrt();
        assert!((radius - settings.detection.hopf_amplitude).abs() < 1e-9);
        assert_eq!(branch.events_of_kind(BifurcationKind::SaddleNode).count(), 0);

        let (lo, hi) = hopf.bracket;
        assert_eq!(hi, lo + 1);
        assert_eq!(hopf.branch_index, hi);
        assert!(branch.point(lo).expect("lo").fixed_point.stable);
        assert!(!branch.point(hi).expect("hi").fixed_point.stable);
    }

    #[test]
    fn consecutive_points_respect_step_and_angle_bounds() {
        let model = SaddleNodeNormalForm;
        let start = start_point(&model, &[1.0], &[("p", 1.0)]);
        let settings = ContinuationSettings {
            direction: Direction::Backward,
            ..ContinuationSettings::default()
        };
        let branch = trace_branch(&model, &start, "p", (-0.5, 1.5), &settings).expect("branch");
        for pair in branch.points.windows(2) {
            let dz = ((pair[1].param_value - pair[0].param_value).powi(2)
                + (pair[1].fixed_point.state[0] - pair[0].fixed_point.state[0]).powi(2))
            .sqrt();
            assert!(dz <= 2.0 * settings.max_step_size + 1e-12);
        }
    }

    #[test]
    fn max_points_limits_branch_length() {
        let model = HopfNormalForm;
        let start = start_point(&model, &[0.0, 0.0], &[("p", -0.5)]);
        let settings = ContinuationSettings {
            max_points: 4,
            ..ContinuationSettings::default()
        };
        let branch = trace_branch(&model, &start, "p", (-1.0, 10.0), &settings).expect("branch");
        assert_eq!(branch.len(), 4);
        assert_eq!(branch.termination, BranchTermination::MaxPoints);
    }

    #[test]
    fn corrector_failures_stall_with_partial_branch() {
        init_logger();
        // The residual jumps away from zero for p > 0.3, so no correction
        // succeeds past that point.
        let model = FnModel::new(1, &["p"], |_t, x, p, out| {
            out[0] = if p[0] > 0.3 { 1.0 } else { -x[0] + p[0] };
        });
        let start = start_point(&model, &[0.0], &[("p", 0.0)]);
        let branch = trace_branch(&model, &start, "p", (-1.0, 1.0), &ContinuationSettings::default())
            .expect("branch");

        assert!(matches!(branch.termination, BranchTermination::Stalled { .. }));
        assert!(branch.len() > 1);
        assert!(branch.parameter_values().iter().all(|p| *p <= 0.3));
        match branch.stall_error() {
            Some(DynamicsError::StalledBranch { reason, .. }) => assert!(!reason.is_empty()),
            other => panic!("expected StalledBranch, got {other:?}"),
        }
    }

    #[test]
    fn extend_branch_continues_both_ends() {
        let model = HopfNormalForm;
        let start = start_point(&model, &[0.0, 0.0], &[("p", 0.0)]);
        let settings = ContinuationSettings::default();
        let branch = trace_branch(&model, &start, "p", (-0.2, 0.2), &settings).expect("branch");
        let forward_len = branch.len();
        assert!(branch.points.iter().all(|p| p.index >= 0));

        let extended =
            extend_branch(&model, branch, (-0.2, 0.2), &settings, Direction::Backward).expect("extended");
        assert!(extended.len() > forward_len);
        assert!(extended.points[0].index < 0);
        assert!(extended.points[0].param_value < 0.0);
        for pair in extended.points.windows(2) {
            assert_eq!(pair[1].index, pair[0].index + 1);
        }
    }

    #[test]
    fn step_grows_only_after_consecutive_easy_corrections() {
        let settings = ContinuationSettings::default();
        let mut step = StepControl::new(&settings);
        step.accepted(1, false, &settings);
        assert_eq!(step.h, 0.05);
        step.accepted(2, false, &settings);
        assert!((step.h - 0.075).abs() < 1e-15);

        step.accepted(1, false, &settings);
        step.accepted(5, false, &settings);
        step.accepted(1, false, &settings);
        assert!((step.h - 0.075).abs() < 1e-15, "hard correction must reset the run");

        step.rejected();
        assert!((step.h - 0.0375).abs() < 1e-15);
        step.accepted(1, false, &settings);
        assert!((step.h - 0.0375).abs() < 1e-15, "rejection must reset the run");
        step.accepted(1, true, &settings);
        assert!((step.h - 0.01875).abs() < 1e-15);
    }

    #[test]
    fn trace_branch_rejects_invalid_input() {
        let model = SaddleNodeNormalForm;
        let start = start_point(&model, &[1.0], &[("p", 1.0)]);
        let settings = ContinuationSettings::default();
        let invalid = |r: Result<Branch>| matches!(r, Err(DynamicsError::InvalidInput(_)));
        assert!(invalid(trace_branch(&model, &start, "q", (-1.0, 2.0), &settings)));
        assert!(invalid(trace_branch(&model, &start, "p", (2.0, -1.0), &settings)));
        assert!(invalid(trace_branch(&model, &start, "p", (2.0, 3.0), &settings)));
        let bad = ContinuationSettings {
            step_size: 1.0,
            ..settings
        };
        assert!(invalid(trace_branch(&model, &start, "p", (-1.0, 2.0), &bad)));
    }
}

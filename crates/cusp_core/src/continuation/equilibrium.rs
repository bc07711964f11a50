use super::problem::{ContinuationProblem, PointDiagnostics};
use super::types::{Branch, BranchPoint, BranchTermination, ContinuationSettings, Direction};
use super::util::{aug_state, check_aug, compute_nullspace_tangent, orient_along, orient_by_parameter, to_aug};
use super::walk;
use crate::equilibrium::{assemble_fixed_point, newton_solve, FixedPoint, NewtonOutcome, NewtonSettings};
use crate::error::Result;
use crate::jacobian::{evaluate, parameter_derivative, state_jacobian};
use crate::linalg;
use crate::params::Parameters;
use crate::traits::Model;
use crate::{bail_input, ensure_input};
use nalgebra::{DMatrix, DVector};

/// Equilibria `f(x; p) = 0` of a model continued in one parameter.
pub struct EquilibriumContinuationProblem<'a, M: ?Sized> {
    model: &'a M,
    base: Parameters,
    param_index: usize,
    newton: NewtonSettings,
}

impl<'a, M: Model + ?Sized> EquilibriumContinuationProblem<'a, M> {
    /// `base` must already be aligned to the model's parameter order.
    pub fn new(model: &'a M, base: Parameters, param_index: usize, newton: NewtonSettings) -> Self {
        Self {
            model,
            base,
            param_index,
            newton,
        }
    }

    pub fn parameter_index(&self) -> usize {
        self.param_index
    }

    fn params_at(&self, param: f64) -> Vec<f64> {
        let mut values = self.base.values().to_vec();
        values[self.param_index] = param;
        values
    }
}

impl<'a, M: Model + ?Sized> ContinuationProblem for EquilibriumContinuationProblem<'a, M> {
    fn dimension(&self) -> usize {
        self.model.dimension()
    }

    fn residual(&self, aug: &DVector<f64>) -> Result<DVector<f64>> {
        check_aug(aug, self.dimension())?;
        let params = self.params_at(aug[0]);
        let f = evaluate(self.model, 0.0, &aug_state(aug), &params);
        Ok(DVector::from_vec(f))
    }

    fn extended_jacobian(&self, aug: &DVector<f64>) -> Result<DMatrix<f64>> {
        let dim = self.dimension();
        check_aug(aug, dim)?;
        let params = self.params_at(aug[0]);
        let state = aug_state(aug);

        let mut j_ext = DMatrix::zeros(dim, dim + 1);
        let param_jac = parameter_derivative(
            self.model,
            0.0,
            &state,
            &params,
            self.param_index,
            self.newton.fd_step,
        );
        j_ext.column_mut(0).copy_from(&param_jac);
        let jac_x = state_jacobian(self.model, 0.0, &state, &params, self.newton.fd_step)?;
        j_ext.view_mut((0, 1), (dim, dim)).copy_from(&jac_x);
        Ok(j_ext)
    }

    fn diagnostics(&self, aug: &DVector<f64>) -> Result<PointDiagnostics> {
        check_aug(aug, self.dimension())?;
        let param = aug[0];
        let state = aug_state(aug);
        let residual_norm = linalg::norm(&evaluate(self.model, 0.0, &state, &self.params_at(param)));
        let outcome = NewtonOutcome {
            state,
            residual_norm,
            iterations: 0,
        };
        let fixed_point = assemble_fixed_point(
            self.model,
            outcome,
            self.base.with_value(self.param_index, param),
            &self.newton,
        )?;
        let test_values = fixed_point.test_functions();
        Ok(PointDiagnostics {
            fixed_point,
            test_values,
        })
    }

    fn solve_at_parameter(&self, param: f64, guess: &[f64]) -> Result<DVector<f64>> {
        let outcome = newton_solve(self.model, guess, &self.params_at(param), &self.newton)?;
        Ok(to_aug(param, &outcome.state))
    }
}

fn validate_range(range: (f64, f64)) -> Result<()> {
    ensure_input!(
        range.0.is_finite() && range.1.is_finite() && range.0 < range.1,
        "parameter range must satisfy lo < hi, got ({}, {})",
        range.0,
        range.1
    );
    Ok(())
}

/// Traces the equilibrium branch through `start` in the named parameter
/// until it leaves `range`, reaches `max_points` or stalls.
///
/// A stalled branch is still returned; see [`Branch::stall_error`].
pub fn trace_branch<M: Model + ?Sized>(
    model: &M,
    start: &FixedPoint,
    parameter: &str,
    range: (f64, f64),
    settings: &ContinuationSettings,
) -> Result<Branch> {
    settings.validate()?;
    validate_range(range)?;
    let base = start.parameters.aligned_to(model)?;
    let Some(param_index) = base.index_of(parameter) else {
        bail_input!("model has no parameter named '{}'", parameter);
    };
    let param_value = base.values()[param_index];
    ensure_input!(
        range.0 <= param_value && param_value <= range.1,
        "start value {} of '{}' lies outside [{}, {}]",
        param_value,
        parameter,
        range.0,
        range.1
    );
    ensure_input!(
        start.state.len() == model.dimension(),
        "start state has length {}, model dimension is {}",
        start.state.len(),
        model.dimension()
    );

    let problem = EquilibriumContinuationProblem::new(model, base, param_index, settings.newton);
    let aug = to_aug(param_value, &start.state);
    let diag = problem.diagnostics(&aug)?;
    let start_point = BranchPoint {
        index: 0,
        param_value,
        fixed_point: FixedPoint {
            iterations: start.iterations,
            ..diag.fixed_point
        },
        test_functions: diag.test_values,
    };

    let tangent = orient_by_parameter(
        compute_nullspace_tangent(&problem.extended_jacobian(&aug)?)?,
        settings.direction.sign(),
    );

    log::info!(
        "tracing '{}' from {} over [{}, {}] ({:?})",
        parameter,
        param_value,
        range.0,
        range.1,
        settings.direction
    );

    let mut branch = Branch {
        parameter_name: parameter.to_string(),
        parameter_index: param_index,
        points: vec![start_point],
        events: Vec::new(),
        termination: BranchTermination::MaxPoints,
    };
    let budget = settings.max_points.saturating_sub(1);
    grow(&problem, &mut branch, tangent, range, settings, budget, settings.direction);
    Ok(branch)
}

/// Continues an existing branch from its last (`Forward`) or first
/// (`Backward`) point, adding up to `max_points` new points.
pub fn extend_branch<M: Model + ?Sized>(
    model: &M,
    mut branch: Branch,
    range: (f64, f64),
    settings: &ContinuationSettings,
    direction: Direction,
) -> Result<Branch> {
    settings.validate()?;
    validate_range(range)?;
    ensure_input!(!branch.points.is_empty(), "cannot extend an empty branch");

    let endpoint_pos = match direction {
        Direction::Forward => branch.points.len() - 1,
        Direction::Backward => 0,
    };
    let endpoint = &branch.points[endpoint_pos];
    ensure_input!(
        range.0 <= endpoint.param_value && endpoint.param_value <= range.1,
        "branch endpoint {} lies outside [{}, {}]",
        endpoint.param_value,
        range.0,
        range.1
    );
    let base = endpoint.fixed_point.parameters.aligned_to(model)?;
    ensure_input!(
        base.names().get(branch.parameter_index) == Some(&branch.parameter_name),
        "branch parameter '{}' does not match the model",
        branch.parameter_name
    );

    let problem = EquilibriumContinuationProblem::new(model, base, branch.parameter_index, settings.newton);
    let aug = to_aug(endpoint.param_value, &endpoint.fixed_point.state);
    let raw = compute_nullspace_tangent(&problem.extended_jacobian(&aug)?)?;
    let tangent = if branch.points.len() >= 2 {
        let neighbor_pos = match direction {
            Direction::Forward => endpoint_pos - 1,
            Direction::Backward => 1,
        };
        let neighbor = &branch.points[neighbor_pos];
        let outward = &aug - to_aug(neighbor.param_value, &neighbor.fixed_point.state);
        orient_along(raw, &outward)
    } else {
        orient_by_parameter(raw, direction.sign())
    };

    log::info!(
        "extending '{}' {:?} from point {}",
        branch.parameter_name,
        direction,
        endpoint.index
    );
    grow(&problem, &mut branch, tangent, range, settings, settings.max_points, direction);
    Ok(branch)
}

fn grow<P: ContinuationProblem>(
    problem: &P,
    branch: &mut Branch,
    tangent: DVector<f64>,
    range: (f64, f64),
    settings: &ContinuationSettings,
    budget: usize,
    direction: Direction,
) {
    let (start, index_step) = match direction {
        Direction::Forward => (branch.points[branch.points.len() - 1].clone(), 1),
        Direction::Backward => (branch.points[0].clone(), -1),
    };
    let walked = walk(problem, &start, tangent, range, settings, budget, index_step);

    match direction {
        Direction::Forward => branch.points.extend(walked.points),
        Direction::Backward => {
            let mut points: Vec<BranchPoint> = walked.points.into_iter().rev().collect();
            points.append(&mut branch.points);
            branch.points = points;
        }
    }
    branch.events.extend(walked.events);
    branch.termination = match walked.termination {
        BranchTermination::Stalled {
            step_size, reason, ..
        } => BranchTermination::Stalled {
            points: branch.points.len(),
            step_size,
            reason,
        },
        other => other,
    };
    log::info!(
        "branch '{}' now has {} points and {} events ({:?})",
        branch.parameter_name,
        branch.points.len(),
        branch.events.len(),
        branch.termination
    );
}

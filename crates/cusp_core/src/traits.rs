use nalgebra::DMatrix;

/// A parameterized vector field `dx/dt = f(x, p, t)`.
///
/// This is the only surface the numerical core sees: model description
/// languages, importers and element trees are reduced to this interface
/// before analysis starts.
pub trait Model {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Parameter names, in the order `evaluate` expects their values.
    fn parameter_names(&self) -> Vec<String>;

    /// Evaluates the vector field.
    /// t: current time
    /// state: current state
    /// params: parameter values ordered as `parameter_names`
    /// out: buffer to write dx/dt
    fn evaluate(&self, t: f64, state: &[f64], params: &[f64], out: &mut [f64]);

    /// Analytic Jacobian `∂f/∂x`, if the model can supply one.
    /// Returning `None` makes the core fall back to central finite differences.
    fn jacobian(&self, _state: &[f64], _params: &[f64]) -> Option<DMatrix<f64>> {
        None
    }
}

impl<M: Model + ?Sized> Model for &M {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn parameter_names(&self) -> Vec<String> {
        (**self).parameter_names()
    }

    fn evaluate(&self, t: f64, state: &[f64], params: &[f64], out: &mut [f64]) {
        (**self).evaluate(t, state, params, out)
    }

    fn jacobian(&self, state: &[f64], params: &[f64]) -> Option<DMatrix<f64>> {
        (**self).jacobian(state, params)
    }
}

/// A trait for fixed-step solvers that can step a model forward.
pub trait Steppable {
    /// Performs one step of size dt.
    /// t: current time (updated after step)
    /// state: current state (updated after step)
    fn step<M: Model + ?Sized>(
        &mut self,
        model: &M,
        params: &[f64],
        t: &mut f64,
        state: &mut [f64],
        dt: f64,
    );
}

type RhsFn = dyn Fn(f64, &[f64], &[f64], &mut [f64]) + Send + Sync;
type JacobianFn = dyn Fn(&[f64], &[f64]) -> DMatrix<f64> + Send + Sync;

/// Closure-backed [`Model`] for collaborators that already hold the
/// right-hand side as a function.
pub struct FnModel {
    dimension: usize,
    parameter_names: Vec<String>,
    rhs: Box<RhsFn>,
    jacobian: Option<Box<JacobianFn>>,
}

impl FnModel {
    pub fn new<F>(dimension: usize, parameter_names: &[&str], rhs: F) -> Self
    where
        F: Fn(f64, &[f64], &[f64], &mut [f64]) + Send + Sync + 'static,
    {
        Self {
            dimension,
            parameter_names: parameter_names.iter().map(|s| s.to_string()).collect(),
            rhs: Box::new(rhs),
            jacobian: None,
        }
    }

    pub fn with_jacobian<J>(mut self, jacobian: J) -> Self
    where
        J: Fn(&[f64], &[f64]) -> DMatrix<f64> + Send + Sync + 'static,
    {
        self.jacobian = Some(Box::new(jacobian));
        self
    }
}

impl Model for FnModel {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn parameter_names(&self) -> Vec<String> {
        self.parameter_names.clone()
    }

    fn evaluate(&self, t: f64, state: &[f64], params: &[f64], out: &mut [f64]) {
        (self.rhs)(t, state, params, out)
    }

    fn jacobian(&self, state: &[f64], params: &[f64]) -> Option<DMatrix<f64>> {
        self.jacobian.as_ref().map(|j| j(state, params))
    }
}

impl std::fmt::Debug for FnModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnModel")
            .field("dimension", &self.dimension)
            .field("parameter_names", &self.parameter_names)
            .field("analytic_jacobian", &self.jacobian.is_some())
            .finish()
    }
}

//! `cusp_core` is the numerical engine behind Cusp: trajectories, equilibria,
//! stability, pseudo-arclength continuation and bifurcation detection for
//! parameterized ODEs `dx/dt = f(x, p, t)`.
//!
//! Models reach the core only through the [`Model`] trait. Key components:
//! - **Integrator** (`integrator`, `solvers`): Dormand–Prince 5(4), BDF2 and
//!   fixed-step RK4 with dense output.
//! - **RootFinder** (`equilibrium`): damped Newton with stability data.
//! - **StabilityClassifier** (`stability`): eigenvalues, phase-portrait kind
//!   and bifurcation test functions.
//! - **ContinuationEngine** (`continuation`): equilibrium branches in one
//!   parameter.
//! - **BifurcationDetector** (`bifurcation`, `periodic`): fold and Hopf
//!   events, Hopf cycle seeds and shooting for periodic orbits.
//! - **Analysis** (`analysis`): public entry points and rayon-backed sweeps.
//!
//! The library never installs a logger; it reports through the `log` facade.

pub mod analysis;
pub mod bifurcation;
pub mod config;
pub mod continuation;
pub mod equilibrium;
pub mod error;
pub mod integrator;
pub mod jacobian;
pub mod linalg;
pub mod models;
pub mod params;
pub mod periodic;
pub mod solvers;
pub mod stability;
pub mod traits;

pub use analysis::{
    find_fixed_points, run_trajectory, trace_branches, BranchRequest, FixedPointSweep, PoolOptions,
    SweepOptions,
};
pub use bifurcation::{BifurcationEvent, BifurcationKind, DetectionSettings};
pub use config::AnalysisConfig;
pub use continuation::{
    extend_branch, trace_branch, Branch, BranchPoint, BranchTermination, ContinuationSettings,
    Direction,
};
pub use equilibrium::{find_fixed_point, FixedPoint, NewtonSettings};
pub use error::{DynamicsError, Result};
pub use integrator::{integrate, IntegratorOptions, Method, Trajectory};
pub use params::Parameters;
pub use periodic::{shoot_limit_cycle, LimitCycle, LimitCycleGuess, ShootingSettings};
pub use stability::{classify, FixedPointKind, Stability, StabilityReport, TestFunctionValues};
pub use traits::{FnModel, Model};

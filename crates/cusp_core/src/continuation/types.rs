//! Core types for continuation analysis.

use crate::bifurcation::{BifurcationEvent, BifurcationKind, DetectionSettings};
use crate::ensure_input;
use crate::equilibrium::{FixedPoint, NewtonSettings};
use crate::error::{DynamicsError, Result};
use crate::stability::TestFunctionValues;
use serde::{Deserialize, Serialize};

/// Initial orientation of a branch relative to the continuation parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Direction {
    /// Increasing parameter; new points get increasing indices.
    #[default]
    Forward,
    /// Decreasing parameter; new points get decreasing (negative) indices.
    Backward,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Direction::Forward => 1.0,
            Direction::Backward => -1.0,
        }
    }
}

/// Settings controlling the pseudo-arclength continuation algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuationSettings {
    pub step_size: f64,
    pub min_step_size: f64,
    pub max_step_size: f64,
    pub max_points: usize,
    pub corrector_steps: usize,
    pub corrector_tolerance: f64,
    pub step_tolerance: f64,
    /// Largest accepted angle (radians) between consecutive unit tangents.
    pub max_angle: f64,
    pub growth_factor: f64,
    /// Corrections finishing within this many iterations grow the step.
    pub easy_corrections: usize,
    /// Consecutive easy corrections needed before the step grows.
    pub easy_streak: usize,
    pub direction: Direction,
    pub newton: NewtonSettings,
    pub detection: DetectionSettings,
}

impl Default for ContinuationSettings {
    fn default() -> Self {
        Self {
            step_size: 0.05,
            min_step_size: 1e-6,
            max_step_size: 0.2,
            max_points: 500,
            corrector_steps: 8,
            corrector_tolerance: 1e-9,
            step_tolerance: 1e-10,
            max_angle: 0.5,
            growth_factor: 1.5,
            easy_corrections: 2,
            easy_streak: 2,
            direction: Direction::Forward,
            newton: NewtonSettings::default(),
            detection: DetectionSettings::default(),
        }
    }
}

impl ContinuationSettings {
    pub fn validate(&self) -> Result<()> {
        ensure_input!(
            self.min_step_size.is_finite() && self.min_step_size > 0.0,
            "min_step_size must be positive, got {}",
            self.min_step_size
        );
        ensure_input!(
            self.step_size.is_finite()
                && self.min_step_size <= self.step_size
                && self.step_size <= self.max_step_size,
            "step sizes must satisfy min_step_size <= step_size <= max_step_size, got {} <= {} <= {}",
            self.min_step_size,
            self.step_size,
            self.max_step_size
        );
        ensure_input!(self.max_points >= 2, "max_points must be at least 2");
        ensure_input!(self.corrector_steps > 0, "corrector_steps must be greater than zero");
        ensure_input!(
            self.corrector_tolerance.is_finite() && self.corrector_tolerance > 0.0,
            "corrector_tolerance must be positive, got {}",
            self.corrector_tolerance
        );
        ensure_input!(
            self.step_tolerance.is_finite() && self.step_tolerance > 0.0,
            "step_tolerance must be positive, got {}",
            self.step_tolerance
        );
        ensure_input!(
            self.max_angle > 0.0 && self.max_angle <= std::f64::consts::PI,
            "max_angle must lie in (0, π], got {}",
            self.max_angle
        );
        ensure_input!(
            self.growth_factor.is_finite() && self.growth_factor >= 1.0,
            "growth_factor must be at least 1, got {}",
            self.growth_factor
        );
        ensure_input!(self.easy_streak > 0, "easy_streak must be greater than zero");
        self.newton.validate()?;
        self.detection.validate()
    }
}

/// A single accepted point on a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchPoint {
    /// Signed position relative to the start point (0).
    pub index: i32,
    pub param_value: f64,
    pub fixed_point: FixedPoint,
    pub test_functions: TestFunctionValues,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BranchTermination {
    /// The next point would have left the requested parameter range.
    ParameterRange,
    MaxPoints,
    /// The step size fell below `min_step_size`; `reason` is the last
    /// corrector failure.
    Stalled {
        points: usize,
        step_size: f64,
        reason: String,
    },
}

/// An equilibrium branch ordered by point index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub parameter_name: String,
    pub parameter_index: usize,
    pub points: Vec<BranchPoint>,
    pub events: Vec<BifurcationEvent>,
    pub termination: BranchTermination,
}

impl Branch {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn point(&self, index: i32) -> Option<&BranchPoint> {
        self.points.iter().find(|p| p.index == index)
    }

    pub fn parameter_values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.param_value).collect()
    }

    pub fn events_of_kind(&self, kind: BifurcationKind) -> impl Iterator<Item = &BifurcationEvent> + '_ {
        self.events.iter().filter(move |e| e.kind == kind)
    }

    /// The stall outcome as an error value, if the branch stalled.
    pub fn stall_error(&self) -> Option<DynamicsError> {
        match &self.termination {
            BranchTermination::Stalled {
                points,
                step_size,
                reason,
            } => Some(DynamicsError::StalledBranch {
                points: *points,
                step_size: *step_size,
                reason: reason.clone(),
            }),
            _ => None,
        }
    }
}

//! Public entry points, including the parallel sweeps.
//!
//! Each parallel call builds its own rayon pool and collects results in
//! input order, so output never depends on the thread count.

use crate::continuation::{self, Branch, ContinuationSettings};
use crate::ensure_input;
use crate::equilibrium::{find_fixed_point, FixedPoint, NewtonSettings};
use crate::error::{DynamicsError, Result};
use crate::integrator::{integrate, IntegratorOptions, Trajectory};
use crate::params::Parameters;
use crate::traits::Model;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Worker threads; `None` uses rayon's default (one per core).
    pub threads: Option<usize>,
}

impl PoolOptions {
    pub fn sequential() -> Self {
        Self { threads: Some(1) }
    }

    fn build(&self) -> Result<rayon::ThreadPool> {
        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(threads) = self.threads {
            ensure_input!(threads > 0, "thread count must be greater than zero");
            builder = builder.num_threads(threads);
        }
        builder
            .build()
            .map_err(|err| DynamicsError::InvalidInput(format!("failed to build thread pool: {err}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepOptions {
    /// Equilibria closer than this (Euclidean, in state space) are merged.
    pub dedup_tolerance: f64,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            dedup_tolerance: 1e-6,
        }
    }
}

/// Outcome of a multi-guess equilibrium search.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedPointSweep {
    /// Distinct equilibria, ordered by the first guess that reached them.
    pub points: Vec<FixedPoint>,
    /// `(guess index, error)` for every guess that failed.
    pub failures: Vec<(usize, DynamicsError)>,
}

/// Integrates one trajectory. See [`integrate`].
pub fn run_trajectory<M: Model + ?Sized>(
    model: &M,
    state0: &[f64],
    params: &Parameters,
    t_span: (f64, f64),
    options: &IntegratorOptions,
) -> Result<Trajectory> {
    let trajectory = integrate(model, state0, params, t_span, options)?;
    log::info!(
        "integrated {:?} over [{}, {}]: {} samples, {} accepted / {} rejected steps",
        options.method,
        t_span.0,
        t_span.1,
        trajectory.len(),
        trajectory.stats.accepted_steps,
        trajectory.stats.rejected_steps
    );
    Ok(trajectory)
}

/// Runs Newton from every guess in parallel and merges duplicate roots.
pub fn find_fixed_points<M: Model + Sync + ?Sized>(
    model: &M,
    guesses: &[Vec<f64>],
    params: &Parameters,
    settings: &NewtonSettings,
    sweep: &SweepOptions,
    pool: &PoolOptions,
) -> Result<FixedPointSweep> {
    settings.validate()?;
    ensure_input!(
        sweep.dedup_tolerance.is_finite() && sweep.dedup_tolerance >= 0.0,
        "dedup_tolerance must be non-negative, got {}",
        sweep.dedup_tolerance
    );
    let params = params.aligned_to(model)?;
    let pool = pool.build()?;

    let results: Vec<Result<FixedPoint>> = pool.install(|| {
        guesses
            .par_iter()
            .map(|guess| find_fixed_point(model, guess, &params, settings))
            .collect()
    });

    let mut points: Vec<FixedPoint> = Vec::new();
    let mut failures = Vec::new();
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(point) => {
                let duplicate = points
                    .iter()
                    .any(|known| distance(&known.state, &point.state) <= sweep.dedup_tolerance);
                if !duplicate {
                    points.push(point);
                }
            }
            Err(err) => {
                log::debug!("guess {index} failed: {err}");
                failures.push((index, err));
            }
        }
    }
    log::info!(
        "{} guesses gave {} distinct equilibria and {} failures",
        guesses.len(),
        points.len(),
        failures.len()
    );
    Ok(FixedPointSweep { points, failures })
}

fn distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// Traces one equilibrium branch. See [`continuation::trace_branch`].
pub fn trace_branch<M: Model + ?Sized>(
    model: &M,
    start: &FixedPoint,
    parameter: &str,
    range: (f64, f64),
    settings: &ContinuationSettings,
) -> Result<Branch> {
    continuation::trace_branch(model, start, parameter, range, settings)
}

/// One independent continuation run for [`trace_branches`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRequest {
    pub start: FixedPoint,
    pub parameter: String,
    pub range: (f64, f64),
    pub settings: ContinuationSettings,
}

/// Traces independent branches in parallel; results follow request order.
pub fn trace_branches<M: Model + Sync + ?Sized>(
    model: &M,
    requests: &[BranchRequest],
    pool: &PoolOptions,
) -> Result<Vec<Result<Branch>>> {
    let pool = pool.build()?;
    Ok(pool.install(|| {
        requests
            .par_iter()
            .map(|request| {
                continuation::trace_branch(
                    model,
                    &request.start,
                    &request.parameter,
                    request.range,
                    &request.settings,
                )
            })
            .collect()
    }))
}

use super::problem::ContinuationProblem;
use super::types::{ContinuationPath, ContinuationSettings, TerminationReason};
use super::ContinuationRunner;
use crate::bifurcation::{
    stability_range, AttractorSet, BifurcationData, ForcingWindow, StabilityDetection,
};
use crate::config::BifurcationConfig;
use crate::equilibrium::{
    all_close, refine_equilibrium, solve_equilibrium, EquilibriumSettings, NewtonSettings,
};
use crate::error::BifurcationError;
use crate::traits::ForcedModel;
use anyhow::{bail, Result};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Relative tolerance under which two interpolated attractors are one.
const CROSSING_COLLAPSE_RTOL: f64 = 1e-2;

/// Equilibria of a forced model as the zero set of `G(p, x) = f(x; p)`.
pub struct EquilibriumContinuationProblem<'a, M: ForcedModel + ?Sized> {
    model: &'a M,
}

impl<'a, M: ForcedModel + ?Sized> EquilibriumContinuationProblem<'a, M> {
    pub fn new(model: &'a M) -> Self {
        Self { model }
    }
}

impl<M: ForcedModel + ?Sized> ContinuationProblem for EquilibriumContinuationProblem<'_, M> {
    fn dimension(&self) -> usize {
        self.model.dimension()
    }

    fn residual(&self, aug_state: &DVector<f64>, out: &mut DVector<f64>) -> Result<()> {
        let dim = self.dimension();
        if out.len() != dim || aug_state.len() != dim + 1 {
            bail!("Residual buffer has incorrect dimension");
        }
        let state: Vec<f64> = aug_state.rows(1, dim).iter().cloned().collect();
        self.model.derivative(&state, aug_state[0], out.as_mut_slice());
        Ok(())
    }
}

/// Settings of a multi-segment equilibrium trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceSettings {
    /// Per-segment settings; `param_max` and `loop_back_epsilon` are
    /// overridden by the trace.
    pub continuation: ContinuationSettings,
    /// Settles the seed state from the model's lower extremal state.
    pub equilibrium: EquilibriumSettings,
    pub newton: NewtonSettings,
    /// A segment ending below this forcing has doubled back through zero.
    pub loop_back_epsilon: f64,
    /// Points dropped before the forcing maximum of a looped-back segment.
    pub truncation: usize,
    pub max_segments: usize,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            continuation: ContinuationSettings::default(),
            equilibrium: EquilibriumSettings::default(),
            newton: NewtonSettings::default(),
            loop_back_epsilon: 1e-5,
            truncation: 100,
            max_segments: 50,
        }
    }
}

impl TraceSettings {
    pub fn validate(&self) -> Result<()> {
        self.continuation.validate()?;
        self.equilibrium.validate()?;
        if !(self.loop_back_epsilon >= 0.0) {
            bail!("loop_back_epsilon must be non-negative.");
        }
        if self.max_segments == 0 {
            bail!("max_segments must be greater than zero.");
        }
        Ok(())
    }
}

/// Equilibrium reached from the lower extremal state, Newton-polished when
/// possible.
fn seed_state<M: ForcedModel + ?Sized>(model: &M, forcing: f64, settings: &TraceSettings) -> Result<Vec<f64>> {
    let [lower, _] = model.extremal_initial_states();
    let settled = solve_equilibrium(model, forcing, &lower, &settings.equilibrium);
    if !settled.is_defined() {
        bail!("No equilibrium to seed continuation at forcing {}.", forcing);
    }
    match refine_equilibrium(model, forcing, &settled.state, settings.newton) {
        Ok(refined) => Ok(refined),
        Err(err) => {
            debug!(forcing, error = %err, "keeping unrefined seed state");
            Ok(settled.state)
        }
    }
}

/// Follows the equilibrium curve from just below the window up to its
/// maximum forcing, restarting from the last accepted point whenever a
/// segment stops early.
///
/// A segment that doubles back below `loop_back_epsilon` is cut
/// `truncation` points before its forcing maximum and the trace is reseeded
/// there from the lower extremal state.
pub fn trace_equilibrium_branch<M: ForcedModel + ?Sized>(
    model: &M,
    window: ForcingWindow,
    settings: &TraceSettings,
) -> Result<ContinuationPath> {
    settings.validate()?;
    let problem = EquilibriumContinuationProblem::new(model);
    let max_forcing = window.max() as f64;
    let continuation = ContinuationSettings {
        param_max: max_forcing,
        loop_back_epsilon: Some(settings.loop_back_epsilon),
        ..settings.continuation
    };

    let mut start_param = (window.min() as f64 - 1.0).max(0.1);
    let mut start_state = seed_state(model, start_param, settings)?;
    let mut path = ContinuationPath::default();
    let mut resumes_path = false;

    for segment in 0..settings.max_segments {
        let run = ContinuationRunner::new(&problem, &start_state, start_param, continuation)?.run()?;
        let termination = run.termination;
        let accepted = run.points.len() - 1;
        let mut points = run.points;
        if resumes_path && !points.is_empty() {
            points.remove(0);
        }
        debug!(model = model.name(), segment, accepted, ?termination, "continuation segment finished");

        if termination == Some(TerminationReason::LoopedBack) {
            let peak = points
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.param_value.total_cmp(&b.1.param_value))
                .map_or(0, |(i, _)| i);
            let cut = peak.saturating_sub(settings.truncation);
            let reseed_param = points.get(cut).map_or(start_param, |p| p.param_value);
            points.truncate(cut);
            path.points.extend(points);
            info!(model = model.name(), forcing = reseed_param, "trace looped back, reseeding");
            start_param = reseed_param;
            start_state = seed_state(model, start_param, settings)?;
            resumes_path = false;
        } else {
            path.points.extend(points);
            let Some(last) = path.points.last() else {
                bail!("Continuation produced an empty path.");
            };
            start_param = last.param_value;
            start_state = last.state.clone();
            resumes_path = true;
        }
        path.termination = termination;

        if path.points.last().is_some_and(|p| p.param_value >= max_forcing) {
            return Ok(path);
        }
        if accepted == 0 {
            warn!(model = model.name(), forcing = start_param, "continuation trace stalled");
            return Ok(path);
        }
    }

    warn!(
        model = model.name(),
        segments = settings.max_segments,
        "continuation trace did not reach the maximum forcing"
    );
    Ok(path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrossingDirection {
    Increasing,
    Decreasing,
}

/// Linear interpolation of a path at an integer forcing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForcingCrossing {
    pub forcing: i64,
    pub state: Vec<f64>,
    pub direction: CrossingDirection,
}

/// Interpolates the path at every integer forcing of the window it crosses.
///
/// An increasing edge `p_i -> p_{i+1}` emits the integers in
/// `(p_i, p_{i+1}]`, a decreasing one those in `[p_{i+1}, p_i)`, so each
/// monotone stretch yields one crossing per integer and nothing is emitted
/// past a fold.
pub fn interpolate_integer_forcings(path: &ContinuationPath, window: ForcingWindow) -> Vec<ForcingCrossing> {
    let mut crossings = Vec::new();
    for edge in path.points.windows(2) {
        let (a, b) = (&edge[0], &edge[1]);
        let (pa, pb) = (a.param_value, b.param_value);
        if !pa.is_finite() || !pb.is_finite() || pa == pb {
            continue;
        }
        let interpolate = |forcing: i64| {
            let s = (forcing as f64 - pa) / (pb - pa);
            a.state
                .iter()
                .zip(&b.state)
                .map(|(x, y)| x + s * (y - x))
                .collect::<Vec<f64>>()
        };
        if pb > pa {
            let first = (pa.floor() as i64 + 1).max(window.min());
            let last = (pb.floor() as i64).min(window.max());
            for forcing in first..=last {
                crossings.push(ForcingCrossing {
                    forcing,
                    state: interpolate(forcing),
                    direction: CrossingDirection::Increasing,
                });
            }
        } else {
            let first = (pa.ceil() as i64 - 1).min(window.max());
            let last = (pb.ceil() as i64).max(window.min());
            for forcing in (last..=first).rev() {
                crossings.push(ForcingCrossing {
                    forcing,
                    state: interpolate(forcing),
                    direction: CrossingDirection::Decreasing,
                });
            }
        }
    }
    crossings
}

fn attractor_set(mut states: Vec<Vec<f64>>) -> AttractorSet {
    states.sort_by(|a, b| a[0].total_cmp(&b[0]));
    let (Some(lower), Some(upper)) = (states.first(), states.last()) else {
        return AttractorSet::Monostable(Vec::new());
    };
    if states.len() == 1 || all_close(lower, upper, CROSSING_COLLAPSE_RTOL) {
        AttractorSet::Monostable(lower.clone())
    } else {
        AttractorSet::Bistable {
            lower: lower.clone(),
            upper: upper.clone(),
        }
    }
}

/// Bifurcation data read off a continuation path: stretches of increasing
/// forcing are attractors, decreasing stretches are repulsors.
pub fn bifurcation_from_continuation(
    path: &ContinuationPath,
    window: ForcingWindow,
) -> crate::error::Result<BifurcationData> {
    let mut states: BTreeMap<i64, Vec<Vec<f64>>> = BTreeMap::new();
    let mut repulsors = BTreeMap::new();
    for crossing in interpolate_integer_forcings(path, window) {
        match crossing.direction {
            CrossingDirection::Increasing => states.entry(crossing.forcing).or_default().push(crossing.state),
            CrossingDirection::Decreasing => {
                if let Some(&value) = crossing.state.first() {
                    repulsors.insert(crossing.forcing, value);
                }
            }
        }
    }

    let mut attractors = BTreeMap::new();
    for forcing in window.forcings() {
        let found = states.remove(&forcing).ok_or(BifurcationError::MissingForcing(forcing))?;
        attractors.insert(forcing, attractor_set(found));
    }

    let detection = match attractors
        .iter()
        .find(|&(&forcing, set)| set.is_bistable() && window.strictly_contains(forcing))
    {
        Some((&forcing, _)) => StabilityDetection::Bistable { forcing },
        None => StabilityDetection::Monostable(
            attractors
                .iter()
                .map(|(&forcing, set)| (forcing, set.first().to_vec()))
                .collect(),
        ),
    };
    let range = stability_range(&mut attractors, &detection, window)?;
    match (range.lower_bound, range.upper_bound) {
        (Some(lower), upper) => {
            let upper = upper.unwrap_or(window.max() + 1);
            repulsors.retain(|&forcing, _| forcing > lower && forcing < upper);
        }
        (None, _) => repulsors.clear(),
    }

    Ok(BifurcationData::from_parts(window, detection, range, attractors, repulsors))
}

/// Traces the model over the configured window and reads the bifurcation
/// data off the path.
pub fn continuation_bifurcation_data<M: ForcedModel + ?Sized>(
    model: &M,
    config: &BifurcationConfig,
) -> Result<BifurcationData> {
    config.validate()?;
    let window = config.window()?;
    let path = trace_equilibrium_branch(model, window, &config.trace)?;
    Ok(bifurcation_from_continuation(&path, window)?)
}

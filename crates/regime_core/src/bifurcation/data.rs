use super::{
    detect_stability, forcing_to_attractors, forcings_inside_bistable_range, repulsors_for_forcings,
    shift_range, stability_range, AttractorSet, ForcingWindow, ShiftRange, StabilityDetection,
    StabilityRange,
};
use crate::config::BifurcationConfig;
use crate::error::{BifurcationError, Result};
use crate::traits::ForcedModel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Everything known about the bifurcation structure of one model over one
/// forcing window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BifurcationData {
    window: ForcingWindow,
    pub detection: StabilityDetection,
    pub stability_range: StabilityRange,
    pub forcing_to_attractors: BTreeMap<i64, AttractorSet>,
    /// Repulsors strictly inside the bistable range; failed searches are absent.
    pub forcing_to_repulsor: BTreeMap<i64, f64>,
}

impl BifurcationData {
    pub fn from_parts(
        window: ForcingWindow,
        detection: StabilityDetection,
        stability_range: StabilityRange,
        forcing_to_attractors: BTreeMap<i64, AttractorSet>,
        forcing_to_repulsor: BTreeMap<i64, f64>,
    ) -> Self {
        Self {
            window,
            detection,
            stability_range,
            forcing_to_attractors,
            forcing_to_repulsor,
        }
    }

    /// Runs detection, attractor mapping, range bisection and, when enabled,
    /// the repulsor searches.
    pub fn from_model<M: ForcedModel + ?Sized>(model: &M, config: &BifurcationConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|err| BifurcationError::InvalidSettings(format!("{err:#}")))?;
        let window = config.window()?;
        let detection = detect_stability(model, window, &config.attractors)?;
        let mut attractors = forcing_to_attractors(model, window, &detection, &config.attractors)?;
        let range = stability_range(&mut attractors, &detection, window)?;
        let repulsors = repulsors_inside_range(model, &range, window, config)?;

        info!(
            model = model.name(),
            bistable = detection.is_bistable(),
            lower_bound = ?range.lower_bound,
            upper_bound = ?range.upper_bound,
            repulsors = repulsors.len(),
            "bifurcation data computed"
        );
        Ok(Self::from_parts(window, detection, range, attractors, repulsors))
    }

    pub fn window(&self) -> ForcingWindow {
        self.window
    }

    /// True when the lower attractor at `forcing` sits below `threshold` in
    /// its first component, i.e. the model cannot hold a vegetated state even
    /// under heavy forcing. The customary values are
    /// [`super::DEGENERACY_FORCING`] and [`super::DEGENERACY_THRESHOLD`].
    pub fn is_degenerate(&self, forcing: i64, threshold: f64) -> Result<bool> {
        let set = self
            .forcing_to_attractors
            .get(&forcing)
            .ok_or(BifurcationError::MissingForcing(forcing))?;
        Ok(set.first().first().is_some_and(|&value| value < threshold))
    }

    pub fn is_bistable(&self) -> bool {
        self.detection.is_bistable()
    }

    pub fn shift_range(&self) -> Result<ShiftRange> {
        if !self.is_bistable() {
            return Err(BifurcationError::NotBistable);
        }
        shift_range(&self.stability_range, &mut &self.forcing_to_attractors, self.window)
    }

    /// Flat record keeping the first state component only.
    pub fn to_record(&self) -> BifurcationRecord {
        let first_component = |state: &Option<Vec<f64>>| state.as_ref().and_then(|s| s.first().copied());
        BifurcationRecord {
            min_forcing: self.window.min(),
            max_forcing: self.window.max(),
            lower_forcing: self.stability_range.lower_bound,
            upper_forcing: self.stability_range.upper_bound,
            lower_state: first_component(&self.stability_range.lower_state),
            upper_state: first_component(&self.stability_range.upper_state),
            detection: self.detection.bistable_forcing(),
            attractors: self
                .forcing_to_attractors
                .iter()
                .map(|(&forcing, set)| AttractorEntry {
                    forcing,
                    states: set.states().iter().map(|state| state[0]).collect(),
                })
                .collect(),
            repulsors: self
                .forcing_to_repulsor
                .iter()
                .map(|(&forcing, &value)| RepulsorEntry { forcing, value })
                .collect(),
        }
    }

    /// Rebuilds one-state data from a record. A monostable detection is
    /// reconstructed from the first attractor of every entry.
    pub fn from_record(record: &BifurcationRecord) -> Result<Self> {
        let window = ForcingWindow::new(record.min_forcing as f64, record.max_forcing as f64)?;

        let mut forcing_to_attractors = BTreeMap::new();
        for entry in &record.attractors {
            let set = match entry.states.as_slice() {
                [single] => AttractorSet::Monostable(vec![*single]),
                [lower, upper] => AttractorSet::Bistable {
                    lower: vec![*lower],
                    upper: vec![*upper],
                },
                states => {
                    return Err(BifurcationError::MalformedRecord(format!(
                        "forcing {} holds {} attractors",
                        entry.forcing,
                        states.len()
                    )))
                }
            };
            forcing_to_attractors.insert(entry.forcing, set);
        }

        if record.lower_forcing.is_none() && record.upper_forcing.is_some() {
            return Err(BifurcationError::MalformedRecord(
                "upper forcing bound without a lower one".to_string(),
            ));
        }
        let stability_range = StabilityRange {
            lower_bound: record.lower_forcing,
            upper_bound: record.upper_forcing,
            lower_state: record.lower_state.map(|value| vec![value]),
            upper_state: record.upper_state.map(|value| vec![value]),
        };

        let detection = match record.detection {
            Some(forcing) => StabilityDetection::Bistable { forcing },
            None => StabilityDetection::Monostable(
                forcing_to_attractors
                    .iter()
                    .map(|(&forcing, set)| (forcing, set.first().to_vec()))
                    .collect(),
            ),
        };

        let forcing_to_repulsor = record
            .repulsors
            .iter()
            .map(|entry| (entry.forcing, entry.value))
            .collect();

        Ok(Self::from_parts(
            window,
            detection,
            stability_range,
            forcing_to_attractors,
            forcing_to_repulsor,
        ))
    }
}

/// Repulsors strictly inside a bistable range. Searches are skipped when
/// disabled, when the range is monostable and, with a warning, for models
/// with more than one state.
fn repulsors_inside_range<M: ForcedModel + ?Sized>(
    model: &M,
    range: &StabilityRange,
    window: ForcingWindow,
    config: &BifurcationConfig,
) -> Result<BTreeMap<i64, f64>> {
    if !config.compute_repulsors || !range.is_bistable() {
        return Ok(BTreeMap::new());
    }
    if model.dimension() != 1 {
        warn!(
            model = model.name(),
            dimension = model.dimension(),
            "repulsor search needs a one-state model, skipping"
        );
        return Ok(BTreeMap::new());
    }
    let forcings = forcings_inside_bistable_range(range, window);
    repulsors_for_forcings(model, &forcings, None, None, &config.repulsor)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttractorEntry {
    pub forcing: i64,
    pub states: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepulsorEntry {
    pub forcing: i64,
    pub value: f64,
}

/// Persisted form of [`BifurcationData`]. Undefined bounds and a monostable
/// detection are `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BifurcationRecord {
    pub min_forcing: i64,
    pub max_forcing: i64,
    pub lower_forcing: Option<i64>,
    pub upper_forcing: Option<i64>,
    pub lower_state: Option<f64>,
    pub upper_state: Option<f64>,
    pub detection: Option<i64>,
    pub attractors: Vec<AttractorEntry>,
    pub repulsors: Vec<RepulsorEntry>,
}

impl BifurcationRecord {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|err| BifurcationError::MalformedRecord(err.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|err| BifurcationError::MalformedRecord(err.to_string()))
    }
}

use super::{ForcingWindow, StabilityDetection};
use crate::equilibrium::{all_close, solve_equilibrium, EquilibriumSettings};
use crate::error::{BifurcationError, Result};
use crate::traits::ForcedModel;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Distinct stable equilibria at one forcing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttractorSet {
    Monostable(Vec<f64>),
    /// Reached from the lower and upper extremal initial states respectively.
    Bistable { lower: Vec<f64>, upper: Vec<f64> },
}

impl AttractorSet {
    pub fn is_bistable(&self) -> bool {
        matches!(self, AttractorSet::Bistable { .. })
    }

    pub fn len(&self) -> usize {
        match self {
            AttractorSet::Monostable(_) => 1,
            AttractorSet::Bistable { .. } => 2,
        }
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// The only attractor, or the lower branch of a bistable set.
    pub fn first(&self) -> &[f64] {
        match self {
            AttractorSet::Monostable(state) => state,
            AttractorSet::Bistable { lower, .. } => lower,
        }
    }

    pub fn get(&self, index: usize) -> Option<&[f64]> {
        match (self, index) {
            (AttractorSet::Monostable(state), 0) => Some(state),
            (AttractorSet::Bistable { lower, .. }, 0) => Some(lower),
            (AttractorSet::Bistable { upper, .. }, 1) => Some(upper),
            _ => None,
        }
    }

    pub fn states(&self) -> Vec<&[f64]> {
        match self {
            AttractorSet::Monostable(state) => vec![state.as_slice()],
            AttractorSet::Bistable { lower, upper } => vec![lower.as_slice(), upper.as_slice()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttractorSettings {
    pub equilibrium: EquilibriumSettings,
    /// Two results this close are one attractor.
    pub collapse_rtol: f64,
    /// Largest tolerated inversion of the two results before it counts as an error.
    pub gap_rtol: f64,
}

impl Default for AttractorSettings {
    fn default() -> Self {
        Self {
            equilibrium: EquilibriumSettings::default(),
            collapse_rtol: 1e-2,
            gap_rtol: 1e-1,
        }
    }
}

fn mean(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| 0.5 * (x + y)).collect()
}

/// Attractor set at `forcing`, from the model's two extremal initial states.
///
/// The two results collapse to their mean when they are close, or when the
/// lower result lies above the upper one in every component (solver slack);
/// such an inversion wider than `gap_rtol` is an error. Results containing
/// NaN collapse as well, so an undefined state never counts as bistability.
pub fn attractors<M: ForcedModel + ?Sized>(
    model: &M,
    forcing: f64,
    settings: &AttractorSettings,
) -> Result<AttractorSet> {
    let [from_lower, from_upper] = model.extremal_initial_states();
    let lower = solve_equilibrium(model, forcing, &from_lower, &settings.equilibrium).state;
    let upper = solve_equilibrium(model, forcing, &from_upper, &settings.equilibrium).state;

    if lower.iter().chain(&upper).any(|v| v.is_nan()) {
        debug!(forcing, "undefined attractor");
        return Ok(AttractorSet::Monostable(mean(&lower, &upper)));
    }
    if all_close(&lower, &upper, settings.collapse_rtol) {
        return Ok(AttractorSet::Monostable(mean(&lower, &upper)));
    }
    if lower.iter().zip(&upper).all(|(l, u)| l > u) {
        if !all_close(&lower, &upper, settings.gap_rtol) {
            return Err(BifurcationError::AttractorGap {
                forcing,
                lower,
                upper,
            });
        }
        return Ok(AttractorSet::Monostable(mean(&lower, &upper)));
    }
    Ok(AttractorSet::Bistable { lower, upper })
}

/// Attractor sets for every integer forcing of the window.
///
/// A monostable detection already holds one attractor per forcing; a
/// bistable one requires evaluating the whole window, done in parallel.
pub fn forcing_to_attractors<M: ForcedModel + ?Sized>(
    model: &M,
    window: ForcingWindow,
    detection: &StabilityDetection,
    settings: &AttractorSettings,
) -> Result<BTreeMap<i64, AttractorSet>> {
    match detection {
        StabilityDetection::Monostable(map) => Ok(map
            .iter()
            .map(|(&forcing, state)| (forcing, AttractorSet::Monostable(state.clone())))
            .collect()),
        StabilityDetection::Bistable { .. } => window
            .forcings()
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|forcing| Ok((forcing, attractors(model, forcing as f64, settings)?)))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equilibrium::test_models::Cusp;
    use crate::traits::ForcedModel;

    /// Bistable cubic whose "lower" extremal start sits above the upper
    /// attractor, so the lower result ends up above the upper one.
    struct Inverted {
        low: f64,
        high: f64,
        stiffness: f64,
    }

    impl ForcedModel for Inverted {
        fn name(&self) -> &str {
            "inverted"
        }

        fn state_names(&self) -> Vec<String> {
            vec!["x".to_string()]
        }

        fn derivative(&self, state: &[f64], _forcing: f64, out: &mut [f64]) {
            let x = state[0];
            let mid = 0.5 * (self.low + self.high);
            out[0] = -self.stiffness * (x - self.low) * (x - mid) * (x - self.high);
        }

        fn extremal_initial_states(&self) -> [Vec<f64>; 2] {
            [vec![self.high + 2.0], vec![self.low - 1.0]]
        }
    }

    #[test]
    fn bistable_forcing_yields_ordered_distinct_attractors() {
        let model = Cusp::new(400.0, 100.0);
        let set = attractors(&model, 400.0, &AttractorSettings::default()).expect("attractors");
        let AttractorSet::Bistable { lower, upper } = &set else {
            panic!("expected bistability at the cusp centre, got {set:?}");
        };
        assert!(lower[0] < upper[0]);
        assert!(!all_close(lower, upper, 1e-2));
        assert!((lower[0] - 1.0).abs() < 1e-2 && (upper[0] - 3.0).abs() < 1e-2);
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(1), Some(upper.as_slice()));
    }

    #[test]
    fn monostable_forcing_collapses_to_one_attractor() {
        let model = Cusp::new(400.0, 100.0);
        let set = attractors(&model, 100.0, &AttractorSettings::default()).expect("attractors");
        assert!(!set.is_bistable());
        let expected = model.equilibria(100.0)[0];
        assert!((set.first()[0] - expected).abs() < 1e-2, "got {:?}", set.first());
        assert_eq!(set.get(1), None);
    }

    #[test]
    fn small_inversion_is_treated_as_slack() {
        let model = Inverted {
            low: 1.0,
            high: 1.05,
            stiffness: 1000.0,
        };
        let set = attractors(&model, 0.0, &AttractorSettings::default()).expect("slack is tolerated");
        assert!(!set.is_bistable());
        assert!((set.first()[0] - 1.025).abs() < 1e-3, "mean of both results, got {:?}", set.first());
    }

    #[test]
    fn large_inversion_is_an_error() {
        let model = Inverted {
            low: 1.0,
            high: 2.0,
            stiffness: 1.0,
        };
        let err = attractors(&model, 0.0, &AttractorSettings::default()).expect_err("gap too large");
        assert!(matches!(err, BifurcationError::AttractorGap { .. }));
        assert!(format!("{err}").contains("gap is too large"));
    }

    #[test]
    fn monostable_detection_maps_directly() {
        let window = ForcingWindow::new(1.0, 3.0).expect("window");
        let detection = StabilityDetection::Monostable(
            [(1, vec![0.1]), (2, vec![0.2]), (3, vec![0.3])].into_iter().collect(),
        );
        let model = Cusp::new(400.0, 100.0);
        let map = forcing_to_attractors(&model, window, &detection, &AttractorSettings::default())
            .expect("mapping");
        assert_eq!(map.len(), 3);
        assert_eq!(map[&2], AttractorSet::Monostable(vec![0.2]));
    }

    #[test]
    fn bistable_detection_evaluates_every_forcing() {
        let window = ForcingWindow::new(395.0, 405.0).expect("window");
        let detection = StabilityDetection::Bistable { forcing: 400 };
        let model = Cusp::new(400.0, 100.0);
        let map = forcing_to_attractors(&model, window, &detection, &AttractorSettings::default())
            .expect("mapping");
        assert_eq!(map.keys().copied().collect::<Vec<_>>(), window.forcings().collect::<Vec<_>>());
        assert!(map.values().all(AttractorSet::is_bistable));
    }
}

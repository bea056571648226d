use super::{attractors, AttractorSettings, ForcingWindow};
use crate::error::{BifurcationError, Result};
use crate::traits::ForcedModel;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Outcome of the bistability scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StabilityDetection {
    /// A forcing at which two attractors were observed.
    Bistable { forcing: i64 },
    /// No bistability found: one attractor for every integer forcing of the window.
    Monostable(BTreeMap<i64, Vec<f64>>),
}

impl StabilityDetection {
    pub fn is_bistable(&self) -> bool {
        matches!(self, StabilityDetection::Bistable { .. })
    }

    pub fn bistable_forcing(&self) -> Option<i64> {
        match self {
            StabilityDetection::Bistable { forcing } => Some(*forcing),
            StabilityDetection::Monostable(_) => None,
        }
    }
}

/// Forcings visited by the hierarchical scan, one vector per refinement round.
///
/// With `stop = 2^ceil(log2(max_forcing))`, round `k` visits the odd
/// multiples of `stop / 2^(k+1)`: the midpoint first, then the quarter
/// points, and so on. Only forcings strictly inside the window are kept.
/// Across all rounds every integer of `(min_forcing, max_forcing)` appears
/// exactly once.
pub fn scan_rounds(window: ForcingWindow) -> Vec<Vec<i64>> {
    let max = window.max();
    let max_power = if max <= 1 {
        0
    } else {
        64 - (max - 1).leading_zeros()
    };
    let stop: i64 = 1 << max_power;

    (0..max_power)
        .map(|power| {
            let step = stop >> (power + 1);
            (0..(1i64 << power))
                .map(|j| (2 * j + 1) * step)
                .filter(|&forcing| window.strictly_contains(forcing))
                .collect()
        })
        .collect()
}

/// Searches the window for a bistable forcing.
///
/// Each round is evaluated in parallel and then inspected in scan order, so
/// the first bistable forcing returned is the one a sequential scan would
/// find. Without bistability inside the window the two endpoints are added;
/// an endpoint that is itself bistable only contributes its lower branch.
pub fn detect_stability<M: ForcedModel + ?Sized>(
    model: &M,
    window: ForcingWindow,
    settings: &AttractorSettings,
) -> Result<StabilityDetection> {
    let mut forcing_to_attractor = BTreeMap::new();

    for (round, forcings) in scan_rounds(window).into_iter().enumerate() {
        debug!(model = model.name(), round, count = forcings.len(), "scanning forcings");
        let results: Vec<_> = forcings
            .par_iter()
            .map(|&forcing| (forcing, attractors(model, forcing as f64, settings)))
            .collect();

        for (forcing, result) in results {
            let set = result?;
            if set.is_bistable() {
                info!(model = model.name(), forcing, "bistability detected");
                return Ok(StabilityDetection::Bistable { forcing });
            }
            forcing_to_attractor.insert(forcing, set.first().to_vec());
        }
    }

    for forcing in [window.min(), window.max()] {
        let set = attractors(model, forcing as f64, settings)?;
        if set.is_bistable() {
            warn!(
                model = model.name(),
                forcing,
                "only a window endpoint is bistable, keeping its lower branch"
            );
        }
        forcing_to_attractor.insert(forcing, set.first().to_vec());
    }

    if let Some(missing) = window
        .forcings()
        .find(|forcing| !forcing_to_attractor.contains_key(forcing))
    {
        return Err(BifurcationError::IncompleteScan(missing));
    }
    Ok(StabilityDetection::Monostable(forcing_to_attractor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equilibrium::test_models::Cusp;
    use std::collections::BTreeSet;

    #[test]
    fn scan_starts_at_midpoint_and_refines() {
        let window = ForcingWindow::new(0.0, 16.0).expect("window");
        let rounds = scan_rounds(window);
        assert_eq!(rounds, vec![vec![8], vec![4, 12], vec![2, 6, 10, 14], vec![1, 3, 5, 7, 9, 11, 13, 15]]);
    }

    #[test]
    fn scan_covers_window_interior_exactly_once() {
        for (min, max) in [(1.0, 2000.0), (300.0, 500.0), (0.0, 1.0), (7.0, 9.0), (1.0, 4000.0)] {
            let window = ForcingWindow::new(min, max).expect("window");
            let visited: Vec<i64> = scan_rounds(window).into_iter().flatten().collect();
            let unique: BTreeSet<i64> = visited.iter().copied().collect();
            assert_eq!(visited.len(), unique.len(), "duplicates in {min}..{max}");
            let interior: BTreeSet<i64> = ((min as i64 + 1)..(max as i64)).collect();
            assert_eq!(unique, interior, "coverage of {min}..{max}");
        }
    }

    #[test]
    fn detects_first_bistable_forcing_in_scan_order() {
        // Bistable for forcings 389..=396: 392 is the only odd multiple of 8
        // and no multiple of 16 falls inside.
        let model = Cusp::new(392.5, 10.0);
        let window = ForcingWindow::new(1.0, 2000.0).expect("window");
        let detection = detect_stability(&model, window, &AttractorSettings::default())
            .expect("detection");
        assert_eq!(detection, StabilityDetection::Bistable { forcing: 392 });
        assert_eq!(detection.bistable_forcing(), Some(392));
    }

    #[test]
    fn monostable_window_maps_every_integer_forcing() {
        let model = Cusp::new(400.0, 100.0);
        let window = ForcingWindow::new(1.0, 100.0).expect("window");
        let detection = detect_stability(&model, window, &AttractorSettings::default())
            .expect("detection");
        let StabilityDetection::Monostable(map) = detection else {
            panic!("expected a monostable map");
        };
        let keys: Vec<i64> = map.keys().copied().collect();
        assert_eq!(keys, window.forcings().collect::<Vec<_>>());
        assert!(map.values().all(|state| state.len() == 1 && state[0].is_finite()));
    }

    // Policy, not a law: when only a window endpoint is bistable the scan
    // reports monostability and keeps that endpoint's lower branch.
    #[test]
    fn bistable_endpoint_only_keeps_lower_branch() {
        let model = Cusp::new(400.0, 100.0);
        let window = ForcingWindow::new(300.0, 362.0).expect("window");
        let detection = detect_stability(&model, window, &AttractorSettings::default())
            .expect("detection");
        let StabilityDetection::Monostable(map) = detection else {
            panic!("an endpoint-only bistability must not be reported as bistable");
        };
        let lower_branch = model.equilibria(362.0)[0];
        assert_eq!(map.len(), window.len());
        assert!((map[&362][0] - lower_branch).abs() < 1e-2, "got {:?}", map[&362]);
    }
}

use super::BifurcationData;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Regime of the runoff coefficient.
///
/// The runoff coefficient falls as the water-holding state rises, so a state
/// on the low branch is the `Upper` regime and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Regime {
    Lower,
    Upper,
    Unknown,
}

/// How a state inside a bistable model is assigned to a regime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegimeDefinition {
    /// Compare the state with the middle of the shift range.
    #[default]
    Threshold,
    /// Outside the bistable range the forcing decides; inside it the state
    /// is compared with the repulsor at the nearest forcing.
    BasinOfAttraction,
}

/// Regime of `state` observed under `forcing`. Monostable data has no regimes.
pub fn classify_regime(
    data: &BifurcationData,
    forcing: f64,
    state: f64,
    definition: RegimeDefinition,
) -> Result<Regime> {
    if !data.is_bistable() {
        return Ok(Regime::Unknown);
    }
    match definition {
        RegimeDefinition::Threshold => {
            let shift = data.shift_range()?;
            Ok(regime_below(state, shift.middle_state_value()))
        }
        RegimeDefinition::BasinOfAttraction => Ok(basin_regime(data, forcing, state)),
    }
}

fn regime_below(state: f64, separator: f64) -> Regime {
    if state < separator {
        Regime::Upper
    } else {
        Regime::Lower
    }
}

fn basin_regime(data: &BifurcationData, forcing: f64, state: f64) -> Regime {
    let range = &data.stability_range;
    if let Some(lower) = range.lower_bound {
        if forcing <= lower as f64 {
            return Regime::Upper;
        }
    }
    if let Some(upper) = range.upper_bound {
        if forcing >= upper as f64 {
            return Regime::Lower;
        }
    }

    // Ties go to the smaller forcing.
    let nearest = data.forcing_to_repulsor.iter().fold(None, |best: Option<(f64, f64)>, (&key, &value)| {
        let distance = (forcing - key as f64).abs();
        match best {
            Some((best_distance, _)) if best_distance <= distance => best,
            _ => Some((distance, value)),
        }
    });
    match nearest {
        Some((_, repulsor)) => regime_below(state, repulsor),
        None => Regime::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bifurcation::{
        AttractorSet, ForcingWindow, StabilityDetection, StabilityRange,
    };
    use std::collections::BTreeMap;

    /// Bistable on 4..=6 with branches at 0.2 and 0.8 and a repulsor that
    /// drifts upward with forcing.
    fn bistable_data() -> BifurcationData {
        let window = ForcingWindow::new(0.0, 10.0).expect("window");
        let forcing_to_attractors: BTreeMap<i64, AttractorSet> = window
            .forcings()
            .map(|forcing| {
                let set = match forcing {
                    0..=3 => AttractorSet::Monostable(vec![0.8]),
                    4..=6 => AttractorSet::Bistable {
                        lower: vec![0.2],
                        upper: vec![0.8],
                    },
                    _ => AttractorSet::Monostable(vec![0.2]),
                };
                (forcing, set)
            })
            .collect();
        let forcing_to_repulsor = [(4, 0.4), (5, 0.5), (6, 0.6)].into_iter().collect();
        BifurcationData::from_parts(
            window,
            StabilityDetection::Bistable { forcing: 5 },
            StabilityRange {
                lower_bound: Some(3),
                upper_bound: Some(7),
                lower_state: Some(vec![0.8]),
                upper_state: Some(vec![0.2]),
            },
            forcing_to_attractors,
            forcing_to_repulsor,
        )
    }

    #[test]
    fn threshold_splits_at_shift_range_middle() {
        let data = bistable_data();
        let classify = |state| classify_regime(&data, 5.0, state, RegimeDefinition::Threshold).expect("regime");
        assert_eq!(classify(0.3), Regime::Upper);
        assert_eq!(classify(0.5), Regime::Lower);
        assert_eq!(classify(0.7), Regime::Lower);
    }

    #[test]
    fn basin_uses_forcing_outside_bistable_range() {
        let data = bistable_data();
        let classify =
            |forcing, state| classify_regime(&data, forcing, state, RegimeDefinition::BasinOfAttraction).expect("regime");
        assert_eq!(classify(2.0, 0.9), Regime::Upper);
        assert_eq!(classify(3.0, 0.9), Regime::Upper);
        assert_eq!(classify(7.0, 0.1), Regime::Lower);
        assert_eq!(classify(9.5, 0.1), Regime::Lower);
    }

    #[test]
    fn basin_uses_nearest_repulsor_inside_bistable_range() {
        let data = bistable_data();
        let classify =
            |forcing, state| classify_regime(&data, forcing, state, RegimeDefinition::BasinOfAttraction).expect("regime");
        assert_eq!(classify(4.2, 0.45), Regime::Lower);
        assert_eq!(classify(5.9, 0.55), Regime::Upper);
        // Equidistant from 4 and 5: the repulsor at 4 decides.
        assert_eq!(classify(4.5, 0.45), Regime::Lower);
    }

    #[test]
    fn basin_without_repulsors_is_unknown() {
        let mut data = bistable_data();
        data.forcing_to_repulsor.clear();
        let regime = classify_regime(&data, 5.0, 0.1, RegimeDefinition::BasinOfAttraction).expect("regime");
        assert_eq!(regime, Regime::Unknown);
    }

    #[test]
    fn monostable_data_is_unknown() {
        let window = ForcingWindow::new(0.0, 2.0).expect("window");
        let map: BTreeMap<i64, Vec<f64>> = window.forcings().map(|f| (f, vec![0.5])).collect();
        let data = BifurcationData::from_parts(
            window,
            StabilityDetection::Monostable(map.clone()),
            StabilityRange::monostable(),
            map.into_iter().map(|(f, s)| (f, AttractorSet::Monostable(s))).collect(),
            BTreeMap::new(),
        );
        for definition in [RegimeDefinition::Threshold, RegimeDefinition::BasinOfAttraction] {
            assert_eq!(classify_regime(&data, 1.0, 0.1, definition).expect("regime"), Regime::Unknown);
        }
    }
}

use super::{AttractorLookup, ForcingWindow, StabilityRange};
use crate::error::{BifurcationError, Result};
use serde::Serialize;

/// The two branch states bounding a regime shift, with the forcings they
/// were taken at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ShiftRange {
    lower_state_value: f64,
    upper_state_value: f64,
    forcing_lower_state: f64,
    forcing_upper_state: f64,
}

impl ShiftRange {
    /// Fails unless `lower_state_value < upper_state_value`.
    pub fn new(
        lower_state_value: f64,
        upper_state_value: f64,
        forcing_lower_state: f64,
        forcing_upper_state: f64,
    ) -> Result<Self> {
        if !(lower_state_value < upper_state_value) {
            return Err(BifurcationError::InvalidShiftRange {
                lower: lower_state_value,
                upper: upper_state_value,
            });
        }
        Ok(Self {
            lower_state_value,
            upper_state_value,
            forcing_lower_state,
            forcing_upper_state,
        })
    }

    pub fn lower_state_value(&self) -> f64 {
        self.lower_state_value
    }

    pub fn upper_state_value(&self) -> f64 {
        self.upper_state_value
    }

    pub fn forcing_lower_state(&self) -> f64 {
        self.forcing_lower_state
    }

    pub fn forcing_upper_state(&self) -> f64 {
        self.forcing_upper_state
    }

    pub fn middle_state_value(&self) -> f64 {
        0.5 * (self.lower_state_value + self.upper_state_value)
    }

    /// True when the lower state sits at a forcing no larger than the upper
    /// state's, i.e. the two branches cross when drawn over forcing.
    pub fn branches_are_crossing(&self) -> bool {
        self.forcing_lower_state <= self.forcing_upper_state
    }
}

/// Shift range of a bistable region.
///
/// One point is the first attractor just below the upper bound (or at the
/// window maximum when the region is open), the other the second attractor
/// just above the lower bound.
pub fn shift_range<L: AttractorLookup>(
    range: &StabilityRange,
    lookup: &mut L,
    window: ForcingWindow,
) -> Result<ShiftRange> {
    let lower_bound = range.lower_bound.ok_or(BifurcationError::NotBistable)?;

    let first_forcing = range.upper_bound.map_or(window.max(), |upper| upper - 1);
    let first_state = lookup.attractors_at(first_forcing)?.first()[0];

    let second_forcing = lower_bound + 1;
    let second_state = lookup
        .attractors_at(second_forcing)?
        .get(1)
        .ok_or(BifurcationError::ExpectedBistable(second_forcing))?[0];

    let (mut first_forcing, mut second_forcing) = (first_forcing as f64, second_forcing as f64);
    if first_forcing + 1.0 == second_forcing {
        first_forcing += 0.5;
        second_forcing -= 0.5;
    }
    if first_forcing < second_forcing {
        return Err(BifurcationError::ShiftRangeOrder {
            first: first_forcing,
            second: second_forcing,
        });
    }

    if first_state <= second_state {
        ShiftRange::new(first_state, second_state, first_forcing, second_forcing)
    } else {
        ShiftRange::new(second_state, first_state, second_forcing, first_forcing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bifurcation::{
        detect_stability, forcing_to_attractors, stability_range, AttractorSet, AttractorSettings,
    };
    use crate::equilibrium::test_models::Cusp;
    use std::collections::BTreeMap;

    #[test]
    fn construction_requires_ordered_states() {
        assert!(ShiftRange::new(0.2, 0.8, 10.0, 5.0).is_ok());
        for (lower, upper) in [(0.8, 0.2), (0.5, 0.5), (f64::NAN, 1.0)] {
            let err = ShiftRange::new(lower, upper, 0.0, 1.0).expect_err("unordered states");
            assert!(matches!(err, BifurcationError::InvalidShiftRange { .. }));
        }
    }

    #[test]
    fn derived_quantities() {
        let shift = ShiftRange::new(0.2, 0.8, 10.0, 5.0).expect("valid");
        assert!((shift.middle_state_value() - 0.5).abs() < 1e-12);
        assert!(!shift.branches_are_crossing());
        assert!(ShiftRange::new(0.2, 0.8, 5.0, 10.0).expect("valid").branches_are_crossing());
    }

    #[test]
    fn monostable_range_has_no_shift() {
        let window = ForcingWindow::new(0.0, 10.0).expect("window");
        let mut map = BTreeMap::new();
        let err = shift_range(&StabilityRange::monostable(), &mut map, window).expect_err("monostable");
        assert_eq!(err, BifurcationError::NotBistable);
    }

    #[test]
    fn missing_second_attractor_is_reported() {
        let window = ForcingWindow::new(0.0, 10.0).expect("window");
        let mut map: BTreeMap<i64, AttractorSet> = window
            .forcings()
            .map(|forcing| (forcing, AttractorSet::Monostable(vec![forcing as f64])))
            .collect();
        let range = StabilityRange {
            lower_bound: Some(2),
            upper_bound: Some(8),
            lower_state: Some(vec![2.0]),
            upper_state: Some(vec![8.0]),
        };
        let err = shift_range(&range, &mut map, window).expect_err("no second attractor");
        assert_eq!(err, BifurcationError::ExpectedBistable(3));
    }

    #[test]
    fn open_region_uses_window_maximum() {
        let window = ForcingWindow::new(0.0, 10.0).expect("window");
        let mut map: BTreeMap<i64, AttractorSet> = window
            .forcings()
            .map(|forcing| {
                let set = if forcing > 4 {
                    AttractorSet::Bistable {
                        lower: vec![0.1],
                        upper: vec![0.9],
                    }
                } else {
                    AttractorSet::Monostable(vec![0.5])
                };
                (forcing, set)
            })
            .collect();
        let range = StabilityRange {
            lower_bound: Some(4),
            upper_bound: None,
            lower_state: Some(vec![0.5]),
            upper_state: None,
        };
        let shift = shift_range(&range, &mut map, window).expect("shift range");
        assert_eq!(shift.lower_state_value(), 0.1);
        assert_eq!(shift.upper_state_value(), 0.9);
        assert_eq!(shift.forcing_lower_state(), 10.0);
        assert_eq!(shift.forcing_upper_state(), 5.0);
    }

    #[test]
    fn cusp_shift_range_spans_both_folds() {
        let model = Cusp::new(400.0, 100.0);
        let settings = AttractorSettings::default();
        let window = ForcingWindow::new(300.0, 500.0).expect("window");
        let detection = detect_stability(&model, window, &settings).expect("detection");
        let mut map = forcing_to_attractors(&model, window, &detection, &settings).expect("attractors");
        let range = stability_range(&mut map, &detection, window).expect("range");
        let shift = shift_range(&range, &mut map, window).expect("shift range");

        let lower_branch = model.equilibria(438.0)[0];
        let upper_branch = *model.equilibria(362.0).last().expect("upper root");
        assert!((shift.lower_state_value() - lower_branch).abs() < 2e-2, "{shift:?}");
        assert!((shift.upper_state_value() - upper_branch).abs() < 2e-2, "{shift:?}");
        assert_eq!(shift.forcing_lower_state(), 438.0);
        assert_eq!(shift.forcing_upper_state(), 362.0);
        assert!(!shift.branches_are_crossing());
        assert!((shift.middle_state_value() - 2.0).abs() < 2e-2);
    }
}

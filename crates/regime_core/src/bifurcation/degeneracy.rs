use crate::equilibrium::{solve_equilibrium, EquilibriumSettings};
use crate::traits::ForcedModel;
use rayon::prelude::*;
use tracing::info;

/// Forcing at which parameter sets are screened.
pub const DEGENERACY_FORCING: i64 = 2000;
/// Lower attractors below this value mark a degenerate parameter set.
pub const DEGENERACY_THRESHOLD: f64 = 0.1;

/// True when the attractor reached from the model's lower extremal state at
/// `forcing` sits below `threshold` in its first component. Undefined
/// attractors are not degenerate.
pub fn is_degenerate<M: ForcedModel + ?Sized>(
    model: &M,
    forcing: f64,
    threshold: f64,
    settings: &EquilibriumSettings,
) -> bool {
    let [from_lower, _] = model.extremal_initial_states();
    let attractor = solve_equilibrium(model, forcing, &from_lower, settings);
    attractor.state.first().is_some_and(|&value| value < threshold)
}

/// Drops the degenerate members of an ensemble, screened in parallel at
/// [`DEGENERACY_FORCING`]. Survivors keep their order.
pub fn retain_non_degenerate<M: ForcedModel + Send>(members: Vec<M>, settings: &EquilibriumSettings) -> Vec<M> {
    let total = members.len();
    let kept: Vec<M> = members
        .into_par_iter()
        .filter(|model| !is_degenerate(model, DEGENERACY_FORCING as f64, DEGENERACY_THRESHOLD, settings))
        .collect();
    info!(total, kept = kept.len(), "screened ensemble for degenerate members");
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bifurcation::{detect_stability, forcing_to_attractors, AttractorSettings, BifurcationData, ForcingWindow};
    use crate::config::BifurcationConfig;
    use crate::equilibrium::test_models::Cusp;
    use crate::error::BifurcationError;
    use crate::models::WaterHoldingModel;

    #[test]
    fn low_lower_attractor_is_degenerate() {
        let settings = EquilibriumSettings::default();
        let forcing = DEGENERACY_FORCING as f64;
        assert!(is_degenerate(&Cusp::new(10000.0, 100.0), forcing, DEGENERACY_THRESHOLD, &settings));
        assert!(!is_degenerate(&Cusp::new(400.0, 100.0), forcing, DEGENERACY_THRESHOLD, &settings));
        assert!(!is_degenerate(&WaterHoldingModel::default(), forcing, DEGENERACY_THRESHOLD, &settings));
        assert!(is_degenerate(&Cusp::new(400.0, 100.0), forcing, 10.0, &settings));
    }

    #[test]
    fn attractor_map_agrees_with_direct_screening() {
        let window = ForcingWindow::new(1990.0, 2000.0).expect("window");
        let settings = AttractorSettings::default();
        for (model, expected) in [(Cusp::new(10000.0, 100.0), true), (Cusp::new(400.0, 100.0), false)] {
            let detection = detect_stability(&model, window, &settings).expect("detection");
            let map = forcing_to_attractors(&model, window, &detection, &settings).expect("attractors");
            assert_eq!(map.len(), 11);
            let lower = map[&DEGENERACY_FORCING].first()[0];
            assert_eq!(lower < DEGENERACY_THRESHOLD, expected, "lower attractor {lower}");

            let config = BifurcationConfig {
                min_forcing: 1990.0,
                max_forcing: 2000.0,
                ..BifurcationConfig::default()
            };
            let data = BifurcationData::from_model(&model, &config).expect("bifurcation data");
            assert_eq!(data.is_degenerate(DEGENERACY_FORCING, DEGENERACY_THRESHOLD), Ok(expected));
            assert_eq!(data.is_degenerate(2500, DEGENERACY_THRESHOLD), Err(BifurcationError::MissingForcing(2500)));
        }
    }

    #[test]
    fn screening_keeps_member_order() {
        let members = vec![Cusp::new(400.0, 100.0), Cusp::new(10000.0, 100.0), Cusp::new(1000.0, 100.0)];
        let kept = retain_non_degenerate(members, &EquilibriumSettings::default());
        let centers: Vec<f64> = kept.iter().map(|model| model.center).collect();
        assert_eq!(centers, vec![400.0, 1000.0]);
    }
}

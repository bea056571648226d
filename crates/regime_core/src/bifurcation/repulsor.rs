use super::{ForcingWindow, StabilityRange};
use crate::equilibrium::{is_close, solve_equilibrium, EquilibriumSettings};
use crate::error::{BifurcationError, Result};
use crate::traits::ForcedModel;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepulsorSettings {
    pub equilibrium: EquilibriumSettings,
    /// The search stops once the bracket ends are this close.
    pub rtol: f64,
    pub max_iterations: usize,
}

impl Default for RepulsorSettings {
    fn default() -> Self {
        Self {
            equilibrium: EquilibriumSettings::default(),
            rtol: 1e-2,
            max_iterations: 100,
        }
    }
}

impl RepulsorSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.rtol > 0.0) {
            return Err(BifurcationError::InvalidSettings(format!(
                "repulsor rtol must be positive, got {}",
                self.rtol
            )));
        }
        self.equilibrium
            .validate()
            .map_err(|err| BifurcationError::InvalidSettings(format!("repulsor equilibrium: {err:#}")))
    }
}

/// Locates the unstable equilibrium between two stable branches of a
/// one-state model by bisection in state space.
///
/// The bracket `[value_under, value_above]` is narrowed by watching where
/// trajectories started from its ends and from its midpoint settle. Returns
/// `None` when the bracket does not close within `max_iterations` or when
/// a trajectory ends undefined.
pub fn find_repulsor<M: ForcedModel + ?Sized>(
    model: &M,
    forcing: f64,
    value_under: f64,
    value_above: f64,
    settings: &RepulsorSettings,
) -> Result<Option<f64>> {
    check_dimension(model)?;
    settings.validate()?;

    let settle = |value: f64| -> f64 {
        solve_equilibrium(model, forcing, &[value], &settings.equilibrium).state[0]
    };

    let (mut under, mut above) = (value_under, value_above);
    for iteration in 0..=settings.max_iterations {
        if !(under <= above) {
            warn!(forcing, under, above, "repulsor bracket is inverted or undefined");
            return Ok(None);
        }
        let middle = 0.5 * (under + above);
        if is_close(under, above, settings.rtol) {
            debug!(forcing, iteration, repulsor = middle, "repulsor bracket closed");
            return Ok(Some(middle));
        }
        if iteration == settings.max_iterations {
            break;
        }

        let attractor_under = settle(under);
        let attractor_above = settle(above);
        if attractor_under.is_nan() || attractor_above.is_nan() {
            warn!(forcing, under, above, "undefined attractor during repulsor search");
            return Ok(None);
        }

        if attractor_above < middle {
            above = middle;
        } else if attractor_under > middle {
            under = middle;
        } else {
            let attractor_middle = settle(middle);
            if attractor_middle.is_nan() {
                warn!(forcing, middle, "undefined attractor during repulsor search");
                return Ok(None);
            }
            let closer_to_above =
                (attractor_above - attractor_middle).abs() < (attractor_middle - attractor_under).abs();
            if closer_to_above {
                above = middle.min(attractor_middle).min(attractor_above);
            } else {
                under = middle.max(attractor_middle).max(attractor_under);
            }
        }
    }

    warn!(
        forcing,
        max_iterations = settings.max_iterations,
        "repulsor search gave up"
    );
    Ok(None)
}

/// Runs one independent repulsor search per forcing, in parallel.
///
/// The bracket defaults to the model's extremal initial states. Forcings
/// whose search gives up are absent from the result; errors abort the batch.
pub fn repulsors_for_forcings<M: ForcedModel + ?Sized>(
    model: &M,
    forcings: &[i64],
    value_under: Option<f64>,
    value_above: Option<f64>,
    settings: &RepulsorSettings,
) -> Result<BTreeMap<i64, f64>> {
    check_dimension(model)?;
    let [lowest, highest] = model.extremal_initial_states();
    let under = value_under.unwrap_or(lowest[0]);
    let above = value_above.unwrap_or(highest[0]);

    let found = forcings
        .par_iter()
        .map(|&forcing| {
            Ok(find_repulsor(model, forcing as f64, under, above, settings)?.map(|value| (forcing, value)))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(found.into_iter().flatten().collect())
}

/// Integer forcings strictly inside the bistable range; the range runs to
/// the window's maximum when its upper bound is open.
pub fn forcings_inside_bistable_range(range: &StabilityRange, window: ForcingWindow) -> Vec<i64> {
    match range.lower_bound {
        Some(lower) => ((lower + 1)..range.upper_bound.unwrap_or(window.max())).collect(),
        None => Vec::new(),
    }
}

fn check_dimension<M: ForcedModel + ?Sized>(model: &M) -> Result<()> {
    let dimension = model.dimension();
    if dimension != 1 {
        return Err(BifurcationError::DimensionMismatch {
            operation: "repulsor search",
            expected: 1,
            actual: dimension,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equilibrium::test_models::Cusp;
    use crate::models::WoodyBareModel;

    #[test]
    fn finds_middle_root_of_cusp() {
        let model = Cusp::new(400.0, 100.0);
        let roots = model.equilibria(420.0);
        let repulsor = find_repulsor(&model, 420.0, -1.0, 5.0, &RepulsorSettings::default())
            .expect("one-state model")
            .expect("search converges");
        assert!((repulsor - roots[1]).abs() < 2e-2, "repulsor {repulsor}, roots {roots:?}");
    }

    #[test]
    fn repulsor_separates_the_basins() {
        let model = Cusp::new(400.0, 100.0);
        let settings = RepulsorSettings::default();
        let roots = model.equilibria(400.0);
        let repulsor = find_repulsor(&model, 400.0, -1.0, 5.0, &settings)
            .expect("one-state model")
            .expect("search converges");

        let below = solve_equilibrium(&model, 400.0, &[repulsor - 0.05], &settings.equilibrium);
        let above = solve_equilibrium(&model, 400.0, &[repulsor + 0.05], &settings.equilibrium);
        assert!(below.state[0] < repulsor + settings.rtol);
        assert!(above.state[0] > repulsor - settings.rtol);
        assert!((below.state[0] - roots[0]).abs() < 1e-2);
        assert!((above.state[0] - roots[2]).abs() < 1e-2);
    }

    #[test]
    fn undefined_bracket_gives_up() {
        let model = Cusp::new(400.0, 100.0);
        let found = find_repulsor(&model, 400.0, f64::NAN, 5.0, &RepulsorSettings::default())
            .expect("one-state model");
        assert_eq!(found, None);
    }

    #[test]
    fn exhausted_iterations_give_up() {
        let model = Cusp::new(400.0, 100.0);
        let settings = RepulsorSettings {
            max_iterations: 2,
            ..RepulsorSettings::default()
        };
        let found = find_repulsor(&model, 400.0, -1.0, 5.0, &settings).expect("one-state model");
        assert_eq!(found, None);
    }

    #[test]
    fn multi_state_models_are_rejected() {
        let err = find_repulsor(&WoodyBareModel::default(), 400.0, 0.0, 1.0, &RepulsorSettings::default())
            .expect_err("two-state model");
        assert!(matches!(
            err,
            BifurcationError::DimensionMismatch {
                expected: 1,
                actual: 2,
                ..
            }
        ));
    }

    #[test]
    fn parallel_search_keeps_forcing_order() {
        let model = Cusp::new(400.0, 100.0);
        let forcings = [380, 400, 420];
        let repulsors = repulsors_for_forcings(&model, &forcings, None, None, &RepulsorSettings::default())
            .expect("one-state model");
        assert_eq!(repulsors.keys().copied().collect::<Vec<_>>(), forcings.to_vec());
        for (&forcing, &value) in &repulsors {
            let middle = model.equilibria(forcing as f64)[1];
            assert!((value - middle).abs() < 2e-2, "forcing {forcing}: {value} vs {middle}");
        }
    }

    #[test]
    fn invalid_settings_abort_the_batch() {
        let model = Cusp::new(400.0, 100.0);
        let settings = RepulsorSettings {
            rtol: -1.0,
            ..RepulsorSettings::default()
        };
        let err = repulsors_for_forcings(&model, &[390, 400], None, None, &settings)
            .expect_err("negative rtol");
        assert!(matches!(err, BifurcationError::InvalidSettings(_)));

        let short = RepulsorSettings {
            equilibrium: EquilibriumSettings {
                durations: vec![2],
                ..EquilibriumSettings::default()
            },
            ..RepulsorSettings::default()
        };
        assert!(matches!(
            find_repulsor(&model, 400.0, -1.0, 5.0, &short),
            Err(BifurcationError::InvalidSettings(_))
        ));
    }

    #[test]
    fn bistable_interior_excludes_bounds() {
        let window = ForcingWindow::new(0.0, 20.0).expect("window");
        let closed = StabilityRange {
            lower_bound: Some(5),
            upper_bound: Some(9),
            lower_state: Some(vec![0.0]),
            upper_state: Some(vec![1.0]),
        };
        assert_eq!(forcings_inside_bistable_range(&closed, window), vec![6, 7, 8]);

        let open = StabilityRange {
            upper_bound: None,
            upper_state: None,
            ..closed
        };
        assert_eq!(forcings_inside_bistable_range(&open, window), (6..20).collect::<Vec<_>>());
        assert!(forcings_inside_bistable_range(&StabilityRange::monostable(), window).is_empty());
    }
}

use super::{classify_regime, BifurcationData, Regime, RegimeDefinition};
use crate::config::BifurcationConfig;
use crate::error::{BifurcationError, Result};
use crate::traits::ForcedModel;
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::info;

/// Bifurcation data for every ensemble member, computed in parallel.
///
/// Results keep the member order; one member failing does not stop the others.
pub fn compute_ensemble<M: ForcedModel>(members: &[M], config: &BifurcationConfig) -> Vec<Result<BifurcationData>> {
    info!(members = members.len(), "computing ensemble bifurcation data");
    members
        .par_iter()
        .map(|model| BifurcationData::from_model(model, config))
        .collect()
}

/// Regime of each member given its observed `(forcing, state)` pair.
pub fn classify_ensemble(
    members: &[BifurcationData],
    observations: &[(f64, f64)],
    definition: RegimeDefinition,
) -> Result<Vec<Regime>> {
    if members.len() != observations.len() {
        return Err(BifurcationError::DimensionMismatch {
            operation: "ensemble classification",
            expected: members.len(),
            actual: observations.len(),
        });
    }
    members
        .iter()
        .zip(observations)
        .map(|(data, &(forcing, state))| classify_regime(data, forcing, state, definition))
        .collect()
}

pub fn regime_counts(regimes: &[Regime]) -> BTreeMap<Regime, usize> {
    let mut counts = BTreeMap::new();
    for &regime in regimes {
        *counts.entry(regime).or_insert(0) += 1;
    }
    counts
}

/// Share of `regime` among `regimes`, in percent. Zero for an empty ensemble.
pub fn regime_percentage(regimes: &[Regime], regime: Regime) -> f64 {
    if regimes.is_empty() {
        return 0.0;
    }
    let count = regimes.iter().filter(|&&r| r == regime).count();
    100.0 * count as f64 / regimes.len() as f64
}

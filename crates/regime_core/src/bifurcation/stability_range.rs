use super::{AttractorLookup, ForcingWindow, StabilityDetection};
use crate::error::{BifurcationError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Guards the bisection loops; 64 halvings exhaust any `i64` interval.
const MAX_BISECTION_STEPS: usize = 64;

/// Forcing bounds of the bistable region and the attractor at each bound.
///
/// `lower_bound` is the last monostable forcing below the region and
/// `upper_bound` the first monostable forcing above it; the upper side is
/// `None` when the region is still bistable at the window's maximum.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StabilityRange {
    pub lower_bound: Option<i64>,
    pub upper_bound: Option<i64>,
    pub lower_state: Option<Vec<f64>>,
    pub upper_state: Option<Vec<f64>>,
}

impl StabilityRange {
    pub fn monostable() -> Self {
        Self::default()
    }

    pub fn is_bistable(&self) -> bool {
        self.lower_bound.is_some()
    }
}

/// Bisects the forcing window around a detected bistable forcing.
pub fn stability_range<L: AttractorLookup>(
    lookup: &mut L,
    detection: &StabilityDetection,
    window: ForcingWindow,
) -> Result<StabilityRange> {
    let bistable_forcing = match detection {
        StabilityDetection::Monostable(_) => return Ok(StabilityRange::monostable()),
        StabilityDetection::Bistable { forcing } => *forcing,
    };
    if !window.strictly_contains(bistable_forcing) {
        return Err(BifurcationError::DetectionOutOfWindow {
            forcing: bistable_forcing,
            min: window.min(),
            max: window.max(),
        });
    }
    if lookup.is_bistable_at(window.min())? {
        return Err(BifurcationError::StabilityRange {
            min_forcing: window.min(),
        });
    }

    let lower_bound = find_lower_bound(lookup, window.min(), bistable_forcing)?;
    let upper_bound = if lookup.is_bistable_at(window.max())? {
        None
    } else {
        Some(find_upper_bound(lookup, bistable_forcing, window.max())?)
    };

    if lower_bound < window.min() || lower_bound >= bistable_forcing {
        return Err(BifurcationError::BoundsOutOfWindow(format!(
            "lower bound {lower_bound} outside [{}, {bistable_forcing})",
            window.min()
        )));
    }
    if let Some(upper) = upper_bound {
        if upper <= bistable_forcing || upper > window.max() {
            return Err(BifurcationError::BoundsOutOfWindow(format!(
                "upper bound {upper} outside ({bistable_forcing}, {}]",
                window.max()
            )));
        }
    }

    let lower_state = lookup.attractors_at(lower_bound)?.first().to_vec();
    let upper_state = match upper_bound {
        Some(upper) => Some(lookup.attractors_at(upper)?.first().to_vec()),
        None => None,
    };
    debug!(lower_bound, ?upper_bound, "stability range found");

    Ok(StabilityRange {
        lower_bound: Some(lower_bound),
        upper_bound,
        lower_state: Some(lower_state),
        upper_state,
    })
}

/// Last monostable forcing in `[without, with)`, where `without` is
/// monostable and `with` is bistable.
fn find_lower_bound<L: AttractorLookup>(lookup: &mut L, without: i64, with: i64) -> Result<i64> {
    let (mut without, mut with) = (without, with);
    for _ in 0..MAX_BISECTION_STEPS {
        let mean = (without + with).div_euclid(2);
        if mean == without {
            return Ok(without);
        }
        if lookup.is_bistable_at(mean)? {
            with = mean;
        } else {
            without = mean;
        }
    }
    Err(BifurcationError::BisectionBudget(MAX_BISECTION_STEPS))
}

/// First monostable forcing in `(with, without]`, where `with` is bistable
/// and `without` is monostable.
fn find_upper_bound<L: AttractorLookup>(lookup: &mut L, with: i64, without: i64) -> Result<i64> {
    let (mut with, mut without) = (with, without);
    for _ in 0..MAX_BISECTION_STEPS {
        let mean = (without + with).div_euclid(2);
        if mean + 1 != without {
            if lookup.is_bistable_at(mean)? {
                with = mean;
            } else {
                without = mean;
            }
        } else {
            if !lookup.is_bistable_at(mean)? {
                without = mean;
            }
            return Ok(without);
        }
    }
    Err(BifurcationError::BisectionBudget(MAX_BISECTION_STEPS))
}

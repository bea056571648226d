//! Bifurcation engine: attractors, bistability detection, stability ranges,
//! repulsors, shift ranges and degeneracy screening over an integer forcing
//! window.

pub mod attractors;
pub mod data;
pub mod degeneracy;
pub mod detection;
pub mod ensemble;
pub mod regime;
pub mod repulsor;
pub mod shift_range;
pub mod stability_range;

pub use attractors::{attractors, forcing_to_attractors, AttractorSet, AttractorSettings};
pub use data::{AttractorEntry, BifurcationData, BifurcationRecord, RepulsorEntry};
pub use degeneracy::{is_degenerate, retain_non_degenerate, DEGENERACY_FORCING, DEGENERACY_THRESHOLD};
pub use detection::{detect_stability, scan_rounds, StabilityDetection};
pub use ensemble::{classify_ensemble, compute_ensemble, regime_counts, regime_percentage};
pub use regime::{classify_regime, Regime, RegimeDefinition};
pub use repulsor::{
    find_repulsor, forcings_inside_bistable_range, repulsors_for_forcings, RepulsorSettings,
};
pub use shift_range::{shift_range, ShiftRange};
pub use stability_range::{stability_range, StabilityRange};

use crate::error::{BifurcationError, Result};
use crate::traits::ForcedModel;
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

/// Largest forcing that still converts exactly between `i64` and `f64`.
const MAX_EXACT_FORCING: f64 = 9_007_199_254_740_992.0;

/// Validated integer forcing window `[min_forcing, max_forcing]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ForcingWindow {
    min_forcing: i64,
    max_forcing: i64,
}

impl ForcingWindow {
    /// Both bounds must be finite, non-negative, integer-valued and ordered.
    pub fn new(min_forcing: f64, max_forcing: f64) -> Result<Self> {
        for (name, value) in [("min_forcing", min_forcing), ("max_forcing", max_forcing)] {
            if !value.is_finite() || value < 0.0 || value > MAX_EXACT_FORCING {
                return Err(BifurcationError::InvalidWindow(format!(
                    "{name} must be a finite non-negative number, got {value}"
                )));
            }
            if value.fract() != 0.0 {
                return Err(BifurcationError::InvalidWindow(format!(
                    "{name} must be integer-valued, got {value}"
                )));
            }
        }
        if min_forcing >= max_forcing {
            return Err(BifurcationError::InvalidWindow(format!(
                "min_forcing {min_forcing} must be below max_forcing {max_forcing}"
            )));
        }
        Ok(Self {
            min_forcing: min_forcing as i64,
            max_forcing: max_forcing as i64,
        })
    }

    pub fn min(&self) -> i64 {
        self.min_forcing
    }

    pub fn max(&self) -> i64 {
        self.max_forcing
    }

    pub fn contains(&self, forcing: i64) -> bool {
        (self.min_forcing..=self.max_forcing).contains(&forcing)
    }

    pub fn strictly_contains(&self, forcing: i64) -> bool {
        self.min_forcing < forcing && forcing < self.max_forcing
    }

    /// Every integer forcing of the window, ascending.
    pub fn forcings(&self) -> RangeInclusive<i64> {
        self.min_forcing..=self.max_forcing
    }

    pub fn len(&self) -> usize {
        (self.max_forcing - self.min_forcing + 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Source of attractor sets keyed by integer forcing.
///
/// Implemented by plain maps (every forcing precomputed) and by
/// [`LazyAttractors`], which evaluates the model on demand and memoizes.
pub trait AttractorLookup {
    fn attractors_at(&mut self, forcing: i64) -> Result<AttractorSet>;

    fn is_bistable_at(&mut self, forcing: i64) -> Result<bool> {
        Ok(self.attractors_at(forcing)?.is_bistable())
    }
}

impl AttractorLookup for BTreeMap<i64, AttractorSet> {
    fn attractors_at(&mut self, forcing: i64) -> Result<AttractorSet> {
        self.get(&forcing)
            .cloned()
            .ok_or(BifurcationError::MissingForcing(forcing))
    }
}

impl AttractorLookup for &BTreeMap<i64, AttractorSet> {
    fn attractors_at(&mut self, forcing: i64) -> Result<AttractorSet> {
        self.get(&forcing)
            .cloned()
            .ok_or(BifurcationError::MissingForcing(forcing))
    }
}

/// Evaluates attractor sets of a model only where a search asks for them.
pub struct LazyAttractors<'a, M: ?Sized> {
    model: &'a M,
    settings: &'a AttractorSettings,
    cache: BTreeMap<i64, AttractorSet>,
}

impl<'a, M: ForcedModel + ?Sized> LazyAttractors<'a, M> {
    pub fn new(model: &'a M, settings: &'a AttractorSettings) -> Self {
        Self {
            model,
            settings,
            cache: BTreeMap::new(),
        }
    }

    /// Number of forcings evaluated so far.
    pub fn evaluations(&self) -> usize {
        self.cache.len()
    }

    pub fn into_cache(self) -> BTreeMap<i64, AttractorSet> {
        self.cache
    }
}

impl<M: ForcedModel + ?Sized> AttractorLookup for LazyAttractors<'_, M> {
    fn attractors_at(&mut self, forcing: i64) -> Result<AttractorSet> {
        if let Some(set) = self.cache.get(&forcing) {
            return Ok(set.clone());
        }
        let set = attractors(self.model, forcing as f64, self.settings)?;
        self.cache.insert(forcing, set.clone());
        Ok(set)
    }
}

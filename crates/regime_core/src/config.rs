//! Run configuration for bifurcation analyses.

use crate::bifurcation::{AttractorSettings, ForcingWindow, RepulsorSettings};
use crate::continuation::TraceSettings;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Everything needed to analyse one model over one forcing window.
///
/// Missing JSON fields take their default values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BifurcationConfig {
    pub min_forcing: f64,
    pub max_forcing: f64,
    pub attractors: AttractorSettings,
    pub repulsor: RepulsorSettings,
    /// Skips the repulsor searches when false.
    pub compute_repulsors: bool,
    pub trace: TraceSettings,
}

impl Default for BifurcationConfig {
    fn default() -> Self {
        Self {
            min_forcing: 1.0,
            max_forcing: 4000.0,
            attractors: AttractorSettings::default(),
            repulsor: RepulsorSettings::default(),
            compute_repulsors: true,
            trace: TraceSettings::default(),
        }
    }
}

impl BifurcationConfig {
    pub fn window(&self) -> crate::error::Result<ForcingWindow> {
        ForcingWindow::new(self.min_forcing, self.max_forcing)
    }

    pub fn validate(&self) -> Result<()> {
        self.window()?;
        self.attractors.equilibrium.validate().context("attractor settings")?;
        if !(self.attractors.collapse_rtol > 0.0) || !(self.attractors.gap_rtol > 0.0) {
            bail!("attractor tolerances must be positive.");
        }
        self.repulsor.validate()?;
        self.trace.validate().context("trace settings")?;
        Ok(())
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse bifurcation config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize bifurcation config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = BifurcationConfig::from_json(
            r#"{ "min_forcing": 300, "max_forcing": 500, "repulsor": { "rtol": 0.05 } }"#,
        )
        .expect("config");
        assert_eq!(config.window().expect("window").min(), 300);
        assert_eq!(config.window().expect("window").max(), 500);
        assert_eq!(config.repulsor.rtol, 0.05);
        assert_eq!(config.repulsor.max_iterations, 100);
        assert!(config.compute_repulsors);
        assert_eq!(config.attractors.collapse_rtol, 1e-2);
        assert_eq!(config.trace.truncation, 100);
        assert_eq!(config.trace.continuation.step_size, 0.2);
    }

    #[test]
    fn json_round_trip() {
        let mut config = BifurcationConfig::default();
        config.compute_repulsors = false;
        config.trace.continuation.seed = 7;
        let parsed = BifurcationConfig::from_json(&config.to_json().expect("json")).expect("config");
        assert!(!parsed.compute_repulsors);
        assert_eq!(parsed.trace.continuation, config.trace.continuation);
        assert_eq!(parsed.max_forcing, 4000.0);
    }

    #[test]
    fn rejects_invalid_configs() {
        assert!(BifurcationConfig::from_json(r#"{ "min_forcing": 500, "max_forcing": 300 }"#).is_err());
        assert!(BifurcationConfig::from_json(r#"{ "min_forcing": 1.5 }"#).is_err());
        assert!(BifurcationConfig::from_json(r#"{ "repulsor": { "rtol": 0 } }"#).is_err());
        assert!(BifurcationConfig::from_json("not json").is_err());
    }
}

//! Reference ecohydrological models driven by annual precipitation.
//!
//! Both models take the precipitation `P` as their forcing. Their states are
//! fractions of the catchment surface, so callers should read results in
//! `[0, 1]`.

use crate::traits::ForcedModel;
use serde::{Deserialize, Serialize};

/// Parameters of the one-state water-holding model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaterHoldingParams {
    /// Maximum growth rate of the water-holding capacity.
    pub c_croiss: f64,
    /// Infiltration at half growth rate.
    pub i_croiss: f64,
    pub c_max: f64,
    /// Maximum mortality rate.
    pub c_mort: f64,
    /// Infiltration at half mortality rate.
    pub i_mort: f64,
    /// Recolonisation rate.
    pub mu_c: f64,
    /// Soil retention threshold of a bare catchment.
    pub p_ini: f64,
    /// Soil retention threshold of a fully covered catchment.
    pub p_0max: f64,
    pub a: f64,
    pub b: f64,
    /// Maximum runoff coefficient.
    pub ke_max: f64,
}

impl Default for WaterHoldingParams {
    fn default() -> Self {
        Self {
            c_croiss: 0.3928831056683607,
            i_croiss: 377.9395570739971,
            c_max: 1.0,
            c_mort: 0.950224996601153,
            i_mort: 132.30814805665025,
            mu_c: 0.0038717892594712184,
            p_ini: 87.98423934692423,
            p_0max: 684.0019745904201,
            a: 1.5,
            b: 8.0,
            ke_max: 0.9,
        }
    }
}

/// One-state model of the catchment water-holding strength `c`.
///
/// Infiltration `i = P (1 - ke)` feeds logistic growth of `c` and
/// suppresses its mortality, while the runoff coefficient `ke` decreases as
/// the soil retention threshold rises with `c`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WaterHoldingModel {
    pub params: WaterHoldingParams,
}

impl WaterHoldingModel {
    pub fn new(params: WaterHoldingParams) -> Self {
        Self { params }
    }

    /// Runoff coefficient for water-holding strength `c` under precipitation `p`.
    pub fn runoff_coefficient(&self, c: f64, p: f64) -> f64 {
        let pr = &self.params;
        let c = c.clamp(0.0, 1.0);
        let p_0 = pr.p_ini + c * (pr.p_0max - pr.p_ini);
        let p_a = p.max(0.0).powf(pr.a);
        let ratio = p_a / (p_a + p_0.powf(pr.a));
        ratio.powf(pr.b) * pr.ke_max
    }
}

impl ForcedModel for WaterHoldingModel {
    fn name(&self) -> &str {
        "water_holding"
    }

    fn state_names(&self) -> Vec<String> {
        vec!["c".to_string()]
    }

    fn dimension(&self) -> usize {
        1
    }

    fn derivative(&self, state: &[f64], forcing: f64, out: &mut [f64]) {
        let pr = &self.params;
        let c = state[0].clamp(0.0, 1.0);
        let infiltration = forcing * (1.0 - self.runoff_coefficient(c, forcing));

        let growth = pr.c_croiss * infiltration / (infiltration + pr.i_croiss) * c * (1.0 - c / pr.c_max);
        let mortality = c * pr.c_mort * pr.i_mort / (infiltration + pr.i_mort);
        out[0] = growth - mortality + pr.mu_c * (1.0 - c);
    }

    fn extremal_initial_states(&self) -> [Vec<f64>; 2] {
        [vec![0.01], vec![0.99]]
    }
}

/// Parameters of the two-state woody/bare cover model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WoodyBareParams {
    pub r_g: f64,
    pub r_r: f64,
    pub r_d: f64,
    pub i_g: f64,
    pub i_d: f64,
    pub mu: f64,
    pub alpha_p: f64,
    pub alpha_r: f64,
    pub ke_b: f64,
    /// Hillslope length scale of runoff connectivity.
    pub l: f64,
}

/// Centre of the usual sampling ranges; `ke_b` is customarily held fixed.
impl Default for WoodyBareParams {
    fn default() -> Self {
        Self {
            r_g: 0.75,
            r_r: 0.75,
            r_d: 0.75,
            i_g: 300.0,
            i_d: 150.0,
            mu: 5.5e-4,
            alpha_p: 1.1e-3,
            alpha_r: 2.75e-2,
            ke_b: 0.5,
            l: 150.0,
        }
    }
}

/// Two-state model of woody cover `w` and bare soil `b`; herbaceous cover is
/// the remainder `1 - w - b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WoodyBareModel {
    pub params: WoodyBareParams,
}

impl WoodyBareModel {
    pub fn new(params: WoodyBareParams) -> Self {
        Self { params }
    }

    /// Fraction of the bare surface that is hydrologically connected.
    fn connectivity(&self, bare: f64) -> f64 {
        let length = self.params.l * (1.0 - bare);
        if length.abs() < 1e-12 {
            return bare;
        }
        2.0 * bare * (length - 1.0 + (-length).exp()) / (length * length)
    }
}

impl ForcedModel for WoodyBareModel {
    fn name(&self) -> &str {
        "woody_bare"
    }

    fn state_names(&self) -> Vec<String> {
        vec!["w".to_string(), "b".to_string()]
    }

    fn dimension(&self) -> usize {
        2
    }

    fn derivative(&self, state: &[f64], forcing: f64, out: &mut [f64]) {
        let pr = &self.params;
        let (w, b) = (state[0], state[1]);
        let herbaceous = 1.0 - w - b;

        let ke = pr.ke_b * self.connectivity(b);
        let infiltration = forcing * (1.0 - ke);
        let runoff = forcing * ke;

        let interaction = pr.r_r * infiltration * w * b / (infiltration + pr.i_g);
        out[0] = pr.r_g * infiltration * w * herbaceous / (infiltration + pr.i_g) + interaction
            - pr.r_d * pr.i_d * w / (infiltration + pr.i_d)
            + pr.mu;
        out[1] = herbaceous * pr.alpha_p * forcing + herbaceous * pr.alpha_r * runoff - interaction;
    }

    fn extremal_initial_states(&self) -> [Vec<f64>; 2] {
        [vec![0.01, 0.99], vec![0.99, 0.01]]
    }
}

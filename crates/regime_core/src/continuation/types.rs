//! Core types for continuation analysis.
//!
//! This module contains the fundamental data structures used throughout
//! the continuation analysis system.

use anyhow::{bail, Result};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

use super::krylov::GmresConfig;

/// Settings controlling the pseudo-arclength continuation algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuationSettings {
    pub step_size: f64,
    pub min_step_size: f64,
    pub max_step_size: f64,
    pub max_steps: usize,
    pub corrector_steps: usize,
    /// Max-norm of the corrector residual at an accepted point.
    pub corrector_tolerance: f64,
    /// Relative step of the finite-difference Jacobian actions.
    pub fd_step: f64,
    /// The run stops once the parameter reaches this value.
    pub param_max: f64,
    /// When set, the run also stops once the parameter falls below it.
    pub loop_back_epsilon: Option<f64>,
    /// Shift `eps` of the test-function system `DF + eps I`.
    pub test_regularization: f64,
    /// Seed of the random border vectors of the test function.
    pub seed: u64,
    pub gmres: GmresConfig,
}

impl Default for ContinuationSettings {
    fn default() -> Self {
        Self {
            step_size: 0.2,
            min_step_size: 1e-7,
            max_step_size: 1.0,
            max_steps: 10_000,
            corrector_steps: 10,
            corrector_tolerance: 1e-10,
            fd_step: 1e-8,
            param_max: 4000.0,
            loop_back_epsilon: None,
            test_regularization: 1e-6,
            seed: 42,
            gmres: GmresConfig::default(),
        }
    }
}

impl ContinuationSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.min_step_size > 0.0) {
            bail!("min_step_size must be positive.");
        }
        if !(self.step_size >= self.min_step_size && self.step_size <= self.max_step_size) {
            bail!(
                "step_size {} must lie within [{}, {}].",
                self.step_size,
                self.min_step_size,
                self.max_step_size
            );
        }
        if self.max_steps == 0 {
            bail!("max_steps must be greater than zero.");
        }
        if self.corrector_steps == 0 {
            bail!("corrector_steps must be greater than zero.");
        }
        if !(self.corrector_tolerance > 0.0) || !(self.fd_step > 0.0) {
            bail!("corrector_tolerance and fd_step must be positive.");
        }
        if self.param_max.is_nan() {
            bail!("param_max must not be NaN.");
        }
        Ok(())
    }
}

/// Classification of points detected during continuation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BifurcationType {
    None,
    /// The bordered test function changed sign since the previous point.
    TestFunctionSignChange,
}

/// A single point on a continuation path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationPoint {
    pub state: Vec<f64>,
    pub param_value: f64,
    pub stability: BifurcationType,
    /// Last component of the test-function solution; zero at the start point.
    #[serde(default)]
    pub test_value: f64,
    #[serde(default)]
    pub eigenvalues: Vec<Complex<f64>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TerminationReason {
    /// The parameter reached `param_max`.
    ReachedTarget,
    /// The parameter fell below `loop_back_epsilon`.
    LoopedBack,
    StepBudgetExhausted,
    /// The corrector kept failing down to `min_step_size`.
    StepSizeUnderflow,
}

impl TerminationReason {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            TerminationReason::ReachedTarget | TerminationReason::LoopedBack
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ContinuationState {
    Stepping,
    Correcting,
    Terminated(TerminationReason),
}

/// Progress snapshot of a running continuation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub state: ContinuationState,
    pub steps: usize,
    pub points: usize,
    pub param_value: f64,
    pub step_size: f64,
}

/// Points of a continuation run in traversal order. The parameter is not
/// monotone along the path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContinuationPath {
    pub points: Vec<ContinuationPoint>,
    /// Why the last run stopped; `None` while it is still going.
    pub termination: Option<TerminationReason>,
}

impl ContinuationPath {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn forcings(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.param_value).collect()
    }

    pub fn states(&self) -> Vec<&[f64]> {
        self.points.iter().map(|p| p.state.as_slice()).collect()
    }

    /// Indices of points flagged by the test function.
    pub fn bifurcations(&self) -> Vec<usize> {
        self.points
            .iter()
            .enumerate()
            .filter(|(_, p)| p.stability != BifurcationType::None)
            .map(|(i, _)| i)
            .collect()
    }
}

use crate::solvers::{integrate, IntegratorSettings};
use crate::traits::{ConstantForcing, ForcedModel};
use anyhow::{anyhow, bail, Context, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Absolute floor of every closeness test, as in `|a - b| <= ATOL + rtol * |b|`.
pub const CLOSENESS_ATOL: f64 = 1e-8;

/// `|a - b| <= 1e-8 + rtol * |b|`. NaN on either side is never close.
pub fn is_close(a: f64, b: f64, rtol: f64) -> bool {
    (a - b).abs() <= CLOSENESS_ATOL + rtol * b.abs()
}

/// Componentwise [`is_close`]; vectors of different length are never close.
pub fn all_close(a: &[f64], b: &[f64], rtol: f64) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(&x, &y)| is_close(x, y, rtol))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EquilibriumSettings {
    /// Trajectory lengths tried in order, in unit time steps.
    pub durations: Vec<usize>,
    /// Relative tolerance between the last state and the states before it.
    pub convergence_rtol: f64,
    /// How many states before the last one must agree with it.
    pub tail_length: usize,
    pub integrator: IntegratorSettings,
}

impl Default for EquilibriumSettings {
    fn default() -> Self {
        Self {
            durations: vec![20, 40, 60, 80, 100, 200, 1000, 2000, 10000],
            convergence_rtol: 1e-3,
            tail_length: 4,
            integrator: IntegratorSettings::default(),
        }
    }
}

impl EquilibriumSettings {
    pub fn validate(&self) -> Result<()> {
        if self.durations.is_empty() {
            bail!("durations must not be empty.");
        }
        if let Some(&short) = self.durations.iter().find(|&&d| d <= self.tail_length) {
            bail!(
                "every duration must exceed tail_length ({}), got {}.",
                self.tail_length,
                short
            );
        }
        if self.tail_length == 0 {
            bail!("tail_length must be greater than zero.");
        }
        if !(self.convergence_rtol > 0.0) {
            bail!("convergence_rtol must be positive.");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquilibriumResult {
    pub state: Vec<f64>,
    pub converged: bool,
    /// Length of the trajectory the state was taken from (0 when no
    /// integration ran).
    pub duration: usize,
}

impl EquilibriumResult {
    fn undefined(dim: usize) -> Self {
        Self {
            state: vec![f64::NAN; dim],
            converged: false,
            duration: 0,
        }
    }

    pub fn is_defined(&self) -> bool {
        self.state.iter().all(|v| v.is_finite())
    }
}

/// Integrates `model` under constant `forcing` with escalating durations
/// until the trajectory settles.
///
/// A trial converges when each of the `tail_length` states preceding the last
/// one is close to it; a trajectory without that many states never does. Without convergence the last state of the longest
/// trial is returned with `converged = false`. Integration failures never
/// escape: they turn the trial's state into NaN.
pub fn solve_equilibrium<M: ForcedModel + ?Sized>(
    model: &M,
    forcing: f64,
    initial_state: &[f64],
    settings: &EquilibriumSettings,
) -> EquilibriumResult {
    let dim = model.dimension();
    if initial_state.len() != dim || initial_state.iter().any(|v| !v.is_finite()) {
        warn!(
            model = model.name(),
            forcing,
            ?initial_state,
            "undefined initial state, equilibrium is undefined"
        );
        return EquilibriumResult::undefined(dim);
    }

    let system = ConstantForcing::new(model, forcing);
    let mut result = EquilibriumResult::undefined(dim);

    for &duration in &settings.durations {
        match integrate(&system, initial_state, duration, &settings.integrator) {
            Ok(trajectory) => {
                let last = &trajectory[trajectory.len() - 1];
                let tail_start = trajectory.len().saturating_sub(settings.tail_length + 1);
                // Too short a trajectory has no tail to compare against.
                let converged = trajectory.len() > settings.tail_length
                    && trajectory[tail_start..trajectory.len() - 1]
                        .iter()
                        .all(|state| all_close(last, state, settings.convergence_rtol));
                result = EquilibriumResult {
                    state: last.clone(),
                    converged,
                    duration,
                };
                if converged {
                    return result;
                }
            }
            Err(err) => {
                warn!(
                    model = model.name(),
                    forcing,
                    duration,
                    error = %err,
                    "integration failed"
                );
                result = EquilibriumResult {
                    state: vec![f64::NAN; dim],
                    converged: false,
                    duration,
                };
            }
        }
        debug!(forcing, duration, "trajectory has not settled yet");
    }

    result
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NewtonSettings {
    pub max_steps: usize,
    pub damping: f64,
    pub tolerance: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_steps: 25,
            damping: 1.0,
            tolerance: 1e-9,
        }
    }
}

/// Polishes an approximate equilibrium at fixed forcing with damped Newton
/// iterations on a finite-difference Jacobian.
pub fn refine_equilibrium<M: ForcedModel + ?Sized>(
    model: &M,
    forcing: f64,
    initial_guess: &[f64],
    settings: NewtonSettings,
) -> Result<Vec<f64>> {
    let dim = model.dimension();
    if dim == 0 {
        bail!("System has zero dimension.");
    }
    if initial_guess.len() != dim {
        bail!(
            "Initial guess dimension mismatch. Expected {}, got {}.",
            dim,
            initial_guess.len()
        );
    }
    if settings.max_steps == 0 {
        bail!("max_steps must be greater than zero.");
    }
    if settings.damping <= 0.0 {
        bail!("damping must be positive.");
    }
    if settings.tolerance <= 0.0 {
        bail!("tolerance must be positive.");
    }

    let mut state = initial_guess.to_vec();
    let mut residual = vec![0.0; dim];
    model.derivative(&state, forcing, &mut residual);
    let mut residual_norm = l2_norm(&residual);
    let mut iterations = 0usize;

    while residual_norm > settings.tolerance {
        if !residual_norm.is_finite() {
            bail!("Residual became non-finite during Newton iteration.");
        }
        if iterations >= settings.max_steps {
            bail!(
                "Newton solver failed to converge in {} steps (‖f(x)‖ = {}).",
                settings.max_steps,
                residual_norm
            );
        }

        let jacobian = state_jacobian(model, forcing, &state);
        let delta = jacobian
            .lu()
            .solve(&DVector::from_column_slice(&residual))
            .ok_or_else(|| anyhow!("Jacobian is singular."))
            .context("Failed to solve linear system during Newton iteration.")?;

        for i in 0..dim {
            state[i] -= settings.damping * delta[i];
        }

        iterations += 1;
        model.derivative(&state, forcing, &mut residual);
        residual_norm = l2_norm(&residual);
    }

    Ok(state)
}

/// Forward-difference Jacobian of the model vector field with respect to the state.
pub fn state_jacobian<M: ForcedModel + ?Sized>(model: &M, forcing: f64, state: &[f64]) -> DMatrix<f64> {
    let dim = state.len();
    let mut base = vec![0.0; dim];
    let mut shifted = vec![0.0; dim];
    model.derivative(state, forcing, &mut base);

    let mut perturbed = state.to_vec();
    let mut jacobian = DMatrix::zeros(dim, dim);
    for j in 0..dim {
        let h = 1e-7 * state[j].abs().max(1.0);
        perturbed[j] = state[j] + h;
        model.derivative(&perturbed, forcing, &mut shifted);
        for i in 0..dim {
            jacobian[(i, j)] = (shifted[i] - base[i]) / h;
        }
        perturbed[j] = state[j];
    }
    jacobian
}

fn l2_norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

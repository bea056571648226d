use crate::traits::{DynamicalSystem, Scalar, Steppable};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

fn constant<T: Scalar>(value: f64) -> T {
    T::from_f64(value).unwrap_or_else(T::nan)
}

/// Failures of a single integration run. These are values, never panics, so
/// callers can turn them into "undefined" results.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IntegrationError {
    #[error("initial state contains non-finite values")]
    NonFiniteInitialState,
    #[error("state dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("time grid must contain at least one point")]
    EmptyGrid,
    #[error("invalid integrator settings: {0}")]
    InvalidSettings(String),
    #[error("non-finite state or derivative at t = {t}")]
    NonFiniteState { t: f64 },
    #[error("step size underflow at t = {t} (h = {step:e})")]
    StepSizeUnderflow { t: f64, step: f64 },
    #[error("step budget of {0} steps exhausted")]
    StepBudgetExhausted(usize),
}

/// Which scheme drives an integration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum SolverMethod {
    /// Tsitouras 5(4) with embedded error control.
    #[default]
    AdaptiveRk,
    /// Starts explicit and switches to an implicit scheme while the problem is stiff.
    StiffSwitching,
    /// Classic RK4 with a fixed number of substeps per unit of time.
    FixedRk4 { dt: f64 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorSettings {
    pub method: SolverMethod,
    pub relative_tolerance: f64,
    pub absolute_tolerance: f64,
    pub max_steps: usize,
}

impl Default for IntegratorSettings {
    fn default() -> Self {
        Self {
            method: SolverMethod::AdaptiveRk,
            relative_tolerance: 1e-6,
            absolute_tolerance: 1e-9,
            max_steps: 5_000_000,
        }
    }
}

impl IntegratorSettings {
    fn validate(&self) -> Result<(), IntegrationError> {
        if !(self.relative_tolerance > 0.0) || !(self.absolute_tolerance > 0.0) {
            return Err(IntegrationError::InvalidSettings(
                "tolerances must be positive".to_string(),
            ));
        }
        if self.max_steps == 0 {
            return Err(IntegrationError::InvalidSettings(
                "max_steps must be greater than zero".to_string(),
            ));
        }
        if let SolverMethod::FixedRk4 { dt } = self.method {
            if !(dt > 0.0 && dt <= 1.0) {
                return Err(IntegrationError::InvalidSettings(format!(
                    "fixed step must lie in (0, 1], got {dt}"
                )));
            }
        }
        Ok(())
    }
}

/// Classic Runge-Kutta 4th Order Solver
pub struct RK4<T: Scalar> {
    k: [Vec<T>; 4],
    tmp: Vec<T>,
}

impl<T: Scalar> RK4<T> {
    pub fn new(dim: usize) -> Self {
        let z = T::zero();
        Self {
            k: [vec![z; dim], vec![z; dim], vec![z; dim], vec![z; dim]],
            tmp: vec![z; dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for RK4<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        let half = dt * constant::<T>(0.5);
        let sixth = dt / constant::<T>(6.0);
        let two = constant::<T>(2.0);
        let t0 = *t;
        let [k1, k2, k3, k4] = &mut self.k;

        system.apply(t0, state, k1);
        for i in 0..state.len() {
            self.tmp[i] = state[i] + half * k1[i];
        }
        system.apply(t0 + half, &self.tmp, k2);
        for i in 0..state.len() {
            self.tmp[i] = state[i] + half * k2[i];
        }
        system.apply(t0 + half, &self.tmp, k3);
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * k3[i];
        }
        system.apply(t0 + dt, &self.tmp, k4);

        for i in 0..state.len() {
            state[i] = state[i] + sixth * (k1[i] + two * k2[i] + two * k3[i] + k4[i]);
        }
        *t = t0 + dt;
    }
}

const TSIT5_C: [f64; 6] = [0.161, 0.327, 0.9, 0.9800255409045097, 1.0, 1.0];

// Row s holds the coefficients of stage s + 2; the last row is the 5th order solution.
const TSIT5_A: [[f64; 6]; 6] = [
    [0.161, 0.0, 0.0, 0.0, 0.0, 0.0],
    [-0.008480655492356989, 0.335480655492357, 0.0, 0.0, 0.0, 0.0],
    [2.898, -6.359447987781783, 4.361447987781783, 0.0, 0.0, 0.0],
    [
        5.325864858437957,
        -11.748883564062828,
        7.495539342889693,
        -0.09249506636030195,
        0.0,
        0.0,
    ],
    [
        5.86145544294642,
        -12.92096931784711,
        8.159367898576159,
        -0.071584973281401,
        -0.02826857949054663,
        0.0,
    ],
    [
        0.09646076681806523,
        0.01,
        0.4798896504144996,
        1.379008574103742,
        -3.290069515436099,
        2.324710524099774,
    ],
];

// Difference between the 5th and embedded 4th order weights (FSAL stage last).
const TSIT5_BTILDE: [f64; 7] = [
    -0.00178001105222577714,
    -0.0008164344596567469,
    0.007880878010261995,
    -0.1447110071732629,
    0.5823571654525552,
    -0.45808210592918697,
    1.0 / 66.0,
];

/// Tsitouras 5/4 Solver
///
/// Usable as a fixed-step [`Steppable`] or through [`Tsit5::try_step`], which
/// leaves the proposed state in a buffer together with a scaled error norm.
pub struct Tsit5<T: Scalar> {
    k: [Vec<T>; 7],
    tmp: Vec<T>,
    stage6: Vec<T>,
    next: Vec<T>,
}

impl<T: Scalar> Tsit5<T> {
    pub fn new(dim: usize) -> Self {
        let z = T::zero();
        Self {
            k: std::array::from_fn(|_| vec![z; dim]),
            tmp: vec![z; dim],
            stage6: vec![z; dim],
            next: vec![z; dim],
        }
    }

    fn stages(&mut self, system: &impl DynamicalSystem<T>, t0: T, state: &[T], dt: T) {
        system.apply(t0, state, &mut self.k[0]);
        for s in 1..6 {
            let (done, rest) = self.k.split_at_mut(s);
            for i in 0..state.len() {
                let mut acc = T::zero();
                for (j, kj) in done.iter().enumerate() {
                    acc = acc + constant::<T>(TSIT5_A[s - 1][j]) * kj[i];
                }
                self.tmp[i] = state[i] + dt * acc;
            }
            system.apply(t0 + constant::<T>(TSIT5_C[s - 1]) * dt, &self.tmp, &mut rest[0]);
        }
        self.stage6.copy_from_slice(&self.tmp);

        for i in 0..state.len() {
            let mut acc = T::zero();
            for (j, kj) in self.k[..6].iter().enumerate() {
                acc = acc + constant::<T>(TSIT5_A[5][j]) * kj[i];
            }
            self.next[i] = state[i] + dt * acc;
        }
    }

    /// Attempts one step and returns the RMS error norm scaled by
    /// `atol + rtol * max(|y|, |y_next|)`. A value at or below one means
    /// the step is acceptable; the proposal is then in [`Tsit5::proposal`].
    pub fn try_step(
        &mut self,
        system: &impl DynamicalSystem<T>,
        t: T,
        state: &[T],
        dt: T,
        atol: T,
        rtol: T,
    ) -> T {
        self.stages(system, t, state, dt);
        system.apply(t + dt, &self.next, &mut self.k[6]);

        let mut sum = T::zero();
        for i in 0..state.len() {
            let mut err = T::zero();
            for (j, kj) in self.k.iter().enumerate() {
                err = err + constant::<T>(TSIT5_BTILDE[j]) * kj[i];
            }
            let scale = atol + rtol * state[i].abs().max(self.next[i].abs());
            let ratio = dt * err / scale;
            sum = sum + ratio * ratio;
        }
        let n = T::from_usize(state.len().max(1)).unwrap_or_else(T::one);
        (sum / n).sqrt()
    }

    pub fn proposal(&self) -> &[T] {
        &self.next
    }

    /// Local Lipschitz estimate `||k7 - k6|| / ||y_next - g6||` from the last
    /// attempted step. Multiplied by the step size it approximates how close
    /// the step sits to the stability boundary of the explicit scheme.
    pub fn stiffness_estimate(&self) -> T {
        let mut num = T::zero();
        let mut den = T::zero();
        for i in 0..self.next.len() {
            let dk = self.k[6][i] - self.k[5][i];
            let dy = self.next[i] - self.stage6[i];
            num = num + dk * dk;
            den = den + dy * dy;
        }
        if den == T::zero() {
            return T::zero();
        }
        (num / den).sqrt()
    }
}

impl<T: Scalar> Steppable<T> for Tsit5<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        let t0 = *t;
        self.stages(system, t0, state, dt);
        state.copy_from_slice(&self.next);
        *t = t0 + dt;
    }
}

/// Backward Euler with a finite-difference Jacobian and Newton iterations.
pub struct BackwardEuler {
    f: Vec<f64>,
    shifted: Vec<f64>,
    f_shifted: Vec<f64>,
}

impl BackwardEuler {
    pub fn new(dim: usize) -> Self {
        Self {
            f: vec![0.0; dim],
            shifted: vec![0.0; dim],
            f_shifted: vec![0.0; dim],
        }
    }

    /// Forward-difference Jacobian of the vector field at `(t, y)`.
    pub fn jacobian(&mut self, system: &impl DynamicalSystem<f64>, t: f64, y: &[f64]) -> DMatrix<f64> {
        let dim = y.len();
        let mut jac = DMatrix::zeros(dim, dim);
        system.apply(t, y, &mut self.f);
        self.shifted.copy_from_slice(y);
        for j in 0..dim {
            let h = f64::EPSILON.sqrt() * y[j].abs().max(1.0);
            self.shifted[j] = y[j] + h;
            system.apply(t, &self.shifted, &mut self.f_shifted);
            for i in 0..dim {
                jac[(i, j)] = (self.f_shifted[i] - self.f[i]) / h;
            }
            self.shifted[j] = y[j];
        }
        jac
    }

    /// Solves `y = y0 + h f(t + h, y)` into `out`. Returns `false` when Newton
    /// does not converge or the iteration matrix is singular.
    pub fn solve(
        &mut self,
        system: &impl DynamicalSystem<f64>,
        t: f64,
        y0: &[f64],
        h: f64,
        jacobian: &DMatrix<f64>,
        out: &mut [f64],
        scale: impl Fn(f64) -> f64,
    ) -> bool {
        let dim = y0.len();
        let iteration = DMatrix::identity(dim, dim) - jacobian * h;
        let lu = iteration.lu();

        system.apply(t, y0, &mut self.f);
        for i in 0..dim {
            out[i] = y0[i] + h * self.f[i];
        }

        for _ in 0..10 {
            system.apply(t + h, out, &mut self.f);
            let g = DVector::from_fn(dim, |i, _| -(out[i] - y0[i] - h * self.f[i]));
            let Some(delta) = lu.solve(&g) else {
                return false;
            };
            let mut norm = 0.0f64;
            for i in 0..dim {
                out[i] += delta[i];
                norm = norm.max(delta[i].abs() / scale(out[i]));
            }
            if !norm.is_finite() {
                return false;
            }
            if norm < 1e-3 {
                return true;
            }
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Explicit,
    Implicit,
}

const STIFF_SWITCH_THRESHOLD: f64 = 3.25;
const SWITCH_AFTER: usize = 15;

struct AdaptiveIntegrator<'s, S> {
    system: &'s S,
    settings: IntegratorSettings,
    explicit: Tsit5<f64>,
    implicit: BackwardEuler,
    mode: Mode,
    switching: bool,
    streak: usize,
    steps: usize,
    h: f64,
    full: Vec<f64>,
    half: Vec<f64>,
    two_halves: Vec<f64>,
}

impl<'s, S: DynamicalSystem<f64>> AdaptiveIntegrator<'s, S> {
    fn new(system: &'s S, settings: IntegratorSettings, y0: &[f64]) -> Result<Self, IntegrationError> {
        let dim = y0.len();
        let mut f0 = vec![0.0; dim];
        system.apply(0.0, y0, &mut f0);
        if f0.iter().any(|v| !v.is_finite()) {
            return Err(IntegrationError::NonFiniteState { t: 0.0 });
        }

        let scale = |v: f64| settings.absolute_tolerance + settings.relative_tolerance * v.abs();
        let d0 = rms(y0.iter().map(|&v| v / scale(v)));
        let d1 = rms(y0.iter().zip(&f0).map(|(&y, &f)| f / scale(y)));
        let h0 = if d0 < 1e-5 || d1 < 1e-5 {
            1e-6
        } else {
            (0.01 * d0 / d1).min(1.0)
        };

        Ok(Self {
            system,
            settings,
            explicit: Tsit5::new(dim),
            implicit: BackwardEuler::new(dim),
            mode: Mode::Explicit,
            switching: matches!(settings.method, SolverMethod::StiffSwitching),
            streak: 0,
            steps: 0,
            h: h0,
            full: vec![0.0; dim],
            half: vec![0.0; dim],
            two_halves: vec![0.0; dim],
        })
    }

    fn scale(&self, v: f64) -> f64 {
        self.settings.absolute_tolerance + self.settings.relative_tolerance * v.abs()
    }

    fn advance_to(&mut self, t: &mut f64, y: &mut [f64], t_end: f64) -> Result<(), IntegrationError> {
        while *t < t_end {
            self.steps += 1;
            if self.steps > self.settings.max_steps {
                return Err(IntegrationError::StepBudgetExhausted(self.settings.max_steps));
            }

            let remaining = t_end - *t;
            let clipped = self.h >= remaining;
            let h = if clipped { remaining } else { self.h };
            if h < 1e-12 * t.abs().max(1.0) {
                return Err(IntegrationError::StepSizeUnderflow { t: *t, step: h });
            }

            let (accepted, factor) = match self.mode {
                Mode::Explicit => self.explicit_attempt(*t, y, h),
                Mode::Implicit => self.implicit_attempt(*t, y, h),
            };

            if accepted {
                *t = if clipped { t_end } else { *t + h };
                if y.iter().any(|v| !v.is_finite()) {
                    return Err(IntegrationError::NonFiniteState { t: *t });
                }
                let proposed = h * factor;
                self.h = if clipped { self.h.max(proposed) } else { proposed };
            } else {
                self.h = h * factor;
            }
        }
        Ok(())
    }

    fn explicit_attempt(&mut self, t: f64, y: &mut [f64], h: f64) -> (bool, f64) {
        let err = self.explicit.try_step(
            self.system,
            t,
            y,
            h,
            self.settings.absolute_tolerance,
            self.settings.relative_tolerance,
        );
        if !err.is_finite() {
            return (false, 0.2);
        }
        if err > 1.0 {
            return (false, (0.9 * err.powf(-0.2)).clamp(0.2, 1.0));
        }

        y.copy_from_slice(self.explicit.proposal());
        if self.switching {
            if h * self.explicit.stiffness_estimate() > STIFF_SWITCH_THRESHOLD {
                self.streak += 1;
                if self.streak >= SWITCH_AFTER {
                    debug!(t, h, "stiffness detected, switching to implicit scheme");
                    self.mode = Mode::Implicit;
                    self.streak = 0;
                }
            } else {
                self.streak = 0;
            }
        }
        let factor = if err == 0.0 { 5.0 } else { (0.9 * err.powf(-0.2)).clamp(0.2, 5.0) };
        (true, factor)
    }

    fn implicit_attempt(&mut self, t: f64, y: &mut [f64], h: f64) -> (bool, f64) {
        let system = self.system;
        let jacobian = self.implicit.jacobian(system, t, y);
        let atol = self.settings.absolute_tolerance;
        let rtol = self.settings.relative_tolerance;
        let scale = move |v: f64| atol + rtol * v.abs();

        let mut full = std::mem::take(&mut self.full);
        let mut half = std::mem::take(&mut self.half);
        let mut two_halves = std::mem::take(&mut self.two_halves);

        let converged = self.implicit.solve(system, t, y, h, &jacobian, &mut full, scale)
            && self.implicit.solve(system, t, y, 0.5 * h, &jacobian, &mut half, scale)
            && self
                .implicit
                .solve(system, t + 0.5 * h, &half, 0.5 * h, &jacobian, &mut two_halves, scale);

        let outcome = if !converged {
            (false, 0.25)
        } else {
            let err = rms(
                (0..y.len()).map(|i| (two_halves[i] - full[i]) / self.scale(y[i].abs().max(two_halves[i].abs()))),
            );
            if !err.is_finite() || err > 1.0 {
                let factor = if err.is_finite() { (0.9 / err.sqrt()).clamp(0.2, 1.0) } else { 0.2 };
                (false, factor)
            } else {
                for i in 0..y.len() {
                    y[i] = 2.0 * two_halves[i] - full[i];
                }
                if self.switching {
                    if h * jacobian.abs().column_sum().max() < 1.0 {
                        self.streak += 1;
                        if self.streak >= SWITCH_AFTER {
                            debug!(t, h, "stiffness gone, switching back to explicit scheme");
                            self.mode = Mode::Explicit;
                            self.streak = 0;
                        }
                    } else {
                        self.streak = 0;
                    }
                }
                let factor = if err == 0.0 { 5.0 } else { (0.9 / err.sqrt()).clamp(0.2, 5.0) };
                (true, factor)
            }
        };

        self.full = full;
        self.half = half;
        self.two_halves = two_halves;
        outcome
    }
}

fn rms(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for v in values {
        sum += v * v;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        (sum / count as f64).sqrt()
    }
}

/// Integrates `system` on the unit time grid `t = 0, 1, ..., n_points - 1`
/// and returns the state at every grid point (the initial state first).
pub fn integrate(
    system: &impl DynamicalSystem<f64>,
    initial_state: &[f64],
    n_points: usize,
    settings: &IntegratorSettings,
) -> Result<Vec<Vec<f64>>, IntegrationError> {
    settings.validate()?;
    let dim = system.dimension();
    if initial_state.len() != dim {
        return Err(IntegrationError::DimensionMismatch {
            expected: dim,
            actual: initial_state.len(),
        });
    }
    if n_points == 0 {
        return Err(IntegrationError::EmptyGrid);
    }
    if initial_state.iter().any(|v| !v.is_finite()) {
        return Err(IntegrationError::NonFiniteInitialState);
    }

    let mut trajectory = Vec::with_capacity(n_points);
    trajectory.push(initial_state.to_vec());
    let mut y = initial_state.to_vec();
    let mut t = 0.0;

    match settings.method {
        SolverMethod::FixedRk4 { dt } => {
            let substeps = (1.0 / dt).ceil().max(1.0) as usize;
            let h = 1.0 / substeps as f64;
            let mut stepper = RK4::new(dim);
            for point in 1..n_points {
                for _ in 0..substeps {
                    stepper.step(system, &mut t, &mut y, h);
                }
                t = point as f64;
                if y.iter().any(|v| !v.is_finite()) {
                    return Err(IntegrationError::NonFiniteState { t });
                }
                trajectory.push(y.clone());
            }
        }
        SolverMethod::AdaptiveRk | SolverMethod::StiffSwitching => {
            let mut integrator = AdaptiveIntegrator::new(system, *settings, &y)?;
            for point in 1..n_points {
                integrator.advance_to(&mut t, &mut y, point as f64)?;
                trajectory.push(y.clone());
            }
        }
    }

    Ok(trajectory)
}

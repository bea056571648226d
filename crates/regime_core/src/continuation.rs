//! Matrix-free pseudo-arclength continuation (PALC).
//!
//! A [`ContinuationRunner`] follows the solution curve of `G(p, x) = 0`
//! through folds, stepping along the tangent and correcting back onto the
//! curve with Newton-Krylov iterations.

pub mod equilibrium;
pub mod krylov;
pub mod problem;
pub mod types;
pub mod util;

pub use equilibrium::{
    bifurcation_from_continuation, continuation_bifurcation_data, interpolate_integer_forcings,
    trace_equilibrium_branch, CrossingDirection, EquilibriumContinuationProblem, ForcingCrossing, TraceSettings,
};
pub use krylov::{newton_krylov, solve_gmres, GmresConfig, GmresResult, NewtonKrylovSettings};
pub use problem::ContinuationProblem;
pub use types::{
    BifurcationType, ContinuationPath, ContinuationPoint, ContinuationSettings, ContinuationState,
    StepResult, TerminationReason,
};

use anyhow::{bail, Result};
use krylov::directional_derivative;
use nalgebra::DVector;
use tracing::{debug, info, warn};
use util::{bordered_test_solution, compute_nullspace_tangent, TestFunctionBorder};

/// A corrected point farther than this multiple of the step from its
/// predictor landed on another branch and is rejected.
const MAX_CORRECTION_RATIO: f64 = 1.0;

/// Step-by-step driver of one continuation run.
///
/// The runner owns the accepted points; `run_steps` advances it in batches
/// and `take_result` hands the path over once it is terminated (or earlier).
pub struct ContinuationRunner<'a, P: ContinuationProblem + ?Sized> {
    problem: &'a P,
    settings: ContinuationSettings,
    border: TestFunctionBorder,
    current: DVector<f64>,
    tangent: DVector<f64>,
    step_size: f64,
    steps: usize,
    state: ContinuationState,
    points: Vec<ContinuationPoint>,
    prev_test_value: f64,
    prev_test_solution: Option<DVector<f64>>,
}

impl<'a, P: ContinuationProblem + ?Sized> ContinuationRunner<'a, P> {
    /// Prepares a run from `(initial_param, initial_state)`.
    ///
    /// The initial tangent is the null vector of the extended Jacobian,
    /// oriented towards increasing parameter.
    pub fn new(
        problem: &'a P,
        initial_state: &[f64],
        initial_param: f64,
        settings: ContinuationSettings,
    ) -> Result<Self> {
        settings.validate()?;
        let dim = problem.dimension();
        if dim == 0 {
            bail!("Continuation needs a system with at least one state.");
        }
        if initial_state.len() != dim {
            bail!(
                "Initial state dimension mismatch. Expected {}, got {}.",
                dim,
                initial_state.len()
            );
        }
        if !initial_param.is_finite() || initial_state.iter().any(|v| !v.is_finite()) {
            bail!("Continuation cannot start from a non-finite point.");
        }

        let mut current = DVector::zeros(dim + 1);
        current[0] = initial_param;
        current.rows_mut(1, dim).copy_from_slice(initial_state);

        let j_ext = problem.extended_jacobian(&current, settings.fd_step)?;
        let mut tangent = compute_nullspace_tangent(&j_ext)?;
        tangent.normalize_mut();
        if tangent[0] < 0.0 {
            tangent = -tangent;
        }
        let border = TestFunctionBorder::random(&tangent, settings.seed)?;

        let first = ContinuationPoint {
            state: initial_state.to_vec(),
            param_value: initial_param,
            stability: BifurcationType::None,
            test_value: 0.0,
            eigenvalues: problem.eigenvalues(&current, settings.fd_step)?,
        };

        let mut runner = Self {
            problem,
            settings,
            border,
            current,
            tangent,
            step_size: settings.step_size,
            steps: 0,
            state: ContinuationState::Stepping,
            points: vec![first],
            prev_test_value: 0.0,
            prev_test_solution: None,
        };
        if initial_param >= settings.param_max {
            runner.state = ContinuationState::Terminated(TerminationReason::ReachedTarget);
        }
        Ok(runner)
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, ContinuationState::Terminated(_))
    }

    pub fn state(&self) -> ContinuationState {
        self.state
    }

    pub fn step_result(&self) -> StepResult {
        StepResult {
            state: self.state,
            steps: self.steps,
            points: self.points.len(),
            param_value: self.current[0],
            step_size: self.step_size,
        }
    }

    /// Advances by at most `batch_size` accepted steps.
    pub fn run_steps(&mut self, batch_size: usize) -> Result<StepResult> {
        for _ in 0..batch_size {
            if self.is_done() {
                break;
            }
            self.step()?;
        }
        Ok(self.step_result())
    }

    /// Runs to termination and returns the path.
    pub fn run(mut self) -> Result<ContinuationPath> {
        while !self.is_done() {
            self.step()?;
        }
        Ok(self.take_result())
    }

    /// Moves the accepted points out of the runner.
    pub fn take_result(&mut self) -> ContinuationPath {
        let termination = match self.state {
            ContinuationState::Terminated(reason) => Some(reason),
            _ => None,
        };
        ContinuationPath {
            points: std::mem::take(&mut self.points),
            termination,
        }
    }

    /// One predictor-corrector step, retried with smaller arclength until the
    /// corrector converges or the step size underflows.
    pub fn step(&mut self) -> Result<StepResult> {
        if self.is_done() {
            return Ok(self.step_result());
        }
        if self.steps >= self.settings.max_steps {
            self.terminate(TerminationReason::StepBudgetExhausted);
            return Ok(self.step_result());
        }

        let tangent = self.predict_tangent()?;
        self.state = ContinuationState::Correcting;

        let corrected = loop {
            if !(self.step_size > self.settings.min_step_size) {
                warn!(
                    param = self.current[0],
                    steps = self.steps,
                    "corrector failed down to the minimal step size"
                );
                self.terminate(TerminationReason::StepSizeUnderflow);
                return Ok(self.step_result());
            }
            match self.correct(&tangent, self.step_size)? {
                Some(point) => {
                    self.step_size = (1.2 * self.step_size).min(self.settings.max_step_size);
                    break point;
                }
                None => {
                    self.step_size = (0.5 * self.step_size).max(self.settings.min_step_size);
                    debug!(step_size = self.step_size, "corrector failed, shrinking step");
                }
            }
        };

        let test_solution = self.test_function(&corrected, &tangent)?;
        let test_value = test_solution[test_solution.len() - 1];
        let stability = if self.prev_test_value * test_value < 0.0 {
            info!(
                param = corrected[0],
                previous = self.prev_test_value,
                current = test_value,
                "test function changed sign"
            );
            BifurcationType::TestFunctionSignChange
        } else {
            BifurcationType::None
        };

        let dim = self.problem.dimension();
        let eigenvalues = self.problem.eigenvalues(&corrected, self.settings.fd_step)?;
        self.points.push(ContinuationPoint {
            state: corrected.rows(1, dim).iter().cloned().collect(),
            param_value: corrected[0],
            stability,
            test_value,
            eigenvalues,
        });
        self.steps += 1;
        self.prev_test_value = test_value;
        self.prev_test_solution = Some(test_solution);
        self.current = corrected;
        self.tangent = tangent;

        let param = self.current[0];
        debug!(step = self.steps, param, step_size = self.step_size, "continuation step accepted");

        if param >= self.settings.param_max {
            self.terminate(TerminationReason::ReachedTarget);
        } else if self.settings.loop_back_epsilon.is_some_and(|eps| param < eps) {
            self.terminate(TerminationReason::LoopedBack);
        } else if self.steps >= self.settings.max_steps {
            self.terminate(TerminationReason::StepBudgetExhausted);
        } else {
            self.state = ContinuationState::Stepping;
        }
        Ok(self.step_result())
    }

    fn terminate(&mut self, reason: TerminationReason) {
        self.state = ContinuationState::Terminated(reason);
    }

    /// Tangent `[1, tau] / norm` with `G_x tau = -G_p`, oriented along the
    /// previous tangent. Falls back to the dense null space when GMRES does
    /// not give a usable `tau`.
    fn predict_tangent(&self) -> Result<DVector<f64>> {
        let dim = self.problem.dimension();
        let fd_step = self.settings.fd_step;
        let point = &self.current;
        let value = self.problem.residual_vector(point)?;
        let g_p = self.problem.param_derivative(point, fd_step)?;

        let residual = |aug: &DVector<f64>| self.problem.residual_vector(aug);
        let apply_gx = |w: &DVector<f64>| -> Result<DVector<f64>> {
            let mut direction = DVector::zeros(dim + 1);
            direction.rows_mut(1, dim).copy_from(w);
            directional_derivative(&residual, point, &value, &direction, fd_step)
        };
        let warm_start = (self.tangent[0].abs() > f64::EPSILON)
            .then(|| self.tangent.rows(1, dim) / self.tangent[0]);
        let solve = solve_gmres(apply_gx, &(-g_p), warm_start.as_ref(), &self.settings.gmres)?;

        let mut tangent = if solve.converged && solve.is_finite() {
            let mut tangent = DVector::zeros(dim + 1);
            tangent[0] = 1.0;
            tangent.rows_mut(1, dim).copy_from(&solve.solution);
            tangent
        } else {
            debug!(param = point[0], "GMRES tangent unusable, using dense null space");
            let j_ext = self.problem.extended_jacobian(point, fd_step)?;
            compute_nullspace_tangent(&j_ext)?
        };
        let norm = tangent.norm();
        if !(norm > 0.0) || !norm.is_finite() {
            bail!("Tangent vector degenerated at parameter {}.", point[0]);
        }
        tangent /= norm;
        if tangent.dot(&self.tangent) < 0.0 {
            tangent = -tangent;
        }
        Ok(tangent)
    }

    /// Newton-Krylov on `[G(y); t . (y - y0) - ds]` from the predictor
    /// `y0 + ds t`. Non-finite or overly long corrections count as failures.
    fn correct(&self, tangent: &DVector<f64>, step_size: f64) -> Result<Option<DVector<f64>>> {
        let dim = self.problem.dimension();
        let base = &self.current;
        let predicted = base + tangent * step_size;
        let residual = |aug: &DVector<f64>| -> Result<DVector<f64>> {
            let mut out = DVector::zeros(dim + 1);
            out.rows_mut(0, dim).copy_from(&self.problem.residual_vector(aug)?);
            out[dim] = tangent.dot(&(aug - base)) - step_size;
            Ok(out)
        };
        let settings = NewtonKrylovSettings {
            max_iterations: self.settings.corrector_steps,
            tolerance: self.settings.corrector_tolerance,
            fd_step: self.settings.fd_step,
            gmres: self.settings.gmres,
        };
        let corrected = newton_krylov(residual, &predicted, &settings)?;
        Ok(corrected.filter(|aug| {
            aug.iter().all(|v| v.is_finite())
                && (aug - &predicted).norm() <= MAX_CORRECTION_RATIO * step_size
        }))
    }

    /// Bordered test-function solution at an accepted point. The operator is
    /// the Jacobian of the corrector system `[G'(y) w; t . w]`.
    fn test_function(&self, point: &DVector<f64>, tangent: &DVector<f64>) -> Result<DVector<f64>> {
        let fd_step = self.settings.fd_step;
        let value = self.problem.residual_vector(point)?;
        let residual = |aug: &DVector<f64>| self.problem.residual_vector(aug);
        let apply_a = |w: &DVector<f64>| -> Result<DVector<f64>> {
            let jw = directional_derivative(&residual, point, &value, w, fd_step)?;
            let n = jw.len();
            let mut out = DVector::zeros(n + 1);
            out.rows_mut(0, n).copy_from(&jw);
            out[n] = tangent.dot(w);
            Ok(out)
        };
        bordered_test_solution(
            apply_a,
            &self.border,
            self.settings.test_regularization,
            self.prev_test_solution.as_ref(),
            &self.settings.gmres,
        )
    }
}

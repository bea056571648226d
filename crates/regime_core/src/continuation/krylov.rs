//! Matrix-free linear and nonlinear solvers.
//!
//! Operators are closures `w -> A w`, so Jacobians never have to be stored;
//! Jacobian actions come from forward differences of the residual.

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Restarted GMRES parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GmresConfig {
    /// Relative residual target, measured against `||b||`.
    pub tolerance: f64,
    /// Floor of the residual target.
    pub absolute_tolerance: f64,
    /// Krylov dimension before a restart.
    pub restart: usize,
    /// Total operator applications across all restarts.
    pub max_iterations: usize,
}

impl Default for GmresConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            absolute_tolerance: 1e-14,
            restart: 30,
            max_iterations: 300,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GmresResult {
    pub solution: DVector<f64>,
    pub iterations: usize,
    pub residual_norm: f64,
    pub converged: bool,
}

impl GmresResult {
    pub fn is_finite(&self) -> bool {
        self.solution.iter().all(|v| v.is_finite())
    }
}

/// Solves `A x = b` by restarted GMRES with modified Gram-Schmidt Arnoldi
/// and Givens rotations.
///
/// A singular operator shows up as a non-finite solution, never as an error;
/// errors only come from `apply`.
pub fn solve_gmres<A>(
    apply: A,
    rhs: &DVector<f64>,
    initial_guess: Option<&DVector<f64>>,
    config: &GmresConfig,
) -> Result<GmresResult>
where
    A: Fn(&DVector<f64>) -> Result<DVector<f64>>,
{
    let n = rhs.len();
    let mut x = match initial_guess {
        Some(guess) if guess.len() == n => guess.clone(),
        _ => DVector::zeros(n),
    };
    if n == 0 {
        return Ok(GmresResult {
            solution: x,
            iterations: 0,
            residual_norm: 0.0,
            converged: true,
        });
    }

    let target = (config.tolerance * rhs.norm()).max(config.absolute_tolerance);
    let krylov_dim = config.restart.clamp(1, n);
    let mut iterations = 0usize;

    let mut r = rhs - apply(&x)?;
    let mut beta = r.norm();

    while beta.is_finite() && beta > target && iterations < config.max_iterations {
        let mut basis: Vec<DVector<f64>> = Vec::with_capacity(krylov_dim + 1);
        basis.push(&r / beta);
        let mut h = DMatrix::zeros(krylov_dim + 1, krylov_dim);
        let mut cs = vec![0.0; krylov_dim];
        let mut sn = vec![0.0; krylov_dim];
        let mut g = DVector::zeros(krylov_dim + 1);
        g[0] = beta;

        let mut used = 0usize;
        let mut breakdown = false;
        for j in 0..krylov_dim {
            iterations += 1;
            let mut w = apply(&basis[j])?;
            let w_norm = w.norm();
            for i in 0..=j {
                h[(i, j)] = w.dot(&basis[i]);
                w -= &basis[i] * h[(i, j)];
            }
            let h_next = w.norm();
            h[(j + 1, j)] = h_next;

            for i in 0..j {
                let rotated = cs[i] * h[(i, j)] + sn[i] * h[(i + 1, j)];
                h[(i + 1, j)] = -sn[i] * h[(i, j)] + cs[i] * h[(i + 1, j)];
                h[(i, j)] = rotated;
            }
            let (c, s) = givens(h[(j, j)], h[(j + 1, j)]);
            cs[j] = c;
            sn[j] = s;
            h[(j, j)] = c * h[(j, j)] + s * h[(j + 1, j)];
            h[(j + 1, j)] = 0.0;
            g[j + 1] = -s * g[j];
            g[j] *= c;
            used = j + 1;

            breakdown = !(h_next > 1e-12 * w_norm);
            if breakdown || g[j + 1].abs() <= target || iterations >= config.max_iterations {
                break;
            }
            basis.push(w / h_next);
        }

        // Back substitution on the triangularized Hessenberg matrix.
        let mut y = DVector::zeros(used);
        for i in (0..used).rev() {
            let mut sum = g[i];
            for k in (i + 1)..used {
                sum -= h[(i, k)] * y[k];
            }
            y[i] = sum / h[(i, i)];
        }
        for (i, v) in basis.iter().take(used).enumerate() {
            x += v * y[i];
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Ok(GmresResult {
                solution: x,
                iterations,
                residual_norm: f64::NAN,
                converged: false,
            });
        }

        r = rhs - apply(&x)?;
        beta = r.norm();
        if breakdown {
            break;
        }
    }

    Ok(GmresResult {
        solution: x,
        iterations,
        residual_norm: beta,
        converged: beta <= target,
    })
}

fn givens(a: f64, b: f64) -> (f64, f64) {
    if b == 0.0 {
        (1.0, 0.0)
    } else if b.abs() > a.abs() {
        let t = a / b;
        let s = 1.0 / (1.0 + t * t).sqrt();
        (s * t, s)
    } else {
        let t = b / a;
        let c = 1.0 / (1.0 + t * t).sqrt();
        (c, c * t)
    }
}

/// Forward-difference action of the Jacobian of `function` at `point` on
/// `direction`, with the step scaled to both vectors.
pub fn directional_derivative<F>(
    function: &F,
    point: &DVector<f64>,
    value_at_point: &DVector<f64>,
    direction: &DVector<f64>,
    fd_step: f64,
) -> Result<DVector<f64>>
where
    F: Fn(&DVector<f64>) -> Result<DVector<f64>>,
{
    let direction_norm = direction.norm();
    if direction_norm == 0.0 {
        return Ok(DVector::zeros(value_at_point.len()));
    }
    let h = fd_step * (1.0 + point.norm()) / direction_norm;
    let shifted = function(&(point + direction * h))?;
    if shifted.len() != value_at_point.len() {
        bail!(
            "Residual dimension changed from {} to {}",
            value_at_point.len(),
            shifted.len()
        );
    }
    Ok((shifted - value_at_point) / h)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NewtonKrylovSettings {
    pub max_iterations: usize,
    /// Convergence threshold on the max-norm of the residual.
    pub tolerance: f64,
    pub fd_step: f64,
    pub gmres: GmresConfig,
}

/// Inexact Newton iteration whose linear systems are solved by GMRES on
/// finite-difference Jacobian actions.
///
/// Returns `None` when the residual does not drop below the tolerance
/// within `max_iterations` or turns non-finite.
pub fn newton_krylov<F>(
    residual: F,
    initial: &DVector<f64>,
    settings: &NewtonKrylovSettings,
) -> Result<Option<DVector<f64>>>
where
    F: Fn(&DVector<f64>) -> Result<DVector<f64>>,
{
    let mut point = initial.clone();
    for iteration in 0..=settings.max_iterations {
        let value = residual(&point)?;
        if value.iter().any(|v| !v.is_finite()) {
            return Ok(None);
        }
        if value.amax() < settings.tolerance {
            return Ok(Some(point));
        }
        if iteration == settings.max_iterations {
            break;
        }

        let rhs = -&value;
        let step = solve_gmres(
            |w| directional_derivative(&residual, &point, &value, w, settings.fd_step),
            &rhs,
            None,
            &settings.gmres,
        )?;
        if !step.is_finite() {
            return Ok(None);
        }
        point += step.solution;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix_operator(a: DMatrix<f64>) -> impl Fn(&DVector<f64>) -> Result<DVector<f64>> {
        move |v| Ok(&a * v)
    }

    #[test]
    fn gmres_solves_nonsymmetric_system() {
        let a = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 2.0, 5.0, 1.0, 0.0, -1.0, 3.0]);
        let b = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let result = solve_gmres(matrix_operator(a.clone()), &b, None, &GmresConfig::default())
            .expect("gmres");
        assert!(result.converged);
        assert!((&a * &result.solution - &b).norm() < 1e-9);
        assert!(result.iterations <= 3);
    }

    #[test]
    fn gmres_restarts_until_converged() {
        let n = 12;
        let a = DMatrix::from_fn(n, n, |i, j| if i == j { 3.0 + i as f64 } else { 1.0 / (1.0 + (i + 2 * j) as f64) });
        let b = DVector::from_fn(n, |i, _| (i as f64).sin());
        let config = GmresConfig {
            restart: 4,
            ..GmresConfig::default()
        };
        let result = solve_gmres(matrix_operator(a.clone()), &b, None, &config).expect("gmres");
        assert!(result.converged, "residual {}", result.residual_norm);
        assert!((&a * &result.solution - &b).norm() < 1e-8);
    }

    #[test]
    fn gmres_accepts_exact_initial_guess() {
        let a = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 3.0]);
        let b = DVector::from_vec(vec![2.0, 3.0]);
        let guess = DVector::from_vec(vec![1.0, 1.0]);
        let result = solve_gmres(matrix_operator(a), &b, Some(&guess), &GmresConfig::default())
            .expect("gmres");
        assert!(result.converged);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.solution, guess);
    }

    #[test]
    fn singular_operator_yields_non_finite_solution() {
        let a = DMatrix::zeros(1, 1);
        let b = DVector::from_vec(vec![1.0]);
        let result = solve_gmres(matrix_operator(a), &b, None, &GmresConfig::default()).expect("gmres");
        assert!(!result.converged);
        assert!(!result.is_finite());
    }

    #[test]
    fn newton_krylov_finds_root() {
        // x^2 + y^2 = 4, x = y.
        let residual = |v: &DVector<f64>| -> Result<DVector<f64>> {
            Ok(DVector::from_vec(vec![v[0] * v[0] + v[1] * v[1] - 4.0, v[0] - v[1]]))
        };
        let settings = NewtonKrylovSettings {
            max_iterations: 20,
            tolerance: 1e-10,
            fd_step: 1e-8,
            gmres: GmresConfig::default(),
        };
        let root = newton_krylov(residual, &DVector::from_vec(vec![1.0, 2.0]), &settings)
            .expect("residual evaluates")
            .expect("newton converges");
        let expected = 2.0_f64.sqrt();
        assert!((root[0] - expected).abs() < 1e-8 && (root[1] - expected).abs() < 1e-8);
    }

    #[test]
    fn newton_krylov_reports_exhaustion() {
        let residual = |v: &DVector<f64>| -> Result<DVector<f64>> { Ok(DVector::from_vec(vec![v[0] * v[0] + 1.0])) };
        let settings = NewtonKrylovSettings {
            max_iterations: 5,
            tolerance: 1e-10,
            fd_step: 1e-8,
            gmres: GmresConfig::default(),
        };
        let root = newton_krylov(residual, &DVector::from_vec(vec![0.5]), &settings).expect("evaluates");
        assert!(root.is_none());
    }
}

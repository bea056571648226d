//! Helpers for tangent computation, eigenvalue analysis and the bordered
//! test function used for bifurcation detection.

use anyhow::{anyhow, bail, Result};
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use num_complex::Complex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use super::krylov::{solve_gmres, GmresConfig};
use super::types::ContinuationPoint;

/// Computes the null space tangent from an extended Jacobian matrix.
///
/// Uses Gram matrix eigendecomposition first, falling back to a bordered
/// linear solve if that fails.
pub fn compute_nullspace_tangent(j_ext: &DMatrix<f64>) -> Result<DVector<f64>> {
    let dim = j_ext.nrows();
    if dim == 0 {
        bail!("Failed to compute tangent: zero-dimensional system");
    }
    if j_ext.ncols() != dim + 1 {
        bail!(
            "Failed to compute tangent: expected {} columns, got {}",
            dim + 1,
            j_ext.ncols()
        );
    }
    if let Some(vec) = try_gram_eigen(j_ext) {
        return Ok(vec);
    }
    compute_tangent_linear_solve(j_ext)
}

/// Eigenvector of the smallest eigenvalue of `J^T J`, regularized when the
/// decomposition returns non-finite values.
fn try_gram_eigen(j_ext: &DMatrix<f64>) -> Option<DVector<f64>> {
    let gram = j_ext.transpose() * j_ext;
    if gram.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let identity = DMatrix::identity(gram.nrows(), gram.ncols());
    let mut epsilon = 0.0;

    for _ in 0..5 {
        let adjusted = if epsilon == 0.0 {
            gram.clone()
        } else {
            &gram + identity.scale(epsilon)
        };

        let eig = SymmetricEigen::new(adjusted);
        let smallest = eig
            .eigenvalues
            .iter()
            .enumerate()
            .filter(|(_, val)| val.is_finite())
            .min_by(|a, b| a.1.total_cmp(b.1));

        let Some((min_idx, _)) = smallest else {
            epsilon = if epsilon == 0.0 { 1e-12 } else { epsilon * 10.0 };
            continue;
        };

        let vec = eig.eigenvectors.column(min_idx).into_owned();
        if vec.norm_squared() == 0.0 || vec.iter().any(|v| !v.is_finite()) {
            return None;
        }
        return Some(vec);
    }

    None
}

/// Tangent from `[J; e_k^T] t = e_last`, trying each unit row `e_k` in turn.
fn compute_tangent_linear_solve(j_ext: &DMatrix<f64>) -> Result<DVector<f64>> {
    let dim = j_ext.nrows();
    let mut a = DMatrix::zeros(dim + 1, dim + 1);
    a.view_mut((0, 0), (dim, dim + 1)).copy_from(j_ext);
    let mut rhs = DVector::zeros(dim + 1);
    rhs[dim] = 1.0;

    for col in 0..=dim {
        a.row_mut(dim).fill(0.0);
        a[(dim, col)] = 1.0;

        if let Some(solution) = a.clone().lu().solve(&rhs) {
            if solution.iter().all(|v| v.is_finite()) && solution.norm_squared() != 0.0 {
                return Ok(solution);
            }
        }
    }

    bail!("Failed to compute tangent: all bordered solves singular")
}

/// Converts a ContinuationPoint to an augmented state vector [p, x...].
pub fn continuation_point_to_aug(point: &ContinuationPoint) -> DVector<f64> {
    let mut aug = DVector::zeros(point.state.len() + 1);
    aug[0] = point.param_value;
    for (i, &val) in point.state.iter().enumerate() {
        aug[i + 1] = val;
    }
    aug
}

/// Computes eigenvalues from a matrix.
pub fn compute_eigenvalues(mat: &DMatrix<f64>) -> Result<Vec<Complex<f64>>> {
    if mat.nrows() == 0 {
        return Ok(Vec::new());
    }
    if mat.iter().any(|v| !v.is_finite()) {
        bail!("Cannot compute eigenvalues of a non-finite matrix");
    }
    let eigen = mat.clone().complex_eigenvalues();
    Ok(eigen.iter().cloned().collect())
}

/// Fixed border vectors `r` and `l` of the test-function system.
///
/// Both are drawn from a standard normal distribution, stripped of their
/// component along the initial tangent and normalized.
#[derive(Debug, Clone)]
pub struct TestFunctionBorder {
    pub r: DVector<f64>,
    pub l: DVector<f64>,
}

impl TestFunctionBorder {
    pub fn random(tangent: &DVector<f64>, seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let tangent_norm_sq = tangent.norm_squared();
        if !(tangent_norm_sq > 0.0) {
            bail!("Cannot build test-function border around a zero tangent");
        }
        let mut draw = || -> Result<DVector<f64>> {
            // A draw parallel to the tangent is measure-zero; retry a few times.
            for _ in 0..8 {
                let raw = DVector::from_fn(tangent.len(), |_, _| StandardNormal.sample(&mut rng));
                let projected = &raw - tangent * (raw.dot(tangent) / tangent_norm_sq);
                let norm = projected.norm();
                if norm > 1e-8 {
                    return Ok(projected / norm);
                }
            }
            Err(anyhow!("Random border vectors stayed parallel to the tangent"))
        };
        let r = draw()?;
        let l = draw()?;
        Ok(Self { r, l })
    }
}

/// Solves the bordered system `[[A + eps I, r], [l^T, 0]] y = e_last`, where
/// `apply_a` is the action of the augmented Jacobian `A`.
///
/// GMRES warm-started from `previous` is tried first; a dense LU solve on
/// the assembled matrix takes over when there is no previous solution, when
/// GMRES fails, or when the last component grows beyond 100.
pub fn bordered_test_solution<A>(
    apply_a: A,
    border: &TestFunctionBorder,
    regularization: f64,
    previous: Option<&DVector<f64>>,
    gmres: &GmresConfig,
) -> Result<DVector<f64>>
where
    A: Fn(&DVector<f64>) -> Result<DVector<f64>>,
{
    let n = border.r.len();
    let apply_bordered = |w: &DVector<f64>| -> Result<DVector<f64>> {
        let head = w.rows(0, n).into_owned();
        let tail = w[n];
        let a_head = apply_a(&head)?;
        let mut out = DVector::zeros(n + 1);
        out.rows_mut(0, n)
            .copy_from(&(a_head + &head * regularization + &border.r * tail));
        out[n] = border.l.dot(&head);
        Ok(out)
    };
    let mut rhs = DVector::zeros(n + 1);
    rhs[n] = 1.0;

    if let Some(previous) = previous {
        let result = solve_gmres(&apply_bordered, &rhs, Some(previous), gmres)?;
        if result.converged && result.is_finite() && result.solution[n].abs() <= 100.0 {
            return Ok(result.solution);
        }
    }

    let mut matrix = DMatrix::zeros(n + 1, n + 1);
    for col in 0..=n {
        let mut unit = DVector::zeros(n + 1);
        unit[col] = 1.0;
        matrix.set_column(col, &apply_bordered(&unit)?);
    }
    matrix
        .lu()
        .solve(&rhs)
        .ok_or_else(|| anyhow!("Bordered test-function system is singular"))
}

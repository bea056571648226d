use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;

use super::krylov::directional_derivative;
use super::util::compute_eigenvalues;

/// Core interface implemented by any system that can be continued via PALC.
///
/// Augmented states are laid out as `[p, x...]`. Only the residual is
/// required; Jacobian actions default to forward differences.
pub trait ContinuationProblem {
    /// Number of state variables (excluding the continuation parameter).
    fn dimension(&self) -> usize;

    /// Evaluate the residual G(aug_state) and write into `out`.
    fn residual(&self, aug_state: &DVector<f64>, out: &mut DVector<f64>) -> Result<()>;

    fn residual_vector(&self, aug_state: &DVector<f64>) -> Result<DVector<f64>> {
        let mut out = DVector::zeros(self.dimension());
        self.residual(aug_state, &mut out)?;
        Ok(out)
    }

    /// Action of the extended Jacobian (derivative of G w.r.t. [p, x]) on
    /// `direction`.
    fn jacobian_vector_product(
        &self,
        aug_state: &DVector<f64>,
        direction: &DVector<f64>,
        fd_step: f64,
    ) -> Result<DVector<f64>> {
        let value = self.residual_vector(aug_state)?;
        directional_derivative(
            &|aug: &DVector<f64>| self.residual_vector(aug),
            aug_state,
            &value,
            direction,
            fd_step,
        )
    }

    /// Derivative of G with respect to the parameter.
    fn param_derivative(&self, aug_state: &DVector<f64>, fd_step: f64) -> Result<DVector<f64>> {
        let mut direction = DVector::zeros(self.dimension() + 1);
        direction[0] = 1.0;
        self.jacobian_vector_product(aug_state, &direction, fd_step)
    }

    /// Dense extended Jacobian, one Jacobian action per column.
    fn extended_jacobian(&self, aug_state: &DVector<f64>, fd_step: f64) -> Result<DMatrix<f64>> {
        let dim = self.dimension();
        if aug_state.len() != dim + 1 {
            bail!(
                "Augmented state dimension mismatch. Expected {}, got {}.",
                dim + 1,
                aug_state.len()
            );
        }
        let mut j_ext = DMatrix::zeros(dim, dim + 1);
        let mut direction = DVector::zeros(dim + 1);
        for col in 0..=dim {
            direction[col] = 1.0;
            j_ext.set_column(col, &self.jacobian_vector_product(aug_state, &direction, fd_step)?);
            direction[col] = 0.0;
        }
        Ok(j_ext)
    }

    /// Eigenvalues of the state Jacobian G_x.
    fn eigenvalues(&self, aug_state: &DVector<f64>, fd_step: f64) -> Result<Vec<Complex<f64>>> {
        let dim = self.dimension();
        let j_ext = self.extended_jacobian(aug_state, fd_step)?;
        compute_eigenvalues(&j_ext.columns(1, dim).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// G(p, x, y) = (p x - y, x + y^2).
    struct Planar;

    impl ContinuationProblem for Planar {
        fn dimension(&self) -> usize {
            2
        }

        fn residual(&self, aug_state: &DVector<f64>, out: &mut DVector<f64>) -> Result<()> {
            let (p, x, y) = (aug_state[0], aug_state[1], aug_state[2]);
            out[0] = p * x - y;
            out[1] = x + y * y;
            Ok(())
        }
    }

    #[test]
    fn finite_difference_jacobian_matches_analytic() {
        let aug = DVector::from_vec(vec![2.0, 0.5, -1.5]);
        let j_ext = Planar.extended_jacobian(&aug, 1e-8).expect("jacobian");
        let expected = DMatrix::from_row_slice(2, 3, &[0.5, 2.0, -1.0, 0.0, 1.0, -3.0]);
        assert!((j_ext - expected).amax() < 1e-5);

        let dp = Planar.param_derivative(&aug, 1e-8).expect("param derivative");
        assert!((dp[0] - 0.5).abs() < 1e-5 && dp[1].abs() < 1e-5);
    }

    #[test]
    fn eigenvalues_come_from_state_block() {
        // G_x = [[p, -1], [1, 2y]] at y = 0: eigenvalues (p -+ sqrt(p^2 - 4)) / 2.
        let aug = DVector::from_vec(vec![0.0, 0.0, 0.0]);
        let eigenvalues = Planar.eigenvalues(&aug, 1e-8).expect("eigenvalues");
        assert_eq!(eigenvalues.len(), 2);
        for eigenvalue in eigenvalues {
            assert!(eigenvalue.re.abs() < 1e-5);
            assert!((eigenvalue.im.abs() - 1.0).abs() < 1e-5);
        }
    }
}

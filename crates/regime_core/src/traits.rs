use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can be used as scalars by the steppers.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Represents an autonomous-or-not flow handed to an integrator.
pub trait DynamicalSystem<T: Scalar> {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// x: current state
    /// t: current time
    /// out: buffer to write dx/dt into
    fn apply(&self, t: T, x: &[T], out: &mut [T]);
}

/// A trait for solvers that can step a system forward.
pub trait Steppable<T: Scalar> {
    /// Performs one step of size dt.
    /// t: current time (updated after step)
    /// state: current state (updated after step)
    /// dt: step size
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T);
}

/// A model driven by a scalar external forcing (e.g. annual precipitation).
///
/// The forcing is an explicit argument of every derivative evaluation, so a
/// model never carries a mutable driver and can be shared between threads.
pub trait ForcedModel: Sync {
    /// Short identifier used in logs and records.
    fn name(&self) -> &str;

    /// Names of the state variables, in state-vector order.
    fn state_names(&self) -> Vec<String>;

    fn dimension(&self) -> usize {
        self.state_names().len()
    }

    /// Writes d(state)/dt under the given constant forcing into `out`.
    fn derivative(&self, state: &[f64], forcing: f64, out: &mut [f64]);

    /// Two initial states lying "far below" and "far above" the expected
    /// equilibria. Used to reach both branches of a bistable model.
    fn extremal_initial_states(&self) -> [Vec<f64>; 2];
}

/// Freezes the forcing of a [`ForcedModel`] for the duration of an integration.
pub struct ConstantForcing<'a, M: ?Sized> {
    model: &'a M,
    forcing: f64,
}

impl<'a, M: ForcedModel + ?Sized> ConstantForcing<'a, M> {
    pub fn new(model: &'a M, forcing: f64) -> Self {
        Self { model, forcing }
    }

    pub fn forcing(&self) -> f64 {
        self.forcing
    }
}

impl<M: ForcedModel + ?Sized> DynamicalSystem<f64> for ConstantForcing<'_, M> {
    fn dimension(&self) -> usize {
        self.model.dimension()
    }

    fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
        self.model.derivative(x, self.forcing, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Decay;

    impl ForcedModel for Decay {
        fn name(&self) -> &str {
            "decay"
        }

        fn state_names(&self) -> Vec<String> {
            vec!["x".to_string()]
        }

        fn derivative(&self, state: &[f64], forcing: f64, out: &mut [f64]) {
            out[0] = forcing - state[0];
        }

        fn extremal_initial_states(&self) -> [Vec<f64>; 2] {
            [vec![0.0], vec![10.0]]
        }
    }

    #[test]
    fn constant_forcing_passes_forcing_to_model() {
        let model = Decay;
        let system = ConstantForcing::new(&model, 3.0);
        let mut out = [0.0];
        system.apply(123.0, &[1.0], &mut out);
        assert_eq!(out[0], 2.0);
        assert_eq!(system.dimension(), 1);
        assert_eq!(system.forcing(), 3.0);
    }

    #[test]
    fn same_model_serves_two_forcings_at_once() {
        let model = Decay;
        let low = ConstantForcing::new(&model, 1.0);
        let high = ConstantForcing::new(&model, 5.0);
        let mut out_low = [0.0];
        let mut out_high = [0.0];
        low.apply(0.0, &[0.0], &mut out_low);
        high.apply(0.0, &[0.0], &mut out_high);
        assert_eq!(out_low[0], 1.0);
        assert_eq!(out_high[0], 5.0);
    }
}

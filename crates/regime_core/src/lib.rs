pub mod bifurcation;
pub mod config;
pub mod continuation;
pub mod equilibrium;
pub mod error;
pub mod models;
pub mod solvers;
/// The `regime_core` crate locates regime shifts of forced dynamical models:
/// forcing ranges with two stable equilibria, the bounds of those ranges and
/// the unstable equilibrium separating the two regimes.
///
/// Key components:
/// - **Traits**: `Scalar`, `DynamicalSystem`, `Steppable` (solvers) and `ForcedModel` (models driven by a scalar forcing).
/// - **Equilibrium**: long-run integration until the trajectory settles, plus Newton refinement.
/// - **Bifurcation**: bistability detection, stability ranges, repulsors, shift ranges and regime classification.
/// - **Continuation**: matrix-free pseudo-arclength continuation of equilibrium branches through folds.
pub mod traits;

pub use bifurcation::{BifurcationData, BifurcationRecord, ForcingWindow, Regime, RegimeDefinition};
pub use config::BifurcationConfig;
pub use error::{BifurcationError, Result};
pub use traits::ForcedModel;

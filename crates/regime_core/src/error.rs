use thiserror::Error;

/// Errors raised by the bifurcation engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BifurcationError {
    /// The lower edge of the search window already lies inside the
    /// bistable region; the caller has to widen the window.
    #[error("forcing {min_forcing} at the lower edge of the window is already bistable")]
    StabilityRange { min_forcing: i64 },

    #[error("invalid forcing window: {0}")]
    InvalidWindow(String),

    #[error(
        "gap is too large for a simple convergence issue at forcing {forcing}: lower {lower:?} above upper {upper:?}"
    )]
    AttractorGap {
        forcing: f64,
        lower: Vec<f64>,
        upper: Vec<f64>,
    },

    #[error("no attractors known for forcing {0}")]
    MissingForcing(i64),

    #[error("monostable scan left forcing {0} without an attractor")]
    IncompleteScan(i64),

    #[error("expected a bistable forcing inside ({min}, {max}), got {forcing}")]
    DetectionOutOfWindow { forcing: i64, min: i64, max: i64 },

    #[error("expected two attractors at forcing {0}")]
    ExpectedBistable(i64),

    #[error("shift range is only defined for bistable data")]
    NotBistable,

    #[error("shift range needs lower state {lower} strictly below upper state {upper}")]
    InvalidShiftRange { lower: f64, upper: f64 },

    #[error("shift range forcings out of order: {first} < {second}")]
    ShiftRangeOrder { first: f64, second: f64 },

    #[error("stability bounds violate the window: {0}")]
    BoundsOutOfWindow(String),

    #[error("bisection did not terminate within {0} iterations")]
    BisectionBudget(usize),

    #[error("{operation} needs a model of dimension {expected}, got {actual}")]
    DimensionMismatch {
        operation: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("malformed bifurcation record: {0}")]
    MalformedRecord(String),
}

pub type Result<T> = std::result::Result<T, BifurcationError>;

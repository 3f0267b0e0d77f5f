use thiserror::Error;

/// Planner error types
///
/// None of these stop plan publication; the control loop absorbs each one
/// with a local fallback.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlannerError {
    #[error("Insufficient history: {have} of {need} vehicle samples")]
    ColdStart { have: usize, need: usize },

    #[error("Calibration invalid: {0}")]
    CalibrationInvalid(String),

    #[error("Slot output shapes differ: primary {primary}, alternate {alternate}")]
    ShapeMismatch { primary: usize, alternate: usize },

    #[error("Reference lane lines not aligned")]
    StaleFrame,

    #[error("Tuning read failed: {0}")]
    TuningRead(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Unexpected model output shape {rows}x{cols}")]
    InvalidModelOutput { rows: usize, cols: usize },

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Param store error: {0}")]
    Store(String),
}

/// Result type for planner operations
pub type PlannerResult<T> = Result<T, PlannerError>;

impl From<std::io::Error> for PlannerError {
    fn from(err: std::io::Error) -> Self {
        PlannerError::Store(err.to_string())
    }
}

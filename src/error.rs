//! Error types for Alertloop

use thiserror::Error;

/// Errors that can occur while calibrating, monitoring or persisting state
#[derive(Debug, Error)]
pub enum LoopError {
    /// No face or pose was found in the frame. Non-fatal: indices default.
    #[error("Landmark detection unavailable for this frame")]
    DetectionUnavailable,

    /// The reference profile is missing mandatory anchors. Blocks monitoring start.
    #[error("Calibration invalid: {0}")]
    CalibrationInvalid(String),

    /// Camera busy or unopenable. Fatal to the session, retryable.
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// A reference segment had zero length.
    #[error("Degenerate geometry in {feature}")]
    NumericDegenerate { feature: &'static str },

    #[error("Missing landmark: {0}")]
    MissingLandmark(&'static str),

    #[error("A break is already active")]
    BreakAlreadyActive,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoopError {
    /// Structural errors surface once to the user and need an explicit retry
    /// or re-calibration. Everything else is absorbed by the monitoring loop.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            LoopError::CalibrationInvalid(_) | LoopError::ResourceUnavailable(_)
        )
    }
}

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Flat result codes for endgame runs and tracking steps.
///
/// `Success` is represented by `Ok(())`. Tracker failures surfaced during an
/// endgame run are propagated unmodified; retrying is the caller's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum EndgameError {
    #[error("higher precision necessary to continue tracking")]
    HigherPrecisionNecessary,
    #[error("path is diverging to infinity")]
    GoingToInfinity,
    #[error("matrix solve failed")]
    MatrixSolveFailure,
    #[error("maximum number of tracking steps taken")]
    MaxNumStepsTaken,
    #[error("maximum working precision reached")]
    MaxPrecisionReached,
    #[error("minimum step size reached")]
    MinStepSizeReached,
    #[error("start point is singular")]
    SingularStartPoint,
    #[error("time magnitude fell below the minimum trackable time")]
    MinTrackTimeReached,
    #[error("dehomogenized norm exceeded the security bound twice in a row")]
    SecurityMaxNormReached,
    #[error("dimension mismatch: expected {expected} variables, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("cycle number is zero")]
    ZeroCycleNumber,
    #[error("insufficient samples: need {needed}, have {have}")]
    InsufficientSamples { needed: usize, have: usize },
    #[error("loop radius must be positive")]
    ZeroLoopRadius,
    #[error("tracking failure")]
    Failure,
}

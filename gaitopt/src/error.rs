//! Error taxonomy for the simulation core.

use thiserror::Error;

/// Everything an evaluation can fail with.
///
/// `Aborted` is not a fault: it marks a user-requested stop so callers can
/// choose between abandoning one evaluation and shutting the process down.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("parameter vector has {actual} genes, controller expects {expected}")]
    ParameterLength { expected: usize, actual: usize },

    #[error("step size must be positive and finite, got {0}")]
    InvalidStep(f64),

    #[error("step limit must be non-negative and finite, got {0}")]
    InvalidStepLimit(f64),

    #[error("obstacle size scale must be positive, got {size_scale}")]
    InvalidTerrain { size_scale: u32 },

    #[error("robot has {servos} servos, at least {required} are needed")]
    TooFewServos { servos: usize, required: usize },

    #[error("servo index {index} out of range for a robot with {servos} servos")]
    ServoIndex { index: usize, servos: usize },

    #[error("rendering enabled but no viewer was supplied")]
    MissingViewer,

    #[error("obstacle must be fixed before it joins the ground set")]
    NotFixed,

    #[error("evaluation aborted by user")]
    Aborted,

    #[error("physics backend: {0}")]
    Physics(String),
}

impl SimError {
    pub fn is_abort(&self) -> bool {
        matches!(self, SimError::Aborted)
    }
}

pub type SimResult<T> = Result<T, SimError>;

use thiserror::Error;

/// Errors raised by the simulation kernel.
///
/// Setup-time variants (`DuplicateReaction`, `UnknownSpecies`, `UnsolvableRate`,
/// `InfeasiblePolicy`, ...) must stop a run before its first step.
/// `OutOfMemory` and `InvariantViolation` are fatal when they appear mid-run.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SimError {
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("reaction '{0}' is already defined")]
    DuplicateReaction(String),
    #[error("unknown species '{0}'")]
    UnknownSpecies(String),
    #[error("reaction '{name}' rate cannot be solved: {reason}")]
    UnsolvableRate { name: String, reason: String },
    #[error("reaction '{name}' product placement is infeasible: {reason}")]
    InfeasiblePolicy { name: String, reason: String },
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    #[error("simulation volume is degenerate along axis {axis}")]
    DegenerateDomain { axis: usize },
    #[error("reaction '{name}' is malformed: {reason}")]
    InvalidReaction { name: String, reason: String },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("molecule handle {index}:{generation} no longer refers to a live molecule")]
    StaleHandle { index: u32, generation: u32 },
}

impl From<std::collections::TryReserveError> for SimError {
    fn from(err: std::collections::TryReserveError) -> Self {
        SimError::OutOfMemory(err.to_string())
    }
}

pub type SimResult<T> = Result<T, SimError>;

use thiserror::Error;

/// Errors raised while configuring or advancing a hierarchy. Solver failures
/// and non-finite state are fatal for the run; the caller decides whether to
/// restart with different settings.
///
#[derive(Debug, Error)]
pub enum Error {
    #[error("{operation} failed on level {level} at t = {time}: residual {residual:e} after {iterations} iterations")]
    SolveFailed {
        operation: &'static str,
        level: usize,
        time: f64,
        residual: f64,
        iterations: usize,
    },

    #[error("new {component} contains non-finite values on level {level} at t = {time} (patch {patch})")]
    NonFiniteState {
        component: String,
        level: usize,
        time: f64,
        patch: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing boundary condition: {0}")]
    MissingBoundaryCondition(String),

    #[error("scalar '{name}' has an inconsistent advection form: {reason}")]
    InconsistentAdvectionForm { name: String, reason: &'static str },

    #[error("checkpoint: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

//! Error kinds shared by every subsystem (see spec §7).
//!
//! All fallible public methods return [`KslResult`]. Only `KslError::Terminated`
//! is ever "recoverable" — it is the control-flow sentinel threaded through a
//! process's `afterTermination` hook rather than an operational failure.

use crate::ids::ProcessId;
use thiserror::Error;

/// The crate-wide result alias.
pub type KslResult<T> = Result<T, KslError>;

#[derive(Debug, Error)]
pub enum KslError {
    /// Negative/non-finite time, amount < 1, size mismatch.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A precondition the caller was required to uphold did not hold
    /// (seize without available units, ride without a request, transfer
    /// from the wrong location, ...).
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Double release, resume of a non-suspended entity, two pending
    /// resume events for one entity, or any other internal invariant
    /// break.
    #[error("state violation: {0}")]
    StateViolation(String),

    /// Control-flow unwind sentinel raised to terminate a process from
    /// the outside. Recoverable only via `afterTermination`.
    #[error("process {process:?} terminated")]
    Terminated { process: ProcessId },

    /// The future event list ran dry before the requested stop
    /// condition was reached. Informational unless the caller asked
    /// for it to be treated as an error via `RunConfig`.
    #[error("schedule exhausted at t={at}")]
    ScheduleExhausted { at: f64 },
}

impl KslError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        KslError::InvalidArgument(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        KslError::PreconditionFailed(msg.into())
    }

    pub fn state_violation(msg: impl Into<String>) -> Self {
        KslError::StateViolation(msg.into())
    }
}

//! Failure taxonomy for a single step invocation.
//!
//! Every fatal condition that ends an invocation is one of these variants, so
//! hosts can tell "too slow" from "threw" from "bad output" without parsing
//! messages. Messages from scripts and engines are carried through verbatim.

use thiserror::Error;

/// Errors reported by the step pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// A configuration entry is missing, malformed or unresolvable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The engine or worker could not be prepared; nothing was executed.
    #[error("job setup failed: {0}")]
    ScriptSetup(String),

    /// The script body raised.
    #[error("script execution failed: {0}")]
    ScriptExecution(String),

    /// The wall-clock budget elapsed before the script finished.
    #[error("script execution timed out ({secs}s)")]
    Timeout { secs: u64 },

    /// The script result failed output validation.
    #[error("output error: {0}")]
    Output(String),

    /// The invocation was cancelled while running.
    #[error("job cancelled")]
    Cancelled,

    /// An operation was invoked in a state that does not allow it.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Cancellation was requested but the task could not be stopped.
    #[error("unable to stop the job, it could be already completed")]
    CancelRejected,

    /// The host rejected a status write.
    #[error("host error: {0}")]
    Host(String),
}

impl JobError {
    pub fn config(msg: impl Into<String>) -> Self {
        JobError::Configuration(msg.into())
    }

    pub fn setup(msg: impl Into<String>) -> Self {
        JobError::ScriptSetup(msg.into())
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        JobError::IllegalState(msg.into())
    }
}

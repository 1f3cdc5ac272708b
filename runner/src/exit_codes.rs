//! Stable exit codes for `scriptjob` CLI commands.

use crate::core::error::JobError;

/// Step completed, was skipped or was a no-op.
pub const OK: i32 = 0;
/// Invalid configuration, script failure, bad output or any other error.
pub const FAILED: i32 = 1;
/// The script exceeded `script.timeout`.
pub const TIMED_OUT: i32 = 2;
/// The job was cancelled while running.
pub const CANCELLED: i32 = 3;

/// Exit code for a failed invocation.
pub fn for_error(err: &JobError) -> i32 {
    match err {
        JobError::Timeout { .. } => TIMED_OUT,
        JobError::Cancelled => CANCELLED,
        _ => FAILED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_cancellation_have_their_own_codes() {
        assert_eq!(for_error(&JobError::Timeout { secs: 3 }), TIMED_OUT);
        assert_eq!(for_error(&JobError::Cancelled), CANCELLED);
        assert_eq!(for_error(&JobError::Output("x".to_string())), FAILED);
    }
}

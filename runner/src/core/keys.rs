//! Well-known configuration keys and the reserved key set.

/// Condition that, when true, marks the step skipped without running it.
pub const SKIP: &str = "flow.skip";
/// Condition that, when true, completes the step without running the script.
pub const NOOP: &str = "flow.noop";
/// Forward the step's own inputs into its output.
pub const FORWARD_PARAMETERS: &str = "script.forwardParameters";
/// Fail the step when the script does not return a mapping.
pub const CHECK_OUTPUT: &str = "script.checkOutput";
/// Script to run, located on the classpath.
pub const SCRIPT: &str = "script.file";
/// Colon-separated list of script roots.
pub const CLASSPATH: &str = "script.classpath";
/// Timeout in seconds; `<= 0` disables it.
pub const TIMEOUT: &str = "script.timeout";
/// Working directory used to resolve relative classpath entries.
pub const WORKING_DIR: &str = "working.dir";
/// Flow execution id assigned by the host.
pub const FLOW_EXEC_ID: &str = "host.flow.execid";

/// Prefix of keys owned by the host for job control.
pub const CONTROL_PREFIX: &str = "host.";

/// True if `key` must never be forwarded to downstream steps.
///
/// Reserved keys are the host control namespace and the working directory.
pub fn is_reserved(key: &str) -> bool {
    key.starts_with(CONTROL_PREFIX) || key == WORKING_DIR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_namespace_is_reserved() {
        assert!(is_reserved("host.flow.execid"));
        assert!(is_reserved("host.anything"));
        assert!(is_reserved(WORKING_DIR));
    }

    #[test]
    fn ordinary_keys_are_not_reserved() {
        assert!(!is_reserved("working.directory"));
        assert!(!is_reserved("hostname"));
        assert!(!is_reserved("flow.skip"));
        assert!(!is_reserved("script.file"));
    }
}

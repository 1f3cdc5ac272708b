//! Out-of-process engine: the script is an executable on the classpath.
//!
//! The child gets the flattened configuration as a JSON object in the file
//! named by `JOB_PROP_FILE` and may write its output object to the file named
//! by `JOB_OUTPUT_PROP_FILE`. Configuration keys under `env.` are exported as
//! environment variables with the prefix stripped. Stdout lines go to the
//! script logger; stderr is logged as warnings when the child fails.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::io::config::JobTypeConfig;
use crate::io::engine::{ScriptBinding, ScriptEngine, ScriptRequest};
use crate::io::output::write_json;
use crate::io::process::run_command_cancellable;

/// Environment variable naming the input properties file.
pub const PROP_FILE_ENV: &str = "JOB_PROP_FILE";
/// Environment variable naming the output properties file.
pub const OUTPUT_PROP_FILE_ENV: &str = "JOB_OUTPUT_PROP_FILE";
/// Configuration prefix for keys exported into the child environment.
pub const ENV_PREFIX: &str = "env.";

/// Engine that runs scripts as child processes.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    poll: Duration,
    output_limit_bytes: usize,
}

impl Default for CommandEngine {
    fn default() -> Self {
        Self::from_config(&JobTypeConfig::default())
    }
}

impl CommandEngine {
    pub fn new(poll: Duration, output_limit_bytes: usize) -> Self {
        Self {
            poll,
            output_limit_bytes,
        }
    }

    pub fn from_config(cfg: &JobTypeConfig) -> Self {
        Self::new(cfg.cancel_poll(), cfg.command_output_limit_bytes)
    }
}

impl ScriptEngine for CommandEngine {
    fn prepare(&self, request: &ScriptRequest) -> Result<()> {
        let path = request.classpath.require(&request.script)?;
        if !is_executable(&path) {
            bail!("script {} is not executable", path.display());
        }
        Ok(())
    }

    #[instrument(skip_all, fields(script = %request.script, step = %binding.step))]
    fn run(&self, request: &ScriptRequest, binding: &ScriptBinding) -> Result<Option<Value>> {
        let path = request.classpath.require(&request.script)?;
        let scratch = tempfile::tempdir().context("create script scratch directory")?;
        let props_path = scratch.path().join("job.props.json");
        let output_path = scratch.path().join("job.output.json");
        write_json(&props_path, &binding.config).context("write job properties")?;

        let mut cmd = Command::new(&path);
        cmd.current_dir(&request.workdir)
            .env(PROP_FILE_ENV, &props_path)
            .env(OUTPUT_PROP_FILE_ENV, &output_path);
        for (key, value) in &binding.config {
            if let Some(name) = key.strip_prefix(ENV_PREFIX)
                && !name.is_empty()
            {
                cmd.env(name, value);
            }
        }

        info!(path = %path.display(), "starting script process");
        let output = run_command_cancellable(
            cmd,
            &binding.cancel,
            self.poll,
            self.output_limit_bytes,
            binding.log.writer(),
        )
        .with_context(|| format!("run {}", path.display()))?;

        if output.cancelled {
            return Err(anyhow!("script {} was cancelled", request.script));
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            for line in stderr.lines() {
                binding.log.warn(line);
            }
            warn!(exit_code = ?output.status.code(), "script process failed");
            return Err(anyhow!(
                "script {} exited with status {:?}{}",
                request.script,
                output.status.code(),
                output.stderr_truncated_notice("script")
            ));
        }

        read_output(&output_path)
    }
}

/// Parse the output file; a missing or blank file is no output.
fn read_output(path: &Path) -> Result<Option<Value>> {
    if !path.exists() {
        debug!("script wrote no output file");
        return Ok(None);
    }
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let value: Value =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(value))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

//! Job type configuration and job properties files.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::log_sink::DEFAULT_PREFIX;

/// Job type configuration (TOML).
///
/// Missing fields default to values that work for a stand-alone run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JobTypeConfig {
    /// System properties every job inherits; job properties shadow them.
    pub system: BTreeMap<String, String>,

    /// Prefix prepended to every line a script logs.
    pub log_prefix: String,

    /// How often blocked workers and child processes check for cancellation.
    pub cancel_poll_ms: u64,

    /// Truncate captured command stdout/stderr beyond this many bytes.
    pub command_output_limit_bytes: usize,
}

impl Default for JobTypeConfig {
    fn default() -> Self {
        Self {
            system: BTreeMap::new(),
            log_prefix: DEFAULT_PREFIX.to_string(),
            cancel_poll_ms: 50,
            command_output_limit_bytes: 100_000,
        }
    }
}

impl JobTypeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cancel_poll_ms == 0 {
            return Err(anyhow!("cancel_poll_ms must be > 0"));
        }
        if self.command_output_limit_bytes == 0 {
            return Err(anyhow!("command_output_limit_bytes must be > 0"));
        }
        if let Some(key) = self.system.keys().find(|key| key.trim().is_empty()) {
            return Err(anyhow!("system property key {key:?} must not be blank"));
        }
        Ok(())
    }

    pub fn cancel_poll(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `JobTypeConfig::default()`.
pub fn load_config(path: &Path) -> Result<JobTypeConfig> {
    if !path.exists() {
        let cfg = JobTypeConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: JobTypeConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load a job properties file.
///
/// Nested tables flatten to dotted keys (`[script] file = "a"` becomes
/// `script.file`). Non-string scalars keep their TOML spelling.
pub fn load_properties(path: &Path) -> Result<BTreeMap<String, String>> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_properties(&contents).with_context(|| format!("parse {}", path.display()))
}

pub fn parse_properties(contents: &str) -> Result<BTreeMap<String, String>> {
    let table: toml::Table = toml::from_str(contents)?;
    let mut out = BTreeMap::new();
    flatten_table("", &table, &mut out)?;
    Ok(out)
}

fn flatten_table(prefix: &str, table: &toml::Table, out: &mut BTreeMap<String, String>) -> Result<()> {
    for (key, value) in table {
        let full = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        let text = match value {
            toml::Value::Table(inner) => {
                flatten_table(&full, inner, out)?;
                continue;
            }
            toml::Value::String(s) => s.clone(),
            toml::Value::Integer(i) => i.to_string(),
            toml::Value::Float(f) => f.to_string(),
            toml::Value::Boolean(b) => b.to_string(),
            toml::Value::Datetime(d) => d.to_string(),
            toml::Value::Array(_) => {
                return Err(anyhow!("property {full} is an array; use a string value"));
            }
        };
        out.insert(full, text);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, JobTypeConfig::default());
        assert_eq!(cfg.log_prefix, "[script] ");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("jobtype.toml");
        fs::write(
            &path,
            "cancel_poll_ms = 10\n[system]\n\"working.dir\" = \"/srv\"\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.cancel_poll_ms, 10);
        assert_eq!(cfg.command_output_limit_bytes, 100_000);
        assert_eq!(cfg.system.get("working.dir").map(String::as_str), Some("/srv"));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let cfg = JobTypeConfig {
            cancel_poll_ms: 0,
            ..JobTypeConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("cancel_poll_ms"));
    }

    #[test]
    fn properties_flatten_nested_tables() {
        let props = parse_properties(
            "name = \"nightly\"\n[script]\nfile = \"load.expr\"\ntimeout = 30\ncheckOutput = true\n[flow]\nskip = \"/load/\"\n",
        )
        .expect("parse");

        assert_eq!(props.get("name").map(String::as_str), Some("nightly"));
        assert_eq!(props.get("script.file").map(String::as_str), Some("load.expr"));
        assert_eq!(props.get("script.timeout").map(String::as_str), Some("30"));
        assert_eq!(props.get("script.checkOutput").map(String::as_str), Some("true"));
        assert_eq!(props.get("flow.skip").map(String::as_str), Some("/load/"));
    }

    #[test]
    fn quoted_dotted_keys_are_kept() {
        let props = parse_properties("\"script.file\" = \"a.expr\"\n").expect("parse");
        assert_eq!(props.get("script.file").map(String::as_str), Some("a.expr"));
    }

    #[test]
    fn arrays_are_rejected() {
        let err = parse_properties("list = [1, 2]\n").unwrap_err();
        assert!(err.to_string().contains("list"));
    }
}

//! Script engine abstraction.
//!
//! The [`ScriptEngine`] trait decouples the step lifecycle from the language a
//! script body is written in. Two engines ship with the crate:
//! [`ExpressionEngine`](crate::io::expression::ExpressionEngine) evaluates
//! in-process and [`CommandEngine`](crate::io::command::CommandEngine) spawns
//! the script as a child process. Tests use scripted engines that return
//! predetermined values.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use serde_json::Value;

use crate::core::params::ParameterSet;
use crate::core::task::{CancelFlag, ProgressSlot};
use crate::core::types::StepRef;
use crate::io::events::FinishHook;
use crate::io::log_sink::ScriptLogger;

/// Ordered list of directories scripts are looked up in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classpath {
    roots: Vec<PathBuf>,
}

impl Classpath {
    /// Parse a colon-separated classpath.
    ///
    /// Relative entries are resolved against `workdir`, and `workdir` itself is
    /// always the last root.
    pub fn resolve(raw: Option<&str>, workdir: &Path) -> Self {
        let mut roots: Vec<PathBuf> = raw
            .unwrap_or_default()
            .split(':')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let path = Path::new(entry);
                if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    workdir.join(path)
                }
            })
            .collect();
        roots.push(workdir.to_path_buf());
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// First existing file named `script` under any root, in order.
    pub fn locate(&self, script: &str) -> Option<PathBuf> {
        let direct = Path::new(script);
        if direct.is_absolute() {
            return direct.is_file().then(|| direct.to_path_buf());
        }
        self.roots
            .iter()
            .map(|root| root.join(script))
            .find(|candidate| candidate.is_file())
    }

    /// Like [`Classpath::locate`], failing with a message that lists the roots.
    pub fn require(&self, script: &str) -> Result<PathBuf> {
        self.locate(script).ok_or_else(|| {
            let roots: Vec<String> = self
                .roots
                .iter()
                .map(|root| root.display().to_string())
                .collect();
            anyhow!("script {script} not found on classpath [{}]", roots.join(", "))
        })
    }
}

/// What to run.
#[derive(Debug, Clone)]
pub struct ScriptRequest {
    /// Script name, looked up on the classpath.
    pub script: String,
    pub classpath: Classpath,
    /// Working directory the script runs in.
    pub workdir: PathBuf,
}

/// Everything a running script body can see and touch.
#[derive(Debug, Clone)]
pub struct ScriptBinding {
    /// Flattened effective configuration.
    pub config: BTreeMap<String, String>,
    /// The layered configuration as the host supplied it.
    pub props: Arc<ParameterSet>,
    pub progress: ProgressSlot,
    pub cancel: CancelFlag,
    pub log: ScriptLogger,
    pub step: StepRef,
    /// Registration for "enclosing scope finished" callbacks, when the host
    /// knows the step's scope.
    pub on_finish: Option<FinishHook>,
}

/// Abstraction over script execution backends.
pub trait ScriptEngine: Send + Sync {
    /// Load and check the script before any worker is started.
    fn prepare(&self, request: &ScriptRequest) -> Result<()> {
        let _ = request;
        Ok(())
    }

    /// Run the script body. `None` means the script produced no value.
    fn run(&self, request: &ScriptRequest, binding: &ScriptBinding) -> Result<Option<Value>>;
}

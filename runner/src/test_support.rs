//! Test-only engines, overlays and builders.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::Value;

use crate::core::params::ParameterSet;
use crate::core::task::{CancelFlag, ProgressSlot};
use crate::core::types::StepRef;
use crate::io::engine::{Classpath, ScriptBinding, ScriptEngine, ScriptRequest};
use crate::io::log_sink::{DEFAULT_PREFIX, ScriptLogger};
use crate::io::overlay::{ConfigOverlay, OverlayGate};

type ScriptFn = dyn Fn(&ScriptRequest, &ScriptBinding) -> Result<Option<Value>> + Send + Sync;

/// Engine whose body is a closure. Records every script it was asked to run.
pub struct FnEngine {
    body: Box<ScriptFn>,
    runs: Mutex<Vec<String>>,
    fail_prepare: Option<String>,
}

impl FnEngine {
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(&ScriptRequest, &ScriptBinding) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        Self {
            body: Box::new(body),
            runs: Mutex::new(Vec::new()),
            fail_prepare: None,
        }
    }

    /// Engine that returns `value` immediately.
    pub fn returning(value: Option<Value>) -> Self {
        Self::new(move |_, _| Ok(value.clone()))
    }

    /// Engine that sleeps for `duration` (or until cancelled), then returns `value`.
    pub fn sleeping(duration: Duration, value: Option<Value>) -> Self {
        Self::new(move |_, binding| {
            let started = Instant::now();
            while started.elapsed() < duration && !binding.cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(value.clone())
        })
    }

    /// Make `prepare` fail with `message`.
    pub fn failing_prepare(mut self, message: &str) -> Self {
        self.fail_prepare = Some(message.to_string());
        self
    }

    pub fn runs(&self) -> Vec<String> {
        self.runs.lock().expect("runs lock").clone()
    }
}

impl ScriptEngine for FnEngine {
    fn prepare(&self, _request: &ScriptRequest) -> Result<()> {
        match &self.fail_prepare {
            Some(message) => Err(anyhow::anyhow!("{message}")),
            None => Ok(()),
        }
    }

    fn run(&self, request: &ScriptRequest, binding: &ScriptBinding) -> Result<Option<Value>> {
        self.runs
            .lock()
            .expect("runs lock")
            .push(request.script.clone());
        (self.body)(request, binding)
    }
}

/// Overlay that counts installs and restores and tracks nesting depth.
#[derive(Debug, Default)]
pub struct RecordingOverlay {
    installs: AtomicUsize,
    restores: AtomicUsize,
    depth: AtomicUsize,
    max_depth: AtomicUsize,
    last_installed: Mutex<BTreeMap<String, String>>,
}

impl RecordingOverlay {
    pub fn installs(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    pub fn restores(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth.load(Ordering::SeqCst)
    }

    pub fn last_installed(&self) -> BTreeMap<String, String> {
        self.last_installed.lock().expect("overlay lock").clone()
    }
}

impl ConfigOverlay for RecordingOverlay {
    fn install(&self, properties: &BTreeMap<String, String>) -> Result<()> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_depth.fetch_max(depth, Ordering::SeqCst);
        *self.last_installed.lock().expect("overlay lock") = properties.clone();
        Ok(())
    }

    fn restore(&self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
        self.restores.fetch_add(1, Ordering::SeqCst);
    }
}

/// Gate over a fresh [`RecordingOverlay`].
pub fn recording_gate() -> (Arc<OverlayGate>, Arc<RecordingOverlay>) {
    let overlay = Arc::new(RecordingOverlay::default());
    (Arc::new(OverlayGate::new(overlay.clone())), overlay)
}

/// Request for `script` rooted in the current directory.
pub fn script_request(script: &str) -> ScriptRequest {
    let workdir = PathBuf::from(".");
    ScriptRequest {
        script: script.to_string(),
        classpath: Classpath::resolve(None, &workdir),
        workdir,
    }
}

/// Binding for step `1:test` over literal pairs.
pub fn binding_for(pairs: &[(&str, &str)]) -> ScriptBinding {
    let props = ParameterSet::from_pairs(pairs);
    ScriptBinding {
        config: props.flatten(),
        props: Arc::new(props),
        progress: ProgressSlot::new(),
        cancel: CancelFlag::new(),
        log: ScriptLogger::new("test", DEFAULT_PREFIX),
        step: StepRef::new(1, "test"),
        on_finish: None,
    }
}

/// Job properties layered over system properties.
pub fn layered(job: &[(&str, &str)], system: &[(&str, &str)]) -> ParameterSet {
    let job = job
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    ParameterSet::with_parent(job, ParameterSet::from_pairs(system))
}

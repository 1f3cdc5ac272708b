//! In-process engine: the script file is a single minijinja expression.
//!
//! The expression sees `config` (flattened configuration), `step`, `exec_id`
//! and `ambient` (the installed configuration overlay) and may call:
//!
//! - `progress(x)` to report progress in `[0, 1]`;
//! - `log(msg)` to write a line through the script logger;
//! - `cancelled()` to poll for cooperative cancellation;
//! - `on_finish(msg)` to log `msg` once the enclosing flow scope finishes.
//!
//! A mapping result becomes the script's output properties.

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use minijinja::{Environment, Value, context};
use tracing::{debug, instrument};

use crate::io::engine::{ScriptBinding, ScriptEngine, ScriptRequest};
use crate::io::overlay::AmbientProperties;

/// Engine that evaluates script files as minijinja expressions.
#[derive(Debug, Clone, Default)]
pub struct ExpressionEngine {
    ambient: Option<Arc<AmbientProperties>>,
}

impl ExpressionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose `ambient` to expressions as the `ambient` variable.
    pub fn with_ambient(ambient: Arc<AmbientProperties>) -> Self {
        Self {
            ambient: Some(ambient),
        }
    }

    fn environment(binding: &ScriptBinding) -> Environment<'static> {
        let mut env = Environment::new();

        let progress = binding.progress.clone();
        env.add_function("progress", move |value: f64| {
            progress.set(value);
            true
        });

        let log = binding.log.clone();
        env.add_function("log", move |message: String| {
            log.info(&message);
            true
        });

        let cancel = binding.cancel.clone();
        env.add_function("cancelled", move || cancel.is_cancelled());

        let hook = binding.on_finish.clone();
        let log = binding.log.clone();
        env.add_function("on_finish", move |message: String| {
            let Some(hook) = &hook else {
                return false;
            };
            let log = log.clone();
            hook.register(Box::new(move || -> anyhow::Result<()> {
                log.info(&message);
                Ok(())
            }));
            true
        });

        env
    }
}

impl ScriptEngine for ExpressionEngine {
    fn prepare(&self, request: &ScriptRequest) -> Result<()> {
        let path = request.classpath.require(&request.script)?;
        let source =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        Environment::new()
            .compile_expression(source.trim())
            .with_context(|| format!("compile {}", path.display()))?;
        Ok(())
    }

    #[instrument(skip_all, fields(script = %request.script))]
    fn run(
        &self,
        request: &ScriptRequest,
        binding: &ScriptBinding,
    ) -> Result<Option<serde_json::Value>> {
        let path = request.classpath.require(&request.script)?;
        let source =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;

        let env = Self::environment(binding);
        let expr = env
            .compile_expression(source.trim())
            .with_context(|| format!("compile {}", path.display()))?;

        let ambient = self
            .ambient
            .as_ref()
            .map(|ambient| ambient.snapshot())
            .unwrap_or_default();
        let ctx = context! {
            config => Value::from_serialize(&binding.config),
            ambient => Value::from_serialize(&ambient),
            step => binding.step.step_id.clone(),
            exec_id => binding.step.exec_id,
        };
        let value = expr
            .eval(ctx)
            .with_context(|| format!("evaluate {}", path.display()))?;
        debug!(kind = %value.kind(), "expression evaluated");

        if value.is_undefined() || value.is_none() {
            return Ok(None);
        }
        let json = serde_json::to_value(&value).context("convert expression result")?;
        Ok(Some(json))
    }
}

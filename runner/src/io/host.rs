//! Narrow seam into the surrounding workflow engine.
//!
//! The pipeline never reaches into host internals. Everything it needs from
//! the host (recording a skipped status, finding the scope a step runs in,
//! failing a scope) goes through [`StepHost`].

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::core::types::{StepRef, StepStatus};

/// Live record of a running step as seen by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepInfo {
    /// Identifier of the enclosing (sub)flow the step belongs to.
    pub scope_id: String,
    pub status: StepStatus,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Capabilities the host exposes to the step pipeline.
pub trait StepHost: Send + Sync {
    /// Record a new status and update time for `step`.
    fn report_status(
        &self,
        step: &StepRef,
        status: StepStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Look up a running step by id.
    fn lookup_step(&self, step: &StepRef) -> Option<StepInfo>;

    /// Mark the scope `scope_id` of flow execution `exec_id` as failed.
    fn mark_scope_failed(&self, exec_id: i64, scope_id: &str) -> Result<()>;
}

/// Host that keeps step records in memory.
///
/// Used when the pipeline runs stand-alone (CLI) and by tests.
#[derive(Debug, Default)]
pub struct InMemoryHost {
    steps: Mutex<HashMap<StepRef, StepInfo>>,
    failed_scopes: Mutex<Vec<(i64, String)>>,
}

impl InMemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `step` as running inside `scope_id`.
    pub fn register_step(&self, step: &StepRef, scope_id: impl Into<String>) {
        let info = StepInfo {
            scope_id: scope_id.into(),
            status: StepStatus::Running,
            updated_at: None,
        };
        if let Ok(mut steps) = self.steps.lock() {
            steps.insert(step.clone(), info);
        }
    }

    pub fn status(&self, step: &StepRef) -> Option<StepStatus> {
        self.lookup_step(step).map(|info| info.status)
    }

    pub fn failed_scopes(&self) -> Vec<(i64, String)> {
        self.failed_scopes
            .lock()
            .map(|scopes| scopes.clone())
            .unwrap_or_default()
    }
}

impl StepHost for InMemoryHost {
    fn report_status(
        &self,
        step: &StepRef,
        status: StepStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut steps = self
            .steps
            .lock()
            .map_err(|_| anyhow!("step registry poisoned"))?;
        let info = steps
            .get_mut(step)
            .ok_or_else(|| anyhow!("step {step} is not running in this host"))?;
        debug!(step = %step, ?status, "recording step status");
        info.status = status;
        info.updated_at = Some(updated_at);
        Ok(())
    }

    fn lookup_step(&self, step: &StepRef) -> Option<StepInfo> {
        self.steps.lock().ok()?.get(step).cloned()
    }

    fn mark_scope_failed(&self, exec_id: i64, scope_id: &str) -> Result<()> {
        let mut scopes = self
            .failed_scopes
            .lock()
            .map_err(|_| anyhow!("scope registry poisoned"))?;
        scopes.push((exec_id, scope_id.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_status_updates_registered_step() {
        let host = InMemoryHost::new();
        let step = StepRef::new(1, "load");
        host.register_step(&step, "daily");

        let now = Utc::now();
        host.report_status(&step, StepStatus::Skipped, now)
            .expect("report");

        let info = host.lookup_step(&step).expect("info");
        assert_eq!(info.status, StepStatus::Skipped);
        assert_eq!(info.updated_at, Some(now));
        assert_eq!(info.scope_id, "daily");
    }

    #[test]
    fn report_status_rejects_unknown_step() {
        let host = InMemoryHost::new();
        let err = host
            .report_status(&StepRef::new(1, "ghost"), StepStatus::Skipped, Utc::now())
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }
}

//! Shared deterministic types for the step pipeline.
//!
//! These types define stable contracts between the gate, the reconciler and
//! the lifecycle controller. They carry no I/O and no shared state.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one step invocation inside a flow execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepRef {
    pub exec_id: i64,
    pub step_id: String,
}

impl StepRef {
    pub fn new(exec_id: i64, step_id: impl Into<String>) -> Self {
        Self {
            exec_id,
            step_id: step_id.into(),
        }
    }
}

impl fmt::Display for StepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exec_id, self.step_id)
    }
}

/// Status of a step as recorded by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Skipped,
    Succeeded,
    Failed,
    Cancelled,
}

/// Flat string-to-string property set handed back to the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputPropertySet {
    entries: BTreeMap<String, String>,
}

impl OutputPropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Gate decision for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreconditionVerdict {
    /// Run the script.
    Proceed,
    /// Step is skipped; output marks the skip.
    Skip(OutputPropertySet),
    /// Step completes without running; output is empty or the forwarded inputs.
    Noop(OutputPropertySet),
}

/// Lifecycle state of a job invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum JobPhase {
    Init = 0,
    PreconditionCheck = 1,
    Skipped = 2,
    Noop = 3,
    Running = 4,
    Completed = 5,
    TimedOut = 6,
    Failed = 7,
    Cancelled = 8,
}

impl JobPhase {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => JobPhase::PreconditionCheck,
            2 => JobPhase::Skipped,
            3 => JobPhase::Noop,
            4 => JobPhase::Running,
            5 => JobPhase::Completed,
            6 => JobPhase::TimedOut,
            7 => JobPhase::Failed,
            8 => JobPhase::Cancelled,
            _ => JobPhase::Init,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_u8() {
        for phase in [
            JobPhase::Init,
            JobPhase::PreconditionCheck,
            JobPhase::Skipped,
            JobPhase::Noop,
            JobPhase::Running,
            JobPhase::Completed,
            JobPhase::TimedOut,
            JobPhase::Failed,
            JobPhase::Cancelled,
        ] {
            assert_eq!(JobPhase::from_u8(phase as u8), phase);
        }
    }

    #[test]
    fn output_serializes_as_flat_object() {
        let mut entries = BTreeMap::new();
        entries.insert("b".to_string(), "2".to_string());
        entries.insert("a".to_string(), "1".to_string());
        let output = OutputPropertySet::from_map(entries);
        let json = serde_json::to_string(&output).expect("serialize");
        assert_eq!(json, r#"{"a":"1","b":"2"}"#);
    }
}

//! Reconciliation of forwarded inputs with a script's return value.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{info, warn};

use crate::core::error::JobError;
use crate::core::keys::is_reserved;
use crate::core::params::ParameterSet;
use crate::core::types::OutputPropertySet;

/// Every non-reserved effective entry of `inputs`.
pub fn forward_parameters(inputs: &ParameterSet) -> BTreeMap<String, String> {
    inputs
        .flatten()
        .into_iter()
        .filter(|(key, _)| !is_reserved(key))
        .collect()
}

/// Build the output property set from `inputs` and the script's `raw` result.
///
/// Script entries win over forwarded inputs on key collision. A missing or
/// non-mapping result is an error only when `check_output` is set; otherwise
/// the script simply contributes nothing. `null` counts as missing.
pub fn reconcile(
    inputs: &ParameterSet,
    forward: bool,
    check_output: bool,
    raw: Option<&Value>,
) -> Result<OutputPropertySet, JobError> {
    let mut output = if forward {
        forward_parameters(inputs)
    } else {
        BTreeMap::new()
    };

    match raw.filter(|value| !value.is_null()) {
        None if check_output => {
            return Err(JobError::Output("script didn't generate output".to_string()));
        }
        None => info!("script didn't generate output"),
        Some(Value::Object(entries)) => {
            for (key, value) in entries {
                output.insert(key.clone(), stringify(value));
            }
        }
        Some(other) => {
            let msg = format!(
                "script didn't generate a valid output ({}): {}",
                kind_name(other),
                other
            );
            if check_output {
                return Err(JobError::Output(msg));
            }
            warn!("{msg}");
        }
    }

    Ok(OutputPropertySet::from_map(output))
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

//! Writing the generated property set back to the host.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

/// Serialize `value` to pretty-printed JSON with trailing newline.
pub fn to_json_string<T: Serialize>(value: &T) -> Result<String> {
    let mut payload = serde_json::to_string_pretty(value).context("serialize json")?;
    payload.push('\n');
    Ok(payload)
}

/// Write `value` as pretty JSON to `path`, creating parent directories.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let payload = to_json_string(value)?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, payload).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::OutputPropertySet;
    use std::collections::BTreeMap;

    #[test]
    fn output_is_a_flat_object_with_trailing_newline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("out/props.json");
        let mut entries = BTreeMap::new();
        entries.insert("flow.skip".to_string(), "true".to_string());
        write_json(&path, &OutputPropertySet::from_map(entries)).expect("write");

        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.ends_with("}\n"));
        let parsed: BTreeMap<String, String> = serde_json::from_str(&raw).expect("parse");
        assert_eq!(parsed.get("flow.skip").map(String::as_str), Some("true"));
    }
}

//! Layered string-keyed configuration.
//!
//! A [`ParameterSet`] is a chain of key/value layers: lookups consult the local
//! layer first, then each parent in turn, so a child always shadows its parent.
//! Sets are built once per invocation and only read afterwards; derived sets
//! (flattened, resolved) are always fresh values.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::core::error::JobError;

static VARIABLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z0-9_.\-]+)\}").unwrap());

/// Layered configuration with parent-fallback lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSet {
    entries: BTreeMap<String, String>,
    parent: Option<Arc<ParameterSet>>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-layer set from an owned mapping.
    pub fn from_map(entries: BTreeMap<String, String>) -> Self {
        Self {
            entries,
            parent: None,
        }
    }

    /// Layer `entries` over `parent`.
    pub fn with_parent(entries: BTreeMap<String, String>, parent: ParameterSet) -> Self {
        Self {
            entries,
            parent: Some(Arc::new(parent)),
        }
    }

    /// Convenience constructor for literal pairs.
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Set a local entry. Only meaningful while the set is being built.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn parent(&self) -> Option<&ParameterSet> {
        self.parent.as_deref()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Effective value of `key`: local layer first, then the parent chain.
    pub fn get(&self, key: &str) -> Option<&str> {
        let mut layer = Some(self);
        while let Some(set) = layer {
            if let Some(value) = set.entries.get(key) {
                return Some(value.as_str());
            }
            layer = set.parent.as_deref();
        }
        None
    }

    /// Value of `key`, failing when it is absent or empty.
    pub fn get_required(&self, key: &str) -> Result<&str, JobError> {
        match self.get(key) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(JobError::config(format!(
                "no property with key '{key}' has been found"
            ))),
        }
    }

    /// Integer value of `key`, or `default` when absent.
    ///
    /// A present but malformed value is an error, never the default.
    pub fn get_int(&self, key: &str, default: i64) -> Result<i64, JobError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse::<i64>().map_err(|_| {
                JobError::config(format!("invalid integer '{raw}' for key '{key}'"))
            }),
        }
    }

    /// Boolean value of `key` (`true`/`false`, any case), or `default` when absent.
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, JobError> {
        let Some(raw) = self.get(key) else {
            return Ok(default);
        };
        let value = raw.trim();
        if value.eq_ignore_ascii_case("true") {
            Ok(true)
        } else if value.eq_ignore_ascii_case("false") {
            Ok(false)
        } else {
            Err(JobError::config(format!(
                "invalid boolean '{raw}' for key '{key}'"
            )))
        }
    }

    /// Single-level mapping of every reachable key to its effective value.
    pub fn flatten(&self) -> BTreeMap<String, String> {
        let mut layers = Vec::new();
        let mut layer = Some(self);
        while let Some(set) = layer {
            layers.push(set);
            layer = set.parent.as_deref();
        }

        let mut flat = BTreeMap::new();
        for set in layers.iter().rev() {
            for (key, value) in &set.entries {
                flat.insert(key.clone(), value.clone());
            }
        }
        flat
    }

    /// Copy of the chain with every `${name}` reference substituted.
    ///
    /// References are looked up through the whole chain as seen from this
    /// layer and resolved recursively. Unknown names and cycles are errors.
    pub fn resolve(&self) -> Result<ParameterSet, JobError> {
        self.resolve_layer(self)
    }

    fn resolve_layer(&self, view: &ParameterSet) -> Result<ParameterSet, JobError> {
        let parent = match &self.parent {
            Some(parent) => Some(Arc::new(parent.resolve_layer(view)?)),
            None => None,
        };
        let mut entries = BTreeMap::new();
        for (key, value) in &self.entries {
            let resolved = view.resolve_value(key, value, &mut Vec::new())?;
            entries.insert(key.clone(), resolved);
        }
        Ok(ParameterSet { entries, parent })
    }

    fn resolve_value(
        &self,
        key: &str,
        value: &str,
        visiting: &mut Vec<String>,
    ) -> Result<String, JobError> {
        if visiting.iter().any(|seen| seen == key) {
            visiting.push(key.to_string());
            return Err(JobError::config(format!(
                "circular property definition: {}",
                visiting.join(" -> ")
            )));
        }
        visiting.push(key.to_string());

        let mut out = String::with_capacity(value.len());
        let mut last = 0;
        for caps in VARIABLE_RE.captures_iter(value) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let name = name.as_str();
            out.push_str(&value[last..whole.start()]);
            let raw = self.get(name).ok_or_else(|| {
                JobError::config(format!(
                    "could not find variable substitution for '${{{name}}}' in key '{key}'"
                ))
            })?;
            out.push_str(&self.resolve_value(name, raw, visiting)?);
            last = whole.end();
        }
        out.push_str(&value[last..]);

        visiting.pop();
        Ok(out)
    }
}

impl FromIterator<(String, String)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn chain() -> ParameterSet {
        let root = ParameterSet::from_pairs(&[("a", "root-a"), ("b", "root-b"), ("r", "only-root")]);
        let mid = ParameterSet::with_parent(map(&[("b", "mid-b"), ("c", "mid-c")]), root);
        ParameterSet::with_parent(map(&[("c", "leaf-c"), ("d", "leaf-d")]), mid)
    }

    #[test]
    fn get_prefers_child_and_falls_back_to_parent() {
        let set = chain();
        assert_eq!(set.get("a"), Some("root-a"));
        assert_eq!(set.get("b"), Some("mid-b"));
        assert_eq!(set.get("c"), Some("leaf-c"));
        assert_eq!(set.get("d"), Some("leaf-d"));
        assert_eq!(set.get("missing"), None);
    }

    #[test]
    fn flatten_agrees_with_get_for_every_key() {
        let set = chain();
        let flat = set.flatten();
        assert_eq!(flat.len(), 5);
        for (key, value) in &flat {
            assert_eq!(set.get(key), Some(value.as_str()), "key {key}");
        }
    }

    #[test]
    fn flatten_does_not_touch_source() {
        let set = chain();
        let before = set.clone();
        let mut flat = set.flatten();
        flat.insert("a".to_string(), "changed".to_string());
        assert_eq!(set, before);
    }

    #[test]
    fn get_int_parses_and_defaults() {
        let set = ParameterSet::from_pairs(&[("n", " 42 "), ("neg", "-3")]);
        assert_eq!(set.get_int("n", 0).expect("int"), 42);
        assert_eq!(set.get_int("neg", 0).expect("int"), -3);
        assert_eq!(set.get_int("absent", 7).expect("int"), 7);
    }

    #[test]
    fn get_int_rejects_malformed_value_instead_of_defaulting() {
        let set = ParameterSet::from_pairs(&[("script.timeout", "ten")]);
        let err = set.get_int("script.timeout", 0).unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, JobError::Configuration(_)));
        assert!(msg.contains("script.timeout"));
        assert!(msg.contains("ten"));
    }

    #[test]
    fn get_bool_accepts_any_case_and_rejects_garbage() {
        let set = ParameterSet::from_pairs(&[("yes", "TRUE"), ("no", "False"), ("bad", "maybe")]);
        assert!(set.get_bool("yes", false).expect("bool"));
        assert!(!set.get_bool("no", true).expect("bool"));
        assert!(set.get_bool("absent", true).expect("bool"));
        assert!(set.get_bool("bad", false).is_err());
    }

    #[test]
    fn get_required_rejects_absent_and_empty() {
        let set = ParameterSet::from_pairs(&[("empty", "")]);
        assert!(set.get_required("empty").is_err());
        assert!(set.get_required("absent").is_err());
    }

    #[test]
    fn resolve_substitutes_through_the_chain() {
        let parent = ParameterSet::from_pairs(&[("base", "/data"), ("name", "${env}-job")]);
        let child =
            ParameterSet::with_parent(map(&[("env", "prod"), ("out", "${base}/${name}/out")]), parent);

        let resolved = child.resolve().expect("resolve");
        assert_eq!(resolved.get("out"), Some("/data/prod-job/out"));
        assert_eq!(resolved.get("name"), Some("prod-job"));
        assert!(resolved.parent().is_some());
        assert_eq!(child.get("out"), Some("${base}/${name}/out"));
    }

    #[test]
    fn resolve_reports_unknown_variable() {
        let set = ParameterSet::from_pairs(&[("out", "${nowhere}/x")]);
        let err = set.resolve().unwrap_err();
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn resolve_reports_cycles() {
        let set = ParameterSet::from_pairs(&[("a", "${b}"), ("b", "${a}")]);
        let err = set.resolve().unwrap_err();
        assert!(err.to_string().contains("circular"));
    }

    #[test]
    fn resolve_leaves_plain_dollar_signs_alone() {
        let set = ParameterSet::from_pairs(&[("price", "$5 and ${unterminated")]);
        let resolved = set.resolve().expect("resolve");
        assert_eq!(resolved.get("price"), Some("$5 and ${unterminated"));
    }
}

//! Tiered evaluation of boolean precondition entries.
//!
//! A condition may be a step-id regex (`/pattern/`), an expression over the
//! flattened configuration, an integer, or a truthy literal. Tiers are tried in
//! that order and the first one that yields an answer wins; a tier that cannot
//! answer (bad regex, no match, expression error) falls through to the next.

use std::collections::BTreeMap;

use minijinja::value::ValueKind;
use minijinja::{Environment, Value, context};
use regex::Regex;
use tracing::debug;

const TRUTHY_LITERALS: [&str; 5] = ["true", "yes", "ok", "y", "t"];

/// Outcome of one evaluation tier.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Tier {
    /// The tier produced a final answer.
    Decided(bool),
    /// The tier could not decide; continue with the (possibly replaced) raw value.
    FallThrough,
    /// The expression produced a string that replaces the raw value.
    Replaced(String),
}

/// Evaluate `raw` as a boolean condition for `step_id`.
///
/// `config` is the flattened configuration exposed to expressions as `config`.
pub fn is_true(raw: &str, step_id: &str, config: &BTreeMap<String, String>) -> bool {
    if let Tier::Decided(answer) = regex_tier(raw, step_id) {
        return answer;
    }

    let mut current = raw.to_string();
    match expression_tier(raw, config) {
        Tier::Decided(answer) => return answer,
        Tier::Replaced(replacement) => current = replacement,
        Tier::FallThrough => {}
    }

    if current.is_empty() {
        return false;
    }
    debug!(value = %current, "evaluating condition as literal");
    if let Ok(number) = current.parse::<i64>() {
        return number != 0;
    }
    TRUTHY_LITERALS
        .iter()
        .any(|literal| literal.eq_ignore_ascii_case(&current))
}

fn regex_tier(raw: &str, step_id: &str) -> Tier {
    let trimmed = raw.trim();
    if trimmed.len() <= 2 || !trimmed.starts_with('/') || !trimmed.ends_with('/') {
        return Tier::FallThrough;
    }
    let pattern = &trimmed[1..trimmed.len() - 1];
    match Regex::new(&format!("^(?:{pattern})$")) {
        Ok(re) if re.is_match(step_id) => {
            debug!(pattern, step_id, "condition matched step id");
            Tier::Decided(true)
        }
        Ok(_) => {
            debug!(pattern, step_id, "step id did not match condition regex");
            Tier::FallThrough
        }
        Err(err) => {
            debug!(pattern, err = %err, "condition regex failed to compile");
            Tier::FallThrough
        }
    }
}

fn expression_tier(raw: &str, config: &BTreeMap<String, String>) -> Tier {
    let env = Environment::new();
    let expr = match env.compile_expression(raw) {
        Ok(expr) => expr,
        Err(err) => {
            debug!(err = %err, "condition is not an expression");
            return Tier::FallThrough;
        }
    };
    let value = match expr.eval(context! { config => Value::from_serialize(config) }) {
        Ok(value) => value,
        Err(err) => {
            debug!(err = %err, "condition expression failed to evaluate");
            return Tier::FallThrough;
        }
    };
    debug!(result = %value, "evaluated condition expression");
    coerce(&value)
}

fn coerce(value: &Value) -> Tier {
    match value.kind() {
        ValueKind::Bool => Tier::Decided(value.is_true()),
        // Only whole numbers count; floats keep the raw value for the literal tiers.
        ValueKind::Number => match value.to_string().parse::<i64>() {
            Ok(number) => Tier::Decided(number != 0),
            Err(_) => Tier::FallThrough,
        },
        ValueKind::String => match value.as_str() {
            Some(text) => Tier::Replaced(text.to_string()),
            None => Tier::FallThrough,
        },
        _ => Tier::FallThrough,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn eval(raw: &str) -> bool {
        is_true(raw, "stepA", &BTreeMap::new())
    }

    #[test]
    fn regex_matches_step_id_exactly() {
        assert!(is_true("/^stepA$/", "stepA", &BTreeMap::new()));
        assert!(is_true("/step.*/", "stepA", &BTreeMap::new()));
        assert!(!is_true("/^stepA$/", "stepB", &BTreeMap::new()));
        assert!(!is_true("/step/", "stepA", &BTreeMap::new()));
    }

    #[test]
    fn regex_compile_error_falls_through() {
        assert!(!is_true("/([/", "stepA", &BTreeMap::new()));
    }

    #[test]
    fn short_slash_values_are_not_regexes() {
        assert!(!eval("//"));
        assert!(!eval("/"));
    }

    #[test]
    fn expression_can_reference_config() {
        let cfg = config(&[("env", "prod"), ("retries", "3")]);
        assert!(is_true("config.env == 'prod'", "s", &cfg));
        assert!(!is_true("config.env == 'dev'", "s", &cfg));
        assert!(is_true("config['retries'] | int > 2", "s", &cfg));
    }

    #[test]
    fn expression_integer_result_is_truthy_iff_nonzero() {
        assert!(eval("1"));
        assert!(eval("2 - 1"));
        assert!(!eval("0"));
        assert!(!eval("1 - 1"));
    }

    #[test]
    fn expression_string_result_replaces_raw_value() {
        let cfg = config(&[("flag", "yes"), ("count", "5"), ("off", "nope")]);
        assert!(is_true("config.flag", "s", &cfg));
        assert!(is_true("config.count", "s", &cfg));
        assert!(!is_true("config.off", "s", &cfg));
    }

    #[test]
    fn truthy_literals_are_case_insensitive() {
        for raw in ["true", "TRUE", "Yes", "ok", "Y", "t"] {
            assert!(eval(raw), "{raw} should be true");
        }
        for raw in ["", "false", "no", "n", "maybe", "nonsense value"] {
            assert!(!eval(raw), "{raw} should be false");
        }
    }

    #[test]
    fn float_results_do_not_count_as_integers() {
        assert!(!eval("1.5"));
    }
}

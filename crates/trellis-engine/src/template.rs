//! `{{input.PATH}}` template resolution against the accumulated context.
//!
//! Resolution is pure and total: a missing path becomes the literal string
//! `undefined` so optional upstream fields never fail a node.

use serde_json::Value;

use trellis_core::error::{Result, TrellisError};

/// Look up a dot-separated path ("input.user.name", "input.items.0")
/// in the context. The root segment must be `input`.
pub fn lookup_path(input: &Value, path: &str) -> Option<Value> {
    let mut parts = path.split('.');
    match parts.next().map(str::trim) {
        Some("input") => {}
        _ => return None,
    }

    let mut current = input;
    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            return None;
        }
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace every `{{...}}` occurrence in `text` with the stringified value
/// at that path. Missing paths become the literal `undefined`; an unclosed
/// `{{` is kept as plain text.
pub fn resolve_text(text: &str, input: &Value) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let path = after[..end].trim();
                match lookup_path(input, path) {
                    Some(value) => result.push_str(&stringify(&value)),
                    None => result.push_str("undefined"),
                }
                rest = &after[end + 2..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

/// Resolve a config field that may be a single template.
///
/// A field that is exactly one `{{...}}` yields the raw JSON value at that
/// path, so numbers stay numbers for comparison and ledger recording.
/// Anything else is resolved as interpolated text.
pub fn resolve_value(text: &str, input: &Value) -> Value {
    let trimmed = text.trim();
    if trimmed.len() >= 4 && trimmed.starts_with("{{") && trimmed.ends_with("}}") {
        let inner = &trimmed[2..trimmed.len() - 2];
        if !inner.contains("{{") && !inner.contains("}}") {
            return lookup_path(input, inner.trim())
                .unwrap_or_else(|| Value::String("undefined".into()));
        }
    }
    Value::String(resolve_text(text, input))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn apply<T: PartialOrd + PartialEq>(lhs: T, rhs: T, operator: &str) -> Result<bool> {
    Ok(match operator {
        "=" => lhs == rhs,
        "!=" => lhs != rhs,
        "<" => lhs < rhs,
        ">" => lhs > rhs,
        "<=" => lhs <= rhs,
        ">=" => lhs >= rhs,
        _ => {
            return Err(TrellisError::Template(format!(
                "unsupported operator: {}",
                operator
            )))
        }
    })
}

/// Compare two resolved values: numerically when both parse as numbers,
/// otherwise as strings.
pub fn compare(lhs: &Value, operator: &str, rhs: &Value) -> Result<bool> {
    if let (Some(l), Some(r)) = (as_number(lhs), as_number(rhs)) {
        return apply(l, r, operator);
    }
    apply(stringify(lhs), stringify(rhs), operator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_nested_paths() {
        let input = json!({"user": {"name": "Ada"}, "items": [10, 20]});
        assert_eq!(
            resolve_text("Hello {{input.user.name}}!", &input),
            "Hello Ada!"
        );
        assert_eq!(resolve_text("first: {{input.items.0}}", &input), "first: 10");
    }

    #[test]
    fn missing_paths_become_undefined() {
        let input = json!({"a": 1});
        assert_eq!(resolve_text("{{input.b}}", &input), "undefined");
        assert_eq!(resolve_text("x={{input.a.b.c}}", &input), "x=undefined");
        // Unknown root is a missing path too
        assert_eq!(resolve_text("{{output.a}}", &input), "undefined");
    }

    #[test]
    fn plain_text_passes_through() {
        let input = json!({});
        assert_eq!(resolve_text("no templates here", &input), "no templates here");
        assert_eq!(resolve_text("unclosed {{input.a", &input), "unclosed {{input.a");
    }

    #[test]
    fn multiple_occurrences() {
        let input = json!({"a": "x", "b": 2});
        assert_eq!(resolve_text("{{input.a}}-{{input.b}}-{{input.a}}", &input), "x-2-x");
    }

    #[test]
    fn whole_template_keeps_raw_value() {
        let input = json!({"age": 21, "flag": true});
        assert_eq!(resolve_value("{{input.age}}", &input), json!(21));
        assert_eq!(resolve_value(" {{ input.flag }} ", &input), json!(true));
        assert_eq!(resolve_value("{{input.missing}}", &input), json!("undefined"));
        // Mixed text stays a string
        assert_eq!(resolve_value("age={{input.age}}", &input), json!("age=21"));
        // A literal stays a literal
        assert_eq!(resolve_value("18", &input), json!("18"));
    }

    #[test]
    fn numeric_comparison() {
        assert!(compare(&json!(21), ">", &json!("18")).expect("cmp"));
        assert!(compare(&json!("3.5"), "<=", &json!(4)).expect("cmp"));
        assert!(!compare(&json!(2), "=", &json!(3)).expect("cmp"));
        assert!(compare(&json!(2), "!=", &json!(3)).expect("cmp"));
    }

    #[test]
    fn string_comparison_when_not_numeric() {
        assert!(compare(&json!("apple"), "<", &json!("banana")).expect("cmp"));
        assert!(compare(&json!("same"), "=", &json!("same")).expect("cmp"));
        // One numeric side is not enough
        assert!(!compare(&json!("5"), "=", &json!("five")).expect("cmp"));
    }

    #[test]
    fn unknown_operator_errors() {
        assert!(compare(&json!(1), "<=>", &json!(2)).is_err());
    }
}

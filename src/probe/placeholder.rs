//! Placeholder substitution for API job steps.
//!
//! A token is `{{ stepName(.key)* }}`. The first path segment selects a
//! prior step's raw response from the response map; each further
//! segment decodes the current value as a JSON object and descends one
//! level. The leaf is substituted as raw JSON text, so a string value
//! keeps its quotes.

use crate::error::{Error, Result};

use regex::Regex;
use serde_json::value::RawValue;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Step name -> raw response body for one API execution cycle.
pub type ResponseMap = HashMap<String, String>;

static TOKEN_RE: OnceLock<Regex> = OnceLock::new();

fn token_re() -> &'static Regex {
    TOKEN_RE.get_or_init(|| Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").unwrap())
}

/// Substitute every placeholder token in `text` against `map`.
///
/// Substitution is single-pass: a substituted value that itself looks
/// like a placeholder is not re-evaluated. Text without tokens
/// round-trips unchanged.
pub fn resolve(text: &str, map: &ResponseMap) -> Result<String> {
    let re = token_re();

    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for caps in re.captures_iter(text) {
        let whole = caps.get(0).unwrap();
        let key = caps.get(1).unwrap().as_str();

        out.push_str(&text[last..whole.start()]);
        out.push_str(&response_value(key, map)?);
        last = whole.end();
    }

    out.push_str(&text[last..]);
    Ok(out)
}

/// Look up a dotted path like `step1.key.subkey` in the response map.
///
/// A JSON field name containing `.` is unreachable through this syntax.
fn response_value(key: &str, map: &ResponseMap) -> Result<String> {
    let mut segments = key.split('.');
    let step = segments.next().unwrap_or_default();

    let mut current = map
        .get(step)
        .ok_or_else(|| Error::PlaceholderResolution(format!("no response for step {:?}", step)))?
        .clone();

    for segment in segments {
        let object: HashMap<String, Box<RawValue>> =
            serde_json::from_str(&current).map_err(|e| {
                Error::PlaceholderResolution(format!(
                    "value at {:?} is not a JSON object: {}",
                    key, e
                ))
            })?;

        current = object
            .get(segment)
            .ok_or_else(|| {
                Error::PlaceholderResolution(format!("key {:?} not found in {:?}", segment, key))
            })?
            .get()
            .to_string();
    }

    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> ResponseMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_no_placeholders_round_trip() {
        let m = map(&[]);
        assert_eq!(resolve("plain text", &m).unwrap(), "plain text");
        assert_eq!(resolve("", &m).unwrap(), "");
    }

    #[test]
    fn test_nested_lookup_keeps_raw_json() {
        let m = map(&[("step1", r#"{"a":{"b":"c"}}"#)]);
        assert_eq!(resolve("{{ step1.a.b }}", &m).unwrap(), r#""c""#);
    }

    #[test]
    fn test_whole_response_substitution() {
        let m = map(&[("step1", r#"{"token":"abc"}"#)]);
        assert_eq!(
            resolve("{{ step1 }}", &m).unwrap(),
            r#"{"token":"abc"}"#
        );
    }

    #[test]
    fn test_substitution_inside_body() {
        let m = map(&[("step1", r#"{"token":"abc"}"#)]);
        assert_eq!(
            resolve(r#"{"t":"{{ step1.token }}"}"#, &m).unwrap(),
            r#"{"t":""abc""}"#
        );
    }

    #[test]
    fn test_numeric_leaf() {
        let m = map(&[("s", r#"{"count":42}"#)]);
        assert_eq!(resolve("n={{ s.count }}", &m).unwrap(), "n=42");
    }

    #[test]
    fn test_missing_step_fails() {
        let m = map(&[]);
        let err = resolve("{{ nope.key }}", &m).unwrap_err();
        assert!(matches!(err, Error::PlaceholderResolution(_)));
    }

    #[test]
    fn test_descent_through_non_object_fails() {
        let m = map(&[("s", r#"{"a":[1,2]}"#)]);
        assert!(resolve("{{ s.a.b }}", &m).is_err());
        let m2 = map(&[("s", "not json")]);
        assert!(resolve("{{ s.a }}", &m2).is_err());
    }

    #[test]
    fn test_single_pass() {
        // A substituted value that looks like a token is not re-resolved.
        let m = map(&[
            ("s", r#"{"a":"{{ s.b }}","b":"x"}"#),
        ]);
        assert_eq!(resolve("{{ s.a }}", &m).unwrap(), r#""{{ s.b }}""#);
    }

    #[test]
    fn test_tight_and_spaced_tokens() {
        let m = map(&[("s", r#"{"k":"v"}"#)]);
        assert_eq!(resolve("{{s.k}}", &m).unwrap(), r#""v""#);
        assert_eq!(resolve("{{   s.k   }}", &m).unwrap(), r#""v""#);
    }

    #[test]
    fn test_multiple_tokens() {
        let m = map(&[("a", r#"{"x":1}"#), ("b", r#"{"y":2}"#)]);
        assert_eq!(
            resolve("{{ a.x }} and {{ b.y }}", &m).unwrap(),
            "1 and 2"
        );
    }
}

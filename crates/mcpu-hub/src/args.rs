//! Argument assembly for `call`: turn `--key=value` flags (with optional
//! `:type` conversions) or piped stdin JSON into the tool's argument object.
//!
//! Unknown keys are forwarded verbatim; the child validates against its own
//! schema.

use serde_json::{Map, Value};

use mcpu_core::CoreError;

/// Build the `tools/call` argument object.
///
/// Exactly one source may be used: piped stdin JSON (taken as the object
/// directly) or inline `--key=value` flags.
pub fn build_call_arguments(
    flags: &[String],
    stdin_data: Option<&str>,
) -> Result<Value, CoreError> {
    if let Some(raw) = stdin_data {
        if !flags.is_empty() {
            return Err(CoreError::Validation(
                "cannot combine piped stdin arguments with --key=value flags".to_string(),
            ));
        }
        let value: Value = serde_json::from_str(raw).map_err(|error| {
            CoreError::Validation(format!("stdin is not valid JSON: {error}"))
        })?;
        if !value.is_object() {
            return Err(CoreError::Validation(
                "stdin arguments must be a JSON object".to_string(),
            ));
        }
        return Ok(value);
    }

    let mut arguments = Map::new();
    for flag in flags {
        let (key, value) = parse_flag(flag)?;
        merge_argument(&mut arguments, key, value);
    }
    Ok(Value::Object(arguments))
}

/// Parse one `--key=value`, `--key:type=value` flag.
fn parse_flag(flag: &str) -> Result<(String, Value), CoreError> {
    let body = flag.strip_prefix("--").ok_or_else(|| {
        CoreError::Validation(format!(
            "unexpected argument '{flag}' (expected --key=value)"
        ))
    })?;
    let (key_part, raw_value) = body.split_once('=').ok_or_else(|| {
        CoreError::Validation(format!("missing '=' in argument '--{body}'"))
    })?;

    let (key, type_hint) = match key_part.split_once(':') {
        Some((key, hint)) => (key, Some(hint)),
        None => (key_part, None),
    };
    if key.is_empty() {
        return Err(CoreError::Validation(format!(
            "empty key in argument '{flag}'"
        )));
    }

    let value = match type_hint {
        None | Some("string") => Value::String(raw_value.to_string()),
        Some("number") => parse_number(key, raw_value)?,
        Some("boolean") => match raw_value {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            other => {
                return Err(CoreError::Validation(format!(
                    "argument '--{key}:boolean' expects true or false, got '{other}'"
                )));
            }
        },
        Some("json") => serde_json::from_str(raw_value).map_err(|error| {
            CoreError::Validation(format!("argument '--{key}:json' is not valid JSON: {error}"))
        })?,
        Some(other) => {
            return Err(CoreError::Validation(format!(
                "unknown type '{other}' in argument '--{key_part}' (expected: string, number, boolean, json)"
            )));
        }
    };

    Ok((key.to_string(), value))
}

fn parse_number(key: &str, raw: &str) -> Result<Value, CoreError> {
    if let Ok(int) = raw.parse::<i64>() {
        return Ok(Value::from(int));
    }
    raw.parse::<f64>()
        .ok()
        .and_then(|float| serde_json::Number::from_f64(float).map(Value::Number))
        .ok_or_else(|| {
            CoreError::Validation(format!(
                "argument '--{key}:number' is not a number: '{raw}'"
            ))
        })
}

/// A repeated key collects its values into an array.
fn merge_argument(arguments: &mut Map<String, Value>, key: String, value: Value) {
    match arguments.get_mut(&key) {
        None => {
            arguments.insert(key, value);
        }
        Some(Value::Array(items)) => {
            items.push(value);
        }
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flags(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plain_flags_are_strings() {
        let args = build_call_arguments(&flags(&["--path=/tmp", "--query=rust"]), None).unwrap();
        assert_eq!(args, json!({"path": "/tmp", "query": "rust"}));
    }

    #[test]
    fn test_typed_conversions() {
        let args = build_call_arguments(
            &flags(&[
                "--count:number=3",
                "--ratio:number=0.5",
                "--deep:boolean=true",
                "--filter:json={\"a\":[1,2]}",
            ]),
            None,
        )
        .unwrap();
        assert_eq!(
            args,
            json!({"count": 3, "ratio": 0.5, "deep": true, "filter": {"a": [1, 2]}})
        );
    }

    #[test]
    fn test_repeated_key_builds_array() {
        let args =
            build_call_arguments(&flags(&["--tag=a", "--tag=b", "--tag=c"]), None).unwrap();
        assert_eq!(args, json!({"tag": ["a", "b", "c"]}));
    }

    #[test]
    fn test_value_may_contain_equals() {
        let args = build_call_arguments(&flags(&["--expr=a=b"]), None).unwrap();
        assert_eq!(args, json!({"expr": "a=b"}));
    }

    #[test]
    fn test_stdin_object_is_used_directly() {
        let args = build_call_arguments(&[], Some("{\"x\":1}")).unwrap();
        assert_eq!(args, json!({"x": 1}));
    }

    #[test]
    fn test_stdin_conflicts_with_flags() {
        let error = build_call_arguments(&flags(&["--x=1"]), Some("{}"))
            .err()
            .unwrap();
        assert_eq!(error.kind(), "validation");
        assert!(error.to_string().contains("cannot combine"));
    }

    #[test]
    fn test_stdin_must_be_an_object() {
        let error = build_call_arguments(&[], Some("[1,2]")).err().unwrap();
        assert_eq!(error.kind(), "validation");
    }

    #[test]
    fn test_invalid_flags_are_validation_errors() {
        assert!(build_call_arguments(&flags(&["positional"]), None).is_err());
        assert!(build_call_arguments(&flags(&["--flag"]), None).is_err());
        assert!(build_call_arguments(&flags(&["--n:number=abc"]), None).is_err());
        assert!(build_call_arguments(&flags(&["--b:boolean=yes"]), None).is_err());
        assert!(build_call_arguments(&flags(&["--j:json={"]), None).is_err());
        assert!(build_call_arguments(&flags(&["--k:blob=1"]), None).is_err());
    }

    #[test]
    fn test_number_integers_stay_integers() {
        let args = build_call_arguments(&flags(&["--n:number=42"]), None).unwrap();
        assert!(args["n"].is_i64());
    }
}

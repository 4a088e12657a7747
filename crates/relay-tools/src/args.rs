//! Strict argument extraction for tool calls.
//!
//! Arguments arrive as a JSON object of strings. Integer-valued inputs
//! are parsed from their string form with explicit bounds; parse failures
//! surface as invalid-argument errors.

use relay_protocol::{RelayError, RelayResult};
use serde_json::Value;

const MAX_LIMIT: usize = 500;
const MAX_INT: i64 = 1_000_000;

fn raw(args: &Value, name: &str) -> Option<String> {
    match args.get(name)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        _ => None,
    }
}

/// Trimmed string argument, `None` when absent or blank.
pub(crate) fn optional_str(args: &Value, name: &str) -> Option<String> {
    raw(args, name)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

/// Untrimmed string argument, empty when absent.
pub(crate) fn raw_str(args: &Value, name: &str) -> String {
    raw(args, name).unwrap_or_default()
}

/// Required, non-blank string argument.
pub(crate) fn required_str(args: &Value, name: &str) -> RelayResult<String> {
    optional_str(args, name)
        .ok_or_else(|| RelayError::InvalidArgument(format!("{name} is required")))
}

fn parse_int(args: &Value, name: &str) -> RelayResult<Option<i64>> {
    let Some(raw) = raw(args, name) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let parsed: i64 = trimmed
        .parse()
        .map_err(|_| RelayError::InvalidArgument(format!("invalid {name}: {trimmed}")))?;
    if !(-MAX_INT..=MAX_INT).contains(&parsed) {
        return Err(RelayError::InvalidArgument(format!(
            "invalid {name}: {trimmed} (out of range)"
        )));
    }
    Ok(Some(parsed))
}

/// Result-size argument: absent, blank, or non-positive falls back to
/// `default`; anything above the cap is clamped.
pub(crate) fn limit_arg(args: &Value, name: &str, default: usize) -> RelayResult<usize> {
    let Some(parsed) = parse_int(args, name)? else {
        return Ok(default);
    };
    if parsed <= 0 {
        return Ok(default);
    }
    Ok((parsed as usize).min(MAX_LIMIT))
}

/// Plain bounded integer argument with a default for absent values.
/// Zero and negatives are preserved, unlike [`limit_arg`].
pub(crate) fn int_arg(args: &Value, name: &str, default: i64) -> RelayResult<i64> {
    Ok(parse_int(args, name)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn strings_are_trimmed_and_blank_means_absent() {
        let args = json!({"name": "  alice  ", "blank": "   "});
        assert_eq!(optional_str(&args, "name").as_deref(), Some("alice"));
        assert!(optional_str(&args, "blank").is_none());
        assert!(optional_str(&args, "missing").is_none());
        assert!(required_str(&args, "blank").is_err());
    }

    #[test]
    fn limits_parse_with_defaults_and_caps() {
        assert_eq!(limit_arg(&json!({}), "max", 10).unwrap(), 10);
        assert_eq!(limit_arg(&json!({"max": "25"}), "max", 10).unwrap(), 25);
        assert_eq!(limit_arg(&json!({"max": "0"}), "max", 10).unwrap(), 10);
        assert_eq!(limit_arg(&json!({"max": "9999"}), "max", 10).unwrap(), 500);
        assert_eq!(limit_arg(&json!({"max": 7}), "max", 10).unwrap(), 7);

        let err = limit_arg(&json!({"max": "lots"}), "max", 10).unwrap_err();
        assert!(err.to_string().contains("invalid max: lots"));
        assert_eq!(limit_arg(&json!({"max": "-3"}), "max", 10).unwrap(), 10);
    }

    #[test]
    fn int_arg_preserves_zero() {
        assert_eq!(int_arg(&json!({}), "min_count", 2).unwrap(), 2);
        assert_eq!(int_arg(&json!({"min_count": "0"}), "min_count", 2).unwrap(), 0);
        assert_eq!(int_arg(&json!({"min_count": "5"}), "min_count", 2).unwrap(), 5);
    }
}

//! Loose-to-typed value coercion
//!
//! Incoming control values arrive as whatever JSON (or environment string)
//! the client sent. They are converted to the JSON type of the field they
//! replace before being applied.

use serde_json::{Number, Value};

/// Truthy strings: `1`, `true`, `yes`, `y`, `on` (case-insensitive).
pub fn parse_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

fn is_integer(n: &Number) -> bool {
    n.is_i64() || n.is_u64()
}

fn to_integer(value: &Value) -> Option<Value> {
    match value {
        Value::Number(n) if is_integer(n) => Some(Value::Number(n.clone())),
        Value::Number(n) => n
            .as_f64()
            .filter(|f| f.is_finite() && f.fract() == 0.0)
            .map(|f| Value::from(f as i64)),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                Some(Value::from(i))
            } else if let Ok(u) = s.parse::<u64>() {
                Some(Value::from(u))
            } else {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite() && f.fract() == 0.0)
                    .map(|f| Value::from(f as i64))
            }
        }
        _ => None,
    }
}

fn to_float(value: &Value) -> Option<Value> {
    let f = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    Number::from_f64(f).map(Value::Number)
}

/// Convert `incoming` to the JSON type of `current`.
///
/// Returns `None` when the value cannot be interpreted as that type.
pub fn coerce_like(current: &Value, incoming: &Value) -> Option<Value> {
    match current {
        Value::Bool(_) => match incoming {
            Value::Bool(b) => Some(Value::Bool(*b)),
            Value::String(s) => Some(Value::Bool(parse_truthy(s))),
            Value::Number(n) => Some(Value::Bool(n.as_f64().is_some_and(|f| f != 0.0))),
            _ => None,
        },
        Value::Number(n) if is_integer(n) => to_integer(incoming),
        Value::Number(_) => to_float(incoming),
        Value::String(_) => match incoming {
            Value::String(s) => Some(Value::String(s.clone())),
            Value::Number(n) => Some(Value::String(n.to_string())),
            Value::Bool(b) => Some(Value::String(b.to_string())),
            _ => None,
        },
        Value::Null => match incoming {
            Value::Null => None,
            other => Some(other.clone()),
        },
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// Render a value the way change records show it: strings unquoted.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

//! Tagged union for entity state and attribute values

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A state or attribute value as reported by the hub
///
/// The hub reports states as strings but attributes as arbitrary JSON. Both
/// map onto this union so that `to`/`from` filters can compare them without
/// falling back to untyped values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    #[default]
    Null,
    Bool(bool),
    /// Integral numbers serialize as JSON integers
    #[serde(serialize_with = "serialize_number")]
    Number(f64),
    Text(String),
    List(Vec<StateValue>),
    Map(BTreeMap<String, StateValue>),
}

impl StateValue {
    /// Numeric view of the value
    ///
    /// `Number` yields itself and `Text` yields a value when it parses as a
    /// finite float. Everything else, including `"unavailable"`, is `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StateValue::Number(n) if n.is_finite() => Some(*n),
            StateValue::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }

    /// Compare the way state filters compare
    ///
    /// Same variants compare structurally. A `Text` compares to a `Number`
    /// numerically and to a `Bool` by its `true`/`false` spelling.
    pub fn loosely_equals(&self, other: &StateValue) -> bool {
        match (self, other) {
            (StateValue::Text(_), StateValue::Number(n))
            | (StateValue::Number(n), StateValue::Text(_)) => {
                let text = if let StateValue::Text(_) = self { self } else { other };
                text.as_f64() == Some(*n)
            }
            (StateValue::Text(s), StateValue::Bool(b))
            | (StateValue::Bool(b), StateValue::Text(s)) => {
                s.trim().eq_ignore_ascii_case(if *b { "true" } else { "false" })
            }
            _ => self == other,
        }
    }
}

impl PartialEq for StateValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (StateValue::Null, StateValue::Null) => true,
            (StateValue::Bool(a), StateValue::Bool(b)) => a == b,
            (StateValue::Number(a), StateValue::Number(b)) => a == b,
            (StateValue::Text(a), StateValue::Text(b)) => a == b,
            (StateValue::List(a), StateValue::List(b)) => a == b,
            (StateValue::Map(a), StateValue::Map(b)) => a == b,
            _ => false,
        }
    }
}

/// `n` as an `i64` when it is integral and in range
fn integral(n: f64) -> Option<i64> {
    let in_range = n >= i64::MIN as f64 && n < i64::MAX as f64;
    (n.fract() == 0.0 && in_range).then_some(n as i64)
}

fn serialize_number<S: serde::Serializer>(n: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    match integral(*n) {
        Some(i) => serializer.serialize_i64(i),
        None => serializer.serialize_f64(*n),
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Null => Ok(()),
            StateValue::Bool(b) => write!(f, "{b}"),
            StateValue::Number(n) => write!(f, "{n}"),
            StateValue::Text(s) => f.write_str(s),
            StateValue::List(_) | StateValue::Map(_) => {
                let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}

impl From<&str> for StateValue {
    fn from(s: &str) -> Self {
        StateValue::Text(s.to_string())
    }
}

impl From<String> for StateValue {
    fn from(s: String) -> Self {
        StateValue::Text(s)
    }
}

impl From<bool> for StateValue {
    fn from(b: bool) -> Self {
        StateValue::Bool(b)
    }
}

impl From<f64> for StateValue {
    fn from(n: f64) -> Self {
        StateValue::Number(n)
    }
}

impl From<i64> for StateValue {
    fn from(n: i64) -> Self {
        StateValue::Number(n as f64)
    }
}

impl From<i32> for StateValue {
    fn from(n: i32) -> Self {
        StateValue::Number(f64::from(n))
    }
}

impl From<serde_json::Value> for StateValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => StateValue::Null,
            serde_json::Value::Bool(b) => StateValue::Bool(b),
            serde_json::Value::Number(n) => n.as_f64().map_or(StateValue::Null, StateValue::Number),
            serde_json::Value::String(s) => StateValue::Text(s),
            serde_json::Value::Array(items) => {
                StateValue::List(items.into_iter().map(StateValue::from).collect())
            }
            serde_json::Value::Object(map) => StateValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, StateValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<StateValue> for serde_json::Value {
    fn from(value: StateValue) -> Self {
        match value {
            StateValue::Null => serde_json::Value::Null,
            StateValue::Bool(b) => serde_json::Value::Bool(b),
            StateValue::Number(n) => match integral(n) {
                Some(i) => serde_json::Value::Number(i.into()),
                None => serde_json::Number::from_f64(n)
                    .map_or(serde_json::Value::Null, serde_json::Value::Number),
            },
            StateValue::Text(s) => serde_json::Value::String(s),
            StateValue::List(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            StateValue::Map(map) => serde_json::Value::Object(
                map.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

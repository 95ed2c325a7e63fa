//! Helpers for comparing and keying opaque attribute values.
//!
//! Attribute and id values are `serde_json::Value`s and the engine treats
//! them as opaque beyond equality and ordering. Two things live here: a
//! total order over values (used by attribute-keyed comparators) and the
//! canonical string form of an id value (used to key the id index — string
//! keying means an id of `1` and an id of `"1"` share a slot, the way a
//! keyed object map behaves).

use std::cmp::Ordering;

use serde_json::Value;

/// The canonical index key for an id value.
#[must_use]
pub fn id_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A total order over values: null < booleans < numbers < strings <
/// arrays < objects; same-kind values compare structurally. Numbers
/// compare as `f64` (JSON numbers are never NaN).
#[must_use]
pub fn value_cmp(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xv, yv) in x.iter().zip(y.iter()) {
                let ordering = value_cmp(xv, yv);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((xk, xv), (yk, yv)) in x.iter().zip(y.iter()) {
                let ordering = xk.cmp(yk).then_with(|| value_cmp(xv, yv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

/// As `value_cmp`, with a missing value ordered before any present one.
#[must_use]
pub fn optional_value_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => value_cmp(a, b),
    }
}

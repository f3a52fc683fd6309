//! Plain snapshot values.
//!
//! A [`Value`] is what observable state looks like with every wrapper
//! stripped: the input of [`diff`](crate::diff) and the payload of a
//! [`Patch`](crate::Patch). It serializes to the matching JSON shape.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A leaf value.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// Absent value.
    #[default]
    Null,
    /// A boolean.
    Bool(bool),
    /// A number. `NaN` compares equal to itself.
    Number(f64),
    /// A string.
    String(String),
}

impl Scalar {
    /// Same-value comparison: like `==`, except that `NaN` equals `NaN`.
    pub fn same_value(&self, other: &Scalar) -> bool {
        match (self, other) {
            (Scalar::Number(a), Scalar::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Scalar::Null, Scalar::Null) => true,
            (Scalar::Bool(a), Scalar::Bool(b)) => a == b,
            (Scalar::String(a), Scalar::String(b)) => a == b,
            _ => false,
        }
    }

    /// The number, if this is one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The string, if this is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::String(s) => Some(s),
            _ => None,
        }
    }

    /// The boolean, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Whether this is [`Scalar::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        self.same_value(other)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => f.write_str("null"),
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Number(n) => write!(f, "{n}"),
            Scalar::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Number(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Scalar::Number(f64::from(value))
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Number(value as f64)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::String(value.to_owned())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::String(value)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map_or(Scalar::Null, Into::into)
    }
}

/// A plain snapshot: a scalar leaf, an ordered sequence or a keyed record.
///
/// Record keys keep insertion order, so patches and serialized output are
/// deterministic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// A leaf.
    Scalar(Scalar),
    /// An ordered sequence.
    Sequence(Vec<Value>),
    /// A string-keyed record.
    Record(IndexMap<String, Value>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Scalar(Scalar::Null)
    }
}

impl Value {
    /// The null scalar.
    pub fn null() -> Self {
        Value::default()
    }

    /// An empty record.
    pub fn record() -> Self {
        Value::Record(IndexMap::new())
    }

    /// The record's entries, if this is a record.
    pub fn as_record(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Record(entries) => Some(entries),
            _ => None,
        }
    }

    /// The sequence's items, if this is a sequence.
    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::Sequence(items) => Some(items),
            _ => None,
        }
    }

    /// The leaf, if this is a scalar.
    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Value::Scalar(scalar) => Some(scalar),
            _ => None,
        }
    }

    /// Look up a record field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_record()?.get(key)
    }

    /// Parse a JSON document. Object keys keep document order.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to a JSON string. Non-finite numbers become `null`.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

macro_rules! scalar_value_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::Scalar(value.into())
                }
            }
        )*
    };
}

scalar_value_from!(bool, f64, i32, i64, &str, String);

impl From<Scalar> for Value {
    fn from(scalar: Scalar) -> Self {
        Value::Scalar(scalar)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Sequence(items)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(entries: IndexMap<String, Value>) -> Self {
        Value::Record(entries)
    }
}

impl FromIterator<(String, Value)> for Value {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Value::Record(iter.into_iter().collect())
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::null(),
            serde_json::Value::Bool(b) => b.into(),
            serde_json::Value::Number(n) => Value::Scalar(Scalar::Number(n.as_f64().unwrap_or(f64::NAN))),
            serde_json::Value::String(s) => s.into(),
            serde_json::Value::Array(items) => Value::Sequence(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(entries) => entries
                .into_iter()
                .map(|(key, value)| (key, Value::from(value)))
                .collect(),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Scalar(Scalar::Null) => serde_json::Value::Null,
            Value::Scalar(Scalar::Bool(b)) => serde_json::Value::Bool(b),
            Value::Scalar(Scalar::Number(n)) => {
                serde_json::Number::from_f64(n).map_or(serde_json::Value::Null, serde_json::Value::Number)
            }
            Value::Scalar(Scalar::String(s)) => serde_json::Value::String(s),
            Value::Sequence(items) => serde_json::Value::Array(items.into_iter().map(Into::into).collect()),
            Value::Record(entries) => serde_json::Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, value.into()))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nan_is_same_value_as_itself() {
        assert_eq!(Scalar::Number(f64::NAN), Scalar::Number(f64::NAN));
        assert_ne!(Scalar::Number(1.0), Scalar::String("1".into()));
        assert_eq!(Scalar::Number(0.0), Scalar::Number(-0.0));
    }

    #[test]
    fn json_conversion_keeps_shape_and_order() {
        let value = Value::from_json(r#"{"b": [1, "x", null], "a": {"flag": true}}"#).unwrap();
        let keys: Vec<&str> = value.as_record().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys, ["b", "a"]);
        assert_eq!(value.get("a").and_then(|a| a.get("flag")), Some(&Value::from(true)));
        assert_eq!(serde_json::Value::from(value), json!({"b": [1.0, "x", null], "a": {"flag": true}}));
    }

    #[test]
    fn json_text_keeps_key_order() {
        let value = Value::from_json(r#"{"title":"hi","items":[1,2]}"#).unwrap();
        let text = value.to_json().unwrap();
        assert_eq!(text, r#"{"title":"hi","items":[1.0,2.0]}"#);
        assert_eq!(Value::from_json(&text).unwrap(), value);
    }

    #[test]
    fn non_finite_numbers_serialize_as_null() {
        assert_eq!(serde_json::Value::from(Value::from(f64::INFINITY)), json!(null));
        assert_eq!(Value::from(f64::NAN).to_json().unwrap(), "null");
    }

    #[test]
    fn json_integers_become_numbers() {
        assert_eq!(Value::from(json!(3)), Value::from(3.0));
        assert_eq!(Value::from(json!([true])), Value::Sequence(vec![Value::from(true)]));
    }
}

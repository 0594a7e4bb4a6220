//! Attribute values stored in keygrid tables.
//!
//! `Value` is a closed sum over the attribute types the storage layer
//! supports: scalars, string/number sets, lists, and nested maps. Records
//! and keys are open `field name -> Value` mappings (the [`Fields`] alias).
//!
//! `Value` carries a deterministic total order (variant rank first, then
//! contents) that backends use for sort-key ordering, pagination cutoffs,
//! and reverse iteration, so both backends paginate identically.
//!
//! Numbers are `Int`/`Float` behind the [`Number`] wrapper. Floats holding
//! integral values are normalized to `Int` at every decode boundary, which
//! keeps values stable across a JSON or DynamoDB round trip.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// An open record or key: field name to value.
pub type Fields = BTreeMap<String, Value>;

/// A numeric attribute value.
///
/// DynamoDB has a single number type; we keep integers exact where we can
/// and fall back to `f64` otherwise. Comparison is numeric across the two
/// representations, so `Int(2)` and `Float(2.0)` are equal.
#[derive(Debug, Clone, Copy)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    /// Build a number from a float, normalizing integral values to `Int`.
    pub fn from_f64(f: f64) -> Self {
        if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
            Self::Int(f as i64)
        } else {
            Self::Float(f)
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            Self::Int(i) => *i as f64,
            Self::Float(f) => *f,
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Self::Int(i) => *i == 0,
            Self::Float(f) => *f == 0.0,
        }
    }

    /// Numeric addition; stays integral when both sides are.
    pub fn add(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Self::Int(a + b),
            _ => Self::Float(self.as_f64() + other.as_f64()),
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Number {}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Number {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            _ => self.as_f64().total_cmp(&other.as_f64()),
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
        }
    }
}

impl From<i64> for Number {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Number {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for Number {
    fn from(f: f64) -> Self {
        Self::from_f64(f)
    }
}

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Value {
    Null,
    Bool(bool),
    Num(Number),
    Str(String),
    StrSet(BTreeSet<String>),
    NumSet(BTreeSet<Number>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Whether this value counts as "empty" for key validation.
    ///
    /// Mirrors the truthiness test the store applies to key fields: null,
    /// `false`, numeric zero, the empty string, and empty collections are
    /// all vacant and rejected in key positions.
    pub fn is_vacant(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Bool(b) => !b,
            Self::Num(n) => n.is_zero(),
            Self::Str(s) => s.is_empty(),
            Self::StrSet(s) => s.is_empty(),
            Self::NumSet(s) => s.is_empty(),
            Self::List(l) => l.is_empty(),
            Self::Map(m) => m.is_empty(),
        }
    }

    /// Render to JSON. Sets become `{"$type": "set", "elements": [...]}`
    /// so they survive a snapshot round trip.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Num(Number::Int(i)) => serde_json::Value::from(*i),
            Self::Num(Number::Float(f)) => serde_json::Value::from(*f),
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::StrSet(set) => set_to_json(set.iter().map(|s| serde_json::Value::from(s.as_str()))),
            Self::NumSet(set) => set_to_json(set.iter().map(|n| match n {
                Number::Int(i) => serde_json::Value::from(*i),
                Number::Float(f) => serde_json::Value::from(*f),
            })),
            Self::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Self::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Parse from JSON, inverting [`Value::to_json`].
    ///
    /// Integral floats normalize to `Int`; `$type: set` objects decode
    /// back to string or number sets depending on their elements.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, String> {
        match json {
            serde_json::Value::Null => Ok(Self::Null),
            serde_json::Value::Bool(b) => Ok(Self::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Num(Number::Int(i)))
                } else if let Some(f) = n.as_f64() {
                    Ok(Self::Num(Number::from_f64(f)))
                } else {
                    Err(format!("unrepresentable number: {n}"))
                }
            }
            serde_json::Value::String(s) => Ok(Self::Str(s.clone())),
            serde_json::Value::Array(items) => Ok(Self::List(
                items.iter().map(Self::from_json).collect::<Result<_, _>>()?,
            )),
            serde_json::Value::Object(map) => {
                if map.get("$type").and_then(|t| t.as_str()) == Some("set") {
                    let elements = map
                        .get("elements")
                        .and_then(|e| e.as_array())
                        .ok_or_else(|| "set object without elements".to_string())?;
                    return set_from_json(elements);
                }
                Ok(Self::Map(
                    map.iter()
                        .map(|(k, v)| Ok((k.clone(), Self::from_json(v)?)))
                        .collect::<Result<_, String>>()?,
                ))
            }
        }
    }
}

fn set_to_json(elements: impl Iterator<Item = serde_json::Value>) -> serde_json::Value {
    let mut obj = serde_json::Map::new();
    obj.insert("$type".into(), serde_json::Value::from("set"));
    obj.insert("elements".into(), serde_json::Value::Array(elements.collect()));
    serde_json::Value::Object(obj)
}

fn set_from_json(elements: &[serde_json::Value]) -> Result<Value, String> {
    if elements.iter().all(|e| e.is_number()) && !elements.is_empty() {
        let set = elements
            .iter()
            .map(|e| match Value::from_json(e)? {
                Value::Num(n) => Ok(n),
                other => Err(format!("expected number in set, got: {other:?}")),
            })
            .collect::<Result<BTreeSet<_>, String>>()?;
        return Ok(Value::NumSet(set));
    }
    let set = elements
        .iter()
        .map(|e| {
            e.as_str()
                .map(str::to_string)
                .ok_or_else(|| format!("expected string in set, got: {e}"))
        })
        .collect::<Result<BTreeSet<_>, String>>()?;
    Ok(Value::StrSet(set))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Num(Number::Int(i))
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Num(Number::Int(i64::from(i)))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Self::Num(Number::Int(i64::from(i)))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Num(Number::from_f64(f))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Number> for Value {
    fn from(n: Number) -> Self {
        Self::Num(n)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<BTreeSet<String>> for Value {
    fn from(set: BTreeSet<String>) -> Self {
        Self::StrSet(set)
    }
}

/// Build a [`Fields`] map from `name => value` pairs.
///
/// ```
/// use keygrid_core::fields;
/// let record = fields! { "id" => "a", "ts" => 1 };
/// assert_eq!(record.len(), 2);
/// ```
#[macro_export]
macro_rules! fields {
    () => { $crate::value::Fields::new() };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::value::Fields::new();
        $( map.insert(String::from($name), $crate::value::Value::from($value)); )+
        map
    }};
}

/// Build a string set value from literals.
#[macro_export]
macro_rules! str_set {
    ($($el:expr),* $(,)?) => {{
        let mut set = std::collections::BTreeSet::<String>::new();
        $( set.insert(String::from($el)); )*
        $crate::value::Value::StrSet(set)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_normalizes_integral_floats() {
        assert_eq!(Number::from_f64(3.0), Number::Int(3));
        assert_eq!(Number::from_f64(3.5), Number::Float(3.5));
    }

    #[test]
    fn numbers_compare_across_representations() {
        assert_eq!(Number::Int(2), Number::Float(2.0));
        assert!(Number::Int(1) < Number::Float(1.5));
        assert!(Number::Float(2.5) < Number::Int(3));
    }

    #[test]
    fn value_order_is_total_and_deterministic() {
        let mut values = vec![
            Value::from("b"),
            Value::from(2),
            Value::from("a"),
            Value::Null,
            Value::from(1),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::from(1),
                Value::from(2),
                Value::from("a"),
                Value::from("b"),
            ]
        );
    }

    #[test]
    fn vacant_values() {
        assert!(Value::Null.is_vacant());
        assert!(Value::from("").is_vacant());
        assert!(Value::from(0).is_vacant());
        assert!(Value::from(false).is_vacant());
        assert!(Value::List(vec![]).is_vacant());
        assert!(!Value::from("x").is_vacant());
        assert!(!Value::from(1).is_vacant());
    }

    #[test]
    fn json_round_trip_scalars() {
        for value in [
            Value::Null,
            Value::from(true),
            Value::from(42),
            Value::from(1.5),
            Value::from("hello"),
        ] {
            let json = value.to_json();
            assert_eq!(Value::from_json(&json).unwrap(), value);
        }
    }

    #[test]
    fn json_round_trip_string_set() {
        let value = str_set!["a", "b"];
        let json = value.to_json();
        assert_eq!(json["$type"], "set");
        assert_eq!(Value::from_json(&json).unwrap(), value);
    }

    #[test]
    fn json_round_trip_number_set() {
        let value = Value::NumSet([Number::Int(1), Number::Int(2)].into());
        let json = value.to_json();
        assert_eq!(Value::from_json(&json).unwrap(), value);
    }

    #[test]
    fn json_integral_float_decodes_to_int() {
        let json = serde_json::json!(5.0);
        assert_eq!(Value::from_json(&json).unwrap(), Value::from(5));
    }

    #[test]
    fn json_nested_record_round_trip() {
        let record = fields! {
            "id" => "a",
            "nested" => Value::Map(fields! { "x" => 1 }),
            "tags" => str_set!["t1"],
        };
        let json = Value::Map(record.clone()).to_json();
        assert_eq!(Value::from_json(&json).unwrap(), Value::Map(record));
    }

    #[test]
    fn fields_macro_builds_sorted_map() {
        let record = fields! { "b" => 2, "a" => "x" };
        let names: Vec<_> = record.keys().cloned().collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}

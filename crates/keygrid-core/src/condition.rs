//! Query conditions.
//!
//! A query key maps field names to [`Condition`]s: plain equality, or a
//! range comparison. Range conditions are only valid on a sort key (table
//! or index) in key position; filter maps accept them on any field.
//!
//! Every condition knows how to render itself as a DynamoDB expression
//! fragment (with `#name` / `:value` placeholders, so reserved words never
//! collide) and how to evaluate itself in memory, which is what keeps the
//! two backends in agreement.

use std::collections::BTreeMap;

use crate::error::{StoreError, StoreResult};
use crate::value::{Fields, Value};

/// A query key: field name to condition.
pub type KeyConditions = BTreeMap<String, Condition>;

/// A single comparison against a stored field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Exact equality with the stored value.
    Eq(Value),
    /// Inclusive range match: `min <= value <= max`.
    Between { min: Value, max: Value },
}

impl Condition {
    pub fn eq(value: impl Into<Value>) -> Self {
        Self::Eq(value.into())
    }

    pub fn between(min: impl Into<Value>, max: impl Into<Value>) -> Self {
        Self::Between {
            min: min.into(),
            max: max.into(),
        }
    }

    /// Whether the given stored value (if any) satisfies this condition.
    pub fn matches(&self, value: Option<&Value>) -> bool {
        match (self, value) {
            (Self::Eq(expected), stored) => stored == Some(expected),
            (Self::Between { min, max }, Some(v)) => min <= v && v <= max,
            (Self::Between { .. }, None) => false,
        }
    }

    /// Render the expression fragment for this condition on `field`.
    pub fn expression(&self, field: &str) -> String {
        match self {
            Self::Eq(_) => format!("#{field} = :{field}"),
            Self::Between { .. } => format!("#{field} BETWEEN :{field}_min AND :{field}_max"),
        }
    }

    /// The placeholder values referenced by [`Condition::expression`].
    pub fn values(&self, field: &str) -> Vec<(String, Value)> {
        match self {
            Self::Eq(v) => vec![(format!(":{field}"), v.clone())],
            Self::Between { min, max } => vec![
                (format!(":{field}_min"), min.clone()),
                (format!(":{field}_max"), max.clone()),
            ],
        }
    }

    pub fn is_range(&self) -> bool {
        !matches!(self, Self::Eq(_))
    }

    /// Split a condition map into its equality part (as plain fields) and
    /// its range part.
    pub fn split(conditions: &KeyConditions) -> (Fields, KeyConditions) {
        let mut eq = Fields::new();
        let mut ranges = KeyConditions::new();
        for (field, condition) in conditions {
            match condition {
                Self::Eq(v) => {
                    eq.insert(field.clone(), v.clone());
                }
                range => {
                    ranges.insert(field.clone(), range.clone());
                }
            }
        }
        (eq, ranges)
    }
}

impl From<Value> for Condition {
    fn from(v: Value) -> Self {
        Self::Eq(v)
    }
}

impl From<&str> for Condition {
    fn from(s: &str) -> Self {
        Self::Eq(Value::from(s))
    }
}

impl From<String> for Condition {
    fn from(s: String) -> Self {
        Self::Eq(Value::from(s))
    }
}

impl From<i64> for Condition {
    fn from(i: i64) -> Self {
        Self::Eq(Value::from(i))
    }
}

impl From<i32> for Condition {
    fn from(i: i32) -> Self {
        Self::Eq(Value::from(i))
    }
}

impl From<f64> for Condition {
    fn from(f: f64) -> Self {
        Self::Eq(Value::from(f))
    }
}

/// Check that range conditions only reference the declared sort key.
///
/// A range condition on any other field (or on a table with no sort key at
/// all) cannot be expressed as a DynamoDB key condition, so it is rejected
/// up front rather than half-working in one backend.
pub fn validate_range_on_sort_key(
    ranges: &KeyConditions,
    sort_key: Option<&str>,
) -> StoreResult<()> {
    for field in ranges.keys() {
        if Some(field.as_str()) != sort_key {
            return Err(StoreError::ConditionNotOnSortKey {
                field: field.clone(),
                sort_key: sort_key.map(str::to_string),
            });
        }
    }
    Ok(())
}

/// Build a [`KeyConditions`] map from `name => condition` pairs.
///
/// Values convert through `Condition::from`, so plain scalars become
/// equality conditions:
///
/// ```
/// use keygrid_core::{conditions, Condition};
/// let key = conditions! { "user" => "u1", "ts" => Condition::between(1, 5) };
/// assert_eq!(key.len(), 2);
/// ```
#[macro_export]
macro_rules! conditions {
    () => { $crate::condition::KeyConditions::new() };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::condition::KeyConditions::new();
        $( map.insert(String::from($name), $crate::condition::Condition::from($value)); )+
        map
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields;

    #[test]
    fn between_matches_inclusive_bounds() {
        let cond = Condition::between(1, 5);
        assert!(cond.matches(Some(&Value::from(1))));
        assert!(cond.matches(Some(&Value::from(3))));
        assert!(cond.matches(Some(&Value::from(5))));
        assert!(!cond.matches(Some(&Value::from(0))));
        assert!(!cond.matches(Some(&Value::from(6))));
        assert!(!cond.matches(None));
    }

    #[test]
    fn eq_matches_exact_value() {
        let cond = Condition::eq("a");
        assert!(cond.matches(Some(&Value::from("a"))));
        assert!(!cond.matches(Some(&Value::from("b"))));
        assert!(!cond.matches(None));
    }

    #[test]
    fn between_expression_and_values() {
        let cond = Condition::between(1, 5);
        assert_eq!(cond.expression("ts"), "#ts BETWEEN :ts_min AND :ts_max");
        let values = cond.values("ts");
        assert_eq!(
            values,
            vec![
                (":ts_min".to_string(), Value::from(1)),
                (":ts_max".to_string(), Value::from(5)),
            ]
        );
    }

    #[test]
    fn eq_expression_and_values() {
        let cond = Condition::eq("u1");
        assert_eq!(cond.expression("user"), "#user = :user");
        assert_eq!(cond.values("user"), vec![(":user".to_string(), Value::from("u1"))]);
    }

    #[test]
    fn split_partitions_eq_from_ranges() {
        let key = conditions! { "id" => "a", "ts" => Condition::between(1, 2) };
        let (eq, ranges) = Condition::split(&key);
        assert_eq!(eq, fields! { "id" => "a" });
        assert_eq!(ranges.len(), 1);
        assert!(ranges.contains_key("ts"));
    }

    #[test]
    fn range_allowed_only_on_sort_key() {
        let key = conditions! { "ts" => Condition::between(1, 2) };
        let (_, ranges) = Condition::split(&key);
        assert!(validate_range_on_sort_key(&ranges, Some("ts")).is_ok());
        assert!(validate_range_on_sort_key(&ranges, Some("other")).is_err());
        assert!(validate_range_on_sort_key(&ranges, None).is_err());
    }
}

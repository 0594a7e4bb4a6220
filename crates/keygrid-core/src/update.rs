//! Field-level update operators.
//!
//! An update call maps field names to [`Update`]s. The enum is closed on
//! purpose: each backend matches it exhaustively, so adding an operator
//! forces both the in-memory application and the DynamoDB encoding to be
//! written before anything compiles.

use std::collections::{BTreeMap, BTreeSet};

use crate::value::{Number, Value};

/// A set of field updates for a single record.
pub type Updates = BTreeMap<String, Update>;

/// A mutation applied to one field of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// Replace the field with a plain value.
    Put(Value),
    /// Remove the field from the record.
    Delete,
    /// Numeric add; a missing field counts as zero.
    Increment(Number),
    /// Set union on a string set.
    AddToStringSet(BTreeSet<String>),
    /// Set union on a number set.
    AddToNumberSet(BTreeSet<Number>),
    /// Set difference on a string set.
    RemoveFromStringSet(BTreeSet<String>),
    /// Append elements to a list.
    AddToList(Vec<Value>),
}

impl Update {
    pub fn put(value: impl Into<Value>) -> Self {
        Self::Put(value.into())
    }

    pub fn increment(delta: impl Into<Number>) -> Self {
        Self::Increment(delta.into())
    }

    pub fn add_to_string_set<I, S>(elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::AddToStringSet(elements.into_iter().map(Into::into).collect())
    }

    pub fn add_to_number_set<I, N>(elements: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<Number>,
    {
        Self::AddToNumberSet(elements.into_iter().map(Into::into).collect())
    }

    pub fn remove_from_string_set<I, S>(elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::RemoveFromStringSet(elements.into_iter().map(Into::into).collect())
    }

    pub fn add_to_list<I, V>(elements: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::AddToList(elements.into_iter().map(Into::into).collect())
    }
}

impl From<Value> for Update {
    fn from(v: Value) -> Self {
        Self::Put(v)
    }
}

/// Build an [`Updates`] map from `name => update` pairs.
#[macro_export]
macro_rules! updates {
    () => { $crate::update::Updates::new() };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::update::Updates::new();
        $( map.insert(String::from($name), $value); )+
        map
    }};
}

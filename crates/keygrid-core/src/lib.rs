//! keygrid-core — shared types for the keygrid storage layer.
//!
//! Leaf types with no I/O: attribute [`value::Value`]s, query
//! [`condition::Condition`]s, field-level [`update::Update`] operators,
//! the error taxonomy, and the small helpers (backoff, cancellation,
//! configuration) the storage crate builds on.

pub mod backoff;
pub mod cancel;
pub mod condition;
pub mod config;
pub mod error;
pub mod update;
pub mod value;

pub use backoff::ExponentialBackoff;
pub use cancel::Cancel;
pub use condition::{Condition, KeyConditions, validate_range_on_sort_key};
pub use config::{StoreConfig, make_table_name};
pub use error::{StoreError, StoreResult};
pub use update::{Update, Updates};
pub use value::{Fields, Number, Value};

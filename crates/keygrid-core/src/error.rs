//! Error types for keygrid storage operations.

use thiserror::Error;

/// Result type alias for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the table layer or a storage backend.
///
/// Construction errors (bad keys, bad conditions, bad operators) are
/// always the caller's mistake and never retried. Absence of a record is
/// not an error; reads return `Ok(None)` instead.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("missing key field '{0}'")]
    MissingKeyField(String),

    #[error("key fields incorrect: got {got:?}, expected {expected:?}")]
    KeyMismatch { got: Vec<String>, expected: Vec<String> },

    #[error("key field '{0}' has an empty value")]
    VacantKeyValue(String),

    #[error("no table or index matches key fields {0:?}")]
    NoAccessPath(Vec<String>),

    #[error("range condition on '{field}' not allowed; sort key is {sort_key:?}")]
    ConditionNotOnSortKey { field: String, sort_key: Option<String> },

    #[error("type mismatch in field '{field}': {message}")]
    TypeMismatch { field: String, message: String },

    #[error("batch get must target the table key, not index '{0}'")]
    IndexUnsupported(String),

    #[error("invalid pagination token: {0}")]
    BadToken(String),

    #[error("iterator is at end of stream")]
    AtEndOfStream,

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("codec error: {0}")]
    Codec(String),
}

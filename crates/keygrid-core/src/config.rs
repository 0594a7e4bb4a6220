//! Storage configuration.

use std::path::PathBuf;

/// Settings consumed by the storage factory.
///
/// All fields come from the environment by default; tests construct the
/// struct directly.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// AWS region override; `None` defers to the SDK's default chain.
    pub region: Option<String>,
    /// Prefix prepended to every table name as `{prefix}-{table}`.
    pub table_prefix: String,
    /// Snapshot file for the in-memory backend, if persistence is wanted.
    pub snapshot_path: Option<PathBuf>,
}

impl StoreConfig {
    /// Read configuration from `AWS_REGION`, `KEYGRID_TABLE_PREFIX`, and
    /// `KEYGRID_SNAPSHOT_PATH`.
    pub fn from_env() -> Self {
        Self {
            region: std::env::var("AWS_REGION").ok().filter(|s| !s.is_empty()),
            table_prefix: std::env::var("KEYGRID_TABLE_PREFIX").unwrap_or_default(),
            snapshot_path: std::env::var("KEYGRID_SNAPSHOT_PATH")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
        }
    }

    /// Apply the table prefix to a logical table name.
    pub fn table_name(&self, name: &str) -> String {
        make_table_name(&self.table_prefix, name)
    }
}

/// `"{prefix}-{name}"`, or just `name` when the prefix is empty.
pub fn make_table_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}-{name}")
    }
}

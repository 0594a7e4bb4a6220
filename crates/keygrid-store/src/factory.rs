//! Backend selection.

use std::sync::Arc;

use tracing::debug;

use keygrid_core::{StoreConfig, StoreResult};

use crate::dynamo::DynamoStorage;
use crate::memory::MemoryStorage;
use crate::storage::TableStorage;

/// Pick a storage backend from the environment, once, at startup.
///
/// With AWS credentials present the real store is used; otherwise the
/// in-memory emulation (optionally snapshot-backed) takes over, which is
/// what local runs and tests want. Callers hold the trait object and
/// never branch on the concrete type again.
pub async fn storage_from_env(config: &StoreConfig) -> StoreResult<Arc<dyn TableStorage>> {
    let has_credentials = std::env::var("AWS_ACCESS_KEY_ID").is_ok_and(|v| !v.is_empty());
    if has_credentials {
        debug!(region = ?config.region, "using DynamoDB storage");
        return Ok(Arc::new(DynamoStorage::from_env(config).await?));
    }

    debug!(snapshot = ?config.snapshot_path, "no AWS credentials; using in-memory storage");
    let storage = match &config.snapshot_path {
        Some(path) => MemoryStorage::with_snapshot(path),
        None => MemoryStorage::new(),
    };
    Ok(Arc::new(storage))
}

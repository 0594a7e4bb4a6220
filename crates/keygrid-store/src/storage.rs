//! The backend contract and its shared result types.
//!
//! Both backends implement [`TableStorage`]; the [`crate::table::Table`]
//! façade only ever talks through the trait object, so a table built
//! against DynamoDB behaves identically against the in-memory emulation.
//!
//! Pagination tokens live at two levels. At this level a token is the
//! backend's native compound cursor — a small `Fields` map naming the last
//! evaluated key (or an `offset` for plain scans). The string encoding
//! handed to external callers (URL-safe base64 of the cursor's JSON) is
//! applied by the table layer via [`encode_page_token`] /
//! [`decode_page_token`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;

use keygrid_core::{Fields, KeyConditions, StoreError, StoreResult, Updates, Value};

/// Options for a query or index query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Return results in descending sort-key order.
    pub reverse: bool,
    /// Upper bound on records returned in this page.
    pub limit: Option<usize>,
    /// Decoded cursor from a previous page, if resuming.
    pub pagination_token: Option<Fields>,
    /// Conditions applied to candidate matches after the key scan.
    /// Filtering narrows the page but never widens the key scan, so a
    /// filtered page can come back empty while a cursor remains.
    pub filter: Option<KeyConditions>,
}

/// One page of records plus the cursor to the next page, if any.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultPage {
    pub records: Vec<Fields>,
    /// `None` iff no further page exists. Treat as opaque.
    pub next_page_token: Option<String>,
}

impl ResultPage {
    pub fn has_next_page(&self) -> bool {
        self.next_page_token.is_some()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Fields> {
        self.records.iter()
    }
}

impl IntoIterator for ResultPage {
    type Item = Fields;
    type IntoIter = std::vec::IntoIter<Fields>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a ResultPage {
    type Item = &'a Fields;
    type IntoIter = std::slice::Iter<'a, Fields>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Low-level storage operations shared by both backends.
///
/// Identical inputs must produce identical externally-visible behavior in
/// every implementation: ordering, pagination cutoffs, filter timing, and
/// keys-only projection all follow the managed store's semantics.
#[async_trait]
pub trait TableStorage: Send + Sync {
    /// Equality-only single-item lookup.
    async fn get_item(&self, table: &str, key: &Fields) -> StoreResult<Option<Fields>>;

    /// Fetch many items by primary key. `keys` pairs a caller id with a
    /// key; duplicate keys are coalesced into one physical fetch. The
    /// result maps ids to found records; absent ids mean not-found.
    async fn batch_get_item(
        &self,
        table: &str,
        keys: &[(String, Fields)],
        table_key_fields: &[String],
    ) -> StoreResult<BTreeMap<String, Fields>>;

    /// Partition-key query with optional sort-key range condition.
    async fn query(
        &self,
        table: &str,
        key: &KeyConditions,
        sort_key: Option<&str>,
        opts: &QueryOptions,
    ) -> StoreResult<(Vec<Fields>, Option<Fields>)>;

    /// Like [`TableStorage::query`] against a named secondary index. With
    /// `keys_only`, records are reduced to the union of index-key and
    /// table-key fields.
    #[allow(clippy::too_many_arguments)]
    async fn query_index(
        &self,
        table: &str,
        index_name: &str,
        key: &KeyConditions,
        sort_key: Option<&str>,
        keys_only: bool,
        table_key_fields: &[String],
        opts: &QueryOptions,
    ) -> StoreResult<(Vec<Fields>, Option<Fields>)>;

    /// Idempotent upsert of a full record under its extracted key.
    async fn put(&self, table: &str, key: &Fields, record: &Fields) -> StoreResult<()>;

    /// Apply field updates; returns the full post-update record. A missing
    /// record upserts one containing the key fields plus the updates.
    async fn update(&self, table: &str, key: &Fields, updates: &Updates) -> StoreResult<Fields>;

    /// Delete by key, returning the old record if one existed.
    async fn delete(&self, table: &str, key: &Fields) -> StoreResult<Option<Fields>>;

    async fn item_count(&self, table: &str) -> StoreResult<u64>;

    /// Unconditional paged enumeration.
    async fn scan(
        &self,
        table: &str,
        limit: Option<usize>,
        pagination_token: Option<&Fields>,
    ) -> StoreResult<(Vec<Fields>, Option<Fields>)>;
}

/// Encode a compound-key cursor as an opaque URL-safe string.
pub fn encode_page_token(cursor: Option<&Fields>) -> Option<String> {
    cursor.map(|fields| {
        let json = Value::Map(fields.clone()).to_json();
        URL_SAFE.encode(json.to_string())
    })
}

/// Decode an opaque cursor string back into a compound-key map.
pub fn decode_page_token(token: Option<&str>) -> StoreResult<Option<Fields>> {
    let Some(token) = token else {
        return Ok(None);
    };
    let bytes = URL_SAFE
        .decode(token)
        .map_err(|e| StoreError::BadToken(e.to_string()))?;
    let json: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|e| StoreError::BadToken(e.to_string()))?;
    match Value::from_json(&json).map_err(StoreError::BadToken)? {
        Value::Map(fields) => Ok(Some(fields)),
        other => Err(StoreError::BadToken(format!(
            "expected cursor object, got: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygrid_core::fields;

    #[test]
    fn page_token_round_trip() {
        let cursor = fields! { "id" => "a", "ts" => 3 };
        let token = encode_page_token(Some(&cursor)).unwrap();
        assert_eq!(decode_page_token(Some(&token)).unwrap(), Some(cursor));
    }

    #[test]
    fn page_token_none_round_trip() {
        assert_eq!(encode_page_token(None), None);
        assert_eq!(decode_page_token(None).unwrap(), None);
    }

    #[test]
    fn page_token_is_url_safe() {
        let cursor = fields! { "id" => "a/b+c", "ts" => 12345678 };
        let token = encode_page_token(Some(&cursor)).unwrap();
        assert!(!token.contains('+'));
        assert!(!token.contains('/'));
        assert!(!token.contains('@'));
    }

    #[test]
    fn garbage_token_is_a_bad_token_error() {
        assert!(matches!(
            decode_page_token(Some("!!not base64!!")),
            Err(StoreError::BadToken(_))
        ));
    }

    #[test]
    fn result_page_iterates_records() {
        let page = ResultPage {
            records: vec![fields! { "id" => "a" }, fields! { "id" => "b" }],
            next_page_token: None,
        };
        assert_eq!(page.len(), 2);
        assert!(!page.has_next_page());
        let ids: Vec<_> = page.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids.len(), 2);
    }
}

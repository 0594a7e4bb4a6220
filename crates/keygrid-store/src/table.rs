//! The `Table` façade.
//!
//! A `Table` owns its key layout (partition key, optional sort key, and
//! secondary index descriptors) and resolves high-level key maps into
//! backend calls: a key naming the table's own key fields becomes a table
//! lookup, a key naming an index's fields becomes an index lookup, and
//! anything else is rejected. Callers never pick an access path
//! explicitly.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use keygrid_core::{
    Condition, ExponentialBackoff, Fields, KeyConditions, StoreError, StoreResult, Updates,
};

use crate::paging::{FetchSpec, QueryIterator};
use crate::storage::{
    QueryOptions, ResultPage, TableStorage, decode_page_token, encode_page_token,
};

/// A secondary index over a table.
///
/// The index name defaults to `"{partition}-{sort}-index"` (or
/// `"{partition}-index"` without a sort key). A keys-only index serves
/// only key fields; both backends enforce that projection.
#[derive(Debug, Clone)]
pub struct Index {
    partition_key: String,
    sort_key: Option<String>,
    index_name: Option<String>,
    keys_only: bool,
}

impl Index {
    pub fn new(partition_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            sort_key: None,
            index_name: None,
            keys_only: false,
        }
    }

    pub fn with_sort_key(mut self, sort_key: impl Into<String>) -> Self {
        self.sort_key = Some(sort_key.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.index_name = Some(name.into());
        self
    }

    pub fn keys_only(mut self) -> Self {
        self.keys_only = true;
        self
    }

    /// The index name, derived from the key fields unless overridden.
    pub fn name(&self) -> String {
        match &self.index_name {
            Some(name) => name.clone(),
            None => match &self.sort_key {
                Some(sk) => format!("{}-{}-index", self.partition_key, sk),
                None => format!("{}-index", self.partition_key),
            },
        }
    }

    fn key_fields(&self) -> BTreeSet<&str> {
        let mut fields = BTreeSet::from([self.partition_key.as_str()]);
        if let Some(sk) = &self.sort_key {
            fields.insert(sk.as_str());
        }
        fields
    }
}

/// Which access path a key resolved to.
enum Lookup<'a> {
    Table,
    Index(&'a Index),
}

/// Options for [`Table::get_many`].
#[derive(Debug, Clone, Default)]
pub struct GetManyOptions {
    /// Return results in descending sort-key order.
    pub reverse: bool,
    /// Upper bound on records in this page.
    pub limit: Option<usize>,
    /// Opaque token from a previous page's `next_page_token`.
    pub pagination_token: Option<String>,
    /// Conditions applied after the key scan; narrows, never widens.
    pub filter: Option<KeyConditions>,
}

/// High-level access to one table, generic over the storage backend.
#[derive(Clone)]
pub struct Table {
    storage: Arc<dyn TableStorage>,
    table_name: String,
    partition_key: String,
    sort_key: Option<String>,
    indexes: Vec<Index>,
}

impl Table {
    pub fn new(
        storage: Arc<dyn TableStorage>,
        table_name: impl Into<String>,
        partition_key: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            table_name: table_name.into(),
            partition_key: partition_key.into(),
            sort_key: None,
            indexes: Vec::new(),
        }
    }

    pub fn with_sort_key(mut self, sort_key: impl Into<String>) -> Self {
        self.sort_key = Some(sort_key.into());
        self
    }

    pub fn with_index(mut self, index: Index) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn name(&self) -> &str {
        &self.table_name
    }

    /// The table's key fields: partition key, then sort key if declared.
    pub fn key_fields(&self) -> Vec<String> {
        let mut fields = vec![self.partition_key.clone()];
        if let Some(sk) = &self.sort_key {
            fields.push(sk.clone());
        }
        fields
    }

    /// Get a single item by table key or index key.
    ///
    /// An index lookup takes the first match of a limit-1 query.
    pub async fn get(&self, key: &Fields) -> StoreResult<Option<Fields>> {
        debug!(table = %self.table_name, "db get");
        reject_vacant_fields(key)?;
        match self.resolve(&field_names(key), false)? {
            Lookup::Table => self.storage.get_item(&self.table_name, key).await,
            Lookup::Index(index) => {
                let conditions = eq_conditions(key);
                let (records, _) = self
                    .storage
                    .query_index(
                        &self.table_name,
                        &index.name(),
                        &conditions,
                        index.sort_key.as_deref(),
                        index.keys_only,
                        &self.key_fields(),
                        &QueryOptions {
                            limit: Some(1),
                            ..QueryOptions::default()
                        },
                    )
                    .await?;
                Ok(records.into_iter().next())
            }
        }
    }

    /// Fetch many items by table key, one result slot per input key.
    ///
    /// Duplicate keys cost a single physical fetch. Keys that would
    /// resolve to an index are a hard error: the underlying store only
    /// batch-fetches by table key.
    pub async fn batch_get(&self, keys: &[Fields]) -> StoreResult<Vec<Option<Fields>>> {
        debug!(table = %self.table_name, count = keys.len(), "db batch get");
        let ids: Vec<String> = (0..keys.len()).map(|i| format!("k{i}")).collect();
        let pairs: Vec<(String, Fields)> = ids.iter().cloned().zip(keys.iter().cloned()).collect();
        let mut found = self.batch_get_resolved(&pairs).await?;
        Ok(ids.iter().map(|id| found.remove(id)).collect())
    }

    /// [`Table::batch_get`] with caller-chosen ids instead of positions.
    pub async fn batch_get_map(
        &self,
        keys: &BTreeMap<String, Fields>,
    ) -> StoreResult<BTreeMap<String, Option<Fields>>> {
        debug!(table = %self.table_name, count = keys.len(), "db batch get");
        let pairs: Vec<(String, Fields)> = keys
            .iter()
            .map(|(id, key)| (id.clone(), key.clone()))
            .collect();
        let mut found = self.batch_get_resolved(&pairs).await?;
        Ok(keys
            .keys()
            .map(|id| (id.clone(), found.remove(id)))
            .collect())
    }

    async fn batch_get_resolved(
        &self,
        pairs: &[(String, Fields)],
    ) -> StoreResult<BTreeMap<String, Fields>> {
        if pairs.is_empty() {
            return Ok(BTreeMap::new());
        }
        for (_, key) in pairs {
            reject_vacant_fields(key)?;
            if let Lookup::Index(index) = self.resolve(&field_names(key), false)? {
                return Err(StoreError::IndexUnsupported(index.name()));
            }
        }
        self.storage
            .batch_get_item(&self.table_name, pairs, &self.key_fields())
            .await
    }

    /// Get a page of items matching the key, via the table or an index.
    ///
    /// The key condition is mandatory and bounds the scan; the optional
    /// filter runs on the scanned candidates afterwards, which saves
    /// bytes but not read capacity — picking a good key still matters.
    pub async fn get_many(
        &self,
        key: &KeyConditions,
        opts: &GetManyOptions,
    ) -> StoreResult<ResultPage> {
        debug!(table = %self.table_name, "db get many");
        reject_vacant_conditions(key)?;
        let query_opts = QueryOptions {
            reverse: opts.reverse,
            limit: opts.limit,
            pagination_token: decode_page_token(opts.pagination_token.as_deref())?,
            filter: opts.filter.clone(),
        };
        let (records, next_cursor) = match self.resolve(&condition_names(key), true)? {
            Lookup::Table => {
                self.storage
                    .query(&self.table_name, key, self.sort_key.as_deref(), &query_opts)
                    .await?
            }
            Lookup::Index(index) => {
                self.storage
                    .query_index(
                        &self.table_name,
                        &index.name(),
                        key,
                        index.sort_key.as_deref(),
                        index.keys_only,
                        &self.key_fields(),
                        &query_opts,
                    )
                    .await?
            }
        };
        debug!(table = %self.table_name, items = records.len(), "db get many page");
        Ok(ResultPage {
            records,
            next_page_token: encode_page_token(next_cursor.as_ref()),
        })
    }

    /// Lazily iterate over every record matching the key, fetching pages
    /// of `batch_size` as needed. Long drains should check a
    /// [`keygrid_core::Cancel`] token between items.
    pub fn get_all(
        &self,
        key: &KeyConditions,
        reverse: bool,
        batch_size: Option<usize>,
    ) -> QueryIterator<'_> {
        QueryIterator::new(FetchSpec::GetMany {
            table: self,
            key: key.clone(),
            reverse,
            batch_size,
        })
    }

    /// Resume a [`Table::get_all`] drain from an iterator token.
    pub async fn get_all_from(
        &self,
        key: &KeyConditions,
        reverse: bool,
        batch_size: Option<usize>,
        pagination_token: &str,
    ) -> StoreResult<QueryIterator<'_>> {
        QueryIterator::resume(
            FetchSpec::GetMany {
                table: self,
                key: key.clone(),
                reverse,
                batch_size,
            },
            pagination_token,
        )
        .await
    }

    /// Put a single complete record. The record must carry the table's
    /// key fields; it is returned unchanged for chaining.
    pub async fn create(&self, record: Fields) -> StoreResult<Fields> {
        debug!(table = %self.table_name, "db create");
        let key = self.extract_key(&record)?;
        self.storage.put(&self.table_name, &key, &record).await?;
        Ok(record)
    }

    /// Alias for [`Table::create`], when "create" reads oddly at the call
    /// site.
    pub async fn put(&self, record: Fields) -> StoreResult<Fields> {
        self.create(record).await
    }

    /// Update select fields of the record with the given table key.
    pub async fn update(&self, key: &Fields, updates: &Updates) -> StoreResult<Fields> {
        debug!(table = %self.table_name, "db update");
        self.validate_key(key)?;
        self.storage.update(&self.table_name, key, updates).await
    }

    /// Delete by table key, returning the old record if one existed.
    pub async fn delete(&self, key: &Fields) -> StoreResult<Option<Fields>> {
        debug!(table = %self.table_name, "db delete");
        self.validate_key(key)?;
        self.storage.delete(&self.table_name, key).await
    }

    /// Delete every record matching the key.
    ///
    /// The store has no native delete-by-query, so this is a fetch/delete
    /// loop over `get_many` pages, backing off between passes while more
    /// items remain.
    pub async fn del_many(&self, key: &KeyConditions) -> StoreResult<()> {
        debug!(table = %self.table_name, "db delete many");
        let mut backoff = ExponentialBackoff::new();
        let mut page = self.get_many(key, &GetManyOptions::default()).await?;
        while !page.is_empty() {
            for record in &page {
                let record_key = self.extract_key(record)?;
                self.delete(&record_key).await?;
            }
            page = self.get_many(key, &GetManyOptions::default()).await?;
            backoff.sleep_when(!page.is_empty()).await;
        }
        Ok(())
    }

    /// Read a page of the entire table, in storage order.
    pub async fn scan(
        &self,
        limit: Option<usize>,
        pagination_token: Option<&str>,
    ) -> StoreResult<ResultPage> {
        debug!(table = %self.table_name, "db scan");
        let cursor = decode_page_token(pagination_token)?;
        let (records, next_cursor) = self
            .storage
            .scan(&self.table_name, limit, cursor.as_ref())
            .await?;
        Ok(ResultPage {
            records,
            next_page_token: encode_page_token(next_cursor.as_ref()),
        })
    }

    /// Lazily iterate over the entire table.
    pub fn scan_all(&self, limit: Option<usize>) -> QueryIterator<'_> {
        QueryIterator::new(FetchSpec::Scan { table: self, limit })
    }

    /// Resume a [`Table::scan_all`] drain from an iterator token.
    pub async fn scan_all_from(
        &self,
        limit: Option<usize>,
        pagination_token: &str,
    ) -> StoreResult<QueryIterator<'_>> {
        QueryIterator::resume(FetchSpec::Scan { table: self, limit }, pagination_token).await
    }

    pub async fn item_count(&self) -> StoreResult<u64> {
        debug!(table = %self.table_name, "db describe");
        self.storage.item_count(&self.table_name).await
    }

    /// Decide which access path a key addresses.
    ///
    /// Order matters: the table's own key fields win, then indexes in
    /// declaration order (either their full key-field set or their bare
    /// partition key), then a bare table partition key — the latter only
    /// for range reads, where the missing sort key is the point.
    fn resolve(&self, names: &BTreeSet<&str>, many: bool) -> StoreResult<Lookup<'_>> {
        let table_keys: BTreeSet<&str> = self
            .key_fields_iter()
            .collect();
        if *names == table_keys {
            return Ok(Lookup::Table);
        }

        let single = (names.len() == 1).then(|| *names.iter().next().expect("non-empty"));
        for index in &self.indexes {
            if *names == index.key_fields() || single == Some(index.partition_key.as_str()) {
                return Ok(Lookup::Index(index));
            }
        }

        let Some(one) = single else {
            return Err(StoreError::KeyMismatch {
                got: names.iter().map(|s| s.to_string()).collect(),
                expected: self.key_fields(),
            });
        };
        if one == self.partition_key {
            if !many {
                // A bare partition key on a sorted table can only mean a
                // range read; single-item lookups need the sort key too.
                return Err(StoreError::MissingKeyField(
                    self.sort_key.clone().unwrap_or_default(),
                ));
            }
            return Ok(Lookup::Table);
        }
        Err(StoreError::NoAccessPath(
            names.iter().map(|s| s.to_string()).collect(),
        ))
    }

    fn key_fields_iter(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.partition_key.as_str()).chain(self.sort_key.as_deref())
    }

    /// Pull the table's key fields out of a full record.
    fn extract_key(&self, record: &Fields) -> StoreResult<Fields> {
        let mut key = Fields::new();
        for field in self.key_fields_iter() {
            match record.get(field) {
                Some(v) => {
                    key.insert(field.to_string(), v.clone());
                }
                None => return Err(StoreError::MissingKeyField(field.to_string())),
            }
        }
        Ok(key)
    }

    /// Require the key to name exactly the table's key fields, none
    /// vacant.
    fn validate_key(&self, key: &Fields) -> StoreResult<()> {
        let expected: BTreeSet<&str> = self.key_fields_iter().collect();
        if field_names(key) != expected {
            return Err(StoreError::KeyMismatch {
                got: key.keys().cloned().collect(),
                expected: self.key_fields(),
            });
        }
        reject_vacant_fields(key)
    }
}

fn field_names(fields: &Fields) -> BTreeSet<&str> {
    fields.keys().map(String::as_str).collect()
}

fn condition_names(conditions: &KeyConditions) -> BTreeSet<&str> {
    conditions.keys().map(String::as_str).collect()
}

fn eq_conditions(fields: &Fields) -> KeyConditions {
    fields
        .iter()
        .map(|(k, v)| (k.clone(), Condition::Eq(v.clone())))
        .collect()
}

fn reject_vacant_fields(fields: &Fields) -> StoreResult<()> {
    for (field, value) in fields {
        if value.is_vacant() {
            return Err(StoreError::VacantKeyValue(field.clone()));
        }
    }
    Ok(())
}

fn reject_vacant_conditions(conditions: &KeyConditions) -> StoreResult<()> {
    for (field, condition) in conditions {
        if let Condition::Eq(value) = condition {
            if value.is_vacant() {
                return Err(StoreError::VacantKeyValue(field.clone()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use keygrid_core::{fields, conditions};

    fn table_with_index() -> Table {
        Table::new(Arc::new(MemoryStorage::new()), "posts", "id")
            .with_sort_key("ts")
            .with_index(Index::new("user").with_sort_key("ts"))
    }

    #[test]
    fn index_names_default_from_key_fields() {
        assert_eq!(Index::new("user").name(), "user-index");
        assert_eq!(Index::new("user").with_sort_key("ts").name(), "user-ts-index");
        assert_eq!(Index::new("user").with_name("custom").name(), "custom");
    }

    #[test]
    fn resolve_full_table_key() {
        let table = table_with_index();
        let names = BTreeSet::from(["id", "ts"]);
        assert!(matches!(table.resolve(&names, false), Ok(Lookup::Table)));
    }

    #[test]
    fn resolve_index_by_partition_key() {
        let table = table_with_index();
        let names = BTreeSet::from(["user"]);
        match table.resolve(&names, false) {
            Ok(Lookup::Index(index)) => assert_eq!(index.name(), "user-ts-index"),
            other => panic!("unexpected: {:?}", other.is_ok()),
        }
    }

    #[test]
    fn resolve_index_by_full_key() {
        let table = table_with_index();
        let names = BTreeSet::from(["user", "ts"]);
        assert!(matches!(table.resolve(&names, false), Ok(Lookup::Index(_))));
    }

    #[test]
    fn resolve_bare_partition_key_needs_many() {
        let table = table_with_index();
        let names = BTreeSet::from(["id"]);
        assert!(matches!(table.resolve(&names, true), Ok(Lookup::Table)));
        assert!(matches!(
            table.resolve(&names, false),
            Err(StoreError::MissingKeyField(f)) if f == "ts"
        ));
    }

    #[test]
    fn resolve_unknown_field_fails() {
        let table = table_with_index();
        let names = BTreeSet::from(["nope"]);
        assert!(matches!(
            table.resolve(&names, true),
            Err(StoreError::NoAccessPath(_))
        ));
    }

    #[test]
    fn resolve_partial_multi_field_key_fails() {
        let table = table_with_index();
        let names = BTreeSet::from(["id", "nope"]);
        assert!(matches!(
            table.resolve(&names, true),
            Err(StoreError::KeyMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn vacant_key_values_are_rejected() {
        let table = table_with_index();
        let result = table.get(&fields! { "id" => "", "ts" => 1 }).await;
        assert!(matches!(result, Err(StoreError::VacantKeyValue(f)) if f == "id"));

        let result = table
            .get_many(&conditions! { "id" => 0 }, &GetManyOptions::default())
            .await;
        assert!(matches!(result, Err(StoreError::VacantKeyValue(_))));
    }

    #[tokio::test]
    async fn create_requires_key_fields() {
        let table = table_with_index();
        let result = table.create(fields! { "id" => "a" }).await;
        assert!(matches!(result, Err(StoreError::MissingKeyField(f)) if f == "ts"));
    }

    #[tokio::test]
    async fn update_rejects_wrong_key_shape() {
        let table = table_with_index();
        let result = table
            .update(&fields! { "id" => "a" }, &keygrid_core::updates! {})
            .await;
        assert!(matches!(result, Err(StoreError::KeyMismatch { .. })));
    }

    #[tokio::test]
    async fn batch_get_rejects_index_keys() {
        let table = table_with_index();
        let result = table.batch_get(&[fields! { "user" => "u1" }]).await;
        assert!(matches!(result, Err(StoreError::IndexUnsupported(_))));
    }

    #[tokio::test]
    async fn batch_get_empty_input_is_empty_output() {
        let table = table_with_index();
        assert!(table.batch_get(&[]).await.unwrap().is_empty());
        assert!(table.batch_get_map(&BTreeMap::new()).await.unwrap().is_empty());
    }
}

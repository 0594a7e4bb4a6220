//! In-memory table storage.
//!
//! A pure data-structure emulation of the managed store, used for local
//! runs and tests. Query semantics — ordering, pagination cutoffs, filter
//! timing, keys-only projection — intentionally reproduce the DynamoDB
//! backend's behavior, so code exercised against this backend behaves the
//! same in production.
//!
//! # Pagination
//!
//! Cursors are position-stable: they record the compound key of the last
//! item returned (or a numeric `offset` when there is no sort key to
//! compare by), and the next page resumes strictly after that key under a
//! deterministic ordering. Inserting or deleting records between pages
//! therefore never re-delivers an item that sorts at or before the cursor.
//!
//! # Persistence
//!
//! Optionally snapshots every table to a JSON file after each mutation.
//! A corrupt snapshot is logged and treated as empty storage; a failed
//! write is logged and the data stays in memory until the next write.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::{debug, warn};

use keygrid_core::{
    Condition, Fields, KeyConditions, Number, StoreError, StoreResult, Update, Updates, Value,
    validate_range_on_sort_key,
};

use crate::storage::{QueryOptions, TableStorage};

/// Cursor field used when a query has no sort key to compare by.
const OFFSET_FIELD: &str = "offset";

pub struct MemoryStorage {
    /// `table name -> ordered sequence of records`. The lock serializes
    /// every mutation end-to-end (including the snapshot flush); reads
    /// clone matching records out under the shared guard.
    tables: RwLock<HashMap<String, Vec<Fields>>>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            snapshot_path: None,
        }
    }

    /// Open storage backed by a snapshot file, loading any existing
    /// content. A missing or corrupt file starts empty.
    pub fn with_snapshot(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let tables = load_snapshot(&path);
        Self {
            tables: RwLock::new(tables),
            snapshot_path: Some(path),
        }
    }

    /// Write the full table set to the snapshot file, if one is
    /// configured. I/O failures are logged and swallowed; the next
    /// successful write overwrites the file.
    fn flush(&self, tables: &HashMap<String, Vec<Fields>>) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        let mut doc = serde_json::Map::new();
        for (name, records) in tables {
            let rows = records
                .iter()
                .map(|r| Value::Map(r.clone()).to_json())
                .collect();
            doc.insert(name.clone(), serde_json::Value::Array(rows));
        }
        let text = serde_json::Value::Object(doc).to_string();
        if let Err(e) = std::fs::write(path, text) {
            warn!(path = %path.display(), error = %e, "snapshot write failed; data stays in memory");
        }
    }

    /// Shared implementation behind `get_item`, `query`, and
    /// `query_index`.
    fn run_query(
        &self,
        table: &str,
        key: &KeyConditions,
        sort_key: Option<&str>,
        opts: &QueryOptions,
    ) -> StoreResult<(Vec<Fields>, Option<Fields>)> {
        let (eq, ranges) = Condition::split(key);
        validate_range_on_sort_key(&ranges, sort_key)?;

        let (filter_eq, filter_ranges) = match &opts.filter {
            Some(filter) => Condition::split(filter),
            None => Default::default(),
        };

        let mut matched: Vec<Fields> = {
            let guard = self.tables.read().expect("storage lock poisoned");
            guard
                .get(table)
                .map(|records| {
                    records
                        .iter()
                        .filter(|r| query_matches(r, &eq, &ranges))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        if let Some(sk) = sort_key {
            matched.sort_by(|a, b| a.get(sk).cmp(&b.get(sk)));
        }
        if opts.reverse {
            matched.reverse();
        }

        // Pair every candidate with its cursor, then drop everything at or
        // before the incoming cursor.
        let comp_field = sort_key.unwrap_or(OFFSET_FIELD);
        let mut with_cursors: Vec<(Fields, Fields)> = matched
            .into_iter()
            .enumerate()
            .map(|(i, record)| (extract_cursor(i, &record, key, sort_key), record))
            .collect();
        if let Some(token) = &opts.pagination_token {
            let flip = opts.reverse && sort_key.is_some();
            while with_cursors
                .first()
                .is_some_and(|(cursor, _)| at_or_before(cursor, token, comp_field, flip))
            {
                with_cursors.remove(0);
            }
        }

        let mut next_cursor = None;
        if let Some(limit) = opts.limit {
            if limit < with_cursors.len() {
                with_cursors.truncate(limit);
                next_cursor = with_cursors.last().map(|(cursor, _)| cursor.clone());
            }
        }

        // The filter runs last, after the limit slice, mirroring the
        // managed store: a page may come back empty yet carry a cursor.
        let records = with_cursors
            .into_iter()
            .filter(|(_, record)| query_matches(record, &filter_eq, &filter_ranges))
            .map(|(_, record)| record)
            .collect();
        Ok((records, next_cursor))
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TableStorage for MemoryStorage {
    async fn get_item(&self, table: &str, key: &Fields) -> StoreResult<Option<Fields>> {
        let conditions: KeyConditions = key
            .iter()
            .map(|(k, v)| (k.clone(), Condition::Eq(v.clone())))
            .collect();
        let (records, _) = self.run_query(table, &conditions, None, &QueryOptions::default())?;
        Ok(records.into_iter().next())
    }

    async fn batch_get_item(
        &self,
        table: &str,
        keys: &[(String, Fields)],
        _table_key_fields: &[String],
    ) -> StoreResult<std::collections::BTreeMap<String, Fields>> {
        let mut found = std::collections::BTreeMap::new();
        for (id, key) in keys {
            if let Some(record) = self.get_item(table, key).await? {
                found.insert(id.clone(), record);
            }
        }
        Ok(found)
    }

    async fn query(
        &self,
        table: &str,
        key: &KeyConditions,
        sort_key: Option<&str>,
        opts: &QueryOptions,
    ) -> StoreResult<(Vec<Fields>, Option<Fields>)> {
        self.run_query(table, key, sort_key, opts)
    }

    async fn query_index(
        &self,
        table: &str,
        index_name: &str,
        key: &KeyConditions,
        sort_key: Option<&str>,
        keys_only: bool,
        table_key_fields: &[String],
        opts: &QueryOptions,
    ) -> StoreResult<(Vec<Fields>, Option<Fields>)> {
        let (records, next_cursor) = self.run_query(table, key, sort_key, opts)?;
        if !keys_only {
            return Ok((records, next_cursor));
        }

        // A real keys-only index simply has no other attributes. The
        // emulation stores full records, so project them down to keep
        // callers from relying on fields the index would not serve.
        debug!(index = index_name, "projecting keys-only index result");
        let mut retained: BTreeSet<&str> = key.keys().map(String::as_str).collect();
        if let Some(sk) = sort_key {
            retained.insert(sk);
        }
        retained.extend(table_key_fields.iter().map(String::as_str));
        let projected = records
            .into_iter()
            .map(|record| {
                record
                    .into_iter()
                    .filter(|(k, _)| retained.contains(k.as_str()))
                    .collect()
            })
            .collect();
        Ok((projected, next_cursor))
    }

    async fn put(&self, table: &str, key: &Fields, record: &Fields) -> StoreResult<()> {
        let mut guard = self.tables.write().expect("storage lock poisoned");
        let records = guard.entry(table.to_string()).or_default();
        match find_by_key(records, key) {
            Some(i) => records[i] = record.clone(),
            None => records.push(record.clone()),
        }
        self.flush(&guard);
        Ok(())
    }

    async fn update(&self, table: &str, key: &Fields, updates: &Updates) -> StoreResult<Fields> {
        let mut guard = self.tables.write().expect("storage lock poisoned");
        let records = guard.entry(table.to_string()).or_default();
        let i = match find_by_key(records, key) {
            Some(i) => i,
            None => {
                records.push(key.clone());
                records.len() - 1
            }
        };
        for (field, update) in updates {
            apply_update(&mut records[i], field, update)?;
        }
        let updated = records[i].clone();
        self.flush(&guard);
        Ok(updated)
    }

    async fn delete(&self, table: &str, key: &Fields) -> StoreResult<Option<Fields>> {
        let mut guard = self.tables.write().expect("storage lock poisoned");
        let Some(records) = guard.get_mut(table) else {
            return Ok(None);
        };
        match find_by_key(records, key) {
            Some(i) => {
                let removed = records.remove(i);
                self.flush(&guard);
                Ok(Some(removed))
            }
            None => Ok(None),
        }
    }

    async fn item_count(&self, table: &str) -> StoreResult<u64> {
        let guard = self.tables.read().expect("storage lock poisoned");
        Ok(guard.get(table).map_or(0, |r| r.len() as u64))
    }

    async fn scan(
        &self,
        table: &str,
        limit: Option<usize>,
        pagination_token: Option<&Fields>,
    ) -> StoreResult<(Vec<Fields>, Option<Fields>)> {
        let guard = self.tables.read().expect("storage lock poisoned");
        let records = guard.get(table).map(Vec::as_slice).unwrap_or_default();

        let start = match pagination_token {
            Some(token) => cursor_offset(token)?,
            None => 0,
        };
        let remaining = records.get(start..).unwrap_or_default();

        let (slice, next_cursor) = match limit {
            Some(limit) if limit < remaining.len() => {
                let mut cursor = Fields::new();
                cursor.insert(
                    OFFSET_FIELD.to_string(),
                    Value::Num(Number::Int((start + limit) as i64)),
                );
                (&remaining[..limit], Some(cursor))
            }
            _ => (remaining, None),
        };
        Ok((slice.to_vec(), next_cursor))
    }
}

/// Whether a record satisfies all equality and range conditions.
fn query_matches(record: &Fields, eq: &Fields, ranges: &KeyConditions) -> bool {
    eq.iter().all(|(k, v)| record.get(k) == Some(v))
        && ranges.iter().all(|(k, cond)| cond.matches(record.get(k)))
}

/// Position of the record matching an equality key, if any.
fn find_by_key(records: &[Fields], key: &Fields) -> Option<usize> {
    records
        .iter()
        .position(|r| key.iter().all(|(k, v)| r.get(k) == Some(v)))
}

/// Build the cursor for the record at position `i`: the queried fields'
/// values, plus the sort-key value — or the numeric offset when there is
/// no sort key to compare by.
fn extract_cursor(i: usize, record: &Fields, key: &KeyConditions, sort_key: Option<&str>) -> Fields {
    let mut cursor = Fields::new();
    for field in key.keys() {
        if let Some(v) = record.get(field) {
            cursor.insert(field.clone(), v.clone());
        }
    }
    match sort_key {
        Some(sk) => {
            if let Some(v) = record.get(sk) {
                cursor.insert(sk.to_string(), v.clone());
            }
        }
        None => {
            cursor.insert(
                OFFSET_FIELD.to_string(),
                Value::Num(Number::Int(i as i64)),
            );
        }
    }
    cursor
}

/// Deterministic ordering projection of a cursor: the non-comparison
/// fields in name order, then the comparison (sort key or offset) value.
fn orderable<'a>(cursor: &'a Fields, comp_field: &str) -> (Vec<&'a Value>, Option<&'a Value>) {
    let partition = cursor
        .iter()
        .filter(|(k, _)| k.as_str() != comp_field)
        .map(|(_, v)| v)
        .collect();
    (partition, cursor.get(comp_field))
}

/// Whether `cursor` sorts at or before `token` in iteration order.
fn at_or_before(cursor: &Fields, token: &Fields, comp_field: &str, reverse: bool) -> bool {
    let a = orderable(cursor, comp_field);
    let b = orderable(token, comp_field);
    if reverse { b <= a } else { a <= b }
}

/// Read the numeric `offset` out of a scan cursor.
fn cursor_offset(token: &Fields) -> StoreResult<usize> {
    match token.get(OFFSET_FIELD) {
        Some(Value::Num(Number::Int(i))) if *i >= 0 => Ok(*i as usize),
        _ => Err(StoreError::BadToken(format!(
            "scan cursor without offset: {token:?}"
        ))),
    }
}

/// Apply one update operator to one field, in place.
fn apply_update(record: &mut Fields, field: &str, update: &Update) -> StoreResult<()> {
    match update {
        Update::Put(value) => {
            record.insert(field.to_string(), value.clone());
        }
        Update::Delete => {
            record.remove(field);
        }
        Update::Increment(delta) => {
            let current = match record.get(field) {
                None => Number::Int(0),
                Some(Value::Num(n)) => *n,
                Some(other) => return Err(type_mismatch(field, "a number", other)),
            };
            record.insert(field.to_string(), Value::Num(current.add(delta)));
        }
        Update::AddToStringSet(elements) => {
            let mut set = match record.get(field) {
                None => BTreeSet::new(),
                Some(Value::StrSet(s)) => s.clone(),
                Some(other) => return Err(type_mismatch(field, "a string set", other)),
            };
            set.extend(elements.iter().cloned());
            record.insert(field.to_string(), Value::StrSet(set));
        }
        Update::AddToNumberSet(elements) => {
            let mut set = match record.get(field) {
                None => BTreeSet::new(),
                Some(Value::NumSet(s)) => s.clone(),
                Some(other) => return Err(type_mismatch(field, "a number set", other)),
            };
            set.extend(elements.iter().copied());
            record.insert(field.to_string(), Value::NumSet(set));
        }
        Update::RemoveFromStringSet(elements) => {
            let set = match record.get(field) {
                None => BTreeSet::new(),
                Some(Value::StrSet(s)) => s.clone(),
                Some(other) => return Err(type_mismatch(field, "a string set", other)),
            };
            let remaining = set.difference(elements).cloned().collect();
            record.insert(field.to_string(), Value::StrSet(remaining));
        }
        Update::AddToList(elements) => {
            let mut list = match record.get(field) {
                None => Vec::new(),
                Some(Value::List(l)) => l.clone(),
                Some(other) => return Err(type_mismatch(field, "a list", other)),
            };
            list.extend(elements.iter().cloned());
            record.insert(field.to_string(), Value::List(list));
        }
    }
    Ok(())
}

fn type_mismatch(field: &str, expected: &str, got: &Value) -> StoreError {
    StoreError::TypeMismatch {
        field: field.to_string(),
        message: format!("expected {expected}, got: {got}"),
    }
}

/// Load tables from a snapshot file. Missing files start empty; corrupt
/// files are logged and start empty (the next write overwrites them).
fn load_snapshot(path: &Path) -> HashMap<String, Vec<Fields>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => return HashMap::new(),
    };
    match parse_snapshot(&text) {
        Ok(tables) => tables,
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "snapshot unreadable; the next write will overwrite it with a clean copy"
            );
            HashMap::new()
        }
    }
}

fn parse_snapshot(text: &str) -> Result<HashMap<String, Vec<Fields>>, String> {
    let json: serde_json::Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let doc = json.as_object().ok_or("snapshot root must be an object")?;
    let mut tables = HashMap::new();
    for (name, rows) in doc {
        let rows = rows
            .as_array()
            .ok_or_else(|| format!("table '{name}' must be an array"))?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match Value::from_json(row)? {
                Value::Map(record) => records.push(record),
                other => return Err(format!("record must be an object, got: {other}")),
            }
        }
        tables.insert(name.clone(), records);
    }
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygrid_core::{fields, str_set, updates};

    fn key_of(record: &Fields, names: &[&str]) -> Fields {
        names
            .iter()
            .map(|n| (n.to_string(), record[*n].clone()))
            .collect()
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let storage = MemoryStorage::new();
        let record = fields! { "id" => "a", "name" => "alpha" };
        let key = key_of(&record, &["id"]);

        storage.put("t", &key, &record).await.unwrap();
        assert_eq!(storage.get_item("t", &key).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn put_same_key_overwrites() {
        let storage = MemoryStorage::new();
        let key = fields! { "id" => "a" };
        storage.put("t", &key, &fields! { "id" => "a", "v" => 1 }).await.unwrap();
        storage.put("t", &key, &fields! { "id" => "a", "v" => 2 }).await.unwrap();

        assert_eq!(storage.item_count("t").await.unwrap(), 1);
        let record = storage.get_item("t", &key).await.unwrap().unwrap();
        assert_eq!(record["v"], Value::from(2));
    }

    #[tokio::test]
    async fn delete_returns_old_record() {
        let storage = MemoryStorage::new();
        let record = fields! { "id" => "a" };
        storage.put("t", &record, &record).await.unwrap();

        assert_eq!(storage.delete("t", &record).await.unwrap(), Some(record.clone()));
        assert_eq!(storage.delete("t", &record).await.unwrap(), None);
    }

    #[tokio::test]
    async fn update_upserts_missing_record() {
        let storage = MemoryStorage::new();
        let key = fields! { "id" => "a" };
        let updated = storage
            .update("t", &key, &updates! { "count" => Update::increment(5) })
            .await
            .unwrap();
        assert_eq!(updated["count"], Value::from(5));
        assert_eq!(updated["id"], Value::from("a"));
    }

    #[tokio::test]
    async fn update_set_on_scalar_is_a_type_error() {
        let storage = MemoryStorage::new();
        let key = fields! { "id" => "a" };
        storage
            .put("t", &key, &fields! { "id" => "a", "tags" => "oops" })
            .await
            .unwrap();

        let result = storage
            .update("t", &key, &updates! { "tags" => Update::add_to_string_set(["x"]) })
            .await;
        assert!(matches!(result, Err(StoreError::TypeMismatch { .. })));
    }

    #[tokio::test]
    async fn delete_update_removes_field() {
        let storage = MemoryStorage::new();
        let key = fields! { "id" => "a" };
        storage
            .put("t", &key, &fields! { "id" => "a", "stale" => 1 })
            .await
            .unwrap();

        let updated = storage
            .update("t", &key, &updates! { "stale" => Update::Delete })
            .await
            .unwrap();
        assert!(!updated.contains_key("stale"));
    }

    #[tokio::test]
    async fn scan_pages_by_offset() {
        let storage = MemoryStorage::new();
        for i in 1..=5 {
            let record = fields! { "id" => format!("r{i}") };
            storage.put("t", &record, &record).await.unwrap();
        }

        let (first, cursor) = storage.scan("t", Some(2), None).await.unwrap();
        assert_eq!(first.len(), 2);
        let cursor = cursor.unwrap();

        let (rest, cursor2) = storage.scan("t", None, Some(&cursor)).await.unwrap();
        assert_eq!(rest.len(), 3);
        assert_eq!(cursor2, None);
    }

    #[tokio::test]
    async fn snapshot_round_trips_sets_and_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tables.json");

        {
            let storage = MemoryStorage::with_snapshot(&path);
            let record = fields! {
                "id" => "a",
                "count" => 3,
                "ratio" => 1.5,
                "tags" => str_set!["x", "y"],
            };
            storage.put("t", &key_of(&record, &["id"]), &record).await.unwrap();
        }

        let storage = MemoryStorage::with_snapshot(&path);
        let record = storage
            .get_item("t", &fields! { "id" => "a" })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record["count"], Value::from(3));
        assert_eq!(record["ratio"], Value::from(1.5));
        assert_eq!(record["tags"], str_set!["x", "y"]);
    }

    #[tokio::test]
    async fn corrupt_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tables.json");
        std::fs::write(&path, "{not json").unwrap();

        let storage = MemoryStorage::with_snapshot(&path);
        assert_eq!(storage.item_count("t").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn keys_only_projection_drops_extra_fields() {
        let storage = MemoryStorage::new();
        let record = fields! { "id" => "a", "ts" => 1, "user" => "u1", "body" => "hidden" };
        storage.put("t", &key_of(&record, &["id", "ts"]), &record).await.unwrap();

        let key: KeyConditions = [("user".to_string(), Condition::eq("u1"))].into();
        let (records, _) = storage
            .query_index(
                "t",
                "user-index",
                &key,
                None,
                true,
                &["id".to_string(), "ts".to_string()],
                &QueryOptions::default(),
            )
            .await
            .unwrap();
        let names: Vec<_> = records[0].keys().cloned().collect();
        assert_eq!(names, vec!["id", "ts", "user"]);
    }
}

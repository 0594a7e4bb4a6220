//! DynamoDB table storage.
//!
//! Thin translation from the backend contract onto the AWS SDK: attribute
//! codec, `#name` / `:value` expression building, batch chunking with
//! unprocessed-key retry, and cursor passthrough via
//! `ExclusiveStartKey` / `LastEvaluatedKey`.
//!
//! Queries here are additionally bounded by DynamoDB's ~1MB response
//! ceiling, which the in-memory backend does not emulate; pages can
//! therefore be shorter than `limit` under load, but the cursor contract
//! is unchanged.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::types::{
    AttributeAction, AttributeValue, AttributeValueUpdate, KeysAndAttributes, ReturnValue,
};
use tracing::debug;

use keygrid_core::{
    Condition, ExponentialBackoff, Fields, KeyConditions, Number, StoreConfig, StoreError,
    StoreResult, Update, Updates, Value, make_table_name, validate_range_on_sort_key,
};

use crate::storage::{QueryOptions, TableStorage};

/// DynamoDB caps batch-get requests at this many keys.
const BATCH_GET_LIMIT: usize = 100;

/// Consecutive all-unprocessed rounds tolerated before giving up.
const MAX_FRUITLESS_ROUNDS: u32 = 8;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

pub struct DynamoStorage {
    client: Client,
    table_prefix: String,
}

impl DynamoStorage {
    pub fn new(client: Client, table_prefix: impl Into<String>) -> Self {
        Self {
            client,
            table_prefix: table_prefix.into(),
        }
    }

    /// Build a client from the default AWS credential chain, with an
    /// optional region override from the config.
    pub async fn from_env(config: &StoreConfig) -> StoreResult<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let shared = loader.load().await;
        Ok(Self::new(Client::new(&shared), config.table_prefix.clone()))
    }

    fn table_name(&self, table: &str) -> String {
        make_table_name(&self.table_prefix, table)
    }
}

#[async_trait]
impl TableStorage for DynamoStorage {
    async fn get_item(&self, table: &str, key: &Fields) -> StoreResult<Option<Fields>> {
        let output = self
            .client
            .get_item()
            .table_name(self.table_name(table))
            .set_key(Some(encode_fields(key)))
            .send()
            .await
            .map_err(map_err!(Backend))?;
        output.item.map(|item| decode_fields(&item)).transpose()
    }

    async fn batch_get_item(
        &self,
        table: &str,
        keys: &[(String, Fields)],
        table_key_fields: &[String],
    ) -> StoreResult<BTreeMap<String, Fields>> {
        let table_name = self.table_name(table);

        // The input may repeat keys; DynamoDB rejects duplicates, so each
        // distinct key is fetched once and fanned back out to its ids.
        let (distinct, key_to_ids) = coalesce_keys(keys);
        let mut to_query: Vec<HashMap<String, AttributeValue>> =
            distinct.iter().map(encode_fields).collect();

        let mut found = BTreeMap::new();
        let mut chunk: Vec<HashMap<String, AttributeValue>> = Vec::new();
        let mut backoff = ExponentialBackoff::new();
        let mut fruitless_rounds = 0u32;

        fill_chunk(&mut chunk, &mut to_query);
        while !chunk.is_empty() {
            let request_keys = KeysAndAttributes::builder()
                .set_keys(Some(chunk.clone()))
                .build()
                .map_err(map_err!(Backend))?;
            let output = self
                .client
                .batch_get_item()
                .request_items(table_name.clone(), request_keys)
                .send()
                .await
                .map_err(map_err!(Backend))?;

            let rows = output
                .responses
                .unwrap_or_default()
                .remove(&table_name)
                .unwrap_or_default();
            for row in &rows {
                let record = decode_fields(row)?;
                let record_key: Fields = table_key_fields
                    .iter()
                    .filter_map(|k| record.get(k).map(|v| (k.clone(), v.clone())))
                    .collect();
                for id in key_to_ids.get(&record_key).into_iter().flatten() {
                    found.insert(id.clone(), record.clone());
                }
            }

            // Anything throttled comes back as unprocessed keys; retry it
            // in the next round, but not forever.
            let unprocessed = output
                .unprocessed_keys
                .unwrap_or_default()
                .remove(&table_name)
                .map(|kaa| kaa.keys().to_vec())
                .unwrap_or_default();
            if rows.is_empty() && !unprocessed.is_empty() {
                fruitless_rounds += 1;
                if fruitless_rounds >= MAX_FRUITLESS_ROUNDS {
                    return Err(StoreError::Unavailable(format!(
                        "batch get on '{table_name}' still unprocessed after {fruitless_rounds} rounds"
                    )));
                }
            } else {
                fruitless_rounds = 0;
            }

            chunk = unprocessed;
            backoff
                .sleep_when(!chunk.is_empty() || !to_query.is_empty())
                .await;
            fill_chunk(&mut chunk, &mut to_query);
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
        self.run_query(table, None, key, sort_key, opts).await
    }

    async fn query_index(
        &self,
        table: &str,
        index_name: &str,
        key: &KeyConditions,
        sort_key: Option<&str>,
        _keys_only: bool,
        _table_key_fields: &[String],
        opts: &QueryOptions,
    ) -> StoreResult<(Vec<Fields>, Option<Fields>)> {
        // keys_only needs no handling here: a real keys-only index simply
        // has no other attributes to return.
        self.run_query(table, Some(index_name), key, sort_key, opts)
            .await
    }

    async fn put(&self, table: &str, _key: &Fields, record: &Fields) -> StoreResult<()> {
        self.client
            .put_item()
            .table_name(self.table_name(table))
            .set_item(Some(encode_fields(record)))
            .send()
            .await
            .map_err(map_err!(Backend))?;
        Ok(())
    }

    async fn update(&self, table: &str, key: &Fields, updates: &Updates) -> StoreResult<Fields> {
        let attribute_updates: HashMap<String, AttributeValueUpdate> = updates
            .iter()
            .map(|(field, update)| (field.clone(), encode_update(update)))
            .collect();
        let output = self
            .client
            .update_item()
            .table_name(self.table_name(table))
            .set_key(Some(encode_fields(key)))
            .set_attribute_updates(Some(attribute_updates))
            .return_values(ReturnValue::AllNew)
            .send()
            .await
            .map_err(map_err!(Backend))?;
        decode_fields(&output.attributes.unwrap_or_default())
    }

    async fn delete(&self, table: &str, key: &Fields) -> StoreResult<Option<Fields>> {
        let output = self
            .client
            .delete_item()
            .table_name(self.table_name(table))
            .set_key(Some(encode_fields(key)))
            .return_values(ReturnValue::AllOld)
            .send()
            .await
            .map_err(map_err!(Backend))?;
        output
            .attributes
            .filter(|attrs| !attrs.is_empty())
            .map(|attrs| decode_fields(&attrs))
            .transpose()
    }

    async fn item_count(&self, table: &str) -> StoreResult<u64> {
        let output = self
            .client
            .describe_table()
            .table_name(self.table_name(table))
            .send()
            .await
            .map_err(map_err!(Backend))?;
        let count = output.table.and_then(|t| t.item_count).unwrap_or(0);
        Ok(count.max(0) as u64)
    }

    async fn scan(
        &self,
        table: &str,
        limit: Option<usize>,
        pagination_token: Option<&Fields>,
    ) -> StoreResult<(Vec<Fields>, Option<Fields>)> {
        let output = self
            .client
            .scan()
            .table_name(self.table_name(table))
            .set_limit(limit.map(clamp_limit))
            .set_exclusive_start_key(pagination_token.map(encode_fields))
            .send()
            .await
            .map_err(map_err!(Backend))?;

        let records = output
            .items
            .unwrap_or_default()
            .iter()
            .map(decode_fields)
            .collect::<StoreResult<Vec<_>>>()?;
        let next_cursor = output
            .last_evaluated_key
            .map(|k| decode_fields(&k))
            .transpose()?;
        Ok((records, next_cursor))
    }
}

impl DynamoStorage {
    async fn run_query(
        &self,
        table: &str,
        index_name: Option<&str>,
        key: &KeyConditions,
        sort_key: Option<&str>,
        opts: &QueryOptions,
    ) -> StoreResult<(Vec<Fields>, Option<Fields>)> {
        let (key_expression, mut values, mut names) = prep_expression(key, sort_key, true)?;
        let filter_expression = match &opts.filter {
            Some(filter) => {
                let (expression, filter_values, filter_names) =
                    prep_expression(filter, None, false)?;
                values.extend(filter_values);
                names.extend(filter_names);
                Some(expression)
            }
            None => None,
        };

        let output = self
            .client
            .query()
            .table_name(self.table_name(table))
            .set_index_name(index_name.map(str::to_string))
            .key_condition_expression(key_expression)
            .set_filter_expression(filter_expression)
            .set_expression_attribute_values(Some(values))
            .set_expression_attribute_names(Some(names))
            .scan_index_forward(!opts.reverse)
            .set_limit(opts.limit.map(clamp_limit))
            .set_exclusive_start_key(opts.pagination_token.as_ref().map(encode_fields))
            .send()
            .await
            .map_err(map_err!(Backend))?;

        if opts.filter.is_some() && output.scanned_count > output.count {
            debug!(
                table,
                dropped_by_filter = output.scanned_count - output.count,
                "filter narrowed query page"
            );
        }

        let records = output
            .items
            .unwrap_or_default()
            .iter()
            .map(decode_fields)
            .collect::<StoreResult<Vec<_>>>()?;
        let next_cursor = output
            .last_evaluated_key
            .filter(|k| !k.is_empty())
            .map(|k| decode_fields(&k))
            .transpose()?;
        Ok((records, next_cursor))
    }
}

/// Collapse duplicate keys: the distinct keys in first-seen order, plus a
/// map from each key back to every caller id that asked for it.
fn coalesce_keys(keys: &[(String, Fields)]) -> (Vec<Fields>, BTreeMap<Fields, Vec<String>>) {
    let mut distinct = Vec::new();
    let mut key_to_ids: BTreeMap<Fields, Vec<String>> = BTreeMap::new();
    for (id, key) in keys {
        let ids = key_to_ids.entry(key.clone()).or_default();
        if ids.is_empty() {
            distinct.push(key.clone());
        }
        ids.push(id.clone());
    }
    (distinct, key_to_ids)
}

/// Top up `chunk` from `to_query` until it holds the batch limit.
fn fill_chunk(
    chunk: &mut Vec<HashMap<String, AttributeValue>>,
    to_query: &mut Vec<HashMap<String, AttributeValue>>,
) {
    let take = (BATCH_GET_LIMIT - chunk.len()).min(to_query.len());
    chunk.extend(to_query.drain(..take));
}

/// Render a condition map as a DynamoDB expression.
///
/// Field names are always escaped with a `#` placeholder so reserved
/// words never collide, and values go through `:` placeholders. Key
/// expressions reject range conditions off the sort key; filter
/// expressions allow them anywhere.
fn prep_expression(
    conditions: &KeyConditions,
    sort_key: Option<&str>,
    is_key_expression: bool,
) -> StoreResult<(String, HashMap<String, AttributeValue>, HashMap<String, String>)> {
    if is_key_expression {
        let (_, ranges) = Condition::split(conditions);
        validate_range_on_sort_key(&ranges, sort_key)?;
    }

    let expression = conditions
        .iter()
        .map(|(field, condition)| condition.expression(field))
        .collect::<Vec<_>>()
        .join(" AND ");

    let mut values = HashMap::new();
    for (field, condition) in conditions {
        for (placeholder, value) in condition.values(field) {
            values.insert(placeholder, encode_value(&value));
        }
    }

    let names = conditions
        .keys()
        .map(|field| (format!("#{field}"), field.clone()))
        .collect();

    Ok((expression, values, names))
}

/// Encode one update operator as a legacy `AttributeUpdates` entry.
fn encode_update(update: &Update) -> AttributeValueUpdate {
    let builder = AttributeValueUpdate::builder();
    match update {
        Update::Put(value) => builder
            .action(AttributeAction::Put)
            .value(encode_value(value))
            .build(),
        Update::Delete => builder.action(AttributeAction::Delete).build(),
        Update::Increment(delta) => builder
            .action(AttributeAction::Add)
            .value(AttributeValue::N(delta.to_string()))
            .build(),
        Update::AddToStringSet(elements) => builder
            .action(AttributeAction::Add)
            .value(AttributeValue::Ss(elements.iter().cloned().collect()))
            .build(),
        Update::AddToNumberSet(elements) => builder
            .action(AttributeAction::Add)
            .value(AttributeValue::Ns(
                elements.iter().map(Number::to_string).collect(),
            ))
            .build(),
        Update::RemoveFromStringSet(elements) => builder
            .action(AttributeAction::Delete)
            .value(AttributeValue::Ss(elements.iter().cloned().collect()))
            .build(),
        Update::AddToList(elements) => builder
            .action(AttributeAction::Add)
            .value(AttributeValue::L(
                elements.iter().map(encode_value).collect(),
            ))
            .build(),
    }
}

fn encode_fields(fields: &Fields) -> HashMap<String, AttributeValue> {
    fields
        .iter()
        .map(|(k, v)| (k.clone(), encode_value(v)))
        .collect()
}

fn decode_fields(item: &HashMap<String, AttributeValue>) -> StoreResult<Fields> {
    item.iter()
        .map(|(k, v)| Ok((k.clone(), decode_value(v)?)))
        .collect()
}

fn encode_value(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Num(n) => AttributeValue::N(n.to_string()),
        Value::Str(s) => AttributeValue::S(s.clone()),
        Value::StrSet(set) => AttributeValue::Ss(set.iter().cloned().collect()),
        Value::NumSet(set) => AttributeValue::Ns(set.iter().map(Number::to_string).collect()),
        Value::List(items) => AttributeValue::L(items.iter().map(encode_value).collect()),
        Value::Map(map) => AttributeValue::M(
            map.iter()
                .map(|(k, v)| (k.clone(), encode_value(v)))
                .collect(),
        ),
    }
}

fn decode_value(value: &AttributeValue) -> StoreResult<Value> {
    match value {
        AttributeValue::Null(_) => Ok(Value::Null),
        AttributeValue::Bool(b) => Ok(Value::Bool(*b)),
        AttributeValue::N(n) => decode_number(n).map(Value::Num),
        AttributeValue::S(s) => Ok(Value::Str(s.clone())),
        AttributeValue::Ss(items) => Ok(Value::StrSet(items.iter().cloned().collect())),
        AttributeValue::Ns(items) => Ok(Value::NumSet(
            items
                .iter()
                .map(|n| decode_number(n))
                .collect::<StoreResult<_>>()?,
        )),
        AttributeValue::L(items) => Ok(Value::List(
            items.iter().map(decode_value).collect::<StoreResult<_>>()?,
        )),
        AttributeValue::M(map) => Ok(Value::Map(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), decode_value(v)?)))
                .collect::<StoreResult<_>>()?,
        )),
        other => Err(StoreError::Codec(format!(
            "unsupported attribute type: {other:?}"
        ))),
    }
}

/// DynamoDB numbers arrive as strings; integral values stay exact.
fn decode_number(text: &str) -> StoreResult<Number> {
    if let Ok(i) = text.parse::<i64>() {
        return Ok(Number::Int(i));
    }
    text.parse::<f64>()
        .map(Number::from_f64)
        .map_err(|_| StoreError::Codec(format!("unparseable number: {text}")))
}

fn clamp_limit(limit: usize) -> i32 {
    i32::try_from(limit).unwrap_or(i32::MAX)
}

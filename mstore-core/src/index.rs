/// Secondary index maintenance and lookup
///
/// Every index keeps one bucket per distinct value (or value tuple, for a
/// composite index). A bucket is stored under its own backend key
///
///   `__index:{entity}:{index}:{base64url(bincode(values))}`
///
/// and holds the bincode-encoded set of record ids carrying that value.
/// Lookups load an index's buckets into a `BTreeMap` ordered by
/// `Value::storage_cmp`, so range operators walk a contiguous slice.
///
/// Before a write touches any bucket it records an intent listing those
/// bucket keys. An intent that survives a failed write is reconciled later
/// by recomputing the record's membership from its current payload.

use crate::backend::KvBackend;
use crate::compare::compare;
use crate::query::{Filter, FilterValue, Operator};
use crate::schema::{IndexDescriptor, SchemaDescriptor};
use crate::{Error, Item, Result, Value};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub const INDEX_PREFIX: &str = "__index";
pub const INTENT_PREFIX: &str = "__intent";

/// Ordered value tuple identifying one bucket
#[derive(Debug, Clone)]
pub struct IndexKey(pub Vec<Value>);

impl IndexKey {
    pub fn new(values: Vec<Value>) -> Self {
        IndexKey(values.iter().map(Value::canonical).collect())
    }

    pub fn single(value: Value) -> Self {
        Self::new(vec![value])
    }

    /// Value of the leading field
    pub fn head(&self) -> Option<&Value> {
        self.0.first()
    }

    /// Key component of the bucket's storage key
    pub fn encode(&self) -> Result<String> {
        let bytes = bincode::serialize(&self.0)?;
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| Error::Corruption(format!("bad bucket key '{}': {}", encoded, e)))?;
        let values: Vec<Value> = bincode::deserialize(&bytes)
            .map_err(|e| Error::Corruption(format!("bad bucket key '{}': {}", encoded, e)))?;
        Ok(IndexKey::new(values))
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            let ord = a.storage_cmp(b);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

/// Buckets of one index, ordered by key
pub type BucketMap = BTreeMap<IndexKey, BTreeSet<String>>;

/// Prefix shared by every bucket of one index
pub fn bucket_prefix(entity: &str, index: &str) -> String {
    format!("{}:{}:{}:", INDEX_PREFIX, entity, index)
}

pub fn bucket_storage_key(entity: &str, index: &str, key: &IndexKey) -> Result<String> {
    Ok(format!("{}{}", bucket_prefix(entity, index), key.encode()?))
}

pub fn intent_key(entity: &str, id: &str) -> String {
    format!("{}:{}:{}", INTENT_PREFIX, entity, id)
}

/// Bucket key of an item, or `None` when any indexed field is absent
pub fn key_for(index: &IndexDescriptor, item: &Item) -> Option<IndexKey> {
    index
        .fields
        .iter()
        .map(|field| item.get(field).cloned())
        .collect::<Option<Vec<_>>>()
        .map(IndexKey::new)
}

#[derive(Debug, Serialize, Deserialize)]
struct Intent {
    buckets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BucketTarget {
    index: String,
    unique: bool,
}

/// Bucket changes for one record write
#[derive(Debug, Default)]
pub struct IndexUpdate {
    remove: BTreeSet<String>,
    add: BTreeMap<String, BucketTarget>,
}

impl IndexUpdate {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty()
    }

    /// Every bucket storage key the update reads or writes
    pub fn touched(&self) -> impl Iterator<Item = &String> {
        self.remove.iter().chain(self.add.keys())
    }
}

/// Counts reported by a rebuild
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildStats {
    pub records: usize,
    pub buckets: usize,
}

pub struct IndexManager {
    backend: Arc<dyn KvBackend>,
}

impl IndexManager {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    /// Compute the bucket changes that take a record from `old` to `new`.
    ///
    /// Indexes whose key is unchanged contribute nothing, unless `stale`
    /// bucket keys from an interrupted write are given: then every current
    /// key is re-added and every stale key not among them is cleared.
    pub fn plan(
        &self,
        schema: &SchemaDescriptor,
        old: Option<&Item>,
        new: Option<&Item>,
        stale: Option<&[String]>,
    ) -> Result<IndexUpdate> {
        let entity = schema.entity();
        let mut update = IndexUpdate::default();

        for index in schema.indexes() {
            let old_key = old
                .and_then(|item| key_for(index, item))
                .map(|k| bucket_storage_key(entity, &index.name, &k))
                .transpose()?;
            let new_key = new
                .and_then(|item| key_for(index, item))
                .map(|k| bucket_storage_key(entity, &index.name, &k))
                .transpose()?;

            if old_key == new_key && stale.is_none() {
                continue;
            }
            if let Some(old_key) = old_key {
                if Some(&old_key) != new_key.as_ref() {
                    update.remove.insert(old_key);
                }
            }
            if let Some(new_key) = new_key {
                update.add.insert(
                    new_key,
                    BucketTarget {
                        index: index.name.clone(),
                        unique: index.unique,
                    },
                );
            }
        }

        for key in stale.unwrap_or_default() {
            if !update.add.contains_key(key) {
                update.remove.insert(key.clone());
            }
        }

        Ok(update)
    }

    /// Fail if the update would put `id` into a unique bucket held by
    /// another record. Must run under the bucket locks and before any write.
    pub fn check_unique(&self, entity: &str, id: &str, update: &IndexUpdate) -> Result<()> {
        for (key, target) in update.add.iter().filter(|(_, t)| t.unique) {
            let ids = self.load_set(key)?;
            if let Some(existing) = ids.iter().find(|other| other.as_str() != id) {
                return Err(Error::UniqueConstraintViolation {
                    entity: entity.to_string(),
                    index: target.index.clone(),
                    id: id.to_string(),
                    existing_id: existing.clone(),
                });
            }
        }
        Ok(())
    }

    /// Apply the update's bucket changes for `id`
    pub fn apply(&self, id: &str, update: &IndexUpdate) -> Result<()> {
        for key in &update.remove {
            let mut ids = self.load_set(key)?;
            if ids.remove(id) {
                self.store_set(key, &ids)?;
                tracing::debug!(bucket = %key, id, "removed id from bucket");
            }
        }
        for key in update.add.keys() {
            let mut ids = self.load_set(key)?;
            if ids.insert(id.to_string()) {
                self.store_set(key, &ids)?;
                tracing::debug!(bucket = %key, id, "added id to bucket");
            }
        }
        Ok(())
    }

    pub fn write_intent(&self, entity: &str, id: &str, update: &IndexUpdate) -> Result<()> {
        let intent = Intent {
            buckets: update.touched().cloned().collect(),
        };
        self.backend
            .set(&intent_key(entity, id), &bincode::serialize(&intent)?)
    }

    /// Bucket keys of a leftover intent, if any
    pub fn read_intent(&self, entity: &str, id: &str) -> Result<Option<Vec<String>>> {
        let key = intent_key(entity, id);
        match self.backend.get(&key)? {
            Some(bytes) => {
                let intent: Intent = bincode::deserialize(&bytes)
                    .map_err(|e| Error::Corruption(format!("bad intent '{}': {}", key, e)))?;
                Ok(Some(intent.buckets))
            }
            None => Ok(None),
        }
    }

    pub fn clear_intent(&self, entity: &str, id: &str) -> Result<()> {
        self.backend.delete(&intent_key(entity, id))?;
        Ok(())
    }

    /// Ids of records with a leftover intent
    pub fn pending_intents(&self, entity: &str) -> Result<Vec<String>> {
        let prefix = format!("{}:{}:", INTENT_PREFIX, entity);
        Ok(self
            .backend
            .list_keys(&prefix)?
            .into_iter()
            .map(|key| key[prefix.len()..].to_string())
            .collect())
    }

    fn load_set(&self, key: &str) -> Result<BTreeSet<String>> {
        match self.backend.get(key)? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| Error::Corruption(format!("bad bucket '{}': {}", key, e))),
            None => Ok(BTreeSet::new()),
        }
    }

    fn store_set(&self, key: &str, ids: &BTreeSet<String>) -> Result<()> {
        if ids.is_empty() {
            self.backend.delete(key)?;
            Ok(())
        } else {
            self.backend.set(key, &bincode::serialize(ids)?)
        }
    }

    /// Load every bucket of one index.
    ///
    /// Storage keys that decode to equal tuples are merged.
    pub fn load_buckets(&self, entity: &str, index: &str) -> Result<BucketMap> {
        let prefix = bucket_prefix(entity, index);
        let mut buckets = BucketMap::new();
        for key in self.backend.list_keys(&prefix)? {
            let index_key = IndexKey::decode(&key[prefix.len()..])?;
            let ids = self.load_set(&key)?;
            if !ids.is_empty() {
                buckets.entry(index_key).or_default().extend(ids);
            }
        }
        Ok(buckets)
    }

    /// Ids in the bucket for an exact key tuple
    pub fn bucket_ids(&self, entity: &str, index: &str, key: &IndexKey) -> Result<BTreeSet<String>> {
        self.load_set(&bucket_storage_key(entity, index, key)?)
    }

    /// Evaluate filters on the leading field of `index`.
    ///
    /// All filters must target that field; their results intersect.
    /// `universe` yields every id of the entity and is called at most once,
    /// only when a `!=` filter needs it.
    pub fn lookup<F>(
        &self,
        entity: &str,
        index: &IndexDescriptor,
        filters: &[&Filter],
        universe: F,
    ) -> Result<BTreeSet<String>>
    where
        F: FnOnce() -> Result<BTreeSet<String>>,
    {
        let buckets = self.load_buckets(entity, &index.name)?;
        let mut universe = Some(universe);
        let mut all_ids: Option<BTreeSet<String>> = None;
        let mut result: Option<BTreeSet<String>> = None;

        for filter in filters {
            let ids = match (filter.operator, &filter.value) {
                (Operator::Eq, FilterValue::Single(v)) => eq_ids(&buckets, v),
                (Operator::In, FilterValue::Set(values)) => {
                    values.iter().flat_map(|v| eq_ids(&buckets, v)).collect()
                }
                (Operator::Ne, FilterValue::Single(v)) => {
                    if let Some(load) = universe.take() {
                        all_ids = Some(load()?);
                    }
                    let equal = eq_ids(&buckets, v);
                    all_ids
                        .as_ref()
                        .map(|all| all.difference(&equal).cloned().collect())
                        .unwrap_or_default()
                }
                (op, FilterValue::Single(v)) if op.is_range() => range_ids(&buckets, op, v),
                (op, _) => {
                    return Err(Error::InvalidQuery(format!(
                        "Operator '{}' on '{}' has the wrong value shape",
                        op, filter.field
                    )))
                }
            };

            result = Some(match result {
                None => ids,
                Some(acc) => acc.intersection(&ids).cloned().collect(),
            });
        }

        Ok(result.unwrap_or_default())
    }

    /// Delete every bucket and intent of an entity; returns the number of
    /// keys removed.
    pub fn drop_all(&self, entity: &str) -> Result<usize> {
        let mut removed = 0;
        for prefix in [
            format!("{}:{}:", INDEX_PREFIX, entity),
            format!("{}:{}:", INTENT_PREFIX, entity),
        ] {
            for key in self.backend.list_keys(&prefix)? {
                if self.backend.delete(&key)? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Replace all buckets of an entity with ones computed from `records`.
    ///
    /// Unique indexes are checked over the whole set before anything is
    /// dropped. Callers must hold every lock stripe.
    pub fn rebuild<'a, I>(&self, schema: &SchemaDescriptor, records: I) -> Result<RebuildStats>
    where
        I: IntoIterator<Item = (&'a str, &'a Item)>,
    {
        let entity = schema.entity();
        let mut fresh: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut stats = RebuildStats::default();

        for (id, item) in records {
            stats.records += 1;
            for index in schema.indexes() {
                let Some(key) = key_for(index, item) else {
                    continue;
                };
                let storage_key = bucket_storage_key(entity, &index.name, &key)?;
                let ids = fresh.entry(storage_key).or_default();
                if index.unique {
                    if let Some(existing) = ids.iter().next() {
                        return Err(Error::UniqueConstraintViolation {
                            entity: entity.to_string(),
                            index: index.name.clone(),
                            id: id.to_string(),
                            existing_id: existing.clone(),
                        });
                    }
                }
                ids.insert(id.to_string());
            }
        }

        self.drop_all(entity)?;
        for (key, ids) in &fresh {
            self.store_set(key, ids)?;
        }
        stats.buckets = fresh.len();

        tracing::info!(
            entity,
            records = stats.records,
            buckets = stats.buckets,
            "rebuilt indexes"
        );
        Ok(stats)
    }
}

/// Ids in every bucket whose leading value equals `value`
fn eq_ids(buckets: &BucketMap, value: &Value) -> BTreeSet<String> {
    if value.contains_nan() {
        return BTreeSet::new();
    }
    let value = value.canonical();
    buckets
        .range(IndexKey(vec![value.clone()])..)
        .take_while(|(key, _)| key.head().is_some_and(|h| h.storage_cmp(&value) == Ordering::Equal))
        .flat_map(|(_, ids)| ids.iter().cloned())
        .collect()
}

/// Ids in buckets whose leading value satisfies `op value`.
///
/// The walk stays within the value's type and tests each bucket with the
/// same comparison a full scan uses.
fn range_ids(buckets: &BucketMap, op: Operator, value: &Value) -> BTreeSet<String> {
    let floor = match value {
        Value::Number(_) => Value::Number(f64::NEG_INFINITY),
        Value::String(_) => Value::String(String::new()),
        _ => return BTreeSet::new(),
    };
    let start = match op {
        Operator::Gt | Operator::Gte => value.canonical(),
        _ => floor,
    };
    let expected = FilterValue::Single(value.clone());

    buckets
        .range(IndexKey(vec![start])..)
        .take_while(|(key, _)| key.head().is_some_and(|h| h.same_type(value)))
        .filter(|(key, _)| compare(key.head(), op, &expected))
        .flat_map(|(_, ids)| ids.iter().cloned())
        .collect()
}

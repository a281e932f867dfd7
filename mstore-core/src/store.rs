/// Record store
///
/// CRUD over a `KvBackend`. Payloads live under `{entity}:{id}`; every write
/// keeps the entity's index buckets in step with the payload through the
/// `IndexManager`, under the record's lock stripe and the stripes of every
/// bucket it touches.

use crate::backend::KvBackend;
use crate::codec::Codec;
use crate::config::{ExtraAttributePolicy, StoreConfig};
use crate::error::ValidationReason;
use crate::index::{IndexManager, RebuildStats};
use crate::lock::LockTable;
use crate::record::Record;
use crate::schema::{SchemaDescriptor, SchemaRegistry, ID_ATTRIBUTE};
use crate::{Error, Item, Result, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Backend key of a record payload
pub fn storage_key(entity: &str, id: &str) -> String {
    format!("{}:{}", entity, id)
}

enum Change {
    Put { item: Item, payload: Vec<u8> },
    Delete,
    Reconcile,
}

pub struct RecordStore {
    registry: Arc<SchemaRegistry>,
    backend: Arc<dyn KvBackend>,
    codec: Arc<dyn Codec>,
    config: StoreConfig,
    locks: LockTable,
    indexes: IndexManager,
}

impl RecordStore {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        backend: Arc<dyn KvBackend>,
        codec: Arc<dyn Codec>,
        config: StoreConfig,
    ) -> Result<Self> {
        config.validate().map_err(Error::InvalidArgument)?;
        tracing::debug!(
            codec = codec.name(),
            lock_stripes = config.lock_stripes,
            "opening record store"
        );
        Ok(Self {
            registry,
            indexes: IndexManager::new(Arc::clone(&backend)),
            locks: LockTable::new(config.lock_stripes),
            backend,
            codec,
            config,
        })
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn indexes(&self) -> &IndexManager {
        &self.indexes
    }

    /// Build a new, unsaved record.
    ///
    /// An `id` in `data` is taken as-is (hydrating a known record) and
    /// skips the required-attribute check; otherwise a UUID v4 is assigned
    /// and every required attribute must be present.
    pub fn create(&self, entity: &str, mut data: Item) -> Result<Record> {
        let schema = self.registry.get(entity)?;

        let supplied_id = match data.remove(ID_ATTRIBUTE) {
            Some(Value::String(id)) if !id.is_empty() => Some(id),
            Some(_) => {
                return Err(Error::validation(
                    entity,
                    ValidationReason::TypeMismatch,
                    vec![ID_ATTRIBUTE.to_string()],
                ))
            }
            None => None,
        };

        let screened = self.screen(&schema, data)?;
        let hydrating = supplied_id.is_some();
        let id = supplied_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut record = Record::new(schema, id, Item::new());
        record.merge(screened);
        if !hydrating {
            record.validate()?;
        }
        Ok(record)
    }

    /// Assign fillable attributes on an existing record
    pub fn fill(&self, record: &mut Record, data: Item) -> Result<()> {
        if data.contains_key(ID_ATTRIBUTE) {
            return Err(Error::validation(
                record.entity(),
                ValidationReason::IdReassignment,
                vec![ID_ATTRIBUTE.to_string()],
            ));
        }
        let screened = self.screen(record.schema(), data)?;
        record.merge(screened);
        Ok(())
    }

    /// Apply the extra-attribute policy and type-check the remainder
    fn screen(&self, schema: &SchemaDescriptor, mut data: Item) -> Result<Item> {
        let mut unknown = Vec::new();
        let mut guarded = Vec::new();
        for name in data.keys() {
            match schema.attribute(name) {
                None => unknown.push(name.clone()),
                Some(attr) if !attr.fillable => guarded.push(name.clone()),
                Some(_) => {}
            }
        }

        if !unknown.is_empty() || !guarded.is_empty() {
            match self.config.extra_attributes {
                ExtraAttributePolicy::Strict if !unknown.is_empty() => {
                    return Err(Error::validation(
                        schema.entity(),
                        ValidationReason::UnknownAttributes,
                        unknown,
                    ))
                }
                ExtraAttributePolicy::Strict => {
                    return Err(Error::validation(
                        schema.entity(),
                        ValidationReason::NotFillable,
                        guarded,
                    ))
                }
                ExtraAttributePolicy::Warn => {
                    tracing::warn!(
                        entity = schema.entity(),
                        unknown = ?unknown,
                        not_fillable = ?guarded,
                        "dropping attributes outside the fillable set"
                    );
                }
                ExtraAttributePolicy::Off => {}
            }
            for name in unknown.iter().chain(guarded.iter()) {
                data.remove(name);
            }
        }

        let mismatched: Vec<String> = data
            .iter()
            .filter(|(name, value)| {
                schema
                    .attribute(name)
                    .is_some_and(|attr| !attr.accepts(value))
            })
            .map(|(name, _)| name.clone())
            .collect();
        if !mismatched.is_empty() {
            return Err(Error::validation(
                schema.entity(),
                ValidationReason::TypeMismatch,
                mismatched,
            ));
        }

        Ok(data)
    }

    /// Persist a record and update its index buckets.
    ///
    /// Fails without writing anything if a required attribute is missing, the
    /// payload cannot be encoded, or a unique index would be violated.
    pub fn save(&self, record: &mut Record) -> Result<()> {
        let schema = self.registry.get(record.entity())?;
        record.validate()?;

        let item = record.to_item();
        let payload = self.codec.serialize(&item)?;
        self.commit(&schema, record.id(), Change::Put { item, payload })?;

        tracing::debug!(entity = schema.entity(), id = record.id(), "saved record");
        record.mark_clean();
        Ok(())
    }

    /// Remove a record and its bucket memberships
    pub fn delete(&self, entity: &str, id: &str) -> Result<bool> {
        let schema = self.registry.get(entity)?;
        let existed = self.commit(&schema, id, Change::Delete)?;
        if existed {
            tracing::debug!(entity, id, "deleted record");
        }
        Ok(existed)
    }

    pub fn find_by_id(&self, entity: &str, id: &str) -> Result<Option<Record>> {
        let schema = self.registry.get(entity)?;
        if self.config.reconcile_on_read {
            self.reconcile_one(&schema, id)?;
        }
        self.load(&schema, id)
    }

    /// Ids of every stored record of an entity type
    pub fn list(&self, entity: &str) -> Result<Vec<String>> {
        self.registry.get(entity)?;
        let prefix = storage_key(entity, "");
        Ok(self
            .backend
            .list_keys(&prefix)?
            .into_iter()
            .map(|key| key[prefix.len()..].to_string())
            .collect())
    }

    pub fn count(&self, entity: &str) -> Result<usize> {
        Ok(self.list(entity)?.len())
    }

    /// Every record of an entity type, ordered by id
    pub fn all(&self, entity: &str) -> Result<Vec<Record>> {
        let schema = self.registry.get(entity)?;
        if self.config.reconcile_on_read {
            self.reconcile_entity(&schema)?;
        }
        let mut records = Vec::new();
        for id in self.list(entity)? {
            if let Some(record) = self.load(&schema, &id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Repair every leftover intent of an entity type; returns how many
    /// records were reconciled.
    pub fn reconcile(&self, entity: &str) -> Result<usize> {
        let schema = self.registry.get(entity)?;
        self.reconcile_entity(&schema)
    }

    pub(crate) fn reconcile_entity(&self, schema: &SchemaDescriptor) -> Result<usize> {
        let mut repaired = 0;
        for id in self.indexes.pending_intents(schema.entity())? {
            if self.reconcile_one(schema, &id)? {
                repaired += 1;
            }
        }
        Ok(repaired)
    }

    fn reconcile_one(&self, schema: &SchemaDescriptor, id: &str) -> Result<bool> {
        if self.indexes.read_intent(schema.entity(), id)?.is_none() {
            return Ok(false);
        }
        let repaired = self.commit(schema, id, Change::Reconcile)?;
        if repaired {
            tracing::info!(entity = schema.entity(), id, "reconciled interrupted write");
        }
        Ok(repaired)
    }

    /// Recompute every bucket of an entity type from stored payloads
    pub fn rebuild_indexes(&self, entity: &str) -> Result<RebuildStats> {
        let schema = self.registry.get(entity)?;
        let _guards = self.locks.lock_all();

        let mut items = Vec::new();
        for id in self.list(entity)? {
            if let Some(item) = self.load_item(&storage_key(entity, &id))? {
                items.push((id, item));
            }
        }
        self.indexes.rebuild(
            &schema,
            items.iter().map(|(id, item)| (id.as_str(), item)),
        )
    }

    /// Hydrate a record without reconciling
    pub(crate) fn load(&self, schema: &Arc<SchemaDescriptor>, id: &str) -> Result<Option<Record>> {
        Ok(self
            .load_item(&storage_key(schema.entity(), id))?
            .map(|item| Record::from_payload(Arc::clone(schema), id.to_string(), item)))
    }

    fn load_item(&self, key: &str) -> Result<Option<Item>> {
        match self.backend.get(key)? {
            Some(bytes) => Ok(Some(self.codec.deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Apply one change under the record's lock.
    ///
    /// The previous payload and any leftover intent are read under the
    /// record stripe; bucket stripes are then taken for every key the update
    /// touches. The intent is written before the first bucket write and
    /// removed after the payload write.
    fn commit(&self, schema: &SchemaDescriptor, id: &str, change: Change) -> Result<bool> {
        let entity = schema.entity();
        let key = storage_key(entity, id);
        let _record_guard = self.locks.lock_record(&key);

        let stale = self.indexes.read_intent(entity, id)?;
        let old = self.load_item(&key)?;

        match &change {
            Change::Delete if old.is_none() && stale.is_none() => return Ok(false),
            Change::Reconcile if stale.is_none() => return Ok(false),
            _ => {}
        }

        let new = match &change {
            Change::Put { item, .. } => Some(item),
            Change::Delete => None,
            Change::Reconcile => old.as_ref(),
        };

        let update = self
            .indexes
            .plan(schema, old.as_ref(), new, stale.as_deref())?;
        let _bucket_guards = self.locks.lock_buckets(update.touched());
        // reconcile restores what the payload says, even over a conflict
        if !matches!(change, Change::Reconcile) {
            self.indexes.check_unique(entity, id, &update)?;
        }

        if !update.is_empty() {
            self.indexes
                .write_intent(entity, id, &update)
                .map_err(|e| e.with_context(&format!("recording intent for {}", key)))?;
        }
        self.indexes
            .apply(id, &update)
            .map_err(|e| e.with_context(&format!("updating indexes for {}", key)))?;

        match &change {
            Change::Put { payload, .. } => self
                .backend
                .set(&key, payload)
                .map_err(|e| e.with_context(&format!("saving {}", key)))?,
            Change::Delete => {
                self.backend
                    .delete(&key)
                    .map_err(|e| e.with_context(&format!("deleting {}", key)))?;
            }
            Change::Reconcile => {}
        }

        if !update.is_empty() || stale.is_some() {
            self.indexes.clear_intent(entity, id)?;
        }

        Ok(match change {
            Change::Delete => old.is_some(),
            _ => true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::codec::JsonCodec;
    use crate::index::IndexKey;
    use crate::schema::{AttributeDescriptor, AttributeType, EntitySchema, IndexDescriptor};

    fn registry() -> Arc<SchemaRegistry> {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                EntitySchema::new("Person")
                    .attribute(AttributeDescriptor::new("name", AttributeType::String))
                    .attribute(AttributeDescriptor::new("age", AttributeType::Number))
                    .attribute(AttributeDescriptor::new("email", AttributeType::String).optional())
                    .attribute(AttributeDescriptor::new("owner", AttributeType::String).guarded())
                    .index(IndexDescriptor::on("age"))
                    .index(IndexDescriptor::on("email").unique()),
            )
            .unwrap();
        Arc::new(registry)
    }

    fn store_with(config: StoreConfig) -> (RecordStore, MemoryBackend) {
        let backend = MemoryBackend::new();
        let store = RecordStore::new(
            registry(),
            Arc::new(backend.clone()),
            Arc::new(JsonCodec),
            config,
        )
        .unwrap();
        (store, backend)
    }

    fn store() -> RecordStore {
        store_with(StoreConfig::default()).0
    }

    fn data(pairs: &[(&str, Value)]) -> Item {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_create_save_find() {
        let store = store();
        let mut record = store
            .create(
                "Person",
                data(&[("name", Value::from("John Doe")), ("age", Value::from(30))]),
            )
            .unwrap();
        assert_eq!(record.id().len(), 36);
        store.save(&mut record).unwrap();
        assert!(!record.is_dirty());

        let found = store.find_by_id("Person", record.id()).unwrap().unwrap();
        assert_eq!(found, record);
        assert_eq!(found.get("age"), Some(&Value::from(30)));
        assert_eq!(store.list("Person").unwrap(), vec![record.id().to_string()]);
        assert_eq!(store.count("Person").unwrap(), 1);
    }

    #[test]
    fn test_create_missing_required() {
        let err = store()
            .create("Person", data(&[("name", Value::from("x"))]))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation { reason: ValidationReason::MissingRequired, .. }
        ));
        assert_eq!(err.fields(), &["age".to_string()]);
    }

    #[test]
    fn test_create_with_id_hydrates() {
        let record = store()
            .create("Person", data(&[("id", Value::from("fixed")), ("name", Value::from("x"))]))
            .unwrap();
        assert_eq!(record.id(), "fixed");
    }

    #[test]
    fn test_unknown_entity() {
        let store = store();
        assert!(matches!(store.create("Ghost", Item::new()), Err(Error::SchemaNotFound(_))));
        assert!(matches!(store.list("Ghost"), Err(Error::SchemaNotFound(_))));
    }

    #[test]
    fn test_extra_attribute_policies() {
        let input = data(&[
            ("name", Value::from("x")),
            ("age", Value::from(1)),
            ("extra", Value::from(true)),
        ]);

        let err = store().create("Person", input.clone()).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation { reason: ValidationReason::UnknownAttributes, .. }
        ));

        for policy in [ExtraAttributePolicy::Warn, ExtraAttributePolicy::Off] {
            let (store, _) = store_with(StoreConfig::new().with_extra_attributes(policy));
            let mut record = store.create("Person", input.clone()).unwrap();
            assert!(record.get("extra").is_none());
            store.save(&mut record).unwrap();
            let found = store.find_by_id("Person", record.id()).unwrap().unwrap();
            assert!(found.get("extra").is_none());
        }
    }

    #[test]
    fn test_guarded_attribute_not_fillable() {
        let store = store();
        let err = store
            .create(
                "Person",
                data(&[
                    ("name", Value::from("x")),
                    ("age", Value::from(1)),
                    ("owner", Value::from("me")),
                ]),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation { reason: ValidationReason::NotFillable, .. }
        ));
    }

    #[test]
    fn test_type_mismatch() {
        let err = store()
            .create("Person", data(&[("name", Value::from("x")), ("age", Value::from("old"))]))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation { reason: ValidationReason::TypeMismatch, .. }
        ));
    }

    #[test]
    fn test_fill_partial_and_id_guard() {
        let store = store();
        let mut record = store
            .create("Person", data(&[("name", Value::from("Ada")), ("age", Value::from(36))]))
            .unwrap();
        let id = record.id().to_string();

        store.fill(&mut record, data(&[("age", Value::from(37))])).unwrap();
        assert_eq!(record.get("name"), Some(&Value::from("Ada")));
        assert_eq!(record.get("age"), Some(&Value::from(37)));

        let err = store
            .fill(&mut record, data(&[("id", Value::from("other"))]))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation { reason: ValidationReason::IdReassignment, .. }
        ));
        assert_eq!(record.id(), id);
    }

    #[test]
    fn test_delete_cleans_buckets() {
        let store = store();
        let mut record = store
            .create(
                "Person",
                data(&[
                    ("name", Value::from("Ada")),
                    ("age", Value::from(36)),
                    ("email", Value::from("ada@example.com")),
                ]),
            )
            .unwrap();
        store.save(&mut record).unwrap();

        assert!(store.delete("Person", record.id()).unwrap());
        assert!(!store.delete("Person", record.id()).unwrap());
        assert!(store.find_by_id("Person", record.id()).unwrap().is_none());
        assert!(store.indexes().load_buckets("Person", "ageIndex").unwrap().is_empty());
        assert!(store.indexes().load_buckets("Person", "emailIndex").unwrap().is_empty());
    }

    #[test]
    fn test_unique_violation_leaves_no_trace() {
        let store = store();
        let mut first = store
            .create(
                "Person",
                data(&[
                    ("name", Value::from("A")),
                    ("age", Value::from(1)),
                    ("email", Value::from("dup@example.com")),
                ]),
            )
            .unwrap();
        store.save(&mut first).unwrap();

        let mut second = store
            .create(
                "Person",
                data(&[
                    ("name", Value::from("B")),
                    ("age", Value::from(2)),
                    ("email", Value::from("dup@example.com")),
                ]),
            )
            .unwrap();
        let err = store.save(&mut second).unwrap_err();
        assert!(matches!(err, Error::UniqueConstraintViolation { .. }));
        assert!(store.find_by_id("Person", second.id()).unwrap().is_none());
        assert!(store
            .indexes()
            .bucket_ids("Person", "ageIndex", &IndexKey::single(Value::from(2)))
            .unwrap()
            .is_empty());
        assert!(store.indexes().pending_intents("Person").unwrap().is_empty());
    }

    #[test]
    fn test_read_reconciles_interrupted_write() {
        let store = store();
        let mut record = store
            .create("Person", data(&[("name", Value::from("Ada")), ("age", Value::from(20))]))
            .unwrap();
        store.save(&mut record).unwrap();
        let schema = store.registry().get("Person").unwrap();

        // buckets moved to 21 but the payload write never happened
        let old = record.to_item();
        let mut new = old.clone();
        new.insert("age".into(), Value::from(21));
        let update = store.indexes().plan(&schema, Some(&old), Some(&new), None).unwrap();
        store.indexes().write_intent("Person", record.id(), &update).unwrap();
        store.indexes().apply(record.id(), &update).unwrap();

        let found = store.find_by_id("Person", record.id()).unwrap().unwrap();
        assert_eq!(found.get("age"), Some(&Value::from(20)));

        let buckets = store.indexes().load_buckets("Person", "ageIndex").unwrap();
        assert_eq!(buckets.len(), 1);
        assert!(buckets[&IndexKey::single(Value::from(20))].contains(record.id()));
        assert!(store.indexes().pending_intents("Person").unwrap().is_empty());
    }

    #[test]
    fn test_reconcile_follows_payload_over_unique_conflict() {
        let (store, backend) = store_with(StoreConfig::default());
        let mut first = store
            .create(
                "Person",
                data(&[
                    ("name", Value::from("a")),
                    ("age", Value::from(1)),
                    ("email", Value::from("x@example.com")),
                ]),
            )
            .unwrap();
        store.save(&mut first).unwrap();
        let mut second = store
            .create(
                "Person",
                data(&[
                    ("name", Value::from("b")),
                    ("age", Value::from(2)),
                    ("email", Value::from("y@example.com")),
                ]),
            )
            .unwrap();
        store.save(&mut second).unwrap();
        let schema = store.registry().get("Person").unwrap();

        // payload landed with a taken email, buckets never moved
        let old = second.to_item();
        let mut new = old.clone();
        new.insert("email".into(), Value::from("x@example.com"));
        let update = store.indexes().plan(&schema, Some(&old), Some(&new), None).unwrap();
        store.indexes().write_intent("Person", second.id(), &update).unwrap();
        backend
            .set(&storage_key("Person", second.id()), &JsonCodec.serialize(&new).unwrap())
            .unwrap();

        assert_eq!(store.reconcile("Person").unwrap(), 1);
        let taken = store
            .indexes()
            .bucket_ids("Person", "emailIndex", &IndexKey::single(Value::from("x@example.com")))
            .unwrap();
        assert_eq!(taken.len(), 2);
        assert!(store
            .indexes()
            .bucket_ids("Person", "emailIndex", &IndexKey::single(Value::from("y@example.com")))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_rebuild_indexes() {
        let (store, backend) = store_with(StoreConfig::default());
        let mut record = store
            .create("Person", data(&[("name", Value::from("Ada")), ("age", Value::from(20))]))
            .unwrap();
        store.save(&mut record).unwrap();

        for key in backend.list_keys("__index:").unwrap() {
            backend.delete(&key).unwrap();
        }
        assert!(store.indexes().load_buckets("Person", "ageIndex").unwrap().is_empty());

        let stats = store.rebuild_indexes("Person").unwrap();
        assert_eq!(stats.records, 1);
        assert_eq!(store.indexes().load_buckets("Person", "ageIndex").unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = RecordStore::new(
            registry(),
            Arc::new(MemoryBackend::new()),
            Arc::new(JsonCodec),
            StoreConfig::new().with_lock_stripes(0),
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}

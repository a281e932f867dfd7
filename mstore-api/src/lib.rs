use mstore_core::{
    index::RebuildStats, BincodeCodec, Codec, CompiledQuery, FileBackend, Item, JsonCodec,
    KvBackend, MemoryBackend, QueryBuilder, QueryPlan, Record, RecordStore, Resolver, Result,
    SchemaRegistry, StoreConfig, Strategy, Value,
};
use std::path::Path;
use std::sync::Arc;

pub use mstore_core::{
    AttributeDescriptor, AttributeType, EntitySchema, Error as ModelstoreError,
    ExtraAttributePolicy, IndexDescriptor, Operator, Value as ModelstoreValue,
};

/// Modelstore database handle
///
/// Bundles a frozen schema registry, a backend, a payload codec and the
/// store configuration.
pub struct Database {
    store: RecordStore,
}

impl Database {
    /// Temporary database backed by memory
    pub fn create_in_memory(registry: SchemaRegistry) -> Result<Self> {
        Self::with_backend(
            Arc::new(MemoryBackend::new()),
            registry,
            Arc::new(JsonCodec),
            StoreConfig::default(),
        )
    }

    /// Open (or create) a database stored as one file per key under `path`
    pub fn open(path: impl AsRef<Path>, registry: SchemaRegistry) -> Result<Self> {
        Self::open_with_config(path, registry, StoreConfig::default())
    }

    pub fn open_with_config(
        path: impl AsRef<Path>,
        registry: SchemaRegistry,
        config: StoreConfig,
    ) -> Result<Self> {
        let backend = FileBackend::open(path)?;
        Self::with_backend(Arc::new(backend), registry, Arc::new(JsonCodec), config)
    }

    /// Directory database with compact binary payloads
    pub fn open_binary(path: impl AsRef<Path>, registry: SchemaRegistry) -> Result<Self> {
        let backend = FileBackend::open(path)?;
        Self::with_backend(
            Arc::new(backend),
            registry,
            Arc::new(BincodeCodec),
            StoreConfig::default(),
        )
    }

    /// Assemble a database from explicit collaborators
    pub fn with_backend(
        backend: Arc<dyn KvBackend>,
        registry: SchemaRegistry,
        codec: Arc<dyn Codec>,
        config: StoreConfig,
    ) -> Result<Self> {
        let store = RecordStore::new(Arc::new(registry), backend, codec, config)?;
        tracing::debug!(
            entities = store.registry().entities().count(),
            "database ready"
        );
        Ok(Self { store })
    }

    pub fn registry(&self) -> &SchemaRegistry {
        self.store.registry()
    }

    pub fn config(&self) -> &StoreConfig {
        self.store.config()
    }

    /// Underlying record store
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Build a new, unsaved record
    pub fn create(&self, entity: &str, data: Item) -> Result<Record> {
        self.store.create(entity, data)
    }

    /// Create and save in one step
    pub fn insert(&self, entity: &str, data: Item) -> Result<Record> {
        let mut record = self.store.create(entity, data)?;
        self.store.save(&mut record)?;
        Ok(record)
    }

    /// Assign fillable attributes on a record
    pub fn fill(&self, record: &mut Record, data: Item) -> Result<()> {
        self.store.fill(record, data)
    }

    pub fn save(&self, record: &mut Record) -> Result<()> {
        self.store.save(record)
    }

    pub fn find_by_id(&self, entity: &str, id: &str) -> Result<Option<Record>> {
        self.store.find_by_id(entity, id)
    }

    /// Start a query for an entity type
    pub fn query(&self, entity: &str) -> QueryBuilder {
        QueryBuilder::new(entity)
    }

    pub fn find(&self, query: &CompiledQuery) -> Result<Vec<Record>> {
        Resolver::new(&self.store).resolve(query)
    }

    pub fn find_first(&self, query: &CompiledQuery) -> Result<Option<Record>> {
        Resolver::new(&self.store).first(query)
    }

    /// Resolve with an explicit strategy, e.g. `Strategy::ForceScan`
    pub fn find_with(&self, query: &CompiledQuery, strategy: Strategy) -> Result<Vec<Record>> {
        Resolver::new(&self.store).resolve_with(query, strategy)
    }

    /// Access path chosen for each filtered field
    pub fn plan(&self, query: &CompiledQuery) -> Result<QueryPlan> {
        Resolver::new(&self.store).plan(query)
    }

    pub fn delete(&self, entity: &str, id: &str) -> Result<bool> {
        self.store.delete(entity, id)
    }

    /// Ids of all stored records of an entity type
    pub fn list(&self, entity: &str) -> Result<Vec<String>> {
        self.store.list(entity)
    }

    pub fn all(&self, entity: &str) -> Result<Vec<Record>> {
        self.store.all(entity)
    }

    pub fn count(&self, entity: &str) -> Result<usize> {
        self.store.count(entity)
    }

    /// Recompute an entity's index buckets from its payloads
    pub fn rebuild_indexes(&self, entity: &str) -> Result<RebuildStats> {
        self.store.rebuild_indexes(entity)
    }

    /// Repair index state left behind by interrupted writes
    pub fn reconcile(&self, entity: &str) -> Result<usize> {
        self.store.reconcile(entity)
    }
}

/// Helper to build attribute maps
pub struct ItemBuilder {
    item: Item,
}

impl ItemBuilder {
    pub fn new() -> Self {
        Self { item: Item::new() }
    }

    pub fn string(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.item.insert(key.into(), Value::string(value));
        self
    }

    pub fn number(mut self, key: impl Into<String>, value: impl Into<f64>) -> Self {
        self.item.insert(key.into(), Value::number(value));
        self
    }

    pub fn bool(mut self, key: impl Into<String>, value: bool) -> Self {
        self.item.insert(key.into(), Value::Bool(value));
        self
    }

    pub fn null(mut self, key: impl Into<String>) -> Self {
        self.item.insert(key.into(), Value::Null);
        self
    }

    pub fn value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.item.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Item {
        self.item
    }
}

impl Default for ItemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                EntitySchema::new("Person")
                    .attribute(AttributeDescriptor::new("name", AttributeType::String))
                    .attribute(AttributeDescriptor::new("age", AttributeType::Number))
                    .attribute(AttributeDescriptor::new("active", AttributeType::Boolean).optional())
                    .index(IndexDescriptor::on("age")),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_database_create_and_find() {
        let db = Database::create_in_memory(registry()).unwrap();

        let item = ItemBuilder::new()
            .string("name", "Alice")
            .number("age", 30)
            .bool("active", true)
            .build();

        let record = db.insert("Person", item.clone()).unwrap();
        let found = db.find_by_id("Person", record.id()).unwrap().unwrap();
        assert_eq!(found.attributes(), &item);
    }

    #[test]
    fn test_database_fill_and_save() {
        let db = Database::create_in_memory(registry()).unwrap();
        let mut record = db
            .insert("Person", ItemBuilder::new().string("name", "Bob").number("age", 40).build())
            .unwrap();

        db.fill(&mut record, ItemBuilder::new().number("age", 41).build())
            .unwrap();
        db.save(&mut record).unwrap();

        let found = db.find_by_id("Person", record.id()).unwrap().unwrap();
        assert_eq!(found.get("age"), Some(&Value::from(41)));
        assert_eq!(found.get("name"), Some(&Value::from("Bob")));
    }

    #[test]
    fn test_database_query() {
        let db = Database::create_in_memory(registry()).unwrap();
        for (name, age) in [("a", 20), ("b", 25), ("c", 30)] {
            db.insert("Person", ItemBuilder::new().string("name", name).number("age", age).build())
                .unwrap();
        }

        let query = db.query("Person").where_op("age", Operator::Gte, 25).build().unwrap();
        let found = db.find(&query).unwrap();
        assert_eq!(found.len(), 2);
        assert!(db.plan(&query).unwrap().uses_index());
        assert_eq!(db.find_with(&query, Strategy::ForceScan).unwrap(), found);

        let first = db
            .find_first(&db.query("Person").where_eq("name", "c").build().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(first.get("age"), Some(&Value::from(30)));
    }

    #[test]
    fn test_database_delete() {
        let db = Database::create_in_memory(registry()).unwrap();
        let record = db
            .insert("Person", ItemBuilder::new().string("name", "x").number("age", 1).build())
            .unwrap();

        assert_eq!(db.count("Person").unwrap(), 1);
        assert!(db.delete("Person", record.id()).unwrap());
        assert!(db.find_by_id("Person", record.id()).unwrap().is_none());
        assert_eq!(db.list("Person").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_database_open_persists() {
        let dir = TempDir::new().unwrap();
        let id = {
            let db = Database::open(dir.path(), registry()).unwrap();
            db.insert("Person", ItemBuilder::new().string("name", "Ada").number("age", 36).build())
                .unwrap()
                .id()
                .to_string()
        };

        let db = Database::open(dir.path(), registry()).unwrap();
        let found = db.find_by_id("Person", &id).unwrap().unwrap();
        assert_eq!(found.get("name"), Some(&Value::from("Ada")));

        let query = db.query("Person").where_eq("age", 36).build().unwrap();
        assert_eq!(db.find(&query).unwrap().len(), 1);
    }

    #[test]
    fn test_database_open_binary_keeps_nan() {
        let dir = TempDir::new().unwrap();
        let db = Database::open_binary(dir.path(), registry()).unwrap();
        let record = db
            .insert(
                "Person",
                ItemBuilder::new().string("name", "n").number("age", f64::NAN).build(),
            )
            .unwrap();
        let found = db.find_by_id("Person", record.id()).unwrap().unwrap();
        assert!(found.get("age").is_some_and(Value::is_nan));
    }

    #[test]
    fn test_json_payload_rejects_nan() {
        let db = Database::create_in_memory(registry()).unwrap();
        let err = db
            .insert(
                "Person",
                ItemBuilder::new().string("name", "n").number("age", f64::NAN).build(),
            )
            .unwrap_err();
        assert_eq!(err.code(), "SERIALIZATION_ERROR");
        assert_eq!(db.count("Person").unwrap(), 0);
    }

    #[test]
    fn test_record_to_json() {
        let db = Database::create_in_memory(registry()).unwrap();
        let record = db
            .insert("Person", ItemBuilder::new().string("name", "Ada").number("age", 36).build())
            .unwrap();
        let json = record.to_json().unwrap();
        assert_eq!(json["name"], serde_json::json!("Ada"));
        assert_eq!(json["age"], serde_json::json!(36));
        assert_eq!(json["id"], serde_json::json!(record.id()));
    }

    #[test]
    fn test_item_builder_default_is_empty() {
        assert!(ItemBuilder::default().build().is_empty());
        let item = ItemBuilder::default().number("age", 3).null("city").build();
        assert_eq!(item.get("age"), Some(&Value::from(3)));
        assert_eq!(item.get("city"), Some(&Value::Null));
    }
}

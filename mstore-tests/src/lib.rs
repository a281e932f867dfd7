/// Test utilities and helpers for modelstore testing
///
/// Shared schemas, a temporary-directory database wrapper, a deterministic
/// data generator and a backend that fails on demand.

use bytes::Bytes;
use mstore_api::{
    AttributeDescriptor, AttributeType, Database, EntitySchema, IndexDescriptor, ItemBuilder,
};
use mstore_core::{
    Error, Item, JsonCodec, KvBackend, MemoryBackend, Record, Result, SchemaRegistry, StoreConfig,
};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use tempfile::TempDir;

static TRACING: Once = Once::new();

/// Install a test subscriber honouring `RUST_LOG`; safe to call repeatedly
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// `Person { name, age, email?, city? }` indexed on age, with a unique email
/// index, plus `Employee` extending it.
pub fn person_schema() -> EntitySchema {
    EntitySchema::new("Person")
        .attribute(AttributeDescriptor::new("name", AttributeType::String))
        .attribute(AttributeDescriptor::new("age", AttributeType::Number))
        .attribute(AttributeDescriptor::new("email", AttributeType::String).optional())
        .attribute(AttributeDescriptor::new("city", AttributeType::String).optional())
        .index(IndexDescriptor::on("age"))
        .index(IndexDescriptor::on("email").unique())
}

pub fn person_registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    registry
        .register(person_schema())
        .expect("Failed to register Person");
    registry
        .register(
            EntitySchema::new("Employee")
                .extends("Person")
                .attribute(AttributeDescriptor::new("salary", AttributeType::Number))
                .index(IndexDescriptor::composite("citySalary", ["city", "salary"])),
        )
        .expect("Failed to register Employee");
    registry
}

/// Same attributes as `person_registry`'s Person, without any index
pub fn unindexed_person_registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    registry
        .register(
            EntitySchema::new("Person")
                .attribute(AttributeDescriptor::new("name", AttributeType::String))
                .attribute(AttributeDescriptor::new("age", AttributeType::Number))
                .attribute(AttributeDescriptor::new("email", AttributeType::String).optional())
                .attribute(AttributeDescriptor::new("city", AttributeType::String).optional()),
        )
        .expect("Failed to register Person");
    registry
}

/// Test database wrapper that manages temporary directory lifecycle
pub struct TestDatabase {
    pub db: Database,
    pub path: PathBuf,
    _temp_dir: Option<TempDir>,
}

impl TestDatabase {
    /// File-backed database in a fresh temporary directory
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().to_path_buf();
        let db = Database::open(&path, person_registry()).expect("Failed to create database");

        Self {
            db,
            path,
            _temp_dir: Some(temp_dir),
        }
    }

    /// In-memory database over the person registry
    pub fn in_memory() -> Self {
        Self::in_memory_with(StoreConfig::default())
    }

    pub fn in_memory_with(config: StoreConfig) -> Self {
        let db = Database::with_backend(
            Arc::new(MemoryBackend::new()),
            person_registry(),
            Arc::new(JsonCodec),
            config,
        )
        .expect("Failed to create in-memory database");

        Self {
            db,
            path: PathBuf::from(":memory:"),
            _temp_dir: None,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Close and reopen the database (for testing persistence)
    pub fn reopen(self) -> Self {
        let Self { db, path, _temp_dir } = self;
        drop(db);
        let db = Database::open(&path, person_registry()).expect("Failed to reopen database");
        Self { db, path, _temp_dir }
    }
}

impl Default for TestDatabase {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic `Person` data
pub struct PersonGenerator {
    counter: u64,
}

impl PersonGenerator {
    pub fn new() -> Self {
        Self { counter: 0 }
    }

    /// Next person: ages cycle through 20..60, emails are unique, every
    /// third person has no city.
    pub fn next_person(&mut self) -> Item {
        let idx = self.counter;
        self.counter += 1;

        let mut builder = ItemBuilder::new()
            .string("name", format!("person{}", idx))
            .number("age", (20 + idx % 40) as f64)
            .string("email", format!("person{}@example.com", idx));
        if idx % 3 != 0 {
            builder = builder.string("city", ["Lisbon", "Oslo"][(idx % 2) as usize]);
        }
        builder.build()
    }
}

impl Default for PersonGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Insert `count` generated people; returns their ids
pub fn insert_people(db: &Database, count: usize) -> Vec<String> {
    let mut gen = PersonGenerator::new();
    (0..count)
        .map(|_| {
            db.insert("Person", gen.next_person())
                .expect("Failed to insert person")
                .id()
                .to_string()
        })
        .collect()
}

/// Ids of a result set
pub fn ids(records: &[Record]) -> BTreeSet<String> {
    records.iter().map(|r| r.id().to_string()).collect()
}

/// Backend that fails writes to keys with a given prefix while armed
#[derive(Clone, Default)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    fail_prefix: Arc<Mutex<Option<String>>>,
    failures: Arc<AtomicUsize>,
}

impl FlakyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of the stored data
    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    /// Fail every `set`/`delete` on keys starting with `prefix`
    pub fn fail_writes_to(&self, prefix: impl Into<String>) {
        *self.fail_prefix.lock() = Some(prefix.into());
    }

    pub fn heal(&self) {
        *self.fail_prefix.lock() = None;
    }

    /// Number of injected failures so far
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    fn check(&self, key: &str) -> Result<()> {
        match self.fail_prefix.lock().as_deref() {
            Some(prefix) if key.starts_with(prefix) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                Err(Error::Storage(format!("injected failure writing {}", key)))
            }
            _ => Ok(()),
        }
    }
}

impl KvBackend for FlakyBackend {
    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check(key)?;
        self.inner.set(key, value)
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list_keys(prefix)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        self.check(key)?;
        self.inner.delete(key)
    }
}

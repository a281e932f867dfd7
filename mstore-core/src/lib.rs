pub mod error;
pub mod types;
pub mod config;
pub mod schema;
pub mod backend;
pub mod file_backend;
pub mod codec;
pub mod lock;
pub mod record;
pub mod query;
pub mod compare;
pub mod index;
pub mod store;
pub mod resolver;

pub use error::{Error, Result, ValidationReason};
pub use types::*;
pub use config::{ExtraAttributePolicy, StoreConfig};
pub use schema::{
    AttributeDescriptor, AttributeType, EntitySchema, IndexDescriptor, SchemaDescriptor,
    SchemaRegistry,
};
pub use backend::{KvBackend, MemoryBackend};
pub use file_backend::FileBackend;
pub use codec::{BincodeCodec, Codec, JsonCodec};
pub use record::Record;
pub use query::{CompiledQuery, Filter, FilterValue, Operator, QueryBuilder};
pub use index::{IndexKey, IndexManager, RebuildStats};
pub use store::RecordStore;
pub use resolver::{AccessPath, QueryPlan, Resolver, Strategy};

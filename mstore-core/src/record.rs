use crate::error::ValidationReason;
use crate::schema::{SchemaDescriptor, ID_ATTRIBUTE};
use crate::{Error, Item, Result, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// One entity instance
///
/// The id is fixed at creation. Attribute changes made through `set` (or
/// `RecordStore::fill`) are tracked in a change-set until the record is
/// saved.
#[derive(Debug, Clone)]
pub struct Record {
    id: String,
    attributes: Item,
    schema: Arc<SchemaDescriptor>,
    dirty: BTreeSet<String>,
}

impl Record {
    pub(crate) fn new(schema: Arc<SchemaDescriptor>, id: String, attributes: Item) -> Self {
        Self {
            id,
            attributes,
            schema,
            dirty: BTreeSet::new(),
        }
    }

    /// Rebuild a record from a stored payload; the payload's own `id` entry
    /// is dropped in favour of the storage key's id.
    pub(crate) fn from_payload(schema: Arc<SchemaDescriptor>, id: String, mut payload: Item) -> Self {
        payload.remove(ID_ATTRIBUTE);
        Self::new(schema, id, payload)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn entity(&self) -> &str {
        self.schema.entity()
    }

    pub fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    /// Attribute value; `id` is available through `id()`
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.attributes.get(field)
    }

    /// Attributes without the id
    pub fn attributes(&self) -> &Item {
        &self.attributes
    }

    /// Set one declared attribute.
    ///
    /// Unlike bulk assignment this may target non-fillable attributes, but
    /// never `id` or an undeclared name.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let field = field.into();
        let value = value.into();

        if field == ID_ATTRIBUTE {
            return Err(Error::validation(
                self.entity(),
                ValidationReason::IdReassignment,
                vec![field],
            ));
        }
        let Some(descriptor) = self.schema.attribute(&field) else {
            return Err(Error::validation(
                self.entity(),
                ValidationReason::UnknownAttributes,
                vec![field],
            ));
        };
        if !descriptor.accepts(&value) {
            return Err(Error::validation(
                self.entity(),
                ValidationReason::TypeMismatch,
                vec![field],
            ));
        }

        self.attributes.insert(field.clone(), value);
        self.dirty.insert(field);
        Ok(())
    }

    /// Insert already screened attributes
    pub(crate) fn merge(&mut self, data: Item) {
        for (field, value) in data {
            self.dirty.insert(field.clone());
            self.attributes.insert(field, value);
        }
    }

    /// Fields changed since the record was created, loaded or saved
    pub fn dirty_fields(&self) -> impl Iterator<Item = &str> {
        self.dirty.iter().map(String::as_str)
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty.clear();
    }

    /// Required attributes that have no value
    pub fn missing_required(&self) -> Vec<String> {
        self.schema
            .required()
            .iter()
            .filter(|name| !self.attributes.contains_key(name.as_str()))
            .cloned()
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        let missing = self.missing_required();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::validation(
                self.entity(),
                ValidationReason::MissingRequired,
                missing,
            ))
        }
    }

    /// Attribute map including `id`, as persisted
    pub fn to_item(&self) -> Item {
        let mut item = self.attributes.clone();
        item.insert(ID_ATTRIBUTE.to_string(), Value::String(self.id.clone()));
        item
    }

    /// JSON object view including `id`
    pub fn to_json(&self) -> Result<serde_json::Value> {
        serde_json::Value::try_from(&Value::Map(self.to_item()))
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.entity() == other.entity() && self.id == other.id && self.attributes == other.attributes
    }
}

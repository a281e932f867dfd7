/// Schema registry
///
/// Entity types are declared with `EntitySchema` and registered once, before
/// the registry is handed to a store. Registration resolves inheritance by
/// copying the parent's attributes and indexes (never sharing them), checks
/// index declarations, and caches the required and fillable views.

use crate::{Error, Result, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Name of the implicit primary key attribute
pub const ID_ATTRIBUTE: &str = "id";

/// Declared type of an attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeType {
    String,
    Number,
    Boolean,
    List,
    Map,
    /// Accepts any value
    Any,
    /// Nominal type reference; values are stored as maps
    Named(String),
}

impl AttributeType {
    /// Check if a value matches this type. `Null` is accepted only for
    /// optional attributes, which is decided by the caller.
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (AttributeType::Any, _) => true,
            (AttributeType::String, Value::String(_)) => true,
            (AttributeType::Number, Value::Number(_)) => true,
            (AttributeType::Boolean, Value::Bool(_)) => true,
            (AttributeType::List, Value::List(_)) => true,
            (AttributeType::Map, Value::Map(_)) => true,
            (AttributeType::Named(_), Value::Map(_)) => true,
            _ => false,
        }
    }
}

/// One declared attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeDescriptor {
    pub name: String,
    pub attr_type: AttributeType,
    pub optional: bool,
    pub fillable: bool,
}

impl AttributeDescriptor {
    /// Required, fillable attribute
    pub fn new(name: impl Into<String>, attr_type: AttributeType) -> Self {
        Self {
            name: name.into(),
            attr_type,
            optional: false,
            fillable: true,
        }
    }

    /// Mark the attribute optional
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Exclude the attribute from bulk assignment
    pub fn guarded(mut self) -> Self {
        self.fillable = false;
        self
    }

    /// Required means non-optional and fillable
    pub fn is_required(&self) -> bool {
        self.fillable && !self.optional
    }

    /// Check a value against the declared type
    pub fn accepts(&self, value: &Value) -> bool {
        if value.is_null() {
            return self.optional || self.attr_type == AttributeType::Any;
        }
        self.attr_type.matches(value)
    }
}

/// Secondary index definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescriptor {
    /// Index name (unique per entity type)
    pub name: String,
    /// Indexed attributes; more than one makes a composite index
    pub fields: Vec<String>,
    /// At most one record per bucket key
    pub unique: bool,
}

impl IndexDescriptor {
    /// Single-field index named `{field}Index`
    pub fn on(field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            name: format!("{}Index", field),
            fields: vec![field],
            unique: false,
        }
    }

    /// Composite index over ordered fields
    pub fn composite<S: Into<String>>(
        name: impl Into<String>,
        fields: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    /// Override the index name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Enforce uniqueness
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn is_composite(&self) -> bool {
        self.fields.len() > 1
    }

    pub fn leading_field(&self) -> &str {
        &self.fields[0]
    }
}

/// Schema declaration for one entity type
#[derive(Debug, Clone, Default)]
pub struct EntitySchema {
    name: String,
    extends: Option<String>,
    attributes: Vec<AttributeDescriptor>,
    indexes: Vec<IndexDescriptor>,
}

impl EntitySchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Inherit the attributes and indexes of a registered entity type
    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.extends = Some(parent.into());
        self
    }

    pub fn attribute(mut self, attribute: AttributeDescriptor) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn index(mut self, index: IndexDescriptor) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Registered schema of one entity type
#[derive(Debug, Clone)]
pub struct SchemaDescriptor {
    entity: String,
    parent: Option<String>,
    attributes: Vec<AttributeDescriptor>,
    positions: HashMap<String, usize>,
    indexes: Vec<IndexDescriptor>,
    required: Vec<String>,
    fillable: Vec<String>,
}

impl SchemaDescriptor {
    fn build(
        entity: String,
        parent: Option<String>,
        attributes: Vec<AttributeDescriptor>,
        indexes: Vec<IndexDescriptor>,
    ) -> Self {
        let positions = attributes
            .iter()
            .enumerate()
            .map(|(i, a)| (a.name.clone(), i))
            .collect();
        let required = attributes
            .iter()
            .filter(|a| a.is_required())
            .map(|a| a.name.clone())
            .collect();
        let fillable = attributes
            .iter()
            .filter(|a| a.fillable)
            .map(|a| a.name.clone())
            .collect();

        Self {
            entity,
            parent,
            attributes,
            positions,
            indexes,
            required,
            fillable,
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// Attributes in declaration order, `id` first
    pub fn attributes(&self) -> &[AttributeDescriptor] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.positions.get(name).map(|&i| &self.attributes[i])
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.positions.contains_key(name)
    }

    /// Names of non-optional, fillable attributes
    pub fn required(&self) -> &[String] {
        &self.required
    }

    /// Names of fillable attributes
    pub fn fillable(&self) -> &[String] {
        &self.fillable
    }

    pub fn is_fillable(&self, name: &str) -> bool {
        self.attribute(name).is_some_and(|a| a.fillable)
    }

    pub fn is_required(&self, name: &str) -> bool {
        self.attribute(name).is_some_and(|a| a.is_required())
    }

    pub fn indexes(&self) -> &[IndexDescriptor] {
        &self.indexes
    }

    pub fn index(&self, name: &str) -> Option<&IndexDescriptor> {
        self.indexes.iter().find(|idx| idx.name == name)
    }
}

/// Registry of entity schemas, keyed by entity type name
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: Vec<Arc<SchemaDescriptor>>,
    by_name: HashMap<String, usize>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity type.
    ///
    /// A parent named by `extends` must already be registered; its attribute
    /// and index lists are cloned before the child's declarations are merged
    /// in, so the parent is never affected.
    pub fn register(&mut self, schema: EntitySchema) -> Result<Arc<SchemaDescriptor>> {
        let EntitySchema {
            name,
            extends,
            attributes,
            indexes,
        } = schema;

        validate_entity_name(&name)?;
        if self.by_name.contains_key(&name) {
            return Err(Error::InvalidSchema(format!(
                "Entity type '{}' is already registered",
                name
            )));
        }

        let (mut merged_attrs, mut merged_indexes) = match &extends {
            Some(parent) => {
                let parent = self.get(parent).map_err(|_| {
                    Error::InvalidSchema(format!(
                        "Entity type '{}' extends unknown type '{}'",
                        name, parent
                    ))
                })?;
                (parent.attributes.clone(), parent.indexes.clone())
            }
            None => (
                vec![AttributeDescriptor::new(ID_ATTRIBUTE, AttributeType::String).guarded()],
                Vec::new(),
            ),
        };

        let mut seen = std::collections::HashSet::new();
        for attribute in attributes {
            if attribute.name == ID_ATTRIBUTE {
                return Err(Error::InvalidSchema(format!(
                    "'{}' declares the reserved attribute '{}'",
                    name, ID_ATTRIBUTE
                )));
            }
            if attribute.name.is_empty() {
                return Err(Error::InvalidSchema(format!(
                    "'{}' declares an attribute with an empty name",
                    name
                )));
            }
            if !seen.insert(attribute.name.clone()) {
                return Err(Error::InvalidSchema(format!(
                    "'{}' declares attribute '{}' twice",
                    name, attribute.name
                )));
            }
            match merged_attrs.iter_mut().find(|a| a.name == attribute.name) {
                Some(existing) => *existing = attribute,
                None => merged_attrs.push(attribute),
            }
        }

        let mut own_index_names = std::collections::HashSet::new();
        for index in indexes {
            if !own_index_names.insert(index.name.clone()) {
                return Err(Error::InvalidSchema(format!(
                    "'{}' declares index '{}' twice",
                    name, index.name
                )));
            }
            match merged_indexes.iter_mut().find(|i| i.name == index.name) {
                Some(existing) => *existing = index,
                None => merged_indexes.push(index),
            }
        }

        for index in &merged_indexes {
            validate_index(&name, index, &merged_attrs)?;
        }

        let descriptor = Arc::new(SchemaDescriptor::build(
            name.clone(),
            extends,
            merged_attrs,
            merged_indexes,
        ));
        self.by_name.insert(name, self.schemas.len());
        self.schemas.push(Arc::clone(&descriptor));
        Ok(descriptor)
    }

    /// Look up a registered schema
    pub fn get(&self, entity: &str) -> Result<Arc<SchemaDescriptor>> {
        self.by_name
            .get(entity)
            .map(|&i| Arc::clone(&self.schemas[i]))
            .ok_or_else(|| Error::SchemaNotFound(entity.to_string()))
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.by_name.contains_key(entity)
    }

    pub fn attributes_of(&self, entity: &str) -> Result<Vec<AttributeDescriptor>> {
        Ok(self.get(entity)?.attributes().to_vec())
    }

    pub fn required_of(&self, entity: &str) -> Result<Vec<String>> {
        Ok(self.get(entity)?.required().to_vec())
    }

    pub fn fillable_of(&self, entity: &str) -> Result<Vec<String>> {
        Ok(self.get(entity)?.fillable().to_vec())
    }

    pub fn indexes_of(&self, entity: &str) -> Result<Vec<IndexDescriptor>> {
        Ok(self.get(entity)?.indexes().to_vec())
    }

    /// Registered entity type names, in registration order
    pub fn entities(&self) -> impl Iterator<Item = &str> {
        self.schemas.iter().map(|s| s.entity())
    }
}

fn validate_entity_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(':') || name.starts_with("__") {
        return Err(Error::InvalidSchema(format!(
            "Invalid entity type name '{}': must be non-empty, contain no ':' and not start with '__'",
            name
        )));
    }
    Ok(())
}

fn validate_index(entity: &str, index: &IndexDescriptor, attributes: &[AttributeDescriptor]) -> Result<()> {
    if index.name.is_empty() || index.name.contains(':') {
        return Err(Error::InvalidSchema(format!(
            "'{}' has an index with invalid name '{}'",
            entity, index.name
        )));
    }
    if index.fields.is_empty() {
        return Err(Error::InvalidSchema(format!(
            "Index '{}' on '{}' has no fields",
            index.name, entity
        )));
    }
    for field in &index.fields {
        if field == ID_ATTRIBUTE {
            return Err(Error::InvalidSchema(format!(
                "Index '{}' on '{}' cannot include '{}'",
                index.name, entity, ID_ATTRIBUTE
            )));
        }
        if !attributes.iter().any(|a| &a.name == field) {
            return Err(Error::InvalidSchema(format!(
                "Index '{}' on '{}' references undeclared attribute '{}'",
                index.name, entity, field
            )));
        }
    }
    Ok(())
}

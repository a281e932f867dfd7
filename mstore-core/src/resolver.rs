/// Query resolution
///
/// Filters are grouped by field. Each field is answered either from an
/// index (exact single-field index first, then a composite index led by the
/// field whose other fields are all required) or by a full scan. Index
/// results intersect; every filter is then checked in one hydration pass
/// over the remaining candidates.

use crate::compare::matches_all;
use crate::query::CompiledQuery;
use crate::record::Record;
use crate::schema::{IndexDescriptor, SchemaDescriptor};
use crate::store::RecordStore;
use crate::{Error, Result};
use std::collections::BTreeSet;
use std::fmt;

/// How one field's filters are evaluated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessPath {
    Index { name: String, composite: bool },
    Scan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPlan {
    pub field: String,
    pub path: AccessPath,
    pub filters: usize,
}

/// Access path chosen for each filtered field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    pub entity: String,
    pub fields: Vec<FieldPlan>,
}

impl QueryPlan {
    pub fn uses_index(&self) -> bool {
        self.fields
            .iter()
            .any(|f| matches!(f.path, AccessPath::Index { .. }))
    }

    /// True if any field needs a scan, or there are no filters at all
    pub fn needs_scan(&self) -> bool {
        self.fields.is_empty() || self.fields.iter().any(|f| f.path == AccessPath::Scan)
    }

    pub fn path_of(&self, field: &str) -> Option<&AccessPath> {
        self.fields.iter().find(|f| f.field == field).map(|f| &f.path)
    }
}

impl fmt::Display for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.entity)?;
        if self.fields.is_empty() {
            return write!(f, " full scan");
        }
        for (i, field) in self.fields.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            match &field.path {
                AccessPath::Index { name, .. } => write!(f, "{}{} via {}", sep, field.field, name)?,
                AccessPath::Scan => write!(f, "{}{} via scan", sep, field.field)?,
            }
        }
        Ok(())
    }
}

/// Evaluation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Use indexes where they cover a field
    #[default]
    Auto,
    /// Ignore indexes; every field is scanned
    ForceScan,
}

pub struct Resolver<'a> {
    store: &'a RecordStore,
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a RecordStore) -> Self {
        Self { store }
    }

    pub fn plan(&self, query: &CompiledQuery) -> Result<QueryPlan> {
        let schema = self.store.registry().get(query.entity())?;
        Ok(plan_for(&schema, query, Strategy::Auto))
    }

    pub fn resolve(&self, query: &CompiledQuery) -> Result<Vec<Record>> {
        self.resolve_with(query, Strategy::Auto)
    }

    /// First match in id order
    pub fn first(&self, query: &CompiledQuery) -> Result<Option<Record>> {
        Ok(self.resolve(query)?.into_iter().next())
    }

    /// Matching records, ordered by id
    pub fn resolve_with(&self, query: &CompiledQuery, strategy: Strategy) -> Result<Vec<Record>> {
        let schema = self.store.registry().get(query.entity())?;
        if self.store.config().reconcile_on_read {
            self.store.reconcile_entity(&schema)?;
        }

        let plan = plan_for(&schema, query, strategy);
        tracing::debug!(plan = %plan, "resolving query");

        let mut candidates: Option<BTreeSet<String>> = None;

        for ((_, filters), field_plan) in query.grouped().into_iter().zip(&plan.fields) {
            match &field_plan.path {
                AccessPath::Index { name, .. } => {
                    let index = schema.index(name).ok_or_else(|| {
                        Error::InvalidSchema(format!("index '{}' vanished from {}", name, schema.entity()))
                    })?;
                    let ids = self.store.indexes().lookup(schema.entity(), index, &filters, || {
                        Ok(self.store.list(schema.entity())?.into_iter().collect())
                    })?;
                    candidates = Some(match candidates {
                        None => ids,
                        Some(acc) => acc.intersection(&ids).cloned().collect(),
                    });
                    if candidates.as_ref().is_some_and(BTreeSet::is_empty) {
                        return Ok(Vec::new());
                    }
                }
                AccessPath::Scan => {}
            }
        }

        let ids: Vec<String> = match candidates {
            Some(ids) => ids.into_iter().collect(),
            None => self.store.list(schema.entity())?,
        };

        // Buckets are written ahead of payloads, so index candidates are
        // re-checked against what was actually stored.
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            // payloads may vanish between lookup and hydration
            let Some(record) = self.store.load(&schema, &id)? else {
                continue;
            };
            if matches_all(&record.to_item(), query.filters()) {
                records.push(record);
            }
        }
        Ok(records)
    }
}

/// Pick an access path for every filtered field
pub fn plan_for(schema: &SchemaDescriptor, query: &CompiledQuery, strategy: Strategy) -> QueryPlan {
    let fields = query
        .grouped()
        .into_iter()
        .map(|(field, filters)| {
            let path = match strategy {
                Strategy::ForceScan => AccessPath::Scan,
                Strategy::Auto => match covering_index(schema, field) {
                    Some(index) => AccessPath::Index {
                        name: index.name.clone(),
                        composite: index.is_composite(),
                    },
                    None => AccessPath::Scan,
                },
            };
            FieldPlan {
                field: field.to_string(),
                path,
                filters: filters.len(),
            }
        })
        .collect();

    QueryPlan {
        entity: schema.entity().to_string(),
        fields,
    }
}

/// Index able to answer every filter on `field`.
///
/// A composite index only qualifies when `field` leads it and all its other
/// fields are required, so every record carrying `field` is in a bucket.
pub fn covering_index<'s>(schema: &'s SchemaDescriptor, field: &str) -> Option<&'s IndexDescriptor> {
    let indexes = schema.indexes();
    indexes
        .iter()
        .find(|idx| !idx.is_composite() && idx.leading_field() == field)
        .or_else(|| {
            indexes.iter().find(|idx| {
                idx.is_composite()
                    && idx.leading_field() == field
                    && idx.fields[1..].iter().all(|f| schema.is_required(f))
            })
        })
}

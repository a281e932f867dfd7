/// Query compiler
///
/// A `QueryBuilder` accumulates `{field, operator, value}` filters for one
/// entity type. `build()` validates them and returns an immutable
/// `CompiledQuery`, which the resolver evaluates with AND semantics.

use crate::{Error, Result, Value};
use std::fmt;
use std::str::FromStr;

/// Comparison operator of a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

impl Operator {
    /// True for the ordering operators (`>`, `>=`, `<`, `<=`)
    pub fn is_range(&self) -> bool {
        matches!(self, Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::In => "in",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Operator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "=" | "==" | "eq" => Ok(Operator::Eq),
            "!=" | "<>" | "ne" => Ok(Operator::Ne),
            ">" | "gt" => Ok(Operator::Gt),
            ">=" | "gte" => Ok(Operator::Gte),
            "<" | "lt" => Ok(Operator::Lt),
            "<=" | "lte" => Ok(Operator::Lte),
            "in" => Ok(Operator::In),
            other => Err(Error::InvalidQuery(format!("Unknown operator '{}'", other))),
        }
    }
}

/// Right-hand side of a filter
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Single(Value),
    Set(Vec<Value>),
}

macro_rules! impl_single_filter_value {
    ($($t:ty),+) => {
        $(
            impl From<$t> for FilterValue {
                fn from(value: $t) -> Self {
                    FilterValue::Single(Value::from(value))
                }
            }
        )+
    };
}

impl_single_filter_value!(Value, &str, String, bool, f64, i32, i64, u32);

impl From<Vec<Value>> for FilterValue {
    fn from(values: Vec<Value>) -> Self {
        FilterValue::Set(values)
    }
}

/// One `{field, operator, value}` predicate
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub operator: Operator,
    pub value: FilterValue,
}

impl Filter {
    /// The single comparison value; `None` for `in` filters.
    pub fn single(&self) -> Option<&Value> {
        match &self.value {
            FilterValue::Single(v) => Some(v),
            FilterValue::Set(_) => None,
        }
    }

    fn validate(&self) -> Result<()> {
        match (&self.operator, &self.value) {
            (Operator::In, FilterValue::Set(_)) => Ok(()),
            (Operator::In, FilterValue::Single(_)) => Err(Error::InvalidQuery(format!(
                "Operator 'in' on '{}' requires a set of values",
                self.field
            ))),
            (op, FilterValue::Set(_)) => Err(Error::InvalidQuery(format!(
                "Operator '{}' on '{}' takes a single value, not a set",
                op, self.field
            ))),
            (op, FilterValue::Single(v)) if op.is_range() => match v {
                Value::Number(_) | Value::String(_) => Ok(()),
                other => Err(Error::InvalidQuery(format!(
                    "Operator '{}' on '{}' cannot order {} values",
                    op,
                    self.field,
                    other.type_name()
                ))),
            },
            _ => Ok(()),
        }
    }
}

/// Immutable, validated predicate set for one entity type
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    entity: String,
    filters: Vec<Filter>,
}

impl CompiledQuery {
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Filters grouped by field, in order of first appearance
    pub fn grouped(&self) -> Vec<(&str, Vec<&Filter>)> {
        let mut groups: Vec<(&str, Vec<&Filter>)> = Vec::new();
        for filter in &self.filters {
            match groups.iter_mut().find(|(field, _)| *field == filter.field) {
                Some((_, group)) => group.push(filter),
                None => groups.push((filter.field.as_str(), vec![filter])),
            }
        }
        groups
    }
}

/// Fluent builder for `CompiledQuery`
#[derive(Debug, Clone, PartialEq)]
pub struct QueryBuilder {
    entity: String,
    filters: Vec<Filter>,
}

impl QueryBuilder {
    /// Start a query for an entity type
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            filters: Vec::new(),
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Add an equality filter
    pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        let value: Value = value.into();
        self.where_op(field, Operator::Eq, value)
    }

    /// Add a filter with an explicit operator
    ///
    /// For `Operator::In` the value must be a `FilterValue::Set`; this is
    /// checked by `build()`.
    pub fn where_op(
        mut self,
        field: impl Into<String>,
        operator: Operator,
        value: impl Into<FilterValue>,
    ) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            operator,
            value: value.into(),
        });
        self
    }

    /// Add an `in` filter
    pub fn where_in<V: Into<Value>>(
        self,
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let set = values.into_iter().map(Into::into).collect();
        self.where_op(field, Operator::In, FilterValue::Set(set))
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Validate the filters and snapshot them
    pub fn build(&self) -> Result<CompiledQuery> {
        for filter in &self.filters {
            filter.validate()?;
        }
        Ok(CompiledQuery {
            entity: self.entity.clone(),
            filters: self.filters.clone(),
        })
    }
}

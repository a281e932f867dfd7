use std::fmt;
use std::io;
use thiserror::Error;

/// Why a record failed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationReason {
    /// Required attributes were not supplied for a new record
    MissingRequired,
    /// Attributes not declared by the schema (strict policy only)
    UnknownAttributes,
    /// Declared attributes that may not be set through bulk assignment
    NotFillable,
    /// A fill attempted to change the record id
    IdReassignment,
    /// Values whose type does not match the attribute descriptor
    TypeMismatch,
}

impl fmt::Display for ValidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ValidationReason::MissingRequired => "missing required attributes",
            ValidationReason::UnknownAttributes => "unknown attributes",
            ValidationReason::NotFillable => "attributes are not fillable",
            ValidationReason::IdReassignment => "id cannot be reassigned",
            ValidationReason::TypeMismatch => "attribute type mismatch",
        };
        f.write_str(text)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation failed for {entity}: {reason} [{}]", .fields.join(", "))]
    Validation {
        entity: String,
        reason: ValidationReason,
        fields: Vec<String>,
    },

    #[error("Schema not found: {0}")]
    SchemaNotFound(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Unique constraint violation on {entity}.{index}: {id} conflicts with {existing_id}")]
    UniqueConstraintViolation {
        entity: String,
        index: String,
        id: String,
        existing_id: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("IO error: {context}: {source}")]
    IoContext {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    pub(crate) fn validation(
        entity: impl Into<String>,
        reason: ValidationReason,
        fields: Vec<String>,
    ) -> Self {
        Error::Validation {
            entity: entity.into(),
            reason,
            fields,
        }
    }

    /// Returns a stable error code for this error variant.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "VALIDATION_ERROR",
            Error::SchemaNotFound(_) => "SCHEMA_NOT_FOUND",
            Error::InvalidSchema(_) => "INVALID_SCHEMA",
            Error::UniqueConstraintViolation { .. } => "UNIQUE_CONSTRAINT_VIOLATION",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Io(_) | Error::IoContext { .. } => "IO_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::InvalidQuery(_) => "INVALID_QUERY",
            Error::Corruption(_) => "CORRUPTION",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
        }
    }

    /// Returns true if this error came from the backend rather than from the
    /// data or the schema.
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Io(_) | Error::IoContext { .. })
    }

    /// Returns true if this error is potentially retryable.
    ///
    /// The core never retries on its own; backend failures are surfaced to
    /// the caller, who may retry the whole operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Storage(_) | Error::Io(_) | Error::IoContext { .. } => true,

            Error::Validation { .. }
            | Error::SchemaNotFound(_)
            | Error::InvalidSchema(_)
            | Error::UniqueConstraintViolation { .. }
            | Error::Serialization(_)
            | Error::InvalidQuery(_)
            | Error::Corruption(_)
            | Error::InvalidArgument(_) => false,
        }
    }

    /// Offending field names for validation errors, empty otherwise.
    pub fn fields(&self) -> &[String] {
        match self {
            Error::Validation { fields, .. } => fields,
            _ => &[],
        }
    }

    /// Adds operation context to a backend error, leaving other variants as is.
    ///
    /// IO errors keep the underlying `io::Error` as their source.
    ///
    /// ```
    /// use mstore_core::Error;
    ///
    /// let err = Error::Storage("disk full".into()).with_context("saving Person:42");
    /// assert_eq!(err.to_string(), "Storage error: saving Person:42: disk full");
    /// ```
    pub fn with_context(self, context: &str) -> Error {
        match self {
            Error::Storage(msg) => Error::Storage(format!("{}: {}", context, msg)),
            Error::Io(source) => Error::IoContext {
                context: context.to_string(),
                source,
            },
            Error::IoContext {
                context: inner,
                source,
            } => Error::IoContext {
                context: format!("{}: {}", context, inner),
                source,
            },
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

use std::{borrow::Cow, fmt};

use serde::Serialize;
use thiserror::Error;

use crate::{auth::Operation, types::RecordRef};

/// Errors raised by a storage backend or the transaction scope in front of it.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying Redis command failed.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("failed to encode or decode a record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record kind `{kind}` is not declared in the schema")]
    UnknownKind { kind: String },

    /// Target record was not found when performing a mutation.
    #[error("record {record} not found")]
    NotFound { record: RecordRef },

    /// A direct relation points at a record that does not exist.
    #[error("{kind}.{field} references missing record {target}")]
    ForeignKey {
        kind: String,
        field: String,
        target: RecordRef,
    },

    #[error("{kind}.{field} may not be null")]
    NullReference { kind: String, field: String },

    #[error("`{kind}.{relation}` is not a many-to-many relation")]
    NotALink { kind: String, relation: String },

    /// Deleting the record would orphan protected references.
    #[error("cannot delete {record}: referenced by {}", join_refs(blocking))]
    Protected {
        record: RecordRef,
        blocking: Vec<RecordRef>,
    },

    /// Unique constraint violation - the value(s) already exist on another record.
    #[error("unique constraint violation on {kind}: fields {fields:?} with values {values:?} already exist on '{existing_id}'")]
    UniqueConstraintViolation {
        kind: String,
        fields: Vec<String>,
        values: Vec<String>,
        existing_id: String,
    },

    /// The backend's state moved since the transaction read it.
    #[error("concurrent write conflict: {guard}")]
    Conflict { guard: String },

    #[error("{message}")]
    Other { message: Cow<'static, str> },
}

/// Collection of validation issues encountered while preparing a record.
#[derive(Debug, Clone, Error)]
#[error("validation errors: {issues:?}")]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
    pub fn new<I>(issues: I) -> Self
    where
        I: IntoIterator<Item = ValidationIssue>,
    {
        Self {
            issues: issues.into_iter().collect(),
        }
    }

    /// Convenience helper for constructing a single-field validation error.
    pub fn single(field: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new([ValidationIssue::new(field, code, message)])
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Detailed validation failure for a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub field: String,
    pub code: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(field: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

pub type ValidationResult<T> = Result<T, ValidationError>;

/// Classification of one entry in a failed graph commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthorizationDenied,
    InvalidDocument,
    RequiredRelationUnresolvable,
    ScalarValidationFailed,
    ReferenceNotFound,
    ScopeUnresolved,
    ScopeAmbiguous,
    ConstraintViolation,
    ReferentialIntegrityBlocked,
    DeferredResolutionStalled,
    Storage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AuthorizationDenied => "authorization_denied",
            Self::InvalidDocument => "invalid_document",
            Self::RequiredRelationUnresolvable => "required_relation_unresolvable",
            Self::ScalarValidationFailed => "scalar_validation_failed",
            Self::ReferenceNotFound => "reference_not_found",
            Self::ScopeUnresolved => "scope_unresolved",
            Self::ScopeAmbiguous => "scope_ambiguous",
            Self::ConstraintViolation => "constraint_violation",
            Self::ReferentialIntegrityBlocked => "referential_integrity_blocked",
            Self::DeferredResolutionStalled => "deferred_resolution_stalled",
            Self::Storage => "storage",
        };
        f.write_str(name)
    }
}

/// A path-qualified failure entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphIssue {
    pub path: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl GraphIssue {
    pub fn new(path: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for GraphIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.path, self.kind, self.message)
    }
}

/// Top-level error returned by a graph commit. No variant leaves durable state behind.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The authorizer refused one of the writes; no transaction was opened.
    #[error("actor `{actor}` may not {operation} `{kind}` records (at {path})")]
    AuthorizationDenied {
        path: String,
        actor: String,
        kind: String,
        operation: Operation,
    },

    #[error("invalid document at {path}: {message}")]
    InvalidDocument { path: String, message: String },

    /// A required direct relation has no valid target.
    #[error("required relation at {path} cannot be resolved: {message}")]
    RequiredRelationUnresolvable { path: String, message: String },

    /// Pruning a collection hit records that other records still depend on.
    #[error("cannot delete {} at {path}: blocked by {}", join_refs(records), join_refs(blocking))]
    ReferentialIntegrityBlocked {
        path: String,
        records: Vec<RecordRef>,
        blocking: Vec<RecordRef>,
    },

    /// A full pass over the deferred queue made no progress.
    #[error("deferred resolution stalled with {} unresolved entries", issues.len())]
    DeferredResolutionStalled { issues: Vec<GraphIssue> },

    /// Storage failed while handling the node at `path`, or while committing when `path` is unset.
    #[error("{source}")]
    Store {
        path: Option<String>,
        source: StoreError,
    },
}

impl From<StoreError> for GraphError {
    fn from(source: StoreError) -> Self {
        Self::Store { path: None, source }
    }
}

impl GraphError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthorizationDenied { .. } => ErrorKind::AuthorizationDenied,
            Self::InvalidDocument { .. } => ErrorKind::InvalidDocument,
            Self::RequiredRelationUnresolvable { .. } => ErrorKind::RequiredRelationUnresolvable,
            Self::ReferentialIntegrityBlocked { .. } => ErrorKind::ReferentialIntegrityBlocked,
            Self::DeferredResolutionStalled { .. } => ErrorKind::DeferredResolutionStalled,
            Self::Store { .. } => ErrorKind::Storage,
        }
    }

    /// Attributes an unplaced storage failure to the node at `path`.
    pub(crate) fn located(self, path: impl fmt::Display) -> Self {
        match self {
            Self::Store { path: None, source } => Self::Store {
                path: Some(path.to_string()),
                source,
            },
            other => other,
        }
    }

    /// Flattens the error into the structured `{path, kind, message}` list handed to callers.
    pub fn issues(&self) -> Vec<GraphIssue> {
        match self {
            Self::DeferredResolutionStalled { issues } => issues.clone(),
            Self::InvalidDocument { path, message } | Self::RequiredRelationUnresolvable { path, message } => {
                vec![GraphIssue::new(path.clone(), self.kind(), message.clone())]
            }
            Self::ReferentialIntegrityBlocked { path, .. } | Self::AuthorizationDenied { path, .. } => {
                vec![GraphIssue::new(path.clone(), self.kind(), self.to_string())]
            }
            Self::Store { path, .. } => {
                vec![GraphIssue::new(path.as_deref().unwrap_or("root"), self.kind(), self.to_string())]
            }
        }
    }
}

fn join_refs(records: &[RecordRef]) -> String {
    records.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

//! Scope-qualified name resolution.
//!
//! A kind is *scoped* when it is a namespace or its parent chain reaches one.
//! Scoped kinds only resolve inside the namespace handed to [`lookup_scope`];
//! records of unscoped kinds are global and resolve anywhere.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::{
    errors::StoreError,
    schema::Schema,
    store::{Backend, TransactionScope},
    types::{Attributes, KindDescriptor},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(String),
    NotFound,
    /// More than one record matched inside the namespace.
    Ambiguous(Vec<String>),
    /// The kind is scoped but no namespace is known yet.
    NoNamespace,
}

/// Whether records of `kind` belong to a namespace.
pub fn is_scoped(schema: &Schema, kind: &str) -> bool {
    let mut visited = BTreeSet::new();
    let mut current = schema.kind(kind);
    while let Some(descriptor) = current {
        if descriptor.namespace {
            return true;
        }
        if !visited.insert(descriptor.name.as_str()) {
            return false;
        }
        current = descriptor
            .parent_relation()
            .and_then(|relation| schema.kind(&relation.target));
    }
    false
}

/// Id of the namespace record that `kind/id` belongs to, following parent relations.
pub async fn namespace_of<B: Backend>(
    tx: &mut TransactionScope<'_, B>,
    kind: &str,
    id: &str,
) -> Result<Option<String>, StoreError> {
    let schema = tx.schema();
    let mut visited = BTreeSet::new();
    let mut kind = kind.to_string();
    let mut id = id.to_string();

    loop {
        let Some(descriptor) = schema.kind(&kind) else {
            return Ok(None);
        };
        if descriptor.namespace {
            return Ok(Some(id));
        }
        if !visited.insert((kind.clone(), id.clone())) {
            return Ok(None);
        }
        let Some(parent) = descriptor.parent_relation() else {
            return Ok(None);
        };
        let Some(record) = tx.get(&kind, &id).await? else {
            return Ok(None);
        };
        let Some(Value::String(parent_id)) = record.attributes.get(&parent.name) else {
            return Ok(None);
        };
        id = parent_id.clone();
        kind = parent.target.clone();
    }
}

/// Namespace for a record that may not be stored yet.
///
/// Uses the record's parent relation when it is set and falls back to the
/// namespace inherited from the enclosing graph.
pub async fn record_namespace<B: Backend>(
    tx: &mut TransactionScope<'_, B>,
    kind: &KindDescriptor,
    record: &Attributes,
    inherited: Option<&str>,
) -> Result<Option<String>, StoreError> {
    if let Some(parent) = kind.parent_relation()
        && let Some(Value::String(parent_id)) = record.get(&parent.name)
    {
        let found = namespace_of(tx, &parent.target, parent_id).await?;
        if found.is_some() {
            return Ok(found);
        }
    }
    Ok(inherited.map(str::to_string))
}

/// Resolves `kind` records whose `scope_attribute` equals `scope_value` inside `namespace`.
pub async fn lookup_scope<B: Backend>(
    tx: &mut TransactionScope<'_, B>,
    kind: &str,
    scope_attribute: &str,
    scope_value: &Value,
    namespace: Option<&str>,
) -> Result<Resolution, StoreError> {
    let scoped = is_scoped(tx.schema(), kind);
    if scoped && namespace.is_none() {
        return Ok(Resolution::NoNamespace);
    }

    let mut matches = Vec::new();
    for candidate in tx.find(kind, scope_attribute, scope_value).await? {
        if !scoped || namespace_of(tx, kind, &candidate.id).await?.as_deref() == namespace {
            matches.push(candidate.id);
        }
    }

    Ok(match matches.len() {
        0 => Resolution::NotFound,
        1 => Resolution::Found(matches.remove(0)),
        _ => Resolution::Ambiguous(matches),
    })
}

//! Whole-collection reconciliation of reverse and many-to-many relations.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::{
    document::{Document, Node, Reference, RelationPayload},
    errors::{GraphError, StoreError},
    schema::Schema,
    store::Backend,
    types::{Attributes, Cardinality, KindDescriptor, Ownership, PersistedRecord, RecordRef, RelationDescriptor},
};

use super::{
    Change, Failure, Session,
    path::NodePath,
    queue::{Binding, DeferredOperation},
    scope::{self, Resolution},
};

fn relation_of<'a>(owner_kind: &'a KindDescriptor, name: &str, path: &NodePath) -> Result<&'a RelationDescriptor, GraphError> {
    owner_kind.find_relation(name).ok_or_else(|| GraphError::InvalidDocument {
        path: path.to_string(),
        message: format!("`{}` has no relation named `{name}`", owner_kind.name),
    })
}

async fn existing_children<B: Backend>(
    session: &mut Session<'_, B>,
    owner: &RecordRef,
    relation: &RelationDescriptor,
) -> Result<Vec<PersistedRecord>, StoreError> {
    match (relation.ownership, &relation.back_reference) {
        (Ownership::Reverse, Some(back_reference)) => {
            session
                .tx
                .find(&relation.target, back_reference, &Value::String(owner.id.clone()))
                .await
        }
        (Ownership::ManyToMany, _) => {
            let mut children = Vec::new();
            for id in session.tx.members(&owner.kind, &relation.name, &owner.id).await? {
                if let Some(child) = session.tx.get(&relation.target, &id).await? {
                    children.push(child);
                }
            }
            Ok(children)
        }
        _ => Ok(Vec::new()),
    }
}

/// Plans the replacement of `owner.relation` with the nodes in `payload`.
///
/// Each inline child is matched to an existing child by id, then by the
/// target kind's natural key, then (for to-one relations) by reusing the
/// single existing child. Existing children left unmatched are pruned
/// before any child is built.
pub(crate) async fn reconcile<B: Backend>(
    session: &mut Session<'_, B>,
    owner: &RecordRef,
    relation_name: &str,
    payload: &RelationPayload,
    namespace: Option<&str>,
    path: &NodePath,
) -> Result<Vec<DeferredOperation>, Failure> {
    let schema = session.tx.schema();
    let owner_kind = schema.require(&owner.kind)?;
    let relation = relation_of(owner_kind, relation_name, path)?;
    let target_kind = schema.require(&relation.target)?;

    let existing = existing_children(session, owner, relation).await?;
    let binding = match (&relation.ownership, &relation.back_reference) {
        (Ownership::Reverse, Some(back_reference)) => Binding::Child {
            owner: owner.clone(),
            relation: relation.name.clone(),
            back_reference: back_reference.clone(),
        },
        _ => Binding::Member {
            owner: owner.clone(),
            relation: relation.name.clone(),
        },
    };

    let mut kept = BTreeSet::new();
    let mut children = Vec::new();
    for (position, node) in payload.nodes().iter().enumerate() {
        let child_path = match relation.cardinality {
            Cardinality::Many => path.index(position),
            Cardinality::One => path.clone(),
        };
        let claim = |kept: &mut BTreeSet<String>, id: &str| {
            if kept.insert(id.to_string()) {
                Ok(())
            } else {
                Err(GraphError::InvalidDocument {
                    path: child_path.to_string(),
                    message: format!("{} appears more than once", RecordRef::new(relation.target.clone(), id)),
                })
            }
        };

        match node {
            Node::Inline(document) => {
                if document.kind != relation.target {
                    return Err(GraphError::InvalidDocument {
                        path: child_path.to_string(),
                        message: format!("expected a {} document, got {}", relation.target, document.kind),
                    }
                    .into());
                }
                let mut document = (**document).clone();
                if document.id.is_none() {
                    document.id = match_existing(target_kind, relation, &document.attributes, &existing, &kept);
                }
                if let Some(id) = &document.id {
                    claim(&mut kept, id)?;
                }
                children.push(DeferredOperation::Build {
                    document,
                    path: child_path.clone(),
                    namespace: namespace.map(str::to_string),
                    binding: binding.clone(),
                });
            }
            Node::Reference(reference) => {
                let reference = match reference {
                    Reference::Id { id } => {
                        claim(&mut kept, id)?;
                        reference.clone()
                    }
                    Reference::Scoped {
                        scope_attribute,
                        scope_value,
                    } => {
                        let resolution =
                            scope::lookup_scope(&mut session.tx, &relation.target, scope_attribute, scope_value, namespace)
                                .await
                                .map_err(|err| Failure::from_store(&child_path, err))?;
                        match resolution {
                            Resolution::Found(id) => {
                                claim(&mut kept, &id)?;
                                if relation.ownership == Ownership::Reverse {
                                    session.claimed.insert(RecordRef::new(relation.target.clone(), id.clone()));
                                }
                                Reference::Id { id }
                            }
                            _ => reference.clone(),
                        }
                    }
                };
                children.push(DeferredOperation::Assign {
                    reference,
                    kind: relation.target.clone(),
                    path: child_path.clone(),
                    namespace: namespace.map(str::to_string),
                    binding: binding.clone(),
                });
            }
        }
    }

    let stale: Vec<String> = existing
        .into_iter()
        .map(|child| child.id)
        .filter(|id| !kept.contains(id))
        .collect();

    let mut ops = Vec::with_capacity(children.len() + 1);
    if !stale.is_empty() {
        log::debug!("{path}: pruning {} stale {} records", stale.len(), relation.target);
        ops.push(DeferredOperation::Prune {
            owner: owner.clone(),
            relation: relation.name.clone(),
            records: stale,
            path: path.clone(),
        });
    }
    ops.extend(children);
    Ok(ops)
}

/// Whether an inline child without an id may be matched onto an existing record.
pub(crate) fn may_match_existing(
    target_kind: &KindDescriptor,
    relation: &RelationDescriptor,
    attributes: &Attributes,
) -> bool {
    let keyed = target_kind
        .natural_key
        .as_ref()
        .is_some_and(|natural_key| attributes.contains_key(natural_key));
    keyed || (relation.cardinality == Cardinality::One && relation.ownership == Ownership::Reverse)
}

/// Records the graph attaches by id to a reverse relation, anywhere in `document`.
pub(crate) fn collect_claims(schema: &Schema, document: &Document, claims: &mut BTreeSet<RecordRef>) {
    let owner_kind = schema.kind(&document.kind);
    for (name, payload) in &document.relations {
        let relation = owner_kind.and_then(|kind| kind.find_relation(name));
        let reverse = relation.filter(|relation| relation.ownership == Ownership::Reverse);
        for node in payload.nodes() {
            match node {
                Node::Inline(nested) => {
                    if let (Some(relation), Some(id)) = (reverse, &nested.id) {
                        claims.insert(RecordRef::new(relation.target.clone(), id.clone()));
                    }
                    collect_claims(schema, nested, claims);
                }
                Node::Reference(Reference::Id { id }) => {
                    if let Some(relation) = reverse {
                        claims.insert(RecordRef::new(relation.target.clone(), id.clone()));
                    }
                }
                Node::Reference(Reference::Scoped { .. }) => {}
            }
        }
    }
}

fn match_existing(
    target_kind: &KindDescriptor,
    relation: &RelationDescriptor,
    attributes: &Attributes,
    existing: &[PersistedRecord],
    kept: &BTreeSet<String>,
) -> Option<String> {
    let unclaimed = || existing.iter().filter(|child| !kept.contains(&child.id));

    if let Some(natural_key) = &target_kind.natural_key
        && let Some(value) = attributes.get(natural_key)
    {
        return unclaimed()
            .find(|child| child.attributes.get(natural_key) == Some(value))
            .map(|child| child.id.clone());
    }

    if relation.cardinality == Cardinality::One && relation.ownership == Ownership::Reverse {
        return unclaimed().next().map(|child| child.id.clone());
    }
    None
}

/// Removes `records` from `owner.relation`.
///
/// Reverse children are deleted unless another node of the graph claims them,
/// in which case they are left for that node to reparent. Many-to-many
/// members are only unlinked.
pub(crate) async fn prune<B: Backend>(
    session: &mut Session<'_, B>,
    owner: &RecordRef,
    relation_name: &str,
    records: &[String],
    path: &NodePath,
) -> Result<(), Failure> {
    let schema = session.tx.schema();
    let owner_kind = schema.require(&owner.kind)?;
    let relation = relation_of(owner_kind, relation_name, path)?;

    if relation.ownership == Ownership::ManyToMany {
        for member in records {
            session.tx.unlink(&owner.kind, &relation.name, &owner.id, member).await?;
        }
        return Ok(());
    }

    let doomed: Vec<RecordRef> = records
        .iter()
        .map(|id| RecordRef::new(relation.target.clone(), id.clone()))
        .filter(|record| !session.claimed.contains(record))
        .collect();
    if doomed.len() < records.len() {
        log::debug!("{path}: {} records move to another owner", records.len() - doomed.len());
    }
    if doomed.is_empty() {
        return Ok(());
    }
    match session.tx.delete_many(&doomed).await {
        Ok(deleted) => {
            for record in &deleted {
                session.touch(record, path, Change::Deleted);
            }
            Ok(())
        }
        Err(StoreError::Protected { blocking, .. }) => Err(GraphError::ReferentialIntegrityBlocked {
            path: path.to_string(),
            records: doomed,
            blocking,
        }
        .into()),
        Err(other) => Err(Failure::from_store(path, other)),
    }
}

//! Minimal record construction.
//!
//! [`build`] persists a record with only what it needs to exist: its scalars
//! and its required direct relations, recursing into inline documents for
//! the latter. Everything else becomes a [`DeferredOperation`].

use serde_json::Value;

use crate::{
    document::{Document, Node, Reference, RelationPayload},
    errors::{ErrorKind, GraphError, GraphIssue},
    store::Backend,
    types::{PersistedRecord, RecordRef},
    validation,
};

use super::{
    Change, Failure, Session,
    classify::{PresentRelation, classify},
    path::NodePath,
    queue::{Binding, DeferredOperation, scope_issue},
    scope::{self, Resolution},
};

#[derive(Debug, Clone, Copy)]
pub(crate) struct BuildContext<'c> {
    pub path: &'c NodePath,
    /// Namespace inherited from the enclosing graph.
    pub namespace: Option<&'c str>,
    /// Back-reference injected by a reverse relation: `(field, owner id)`.
    pub back_reference: Option<(&'c str, &'c str)>,
}

#[derive(Debug)]
pub(crate) struct Built {
    pub record: PersistedRecord,
    pub deferred: Vec<DeferredOperation>,
}

pub(crate) async fn build<B: Backend>(
    session: &mut Session<'_, B>,
    document: &Document,
    ctx: BuildContext<'_>,
) -> Result<Built, Failure> {
    let schema = session.tx.schema();
    let path = ctx.path;
    let Some(kind) = schema.kind(&document.kind) else {
        return Err(GraphError::InvalidDocument {
            path: path.to_string(),
            message: format!("unknown kind `{}`", document.kind),
        }
        .into());
    };
    let classified = classify(kind, document, path)?;

    let existing = match &document.id {
        Some(id) => match session.tx.get(&kind.name, id).await? {
            Some(record) => Some(record),
            None => {
                return Err(GraphError::InvalidDocument {
                    path: path.to_string(),
                    message: format!("{} does not exist", RecordRef::new(kind.name.clone(), id.clone())),
                }
                .into());
            }
        },
        None => None,
    };
    let creating = existing.is_none();

    let mut record = existing.as_ref().map(|found| found.attributes.clone()).unwrap_or_default();
    record.extend(classified.scalars.clone());
    if creating {
        validation::fill_defaults(kind, &mut record);
    }

    let injected = ctx.back_reference.map(|(field, _)| field);
    if let Some((field, owner_id)) = ctx.back_reference {
        record.insert(field.to_string(), Value::String(owner_id.to_string()));
    }

    let mut deferred = Vec::new();
    let mut scoped = Vec::new();

    for present in &classified.required {
        let relation = present.relation;
        if injected == Some(relation.name.as_str()) {
            continue;
        }
        let relation_path = path.child(&relation.name);
        let node = match &present.payload {
            RelationPayload::One(node) => node,
            RelationPayload::Null | RelationPayload::Many(_) => {
                return Err(GraphError::RequiredRelationUnresolvable {
                    path: relation_path.to_string(),
                    message: format!("`{}.{}` may not be null", kind.name, relation.name),
                }
                .into());
            }
        };
        match node {
            Node::Reference(Reference::Id { id }) => {
                let found = session
                    .tx
                    .exists(&relation.target, id)
                    .await
                    .map_err(|err| Failure::from_store(&relation_path, err))?;
                if !found {
                    return Err(GraphError::RequiredRelationUnresolvable {
                        path: relation_path.to_string(),
                        message: format!("{} does not exist", RecordRef::new(relation.target.clone(), id.clone())),
                    }
                    .into());
                }
                record.insert(relation.name.clone(), Value::String(id.clone()));
            }
            Node::Reference(Reference::Scoped { .. }) => scoped.push(present),
            Node::Inline(nested) => {
                if nested.kind != relation.target {
                    return Err(GraphError::InvalidDocument {
                        path: relation_path.to_string(),
                        message: format!("expected a {} document, got {}", relation.target, nested.kind),
                    }
                    .into());
                }
                let built = Box::pin(build(
                    session,
                    nested,
                    BuildContext {
                        path: &relation_path,
                        namespace: ctx.namespace,
                        back_reference: None,
                    },
                ))
                .await?;
                record.insert(relation.name.clone(), Value::String(built.record.id.clone()));
                deferred.extend(built.deferred);
            }
        }
    }

    if creating {
        for relation in kind.direct_relations().filter(|relation| !relation.nullable) {
            let supplied = record.get(&relation.name).is_some_and(|value| !value.is_null())
                || scoped.iter().any(|present| present.relation.name == relation.name);
            if !supplied {
                return Err(GraphError::RequiredRelationUnresolvable {
                    path: path.child(&relation.name).to_string(),
                    message: format!("`{}.{}` is required", kind.name, relation.name),
                }
                .into());
            }
        }
    }

    let namespace = scope::record_namespace(&mut session.tx, kind, &record, ctx.namespace).await?;

    let mut issues = Vec::new();
    for present in scoped {
        let PresentRelation {
            relation,
            payload: RelationPayload::One(Node::Reference(Reference::Scoped {
                scope_attribute,
                scope_value,
            })),
        } = present
        else {
            continue;
        };
        let relation_path = path.child(&relation.name);
        let resolution = scope::lookup_scope(
            &mut session.tx,
            &relation.target,
            scope_attribute,
            scope_value,
            namespace.as_deref(),
        )
        .await
        .map_err(|err| Failure::from_store(&relation_path, err))?;
        match resolution {
            Resolution::Found(id) => {
                record.insert(relation.name.clone(), Value::String(id));
            }
            other => issues.push(scope_issue(&relation_path, &relation.target, scope_attribute, scope_value, &other)),
        }
    }
    if !issues.is_empty() {
        return Err(Failure::Retry(issues));
    }

    for present in &classified.optional {
        if present.payload == RelationPayload::Null && injected != Some(present.relation.name.as_str()) {
            record.insert(present.relation.name.clone(), Value::Null);
        }
    }

    if let Err(error) = validation::validate_record(kind, &record, session.validators) {
        let issues = error
            .issues
            .into_iter()
            .map(|issue| {
                GraphIssue::new(
                    path.child(&issue.field).to_string(),
                    ErrorKind::ScalarValidationFailed,
                    format!("{}: {}", issue.code, issue.message),
                )
            })
            .collect();
        return Err(Failure::Retry(issues));
    }
    validation::stamp_timestamps(kind, &mut record, creating, session.now);

    let persisted = match &existing {
        None => session.tx.insert(&kind.name, record).await,
        Some(found) => session.tx.update(&kind.name, &found.id, record).await,
    }
    .map_err(|err| Failure::from_store(path, err))?;
    let owner = persisted.reference();
    session.touch(
        &owner,
        path,
        if creating { Change::Created } else { Change::Updated },
    );
    log::debug!("built {owner} at {path}");

    let child_namespace = if kind.namespace {
        Some(owner.id.clone())
    } else {
        namespace
    };

    for present in &classified.optional {
        if injected == Some(present.relation.name.as_str()) {
            continue;
        }
        let relation = present.relation;
        let relation_path = path.child(&relation.name);
        let binding = Binding::Target {
            owner: owner.clone(),
            relation: relation.name.clone(),
        };
        match &present.payload {
            RelationPayload::One(Node::Inline(nested)) => deferred.push(DeferredOperation::Build {
                document: (**nested).clone(),
                path: relation_path,
                namespace: child_namespace.clone(),
                binding,
            }),
            RelationPayload::One(Node::Reference(reference)) => deferred.push(DeferredOperation::Assign {
                reference: reference.clone(),
                kind: relation.target.clone(),
                path: relation_path,
                namespace: child_namespace.clone(),
                binding,
            }),
            RelationPayload::Null | RelationPayload::Many(_) => {}
        }
    }

    for present in &classified.reverse {
        deferred.push(DeferredOperation::Reconcile {
            owner: owner.clone(),
            relation: present.relation.name.clone(),
            payload: present.payload.clone(),
            namespace: child_namespace.clone(),
            path: path.child(&present.relation.name),
        });
    }

    Ok(Built {
        record: persisted,
        deferred,
    })
}

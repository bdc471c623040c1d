//! Deferred operations and the fixpoint resolver that drains them.

use serde_json::Value;

use crate::{
    document::{Document, Reference, RelationPayload},
    errors::{ErrorKind, GraphError, GraphIssue},
    store::Backend,
    types::{Attributes, RecordRef},
};

use super::{
    Change, Failure, Session, builder,
    builder::BuildContext,
    path::NodePath,
    reconcile,
    scope::{self, Resolution},
};

/// Where the result of a deferred operation is attached.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// The `index`th document of the commit.
    Root { index: usize },
    /// A child of a reverse relation; the child stores `back_reference` pointing at `owner`.
    Child {
        owner: RecordRef,
        relation: String,
        back_reference: String,
    },
    /// A member of a many-to-many relation, linked once it exists.
    Member { owner: RecordRef, relation: String },
    /// The target of a nullable direct relation on `owner`.
    Target { owner: RecordRef, relation: String },
}

/// One retryable unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum DeferredOperation {
    /// Build an inline document, then attach it through `binding`.
    Build {
        document: Document,
        path: NodePath,
        namespace: Option<String>,
        binding: Binding,
    },
    /// Resolve a reference to a `kind` record, then attach it through `binding`.
    Assign {
        reference: Reference,
        kind: String,
        path: NodePath,
        namespace: Option<String>,
        binding: Binding,
    },
    /// Bring a reverse or many-to-many relation of `owner` in line with `payload`.
    Reconcile {
        owner: RecordRef,
        relation: String,
        payload: RelationPayload,
        namespace: Option<String>,
        path: NodePath,
    },
    /// Remove `records` from a relation of `owner`.
    Prune {
        owner: RecordRef,
        relation: String,
        records: Vec<String>,
        path: NodePath,
    },
}

impl DeferredOperation {
    pub fn path(&self) -> &NodePath {
        match self {
            Self::Build { path, .. }
            | Self::Assign { path, .. }
            | Self::Reconcile { path, .. }
            | Self::Prune { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Running,
    Converged,
    Stalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub passes: usize,
    pub state: QueueState,
}

#[derive(Debug)]
struct Entry {
    op: DeferredOperation,
    attempts: usize,
    last_error: Vec<GraphIssue>,
}

/// Arena of deferred operations plus the indices still pending.
///
/// A pass walks the pending list in order. Operations enqueued by a
/// successful operation join the end of the current pass. Failed operations
/// are rolled back to their savepoint and kept for the next pass with their
/// latest issues. A pass in which nothing succeeds stalls the queue.
#[derive(Debug, Default)]
pub struct DeferredQueue {
    entries: Vec<Entry>,
    pending: Vec<usize>,
    state: Option<QueueState>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: DeferredOperation) -> usize {
        let index = self.allocate(op);
        self.pending.push(index);
        index
    }

    fn allocate(&mut self, op: DeferredOperation) -> usize {
        self.entries.push(Entry {
            op,
            attempts: 0,
            last_error: Vec::new(),
        });
        self.entries.len() - 1
    }

    pub fn pending(&self) -> impl Iterator<Item = &DeferredOperation> {
        self.pending.iter().map(|index| &self.entries[*index].op)
    }

    pub fn attempts(&self, index: usize) -> Option<usize> {
        self.entries.get(index).map(|entry| entry.attempts)
    }

    pub fn state(&self) -> QueueState {
        match self.state {
            Some(state) => state,
            None if self.pending.is_empty() => QueueState::Converged,
            None => QueueState::Running,
        }
    }

    pub(crate) async fn drain<B: Backend>(&mut self, session: &mut Session<'_, B>) -> Result<DrainReport, GraphError> {
        let mut passes = 0;
        self.state = None;

        while !self.pending.is_empty() {
            passes += 1;
            let mut current = std::mem::take(&mut self.pending);
            let mut retry = Vec::new();
            let mut progressed = false;
            let mut cursor = 0;

            while cursor < current.len() {
                let index = current[cursor];
                cursor += 1;

                let savepoint = session.savepoint();
                let entry = &mut self.entries[index];
                entry.attempts += 1;
                let op = entry.op.clone();
                match run(session, op).await {
                    Ok(follow_ups) => {
                        progressed = true;
                        for follow_up in follow_ups {
                            current.push(self.allocate(follow_up));
                        }
                    }
                    Err(Failure::Retry(issues)) => {
                        session.rollback_to(savepoint);
                        log::debug!(
                            "pass {passes}: deferring {} ({} issues)",
                            self.entries[index].op.path(),
                            issues.len()
                        );
                        self.entries[index].last_error = issues;
                        retry.push(index);
                    }
                    Err(Failure::Fatal(error)) => {
                        session.rollback_to(savepoint);
                        return Err(error.located(self.entries[index].op.path()));
                    }
                }
            }

            log::debug!("pass {passes} finished with {} operations pending", retry.len());
            self.pending = retry;
            if !self.pending.is_empty() && !progressed {
                self.state = Some(QueueState::Stalled);
                let issues = self
                    .pending
                    .iter()
                    .flat_map(|index| self.entries[*index].last_error.iter().cloned())
                    .collect::<Vec<_>>();
                log::warn!("deferred resolution stalled after {passes} passes with {} issues", issues.len());
                return Err(GraphError::DeferredResolutionStalled { issues });
            }
        }

        self.state = Some(QueueState::Converged);
        Ok(DrainReport {
            passes,
            state: QueueState::Converged,
        })
    }
}

async fn run<B: Backend>(session: &mut Session<'_, B>, op: DeferredOperation) -> Result<Vec<DeferredOperation>, Failure> {
    match op {
        DeferredOperation::Build {
            document,
            path,
            namespace,
            binding,
        } => {
            let back_reference = match &binding {
                Binding::Child {
                    owner, back_reference, ..
                } => Some((back_reference.as_str(), owner.id.as_str())),
                _ => None,
            };
            let built = builder::build(
                session,
                &document,
                BuildContext {
                    path: &path,
                    namespace: namespace.as_deref(),
                    back_reference,
                },
            )
            .await?;
            bind(session, &binding, &built.record.reference(), &path).await?;
            Ok(built.deferred)
        }
        DeferredOperation::Assign {
            reference,
            kind,
            path,
            namespace,
            binding,
        } => {
            let id = resolve_reference(session, &kind, &reference, namespace.as_deref(), &path).await?;
            let target = RecordRef::new(kind, id);
            if let Binding::Child {
                owner, back_reference, ..
            } = &binding
            {
                reparent(session, &target, back_reference, owner, &path).await?;
            }
            bind(session, &binding, &target, &path).await?;
            Ok(Vec::new())
        }
        DeferredOperation::Reconcile {
            owner,
            relation,
            payload,
            namespace,
            path,
        } => reconcile::reconcile(session, &owner, &relation, &payload, namespace.as_deref(), &path).await,
        DeferredOperation::Prune {
            owner,
            relation,
            records,
            path,
        } => {
            reconcile::prune(session, &owner, &relation, &records, &path).await?;
            Ok(Vec::new())
        }
    }
}

/// Attaches a built or resolved record to whatever it was bound to.
async fn bind<B: Backend>(
    session: &mut Session<'_, B>,
    binding: &Binding,
    record: &RecordRef,
    path: &NodePath,
) -> Result<(), Failure> {
    match binding {
        Binding::Root { index } => {
            session.set_root(*index, record.clone());
            Ok(())
        }
        Binding::Child { .. } => Ok(()),
        Binding::Member { owner, relation } => session
            .tx
            .link(&owner.kind, relation, &owner.id, &record.id)
            .await
            .map_err(|err| Failure::from_store(path, err)),
        Binding::Target { owner, relation } => {
            let mut changes = Attributes::new();
            changes.insert(relation.clone(), Value::String(record.id.clone()));
            session
                .tx
                .update(&owner.kind, &owner.id, changes)
                .await
                .map_err(|err| Failure::from_store(path, err))?;
            Ok(())
        }
    }
}

/// Points an existing record's back-reference at a new owner.
async fn reparent<B: Backend>(
    session: &mut Session<'_, B>,
    child: &RecordRef,
    back_reference: &str,
    owner: &RecordRef,
    path: &NodePath,
) -> Result<(), Failure> {
    let mut changes = Attributes::new();
    changes.insert(back_reference.to_string(), Value::String(owner.id.clone()));
    session
        .tx
        .update(&child.kind, &child.id, changes)
        .await
        .map_err(|err| Failure::from_store(path, err))?;
    session.touch(child, path, Change::Updated);
    Ok(())
}

/// Resolves a reference found in a deferred position. Misses are retryable.
pub(crate) async fn resolve_reference<B: Backend>(
    session: &mut Session<'_, B>,
    kind: &str,
    reference: &Reference,
    namespace: Option<&str>,
    path: &NodePath,
) -> Result<String, Failure> {
    match reference {
        Reference::Id { id } => {
            if session.tx.exists(kind, id).await? {
                Ok(id.clone())
            } else {
                Err(Failure::retry(
                    path,
                    ErrorKind::ReferenceNotFound,
                    format!("no {kind} record with id `{id}`"),
                ))
            }
        }
        Reference::Scoped {
            scope_attribute,
            scope_value,
        } => {
            let resolution = scope::lookup_scope(&mut session.tx, kind, scope_attribute, scope_value, namespace)
                .await
                .map_err(|err| Failure::from_store(path, err))?;
            match resolution {
                Resolution::Found(id) => Ok(id),
                other => Err(Failure::Retry(vec![scope_issue(path, kind, scope_attribute, scope_value, &other)])),
            }
        }
    }
}

pub(crate) fn scope_issue(
    path: &NodePath,
    kind: &str,
    scope_attribute: &str,
    scope_value: &Value,
    resolution: &Resolution,
) -> GraphIssue {
    let (error_kind, message) = match resolution {
        Resolution::Ambiguous(ids) => (
            ErrorKind::ScopeAmbiguous,
            format!("{} {kind} records have {scope_attribute} = {scope_value} in this namespace", ids.len()),
        ),
        Resolution::NoNamespace => (
            ErrorKind::ScopeUnresolved,
            format!("no namespace is known yet for {kind} with {scope_attribute} = {scope_value}"),
        ),
        Resolution::NotFound | Resolution::Found(_) => (
            ErrorKind::ScopeUnresolved,
            format!("no {kind} with {scope_attribute} = {scope_value} in this namespace"),
        ),
    };
    GraphIssue::new(path.to_string(), error_kind, message)
}

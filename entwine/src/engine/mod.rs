//! Graph commit engine.
//!
//! A commit runs in three stages. The whole document tree is first walked
//! against the [`Authorizer`] before any storage I/O. A single
//! [`TransactionScope`] is then opened and every root document is seeded
//! into a [`DeferredQueue`] as a build operation. Draining the queue builds
//! minimal records, reconciles collections and resolves references until it
//! converges or stalls. Convergence commits the transaction and notifies;
//! any error rolls the whole transaction back.

pub mod builder;
pub mod classify;
pub mod path;
pub mod queue;
pub mod reconcile;
pub mod scope;

use std::{collections::BTreeSet, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    auth::{Actor, AllowAll, Authorizer, Operation},
    document::{Document, Node, RelationPayload},
    errors::{ErrorKind, GraphError, GraphIssue, StoreError},
    notify::{CommitNotifier, GraphCommitted, NoopNotifier},
    schema::Schema,
    store::{Backend, Savepoint, TransactionScope},
    types::{CascadePolicy, Ownership, PersistedRecord, RecordRef},
    validation::{ScalarValidator, ValidatorRegistry},
};

use self::{
    classify::classify,
    path::NodePath,
    queue::{Binding, DeferredOperation, DeferredQueue},
};

/// Outcome of one deferred operation that did not succeed.
#[derive(Debug)]
pub(crate) enum Failure {
    /// Aborts the whole commit.
    Fatal(GraphError),
    /// Rolled back and attempted again on the next pass.
    Retry(Vec<GraphIssue>),
}

impl Failure {
    pub(crate) fn retry(path: &NodePath, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Retry(vec![GraphIssue::new(path.to_string(), kind, message)])
    }

    /// Unique violations may clear once a later operation prunes the clashing record.
    pub(crate) fn from_store(path: &NodePath, error: StoreError) -> Self {
        match error {
            StoreError::UniqueConstraintViolation { .. } => Self::retry(path, ErrorKind::ConstraintViolation, error.to_string()),
            other => Self::Fatal(GraphError::from(other).located(path)),
        }
    }
}

impl From<GraphError> for Failure {
    fn from(error: GraphError) -> Self {
        Self::Fatal(error)
    }
}

impl From<StoreError> for Failure {
    fn from(error: StoreError) -> Self {
        Self::Fatal(GraphError::from(error))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Created,
    Updated,
    Deleted,
}

/// A record written by a commit, with the path of the node that wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TouchedRecord {
    pub kind: String,
    pub id: String,
    pub path: String,
    pub change: Change,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitReceipt {
    /// The first root, for single-document commits.
    pub root: PersistedRecord,
    pub roots: Vec<PersistedRecord>,
    pub records: Vec<TouchedRecord>,
    pub passes: usize,
}

impl CommitReceipt {
    pub fn ids_of<'r>(&'r self, kind: &'r str) -> impl Iterator<Item = &'r str> + 'r {
        self.records
            .iter()
            .filter(move |record| record.kind == kind && record.change != Change::Deleted)
            .map(|record| record.id.as_str())
    }

    pub fn created(&self) -> impl Iterator<Item = &TouchedRecord> {
        self.records.iter().filter(|record| record.change == Change::Created)
    }
}

/// Mutable state of one commit, threaded through every operation.
pub(crate) struct Session<'a, B: Backend> {
    pub(crate) tx: TransactionScope<'a, B>,
    pub(crate) validators: &'a ValidatorRegistry,
    pub(crate) now: DateTime<Utc>,
    roots: Vec<Option<RecordRef>>,
    touched: Vec<TouchedRecord>,
    /// Existing records some node of the graph attaches by id; pruning leaves them alone.
    pub(crate) claimed: BTreeSet<RecordRef>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionPoint {
    savepoint: Savepoint,
    touched: usize,
}

impl<'a, B: Backend> Session<'a, B> {
    fn begin(tx: TransactionScope<'a, B>, validators: &'a ValidatorRegistry, roots: usize) -> Self {
        Self {
            tx,
            validators,
            now: Utc::now(),
            roots: vec![None; roots],
            touched: Vec::new(),
            claimed: BTreeSet::new(),
        }
    }

    pub(crate) fn savepoint(&self) -> SessionPoint {
        SessionPoint {
            savepoint: self.tx.savepoint(),
            touched: self.touched.len(),
        }
    }

    pub(crate) fn rollback_to(&mut self, point: SessionPoint) {
        self.tx.rollback_to(point.savepoint);
        self.touched.truncate(point.touched);
    }

    pub(crate) fn touch(&mut self, record: &RecordRef, path: &NodePath, change: Change) {
        self.touched.push(TouchedRecord {
            kind: record.kind.clone(),
            id: record.id.clone(),
            path: path.to_string(),
            change,
        });
    }

    pub(crate) fn set_root(&mut self, index: usize, record: RecordRef) {
        if let Some(slot) = self.roots.get_mut(index) {
            *slot = Some(record);
        }
    }

    /// One entry per record, at the first path that touched it. Deletion wins
    /// over earlier changes, and records created and deleted by the same
    /// commit are dropped.
    fn touched_records(&self) -> Vec<TouchedRecord> {
        let mut records: Vec<TouchedRecord> = Vec::new();
        let mut vanished = Vec::new();
        for entry in &self.touched {
            match records
                .iter_mut()
                .find(|record| record.kind == entry.kind && record.id == entry.id)
            {
                None => records.push(entry.clone()),
                Some(record) if entry.change == Change::Deleted => {
                    if record.change == Change::Created {
                        vanished.push((record.kind.clone(), record.id.clone()));
                    }
                    record.change = Change::Deleted;
                }
                Some(_) => {}
            }
        }
        records.retain(|record| !vanished.contains(&(record.kind.clone(), record.id.clone())));
        records
    }

    async fn receipt(&mut self, passes: usize) -> Result<CommitReceipt, GraphError> {
        let mut roots = Vec::with_capacity(self.roots.len());
        for (index, slot) in self.roots.clone().into_iter().enumerate() {
            let Some(reference) = slot else {
                return Err(GraphError::InvalidDocument {
                    path: NodePath::root_at(index).to_string(),
                    message: "root document was never built".to_string(),
                });
            };
            let Some(record) = self.tx.get(&reference.kind, &reference.id).await? else {
                return Err(StoreError::NotFound { record: reference }.into());
            };
            roots.push(record);
        }
        let Some(root) = roots.first().cloned() else {
            return Err(GraphError::InvalidDocument {
                path: NodePath::root().to_string(),
                message: "nothing to commit".to_string(),
            });
        };
        Ok(CommitReceipt {
            root,
            roots,
            records: self.touched_records(),
            passes,
        })
    }
}

/// Commits nested document graphs atomically.
pub struct GraphEngine<A = AllowAll, N = NoopNotifier> {
    schema: Arc<Schema>,
    authorizer: A,
    notifier: N,
    validators: ValidatorRegistry,
}

impl GraphEngine {
    pub fn new(schema: impl Into<Arc<Schema>>) -> Self {
        Self {
            schema: schema.into(),
            authorizer: AllowAll,
            notifier: NoopNotifier,
            validators: ValidatorRegistry::default(),
        }
    }
}

impl<A, N> GraphEngine<A, N>
where
    A: Authorizer,
    N: CommitNotifier,
{
    pub fn with_authorizer<A2: Authorizer>(self, authorizer: A2) -> GraphEngine<A2, N> {
        GraphEngine {
            schema: self.schema,
            authorizer,
            notifier: self.notifier,
            validators: self.validators,
        }
    }

    pub fn with_notifier<N2: CommitNotifier>(self, notifier: N2) -> GraphEngine<A, N2> {
        GraphEngine {
            schema: self.schema,
            authorizer: self.authorizer,
            notifier,
            validators: self.validators,
        }
    }

    /// Registers a validator for `ValidationRule::Custom { name }`.
    pub fn with_validator(mut self, name: impl Into<String>, validator: impl ScalarValidator + 'static) -> Self {
        self.validators.register(name, validator);
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Commits one document tree. Error paths start at `root`.
    pub async fn commit<B: Backend>(
        &self,
        backend: &mut B,
        actor: &Actor,
        document: Document,
    ) -> Result<CommitReceipt, GraphError> {
        self.run(backend, actor, vec![(NodePath::root(), document)]).await
    }

    /// Commits sibling document trees in one transaction. Error paths start at `root.<index>`.
    pub async fn commit_all<B: Backend>(
        &self,
        backend: &mut B,
        actor: &Actor,
        documents: Vec<Document>,
    ) -> Result<CommitReceipt, GraphError> {
        let roots = documents
            .into_iter()
            .enumerate()
            .map(|(index, document)| (NodePath::root_at(index), document))
            .collect();
        self.run(backend, actor, roots).await
    }

    async fn run<B: Backend>(
        &self,
        backend: &mut B,
        actor: &Actor,
        roots: Vec<(NodePath, Document)>,
    ) -> Result<CommitReceipt, GraphError> {
        if roots.is_empty() {
            return Err(GraphError::InvalidDocument {
                path: NodePath::root().to_string(),
                message: "nothing to commit".to_string(),
            });
        }
        for (path, document) in &roots {
            self.authorize(actor, document, path)?;
        }

        let tx = TransactionScope::begin(backend, &self.schema);
        let mut session = Session::begin(tx, &self.validators, roots.len());
        for (_, document) in &roots {
            reconcile::collect_claims(&self.schema, document, &mut session.claimed);
        }
        let mut queue = DeferredQueue::new();
        for (index, (path, document)) in roots.into_iter().enumerate() {
            queue.push(DeferredOperation::Build {
                document,
                path,
                namespace: None,
                binding: Binding::Root { index },
            });
        }

        let outcome = match queue.drain(&mut session).await {
            Ok(report) => session.receipt(report.passes).await,
            Err(error) => Err(error),
        };
        let receipt = match outcome {
            Ok(receipt) => receipt,
            Err(error) => {
                log::warn!("rolling back graph commit: {error}");
                session.tx.rollback();
                return Err(error);
            }
        };

        session.tx.commit().await?;
        log::info!(
            "committed graph rooted at {}/{} ({} records, {} passes)",
            receipt.root.kind,
            receipt.root.id,
            receipt.records.len(),
            receipt.passes
        );

        let committed_at = Utc::now();
        for root in &receipt.roots {
            self.notifier.graph_committed(GraphCommitted {
                kind: root.kind.clone(),
                id: root.id.clone(),
                records: receipt.records.len(),
                committed_at,
            });
        }
        Ok(receipt)
    }

    fn check(&self, actor: &Actor, kind: &str, operation: Operation, path: &NodePath) -> Result<(), GraphError> {
        if self.authorizer.authorize(actor, kind, operation) {
            Ok(())
        } else {
            log::warn!("actor `{}` denied {operation} on `{kind}` at {path}", actor.id);
            Err(GraphError::AuthorizationDenied {
                path: path.to_string(),
                actor: actor.id.clone(),
                kind: kind.to_string(),
                operation,
            })
        }
    }

    /// Checks every write that pruning `kind` records can fan out into: cascaded
    /// deletes, nulled `Detach` referrers and many-to-many owners losing a member.
    fn check_removal(&self, actor: &Actor, kind: &str, path: &NodePath) -> Result<(), GraphError> {
        let mut visited = BTreeSet::new();
        let mut pending = vec![kind.to_string()];
        while let Some(kind) = pending.pop() {
            if !visited.insert(kind.clone()) {
                continue;
            }
            self.check(actor, &kind, Operation::Delete, path)?;
            for incoming in self.schema.incoming_relations(&kind) {
                match incoming.relation.cascade {
                    CascadePolicy::Delete => pending.push(incoming.source.name.clone()),
                    CascadePolicy::Detach => self.check(actor, &incoming.source.name, Operation::Update, path)?,
                    CascadePolicy::Protect => {}
                }
            }
            for incoming in self.schema.incoming_links(&kind) {
                self.check(actor, &incoming.source.name, Operation::Update, path)?;
            }
        }
        Ok(())
    }

    /// Walks the document tree and asks the authorizer about every write it can cause.
    fn authorize(&self, actor: &Actor, document: &Document, path: &NodePath) -> Result<(), GraphError> {
        let Some(kind) = self.schema.kind(&document.kind) else {
            return Err(GraphError::InvalidDocument {
                path: path.to_string(),
                message: format!("unknown kind `{}`", document.kind),
            });
        };
        let operation = if document.id.is_some() {
            Operation::Update
        } else {
            Operation::Create
        };
        self.check(actor, &kind.name, operation, path)?;

        let classified = classify(kind, document, path)?;
        for present in classified.relations() {
            let relation = present.relation;
            let relation_path = path.child(&relation.name);
            match relation.ownership {
                Ownership::Reverse => self.check_removal(actor, &relation.target, &relation_path)?,
                Ownership::ManyToMany => self.check(actor, &kind.name, Operation::Update, &relation_path)?,
                Ownership::Direct => {}
            }
            let target = self.schema.kind(&relation.target);
            let many = matches!(present.payload, RelationPayload::Many(_));
            for (position, node) in present.payload.nodes().iter().enumerate() {
                let node_path = if many {
                    relation_path.index(position)
                } else {
                    relation_path.clone()
                };
                match node {
                    Node::Inline(nested) => {
                        let reusable = relation.ownership != Ownership::Direct
                            && nested.id.is_none()
                            && target.is_some_and(|target| {
                                reconcile::may_match_existing(target, relation, &nested.attributes)
                            });
                        if reusable {
                            self.check(actor, &relation.target, Operation::Update, &node_path)?;
                        }
                        self.authorize(actor, nested, &node_path)?
                    }
                    Node::Reference(_) if relation.ownership == Ownership::Reverse => {
                        self.check(actor, &relation.target, Operation::Update, &node_path)?
                    }
                    Node::Reference(_) => {}
                }
            }
        }
        Ok(())
    }
}

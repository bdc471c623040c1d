//! Storage collaborator.
//!
//! Backends only know how to read committed state and apply a finished
//! [`ChangeSet`] atomically. Everything transactional lives in
//! [`TransactionScope`]: writes are staged in an overlay that reads see
//! first, integrity is checked at staging time, and savepoints let a caller
//! undo the tail of the overlay. Nothing reaches the backend until
//! [`TransactionScope::commit`], so dropping or rolling back a scope leaves
//! durable state untouched.

pub mod memory;
pub mod redis;

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use nanoid::nanoid;
use serde_json::Value;

use crate::{
    errors::StoreError,
    schema::Schema,
    types::{Attributes, CascadePolicy, KindDescriptor, Ownership, PersistedRecord, RecordRef},
};

/// Identifier alphabet without ambiguous glyphs.
const ID_ALPHABET: &[char] = &[
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'J', 'K', 'L', 'M', 'N', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y',
    'Z', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'j', 'm', 'n', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];
const ID_LENGTH: usize = 20;

pub fn generate_id() -> String {
    nanoid!(ID_LENGTH, ID_ALPHABET)
}

/// One many-to-many membership: `owner.relation` contains `member`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Link {
    pub kind: String,
    pub relation: String,
    pub owner: String,
    pub member: String,
}

impl Link {
    pub fn new(kind: &str, relation: &str, owner: &str, member: &str) -> Self {
        Self {
            kind: kind.to_string(),
            relation: relation.to_string(),
            owner: owner.to_string(),
            member: member.to_string(),
        }
    }
}

/// Condition a backend re-checks against its own state, as it stands once the
/// change set is applied, before applying it. Any failed guard rejects the
/// whole change set with [`StoreError::Conflict`].
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    /// The stored record is still what the transaction read; `None` means still absent.
    Unchanged {
        record: RecordRef,
        expected: Option<Attributes>,
    },
    /// A referenced record or link endpoint exists.
    Exists { record: RecordRef },
    /// No other record of `record.kind` holds `values` in `fields`.
    Unique {
        record: RecordRef,
        fields: Vec<String>,
        values: Vec<Value>,
        case_insensitive: bool,
    },
    /// No `kind` record points at the deleted `record` through `field`.
    Unreferenced {
        record: RecordRef,
        kind: String,
        field: String,
    },
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unchanged { record, .. } => write!(f, "{record} changed since it was read"),
            Self::Exists { record } => write!(f, "{record} no longer exists"),
            Self::Unique { record, fields, values, .. } => {
                let values: Vec<String> = values.iter().map(display_value).collect();
                write!(f, "another {} already has {fields:?} = {values:?}", record.kind)
            }
            Self::Unreferenced { record, kind, field } => write!(f, "{kind}.{field} now references deleted {record}"),
        }
    }
}

/// Net effect of a transaction.
///
/// `records` maps to the final attribute set, or `None` for a deletion.
/// `links` maps to `true` when linked and `false` when unlinked.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub records: BTreeMap<RecordRef, Option<Attributes>>,
    pub links: BTreeMap<Link, bool>,
    pub guards: Vec<Guard>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.links.is_empty()
    }
}

/// Normalised token under which a scalar value is indexed.
///
/// Strings are lowercased so one index serves exact and case-insensitive
/// lookups; callers re-check candidates against the real value. Values that
/// are not strings, numbers or booleans are not indexed.
pub fn index_token(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.to_lowercase()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn values_match(candidate: &Value, expected: &Value, case_insensitive: bool) -> bool {
    match (candidate, expected) {
        (Value::String(left), Value::String(right)) if case_insensitive => left.to_lowercase() == right.to_lowercase(),
        _ => candidate == expected,
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Durable storage behind a [`TransactionScope`].
#[allow(async_fn_in_trait)]
pub trait Backend {
    fn mint_identifier(&mut self, _kind: &str) -> String {
        generate_id()
    }

    async fn load(&mut self, kind: &str, id: &str) -> Result<Option<Attributes>, StoreError>;

    /// Ids of `kind` records whose `field` may equal `value`.
    ///
    /// May return a superset; only ids sharing the value's [`index_token`] are required.
    async fn candidates(&mut self, kind: &str, field: &str, value: &Value) -> Result<Vec<String>, StoreError>;

    async fn members(&mut self, kind: &str, relation: &str, owner: &str) -> Result<Vec<String>, StoreError>;

    async fn owners(&mut self, kind: &str, relation: &str, member: &str) -> Result<Vec<String>, StoreError>;

    /// Applies every change or none of them.
    async fn apply(&mut self, changes: ChangeSet) -> Result<(), StoreError>;
}

#[derive(Debug)]
enum Undo {
    Record {
        record: RecordRef,
        previous: Option<Option<Attributes>>,
    },
    Link {
        link: Link,
        previous: Option<bool>,
    },
}

/// Marker returned by [`TransactionScope::savepoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Savepoint(usize);

struct DeletePlan {
    doomed: Vec<RecordRef>,
    detach: Vec<(RecordRef, String)>,
}

/// The single transaction of one graph commit.
///
/// `commit` and `rollback` consume the scope, so only its owner can end it.
/// Everything else borrows it mutably.
pub struct TransactionScope<'a, B: Backend> {
    backend: &'a mut B,
    schema: &'a Schema,
    staged: ChangeSet,
    journal: Vec<Undo>,
    /// First committed value read for each record, guarded at commit.
    read: BTreeMap<RecordRef, Option<Attributes>>,
}

impl<'a, B: Backend> TransactionScope<'a, B> {
    pub fn begin(backend: &'a mut B, schema: &'a Schema) -> Self {
        Self {
            backend,
            schema,
            staged: ChangeSet::default(),
            journal: Vec::new(),
            read: BTreeMap::new(),
        }
    }

    pub fn schema(&self) -> &'a Schema {
        self.schema
    }

    pub fn staged(&self) -> &ChangeSet {
        &self.staged
    }

    fn descriptor(&self, kind: &str) -> Result<&'a KindDescriptor, StoreError> {
        let schema: &'a Schema = self.schema;
        schema.require(kind)
    }

    pub async fn get(&mut self, kind: &str, id: &str) -> Result<Option<PersistedRecord>, StoreError> {
        self.descriptor(kind)?;
        let reference = RecordRef::new(kind, id);
        let attributes = match self.staged.records.get(&reference) {
            Some(staged) => staged.clone(),
            None => {
                let loaded = self.backend.load(kind, id).await?;
                self.read.entry(reference.clone()).or_insert_with(|| loaded.clone());
                loaded
            }
        };
        Ok(attributes.map(|attributes| PersistedRecord {
            kind: reference.kind,
            id: reference.id,
            attributes,
        }))
    }

    pub async fn exists(&mut self, kind: &str, id: &str) -> Result<bool, StoreError> {
        Ok(self.get(kind, id).await?.is_some())
    }

    /// Records of `kind` whose `field` equals `value` exactly.
    pub async fn find(&mut self, kind: &str, field: &str, value: &Value) -> Result<Vec<PersistedRecord>, StoreError> {
        self.find_where(kind, &[(field, value)], false).await
    }

    /// Like [`find`](Self::find), but strings compare without regard to case.
    pub async fn find_case_insensitive(
        &mut self,
        kind: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<PersistedRecord>, StoreError> {
        self.find_where(kind, &[(field, value)], true).await
    }

    async fn find_where(
        &mut self,
        kind: &str,
        criteria: &[(&str, &Value)],
        case_insensitive: bool,
    ) -> Result<Vec<PersistedRecord>, StoreError> {
        self.descriptor(kind)?;
        let Some((field, value)) = criteria.first() else {
            return Ok(Vec::new());
        };
        if index_token(value).is_none() {
            return Err(StoreError::Other {
                message: format!("cannot look up {kind}.{field} by non-scalar value {value}").into(),
            });
        }

        let mut ids: BTreeSet<String> = self.backend.candidates(kind, field, value).await?.into_iter().collect();
        ids.extend(
            self.staged
                .records
                .keys()
                .filter(|record| record.kind == kind)
                .map(|record| record.id.clone()),
        );

        let mut found = Vec::new();
        for id in ids {
            if let Some(record) = self.get(kind, &id).await?
                && criteria.iter().all(|(field, value)| {
                    record
                        .attributes
                        .get(*field)
                        .is_some_and(|candidate| values_match(candidate, value, case_insensitive))
                })
            {
                found.push(record);
            }
        }
        Ok(found)
    }

    /// Inserts a new record under a freshly minted identifier.
    pub async fn insert(&mut self, kind: &str, attributes: Attributes) -> Result<PersistedRecord, StoreError> {
        let descriptor = self.descriptor(kind)?;
        let id = self.backend.mint_identifier(kind);
        self.check_integrity(descriptor, &id, &attributes).await?;
        log::trace!("staging insert {kind}/{id}");
        let record = PersistedRecord {
            kind: kind.to_string(),
            id,
            attributes,
        };
        self.stage(record.reference(), Some(record.attributes.clone()));
        Ok(record)
    }

    /// Merges `changes` into an existing record.
    pub async fn update(&mut self, kind: &str, id: &str, changes: Attributes) -> Result<PersistedRecord, StoreError> {
        let descriptor = self.descriptor(kind)?;
        let Some(mut record) = self.get(kind, id).await? else {
            return Err(StoreError::NotFound {
                record: RecordRef::new(kind, id),
            });
        };
        record.attributes.extend(changes);
        self.check_integrity(descriptor, id, &record.attributes).await?;
        log::trace!("staging update {kind}/{id}");
        self.stage(record.reference(), Some(record.attributes.clone()));
        Ok(record)
    }

    async fn check_integrity(
        &mut self,
        descriptor: &KindDescriptor,
        id: &str,
        attributes: &Attributes,
    ) -> Result<(), StoreError> {
        for relation in descriptor.direct_relations() {
            match attributes.get(&relation.name) {
                None | Some(Value::Null) => {
                    if !relation.nullable {
                        return Err(StoreError::NullReference {
                            kind: descriptor.name.clone(),
                            field: relation.name.clone(),
                        });
                    }
                }
                Some(Value::String(target)) => {
                    if !self.exists(&relation.target, target).await? {
                        return Err(StoreError::ForeignKey {
                            kind: descriptor.name.clone(),
                            field: relation.name.clone(),
                            target: RecordRef::new(relation.target.clone(), target.clone()),
                        });
                    }
                }
                Some(other) => {
                    return Err(StoreError::Other {
                        message: format!("{}.{} must hold a record id, got {other}", descriptor.name, relation.name).into(),
                    });
                }
            }
        }

        for constraint in &descriptor.unique_constraints {
            let criteria: Option<Vec<(&str, &Value)>> = constraint
                .fields
                .iter()
                .map(|field| {
                    attributes
                        .get(field)
                        .filter(|value| !value.is_null())
                        .map(|value| (field.as_str(), value))
                })
                .collect();
            let Some(criteria) = criteria else {
                continue;
            };
            let clash = self
                .find_where(&descriptor.name, &criteria, constraint.case_insensitive)
                .await?
                .into_iter()
                .find(|existing| existing.id != id);
            if let Some(existing) = clash {
                return Err(StoreError::UniqueConstraintViolation {
                    kind: descriptor.name.clone(),
                    fields: constraint.fields.clone(),
                    values: criteria.iter().map(|(_, value)| display_value(value)).collect(),
                    existing_id: existing.id,
                });
            }
        }
        Ok(())
    }

    /// Deletes a record together with everything that cascades from it.
    pub async fn delete(&mut self, kind: &str, id: &str) -> Result<Vec<RecordRef>, StoreError> {
        self.delete_many(&[RecordRef::new(kind, id)]).await
    }

    /// Deletes several records as one unit and returns every deleted record.
    ///
    /// Referrers with a `Delete` policy are deleted too and `Detach` referrers
    /// are nulled out. When any `Protect` referrer survives the cascade the
    /// call fails with `Protected` naming all of them, and nothing is staged.
    pub async fn delete_many(&mut self, records: &[RecordRef]) -> Result<Vec<RecordRef>, StoreError> {
        let plan = self.plan_delete(records).await?;
        for (record, field) in plan.detach {
            if let Some(mut current) = self.get(&record.kind, &record.id).await? {
                log::trace!("detaching {record}.{field}");
                current.attributes.insert(field, Value::Null);
                self.stage(record, Some(current.attributes));
            }
        }
        for record in &plan.doomed {
            self.unlink_all(record).await?;
            log::trace!("staging delete {record}");
            self.stage(record.clone(), None);
        }
        Ok(plan.doomed)
    }

    async fn plan_delete(&mut self, roots: &[RecordRef]) -> Result<DeletePlan, StoreError> {
        let schema = self.schema;
        for root in roots {
            if !self.exists(&root.kind, &root.id).await? {
                return Err(StoreError::NotFound { record: root.clone() });
            }
        }

        let mut seen = BTreeSet::new();
        let mut doomed = Vec::new();
        let mut detach = Vec::new();
        let mut protected = BTreeSet::new();
        let mut worklist: Vec<RecordRef> = roots.iter().rev().cloned().collect();

        while let Some(record) = worklist.pop() {
            if !seen.insert(record.clone()) {
                continue;
            }
            let needle = Value::String(record.id.clone());
            for incoming in schema.incoming_relations(&record.kind) {
                let referrers = self.find(&incoming.source.name, &incoming.relation.name, &needle).await?;
                for referrer in referrers {
                    let reference = referrer.reference();
                    match incoming.relation.cascade {
                        CascadePolicy::Delete => worklist.push(reference),
                        CascadePolicy::Detach => detach.push((reference, incoming.relation.name.clone())),
                        CascadePolicy::Protect => {
                            protected.insert(reference);
                        }
                    }
                }
            }
            doomed.push(record);
        }

        let blocking: Vec<RecordRef> = protected.into_iter().filter(|record| !seen.contains(record)).collect();
        if let Some(first) = roots.first()
            && !blocking.is_empty()
        {
            return Err(StoreError::Protected {
                record: first.clone(),
                blocking,
            });
        }
        detach.retain(|(record, _)| !seen.contains(record));
        Ok(DeletePlan { doomed, detach })
    }

    async fn unlink_all(&mut self, record: &RecordRef) -> Result<(), StoreError> {
        let schema = self.schema;
        let descriptor = self.descriptor(&record.kind)?;
        for relation in descriptor
            .relations
            .iter()
            .filter(|relation| relation.ownership == Ownership::ManyToMany)
        {
            for member in self.members(&record.kind, &relation.name, &record.id).await? {
                self.stage_link(Link::new(&record.kind, &relation.name, &record.id, &member), false);
            }
        }
        for incoming in schema.incoming_links(&record.kind) {
            for owner in self.owners(&incoming.source.name, &incoming.relation.name, &record.id).await? {
                self.stage_link(Link::new(&incoming.source.name, &incoming.relation.name, &owner, &record.id), false);
            }
        }
        Ok(())
    }

    fn link_target(&self, kind: &str, relation: &str) -> Result<&'a str, StoreError> {
        let descriptor = self.descriptor(kind)?;
        match descriptor.find_relation(relation) {
            Some(found) if found.ownership == Ownership::ManyToMany => Ok(found.target.as_str()),
            _ => Err(StoreError::NotALink {
                kind: kind.to_string(),
                relation: relation.to_string(),
            }),
        }
    }

    pub async fn link(&mut self, kind: &str, relation: &str, owner: &str, member: &str) -> Result<(), StoreError> {
        let target = self.link_target(kind, relation)?;
        if !self.exists(kind, owner).await? {
            return Err(StoreError::NotFound {
                record: RecordRef::new(kind, owner),
            });
        }
        if !self.exists(target, member).await? {
            return Err(StoreError::ForeignKey {
                kind: kind.to_string(),
                field: relation.to_string(),
                target: RecordRef::new(target, member),
            });
        }
        log::trace!("staging link {kind}/{owner}.{relation} -> {member}");
        self.stage_link(Link::new(kind, relation, owner, member), true);
        Ok(())
    }

    pub async fn unlink(&mut self, kind: &str, relation: &str, owner: &str, member: &str) -> Result<(), StoreError> {
        self.link_target(kind, relation)?;
        log::trace!("staging unlink {kind}/{owner}.{relation} -> {member}");
        self.stage_link(Link::new(kind, relation, owner, member), false);
        Ok(())
    }

    pub async fn members(&mut self, kind: &str, relation: &str, owner: &str) -> Result<Vec<String>, StoreError> {
        let mut members: BTreeSet<String> = self.backend.members(kind, relation, owner).await?.into_iter().collect();
        for (link, linked) in &self.staged.links {
            if link.kind == kind && link.relation == relation && link.owner == owner {
                if *linked {
                    members.insert(link.member.clone());
                } else {
                    members.remove(&link.member);
                }
            }
        }
        Ok(members.into_iter().collect())
    }

    pub async fn owners(&mut self, kind: &str, relation: &str, member: &str) -> Result<Vec<String>, StoreError> {
        let mut owners: BTreeSet<String> = self.backend.owners(kind, relation, member).await?.into_iter().collect();
        for (link, linked) in &self.staged.links {
            if link.kind == kind && link.relation == relation && link.member == member {
                if *linked {
                    owners.insert(link.owner.clone());
                } else {
                    owners.remove(&link.owner);
                }
            }
        }
        Ok(owners.into_iter().collect())
    }

    fn stage(&mut self, record: RecordRef, value: Option<Attributes>) {
        let previous = self.staged.records.insert(record.clone(), value);
        self.journal.push(Undo::Record { record, previous });
    }

    fn stage_link(&mut self, link: Link, linked: bool) {
        let previous = self.staged.links.insert(link.clone(), linked);
        self.journal.push(Undo::Link { link, previous });
    }

    pub fn savepoint(&self) -> Savepoint {
        Savepoint(self.journal.len())
    }

    /// Undoes every write staged after `savepoint`.
    pub fn rollback_to(&mut self, savepoint: Savepoint) {
        if savepoint.0 > self.journal.len() {
            return;
        }
        for undo in self.journal.split_off(savepoint.0).into_iter().rev() {
            match undo {
                Undo::Record { record, previous } => match previous {
                    Some(value) => {
                        self.staged.records.insert(record, value);
                    }
                    None => {
                        self.staged.records.remove(&record);
                    }
                },
                Undo::Link { link, previous } => match previous {
                    Some(linked) => {
                        self.staged.links.insert(link, linked);
                    }
                    None => {
                        self.staged.links.remove(&link);
                    }
                },
            }
        }
    }

    /// Everything staged, plus the guards that keep it valid against concurrent writers.
    ///
    /// Each written record must still hold the value this scope first read
    /// (or still be absent when it was inserted). Direct relation targets and
    /// link endpoints must exist, unique constraints must still hold, and
    /// deleted records must not have gained referrers.
    pub fn into_change_set(mut self) -> ChangeSet {
        self.guarded_changes()
    }

    fn guarded_changes(&mut self) -> ChangeSet {
        let mut changes = std::mem::take(&mut self.staged);
        let mut guards = Vec::new();
        let mut required = BTreeSet::new();

        for (record, value) in &changes.records {
            guards.push(Guard::Unchanged {
                record: record.clone(),
                expected: self.read.get(record).cloned().flatten(),
            });
            let Some(descriptor) = self.schema.kind(&record.kind) else {
                continue;
            };
            let Some(attributes) = value else {
                for incoming in self.schema.incoming_relations(&record.kind) {
                    guards.push(Guard::Unreferenced {
                        record: record.clone(),
                        kind: incoming.source.name.clone(),
                        field: incoming.relation.name.clone(),
                    });
                }
                continue;
            };
            for relation in descriptor.direct_relations() {
                if let Some(Value::String(target)) = attributes.get(&relation.name) {
                    required.insert(RecordRef::new(relation.target.clone(), target.clone()));
                }
            }
            for constraint in &descriptor.unique_constraints {
                let values: Option<Vec<Value>> = constraint
                    .fields
                    .iter()
                    .map(|field| attributes.get(field).filter(|value| index_token(value).is_some()).cloned())
                    .collect();
                if let Some(values) = values {
                    guards.push(Guard::Unique {
                        record: record.clone(),
                        fields: constraint.fields.clone(),
                        values,
                        case_insensitive: constraint.case_insensitive,
                    });
                }
            }
        }

        for (link, linked) in &changes.links {
            if !linked {
                continue;
            }
            required.insert(RecordRef::new(link.kind.clone(), link.owner.clone()));
            if let Ok(target) = self.link_target(&link.kind, &link.relation) {
                required.insert(RecordRef::new(target, link.member.clone()));
            }
        }

        guards.extend(required.into_iter().map(|record| Guard::Exists { record }));
        changes.guards = guards;
        changes
    }

    pub async fn commit(mut self) -> Result<(), StoreError> {
        log::debug!(
            "committing {} record changes and {} link changes",
            self.staged.records.len(),
            self.staged.links.len()
        );
        if self.staged.is_empty() {
            return Ok(());
        }
        let changes = self.guarded_changes();
        self.backend.apply(changes).await
    }

    pub fn rollback(self) {
        log::debug!("discarding {} staged record changes", self.staged.records.len());
    }
}

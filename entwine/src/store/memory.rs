//! In-process backend used by tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use super::{Backend, ChangeSet, Guard, Link, index_token, values_match};
use crate::{
    errors::StoreError,
    types::{Attributes, RecordRef},
};

#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    records: BTreeMap<String, BTreeMap<String, Attributes>>,
    links: BTreeSet<Link>,
    commits: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a record directly, bypassing transactions and integrity checks.
    pub fn seed(&mut self, kind: &str, id: &str, attributes: Attributes) {
        self.records
            .entry(kind.to_string())
            .or_default()
            .insert(id.to_string(), attributes);
    }

    pub fn record(&self, kind: &str, id: &str) -> Option<&Attributes> {
        self.records.get(kind).and_then(|records| records.get(id))
    }

    pub fn ids(&self, kind: &str) -> Vec<String> {
        self.records
            .get(kind)
            .map(|records| records.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of change sets applied so far.
    pub fn commits(&self) -> usize {
        self.commits
    }

    pub fn linked(&self, kind: &str, relation: &str, owner: &str) -> Vec<String> {
        self.links
            .iter()
            .filter(|link| link.kind == kind && link.relation == relation && link.owner == owner)
            .map(|link| link.member.clone())
            .collect()
    }
}

impl MemoryBackend {
    /// A record as it will stand once `changes` is applied.
    fn settled<'s>(&'s self, changes: &'s ChangeSet, record: &RecordRef) -> Option<&'s Attributes> {
        match changes.records.get(record) {
            Some(staged) => staged.as_ref(),
            None => self.record(&record.kind, &record.id),
        }
    }

    /// Every record of `kind` once `changes` is applied.
    fn settled_kind<'s>(
        &'s self,
        changes: &'s ChangeSet,
        kind: &'s str,
    ) -> impl Iterator<Item = (String, &'s Attributes)> + 's {
        let ids: BTreeSet<String> = self
            .ids(kind)
            .into_iter()
            .chain(changes.records.keys().filter(|record| record.kind == kind).map(|record| record.id.clone()))
            .collect();
        ids.into_iter().filter_map(move |id| {
            let attributes = self.settled(changes, &RecordRef::new(kind, id.clone()))?;
            Some((id, attributes))
        })
    }

    fn holds(&self, changes: &ChangeSet, guard: &Guard) -> bool {
        match guard {
            Guard::Unchanged { record, expected } => self.record(&record.kind, &record.id) == expected.as_ref(),
            Guard::Exists { record } => self.settled(changes, record).is_some(),
            Guard::Unique {
                record,
                fields,
                values,
                case_insensitive,
            } => !self.settled_kind(changes, &record.kind).any(|(id, attributes)| {
                id != record.id
                    && fields.iter().zip(values).all(|(field, value)| {
                        attributes
                            .get(field)
                            .is_some_and(|candidate| values_match(candidate, value, *case_insensitive))
                    })
            }),
            Guard::Unreferenced { record, kind, field } => {
                let needle = Value::String(record.id.clone());
                !self
                    .settled_kind(changes, kind)
                    .any(|(_, attributes)| attributes.get(field) == Some(&needle))
            }
        }
    }
}

impl Backend for MemoryBackend {
    async fn load(&mut self, kind: &str, id: &str) -> Result<Option<Attributes>, StoreError> {
        Ok(self.record(kind, id).cloned())
    }

    async fn candidates(&mut self, kind: &str, field: &str, value: &Value) -> Result<Vec<String>, StoreError> {
        let Some(token) = index_token(value) else {
            return Ok(Vec::new());
        };
        let Some(records) = self.records.get(kind) else {
            return Ok(Vec::new());
        };
        Ok(records
            .iter()
            .filter(|(_, attributes)| attributes.get(field).and_then(index_token).as_deref() == Some(token.as_str()))
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn members(&mut self, kind: &str, relation: &str, owner: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.linked(kind, relation, owner))
    }

    async fn owners(&mut self, kind: &str, relation: &str, member: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .links
            .iter()
            .filter(|link| link.kind == kind && link.relation == relation && link.member == member)
            .map(|link| link.owner.clone())
            .collect())
    }

    async fn apply(&mut self, changes: ChangeSet) -> Result<(), StoreError> {
        if let Some(broken) = changes.guards.iter().find(|guard| !self.holds(&changes, guard)) {
            return Err(StoreError::Conflict {
                guard: broken.to_string(),
            });
        }
        for (record, attributes) in changes.records {
            let records = self.records.entry(record.kind).or_default();
            match attributes {
                Some(attributes) => {
                    records.insert(record.id, attributes);
                }
                None => {
                    records.remove(&record.id);
                }
            }
        }
        for (link, linked) in changes.links {
            if linked {
                self.links.insert(link);
            } else {
                self.links.remove(&link);
            }
        }
        self.records.retain(|_, records| !records.is_empty());
        self.commits += 1;
        Ok(())
    }
}

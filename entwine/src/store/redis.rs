//! Redis backend.
//!
//! Each record is a JSON string at `prefix:Kind:id`. Every scalar attribute
//! is indexed in a set keyed by its [`index_token`], and the record keeps a
//! companion set of the index keys it belongs to so a later write can remove
//! stale memberships. Many-to-many links live in forward and reverse sets.
//! A change set is applied by a single Lua script, so it lands atomically.
//! The script first re-checks the change set's [`Guard`]s against live data
//! and refuses the whole set when another writer got there first.

use std::sync::LazyLock;

use redis::{Script, aio::ConnectionLike, cmd};
use serde::Serialize;
use serde_json::Value;

use super::{Backend, ChangeSet, Guard, index_token};
use crate::{errors::StoreError, keys::KeyContext, types::Attributes};

pub const APPLY_CHANGESET_SCRIPT_BODY: &str = include_str!("../../lua/apply_changeset.lua");

pub static APPLY_CHANGESET_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(APPLY_CHANGESET_SCRIPT_BODY));

#[derive(Debug, Serialize)]
struct ApplyCommand {
    checks: Vec<GuardCheck>,
    writes: Vec<RecordWrite>,
    links: Vec<LinkWrite>,
}

/// A [`Guard`] in the shape the script evaluates.
#[derive(Debug, Serialize)]
#[serde(tag = "check", rename_all = "snake_case")]
enum GuardCheck {
    /// `GET key` must equal `expected`, or the key must be missing when `expected` is absent.
    Unchanged {
        key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        expected: Option<String>,
    },
    Exists { key: String },
    /// No record in the intersection of `index_keys` other than `id` may hold `values`.
    Unique {
        id: String,
        record_prefix: String,
        index_keys: Vec<String>,
        fields: Vec<String>,
        values: Vec<Value>,
        case_insensitive: bool,
    },
    /// No record in `index_key` may hold `id` in `field`.
    Unreferenced {
        id: String,
        record_prefix: String,
        index_key: String,
        field: String,
    },
}

/// `None` for guards the indexes cannot answer, such as uniqueness over non-scalar values.
fn guard_check(keys: &KeyContext<'_>, guard: &Guard) -> Result<Option<GuardCheck>, StoreError> {
    let check = match guard {
        Guard::Unchanged { record, expected } => GuardCheck::Unchanged {
            key: keys.record(&record.kind, &record.id),
            expected: expected.as_ref().map(serde_json::to_string).transpose()?,
        },
        Guard::Exists { record } => GuardCheck::Exists {
            key: keys.record(&record.kind, &record.id),
        },
        Guard::Unique {
            record,
            fields,
            values,
            case_insensitive,
        } => {
            let index_keys: Option<Vec<String>> = fields
                .iter()
                .zip(values)
                .map(|(field, value)| index_token(value).map(|token| keys.index(&record.kind, field, &token)))
                .collect();
            let Some(index_keys) = index_keys else {
                return Ok(None);
            };
            GuardCheck::Unique {
                id: record.id.clone(),
                record_prefix: keys.record(&record.kind, ""),
                index_keys,
                fields: fields.clone(),
                values: values.clone(),
                case_insensitive: *case_insensitive,
            }
        }
        Guard::Unreferenced { record, kind, field } => GuardCheck::Unreferenced {
            id: record.id.clone(),
            record_prefix: keys.record(kind, ""),
            index_key: keys.index(kind, field, &record.id.to_lowercase()),
            field: field.clone(),
        },
    };
    Ok(Some(check))
}

#[derive(Debug, Serialize)]
struct RecordWrite {
    id: String,
    key: String,
    indexes_key: String,
    /// Absent for deletions.
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    indexes: Vec<String>,
}

#[derive(Debug, Serialize)]
struct LinkWrite {
    key: String,
    reverse_key: String,
    owner: String,
    member: String,
    linked: bool,
}

pub struct RedisBackend<C>
where
    C: ConnectionLike + Send,
{
    connection: C,
    prefix: String,
}

impl<C> RedisBackend<C>
where
    C: ConnectionLike + Send,
{
    pub fn new(connection: C, prefix: impl Into<String>) -> Self {
        Self {
            connection,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn into_inner(self) -> C {
        self.connection
    }
}

/// Builds the script command and the description of each check, by position.
fn apply_command(prefix: &str, changes: ChangeSet) -> Result<(ApplyCommand, Vec<String>), StoreError> {
    let keys = KeyContext::new(prefix);
    let mut checks = Vec::with_capacity(changes.guards.len());
    let mut described = Vec::with_capacity(changes.guards.len());
    for guard in &changes.guards {
        if let Some(check) = guard_check(&keys, guard)? {
            checks.push(check);
            described.push(guard.to_string());
        }
    }

    let mut writes = Vec::with_capacity(changes.records.len());
    for (record, attributes) in changes.records {
        let (value, indexes) = match attributes {
            Some(attributes) => {
                let indexes = attributes
                    .iter()
                    .filter_map(|(field, value)| {
                        index_token(value).map(|token| keys.index(&record.kind, field, &token))
                    })
                    .collect();
                (Some(serde_json::to_string(&attributes)?), indexes)
            }
            None => (None, Vec::new()),
        };
        writes.push(RecordWrite {
            key: keys.record(&record.kind, &record.id),
            indexes_key: keys.record_indexes(&record.kind, &record.id),
            id: record.id,
            value,
            indexes,
        });
    }

    let links = changes
        .links
        .into_iter()
        .map(|(link, linked)| LinkWrite {
            key: keys.link(&link.kind, &link.relation, &link.owner),
            reverse_key: keys.link_reverse(&link.kind, &link.relation, &link.member),
            owner: link.owner,
            member: link.member,
            linked,
        })
        .collect();

    Ok((ApplyCommand { checks, writes, links }, described))
}

impl<C> Backend for RedisBackend<C>
where
    C: ConnectionLike + Send,
{
    async fn load(&mut self, kind: &str, id: &str) -> Result<Option<Attributes>, StoreError> {
        let key = KeyContext::new(&self.prefix).record(kind, id);
        let raw: Option<String> = cmd("GET").arg(&key).query_async(&mut self.connection).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn candidates(&mut self, kind: &str, field: &str, value: &Value) -> Result<Vec<String>, StoreError> {
        let Some(token) = index_token(value) else {
            return Ok(Vec::new());
        };
        let key = KeyContext::new(&self.prefix).index(kind, field, &token);
        Ok(cmd("SMEMBERS").arg(&key).query_async(&mut self.connection).await?)
    }

    async fn members(&mut self, kind: &str, relation: &str, owner: &str) -> Result<Vec<String>, StoreError> {
        let key = KeyContext::new(&self.prefix).link(kind, relation, owner);
        Ok(cmd("SMEMBERS").arg(&key).query_async(&mut self.connection).await?)
    }

    async fn owners(&mut self, kind: &str, relation: &str, member: &str) -> Result<Vec<String>, StoreError> {
        let key = KeyContext::new(&self.prefix).link_reverse(kind, relation, member);
        Ok(cmd("SMEMBERS").arg(&key).query_async(&mut self.connection).await?)
    }

    async fn apply(&mut self, changes: ChangeSet) -> Result<(), StoreError> {
        let (command, described) = apply_command(&self.prefix, changes)?;
        let payload = serde_json::to_string(&command)?;

        let mut invocation = APPLY_CHANGESET_SCRIPT.prepare_invoke();
        invocation.arg(payload);
        let raw: String = invocation.invoke_async(&mut self.connection).await?;

        let response: Value = serde_json::from_str(&raw)?;
        if let Some(failed) = response.get("conflict").and_then(Value::as_u64) {
            let guard = usize::try_from(failed)
                .ok()
                .and_then(|position| described.get(position.saturating_sub(1)))
                .cloned()
                .unwrap_or_else(|| format!("check {failed}"));
            log::warn!("change set under `{}` rejected: {guard}", self.prefix);
            return Err(StoreError::Conflict { guard });
        }
        if let Some(error) = response.get("error") {
            return Err(StoreError::Other {
                message: format!("apply_changeset failed: {error}").into(),
            });
        }
        log::debug!(
            "applied {} record writes and {} link writes under `{}`",
            command.writes.len(),
            command.links.len(),
            self.prefix
        );
        Ok(())
    }
}

//! Authorization gate consulted before a graph commit touches storage.

use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// The principal on whose behalf a graph is committed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Actor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }
}

pub trait Authorizer {
    fn authorize(&self, actor: &Actor, kind: &str, operation: Operation) -> bool;
}

/// Permits every operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _actor: &Actor, _kind: &str, _operation: Operation) -> bool {
        true
    }
}

/// One role's permission over a set of kinds. `"*"` matches every kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    pub role: String,
    pub kinds: Vec<String>,
    pub operations: Vec<Operation>,
}

impl Grant {
    fn covers(&self, kind: &str, operation: Operation) -> bool {
        self.operations.contains(&operation) && self.kinds.iter().any(|candidate| candidate == "*" || candidate == kind)
    }
}

/// Role-based authorizer built from configured grants.
#[derive(Debug, Clone, Default)]
pub struct PolicyAuthorizer {
    grants: Vec<Grant>,
}

impl PolicyAuthorizer {
    pub fn new(grants: Vec<Grant>) -> Self {
        Self { grants }
    }

    pub fn grant<I, K>(mut self, role: impl Into<String>, kinds: I, operations: &[Operation]) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.grants.push(Grant {
            role: role.into(),
            kinds: kinds.into_iter().map(Into::into).collect(),
            operations: operations.to_vec(),
        });
        self
    }

    /// Roles that hold at least one grant.
    pub fn roles(&self) -> BTreeSet<&str> {
        self.grants.iter().map(|grant| grant.role.as_str()).collect()
    }
}

impl Authorizer for PolicyAuthorizer {
    fn authorize(&self, actor: &Actor, kind: &str, operation: Operation) -> bool {
        self.grants
            .iter()
            .any(|grant| actor.roles.iter().any(|role| role == &grant.role) && grant.covers(kind, operation))
    }
}

//! Submitted document trees.
//!
//! A [`Document`] describes one record inline: its kind, an optional id
//! (present when it updates an existing record), scalar attributes and
//! relation payloads. Relation payloads hold further inline documents or
//! [`Reference`]s to records that already exist.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Attributes;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relations: BTreeMap<String, RelationPayload>,
}

impl Document {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            attributes: Attributes::new(),
            relations: BTreeMap::new(),
        }
    }

    /// Targets an existing record.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn one(mut self, relation: impl Into<String>, node: impl Into<Node>) -> Self {
        self.relations.insert(relation.into(), RelationPayload::One(node.into()));
        self
    }

    pub fn many<I>(mut self, relation: impl Into<String>, nodes: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Node>,
    {
        let nodes = nodes.into_iter().map(Into::into).collect();
        self.relations.insert(relation.into(), RelationPayload::Many(nodes));
        self
    }

    /// Clears a relation: nulls a direct reference or empties a collection.
    pub fn null(mut self, relation: impl Into<String>) -> Self {
        self.relations.insert(relation.into(), RelationPayload::Null);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node {
    Inline(Box<Document>),
    Reference(Reference),
}

impl Node {
    pub fn id(id: impl Into<String>) -> Self {
        Self::Reference(Reference::Id { id: id.into() })
    }

    pub fn scoped(scope_attribute: impl Into<String>, scope_value: impl Into<Value>) -> Self {
        Self::Reference(Reference::Scoped {
            scope_attribute: scope_attribute.into(),
            scope_value: scope_value.into(),
        })
    }
}

impl From<Document> for Node {
    fn from(document: Document) -> Self {
        Self::Inline(Box::new(document))
    }
}

impl From<Reference> for Node {
    fn from(reference: Reference) -> Self {
        Self::Reference(reference)
    }
}

/// Points at a record that is not described inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reference {
    Id { id: String },
    /// The record whose `scope_attribute` equals `scope_value` within the graph's namespace.
    Scoped { scope_attribute: String, scope_value: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelationPayload {
    Null,
    Many(Vec<Node>),
    One(Node),
}

impl RelationPayload {
    pub fn nodes(&self) -> &[Node] {
        match self {
            Self::Null => &[],
            Self::Many(nodes) => nodes,
            Self::One(node) => std::slice::from_ref(node),
        }
    }
}

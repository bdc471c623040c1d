//! Owned catalogue of record kinds.

use std::{collections::BTreeMap, path::Path};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    errors::StoreError,
    types::{Cardinality, CascadePolicy, KindDescriptor, Ownership, RelationDescriptor},
};

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("kind `{kind}` is declared twice")]
    DuplicateKind { kind: String },

    #[error("relation `{kind}.{relation}` targets undeclared kind `{target}`")]
    UnknownTarget {
        kind: String,
        relation: String,
        target: String,
    },

    #[error("relation `{kind}.{relation}` is invalid: {message}")]
    InvalidRelation {
        kind: String,
        relation: String,
        message: String,
    },

    #[error("kind `{kind}` is invalid: {message}")]
    InvalidKind { kind: String, message: String },

    #[error("failed to read schema file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse schema: {0}")]
    Parse(#[from] toml::de::Error),
}

/// A relation on another kind that points at a given kind.
#[derive(Debug, Clone)]
pub struct IncomingRelation<'a> {
    pub source: &'a KindDescriptor,
    pub relation: &'a RelationDescriptor,
}

#[derive(Debug, Clone, Default)]
pub struct Schema {
    kinds: BTreeMap<String, KindDescriptor>,
}

#[derive(Debug, Default, Deserialize)]
struct SchemaFile {
    #[serde(default)]
    kinds: Vec<KindDescriptor>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn from_toml_str(source: &str) -> Result<Self, SchemaError> {
        let file: SchemaFile = toml::from_str(source)?;
        file.kinds.into_iter().fold(Self::builder(), SchemaBuilder::kind).build()
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn kind(&self, name: &str) -> Option<&KindDescriptor> {
        self.kinds.get(name)
    }

    /// Like [`kind`](Self::kind), but an undeclared kind is an error.
    pub fn require(&self, name: &str) -> Result<&KindDescriptor, StoreError> {
        self.kind(name).ok_or_else(|| StoreError::UnknownKind { kind: name.to_string() })
    }

    pub fn kinds(&self) -> impl Iterator<Item = &KindDescriptor> {
        self.kinds.values()
    }

    /// Direct relations on any kind whose target is `target`.
    pub fn incoming_relations(&self, target: &str) -> Vec<IncomingRelation<'_>> {
        let mut incoming = Vec::new();
        for source in self.kinds.values() {
            for relation in source.direct_relations() {
                if relation.target == target {
                    incoming.push(IncomingRelation { source, relation });
                }
            }
        }
        incoming
    }

    /// Many-to-many relations on any kind whose target is `target`.
    pub fn incoming_links(&self, target: &str) -> Vec<IncomingRelation<'_>> {
        let mut incoming = Vec::new();
        for source in self.kinds.values() {
            for relation in &source.relations {
                if relation.ownership == Ownership::ManyToMany && relation.target == target {
                    incoming.push(IncomingRelation { source, relation });
                }
            }
        }
        incoming
    }

    fn validate(&self) -> Result<(), SchemaError> {
        for kind in self.kinds.values() {
            for relation in &kind.relations {
                self.validate_relation(kind, relation)?;
            }
            if let Some(parent) = &kind.parent {
                match kind.find_relation(parent) {
                    Some(relation) if relation.is_direct() && !relation.nullable => {}
                    _ => {
                        return Err(SchemaError::InvalidKind {
                            kind: kind.name.clone(),
                            message: format!("parent `{parent}` must name a required direct relation"),
                        });
                    }
                }
            }
            if let Some(natural_key) = &kind.natural_key
                && kind.find_attribute(natural_key).is_none()
            {
                return Err(SchemaError::InvalidKind {
                    kind: kind.name.clone(),
                    message: format!("natural key `{natural_key}` is not an attribute"),
                });
            }
            for constraint in &kind.unique_constraints {
                for field in &constraint.fields {
                    let stored = kind.find_attribute(field).is_some()
                        || kind.find_relation(field).is_some_and(RelationDescriptor::is_direct);
                    if !stored {
                        return Err(SchemaError::InvalidKind {
                            kind: kind.name.clone(),
                            message: format!("unique constraint field `{field}` is not stored on the record"),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_relation(&self, kind: &KindDescriptor, relation: &RelationDescriptor) -> Result<(), SchemaError> {
        let invalid = |message: &str| SchemaError::InvalidRelation {
            kind: kind.name.clone(),
            relation: relation.name.clone(),
            message: message.to_string(),
        };

        let Some(target) = self.kinds.get(&relation.target) else {
            return Err(SchemaError::UnknownTarget {
                kind: kind.name.clone(),
                relation: relation.name.clone(),
                target: relation.target.clone(),
            });
        };

        if kind.find_attribute(&relation.name).is_some() {
            return Err(invalid("name collides with an attribute"));
        }

        match relation.ownership {
            Ownership::Direct => {
                if relation.cardinality != Cardinality::One {
                    return Err(invalid("direct relations must have cardinality one"));
                }
                if relation.cascade == CascadePolicy::Detach && !relation.nullable {
                    return Err(invalid("detach cascade requires a nullable relation"));
                }
            }
            Ownership::Reverse => {
                let Some(back_reference) = &relation.back_reference else {
                    return Err(invalid("reverse relations must name a back_reference"));
                };
                match target.find_relation(back_reference) {
                    Some(back) if back.is_direct() && back.target == kind.name => {}
                    _ => {
                        return Err(invalid(&format!(
                            "back_reference `{}.{back_reference}` must be a direct relation to `{}`",
                            target.name, kind.name
                        )));
                    }
                }
            }
            Ownership::ManyToMany => {
                if relation.cardinality != Cardinality::Many {
                    return Err(invalid("many-to-many relations must have cardinality many"));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct SchemaBuilder {
    kinds: Vec<KindDescriptor>,
}

impl SchemaBuilder {
    pub fn kind(mut self, kind: KindDescriptor) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn build(self) -> Result<Schema, SchemaError> {
        let mut kinds = BTreeMap::new();
        for kind in self.kinds {
            if kinds.contains_key(&kind.name) {
                return Err(SchemaError::DuplicateKind { kind: kind.name });
            }
            kinds.insert(kind.name.clone(), kind);
        }
        let schema = Schema { kinds };
        schema.validate()?;
        Ok(schema)
    }
}

//! Relation classification for one inline document.
//!
//! Classification is a lookup on the kind's relation descriptors. Payload
//! shape is only checked against the declared cardinality, never used to
//! decide what a relation is.

use crate::{
    document::{Document, RelationPayload},
    errors::GraphError,
    types::{Attributes, Cardinality, KindDescriptor, Ownership, RelationDescriptor},
};

use super::path::NodePath;

/// A relation present in the document, paired with its payload.
#[derive(Debug, Clone)]
pub struct PresentRelation<'k> {
    pub relation: &'k RelationDescriptor,
    pub payload: RelationPayload,
}

/// Relations of one document split by when they can be applied.
#[derive(Debug, Clone, Default)]
pub struct Classified<'k> {
    pub scalars: Attributes,
    /// Non-nullable direct relations: resolved before insertion.
    pub required: Vec<PresentRelation<'k>>,
    /// Nullable direct relations: applied once the record exists.
    pub optional: Vec<PresentRelation<'k>>,
    /// Reverse and many-to-many relations: reconciled once the record exists.
    pub reverse: Vec<PresentRelation<'k>>,
}

impl<'k> Classified<'k> {
    pub fn relations(&self) -> impl Iterator<Item = &PresentRelation<'k>> {
        self.required.iter().chain(&self.optional).chain(&self.reverse)
    }
}

pub fn classify<'k>(kind: &'k KindDescriptor, document: &Document, path: &NodePath) -> Result<Classified<'k>, GraphError> {
    let invalid = |field: &str, message: String| GraphError::InvalidDocument {
        path: path.child(field).to_string(),
        message,
    };

    let mut scalars = Attributes::new();
    let mut payloads = document.relations.clone();

    for (name, value) in &document.attributes {
        if kind.find_attribute(name).is_some() {
            scalars.insert(name.clone(), value.clone());
        } else if kind.find_relation(name).is_some() {
            if payloads.contains_key(name) {
                return Err(invalid(name, "relation given both as an attribute and a relation".to_string()));
            }
            let payload = serde_json::from_value(value.clone())
                .map_err(|err| invalid(name, format!("malformed relation payload: {err}")))?;
            payloads.insert(name.clone(), payload);
        } else {
            return Err(invalid(name, format!("`{}` has no attribute or relation named `{name}`", kind.name)));
        }
    }

    let mut classified = Classified {
        scalars,
        ..Classified::default()
    };

    for relation in &kind.relations {
        let Some(payload) = payloads.remove(&relation.name) else {
            continue;
        };
        let shape_ok = match (&payload, relation.cardinality) {
            (RelationPayload::Null, _) => true,
            (RelationPayload::One(_), Cardinality::One) => true,
            (RelationPayload::Many(_), Cardinality::Many) => true,
            _ => false,
        };
        if !shape_ok {
            let expected = match relation.cardinality {
                Cardinality::One => "a single node or null",
                Cardinality::Many => "a list or null",
            };
            return Err(invalid(
                &relation.name,
                format!("`{}.{}` expects {expected}", kind.name, relation.name),
            ));
        }

        let present = PresentRelation { relation, payload };
        match relation.ownership {
            Ownership::Direct if relation.nullable => classified.optional.push(present),
            Ownership::Direct => classified.required.push(present),
            Ownership::Reverse | Ownership::ManyToMany => classified.reverse.push(present),
        }
    }

    if let Some(name) = payloads.keys().next() {
        return Err(invalid(name, format!("`{}` has no relation named `{name}`", kind.name)));
    }

    Ok(classified)
}

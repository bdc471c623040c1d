use std::fmt;

use serde::{Deserialize, Serialize};

/// Attribute values of one stored record, keyed by attribute or direct-relation name.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Describes one record kind: its scalar attributes and its relations.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct KindDescriptor {
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<AttributeDescriptor>,
    #[serde(default)]
    pub relations: Vec<RelationDescriptor>,
    /// Direct relation naming the single ancestor kind that owns records of this kind.
    #[serde(default)]
    pub parent: Option<String>,
    /// Records of this kind are namespace boundaries for scope-qualified references.
    #[serde(default)]
    pub namespace: bool,
    /// Attribute used to match inline children against existing ones when no id is given.
    #[serde(default)]
    pub natural_key: Option<String>,
    #[serde(default)]
    pub unique_constraints: Vec<UniqueConstraintDescriptor>,
}

impl KindDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn attribute(mut self, attribute: AttributeDescriptor) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn relation(mut self, relation: RelationDescriptor) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn parent(mut self, relation: impl Into<String>) -> Self {
        self.parent = Some(relation.into());
        self
    }

    pub fn namespace(mut self) -> Self {
        self.namespace = true;
        self
    }

    pub fn natural_key(mut self, attribute: impl Into<String>) -> Self {
        self.natural_key = Some(attribute.into());
        self
    }

    pub fn unique(mut self, constraint: UniqueConstraintDescriptor) -> Self {
        self.unique_constraints.push(constraint);
        self
    }

    pub fn find_attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|attribute| attribute.name == name)
    }

    pub fn find_relation(&self, name: &str) -> Option<&RelationDescriptor> {
        self.relations.iter().find(|relation| relation.name == name)
    }

    /// Relations whose value is stored on this record.
    pub fn direct_relations(&self) -> impl Iterator<Item = &RelationDescriptor> {
        self.relations.iter().filter(|relation| relation.ownership == Ownership::Direct)
    }

    pub fn parent_relation(&self) -> Option<&RelationDescriptor> {
        self.parent.as_deref().and_then(|name| self.find_relation(name))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    pub name: String,
    #[serde(default, rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub validations: Vec<ValidationDescriptor>,
    /// Stamped with the insertion time when the record is created.
    #[serde(default)]
    pub auto_created: bool,
    /// Stamped with the write time on every create or update.
    #[serde(default)]
    pub auto_updated: bool,
}

impl AttributeDescriptor {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            ..Self::default()
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn default_value(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn validate(mut self, rule: ValidationRule) -> Self {
        self.validations.push(ValidationDescriptor {
            scope: ValidationScope::Field,
            rule,
        });
        self
    }

    /// Applies `rule` to every element of an array attribute.
    pub fn validate_each(mut self, rule: ValidationRule) -> Self {
        self.validations.push(ValidationDescriptor {
            scope: ValidationScope::EachElement,
            rule,
        });
        self
    }

    pub fn auto_created(mut self) -> Self {
        self.auto_created = true;
        self
    }

    pub fn auto_updated(mut self) -> Self {
        self.auto_updated = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Array,
    #[default]
    Object,
    DateTime,
}

/// A declared relation between two record kinds.
///
/// Classification never inspects payload shape: a relation is direct,
/// reverse or many-to-many because its descriptor says so.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationDescriptor {
    pub name: String,
    pub target: String,
    #[serde(default)]
    pub cardinality: Cardinality,
    #[serde(default)]
    pub ownership: Ownership,
    #[serde(default)]
    pub nullable: bool,
    /// For reverse relations: the direct relation on the target that points back here.
    #[serde(default)]
    pub back_reference: Option<String>,
    /// For direct relations: what happens to this record when its target is deleted.
    #[serde(default)]
    pub cascade: CascadePolicy,
}

impl RelationDescriptor {
    /// A required direct relation (this record stores a non-null target id).
    pub fn required(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            cardinality: Cardinality::One,
            ownership: Ownership::Direct,
            nullable: false,
            back_reference: None,
            cascade: CascadePolicy::Protect,
        }
    }

    /// A nullable direct relation.
    pub fn optional(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            nullable: true,
            ..Self::required(name, target)
        }
    }

    /// A to-many relation whose children store `back_reference` pointing at the owner.
    pub fn has_many(name: impl Into<String>, target: impl Into<String>, back_reference: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            cardinality: Cardinality::Many,
            ownership: Ownership::Reverse,
            nullable: true,
            back_reference: Some(back_reference.into()),
            cascade: CascadePolicy::Protect,
        }
    }

    /// A reverse one-to-one: the physical key lives on the other record.
    pub fn has_one(name: impl Into<String>, target: impl Into<String>, back_reference: impl Into<String>) -> Self {
        Self {
            cardinality: Cardinality::One,
            ..Self::has_many(name, target, back_reference)
        }
    }

    pub fn many_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            cardinality: Cardinality::Many,
            ownership: Ownership::ManyToMany,
            nullable: true,
            back_reference: None,
            cascade: CascadePolicy::Protect,
        }
    }

    pub fn cascade(mut self, cascade: CascadePolicy) -> Self {
        self.cascade = cascade;
        self
    }

    pub fn is_direct(&self) -> bool {
        self.ownership == Ownership::Direct
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    #[default]
    One,
    Many,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    /// This record holds the reference.
    #[default]
    Direct,
    /// The related record holds a back-reference to this one.
    Reverse,
    /// A join collection mediates the relation.
    ManyToMany,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadePolicy {
    /// Delete this record along with its target.
    Delete,
    /// Null out the reference; only valid on nullable relations.
    Detach,
    /// Refuse to delete the target while this record references it.
    #[default]
    Protect,
}

/// Describes a unique constraint on one or more fields.
///
/// Fields may name attributes or direct relations, so `["module", "name"]`
/// expresses "name is unique within its module".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniqueConstraintDescriptor {
    pub fields: Vec<String>,
    /// Whether string comparisons ignore case (e.g., "Foo" == "foo")
    #[serde(default)]
    pub case_insensitive: bool,
}

impl UniqueConstraintDescriptor {
    pub fn single(field: impl Into<String>, case_insensitive: bool) -> Self {
        Self {
            fields: vec![field.into()],
            case_insensitive,
        }
    }

    pub fn compound<I, S>(fields: I, case_insensitive: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            case_insensitive,
        }
    }

    pub fn is_compound(&self) -> bool {
        self.fields.len() > 1
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationScope {
    #[default]
    Field,
    EachElement,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationDescriptor {
    #[serde(default)]
    pub scope: ValidationScope,
    #[serde(flatten)]
    pub rule: ValidationRule,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ValidationRule {
    Length {
        #[serde(default)]
        min: Option<usize>,
        #[serde(default)]
        max: Option<usize>,
    },
    Range {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Regex {
        pattern: String,
    },
    Enum {
        allowed: Vec<String>,
        #[serde(default)]
        case_insensitive: bool,
    },
    Email,
    Url,
    Uuid,
    /// Delegates to a validator registered under `name`.
    Custom {
        name: String,
    },
}

/// A `(kind, id)` pair naming one stored record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordRef {
    pub kind: String,
    pub id: String,
}

impl RecordRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// A record as committed inside the current transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistedRecord {
    pub kind: String,
    pub id: String,
    pub attributes: Attributes,
}

impl PersistedRecord {
    pub fn reference(&self) -> RecordRef {
        RecordRef::new(self.kind.clone(), self.id.clone())
    }
}

pub(crate) use entwine::{
    Actor, AttributeDescriptor, CascadePolicy, Change, CommitReceipt, Document, ErrorKind, FieldType, GraphEngine,
    GraphError, KindDescriptor, MemoryBackend, Node, RelationDescriptor, Schema, UniqueConstraintDescriptor,
    ValidationRule,
};
pub(crate) use serde_json::{Value, json};

/// An automation workspace: a `Module` namespace owning triggers, actions,
/// conditions and stages, plus global tags.
pub(crate) fn fixture_schema() -> Schema {
    Schema::builder()
        .kind(
            KindDescriptor::new("Module")
                .namespace()
                .attribute(
                    AttributeDescriptor::new("name", FieldType::String)
                        .validate(ValidationRule::Length { min: Some(1), max: Some(64) }),
                )
                .attribute(AttributeDescriptor::new("created_at", FieldType::DateTime).auto_created())
                .attribute(AttributeDescriptor::new("updated_at", FieldType::DateTime).auto_updated())
                .relation(RelationDescriptor::has_many("triggers", "Trigger", "module"))
                .relation(RelationDescriptor::has_many("actions", "Action", "module"))
                .relation(RelationDescriptor::has_many("conditions", "Condition", "module"))
                .relation(RelationDescriptor::has_many("stages", "Stage", "module"))
                .relation(RelationDescriptor::many_to_many("tags", "Tag"))
                .relation(RelationDescriptor::has_one("manifest", "Manifest", "module")),
        )
        .kind(
            KindDescriptor::new("Trigger")
                .attribute(AttributeDescriptor::new("name", FieldType::String))
                .relation(RelationDescriptor::required("module", "Module").cascade(CascadePolicy::Delete))
                .relation(RelationDescriptor::required("action", "Action"))
                .parent("module"),
        )
        .kind(
            KindDescriptor::new("Action")
                .attribute(AttributeDescriptor::new("name", FieldType::String))
                .attribute(AttributeDescriptor::new("enabled", FieldType::Boolean).default_value(json!(true)))
                .relation(RelationDescriptor::required("module", "Module").cascade(CascadePolicy::Delete))
                .relation(RelationDescriptor::optional("pre_condition", "Condition").cascade(CascadePolicy::Detach))
                .relation(RelationDescriptor::has_many("steps", "Step", "action"))
                .parent("module")
                .natural_key("name")
                .unique(UniqueConstraintDescriptor::compound(["module", "name"], false)),
        )
        .kind(
            KindDescriptor::new("Step")
                .attribute(AttributeDescriptor::new("order", FieldType::Number))
                .relation(RelationDescriptor::required("action", "Action").cascade(CascadePolicy::Delete))
                .relation(RelationDescriptor::optional("condition", "Condition").cascade(CascadePolicy::Detach))
                .parent("action"),
        )
        .kind(
            KindDescriptor::new("Condition")
                .attribute(AttributeDescriptor::new("name", FieldType::String))
                .attribute(AttributeDescriptor::new("expression", FieldType::String).optional())
                .relation(RelationDescriptor::required("module", "Module").cascade(CascadePolicy::Delete))
                .parent("module")
                .natural_key("name")
                .unique(UniqueConstraintDescriptor::compound(["module", "name"], true)),
        )
        .kind(
            KindDescriptor::new("Stage")
                .attribute(
                    AttributeDescriptor::new("name", FieldType::String).validate(ValidationRule::Custom {
                        name: "slug".to_string(),
                    }),
                )
                .relation(RelationDescriptor::required("module", "Module").cascade(CascadePolicy::Delete))
                .relation(RelationDescriptor::optional("redirect", "Stage").cascade(CascadePolicy::Detach))
                .parent("module"),
        )
        .kind(KindDescriptor::new("Tag").attribute(AttributeDescriptor::new("label", FieldType::String)))
        .kind(
            KindDescriptor::new("Manifest")
                .attribute(AttributeDescriptor::new("version", FieldType::String))
                .relation(RelationDescriptor::required("module", "Module").cascade(CascadePolicy::Delete))
                .parent("module"),
        )
        .build()
        .expect("fixture schema is valid")
}

fn slug(_kind: &str, _field: &str, value: &Value, _record: &entwine::Attributes) -> Result<(), String> {
    match value.as_str() {
        Some(text) if !text.is_empty() && text.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') => {
            Ok(())
        }
        _ => Err("must be a lowercase slug".to_string()),
    }
}

pub(crate) fn engine() -> GraphEngine {
    GraphEngine::new(fixture_schema()).with_validator("slug", slug)
}

pub(crate) fn actor() -> Actor {
    Actor::new("tester")
}

pub(crate) async fn create_module(engine: &GraphEngine, backend: &mut MemoryBackend, name: &str) -> String {
    let receipt = engine
        .commit(backend, &actor(), Document::new("Module").attr("name", name))
        .await
        .expect("module commits");
    receipt.root.id
}

pub(crate) fn field<'a>(backend: &'a MemoryBackend, kind: &str, id: &str, name: &str) -> Option<&'a Value> {
    backend.record(kind, id).and_then(|record| record.get(name))
}

/// Ids of stored `kind` records whose `name` attribute equals `value`.
pub(crate) fn ids_where(backend: &MemoryBackend, kind: &str, name: &str, value: &Value) -> Vec<String> {
    backend
        .ids(kind)
        .into_iter()
        .filter(|id| field(backend, kind, id, name) == Some(value))
        .collect()
}

pub(crate) fn single_id(backend: &MemoryBackend, kind: &str, name: &str, value: Value) -> String {
    let ids = ids_where(backend, kind, name, &value);
    assert_eq!(ids.len(), 1, "expected exactly one {kind} with {name} = {value}, found {ids:?}");
    ids[0].clone()
}

pub(crate) fn issue_paths(error: &GraphError) -> Vec<String> {
    let mut paths: Vec<String> = error.issues().into_iter().map(|issue| issue.path).collect();
    paths.sort();
    paths
}

pub(crate) fn changes(receipt: &CommitReceipt, kind: &str) -> Vec<Change> {
    receipt
        .records
        .iter()
        .filter(|record| record.kind == kind)
        .map(|record| record.change)
        .collect()
}

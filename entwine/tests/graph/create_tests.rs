use entwine::{ChannelNotifier, TouchedRecord};

use crate::support::*;

fn onboarding() -> Document {
    serde_json::from_value(json!({
        "kind": "Module",
        "attributes": { "name": "Onboarding" },
        "relations": {
            "triggers": [{
                "kind": "Trigger",
                "attributes": { "name": "on-signup" },
                "relations": { "action": { "scope_attribute": "name", "scope_value": "welcome" } }
            }],
            "actions": [{
                "kind": "Action",
                "attributes": { "name": "welcome" },
                "relations": {
                    "steps": [
                        {
                            "kind": "Step",
                            "attributes": { "order": 0 },
                            "relations": { "condition": { "scope_attribute": "name", "scope_value": "verified" } }
                        },
                        { "kind": "Step", "attributes": { "order": 1 } }
                    ]
                }
            }],
            "conditions": [{ "kind": "Condition", "attributes": { "name": "verified" } }]
        }
    }))
    .expect("document parses")
}

#[tokio::test]
async fn nested_module_commits_as_one_graph() {
    let engine = engine();
    let mut backend = MemoryBackend::new();

    let receipt = engine.commit(&mut backend, &actor(), onboarding()).await.expect("graph commits");

    assert_eq!(backend.commits(), 1);
    assert_eq!(receipt.root.kind, "Module");
    let module = receipt.root.id.clone();
    assert!(receipt.root.attributes.get("created_at").is_some());

    let action = single_id(&backend, "Action", "name", json!("welcome"));
    let condition = single_id(&backend, "Condition", "name", json!("verified"));
    let trigger = single_id(&backend, "Trigger", "name", json!("on-signup"));
    let first_step = single_id(&backend, "Step", "order", json!(0));
    let second_step = single_id(&backend, "Step", "order", json!(1));

    assert_eq!(field(&backend, "Action", &action, "module"), Some(&json!(module)));
    assert_eq!(field(&backend, "Action", &action, "enabled"), Some(&json!(true)));
    assert_eq!(field(&backend, "Condition", &condition, "module"), Some(&json!(module)));
    assert_eq!(field(&backend, "Trigger", &trigger, "action"), Some(&json!(action)));
    assert_eq!(field(&backend, "Step", &first_step, "action"), Some(&json!(action)));
    assert_eq!(field(&backend, "Step", &first_step, "condition"), Some(&json!(condition)));
    assert_eq!(field(&backend, "Step", &second_step, "condition"), None);

    // The trigger names an action that only exists once the first pass built it.
    assert_eq!(receipt.passes, 2);
    assert_eq!(receipt.created().count(), 6);
}

#[tokio::test]
async fn receipt_records_the_path_of_every_written_record() {
    let engine = engine();
    let mut backend = MemoryBackend::new();

    let receipt = engine.commit(&mut backend, &actor(), onboarding()).await.expect("graph commits");

    let path_of = |kind: &str, id: &str| {
        receipt
            .records
            .iter()
            .find(|record| record.kind == kind && record.id == id)
            .map(|record| record.path.clone())
    };
    let second_step = single_id(&backend, "Step", "order", json!(1));
    let trigger = single_id(&backend, "Trigger", "name", json!("on-signup"));

    assert_eq!(path_of("Module", &receipt.root.id).as_deref(), Some("root"));
    assert_eq!(path_of("Step", &second_step).as_deref(), Some("root.actions.0.steps.1"));
    assert_eq!(path_of("Trigger", &trigger).as_deref(), Some("root.triggers.0"));
    assert_eq!(receipt.ids_of("Step").count(), 2);
}

#[tokio::test]
async fn sibling_roots_resolve_scoped_references_to_each_other() {
    let engine = engine();
    let mut backend = MemoryBackend::new();
    let module = create_module(&engine, &mut backend, "Billing").await;

    let receipt = engine
        .commit_all(
            &mut backend,
            &actor(),
            vec![
                Document::new("Action")
                    .attr("name", "A1")
                    .one("module", Node::id(&module))
                    .many(
                        "steps",
                        [Document::new("Step").attr("order", 0).one("condition", Node::scoped("name", "C1"))],
                    ),
                Document::new("Condition").attr("name", "C1").one("module", Node::id(&module)),
            ],
        )
        .await
        .expect("both roots commit");

    assert_eq!(receipt.roots.len(), 2);
    assert_eq!(receipt.root, receipt.roots[0]);
    assert_eq!(receipt.roots[0].kind, "Action");
    assert_eq!(receipt.roots[1].kind, "Condition");

    let step = single_id(&backend, "Step", "order", json!(0));
    assert_eq!(field(&backend, "Step", &step, "condition"), Some(&json!(receipt.roots[1].id)));
    assert_eq!(field(&backend, "Step", &step, "action"), Some(&json!(receipt.roots[0].id)));
    assert_eq!(backend.commits(), 2);
}

#[tokio::test]
async fn mutually_referencing_stages_converge() {
    let engine = engine();
    let mut backend = MemoryBackend::new();

    let receipt = engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module").attr("name", "Pipeline").many(
                "stages",
                [
                    Document::new("Stage").attr("name", "draft").one("redirect", Node::scoped("name", "review")),
                    Document::new("Stage").attr("name", "review").one("redirect", Node::scoped("name", "draft")),
                ],
            ),
        )
        .await
        .expect("cycle resolves");

    let draft = single_id(&backend, "Stage", "name", json!("draft"));
    let review = single_id(&backend, "Stage", "name", json!("review"));
    assert_eq!(field(&backend, "Stage", &draft, "redirect"), Some(&json!(review)));
    assert_eq!(field(&backend, "Stage", &review, "redirect"), Some(&json!(draft)));
    assert_eq!(receipt.passes, 1);
}

#[tokio::test]
async fn updating_a_root_keeps_creation_stamp_and_children() {
    let engine = engine();
    let mut backend = MemoryBackend::new();
    let receipt = engine.commit(&mut backend, &actor(), onboarding()).await.expect("graph commits");
    let module = receipt.root.id.clone();
    let created_at = field(&backend, "Module", &module, "created_at").cloned();

    let receipt = engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module").with_id(&module).attr("name", "Renamed"),
        )
        .await
        .expect("update commits");

    assert_eq!(
        receipt.records,
        vec![TouchedRecord {
            kind: "Module".to_string(),
            id: module.clone(),
            path: "root".to_string(),
            change: Change::Updated,
        }]
    );
    assert_eq!(field(&backend, "Module", &module, "name"), Some(&json!("Renamed")));
    assert_eq!(field(&backend, "Module", &module, "created_at").cloned(), created_at);
    assert_eq!(backend.ids("Action").len(), 1);
    assert_eq!(backend.ids("Step").len(), 2);
}

#[tokio::test]
async fn notifier_hears_once_per_committed_root() {
    let (notifier, mut events) = ChannelNotifier::new();
    let engine = GraphEngine::new(fixture_schema()).with_notifier(notifier);
    let mut backend = MemoryBackend::new();

    let receipt = engine
        .commit_all(
            &mut backend,
            &actor(),
            vec![
                Document::new("Tag").attr("label", "alpha"),
                Document::new("Tag").attr("label", "beta"),
            ],
        )
        .await
        .expect("tags commit");

    let first = events.try_recv().expect("first event");
    let second = events.try_recv().expect("second event");
    assert!(events.try_recv().is_err());
    assert_eq!(first.kind, "Tag");
    assert_eq!(first.id, receipt.roots[0].id);
    assert_eq!(second.id, receipt.roots[1].id);
    assert_eq!(first.records, 2);
}

#[tokio::test]
async fn empty_batch_is_rejected() {
    let engine = engine();
    let mut backend = MemoryBackend::new();

    let error = engine
        .commit_all(&mut backend, &actor(), Vec::new())
        .await
        .expect_err("nothing to commit");

    assert_eq!(error.kind(), ErrorKind::InvalidDocument);
    assert_eq!(backend.commits(), 0);
}

use std::collections::BTreeSet;

use entwine::RecordRef;

use crate::support::*;

fn condition(name: &str) -> Document {
    Document::new("Condition").attr("name", name)
}

async fn module_with_conditions(engine: &GraphEngine, backend: &mut MemoryBackend, names: &[&str]) -> String {
    let receipt = engine
        .commit(
            backend,
            &actor(),
            Document::new("Module")
                .attr("name", "M1")
                .many("conditions", names.iter().map(|name| condition(name))),
        )
        .await
        .expect("module commits");
    receipt.root.id
}

fn change_of(receipt: &CommitReceipt, id: &str) -> Option<Change> {
    receipt.records.iter().find(|record| record.id == id).map(|record| record.change)
}

#[tokio::test]
async fn collection_is_replaced_wholesale() {
    let engine = engine();
    let mut backend = MemoryBackend::new();
    let module = module_with_conditions(&engine, &mut backend, &["a", "b", "c"]).await;
    let a = single_id(&backend, "Condition", "name", json!("a"));
    let b = single_id(&backend, "Condition", "name", json!("b"));
    let c = single_id(&backend, "Condition", "name", json!("c"));

    let receipt = engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module")
                .with_id(&module)
                .many("conditions", [condition("b").attr("expression", "x > 1"), condition("d")]),
        )
        .await
        .expect("replacement commits");

    let d = single_id(&backend, "Condition", "name", json!("d"));
    let remaining: BTreeSet<String> = backend.ids("Condition").into_iter().collect();
    assert_eq!(remaining, BTreeSet::from([b.clone(), d.clone()]));
    assert_eq!(field(&backend, "Condition", &b, "expression"), Some(&json!("x > 1")));
    assert_eq!(field(&backend, "Condition", &d, "module"), Some(&json!(module)));

    assert_eq!(change_of(&receipt, &a), Some(Change::Deleted));
    assert_eq!(change_of(&receipt, &c), Some(Change::Deleted));
    assert_eq!(change_of(&receipt, &b), Some(Change::Updated));
    assert_eq!(change_of(&receipt, &d), Some(Change::Created));
    assert_eq!(receipt.ids_of("Condition").count(), 2);
    assert_eq!(changes(&receipt, "Module"), vec![Change::Updated]);
}

#[tokio::test]
async fn null_and_empty_payloads_clear_a_collection() {
    let engine = engine();
    let mut backend = MemoryBackend::new();
    let module = module_with_conditions(&engine, &mut backend, &["a", "b"]).await;

    engine
        .commit(&mut backend, &actor(), Document::new("Module").with_id(&module).null("conditions"))
        .await
        .expect("null clears");
    assert!(backend.ids("Condition").is_empty());

    let module = module_with_conditions(&engine, &mut backend, &["c"]).await;
    engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module").with_id(&module).many("conditions", Vec::<Node>::new()),
        )
        .await
        .expect("empty list clears");
    assert!(ids_where(&backend, "Condition", "module", &json!(module)).is_empty());
}

#[tokio::test]
async fn absent_relation_leaves_children_alone() {
    let engine = engine();
    let mut backend = MemoryBackend::new();
    let module = module_with_conditions(&engine, &mut backend, &["a", "b"]).await;

    engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module")
                .with_id(&module)
                .many("stages", [Document::new("Stage").attr("name", "draft")]),
        )
        .await
        .expect("stages commit");

    assert_eq!(backend.ids("Condition").len(), 2);
    assert_eq!(backend.ids("Stage").len(), 1);
}

#[tokio::test]
async fn natural_key_match_keeps_nested_children() {
    let engine = engine();
    let mut backend = MemoryBackend::new();
    let receipt = engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module").attr("name", "M1").many(
                "actions",
                [Document::new("Action")
                    .attr("name", "welcome")
                    .many("steps", [Document::new("Step").attr("order", 0)])],
            ),
        )
        .await
        .expect("module commits");
    let module = receipt.root.id;
    let action = single_id(&backend, "Action", "name", json!("welcome"));
    let step = single_id(&backend, "Step", "order", json!(0));

    engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module")
                .with_id(&module)
                .many("actions", [Document::new("Action").attr("name", "welcome").attr("enabled", false)]),
        )
        .await
        .expect("action update commits");

    assert_eq!(backend.ids("Action"), vec![action.clone()]);
    assert_eq!(field(&backend, "Action", &action, "enabled"), Some(&json!(false)));
    assert_eq!(field(&backend, "Step", &step, "action"), Some(&json!(action)));
}

#[tokio::test]
async fn referenced_child_moves_to_the_new_owner() {
    let engine = engine();
    let mut backend = MemoryBackend::new();
    let first = module_with_conditions(&engine, &mut backend, &["shared"]).await;
    let second = create_module(&engine, &mut backend, "M2").await;
    let shared = single_id(&backend, "Condition", "name", json!("shared"));

    let receipt = engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module")
                .with_id(&second)
                .many("conditions", [Node::id(&shared)]),
        )
        .await
        .expect("reparent commits");

    assert_eq!(field(&backend, "Condition", &shared, "module"), Some(&json!(second)));
    assert!(ids_where(&backend, "Condition", "module", &json!(first)).is_empty());
    let moved = receipt
        .records
        .iter()
        .find(|record| record.id == shared)
        .expect("moved condition is in the receipt");
    assert_eq!(moved.change, Change::Updated);
    assert_eq!(moved.path, "root.conditions.0");
}

#[tokio::test]
async fn repeated_reference_is_invalid() {
    let engine = engine();
    let mut backend = MemoryBackend::new();
    let module = module_with_conditions(&engine, &mut backend, &["a"]).await;
    let a = single_id(&backend, "Condition", "name", json!("a"));

    let error = engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module")
                .with_id(&module)
                .many("conditions", [Node::id(&a), Node::id(&a)]),
        )
        .await
        .expect_err("same child listed twice");

    assert_eq!(error.kind(), ErrorKind::InvalidDocument);
    assert_eq!(issue_paths(&error), vec!["root.conditions.1".to_string()]);
}

#[tokio::test]
async fn protected_child_blocks_pruning() {
    let engine = engine();
    let mut backend = MemoryBackend::new();
    let receipt = engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module")
                .attr("name", "M1")
                .many(
                    "triggers",
                    [Document::new("Trigger")
                        .attr("name", "T1")
                        .one("action", Node::scoped("name", "A1"))],
                )
                .many("actions", [Document::new("Action").attr("name", "A1")]),
        )
        .await
        .expect("module commits");
    let module = receipt.root.id;
    let action = single_id(&backend, "Action", "name", json!("A1"));
    let trigger = single_id(&backend, "Trigger", "name", json!("T1"));
    let commits = backend.commits();

    let error = engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module").with_id(&module).many("actions", Vec::<Node>::new()),
        )
        .await
        .expect_err("trigger still points at the action");

    match &error {
        GraphError::ReferentialIntegrityBlocked { path, records, blocking } => {
            assert_eq!(path, "root.actions");
            assert_eq!(records, &vec![RecordRef::new("Action", &action)]);
            assert_eq!(blocking, &vec![RecordRef::new("Trigger", &trigger)]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(backend.commits(), commits);
    assert_eq!(backend.ids("Action"), vec![action]);

    engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module")
                .with_id(&module)
                .many("triggers", Vec::<Node>::new())
                .many("actions", Vec::<Node>::new()),
        )
        .await
        .expect("dropping the trigger first unblocks the action");
    assert!(backend.ids("Action").is_empty());
    assert!(backend.ids("Trigger").is_empty());
}

#[tokio::test]
async fn pruning_detaches_optional_referrers() {
    let engine = engine();
    let mut backend = MemoryBackend::new();
    let receipt = engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module")
                .attr("name", "M1")
                .many("conditions", [condition("C1")])
                .many(
                    "actions",
                    [Document::new("Action").attr("name", "A1").many(
                        "steps",
                        [Document::new("Step").attr("order", 0).one("condition", Node::scoped("name", "C1"))],
                    )],
                ),
        )
        .await
        .expect("module commits");
    let step = single_id(&backend, "Step", "order", json!(0));
    assert!(field(&backend, "Step", &step, "condition").is_some_and(Value::is_string));

    engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module")
                .with_id(&receipt.root.id)
                .many("conditions", Vec::<Node>::new()),
        )
        .await
        .expect("condition removal commits");

    assert!(backend.ids("Condition").is_empty());
    assert_eq!(field(&backend, "Step", &step, "condition"), Some(&Value::Null));
}

#[tokio::test]
async fn many_to_many_replacement_unlinks_without_deleting() {
    let engine = engine();
    let mut backend = MemoryBackend::new();
    let existing = engine
        .commit(&mut backend, &actor(), Document::new("Tag").attr("label", "urgent"))
        .await
        .expect("tag commits")
        .root
        .id;

    let receipt = engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module").attr("name", "M1").many(
                "tags",
                [Node::id(&existing), Document::new("Tag").attr("label", "fresh").into()],
            ),
        )
        .await
        .expect("module commits");
    let module = receipt.root.id;
    let fresh = single_id(&backend, "Tag", "label", json!("fresh"));
    let linked: BTreeSet<String> = backend.linked("Module", "tags", &module).into_iter().collect();
    assert_eq!(linked, BTreeSet::from([existing.clone(), fresh.clone()]));

    engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module").with_id(&module).many("tags", [Node::id(&existing)]),
        )
        .await
        .expect("tag replacement commits");

    assert_eq!(backend.linked("Module", "tags", &module), vec![existing]);
    assert!(backend.record("Tag", &fresh).is_some());
}

#[tokio::test]
async fn has_one_child_is_reused() {
    let engine = engine();
    let mut backend = MemoryBackend::new();
    let receipt = engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module")
                .attr("name", "M1")
                .one("manifest", Document::new("Manifest").attr("version", "1")),
        )
        .await
        .expect("module commits");
    let manifest = single_id(&backend, "Manifest", "version", json!("1"));

    let receipt = engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module")
                .with_id(&receipt.root.id)
                .one("manifest", Document::new("Manifest").attr("version", "2")),
        )
        .await
        .expect("manifest update commits");

    assert_eq!(backend.ids("Manifest"), vec![manifest.clone()]);
    assert_eq!(field(&backend, "Manifest", &manifest, "version"), Some(&json!("2")));
    assert_eq!(changes(&receipt, "Manifest"), vec![Change::Updated]);
}

#[tokio::test]
async fn moving_a_child_survives_the_old_owner_going_first() {
    let engine = engine();
    let mut backend = MemoryBackend::new();
    let source = module_with_conditions(&engine, &mut backend, &["ready"]).await;
    let target = create_module(&engine, &mut backend, "M2").await;
    let moved = single_id(&backend, "Condition", "name", json!("ready"));

    let receipt = engine
        .commit_all(
            &mut backend,
            &actor(),
            vec![
                Document::new("Module")
                    .with_id(source.as_str())
                    .many("conditions", Vec::<Document>::new()),
                Document::new("Module")
                    .with_id(target.as_str())
                    .many("conditions", [Node::id(moved.as_str())]),
            ],
        )
        .await
        .expect("the condition moves to the second module");

    assert_eq!(backend.ids("Condition"), vec![moved.clone()]);
    assert_eq!(field(&backend, "Condition", &moved, "module"), Some(&json!(target)));
    assert_eq!(changes(&receipt, "Condition"), vec![Change::Updated]);
    let touched = receipt.records.iter().find(|record| record.id == moved).expect("condition touched");
    assert_eq!(touched.path, "root.1.conditions.0");
}

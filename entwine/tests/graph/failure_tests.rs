use entwine::{Operation, PolicyAuthorizer};

use crate::support::*;

fn action_with_steps(module: &str, conditions: &[&str]) -> Document {
    let steps = conditions.iter().enumerate().map(|(order, name)| {
        Document::new("Step")
            .attr("order", order as u64)
            .one("condition", Node::scoped("name", *name))
    });
    Document::new("Action")
        .attr("name", "A1")
        .one("module", Node::id(module))
        .many("steps", steps)
}

#[tokio::test]
async fn stall_reports_the_deepest_unresolved_path_and_writes_nothing() {
    let engine = engine();
    let mut backend = MemoryBackend::new();
    let module = create_module(&engine, &mut backend, "M1").await;

    let error = engine
        .commit(&mut backend, &actor(), action_with_steps(&module, &["nope"]))
        .await
        .expect_err("scoped reference cannot resolve");

    assert_eq!(error.kind(), ErrorKind::DeferredResolutionStalled);
    let issues = error.issues();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].path, "root.steps.0.condition");
    assert_eq!(issues[0].kind, ErrorKind::ScopeUnresolved);

    assert!(backend.ids("Action").is_empty());
    assert!(backend.ids("Step").is_empty());
    assert_eq!(backend.commits(), 1);
}

#[tokio::test]
async fn every_stuck_sibling_is_reported() {
    let engine = engine();
    let mut backend = MemoryBackend::new();
    let module = create_module(&engine, &mut backend, "M1").await;

    let error = engine
        .commit(&mut backend, &actor(), action_with_steps(&module, &["missing", "gone"]))
        .await
        .expect_err("neither step resolves");

    assert_eq!(
        issue_paths(&error),
        vec!["root.steps.0.condition".to_string(), "root.steps.1.condition".to_string()]
    );
}

#[tokio::test]
async fn missing_required_target_is_fatal() {
    let engine = engine();
    let mut backend = MemoryBackend::new();

    let error = engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Action").attr("name", "A1").one("module", Node::id("missing")),
        )
        .await
        .expect_err("module does not exist");

    assert_eq!(error.kind(), ErrorKind::RequiredRelationUnresolvable);
    assert_eq!(issue_paths(&error), vec!["root.module".to_string()]);
    assert!(backend.is_empty());
}

#[tokio::test]
async fn omitted_required_relation_is_fatal() {
    let engine = engine();
    let mut backend = MemoryBackend::new();

    let error = engine
        .commit(&mut backend, &actor(), Document::new("Action").attr("name", "A1"))
        .await
        .expect_err("module is required");

    assert!(matches!(
        &error,
        GraphError::RequiredRelationUnresolvable { path, .. } if path == "root.module"
    ));
}

#[tokio::test]
async fn null_required_relation_is_fatal() {
    let engine = engine();
    let mut backend = MemoryBackend::new();

    let error = engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Action").attr("name", "A1").null("module"),
        )
        .await
        .expect_err("module may not be null");

    assert_eq!(error.kind(), ErrorKind::RequiredRelationUnresolvable);
}

#[tokio::test]
async fn scalar_validation_failures_carry_attribute_paths() {
    let engine = engine();
    let mut backend = MemoryBackend::new();

    let error = engine
        .commit(&mut backend, &actor(), Document::new("Module").attr("name", ""))
        .await
        .expect_err("name is too short");

    let issues = error.issues();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].path, "root.name");
    assert_eq!(issues[0].kind, ErrorKind::ScalarValidationFailed);
    assert!(issues[0].message.starts_with("validation.length"));
}

#[tokio::test]
async fn custom_validator_failure_rolls_back_the_whole_graph() {
    let engine = engine();
    let mut backend = MemoryBackend::new();

    let error = engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module")
                .attr("name", "Pipeline")
                .many("stages", [Document::new("Stage").attr("name", "Not A Slug")]),
        )
        .await
        .expect_err("stage name is not a slug");

    let issues = error.issues();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].path, "root.stages.0.name");
    assert!(issues[0].message.contains("validation.slug"));
    // The module itself was built in the first pass before the stage stalled.
    assert!(backend.is_empty());
    assert_eq!(backend.commits(), 0);
}

#[tokio::test]
async fn unknown_fields_are_rejected_before_any_write() {
    let engine = engine();
    let mut backend = MemoryBackend::new();

    let error = engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module").attr("name", "M1").attr("colour", "blue"),
        )
        .await
        .expect_err("colour is not an attribute");

    assert_eq!(error.kind(), ErrorKind::InvalidDocument);
    assert_eq!(issue_paths(&error), vec!["root.colour".to_string()]);
    assert_eq!(backend.commits(), 0);
}

#[tokio::test]
async fn wrong_kind_in_a_collection_is_invalid() {
    let engine = engine();
    let mut backend = MemoryBackend::new();

    let error = engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module")
                .attr("name", "M1")
                .many("conditions", [Document::new("Action").attr("name", "A1")]),
        )
        .await
        .expect_err("conditions hold Condition documents");

    assert_eq!(error.kind(), ErrorKind::InvalidDocument);
    assert_eq!(issue_paths(&error), vec!["root.conditions.0".to_string()]);
    assert!(backend.is_empty());
}

#[tokio::test]
async fn duplicate_unique_keys_in_one_graph_stall() {
    let engine = engine();
    let mut backend = MemoryBackend::new();

    let error = engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module").attr("name", "M1").many(
                "conditions",
                [
                    Document::new("Condition").attr("name", "Ready"),
                    Document::new("Condition").attr("name", "ready"),
                ],
            ),
        )
        .await
        .expect_err("condition names are unique per module ignoring case");

    let issues = error.issues();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].path, "root.conditions.1");
    assert_eq!(issues[0].kind, ErrorKind::ConstraintViolation);
    assert!(backend.is_empty());
}

#[tokio::test]
async fn unknown_record_id_is_invalid() {
    let engine = engine();
    let mut backend = MemoryBackend::new();

    let error = engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module").with_id("ghost").attr("name", "M1"),
        )
        .await
        .expect_err("no such module");

    assert_eq!(error.kind(), ErrorKind::InvalidDocument);
    assert!(backend.is_empty());
}

#[tokio::test]
async fn authorization_covers_implicit_deletes() {
    let policy = PolicyAuthorizer::default().grant("editor", ["*"], &[Operation::Create, Operation::Update]);
    let engine = GraphEngine::new(fixture_schema()).with_authorizer(policy);
    let mut backend = MemoryBackend::new();
    let editor = Actor::new("ada").with_role("editor");

    engine
        .commit(&mut backend, &editor, Document::new("Module").attr("name", "Flat"))
        .await
        .expect("plain create is granted");

    let error = engine
        .commit(
            &mut backend,
            &editor,
            Document::new("Module")
                .attr("name", "Nested")
                .many("conditions", [Document::new("Condition").attr("name", "C1")]),
        )
        .await
        .expect_err("replacing a collection may delete conditions");

    match error {
        GraphError::AuthorizationDenied {
            path,
            kind,
            operation,
            actor,
        } => {
            assert_eq!(path, "root.conditions");
            assert_eq!(kind, "Condition");
            assert_eq!(operation, Operation::Delete);
            assert_eq!(actor, "ada");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(backend.commits(), 1);
    assert_eq!(backend.ids("Module").len(), 1);
}

#[tokio::test]
async fn actor_without_roles_is_denied() {
    let policy = PolicyAuthorizer::default().grant("editor", ["Module"], &[Operation::Create]);
    let engine = GraphEngine::new(fixture_schema()).with_authorizer(policy);
    let mut backend = MemoryBackend::new();

    let error = engine
        .commit(&mut backend, &actor(), Document::new("Module").attr("name", "M1"))
        .await
        .expect_err("tester holds no role");

    assert_eq!(error.kind(), ErrorKind::AuthorizationDenied);
    assert_eq!(backend.commits(), 0);
}

fn denial(error: GraphError) -> (String, String, Operation) {
    match error {
        GraphError::AuthorizationDenied {
            path, kind, operation, ..
        } => (path, kind, operation),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn reusing_children_in_place_needs_update_rights() {
    let mut backend = MemoryBackend::new();
    let seeded = engine()
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module")
                .attr("name", "M1")
                .many("actions", [Document::new("Action").attr("name", "welcome")])
                .one("manifest", Document::new("Manifest").attr("version", "1")),
        )
        .await
        .expect("module seeds");
    let module = seeded.root.id;
    let action = single_id(&backend, "Action", "name", json!("welcome"));
    let commits = backend.commits();

    let policy = PolicyAuthorizer::default()
        .grant("editor", ["*"], &[Operation::Create])
        .grant("editor", ["Module"], &[Operation::Update])
        .grant("editor", ["Action", "Step", "Manifest"], &[Operation::Delete]);
    let engine = GraphEngine::new(fixture_schema()).with_authorizer(policy);
    let editor = Actor::new("ada").with_role("editor");

    let error = engine
        .commit(
            &mut backend,
            &editor,
            Document::new("Module")
                .with_id(module.as_str())
                .many("actions", [Document::new("Action").attr("name", "welcome").attr("enabled", false)]),
        )
        .await
        .expect_err("matching by name rewrites the existing action");
    assert_eq!(
        denial(error),
        ("root.actions.0".to_string(), "Action".to_string(), Operation::Update)
    );

    let error = engine
        .commit(
            &mut backend,
            &editor,
            Document::new("Module")
                .with_id(module.as_str())
                .one("manifest", Document::new("Manifest").attr("version", "2")),
        )
        .await
        .expect_err("a has-one child is reused in place");
    assert_eq!(
        denial(error),
        ("root.manifest".to_string(), "Manifest".to_string(), Operation::Update)
    );

    assert_eq!(backend.commits(), commits);
    assert_eq!(field(&backend, "Action", &action, "enabled"), Some(&json!(true)));
    let manifest = single_id(&backend, "Manifest", "version", json!("1"));
    assert_eq!(field(&backend, "Manifest", &manifest, "module"), Some(&json!(module)));
}

#[tokio::test]
async fn cascading_deletes_are_authorized_per_kind() {
    let mut backend = MemoryBackend::new();
    let seeded = engine()
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module").attr("name", "M1").many(
                "actions",
                [Document::new("Action")
                    .attr("name", "welcome")
                    .many("steps", [Document::new("Step").attr("order", 0), Document::new("Step").attr("order", 1)])],
            ),
        )
        .await
        .expect("module seeds");
    let module = seeded.root.id;

    let policy = PolicyAuthorizer::default()
        .grant("editor", ["*"], &[Operation::Create, Operation::Update])
        .grant("editor", ["Action"], &[Operation::Delete]);
    let engine = GraphEngine::new(fixture_schema()).with_authorizer(policy);
    let editor = Actor::new("ada").with_role("editor");

    let error = engine
        .commit(
            &mut backend,
            &editor,
            Document::new("Module")
                .with_id(module.as_str())
                .many("actions", Vec::<Document>::new()),
        )
        .await
        .expect_err("deleting the action would cascade to its steps");

    assert_eq!(
        denial(error),
        ("root.actions".to_string(), "Step".to_string(), Operation::Delete)
    );
    assert_eq!(backend.ids("Action").len(), 1);
    assert_eq!(backend.ids("Step").len(), 2);
}

#[tokio::test]
async fn storage_failures_name_the_failing_node() {
    let engine = engine();
    let mut backend = MemoryBackend::new();
    let module = create_module(&engine, &mut backend, "M1").await;

    let document = Document::new("Action")
        .attr("name", "A1")
        .one("module", Node::id(module.as_str()))
        .many(
            "steps",
            [Document::new("Step")
                .attr("order", 0)
                .one("condition", Node::scoped("name", json!({ "nested": true })))],
        );
    let error = engine
        .commit(&mut backend, &actor(), document)
        .await
        .expect_err("objects cannot be looked up by value");

    assert_eq!(error.kind(), ErrorKind::Storage);
    assert_eq!(issue_paths(&error), vec!["root.steps.0.condition".to_string()]);
    assert!(backend.ids("Action").is_empty());
}

#[tokio::test]
async fn batch_denials_name_the_offending_root() {
    let policy = PolicyAuthorizer::default().grant("editor", ["Tag"], &[Operation::Create]);
    let engine = GraphEngine::new(fixture_schema()).with_authorizer(policy);
    let mut backend = MemoryBackend::new();
    let editor = Actor::new("ada").with_role("editor");

    let error = engine
        .commit_all(
            &mut backend,
            &editor,
            vec![
                Document::new("Tag").attr("label", "alpha"),
                Document::new("Module").attr("name", "M1"),
            ],
        )
        .await
        .expect_err("modules are not granted");

    assert_eq!(issue_paths(&error), vec!["root.1".to_string()]);
    assert_eq!(denial(error), ("root.1".to_string(), "Module".to_string(), Operation::Create));
    assert!(backend.is_empty());
}

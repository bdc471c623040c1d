use crate::support::*;

async fn module_with_condition(engine: &GraphEngine, backend: &mut MemoryBackend, module: &str) -> (String, String) {
    let receipt = engine
        .commit(
            backend,
            &actor(),
            Document::new("Module")
                .attr("name", module)
                .many("conditions", [Document::new("Condition").attr("name", "C1")]),
        )
        .await
        .expect("module commits");
    let module = receipt.root.id;
    let condition = ids_where(backend, "Condition", "module", &json!(module))
        .pop()
        .expect("condition was created");
    (module, condition)
}

fn action_in(module: &str, condition: &str) -> Document {
    Document::new("Action").attr("name", "A1").one("module", Node::id(module)).many(
        "steps",
        [Document::new("Step").attr("order", 0).one("condition", Node::scoped("name", condition))],
    )
}

#[tokio::test]
async fn scoped_lookup_stays_inside_the_namespace() {
    let engine = engine();
    let mut backend = MemoryBackend::new();
    let (_, first_condition) = module_with_condition(&engine, &mut backend, "M1").await;
    let (second, second_condition) = module_with_condition(&engine, &mut backend, "M2").await;

    engine
        .commit(&mut backend, &actor(), action_in(&second, "C1"))
        .await
        .expect("resolves inside M2");

    let step = single_id(&backend, "Step", "order", json!(0));
    assert_eq!(field(&backend, "Step", &step, "condition"), Some(&json!(second_condition)));
    assert_ne!(first_condition, second_condition);
}

#[tokio::test]
async fn match_in_another_namespace_does_not_count() {
    let engine = engine();
    let mut backend = MemoryBackend::new();
    module_with_condition(&engine, &mut backend, "M1").await;
    let third = create_module(&engine, &mut backend, "M3").await;

    let error = engine
        .commit(&mut backend, &actor(), action_in(&third, "C1"))
        .await
        .expect_err("M3 has no C1");

    let issues = error.issues();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].kind, ErrorKind::ScopeUnresolved);
    assert_eq!(issues[0].path, "root.steps.0.condition");
}

#[tokio::test]
async fn scoped_values_compare_exactly() {
    let engine = engine();
    let mut backend = MemoryBackend::new();
    let (module, _) = module_with_condition(&engine, &mut backend, "M1").await;

    let error = engine
        .commit(&mut backend, &actor(), action_in(&module, "c1"))
        .await
        .expect_err("lookup is case-sensitive even where uniqueness is not");

    assert_eq!(error.issues()[0].kind, ErrorKind::ScopeUnresolved);
}

#[tokio::test]
async fn global_kinds_resolve_without_a_namespace() {
    let engine = engine();
    let mut backend = MemoryBackend::new();
    let tag = engine
        .commit(&mut backend, &actor(), Document::new("Tag").attr("label", "urgent"))
        .await
        .expect("tag commits")
        .root
        .id;

    let receipt = engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module")
                .attr("name", "M1")
                .many("tags", [Node::scoped("label", "urgent")]),
        )
        .await
        .expect("tag resolves globally");

    assert_eq!(backend.linked("Module", "tags", &receipt.root.id), vec![tag]);
}

#[tokio::test]
async fn ambiguous_scoped_reference_stalls() {
    let engine = engine();
    let mut backend = MemoryBackend::new();
    engine
        .commit_all(
            &mut backend,
            &actor(),
            vec![
                Document::new("Tag").attr("label", "dup"),
                Document::new("Tag").attr("label", "dup"),
            ],
        )
        .await
        .expect("tags commit");

    let error = engine
        .commit(
            &mut backend,
            &actor(),
            Document::new("Module")
                .attr("name", "M1")
                .many("tags", [Node::scoped("label", "dup")]),
        )
        .await
        .expect_err("two tags share the label");

    let issues = error.issues();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].kind, ErrorKind::ScopeAmbiguous);
    assert_eq!(issues[0].path, "root.tags.0");
    assert_eq!(backend.ids("Module").len(), 0);
}

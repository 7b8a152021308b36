use workpad_editor_core::{
    ExtensionRegistry, MarkSpec, Node, NodeSpec, Schema, SchemaError,
};

fn minimal_specs() -> Vec<NodeSpec> {
    vec![
        NodeSpec::new("doc").content("block+"),
        NodeSpec::new("paragraph").content("inline*").groups(["block"]),
        NodeSpec::new("divider").groups(["block"]),
    ]
}

#[test]
fn compiles_minimal_schema() {
    let schema = Schema::compile(minimal_specs(), Vec::new()).unwrap();
    assert!(schema.node_type("paragraph").is_some());
    assert!(schema.node_type("text").is_some(), "text type is implicit");
    assert!(schema.node_type("paragraph").unwrap().is_textblock());
    assert!(!schema.node_type("doc").unwrap().is_textblock());
    assert!(schema.node_type("divider").unwrap().is_leaf());
}

#[test]
fn rejects_duplicate_node_names() {
    let mut specs = minimal_specs();
    specs.push(NodeSpec::new("paragraph").content("inline*"));
    let err = Schema::compile(specs, Vec::new()).unwrap_err();
    assert_eq!(err, SchemaError::DuplicateNode("paragraph".to_string()));
}

#[test]
fn rejects_duplicate_mark_names() {
    let marks = vec![MarkSpec::new("bold"), MarkSpec::new("bold")];
    let err = Schema::compile(minimal_specs(), marks).unwrap_err();
    assert_eq!(err, SchemaError::DuplicateMark("bold".to_string()));
}

#[test]
fn rejects_alias_colliding_with_type_name() {
    let mut specs = minimal_specs();
    specs.push(NodeSpec::new("rule").groups(["block"]).aliases(["divider"]));
    assert!(Schema::compile(specs, Vec::new()).is_err());
}

#[test]
fn rejects_unknown_name_in_content_expression() {
    let specs = vec![NodeSpec::new("doc").content("widget+")];
    match Schema::compile(specs, Vec::new()) {
        Err(SchemaError::UnknownContentRef { name, .. }) => assert_eq!(name, "widget"),
        other => panic!("expected UnknownContentRef, got {other:?}"),
    }
}

#[test]
fn rejects_malformed_content_expression() {
    let specs = vec![NodeSpec::new("doc").content("(block+")];
    assert!(matches!(
        Schema::compile(specs, Vec::new()),
        Err(SchemaError::MalformedContentExpr { .. })
    ));
}

#[test]
fn content_expressions_validate_in_sequence() {
    let specs = vec![
        NodeSpec::new("doc").content("summary block+"),
        NodeSpec::new("summary").content("inline*"),
        NodeSpec::new("paragraph").content("inline*").groups(["block"]),
    ];
    let schema = Schema::compile(specs, Vec::new()).unwrap();

    let summary = Node::element("summary", vec![]);
    let paragraph = Node::element("paragraph", vec![]);
    assert!(schema.valid_content("doc", &[summary.clone(), paragraph.clone()]));
    assert!(!schema.valid_content("doc", &[paragraph.clone()]));
    assert!(!schema.valid_content("doc", &[summary.clone()]));
    assert!(schema.valid_content(
        "doc",
        &[summary, paragraph.clone(), paragraph]
    ));
}

#[test]
fn repetition_and_alternation_operators() {
    let specs = vec![
        NodeSpec::new("doc").content("(heading | paragraph)* divider?"),
        NodeSpec::new("heading").content("inline*"),
        NodeSpec::new("paragraph").content("inline*"),
        NodeSpec::new("divider"),
    ];
    let schema = Schema::compile(specs, Vec::new()).unwrap();

    let h = Node::element("heading", vec![]);
    let p = Node::element("paragraph", vec![]);
    let d = Node::divider();
    assert!(schema.valid_content("doc", &[]));
    assert!(schema.valid_content("doc", &[h.clone(), p.clone(), h.clone()]));
    assert!(schema.valid_content("doc", &[p.clone(), d.clone()]));
    assert!(!schema.valid_content("doc", &[d.clone(), p.clone()]));
    assert!(!schema.valid_content("doc", &[d.clone(), d]));
}

#[test]
fn standard_registry_compiles_with_full_vocabulary() {
    let registry = ExtensionRegistry::standard();
    let schema = registry.schema();
    for kind in [
        "doc",
        "paragraph",
        "heading",
        "blockquote",
        "code_block",
        "bullet_list",
        "ordered_list",
        "list_item",
        "divider",
        "columns",
        "column",
        "table",
        "table_row",
        "table_cell",
        "disclosure_details",
        "disclosure_summary",
        "mention",
        "page_link",
        "database_ref",
        "image",
        "embed",
        "bookmark",
    ] {
        assert!(schema.node_type(kind).is_some(), "missing node `{kind}`");
    }
    for mark in [
        "bold",
        "italic",
        "underline",
        "strikethrough",
        "code",
        "link",
        "text_color",
        "insertion",
        "deletion",
        "format_change",
        "inline_comment",
        "inline_vote",
    ] {
        assert!(schema.mark_type(mark).is_some(), "missing mark `{mark}`");
    }
    assert_eq!(schema.resolve_node_name("bulletList"), Some("bullet_list"));
    assert_eq!(schema.resolve_node_name("horizontalRule"), Some("divider"));
    assert_eq!(schema.resolve_node_name("linkedPage"), Some("page_link"));
    assert_eq!(schema.resolve_mark_name("strong"), Some("bold"));
    assert_eq!(schema.resolve_mark_name("inline-comment"), Some("inline_comment"));
}

use serde_json::json;
use workpad_editor_core::{EditorValue, ExtensionRegistry, Node, ParseError};

fn schema() -> std::sync::Arc<workpad_editor_core::Schema> {
    ExtensionRegistry::standard().schema().clone()
}

#[test]
fn sizes_follow_the_position_scheme() {
    let doc = Node::doc(vec![
        Node::paragraph("ab"),
        Node::divider(),
        Node::element("blockquote", vec![Node::paragraph("c")]),
    ]);
    // paragraph("ab") = 2 + 2, divider = 1, blockquote = 2 + (2 + 1).
    assert_eq!(doc.children()[0].size(), 4);
    assert_eq!(doc.children()[1].size(), 1);
    assert_eq!(doc.children()[2].size(), 5);
    assert_eq!(doc.content_size(), 10);
}

#[test]
fn resolve_reports_ancestry_and_neighbors() {
    let doc = Node::doc(vec![
        Node::paragraph("ab"),
        Node::element("blockquote", vec![Node::paragraph("cd")]),
    ]);

    let inside_first = doc.resolve(2).unwrap();
    assert_eq!(inside_first.depth(), 1);
    assert_eq!(inside_first.parent_offset, 1);
    assert_eq!(inside_first.parent(&doc).kind(), "paragraph");

    // Inside the nested paragraph: blockquote starts at 4, its paragraph
    // at 5, text "cd" at 6.
    let nested = doc.resolve(7).unwrap();
    assert_eq!(nested.depth(), 2);
    assert_eq!(nested.node(&doc, 1).kind(), "blockquote");
    assert_eq!(nested.node(&doc, 2).kind(), "paragraph");
    assert_eq!(nested.start(1), 5);
    assert_eq!(nested.before(1), 4);

    let boundary = doc.resolve(4).unwrap();
    assert_eq!(boundary.depth(), 0);
    assert_eq!(boundary.node_after(&doc).unwrap().kind(), "blockquote");
    assert_eq!(boundary.node_before(&doc).unwrap().kind(), "paragraph");
}

#[test]
fn resolve_rejects_out_of_range_positions() {
    let doc = Node::doc(vec![Node::paragraph("ab")]);
    assert_eq!(doc.content_size(), 4);
    assert!(doc.resolve(4).is_ok());
    let err = doc.resolve(5).unwrap_err();
    assert_eq!(err.pos, 5);
    assert_eq!(err.max, 4);
}

#[test]
fn text_between_concatenates_and_validates() {
    let doc = Node::doc(vec![Node::paragraph("Hello"), Node::paragraph("world")]);
    assert_eq!(doc.text_between(1, 6).unwrap(), "Hello");
    assert_eq!(doc.text_between(2, 5).unwrap(), "ell");
    // Crossing the block boundary concatenates without separators.
    assert_eq!(doc.text_between(1, 13).unwrap(), "Helloworld");
    assert!(doc.text_between(6, 2).is_err());
    assert!(doc.text_between(0, 99).is_err());
}

#[test]
fn descendants_can_skip_subtrees() {
    let doc = Node::doc(vec![
        Node::paragraph("ab"),
        Node::element(
            "table",
            vec![Node::element(
                "table_row",
                vec![Node::element(
                    "table_cell",
                    vec![Node::paragraph("x")],
                )],
            )],
        ),
    ]);

    let mut all = Vec::new();
    doc.descendants(&mut |node, pos| {
        all.push((node.kind().to_string(), pos));
        true
    });
    assert!(all.iter().any(|(kind, _)| kind == "table_cell"));

    let mut skipped = Vec::new();
    doc.descendants(&mut |node, pos| {
        skipped.push((node.kind().to_string(), pos));
        node.kind() != "table"
    });
    assert!(!skipped.iter().any(|(kind, _)| kind == "table_row"));
    assert_eq!(skipped.last().unwrap(), &("table".to_string(), 4));
}

#[test]
fn json_round_trip_is_lossless() {
    let schema = schema();
    let json = json!({
        "type": "doc",
        "content": [
            { "type": "heading", "attrs": { "level": 2 },
              "content": [{ "type": "text", "text": "Title" }] },
            { "type": "paragraph", "content": [
                { "type": "text", "text": "plain " },
                { "type": "text", "text": "bold",
                  "marks": [{ "type": "bold" }] },
                { "type": "mention", "attrs": { "kind": "user", "value": "u1" } }
            ]},
            { "type": "divider" }
        ]
    });
    let doc = Node::from_json(&schema, &json).unwrap();
    let round_tripped = Node::from_json(&schema, &doc.to_json()).unwrap();
    assert_eq!(doc, round_tripped);
}

#[test]
fn legacy_aliases_still_parse() {
    let schema = schema();
    let json = json!({
        "type": "doc",
        "content": [
            { "type": "bulletList", "content": [
                { "type": "listItem", "content": [
                    { "type": "paragraph", "content": [
                        { "type": "text", "text": "hi",
                          "marks": [{ "type": "strong" }] }
                    ]}
                ]}
            ]},
            { "type": "horizontalRule" },
            { "type": "linkedPage", "attrs": { "page_id": "p9" } }
        ]
    });
    let doc = Node::from_json(&schema, &json).unwrap();
    assert_eq!(doc.children()[0].kind(), "bullet_list");
    assert_eq!(doc.children()[0].children()[0].kind(), "list_item");
    assert_eq!(doc.children()[1].kind(), "divider");
    assert_eq!(doc.children()[2].kind(), "page_link");
    let text = &doc.children()[0].children()[0].children()[0].children()[0];
    assert!(text.has_mark("bold"));
}

#[test]
fn unknown_types_fail_to_parse() {
    let schema = schema();
    let json = json!({ "type": "doc", "content": [{ "type": "widget" }] });
    assert_eq!(
        Node::from_json(&schema, &json).unwrap_err(),
        ParseError::UnknownNodeType("widget".to_string())
    );

    let json = json!({
        "type": "doc",
        "content": [{ "type": "paragraph", "content": [
            { "type": "text", "text": "x", "marks": [{ "type": "sparkle" }] }
        ]}]
    });
    assert_eq!(
        Node::from_json(&schema, &json).unwrap_err(),
        ParseError::UnknownMarkType("sparkle".to_string())
    );
}

#[test]
fn content_violations_fail_to_parse() {
    let schema = schema();
    // Bare text directly under doc violates `block+`.
    let json = json!({
        "type": "doc",
        "content": [{ "type": "text", "text": "loose" }]
    });
    assert_eq!(
        Node::from_json(&schema, &json).unwrap_err(),
        ParseError::InvalidContent {
            kind: "doc".to_string()
        }
    );
}

#[test]
fn attr_defaults_fill_missing_attributes() {
    let schema = schema();
    let json = json!({
        "type": "doc",
        "content": [{ "type": "heading", "content": [] }]
    });
    let doc = Node::from_json(&schema, &json).unwrap();
    assert_eq!(doc.children()[0].attr("level"), Some(&json!(1)));
}

#[test]
fn editor_value_envelope_round_trips() {
    let schema = schema();
    let doc = Node::doc(vec![Node::paragraph("persisted")]);
    let value = EditorValue::from_document(&doc);
    let serialized = value.to_json_pretty().unwrap();
    let reloaded = EditorValue::from_json_str(&serialized).unwrap();
    assert_eq!(reloaded.document(&schema).unwrap(), doc);
}

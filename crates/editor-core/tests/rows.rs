use serde_json::json;
use workpad_editor_core::{
    delete_row_tx, drop_row, duplicate_row, insert_row_tx, resolve_row, DragOutcome,
    DropPayload, DuplicateOutcome, Editor, EditorContext, ExtensionRegistry, InputEvent, Node,
    RowState, Selection, UserInfo, ROWS_STATE_KEY,
};

fn editor_with(doc: Node) -> Editor {
    Editor::new(
        doc,
        Selection::collapsed(1),
        ExtensionRegistry::standard(),
        EditorContext::new(UserInfo {
            id: "u1".to_string(),
            username: "ada".to_string(),
        }),
    )
}

fn page_link(id: &str) -> Node {
    let mut attrs = std::collections::BTreeMap::new();
    attrs.insert("page_id".to_string(), json!(id));
    attrs.insert("path_type".to_string(), json!("page"));
    Node::atom("page_link", attrs)
}

#[test]
fn resolves_the_top_level_row_for_nested_positions() {
    // Column layout containing a table containing a paragraph.
    let doc = Node::doc(vec![
        Node::paragraph("intro"),
        Node::element(
            "columns",
            vec![Node::element(
                "column",
                vec![Node::element(
                    "table",
                    vec![Node::element(
                        "table_row",
                        vec![Node::element(
                            "table_cell",
                            vec![Node::paragraph("x")],
                        )],
                    )],
                )],
            )],
        ),
    ]);

    // A position deep inside the table cell resolves to the columns row,
    // not the paragraph inside the cell.
    let deep = doc.children()[0].size() + 6;
    let row = resolve_row(&doc, deep).unwrap();
    assert_eq!(row.kind, "columns");
    assert_eq!(row.from, doc.children()[0].size());

    let shallow = resolve_row(&doc, 2).unwrap();
    assert_eq!(shallow.kind, "paragraph");
    assert_eq!((shallow.from, shallow.to), (0, 7));
}

#[test]
fn resolves_rows_at_top_level_boundaries() {
    let doc = Node::doc(vec![Node::paragraph("ab"), Node::divider()]);
    let at_boundary = resolve_row(&doc, 4).unwrap();
    assert_eq!(at_boundary.kind, "divider");
    let at_end = resolve_row(&doc, doc.content_size()).unwrap();
    assert_eq!(at_end.kind, "divider");
}

#[test]
fn toggle_rows_resolve_to_the_whole_disclosure_block() {
    let doc = Node::doc(vec![Node::element(
        "disclosure_details",
        vec![
            Node::element("disclosure_summary", vec![Node::text("title")]),
            Node::paragraph("body"),
        ],
    )]);
    // Inside the summary text.
    let row = resolve_row(&doc, 3).unwrap();
    assert_eq!(row.kind, "disclosure_details");
    assert_eq!(row.from, 0);

    // Deleting the row removes the summary together with the body.
    let mut editor = editor_with(doc);
    let row = resolve_row(editor.doc(), 3).unwrap();
    editor.apply(delete_row_tx(editor.doc(), &row)).unwrap();
    assert_eq!(editor.doc().children().len(), 1);
    assert_eq!(editor.doc().children()[0].kind(), "paragraph");
    assert_eq!(editor.doc().children()[0].children().len(), 0);
}

#[test]
fn inserts_rows_before_and_after() {
    let mut editor = editor_with(Node::doc(vec![Node::paragraph("a")]));
    let row = resolve_row(editor.doc(), 1).unwrap();
    editor.apply(insert_row_tx(&row, false)).unwrap();
    assert_eq!(editor.doc().children().len(), 2);

    let row = resolve_row(editor.doc(), 1).unwrap();
    editor.apply(insert_row_tx(&row, true)).unwrap();
    assert_eq!(editor.doc().children().len(), 3);
    assert_eq!(editor.doc().children()[0].children().len(), 0);
}

#[test]
fn duplicates_plain_rows_in_place() {
    let mut editor = editor_with(Node::doc(vec![Node::paragraph("dup")]));
    let row = resolve_row(editor.doc(), 1).unwrap();
    match duplicate_row(editor.state(), &row).unwrap() {
        DuplicateOutcome::Transaction(tx) => editor.apply(tx).unwrap(),
        other => panic!("expected plain duplicate, got {other:?}"),
    }
    let doc = editor.doc();
    assert_eq!(doc.children().len(), 2);
    assert_eq!(doc.children()[0], doc.children()[1]);
}

#[test]
fn duplicating_a_reference_row_requires_an_entity_clone() {
    let editor = editor_with(Node::doc(vec![page_link("p1"), Node::paragraph("x")]));
    let row = resolve_row(editor.doc(), 0).unwrap();
    match duplicate_row(editor.state(), &row).unwrap() {
        DuplicateOutcome::NeedsEntityClone {
            kind,
            id,
            insert_pos,
        } => {
            assert_eq!(kind, "page_link");
            assert_eq!(id.as_deref(), Some("p1"));
            assert_eq!(insert_pos, 1);
        }
        other => panic!("expected entity clone request, got {other:?}"),
    }
}

#[test]
fn deleting_the_only_row_leaves_a_blank_paragraph() {
    let mut editor = editor_with(Node::doc(vec![Node::paragraph("only")]));
    let row = resolve_row(editor.doc(), 1).unwrap();
    editor.apply(delete_row_tx(editor.doc(), &row)).unwrap();

    let doc = editor.doc();
    assert_eq!(doc.children().len(), 1);
    assert_eq!(doc.children()[0].kind(), "paragraph");
    assert_eq!(doc.children()[0].children().len(), 0);
}

#[test]
fn drag_reorders_ordinary_rows() {
    let mut editor = editor_with(Node::doc(vec![
        Node::paragraph("a"),
        Node::paragraph("b"),
        Node::paragraph("c"),
    ]));
    let dragged = resolve_row(editor.doc(), 1).unwrap();
    // Drop onto the last row.
    match drop_row(editor.state(), &dragged, 7).unwrap() {
        DragOutcome::Reorder(tx) => editor.apply(tx).unwrap(),
        other => panic!("expected reorder, got {other:?}"),
    }
    let texts: Vec<String> = editor
        .doc()
        .children()
        .iter()
        .map(|row| {
            row.children()
                .iter()
                .filter_map(Node::text_content)
                .collect()
        })
        .collect();
    assert_eq!(texts, vec!["b", "c", "a"]);
}

#[test]
fn dragging_a_page_link_emits_an_external_move_request() {
    let editor = editor_with(Node::doc(vec![
        page_link("p1"),
        Node::paragraph("a"),
        Node::paragraph("b"),
    ]));
    let dragged = resolve_row(editor.doc(), 0).unwrap();
    match drop_row(editor.state(), &dragged, 5).unwrap() {
        DragOutcome::MoveEntity {
            page_id,
            target_index,
        } => {
            assert_eq!(page_id, "p1");
            assert_eq!(target_index, 2);
        }
        other => panic!("expected external move, got {other:?}"),
    }
}

#[test]
fn handle_clicks_set_the_hovered_row() {
    let mut editor = editor_with(Node::doc(vec![
        Node::paragraph("a"),
        Node::paragraph("b"),
    ]));
    let handled = editor
        .dispatch_event(InputEvent::Click {
            pos: 4,
            on_row_handle: true,
        })
        .unwrap();
    assert!(handled);

    let state: RowState = serde_json::from_value(
        editor
            .state()
            .field(ROWS_STATE_KEY)
            .cloned()
            .unwrap_or_default(),
    )
    .unwrap_or_default();
    let hover = state.hover.expect("row is hovered");
    assert_eq!((hover.from, hover.to), (3, 6));

    // A plain click is selection handling, not a row action.
    editor
        .dispatch_event(InputEvent::Click {
            pos: 1,
            on_row_handle: false,
        })
        .unwrap();
    assert_eq!(editor.selection().from(), 1);
}

#[test]
fn dropping_a_row_payload_through_the_event_chain() {
    let mut editor = editor_with(Node::doc(vec![
        Node::paragraph("a"),
        Node::paragraph("b"),
    ]));
    let handled = editor
        .dispatch_event(InputEvent::Drop {
            pos: 4,
            payload: DropPayload::Row { from: 0, to: 3 },
        })
        .unwrap();
    assert!(handled);
    let texts: Vec<String> = editor
        .doc()
        .children()
        .iter()
        .map(|row| {
            row.children()
                .iter()
                .filter_map(Node::text_content)
                .collect()
        })
        .collect();
    assert_eq!(texts, vec!["b", "a"]);
}

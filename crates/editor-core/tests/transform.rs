use workpad_editor_core::{
    ApplyError, Editor, EditorContext, ExtensionRegistry, Mark, Node, Selection, Step, Transaction,
    Transform, UserInfo,
};

fn context() -> EditorContext {
    EditorContext::new(UserInfo {
        id: "u1".to_string(),
        username: "ada".to_string(),
    })
}

fn editor_with(doc: Node) -> Editor {
    Editor::new(
        doc,
        Selection::collapsed(1),
        ExtensionRegistry::standard(),
        context(),
    )
}

fn paragraph_text(doc: &Node, row: usize) -> String {
    doc.children()[row]
        .children()
        .iter()
        .filter_map(Node::text_content)
        .collect()
}

#[test]
fn inserts_text_into_an_empty_paragraph() {
    let mut editor = editor_with(Node::doc(vec![Node::paragraph("")]));
    editor
        .apply(Transaction::new(vec![Step::InsertText {
            pos: 1,
            text: "Hello".to_string(),
            marks: Vec::new(),
        }]))
        .unwrap();

    let doc = editor.doc();
    assert_eq!(doc.children().len(), 1);
    assert_eq!(doc.children()[0].kind(), "paragraph");
    assert_eq!(doc.children()[0].children().len(), 1);
    assert_eq!(doc.text_between(1, 6).unwrap(), "Hello");
}

#[test]
fn rejects_text_insertion_outside_a_textblock() {
    let mut editor = editor_with(Node::doc(vec![Node::paragraph("x")]));
    let err = editor
        .apply(Transaction::new(vec![Step::InsertText {
            pos: 0,
            text: "nope".to_string(),
            marks: Vec::new(),
        }]))
        .unwrap_err();
    assert!(matches!(err, ApplyError::InvalidStep(_)));
}

#[test]
fn a_failing_step_rejects_the_whole_transaction() {
    let mut editor = editor_with(Node::doc(vec![Node::paragraph("Hello")]));
    let before = editor.doc().clone();
    let err = editor.apply(Transaction::new(vec![
        Step::InsertText {
            pos: 1,
            text: "ok ".to_string(),
            marks: Vec::new(),
        },
        Step::Delete { from: 0, to: 99 },
    ]));
    assert!(err.is_err());
    assert_eq!(editor.doc(), &before, "no partial application");
}

#[test]
fn deleting_the_only_required_child_is_a_schema_violation() {
    let doc = Node::doc(vec![Node::element(
        "table",
        vec![Node::element(
            "table_row",
            vec![Node::element(
                "table_cell",
                vec![Node::paragraph("x")],
            )],
        )],
    )]);
    let mut editor = editor_with(doc);
    // The single row spans positions 1..8 inside the table.
    let err = editor
        .apply(Transaction::new(vec![Step::Delete { from: 1, to: 8 }]))
        .unwrap_err();
    assert!(matches!(err, ApplyError::SchemaViolation { ref kind } if kind == "table"));
}

#[test]
fn delete_range_must_stay_inside_one_container() {
    let mut editor = editor_with(Node::doc(vec![
        Node::paragraph("ab"),
        Node::paragraph("cd"),
    ]));
    let err = editor
        .apply(Transaction::new(vec![Step::Delete { from: 2, to: 6 }]))
        .unwrap_err();
    assert!(matches!(err, ApplyError::InvalidStep(_)));
}

#[test]
fn position_maps_translate_across_steps() {
    let schema = ExtensionRegistry::standard().schema().clone();
    let doc = Node::doc(vec![Node::paragraph("Hello")]);

    let mut transform = Transform::new(schema.clone(), doc.clone());
    transform
        .step(Step::InsertText {
            pos: 3,
            text: "XY".to_string(),
            marks: Vec::new(),
        })
        .unwrap();
    assert_eq!(transform.mapping().map(1, 1), 1);
    assert_eq!(transform.mapping().map(3, 1), 5);
    assert_eq!(transform.mapping().map(3, -1), 3);
    assert_eq!(transform.mapping().map(6, 1), 8);

    let mut transform = Transform::new(schema, doc);
    transform.step(Step::Delete { from: 2, to: 5 }).unwrap();
    let result = transform.mapping().map_result(3, 1);
    assert!(result.deleted, "positions inside a deleted range report it");
    assert_eq!(result.pos, 2);
    assert_eq!(transform.mapping().map(6, 1), 3);
    // Mapped positions stay addressable in the new document.
    assert!(transform.doc().resolve(result.pos).is_ok());
}

#[test]
fn add_mark_splits_only_the_covered_range() {
    let mut editor = editor_with(Node::doc(vec![Node::paragraph("abcde")]));
    editor
        .apply(Transaction::new(vec![Step::AddMark {
            from: 2,
            to: 4,
            mark: Mark::new("bold"),
        }]))
        .unwrap();

    let paragraph = &editor.doc().children()[0];
    let pieces: Vec<(String, bool)> = paragraph
        .children()
        .iter()
        .map(|n| {
            (
                n.text_content().unwrap_or_default().to_string(),
                n.has_mark("bold"),
            )
        })
        .collect();
    assert_eq!(
        pieces,
        vec![
            ("a".to_string(), false),
            ("bc".to_string(), true),
            ("de".to_string(), false),
        ]
    );

    // Removing it merges the pieces back into one text node.
    editor
        .apply(Transaction::new(vec![Step::RemoveMark {
            from: 2,
            to: 4,
            mark: Mark::new("bold"),
        }]))
        .unwrap();
    let paragraph = &editor.doc().children()[0];
    assert_eq!(paragraph.children().len(), 1);
    assert_eq!(paragraph.children()[0].text_content(), Some("abcde"));
}

#[test]
fn exclusive_marks_replace_each_other() {
    let mut editor = editor_with(Node::doc(vec![Node::paragraph("abc")]));
    editor
        .apply(Transaction::new(vec![Step::AddMark {
            from: 1,
            to: 4,
            mark: Mark::new("insertion"),
        }]))
        .unwrap();
    editor
        .apply(Transaction::new(vec![Step::AddMark {
            from: 1,
            to: 4,
            mark: Mark::new("deletion"),
        }]))
        .unwrap();

    let text = &editor.doc().children()[0].children()[0];
    assert!(!text.has_mark("insertion"));
    assert!(text.has_mark("deletion"));
    assert_eq!(text.marks().len(), 1);
}

#[test]
fn set_attrs_patches_and_inverts() {
    let mut editor = editor_with(Node::doc(vec![Node::paragraph("x")]));
    editor
        .apply(Transaction::new(vec![Step::SetBlockType {
            pos: 0,
            kind: "heading".to_string(),
            attrs: [("level".to_string(), serde_json::json!(3))]
                .into_iter()
                .collect(),
        }]))
        .unwrap();
    assert_eq!(editor.doc().children()[0].kind(), "heading");
    assert_eq!(
        editor.doc().children()[0].attr("level"),
        Some(&serde_json::json!(3))
    );

    assert!(editor.undo());
    assert_eq!(editor.doc().children()[0].kind(), "paragraph");
    assert_eq!(editor.doc().children()[0].attr("level"), None);
}

#[test]
fn undo_and_redo_replay_inverse_steps() {
    let mut editor = editor_with(Node::doc(vec![Node::paragraph("")]));
    editor
        .apply(Transaction::new(vec![Step::InsertText {
            pos: 1,
            text: "Hi".to_string(),
            marks: Vec::new(),
        }]))
        .unwrap();
    assert_eq!(paragraph_text(editor.doc(), 0), "Hi");
    assert!(editor.can_undo());

    assert!(editor.undo());
    assert_eq!(paragraph_text(editor.doc(), 0), "");
    assert!(editor.can_redo());

    assert!(editor.redo());
    assert_eq!(paragraph_text(editor.doc(), 0), "Hi");
    assert!(!editor.can_redo());
}

#[test]
fn selection_is_remapped_and_clamped() {
    let mut editor = editor_with(Node::doc(vec![Node::paragraph("Hello")]));
    editor.set_selection(Selection::new(4, 6));

    editor
        .apply(Transaction::new(vec![Step::Delete { from: 1, to: 6 }]))
        .unwrap();
    let selection = editor.selection();
    let max = editor.doc().content_size();
    assert!(selection.from() <= max && selection.to() <= max);

    // An explicit selection beyond the document is clamped too.
    editor.set_selection(Selection::collapsed(999));
    assert!(editor.selection().from() <= editor.doc().content_size());
}

#[test]
fn adjacent_text_nodes_with_equal_marks_coalesce() {
    let mut editor = editor_with(Node::doc(vec![Node::paragraph("ab")]));
    editor
        .apply(Transaction::new(vec![Step::AddMark {
            from: 1,
            to: 2,
            mark: Mark::new("bold"),
        }]))
        .unwrap();
    editor
        .apply(Transaction::new(vec![Step::AddMark {
            from: 2,
            to: 3,
            mark: Mark::new("bold"),
        }]))
        .unwrap();
    let paragraph = &editor.doc().children()[0];
    assert_eq!(paragraph.children().len(), 1, "normalize merged the pieces");
    assert!(paragraph.children()[0].has_mark("bold"));
}

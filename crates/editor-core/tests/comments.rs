use serde_json::json;
use workpad_editor_core::{
    create_reference_tx, referenced_ids, reference_ranges, remove_reference_tx,
    set_reference_id_tx, DecorationKind, Editor, EditorContext, EmptySelectionError,
    ExtensionRegistry, Node, Selection, Step, Transaction, UserInfo, INLINE_COMMENT, INLINE_VOTE,
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

#[test]
fn creating_a_reference_requires_a_selection() {
    let doc = Node::doc(vec![Node::paragraph("abc")]);
    let err = create_reference_tx(&doc, Selection::collapsed(1), INLINE_COMMENT).unwrap_err();
    assert_eq!(err, EmptySelectionError);
}

#[test]
fn reference_is_created_null_and_backfilled() {
    let mut editor = editor_with(Node::doc(vec![Node::paragraph("abcdefghij")]));
    let tx = create_reference_tx(editor.doc(), Selection::new(1, 11), INLINE_COMMENT).unwrap();
    editor.apply(tx).unwrap();

    let ranges = reference_ranges(editor.doc(), INLINE_COMMENT);
    assert_eq!(ranges.len(), 1);
    assert_eq!(ranges[0].id, None);
    assert_eq!((ranges[0].from, ranges[0].to), (1, 11));
    assert!(referenced_ids(editor.doc(), INLINE_COMMENT).is_empty());

    let tx = set_reference_id_tx(editor.doc(), INLINE_COMMENT, 1, 11, "thread-1");
    editor.apply(tx).unwrap();
    assert_eq!(
        referenced_ids(editor.doc(), INLINE_COMMENT),
        vec!["thread-1".to_string()]
    );
}

#[test]
fn comment_mark_survives_partial_deletion() {
    let mut editor = editor_with(Node::doc(vec![Node::paragraph("abcdefghij")]));
    editor
        .apply(create_reference_tx(editor.doc(), Selection::new(1, 11), INLINE_COMMENT).unwrap())
        .unwrap();
    editor
        .apply(set_reference_id_tx(editor.doc(), INLINE_COMMENT, 1, 11, "t1"))
        .unwrap();

    // Remove four characters from the middle of the ten-character range.
    editor
        .apply(Transaction::new(vec![Step::Delete { from: 4, to: 8 }]))
        .unwrap();

    assert_eq!(editor.doc().text_between(1, 7).unwrap(), "abchij");
    let ranges = reference_ranges(editor.doc(), INLINE_COMMENT);
    assert_eq!(ranges.len(), 1, "mark survives over the remaining text");
    assert_eq!(ranges[0].id.as_deref(), Some("t1"));
    assert_eq!((ranges[0].from, ranges[0].to), (1, 7));
}

#[test]
fn references_enumerate_in_document_order() {
    let mut editor = editor_with(Node::doc(vec![
        Node::paragraph("first"),
        Node::paragraph("second"),
    ]));
    // Second paragraph's range is created before the first one.
    editor
        .apply(create_reference_tx(editor.doc(), Selection::new(8, 11), INLINE_COMMENT).unwrap())
        .unwrap();
    editor
        .apply(set_reference_id_tx(editor.doc(), INLINE_COMMENT, 8, 11, "t-later"))
        .unwrap();
    editor
        .apply(create_reference_tx(editor.doc(), Selection::new(1, 4), INLINE_COMMENT).unwrap())
        .unwrap();
    editor
        .apply(set_reference_id_tx(editor.doc(), INLINE_COMMENT, 1, 4, "t-earlier"))
        .unwrap();

    assert_eq!(
        referenced_ids(editor.doc(), INLINE_COMMENT),
        vec!["t-earlier".to_string(), "t-later".to_string()]
    );
}

#[test]
fn removing_a_reference_is_idempotent() {
    let mut editor = editor_with(Node::doc(vec![Node::paragraph("abcdef")]));
    editor
        .apply(create_reference_tx(editor.doc(), Selection::new(1, 5), INLINE_COMMENT).unwrap())
        .unwrap();
    editor
        .apply(set_reference_id_tx(editor.doc(), INLINE_COMMENT, 1, 5, "gone"))
        .unwrap();

    editor
        .apply(remove_reference_tx(editor.doc(), INLINE_COMMENT, "gone", true))
        .unwrap();
    assert!(referenced_ids(editor.doc(), INLINE_COMMENT).is_empty());
    let after_first = editor.doc().clone();

    // Second removal finds nothing and changes nothing.
    editor
        .apply(remove_reference_tx(editor.doc(), INLINE_COMMENT, "gone", true))
        .unwrap();
    assert_eq!(editor.doc(), &after_first);
}

#[test]
fn remove_first_occurrence_only() {
    let mut editor = editor_with(Node::doc(vec![Node::paragraph("aabb")]));
    editor
        .apply(create_reference_tx(editor.doc(), Selection::new(1, 3), INLINE_VOTE).unwrap())
        .unwrap();
    editor
        .apply(set_reference_id_tx(editor.doc(), INLINE_VOTE, 1, 3, "v1"))
        .unwrap();
    editor
        .apply(create_reference_tx(editor.doc(), Selection::new(3, 5), INLINE_VOTE).unwrap())
        .unwrap();
    editor
        .apply(set_reference_id_tx(editor.doc(), INLINE_VOTE, 3, 5, "v1"))
        .unwrap();

    // Adjacent equal-id ranges merge, so split them apart first by id.
    let ranges = reference_ranges(editor.doc(), INLINE_VOTE);
    assert_eq!(ranges.len(), 1);

    editor
        .apply(remove_reference_tx(editor.doc(), INLINE_VOTE, "v1", false))
        .unwrap();
    assert!(referenced_ids(editor.doc(), INLINE_VOTE).is_empty());
}

#[test]
fn overlapping_threads_can_stack() {
    let mut editor = editor_with(Node::doc(vec![Node::paragraph("abcdef")]));
    editor
        .apply(create_reference_tx(editor.doc(), Selection::new(1, 5), INLINE_COMMENT).unwrap())
        .unwrap();
    editor
        .apply(set_reference_id_tx(editor.doc(), INLINE_COMMENT, 1, 5, "outer"))
        .unwrap();
    editor
        .apply(create_reference_tx(editor.doc(), Selection::new(2, 4), INLINE_COMMENT).unwrap())
        .unwrap();
    editor
        .apply(set_reference_id_tx(editor.doc(), INLINE_COMMENT, 2, 4, "inner"))
        .unwrap();

    let ids = referenced_ids(editor.doc(), INLINE_COMMENT);
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&"outer".to_string()));
    assert!(ids.contains(&"inner".to_string()));
}

#[test]
fn rows_with_references_get_counter_badges() {
    let mut editor = editor_with(Node::doc(vec![
        Node::paragraph("commented"),
        Node::paragraph("plain"),
    ]));
    editor
        .apply(create_reference_tx(editor.doc(), Selection::new(1, 6), INLINE_COMMENT).unwrap())
        .unwrap();
    editor
        .apply(set_reference_id_tx(editor.doc(), INLINE_COMMENT, 1, 6, "t1"))
        .unwrap();

    let decorations = editor.decorations();
    let badges: Vec<_> = decorations
        .iter()
        .filter(|d| matches!(&d.kind, DecorationKind::Widget { name, .. } if name == "comment-count"))
        .collect();
    assert_eq!(badges.len(), 1);
    assert_eq!(badges[0].from, 0, "badge sits on the first row");
    match &badges[0].kind {
        DecorationKind::Widget { attrs, .. } => {
            assert_eq!(attrs.get("count"), Some(&json!(1)));
        }
        other => panic!("expected widget, got {other:?}"),
    }
}

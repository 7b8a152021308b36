use std::time::{Duration, Instant};

use serde_json::json;
use workpad_editor_core::{
    create_reference_tx, get_plain_text, get_referenced_ids, serialize_to_markdown,
    set_reference_id_tx, ContentChangeNotifier, Editor, EditorContext, ExtensionRegistry, Mark,
    Node, ReferenceKind, Selection, Step, Transaction, UserInfo, INLINE_COMMENT,
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

fn mention(value: &str) -> Node {
    let mut attrs = std::collections::BTreeMap::new();
    attrs.insert("kind".to_string(), json!("user"));
    attrs.insert("value".to_string(), json!(value));
    Node::atom("mention", attrs)
}

#[test]
fn plain_text_joins_textblocks_with_newlines() {
    let doc = Node::doc(vec![
        Node::element_with_attrs(
            "heading",
            [("level".to_string(), json!(1))].into_iter().collect(),
            vec![Node::text("Title")],
        ),
        Node::paragraph("First line"),
        Node::element(
            "blockquote",
            vec![Node::paragraph("Quoted")],
        ),
    ]);
    assert_eq!(get_plain_text(&doc), "Title\nFirst line\nQuoted");
}

#[test]
fn plain_text_renders_mentions_inline() {
    let doc = Node::doc(vec![Node::element(
        "paragraph",
        vec![Node::text("ping "), mention("carol")],
    )]);
    assert_eq!(get_plain_text(&doc), "ping @carol");
}

#[test]
fn referenced_ids_cover_every_reference_kind() {
    let mut editor = editor_with(Node::doc(vec![
        Node::element("paragraph", vec![Node::text("hi "), mention("m1")]),
        {
            let mut attrs = std::collections::BTreeMap::new();
            attrs.insert("page_id".to_string(), json!("p1"));
            attrs.insert("path_type".to_string(), json!("page"));
            Node::atom("page_link", attrs)
        },
    ]));
    editor
        .apply(create_reference_tx(editor.doc(), Selection::new(1, 3), INLINE_COMMENT).unwrap())
        .unwrap();
    editor
        .apply(set_reference_id_tx(editor.doc(), INLINE_COMMENT, 1, 3, "c1"))
        .unwrap();

    let doc = editor.doc();
    assert_eq!(get_referenced_ids(doc, ReferenceKind::Comment), vec!["c1"]);
    assert_eq!(get_referenced_ids(doc, ReferenceKind::Mention), vec!["m1"]);
    assert_eq!(get_referenced_ids(doc, ReferenceKind::Page), vec!["p1"]);
    assert!(get_referenced_ids(doc, ReferenceKind::Vote).is_empty());
}

#[test]
fn markdown_serialization_is_best_effort() {
    let doc = Node::doc(vec![
        Node::element_with_attrs(
            "heading",
            [("level".to_string(), json!(2))].into_iter().collect(),
            vec![Node::text("Notes")],
        ),
        Node::element(
            "paragraph",
            vec![
                Node::text("plain "),
                Node::text_with_marks("strong", vec![Mark::new("bold")]),
                Node::text(" and "),
                Node::text_with_marks(
                    "linked",
                    vec![Mark::new("link").attr("href", json!("https://example.com"))],
                ),
            ],
        ),
        Node::element(
            "bullet_list",
            vec![
                Node::element("list_item", vec![Node::paragraph("one")]),
                Node::element("list_item", vec![Node::paragraph("two")]),
            ],
        ),
        Node::divider(),
        {
            let mut attrs = std::collections::BTreeMap::new();
            attrs.insert("src".to_string(), json!("https://example.com/cat.png"));
            attrs.insert("alt".to_string(), json!("cat"));
            Node::atom("image", attrs)
        },
    ]);

    let markdown = serialize_to_markdown(&doc);
    assert!(markdown.contains("## Notes"));
    assert!(markdown.contains("**strong**"));
    assert!(markdown.contains("[linked](https://example.com)"));
    assert!(markdown.contains("- one\n- two"));
    assert!(markdown.contains("---"));
    assert!(markdown.contains("![cat](https://example.com/cat.png)"));
}

#[test]
fn markdown_renders_code_blocks_fenced() {
    let doc = Node::doc(vec![Node::element_with_attrs(
        "code_block",
        [("language".to_string(), json!("rust"))].into_iter().collect(),
        vec![Node::text("fn main() {}")],
    )]);
    let markdown = serialize_to_markdown(&doc);
    assert!(markdown.starts_with("```rust\nfn main() {}"));
}

#[test]
fn notifier_coalesces_changes_into_one_window() {
    let mut editor = editor_with(Node::doc(vec![Node::paragraph("")]));
    let mut notifier = ContentChangeNotifier::new(Duration::from_millis(100));
    let start = Instant::now();

    // A burst of keystrokes inside the window yields a single notification.
    for (ix, c) in ["a", "b", "c"].iter().enumerate() {
        editor
            .apply(Transaction::new(vec![Step::InsertText {
                pos: 1 + ix,
                text: c.to_string(),
                marks: Vec::new(),
            }]))
            .unwrap();
        notifier.observe(&editor, start + Duration::from_millis(10 * ix as u64));
    }

    assert!(
        notifier
            .poll(&editor, start + Duration::from_millis(50))
            .is_none(),
        "window still open"
    );
    let change = notifier
        .poll(&editor, start + Duration::from_millis(200))
        .expect("debounced notification fires");
    assert_eq!(change.plain_text, "abc");

    // No further changes, no further notifications.
    assert!(notifier
        .poll(&editor, start + Duration::from_millis(400))
        .is_none());
}

#[test]
fn selection_only_transactions_do_not_bump_the_doc_version() {
    let mut editor = editor_with(Node::doc(vec![Node::paragraph("hi")]));
    let version = editor.doc_version();
    editor
        .apply(Transaction::new(Vec::new()).selection_after(Selection::collapsed(2)))
        .unwrap();
    assert_eq!(editor.doc_version(), version);

    editor
        .apply(Transaction::new(vec![Step::InsertText {
            pos: 1,
            text: "x".to_string(),
            marks: Vec::new(),
        }]))
        .unwrap();
    assert_eq!(editor.doc_version(), version + 1);
}

use serde_json::json;
use workpad_editor_core::{
    candidate_response_tx, rank_candidates, Candidate, Editor, EditorContext, ExtensionRegistry,
    InputEvent, Key, Node, Selection, SuggestState, UserInfo, MENTION_STATE_KEY,
    PAGE_LINK_STATE_KEY,
};

fn editor() -> Editor {
    Editor::new(
        Node::doc(vec![Node::paragraph("")]),
        Selection::collapsed(1),
        ExtensionRegistry::standard(),
        EditorContext::new(UserInfo {
            id: "u1".to_string(),
            username: "ada".to_string(),
        }),
    )
}

fn members() -> Vec<Candidate> {
    ["Alice", "Albert", "Bob"]
        .iter()
        .map(|name| Candidate {
            id: name.to_string(),
            label: name.to_string(),
            kind: "user".to_string(),
        })
        .collect()
}

fn mention_state(editor: &Editor) -> SuggestState {
    serde_json::from_value(
        editor
            .state()
            .field(MENTION_STATE_KEY)
            .cloned()
            .unwrap_or_default(),
    )
    .unwrap_or_default()
}

fn type_chars(editor: &mut Editor, text: &str) {
    for c in text.chars() {
        editor.dispatch_event(InputEvent::KeyDown(Key::Char(c))).unwrap();
    }
}

#[test]
fn ranking_prefers_prefix_then_similarity_then_directory_order() {
    let ranked = rank_candidates("al", &members());
    let labels: Vec<&str> = ranked.iter().map(|c| c.label.as_str()).collect();
    assert_eq!(labels, vec!["Alice", "Albert"]);

    // Empty query keeps the directory's natural order.
    let ranked = rank_candidates("", &members());
    assert_eq!(ranked.len(), 3);
    assert_eq!(ranked[0].label, "Alice");
    assert_eq!(ranked[2].label, "Bob");
}

#[test]
fn trigger_character_opens_the_popup() {
    let mut editor = editor();
    type_chars(&mut editor, "@");

    let state = mention_state(&editor);
    assert!(state.active);
    assert_eq!(state.query, "");
    assert_eq!(editor.doc().text_between(1, 2).unwrap(), "@");
    assert!(editor.doc().children()[0].children()[0].has_mark("mention_trigger"));
}

#[test]
fn typing_extends_the_query_and_enter_inserts_the_top_candidate() {
    let mut editor = editor();
    type_chars(&mut editor, "@");
    let token = mention_state(&editor).token;
    editor
        .apply(candidate_response_tx(MENTION_STATE_KEY, token, members()))
        .unwrap();

    type_chars(&mut editor, "al");
    let state = mention_state(&editor);
    assert!(state.active);
    assert_eq!(state.query, "al");

    editor.dispatch_event(InputEvent::KeyDown(Key::Enter)).unwrap();

    let state = mention_state(&editor);
    assert!(!state.active, "selection closes the popup");
    let paragraph = &editor.doc().children()[0];
    assert_eq!(paragraph.children().len(), 1, "query text was replaced");
    let mention = &paragraph.children()[0];
    assert_eq!(mention.kind(), "mention");
    assert_eq!(mention.attr("value"), Some(&json!("Alice")));
    assert_eq!(editor.doc().text_between(0, editor.doc().content_size()).unwrap(), "");
}

#[test]
fn counter_wraps_in_both_directions() {
    let mut editor = editor();
    type_chars(&mut editor, "@");
    let token = mention_state(&editor).token;
    editor
        .apply(candidate_response_tx(MENTION_STATE_KEY, token, members()))
        .unwrap();
    type_chars(&mut editor, "al");

    // Arrow up from the first entry wraps to the last ranked candidate.
    editor.dispatch_event(InputEvent::KeyDown(Key::ArrowUp)).unwrap();
    assert_eq!(mention_state(&editor).counter, -1);
    editor.dispatch_event(InputEvent::KeyDown(Key::Enter)).unwrap();

    let mention = &editor.doc().children()[0].children()[0];
    assert_eq!(mention.attr("value"), Some(&json!("Albert")));
}

#[test]
fn escape_cancels_and_demotes_the_query_to_plain_text() {
    let mut editor = editor();
    type_chars(&mut editor, "@al");
    assert!(mention_state(&editor).active);

    editor.dispatch_event(InputEvent::KeyDown(Key::Escape)).unwrap();
    let state = mention_state(&editor);
    assert!(!state.active);
    assert_eq!(editor.doc().text_between(1, 4).unwrap(), "@al");
    assert!(!editor.doc().children()[0].children()[0].has_mark("mention_trigger"));
}

#[test]
fn deleting_the_trigger_closes_the_popup() {
    let mut editor = editor();
    type_chars(&mut editor, "@");
    assert!(mention_state(&editor).active);

    editor.dispatch_event(InputEvent::KeyDown(Key::Backspace)).unwrap();
    let state = mention_state(&editor);
    assert!(!state.active);
    assert_eq!(editor.doc().content_size(), 2, "trigger text removed");
}

#[test]
fn stale_candidate_responses_are_discarded() {
    let mut editor = editor();
    type_chars(&mut editor, "@");
    let stale_token = mention_state(&editor).token;

    // The popup closes and reopens: the old fetch's token is stale.
    editor.dispatch_event(InputEvent::KeyDown(Key::Escape)).unwrap();
    type_chars(&mut editor, "@");
    let fresh_token = mention_state(&editor).token;
    assert_ne!(stale_token, fresh_token);

    editor
        .apply(candidate_response_tx(MENTION_STATE_KEY, stale_token, members()))
        .unwrap();
    assert!(mention_state(&editor).candidates.is_empty());

    editor
        .apply(candidate_response_tx(MENTION_STATE_KEY, fresh_token, members()))
        .unwrap();
    assert_eq!(mention_state(&editor).candidates.len(), 3);
}

#[test]
fn failed_candidate_fetch_degrades_to_an_empty_list() {
    let mut editor = editor();
    type_chars(&mut editor, "@al");
    // No candidates ever arrive; Enter cancels instead of inserting.
    editor.dispatch_event(InputEvent::KeyDown(Key::Enter)).unwrap();
    assert!(!mention_state(&editor).active);
    assert_eq!(editor.doc().text_between(1, 4).unwrap(), "@al");
}

#[test]
fn double_bracket_trigger_inserts_a_page_link_row() {
    let mut editor = editor();
    type_chars(&mut editor, "[[");

    let state: SuggestState = serde_json::from_value(
        editor
            .state()
            .field(PAGE_LINK_STATE_KEY)
            .cloned()
            .unwrap_or_default(),
    )
    .unwrap_or_default();
    assert!(state.active);

    editor
        .apply(candidate_response_tx(
            PAGE_LINK_STATE_KEY,
            state.token,
            vec![Candidate {
                id: "page-9".to_string(),
                label: "Roadmap".to_string(),
                kind: "page".to_string(),
            }],
        ))
        .unwrap();
    editor.dispatch_event(InputEvent::KeyDown(Key::Enter)).unwrap();

    let doc = editor.doc();
    assert_eq!(doc.children().len(), 2);
    assert_eq!(doc.children()[0].kind(), "paragraph");
    let link = &doc.children()[1];
    assert_eq!(link.kind(), "page_link");
    assert_eq!(link.attr("page_id"), Some(&json!("page-9")));
    // The marker text is gone from the paragraph.
    assert_eq!(doc.children()[0].children().len(), 0);
}

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::CommandError;
use crate::extensions::marked_segments;
use crate::node::{char_len, Attrs, Mark, Node};
use crate::plugin::{CommandSpec, Extension, Handled, InputEvent, Key, QuerySpec};
use crate::schema::{MarkSpec, NodeSpec};
use crate::state::{EditorContext, EditorState, Selection, Transaction};
use crate::transform::{Mapping, Step};

pub const MENTION_TRIGGER_MARK: &str = "mention_trigger";
pub const PAGE_TRIGGER_MARK: &str = "page_trigger";
pub const MENTION_STATE_KEY: &str = "mention";
pub const PAGE_LINK_STATE_KEY: &str = "page_link";

fn default_kind() -> String {
    "user".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub label: String,
    #[serde(default = "default_kind")]
    pub kind: String,
}

/// Popup state machine: `idle -> suggesting -> selected | cancelled`.
/// `token` guards against stale asynchronous candidate responses; `counter`
/// is the highlighted index, wrapping modulo the ranked count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuggestState {
    pub active: bool,
    pub query: String,
    pub counter: i64,
    pub token: u64,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

/// Exact/prefix case-insensitive filter; ties broken by a character-diff
/// similarity ratio for non-empty queries, natural (directory) order
/// otherwise.
pub fn rank_candidates(query: &str, candidates: &[Candidate]) -> Vec<Candidate> {
    if query.is_empty() {
        return candidates.to_vec();
    }
    let needle = query.to_lowercase();
    let mut matched: Vec<(bool, f32, usize)> = Vec::new();
    for (ix, candidate) in candidates.iter().enumerate() {
        let label = candidate.label.to_lowercase();
        if !label.contains(&needle) {
            continue;
        }
        let prefix = label.starts_with(&needle);
        let ratio = similar::TextDiff::from_chars(needle.as_str(), label.as_str()).ratio();
        matched.push((prefix, ratio, ix));
    }
    matched.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then(b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
            .then(a.2.cmp(&b.2))
    });
    matched
        .into_iter()
        .map(|(_, _, ix)| candidates[ix].clone())
        .collect()
}

/// Static description of one trigger-driven reference flow.
struct SuggestConfig {
    state_key: &'static str,
    mark_name: &'static str,
    trigger: &'static str,
}

const MENTION_CONFIG: SuggestConfig = SuggestConfig {
    state_key: MENTION_STATE_KEY,
    mark_name: MENTION_TRIGGER_MARK,
    trigger: "@",
};

const PAGE_CONFIG: SuggestConfig = SuggestConfig {
    state_key: PAGE_LINK_STATE_KEY,
    mark_name: PAGE_TRIGGER_MARK,
    trigger: "[[",
};

/// The marker-mark range (trigger text included), if a marker is present.
fn trigger_range(doc: &Node, mark_name: &str) -> Option<(usize, usize)> {
    let segments = marked_segments(doc, 0, doc.content_size(), mark_name);
    let (from, mut to) = match segments.first() {
        Some(&(from, to, _)) => (from, to),
        None => return None,
    };
    for &(seg_from, seg_to, _) in &segments[1..] {
        if seg_from != to {
            break;
        }
        to = seg_to;
    }
    Some((from, to))
}

fn marker_query(doc: &Node, config: &SuggestConfig) -> Option<String> {
    let (from, to) = trigger_range(doc, config.mark_name)?;
    let text = doc.text_between(from, to).ok()?;
    text.strip_prefix(config.trigger).map(str::to_string)
}

fn read_state(state: &EditorState, key: &str) -> SuggestState {
    state
        .field(key)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

fn activate_tx(state: &EditorState, config: &SuggestConfig) -> Option<Transaction> {
    let selection = state.selection;
    if !selection.is_collapsed() {
        return None;
    }
    let caret = selection.from();
    let resolved = state.doc.resolve(caret).ok()?;
    let parent_kind = resolved.parent(&state.doc).kind().to_string();
    if !state
        .schema
        .node_type(&parent_kind)
        .is_some_and(|t| t.is_textblock())
    {
        return None;
    }

    // Multi-char triggers: the head of the trigger must already sit before
    // the caret; it is re-inserted under the marker mark.
    let head_len = char_len(config.trigger) - 1;
    let head: String = config.trigger.chars().take(head_len).collect();
    let mut steps = Vec::new();
    let mut insert_at = caret;
    if head_len > 0 {
        if caret < head_len {
            return None;
        }
        let before = state.doc.text_between(caret - head_len, caret).ok()?;
        if before != head {
            return None;
        }
        steps.push(Step::Delete {
            from: caret - head_len,
            to: caret,
        });
        insert_at = caret - head_len;
    }
    steps.push(Step::InsertText {
        pos: insert_at,
        text: config.trigger.to_string(),
        marks: vec![Mark::new(config.mark_name).attr("trigger", json!(config.trigger))],
    });
    Some(
        Transaction::new(steps)
            .selection_after(Selection::collapsed(insert_at + char_len(config.trigger)))
            .with_meta(format!("{}:activate", config.state_key), json!(true)),
    )
}

/// Strip the marker mark; the typed query text is demoted to plain text.
fn cancel_tx(state: &EditorState, config: &SuggestConfig, remove_text: bool) -> Option<Transaction> {
    let (from, to) = trigger_range(&state.doc, config.mark_name)?;
    let steps = if remove_text {
        vec![Step::Delete { from, to }]
    } else {
        marked_segments(&state.doc, from, to, config.mark_name)
            .into_iter()
            .map(|(seg_from, seg_to, mark)| Step::RemoveMark {
                from: seg_from,
                to: seg_to,
                mark,
            })
            .collect()
    };
    Some(
        Transaction::new(steps)
            .with_meta(format!("{}:deactivate", config.state_key), json!(true)),
    )
}

fn counter_tx(config: &SuggestConfig, delta: i64) -> Transaction {
    Transaction::new(Vec::new()).with_meta(format!("{}:counter", config.state_key), json!(delta))
}

/// Replace the marker range with the resolved reference node. Inline nodes
/// land in place of the query text; block nodes land after the current row.
fn select_tx(
    state: &EditorState,
    config: &SuggestConfig,
    node: Node,
    inline: bool,
) -> Option<Transaction> {
    let (from, to) = trigger_range(&state.doc, config.mark_name)?;
    let mut steps = vec![Step::Delete { from, to }];
    let caret;
    if inline {
        steps.push(Step::InsertNodes {
            pos: from,
            nodes: vec![node],
        });
        caret = from + 1;
    } else {
        let resolved = state.doc.resolve(from).ok()?;
        if resolved.depth() == 0 {
            return None;
        }
        let row_after = resolved.before(1) + resolved.node(&state.doc, 1).size();
        let shifted = row_after - (to - from);
        steps.push(Step::InsertNodes {
            pos: shifted,
            nodes: vec![node],
        });
        caret = shifted + 1;
    }
    Some(
        Transaction::new(steps)
            .selection_after(Selection::collapsed(caret))
            .with_meta(format!("{}:deactivate", config.state_key), json!(true)),
    )
}

/// Transaction feeding an asynchronous candidate-directory response back
/// into the editor. Responses carrying a stale token are discarded by the
/// reducer on arrival.
pub fn candidate_response_tx(state_key: &str, token: u64, items: Vec<Candidate>) -> Transaction {
    Transaction::new(Vec::new()).with_meta(
        format!("{state_key}:candidates"),
        json!({ "token": token, "items": items }),
    )
}

fn reduce_suggest(
    config: &SuggestConfig,
    tx: &Transaction,
    value: Value,
    new: &EditorState,
) -> SuggestState {
    let mut state: SuggestState = serde_json::from_value(value).unwrap_or_default();

    if tx
        .get_meta(&format!("{}:activate", config.state_key))
        .is_some()
    {
        state.active = true;
        state.counter = 0;
        state.token = state.token.wrapping_add(1);
        state.candidates.clear();
        state.query.clear();
    }
    if tx
        .get_meta(&format!("{}:deactivate", config.state_key))
        .is_some()
    {
        return SuggestState {
            token: state.token,
            ..SuggestState::default()
        };
    }
    if let Some(delta) = tx
        .get_meta(&format!("{}:counter", config.state_key))
        .and_then(Value::as_i64)
    {
        state.counter += delta;
    }
    if let Some(response) = tx.get_meta(&format!("{}:candidates", config.state_key)) {
        let token = response.get("token").and_then(Value::as_u64).unwrap_or(0);
        if token == state.token {
            state.candidates = response
                .get("items")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();
        } else {
            tracing::debug!(
                state = config.state_key,
                token,
                current = state.token,
                "discarding stale candidate response"
            );
        }
    }

    if state.active {
        match marker_query(&new.doc, config) {
            Some(query) => {
                if query != state.query {
                    state.counter = 0;
                    state.query = query;
                }
            }
            // Trigger text deleted or marker gone: the popup closes.
            None => {
                state = SuggestState {
                    token: state.token,
                    ..SuggestState::default()
                };
            }
        }
    }
    state
}

fn handle_suggest_event(
    config: &SuggestConfig,
    state: &EditorState,
    event: &InputEvent,
    build_node: impl Fn(&Candidate) -> Node,
    inline: bool,
) -> Option<Handled> {
    let suggest = read_state(state, config.state_key);
    match event {
        InputEvent::KeyDown(Key::Char(c)) => {
            let last = config.trigger.chars().last()?;
            if suggest.active || *c != last {
                return None;
            }
            activate_tx(state, config).map(Handled::with)
        }
        InputEvent::KeyDown(Key::ArrowDown) if suggest.active => {
            Some(Handled::with(counter_tx(config, 1)))
        }
        InputEvent::KeyDown(Key::ArrowUp) if suggest.active => {
            Some(Handled::with(counter_tx(config, -1)))
        }
        InputEvent::KeyDown(Key::Escape) if suggest.active => {
            cancel_tx(state, config, false).map(Handled::with)
        }
        InputEvent::KeyDown(Key::Backspace) if suggest.active => {
            if suggest.query.is_empty() {
                cancel_tx(state, config, true).map(Handled::with)
            } else {
                None
            }
        }
        InputEvent::KeyDown(Key::Enter) if suggest.active => {
            let ranked = rank_candidates(&suggest.query, &suggest.candidates);
            if ranked.is_empty() {
                return cancel_tx(state, config, false).map(Handled::with);
            }
            let ix = suggest.counter.rem_euclid(ranked.len() as i64) as usize;
            let node = build_node(&ranked[ix]);
            select_tx(state, config, node, inline).map(Handled::with)
        }
        _ => None,
    }
}

fn mention_node(candidate: &Candidate) -> Node {
    let mut attrs = Attrs::new();
    attrs.insert("kind".to_string(), json!(candidate.kind));
    attrs.insert("value".to_string(), json!(candidate.id));
    Node::atom("mention", attrs)
}

fn page_link_node(candidate: &Candidate) -> Node {
    let mut attrs = Attrs::new();
    attrs.insert("page_id".to_string(), json!(candidate.id));
    attrs.insert("path_type".to_string(), json!("page"));
    Node::atom("page_link", attrs)
}

/// `@`-triggered member mentions: marker mark over the query, ranked popup,
/// atomic inline `mention` node on selection.
pub struct MentionExtension;

impl Extension for MentionExtension {
    fn id(&self) -> &'static str {
        "mention"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![
            NodeSpec::new("mention")
                .groups(["inline"])
                .inline()
                .atom()
                .selectable()
                .attr("kind", json!("user"))
                .attr("value", Value::Null),
        ]
    }

    fn mark_specs(&self) -> Vec<MarkSpec> {
        vec![
            MarkSpec::new(MENTION_TRIGGER_MARK)
                .excludes("_")
                .attr("trigger", json!("@")),
        ]
    }

    fn state_key(&self) -> Option<&'static str> {
        Some(MENTION_STATE_KEY)
    }

    fn init_state(&self, _doc: &Node, _cx: &EditorContext) -> Value {
        serde_json::to_value(SuggestState::default()).unwrap_or(Value::Null)
    }

    fn apply_state(
        &self,
        tx: &Transaction,
        _mapping: &Mapping,
        value: Value,
        _old: &EditorState,
        new: &EditorState,
        _cx: &EditorContext,
    ) -> Result<Value, crate::error::ExtensionError> {
        serde_json::to_value(reduce_suggest(&MENTION_CONFIG, tx, value, new))
            .map_err(|err| crate::error::ExtensionError::new(err.to_string()))
    }

    fn handle_event(
        &self,
        state: &EditorState,
        event: &InputEvent,
        _cx: &EditorContext,
    ) -> Option<Handled> {
        handle_suggest_event(&MENTION_CONFIG, state, event, mention_node, true)
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("mention.select", "Insert mention", |editor, args| {
                let candidate: Candidate = decode_candidate(&args)?;
                let tx = select_tx(
                    editor.state(),
                    &MENTION_CONFIG,
                    mention_node(&candidate),
                    true,
                )
                .ok_or_else(|| CommandError::new("Mention popup is not open"))?;
                editor
                    .apply(tx)
                    .map_err(|e| CommandError::new(format!("Failed to insert mention: {e}")))
            }),
            CommandSpec::new("mention.candidates", "Feed mention candidates", |editor, args| {
                let (token, items) = decode_candidates(&args)?;
                editor
                    .apply(candidate_response_tx(MENTION_STATE_KEY, token, items))
                    .map_err(|e| CommandError::new(format!("Failed to store candidates: {e}")))
            })
            .hidden(true),
        ]
    }

    fn queries(&self) -> Vec<QuerySpec> {
        vec![
            QuerySpec::new("mention.state", |editor, _args| {
                Ok(editor
                    .state()
                    .field(MENTION_STATE_KEY)
                    .cloned()
                    .unwrap_or(Value::Null))
            }),
            QuerySpec::new("mention.ranked", |editor, _args| {
                let suggest = read_state(editor.state(), MENTION_STATE_KEY);
                serde_json::to_value(rank_candidates(&suggest.query, &suggest.candidates))
                    .map_err(|e| crate::error::QueryError::new(e.to_string()))
            }),
        ]
    }
}

/// `[[`-triggered links to other workspace pages; selection inserts an
/// atomic block `page_link` row mirroring the external page tree.
pub struct PageLinkExtension;

impl Extension for PageLinkExtension {
    fn id(&self) -> &'static str {
        "page_link"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![
            NodeSpec::new("page_link")
                .groups(["block", "entity_ref", "page_ref"])
                .atom()
                .selectable()
                .draggable()
                .attr("page_id", Value::Null)
                .attr("path_type", json!("page"))
                .aliases(["page", "linkedPage"]),
            NodeSpec::new("database_ref")
                .groups(["block", "entity_ref"])
                .atom()
                .selectable()
                .draggable()
                .attr("source_id", Value::Null)
                .aliases(["inlineDatabase"]),
        ]
    }

    fn mark_specs(&self) -> Vec<MarkSpec> {
        vec![
            MarkSpec::new(PAGE_TRIGGER_MARK)
                .excludes("_")
                .attr("trigger", json!("[[")),
        ]
    }

    fn state_key(&self) -> Option<&'static str> {
        Some(PAGE_LINK_STATE_KEY)
    }

    fn init_state(&self, _doc: &Node, _cx: &EditorContext) -> Value {
        serde_json::to_value(SuggestState::default()).unwrap_or(Value::Null)
    }

    fn apply_state(
        &self,
        tx: &Transaction,
        _mapping: &Mapping,
        value: Value,
        _old: &EditorState,
        new: &EditorState,
        _cx: &EditorContext,
    ) -> Result<Value, crate::error::ExtensionError> {
        serde_json::to_value(reduce_suggest(&PAGE_CONFIG, tx, value, new))
            .map_err(|err| crate::error::ExtensionError::new(err.to_string()))
    }

    fn handle_event(
        &self,
        state: &EditorState,
        event: &InputEvent,
        _cx: &EditorContext,
    ) -> Option<Handled> {
        handle_suggest_event(&PAGE_CONFIG, state, event, page_link_node, false)
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("page.select", "Insert page link", |editor, args| {
                let candidate: Candidate = decode_candidate(&args)?;
                let tx = select_tx(
                    editor.state(),
                    &PAGE_CONFIG,
                    page_link_node(&candidate),
                    false,
                )
                .ok_or_else(|| CommandError::new("Page popup is not open"))?;
                editor
                    .apply(tx)
                    .map_err(|e| CommandError::new(format!("Failed to insert page link: {e}")))
            }),
            CommandSpec::new("page.candidates", "Feed page candidates", |editor, args| {
                let (token, items) = decode_candidates(&args)?;
                editor
                    .apply(candidate_response_tx(PAGE_LINK_STATE_KEY, token, items))
                    .map_err(|e| CommandError::new(format!("Failed to store candidates: {e}")))
            })
            .hidden(true),
        ]
    }

    fn queries(&self) -> Vec<QuerySpec> {
        vec![
            QuerySpec::new("page.state", |editor, _args| {
                Ok(editor
                    .state()
                    .field(PAGE_LINK_STATE_KEY)
                    .cloned()
                    .unwrap_or(Value::Null))
            }),
            QuerySpec::new("page.ranked", |editor, _args| {
                let suggest = read_state(editor.state(), PAGE_LINK_STATE_KEY);
                serde_json::to_value(rank_candidates(&suggest.query, &suggest.candidates))
                    .map_err(|e| crate::error::QueryError::new(e.to_string()))
            }),
        ]
    }
}

fn decode_candidate(args: &Option<Value>) -> Result<Candidate, CommandError> {
    args.clone()
        .ok_or_else(|| CommandError::new("Missing candidate args"))
        .and_then(|v| {
            serde_json::from_value(v)
                .map_err(|e| CommandError::new(format!("Invalid candidate: {e}")))
        })
}

fn decode_candidates(args: &Option<Value>) -> Result<(u64, Vec<Candidate>), CommandError> {
    let args = args
        .as_ref()
        .ok_or_else(|| CommandError::new("Missing args"))?;
    let token = args
        .get("token")
        .and_then(Value::as_u64)
        .ok_or_else(|| CommandError::new("Missing args.token"))?;
    let items = args
        .get("items")
        .cloned()
        .ok_or_else(|| CommandError::new("Missing args.items"))
        .and_then(|v| {
            serde_json::from_value(v)
                .map_err(|e| CommandError::new(format!("Invalid candidates: {e}")))
        })?;
    Ok((token, items))
}

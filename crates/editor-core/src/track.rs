use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::CommandError;
use crate::extensions::{delete_blocks_steps, marked_segments};
use crate::node::{char_len, Attrs, Mark, Node};
use crate::plugin::{
    CommandSpec, Decoration, DecorationSet, Extension, QuerySpec,
};
use crate::schema::MarkSpec;
use crate::state::{EditorContext, EditorState, Selection, Transaction, UserInfo};
use crate::transform::{AttrPatch, Mapping, Step, StepMap, Transform};

pub const INSERTION: &str = "insertion";
pub const DELETION: &str = "deletion";
pub const FORMAT_CHANGE: &str = "format_change";

/// Format marks whose add/remove is recorded as a format-change suggestion.
const TRACKED_FORMAT_MARKS: [&str; 4] = ["bold", "italic", "underline", "code"];

pub const TRACK_STATE_KEY: &str = "track";

fn is_track_mark(name: &str) -> bool {
    matches!(name, INSERTION | DELETION | FORMAT_CHANGE)
}

/// One reviewable suggestion: adjacent ranges with the same kind, author
/// and (bucketed) date coalesce into a single card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionCard {
    pub kind: String,
    pub user: String,
    pub username: String,
    pub date: i64,
    pub from: usize,
    pub to: usize,
    /// Set for block-level suggestions (the card covers a whole node).
    #[serde(default)]
    pub block: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackState {
    /// Card under the cursor, if any. Read by the UI to elevate the
    /// matching suggestion card; never a document mutation.
    pub active: Option<SuggestionCard>,
}

/// Wraps every edit made in suggest mode into reviewable markers instead
/// of applying it outright, and resolves markers back into real edits
/// (accept) or reversions (reject).
pub struct TrackChangesExtension;

impl Extension for TrackChangesExtension {
    fn id(&self) -> &'static str {
        "track"
    }

    fn mark_specs(&self) -> Vec<MarkSpec> {
        vec![
            MarkSpec::new(INSERTION)
                .groups(["suggestion"])
                .excludes("suggestion")
                .not_inclusive()
                .attr("user", Value::Null)
                .attr("username", Value::Null)
                .attr("date", json!(0))
                .attr("approved", json!(false)),
            MarkSpec::new(DELETION)
                .groups(["suggestion"])
                .excludes("suggestion")
                .not_inclusive()
                .attr("user", Value::Null)
                .attr("username", Value::Null)
                .attr("date", json!(0)),
            MarkSpec::new(FORMAT_CHANGE)
                .not_inclusive()
                .attr("user", Value::Null)
                .attr("username", Value::Null)
                .attr("date", json!(0))
                .attr("before", json!([]))
                .attr("after", json!([])),
        ]
    }

    fn state_key(&self) -> Option<&'static str> {
        Some(TRACK_STATE_KEY)
    }

    fn init_state(&self, _doc: &Node, _cx: &EditorContext) -> Value {
        serde_json::to_value(TrackState::default()).unwrap_or(Value::Null)
    }

    fn apply_state(
        &self,
        _tx: &Transaction,
        _mapping: &Mapping,
        _value: Value,
        _old: &EditorState,
        new: &EditorState,
        _cx: &EditorContext,
    ) -> Result<Value, crate::error::ExtensionError> {
        let active = suggestion_at(&new.doc, new.selection.from());
        serde_json::to_value(TrackState { active })
            .map_err(|err| crate::error::ExtensionError::new(err.to_string()))
    }

    fn transform_transaction(
        &self,
        tx: &Transaction,
        state: &EditorState,
        cx: &EditorContext,
    ) -> Option<Transaction> {
        if !cx.tracking_enabled
            || tx.steps.is_empty()
            || tx.meta_flag("history")
            || tx.meta_flag("no_track")
        {
            return None;
        }
        Some(tracked_transaction(tx, state, cx))
    }

    fn decorations(
        &self,
        state: &EditorState,
        _cx: &EditorContext,
    ) -> Result<DecorationSet, crate::error::ExtensionError> {
        let active = state
            .field(TRACK_STATE_KEY)
            .and_then(|v| serde_json::from_value::<TrackState>(v.clone()).ok())
            .and_then(|s| s.active);
        let mut decorations = Vec::new();
        for card in suggestion_cards(&state.doc) {
            if card.block {
                continue;
            }
            let mut attrs = Attrs::new();
            attrs.insert(
                "class".to_string(),
                json!(format!("suggestion-{}", card.kind)),
            );
            attrs.insert("data-user".to_string(), json!(card.user));
            if active.as_ref() == Some(&card) {
                attrs.insert("active".to_string(), json!(true));
            }
            decorations.push(Decoration::inline(card.from, card.to, attrs));
        }
        Ok(DecorationSet::new(decorations))
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("track.accept", "Accept suggestion", |editor, args| {
                let pos = arg_pos(&args)?;
                let tx = accept_suggestion_tx(editor.doc(), pos)?;
                editor
                    .apply(tx)
                    .map_err(|e| CommandError::new(format!("Failed to accept suggestion: {e}")))
            })
            .keywords(["suggestion", "accept", "track changes"]),
            CommandSpec::new("track.reject", "Reject suggestion", |editor, args| {
                let pos = arg_pos(&args)?;
                let tx = reject_suggestion_tx(editor.doc(), pos)?;
                editor
                    .apply(tx)
                    .map_err(|e| CommandError::new(format!("Failed to reject suggestion: {e}")))
            })
            .keywords(["suggestion", "reject", "track changes"]),
            CommandSpec::new("track.accept_all", "Accept all suggestions", |editor, _args| {
                accept_all(editor).map(|_| ())
            })
            .keywords(["suggestion", "accept", "all"]),
            CommandSpec::new("track.reject_all", "Reject all suggestions", |editor, _args| {
                reject_all(editor).map(|_| ())
            })
            .keywords(["suggestion", "reject", "all"]),
        ]
    }

    fn queries(&self) -> Vec<QuerySpec> {
        vec![
            QuerySpec::new("track.cards", |editor, _args| {
                serde_json::to_value(suggestion_cards(editor.doc()))
                    .map_err(|e| crate::error::QueryError::new(e.to_string()))
            }),
            QuerySpec::new("track.active", |editor, _args| {
                Ok(editor
                    .state()
                    .field(TRACK_STATE_KEY)
                    .cloned()
                    .unwrap_or(Value::Null))
            }),
        ]
    }
}

fn arg_pos(args: &Option<Value>) -> Result<usize, CommandError> {
    args.as_ref()
        .and_then(|v| v.get("pos"))
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .ok_or_else(|| CommandError::new("Missing args.pos"))
}

fn insertion_mark(user: &UserInfo, date: i64) -> Mark {
    Mark::new(INSERTION)
        .attr("user", json!(user.id))
        .attr("username", json!(user.username))
        .attr("date", json!(date))
        .attr("approved", json!(false))
}

fn deletion_mark(user: &UserInfo, date: i64) -> Mark {
    Mark::new(DELETION)
        .attr("user", json!(user.id))
        .attr("username", json!(user.username))
        .attr("date", json!(date))
}

fn track_entry(kind: &str, user: &UserInfo, date: i64, before: Option<Value>) -> Value {
    let mut entry = serde_json::Map::new();
    entry.insert("type".to_string(), json!(kind));
    entry.insert("user".to_string(), json!(user.id));
    entry.insert("username".to_string(), json!(user.username));
    entry.insert("date".to_string(), json!(date));
    if let Some(before) = before {
        entry.insert("before".to_string(), before);
    }
    Value::Object(entry)
}

fn track_list(node: &Node) -> Vec<Value> {
    node.attr("track")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn entry_kind(entry: &Value) -> Option<&str> {
    entry.get("type").and_then(Value::as_str)
}

fn entry_user(entry: &Value) -> Option<&str> {
    entry.get("user").and_then(Value::as_str)
}

fn step_footprint(step: &Step) -> StepMap {
    match step {
        Step::InsertText { pos, text, .. } => StepMap::insertion(*pos, char_len(text)),
        Step::InsertNodes { pos, nodes } => {
            StepMap::insertion(*pos, nodes.iter().map(Node::size).sum())
        }
        Step::Delete { from, to } => StepMap::deletion(*from, *to),
        _ => StepMap::empty(),
    }
}

/// Rebuild a transaction so that, instead of applying edits outright, every
/// change is recorded as an attributable suggestion. Mirrors: inserts keep
/// their content but gain an `insertion` mark; deletes keep the content and
/// gain a `deletion` mark (except over the author's own pending insertions,
/// which are genuinely removed); tracked format toggles maintain a
/// `format_change` before/after ledger; block retags record the prior type.
fn tracked_transaction(tx: &Transaction, state: &EditorState, cx: &EditorContext) -> Transaction {
    let user = &cx.user;
    // Bucketed so one editing session coalesces into one card.
    let date10 = cx.timestamp / 600 * 600;
    let date1 = cx.timestamp / 60 * 60;

    let mut preview = Transform::new(state.schema.clone(), state.doc.clone());
    // Maps positions from the original transaction's flow into the
    // rewritten flow.
    let mut delta = Mapping::new();

    for original in &tx.steps {
        let Some(step) = original.map(&delta) else {
            continue;
        };
        let footprint = step_footprint(&step);

        match step {
            Step::InsertText { pos, text, marks } => {
                let marks: Vec<Mark> = marks
                    .into_iter()
                    .filter(|m| !is_track_mark(&m.name))
                    .collect();
                let len = char_len(&text);
                let before = preview.mapping().maps().len();
                let inserted = preview.step(Step::InsertText { pos, text, marks }).is_ok();
                if inserted {
                    let _ = preview.step(Step::AddMark {
                        from: pos,
                        to: pos + len,
                        mark: insertion_mark(user, date10),
                    });
                }
                delta.append(footprint.invert());
                append_new_maps(&mut delta, &preview, before);
            }
            Step::InsertNodes { pos, nodes } => {
                let size: usize = nodes.iter().map(Node::size).sum();
                let inline = nodes.iter().all(|n| {
                    n.is_text()
                        || state
                            .schema
                            .node_type(n.kind())
                            .is_some_and(|t| t.spec.inline)
                });
                let before = preview.mapping().maps().len();
                let node_offsets: Vec<(usize, bool)> = {
                    let mut offsets = Vec::new();
                    let mut at = pos;
                    for node in &nodes {
                        offsets.push((at, !matches!(node, Node::Text(_))));
                        at += node.size();
                    }
                    offsets
                };
                let inserted = preview.step(Step::InsertNodes { pos, nodes }).is_ok();
                if inserted {
                    let _ = preview.step(Step::AddMark {
                        from: pos,
                        to: pos + size,
                        mark: insertion_mark(user, date10),
                    });
                    if !inline {
                        for (node_pos, has_attrs) in node_offsets {
                            if !has_attrs {
                                continue;
                            }
                            let _ = preview.step(Step::SetAttrs {
                                pos: node_pos,
                                patch: AttrPatch::set_one(
                                    "track",
                                    json!([track_entry(INSERTION, user, date1, None)]),
                                ),
                            });
                        }
                    }
                }
                delta.append(footprint.invert());
                append_new_maps(&mut delta, &preview, before);
            }
            Step::Delete { from, to } => {
                // The content is not removed; it is marked. Positions after
                // the original delete must therefore be shifted back.
                delta.append(footprint.invert());
                let before = preview.mapping().maps().len();
                let plan = plan_deletion(&state.schema, preview.doc(), from, to, &user.id);
                for (seg_from, seg_to) in plan.mark_ranges {
                    let _ = preview.step(Step::AddMark {
                        from: seg_from,
                        to: seg_to,
                        mark: deletion_mark(user, date10),
                    });
                }
                for node_pos in plan.attr_marks {
                    let node = preview.doc().node_at(node_pos).cloned();
                    if let Some(node) = node {
                        let mut list = track_list(&node);
                        list.push(track_entry(DELETION, user, date1, None));
                        let _ = preview.step(Step::SetAttrs {
                            pos: node_pos,
                            patch: AttrPatch::set_one("track", json!(list)),
                        });
                    }
                }
                // Own pending insertions are genuinely removed, last first
                // so earlier ranges stay valid.
                for (seg_from, seg_to) in plan.real_deletes.into_iter().rev() {
                    let _ = preview.step(Step::Delete {
                        from: seg_from,
                        to: seg_to,
                    });
                }
                append_new_maps(&mut delta, &preview, before);
            }
            Step::AddMark { from, to, mark } => {
                let before = preview.mapping().maps().len();
                if TRACKED_FORMAT_MARKS.contains(&mark.name.as_str()) {
                    apply_format_tracking(&mut preview, from, to, &mark, true, user, date10);
                } else {
                    let _ = preview.step(Step::AddMark { from, to, mark });
                }
                append_new_maps(&mut delta, &preview, before);
            }
            Step::RemoveMark { from, to, mark } => {
                let before = preview.mapping().maps().len();
                if TRACKED_FORMAT_MARKS.contains(&mark.name.as_str()) {
                    apply_format_tracking(&mut preview, from, to, &mark, false, user, date10);
                } else {
                    let _ = preview.step(Step::RemoveMark { from, to, mark });
                }
                append_new_maps(&mut delta, &preview, before);
            }
            Step::SetBlockType { pos, kind, attrs } => {
                let before = preview.mapping().maps().len();
                let old = preview.doc().node_at(pos).cloned();
                let attrs = match old {
                    Some(old_node) if old_node.attrs().is_some() => {
                        block_change_attrs(&old_node, &kind, attrs, user, date1)
                    }
                    _ => attrs,
                };
                let _ = preview.step(Step::SetBlockType { pos, kind, attrs });
                append_new_maps(&mut delta, &preview, before);
            }
            other @ Step::SetAttrs { .. } => {
                let before = preview.mapping().maps().len();
                let _ = preview.step(other);
                append_new_maps(&mut delta, &preview, before);
            }
        }
    }

    let mut out = Transaction::new(preview.steps().to_vec());
    out.meta = tx.meta.clone();
    if let Some(selection) = tx.selection_after {
        // Backward deletions keep the caret before the newly struck text;
        // everything else maps past it, so repeated deletes walk onward.
        let backward = selection.from() < state.selection.from()
            || tx.get_meta("input_type").and_then(Value::as_str) == Some("deleteContentBackward");
        let bias = if backward { -1 } else { 1 };
        out.selection_after = Some(Selection {
            anchor: delta.map(selection.anchor, bias),
            focus: delta.map(selection.focus, bias),
        });
    }
    out
}

fn append_new_maps(delta: &mut Mapping, preview: &Transform, from_index: usize) {
    for map in &preview.mapping().maps()[from_index..] {
        delta.append(map.clone());
    }
}

struct DeletionPlan {
    /// Inline ranges to mark with `deletion`.
    mark_ranges: Vec<(usize, usize)>,
    /// Block node positions gaining a `deletion` track entry.
    attr_marks: Vec<usize>,
    /// Ranges genuinely removed (the author's own pending insertions).
    real_deletes: Vec<(usize, usize)>,
}

fn plan_deletion(
    schema: &crate::schema::Schema,
    doc: &Node,
    from: usize,
    to: usize,
    user_id: &str,
) -> DeletionPlan {
    let mut plan = DeletionPlan {
        mark_ranges: Vec::new(),
        attr_marks: Vec::new(),
        real_deletes: Vec::new(),
    };
    doc.nodes_between(from, to, &mut |node, pos| {
        let end = pos + node.size();
        let inline = node.is_text()
            || schema
                .node_type(node.kind())
                .is_some_and(|t| t.spec.inline);
        if inline {
            let seg = (pos.max(from), end.min(to));
            let own_insertion = node.mark(INSERTION).is_some_and(|mark| {
                mark.attr_str("user") == Some(user_id)
                    && !mark
                        .attrs
                        .get("approved")
                        .and_then(Value::as_bool)
                        .unwrap_or(false)
            });
            if own_insertion {
                plan.real_deletes.push(seg);
            } else if !node.has_mark(DELETION) {
                plan.mark_ranges.push(seg);
            }
            return false;
        }
        if pos >= from && end <= to {
            let list = track_list(node);
            let own_insertion = list.iter().any(|entry| {
                entry_kind(entry) == Some(INSERTION) && entry_user(entry) == Some(user_id)
            });
            if own_insertion {
                plan.real_deletes.push((pos, end));
                return false;
            }
            let already = list.iter().any(|entry| entry_kind(entry) == Some(DELETION));
            if !already {
                plan.attr_marks.push(pos);
            }
        }
        true
    });
    plan
}

/// Apply a tracked format toggle over `from..to`, maintaining the
/// `format_change` before/after ledger per inline node. Re-toggling a mark
/// listed on the other side cancels the entry instead of accumulating.
fn apply_format_tracking(
    preview: &mut Transform,
    from: usize,
    to: usize,
    mark: &Mark,
    adding: bool,
    user: &UserInfo,
    date: i64,
) {
    struct NodePlan {
        seg: (usize, usize),
        apply: bool,
        old_fc: Option<Mark>,
        new_fc: Option<Mark>,
    }
    let mut plans: Vec<NodePlan> = Vec::new();

    preview.doc().nodes_between(from, to, &mut |node, pos| {
        if !node.is_text() {
            return true;
        }
        if node.has_mark(DELETION) {
            return false;
        }
        let seg = (pos.max(from), (pos + node.size()).min(to));
        let has = node.has_mark(&mark.name);
        // Adding an already-present mark (or removing an absent one)
        // changes nothing on this node.
        if adding == has {
            return false;
        }

        let old_fc = node.mark(FORMAT_CHANGE).cloned();
        let (mut fc_before, mut fc_after) = match &old_fc {
            Some(fc) => (
                str_list(fc.attrs.get("before")),
                str_list(fc.attrs.get("after")),
            ),
            None => (Vec::new(), Vec::new()),
        };
        if adding {
            if let Some(ix) = fc_before.iter().position(|n| n == &mark.name) {
                fc_before.remove(ix);
            } else if !fc_after.contains(&mark.name) {
                fc_after.push(mark.name.clone());
            }
        } else if let Some(ix) = fc_after.iter().position(|n| n == &mark.name) {
            fc_after.remove(ix);
        } else if !fc_before.contains(&mark.name) {
            fc_before.push(mark.name.clone());
        }

        let new_fc = if fc_before.is_empty() && fc_after.is_empty() {
            None
        } else {
            Some(
                Mark::new(FORMAT_CHANGE)
                    .attr("user", json!(user.id))
                    .attr("username", json!(user.username))
                    .attr("date", json!(date))
                    .attr("before", json!(fc_before))
                    .attr("after", json!(fc_after)),
            )
        };
        plans.push(NodePlan {
            seg,
            apply: true,
            old_fc,
            new_fc,
        });
        false
    });

    for plan in plans {
        let (seg_from, seg_to) = plan.seg;
        if plan.apply {
            let step = if adding {
                Step::AddMark {
                    from: seg_from,
                    to: seg_to,
                    mark: mark.clone(),
                }
            } else {
                Step::RemoveMark {
                    from: seg_from,
                    to: seg_to,
                    mark: mark.clone(),
                }
            };
            let _ = preview.step(step);
        }
        if let Some(old_fc) = plan.old_fc {
            let _ = preview.step(Step::RemoveMark {
                from: seg_from,
                to: seg_to,
                mark: old_fc,
            });
        }
        if let Some(new_fc) = plan.new_fc {
            let _ = preview.step(Step::AddMark {
                from: seg_from,
                to: seg_to,
                mark: new_fc,
            });
        }
    }
}

fn str_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Fold a block-change track entry into the attrs a retag step will apply.
/// Retagging back to the recorded original collapses the entry.
fn block_change_attrs(
    old_node: &Node,
    new_kind: &str,
    mut attrs: Attrs,
    user: &UserInfo,
    date: i64,
) -> Attrs {
    let mut list = track_list(old_node);
    let existing = list
        .iter()
        .position(|entry| entry_kind(entry) == Some("block_change"));

    let before = match existing {
        Some(ix) => {
            let entry = list.remove(ix);
            entry.get("before").cloned()
        }
        None => {
            let mut before_attrs = old_node.attrs().cloned().unwrap_or_default();
            before_attrs.remove("track");
            before_attrs.remove("id");
            Some(json!({
                "type": old_node.kind(),
                "attrs": before_attrs,
            }))
        }
    };

    let reverted = before
        .as_ref()
        .and_then(|b| b.get("type"))
        .and_then(Value::as_str)
        == Some(new_kind)
        && before
            .as_ref()
            .and_then(|b| b.get("attrs"))
            .and_then(Value::as_object)
            .is_some_and(|b| {
                let as_attrs: Attrs = b.clone().into_iter().collect();
                as_attrs == attrs
            });

    if !reverted {
        list.push(track_entry("block_change", user, date, before));
    }
    if !list.is_empty() {
        attrs.insert("track".to_string(), json!(list));
    }
    attrs
}

/// All suggestions in the document, inline cards coalesced by
/// `(kind, user, date)` adjacency, block cards per tracked node, sorted in
/// document order.
pub fn suggestion_cards(doc: &Node) -> Vec<SuggestionCard> {
    let mut cards: Vec<SuggestionCard> = Vec::new();
    let size = doc.content_size();

    for kind in [INSERTION, DELETION, FORMAT_CHANGE] {
        let mut run: Option<SuggestionCard> = None;
        for (from, to, mark) in marked_segments(doc, 0, size, kind) {
            let user = mark.attr_str("user").unwrap_or_default().to_string();
            let username = mark.attr_str("username").unwrap_or_default().to_string();
            let date = mark.attrs.get("date").and_then(Value::as_i64).unwrap_or(0);
            match &mut run {
                Some(card) if card.to == from && card.user == user && card.date == date => {
                    card.to = to;
                }
                _ => {
                    if let Some(done) = run.take() {
                        cards.push(done);
                    }
                    run = Some(SuggestionCard {
                        kind: kind.to_string(),
                        user,
                        username,
                        date,
                        from,
                        to,
                        block: false,
                    });
                }
            }
        }
        if let Some(done) = run.take() {
            cards.push(done);
        }
    }

    doc.descendants(&mut |node, pos| {
        for entry in track_list(node) {
            cards.push(SuggestionCard {
                kind: entry_kind(&entry).unwrap_or_default().to_string(),
                user: entry_user(&entry).unwrap_or_default().to_string(),
                username: entry
                    .get("username")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                date: entry.get("date").and_then(Value::as_i64).unwrap_or(0),
                from: pos,
                to: pos + node.size(),
                block: true,
            });
        }
        true
    });

    cards.sort_by(|a, b| a.from.cmp(&b.from).then(a.to.cmp(&b.to)));
    cards
}

/// The suggestion covering `pos`, preferring inline cards over block cards.
pub fn suggestion_at(doc: &Node, pos: usize) -> Option<SuggestionCard> {
    let cards = suggestion_cards(doc);
    cards
        .iter()
        .find(|c| !c.block && c.from <= pos && pos < c.to)
        .or_else(|| cards.iter().find(|c| c.block && c.from <= pos && pos < c.to))
        .cloned()
}

pub fn accept_suggestion_tx(doc: &Node, pos: usize) -> Result<Transaction, CommandError> {
    let card = suggestion_at(doc, pos)
        .ok_or_else(|| CommandError::new(format!("No suggestion at position {pos}")))?;
    Ok(Transaction::new(accept_card_steps(doc, &card))
        .with_meta("no_track", json!(true))
        .source("command:track.accept"))
}

pub fn reject_suggestion_tx(doc: &Node, pos: usize) -> Result<Transaction, CommandError> {
    let card = suggestion_at(doc, pos)
        .ok_or_else(|| CommandError::new(format!("No suggestion at position {pos}")))?;
    Ok(Transaction::new(reject_card_steps(doc, &card))
        .with_meta("no_track", json!(true))
        .source("command:track.reject"))
}

/// Resolve every suggestion, re-reading the document after each card so
/// overlapping cards never operate on stale positions. Returns how many
/// cards were resolved.
pub fn accept_all(editor: &mut crate::state::Editor) -> Result<usize, CommandError> {
    resolve_all(editor, true)
}

pub fn reject_all(editor: &mut crate::state::Editor) -> Result<usize, CommandError> {
    resolve_all(editor, false)
}

fn resolve_all(editor: &mut crate::state::Editor, accept: bool) -> Result<usize, CommandError> {
    let mut resolved = 0;
    let mut guard = suggestion_cards(editor.doc()).len();
    while guard > 0 {
        guard -= 1;
        let Some(card) = suggestion_cards(editor.doc()).pop() else {
            break;
        };
        let steps = if accept {
            accept_card_steps(editor.doc(), &card)
        } else {
            reject_card_steps(editor.doc(), &card)
        };
        if steps.is_empty() {
            continue;
        }
        let source = if accept {
            "command:track.accept_all"
        } else {
            "command:track.reject_all"
        };
        editor
            .apply(
                Transaction::new(steps)
                    .with_meta("no_track", json!(true))
                    .source(source),
            )
            .map_err(|e| CommandError::new(format!("Failed to resolve suggestion: {e}")))?;
        resolved += 1;
    }
    Ok(resolved)
}

fn accept_card_steps(doc: &Node, card: &SuggestionCard) -> Vec<Step> {
    if card.block {
        return block_resolution_steps(doc, card, true);
    }
    match card.kind.as_str() {
        // Content becomes permanent: only the marker goes away.
        INSERTION => remove_mark_segments(doc, card, INSERTION),
        // The marked range is now actually removed.
        DELETION => vec![Step::Delete {
            from: card.from,
            to: card.to,
        }],
        FORMAT_CHANGE => remove_mark_segments(doc, card, FORMAT_CHANGE),
        _ => Vec::new(),
    }
}

fn reject_card_steps(doc: &Node, card: &SuggestionCard) -> Vec<Step> {
    if card.block {
        return block_resolution_steps(doc, card, false);
    }
    match card.kind.as_str() {
        // The proposed content is removed.
        INSERTION => vec![Step::Delete {
            from: card.from,
            to: card.to,
        }],
        // The content survives; only the marker goes away.
        DELETION => remove_mark_segments(doc, card, DELETION),
        FORMAT_CHANGE => {
            let mut steps = Vec::new();
            for (seg_from, seg_to, fc) in marked_segments(doc, card.from, card.to, FORMAT_CHANGE) {
                for name in str_list(fc.attrs.get("after")) {
                    steps.push(Step::RemoveMark {
                        from: seg_from,
                        to: seg_to,
                        mark: Mark::new(name),
                    });
                }
                for name in str_list(fc.attrs.get("before")) {
                    steps.push(Step::AddMark {
                        from: seg_from,
                        to: seg_to,
                        mark: Mark::new(name),
                    });
                }
                steps.push(Step::RemoveMark {
                    from: seg_from,
                    to: seg_to,
                    mark: fc,
                });
            }
            steps
        }
        _ => Vec::new(),
    }
}

fn remove_mark_segments(doc: &Node, card: &SuggestionCard, name: &str) -> Vec<Step> {
    marked_segments(doc, card.from, card.to, name)
        .into_iter()
        .map(|(from, to, mark)| Step::RemoveMark { from, to, mark })
        .collect()
}

fn block_resolution_steps(doc: &Node, card: &SuggestionCard, accept: bool) -> Vec<Step> {
    let Some(node) = doc.node_at(card.from) else {
        return Vec::new();
    };
    let mut list = track_list(node);
    let Some(ix) = list
        .iter()
        .position(|entry| entry_kind(entry) == Some(card.kind.as_str()))
    else {
        return Vec::new();
    };
    let entry = list.remove(ix);

    let keep_entry_patch = |list: Vec<Value>| -> Step {
        let patch = if list.is_empty() {
            AttrPatch {
                set: Attrs::new(),
                remove: vec!["track".to_string()],
            }
        } else {
            AttrPatch::set_one("track", json!(list))
        };
        Step::SetAttrs {
            pos: card.from,
            patch,
        }
    };

    match (card.kind.as_str(), accept) {
        // Accepted insertion / rejected deletion: the node stays, the
        // entry goes.
        (INSERTION, true) | (DELETION, false) | ("block_change", true) => {
            vec![keep_entry_patch(list)]
        }
        // Accepted deletion / rejected insertion: the node is removed.
        (DELETION, true) | (INSERTION, false) => delete_blocks_steps(doc, card.from, card.to),
        ("block_change", false) => {
            let before = entry.get("before");
            let kind = before
                .and_then(|b| b.get("type"))
                .and_then(Value::as_str)
                .unwrap_or("paragraph")
                .to_string();
            let mut attrs: Attrs = before
                .and_then(|b| b.get("attrs"))
                .and_then(Value::as_object)
                .map(|m| m.clone().into_iter().collect())
                .unwrap_or_default();
            if !list.is_empty() {
                attrs.insert("track".to_string(), json!(list));
            }
            vec![Step::SetBlockType {
                pos: card.from,
                kind,
                attrs,
            }]
        }
        _ => Vec::new(),
    }
}

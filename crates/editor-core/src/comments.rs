use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{CommandError, EmptySelectionError};
use crate::extensions::{doc_rows, marked_segments};
use crate::node::{Attrs, Mark, Node};
use crate::plugin::{CommandSpec, Decoration, DecorationSet, Extension, QuerySpec};
use crate::schema::MarkSpec;
use crate::state::{EditorContext, EditorState, Selection, Transaction};
use crate::transform::Step;

pub const INLINE_COMMENT: &str = "inline_comment";
pub const INLINE_VOTE: &str = "inline_vote";

/// A contiguous range bearing one reference id. `id` is `None` while the
/// collaborator layer has not yet returned the created entity's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceRange {
    pub id: Option<String>,
    pub from: usize,
    pub to: usize,
}

/// Every range bearing `mark_name`, in document order, adjacent same-id
/// ranges merged.
pub fn reference_ranges(doc: &Node, mark_name: &str) -> Vec<ReferenceRange> {
    let mut ranges: Vec<ReferenceRange> = Vec::new();
    for (from, to, mark) in marked_segments(doc, 0, doc.content_size(), mark_name) {
        let id = mark.attr_str("id").map(str::to_string);
        match ranges.last_mut() {
            Some(last) if last.to == from && last.id == id => {
                last.to = to;
            }
            _ => ranges.push(ReferenceRange { id, from, to }),
        }
    }
    ranges
}

/// Distinct non-null reference ids in document order. Backs "jump to
/// thread" and reconciliation against the collaborator layer.
pub fn referenced_ids(doc: &Node, mark_name: &str) -> Vec<String> {
    let mut ids = Vec::new();
    for range in reference_ranges(doc, mark_name) {
        if let Some(id) = range.id {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    ids
}

/// Apply a reference mark with a null id over the current selection. The
/// id is backfilled once the collaborator layer created the entity.
pub fn create_reference_tx(
    doc: &Node,
    selection: Selection,
    mark_name: &str,
) -> Result<Transaction, EmptySelectionError> {
    if selection.is_collapsed() {
        return Err(EmptySelectionError);
    }
    let _ = doc;
    Ok(Transaction::new(vec![Step::AddMark {
        from: selection.from(),
        to: selection.to(),
        mark: null_reference_mark(mark_name),
    }])
    .source(format!("command:{mark_name}.create")))
}

fn null_reference_mark(mark_name: &str) -> Mark {
    let mut mark = Mark::new(mark_name).attr("id", Value::Null);
    if mark_name == INLINE_COMMENT {
        mark = mark.attr("resolved", json!(false));
    }
    mark
}

/// Backfill the entity id into the null-id marks inside `from..to`.
pub fn set_reference_id_tx(
    doc: &Node,
    mark_name: &str,
    from: usize,
    to: usize,
    id: &str,
) -> Transaction {
    let mut steps = Vec::new();
    for (seg_from, seg_to, mark) in marked_segments(doc, from, to, mark_name) {
        if mark.attrs.get("id") != Some(&Value::Null) {
            continue;
        }
        let mut filled = mark.clone();
        filled.attrs.insert("id".to_string(), json!(id));
        steps.push(Step::RemoveMark {
            from: seg_from,
            to: seg_to,
            mark,
        });
        steps.push(Step::AddMark {
            from: seg_from,
            to: seg_to,
            mark: filled,
        });
    }
    Transaction::new(steps).source(format!("command:{mark_name}.set_id"))
}

/// Strip the mark carrying `id` from the first (or every) occurrence.
/// Idempotent: with no occurrence left this is an empty transaction, not an
/// error — the entity's deletion may already have been reconciled.
pub fn remove_reference_tx(
    doc: &Node,
    mark_name: &str,
    id: &str,
    all_occurrences: bool,
) -> Transaction {
    let mut steps = Vec::new();
    let mut first_range: Option<(usize, usize)> = None;
    for range in reference_ranges(doc, mark_name) {
        if range.id.as_deref() == Some(id) {
            first_range = Some((range.from, range.to));
            break;
        }
    }
    for (seg_from, seg_to, mark) in marked_segments(doc, 0, doc.content_size(), mark_name) {
        if mark.attr_str("id") != Some(id) {
            continue;
        }
        if !all_occurrences {
            match first_range {
                Some((from, to)) if seg_from >= from && seg_to <= to => {}
                _ => continue,
            }
        }
        steps.push(Step::RemoveMark {
            from: seg_from,
            to: seg_to,
            mark,
        });
    }
    Transaction::new(steps).source(format!("command:{mark_name}.remove"))
}

/// Distinct-id counter badges, one widget per top-level row owning at
/// least one reference.
fn row_badges(doc: &Node, mark_name: &str, widget: &str) -> DecorationSet {
    let ranges = reference_ranges(doc, mark_name);
    let mut decorations = Vec::new();
    for (row_pos, row) in doc_rows(doc) {
        let row_end = row_pos + row.size();
        let mut ids: Vec<Option<&str>> = Vec::new();
        for range in &ranges {
            if range.from < row_end && range.to > row_pos {
                let id = range.id.as_deref();
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        if !ids.is_empty() {
            let mut attrs = Attrs::new();
            attrs.insert("count".to_string(), json!(ids.len()));
            decorations.push(Decoration::widget(row_pos, widget, attrs));
        }
    }
    DecorationSet::new(decorations)
}

fn reference_commands(mark_name: &'static str, prefix: &'static str) -> Vec<CommandSpec> {
    vec![
        CommandSpec::new(
            format!("{prefix}.create"),
            format!("Create {prefix} reference"),
            move |editor, _args| {
                let tx = create_reference_tx(editor.doc(), *editor.selection(), mark_name)
                    .map_err(|e| CommandError::new(e.to_string()))?;
                editor
                    .apply(tx)
                    .map_err(|e| CommandError::new(format!("Failed to create reference: {e}")))
            },
        )
        .keywords([prefix, "reference", "create"]),
        CommandSpec::new(
            format!("{prefix}.set_id"),
            format!("Backfill {prefix} id"),
            move |editor, args| {
                let id = arg_str(&args, "id")?;
                let from = arg_usize(&args, "from")?;
                let to = arg_usize(&args, "to")?;
                let tx = set_reference_id_tx(editor.doc(), mark_name, from, to, &id);
                editor
                    .apply(tx)
                    .map_err(|e| CommandError::new(format!("Failed to set reference id: {e}")))
            },
        )
        .hidden(true),
        CommandSpec::new(
            format!("{prefix}.remove"),
            format!("Remove {prefix} reference"),
            move |editor, args| {
                let id = arg_str(&args, "id")?;
                let all = args
                    .as_ref()
                    .and_then(|v| v.get("all"))
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                let tx = remove_reference_tx(editor.doc(), mark_name, &id, all);
                editor
                    .apply(tx)
                    .map_err(|e| CommandError::new(format!("Failed to remove reference: {e}")))
            },
        ),
    ]
}

fn arg_str(args: &Option<Value>, key: &str) -> Result<String, CommandError> {
    args.as_ref()
        .and_then(|v| v.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CommandError::new(format!("Missing args.{key}")))
}

fn arg_usize(args: &Option<Value>, key: &str) -> Result<usize, CommandError> {
    args.as_ref()
        .and_then(|v| v.get(key))
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .ok_or_else(|| CommandError::new(format!("Missing args.{key}")))
}

/// Inline comment threads: a stackable mark ties a text range to a thread
/// persisted by the collaborator layer.
pub struct InlineCommentExtension;

impl Extension for InlineCommentExtension {
    fn id(&self) -> &'static str {
        "inline_comment"
    }

    fn mark_specs(&self) -> Vec<MarkSpec> {
        vec![
            MarkSpec::new(INLINE_COMMENT)
                .excludes("")
                .attr("id", Value::Null)
                .attr("resolved", json!(false))
                .aliases(["inline-comment"]),
        ]
    }

    fn decorations(
        &self,
        state: &EditorState,
        _cx: &EditorContext,
    ) -> Result<DecorationSet, crate::error::ExtensionError> {
        Ok(row_badges(&state.doc, INLINE_COMMENT, "comment-count"))
    }

    fn commands(&self) -> Vec<CommandSpec> {
        let mut commands = reference_commands(INLINE_COMMENT, "comment");
        commands.push(
            CommandSpec::new("comment.resolve", "Resolve comment thread", |editor, args| {
                let id = arg_str(&args, "id")?;
                let doc = editor.doc();
                let mut steps = Vec::new();
                for (from, to, mark) in
                    marked_segments(doc, 0, doc.content_size(), INLINE_COMMENT)
                {
                    if mark.attr_str("id") != Some(id.as_str()) {
                        continue;
                    }
                    let mut resolved = mark.clone();
                    resolved.attrs.insert("resolved".to_string(), json!(true));
                    steps.push(Step::RemoveMark { from, to, mark });
                    steps.push(Step::AddMark {
                        from,
                        to,
                        mark: resolved,
                    });
                }
                editor
                    .apply(Transaction::new(steps).source("command:comment.resolve"))
                    .map_err(|e| CommandError::new(format!("Failed to resolve thread: {e}")))
            }),
        );
        commands
    }

    fn queries(&self) -> Vec<QuerySpec> {
        vec![
            QuerySpec::new("comment.ids", |editor, _args| {
                Ok(json!(referenced_ids(editor.doc(), INLINE_COMMENT)))
            }),
            QuerySpec::new("comment.ranges", |editor, _args| {
                serde_json::to_value(reference_ranges(editor.doc(), INLINE_COMMENT))
                    .map_err(|e| crate::error::QueryError::new(e.to_string()))
            }),
        ]
    }
}

/// Inline votes: same reference discipline as comments, resolved by
/// deleting the mark when the poll is cancelled or completed.
pub struct InlineVoteExtension;

impl Extension for InlineVoteExtension {
    fn id(&self) -> &'static str {
        "inline_vote"
    }

    fn mark_specs(&self) -> Vec<MarkSpec> {
        vec![
            MarkSpec::new(INLINE_VOTE)
                .excludes("")
                .attr("id", Value::Null)
                .aliases(["inline-vote"]),
        ]
    }

    fn decorations(
        &self,
        state: &EditorState,
        _cx: &EditorContext,
    ) -> Result<DecorationSet, crate::error::ExtensionError> {
        Ok(row_badges(&state.doc, INLINE_VOTE, "vote-count"))
    }

    fn commands(&self) -> Vec<CommandSpec> {
        reference_commands(INLINE_VOTE, "vote")
    }

    fn queries(&self) -> Vec<QuerySpec> {
        vec![
            QuerySpec::new("vote.ids", |editor, _args| {
                Ok(json!(referenced_ids(editor.doc(), INLINE_VOTE)))
            }),
            QuerySpec::new("vote.ranges", |editor, _args| {
                serde_json::to_value(reference_ranges(editor.doc(), INLINE_VOTE))
                    .map_err(|e| crate::error::QueryError::new(e.to_string()))
            }),
        ]
    }
}

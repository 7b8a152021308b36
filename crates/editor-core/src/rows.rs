use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::CommandError;
use crate::extensions::{delete_blocks_steps, doc_rows};
use crate::node::{Attrs, Node};
use crate::plugin::{
    CommandSpec, Decoration, DecorationSet, DropPayload, Extension, Handled, InputEvent, QuerySpec,
};
use crate::schema::NodeSpec;
use crate::state::{EditorContext, EditorState, Selection, Transaction};
use crate::transform::{Mapping, Step};

/// The nearest top-level addressable block for a position: its node range
/// and kind. Interior containers (list items, columns, table cells, toggle
/// bodies) resolve to the row that owns them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub from: usize,
    pub to: usize,
    pub kind: String,
}

pub fn resolve_row(doc: &Node, pos: usize) -> Option<Row> {
    let resolved = doc.resolve(pos).ok()?;
    if resolved.depth() > 0 {
        let node = resolved.node(doc, 1);
        let from = resolved.before(1);
        return Some(Row {
            from,
            to: from + node.size(),
            kind: node.kind().to_string(),
        });
    }
    // At a top-level boundary: prefer the node after, falling back to the
    // last row at the document end.
    let rows = doc_rows(doc);
    if rows.is_empty() {
        return None;
    }
    let index = resolved.child_index().min(rows.len() - 1);
    let (from, node) = rows[index];
    Some(Row {
        from,
        to: from + node.size(),
        kind: node.kind().to_string(),
    })
}

/// Insert an empty paragraph adjacent to `row`, caret inside it.
pub fn insert_row_tx(row: &Row, before: bool) -> Transaction {
    let pos = if before { row.from } else { row.to };
    Transaction::new(vec![Step::InsertNodes {
        pos,
        nodes: vec![Node::paragraph("")],
    }])
    .selection_after(Selection::collapsed(pos + 1))
    .source("command:row.insert")
}

#[derive(Debug, Clone, PartialEq)]
pub enum DuplicateOutcome {
    Transaction(Transaction),
    /// Reference rows mirror an external entity; a shallow node copy would
    /// alias it. The embedder duplicates the entity out of band, then
    /// inserts a reference to the duplicate via [`reference_row_tx`].
    NeedsEntityClone {
        kind: String,
        id: Option<String>,
        insert_pos: usize,
    },
}

pub fn duplicate_row(state: &EditorState, row: &Row) -> Option<DuplicateOutcome> {
    let node = state.doc.node_at(row.from)?.clone();
    if state.schema.in_group(node.kind(), "entity_ref") {
        let id = node
            .attr("page_id")
            .or_else(|| node.attr("source_id"))
            .and_then(Value::as_str)
            .map(str::to_string);
        return Some(DuplicateOutcome::NeedsEntityClone {
            kind: node.kind().to_string(),
            id,
            insert_pos: row.to,
        });
    }
    Some(DuplicateOutcome::Transaction(
        Transaction::new(vec![Step::InsertNodes {
            pos: row.to,
            nodes: vec![node],
        }])
        .source("command:row.duplicate"),
    ))
}

/// Reference row pointing at a freshly cloned external entity.
pub fn reference_row_tx(kind: &str, id: &str, insert_pos: usize) -> Transaction {
    let mut attrs = Attrs::new();
    match kind {
        "database_ref" => {
            attrs.insert("source_id".to_string(), json!(id));
        }
        _ => {
            attrs.insert("page_id".to_string(), json!(id));
            attrs.insert("path_type".to_string(), json!("page"));
        }
    }
    Transaction::new(vec![Step::InsertNodes {
        pos: insert_pos,
        nodes: vec![Node::atom(kind, attrs)],
    }])
    .source("command:row.duplicate")
}

/// Remove the row's full range. A toggle resolves to its whole disclosure
/// block, summary included; deleting the only row leaves a blank paragraph.
pub fn delete_row_tx(doc: &Node, row: &Row) -> Transaction {
    Transaction::new(delete_blocks_steps(doc, row.from, row.to))
        .selection_after(Selection::collapsed(row.from))
        .source("command:row.delete")
}

#[derive(Debug, Clone, PartialEq)]
pub enum DragOutcome {
    Reorder(Transaction),
    /// Page-link rows mirror the external page-tree hierarchy the engine
    /// does not own; reordering them is a move request against that tree.
    MoveEntity {
        page_id: String,
        target_index: usize,
    },
}

pub fn drop_row(state: &EditorState, dragged: &Row, target_pos: usize) -> Option<DragOutcome> {
    let target = resolve_row(&state.doc, target_pos)?;
    let node = state.doc.node_at(dragged.from)?.clone();

    if state.schema.in_group(node.kind(), "page_ref") {
        let page_id = node
            .attr("page_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let target_index = doc_rows(&state.doc)
            .iter()
            .position(|(pos, _)| *pos == target.from)
            .unwrap_or(0);
        return Some(DragOutcome::MoveEntity {
            page_id,
            target_index,
        });
    }

    if target.from >= dragged.from && target.from < dragged.to {
        return None;
    }
    let size = dragged.to - dragged.from;
    let insert_pos = if target.to >= dragged.to {
        target.to - size
    } else {
        target.to
    };
    Some(DragOutcome::Reorder(
        Transaction::new(vec![
            Step::Delete {
                from: dragged.from,
                to: dragged.to,
            },
            Step::InsertNodes {
                pos: insert_pos,
                nodes: vec![node],
            },
        ])
        .source("drag:row.reorder"),
    ))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowState {
    /// Row under the pointer, set by handle clicks.
    pub hover: Option<Row>,
    /// Outstanding external move request from dropping a page-link row.
    pub pending_move: Option<PendingMove>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMove {
    pub page_id: String,
    pub target_index: usize,
}

pub const ROWS_STATE_KEY: &str = "rows";

/// Add/duplicate/delete/drag at block granularity. Registered first: handle
/// clicks must win over selection handling further down the chain.
pub struct RowActionsExtension;

impl Extension for RowActionsExtension {
    fn id(&self) -> &'static str {
        "rows"
    }

    fn state_key(&self) -> Option<&'static str> {
        Some(ROWS_STATE_KEY)
    }

    fn init_state(&self, _doc: &Node, _cx: &EditorContext) -> Value {
        serde_json::to_value(RowState::default()).unwrap_or(Value::Null)
    }

    fn apply_state(
        &self,
        tx: &Transaction,
        mapping: &Mapping,
        value: Value,
        _old: &EditorState,
        new: &EditorState,
        _cx: &EditorContext,
    ) -> Result<Value, crate::error::ExtensionError> {
        let mut state: RowState = serde_json::from_value(value).unwrap_or_default();

        if let Some(pos) = tx.get_meta("rows:hover").and_then(Value::as_u64) {
            state.hover = resolve_row(&new.doc, pos as usize);
        } else if let Some(hover) = state.hover.take() {
            // Keep the hovered row pinned to its content across edits.
            let from = mapping.map_result(hover.from, 1);
            if !from.deleted {
                state.hover = resolve_row(&new.doc, from.pos.min(new.doc.content_size()));
            }
        }

        if let Some(request) = tx.get_meta("rows:move_entity") {
            state.pending_move = serde_json::from_value(request.clone()).ok();
        }
        if tx.get_meta("rows:move_entity_done").is_some() {
            state.pending_move = None;
        }

        serde_json::to_value(state)
            .map_err(|err| crate::error::ExtensionError::new(err.to_string()))
    }

    fn handle_event(
        &self,
        state: &EditorState,
        event: &InputEvent,
        _cx: &EditorContext,
    ) -> Option<Handled> {
        match event {
            InputEvent::Click {
                pos,
                on_row_handle: true,
            } => Some(Handled::with(
                Transaction::new(Vec::new()).with_meta("rows:hover", json!(pos)),
            )),
            InputEvent::Drop {
                pos,
                payload: DropPayload::Row { from, to },
            } => {
                let dragged = Row {
                    from: *from,
                    to: *to,
                    kind: state
                        .doc
                        .node_at(*from)
                        .map(|n| n.kind().to_string())
                        .unwrap_or_default(),
                };
                match drop_row(state, &dragged, *pos)? {
                    DragOutcome::Reorder(tx) => Some(Handled::with(tx)),
                    DragOutcome::MoveEntity {
                        page_id,
                        target_index,
                    } => Some(Handled::with(
                        Transaction::new(Vec::new()).with_meta(
                            "rows:move_entity",
                            json!({ "page_id": page_id, "target_index": target_index }),
                        ),
                    )),
                }
            }
            _ => None,
        }
    }

    fn decorations(
        &self,
        state: &EditorState,
        _cx: &EditorContext,
    ) -> Result<DecorationSet, crate::error::ExtensionError> {
        let mut decorations = Vec::new();
        for (pos, node) in doc_rows(&state.doc) {
            let draggable = state
                .schema
                .node_type(node.kind())
                .is_some_and(|t| t.spec.draggable);
            if draggable {
                let mut attrs = Attrs::new();
                attrs.insert("kind".to_string(), json!(node.kind()));
                decorations.push(Decoration::widget(pos, "row-handle", attrs));
            }
        }
        Ok(DecorationSet::new(decorations))
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("row.insert", "Insert row", |editor, args| {
                let pos = arg_pos(&args)?;
                let before = args
                    .as_ref()
                    .and_then(|v| v.get("before"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let row = resolve_row(editor.doc(), pos)
                    .ok_or_else(|| CommandError::new("No row at position"))?;
                editor
                    .apply(insert_row_tx(&row, before))
                    .map_err(|e| CommandError::new(format!("Failed to insert row: {e}")))
            })
            .keywords(["row", "add", "block"]),
            CommandSpec::new("row.duplicate", "Duplicate row", |editor, args| {
                let pos = arg_pos(&args)?;
                let row = resolve_row(editor.doc(), pos)
                    .ok_or_else(|| CommandError::new("No row at position"))?;
                match duplicate_row(editor.state(), &row) {
                    Some(DuplicateOutcome::Transaction(tx)) => editor
                        .apply(tx)
                        .map_err(|e| CommandError::new(format!("Failed to duplicate row: {e}"))),
                    Some(DuplicateOutcome::NeedsEntityClone { kind, .. }) => Err(CommandError::new(
                        format!("`{kind}` rows require duplicating the underlying entity"),
                    )),
                    None => Err(CommandError::new("No row at position")),
                }
            })
            .keywords(["row", "duplicate", "copy"]),
            CommandSpec::new("row.delete", "Delete row", |editor, args| {
                let pos = arg_pos(&args)?;
                let row = resolve_row(editor.doc(), pos)
                    .ok_or_else(|| CommandError::new("No row at position"))?;
                editor
                    .apply(delete_row_tx(editor.doc(), &row))
                    .map_err(|e| CommandError::new(format!("Failed to delete row: {e}")))
            })
            .keywords(["row", "delete", "remove"]),
        ]
    }

    fn queries(&self) -> Vec<QuerySpec> {
        vec![
            QuerySpec::new("row.at", |editor, args| {
                let pos = args
                    .as_ref()
                    .and_then(|v| v.get("pos"))
                    .and_then(Value::as_u64)
                    .ok_or_else(|| crate::error::QueryError::new("Missing args.pos"))?;
                serde_json::to_value(resolve_row(editor.doc(), pos as usize))
                    .map_err(|e| crate::error::QueryError::new(e.to_string()))
            }),
            QuerySpec::new("rows.state", |editor, _args| {
                Ok(editor
                    .state()
                    .field(ROWS_STATE_KEY)
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

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbedState {
    /// Bumped when an upload begins; completions carrying an older token
    /// are discarded (the triggering context has moved on).
    pub upload_token: u64,
}

pub const EMBED_STATE_KEY: &str = "embed";

/// Media and bookmark rows. Pasting a bare URL becomes an embed row;
/// finished uploads re-enter as ordinary transactions guarded by the
/// upload token.
pub struct EmbedExtension;

fn is_bare_url(text: &str) -> bool {
    let text = text.trim();
    (text.starts_with("http://") || text.starts_with("https://"))
        && !text.chars().any(char::is_whitespace)
}

fn url_row(url: &str) -> Node {
    let url = url.trim();
    let lower = url.to_lowercase();
    let mut attrs = Attrs::new();
    if [".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg"]
        .iter()
        .any(|ext| lower.ends_with(ext))
    {
        attrs.insert("src".to_string(), json!(url));
        attrs.insert("alt".to_string(), Value::Null);
        Node::atom("image", attrs)
    } else if lower.contains("youtube.com/watch")
        || lower.contains("youtu.be/")
        || lower.contains("vimeo.com/")
    {
        attrs.insert("src".to_string(), json!(url));
        attrs.insert("kind".to_string(), json!("video"));
        Node::atom("embed", attrs)
    } else {
        attrs.insert("url".to_string(), json!(url));
        Node::atom("bookmark", attrs)
    }
}

impl Extension for EmbedExtension {
    fn id(&self) -> &'static str {
        "embed"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![
            NodeSpec::new("image")
                .groups(["block"])
                .atom()
                .selectable()
                .draggable()
                .attr("src", Value::Null)
                .attr("alt", Value::Null),
            NodeSpec::new("embed")
                .groups(["block"])
                .atom()
                .selectable()
                .draggable()
                .attr("src", Value::Null)
                .attr("kind", json!("iframe"))
                .aliases(["iframe"]),
            NodeSpec::new("bookmark")
                .groups(["block"])
                .atom()
                .selectable()
                .draggable()
                .attr("url", Value::Null),
        ]
    }

    fn state_key(&self) -> Option<&'static str> {
        Some(EMBED_STATE_KEY)
    }

    fn init_state(&self, _doc: &Node, _cx: &EditorContext) -> Value {
        serde_json::to_value(EmbedState::default()).unwrap_or(Value::Null)
    }

    fn apply_state(
        &self,
        tx: &Transaction,
        _mapping: &Mapping,
        value: Value,
        _old: &EditorState,
        _new: &EditorState,
        _cx: &EditorContext,
    ) -> Result<Value, crate::error::ExtensionError> {
        let mut state: EmbedState = serde_json::from_value(value).unwrap_or_default();
        if tx.get_meta("embed:upload_begin").is_some() {
            state.upload_token = state.upload_token.wrapping_add(1);
        }
        serde_json::to_value(state)
            .map_err(|err| crate::error::ExtensionError::new(err.to_string()))
    }

    fn handle_event(
        &self,
        state: &EditorState,
        event: &InputEvent,
        _cx: &EditorContext,
    ) -> Option<Handled> {
        let InputEvent::Paste {
            text: Some(text),
            content: None,
        } = event
        else {
            return None;
        };
        if !is_bare_url(text) {
            return None;
        }
        let row = resolve_row(&state.doc, state.selection.from())?;
        Some(Handled::with(
            Transaction::new(vec![Step::InsertNodes {
                pos: row.to,
                nodes: vec![url_row(text)],
            }])
            .with_meta("paste", json!(true))
            .source("paste:embed"),
        ))
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("embed.upload_begin", "Begin upload", |editor, _args| {
                editor
                    .apply(
                        Transaction::new(Vec::new()).with_meta("embed:upload_begin", json!(true)),
                    )
                    .map_err(|e| CommandError::new(format!("Failed to begin upload: {e}")))
            })
            .hidden(true),
            CommandSpec::new(
                "embed.upload_complete",
                "Insert uploaded image",
                |editor, args| {
                    let args = args
                        .as_ref()
                        .ok_or_else(|| CommandError::new("Missing args"))?;
                    let token = args
                        .get("token")
                        .and_then(Value::as_u64)
                        .ok_or_else(|| CommandError::new("Missing args.token"))?;
                    let src = args
                        .get("src")
                        .and_then(Value::as_str)
                        .ok_or_else(|| CommandError::new("Missing args.src"))?
                        .to_string();
                    let state: EmbedState = editor
                        .state()
                        .field(EMBED_STATE_KEY)
                        .and_then(|v| serde_json::from_value(v.clone()).ok())
                        .unwrap_or_default();
                    if token != state.upload_token {
                        tracing::debug!(token, current = state.upload_token, "discarding stale upload result");
                        return Ok(());
                    }
                    let row = resolve_row(editor.doc(), editor.selection().from())
                        .ok_or_else(|| CommandError::new("No row at selection"))?;
                    let mut attrs = Attrs::new();
                    attrs.insert("src".to_string(), json!(src));
                    attrs.insert(
                        "alt".to_string(),
                        args.get("alt").cloned().unwrap_or(Value::Null),
                    );
                    editor
                        .apply(
                            Transaction::new(vec![Step::InsertNodes {
                                pos: row.to,
                                nodes: vec![Node::atom("image", attrs)],
                            }])
                            .source("command:embed.upload_complete"),
                        )
                        .map_err(|e| CommandError::new(format!("Failed to insert image: {e}")))
                },
            )
            .hidden(true),
        ]
    }
}

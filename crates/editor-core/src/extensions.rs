use serde_json::{json, Value};

use crate::error::{CommandError, EmptySelectionError};
use crate::node::{char_len, byte_of_char, Attrs, Mark, Node, TextNode};
use crate::plugin::{
    CommandSpec, Extension, ExtensionRegistry, Handled, InputEvent, Key, NormalizePass, QuerySpec,
};
use crate::schema::{MarkSpec, NodeSpec, Schema, TEXT_KIND};
use crate::state::{Editor, EditorContext, EditorState, Selection, Transaction};
use crate::transform::{AttrPatch, Step};

/// Marks that newly typed text at `pos` inherits: the marks of the text
/// before the caret, minus non-inclusive ones when sitting at its end.
pub fn marks_at(schema: &Schema, doc: &Node, pos: usize) -> Vec<Mark> {
    let Ok(resolved) = doc.resolve(pos) else {
        return Vec::new();
    };
    if resolved.text_offset().is_some() {
        return resolved
            .node_after(doc)
            .map(|n| n.marks().to_vec())
            .unwrap_or_default();
    }
    let Some(before) = resolved.node_before(doc) else {
        return Vec::new();
    };
    if !before.is_text() {
        return Vec::new();
    }
    before
        .marks()
        .iter()
        .filter(|mark| {
            schema
                .mark_type(&mark.name)
                .is_none_or(|t| t.spec.inclusive)
        })
        .cloned()
        .collect()
}

/// Whether every text character in `from..to` carries a mark named `name`.
pub fn mark_active(doc: &Node, from: usize, to: usize, name: &str) -> bool {
    let mut any = false;
    let mut all = true;
    doc.nodes_between(from, to, &mut |node, _pos| {
        if node.is_text() {
            any = true;
            if !node.has_mark(name) {
                all = false;
            }
        }
        true
    });
    any && all
}

/// Covered subranges of inline nodes carrying the mark `name`, clamped to
/// `from..to`, in document order. Stacked marks of the same name (e.g.
/// overlapping comment threads) yield one segment each.
pub fn marked_segments(doc: &Node, from: usize, to: usize, name: &str) -> Vec<(usize, usize, Mark)> {
    let mut segments = Vec::new();
    doc.nodes_between(from, to, &mut |node, pos| {
        let end = pos + node.size();
        for mark in node.marks().iter().filter(|m| m.name == name) {
            segments.push((pos.max(from), end.min(to), mark.clone()));
        }
        true
    });
    segments
}

/// Inline content covered by `from..to`, with partially covered text nodes
/// trimmed to the range. Used to capture block tails for splits and paste.
pub fn inline_slice(doc: &Node, from: usize, to: usize) -> Vec<Node> {
    let mut nodes = Vec::new();
    doc.nodes_between(from, to, &mut |node, pos| match node {
        Node::Text(t) => {
            let len = char_len(&t.text);
            let start = from.saturating_sub(pos).min(len);
            let end = to.saturating_sub(pos).min(len);
            if start < end {
                nodes.push(Node::Text(TextNode {
                    text: t.text[byte_of_char(&t.text, start)..byte_of_char(&t.text, end)]
                        .to_string(),
                    marks: t.marks.clone(),
                }));
            }
            false
        }
        Node::Atom(_) => {
            if pos >= from && pos + 1 <= to {
                nodes.push(node.clone());
            }
            false
        }
        Node::Element(_) => true,
    });
    nodes
}

/// Top-level rows as `(position_before_node, node)` pairs.
pub fn doc_rows(doc: &Node) -> Vec<(usize, &Node)> {
    let mut rows = Vec::new();
    let mut pos = 0;
    for child in doc.children() {
        rows.push((pos, child));
        pos += child.size();
    }
    rows
}

/// Steps removing the top-level block range `from..to`, inserting a blank
/// paragraph first when that would otherwise empty the document.
pub fn delete_blocks_steps(doc: &Node, from: usize, to: usize) -> Vec<Step> {
    let mut steps = Vec::new();
    if from == 0 && to == doc.content_size() {
        steps.push(Step::InsertNodes {
            pos: to,
            nodes: vec![Node::paragraph("")],
        });
    }
    steps.push(Step::Delete { from, to });
    steps
}

/// Per-segment exact-mark removal over `from..to`, or a single add when the
/// mark is not yet active on the whole range.
pub fn toggle_mark_steps(doc: &Node, from: usize, to: usize, mark: Mark) -> Vec<Step> {
    if mark_active(doc, from, to, &mark.name) {
        marked_segments(doc, from, to, &mark.name)
            .into_iter()
            .map(|(seg_from, seg_to, found)| Step::RemoveMark {
                from: seg_from,
                to: seg_to,
                mark: found,
            })
            .collect()
    } else {
        vec![Step::AddMark { from, to, mark }]
    }
}

pub fn toggle_mark_tx(editor: &Editor, mark: Mark) -> Result<Transaction, EmptySelectionError> {
    let selection = *editor.selection();
    if selection.is_collapsed() {
        return Err(EmptySelectionError);
    }
    let steps = toggle_mark_steps(editor.doc(), selection.from(), selection.to(), mark);
    Ok(Transaction::new(steps))
}

/// Base document vocabulary: every node and mark type a workspace page is
/// persisted with. Legacy camelCase aliases keep old documents loading.
pub struct CoreNodesExtension;

impl Extension for CoreNodesExtension {
    fn id(&self) -> &'static str {
        "core.nodes"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![
            NodeSpec::new("doc").content("block+"),
            NodeSpec::new(TEXT_KIND).groups(["inline"]).inline(),
            NodeSpec::new("paragraph")
                .content("inline*")
                .groups(["block"])
                .draggable(),
            NodeSpec::new("heading")
                .content("inline*")
                .groups(["block"])
                .attr("level", json!(1))
                .draggable(),
            NodeSpec::new("blockquote")
                .content("block+")
                .groups(["block"])
                .aliases(["quote"])
                .draggable(),
            NodeSpec::new("code_block")
                .content("text*")
                .groups(["block"])
                .attr("language", Value::Null)
                .aliases(["codeBlock"])
                .draggable(),
            NodeSpec::new("bullet_list")
                .content("list_item+")
                .groups(["block"])
                .aliases(["bulletList"])
                .draggable(),
            NodeSpec::new("ordered_list")
                .content("list_item+")
                .groups(["block"])
                .attr("order", json!(1))
                .aliases(["orderedList"])
                .draggable(),
            NodeSpec::new("list_item")
                .content("block+")
                .aliases(["listItem"]),
            NodeSpec::new("divider")
                .groups(["block"])
                .aliases(["horizontalRule", "hr"])
                .draggable(),
            NodeSpec::new("columns")
                .content("column+")
                .groups(["block"])
                .aliases(["columnLayout"])
                .draggable(),
            NodeSpec::new("column")
                .content("block+")
                .aliases(["columnBlock"]),
            NodeSpec::new("table")
                .content("table_row+")
                .groups(["block"])
                .draggable(),
            NodeSpec::new("table_row").content("table_cell+"),
            NodeSpec::new("table_cell").content("block+"),
            NodeSpec::new("disclosure_details")
                .content("disclosure_summary block+")
                .groups(["block"])
                .aliases(["disclosureDetails"])
                .draggable(),
            NodeSpec::new("disclosure_summary")
                .content("inline*")
                .aliases(["disclosureSummary"]),
        ]
    }

    fn mark_specs(&self) -> Vec<MarkSpec> {
        vec![
            MarkSpec::new("bold").aliases(["strong"]),
            MarkSpec::new("italic").aliases(["em"]),
            MarkSpec::new("underline"),
            MarkSpec::new("strikethrough").aliases(["strike"]),
            MarkSpec::new("code"),
            MarkSpec::new("link").attr("href", Value::Null),
            MarkSpec::new("text_color")
                .attr("color", Value::Null)
                .attr("bg_color", Value::Null)
                .aliases(["textColor"]),
        ]
    }

    fn normalize_passes(&self) -> Vec<Box<dyn NormalizePass>> {
        vec![Box::new(EnsureNonEmptyDocument), Box::new(MergeAdjacentText)]
    }

    fn commands(&self) -> Vec<CommandSpec> {
        let toggles: [(&str, &str, &str); 5] = [
            ("marks.toggle_bold", "Toggle bold", "bold"),
            ("marks.toggle_italic", "Toggle italic", "italic"),
            ("marks.toggle_underline", "Toggle underline", "underline"),
            (
                "marks.toggle_strikethrough",
                "Toggle strikethrough",
                "strikethrough",
            ),
            ("marks.toggle_code", "Toggle code", "code"),
        ];
        let mut commands: Vec<CommandSpec> = toggles
            .into_iter()
            .map(|(id, label, mark_name)| {
                let mark_name = mark_name.to_string();
                CommandSpec::new(id, label, move |editor, _args| {
                    let tx = toggle_mark_tx(editor, Mark::new(mark_name.clone()))
                        .map_err(|e| CommandError::new(e.to_string()))?;
                    editor
                        .apply(tx.source(format!("command:marks.toggle_{mark_name}")))
                        .map_err(|e| CommandError::new(format!("Failed to toggle mark: {e}")))
                })
                .keywords(["mark", "format"])
            })
            .collect();

        commands.push(
            CommandSpec::new("marks.set_link", "Set link", |editor, args| {
                let url = args
                    .as_ref()
                    .and_then(|v| v.get("url"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| CommandError::new("Missing args.url"))?
                    .to_string();
                let selection = *editor.selection();
                if selection.is_collapsed() {
                    return Err(CommandError::new(EmptySelectionError.to_string()));
                }
                let tx = Transaction::new(vec![Step::AddMark {
                    from: selection.from(),
                    to: selection.to(),
                    mark: Mark::new("link").attr("href", Value::String(url)),
                }])
                .source("command:marks.set_link");
                editor
                    .apply(tx)
                    .map_err(|e| CommandError::new(format!("Failed to set link: {e}")))
            })
            .keywords(["link", "url", "hyperlink"]),
        );
        commands.push(
            CommandSpec::new("marks.unset_link", "Unset link", |editor, _args| {
                let selection = *editor.selection();
                if selection.is_collapsed() {
                    return Err(CommandError::new(EmptySelectionError.to_string()));
                }
                let steps: Vec<Step> =
                    marked_segments(editor.doc(), selection.from(), selection.to(), "link")
                        .into_iter()
                        .map(|(from, to, mark)| Step::RemoveMark { from, to, mark })
                        .collect();
                editor
                    .apply(Transaction::new(steps).source("command:marks.unset_link"))
                    .map_err(|e| CommandError::new(format!("Failed to unset link: {e}")))
            })
            .keywords(["link", "unlink"]),
        );
        commands.push(
            CommandSpec::new("block.set_type", "Set block type", |editor, args| {
                let kind = args
                    .as_ref()
                    .and_then(|v| v.get("kind"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| CommandError::new("Missing args.kind"))?
                    .to_string();
                let attrs: Attrs = args
                    .as_ref()
                    .and_then(|v| v.get("attrs"))
                    .and_then(Value::as_object)
                    .map(|m| m.clone().into_iter().collect())
                    .unwrap_or_default();
                let pos = editor.selection().from();
                let resolved = editor
                    .doc()
                    .resolve(pos)
                    .map_err(|e| CommandError::new(e.to_string()))?;
                if resolved.depth() == 0 {
                    return Err(CommandError::new("No block at selection"));
                }
                let before = resolved.before(1);
                let tx = Transaction::new(vec![Step::SetBlockType {
                    pos: before,
                    kind,
                    attrs,
                }])
                .source("command:block.set_type");
                editor
                    .apply(tx)
                    .map_err(|e| CommandError::new(format!("Failed to set block type: {e}")))
            })
            .keywords(["block", "heading", "turn into"]),
        );
        commands
    }

    fn queries(&self) -> Vec<QuerySpec> {
        vec![QuerySpec::new("marks.active", |editor, _args| {
            let selection = editor.selection();
            let names: Vec<String> = ["bold", "italic", "underline", "strikethrough", "code"]
                .iter()
                .filter(|name| mark_active(editor.doc(), selection.from(), selection.to(), name))
                .map(|name| name.to_string())
                .collect();
            Ok(json!(names))
        })]
    }
}

struct EnsureNonEmptyDocument;

impl NormalizePass for EnsureNonEmptyDocument {
    fn id(&self) -> &'static str {
        "core.ensure_non_empty_document"
    }

    fn run(&self, doc: &Node, _schema: &Schema) -> Vec<Step> {
        if doc.children().is_empty() {
            return vec![Step::InsertNodes {
                pos: 0,
                nodes: vec![Node::paragraph("")],
            }];
        }
        Vec::new()
    }
}

/// Coalesces adjacent text nodes with identical mark sets, one pair per
/// run; the fixpoint loop in the editor drives it to completion. This is
/// what keeps the mark-coalescing invariant after splits and mark edits.
struct MergeAdjacentText;

impl NormalizePass for MergeAdjacentText {
    fn id(&self) -> &'static str {
        "core.merge_adjacent_text"
    }

    fn run(&self, doc: &Node, _schema: &Schema) -> Vec<Step> {
        find_merge(doc.children(), 0)
    }
}

fn find_merge(children: &[Node], base: usize) -> Vec<Step> {
    let mut pos = base;
    let mut prev: Option<(usize, &TextNode)> = None;
    for child in children {
        let size = child.size();
        match child {
            Node::Text(t) => {
                if let Some((prev_pos, prev_node)) = prev {
                    if prev_node.marks == t.marks {
                        let prev_len = char_len(&prev_node.text);
                        let start = prev_pos + prev_len;
                        return vec![
                            Step::Delete {
                                from: start,
                                to: start + char_len(&t.text),
                            },
                            Step::InsertText {
                                pos: start,
                                text: t.text.clone(),
                                marks: t.marks.clone(),
                            },
                        ];
                    }
                }
                prev = Some((pos, t));
            }
            Node::Element(el) => {
                prev = None;
                let inner = find_merge(&el.children, pos + 1);
                if !inner.is_empty() {
                    return inner;
                }
            }
            Node::Atom(_) => {
                prev = None;
            }
        }
        pos += size;
    }
    Vec::new()
}

/// Default editing behavior, registered last so feature extensions get
/// first refusal on every event: typing, backspace/forward delete, block
/// splitting on Enter, plain-text and JSON paste, click selection.
pub struct CoreInputExtension;

impl CoreInputExtension {
    fn insert_text_tx(state: &EditorState, text: &str) -> Option<Transaction> {
        let schema = &state.schema;
        let selection = state.selection;
        let mut steps = Vec::new();
        let mut at = selection.from();
        if !selection.is_collapsed() {
            let start = state.doc.resolve(selection.from()).ok()?;
            let end = state.doc.resolve(selection.to()).ok()?;
            if start.container_path() == end.container_path() {
                steps.push(Step::Delete {
                    from: selection.from(),
                    to: selection.to(),
                });
            }
            at = selection.from();
        }
        let marks = marks_at(schema, &state.doc, at);
        let len = char_len(text);
        steps.push(Step::InsertText {
            pos: at,
            text: text.to_string(),
            marks,
        });
        Some(
            Transaction::new(steps)
                .selection_after(Selection::collapsed(at + len))
                .with_meta("input_type", json!("insertText")),
        )
    }

    fn split_block_tx(state: &EditorState) -> Option<Transaction> {
        let selection = state.selection;
        let caret = selection.from();
        let resolved = state.doc.resolve(caret).ok()?;
        if resolved.depth() == 0 {
            return None;
        }
        let depth = resolved.depth();
        let block_end = resolved.start(depth) + resolved.node(&state.doc, depth).content_size();
        let after = resolved.start(depth) - 1 + resolved.node(&state.doc, depth).size();

        let tail = inline_slice(&state.doc, caret, block_end);
        let mut steps = Vec::new();
        if caret < block_end {
            steps.push(Step::Delete {
                from: caret,
                to: block_end,
            });
        }
        // Insert position pre-delete: the delete shrinks the block, so the
        // boundary after it moves left by the removed size.
        let removed = block_end - caret;
        steps.push(Step::InsertNodes {
            pos: after - removed,
            nodes: vec![Node::element("paragraph", tail)],
        });
        Some(
            Transaction::new(steps)
                .selection_after(Selection::collapsed(after - removed + 1))
                .with_meta("input_type", json!("insertParagraph")),
        )
    }

    fn delete_char_tx(state: &EditorState, forward: bool) -> Option<Transaction> {
        let selection = state.selection;
        if !selection.is_collapsed() {
            let start = state.doc.resolve(selection.from()).ok()?;
            let end = state.doc.resolve(selection.to()).ok()?;
            if start.container_path() != end.container_path() {
                return None;
            }
            return Some(
                Transaction::new(vec![Step::Delete {
                    from: selection.from(),
                    to: selection.to(),
                }])
                .selection_after(Selection::collapsed(selection.from()))
                .with_meta(
                    "input_type",
                    json!(if forward {
                        "deleteContentForward"
                    } else {
                        "deleteContentBackward"
                    }),
                ),
            );
        }

        let caret = selection.from();
        let resolved = state.doc.resolve(caret).ok()?;
        let parent = resolved.parent(&state.doc);
        let content_end = resolved.start(resolved.depth()) + parent.content_size();
        let (from, to) = if forward {
            if caret >= content_end {
                return None;
            }
            (caret, caret + 1)
        } else {
            if resolved.parent_offset == 0 {
                return Self::join_backward_tx(state);
            }
            (caret - 1, caret)
        };
        Some(
            Transaction::new(vec![Step::Delete { from, to }])
                .selection_after(Selection::collapsed(from))
                .with_meta(
                    "input_type",
                    json!(if forward {
                        "deleteContentForward"
                    } else {
                        "deleteContentBackward"
                    }),
                ),
        )
    }

    /// Backspace at the start of a textblock merges it into the preceding
    /// sibling textblock.
    fn join_backward_tx(state: &EditorState) -> Option<Transaction> {
        let caret = state.selection.from();
        let resolved = state.doc.resolve(caret).ok()?;
        let depth = resolved.depth();
        if depth == 0 {
            return None;
        }
        let block = resolved.node(&state.doc, depth);
        if !state
            .schema
            .node_type(block.kind())
            .is_some_and(|t| t.is_textblock())
        {
            return None;
        }
        let parent = resolved.node(&state.doc, depth - 1);
        let index = resolved.index(depth - 1);
        if index == 0 {
            return None;
        }
        let prev = &parent.children()[index - 1];
        if !state
            .schema
            .node_type(prev.kind())
            .is_some_and(|t| t.is_textblock())
        {
            return None;
        }
        let mut remaining: Vec<Node> = parent.children().to_vec();
        remaining.remove(index);
        if !state.schema.valid_content(parent.kind(), &remaining) {
            return None;
        }

        let before = resolved.before(depth);
        let mut steps = vec![Step::Delete {
            from: before,
            to: before + block.size(),
        }];
        let tail = block.children().to_vec();
        if !tail.is_empty() {
            steps.push(Step::InsertNodes {
                pos: before - 1,
                nodes: tail,
            });
        }
        Some(
            Transaction::new(steps)
                .selection_after(Selection::collapsed(before - 1))
                .with_meta("input_type", json!("deleteContentBackward")),
        )
    }

    fn paste_tx(state: &EditorState, text: Option<&str>, content: Option<&Value>) -> Option<Transaction> {
        if let Some(value) = content {
            match Self::paste_nodes(&state.schema, value) {
                Ok(nodes) if !nodes.is_empty() => {
                    let caret = state.selection.from();
                    let resolved = state.doc.resolve(caret).ok()?;
                    // Single paragraph pastes inline at the caret; anything
                    // larger lands as blocks after the current row.
                    if let [Node::Element(el)] = nodes.as_slice() {
                        if el.kind == "paragraph" && resolved.depth() > 0 {
                            let steps: Vec<Step> = vec![Step::InsertNodes {
                                pos: caret,
                                nodes: el.children.clone(),
                            }];
                            return Some(
                                Transaction::new(steps).with_meta("paste", json!(true)),
                            );
                        }
                    }
                    let after_row = if resolved.depth() == 0 {
                        caret
                    } else {
                        resolved.before(1) + resolved.node(&state.doc, 1).size()
                    };
                    return Some(
                        Transaction::new(vec![Step::InsertNodes {
                            pos: after_row,
                            nodes,
                        }])
                        .with_meta("paste", json!(true)),
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(error = %err, "pasted content failed schema validation; falling back to text");
                }
            }
        }
        let text = text?;
        if text.is_empty() {
            return None;
        }
        let mut lines = text.split('\n');
        let first = lines.next().unwrap_or_default();
        let mut tx = Self::insert_text_tx(state, first)?;
        let rest: Vec<Node> = lines.map(Node::paragraph).collect();
        if !rest.is_empty() {
            let caret = state.selection.from();
            let resolved = state.doc.resolve(caret).ok()?;
            let after_row = if resolved.depth() == 0 {
                caret
            } else {
                resolved.before(1) + resolved.node(&state.doc, 1).size()
            };
            let inserted = char_len(first);
            tx.steps.push(Step::InsertNodes {
                pos: after_row + inserted,
                nodes: rest,
            });
        }
        tx = tx.with_meta("paste", json!(true));
        Some(tx)
    }

    fn paste_nodes(schema: &Schema, value: &Value) -> Result<Vec<Node>, crate::error::ParseError> {
        if let Some(list) = value.as_array() {
            return list.iter().map(|v| Node::from_json(schema, v)).collect();
        }
        let node = Node::from_json(schema, value)?;
        if node.kind() == "doc" {
            Ok(node.children().to_vec())
        } else {
            Ok(vec![node])
        }
    }
}

impl Extension for CoreInputExtension {
    fn id(&self) -> &'static str {
        "core.input"
    }

    fn handle_event(
        &self,
        state: &EditorState,
        event: &InputEvent,
        _cx: &EditorContext,
    ) -> Option<Handled> {
        match event {
            InputEvent::KeyDown(Key::Char(c)) => {
                Self::insert_text_tx(state, &c.to_string()).map(Handled::with)
            }
            InputEvent::KeyDown(Key::Enter) => Self::split_block_tx(state).map(Handled::with),
            InputEvent::KeyDown(Key::Backspace) => {
                Self::delete_char_tx(state, false).map(Handled::with)
            }
            InputEvent::KeyDown(Key::Delete) => {
                Self::delete_char_tx(state, true).map(Handled::with)
            }
            InputEvent::Paste { text, content } => {
                Self::paste_tx(state, text.as_deref(), content.as_ref()).map(Handled::with)
            }
            InputEvent::Click {
                pos,
                on_row_handle: false,
            } => Some(Handled::with(
                Transaction::new(Vec::new())
                    .selection_after(Selection::collapsed(*pos))
                    .with_meta("ui_event", json!("click")),
            )),
            _ => None,
        }
    }
}

/// Apply an attribute patch to the row at the current selection.
pub fn set_row_attrs_tx(editor: &Editor, patch: AttrPatch) -> Result<Transaction, CommandError> {
    let pos = editor.selection().from();
    let resolved = editor
        .doc()
        .resolve(pos)
        .map_err(|e| CommandError::new(e.to_string()))?;
    if resolved.depth() == 0 {
        return Err(CommandError::new("No block at selection"));
    }
    Ok(Transaction::new(vec![Step::SetAttrs {
        pos: resolved.before(1),
        patch,
    }]))
}

impl ExtensionRegistry {
    /// The full workspace-editor composition. Order is a contract: row
    /// actions must see clicks before anything else, reference triggers and
    /// embeds must see input before the default handlers, and the default
    /// handlers come last.
    pub fn standard() -> Self {
        let extensions: Vec<Box<dyn Extension>> = vec![
            Box::new(crate::rows::RowActionsExtension),
            Box::new(crate::track::TrackChangesExtension),
            Box::new(crate::comments::InlineCommentExtension),
            Box::new(crate::comments::InlineVoteExtension),
            Box::new(crate::mention::MentionExtension),
            Box::new(crate::mention::PageLinkExtension),
            Box::new(crate::rows::EmbedExtension),
            Box::new(CoreNodesExtension),
            Box::new(CoreInputExtension),
        ];
        Self::new(extensions).expect("standard registry must be valid")
    }
}

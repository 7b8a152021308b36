use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::comments::{referenced_ids, INLINE_COMMENT, INLINE_VOTE};
use crate::node::Node;
use crate::state::Editor;

/// Which external entity family to enumerate references for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Comment,
    Vote,
    Mention,
    Page,
    Database,
}

/// Distinct referenced ids of one kind, in document order. The collaborator
/// layer reconciles entity lifecycles against this.
pub fn get_referenced_ids(doc: &Node, kind: ReferenceKind) -> Vec<String> {
    match kind {
        ReferenceKind::Comment => referenced_ids(doc, INLINE_COMMENT),
        ReferenceKind::Vote => referenced_ids(doc, INLINE_VOTE),
        ReferenceKind::Mention => node_attr_ids(doc, "mention", "value"),
        ReferenceKind::Page => node_attr_ids(doc, "page_link", "page_id"),
        ReferenceKind::Database => node_attr_ids(doc, "database_ref", "source_id"),
    }
}

fn node_attr_ids(doc: &Node, kind: &str, attr: &str) -> Vec<String> {
    let mut ids = Vec::new();
    doc.descendants(&mut |node, _pos| {
        if node.kind() == kind {
            if let Some(id) = node.attr(attr).and_then(Value::as_str) {
                if !ids.contains(&id.to_string()) {
                    ids.push(id.to_string());
                }
            }
            return false;
        }
        true
    });
    ids
}

/// Text content of every textblock, one line each.
pub fn get_plain_text(doc: &Node) -> String {
    let mut lines = Vec::new();
    collect_text(doc, &mut lines);
    lines.join("\n")
}

fn collect_text(node: &Node, lines: &mut Vec<String>) {
    for child in node.children() {
        let Node::Element(el) = child else { continue };
        // Containers recurse; elements holding only inline content are the
        // lines themselves.
        if el.children.iter().any(|c| matches!(c, Node::Element(_))) {
            collect_text(child, lines);
            continue;
        }
        let mut line = String::new();
        for inline in &el.children {
            match inline {
                Node::Text(t) => line.push_str(&t.text),
                Node::Atom(atom) if atom.kind == "mention" => {
                    line.push('@');
                    if let Some(value) = atom.attrs.get("value").and_then(Value::as_str) {
                        line.push_str(value);
                    }
                }
                _ => {}
            }
        }
        lines.push(line);
    }
}

/// Best-effort markdown rendering; rich embeds degrade to their URLs,
/// references to id placeholders.
pub fn serialize_to_markdown(doc: &Node) -> String {
    let mut out = Vec::new();
    render_blocks(doc.children(), "", &mut out);
    out.join("\n\n")
}

fn render_blocks(children: &[Node], indent: &str, out: &mut Vec<String>) {
    for child in children {
        match child {
            Node::Element(el) => match el.kind.as_str() {
                "paragraph" => out.push(format!("{indent}{}", inline_markdown(&el.children))),
                "heading" => {
                    let level = el
                        .attrs
                        .get("level")
                        .and_then(Value::as_u64)
                        .unwrap_or(1)
                        .clamp(1, 6) as usize;
                    out.push(format!(
                        "{indent}{} {}",
                        "#".repeat(level),
                        inline_markdown(&el.children)
                    ));
                }
                "code_block" => {
                    let language = el
                        .attrs
                        .get("language")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let body: String = el
                        .children
                        .iter()
                        .filter_map(Node::text_content)
                        .collect();
                    out.push(format!("{indent}```{language}\n{body}\n{indent}```"));
                }
                "blockquote" => {
                    let mut inner = Vec::new();
                    render_blocks(&el.children, "", &mut inner);
                    out.push(
                        inner
                            .join("\n\n")
                            .lines()
                            .map(|line| format!("{indent}> {line}"))
                            .collect::<Vec<_>>()
                            .join("\n"),
                    );
                }
                "bullet_list" | "ordered_list" => {
                    let ordered = el.kind == "ordered_list";
                    let mut lines = Vec::new();
                    for (ix, item) in el.children.iter().enumerate() {
                        let bullet = if ordered {
                            format!("{}.", ix + 1)
                        } else {
                            "-".to_string()
                        };
                        let mut inner = Vec::new();
                        render_blocks(item.children(), "", &mut inner);
                        let body = inner.join(" ");
                        lines.push(format!("{indent}{bullet} {body}"));
                    }
                    out.push(lines.join("\n"));
                }
                "table" => {
                    let mut lines = Vec::new();
                    for (row_ix, row) in el.children.iter().enumerate() {
                        let cells: Vec<String> = row
                            .children()
                            .iter()
                            .map(|cell| {
                                let mut inner = Vec::new();
                                render_blocks(cell.children(), "", &mut inner);
                                inner.join(" ")
                            })
                            .collect();
                        lines.push(format!("{indent}| {} |", cells.join(" | ")));
                        if row_ix == 0 {
                            lines.push(format!(
                                "{indent}|{}|",
                                cells.iter().map(|_| " --- ").collect::<String>()
                            ));
                        }
                    }
                    out.push(lines.join("\n"));
                }
                "disclosure_details" => {
                    render_blocks(&el.children, indent, out);
                }
                "disclosure_summary" => {
                    out.push(format!("{indent}**{}**", inline_markdown(&el.children)));
                }
                "columns" | "column" | "list_item" | "table_row" | "table_cell" => {
                    render_blocks(&el.children, indent, out);
                }
                _ => render_blocks(&el.children, indent, out),
            },
            Node::Atom(atom) => match atom.kind.as_str() {
                "divider" => out.push(format!("{indent}---")),
                "image" => {
                    let src = atom.attrs.get("src").and_then(Value::as_str).unwrap_or("");
                    let alt = atom.attrs.get("alt").and_then(Value::as_str).unwrap_or("");
                    out.push(format!("{indent}![{alt}]({src})"));
                }
                "embed" => {
                    let src = atom.attrs.get("src").and_then(Value::as_str).unwrap_or("");
                    out.push(format!("{indent}{src}"));
                }
                "bookmark" => {
                    let url = atom.attrs.get("url").and_then(Value::as_str).unwrap_or("");
                    out.push(format!("{indent}{url}"));
                }
                "page_link" => {
                    let id = atom
                        .attrs
                        .get("page_id")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    out.push(format!("{indent}[[{id}]]"));
                }
                _ => {}
            },
            Node::Text(_) => {}
        }
    }
}

fn inline_markdown(children: &[Node]) -> String {
    let mut out = String::new();
    for child in children {
        match child {
            Node::Text(t) => {
                let mut piece = t.text.clone();
                if t.marks.iter().any(|m| m.name == "code") {
                    piece = format!("`{piece}`");
                }
                if t.marks.iter().any(|m| m.name == "bold") {
                    piece = format!("**{piece}**");
                }
                if t.marks.iter().any(|m| m.name == "italic") {
                    piece = format!("*{piece}*");
                }
                if t.marks.iter().any(|m| m.name == "strikethrough") {
                    piece = format!("~~{piece}~~");
                }
                if let Some(link) = t.marks.iter().find(|m| m.name == "link") {
                    let href = link.attr_str("href").unwrap_or("");
                    piece = format!("[{piece}]({href})");
                }
                out.push_str(&piece);
            }
            Node::Atom(atom) if atom.kind == "mention" => {
                out.push('@');
                if let Some(value) = atom.attrs.get("value").and_then(Value::as_str) {
                    out.push_str(value);
                }
            }
            _ => {}
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentChange {
    pub version: u64,
    pub plain_text: String,
}

/// Debounces committed document changes into one notification per quiet
/// window (trailing edge: every further change pushes the deadline). This
/// is persistence policy layered on top of the engine, not an engine
/// invariant — the embedder pumps `observe` after applying transactions and
/// `poll` from its tick.
#[derive(Debug)]
pub struct ContentChangeNotifier {
    window: Duration,
    notified_version: u64,
    deadline: Option<Instant>,
}

impl ContentChangeNotifier {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            notified_version: 0,
            deadline: None,
        }
    }

    pub fn for_editor(editor: &Editor) -> Self {
        Self::new(Duration::from_millis(
            editor.config().content_change_debounce_ms,
        ))
    }

    pub fn observe(&mut self, editor: &Editor, now: Instant) {
        if editor.doc_version() != self.notified_version {
            self.deadline = Some(now + self.window);
        }
    }

    pub fn poll(&mut self, editor: &Editor, now: Instant) -> Option<ContentChange> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        self.deadline = None;
        let version = editor.doc_version();
        if version == self.notified_version {
            return None;
        }
        self.notified_version = version;
        tracing::trace!(version, "content change notification");
        Some(ContentChange {
            version,
            plain_text: get_plain_text(editor.doc()),
        })
    }
}

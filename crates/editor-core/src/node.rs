use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{OutOfRangeError, ParseError};
use crate::schema::{Schema, TEXT_KIND};

pub type Attrs = BTreeMap<String, Value>;

/// A typed annotation on inline content (bold, link, comment reference,
/// track-insertion, ...). Identity is `name` plus `attrs`.
#[derive(Debug, Clone, PartialEq)]
pub struct Mark {
    pub name: String,
    pub attrs: Attrs,
}

impl Mark {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Attrs::new(),
        }
    }

    pub fn attr(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attrs.insert(name.into(), value);
        self
    }

    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).and_then(Value::as_str)
    }
}

/// One element of the document tree. The document itself is a `Node` of
/// kind `doc`; committed trees are never mutated in place, every
/// transaction produces a fresh version.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(ElementNode),
    Text(TextNode),
    Atom(AtomNode),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementNode {
    pub kind: String,
    pub attrs: Attrs,
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextNode {
    pub text: String,
    pub marks: Vec<Mark>,
}

/// Leaf node with no content of its own (mention, divider, image, ...).
/// Occupies exactly one position. Inline atoms may carry marks.
#[derive(Debug, Clone, PartialEq)]
pub struct AtomNode {
    pub kind: String,
    pub attrs: Attrs,
    pub marks: Vec<Mark>,
}

pub(crate) fn char_len(s: &str) -> usize {
    s.chars().count()
}

pub(crate) fn byte_of_char(s: &str, char_ix: usize) -> usize {
    s.char_indices()
        .nth(char_ix)
        .map(|(ix, _)| ix)
        .unwrap_or(s.len())
}

impl Node {
    pub fn element(kind: impl Into<String>, children: Vec<Node>) -> Self {
        Node::Element(ElementNode {
            kind: kind.into(),
            attrs: Attrs::new(),
            children,
        })
    }

    pub fn element_with_attrs(kind: impl Into<String>, attrs: Attrs, children: Vec<Node>) -> Self {
        Node::Element(ElementNode {
            kind: kind.into(),
            attrs,
            children,
        })
    }

    pub fn text(text: impl Into<String>) -> Self {
        Node::Text(TextNode {
            text: text.into(),
            marks: Vec::new(),
        })
    }

    pub fn text_with_marks(text: impl Into<String>, marks: Vec<Mark>) -> Self {
        Node::Text(TextNode {
            text: text.into(),
            marks,
        })
    }

    pub fn atom(kind: impl Into<String>, attrs: Attrs) -> Self {
        Node::Atom(AtomNode {
            kind: kind.into(),
            attrs,
            marks: Vec::new(),
        })
    }

    pub fn paragraph(text: impl Into<String>) -> Self {
        let text = text.into();
        let children = if text.is_empty() {
            Vec::new()
        } else {
            vec![Node::text(text)]
        };
        Node::element("paragraph", children)
    }

    pub fn divider() -> Self {
        Node::atom("divider", Attrs::new())
    }

    pub fn doc(children: Vec<Node>) -> Self {
        Node::element("doc", children)
    }

    pub fn kind(&self) -> &str {
        match self {
            Node::Element(el) => &el.kind,
            Node::Atom(atom) => &atom.kind,
            Node::Text(_) => TEXT_KIND,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Node::Text(_))
    }

    pub fn text_content(&self) -> Option<&str> {
        match self {
            Node::Text(t) => Some(&t.text),
            _ => None,
        }
    }

    pub fn marks(&self) -> &[Mark] {
        match self {
            Node::Text(t) => &t.marks,
            Node::Atom(atom) => &atom.marks,
            Node::Element(_) => &[],
        }
    }

    pub fn marks_mut(&mut self) -> Option<&mut Vec<Mark>> {
        match self {
            Node::Text(t) => Some(&mut t.marks),
            Node::Atom(atom) => Some(&mut atom.marks),
            Node::Element(_) => None,
        }
    }

    pub fn has_mark(&self, name: &str) -> bool {
        self.marks().iter().any(|m| m.name == name)
    }

    pub fn mark(&self, name: &str) -> Option<&Mark> {
        self.marks().iter().find(|m| m.name == name)
    }

    pub fn attrs(&self) -> Option<&Attrs> {
        match self {
            Node::Element(el) => Some(&el.attrs),
            Node::Atom(atom) => Some(&atom.attrs),
            Node::Text(_) => None,
        }
    }

    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attrs().and_then(|attrs| attrs.get(name))
    }

    pub fn children(&self) -> &[Node] {
        match self {
            Node::Element(el) => &el.children,
            _ => &[],
        }
    }

    /// Full size of this node in the position scheme: text is its char
    /// count, an atom is 1, an element is its content plus one unit each
    /// for entering and leaving.
    pub fn size(&self) -> usize {
        match self {
            Node::Text(t) => char_len(&t.text),
            Node::Atom(_) => 1,
            Node::Element(_) => 2 + self.content_size(),
        }
    }

    /// Size of this node's content. For the document root this is the
    /// valid position range: positions `0..=content_size` resolve.
    pub fn content_size(&self) -> usize {
        self.children().iter().map(Node::size).sum()
    }

    /// Depth-first traversal of `(node, pos)` pairs over the subtree rooted
    /// here (positions relative to this node as document root). The visitor
    /// returns whether to descend into an element's children.
    pub fn descendants(&self, visitor: &mut impl FnMut(&Node, usize) -> bool) {
        let to = self.content_size();
        self.nodes_between(0, to, visitor);
    }

    /// Range-limited traversal: the visitor sees every node whose span
    /// intersects `from..to`, in document order.
    pub fn nodes_between(&self, from: usize, to: usize, visitor: &mut impl FnMut(&Node, usize) -> bool) {
        walk_between(self.children(), 0, from, to, visitor);
    }

    /// Concatenated text content in `from..to`. Atoms and block boundaries
    /// contribute nothing.
    pub fn text_between(&self, from: usize, to: usize) -> Result<String, OutOfRangeError> {
        let max = self.content_size();
        if from > to || to > max {
            let pos = if from > to { from } else { to };
            return Err(OutOfRangeError { pos, max });
        }
        let mut out = String::new();
        self.nodes_between(from, to, &mut |node, pos| {
            if let Node::Text(t) = node {
                let len = char_len(&t.text);
                let start = from.saturating_sub(pos).min(len);
                let end = to.saturating_sub(pos).min(len);
                if start < end {
                    out.push_str(&t.text[byte_of_char(&t.text, start)..byte_of_char(&t.text, end)]);
                }
            }
            true
        });
        Ok(out)
    }

    pub fn resolve(&self, pos: usize) -> Result<ResolvedPos, OutOfRangeError> {
        let max = self.content_size();
        if pos > max {
            return Err(OutOfRangeError { pos, max });
        }

        let mut path: Vec<PathEntry> = Vec::new();
        let mut node = self;
        let mut base = 0usize;

        'descend: loop {
            let children = node.children();
            let mut offset = base;
            for (ix, child) in children.iter().enumerate() {
                if pos == offset {
                    return Ok(ResolvedPos {
                        pos,
                        path,
                        parent_offset: pos - base,
                        child_index: ix,
                        text_offset: None,
                    });
                }
                let size = child.size();
                if pos < offset + size {
                    match child {
                        Node::Text(_) => {
                            return Ok(ResolvedPos {
                                pos,
                                path,
                                parent_offset: pos - base,
                                child_index: ix,
                                text_offset: Some(pos - offset),
                            });
                        }
                        Node::Element(_) => {
                            path.push(PathEntry {
                                index: ix,
                                start: offset + 1,
                            });
                            node = child;
                            base = offset + 1;
                            continue 'descend;
                        }
                        // Atoms have size 1, so an interior hit is impossible.
                        Node::Atom(_) => {
                            return Ok(ResolvedPos {
                                pos,
                                path,
                                parent_offset: pos - base,
                                child_index: ix,
                                text_offset: None,
                            });
                        }
                    }
                }
                offset += size;
            }
            return Ok(ResolvedPos {
                pos,
                path,
                parent_offset: pos - base,
                child_index: children.len(),
                text_offset: None,
            });
        }
    }

    /// The node starting exactly at `pos`, if any.
    pub fn node_at(&self, pos: usize) -> Option<&Node> {
        self.resolve(pos).ok().and_then(|r| r.node_after(self))
    }

    pub fn from_json(schema: &Schema, value: &Value) -> Result<Node, ParseError> {
        let obj = value
            .as_object()
            .ok_or_else(|| ParseError::Malformed("node must be an object".to_string()))?;
        let raw_type = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ParseError::Malformed("node is missing `type`".to_string()))?;

        if raw_type == TEXT_KIND {
            let text = obj
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| ParseError::Malformed("text node is missing `text`".to_string()))?;
            let marks = marks_from_json(schema, obj.get("marks"))?;
            return Ok(Node::Text(TextNode {
                text: text.to_string(),
                marks,
            }));
        }

        let kind = schema
            .resolve_node_name(raw_type)
            .ok_or_else(|| ParseError::UnknownNodeType(raw_type.to_string()))?
            .to_string();
        let node_type = match schema.node_type(&kind) {
            Some(t) => t,
            None => return Err(ParseError::UnknownNodeType(raw_type.to_string())),
        };

        let mut attrs = node_type.spec.attrs.clone();
        if let Some(given) = obj.get("attrs").and_then(Value::as_object) {
            for (key, value) in given {
                attrs.insert(key.clone(), value.clone());
            }
        }

        let marks = marks_from_json(schema, obj.get("marks"))?;
        if !marks.is_empty() && !node_type.spec.inline {
            return Err(ParseError::MarksOnBlock);
        }

        if node_type.is_leaf() {
            return Ok(Node::Atom(AtomNode { kind, attrs, marks }));
        }

        let mut children = Vec::new();
        if let Some(content) = obj.get("content").and_then(Value::as_array) {
            for child in content {
                children.push(Node::from_json(schema, child)?);
            }
        }
        if !node_type.valid_content(&children) {
            return Err(ParseError::InvalidContent { kind });
        }
        Ok(Node::Element(ElementNode {
            kind,
            attrs,
            children,
        }))
    }

    pub fn to_json(&self) -> Value {
        match self {
            Node::Text(t) => {
                let mut obj = serde_json::Map::new();
                obj.insert("type".to_string(), Value::String(TEXT_KIND.to_string()));
                obj.insert("text".to_string(), Value::String(t.text.clone()));
                if !t.marks.is_empty() {
                    obj.insert("marks".to_string(), marks_to_json(&t.marks));
                }
                Value::Object(obj)
            }
            Node::Atom(atom) => {
                let mut obj = serde_json::Map::new();
                obj.insert("type".to_string(), Value::String(atom.kind.clone()));
                if !atom.attrs.is_empty() {
                    obj.insert(
                        "attrs".to_string(),
                        Value::Object(atom.attrs.clone().into_iter().collect()),
                    );
                }
                if !atom.marks.is_empty() {
                    obj.insert("marks".to_string(), marks_to_json(&atom.marks));
                }
                Value::Object(obj)
            }
            Node::Element(el) => {
                let mut obj = serde_json::Map::new();
                obj.insert("type".to_string(), Value::String(el.kind.clone()));
                if !el.attrs.is_empty() {
                    obj.insert(
                        "attrs".to_string(),
                        Value::Object(el.attrs.clone().into_iter().collect()),
                    );
                }
                if !el.children.is_empty() {
                    obj.insert(
                        "content".to_string(),
                        Value::Array(el.children.iter().map(Node::to_json).collect()),
                    );
                }
                Value::Object(obj)
            }
        }
    }
}

fn marks_from_json(schema: &Schema, value: Option<&Value>) -> Result<Vec<Mark>, ParseError> {
    let Some(list) = value.and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    let mut marks = Vec::new();
    for entry in list {
        let obj = entry
            .as_object()
            .ok_or_else(|| ParseError::Malformed("mark must be an object".to_string()))?;
        let raw_type = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ParseError::Malformed("mark is missing `type`".to_string()))?;
        let name = schema
            .resolve_mark_name(raw_type)
            .ok_or_else(|| ParseError::UnknownMarkType(raw_type.to_string()))?
            .to_string();
        let mut attrs = schema
            .mark_type(&name)
            .map(|t| t.spec.attrs.clone())
            .unwrap_or_default();
        if let Some(given) = obj.get("attrs").and_then(Value::as_object) {
            for (key, value) in given {
                attrs.insert(key.clone(), value.clone());
            }
        }
        marks.push(Mark { name, attrs });
    }
    marks.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(marks)
}

fn marks_to_json(marks: &[Mark]) -> Value {
    Value::Array(
        marks
            .iter()
            .map(|mark| {
                let mut obj = serde_json::Map::new();
                obj.insert("type".to_string(), Value::String(mark.name.clone()));
                if !mark.attrs.is_empty() {
                    obj.insert(
                        "attrs".to_string(),
                        Value::Object(mark.attrs.clone().into_iter().collect()),
                    );
                }
                Value::Object(obj)
            })
            .collect(),
    )
}

fn walk_between(
    children: &[Node],
    base: usize,
    from: usize,
    to: usize,
    visitor: &mut impl FnMut(&Node, usize) -> bool,
) {
    let mut pos = base;
    for child in children {
        let size = child.size();
        let end = pos + size;
        if end > from && pos < to {
            let descend = visitor(child, pos);
            if descend {
                if let Node::Element(el) = child {
                    walk_between(&el.children, pos + 1, from, to, visitor);
                }
            }
        }
        if pos >= to {
            break;
        }
        pos = end;
    }
}

#[derive(Debug, Clone, PartialEq)]
struct PathEntry {
    index: usize,
    start: usize,
}

/// A position resolved against one document version: the chain of ancestor
/// containers, the index within each, and the landing point inside the
/// deepest container. Holds no references; accessors take the document.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPos {
    pub pos: usize,
    path: Vec<PathEntry>,
    /// Offset of `pos` within the deepest container's content.
    pub parent_offset: usize,
    /// Index within the deepest container of the child at or after `pos`
    /// (the child containing `pos` when `text_offset` is set).
    child_index: usize,
    /// When `pos` falls strictly inside a text node: the char offset.
    text_offset: Option<usize>,
}

impl ResolvedPos {
    /// Number of ancestor containers below the document root.
    pub fn depth(&self) -> usize {
        self.path.len()
    }

    /// Position where the content of the ancestor at `depth` starts.
    /// `start(0)` is 0 (the document).
    pub fn start(&self, depth: usize) -> usize {
        if depth == 0 {
            0
        } else {
            self.path[depth - 1].start
        }
    }

    /// Position immediately before the ancestor at `depth` (>= 1).
    pub fn before(&self, depth: usize) -> usize {
        self.start(depth) - 1
    }

    /// Child index of the ancestor at `depth` within its parent; at
    /// `depth()` this is the index of the child at or after `pos`.
    pub fn index(&self, depth: usize) -> usize {
        if depth == self.depth() {
            self.child_index
        } else {
            self.path[depth].index
        }
    }

    pub fn child_index(&self) -> usize {
        self.child_index
    }

    pub fn text_offset(&self) -> Option<usize> {
        self.text_offset
    }

    /// The ancestor node at `depth`; `node(doc, 0)` is the document itself.
    pub fn node<'a>(&self, doc: &'a Node, depth: usize) -> &'a Node {
        let mut node = doc;
        for entry in self.path.iter().take(depth) {
            node = &node.children()[entry.index];
        }
        node
    }

    pub fn parent<'a>(&self, doc: &'a Node) -> &'a Node {
        self.node(doc, self.depth())
    }

    /// Node directly after `pos` (the containing text node when inside one).
    pub fn node_after<'a>(&self, doc: &'a Node) -> Option<&'a Node> {
        self.parent(doc).children().get(self.child_index)
    }

    /// Node directly before `pos` (the containing text node when inside one).
    pub fn node_before<'a>(&self, doc: &'a Node) -> Option<&'a Node> {
        if self.text_offset.is_some() {
            return self.node_after(doc);
        }
        if self.child_index == 0 {
            return None;
        }
        self.parent(doc).children().get(self.child_index - 1)
    }

    pub(crate) fn container_path(&self) -> Vec<usize> {
        self.path.iter().map(|entry| entry.index).collect()
    }
}

pub(crate) fn node_mut<'a>(doc: &'a mut Node, path: &[usize]) -> Option<&'a mut Node> {
    let mut node = doc;
    for &ix in path {
        node = match node {
            Node::Element(el) => el.children.get_mut(ix)?,
            _ => return None,
        };
    }
    Some(node)
}

pub(crate) fn children_mut<'a>(doc: &'a mut Node, path: &[usize]) -> Option<&'a mut Vec<Node>> {
    match node_mut(doc, path)? {
        Node::Element(el) => Some(&mut el.children),
        _ => None,
    }
}

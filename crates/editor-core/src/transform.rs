use std::sync::Arc;

use serde_json::Value;

use crate::error::ApplyError;
use crate::node::{
    byte_of_char, char_len, children_mut, node_mut, Attrs, Mark, Node, TextNode,
};
use crate::schema::Schema;

/// Attribute delta applied by [`Step::SetAttrs`]; applying returns the
/// inverse patch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttrPatch {
    pub set: Attrs,
    pub remove: Vec<String>,
}

impl AttrPatch {
    pub fn set_one(name: impl Into<String>, value: Value) -> Self {
        let mut set = Attrs::new();
        set.insert(name.into(), value);
        Self {
            set,
            remove: Vec::new(),
        }
    }

    pub fn apply(&self, attrs: &mut Attrs) -> AttrPatch {
        let mut old_set = Attrs::new();
        let mut old_remove = Vec::new();

        for (key, value) in &self.set {
            if let Some(prev) = attrs.insert(key.clone(), value.clone()) {
                old_set.insert(key.clone(), prev);
            } else {
                old_remove.push(key.clone());
            }
        }
        for key in &self.remove {
            if let Some(prev) = attrs.remove(key) {
                old_set.insert(key.clone(), prev);
            }
        }

        AttrPatch {
            set: old_set,
            remove: old_remove,
        }
    }
}

/// One position-addressed edit. Steps are validated against the document
/// they apply to; a transaction's steps each see the cumulative result of
/// the steps before them.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    InsertText {
        pos: usize,
        text: String,
        marks: Vec<Mark>,
    },
    InsertNodes {
        pos: usize,
        nodes: Vec<Node>,
    },
    Delete {
        from: usize,
        to: usize,
    },
    AddMark {
        from: usize,
        to: usize,
        mark: Mark,
    },
    RemoveMark {
        from: usize,
        to: usize,
        mark: Mark,
    },
    SetAttrs {
        pos: usize,
        patch: AttrPatch,
    },
    /// Retag a block element (paragraph -> heading, ...), replacing its
    /// attrs wholesale. Content must satisfy the new type.
    SetBlockType {
        pos: usize,
        kind: String,
        attrs: Attrs,
    },
}

impl Step {
    /// Translate this step through `mapping`. Returns `None` when the
    /// step's range was entirely deleted.
    pub fn map(&self, mapping: &Mapping) -> Option<Step> {
        match self {
            Step::InsertText { pos, text, marks } => {
                let result = mapping.map_result(*pos, 1);
                if result.deleted {
                    return None;
                }
                Some(Step::InsertText {
                    pos: result.pos,
                    text: text.clone(),
                    marks: marks.clone(),
                })
            }
            Step::InsertNodes { pos, nodes } => {
                let result = mapping.map_result(*pos, 1);
                if result.deleted {
                    return None;
                }
                Some(Step::InsertNodes {
                    pos: result.pos,
                    nodes: nodes.clone(),
                })
            }
            Step::Delete { from, to } => {
                let (from, to) = map_range(mapping, *from, *to)?;
                Some(Step::Delete { from, to })
            }
            Step::AddMark { from, to, mark } => {
                let (from, to) = map_range(mapping, *from, *to)?;
                Some(Step::AddMark {
                    from,
                    to,
                    mark: mark.clone(),
                })
            }
            Step::RemoveMark { from, to, mark } => {
                let (from, to) = map_range(mapping, *from, *to)?;
                Some(Step::RemoveMark {
                    from,
                    to,
                    mark: mark.clone(),
                })
            }
            Step::SetAttrs { pos, patch } => {
                let result = mapping.map_result(*pos, 1);
                if result.deleted {
                    return None;
                }
                Some(Step::SetAttrs {
                    pos: result.pos,
                    patch: patch.clone(),
                })
            }
            Step::SetBlockType { pos, kind, attrs } => {
                let result = mapping.map_result(*pos, 1);
                if result.deleted {
                    return None;
                }
                Some(Step::SetBlockType {
                    pos: result.pos,
                    kind: kind.clone(),
                    attrs: attrs.clone(),
                })
            }
        }
    }
}

fn map_range(mapping: &Mapping, from: usize, to: usize) -> Option<(usize, usize)> {
    let from_result = mapping.map_result(from, 1);
    let to_result = mapping.map_result(to, -1);
    if from_result.deleted && to_result.deleted {
        return None;
    }
    if from_result.pos >= to_result.pos {
        return None;
    }
    Some((from_result.pos, to_result.pos))
}

/// Result of mapping one position: the new position, and whether the
/// position sat inside content removed by the mapped-over steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapResult {
    pub pos: usize,
    pub deleted: bool,
}

/// Positional footprint of one applied step: a list of
/// `(start, old_size, new_size)` replacements in document order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepMap {
    ranges: Vec<(usize, usize, usize)>,
}

impl StepMap {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn insertion(pos: usize, len: usize) -> Self {
        Self {
            ranges: vec![(pos, 0, len)],
        }
    }

    pub fn deletion(from: usize, to: usize) -> Self {
        Self {
            ranges: vec![(from, to - from, 0)],
        }
    }

    pub fn is_identity(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn invert(&self) -> StepMap {
        StepMap {
            ranges: self
                .ranges
                .iter()
                .map(|&(start, old, new)| (start, new, old))
                .collect(),
        }
    }

    pub fn map(&self, pos: usize, bias: i8) -> usize {
        self.map_result(pos, bias).pos
    }

    pub fn map_result(&self, pos: usize, bias: i8) -> MapResult {
        let mut diff = 0isize;
        for &(start, old, new) in &self.ranges {
            if pos < start || (pos == start && bias < 0) {
                break;
            }
            let end = start + old;
            if pos <= end {
                let side = if old == 0 {
                    bias
                } else if pos == start {
                    -1
                } else if pos == end {
                    1
                } else {
                    bias
                };
                let mapped = if side < 0 { start } else { start + new };
                return MapResult {
                    pos: (mapped as isize + diff) as usize,
                    deleted: old > 0 && pos > start && pos < end,
                };
            }
            diff += new as isize - old as isize;
        }
        MapResult {
            pos: (pos as isize + diff) as usize,
            deleted: false,
        }
    }
}

/// An ordered sequence of [`StepMap`]s; the only sanctioned way to carry a
/// position computed against a pre-transaction document forward.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mapping {
    maps: Vec<StepMap>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, map: StepMap) {
        self.maps.push(map);
    }

    pub fn append_mapping(&mut self, other: &Mapping) {
        self.maps.extend(other.maps.iter().cloned());
    }

    pub fn maps(&self) -> &[StepMap] {
        &self.maps
    }

    pub fn map(&self, pos: usize, bias: i8) -> usize {
        self.map_result(pos, bias).pos
    }

    pub fn map_result(&self, pos: usize, bias: i8) -> MapResult {
        let mut pos = pos;
        let mut deleted = false;
        for map in &self.maps {
            let result = map.map_result(pos, bias);
            pos = result.pos;
            deleted = deleted || result.deleted;
        }
        MapResult { pos, deleted }
    }
}

/// Applies steps to a working copy of the document, recording for each the
/// inverse step and position map. Produced by a committed transaction and
/// consumed by selection re-mapping, undo and the tracking extension —
/// recomputing positions independently of the recorded maps is not
/// supported.
#[derive(Debug, Clone)]
pub struct Transform {
    schema: Arc<Schema>,
    before: Node,
    doc: Node,
    steps: Vec<Step>,
    inverses: Vec<Step>,
    mapping: Mapping,
}

impl Transform {
    pub fn new(schema: Arc<Schema>, doc: Node) -> Self {
        Self {
            schema,
            before: doc.clone(),
            doc,
            steps: Vec::new(),
            inverses: Vec::new(),
            mapping: Mapping::new(),
        }
    }

    pub fn doc(&self) -> &Node {
        &self.doc
    }

    pub fn before(&self) -> &Node {
        &self.before
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Inverse steps, in application order. Reverse to revert.
    pub fn inverses(&self) -> &[Step] {
        &self.inverses
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub fn doc_changed(&self) -> bool {
        !self.steps.is_empty()
    }

    pub fn into_doc(self) -> Node {
        self.doc
    }

    /// Validate and apply one step. Atomic: a failing step leaves the
    /// working document untouched, so callers may tolerate individual
    /// failures without corrupting the batch.
    pub fn step(&mut self, step: Step) -> Result<(), ApplyError> {
        let snapshot = self.doc.clone();
        match self.apply_step(&step) {
            Ok((inverse, map)) => {
                self.steps.push(step);
                self.inverses.push(inverse);
                self.mapping.append(map);
                Ok(())
            }
            Err(err) => {
                self.doc = snapshot;
                Err(err)
            }
        }
    }

    fn apply_step(&mut self, step: &Step) -> Result<(Step, StepMap), ApplyError> {
        match step {
            Step::InsertText { pos, text, marks } => self.insert_text(*pos, text, marks),
            Step::InsertNodes { pos, nodes } => self.insert_nodes(*pos, nodes),
            Step::Delete { from, to } => self.delete(*from, *to),
            Step::AddMark { from, to, mark } => self.add_mark(*from, *to, mark),
            Step::RemoveMark { from, to, mark } => self.remove_mark(*from, *to, mark),
            Step::SetAttrs { pos, patch } => self.set_attrs(*pos, patch),
            Step::SetBlockType { pos, kind, attrs } => self.set_block_type(*pos, kind, attrs),
        }
    }

    fn insert_text(
        &mut self,
        pos: usize,
        text: &str,
        marks: &[Mark],
    ) -> Result<(Step, StepMap), ApplyError> {
        if text.is_empty() {
            return Err(ApplyError::InvalidStep("empty text insertion".to_string()));
        }
        for mark in marks {
            if self.schema.mark_type(&mark.name).is_none() {
                return Err(ApplyError::InvalidStep(format!(
                    "unknown mark type `{}`",
                    mark.name
                )));
            }
        }
        let resolved = self.doc.resolve(pos)?;
        let parent_kind = resolved.parent(&self.doc).kind().to_string();
        let is_textblock = self
            .schema
            .node_type(&parent_kind)
            .is_some_and(|t| t.is_textblock());
        if !is_textblock {
            return Err(ApplyError::InvalidStep(format!(
                "text insertion outside a textblock (in `{parent_kind}`)"
            )));
        }

        let len = char_len(text);
        let path = resolved.container_path();
        let child_index = resolved.child_index();
        let text_offset = resolved.text_offset();
        let children = children_mut(&mut self.doc, &path)
            .ok_or_else(|| ApplyError::InvalidStep("unresolvable insertion point".to_string()))?;

        match text_offset {
            Some(offset) => {
                let Some(Node::Text(existing)) = children.get_mut(child_index) else {
                    return Err(ApplyError::InvalidStep(
                        "insertion point does not address text".to_string(),
                    ));
                };
                if existing.marks == marks {
                    let at = byte_of_char(&existing.text, offset);
                    existing.text.insert_str(at, text);
                } else {
                    let at = byte_of_char(&existing.text, offset);
                    let right = existing.text.split_off(at);
                    let right_marks = existing.marks.clone();
                    let pieces = vec![
                        Node::Text(TextNode {
                            text: text.to_string(),
                            marks: marks.to_vec(),
                        }),
                        Node::Text(TextNode {
                            text: right,
                            marks: right_marks,
                        }),
                    ];
                    children.splice(child_index + 1..child_index + 1, pieces);
                }
            }
            None => {
                // At a child boundary: extend the preceding text node when
                // the marks agree, otherwise splice in a fresh node.
                let appended = child_index > 0
                    && matches!(children.get(child_index - 1), Some(Node::Text(prev)) if prev.marks == marks);
                if appended {
                    if let Some(Node::Text(prev)) = children.get_mut(child_index - 1) {
                        prev.text.push_str(text);
                    }
                } else {
                    children.insert(
                        child_index,
                        Node::Text(TextNode {
                            text: text.to_string(),
                            marks: marks.to_vec(),
                        }),
                    );
                }
            }
        }

        Ok((
            Step::Delete {
                from: pos,
                to: pos + len,
            },
            StepMap::insertion(pos, len),
        ))
    }

    fn insert_nodes(&mut self, pos: usize, nodes: &[Node]) -> Result<(Step, StepMap), ApplyError> {
        if nodes.is_empty() {
            return Err(ApplyError::InvalidStep("empty node insertion".to_string()));
        }
        for node in nodes {
            self.validate_subtree(node)?;
        }
        let inline = nodes
            .iter()
            .all(|n| n.is_text() || self.schema.node_type(n.kind()).is_some_and(|t| t.spec.inline));
        let block = nodes
            .iter()
            .all(|n| !n.is_text() && self.schema.node_type(n.kind()).is_some_and(|t| !t.spec.inline));
        if !inline && !block {
            return Err(ApplyError::InvalidStep(
                "insertion mixes inline and block nodes".to_string(),
            ));
        }

        let resolved = self.doc.resolve(pos)?;
        let parent_kind = resolved.parent(&self.doc).kind().to_string();
        let is_textblock = self
            .schema
            .node_type(&parent_kind)
            .is_some_and(|t| t.is_textblock());
        if inline && !is_textblock {
            return Err(ApplyError::InvalidStep(format!(
                "inline insertion outside a textblock (in `{parent_kind}`)"
            )));
        }
        if block && is_textblock {
            return Err(ApplyError::InvalidStep(format!(
                "block insertion inside textblock `{parent_kind}`"
            )));
        }
        if block && resolved.text_offset().is_some() {
            return Err(ApplyError::InvalidStep(
                "block insertion not at a block boundary".to_string(),
            ));
        }

        let size: usize = nodes.iter().map(Node::size).sum();
        let path = resolved.container_path();
        let mut index = resolved.child_index();
        let text_offset = resolved.text_offset();
        let children = children_mut(&mut self.doc, &path)
            .ok_or_else(|| ApplyError::InvalidStep("unresolvable insertion point".to_string()))?;

        if let Some(offset) = text_offset {
            let Some(Node::Text(existing)) = children.get_mut(index) else {
                return Err(ApplyError::InvalidStep(
                    "insertion point does not address text".to_string(),
                ));
            };
            let at = byte_of_char(&existing.text, offset);
            let right = existing.text.split_off(at);
            let right_marks = existing.marks.clone();
            children.insert(
                index + 1,
                Node::Text(TextNode {
                    text: right,
                    marks: right_marks,
                }),
            );
            index += 1;
        }
        children.splice(index..index, nodes.iter().cloned());

        if !self.schema.valid_content(&parent_kind, children) {
            return Err(ApplyError::SchemaViolation { kind: parent_kind });
        }

        Ok((
            Step::Delete {
                from: pos,
                to: pos + size,
            },
            StepMap::insertion(pos, size),
        ))
    }

    fn delete(&mut self, from: usize, to: usize) -> Result<(Step, StepMap), ApplyError> {
        if from >= to {
            return Err(ApplyError::InvalidStep(format!(
                "invalid delete range {from}..{to}"
            )));
        }
        let start = self.doc.resolve(from)?;
        let end = self.doc.resolve(to)?;
        if start.container_path() != end.container_path() {
            return Err(ApplyError::InvalidStep(
                "delete range crosses container boundaries".to_string(),
            ));
        }

        let parent_kind = start.parent(&self.doc).kind().to_string();
        let is_textblock = self
            .schema
            .node_type(&parent_kind)
            .is_some_and(|t| t.is_textblock());

        let path = start.container_path();
        let removed = if is_textblock {
            delete_inline(
                &mut self.doc,
                &path,
                start.child_index(),
                start.text_offset(),
                end.child_index(),
                end.text_offset(),
            )?
        } else {
            if start.text_offset().is_some() || end.text_offset().is_some() {
                return Err(ApplyError::InvalidStep(
                    "block delete range not at block boundaries".to_string(),
                ));
            }
            let children = children_mut(&mut self.doc, &path)
                .ok_or_else(|| ApplyError::InvalidStep("unresolvable delete range".to_string()))?;
            children
                .splice(start.child_index()..end.child_index(), std::iter::empty())
                .collect()
        };

        let children = children_mut(&mut self.doc, &path)
            .ok_or_else(|| ApplyError::InvalidStep("unresolvable delete range".to_string()))?;
        if !self.schema.valid_content(&parent_kind, children) {
            return Err(ApplyError::SchemaViolation { kind: parent_kind });
        }

        Ok((
            Step::InsertNodes {
                pos: from,
                nodes: removed,
            },
            StepMap::deletion(from, to),
        ))
    }

    fn add_mark(&mut self, from: usize, to: usize, mark: &Mark) -> Result<(Step, StepMap), ApplyError> {
        if from > to {
            return Err(ApplyError::InvalidStep(format!(
                "invalid mark range {from}..{to}"
            )));
        }
        if self.schema.mark_type(&mark.name).is_none() {
            return Err(ApplyError::InvalidStep(format!(
                "unknown mark type `{}`",
                mark.name
            )));
        }
        let max = self.doc.content_size();
        if to > max {
            return Err(ApplyError::OutOfRange(crate::error::OutOfRangeError {
                pos: to,
                max,
            }));
        }
        let schema = Arc::clone(&self.schema);
        mark_inline_range(&schema, &mut self.doc, 0, from, to, &mut |marks| {
            schema.add_mark_to_set(marks, mark.clone());
        });
        Ok((
            Step::RemoveMark {
                from,
                to,
                mark: mark.clone(),
            },
            StepMap::empty(),
        ))
    }

    fn remove_mark(
        &mut self,
        from: usize,
        to: usize,
        mark: &Mark,
    ) -> Result<(Step, StepMap), ApplyError> {
        if from > to {
            return Err(ApplyError::InvalidStep(format!(
                "invalid mark range {from}..{to}"
            )));
        }
        let max = self.doc.content_size();
        if to > max {
            return Err(ApplyError::OutOfRange(crate::error::OutOfRangeError {
                pos: to,
                max,
            }));
        }
        let schema = Arc::clone(&self.schema);
        mark_inline_range(&schema, &mut self.doc, 0, from, to, &mut |marks| {
            marks.retain(|m| !(m.name == mark.name && m.attrs == mark.attrs));
        });
        Ok((
            Step::AddMark {
                from,
                to,
                mark: mark.clone(),
            },
            StepMap::empty(),
        ))
    }

    fn set_attrs(&mut self, pos: usize, patch: &AttrPatch) -> Result<(Step, StepMap), ApplyError> {
        let resolved = self.doc.resolve(pos)?;
        if resolved.text_offset().is_some() {
            return Err(ApplyError::InvalidStep(
                "attrs target must be a node boundary".to_string(),
            ));
        }
        let mut path = resolved.container_path();
        path.push(resolved.child_index());
        let node = node_mut(&mut self.doc, &path)
            .ok_or_else(|| ApplyError::InvalidStep(format!("no node at position {pos}")))?;
        let old = match node {
            Node::Element(el) => patch.apply(&mut el.attrs),
            Node::Atom(atom) => patch.apply(&mut atom.attrs),
            Node::Text(_) => {
                return Err(ApplyError::InvalidStep(
                    "text nodes have no attrs".to_string(),
                ));
            }
        };
        Ok((Step::SetAttrs { pos, patch: old }, StepMap::empty()))
    }

    fn set_block_type(
        &mut self,
        pos: usize,
        kind: &str,
        attrs: &Attrs,
    ) -> Result<(Step, StepMap), ApplyError> {
        let new_type = self.schema.node_type(kind).ok_or_else(|| {
            ApplyError::InvalidStep(format!("unknown node type `{kind}`"))
        })?;
        if new_type.spec.inline || new_type.is_leaf() {
            return Err(ApplyError::InvalidStep(format!(
                "`{kind}` is not a block container"
            )));
        }

        let resolved = self.doc.resolve(pos)?;
        if resolved.text_offset().is_some() {
            return Err(ApplyError::InvalidStep(
                "block type target must be a node boundary".to_string(),
            ));
        }
        let parent_kind = resolved.parent(&self.doc).kind().to_string();
        let mut path = resolved.container_path();
        path.push(resolved.child_index());

        {
            let node = node_mut(&mut self.doc, &path)
                .ok_or_else(|| ApplyError::InvalidStep(format!("no node at position {pos}")))?;
            let Node::Element(el) = node else {
                return Err(ApplyError::InvalidStep(
                    "block type target is not an element".to_string(),
                ));
            };
            if !new_type.valid_content(&el.children) {
                return Err(ApplyError::SchemaViolation {
                    kind: kind.to_string(),
                });
            }
            let old_kind = el.kind.clone();
            let old_attrs = el.attrs.clone();
            el.kind = kind.to_string();
            el.attrs = attrs.clone();

            let inverse = Step::SetBlockType {
                pos,
                kind: old_kind,
                attrs: old_attrs,
            };

            // Parent must still accept the retagged child.
            let parent_path = resolved.container_path();
            let children = children_mut(&mut self.doc, &parent_path).ok_or_else(|| {
                ApplyError::InvalidStep("unresolvable block type target".to_string())
            })?;
            if !self.schema.valid_content(&parent_kind, children) {
                return Err(ApplyError::SchemaViolation { kind: parent_kind });
            }
            Ok((inverse, StepMap::empty()))
        }
    }

    fn validate_subtree(&self, node: &Node) -> Result<(), ApplyError> {
        match node {
            Node::Text(t) => {
                for mark in &t.marks {
                    if self.schema.mark_type(&mark.name).is_none() {
                        return Err(ApplyError::InvalidStep(format!(
                            "unknown mark type `{}`",
                            mark.name
                        )));
                    }
                }
                Ok(())
            }
            Node::Atom(atom) => {
                if self.schema.node_type(&atom.kind).is_none() {
                    return Err(ApplyError::InvalidStep(format!(
                        "unknown node type `{}`",
                        atom.kind
                    )));
                }
                Ok(())
            }
            Node::Element(el) => {
                if self.schema.node_type(&el.kind).is_none() {
                    return Err(ApplyError::InvalidStep(format!(
                        "unknown node type `{}`",
                        el.kind
                    )));
                }
                if !self.schema.valid_content(&el.kind, &el.children) {
                    return Err(ApplyError::SchemaViolation {
                        kind: el.kind.clone(),
                    });
                }
                for child in &el.children {
                    self.validate_subtree(child)?;
                }
                Ok(())
            }
        }
    }
}

/// Remove the inline range `(start_index, start_offset)..(end_index,
/// end_offset)` from the textblock at `path`, returning the removed pieces
/// (exact text-with-marks restoration for the inverse step).
fn delete_inline(
    doc: &mut Node,
    path: &[usize],
    start_index: usize,
    start_offset: Option<usize>,
    end_index: usize,
    end_offset: Option<usize>,
) -> Result<Vec<Node>, ApplyError> {
    let children = children_mut(doc, path)
        .ok_or_else(|| ApplyError::InvalidStep("unresolvable delete range".to_string()))?;

    let mut removed: Vec<Node> = Vec::new();

    if start_index == end_index {
        // Range falls inside a single text node.
        let Some(Node::Text(node)) = children.get_mut(start_index) else {
            return Err(ApplyError::InvalidStep(
                "delete range does not address content".to_string(),
            ));
        };
        let from = start_offset.unwrap_or(0);
        let to = end_offset.unwrap_or(from);
        let from_b = byte_of_char(&node.text, from);
        let to_b = byte_of_char(&node.text, to);
        removed.push(Node::Text(TextNode {
            text: node.text[from_b..to_b].to_string(),
            marks: node.marks.clone(),
        }));
        node.text.replace_range(from_b..to_b, "");
        if node.text.is_empty() {
            children.remove(start_index);
        }
        return Ok(removed);
    }

    // Splitting the edge nodes keeps them in place (the covered piece is
    // captured, not spliced in), so child indices stay stable throughout.
    let mut head_piece: Option<Node> = None;
    let mut drop_from = start_index;
    if let Some(offset) = start_offset {
        let Some(Node::Text(node)) = children.get_mut(start_index) else {
            return Err(ApplyError::InvalidStep(
                "delete range does not address content".to_string(),
            ));
        };
        let at = byte_of_char(&node.text, offset);
        let tail = node.text.split_off(at);
        head_piece = Some(Node::Text(TextNode {
            text: tail,
            marks: node.marks.clone(),
        }));
        drop_from = start_index + 1;
    }

    let drop_to = end_index;
    let mut tail_piece: Option<Node> = None;
    if let Some(offset) = end_offset {
        let Some(Node::Text(node)) = children.get_mut(end_index) else {
            return Err(ApplyError::InvalidStep(
                "delete range does not address content".to_string(),
            ));
        };
        let at = byte_of_char(&node.text, offset);
        let head = node.text[..at].to_string();
        node.text.replace_range(..at, "");
        tail_piece = Some(Node::Text(TextNode {
            text: head,
            marks: node.marks.clone(),
        }));
    }

    let middle: Vec<Node> = children
        .splice(drop_from..drop_to, std::iter::empty())
        .collect();
    removed.extend(head_piece);
    removed.extend(middle);
    removed.extend(tail_piece);
    Ok(removed)
}

/// Apply `f` to the mark set of every inline node intersecting `from..to`,
/// splitting partially covered text nodes at the range edges.
fn mark_inline_range(
    schema: &Schema,
    node: &mut Node,
    base: usize,
    from: usize,
    to: usize,
    f: &mut impl FnMut(&mut Vec<Mark>),
) {
    let Node::Element(el) = node else {
        return;
    };
    let mut pos = base;
    let mut ix = 0;
    while ix < el.children.len() {
        let size = el.children[ix].size();
        let end = pos + size;
        if end > from && pos < to {
            match &mut el.children[ix] {
                Node::Text(text_node) => {
                    let len = char_len(&text_node.text);
                    let cover_from = from.saturating_sub(pos).min(len);
                    let cover_to = (to.saturating_sub(pos)).min(len);
                    if cover_from == 0 && cover_to == len {
                        f(&mut text_node.marks);
                    } else if cover_from < cover_to {
                        let marks = text_node.marks.clone();
                        let from_b = byte_of_char(&text_node.text, cover_from);
                        let to_b = byte_of_char(&text_node.text, cover_to);
                        let mid_text = text_node.text[from_b..to_b].to_string();
                        let tail_text = text_node.text[to_b..].to_string();
                        text_node.text.truncate(from_b);

                        let mut mid_marks = marks.clone();
                        f(&mut mid_marks);
                        let mut pieces = Vec::new();
                        if !mid_text.is_empty() {
                            pieces.push(Node::Text(TextNode {
                                text: mid_text,
                                marks: mid_marks,
                            }));
                        }
                        if !tail_text.is_empty() {
                            pieces.push(Node::Text(TextNode {
                                text: tail_text,
                                marks,
                            }));
                        }
                        let empty_head = text_node.text.is_empty();
                        let insert_at = if empty_head { ix } else { ix + 1 };
                        if empty_head {
                            el.children.remove(ix);
                        }
                        let added = pieces.len();
                        el.children.splice(insert_at..insert_at, pieces);
                        ix = insert_at + added;
                        pos = end;
                        continue;
                    }
                }
                Node::Atom(atom) => {
                    let inline = schema
                        .node_type(&atom.kind)
                        .is_some_and(|t| t.spec.inline);
                    if inline && pos >= from && end <= to {
                        f(&mut atom.marks);
                    }
                }
                child @ Node::Element(_) => {
                    mark_inline_range(schema, child, pos + 1, from, to, f);
                }
            }
        }
        pos = end;
        ix += 1;
    }
}

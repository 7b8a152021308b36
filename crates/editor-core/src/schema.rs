use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::error::SchemaError;
use crate::node::{Attrs, Mark, Node};

/// Declaration of one node type. Compiled into a [`Schema`] once per editor
/// instance; the content expression is resolved at registration time so tree
/// validation is O(children) per node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub name: String,
    pub groups: Vec<String>,
    /// Content expression over node names and group names. Supports
    /// sequences, alternation (`|`), grouping and the `*`, `+`, `?`
    /// repetition operators, e.g. `"block+"` or `"disclosure_summary block+"`.
    /// `None` declares a leaf.
    pub content: Option<String>,
    pub inline: bool,
    pub atom: bool,
    pub draggable: bool,
    pub selectable: bool,
    /// Attribute defaults, filled in for attributes absent from parsed JSON.
    pub attrs: Attrs,
    /// Legacy type names still accepted by `Node::from_json`.
    pub aliases: Vec<String>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            groups: Vec::new(),
            content: None,
            inline: false,
            atom: false,
            draggable: false,
            selectable: false,
            attrs: Attrs::new(),
            aliases: Vec::new(),
        }
    }

    pub fn content(mut self, expr: impl Into<String>) -> Self {
        self.content = Some(expr.into());
        self
    }

    pub fn groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn inline(mut self) -> Self {
        self.inline = true;
        self
    }

    pub fn atom(mut self) -> Self {
        self.atom = true;
        self
    }

    pub fn draggable(mut self) -> Self {
        self.draggable = true;
        self
    }

    pub fn selectable(mut self) -> Self {
        self.selectable = true;
        self
    }

    pub fn attr(mut self, name: impl Into<String>, default: Value) -> Self {
        self.attrs.insert(name.into(), default);
        self
    }

    pub fn aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }
}

/// Declaration of one mark type.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkSpec {
    pub name: String,
    pub groups: Vec<String>,
    /// Space-separated mark names/groups this mark cannot coexist with.
    /// `None` excludes only the mark's own type (adding replaces), `"_"`
    /// excludes everything, `""` excludes nothing (same-type marks with
    /// different attrs may stack, used by the reference marks).
    pub excludes: Option<String>,
    /// Whether typing at the end of the marked range extends it.
    pub inclusive: bool,
    pub attrs: Attrs,
    pub aliases: Vec<String>,
}

impl MarkSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            groups: Vec::new(),
            excludes: None,
            inclusive: true,
            attrs: Attrs::new(),
            aliases: Vec::new(),
        }
    }

    pub fn groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn excludes(mut self, excludes: impl Into<String>) -> Self {
        self.excludes = Some(excludes.into());
        self
    }

    pub fn not_inclusive(mut self) -> Self {
        self.inclusive = false;
        self
    }

    pub fn attr(mut self, name: impl Into<String>, default: Value) -> Self {
        self.attrs.insert(name.into(), default);
        self
    }

    pub fn aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone)]
pub struct NodeType {
    pub spec: NodeSpec,
    matcher: Option<ContentMatcher>,
}

impl NodeType {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Block node whose content is inline (text and inline atoms).
    pub fn is_textblock(&self) -> bool {
        !self.spec.inline
            && self
                .matcher
                .as_ref()
                .is_some_and(|m| m.inline_content)
    }

    pub fn is_leaf(&self) -> bool {
        self.spec.content.is_none()
    }

    pub fn valid_content(&self, children: &[Node]) -> bool {
        match &self.matcher {
            Some(matcher) => matcher.matches(children.iter().map(Node::kind)),
            None => children.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarkType {
    pub spec: MarkSpec,
    excluded: BTreeSet<String>,
    excludes_all: bool,
}

impl MarkType {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn excludes(&self, other: &str) -> bool {
        self.excludes_all || self.excluded.contains(other)
    }
}

/// Immutable registry of every node and mark type valid for one editor
/// instance. Built once from extension declarations; duplicate names are
/// rejected at compile time.
#[derive(Debug, Clone)]
pub struct Schema {
    nodes: BTreeMap<String, NodeType>,
    marks: BTreeMap<String, MarkType>,
    node_aliases: BTreeMap<String, String>,
    mark_aliases: BTreeMap<String, String>,
}

pub const TEXT_KIND: &str = "text";

impl Schema {
    pub fn compile(
        mut node_specs: Vec<NodeSpec>,
        mark_specs: Vec<MarkSpec>,
    ) -> Result<Self, SchemaError> {
        if !node_specs.iter().any(|s| s.name == TEXT_KIND) {
            node_specs.push(NodeSpec::new(TEXT_KIND).groups(["inline"]).inline());
        }

        let mut names: BTreeSet<String> = BTreeSet::new();
        let mut node_aliases = BTreeMap::new();
        for spec in &node_specs {
            if !names.insert(spec.name.clone()) {
                return Err(SchemaError::DuplicateNode(spec.name.clone()));
            }
            for alias in &spec.aliases {
                if node_aliases
                    .insert(alias.clone(), spec.name.clone())
                    .is_some()
                {
                    return Err(SchemaError::DuplicateNode(alias.clone()));
                }
            }
        }
        for alias in node_aliases.keys() {
            if names.contains(alias) {
                return Err(SchemaError::DuplicateNode(alias.clone()));
            }
        }

        // A name in a content expression is either a node type or a group.
        let mut group_members: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for spec in &node_specs {
            for group in &spec.groups {
                group_members
                    .entry(group.clone())
                    .or_default()
                    .insert(spec.name.clone());
            }
        }

        let inline_kinds: BTreeSet<String> = node_specs
            .iter()
            .filter(|s| s.inline)
            .map(|s| s.name.clone())
            .collect();

        let mut nodes = BTreeMap::new();
        for spec in node_specs {
            let matcher = match &spec.content {
                Some(expr) => Some(ContentMatcher::compile(expr, |name| {
                    if names.contains(name) {
                        let mut set = BTreeSet::new();
                        set.insert(name.to_string());
                        Some(set)
                    } else {
                        group_members.get(name).cloned()
                    }
                })?
                .with_inline_flag(&inline_kinds)),
                None => None,
            };
            nodes.insert(spec.name.clone(), NodeType { spec, matcher });
        }

        let mut mark_names: BTreeSet<String> = BTreeSet::new();
        let mut mark_groups: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut mark_aliases = BTreeMap::new();
        for spec in &mark_specs {
            if !mark_names.insert(spec.name.clone()) {
                return Err(SchemaError::DuplicateMark(spec.name.clone()));
            }
            for group in &spec.groups {
                mark_groups
                    .entry(group.clone())
                    .or_default()
                    .insert(spec.name.clone());
            }
            for alias in &spec.aliases {
                if mark_aliases
                    .insert(alias.clone(), spec.name.clone())
                    .is_some()
                {
                    return Err(SchemaError::DuplicateMark(alias.clone()));
                }
            }
        }

        let mut marks = BTreeMap::new();
        for spec in mark_specs {
            let mut excluded = BTreeSet::new();
            let mut excludes_all = false;
            match spec.excludes.as_deref() {
                None => {
                    excluded.insert(spec.name.clone());
                }
                Some("_") => excludes_all = true,
                Some(list) => {
                    for token in list.split_whitespace() {
                        if let Some(members) = mark_groups.get(token) {
                            excluded.extend(members.iter().cloned());
                        } else {
                            excluded.insert(token.to_string());
                        }
                    }
                }
            }
            marks.insert(
                spec.name.clone(),
                MarkType {
                    spec,
                    excluded,
                    excludes_all,
                },
            );
        }

        Ok(Self {
            nodes,
            marks,
            node_aliases,
            mark_aliases,
        })
    }

    pub fn node_type(&self, name: &str) -> Option<&NodeType> {
        self.nodes.get(name)
    }

    pub fn mark_type(&self, name: &str) -> Option<&MarkType> {
        self.marks.get(name)
    }

    /// Canonical node type name for `name`, following legacy aliases.
    pub fn resolve_node_name<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        if self.nodes.contains_key(name) {
            Some(name)
        } else {
            self.node_aliases.get(name).map(String::as_str)
        }
    }

    pub fn resolve_mark_name<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        if self.marks.contains_key(name) {
            Some(name)
        } else {
            self.mark_aliases.get(name).map(String::as_str)
        }
    }

    pub fn node_types(&self) -> impl Iterator<Item = &NodeType> {
        self.nodes.values()
    }

    pub fn in_group(&self, kind: &str, group: &str) -> bool {
        self.nodes
            .get(kind)
            .is_some_and(|t| t.spec.groups.iter().any(|g| g == group))
    }

    pub fn valid_content(&self, kind: &str, children: &[Node]) -> bool {
        match self.nodes.get(kind) {
            Some(node_type) => node_type.valid_content(children),
            None => false,
        }
    }

    /// Add `mark` to a mark set, honoring exclusivity in both directions:
    /// marks the new one excludes are dropped, and if a surviving mark
    /// excludes the new one it is not added.
    pub fn add_mark_to_set(&self, marks: &mut Vec<Mark>, mark: Mark) {
        let Some(adding) = self.marks.get(&mark.name) else {
            return;
        };
        marks.retain(|existing| {
            if existing.name == mark.name && existing.attrs == mark.attrs {
                return true;
            }
            !adding.excludes(&existing.name)
        });
        if marks
            .iter()
            .any(|existing| existing.name == mark.name && existing.attrs == mark.attrs)
        {
            return;
        }
        if marks.iter().any(|existing| {
            self.marks
                .get(&existing.name)
                .is_some_and(|t| t.excludes(&mark.name))
        }) {
            return;
        }
        marks.push(mark);
        marks.sort_by(|a, b| a.name.cmp(&b.name));
    }
}

/// A content expression compiled into an epsilon-NFA. Matching simulates
/// state sets over the child kind sequence: O(children x states).
#[derive(Debug, Clone)]
struct ContentMatcher {
    syms: Vec<BTreeSet<String>>,
    edges: Vec<Vec<(Option<usize>, usize)>>,
    start: usize,
    accept: usize,
    inline_content: bool,
}

impl ContentMatcher {
    fn compile(
        expr: &str,
        resolve: impl Fn(&str) -> Option<BTreeSet<String>>,
    ) -> Result<Self, SchemaError> {
        let parsed = parse_expr(expr)?;
        let mut matcher = Self {
            syms: Vec::new(),
            edges: vec![Vec::new()],
            start: 0,
            accept: 0,
            inline_content: false,
        };
        let mut resolved: Vec<BTreeSet<String>> = Vec::new();
        collect_names(&parsed, &mut |name| {
            match resolve(name) {
                Some(set) => {
                    resolved.push(set);
                    Ok(())
                }
                None => Err(SchemaError::UnknownContentRef {
                    expr: expr.to_string(),
                    name: name.to_string(),
                }),
            }
        })?;
        let mut sym_ix = 0;
        matcher.syms = resolved;
        matcher.accept = matcher.build(&parsed, matcher.start, &mut sym_ix);
        Ok(matcher)
    }

    fn with_inline_flag(mut self, inline_kinds: &BTreeSet<String>) -> Self {
        self.inline_content = self
            .syms
            .iter()
            .any(|set| set.iter().any(|kind| inline_kinds.contains(kind)));
        self
    }

    fn new_state(&mut self) -> usize {
        self.edges.push(Vec::new());
        self.edges.len() - 1
    }

    fn build(&mut self, expr: &Expr, from: usize, sym_ix: &mut usize) -> usize {
        match expr {
            Expr::Name(_) => {
                let sym = *sym_ix;
                *sym_ix += 1;
                let to = self.new_state();
                self.edges[from].push((Some(sym), to));
                to
            }
            Expr::Seq(parts) => {
                let mut cur = from;
                for part in parts {
                    cur = self.build(part, cur, sym_ix);
                }
                cur
            }
            Expr::Choice(branches) => {
                let to = self.new_state();
                for branch in branches {
                    let end = self.build(branch, from, sym_ix);
                    self.edges[end].push((None, to));
                }
                to
            }
            Expr::Star(inner) => {
                let hub = self.new_state();
                self.edges[from].push((None, hub));
                let end = self.build(inner, hub, sym_ix);
                self.edges[end].push((None, hub));
                hub
            }
            Expr::Plus(inner) => {
                let hub = self.new_state();
                self.edges[from].push((None, hub));
                let end = self.build(inner, hub, sym_ix);
                self.edges[end].push((None, hub));
                end
            }
            Expr::Opt(inner) => {
                let end = self.build(inner, from, sym_ix);
                self.edges[from].push((None, end));
                end
            }
        }
    }

    fn matches<'a>(&self, kinds: impl Iterator<Item = &'a str>) -> bool {
        let mut current = self.closure(vec![self.start]);
        for kind in kinds {
            let mut next = Vec::new();
            for &state in &current {
                for &(sym, to) in &self.edges[state] {
                    if let Some(sym) = sym {
                        if self.syms[sym].contains(kind) && !next.contains(&to) {
                            next.push(to);
                        }
                    }
                }
            }
            if next.is_empty() {
                return false;
            }
            current = self.closure(next);
        }
        current.contains(&self.accept)
    }

    fn closure(&self, mut states: Vec<usize>) -> Vec<usize> {
        let mut ix = 0;
        while ix < states.len() {
            let state = states[ix];
            ix += 1;
            for &(sym, to) in &self.edges[state] {
                if sym.is_none() && !states.contains(&to) {
                    states.push(to);
                }
            }
        }
        states
    }
}

#[derive(Debug)]
enum Expr {
    Name(String),
    Seq(Vec<Expr>),
    Choice(Vec<Expr>),
    Star(Box<Expr>),
    Plus(Box<Expr>),
    Opt(Box<Expr>),
}

fn collect_names(
    expr: &Expr,
    visit: &mut impl FnMut(&str) -> Result<(), SchemaError>,
) -> Result<(), SchemaError> {
    match expr {
        Expr::Name(name) => visit(name),
        Expr::Seq(parts) | Expr::Choice(parts) => {
            for part in parts {
                collect_names(part, visit)?;
            }
            Ok(())
        }
        Expr::Star(inner) | Expr::Plus(inner) | Expr::Opt(inner) => collect_names(inner, visit),
    }
}

fn parse_expr(expr: &str) -> Result<Expr, SchemaError> {
    let mut tokens = tokenize(expr)?;
    tokens.reverse();
    let parsed = parse_choice(expr, &mut tokens)?;
    if !tokens.is_empty() {
        return Err(SchemaError::MalformedContentExpr {
            expr: expr.to_string(),
            reason: "trailing tokens".to_string(),
        });
    }
    Ok(parsed)
}

#[derive(Debug, PartialEq)]
enum Token {
    Name(String),
    Pipe,
    Open,
    Close,
    Star,
    Plus,
    Question,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, SchemaError> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '|' => {
                chars.next();
                tokens.push(Token::Pipe);
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '?' => {
                chars.next();
                tokens.push(Token::Question);
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Name(name));
            }
            other => {
                return Err(SchemaError::MalformedContentExpr {
                    expr: expr.to_string(),
                    reason: format!("unexpected character `{other}`"),
                });
            }
        }
    }
    Ok(tokens)
}

fn parse_choice(expr: &str, tokens: &mut Vec<Token>) -> Result<Expr, SchemaError> {
    let mut branches = vec![parse_seq(expr, tokens)?];
    while tokens.last() == Some(&Token::Pipe) {
        tokens.pop();
        branches.push(parse_seq(expr, tokens)?);
    }
    if branches.len() == 1 {
        Ok(branches.pop().unwrap_or(Expr::Seq(Vec::new())))
    } else {
        Ok(Expr::Choice(branches))
    }
}

fn parse_seq(expr: &str, tokens: &mut Vec<Token>) -> Result<Expr, SchemaError> {
    let mut parts = Vec::new();
    loop {
        match tokens.last() {
            Some(Token::Name(_)) | Some(Token::Open) => parts.push(parse_factor(expr, tokens)?),
            _ => break,
        }
    }
    if parts.len() == 1 {
        Ok(parts.pop().unwrap_or(Expr::Seq(Vec::new())))
    } else {
        Ok(Expr::Seq(parts))
    }
}

fn parse_factor(expr: &str, tokens: &mut Vec<Token>) -> Result<Expr, SchemaError> {
    let atom = match tokens.pop() {
        Some(Token::Name(name)) => Expr::Name(name),
        Some(Token::Open) => {
            let inner = parse_choice(expr, tokens)?;
            if tokens.pop() != Some(Token::Close) {
                return Err(SchemaError::MalformedContentExpr {
                    expr: expr.to_string(),
                    reason: "unclosed group".to_string(),
                });
            }
            inner
        }
        other => {
            return Err(SchemaError::MalformedContentExpr {
                expr: expr.to_string(),
                reason: format!("unexpected token {other:?}"),
            });
        }
    };
    Ok(match tokens.last() {
        Some(Token::Star) => {
            tokens.pop();
            Expr::Star(Box::new(atom))
        }
        Some(Token::Plus) => {
            tokens.pop();
            Expr::Plus(Box::new(atom))
        }
        Some(Token::Question) => {
            tokens.pop();
            Expr::Opt(Box::new(atom))
        }
        _ => atom,
    })
}

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{CommandError, ExtensionError, QueryError, SchemaError};
use crate::node::{Attrs, Node};
use crate::schema::{MarkSpec, NodeSpec, Schema};
use crate::state::{Editor, EditorContext, EditorState, Transaction};
use crate::transform::{Mapping, Step};

/// Ephemeral, position-keyed visual annotation derived from editor state.
/// Never serialized into the document; recomputed per host cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoration {
    pub from: usize,
    pub to: usize,
    pub kind: DecorationKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecorationKind {
    /// Styling attrs over an inline range.
    Inline { attrs: Attrs },
    /// Zero-width insertion point for UI chrome (badges, handles).
    Widget { name: String, attrs: Attrs },
    /// Attrs attached to the node starting at `from`.
    Node { attrs: Attrs },
}

impl Decoration {
    pub fn inline(from: usize, to: usize, attrs: Attrs) -> Self {
        Self {
            from,
            to,
            kind: DecorationKind::Inline { attrs },
        }
    }

    pub fn widget(pos: usize, name: impl Into<String>, attrs: Attrs) -> Self {
        Self {
            from: pos,
            to: pos,
            kind: DecorationKind::Widget {
                name: name.into(),
                attrs,
            },
        }
    }

    pub fn node(from: usize, to: usize, attrs: Attrs) -> Self {
        Self {
            from,
            to,
            kind: DecorationKind::Node { attrs },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecorationSet {
    decorations: Vec<Decoration>,
}

impl DecorationSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(mut decorations: Vec<Decoration>) -> Self {
        decorations.sort_by(|a, b| a.from.cmp(&b.from).then(a.to.cmp(&b.to)));
        Self { decorations }
    }

    pub fn add(&mut self, decoration: Decoration) {
        let at = self
            .decorations
            .partition_point(|d| (d.from, d.to) <= (decoration.from, decoration.to));
        self.decorations.insert(at, decoration);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Decoration> {
        self.decorations.iter()
    }

    pub fn len(&self) -> usize {
        self.decorations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decorations.is_empty()
    }

    pub fn into_vec(self) -> Vec<Decoration> {
        self.decorations
    }

    /// Carry decorations across a transaction; decorations whose range was
    /// deleted are dropped.
    pub fn map(self, mapping: &Mapping) -> Self {
        let mut mapped = Vec::new();
        for deco in self.decorations {
            let from = mapping.map_result(deco.from, 1);
            let to = mapping.map_result(deco.to, -1);
            if from.deleted && to.deleted {
                continue;
            }
            let (from, to) = (from.pos, to.pos.max(from.pos));
            mapped.push(Decoration {
                from,
                to,
                kind: deco.kind,
            });
        }
        Self::new(mapped)
    }
}

/// Keyboard key as delivered by the embedder. The engine never touches the
/// DOM; the embedder translates real input events into these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Enter,
    Backspace,
    Delete,
    Escape,
    Tab,
    ArrowUp,
    ArrowDown,
    ArrowLeft,
    ArrowRight,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DropPayload {
    /// A row being dragged by its handle, identified by its range in the
    /// document the drag started from.
    Row { from: usize, to: usize },
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    KeyDown(Key),
    Click { pos: usize, on_row_handle: bool },
    Paste {
        text: Option<String>,
        content: Option<Value>,
    },
    Drop { pos: usize, payload: DropPayload },
}

/// Returned by an event interceptor that consumed the event. The chain
/// stops at the first handler; a transaction, if any, is dispatched by the
/// editor.
#[derive(Debug, Clone, Default)]
pub struct Handled {
    pub transaction: Option<Transaction>,
}

impl Handled {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with(transaction: Transaction) -> Self {
        Self {
            transaction: Some(transaction),
        }
    }
}

pub trait NormalizePass: Send + Sync {
    fn id(&self) -> &'static str;
    fn run(&self, doc: &Node, schema: &Schema) -> Vec<Step>;
}

#[derive(Clone)]
pub struct CommandSpec {
    pub id: String,
    pub label: String,
    pub description: Option<String>,
    pub keywords: Vec<String>,
    pub hidden: bool,
    pub handler:
        Arc<dyn Fn(&mut Editor, Option<Value>) -> Result<(), CommandError> + Send + Sync>,
}

impl CommandSpec {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        handler: impl Fn(&mut Editor, Option<Value>) -> Result<(), CommandError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            description: None,
            keywords: Vec::new(),
            hidden: false,
            handler: Arc::new(handler),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }
}

#[derive(Clone)]
pub struct QuerySpec {
    pub id: String,
    pub handler: Arc<dyn Fn(&Editor, Option<Value>) -> Result<Value, QueryError> + Send + Sync>,
}

impl QuerySpec {
    pub fn new(
        id: impl Into<String>,
        handler: impl Fn(&Editor, Option<Value>) -> Result<Value, QueryError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            handler: Arc::new(handler),
        }
    }
}

/// One independently authored extension. A closed capability set: schema
/// contributions, keyed derived state, decorations, event interception,
/// transaction rewriting, normalize passes, commands and queries.
///
/// Registration order is a contract: event interceptors run in order and
/// the first `Handled` stops the chain; state reducers all run, in order,
/// so later extensions may read earlier extensions' fresh state.
pub trait Extension: Send + Sync {
    fn id(&self) -> &'static str;

    fn node_specs(&self) -> Vec<NodeSpec> {
        Vec::new()
    }

    fn mark_specs(&self) -> Vec<MarkSpec> {
        Vec::new()
    }

    /// Key under which this extension keeps derived state; `None` opts out
    /// of the reducer cycle.
    fn state_key(&self) -> Option<&'static str> {
        None
    }

    fn init_state(&self, _doc: &Node, _cx: &EditorContext) -> Value {
        Value::Null
    }

    /// Reducer run after every committed transaction. A failure degrades
    /// only this extension's state (logged, previous value kept) — the
    /// document itself was already committed by the transform engine.
    #[allow(clippy::too_many_arguments)]
    fn apply_state(
        &self,
        _tx: &Transaction,
        _mapping: &Mapping,
        value: Value,
        _old: &EditorState,
        _new: &EditorState,
        _cx: &EditorContext,
    ) -> Result<Value, ExtensionError> {
        Ok(value)
    }

    fn decorations(
        &self,
        _state: &EditorState,
        _cx: &EditorContext,
    ) -> Result<DecorationSet, ExtensionError> {
        Ok(DecorationSet::empty())
    }

    fn handle_event(
        &self,
        _state: &EditorState,
        _event: &InputEvent,
        _cx: &EditorContext,
    ) -> Option<Handled> {
        None
    }

    /// Rewrite a transaction before it reaches the transform engine
    /// (tracking lives here). Returning `None` keeps the transaction as-is.
    fn transform_transaction(
        &self,
        _tx: &Transaction,
        _state: &EditorState,
        _cx: &EditorContext,
    ) -> Option<Transaction> {
        None
    }

    fn normalize_passes(&self) -> Vec<Box<dyn NormalizePass>> {
        Vec::new()
    }

    fn commands(&self) -> Vec<CommandSpec> {
        Vec::new()
    }

    fn queries(&self) -> Vec<QuerySpec> {
        Vec::new()
    }
}

/// Ordered composition of extensions plus the schema compiled from their
/// declarations. Duplicate node/mark/command/query identifiers are rejected
/// at construction.
pub struct ExtensionRegistry {
    extensions: Vec<Box<dyn Extension>>,
    commands: HashMap<String, CommandSpec>,
    queries: HashMap<String, QuerySpec>,
    normalize_passes: Vec<Box<dyn NormalizePass>>,
    schema: Arc<Schema>,
}

impl ExtensionRegistry {
    pub fn new(extensions: Vec<Box<dyn Extension>>) -> Result<Self, SchemaError> {
        let mut node_specs = Vec::new();
        let mut mark_specs = Vec::new();
        let mut commands: HashMap<String, CommandSpec> = HashMap::new();
        let mut queries: HashMap<String, QuerySpec> = HashMap::new();
        let mut normalize_passes = Vec::new();

        for extension in &extensions {
            node_specs.extend(extension.node_specs());
            mark_specs.extend(extension.mark_specs());
            normalize_passes.extend(extension.normalize_passes());
            for cmd in extension.commands() {
                if commands.contains_key(&cmd.id) {
                    return Err(SchemaError::DuplicateCommand(cmd.id));
                }
                commands.insert(cmd.id.clone(), cmd);
            }
            for query in extension.queries() {
                if queries.contains_key(&query.id) {
                    return Err(SchemaError::DuplicateQuery(query.id));
                }
                queries.insert(query.id.clone(), query);
            }
        }

        let schema = Arc::new(Schema::compile(node_specs, mark_specs)?);

        Ok(Self {
            extensions,
            commands,
            queries,
            normalize_passes,
            schema,
        })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn extensions(&self) -> &[Box<dyn Extension>] {
        &self.extensions
    }

    pub fn command(&self, id: &str) -> Option<CommandSpec> {
        self.commands.get(id).cloned()
    }

    pub fn commands(&self) -> &HashMap<String, CommandSpec> {
        &self.commands
    }

    pub fn query(&self, id: &str) -> Option<QuerySpec> {
        self.queries.get(id).cloned()
    }

    pub fn normalize_passes(&self) -> &[Box<dyn NormalizePass>] {
        &self.normalize_passes
    }

    /// One round of normalize fixes against `doc`. Empty when converged.
    pub fn normalize(&self, doc: &Node) -> Vec<Step> {
        let mut steps = Vec::new();
        for pass in &self.normalize_passes {
            steps.extend(pass.run(doc, &self.schema));
        }
        steps
    }
}

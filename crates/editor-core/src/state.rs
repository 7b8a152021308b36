use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ApplyError, CommandError, ParseError, QueryError};
use crate::node::Node;
use crate::plugin::{DecorationSet, ExtensionRegistry, Handled, InputEvent};
use crate::transform::{Mapping, Step, Transform};

/// Cursor/selection as a pair of positions, always re-mapped across
/// transactions and clamped to the current document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: usize,
    pub focus: usize,
}

impl Selection {
    pub fn collapsed(pos: usize) -> Self {
        Self {
            anchor: pos,
            focus: pos,
        }
    }

    pub fn new(anchor: usize, focus: usize) -> Self {
        Self { anchor, focus }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.focus
    }

    pub fn from(&self) -> usize {
        self.anchor.min(self.focus)
    }

    pub fn to(&self) -> usize {
        self.anchor.max(self.focus)
    }

    pub fn map(&self, mapping: &Mapping) -> Selection {
        Selection {
            anchor: mapping.map(self.anchor, -1),
            focus: mapping.map(self.focus, -1),
        }
    }

    fn clamped(self, max: usize) -> Selection {
        Selection {
            anchor: self.anchor.min(max),
            focus: self.focus.min(max),
        }
    }
}

/// Atomic batch of steps plus intent metadata. Either every step applies
/// and a new document version is committed, or the whole transaction is
/// rejected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    pub steps: Vec<Step>,
    pub selection_after: Option<Selection>,
    pub meta: BTreeMap<String, Value>,
}

impl Transaction {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            selection_after: None,
            meta: BTreeMap::new(),
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn selection_after(mut self, selection: Selection) -> Self {
        self.selection_after = Some(selection);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    pub fn source(self, source: impl Into<String>) -> Self {
        self.with_meta("source", Value::String(source.into()))
    }

    pub fn get_meta(&self, key: &str) -> Option<&Value> {
        self.meta.get(key)
    }

    pub fn meta_flag(&self, key: &str) -> bool {
        self.meta.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub username: String,
}

/// Explicit per-editor context handed to every extension hook; replaces
/// process-wide registries. The timestamp is supplied by the embedder so
/// the engine itself carries no ambient clock.
#[derive(Debug, Clone)]
pub struct EditorContext {
    pub user: UserInfo,
    pub tracking_enabled: bool,
    /// Unix seconds, advanced by the embedder.
    pub timestamp: i64,
}

impl EditorContext {
    pub fn new(user: UserInfo) -> Self {
        Self {
            user,
            tracking_enabled: false,
            timestamp: 0,
        }
    }
}

#[derive(Debug)]
pub struct EditorConfig {
    pub max_undo: usize,
    pub max_normalize_iterations: usize,
    /// Debounce window for content-change notifications, milliseconds.
    pub content_change_debounce_ms: u64,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            max_undo: 200,
            max_normalize_iterations: 100,
            content_change_debounce_ms: 100,
        }
    }
}

/// Frozen snapshot handed to extensions each cycle: the schema, the
/// document, the selection, and every extension's keyed derived state.
#[derive(Debug, Clone)]
pub struct EditorState {
    pub schema: Arc<crate::schema::Schema>,
    pub doc: Node,
    pub selection: Selection,
    fields: BTreeMap<String, Value>,
}

impl EditorState {
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

#[derive(Debug, Clone)]
struct UndoRecord {
    /// Steps that revert the change, in application order.
    inverse_steps: Vec<Step>,
    selection_before: Selection,
    selection_after: Selection,
}

struct AppliedTransaction {
    doc_changed: bool,
    inverse_steps: Vec<Step>,
    selection_before: Selection,
    selection_after: Selection,
}

/// The single writer over one document. All mutation funnels through
/// [`Editor::apply`]; extensions read frozen snapshots and request changes
/// via new transactions, never by direct field mutation.
pub struct Editor {
    registry: ExtensionRegistry,
    config: EditorConfig,
    context: EditorContext,
    state: EditorState,
    undo_stack: Vec<UndoRecord>,
    redo_stack: Vec<UndoRecord>,
    doc_version: u64,
}

impl Editor {
    pub fn new(doc: Node, selection: Selection, registry: ExtensionRegistry, context: EditorContext) -> Self {
        Self::with_config(doc, selection, registry, context, EditorConfig::default())
    }

    pub fn with_config(
        doc: Node,
        selection: Selection,
        registry: ExtensionRegistry,
        context: EditorContext,
        config: EditorConfig,
    ) -> Self {
        let schema = Arc::clone(registry.schema());
        let mut editor = Self {
            registry,
            config,
            context,
            state: EditorState {
                schema,
                doc,
                selection,
                fields: BTreeMap::new(),
            },
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            doc_version: 0,
        };
        editor.normalize_initial();
        editor.init_fields();
        editor
    }

    /// Empty document: one blank paragraph, caret at its start.
    pub fn empty(registry: ExtensionRegistry, context: EditorContext) -> Self {
        let doc = Node::doc(vec![Node::paragraph("")]);
        Self::new(doc, Selection::collapsed(1), registry, context)
    }

    /// Load a persisted document. Malformed input is reported for the
    /// caller to fall back to plain text.
    pub fn from_json(
        registry: ExtensionRegistry,
        context: EditorContext,
        json: &Value,
    ) -> Result<Self, ParseError> {
        let doc = Node::from_json(registry.schema(), json)?;
        Ok(Self::new(doc, Selection::collapsed(0), registry, context))
    }

    pub fn doc(&self) -> &Node {
        &self.state.doc
    }

    pub fn selection(&self) -> &Selection {
        &self.state.selection
    }

    pub fn set_selection(&mut self, selection: Selection) {
        let max = self.state.doc.content_size();
        self.state.selection = selection.clamped(max);
    }

    pub fn state(&self) -> &EditorState {
        &self.state
    }

    pub fn schema(&self) -> &Arc<crate::schema::Schema> {
        self.registry.schema()
    }

    pub fn registry(&self) -> &ExtensionRegistry {
        &self.registry
    }

    pub fn context(&self) -> &EditorContext {
        &self.context
    }

    pub fn set_tracking(&mut self, enabled: bool) {
        self.context.tracking_enabled = enabled;
    }

    pub fn set_timestamp(&mut self, unix_seconds: i64) {
        self.context.timestamp = unix_seconds;
    }

    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    /// Bumped on every committed document change; the persistence boundary
    /// watches this.
    pub fn doc_version(&self) -> u64 {
        self.doc_version
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn apply(&mut self, tx: Transaction) -> Result<(), ApplyError> {
        let history = tx.meta_flag("history");
        let applied = self.apply_internal(tx)?;
        if applied.doc_changed {
            self.doc_version += 1;
        }
        if history || !applied.doc_changed {
            return Ok(());
        }

        let mut inverse_steps = applied.inverse_steps;
        inverse_steps.reverse();
        self.undo_stack.push(UndoRecord {
            inverse_steps,
            selection_before: applied.selection_before,
            selection_after: applied.selection_after,
        });
        self.redo_stack.clear();
        if self.undo_stack.len() > self.config.max_undo {
            self.undo_stack.remove(0);
        }
        Ok(())
    }

    pub fn undo(&mut self) -> bool {
        let Some(record) = self.undo_stack.pop() else {
            return false;
        };
        let tx = Transaction::new(record.inverse_steps.clone())
            .selection_after(record.selection_before)
            .with_meta("history", Value::Bool(true));
        match self.apply_internal(tx) {
            Ok(applied) => {
                if applied.doc_changed {
                    self.doc_version += 1;
                }
                let mut redo_steps = applied.inverse_steps;
                redo_steps.reverse();
                self.redo_stack.push(UndoRecord {
                    inverse_steps: redo_steps,
                    selection_before: record.selection_before,
                    selection_after: record.selection_after,
                });
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "undo failed; dropping history entry");
                false
            }
        }
    }

    pub fn redo(&mut self) -> bool {
        let Some(record) = self.redo_stack.pop() else {
            return false;
        };
        let tx = Transaction::new(record.inverse_steps.clone())
            .selection_after(record.selection_after)
            .with_meta("history", Value::Bool(true));
        match self.apply_internal(tx) {
            Ok(applied) => {
                if applied.doc_changed {
                    self.doc_version += 1;
                }
                let mut undo_steps = applied.inverse_steps;
                undo_steps.reverse();
                self.undo_stack.push(UndoRecord {
                    inverse_steps: undo_steps,
                    selection_before: record.selection_before,
                    selection_after: record.selection_after,
                });
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "redo failed; dropping history entry");
                false
            }
        }
    }

    /// Feed a raw input event through the interceptor chain. Returns
    /// whether some extension handled it.
    pub fn dispatch_event(&mut self, event: InputEvent) -> Result<bool, ApplyError> {
        let mut outcome: Option<Handled> = None;
        for extension in self.registry.extensions() {
            if let Some(handled) = extension.handle_event(&self.state, &event, &self.context) {
                outcome = Some(handled);
                break;
            }
        }
        match outcome {
            Some(handled) => {
                if let Some(tx) = handled.transaction {
                    self.apply(tx)?;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Decorations from every extension, in registration order. A failing
    /// extension contributes nothing; the rest are unaffected.
    pub fn decorations(&self) -> DecorationSet {
        let mut all = Vec::new();
        for extension in self.registry.extensions() {
            match extension.decorations(&self.state, &self.context) {
                Ok(set) => all.extend(set.into_vec()),
                Err(err) => {
                    tracing::warn!(
                        extension = extension.id(),
                        error = %err,
                        "decoration computation failed; skipping extension"
                    );
                }
            }
        }
        DecorationSet::new(all)
    }

    pub fn run_command(&mut self, id: &str, args: Option<Value>) -> Result<(), CommandError> {
        let Some(command) = self.registry.command(id) else {
            return Err(CommandError::new(format!("Unknown command: {id}")));
        };
        (command.handler)(self, args)
    }

    pub fn run_query_json(&self, id: &str, args: Option<Value>) -> Result<Value, QueryError> {
        let Some(query) = self.registry.query(id) else {
            return Err(QueryError::new(format!("Unknown query: {id}")));
        };
        (query.handler)(self, args)
    }

    pub fn run_query<T>(&self, id: &str, args: Option<Value>) -> Result<T, QueryError>
    where
        T: serde::de::DeserializeOwned,
    {
        let value = self.run_query_json(id, args)?;
        serde_json::from_value(value)
            .map_err(|err| QueryError::new(format!("Failed to decode query result: {err}")))
    }

    fn apply_internal(&mut self, tx: Transaction) -> Result<AppliedTransaction, ApplyError> {
        let tx = self.rewrite_transaction(tx);
        let selection_before = self.state.selection;

        let schema = Arc::clone(self.registry.schema());
        let mut transform = Transform::new(schema, self.state.doc.clone());
        for step in &tx.steps {
            transform.step(step.clone())?;
        }
        self.normalize(&mut transform)?;

        let max = transform.doc().content_size();
        let selection = tx
            .selection_after
            .unwrap_or_else(|| selection_before.map(transform.mapping()))
            .clamped(max);

        let old_state = EditorState {
            schema: Arc::clone(&self.state.schema),
            doc: std::mem::replace(&mut self.state.doc, transform.doc().clone()),
            selection: selection_before,
            fields: self.state.fields.clone(),
        };
        self.state.selection = selection;

        self.reduce_fields(&tx, &old_state, transform.mapping());

        Ok(AppliedTransaction {
            doc_changed: transform.doc_changed(),
            inverse_steps: transform.inverses().to_vec(),
            selection_before,
            selection_after: selection,
        })
    }

    fn rewrite_transaction(&self, tx: Transaction) -> Transaction {
        let mut tx = tx;
        for extension in self.registry.extensions() {
            if let Some(next) = extension.transform_transaction(&tx, &self.state, &self.context) {
                tx = next;
            }
        }
        tx
    }

    fn normalize(&self, transform: &mut Transform) -> Result<(), ApplyError> {
        for _ in 0..self.config.max_normalize_iterations {
            let steps = self.registry.normalize(transform.doc());
            if steps.is_empty() {
                return Ok(());
            }
            for step in steps {
                transform.step(step)?;
            }
        }
        Err(ApplyError::NormalizeDidNotConverge)
    }

    fn reduce_fields(&mut self, tx: &Transaction, old_state: &EditorState, mapping: &Mapping) {
        for extension in self.registry.extensions() {
            let Some(key) = extension.state_key() else {
                continue;
            };
            let value = self
                .state
                .fields
                .get(key)
                .cloned()
                .unwrap_or(Value::Null);
            match extension.apply_state(tx, mapping, value, old_state, &self.state, &self.context) {
                Ok(next) => {
                    self.state.fields.insert(key.to_string(), next);
                }
                Err(err) => {
                    tracing::warn!(
                        extension = extension.id(),
                        error = %err,
                        "state reducer failed; keeping previous value"
                    );
                }
            }
        }
    }

    fn normalize_initial(&mut self) {
        let schema = Arc::clone(self.registry.schema());
        let mut transform = Transform::new(schema, self.state.doc.clone());
        match self.normalize(&mut transform) {
            Ok(()) => {
                let max = transform.doc().content_size();
                if transform.doc_changed() {
                    self.state.doc = transform.doc().clone();
                }
                self.state.selection = self.state.selection.clamped(max);
            }
            Err(err) => {
                tracing::warn!(error = %err, "initial normalize failed; keeping document as loaded");
            }
        }
    }

    fn init_fields(&mut self) {
        let mut fields = BTreeMap::new();
        for extension in self.registry.extensions() {
            if let Some(key) = extension.state_key() {
                fields.insert(
                    key.to_string(),
                    extension.init_state(&self.state.doc, &self.context),
                );
            }
        }
        self.state.fields = fields;
    }
}

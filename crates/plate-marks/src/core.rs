use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EditorConfig;
use crate::error::ApplyError;
use crate::interceptor::AnnotationBoundary;
use crate::marks::{MarkDef, MarkSet, Schema};
use crate::normalize::Normalizer;
use crate::ops::{Op, Path, Transaction};
use crate::substrate::{Apply, Substrate, apply_op_to, normalize_selection};

pub type Attrs = BTreeMap<String, serde_json::Value>;

const DEFAULT_STYLE: &str = "normal";

fn default_style() -> String {
    DEFAULT_STYLE.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Document {
    #[serde(default)]
    pub children: Vec<Node>,
}

impl Document {
    pub fn new(children: Vec<Node>) -> Self {
        Self { children }
    }

    pub fn node(&self, path: &[usize]) -> Option<&Node> {
        let (first, rest) = path.split_first()?;
        let mut node = self.children.get(*first)?;
        for &ix in rest {
            node = match node {
                Node::Block(block) => block.children.get(ix)?,
                Node::Span(_) | Node::Object(_) => return None,
            };
        }
        Some(node)
    }

    pub fn block(&self, index: usize) -> Option<&Block> {
        self.children.get(index).and_then(Node::as_block)
    }

    pub fn span(&self, path: &[usize]) -> Option<&Span> {
        self.node(path).and_then(Node::as_span)
    }

    pub fn has_mark_def(&self, key: &str) -> bool {
        self.children
            .iter()
            .filter_map(Node::as_block)
            .any(|block| block.mark_defs.iter().any(|def| def.key == key))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Node {
    Block(Block),
    Span(Span),
    Object(ObjectNode),
}

impl Node {
    pub fn paragraph(text: impl Into<String>) -> Self {
        Node::Block(Block::new(vec![Node::Span(Span::plain(text))]))
    }

    pub fn block(children: impl IntoIterator<Item = Span>) -> Self {
        Node::Block(Block::new(children.into_iter().map(Node::Span).collect()))
    }

    pub fn span<I, S>(text: impl Into<String>, marks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Node::Span(Span::new(text, marks))
    }

    pub fn as_block(&self) -> Option<&Block> {
        match self {
            Node::Block(block) => Some(block),
            _ => None,
        }
    }

    pub fn as_span(&self) -> Option<&Span> {
        match self {
            Node::Span(span) => Some(span),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(default = "default_style")]
    pub style: String,
    #[serde(default)]
    pub attrs: Attrs,
    #[serde(default)]
    pub mark_defs: Vec<MarkDef>,
    #[serde(default)]
    pub children: Vec<Node>,
}

impl Default for Block {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Block {
    pub fn new(children: Vec<Node>) -> Self {
        Self {
            style: default_style(),
            attrs: Attrs::default(),
            mark_defs: Vec::new(),
            children,
        }
    }

    pub fn with_mark_defs(mut self, mark_defs: Vec<MarkDef>) -> Self {
        self.mark_defs = mark_defs;
        self
    }

    pub fn spans(&self) -> impl Iterator<Item = &Span> {
        self.children.iter().filter_map(Node::as_span)
    }

    pub fn text(&self) -> String {
        self.spans().map(|span| span.text.as_str()).collect()
    }

    pub fn text_len(&self) -> usize {
        self.spans().map(|span| span.text.len()).sum()
    }

}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub text: String,
    /// `None` only for input that predates the marks field; normalization
    /// fills it in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marks: Option<MarkSet>,
}

impl Span {
    pub fn new<I, S>(text: impl Into<String>, marks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            text: text.into(),
            marks: Some(marks.into_iter().collect()),
        }
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            marks: Some(MarkSet::new()),
        }
    }

    pub fn marks(&self) -> &MarkSet {
        self.marks.as_ref().unwrap_or(MarkSet::empty())
    }
}

/// A void node: a block-level or inline object without text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectNode {
    pub kind: String,
    #[serde(default)]
    pub attrs: Attrs,
}

impl ObjectNode {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attrs: Attrs::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Point {
    #[serde(default)]
    pub path: Path,
    pub offset: usize,
}

impl Point {
    pub fn new(path: Path, offset: usize) -> Self {
        Self { path, offset }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: Point,
    pub focus: Point,
}

impl Selection {
    pub fn new(anchor: Point, focus: Point) -> Self {
        Self { anchor, focus }
    }

    pub fn collapsed(point: Point) -> Self {
        Self {
            anchor: point.clone(),
            focus: point,
        }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.focus
    }

    pub fn is_expanded(&self) -> bool {
        !self.is_collapsed()
    }

    /// `(start, end)` in document order.
    pub fn ordered(&self) -> (Point, Point) {
        if self.focus < self.anchor {
            (self.focus.clone(), self.anchor.clone())
        } else {
            (self.anchor.clone(), self.focus.clone())
        }
    }
}

/// Mutable state shared by the `Apply` chain.
#[derive(Debug, Clone, Default)]
pub struct EditorState {
    pub(crate) doc: Document,
    pub(crate) selection: Option<Selection>,
    pub(crate) marks: Option<MarkSet>,
    pub(crate) applied: Vec<Op>,
    pub(crate) inverse: Vec<Op>,
}

impl EditorState {
    pub fn new(doc: Document, selection: Option<Selection>) -> Self {
        Self {
            doc,
            selection,
            ..Self::default()
        }
    }

    pub fn doc(&self) -> &Document {
        &self.doc
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    pub fn pending_marks(&self) -> Option<&MarkSet> {
        self.marks.as_ref()
    }

    pub fn set_pending_marks(&mut self, marks: Option<MarkSet>) {
        self.marks = marks;
    }

    /// Ops applied in the current batch, in order.
    pub fn applied(&self) -> &[Op] {
        &self.applied
    }

    /// Pending marks if any, otherwise the marks of the span under the focus.
    pub fn current_marks(&self) -> MarkSet {
        if let Some(marks) = &self.marks {
            return marks.clone();
        }
        self.selection
            .as_ref()
            .and_then(|sel| self.doc.span(&sel.focus.path))
            .map(|span| span.marks().clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EditorChange {
    /// Every op of one logical action, corrections included. `inverse`
    /// is ordered for direct application.
    Mutation { operations: Vec<Op>, inverse: Vec<Op> },
    Selection { selection: Option<Selection> },
}

struct BatchSnapshot {
    selection: Option<Selection>,
    marks: Option<MarkSet>,
}

pub struct Editor {
    pub(crate) state: EditorState,
    applier: Box<dyn Apply>,
    normalizer: Normalizer,
    schema: Schema,
    config: EditorConfig,
    subscribers: Vec<Sender<EditorChange>>,
    batch_depth: usize,
    pub(crate) selection_changed: bool,
    key_counter: u64,
}

impl Editor {
    pub fn new(doc: Document, selection: Option<Selection>, config: EditorConfig) -> Self {
        let config = config.with_defaults();
        let schema = config.schema();
        let applier: Box<dyn Apply> = Box::new(AnnotationBoundary::new(Substrate, schema.clone()));
        let mut editor = Self {
            state: EditorState::new(doc, selection),
            applier,
            normalizer: Normalizer::new(config.default_style.clone()),
            schema,
            config,
            subscribers: Vec::new(),
            batch_depth: 0,
            selection_changed: false,
            key_counter: 0,
        };
        editor.normalize_in_place();
        editor
    }

    pub fn with_defaults() -> Self {
        let doc = Document {
            children: vec![Node::paragraph("")],
        };
        let selection = Selection::collapsed(Point::new(vec![0, 0], 0));
        Self::new(doc, Some(selection), EditorConfig::default())
    }

    pub fn doc(&self) -> &Document {
        &self.state.doc
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.state.selection.as_ref()
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn pending_marks(&self) -> Option<&MarkSet> {
        self.state.marks.as_ref()
    }

    /// Marks the next typed text will carry.
    pub fn marks(&self) -> MarkSet {
        self.state.current_marks()
    }

    pub fn subscribe(&mut self) -> Receiver<EditorChange> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// Moves the selection. Pending marks belong to the old cursor and are
    /// dropped.
    pub fn set_selection(&mut self, selection: Option<Selection>) {
        self.state.selection = selection.and_then(|sel| normalize_selection(&self.state.doc, &sel));
        self.state.marks = None;
        self.selection_changed = true;
        if self.batch_depth == 0 {
            self.flush_changes(Vec::new(), Vec::new());
        }
    }

    pub fn apply(&mut self, tx: Transaction) -> Result<(), ApplyError> {
        self.batch(|editor| editor.apply_transaction(tx))
    }

    /// Runs `f` as one batch: normalization and notification happen once,
    /// after `f` returns. On error every op of the batch is rolled back.
    pub fn without_normalizing<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<R, ApplyError>,
    ) -> Result<R, ApplyError> {
        self.batch(f)
    }

    /// Normalizes every block. Returns the number of corrective ops applied.
    pub fn normalize(&mut self) -> Result<usize, ApplyError> {
        self.batch(|editor| {
            let before = editor.state.applied.len();
            editor.normalizer.mark_all(editor.state.doc.children.len());
            editor.run_normalizer()?;
            Ok(editor.state.applied.len() - before)
        })
    }

    pub(crate) fn apply_transaction(&mut self, tx: Transaction) -> Result<(), ApplyError> {
        let Transaction {
            ops,
            selection_after,
            meta,
        } = tx;
        if let Some(source) = &meta.source {
            debug!(source = %source, ops = ops.len(), "applying transaction");
        }
        for op in ops {
            self.apply_op(op)?;
        }
        if let Some(selection) = selection_after {
            self.state.selection = Some(selection);
        }
        Ok(())
    }

    pub(crate) fn apply_op(&mut self, op: Op) -> Result<(), ApplyError> {
        let before = self.state.applied.len();
        self.applier.apply(&mut self.state, op)?;
        self.normalizer
            .observe(&self.state.doc, &self.state.applied[before..]);
        Ok(())
    }

    pub(crate) fn batch<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<R, ApplyError>,
    ) -> Result<R, ApplyError> {
        if self.batch_depth > 0 {
            self.batch_depth += 1;
            let result = f(self);
            self.batch_depth -= 1;
            return result;
        }

        let snapshot = BatchSnapshot {
            selection: self.state.selection.clone(),
            marks: self.state.marks.clone(),
        };
        self.batch_depth = 1;
        let result = f(self).and_then(|value| self.run_normalizer().map(|()| value));
        self.batch_depth = 0;

        match result {
            Ok(value) => {
                self.commit(snapshot);
                Ok(value)
            }
            Err(err) => {
                self.rollback(snapshot);
                Err(err)
            }
        }
    }

    pub(crate) fn next_key(&mut self) -> String {
        loop {
            self.key_counter += 1;
            let key = format!("{}{}", self.config.key_prefix, self.key_counter);
            if !self.state.doc.has_mark_def(&key) {
                return key;
            }
        }
    }

    fn run_normalizer(&mut self) -> Result<(), ApplyError> {
        self.normalizer
            .run(
                &mut self.state,
                &Substrate,
                self.config.max_normalize_iterations,
            )
            .map(|_| ())
    }

    fn commit(&mut self, snapshot: BatchSnapshot) {
        self.state.selection = self
            .state
            .selection
            .take()
            .and_then(|sel| normalize_selection(&self.state.doc, &sel));
        if self.state.selection != snapshot.selection || self.state.marks != snapshot.marks {
            self.selection_changed = true;
        }
        let operations = std::mem::take(&mut self.state.applied);
        let mut inverse = std::mem::take(&mut self.state.inverse);
        inverse.reverse();
        self.flush_changes(operations, inverse);
    }

    fn rollback(&mut self, snapshot: BatchSnapshot) {
        let inverse = std::mem::take(&mut self.state.inverse);
        let applied = std::mem::take(&mut self.state.applied);
        warn!(ops = applied.len(), "rolling back failed batch");

        let mut selection = None;
        for op in inverse.into_iter().rev() {
            if let Err(err) = apply_op_to(&mut self.state.doc, &mut selection, op) {
                warn!(%err, "rollback stopped early");
                break;
            }
        }
        self.state.selection = snapshot.selection;
        self.state.marks = snapshot.marks;
        self.normalizer.clear();
        self.selection_changed = false;
    }

    fn normalize_in_place(&mut self) {
        self.normalizer.mark_all(self.state.doc.children.len());
        if let Err(err) = self.run_normalizer() {
            warn!(%err, "initial normalization failed");
            self.normalizer.clear();
        }
        self.state.applied.clear();
        self.state.inverse.clear();
        self.state.selection = self
            .state
            .selection
            .take()
            .and_then(|sel| normalize_selection(&self.state.doc, &sel));
    }

    fn flush_changes(&mut self, operations: Vec<Op>, inverse: Vec<Op>) {
        if !operations.is_empty() {
            self.emit(EditorChange::Mutation {
                operations,
                inverse,
            });
        }
        if std::mem::take(&mut self.selection_changed) {
            let selection = self.state.selection.clone();
            self.emit(EditorChange::Selection { selection });
        }
    }

    fn emit(&mut self, change: EditorChange) {
        self.subscribers
            .retain(|subscriber| subscriber.send(change.clone()).is_ok());
    }
}

use std::collections::{BTreeSet, VecDeque};

use tracing::debug;

use crate::core::{Block, Document, EditorState, Node, Span};
use crate::error::ApplyError;
use crate::marks::{
    MarkDef, MarkSet, is_empty_formatted_span, is_orphan_definition, span_missing_marks,
    spans_equal_marks,
};
use crate::ops::{NodePatch, Op};
use crate::substrate::Apply;

/// A corrective rule over a single block. Returns no ops when the block
/// already satisfies it.
pub(crate) trait BlockRule: Send + Sync {
    fn id(&self) -> &'static str;
    fn run(&self, block: &Block, index: usize) -> Vec<Op>;
}

static RULES: &[&dyn BlockRule] = &[
    &EnsureSpanChild,
    &MigrateMissingMarks,
    &ClearEmptySpanMarks,
    &MergeEqualSpans,
    &RemoveRedundantEmptySpans,
    &PruneOrphanMarkDefs,
];

/// First rule that fires for `block`, with its ops.
fn corrections(block: &Block, index: usize) -> Option<(&'static str, Vec<Op>)> {
    RULES.iter().find_map(|rule| {
        let ops = rule.run(block, index);
        (!ops.is_empty()).then(|| (rule.id(), ops))
    })
}

/// Ops one normalization pass would issue on `doc` as it stands. Empty iff
/// the document is normalized.
pub fn normalize_ops(doc: &Document) -> Vec<Op> {
    if doc.children.is_empty() {
        return vec![Op::InsertNode {
            path: vec![0],
            node: Node::paragraph(""),
        }];
    }
    doc.children
        .iter()
        .enumerate()
        .filter_map(|(ix, node)| node.as_block().map(|block| (ix, block)))
        .filter_map(|(ix, block)| corrections(block, ix))
        .flat_map(|(_, ops)| ops)
        .collect()
}

struct EnsureSpanChild;

impl BlockRule for EnsureSpanChild {
    fn id(&self) -> &'static str {
        "ensure_span_child"
    }

    fn run(&self, block: &Block, index: usize) -> Vec<Op> {
        if block.spans().next().is_some() {
            return Vec::new();
        }
        vec![Op::InsertNode {
            path: vec![index, 0],
            node: Node::Span(Span::plain("")),
        }]
    }
}

struct MigrateMissingMarks;

impl BlockRule for MigrateMissingMarks {
    fn id(&self) -> &'static str {
        "migrate_missing_marks"
    }

    fn run(&self, block: &Block, index: usize) -> Vec<Op> {
        span_ops(block, index, span_missing_marks)
    }
}

struct ClearEmptySpanMarks;

impl BlockRule for ClearEmptySpanMarks {
    fn id(&self) -> &'static str {
        "clear_empty_span_marks"
    }

    fn run(&self, block: &Block, index: usize) -> Vec<Op> {
        span_ops(block, index, is_empty_formatted_span)
    }
}

fn span_ops(block: &Block, index: usize, pred: impl Fn(&Span) -> bool) -> Vec<Op> {
    block
        .children
        .iter()
        .enumerate()
        .filter(|(_, node)| node.as_span().is_some_and(&pred))
        .map(|(ix, _)| Op::set_marks(vec![index, ix], MarkSet::new()))
        .collect()
}

struct MergeEqualSpans;

impl BlockRule for MergeEqualSpans {
    fn id(&self) -> &'static str {
        "merge_equal_spans"
    }

    fn run(&self, block: &Block, index: usize) -> Vec<Op> {
        // Descending, so each merge leaves the lower indices untouched.
        (1..block.children.len())
            .rev()
            .filter(|&ix| {
                match (&block.children[ix - 1], &block.children[ix]) {
                    (Node::Span(left), Node::Span(right)) => spans_equal_marks(left, right),
                    _ => false,
                }
            })
            .map(|ix| Op::merge_node(vec![index, ix]))
            .collect()
    }
}

/// An empty span is only needed when it is the block's sole span.
struct RemoveRedundantEmptySpans;

impl BlockRule for RemoveRedundantEmptySpans {
    fn id(&self) -> &'static str {
        "remove_redundant_empty_spans"
    }

    fn run(&self, block: &Block, index: usize) -> Vec<Op> {
        if block.spans().count() < 2 {
            return Vec::new();
        }
        block
            .children
            .iter()
            .position(|node| node.as_span().is_some_and(|span| span.text.is_empty()))
            .map(|ix| Op::RemoveNode {
                path: vec![index, ix],
            })
            .into_iter()
            .collect()
    }
}

struct PruneOrphanMarkDefs;

impl BlockRule for PruneOrphanMarkDefs {
    fn id(&self) -> &'static str {
        "prune_orphan_mark_defs"
    }

    fn run(&self, block: &Block, index: usize) -> Vec<Op> {
        if !block
            .mark_defs
            .iter()
            .any(|def| is_orphan_definition(def, block))
        {
            return Vec::new();
        }
        let kept = block
            .mark_defs
            .iter()
            .filter(|def| !is_orphan_definition(def, block))
            .cloned()
            .collect();
        vec![Op::SetNode {
            path: vec![index],
            patch: NodePatch::mark_defs(kept),
        }]
    }
}

/// Definitions that must follow content moved into `block` by a block
/// split or merge.
#[derive(Debug, Clone, PartialEq)]
struct AdoptMarkDefs {
    block: usize,
    defs: Vec<MarkDef>,
}

/// Worklist of blocks to re-check plus pending definition adoptions.
///
/// Queued block indices are rebased across every observed op, so work
/// recorded early in a batch still points at the right block when the
/// batch is normalized.
#[derive(Debug, Default)]
pub struct Normalizer {
    adopt: VecDeque<AdoptMarkDefs>,
    dirty: BTreeSet<usize>,
    default_style: String,
}

impl Normalizer {
    pub fn new(default_style: impl Into<String>) -> Self {
        Self {
            default_style: default_style.into(),
            ..Self::default()
        }
    }

    pub fn clear(&mut self) {
        self.adopt.clear();
        self.dirty.clear();
    }

    pub fn mark_dirty(&mut self, block: usize) {
        self.dirty.insert(block);
    }

    pub fn mark_all(&mut self, len: usize) {
        self.dirty.extend(0..len);
    }

    /// Records work for ops already applied to `doc`.
    pub fn observe(&mut self, doc: &Document, ops: &[Op]) {
        for op in ops {
            self.rebase(op);
            self.record(doc, op);
        }
    }

    fn rebase(&mut self, op: &Op) {
        let &[index] = op.path() else {
            return;
        };
        let shift = |block: usize| -> Option<usize> {
            match op {
                Op::InsertNode { .. } if block >= index => Some(block + 1),
                Op::RemoveNode { .. } if block == index => None,
                Op::RemoveNode { .. } if block > index => Some(block - 1),
                Op::SplitNode { .. } if block > index => Some(block + 1),
                Op::MergeNode { .. } if block >= index => Some(block.saturating_sub(1)),
                _ => Some(block),
            }
        };
        self.dirty = std::mem::take(&mut self.dirty)
            .into_iter()
            .filter_map(shift)
            .collect();
        self.adopt.retain_mut(|task| match shift(task.block) {
            Some(block) => {
                task.block = block;
                true
            }
            None => false,
        });
    }

    fn record(&mut self, doc: &Document, op: &Op) {
        match op {
            Op::SplitNode { path, .. } if path.len() == 1 => {
                let index = path[0];
                self.mark_dirty(index);
                self.mark_dirty(index + 1);
                let defs = doc
                    .block(index)
                    .map(|block| block.mark_defs.clone())
                    .unwrap_or_default();
                if !defs.is_empty() {
                    self.adopt.push_back(AdoptMarkDefs {
                        block: index + 1,
                        defs,
                    });
                }
            }
            Op::MergeNode {
                path, properties, ..
            } if path.len() == 1 => {
                let target = path[0].saturating_sub(1);
                self.mark_dirty(target);
                if let Some(defs) = properties.mark_defs.as_ref().filter(|defs| !defs.is_empty()) {
                    self.adopt.push_back(AdoptMarkDefs {
                        block: target,
                        defs: defs.clone(),
                    });
                }
            }
            Op::RemoveNode { path } if path.len() == 1 => {}
            _ => {
                if let Some(&block) = op.path().first() {
                    self.mark_dirty(block);
                }
            }
        }
    }

    /// Applies corrections until no work is left. Returns the number of
    /// corrective passes.
    pub fn run(
        &mut self,
        state: &mut EditorState,
        applier: &dyn Apply,
        max_iterations: usize,
    ) -> Result<usize, ApplyError> {
        let limit = max_iterations.saturating_mul(state.doc.children.len().max(1));
        let mut passes = 0;

        loop {
            let (rule, block, ops) = if state.doc.children.is_empty() {
                let mut paragraph = Block::new(vec![Node::Span(Span::plain(""))]);
                paragraph.style = self.default_style.clone();
                let op = Op::InsertNode {
                    path: vec![0],
                    node: Node::Block(paragraph),
                };
                ("ensure_non_empty_document", 0, vec![op])
            } else if let Some(task) = self.adopt.pop_front() {
                let block = task.block;
                ("adopt_mark_defs", block, adopt_ops(&state.doc, task))
            } else if let Some(block) = self.dirty.pop_first() {
                match state
                    .doc
                    .block(block)
                    .and_then(|node| corrections(node, block))
                {
                    Some((rule, ops)) => (rule, block, ops),
                    None => continue,
                }
            } else {
                break;
            };

            if ops.is_empty() {
                continue;
            }
            if passes >= limit {
                self.clear();
                return Err(ApplyError::NormalizeDidNotConverge { iterations: passes });
            }
            passes += 1;
            debug!(rule, block, ops = ops.len(), "normalizing block");

            for op in ops {
                let before = state.applied.len();
                applier.apply(state, op)?;
                self.observe(&state.doc, &state.applied[before..]);
            }
        }

        Ok(passes)
    }
}

/// Union by key; definitions already on the block win.
fn adopt_ops(doc: &Document, task: AdoptMarkDefs) -> Vec<Op> {
    let Some(block) = doc.block(task.block) else {
        return Vec::new();
    };
    let mut defs = block.mark_defs.clone();
    for def in task.defs {
        if !defs.iter().any(|existing| existing.key == def.key) {
            defs.push(def);
        }
    }
    if defs.len() == block.mark_defs.len() {
        return Vec::new();
    }
    vec![Op::SetNode {
        path: vec![task.block],
        patch: NodePatch::mark_defs(defs),
    }]
}

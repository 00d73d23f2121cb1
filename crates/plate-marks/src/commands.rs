use tracing::debug;

use crate::core::{Attrs, Document, Editor, Node, Point, Selection, Span};
use crate::error::ApplyError;
use crate::marks::{MarkDef, MarkSet};
use crate::ops::{NodePatch, Op, Path, Transaction};
use crate::substrate::clamp_to_char_boundary;

impl Editor {
    pub fn add_mark(&mut self, id: &str) -> Result<(), ApplyError> {
        self.update_marks("marks.add_mark", |marks| marks.with(id))
    }

    pub fn remove_mark(&mut self, id: &str) -> Result<(), ApplyError> {
        self.update_marks("marks.remove_mark", |marks| marks.without(id))
    }

    /// Removes `id` when it is active anywhere in the selection, otherwise
    /// adds it everywhere.
    pub fn toggle_mark(&mut self, id: &str) -> Result<(), ApplyError> {
        if self.is_mark_active(id) {
            self.remove_mark(id)
        } else {
            self.add_mark(id)
        }
    }

    /// With a collapsed selection, whether the next typed text would carry
    /// `id`. With an expanded one, whether any span sharing at least one
    /// character with the selection carries it. Spans the selection only
    /// touches at a zero-width edge do not count, and neither do the marks
    /// at the anchor.
    pub fn is_mark_active(&self, id: &str) -> bool {
        let Some(selection) = self.selection() else {
            return false;
        };
        if selection.is_collapsed() {
            return self.marks().contains(id);
        }
        let (start, end) = selection.ordered();
        covered_spans(self.doc(), &start, &end)
            .iter()
            .any(|(_, span)| span.marks().contains(id))
    }

    /// Inserts `text` at the cursor, replacing an expanded selection.
    /// Pending marks are consumed.
    pub fn insert_text(&mut self, text: &str) -> Result<(), ApplyError> {
        if text.is_empty() || self.state.selection.is_none() {
            return Ok(());
        }
        self.batch(|editor| {
            let pending = editor.state.marks.take();
            if editor
                .state
                .selection
                .as_ref()
                .is_some_and(Selection::is_expanded)
            {
                editor.delete_fragment()?;
            }
            let Some(point) = editor.state.selection.as_ref().map(|sel| sel.focus.clone()) else {
                return Ok(());
            };
            let Some(span) = editor.state.doc.span(&point.path) else {
                return Ok(());
            };
            let span_marks = span.marks().clone();
            let span_len = span.text.len();

            let marks = match pending {
                Some(marks) if marks != span_marks => marks,
                _ => {
                    return editor.apply_op(Op::InsertText {
                        path: point.path,
                        offset: point.offset,
                        text: text.to_string(),
                    });
                }
            };

            let at_trailing_edge =
                span_len > 0 && point.offset >= span_len && !span_marks.is_empty();
            let marks = if at_trailing_edge && editor.schema().has_annotation(&marks) {
                let trailing = editor.schema().decorators_of(&marks);
                debug!(
                    path = ?point.path,
                    trailing = ?trailing,
                    "pending marks past annotation edge"
                );
                trailing
            } else {
                marks
            };

            let Some((&child_ix, parent)) = point.path.split_last() else {
                return Ok(());
            };
            let insert_ix = if point.offset == 0 {
                child_ix
            } else if point.offset >= span_len {
                child_ix + 1
            } else {
                editor.apply_op(Op::SplitNode {
                    path: point.path.clone(),
                    position: point.offset,
                    properties: NodePatch::marks(span_marks),
                })?;
                child_ix + 1
            };
            let mut path = parent.to_vec();
            path.push(insert_ix);
            editor.apply_op(Op::InsertNode {
                path: path.clone(),
                node: Node::Span(Span {
                    text: text.to_string(),
                    marks: Some(marks),
                }),
            })?;
            editor.state.selection = Some(Selection::collapsed(Point::new(path, text.len())));
            Ok(())
        })
    }

    /// Splits the block at the cursor. The new block keeps the style; its
    /// annotation definitions are adopted during normalization.
    pub fn insert_break(&mut self) -> Result<(), ApplyError> {
        if self.state.selection.is_none() {
            return Ok(());
        }
        self.batch(|editor| {
            if editor
                .state
                .selection
                .as_ref()
                .is_some_and(Selection::is_expanded)
            {
                editor.delete_fragment()?;
            }
            editor.state.marks = None;
            let Some(point) = editor.state.selection.as_ref().map(|sel| sel.focus.clone()) else {
                return Ok(());
            };
            let &[block_ix, child_ix] = point.path.as_slice() else {
                return Ok(());
            };
            let (Some(block), Some(span)) = (
                editor.state.doc.block(block_ix),
                editor.state.doc.span(&point.path),
            ) else {
                return Ok(());
            };
            let style = block.style.clone();
            let span_marks = span.marks().clone();

            editor.apply_op(Op::SplitNode {
                path: point.path.clone(),
                position: point.offset,
                properties: NodePatch::marks(span_marks),
            })?;
            editor.apply_op(Op::SplitNode {
                path: vec![block_ix],
                position: child_ix + 1,
                properties: NodePatch::style(style),
            })
        })
    }

    /// Deletes the character before the cursor, or the selected content.
    /// At the start of a block the block is merged into the previous one.
    pub fn delete_backward(&mut self) -> Result<(), ApplyError> {
        let Some(selection) = self.state.selection.clone() else {
            return Ok(());
        };
        if selection.is_expanded() {
            return self.delete_fragment();
        }
        let point = selection.focus;
        let &[block_ix, child_ix] = point.path.as_slice() else {
            return Ok(());
        };
        let Some(span) = self.state.doc.span(&point.path) else {
            return Ok(());
        };

        let op = if point.offset > 0 {
            let end = clamp_to_char_boundary(&span.text, point.offset);
            Op::RemoveText {
                path: point.path.clone(),
                range: previous_char(&span.text, end)..end,
            }
        } else if child_ix > 0 {
            let prev_path = vec![block_ix, child_ix - 1];
            match self.state.doc.node(&prev_path) {
                Some(Node::Span(prev)) if !prev.text.is_empty() => {
                    let end = prev.text.len();
                    Op::RemoveText {
                        range: previous_char(&prev.text, end)..end,
                        path: prev_path,
                    }
                }
                Some(_) => Op::RemoveNode { path: prev_path },
                None => return Ok(()),
            }
        } else if block_ix > 0 {
            match self.state.doc.children.get(block_ix - 1) {
                Some(Node::Block(_)) => Op::merge_node(vec![block_ix]),
                Some(_) => Op::RemoveNode {
                    path: vec![block_ix - 1],
                },
                None => return Ok(()),
            }
        } else {
            return Ok(());
        };

        self.batch(|editor| {
            editor.state.marks = None;
            editor.apply_op(op)
        })
    }

    /// Removes the content of an expanded selection, joining the blocks at
    /// its edges.
    pub fn delete_fragment(&mut self) -> Result<(), ApplyError> {
        if !self
            .state
            .selection
            .as_ref()
            .is_some_and(Selection::is_expanded)
        {
            return Ok(());
        }
        self.batch(|editor| {
            editor.split_selection_edges()?;
            let Some(selection) = editor.state.selection.clone() else {
                return Ok(());
            };
            let (start, end) = selection.ordered();
            let (&[start_block, start_child], &[end_block, end_child]) =
                (start.path.as_slice(), end.path.as_slice())
            else {
                return Ok(());
            };

            // After the edge splits every edge point sits on a span boundary.
            let first_removed = if start.offset == 0 {
                start_child
            } else {
                start_child + 1
            };
            let first_kept = if end.offset == 0 {
                end_child
            } else {
                end_child + 1
            };

            let caret = match first_removed.checked_sub(1) {
                Some(ix) => {
                    let offset = editor
                        .state
                        .doc
                        .span(&[start_block, ix])
                        .map_or(0, |span| span.text.len());
                    Point::new(vec![start_block, ix], offset)
                }
                None => Point::new(vec![start_block, 0], 0),
            };

            let remove = |block: usize, ix: usize| Op::RemoveNode {
                path: vec![block, ix],
            };
            let mut ops = Vec::new();
            if start_block == end_block {
                ops.extend((first_removed..first_kept).rev().map(|ix| remove(start_block, ix)));
            } else {
                let start_len = editor
                    .state
                    .doc
                    .block(start_block)
                    .map_or(0, |block| block.children.len());
                ops.extend((0..first_kept).rev().map(|ix| remove(end_block, ix)));
                ops.extend(
                    (start_block + 1..end_block)
                        .rev()
                        .map(|ix| Op::RemoveNode { path: vec![ix] }),
                );
                ops.extend((first_removed..start_len).rev().map(|ix| remove(start_block, ix)));
                ops.push(Op::merge_node(vec![start_block + 1]));
            }

            editor.state.marks = None;
            editor.apply_transaction(
                Transaction::new(ops)
                    .selection_after(Selection::collapsed(caret))
                    .source("editing.delete_fragment"),
            )
        })
    }

    /// Defines a new annotation and applies it to the selection. Returns the
    /// generated key, or `None` without an expanded selection.
    pub fn add_annotation(
        &mut self,
        kind: impl Into<String>,
        payload: Attrs,
    ) -> Result<Option<String>, ApplyError> {
        let Some(selection) = self.state.selection.clone() else {
            return Ok(None);
        };
        if selection.is_collapsed() {
            return Ok(None);
        }
        let (start, end) = selection.ordered();
        let (Some(&first), Some(&last)) = (start.path.first(), end.path.first()) else {
            return Ok(None);
        };

        let key = self.next_key();
        let def = MarkDef {
            key: key.clone(),
            kind: kind.into(),
            payload,
        };
        debug!(key = %key, kind = %def.kind, "adding annotation");

        self.batch(|editor| {
            let ops: Vec<Op> = (first..=last)
                .filter_map(|ix| editor.state.doc.block(ix).map(|block| (ix, block)))
                .map(|(ix, block)| {
                    let mut defs = block.mark_defs.clone();
                    defs.push(def.clone());
                    Op::SetNode {
                        path: vec![ix],
                        patch: NodePatch::mark_defs(defs),
                    }
                })
                .collect();
            editor.apply_transaction(Transaction::new(ops).source("annotations.add"))?;
            editor.add_mark(&key)
        })?;
        Ok(Some(key))
    }

    /// Drops `key` from the selection. The definition is pruned once no
    /// span references it.
    pub fn remove_annotation(&mut self, key: &str) -> Result<(), ApplyError> {
        self.remove_mark(key)
    }

    fn update_marks(
        &mut self,
        source: &'static str,
        update: impl Fn(&MarkSet) -> MarkSet,
    ) -> Result<(), ApplyError> {
        let Some(selection) = self.state.selection.clone() else {
            return Ok(());
        };
        debug!(source, collapsed = selection.is_collapsed(), "updating marks");

        self.batch(|editor| {
            editor.selection_changed = true;
            if selection.is_collapsed() {
                let next = update(&editor.state.current_marks());
                editor.state.marks = Some(next);
                return Ok(());
            }

            editor.split_selection_edges()?;
            let Some(selection) = editor.state.selection.clone() else {
                return Ok(());
            };
            let (start, end) = selection.ordered();
            let ops: Vec<Op> = covered_spans(&editor.state.doc, &start, &end)
                .into_iter()
                .filter_map(|(path, span)| {
                    let next = update(span.marks());
                    (next != *span.marks()).then(|| Op::set_marks(path, next))
                })
                .collect();
            editor.apply_transaction(Transaction::new(ops).source(source))
        })
    }

    /// Splits the spans under both selection edges so the selected text is
    /// made of whole spans. End first, so the start path stays valid.
    fn split_selection_edges(&mut self) -> Result<(), ApplyError> {
        let Some(selection) = self.state.selection.clone() else {
            return Ok(());
        };
        let (start, end) = selection.ordered();
        self.split_span_at(&end)?;
        self.split_span_at(&start)
    }

    fn split_span_at(&mut self, point: &Point) -> Result<(), ApplyError> {
        let Some(span) = self.state.doc.span(&point.path) else {
            return Ok(());
        };
        if point.offset == 0 || point.offset >= span.text.len() {
            return Ok(());
        }
        let properties = NodePatch::marks(span.marks().clone());
        self.apply_op(Op::SplitNode {
            path: point.path.clone(),
            position: point.offset,
            properties,
        })
    }
}

fn previous_char(text: &str, end: usize) -> usize {
    text[..end]
        .char_indices()
        .next_back()
        .map_or(0, |(ix, _)| ix)
}

/// Spans sharing at least one character with `start..end`, in document
/// order.
fn covered_spans<'a>(doc: &'a Document, start: &Point, end: &Point) -> Vec<(Path, &'a Span)> {
    let (&[start_block, start_child], &[end_block, end_child]) =
        (start.path.as_slice(), end.path.as_slice())
    else {
        return Vec::new();
    };
    let first = (start_block, start_child);
    let last = (end_block, end_child);

    let mut covered = Vec::new();
    for block_ix in start_block..=end_block.min(doc.children.len().saturating_sub(1)) {
        let Some(block) = doc.block(block_ix) else {
            continue;
        };
        for (child_ix, node) in block.children.iter().enumerate() {
            let Node::Span(span) = node else {
                continue;
            };
            let here = (block_ix, child_ix);
            if here < first || here > last {
                continue;
            }
            let lo = if here == first { start.offset } else { 0 };
            let hi = if here == last {
                end.offset.min(span.text.len())
            } else {
                span.text.len()
            };
            if lo < hi {
                covered.push((vec![block_ix, child_ix], span));
            }
        }
    }
    covered
}

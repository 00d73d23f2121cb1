use tracing::debug;

use crate::core::EditorState;
use crate::error::ApplyError;
use crate::marks::{MarkSet, Schema};
use crate::ops::{NodePatch, Op, Path};
use crate::substrate::Apply;

/// Keeps annotations from growing when typing at their trailing edge.
///
/// Text inserted at the end of a span that carries an annotation lands in
/// a new trailing span holding only the decorators of the current marks.
/// Every other op passes through to `inner` untouched.
pub struct AnnotationBoundary<A> {
    inner: A,
    schema: Schema,
}

impl<A: Apply> AnnotationBoundary<A> {
    pub fn new(inner: A, schema: Schema) -> Self {
        Self { inner, schema }
    }

    fn boundary(&self, state: &EditorState, op: &Op) -> Option<Boundary> {
        let Op::InsertText { path, offset, text } = op else {
            return None;
        };
        if text.is_empty() {
            return None;
        }
        let selection = state.selection()?;
        if !selection.is_collapsed()
            || &selection.focus.path != path
            || selection.focus.offset != *offset
        {
            return None;
        }
        let current = state.current_marks();
        if !self.schema.has_annotation(&current) {
            return None;
        }
        let span = state.doc().span(path)?;
        if span.text.is_empty() || *offset != span.text.len() || span.marks().is_empty() {
            return None;
        }
        let (&last, parent) = path.split_last()?;
        let mut next_path = parent.to_vec();
        next_path.push(last + 1);
        Some(Boundary {
            path: path.clone(),
            next_path,
            offset: *offset,
            span_marks: span.marks().clone(),
            trailing: self.schema.decorators_of(&current),
        })
    }
}

/// An insert at the cursor's trailing annotation edge.
struct Boundary {
    path: Path,
    next_path: Path,
    offset: usize,
    span_marks: MarkSet,
    trailing: MarkSet,
}

impl<A: Apply> Apply for AnnotationBoundary<A> {
    fn apply(&self, state: &mut EditorState, op: Op) -> Result<(), ApplyError> {
        let Some(boundary) = self.boundary(state, &op) else {
            return self.inner.apply(state, op);
        };
        debug!(
            path = ?boundary.path,
            offset = boundary.offset,
            trailing = ?boundary.trailing,
            "typing past annotation edge"
        );

        self.inner.apply(state, op)?;
        self.inner.apply(
            state,
            Op::SplitNode {
                path: boundary.path,
                position: boundary.offset,
                properties: NodePatch::marks(boundary.span_marks),
            },
        )?;
        self.inner
            .apply(state, Op::set_marks(boundary.next_path, boundary.trailing))
    }
}

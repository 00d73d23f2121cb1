//! Structural primitives over the block tree.
//!
//! Nothing in here knows about marks beyond carrying them as node
//! properties; the rich-text invariants live in `normalize`.

use tracing::trace;

use crate::core::{Block, Document, EditorState, Node, Point, Selection, Span};
use crate::error::{ApplyError, PathError};
use crate::ops::{AttrPatch, NodePatch, Op, patch_apply};

/// The single "apply one op" capability. Decorators wrap an inner `Apply`
/// and may issue extra ops around the one they were given.
pub trait Apply: Send + Sync {
    fn apply(&self, state: &mut EditorState, op: Op) -> Result<(), ApplyError>;
}

/// Applies ops to the tree and records them, with their inverses, in the
/// state's batch log.
#[derive(Debug, Clone, Copy, Default)]
pub struct Substrate;

impl Apply for Substrate {
    fn apply(&self, state: &mut EditorState, op: Op) -> Result<(), ApplyError> {
        let Applied { op, inverse } = apply_op_to(&mut state.doc, &mut state.selection, op)?;
        trace!(?op, "applied op");
        state.applied.push(op);
        state.inverse.push(inverse);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    /// The op as applied, with offsets clamped and merge properties resolved.
    pub op: Op,
    pub inverse: Op,
}

pub fn apply_op_to(
    doc: &mut Document,
    selection: &mut Option<Selection>,
    op: Op,
) -> Result<Applied, ApplyError> {
    match op {
        Op::InsertText { path, offset, text } => {
            let span = span_mut(doc, &path)?;
            let offset = clamp_to_char_boundary(&span.text, offset);
            span.text.insert_str(offset, &text);
            let len = text.len();
            transform_selection(selection, |point, forward| {
                transform_point_insert_text(point, &path, offset, len, forward)
            });
            let inverse = Op::RemoveText {
                path: path.clone(),
                range: offset..offset + len,
            };
            Ok(Applied {
                op: Op::InsertText { path, offset, text },
                inverse,
            })
        }
        Op::RemoveText { path, range } => {
            let span = span_mut(doc, &path)?;
            let start = clamp_to_char_boundary(&span.text, range.start.min(span.text.len()));
            let end = clamp_to_char_boundary(&span.text, range.end.min(span.text.len()));
            if start >= end {
                return Ok(Applied {
                    op: Op::RemoveText {
                        path: path.clone(),
                        range: start..start,
                    },
                    inverse: Op::InsertText {
                        path,
                        offset: start,
                        text: String::new(),
                    },
                });
            }
            let removed = span.text[start..end].to_string();
            span.text.replace_range(start..end, "");
            transform_selection(selection, |point, _| {
                transform_point_remove_text(point, &path, start..end)
            });
            Ok(Applied {
                op: Op::RemoveText {
                    path: path.clone(),
                    range: start..end,
                },
                inverse: Op::InsertText {
                    path,
                    offset: start,
                    text: removed,
                },
            })
        }
        Op::InsertNode { path, node } => {
            insert_node(doc, &path, node.clone())?;
            transform_selection(selection, |point, _| transform_point_insert_node(point, &path));
            Ok(Applied {
                op: Op::InsertNode {
                    path: path.clone(),
                    node,
                },
                inverse: Op::RemoveNode { path },
            })
        }
        Op::RemoveNode { path } => {
            let removed = remove_node(doc, &path)?;
            let doc: &Document = doc;
            transform_selection(selection, |point, _| {
                transform_point_remove_node(point, &path, doc)
            });
            Ok(Applied {
                op: Op::RemoveNode { path: path.clone() },
                inverse: Op::InsertNode {
                    path,
                    node: removed,
                },
            })
        }
        Op::SplitNode {
            path,
            position,
            properties,
        } => {
            let (&index, parent) = path
                .split_last()
                .ok_or_else(|| PathError("Empty split path".into()))?;
            let mut next_path = parent.to_vec();
            next_path.push(index + 1);

            let (position, new_node, is_text) = match node_mut(doc, &path)? {
                Node::Span(span) => {
                    let position = clamp_to_char_boundary(&span.text, position);
                    let text = span.text.split_off(position);
                    let new_span = Span {
                        text,
                        marks: properties.marks.clone(),
                    };
                    (position, Node::Span(new_span), true)
                }
                Node::Block(block) => {
                    let position = position.min(block.children.len());
                    let mut new_block = Block::new(block.children.split_off(position));
                    if let Some(style) = &properties.style {
                        new_block.style = style.clone();
                    }
                    if let Some(mark_defs) = &properties.mark_defs {
                        new_block.mark_defs = mark_defs.clone();
                    }
                    new_block.attrs = properties.attrs.set.clone();
                    (position, Node::Block(new_block), false)
                }
                Node::Object(_) => {
                    return Err(ApplyError::InvalidOperation(format!(
                        "Cannot split object node at {path:?}"
                    )));
                }
            };
            insert_node(doc, &next_path, new_node)?;
            transform_selection(selection, |point, forward| {
                transform_point_split(point, &path, position, is_text, forward)
            });
            let inverse = Op::MergeNode {
                path: next_path,
                position,
                properties: properties.clone(),
            };
            Ok(Applied {
                op: Op::SplitNode {
                    path,
                    position,
                    properties,
                },
                inverse,
            })
        }
        Op::MergeNode { path, .. } => {
            let (&index, parent) = path
                .split_last()
                .ok_or_else(|| PathError("Empty merge path".into()))?;
            if index == 0 {
                return Err(ApplyError::InvalidOperation(format!(
                    "Cannot merge first child at {path:?}"
                )));
            }
            let mut prev_path = parent.to_vec();
            prev_path.push(index - 1);

            match (doc.node(&prev_path), doc.node(&path)) {
                (Some(Node::Span(_)), Some(Node::Span(_)))
                | (Some(Node::Block(_)), Some(Node::Block(_))) => {}
                (Some(_), Some(_)) => {
                    return Err(ApplyError::InvalidOperation(format!(
                        "Cannot merge mismatched nodes at {path:?}"
                    )));
                }
                _ => {
                    return Err(PathError(format!("Merge path out of bounds: {path:?}")).into());
                }
            }

            let removed = remove_node(doc, &path)?;
            let (position, properties, is_text) = match (node_mut(doc, &prev_path)?, removed) {
                (Node::Span(target), Node::Span(removed)) => {
                    let position = target.text.len();
                    target.text.push_str(&removed.text);
                    let properties = NodePatch {
                        marks: removed.marks,
                        ..NodePatch::default()
                    };
                    (position, properties, true)
                }
                (Node::Block(target), Node::Block(removed)) => {
                    let position = target.children.len();
                    target.children.extend(removed.children);
                    let properties = NodePatch {
                        marks: None,
                        mark_defs: Some(removed.mark_defs),
                        style: Some(removed.style),
                        attrs: AttrPatch {
                            set: removed.attrs,
                            remove: Vec::new(),
                        },
                    };
                    (position, properties, false)
                }
                _ => {
                    return Err(ApplyError::InvalidOperation(format!(
                        "Cannot merge mismatched nodes at {path:?}"
                    )));
                }
            };
            transform_selection(selection, |point, _| {
                transform_point_merge(point, &path, position, is_text)
            });
            let inverse = Op::SplitNode {
                path: prev_path,
                position,
                properties: properties.clone(),
            };
            Ok(Applied {
                op: Op::MergeNode {
                    path,
                    position,
                    properties,
                },
                inverse,
            })
        }
        Op::SetNode { path, patch } => {
            let old = set_node_props(node_mut(doc, &path)?, &patch)?;
            Ok(Applied {
                op: Op::SetNode {
                    path: path.clone(),
                    patch,
                },
                inverse: Op::SetNode { path, patch: old },
            })
        }
    }
}

fn set_node_props(node: &mut Node, patch: &NodePatch) -> Result<NodePatch, ApplyError> {
    let mut old = NodePatch::default();
    match node {
        Node::Span(span) => {
            if patch.mark_defs.is_some() || patch.style.is_some() || !patch.attrs.is_empty() {
                return Err(ApplyError::InvalidOperation(
                    "Span only accepts marks".into(),
                ));
            }
            if let Some(marks) = &patch.marks {
                old.marks = Some(span.marks.replace(marks.clone()).unwrap_or_default());
            }
        }
        Node::Block(block) => {
            if patch.marks.is_some() {
                return Err(ApplyError::InvalidOperation("Block has no marks".into()));
            }
            if let Some(style) = &patch.style {
                old.style = Some(std::mem::replace(&mut block.style, style.clone()));
            }
            if let Some(mark_defs) = &patch.mark_defs {
                old.mark_defs = Some(std::mem::replace(&mut block.mark_defs, mark_defs.clone()));
            }
            old.attrs = patch_apply(&mut block.attrs, &patch.attrs);
        }
        Node::Object(object) => {
            if patch.marks.is_some() || patch.mark_defs.is_some() || patch.style.is_some() {
                return Err(ApplyError::InvalidOperation(
                    "Object only accepts attrs".into(),
                ));
            }
            old.attrs = patch_apply(&mut object.attrs, &patch.attrs);
        }
    }
    Ok(old)
}

pub(crate) fn clamp_to_char_boundary(s: &str, mut ix: usize) -> usize {
    ix = ix.min(s.len());
    while ix > 0 && !s.is_char_boundary(ix) {
        ix -= 1;
    }
    ix
}

/// Calls `f` on both selection points with their affinity: the start of an
/// expanded selection leans forward and the end backward, so edits at the
/// edges keep the selected content selected. Collapsed points lean forward.
fn transform_selection(selection: &mut Option<Selection>, mut f: impl FnMut(&mut Point, bool)) {
    let Some(sel) = selection.as_mut() else {
        return;
    };
    let collapsed = sel.is_collapsed();
    let anchor_first = sel.anchor <= sel.focus;
    f(&mut sel.anchor, collapsed || anchor_first);
    f(&mut sel.focus, collapsed || !anchor_first);
}

fn transform_point_insert_text(
    point: &mut Point,
    path: &[usize],
    offset: usize,
    len: usize,
    forward: bool,
) {
    if point.path == path && (point.offset > offset || (point.offset == offset && forward)) {
        point.offset = point.offset.saturating_add(len);
    }
}

fn transform_point_remove_text(point: &mut Point, path: &[usize], range: std::ops::Range<usize>) {
    if point.path != path || point.offset <= range.start {
        return;
    }
    if point.offset >= range.end {
        point.offset -= range.end - range.start;
    } else {
        point.offset = range.start;
    }
}

fn transform_point_insert_node(point: &mut Point, path: &[usize]) {
    let Some((&index, parent)) = path.split_last() else {
        return;
    };
    let depth = parent.len();
    if point.path.len() <= depth || !point.path.starts_with(parent) {
        return;
    }
    if point.path[depth] >= index {
        point.path[depth] += 1;
    }
}

fn transform_point_remove_node(point: &mut Point, path: &[usize], doc_after_remove: &Document) {
    let Some((&index, parent)) = path.split_last() else {
        return;
    };
    let depth = parent.len();
    if point.path.len() <= depth || !point.path.starts_with(parent) {
        return;
    }
    let ix = point.path[depth];
    if ix > index {
        point.path[depth] = ix - 1;
        return;
    }
    if ix < index {
        return;
    }

    // Point was inside the removed subtree. Map it to a nearby point.
    let mut sibling = parent.to_vec();
    if index > 0 {
        sibling.push(index - 1);
        *point = edge_point(doc_after_remove, &sibling, Edge::End)
            .unwrap_or_else(|| Point::new(sibling, 0));
    } else {
        sibling.push(index);
        *point = edge_point(doc_after_remove, &sibling, Edge::Start)
            .unwrap_or_else(|| Point::new(sibling, 0));
    }
}

fn transform_point_split(
    point: &mut Point,
    path: &[usize],
    position: usize,
    is_text: bool,
    forward: bool,
) {
    let Some((&index, parent)) = path.split_last() else {
        return;
    };
    let depth = parent.len();
    if point.path.len() <= depth || !point.path.starts_with(parent) {
        return;
    }
    let ix = point.path[depth];
    if ix > index {
        point.path[depth] += 1;
        return;
    }
    if ix < index {
        return;
    }
    if is_text {
        if point.path.len() == depth + 1
            && (point.offset > position || (point.offset == position && forward))
        {
            point.path[depth] += 1;
            point.offset -= position;
        }
    } else if point.path.len() > depth + 1 && point.path[depth + 1] >= position {
        point.path[depth] += 1;
        point.path[depth + 1] -= position;
    }
}

fn transform_point_merge(point: &mut Point, path: &[usize], position: usize, is_text: bool) {
    let Some((&index, parent)) = path.split_last() else {
        return;
    };
    let depth = parent.len();
    if point.path.len() <= depth || !point.path.starts_with(parent) {
        return;
    }
    let ix = point.path[depth];
    if ix > index {
        point.path[depth] = ix - 1;
        return;
    }
    if ix < index {
        return;
    }
    point.path[depth] = index - 1;
    if is_text {
        point.offset += position;
    } else if point.path.len() > depth + 1 {
        point.path[depth + 1] += position;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Start,
    End,
}

fn edge_point(doc: &Document, path: &[usize], edge: Edge) -> Option<Point> {
    match doc.node(path)? {
        Node::Span(span) => {
            let offset = match edge {
                Edge::Start => 0,
                Edge::End => span.text.len(),
            };
            Some(Point::new(path.to_vec(), offset))
        }
        Node::Block(block) => {
            let mut spans = block
                .children
                .iter()
                .enumerate()
                .filter_map(|(ix, node)| node.as_span().map(|span| (ix, span)));
            let (ix, span) = match edge {
                Edge::Start => spans.next()?,
                Edge::End => spans.last()?,
            };
            let mut span_path = path.to_vec();
            span_path.push(ix);
            let offset = match edge {
                Edge::Start => 0,
                Edge::End => span.text.len(),
            };
            Some(Point::new(span_path, offset))
        }
        Node::Object(_) => None,
    }
}

/// Resolves both points of `selection` to existing spans, clamping offsets.
/// Returns `None` when the document holds no span at all.
pub fn normalize_selection(doc: &Document, selection: &Selection) -> Option<Selection> {
    let fallback = first_text_point(doc)?;
    let anchor = normalize_point(doc, &selection.anchor)
        .or_else(|| normalize_point(doc, &selection.focus))
        .unwrap_or(fallback);
    let focus = normalize_point(doc, &selection.focus).unwrap_or_else(|| anchor.clone());
    Some(Selection { anchor, focus })
}

fn first_text_point(doc: &Document) -> Option<Point> {
    (0..doc.children.len()).find_map(|ix| edge_point(doc, &[ix], Edge::Start))
}

fn normalize_point(doc: &Document, point: &Point) -> Option<Point> {
    let (&wanted, rest) = point.path.split_first()?;
    if doc.children.is_empty() {
        return None;
    }
    let block_ix = wanted.min(doc.children.len() - 1);
    let Node::Block(block) = &doc.children[block_ix] else {
        return None;
    };
    if block.children.is_empty() {
        return None;
    }

    let Some(&wanted_child) = rest.first() else {
        return edge_point(doc, &[block_ix], Edge::Start);
    };
    let child_ix = wanted_child.min(block.children.len() - 1);
    if let Node::Span(span) = &block.children[child_ix] {
        return Some(Point::new(
            vec![block_ix, child_ix],
            clamp_to_char_boundary(&span.text, point.offset),
        ));
    }

    // Landed on an inline object: prefer the end of the span before it.
    let before = (0..child_ix).rev().find_map(|ix| match &block.children[ix] {
        Node::Span(span) => Some(Point::new(vec![block_ix, ix], span.text.len())),
        _ => None,
    });
    before.or_else(|| {
        (child_ix + 1..block.children.len()).find_map(|ix| match &block.children[ix] {
            Node::Span(_) => Some(Point::new(vec![block_ix, ix], 0)),
            _ => None,
        })
    })
}

fn node_mut<'a>(doc: &'a mut Document, path: &[usize]) -> Result<&'a mut Node, PathError> {
    let Some((&first, rest)) = path.split_first() else {
        return Err(PathError("Empty path".into()));
    };
    let len = doc.children.len();
    let mut node = doc.children.get_mut(first).ok_or_else(|| {
        PathError(format!("Path out of bounds at depth 0: {first} >= {len}"))
    })?;
    for (depth, &ix) in rest.iter().enumerate() {
        node = match node {
            Node::Block(block) => {
                let len = block.children.len();
                block.children.get_mut(ix).ok_or_else(|| {
                    PathError(format!(
                        "Path out of bounds at depth {}: {ix} >= {len}",
                        depth + 1
                    ))
                })?
            }
            Node::Span(_) | Node::Object(_) => {
                return Err(PathError(format!("Non-container node at depth {depth}")));
            }
        };
    }
    Ok(node)
}

fn span_mut<'a>(doc: &'a mut Document, path: &[usize]) -> Result<&'a mut Span, PathError> {
    match node_mut(doc, path)? {
        Node::Span(span) => Ok(span),
        _ => Err(PathError(format!("Expected span at {path:?}"))),
    }
}

fn children_mut<'a>(
    doc: &'a mut Document,
    parent_path: &[usize],
) -> Result<&'a mut Vec<Node>, PathError> {
    if parent_path.is_empty() {
        return Ok(&mut doc.children);
    }
    match node_mut(doc, parent_path)? {
        Node::Block(block) => Ok(&mut block.children),
        Node::Span(_) | Node::Object(_) => {
            Err(PathError("Parent is not a container".into()))
        }
    }
}

fn insert_node(doc: &mut Document, path: &[usize], node: Node) -> Result<(), PathError> {
    let Some((&index, parent_path)) = path.split_last() else {
        return Err(PathError("Empty insert path".into()));
    };
    let children = children_mut(doc, parent_path)?;
    if index > children.len() {
        return Err(PathError(format!(
            "Insert index out of bounds: {index} > {}",
            children.len()
        )));
    }
    children.insert(index, node);
    Ok(())
}

fn remove_node(doc: &mut Document, path: &[usize]) -> Result<Node, PathError> {
    let Some((&index, parent_path)) = path.split_last() else {
        return Err(PathError("Empty remove path".into()));
    };
    let children = children_mut(doc, parent_path)?;
    if index >= children.len() {
        return Err(PathError(format!(
            "Remove index out of bounds: {index} >= {}",
            children.len()
        )));
    }
    Ok(children.remove(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marks::MarkSet;

    fn doc() -> Document {
        Document::new(vec![
            Node::block([Span::new("hello", ["strong"]), Span::plain(" world")]),
            Node::paragraph("second"),
        ])
    }

    fn apply(doc: &mut Document, selection: &mut Option<Selection>, op: Op) -> Applied {
        apply_op_to(doc, selection, op).unwrap()
    }

    #[test]
    fn split_and_merge_span_are_inverse() {
        let mut d = doc();
        let original = d.clone();
        let mut sel = Some(Selection::collapsed(Point::new(vec![0, 0], 4)));

        let applied = apply(
            &mut d,
            &mut sel,
            Op::SplitNode {
                path: vec![0, 0],
                position: 2,
                properties: NodePatch::marks(["strong"].into_iter().collect()),
            },
        );
        assert_eq!(d.span(&[0, 0]).unwrap().text, "he");
        assert_eq!(d.span(&[0, 1]).unwrap().text, "llo");
        assert_eq!(sel.as_ref().unwrap().focus, Point::new(vec![0, 1], 2));

        let merged = apply(&mut d, &mut sel, applied.inverse);
        assert_eq!(d, original);
        assert_eq!(sel.as_ref().unwrap().focus, Point::new(vec![0, 0], 4));
        assert_eq!(
            merged.op,
            Op::MergeNode {
                path: vec![0, 1],
                position: 2,
                properties: NodePatch::marks(["strong"].into_iter().collect()),
            }
        );
    }

    #[test]
    fn split_block_moves_following_children() {
        let mut d = doc();
        let mut sel = Some(Selection::collapsed(Point::new(vec![0, 1], 3)));
        apply(
            &mut d,
            &mut sel,
            Op::SplitNode {
                path: vec![0],
                position: 1,
                properties: NodePatch::style("h1"),
            },
        );
        assert_eq!(d.children.len(), 3);
        assert_eq!(d.block(0).unwrap().text(), "hello");
        let new_block = d.block(1).unwrap();
        assert_eq!(new_block.style, "h1");
        assert_eq!(new_block.text(), " world");
        assert_eq!(sel.unwrap().focus, Point::new(vec![1, 0], 3));
    }

    #[test]
    fn merge_block_resolves_absorbed_properties() {
        let mut d = doc();
        if let Node::Block(block) = &mut d.children[1] {
            block.style = "h2".into();
        }
        let mut sel = Some(Selection::collapsed(Point::new(vec![1, 0], 2)));
        let applied = apply(&mut d, &mut sel, Op::merge_node(vec![1]));

        let Op::MergeNode {
            position,
            properties,
            ..
        } = &applied.op
        else {
            panic!("expected merge op");
        };
        assert_eq!(*position, 2);
        assert_eq!(properties.style.as_deref(), Some("h2"));
        assert_eq!(d.children.len(), 1);
        assert_eq!(d.block(0).unwrap().text(), "hello worldsecond");
        assert_eq!(sel.unwrap().focus, Point::new(vec![0, 2], 2));
    }

    #[test]
    fn merge_rejects_mismatched_and_first_children() {
        let mut d = doc();
        let mut sel = None;
        assert!(matches!(
            apply_op_to(&mut d, &mut sel, Op::merge_node(vec![0])),
            Err(ApplyError::InvalidOperation(_))
        ));
        assert!(matches!(
            apply_op_to(&mut d, &mut sel, Op::merge_node(vec![5])),
            Err(ApplyError::InvalidPath(_))
        ));
    }

    #[test]
    fn expanded_selection_keeps_its_content_across_edge_splits() {
        let mut d = doc();
        // Select "ll" of "hello".
        let mut sel = Some(Selection::new(
            Point::new(vec![0, 0], 2),
            Point::new(vec![0, 0], 4),
        ));
        let strong: MarkSet = ["strong"].into_iter().collect();
        apply(
            &mut d,
            &mut sel,
            Op::SplitNode {
                path: vec![0, 0],
                position: 4,
                properties: NodePatch::marks(strong.clone()),
            },
        );
        apply(
            &mut d,
            &mut sel,
            Op::SplitNode {
                path: vec![0, 0],
                position: 2,
                properties: NodePatch::marks(strong),
            },
        );
        let sel = sel.unwrap();
        assert_eq!(sel.anchor, Point::new(vec![0, 1], 0));
        assert_eq!(sel.focus, Point::new(vec![0, 1], 2));
    }

    #[test]
    fn removing_cursor_span_moves_cursor_to_previous_end() {
        let mut d = doc();
        let mut sel = Some(Selection::collapsed(Point::new(vec![0, 1], 2)));
        apply(&mut d, &mut sel, Op::RemoveNode { path: vec![0, 1] });
        assert_eq!(sel.unwrap().focus, Point::new(vec![0, 0], 5));
    }

    #[test]
    fn set_node_validates_before_mutating() {
        let mut d = doc();
        let mut sel = None;
        let err = apply_op_to(
            &mut d,
            &mut sel,
            Op::SetNode {
                path: vec![0, 0],
                patch: NodePatch::style("h1"),
            },
        );
        assert!(matches!(err, Err(ApplyError::InvalidOperation(_))));
        assert_eq!(d, doc());
    }

    #[test]
    fn normalize_selection_clamps_to_existing_text() {
        let d = doc();
        let sel = Selection::collapsed(Point::new(vec![7, 9], 99));
        let sel = normalize_selection(&d, &sel).unwrap();
        assert_eq!(sel.focus, Point::new(vec![1, 0], 6));
    }
}

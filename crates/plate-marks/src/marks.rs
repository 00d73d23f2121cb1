use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::{Attrs, Block, Span};

pub type MarkId = String;

/// A set of mark identifiers attached to a span.
///
/// Membership is what matters: two spans carry "the same marks" iff their
/// sets are equal. Serialization is sorted, which keeps fixtures stable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarkSet(BTreeSet<MarkId>);

static EMPTY_MARKS: MarkSet = MarkSet(BTreeSet::new());

impl MarkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn empty() -> &'static MarkSet {
        &EMPTY_MARKS
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains(id)
    }

    pub fn insert(&mut self, id: impl Into<MarkId>) -> bool {
        self.0.insert(id.into())
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.0.remove(id)
    }

    /// `self` minus `id`, plus `id`.
    pub fn with(&self, id: &str) -> Self {
        let mut next = self.without(id);
        next.insert(id);
        next
    }

    pub fn without(&self, id: &str) -> Self {
        let mut next = self.clone();
        next.remove(id);
        next
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<MarkId>> FromIterator<S> for MarkSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl<'a> IntoIterator for &'a MarkSet {
    type Item = &'a MarkId;
    type IntoIter = std::collections::btree_set::Iter<'a, MarkId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// An annotation definition stored once per block and referenced by key
/// from span marks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkDef {
    pub key: String,
    pub kind: String,
    #[serde(default, flatten)]
    pub payload: Attrs,
}

impl MarkDef {
    pub fn new(key: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: kind.into(),
            payload: Attrs::default(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(name.into(), value);
        self
    }
}

/// Decorator names known to the editor. Any other mark identifier is an
/// annotation reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    decorators: BTreeSet<String>,
}

impl Schema {
    pub fn new<I, S>(decorators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            decorators: decorators.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_decorator(&self, id: &str) -> bool {
        self.decorators.contains(id)
    }

    /// The decorator-only subset of `marks`.
    pub fn decorators_of(&self, marks: &MarkSet) -> MarkSet {
        marks.iter().filter(|id| self.is_decorator(id)).collect()
    }

    pub fn has_annotation(&self, marks: &MarkSet) -> bool {
        marks.iter().any(|id| !self.is_decorator(id))
    }
}

pub fn spans_equal_marks(a: &Span, b: &Span) -> bool {
    a.marks() == b.marks()
}

pub fn span_missing_marks(span: &Span) -> bool {
    span.marks.is_none()
}

pub fn is_empty_formatted_span(span: &Span) -> bool {
    span.text.is_empty() && !span.marks().is_empty()
}

pub fn referenced_keys(block: &Block) -> BTreeSet<&str> {
    block.spans().flat_map(|span| span.marks().iter()).collect()
}

pub fn is_orphan_definition(def: &MarkDef, block: &Block) -> bool {
    !block.spans().any(|span| span.marks().contains(&def.key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Node;

    fn block(children: Vec<Node>, defs: Vec<MarkDef>) -> Block {
        Block::new(children).with_mark_defs(defs)
    }

    #[test]
    fn mark_sets_compare_by_membership() {
        let a: MarkSet = ["strong", "link-1"].into_iter().collect();
        let b: MarkSet = ["link-1", "strong"].into_iter().collect();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_value(&b).unwrap(),
            serde_json::json!(["link-1", "strong"])
        );
    }

    #[test]
    fn with_does_not_duplicate() {
        let marks: MarkSet = ["em"].into_iter().collect();
        let next = marks.with("em").with("strong");
        assert_eq!(next.len(), 2);
        assert!(next.contains("em"));
        assert!(next.contains("strong"));
        assert_eq!(next.without("em").len(), 1);
    }

    #[test]
    fn missing_marks_compare_equal_to_empty() {
        let bare = Span {
            text: "a".into(),
            marks: None,
        };
        let empty = Span::plain("b");
        assert!(spans_equal_marks(&bare, &empty));
        assert!(span_missing_marks(&bare));
        assert!(!span_missing_marks(&empty));
    }

    #[test]
    fn empty_formatted_span_needs_marks_and_no_text() {
        assert!(is_empty_formatted_span(&Span::new("", ["strong"])));
        assert!(!is_empty_formatted_span(&Span::new("x", ["strong"])));
        assert!(!is_empty_formatted_span(&Span::plain("")));
    }

    #[test]
    fn orphan_definitions_are_the_unreferenced_ones() {
        let used = MarkDef::new("link-1", "link");
        let unused = MarkDef::new("link-2", "link");
        let block = block(
            vec![
                Node::Span(Span::new("hi", ["link-1", "strong"])),
                Node::Span(Span::plain(" there")),
            ],
            vec![used.clone(), unused.clone()],
        );
        assert!(!is_orphan_definition(&used, &block));
        assert!(is_orphan_definition(&unused, &block));
        assert_eq!(
            referenced_keys(&block).into_iter().collect::<Vec<_>>(),
            vec!["link-1", "strong"]
        );
    }

    #[test]
    fn schema_splits_decorators_from_annotations() {
        let schema = Schema::new(["strong", "em"]);
        let marks: MarkSet = ["strong", "link-1"].into_iter().collect();
        assert!(schema.has_annotation(&marks));
        assert_eq!(
            schema.decorators_of(&marks),
            ["strong"].into_iter().collect::<MarkSet>()
        );
        assert!(!schema.has_annotation(&schema.decorators_of(&marks)));
    }
}

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::core::{Attrs, Selection};
use crate::marks::{MarkDef, MarkSet};

pub type Path = Vec<usize>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    InsertText {
        #[serde(default)]
        path: Path,
        offset: usize,
        text: String,
    },
    RemoveText {
        #[serde(default)]
        path: Path,
        range: Range<usize>,
    },
    InsertNode {
        #[serde(default)]
        path: Path,
        node: crate::core::Node,
    },
    RemoveNode {
        #[serde(default)]
        path: Path,
    },
    /// Split the node at `path`: a span at byte `position`, a block at child
    /// index `position`. The new right sibling receives exactly `properties`.
    SplitNode {
        #[serde(default)]
        path: Path,
        position: usize,
        #[serde(default)]
        properties: NodePatch,
    },
    /// Merge the node at `path` into its previous sibling. `position` and
    /// `properties` are resolved from the tree when the op is applied.
    MergeNode {
        #[serde(default)]
        path: Path,
        #[serde(default)]
        position: usize,
        #[serde(default)]
        properties: NodePatch,
    },
    SetNode {
        #[serde(default)]
        path: Path,
        patch: NodePatch,
    },
}

impl Op {
    pub fn merge_node(path: Path) -> Self {
        Op::MergeNode {
            path,
            position: 0,
            properties: NodePatch::default(),
        }
    }

    pub fn set_marks(path: Path, marks: MarkSet) -> Self {
        Op::SetNode {
            path,
            patch: NodePatch::marks(marks),
        }
    }

    pub fn path(&self) -> &[usize] {
        match self {
            Op::InsertText { path, .. }
            | Op::RemoveText { path, .. }
            | Op::InsertNode { path, .. }
            | Op::RemoveNode { path }
            | Op::SplitNode { path, .. }
            | Op::MergeNode { path, .. }
            | Op::SetNode { path, .. } => path,
        }
    }
}

/// Partial node properties. Unset fields are left alone by `SetNode` and
/// take their defaults on the new node of a `SplitNode`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marks: Option<MarkSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mark_defs: Option<Vec<MarkDef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "AttrPatch::is_empty")]
    pub attrs: AttrPatch,
}

impl NodePatch {
    pub fn marks(marks: MarkSet) -> Self {
        Self {
            marks: Some(marks),
            ..Self::default()
        }
    }

    pub fn mark_defs(mark_defs: Vec<MarkDef>) -> Self {
        Self {
            mark_defs: Some(mark_defs),
            ..Self::default()
        }
    }

    pub fn style(style: impl Into<String>) -> Self {
        Self {
            style: Some(style.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_none()
            && self.mark_defs.is_none()
            && self.style.is_none()
            && self.attrs.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttrPatch {
    #[serde(default)]
    pub set: Attrs,
    #[serde(default)]
    pub remove: Vec<String>,
}

impl AttrPatch {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }
}

pub(crate) fn patch_apply(attrs: &mut Attrs, patch: &AttrPatch) -> AttrPatch {
    let mut old_set: Attrs = Attrs::new();
    let mut old_remove: Vec<String> = Vec::new();

    for (k, v) in &patch.set {
        if let Some(prev) = attrs.insert(k.clone(), v.clone()) {
            old_set.insert(k.clone(), prev);
        } else {
            old_remove.push(k.clone());
        }
    }

    for key in &patch.remove {
        if let Some(prev) = attrs.remove(key) {
            old_set.insert(key.clone(), prev);
        }
    }

    AttrPatch {
        set: old_set,
        remove: old_remove,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default)]
    pub ops: Vec<Op>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_after: Option<Selection>,
    #[serde(default)]
    pub meta: TransactionMeta,
}

impl Transaction {
    pub fn new(ops: Vec<Op>) -> Self {
        Self {
            ops,
            selection_after: None,
            meta: TransactionMeta::default(),
        }
    }

    pub fn selection_after(mut self, selection_after: Selection) -> Self {
        self.selection_after = Some(selection_after);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.meta.source = Some(source.into());
        self
    }
}

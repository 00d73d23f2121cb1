#![allow(dead_code)]

use plate_marks::{
    Block, Document, Editor, EditorConfig, Node, Point, Selection, is_empty_formatted_span,
    is_orphan_definition, span_missing_marks, spans_equal_marks,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn doc(value: serde_json::Value) -> Document {
    serde_json::from_value(value).unwrap()
}

pub fn editor(doc: Document, selection: Selection) -> Editor {
    init_tracing();
    Editor::new(doc, Some(selection), EditorConfig::default())
}

pub fn caret(block: usize, child: usize, offset: usize) -> Selection {
    Selection::collapsed(Point::new(vec![block, child], offset))
}

pub fn range(anchor: (usize, usize, usize), focus: (usize, usize, usize)) -> Selection {
    Selection::new(
        Point::new(vec![anchor.0, anchor.1], anchor.2),
        Point::new(vec![focus.0, focus.1], focus.2),
    )
}

pub fn block(doc: &Document, ix: usize) -> &Block {
    let Some(block) = doc.block(ix) else {
        panic!("expected block at {ix}");
    };
    block
}

/// `(text, marks)` for every span of block `ix`.
pub fn spans(doc: &Document, ix: usize) -> Vec<(String, Vec<String>)> {
    block(doc, ix)
        .spans()
        .map(|span| {
            (
                span.text.clone(),
                span.marks().iter().map(String::from).collect(),
            )
        })
        .collect()
}

pub fn span(text: &str, marks: &[&str]) -> (String, Vec<String>) {
    (
        text.to_string(),
        marks.iter().map(|mark| mark.to_string()).collect(),
    )
}

pub fn def_keys(doc: &Document, ix: usize) -> Vec<String> {
    block(doc, ix)
        .mark_defs
        .iter()
        .map(|def| def.key.clone())
        .collect()
}

pub fn assert_invariants(doc: &Document) {
    for (ix, node) in doc.children.iter().enumerate() {
        let Node::Block(block) = node else {
            continue;
        };
        assert!(block.spans().next().is_some(), "block {ix} has no span");
        for span in block.spans() {
            assert!(!span_missing_marks(span), "block {ix}: span without marks");
            assert!(
                !is_empty_formatted_span(span),
                "block {ix}: empty span with marks {:?}",
                span.marks()
            );
        }
        for pair in block.children.windows(2) {
            if let [Node::Span(left), Node::Span(right)] = pair {
                assert!(
                    !spans_equal_marks(left, right),
                    "block {ix}: adjacent spans {:?} and {:?} share marks",
                    left.text,
                    right.text
                );
            }
        }
        for def in &block.mark_defs {
            assert!(
                !is_orphan_definition(def, block),
                "block {ix}: orphan definition {}",
                def.key
            );
        }
    }
}

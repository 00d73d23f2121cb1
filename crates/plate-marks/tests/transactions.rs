mod common;

use common::{caret, editor, range, span, spans};
use plate_marks::{
    ApplyError, Document, EditorChange, Node, Op, Transaction, apply_op_to,
};
use serde_json::json;

fn plain(text: &str) -> Document {
    Document {
        children: vec![Node::paragraph(text)],
    }
}

fn replay(doc: &Document, ops: Vec<Op>) -> Document {
    let mut doc = doc.clone();
    let mut selection = None;
    for op in ops {
        apply_op_to(&mut doc, &mut selection, op).unwrap();
    }
    doc
}

#[test]
fn failed_transaction_rolls_back_every_op() {
    let mut editor = editor(plain("abc"), caret(0, 0, 3));
    let before = editor.doc().clone();
    let rx = editor.subscribe();

    let tx = Transaction::new(vec![
        Op::InsertText {
            path: vec![0, 0],
            offset: 3,
            text: "def".into(),
        },
        Op::SplitNode {
            path: vec![0],
            position: 1,
            properties: Default::default(),
        },
        Op::RemoveNode { path: vec![7] },
    ]);
    let err = editor.apply(tx).unwrap_err();

    assert!(matches!(err, ApplyError::InvalidPath(_)));
    assert_eq!(editor.doc(), &before);
    assert_eq!(editor.selection(), Some(&caret(0, 0, 3)));
    assert!(rx.try_recv().is_err());
}

#[test]
fn invalid_operations_are_rejected_without_changes() {
    let mut editor = editor(plain("abc"), caret(0, 0, 0));
    let before = editor.doc().clone();

    let err = editor
        .apply(Transaction::new(vec![Op::merge_node(vec![0])]))
        .unwrap_err();
    assert!(matches!(err, ApplyError::InvalidOperation(_)));
    assert_eq!(editor.doc(), &before);
}

#[test]
fn inverse_ops_restore_the_previous_document() {
    let mut editor = editor(plain("abcde"), range((0, 0, 1), (0, 0, 3)));
    let rx = editor.subscribe();

    let original = editor.doc().clone();
    editor.toggle_mark("strong").unwrap();
    let formatted = editor.doc().clone();
    editor.toggle_mark("strong").unwrap();

    let mut inverses = Vec::new();
    for change in rx.try_iter() {
        if let EditorChange::Mutation { inverse, .. } = change {
            inverses.push(inverse);
        }
    }
    let [first, second] = <[Vec<Op>; 2]>::try_from(inverses).unwrap();

    assert_eq!(replay(&formatted, first), original);
    assert_eq!(replay(editor.doc(), second), formatted);
}

#[test]
fn each_action_notifies_once() {
    let mut editor = editor(plain("abcde"), range((0, 0, 1), (0, 0, 3)));
    let rx = editor.subscribe();

    editor.toggle_mark("em").unwrap();
    let changes: Vec<_> = rx.try_iter().collect();
    assert_eq!(changes.len(), 2);
    let EditorChange::Mutation { operations, inverse } = &changes[0] else {
        panic!("expected mutation first, got {changes:?}");
    };
    assert_eq!(operations.len(), inverse.len());
    assert!(operations.iter().any(|op| matches!(op, Op::SplitNode { .. })));
    assert_eq!(
        changes[1],
        EditorChange::Selection {
            selection: Some(range((0, 1, 0), (0, 1, 2)))
        }
    );

    editor.set_selection(Some(caret(0, 0, 0)));
    editor.toggle_mark("em").unwrap();
    let changes: Vec<_> = rx.try_iter().collect();
    assert_eq!(
        changes,
        vec![
            EditorChange::Selection {
                selection: Some(caret(0, 0, 0))
            },
            EditorChange::Selection {
                selection: Some(caret(0, 0, 0))
            },
        ]
    );
}

#[test]
fn batched_edits_normalize_and_notify_at_the_end() {
    let mut editor = editor(plain("ab"), caret(0, 0, 2));
    let rx = editor.subscribe();

    editor
        .without_normalizing(|editor| {
            editor.apply(Transaction::new(vec![Op::InsertNode {
                path: vec![0, 1],
                node: Node::span("cd", Vec::<String>::new()),
            }]))?;
            // Still two spans: nothing is merged mid-batch.
            assert_eq!(editor.doc().block(0).unwrap().children.len(), 2);
            editor.insert_text("!")
        })
        .unwrap();

    assert_eq!(spans(editor.doc(), 0), vec![span("ab!cd", &[])]);
    let changes: Vec<_> = rx.try_iter().collect();
    assert_eq!(changes.len(), 2);
    assert!(matches!(changes[0], EditorChange::Mutation { .. }));
    assert!(matches!(changes[1], EditorChange::Selection { .. }));
}

#[test]
fn transactions_deserialize_from_json() {
    let tx: Transaction = serde_json::from_value(json!({
        "ops": [
            { "op": "insert_text", "path": [0, 0], "offset": 0, "text": ">" },
            { "op": "set_node", "path": [0, 0], "patch": { "marks": ["code"] } }
        ],
        "meta": { "source": "test" }
    }))
    .unwrap();

    let mut editor = editor(plain("x"), caret(0, 0, 1));
    editor.apply(tx).unwrap();
    assert_eq!(spans(editor.doc(), 0), vec![span(">x", &["code"])]);
}

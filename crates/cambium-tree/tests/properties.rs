//! Property-based tests for the change codec.
//!
//! Replication depends on two guarantees of the tree layer:
//!  - Replaying a tree's emitted deltas on a copy yields an identical copy
//!  - The copy re-emits byte-identical deltas while applying them
//!  - Decoding then re-encoding any delta reproduces its exact bytes

use cambium_tree::{codec, Change, Delta, Node, Tree, Value};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;

#[derive(Clone, Debug)]
enum Edit {
    SetRoot(String, i64),
    RemoveRoot(String),
    AddChild(String),
    SetChild(usize, String, bool),
    RemoveChild(usize),
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        ("[a-d]", any::<i64>()).prop_map(|(name, value)| Edit::SetRoot(name, value)),
        "[a-d]".prop_map(Edit::RemoveRoot),
        "[a-z]{1,6}".prop_map(Edit::AddChild),
        (0usize..4, "[a-d]", any::<bool>()).prop_map(|(i, n, v)| Edit::SetChild(i, n, v)),
        (0usize..4).prop_map(Edit::RemoveChild),
    ]
}

fn json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        any::<u64>().prop_map(Value::from),
        any::<f64>().prop_filter("finite", |f| f.is_finite()).prop_map(Value::from),
        any::<String>().prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map(any::<String>(), inner, 0..4)
                .prop_map(|map| Value::Object(map.into_iter().collect())),
        ]
    })
}

fn node_strategy() -> impl Strategy<Value = Node> {
    (
        "[a-z]{1,6}",
        prop::collection::vec(("[a-z]{1,4}", json_strategy()), 0..4),
    )
        .prop_map(|(kind, properties)| {
            properties
                .into_iter()
                .fold(Node::new(kind), |node, (name, value)| node.with_property(name, value))
        })
}

fn change_strategy() -> impl Strategy<Value = Change> {
    let path = || prop::collection::vec(0usize..4, 0..3);
    prop_oneof![
        (path(), any::<String>(), json_strategy())
            .prop_map(|(path, name, value)| Change::PropertySet { path, name, value }),
        (path(), any::<String>()).prop_map(|(path, name)| Change::PropertyRemoved { path, name }),
        (path(), 0usize..8, node_strategy())
            .prop_map(|(path, index, node)| Change::ChildAdded { path, index, node }),
        (path(), 0usize..8).prop_map(|(path, index)| Change::ChildRemoved { path, index }),
        node_strategy().prop_map(|root| Change::FullSync { root }),
    ]
}

fn apply_edit(tree: &Tree, edit: &Edit) {
    // invalid indices are expected for random edits; they just do nothing
    match edit {
        Edit::SetRoot(name, value) => {
            tree.set(name.clone(), *value);
        }
        Edit::RemoveRoot(name) => {
            tree.remove(name.clone());
        }
        Edit::AddChild(kind) => {
            let _ = tree.add_child(&[], Node::new(kind.clone()));
        }
        Edit::SetChild(index, name, value) => {
            let _ = tree.set_at(&[*index], name.clone(), *value);
        }
        Edit::RemoveChild(index) => {
            let _ = tree.remove_child(&[], *index);
        }
    }
}

fn capture(tree: &Tree) -> Arc<Mutex<Vec<Delta>>> {
    let deltas = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&deltas);
    tree.subscribe(move |change: &Change| sink.lock().push(codec::encode(change).unwrap()));
    deltas
}

proptest! {
    #[test]
    fn replayed_deltas_converge(edits in prop::collection::vec(edit_strategy(), 0..40)) {
        let source = Tree::new("doc");
        let mirror = Tree::new("doc");
        let emitted = capture(&source);

        for edit in &edits {
            apply_edit(&source, edit);
        }
        for delta in emitted.lock().iter() {
            mirror.apply_delta(delta).unwrap();
        }

        prop_assert_eq!(source.snapshot(), mirror.snapshot());
    }

    #[test]
    fn applied_deltas_echo_identically(edits in prop::collection::vec(edit_strategy(), 0..40)) {
        let source = Tree::new("doc");
        let mirror = Tree::new("doc");
        let emitted = capture(&source);
        let echoed = capture(&mirror);

        for edit in &edits {
            apply_edit(&source, edit);
        }
        for delta in emitted.lock().iter() {
            mirror.apply_delta(delta).unwrap();
        }

        prop_assert_eq!(&*emitted.lock(), &*echoed.lock());
    }

    #[test]
    fn full_state_recreates_document(edits in prop::collection::vec(edit_strategy(), 0..40)) {
        let source = Tree::new("doc");
        for edit in &edits {
            apply_edit(&source, edit);
        }

        let mirror = Tree::new("other");
        mirror.apply_delta(&source.encode_full_state().unwrap()).unwrap();
        prop_assert_eq!(source.snapshot(), mirror.snapshot());
    }

    #[test]
    fn decoded_deltas_reencode_identically(change in change_strategy()) {
        let delta = codec::encode(&change).unwrap();
        let decoded = codec::decode(&delta).unwrap();
        prop_assert_eq!(codec::encode(&decoded).unwrap(), delta);
    }

    #[test]
    fn floats_replicate_bit_for_bit(
        value in any::<f64>().prop_filter("finite", |f| f.is_finite())
    ) {
        let source = Tree::new("doc");
        let mirror = Tree::new("doc");
        let emitted = capture(&source);
        let echoed = capture(&mirror);

        source.set("level", value);
        for delta in emitted.lock().iter() {
            mirror.apply_delta(delta).unwrap();
        }

        prop_assert_eq!(
            mirror.get_as::<f64>("level").map(f64::to_bits),
            Some(value.to_bits())
        );
        prop_assert_eq!(&*emitted.lock(), &*echoed.lock());
    }
}

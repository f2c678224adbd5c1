//! Property-based tests for the universal properties spec.md §8 enumerates:
//! equivalence under IVM, ref-counted min/max correctness, order-stat-tree
//! invariants, and expression idempotence.

use aggview::expr::{self, EvalContext};
use aggview::store::{OrderStatTree, RefCountedMultiSet};
use aggview::{Config, StreamingCollection, Value};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Add(i32),
    RemoveNth(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (-50i32..50).prop_map(Op::Add),
        (0usize..20).prop_map(Op::RemoveNth),
    ]
}

fn group_sum_pipeline() -> Value {
    Value::array([Value::doc([(
        "$group".into(),
        Value::doc([
            ("_id".into(), Value::Null),
            ("s".into(), Value::doc([("$sum".into(), Value::string("$a"))])),
        ]),
    )])])
}

proptest! {
    /// Property 1 (spec.md §8): after any sequence of add/remove operations,
    /// the incrementally maintained result equals a fresh batch run over the
    /// same final live set.
    #[test]
    fn ivm_result_matches_batch_ground_truth(ops in prop::collection::vec(op_strategy(), 0..40)) {
        let mut collection = StreamingCollection::new(Config::default());
        let pipeline = group_sum_pipeline();
        collection.stream(pipeline.clone()).unwrap();

        for op in ops {
            match op {
                Op::Add(n) => {
                    collection.add(Value::doc([("a".into(), Value::Number(f64::from(n)))])).unwrap();
                }
                Op::RemoveNth(n) => {
                    collection.remove_first(n % 4);
                }
            }
        }

        let incremental = collection.get_streaming_result(&pipeline).unwrap();
        let batch = collection.aggregate(&pipeline).unwrap();
        prop_assert_eq!(incremental, batch);
    }

    /// Property 4: ref-counted min/max always matches the net multiset's
    /// true min/max under arbitrary insert/remove interleaving.
    #[test]
    fn ref_counted_multiset_min_max_matches_model(values in prop::collection::vec(-200i64..200, 0..60)) {
        let mut set = RefCountedMultiSet::new();
        let mut model: Vec<i64> = Vec::new();
        for (i, v) in values.iter().enumerate() {
            if i % 3 == 2 && !model.is_empty() {
                let idx = (*v).unsigned_abs() as usize % model.len();
                let removed = model.remove(idx);
                prop_assert!(set.remove(&removed));
            } else {
                set.insert(*v);
                model.push(*v);
            }
            prop_assert_eq!(set.min().copied(), model.iter().min().copied());
            prop_assert_eq!(set.max().copied(), model.iter().max().copied());
        }
    }

    /// Property 5: after any insert/remove sequence, `kth(rank(k))` recovers
    /// the value at that rank and the tree's reported length matches the
    /// live model's.
    #[test]
    fn order_stat_tree_rank_kth_round_trip(values in prop::collection::vec(-200i64..200, 1..60)) {
        let mut tree = OrderStatTree::new();
        let mut model: Vec<i64> = Vec::new();
        for v in &values {
            tree.insert(*v);
            model.push(*v);
        }
        model.sort_unstable();
        prop_assert_eq!(tree.len(), model.len());
        for (k, expected) in model.iter().enumerate() {
            prop_assert_eq!(tree.kth(k), Some(expected));
        }
        for v in &values {
            let rank = tree.rank(v);
            prop_assert_eq!(rank, model.partition_point(|x| x < v));
        }
    }

    /// Property 6: re-evaluating an already-evaluated closed literal
    /// expression is idempotent.
    #[test]
    fn expression_eval_is_idempotent_over_literals(n in -1000i64..1000) {
        let doc = Value::Null;
        let literal_expr = Value::doc([("$add".into(), Value::array([
            Value::Number(n as f64),
            Value::Number(0.0),
        ]))]);

        let mut ctx1 = EvalContext::new(&doc);
        let once = expr::eval(&doc, &literal_expr, &mut ctx1).unwrap();

        let once_as_literal = once.clone();
        let mut ctx2 = EvalContext::new(&doc);
        let twice = expr::eval(&doc, &once_as_literal, &mut ctx2).unwrap();

        prop_assert_eq!(once, twice);
    }
}

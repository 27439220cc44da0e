//! Property-based tests for the matching-set invariants in spec.md §8
//! (1-3): the published heap never exceeds `limit`, published/buffer stay
//! disjoint, and `max(published) <= min(unpublishedBuffer)`.

use std::sync::Arc;

use oplog_driver::{
    testing::RecordingMultiplexer,
    Document,
    MatchingSet,
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Insert(u32, i64),
    Remove(u32),
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            (0u32..12, any::<i64>()).prop_map(|(id, n)| Op::Insert(id, n % 1000)),
            (0u32..12).prop_map(Op::Remove),
        ],
        0..40,
    )
}

fn by_n() -> Arc<dyn Fn(&Document, &Document) -> std::cmp::Ordering + Send + Sync> {
    Arc::new(|a: &Document, b: &Document| {
        let an = a.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
        let bn = b.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
        an.cmp(&bn)
    })
}

fn doc(n: i64) -> Document {
    let mut d = Document::new();
    d.insert("n".to_string(), serde_json::json!(n));
    d
}

proptest! {
    #[test]
    fn published_never_exceeds_limit(limit in 1usize..6, ops in ops_strategy()) {
        let mux = RecordingMultiplexer::new();
        let mut set = MatchingSet::new(limit, by_n());

        for op in ops {
            match op {
                Op::Insert(id, n) => {
                    let id = id.to_string();
                    if !set.is_cached(&id) {
                        let _ = set.add_matching(id, doc(n), mux.as_ref());
                    }
                },
                Op::Remove(id) => {
                    let id = id.to_string();
                    if set.is_cached(&id) {
                        let _ = set.remove_matching(&id, mux.as_ref());
                    }
                },
            }
            prop_assert!(set.published().size() <= limit);

            let published_ids: std::collections::HashSet<_> =
                set.published().ids().cloned().collect();
            let buffered_ids: std::collections::HashSet<_> =
                set.unpublished_buffer().ids().cloned().collect();
            prop_assert!(published_ids.is_disjoint(&buffered_ids));

            if let (Some(max_pub), Some(min_buf)) =
                (set.published().max_element_id(), set.unpublished_buffer().min_element_id())
            {
                let max_doc = set.published().get(&max_pub).unwrap().clone();
                let min_doc = set.unpublished_buffer().get(&min_buf).unwrap().clone();
                prop_assert!(set.compare_docs(&max_doc, &min_doc) != std::cmp::Ordering::Greater);
            }
        }
    }
}

//! Property-based tests for index invariants.
//!
//! - Every item is assigned to exactly one anchor.
//! - Reconstructions are finite and of the index dimension.
//! - Query results are unique, bounded by `top_k`, and ordered by score then id.
//! - An added item is live immediately and owned by its nearest anchor.

mod common;

use std::collections::HashSet;

use leann::config::{AnchorConfig, QuantizerConfig};
use leann::partitioning::nearest_anchor;
use leann::{
    IndexBuilder, IndexHandle, ItemMetadata, LeannConfig, Metric, NewItem, QueryEngine,
    QueryRequest, UpdateManager,
};
use proptest::prelude::*;

use common::items_from;

const DIM: usize = 8;

fn tiny_config(metric: Metric, anchors: usize) -> LeannConfig {
    let mut config = LeannConfig::with_dimension(DIM);
    config.metric = metric;
    config.anchors = AnchorConfig {
        count: anchors,
        ..AnchorConfig::default()
    };
    config.quantizer = QuantizerConfig {
        sub_vectors: 4,
        codebook_size: 8,
        training_samples: 256,
        validation_samples: 32,
        max_iterations: 8,
        ..QuantizerConfig::default()
    };
    config
}

prop_compose! {
    fn arb_vector()(v in prop::collection::vec(-1.0f32..1.0, DIM)) -> Vec<f32> {
        let mut v = v;
        // Keep away from the zero vector so cosine is defined.
        v[0] += 2.0;
        v
    }
}

prop_compose! {
    fn arb_corpus()(vectors in prop::collection::vec(arb_vector(), 20..80)) -> Vec<Vec<f32>> {
        vectors
    }
}

fn arb_metric() -> impl Strategy<Value = Metric> {
    prop_oneof![Just(Metric::Cosine), Just(Metric::L2), Just(Metric::InnerProduct)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn every_item_has_exactly_one_anchor(
        corpus in arb_corpus(),
        metric in arb_metric(),
        anchors in 2usize..8,
    ) {
        let n = corpus.len();
        let config = tiny_config(metric, anchors);
        let generation = IndexBuilder::new(&config).build(items_from(corpus)).unwrap();

        prop_assert_eq!(generation.store().len(), n);
        let counts = generation.store().member_counts();
        prop_assert_eq!(counts.iter().sum::<usize>(), n);
        let ids: HashSet<u64> = generation.store().records().iter().map(|r| r.item_id).collect();
        prop_assert_eq!(ids.len(), n);
        for record in generation.store().records() {
            prop_assert!((record.anchor_id as usize) < generation.anchors().len());
        }
    }

    #[test]
    fn reconstructions_are_finite(
        corpus in arb_corpus(),
        metric in arb_metric(),
    ) {
        let config = tiny_config(metric, 4);
        let generation = IndexBuilder::new(&config).build(items_from(corpus)).unwrap();
        for record in generation.store().records() {
            let approx = generation.reconstruct(record).unwrap();
            prop_assert_eq!(approx.len(), DIM);
            prop_assert!(approx.iter().all(|x| x.is_finite()));
        }
    }

    #[test]
    fn results_are_ordered_unique_and_bounded(
        corpus in arb_corpus(),
        query in arb_vector(),
        metric in arb_metric(),
        top_k in 1usize..15,
    ) {
        let config = tiny_config(metric, 4);
        let generation = IndexBuilder::new(&config).build(items_from(corpus)).unwrap();
        let engine = QueryEngine::new(IndexHandle::new(generation));
        let response = engine.search(&QueryRequest::vector(query).top_k(top_k)).unwrap();

        prop_assert!(response.items.len() <= top_k);
        let ids: HashSet<u64> = response.ids().into_iter().collect();
        prop_assert_eq!(ids.len(), response.items.len());
        for w in response.items.windows(2) {
            prop_assert!(
                w[0].score > w[1].score || (w[0].score == w[1].score && w[0].id < w[1].id),
                "out of order: {:?} then {:?}", w[0], w[1]
            );
        }
    }

    #[test]
    fn added_item_is_live_and_owned_by_nearest_anchor(
        corpus in arb_corpus(),
        extra in arb_vector(),
        metric in arb_metric(),
    ) {
        let config = tiny_config(metric, 4);
        let generation = IndexBuilder::new(&config).build(items_from(corpus)).unwrap();
        let manager = UpdateManager::new(IndexHandle::new(generation));
        manager
            .add(NewItem::from_vector(9_999, extra.clone(), ItemMetadata::with_path("x")))
            .unwrap();

        let active = manager.handle().require().unwrap();
        let record = active.live_record(9_999).unwrap();
        let prepared = active.prepare(extra).unwrap();
        let (expected, _) = nearest_anchor(active.anchors(), &prepared, metric);
        prop_assert_eq!(record.anchor_id, expected);
        prop_assert_eq!(active.growth().segment_items, 1);
    }
}

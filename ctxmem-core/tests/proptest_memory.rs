//! Property-based tests for ctxmem core.
//!
//! Uses `proptest` to check record-model, retrieval, and consolidation
//! invariants under random inputs.

use proptest::prelude::*;

use chrono::Utc;

use ctxmem_core::consolidation::{ConsolidationEngine, Fingerprint};
use ctxmem_core::memory::clamp_unit;
use ctxmem_core::session::SessionContext;
use ctxmem_core::{
    CtxMemConfig, MemoryId, MemoryRecord, MemoryStore, MemoryType, QueryOptions, StoreOptions,
};

fn record(text: &str) -> MemoryRecord {
    MemoryRecord::new(text, MemoryType::Semantic, &SessionContext::new(None, None))
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

// ---------------------------------------------------------------------------
// Strategy helpers
// ---------------------------------------------------------------------------

/// The same sentence with random casing and whitespace padding.
fn arb_variant(base: &'static str) -> impl Strategy<Value = String> {
    (any::<bool>(), 0..3usize, 0..3usize).prop_map(move |(upper, lead, trail)| {
        let body = if upper {
            base.to_uppercase()
        } else {
            base.to_string()
        };
        format!("{}{}{}", " ".repeat(lead), body.replace(' ', "  "), "\t".repeat(trail))
    })
}

// ---------------------------------------------------------------------------
// Property: scores stay within [0, 1]
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn builder_scores_are_clamped(importance in -10.0..10.0f32, confidence in -10.0..10.0f32) {
        let rec = record("x").with_importance(importance).with_confidence(confidence);
        prop_assert!((0.0..=1.0).contains(&rec.metadata.importance));
        prop_assert!((0.0..=1.0).contains(&rec.metadata.confidence));
        prop_assert!(rec.validate().is_ok());
    }

    #[test]
    fn validation_rejects_exactly_out_of_range(importance in -2.0..3.0f32) {
        let mut rec = record("x");
        rec.metadata.importance = importance;
        prop_assert_eq!(rec.validate().is_ok(), (0.0..=1.0).contains(&importance));
    }

    #[test]
    fn clamp_unit_is_idempotent(value in any::<f32>()) {
        let once = clamp_unit(value);
        prop_assert!((0.0..=1.0).contains(&once));
        prop_assert_eq!(clamp_unit(once).to_bits(), once.to_bits());
    }
}

// ---------------------------------------------------------------------------
// Property: consolidation sums accesses and boosts importance
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn identical_records_fold_into_one(
        accesses in prop::collection::vec(0..1000u64, 1..12),
        importance in 0.0..=1.0f32,
    ) {
        let records: Vec<MemoryRecord> = accesses
            .iter()
            .map(|&a| {
                let mut r = record("Deploys happen on Tuesdays").with_importance(importance);
                r.metadata.access_count = a;
                r
            })
            .collect();
        let first = records[0].id;
        let n = records.len();

        let outcome = ConsolidationEngine::default().consolidate(records, Utc::now());
        prop_assert_eq!(outcome.kept.len(), 1);
        prop_assert_eq!(outcome.folded.len(), n - 1);

        let kept = &outcome.kept[0];
        prop_assert_eq!(kept.id, first);
        prop_assert_eq!(kept.metadata.access_count, accesses.iter().sum::<u64>());

        #[allow(clippy::cast_precision_loss)]
        let expected = (importance + 0.1 * (n - 1) as f32).min(1.0);
        prop_assert!((kept.metadata.importance - expected).abs() < 1e-4);
        prop_assert!(kept.metadata.importance <= 1.0);
    }

    #[test]
    fn fingerprint_ignores_case_and_spacing(text in arb_variant("the build is green")) {
        prop_assert_eq!(Fingerprint::of(&text), Fingerprint::of("the build is green"));
    }

    #[test]
    fn distinct_texts_are_all_kept(count in 1..20usize) {
        let records: Vec<MemoryRecord> = (0..count).map(|i| record(&format!("fact {i}"))).collect();
        let outcome = ConsolidationEngine::default().consolidate(records, Utc::now());
        prop_assert_eq!(outcome.kept.len(), count);
        prop_assert!(outcome.folded.is_empty());
    }
}

// ---------------------------------------------------------------------------
// Property: pages concatenate to the full ranking
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn pages_concatenate_to_full_ranking(
        importances in prop::collection::vec(0.0..=1.0f32, 0..25),
        page_size in 1..8usize,
    ) {
        let (full, paged) = runtime().block_on(async {
            let store = MemoryStore::from_config(CtxMemConfig::default())
                .await
                .expect("store");
            let session = store.create_session(None, None);
            for (i, importance) in importances.iter().enumerate() {
                store
                    .store(
                        format!("shared topic item {i}"),
                        MemoryType::Semantic,
                        session,
                        StoreOptions {
                            importance: Some(*importance),
                            ..StoreOptions::default()
                        },
                    )
                    .await
                    .expect("store");
            }

            let full = store
                .retrieve(
                    "shared topic",
                    session,
                    QueryOptions { limit: Some(usize::MAX), ..QueryOptions::default() },
                )
                .await
                .expect("full")
                .ids();

            let mut paged: Vec<MemoryId> = Vec::new();
            let mut offset = 0;
            loop {
                let page = store
                    .retrieve(
                        "shared topic",
                        session,
                        QueryOptions { limit: Some(page_size), offset, ..QueryOptions::default() },
                    )
                    .await
                    .expect("page");
                assert_eq!(page.total_count, importances.len());
                if page.is_empty() {
                    break;
                }
                offset += page.memories.len();
                paged.extend(page.ids());
            }
            (full, paged)
        });

        prop_assert_eq!(full.len(), importances.len());
        prop_assert_eq!(paged, full);
    }
}

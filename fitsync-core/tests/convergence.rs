//! Convergence of the group store against a flaky server of record
//!
//! Random interleavings of creates, renames, deletes and resyncs run while
//! the backend injects failures. Once failures stop, one resync must bring
//! the store to exactly the server's set of groups.

use fitsync_core::config::FeatureFlags;
use fitsync_core::core_groups::{GroupDraft, GroupPatch, ResyncOptions, UserId};
use fitsync_core::persistence::MemoryKvStore;
use fitsync_core::test_harness::InMemoryBackend;
use fitsync_core::test_utils::{assert_roster_invariants, assert_same_groups, StoreFixture};
use proptest::prelude::*;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Create { creator: u64, extra: Vec<u64> },
    Rename { pick: usize, suffix: u8 },
    Remove { pick: usize },
    Resync { hard: bool },
    FailMutations(u32),
    FailGroupFetches(u32),
    FailIdentifierFetches(u32),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u64..6, prop::collection::vec(1u64..10, 0..3)).prop_map(|(creator, extra)| Op::Create { creator, extra }),
        2 => (any::<usize>(), any::<u8>()).prop_map(|(pick, suffix)| Op::Rename { pick, suffix }),
        2 => any::<usize>().prop_map(|pick| Op::Remove { pick }),
        2 => any::<bool>().prop_map(|hard| Op::Resync { hard }),
        1 => (1u32..3).prop_map(Op::FailMutations),
        1 => (1u32..4).prop_map(Op::FailGroupFetches),
        1 => (1u32..4).prop_map(Op::FailIdentifierFetches),
    ]
}

async fn apply(fx: &StoreFixture, op: Op) {
    let ids: Vec<_> = fx.store.list().iter().map(|g| g.id).collect();
    // Individual operations may fail; only the end state matters.
    match op {
        Op::Create { creator, extra } => {
            let draft = GroupDraft::new(format!("Crew {}", creator), UserId(creator)).with_participants(extra);
            let _ = fx.store.create(draft).await;
        }
        Op::Rename { pick, suffix } if !ids.is_empty() => {
            let id = ids[pick % ids.len()];
            let _ = fx.store.update(id, GroupPatch::rename(format!("Renamed {}", suffix))).await;
        }
        Op::Remove { pick } if !ids.is_empty() => {
            let _ = fx.store.remove(ids[pick % ids.len()]).await;
        }
        Op::Rename { .. } | Op::Remove { .. } => {}
        Op::Resync { hard } => {
            let options = if hard { ResyncOptions::hard_reset() } else { ResyncOptions::default() };
            let _ = fx.store.resync(options).await;
        }
        Op::FailMutations(n) => fx.backend.fail_next_mutations(n),
        Op::FailGroupFetches(n) => fx.backend.fail_next_group_fetches(n),
        Op::FailIdentifierFetches(n) => fx.backend.fail_next_identifier_fetches(n),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn store_converges_once_failures_stop(ops in prop::collection::vec(op_strategy(), 1..24)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let fx = StoreFixture::with_backend(
                Arc::new(InMemoryBackend::new()),
                Arc::new(MemoryKvStore::new()),
                FeatureFlags::default(),
            );
            for op in ops {
                apply(&fx, op).await;
            }

            fx.backend.fail_next_mutations(0);
            fx.backend.fail_next_group_fetches(0);
            fx.backend.fail_next_identifier_fetches(0);
            fx.store.resync(ResyncOptions::forced()).await.unwrap();

            let local = fx.store.list();
            assert_same_groups(&local, &fx.backend.groups());
            for group in &local {
                assert_roster_invariants(group);
                assert!(!group.is_optimistic());
                assert!(!group.is_virtual());
            }
        });
    }
}

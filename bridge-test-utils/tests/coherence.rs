//! Coherence properties across tiers and peers.

use std::time::Duration;

use bridge_core::{Key, Version};
use futures_util::future::join_all;
use bridge_storage::tier::PutOutcome;
use bridge_storage::{CallOptions, CoordinatorSettings, MemoryTier, TierAdapter};
use bridge_test_utils::assertions::*;
use bridge_test_utils::fixtures::*;
use bridge_test_utils::generators::*;
use bridge_test_utils::helpers::*;
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_read_your_write(ops in prop::collection::vec((arb_key(), arb_value()), 1..12)) {
        runtime().block_on(async {
            let fixture = ThreeTierFixture::new();
            let bridge = fixture.start().await;
            for (key, value) in &ops {
                bridge.put(key.clone(), value.clone()).await.unwrap();
                assert_eq!(bridge.get(key.clone()).await.unwrap().as_ref(), Some(value));
            }
            bridge.shutdown().await;
        });
    }

    #[test]
    fn prop_promotion_never_regresses_a_tier(entry in arb_entry(), older in 0u64..1000) {
        runtime().block_on(async {
            let tier = MemoryTier::new();
            assert_eq!(tier.put(&entry).await.unwrap(), PutOutcome::Applied);

            let mut stale = entry.clone();
            stale.version = Version::new(entry.version.get().saturating_sub(older));
            stale.value = b"stale".to_vec();
            assert_eq!(
                tier.put(&stale).await.unwrap(),
                PutOutcome::Superseded { current: entry.version }
            );
            assert_eq!(tier.peek(&entry.key).unwrap(), entry);
        });
    }
}

#[tokio::test]
async fn test_read_your_write_when_fast_tiers_miss() {
    let fixture = ThreeTierFixture::new();
    let bridge = fixture.start().await;
    let ack = bridge.put("u:1", b"a".to_vec()).await.unwrap();

    fixture.local.data.delete(&Key::from("u:1")).await.unwrap();
    fixture.remote.data.delete(&Key::from("u:1")).await.unwrap();
    assert_eq!(bridge.get("u:1").await.unwrap(), Some(b"a".to_vec()));

    assert!(eventually(WAIT, || fixture.local.peek("u:1").is_some() && fixture.remote.peek("u:1").is_some()).await);
    assert_holds(&fixture.local, "u:1", ack.version);
    assert_holds(&fixture.remote, "u:1", ack.version);
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_promotions_are_idempotent() {
    let fixture = ThreeTierFixture::new();
    let bridge = fixture.start().await;
    let ack = bridge.put("u:1", b"a".to_vec()).await.unwrap();
    fixture.local.data.delete(&Key::from("u:1")).await.unwrap();
    fixture.remote.data.delete(&Key::from("u:1")).await.unwrap();

    // Slow local calls so all three reads miss before any promotion lands.
    fixture.local.faults.set_latency(Some(Duration::from_millis(20)));
    let reads = join_all((0..3).map(|_| bridge.get("u:1"))).await;
    for read in reads {
        assert_eq!(read.unwrap(), Some(b"a".to_vec()));
    }

    assert!(eventually(WAIT, || bridge.metrics().promotions == 2).await);
    assert!(eventually(WAIT, || bridge.metrics().promotions_skipped == 4).await);
    assert_holds(&fixture.local, "u:1", ack.version);
    assert_holds(&fixture.remote, "u:1", ack.version);
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_delete_then_get_on_same_instance() {
    let fixture = ThreeTierFixture::new();
    let bridge = fixture.start().await;
    bridge.put("u:1", b"a".to_vec()).await.unwrap();
    bridge.delete("u:1").await.unwrap();

    assert_eq!(bridge.get("u:1").await.unwrap(), None);
    for tier in [&fixture.local, &fixture.remote, &fixture.store] {
        assert_missing(tier, "u:1");
    }
    // Deleting an absent key succeeds.
    bridge.delete("u:1").await.unwrap();
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_delete_then_get_on_peer() {
    let peers = Peers::start().await;
    peers.a.put("u:1", b"a".to_vec()).await.unwrap();
    assert_eq!(peers.b.get("u:1").await.unwrap(), Some(b"a".to_vec()));
    assert!(eventually(WAIT, || peers.b_tiers.local.peek("u:1").is_some()).await);

    peers.a.delete("u:1").await.unwrap();
    assert!(eventually(WAIT, || peers.b_tiers.local.peek("u:1").is_none()).await);
    assert_eq!(peers.b.get("u:1").await.unwrap(), None);
    peers.shutdown().await;
}

#[tokio::test]
async fn test_invalidate_on_write_refreshes_peer() {
    let peers = Peers::start_with(CoordinatorSettings {
        invalidate_on_write: true,
        ..test_settings()
    })
    .await;
    peers.a.put("u:1", b"old".to_vec()).await.unwrap();
    assert_eq!(peers.b.get("u:1").await.unwrap(), Some(b"old".to_vec()));
    assert!(eventually(WAIT, || peers.b_tiers.local.peek("u:1").is_some()).await);

    let ack = peers.a.put("u:1", b"new".to_vec()).await.unwrap();
    assert!(
        eventually(WAIT, || peers
            .b_tiers
            .local
            .peek("u:1")
            .map_or(true, |e| e.version == ack.version))
        .await
    );
    assert_eq!(peers.b.get("u:1").await.unwrap(), Some(b"new".to_vec()));
    peers.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_puts_leave_highest_version_in_store() {
    let peers = Peers::start().await;
    let mut handles = Vec::new();
    for i in 0..24u32 {
        let bridge = if i % 2 == 0 { peers.a.clone() } else { peers.b.clone() };
        handles.push(tokio::spawn(async move {
            let value = i.to_string().into_bytes();
            bridge.put("hot", value.clone()).await.map(|ack| (ack.version, value))
        }));
    }

    let mut acked = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(ack) => acked.push(ack),
            Err(e) => assert!(matches!(e, bridge_core::BridgeError::Conflict { .. }), "{e}"),
        }
    }
    assert!(!acked.is_empty());

    let (max_version, max_value) = acked.iter().max_by_key(|(v, _)| *v).cloned().unwrap();
    let stored = peers.a_tiers.store.peek("hot").unwrap();
    assert_eq!(stored.version, max_version);
    assert_eq!(stored.value, max_value);
    peers.shutdown().await;
}

#[tokio::test]
async fn test_conditional_put_conflicts() {
    let fixture = ThreeTierFixture::new();
    let bridge = fixture.start().await;
    let first = bridge.put("k", b"1".to_vec()).await.unwrap();

    let stale = bridge
        .put_with("k", b"2".to_vec(), CallOptions::new().expecting(Version::new(1)))
        .await;
    assert_conflict(&stale);
    let fresh = bridge
        .put_with("k", b"2".to_vec(), CallOptions::new().expecting(first.version))
        .await
        .unwrap();
    assert!(fresh.version > first.version);
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_store_outage_surfaces_unavailable() {
    let fixture = ThreeTierFixture::new();
    let bridge = fixture.start().await;
    fixture.store.kill();
    assert_unavailable(&bridge.put("u:1", b"a".to_vec()).await);
    assert_unavailable(&bridge.delete("u:1").await);
    assert_unavailable(&bridge.get("u:1").await);
    assert_missing(&fixture.local, "u:1");

    fixture.store.revive();
    fixture.store.faults.fail_with(bridge_core::TierError::permanent("disk full"));
    assert_failure(&bridge.put("u:1", b"a".to_vec()).await);
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_per_call_timeout_override() {
    let fixture = ThreeTierFixture::new();
    let bridge = fixture.start().await;
    fixture.store.faults.set_latency(Some(Duration::from_millis(200)));
    let result = bridge
        .put_with("u:1", b"a".to_vec(), CallOptions::new().with_timeout(Duration::from_millis(20)))
        .await;
    assert_unavailable(&result);
    bridge.shutdown().await;
}

//! Remote cache outage on a three-tier chain:
//! `[local-cache 0 through, remote-cache 1 through, relational 2 through]`.
//!
//! Reads keep working, and the remote tier is repaired once it returns.

use std::time::Duration;

use bridge_core::BridgeEvent;
use bridge_storage::{CoordinatorSettings, TypedBridge};
use bridge_test_utils::assertions::*;
use bridge_test_utils::fixtures::*;
use bridge_test_utils::helpers::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    n: String,
}

fn patient_settings() -> CoordinatorSettings {
    CoordinatorSettings {
        retry: fast_retry(200),
        ..test_settings()
    }
}

#[tokio::test]
async fn test_remote_outage_is_repaired() {
    let peers = Peers::start_with(patient_settings()).await;
    let users_a: TypedBridge<User> = TypedBridge::new(peers.a.clone());
    let users_b: TypedBridge<User> = TypedBridge::new(peers.b.clone());
    let mut a_events = peers.a.events();
    let mut b_events = peers.b.events();

    let alice = User { n: "a".to_string() };
    let ack = users_a.save("u:1", &alice).await.unwrap();
    assert_eq!(
        peers.a.get("u:1").await.unwrap().as_deref(),
        Some(br#"{"n":"a"}"#.as_slice())
    );

    peers.a_tiers.remote.kill();

    // The writer still serves from its local cache.
    assert_eq!(users_a.fetch("u:1").await.unwrap(), Some(alice.clone()));

    // A peer with a cold local cache falls through to the store; promoting
    // into the dead remote schedules a repair.
    assert_eq!(users_b.fetch("u:1").await.unwrap(), Some(alice.clone()));
    let scheduled = await_event(&mut b_events, WAIT, is_repair_scheduled_for("remote"))
        .await
        .expect("peer schedules a remote repair");
    assert_eq!(scheduled.key().map(|k| k.to_string()), Some("u:1".to_string()));

    // A write issued while the remote is down succeeds and schedules one too.
    let bob = User { n: "b".to_string() };
    let ack_2 = users_a.save("u:2", &bob).await.unwrap();
    assert!(ack_2.is_durable());
    await_event(&mut a_events, WAIT, is_repair_scheduled_for("remote"))
        .await
        .expect("writer schedules a remote repair");
    await_event(&mut a_events, WAIT, |e| {
        matches!(e, BridgeEvent::AdapterUnhealthy { tier, .. } if tier == "remote")
    })
    .await
    .expect("remote reported unhealthy");

    peers.a_tiers.remote.revive();

    await_event(&mut a_events, WAIT, is_repair_completed_for("remote"))
        .await
        .expect("writer repair completes");
    await_event(&mut b_events, WAIT, is_repair_completed_for("remote"))
        .await
        .expect("peer repair completes");
    assert_holds(&peers.a_tiers.remote, "u:1", ack.version);
    assert_holds(&peers.a_tiers.remote, "u:2", ack_2.version);

    let metrics = peers.a.metrics();
    assert!(metrics.repairs_scheduled >= 1);
    assert_eq!(metrics.repairs_abandoned, 0);
    peers.shutdown().await;
}

#[tokio::test]
async fn test_repair_is_abandoned_when_remote_stays_down() {
    let fixture = ThreeTierFixture::new();
    let bridge = fixture.start().await;
    let mut events = bridge.events();
    fixture.remote.kill();

    bridge.put("u:1", b"a".to_vec()).await.unwrap();
    let abandoned = await_event(&mut events, WAIT, |e| {
        matches!(e, BridgeEvent::RepairAbandoned { tier, .. } if tier == "remote")
    })
    .await;
    assert!(abandoned.is_some());
    assert_eq!(bridge.get("u:1").await.unwrap(), Some(b"a".to_vec()));
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_repair_does_not_resurrect_deleted_key() {
    let fixture = ThreeTierFixture::new();
    let bridge = fixture.start_with(patient_settings(), bridge_core::WriteMode::Through).await;
    let mut events = bridge.events();

    fixture.remote.faults.fail_next_puts(1);
    bridge.put("u:1", b"a".to_vec()).await.unwrap();
    bridge.delete("u:1").await.unwrap();

    // Let any outstanding repair run to its end.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let seen = drain_events(&mut events);
    assert!(seen
        .iter()
        .any(|e| matches!(e, BridgeEvent::RepairScheduled { tier, .. } if tier == "remote")));
    assert_missing(&fixture.remote, "u:1");
    assert_eq!(bridge.get("u:1").await.unwrap(), None);
    bridge.shutdown().await;
}

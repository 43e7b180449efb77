//! Write-back queueing, durability and backpressure.

use std::time::Duration;

use bridge_core::{BridgeEvent, WriteMode};
use bridge_storage::CoordinatorSettings;
use bridge_test_utils::assertions::*;
use bridge_test_utils::fixtures::*;
use bridge_test_utils::helpers::*;

fn write_back_settings(capacity: usize, workers: usize) -> CoordinatorSettings {
    CoordinatorSettings {
        write_back_capacity: capacity,
        write_back_workers: workers,
        ..test_settings()
    }
}

#[tokio::test]
async fn test_acknowledged_before_store_then_durable() {
    let fixture = ThreeTierFixture::new();
    let bridge = fixture
        .start_with(write_back_settings(64, 2), WriteMode::Back)
        .await;
    fixture.store.faults.set_latency(Some(Duration::from_millis(30)));

    let ack = bridge.put("u:1", b"a".to_vec()).await.unwrap();
    assert!(!ack.is_durable());
    assert_holds(&fixture.local, "u:1", ack.version);
    // The faster tiers already serve the value.
    assert_eq!(bridge.get("u:1").await.unwrap(), Some(b"a".to_vec()));

    let version = ack.durable().await.unwrap();
    assert_holds(&fixture.store, "u:1", version);
    assert_eq!(bridge.metrics().write_back_applied, 1);
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_saturated_queue_degrades_to_write_through() {
    let fixture = ThreeTierFixture::new();
    let bridge = fixture
        .start_with(write_back_settings(1, 1), WriteMode::Back)
        .await;
    let mut events = bridge.events();
    fixture.store.faults.set_latency(Some(Duration::from_millis(30)));

    let mut handles = Vec::new();
    for i in 0..12 {
        let bridge = bridge.clone();
        handles.push(tokio::spawn(async move {
            bridge.put(format!("k:{i}"), vec![i as u8]).await
        }));
    }
    let mut acks = Vec::new();
    for handle in handles {
        acks.push(handle.await.unwrap().unwrap());
    }
    for ack in acks {
        ack.durable().await.unwrap();
    }

    for i in 0..12 {
        let entry = fixture.store.peek(&format!("k:{i}")).unwrap();
        assert_eq!(entry.value, vec![i as u8]);
    }
    let metrics = bridge.metrics();
    assert!(metrics.write_back_degraded >= 1);
    assert_eq!(metrics.write_back_degraded + metrics.write_back_enqueued, 12);
    assert!(
        await_event(&mut events, WAIT, |e| matches!(e, BridgeEvent::WriteBackDegraded { .. }))
            .await
            .is_some()
    );
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_write_back_survives_store_outage() {
    let fixture = ThreeTierFixture::new();
    let settings = CoordinatorSettings {
        retry: fast_retry(200),
        ..write_back_settings(64, 1)
    };
    let bridge = fixture.start_with(settings, WriteMode::Back).await;
    fixture.store.kill();

    let ack = bridge.put("u:1", b"a".to_vec()).await.unwrap();
    assert!(!ack.is_durable());
    assert_holds(&fixture.local, "u:1", ack.version);
    assert_missing(&fixture.store, "u:1");
    assert_eq!(bridge.get("u:1").await.unwrap(), Some(b"a".to_vec()));

    tokio::time::sleep(Duration::from_millis(20)).await;
    fixture.store.revive();

    let version = ack.durable().await.unwrap();
    assert_holds(&fixture.store, "u:1", version);
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_flushes_queue() {
    let fixture = ThreeTierFixture::new();
    let bridge = fixture
        .start_with(write_back_settings(64, 1), WriteMode::Back)
        .await;
    fixture.store.faults.set_latency(Some(Duration::from_millis(10)));

    for i in 0..5 {
        bridge.put(format!("k:{i}"), b"v".to_vec()).await.unwrap();
    }
    bridge.shutdown().await;
    for i in 0..5 {
        assert!(fixture.store.peek(&format!("k:{i}")).is_some());
    }
}

#[tokio::test]
async fn test_exhausted_write_back_evicts_unbacked_copies() {
    let fixture = ThreeTierFixture::new();
    let bridge = fixture
        .start_with(write_back_settings(64, 1), WriteMode::Back)
        .await;
    let mut events = bridge.events();
    fixture.store.faults.fail_next_puts(100);

    let ack = bridge.put("u:1", b"a".to_vec()).await.unwrap();
    let err = ack.durable().await.unwrap_err();
    assert!(matches!(err, bridge_core::BridgeError::DataLoss { .. }));
    assert!(
        await_event(&mut events, WAIT, |e| matches!(e, BridgeEvent::WriteBackExhausted { .. }))
            .await
            .is_some()
    );
    assert_missing(&fixture.local, "u:1");
    assert_missing(&fixture.remote, "u:1");
    assert_missing(&fixture.store, "u:1");
    bridge.shutdown().await;
}

mod common;
use common::*;

use solar_gateway::cache::{NewHeartbeat, Table};
use solar_gateway::prelude::*;
use solar_gateway::sync::READING_BATCH;

use serde_json::json;
use std::time::Duration;

async fn seed(cache: &LocalCache, sensors: &[&str]) -> Vec<i64> {
    let mut ids = Vec::new();
    for (i, sensor) in sensors.iter().enumerate() {
        let ts = format!("2024-06-01T12:00:{:02}Z", i);
        ids.push(cache.insert_reading("S1", sensor, &json!({"value": i}), &ts).await.unwrap());
    }
    ids
}

#[tokio::test]
async fn rejected_row_does_not_block_the_batch() {
    common_setup();

    let cache = Factory::cache().await;
    let ids = seed(&cache, &["r1", "r2", "r3"]).await;

    let remote = FakeRemote::new();
    remote.reject_sensor("r2");
    let engine = SyncEngine::new(cache.clone(), Some(remote.clone()));

    let result = engine.sync_cached_data().await;

    assert!(result.success);
    assert_eq!(result.uploaded, 2);
    assert!(cache.reading(ids[0]).await.unwrap().unwrap().uploaded);
    assert!(!cache.reading(ids[1]).await.unwrap().unwrap().uploaded);
    assert!(cache.reading(ids[2]).await.unwrap().unwrap().uploaded);
    assert_eq!(remote.accepted_sensors(), vec!["r1", "r3"]);

    // the rejected row is retried on the next pass
    let result = engine.sync_cached_data().await;
    assert!(result.success);
    assert_eq!(result.uploaded, 0);
    assert_eq!(cache.stats().await.unwrap().pending_readings, 1);
}

#[tokio::test]
async fn heartbeats_are_synced_after_readings() {
    common_setup();

    let cache = Factory::cache().await;
    seed(&cache, &["a", "b"]).await;
    cache
        .insert_heartbeat(&NewHeartbeat {
            site_id: "S1".to_string(),
            power_mode: Mode::Normal,
            battery_level: Some(81.0),
            network_type: "lte".to_string(),
            signal_strength: None,
            timestamp: Utils::utc(),
        })
        .await
        .unwrap();

    let remote = FakeRemote::new();
    let engine = SyncEngine::new(cache.clone(), Some(remote.clone()));
    let result = engine.sync_cached_data().await;

    assert_eq!(result, SyncResult::ok(3));
    assert_eq!(remote.heartbeats.lock().unwrap().len(), 1);
    assert_eq!(remote.heartbeats.lock().unwrap()[0].battery_level, Some(81.0));

    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.pending_readings, 0);
    assert_eq!(stats.pending_heartbeats, 0);
    assert_eq!(stats.oldest_pending, None);
}

#[tokio::test]
async fn missing_remote_is_a_connection_failure() {
    common_setup();

    let cache = Factory::cache().await;
    seed(&cache, &["a"]).await;

    let engine = SyncEngine::new(cache.clone(), None);
    let result = engine.sync_cached_data().await;

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("remote store not configured"));
    assert_eq!(cache.stats().await.unwrap().pending_readings, 1);
}

#[tokio::test]
async fn unreachable_remote_aborts_the_pass() {
    common_setup();

    let cache = Factory::cache().await;
    seed(&cache, &["a", "b", "c"]).await;

    let remote = FakeRemote::new();
    remote.set_down(true);
    let engine = SyncEngine::new(cache.clone(), Some(remote.clone()));

    let result = engine.sync_cached_data().await;
    assert!(!result.success);
    assert_eq!(result.uploaded, 0);
    assert_eq!(cache.stats().await.unwrap().pending_readings, 3);

    remote.set_down(false);
    assert_eq!(engine.sync_cached_data().await, SyncResult::ok(3));
}

#[tokio::test]
async fn only_one_pass_at_a_time() {
    common_setup();

    let cache = Factory::cache().await;
    seed(&cache, &["a", "b"]).await;

    let engine = SyncEngine::new(cache.clone(), Some(FakeRemote::slow(Duration::from_millis(50))));

    let (first, second) = tokio::join!(engine.sync_cached_data(), engine.sync_cached_data());

    assert_eq!(first, SyncResult::ok(2));
    assert!(!second.success);
    assert_eq!(second.error.as_deref(), Some("sync already in progress"));
    assert_eq!(cache.stats().await.unwrap().pending_readings, 0);
}

#[tokio::test]
async fn passes_are_bounded_and_backlog_drains() {
    common_setup();

    let cache = Factory::cache().await;
    for i in 0..120 {
        let ts = format!("2024-06-01T12:{:02}:{:02}Z", i / 60, i % 60);
        cache.insert_reading("S1", "bulk", &json!({"i": i}), &ts).await.unwrap();
    }

    let remote = FakeRemote::new();
    let engine = SyncEngine::new(cache.clone(), Some(remote.clone()));

    let result = engine.sync_cached_data().await;
    assert_eq!(result.uploaded, READING_BATCH as u64);
    assert_eq!(cache.stats().await.unwrap().pending_readings, 20);

    // oldest first
    let remaining = cache.drain_unuploaded(Table::Readings, 1).await.unwrap();
    assert_eq!(remaining[0].id(), 101);

    let (result, passes) = engine.drain_backlog(10).await;
    assert_eq!(result, SyncResult::ok(20));
    assert_eq!(passes, 1);
    assert_eq!(cache.stats().await.unwrap().pending_readings, 0);
}

#[tokio::test]
async fn drain_backlog_reports_every_pass() {
    common_setup();

    let cache = Factory::cache().await;
    for i in 0..250 {
        let ts = format!("2024-06-01T{:02}:{:02}:00Z", i / 60, i % 60);
        cache.insert_reading("S1", "bulk", &json!({"i": i}), &ts).await.unwrap();
    }

    let engine = SyncEngine::new(cache.clone(), Some(FakeRemote::new()));

    // capped before the backlog is gone
    let (result, passes) = engine.drain_backlog(2).await;
    assert_eq!(result, SyncResult::ok(200));
    assert_eq!(passes, 2);

    let (result, passes) = engine.drain_backlog(10).await;
    assert_eq!(result, SyncResult::ok(50));
    assert_eq!(passes, 1);

    // nothing left: one empty pass
    let (result, passes) = engine.drain_backlog(10).await;
    assert_eq!(result, SyncResult::ok(0));
    assert_eq!(passes, 1);
}

mod common;
use common::*;

use solar_gateway::prelude::*;
use solar_gateway::scheduler::Scheduler;

use serde_json::json;
use std::time::Duration;

// one-second cadence: normal 1s, low_power 3s, offline 2s
fn fast_config(initial_mode: Mode) -> Config {
    let mut config = Factory::base_config();
    config.initial_mode = initial_mode;
    config.polling.interval = Duration::from_secs(1);
    config.polling.low_power_multiplier = 3;
    config.polling.offline_multiplier = 2;
    config.sync.interval = Duration::from_secs(1);
    config
}

#[tokio::test]
async fn device_readings_are_cached_and_published() {
    common_setup();

    let mut gw = Factory::simulated_gateway(fast_config(Mode::Normal), None).await;
    let handle = gw.spawn();

    let publisher = gw.publisher.clone();
    assert!(eventually(|| {
        let publisher = publisher.clone();
        async move { publisher.publish_count() >= 2 }
    })
    .await);

    let mut topics = gw.telemetry_topics();
    topics.sort();
    topics.dedup();
    assert_eq!(topics, vec!["S1/telemetry/battery-1", "S1/telemetry/inverter-1"]);
    assert!(gw.total_readings().await >= 2);

    // battery polls feed the heartbeat conditions
    assert!(gw.coordinator.conditions().battery_level.is_some());

    gw.shutdown(handle).await;

    let settled = gw.total_readings().await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(gw.total_readings().await, settled);
}

#[tokio::test]
async fn normal_mode_polls_every_interval() {
    common_setup();

    let mut gw = Factory::simulated_gateway(fast_config(Mode::Normal), None).await;
    let handle = gw.spawn();

    // polls at 0s, 1s and 2s for each of the two devices
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let total = gw.total_readings().await;
    assert!((5..=6).contains(&total), "{} readings", total);

    gw.shutdown(handle).await;
}

#[tokio::test]
async fn mode_change_moves_the_next_poll() {
    common_setup();

    let mut gw = Factory::simulated_gateway(fast_config(Mode::LowPower), None).await;
    let handle = gw.spawn();

    // low_power: 3s between polls, so only the first round so far
    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert_eq!(gw.total_readings().await, 2);

    // back to normal: the 1s deadline has already passed
    gw.coordinator.set_mode(Mode::Normal);
    let cache = gw.cache.clone();
    assert!(within(Duration::from_millis(500), || {
        let cache = cache.clone();
        async move { cache.stats().await.unwrap().total_readings >= 4 }
    })
    .await);

    gw.shutdown(handle).await;
}

#[tokio::test]
async fn offline_polling_caches_without_publishing() {
    common_setup();

    let mut gw = Factory::simulated_gateway(fast_config(Mode::Offline), None).await;
    let handle = gw.spawn();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(gw.total_readings().await, 2);
    assert_eq!(gw.pending_readings().await, 2);

    // offline: 2s between polls
    let cache = gw.cache.clone();
    assert!(within(Duration::from_millis(1500), || {
        let cache = cache.clone();
        async move { cache.stats().await.unwrap().total_readings == 4 }
    })
    .await);

    assert!(gw.telemetry_topics().is_empty());
    assert_eq!(gw.publisher.publish_count(), 0);

    gw.shutdown(handle).await;
}

#[tokio::test]
async fn periodic_sync_waits_while_offline() {
    common_setup();

    let remote = FakeRemote::new();
    let gw = Factory::build(
        fast_config(Mode::Offline),
        Some(remote.clone()),
        FakePublisher::connected(),
        std::sync::Arc::new(NoDevices),
    )
    .await;

    for sensor in ["a", "b", "c"] {
        gw.coordinator
            .ingest_data(Factory::reading(sensor, json!({"value": 1}), None))
            .await
            .unwrap();
    }

    let scheduler = Scheduler::new(gw.coordinator.config().clone(), gw.coordinator.clone());
    let handle = tokio::spawn(async move { scheduler.start().await });

    // ticks at 0s and 1s, both skipped
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(remote.readings.lock().unwrap().is_empty());
    assert_eq!(gw.pending_readings().await, 3);
    assert_eq!(gw.coordinator.status().await.stats.sync_passes, 0);

    gw.shutdown(handle).await;
}

#[tokio::test]
async fn periodic_sync_drains_the_backlog() {
    common_setup();

    let remote = FakeRemote::new();
    let mut config = fast_config(Mode::Normal);
    // only the immediate first tick within this test
    config.sync.interval = Duration::from_secs(60);
    let gw = Factory::build(
        config,
        Some(remote.clone()),
        FakePublisher::connected(),
        std::sync::Arc::new(NoDevices),
    )
    .await;

    for i in 0..150 {
        let ts = format!("2024-06-01T12:{:02}:{:02}Z", i / 60, i % 60);
        gw.cache.insert_reading("S1", "bulk", &json!({"i": i}), &ts).await.unwrap();
    }

    let scheduler = Scheduler::new(gw.coordinator.config().clone(), gw.coordinator.clone());
    let handle = tokio::spawn(async move { scheduler.start().await });

    // first tick is immediate: 100 then 50 in one drain
    let coordinator = gw.coordinator.clone();
    assert!(within(Duration::from_secs(3), || {
        let coordinator = coordinator.clone();
        async move { coordinator.status().await.stats.rows_uploaded == 150 }
    })
    .await);

    assert_eq!(remote.readings.lock().unwrap().len(), 150);
    assert_eq!(gw.pending_readings().await, 0);
    let stats = gw.coordinator.status().await.stats;
    assert_eq!(stats.sync_passes, 2);
    assert_eq!(stats.rows_uploaded, 150);

    gw.shutdown(handle).await;
}

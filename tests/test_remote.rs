mod common;
use common::*;

use solar_gateway::cache::{CachedHeartbeat, CachedReading};
use solar_gateway::prelude::*;
use solar_gateway::remote::RestStore;

use mockito::Matcher;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn reading(sensor_id: &str) -> CachedReading {
    CachedReading {
        id: 7,
        site_id: "S1".to_string(),
        sensor_id: sensor_id.to_string(),
        payload: json!({"value": 2.5, "unit": "kW"}),
        timestamp: "2024-06-01T12:00:00.000Z".to_string(),
        uploaded: false,
    }
}

fn store(url: &str) -> RestStore {
    RestStore::new(url, "secret-key", Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn posts_reading_rows() {
    common_setup();

    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/rest/v1/sensor_readings")
        .match_header("apikey", "secret-key")
        .match_header("authorization", "Bearer secret-key")
        .match_body(Matcher::PartialJson(json!({
            "sensor_id": "meter-1",
            "value": 2.5,
            "unit": "kW",
            "timestamp": "2024-06-01T12:00:00.000Z",
            "metadata": {"site_id": "S1"}
        })))
        .with_status(201)
        .create_async()
        .await;

    store(&server.url()).insert_reading(&reading("meter-1")).await.unwrap();

    mock.assert_async().await;
}

#[tokio::test]
async fn posts_heartbeat_rows() {
    common_setup();

    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/rest/v1/site_heartbeats")
        .match_body(Matcher::PartialJson(json!({
            "site_id": "S1",
            "power_mode": "low_power",
            "battery_level": 55.0,
            "network_type": "lte",
            "received_at": "2024-06-01T12:00:00.000Z"
        })))
        .with_status(201)
        .create_async()
        .await;

    let heartbeat = CachedHeartbeat {
        id: 1,
        site_id: "S1".to_string(),
        power_mode: Mode::LowPower,
        battery_level: Some(55.0),
        network_type: "lte".to_string(),
        signal_strength: Some(-90),
        timestamp: "2024-06-01T12:00:00.000Z".to_string(),
        uploaded: false,
    };
    store(&server.url()).insert_heartbeat(&heartbeat).await.unwrap();

    mock.assert_async().await;
}

#[tokio::test]
async fn classifies_failures() {
    common_setup();

    let mut server = mockito::Server::new_async().await;
    let _conflict = server
        .mock("POST", "/rest/v1/sensor_readings")
        .match_body(Matcher::PartialJson(json!({"sensor_id": "dup"})))
        .with_status(409)
        .with_body(r#"{"message":"duplicate key"}"#)
        .create_async()
        .await;
    let _unauthorized = server
        .mock("POST", "/rest/v1/sensor_readings")
        .match_body(Matcher::PartialJson(json!({"sensor_id": "locked"})))
        .with_status(401)
        .create_async()
        .await;

    let store = store(&server.url());

    let err = store.insert_reading(&reading("dup")).await.unwrap_err();
    assert!(!err.is_connection(), "{}", err);

    let err = store.insert_reading(&reading("locked")).await.unwrap_err();
    assert!(err.is_connection(), "{}", err);

    // nothing listens on port 1
    let err = self::store("http://127.0.0.1:1")
        .insert_reading(&reading("meter-1"))
        .await
        .unwrap_err();
    assert!(err.is_connection(), "{}", err);
}

#[tokio::test]
async fn sync_against_rest_store() {
    common_setup();

    let mut server = mockito::Server::new_async().await;
    let _accepted = server
        .mock("POST", "/rest/v1/sensor_readings")
        .match_body(Matcher::PartialJson(json!({"sensor_id": "good"})))
        .with_status(201)
        .create_async()
        .await;
    let _rejected = server
        .mock("POST", "/rest/v1/sensor_readings")
        .match_body(Matcher::PartialJson(json!({"sensor_id": "bad"})))
        .with_status(400)
        .create_async()
        .await;

    let cache = Factory::cache().await;
    let good = cache
        .insert_reading("S1", "good", &json!({"value": 1}), "2024-06-01T12:00:00Z")
        .await
        .unwrap();
    let bad = cache
        .insert_reading("S1", "bad", &json!({"value": 2}), "2024-06-01T12:00:01Z")
        .await
        .unwrap();

    let engine = SyncEngine::new(cache.clone(), Some(Arc::new(store(&server.url()))));
    let result = engine.sync_cached_data().await;

    assert_eq!(result, SyncResult::ok(1));
    assert!(cache.reading(good).await.unwrap().unwrap().uploaded);
    assert!(!cache.reading(bad).await.unwrap().unwrap().uploaded);
}

//! End-to-end flows through the full HTTP surface

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;
use via_core::config::ViaConfig;
use via_core::vector::{MemoryBackend, Point, SlowBackend, VectorBackend};
use via_server::forensic::ForensicStore;

use common::*;

#[tokio::test]
async fn error_burst_surfaces_as_the_only_anomaly() {
    let t = instance().await;
    let now = Utc::now().timestamp();

    let ingested = post_events(&t.server, &steady_info_events(now)).await;
    assert_eq!(ingested["accepted"], 500);
    post_events(&t.server, &error_burst_events(now, 0)).await;

    let body = run_anomalies(&t.server, 900, 5).await;
    let anomalies = body["anomalies"].as_array().unwrap();
    assert_eq!(anomalies.len(), 1, "expected exactly one anomaly: {body}");

    let anomaly = &anomalies[0];
    assert_eq!(anomaly["count"], 30);
    assert!(anomaly["score"].as_f64().unwrap() >= 0.8);
    assert_eq!(anomaly["rhythm_hash"], error_burst_hash().to_string());
    assert!(anomaly["representative"]["message"]
        .as_str()
        .unwrap()
        .contains("assertion failed"));
    assert_eq!(body["promoted"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn promoted_anomaly_shows_up_in_clusters() {
    let t = instance().await;
    let now = Utc::now().timestamp();

    post_events(&t.server, &steady_info_events(now)).await;
    post_events(&t.server, &error_burst_events(now, 0)).await;
    run_anomalies(&t.server, 900, 5).await;

    let response = t
        .server
        .post("/api/v1/analysis/tier2/clusters")
        .json(&json!({"start_ts": now - 3600, "end_ts": now}))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();

    let incidents = body["incidents"].as_array().unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0]["rhythm_hash"], error_burst_hash().to_string());
    assert!(incidents[0]["representative_message"]
        .as_str()
        .unwrap()
        .contains("assertion failed"));
    let today = ForensicStore::collection_name(now);
    assert_eq!(incidents[0]["partition"], today);
    assert!(body["warnings"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn repeated_analyses_do_not_duplicate_incidents() {
    let t = instance().await;
    let now = Utc::now().timestamp();

    post_events(&t.server, &error_burst_events(now, 0)).await;
    run_anomalies(&t.server, 900, 5).await;
    run_anomalies(&t.server, 600, 5).await;
    run_anomalies(&t.server, 900, 5).await;

    let response = t
        .server
        .post("/api/v1/analysis/tier2/clusters")
        .json(&json!({"start_ts": now - 3600, "end_ts": now}))
        .await;
    let body: serde_json::Value = response.json();
    assert_eq!(body["incidents"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn suppression_hides_then_expires() {
    let t = instance().await;
    let now = Utc::now().timestamp();
    post_events(&t.server, &error_burst_events(now, 0)).await;

    let response = t
        .server
        .post("/api/v1/control/suppress")
        .json(&json!({"rhythm_hash": error_burst_hash().to_string(), "ttl_sec": 1}))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["ok"], true);
    assert!(body["expires_at"].as_i64().unwrap() >= now);

    let body = run_anomalies(&t.server, 900, 5).await;
    assert!(body["anomalies"].as_array().unwrap().is_empty());

    // Past the TTL the same events make the class reappear.
    tokio::time::sleep(Duration::from_millis(1300)).await;
    let body = run_anomalies(&t.server, 900, 5).await;
    assert_eq!(body["anomalies"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn patch_silences_forever_and_records_a_regression_case() {
    let t = instance().await;
    let now = Utc::now().timestamp();
    post_events(&t.server, &error_burst_events(now, 0)).await;

    let hash = error_burst_hash();
    let response = t
        .server
        .post("/api/v1/control/patch")
        .json(&json!({"rhythm_hash": hash.to_string(), "operator_id": "op-7"}))
        .await;
    response.assert_status_ok();

    // 100 more matching events change nothing.
    let more: Vec<via_core::event::LogEvent> = (0..100)
        .map(|i| {
            via_core::event::LogEvent::new(
                now - 20 + (i % 20),
                "gateway",
                via_core::event::Level::Error,
                format!("assertion failed at /app/src/main.c:{}", 9000 + i),
            )
        })
        .collect();
    post_events(&t.server, &more).await;

    let body = run_anomalies(&t.server, 900, 5).await;
    assert!(body["anomalies"].as_array().unwrap().is_empty());

    let records = t.state.regression.read_all().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].rhythm_hash, hash);
    assert!(!records[0].events.is_empty());
    assert!(records[0].events.len() <= 5);
    assert_eq!(records[0].operator_id.as_deref(), Some("op-7"));

    // Patching again adds no second regression record.
    t.server
        .post("/api/v1/control/patch")
        .json(&json!({"rhythm_hash": hash.to_string()}))
        .await
        .assert_status_ok();
    assert_eq!(t.state.regression.read_all().unwrap().len(), 1);
}

#[tokio::test]
async fn suppress_then_lift_restores_anomaly_output() {
    let t = instance().await;
    let now = Utc::now().timestamp();
    post_events(&t.server, &error_burst_events(now, 0)).await;

    let hash = error_burst_hash().to_string();
    t.server
        .post("/api/v1/control/suppress")
        .json(&json!({"rhythm_hash": hash, "ttl_sec": 600}))
        .await
        .assert_status_ok();
    let body = run_anomalies(&t.server, 900, 5).await;
    assert!(body["anomalies"].as_array().unwrap().is_empty());

    let response = t
        .server
        .post("/api/v1/control/lift")
        .json(&json!({"rhythm_hash": hash}))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["existed"], true);

    let body = run_anomalies(&t.server, 900, 5).await;
    assert_eq!(body["anomalies"].as_array().unwrap().len(), 1);
}

fn incident_point(hash_hex: &str, day_ts: i64, count: i64, seed: f32) -> Point {
    let mut dense = vec![seed; 384];
    dense[0] = 1.0;
    Point {
        id: via_core::rhythm::incident_id(
            hash_hex.parse().unwrap(),
            &ForensicStore::day_key(day_ts),
        ),
        dense,
        sparse: None,
        payload: json!({
            "rhythm_hash": hash_hex,
            "service": "gateway",
            "level": "ERROR",
            "representative_message": "assertion failed at /app/src/main.c:7",
            "first_seen_ts": day_ts - 120,
            "last_seen_ts": day_ts - 5,
            "count": count,
            "promoted_at": day_ts,
            "promoted_score": 0.9,
        }),
    }
}

#[tokio::test]
async fn clusters_federate_and_deduplicate_across_utc_days() {
    let t = instance().await;
    let now = Utc::now().timestamp();
    let yesterday_noon = now - 86_400;

    // Yesterday's partition carries the same rhythm class with a larger
    // count, plus a class of its own.
    let y_name = t.state.forensic.ensure_daily(yesterday_noon).await.unwrap();
    let hash = error_burst_hash().to_string();
    t.state
        .forensic
        .backend()
        .upsert(
            &y_name,
            vec![
                incident_point(&hash, yesterday_noon, 99, 0.01),
                incident_point("00000000000000aa", yesterday_noon, 3, 0.02),
            ],
        )
        .await
        .unwrap();

    // Today's record for the shared class arrives through the real pipeline.
    post_events(&t.server, &error_burst_events(now, 0)).await;
    run_anomalies(&t.server, 900, 5).await;

    let response = t
        .server
        .post("/api/v1/analysis/tier2/clusters")
        .json(&json!({"start_ts": yesterday_noon - 3600, "end_ts": now}))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();

    let incidents = body["incidents"].as_array().unwrap();
    assert_eq!(incidents.len(), 2, "one per rhythm class: {body}");
    let shared = incidents
        .iter()
        .find(|i| i["rhythm_hash"] == hash)
        .expect("shared class present");
    // The duplicate resolves to the record with the larger count.
    assert_eq!(shared["count"], 99);
    assert_eq!(shared["partition"], y_name);
}

#[tokio::test]
async fn slow_partition_degrades_triage_with_a_warning() {
    let now = Utc::now().timestamp();
    let yesterday = now - 86_400;
    let slow_name = ForensicStore::collection_name(yesterday);

    let inner = Arc::new(MemoryBackend::new());
    let backend = Arc::new(SlowBackend::for_collection(
        inner,
        slow_name.clone(),
        Duration::from_millis(400),
    ));
    let config = ViaConfig {
        query_timeout_ms: 100,
        ..ViaConfig::default()
    };
    let t = instance_with_backend(backend, config).await;

    // One incident per day; the positive example lives in today's partition.
    let today_name = t.state.forensic.ensure_daily(now).await.unwrap();
    t.state.forensic.ensure_daily(yesterday).await.unwrap();
    let anchor = incident_point("00000000000000bb", now, 5, 0.1);
    let anchor_id = anchor.id;
    t.state
        .forensic
        .backend()
        .upsert(
            &today_name,
            vec![anchor, incident_point("00000000000000cc", now, 5, 0.2)],
        )
        .await
        .unwrap();

    let response = t
        .server
        .post("/api/v1/analysis/tier2/triage")
        .json(&json!({
            "start_ts": yesterday - 3600,
            "end_ts": now,
            "positive_ids": [anchor_id],
            "negative_ids": [],
        }))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();

    assert_eq!(body["warnings"], json!([slow_name]));
    let incidents = body["incidents"].as_array().unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0]["rhythm_hash"], "00000000000000cc");
}

#[tokio::test]
async fn triage_orders_results_by_score() {
    let t = instance().await;
    let now = Utc::now().timestamp();
    let name = t.state.forensic.ensure_daily(now).await.unwrap();

    let mk = |id: u128, dir: usize| {
        let mut dense = vec![0.0f32; 384];
        dense[dir] = 1.0;
        if dir != 0 {
            dense[0] = 0.2;
        }
        Point {
            id: Uuid::from_u128(id),
            dense,
            sparse: None,
            payload: incident_point(&format!("{:016x}", id), now, 2, 0.0).payload,
        }
    };
    t.state
        .forensic
        .backend()
        .upsert(&name, vec![mk(1, 0), mk(2, 1), mk(3, 2), mk(4, 3)])
        .await
        .unwrap();

    let response = t
        .server
        .post("/api/v1/analysis/tier2/triage")
        .json(&json!({
            "start_ts": now - 3600,
            "end_ts": now,
            "positive_ids": [Uuid::from_u128(1)],
            "negative_ids": [Uuid::from_u128(4)],
        }))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    let incidents = body["incidents"].as_array().unwrap();
    assert_eq!(incidents.len(), 2);
    let scores: Vec<f64> = incidents
        .iter()
        .map(|i| i["score"].as_f64().unwrap())
        .collect();
    assert!(scores[0] >= scores[1]);
}

#[tokio::test]
async fn boundary_inputs_are_rejected_or_empty() {
    let t = instance().await;
    let now = Utc::now().timestamp();

    // Zero events is a successful no-op.
    let body = post_events(&t.server, &[]).await;
    assert_eq!(body["accepted"], 0);

    // Empty window yields nothing.
    let body = run_anomalies(&t.server, 900, 5).await;
    assert!(body["anomalies"].as_array().unwrap().is_empty());

    // top_k = 0 yields nothing even with data.
    post_events(&t.server, &error_burst_events(now, 0)).await;
    let body = run_anomalies(&t.server, 900, 0).await;
    assert!(body["anomalies"].as_array().unwrap().is_empty());

    // Triage without positives is a BAD_REQUEST.
    let response = t
        .server
        .post("/api/v1/analysis/tier2/triage")
        .json(&json!({"start_ts": 0, "end_ts": 10, "positive_ids": []}))
        .await;
    response.assert_status_bad_request();
    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], "BAD_REQUEST");

    // Inverted ranges are rejected.
    let response = t
        .server
        .post("/api/v1/analysis/tier2/clusters")
        .json(&json!({"start_ts": 10, "end_ts": 0}))
        .await;
    response.assert_status_bad_request();

    // Non-positive suppress TTLs are rejected.
    let response = t
        .server
        .post("/api/v1/control/suppress")
        .json(&json!({"rhythm_hash": "00000000000000ff", "ttl_sec": 0}))
        .await;
    response.assert_status_bad_request();
}

#[tokio::test]
async fn malformed_events_are_counted_not_fatal() {
    let t = instance().await;
    let now = Utc::now().timestamp();

    let response = t
        .server
        .post("/api/v1/ingest/stream")
        .json(&json!({"events": [
            {"ts": now, "service": "gateway", "level": "INFO", "message": "fine"},
            {"ts": now, "service": "gateway", "level": "INFO", "message": ""},
            {"ts": 0, "service": "gateway", "level": "INFO", "message": "bad clock"},
        ]}))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["accepted"], 1);
    assert_eq!(body["parse_failed"], 2);
}

#[tokio::test]
async fn reingest_is_deduplicated_via_health_visible_counts() {
    let t = instance().await;
    let now = Utc::now().timestamp();
    let events = error_burst_events(now, 0);

    post_events(&t.server, &events).await;
    let body = post_events(&t.server, &events).await;
    assert_eq!(body["accepted"], 0);
    assert_eq!(body["deduped"], 30);

    let response = t.server.get("/health").await;
    response.assert_status_ok();
    let health: serde_json::Value = response.json();
    assert_eq!(health["ok"], true);
    assert_eq!(health["tier1_points"], 30);
}

#[tokio::test]
async fn schema_endpoints_round_trip() {
    let t = instance().await;

    let response = t
        .server
        .post("/api/v1/schemas/detect")
        .json(&json!({
            "source_name": "edge",
            "sample_logs": [
                "1700000000|gateway|INFO|connection established",
                "1700000001|billing|ERROR|charge failed",
            ],
        }))
        .await;
    response.assert_status_ok();
    let detected: serde_json::Value = response.json();
    assert_eq!(detected["delimiters"], json!(["|"]));

    t.server
        .post("/api/v1/schemas")
        .json(&detected)
        .await
        .assert_status_ok();

    let response = t.server.get("/api/v1/schemas/edge").await;
    response.assert_status_ok();
    let fetched: serde_json::Value = response.json();
    assert_eq!(fetched["source_name"], "edge");

    t.server
        .get("/api/v1/schemas/unknown")
        .await
        .assert_status_not_found();
}

//! Shared test utilities for via-server integration tests

use std::sync::Arc;

use axum_test::TestServer;
use serde_json::json;
use tempfile::TempDir;
use via_core::config::ViaConfig;
use via_core::event::{Level, LogEvent};
use via_core::vector::{MemoryBackend, VectorBackend};
use via_server::{create_router, AppState};

/// A test instance: shared state, an HTTP client over the full router, and
/// the tempdir holding the regression log.
pub struct TestInstance {
    pub state: Arc<AppState>,
    pub server: TestServer,
    #[allow(dead_code)]
    dir: TempDir,
}

pub async fn instance() -> TestInstance {
    instance_with_backend(Arc::new(MemoryBackend::new()), ViaConfig::default()).await
}

pub async fn instance_with_backend(
    backend: Arc<dyn VectorBackend>,
    mut config: ViaConfig,
) -> TestInstance {
    let dir = TempDir::new().unwrap();
    config.control_store_path = dir.path().join("control.db");
    config.regression_log_path = dir.path().join("regressions.jsonl");

    let state = AppState::initialize(config, backend).await.unwrap();
    let server = TestServer::new(create_router(state.clone())).unwrap();
    TestInstance { state, server, dir }
}

/// 500 INFO events with one connection template, spread over ten minutes
/// ending one minute before `now`.
pub fn steady_info_events(now: i64) -> Vec<LogEvent> {
    (0..500)
        .map(|i| {
            LogEvent::new(
                now - 660 + (i * 600 / 500),
                "gateway",
                Level::Info,
                format!("connection established from 10.0.{}.{}:{}", i % 200, i % 9, 40_000 + i),
            )
        })
        .collect()
}

/// 30 ERROR events with one assertion template inside the final minute.
pub fn error_burst_events(now: i64, salt: i64) -> Vec<LogEvent> {
    (0..30)
        .map(|i| {
            LogEvent::new(
                now - 55 + (i % 55),
                "gateway",
                Level::Error,
                format!("assertion failed at /app/src/main.c:{}", 100 + salt * 100 + i),
            )
        })
        .collect()
}

/// The rhythm hash shared by every event `error_burst_events` produces.
pub fn error_burst_hash() -> via_core::rhythm::RhythmHash {
    via_core::rhythm::rhythm_hash(&LogEvent::new(
        1,
        "gateway",
        Level::Error,
        "assertion failed at /app/src/main.c:1",
    ))
}

pub async fn post_events(server: &TestServer, events: &[LogEvent]) -> serde_json::Value {
    let response = server
        .post("/api/v1/ingest/stream")
        .json(&json!({"events": events}))
        .await;
    response.assert_status_ok();
    response.json()
}

pub async fn run_anomalies(server: &TestServer, window_sec: i64, top_k: usize) -> serde_json::Value {
    let response = server
        .post("/api/v1/analysis/tier1/rhythm_anomalies")
        .json(&json!({"window_sec": window_sec, "top_k": top_k}))
        .await;
    response.assert_status_ok();
    response.json()
}

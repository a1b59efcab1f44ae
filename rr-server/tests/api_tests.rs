//! Integration tests for the rr-server HTTP API
//!
//! Uses tower::ServiceExt::oneshot to test routes directly without binding a port.

use async_trait::async_trait;
use axum::body::Body;
use chrono::{Duration, TimeZone, Utc};
use http_body_util::BodyExt;
use hyper::Request;
use rr_core::{
    adapter::{SampleStore, StaticStore},
    error::ReplayError,
    model::{
        group_samples, Channels, EntityClass, EntityFilter, EntityId, Frame, Sample, TimeRange,
        TimelineMap, Timestamp,
    },
};
use rr_server::{
    api::{create_router, DEGRADED_HEADER},
    config::ServerConfig,
    state::{AppState, Sources},
};
use std::sync::Arc;
use tower::ServiceExt;

fn ts(ms: i64) -> Timestamp {
    Utc.with_ymd_and_hms(2024, 3, 2, 15, 0, 0).unwrap() + Duration::milliseconds(ms)
}

fn iso(ms: i64) -> String {
    ts(ms).to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Car 44 drives diagonally, car 1 is parked.
fn fixture() -> TimelineMap {
    group_samples(vec![
        Sample::new(EntityId(44), ts(0), Channels::position(0.0, 0.0).with_speed(100.0).with_gear(3)),
        Sample::new(EntityId(44), ts(1000), Channels::position(100.0, 50.0).with_speed(200.0).with_gear(4)),
        Sample::new(EntityId(44), ts(2000), Channels::position(200.0, 100.0).with_speed(300.0).with_gear(5)),
        Sample::new(EntityId(1), ts(0), Channels::position(500.0, 500.0)),
        Sample::new(EntityId(1), ts(1000), Channels::position(500.0, 500.0)),
        Sample::new(EntityId(1), ts(2000), Channels::position(500.0, 500.0)),
    ])
}

struct DownStore;

#[async_trait]
impl SampleStore for DownStore {
    fn name(&self) -> &str {
        "down"
    }

    async fn fetch_window(
        &self,
        _class: &EntityClass,
        _range: TimeRange,
        _filter: Option<&EntityFilter>,
    ) -> Result<TimelineMap, ReplayError> {
        Err(ReplayError::source_unavailable("connection refused"))
    }
}

/// Helper: build a router serving the fixture for every session
fn app() -> axum::Router {
    create_router(AppState::with_store(Arc::new(StaticStore::new(fixture()))))
}

/// Helper: build a router whose source always fails
fn down_app(degrade: bool) -> axum::Router {
    let config = ServerConfig {
        degrade_on_source_error: degrade,
        ..ServerConfig::default()
    };
    create_router(AppState::new(config, Sources::Fixed(Arc::new(DownStore))))
}

async fn get(app: axum::Router, uri: &str) -> axum::response::Response {
    app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

/// Helper: collect response body into bytes
async fn body_bytes(body: Body) -> Vec<u8> {
    let collected = body.collect().await.unwrap();
    collected.to_bytes().to_vec()
}

/// Helper: collect response body into JSON
async fn body_json(body: Body) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(body).await).unwrap()
}

/// Helper: the 0..2000ms window at 500ms stride unless `extra` names its own
fn window_uri(extra: &str) -> String {
    let stride = if extra.contains("stride_ms=") { "" } else { "&stride_ms=500" };
    format!(
        "/api/sessions/9158/frames?from={}&to={}{}{}",
        iso(0),
        iso(2000),
        stride,
        extra
    )
}

fn content_type(response: &axum::response::Response) -> String {
    response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string()
}

// ==================== GET /api/health ====================

#[tokio::test]
async fn test_health_returns_ok() {
    let response = get(app(), "/api/health").await;
    assert_eq!(response.status(), 200);
    let body = body_json(response.into_body()).await;
    assert_eq!(body["status"], "ok");
}

// ==================== GET /api/sessions/:session/frames ====================

#[tokio::test]
async fn test_frames_json_batch_wire_shape() {
    let response = get(app(), &window_uri("")).await;
    assert_eq!(response.status(), 200);
    assert!(content_type(&response).contains("application/json"));
    assert!(response.headers().get(DEGRADED_HEADER).is_none());

    let body = body_json(response.into_body()).await;
    let frames = body.as_array().expect("batch is a JSON array");
    assert_eq!(frames.len(), 5, "0..2000 at 500ms is five frames");

    let first = &frames[0];
    assert_eq!(first["fields"], serde_json::json!(["n", "x", "y"]));
    let t = chrono::DateTime::parse_from_rfc3339(first["t"].as_str().unwrap()).unwrap();
    assert_eq!(t, ts(0));

    let middle = &frames[1]["entities"];
    assert_eq!(middle.as_array().unwrap().len(), 2);
    assert_eq!(middle[0][0], 1, "rows ordered by entity id");
    assert_eq!(middle[1][0], 44);
    assert_eq!(middle[1][1].as_f64(), Some(50.0));
    assert_eq!(middle[1][2].as_f64(), Some(25.0));
}

#[tokio::test]
async fn test_frames_include_adds_columns() {
    let response = get(app(), &window_uri("&include=speed,gear&drivers=44")).await;
    assert_eq!(response.status(), 200);

    let body = body_json(response.into_body()).await;
    let frame = &body[1];
    assert_eq!(frame["fields"], serde_json::json!(["n", "x", "y", "v", "gear"]));

    let rows = frame["entities"].as_array().unwrap();
    assert_eq!(rows.len(), 1, "drivers filter keeps only car 44");
    assert_eq!(rows[0][3].as_f64(), Some(150.0));
    assert_eq!(rows[0][4], 4, "gear switches to the later sample at the midpoint");
}

#[tokio::test]
async fn test_frames_delta_omits_unchanged_rows() {
    let response = get(app(), &window_uri("&delta=true")).await;
    let frames: Vec<Frame> = serde_json::from_slice(&body_bytes(response.into_body()).await).unwrap();

    assert!(frames[0].row(EntityId(1)).is_some(), "first sighting is always sent");
    for frame in &frames[1..] {
        assert!(frame.row(EntityId(1)).is_none(), "parked car is unchanged");
        assert!(frame.row(EntityId(44)).is_some(), "moving car changes every stride");
    }
}

#[tokio::test]
async fn test_frames_respect_gap_limit() {
    let response = get(app(), &window_uri("&gap_ms=400&drivers=44")).await;
    let frames: Vec<Frame> = serde_json::from_slice(&body_bytes(response.into_body()).await).unwrap();

    let xs: Vec<f64> = frames
        .iter()
        .map(|f| f.row(EntityId(44)).unwrap().channels.x)
        .collect();
    // every bracket is 1000ms wide, so each stride holds the nearer sample
    assert_eq!(xs, vec![0.0, 0.0, 100.0, 100.0, 200.0]);
}

#[tokio::test]
async fn test_frames_ndjson_streams_one_frame_per_line() {
    let response = get(app(), &window_uri("&format=ndjson")).await;
    assert_eq!(response.status(), 200);
    assert_eq!(content_type(&response), "application/x-ndjson");

    let text = String::from_utf8(body_bytes(response.into_body()).await).unwrap();
    assert!(text.ends_with('\n'));
    let frames: Vec<Frame> = text
        .lines()
        .map(|line| Frame::from_json(line).unwrap())
        .collect();

    assert_eq!(frames.len(), 5);
    assert!(frames.windows(2).all(|w| w[0].t < w[1].t));
    assert_eq!(frames[4].row(EntityId(44)).unwrap().channels.x, 200.0);
}

#[tokio::test]
async fn test_frames_msgpack_batch_decodes() {
    let response = get(app(), &window_uri("&format=msgpack&include=speed")).await;
    assert_eq!(response.status(), 200);
    assert_eq!(content_type(&response), "application/msgpack");

    let frames: Vec<Frame> = rmp_serde::from_slice(&body_bytes(response.into_body()).await).unwrap();
    assert_eq!(frames.len(), 5);
    assert_eq!(frames[2].row(EntityId(44)).unwrap().channels.speed, Some(200.0));
}

#[tokio::test]
async fn test_point_query_returns_single_frame() {
    let uri = format!("/api/sessions/9158/frames?t={}&drivers=44", iso(1100));
    let response = get(app(), &uri).await;
    assert_eq!(response.status(), 200);

    let frames: Vec<Frame> = serde_json::from_slice(&body_bytes(response.into_body()).await).unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].t, ts(1100));
    // the narrow point margin only reaches the sample at 1000ms
    assert_eq!(frames[0].row(EntityId(44)).unwrap().channels.x, 100.0);
}

#[tokio::test]
async fn test_reversed_window_is_400_with_field() {
    let uri = format!("/api/sessions/9158/frames?from={}&to={}", iso(2000), iso(0));
    let response = get(app(), &uri).await;
    assert_eq!(response.status(), 400);

    let body = body_json(response.into_body()).await;
    assert_eq!(body["field"], "to");
    assert!(body["error"].as_str().unwrap().contains("malformed window"));
}

#[tokio::test]
async fn test_bad_requests_are_400() {
    let cases = [
        "/api/sessions/9158/frames".to_string(),
        format!("/api/sessions/9158/frames?from={}", iso(0)),
        format!("/api/sessions/9158/frames?from=yesterday&to={}", iso(0)),
        window_uri("&stride_ms=0"),
        window_uri("&stride_ms=fast"),
        window_uri("&gap_ms=0"),
        window_uri("&drivers=44,abc"),
        window_uri("&format=xml"),
        window_uri("&delta=maybe"),
        window_uri("&class=weather"),
    ];

    for uri in cases {
        let response = get(app(), &uri).await;
        assert_eq!(response.status(), 400, "expected 400 for {}", uri);
        let body = body_json(response.into_body()).await;
        assert!(body["error"].is_string(), "error body for {}", uri);
    }
}

#[tokio::test]
async fn test_source_failure_degrades_to_empty_frames() {
    let response = get(down_app(true), &window_uri("")).await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get(DEGRADED_HEADER).unwrap(),
        "source-unavailable"
    );

    let frames: Vec<Frame> = serde_json::from_slice(&body_bytes(response.into_body()).await).unwrap();
    assert_eq!(frames.len(), 5, "one empty frame per stride");
    assert!(frames.iter().all(|f| f.entities.is_empty()));
}

#[tokio::test]
async fn test_source_failure_degrades_ndjson_too() {
    let response = get(down_app(true), &window_uri("&format=ndjson")).await;
    assert_eq!(response.status(), 200);
    assert!(response.headers().get(DEGRADED_HEADER).is_some());

    let text = String::from_utf8(body_bytes(response.into_body()).await).unwrap();
    assert_eq!(text.lines().count(), 5);
}

#[tokio::test]
async fn test_source_failure_without_degrade_is_502() {
    let response = get(down_app(false), &window_uri("")).await;
    assert_eq!(response.status(), 502);
}

#[tokio::test]
async fn test_validation_wins_over_source_failure() {
    let response = get(down_app(true), &window_uri("&stride_ms=0")).await;
    assert_eq!(response.status(), 400);
    let body = body_json(response.into_body()).await;
    assert_eq!(body["field"], "stride_ms");
}

#[tokio::test]
async fn test_oversized_stride_is_400_not_a_crash() {
    let response = get(app(), &window_uri("&stride_ms=9223372036854775808")).await;
    assert_eq!(response.status(), 400);
    let body = body_json(response.into_body()).await;
    assert_eq!(body["field"], "stride_ms");

    let response = get(app(), &window_uri(&format!("&stride_ms={}", u64::MAX))).await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_demo_source_serves_full_field() {
    let state = AppState::from_config(ServerConfig::default()).unwrap();
    let start = ServerConfig::default().demo.session_start;
    let uri = format!(
        "/api/sessions/demo/frames?from={}&to={}&stride_ms=1000",
        (start + Duration::seconds(60)).to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        (start + Duration::seconds(62)).to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    );
    let response = get(create_router(state), &uri).await;
    assert_eq!(response.status(), 200);

    let frames: Vec<Frame> = serde_json::from_slice(&body_bytes(response.into_body()).await).unwrap();
    assert_eq!(frames.len(), 3);
    assert!(frames.iter().all(|f| f.entities.len() == 10));
}

// ==================== GET /api/sessions/:session/bounds ====================

#[tokio::test]
async fn test_bounds_pad_the_scan_window() {
    let uri = format!("/api/sessions/9158/bounds?from={}", iso(0));
    let response = get(app(), &uri).await;
    assert_eq!(response.status(), 200);

    let body = body_json(response.into_body()).await;
    assert_eq!(body["minX"].as_f64(), Some(-25.0));
    assert_eq!(body["maxX"].as_f64(), Some(525.0));
    assert_eq!(body["minY"].as_f64(), Some(-25.0));
    assert_eq!(body["maxY"].as_f64(), Some(525.0));
}

#[tokio::test]
async fn test_bounds_fall_back_without_data() {
    let uri = format!("/api/sessions/9158/bounds?from={}", iso(600_000));
    let body = body_json(get(app(), &uri).await.into_body()).await;
    assert_eq!(body["minX"].as_f64(), Some(-5000.0));
    assert_eq!(body["maxY"].as_f64(), Some(5000.0));
}

#[tokio::test]
async fn test_bounds_degrade_on_source_failure() {
    let uri = format!("/api/sessions/9158/bounds?from={}", iso(0));
    let response = get(down_app(true), &uri).await;
    assert_eq!(response.status(), 200);
    assert!(response.headers().get(DEGRADED_HEADER).is_some());
    let body = body_json(response.into_body()).await;
    assert_eq!(body["minX"].as_f64(), Some(-5000.0));
}

#[tokio::test]
async fn test_bounds_require_from() {
    let response = get(app(), "/api/sessions/9158/bounds").await;
    assert_eq!(response.status(), 400);
}

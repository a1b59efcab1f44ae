//! REST and NDJSON streaming routes

use crate::state::AppState;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use rr_core::{
    error::ReplayError,
    model::{ChannelSelection, EntityClass, EntityFilter, Frame, Timestamp},
    window::FrameRequest,
    TrackBounds,
};
use serde::Deserialize;
use std::convert::Infallible;
use thiserror::Error;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::{compression::CompressionLayer, cors::CorsLayer};
use tracing::{debug, error, warn};

pub const DEGRADED_HEADER: &str = "x-replay-degraded";
pub const DEGRADED_SOURCE: &str = "source-unavailable";
pub const NDJSON: &str = "application/x-ndjson";
pub const MSGPACK: &str = "application/msgpack";

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/sessions/:session/frames", get(frames))
        .route("/api/sessions/:session/bounds", get(bounds))
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// === Errors ===

/// A replay error on its way to becoming an HTTP response
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ApiError(#[from] ReplayError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            e if e.is_client_error() => StatusCode::BAD_REQUEST,
            ReplayError::SourceUnavailable { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let mut body = serde_json::json!({ "error": self.0.to_string() });
        if let ReplayError::MalformedWindow { field, .. } = &self.0 {
            body["field"] = serde_json::Value::from(field.as_str());
        }
        (status, Json(body)).into_response()
    }
}

// === Query parsing ===

#[derive(Debug, Default, Deserialize)]
struct FramesQuery {
    from: Option<String>,
    to: Option<String>,
    t: Option<String>,
    stride_ms: Option<String>,
    drivers: Option<String>,
    include: Option<String>,
    format: Option<String>,
    delta: Option<String>,
    gap_ms: Option<String>,
    class: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Ndjson,
    Msgpack,
}

impl Format {
    fn parse(raw: Option<&str>) -> Result<Self, ReplayError> {
        match raw.map(str::to_lowercase).as_deref() {
            None | Some("") | Some("json") => Ok(Format::Json),
            Some("ndjson") => Ok(Format::Ndjson),
            Some("msgpack") => Ok(Format::Msgpack),
            Some(other) => Err(ReplayError::malformed(
                "format",
                format!("unsupported format '{}'", other),
            )),
        }
    }
}

fn parse_time(field: &str, raw: &str) -> Result<Timestamp, ReplayError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ReplayError::malformed(field, format!("'{}' is not an RFC 3339 time: {}", raw, e)))
}

fn parse_ms(field: &str, raw: Option<&str>, default: u64) -> Result<u64, ReplayError> {
    match raw {
        None | Some("") => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| ReplayError::malformed(field, format!("'{}' is not a millisecond count", raw))),
    }
}

fn parse_flag(field: &str, raw: Option<&str>) -> Result<bool, ReplayError> {
    match raw.map(str::to_lowercase).as_deref() {
        None | Some("") | Some("0") | Some("false") | Some("no") | Some("off") => Ok(false),
        Some("1") | Some("true") | Some("yes") | Some("on") => Ok(true),
        Some(other) => Err(ReplayError::malformed(field, format!("'{}' is not a flag", other))),
    }
}

/// Either a whole window or one instant
enum FramesTarget {
    Window(FrameRequest),
    Point(FrameRequest),
}

fn build_request(query: &FramesQuery, state: &AppState) -> Result<FramesTarget, ReplayError> {
    let config = &state.config;
    let stride_ms = parse_ms("stride_ms", query.stride_ms.as_deref(), config.default_stride_ms)?;
    let gap_ms = parse_ms("gap_ms", query.gap_ms.as_deref(), config.default_gap_ms)?;
    let filter = match query.drivers.as_deref() {
        Some(drivers) => EntityFilter::parse(drivers)?,
        None => None,
    };
    let channels = query
        .include
        .as_deref()
        .map(ChannelSelection::parse)
        .unwrap_or_default();
    let class = query
        .class
        .as_deref()
        .filter(|c| !c.is_empty())
        .map(|c| EntityClass(c.to_string()))
        .unwrap_or_default();
    let delta = parse_flag("delta", query.delta.as_deref())?;

    if let Some(t) = query.t.as_deref() {
        let t = parse_time("t", t)?;
        let request = FrameRequest::window(t, t)
            .class(class)
            .filter(filter)
            .channels(channels)
            .max_gap_ms(gap_ms);
        return Ok(FramesTarget::Point(request));
    }

    let from = query
        .from
        .as_deref()
        .ok_or_else(|| ReplayError::malformed("from", "either t or from/to is required"))?;
    let to = query
        .to
        .as_deref()
        .ok_or_else(|| ReplayError::malformed("to", "missing window end"))?;

    Ok(FramesTarget::Window(
        FrameRequest::window(parse_time("from", from)?, parse_time("to", to)?)
            .class(class)
            .stride_ms(stride_ms)
            .filter(filter)
            .channels(channels)
            .delta(delta)
            .max_gap_ms(gap_ms),
    ))
}

// === Frames Endpoint ===

/// Frames for a whole window, or for one instant with `t=`.
async fn frames(
    State(state): State<AppState>,
    Path(session): Path<String>,
    Query(query): Query<FramesQuery>,
) -> Result<Response, ApiError> {
    let format = Format::parse(query.format.as_deref())?;
    let target = build_request(&query, &state)?;
    let generator = state.generator(&session);

    match target {
        FramesTarget::Point(request) => {
            let t = request.range.from;
            let result = generator
                .frame_at(
                    t,
                    request.class.clone(),
                    request.filter.clone(),
                    request.channels,
                    request.max_gap_ms,
                )
                .await;
            match result {
                Ok(frame) => Ok(batch_response(format, vec![frame], false)),
                Err(e) => degrade(&state, &session, e, || {
                    batch_response(format, vec![Frame::empty(t, request.channels)], true)
                }),
            }
        }
        FramesTarget::Window(request) if format == Format::Ndjson => {
            match generator.incremental(&request).await {
                Ok(rx) => Ok(ndjson_response(ReceiverStream::new(rx), false)),
                Err(e) => degrade(&state, &session, e, || {
                    ndjson_response(stream::iter(no_data_frames(&request)), true)
                }),
            }
        }
        FramesTarget::Window(request) => match generator.batch(&request).await {
            Ok(frames) => Ok(batch_response(format, frames, false)),
            Err(e) => degrade(&state, &session, e, || {
                batch_response(format, no_data_frames(&request), true)
            }),
        },
    }
}

/// Turn an upstream failure into "no data" frames when configured to;
/// anything else is returned as an error.
fn degrade(
    state: &AppState,
    session: &str,
    e: ReplayError,
    fallback: impl FnOnce() -> Response,
) -> Result<Response, ApiError> {
    match e {
        ReplayError::SourceUnavailable { .. } if state.config.degrade_on_source_error => {
            warn!(session, "Serving empty frames, source unavailable: {}", e);
            Ok(fallback())
        }
        e => Err(e.into()),
    }
}

fn no_data_frames(request: &FrameRequest) -> Vec<Frame> {
    request
        .timestamps()
        .map(|t| Frame::empty(t, request.channels))
        .collect()
}

fn mark_degraded(response: &mut Response, degraded: bool) {
    if degraded {
        response
            .headers_mut()
            .insert(DEGRADED_HEADER, HeaderValue::from_static(DEGRADED_SOURCE));
    }
}

fn batch_response(format: Format, frames: Vec<Frame>, degraded: bool) -> Response {
    debug!(frames = frames.len(), ?format, "Answering batch");
    let mut response = match format {
        Format::Msgpack => match rmp_serde::to_vec_named(&frames) {
            Ok(bytes) => ([(header::CONTENT_TYPE, MSGPACK)], bytes).into_response(),
            Err(e) => {
                error!("Failed to encode frames as msgpack: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
        Format::Ndjson => return ndjson_response(stream::iter(frames), degraded),
        Format::Json => Json(frames).into_response(),
    };
    mark_degraded(&mut response, degraded);
    response
}

fn ndjson_response<S>(frames: S, degraded: bool) -> Response
where
    S: Stream<Item = Frame> + Send + 'static,
{
    let lines = frames.filter_map(|frame| async move {
        match frame.to_json() {
            Ok(mut line) => {
                line.push('\n');
                Some(Ok::<_, Infallible>(line))
            }
            Err(e) => {
                error!("Failed to serialize frame: {}", e);
                None
            }
        }
    });

    let mut response = ([(header::CONTENT_TYPE, NDJSON)], Body::from_stream(lines)).into_response();
    mark_degraded(&mut response, degraded);
    response
}

// === Bounds Endpoint ===

#[derive(Debug, Deserialize)]
struct BoundsQuery {
    from: Option<String>,
    class: Option<String>,
}

/// Padded extent of the first 30s of positions from `from`.
async fn bounds(
    State(state): State<AppState>,
    Path(session): Path<String>,
    Query(query): Query<BoundsQuery>,
) -> Result<Response, ApiError> {
    let from = query
        .from
        .as_deref()
        .ok_or_else(|| ReplayError::malformed("from", "missing scan start"))?;
    let from = parse_time("from", from)?;
    let class = query
        .class
        .map(EntityClass)
        .unwrap_or_default();

    match state.generator(&session).bounds(&class, from).await {
        Ok(bounds) => Ok(Json(bounds).into_response()),
        Err(e) => degrade(&state, &session, e, || {
            let mut response = Json(TrackBounds::fallback()).into_response();
            mark_degraded(&mut response, true);
            response
        }),
    }
}

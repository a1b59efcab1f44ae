//! Where playback frames come from
//!
//! A [`FrameSource`] turns one chunk request into an ordered stream of
//! frames. The HTTP source reads the server's NDJSON endpoint line by line;
//! the local source runs the generator in-process.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use rr_core::{error::ReplayError, generator::FrameGenerator, model::Frame, window::FrameRequest};
use serde::Deserialize;
use std::io;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio_stream::wrappers::{LinesStream, ReceiverStream};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

pub type FrameStream = BoxStream<'static, Result<Frame, ReplayError>>;

/// Header the server sets when it answered with "no data" frames
pub const DEGRADED_HEADER: &str = "x-replay-degraded";

#[async_trait]
pub trait FrameSource: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Start producing the frames of `request`, in timestamp order.
    ///
    /// An `Err` here, or an `Err` item mid-stream, is a failed prefetch:
    /// the caller keeps what it already received and retries later.
    async fn open(&self, request: &FrameRequest) -> Result<FrameStream, ReplayError>;
}

// =============================================================================
// HttpFrameSource
// =============================================================================

/// Reads `GET {base}/api/sessions/{session}/frames?format=ndjson`
#[derive(Debug, Clone)]
pub struct HttpFrameSource {
    http: reqwest::Client,
    base_url: String,
    session: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    field: Option<String>,
}

impl HttpFrameSource {
    pub fn new(base_url: impl Into<String>, session: impl Into<String>) -> Result<Self, ReplayError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ReplayError::source_unavailable(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session: session.into(),
        })
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    fn url(&self) -> String {
        format!("{}/api/sessions/{}/frames", self.base_url, self.session)
    }

    fn query(request: &FrameRequest) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("from", request.range.from.to_rfc3339()),
            ("to", request.range.to.to_rfc3339()),
            ("stride_ms", request.stride_ms.to_string()),
            ("gap_ms", request.max_gap_ms.to_string()),
            ("class", request.class.to_string()),
            ("format", "ndjson".to_string()),
        ];
        let mut include = Vec::new();
        if request.channels.speed {
            include.push("speed");
        }
        if request.channels.gear {
            include.push("gear");
        }
        if !include.is_empty() {
            query.push(("include", include.join(",")));
        }
        if let Some(filter) = &request.filter {
            let drivers: Vec<String> = filter.ids().map(|id| id.to_string()).collect();
            query.push(("drivers", drivers.join(",")));
        }
        if request.delta {
            query.push(("delta", "true".to_string()));
        }
        query
    }
}

#[async_trait]
impl FrameSource for HttpFrameSource {
    fn name(&self) -> &str {
        "http"
    }

    async fn open(&self, request: &FrameRequest) -> Result<FrameStream, ReplayError> {
        let response = self
            .http
            .get(self.url())
            .query(&Self::query(request))
            .send()
            .await
            .map_err(|e| ReplayError::source_unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            let body: Option<ErrorBody> = response.json().await.ok();
            return Err(match body {
                Some(ErrorBody {
                    error,
                    field: Some(field),
                }) => ReplayError::malformed(field, error),
                _ => ReplayError::UnknownEntityClass {
                    class: request.class.to_string(),
                },
            });
        }
        if !status.is_success() {
            return Err(ReplayError::source_unavailable(format!(
                "server answered {}",
                status
            )));
        }
        if let Some(reason) = response.headers().get(DEGRADED_HEADER) {
            warn!(session = %self.session, ?reason, "Server has no data for this chunk");
            return Err(ReplayError::source_unavailable(format!(
                "server degraded: {}",
                reason.to_str().unwrap_or("unknown")
            )));
        }

        debug!(session = %self.session, from = %request.range.from, "Streaming chunk");
        let bytes = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        let lines = LinesStream::new(StreamReader::new(bytes).lines());

        Ok(lines
            .try_filter(|line| futures::future::ready(!line.trim().is_empty()))
            .map(|line| match line {
                Ok(line) => Frame::from_json(&line),
                Err(e) => Err(ReplayError::source_unavailable(format!("stream broke: {}", e))),
            })
            .boxed())
    }
}

// =============================================================================
// LocalFrameSource
// =============================================================================

/// Runs the frame generator in-process over any sample store
#[derive(Clone)]
pub struct LocalFrameSource {
    generator: FrameGenerator,
}

impl LocalFrameSource {
    pub fn new(generator: FrameGenerator) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl FrameSource for LocalFrameSource {
    fn name(&self) -> &str {
        "local"
    }

    async fn open(&self, request: &FrameRequest) -> Result<FrameStream, ReplayError> {
        let rx = self.generator.incremental(request).await?;
        Ok(ReceiverStream::new(rx).map(Ok).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rr_core::model::{ChannelSelection, EntityFilter};

    #[test]
    fn test_query_names_match_server() {
        let from = Utc.with_ymd_and_hms(2024, 3, 2, 15, 0, 0).unwrap();
        let request = FrameRequest::window(from, from + chrono::Duration::seconds(4))
            .channels(ChannelSelection::all())
            .filter(EntityFilter::parse("44,1").unwrap())
            .delta(true);

        let query = HttpFrameSource::query(&request);
        let get = |k: &str| {
            query
                .iter()
                .find(|(name, _)| *name == k)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(get("format").as_deref(), Some("ndjson"));
        assert_eq!(get("include").as_deref(), Some("speed,gear"));
        assert_eq!(get("drivers").as_deref(), Some("1,44"));
        assert_eq!(get("delta").as_deref(), Some("true"));
        assert_eq!(get("stride_ms").as_deref(), Some("200"));
    }

    #[test]
    fn test_query_omits_empty_include() {
        let from = Utc.with_ymd_and_hms(2024, 3, 2, 15, 0, 0).unwrap();
        let query = HttpFrameSource::query(&FrameRequest::window(from, from));
        assert!(query.iter().all(|(k, _)| *k != "include" && *k != "drivers" && *k != "delta"));
    }
}

//! Store adapter for an OpenF1-style REST provider
//!
//! One windowed query per fetch:
//! `GET {base}/{class}?session_key=..&date>=..&date<=..[&driver_number=..]`.
//! The provider answers with a flat JSON array of rows; rows are grouped per
//! driver and sorted locally.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rr_core::{
    adapter::SampleStore,
    error::ReplayError,
    model::{
        group_samples, Channels, EntityClass, EntityFilter, EntityId, Sample, TimeRange,
        TimelineMap, Timestamp,
    },
};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Upstream connection settings
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct OpenF1Config {
    pub base_url: String,
    pub timeout_ms: u64,
    /// Entity classes the provider serves; anything else is rejected locally
    pub classes: Vec<String>,
}

impl Default for OpenF1Config {
    fn default() -> Self {
        Self {
            base_url: "https://api.openf1.org/v1".to_string(),
            timeout_ms: 10_000,
            classes: vec![EntityClass::LOCATION.to_string()],
        }
    }
}

/// Shared HTTP client; hands out one store per session key
#[derive(Debug, Clone)]
pub struct OpenF1Client {
    config: OpenF1Config,
    http: reqwest::Client,
}

impl OpenF1Client {
    pub fn new(config: OpenF1Config) -> Result<Self, ReplayError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ReplayError::source_unavailable(e.to_string()))?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &OpenF1Config {
        &self.config
    }

    pub fn session(&self, session_key: impl Into<String>) -> OpenF1Store {
        OpenF1Store {
            client: self.clone(),
            session_key: session_key.into(),
        }
    }
}

pub struct OpenF1Store {
    client: OpenF1Client,
    session_key: String,
}

impl OpenF1Store {
    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    fn serves(&self, class: &EntityClass) -> bool {
        self.client
            .config
            .classes
            .iter()
            .any(|c| c == class.as_str())
    }

    /// `{base}/{class}?session_key=..&driver_number=..&date>=..&date<=..`
    fn url(
        &self,
        class: &EntityClass,
        range: &TimeRange,
        filter: Option<&EntityFilter>,
    ) -> Result<reqwest::Url, ReplayError> {
        let base = self.client.config.base_url.trim_end_matches('/');
        let mut url = reqwest::Url::parse(&format!("{}/{}", base, class))
            .map_err(|e| ReplayError::source_unavailable(format!("bad upstream url: {}", e)))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("session_key", &self.session_key);
            for id in filter.into_iter().flat_map(EntityFilter::ids) {
                pairs.append_pair("driver_number", &id.to_string());
            }
        }
        // comparison operators are part of the key, not form-encodable pairs
        let query = format!(
            "{}&date>={}&date<={}",
            url.query().unwrap_or_default(),
            format_date(range.from),
            format_date(range.to)
        );
        url.set_query(Some(&query));
        Ok(url)
    }
}

fn format_date(t: Timestamp) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[async_trait]
impl SampleStore for OpenF1Store {
    fn name(&self) -> &str {
        "openf1"
    }

    async fn fetch_window(
        &self,
        class: &EntityClass,
        range: TimeRange,
        filter: Option<&EntityFilter>,
    ) -> Result<TimelineMap, ReplayError> {
        if !self.serves(class) {
            return Err(ReplayError::UnknownEntityClass {
                class: class.to_string(),
            });
        }

        let url = self.url(class, &range, filter)?;
        let response = self
            .client
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| {
                warn!(session = %self.session_key, error = %e, "Upstream request failed");
                ReplayError::source_unavailable(e.to_string())
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ReplayError::UnknownEntityClass {
                class: class.to_string(),
            });
        }
        if !status.is_success() {
            warn!(session = %self.session_key, %status, "Upstream returned an error status");
            return Err(ReplayError::source_unavailable(format!(
                "upstream answered {}",
                status
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ReplayError::source_unavailable(e.to_string()))?;
        let samples = parse_rows(&body)?;

        let timelines: TimelineMap = group_samples(
            samples
                .into_iter()
                .filter(|s| range.contains(s.timestamp))
                .filter(|s| filter.map_or(true, |f| f.allows(s.entity_id))),
        );
        debug!(
            session = %self.session_key,
            entities = timelines.len(),
            "Fetched upstream window"
        );
        Ok(timelines)
    }
}

#[derive(Debug, Deserialize)]
struct Row {
    driver_number: Option<u32>,
    date: Option<String>,
    x: Option<f64>,
    y: Option<f64>,
    speed: Option<f64>,
    n_gear: Option<i8>,
}

impl Row {
    fn into_sample(self) -> Option<Sample> {
        let timestamp = parse_date(self.date.as_deref()?)?;
        let mut channels = Channels::position(self.x?, self.y?);
        channels.speed = self.speed;
        channels.gear = self.n_gear;
        Some(Sample::new(EntityId(self.driver_number?), timestamp, channels))
    }
}

/// Decode a provider response body. Unusable rows are skipped; a body that
/// is not a JSON array is an upstream failure.
pub fn parse_rows(body: &str) -> Result<Vec<Sample>, ReplayError> {
    let rows: Vec<serde_json::Value> = serde_json::from_str(body)
        .map_err(|e| ReplayError::source_unavailable(format!("undecodable body: {}", e)))?;

    let total = rows.len();
    let samples: Vec<Sample> = rows
        .into_iter()
        .filter_map(|v| serde_json::from_value::<Row>(v).ok())
        .filter_map(Row::into_sample)
        .collect();

    if samples.len() < total {
        debug!(skipped = total - samples.len(), "Skipped unusable upstream rows");
    }
    Ok(samples)
}

fn parse_date(raw: &str) -> Option<Timestamp> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|t| t.and_utc())
        })
}

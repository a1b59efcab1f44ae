//! Frame stream generator
//!
//! Drives the interpolation engine across the stride timestamps of a
//! request. One request walks `Init -> Fetching -> Emitting -> Done`, or
//! ends in `Failed` when the windowed fetch fails, in which case nothing
//! is emitted. The generator keeps no state between requests.

use crate::adapter::SampleStore;
use crate::bounds::{TrackBounds, BOUNDS_SCAN_MS};
use crate::error::ReplayError;
use crate::interpolate::{value_at, Cursor};
use crate::model::{
    ChannelSelection, Channels, EntityClass, EntityFilter, EntityId, EntityRow, EntityTimeline,
    Frame, TimeRange, TimelineMap, Timestamp,
};
use crate::window::FrameRequest;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Generator tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Margin fetched on both sides of a window so edge frames have brackets
    pub window_pad_ms: u64,
    /// Margin for single-instant queries
    pub point_pad_ms: u64,
    pub max_frames_per_request: u64,
    /// How far incremental generation may run ahead of the consumer
    pub max_frames_ahead: usize,
    /// Median-of-three despiking of positions before interpolation
    pub despike: bool,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            window_pad_ms: 500,
            point_pad_ms: 300,
            max_frames_per_request: 36_000,
            max_frames_ahead: 8,
            despike: true,
        }
    }
}

/// Lifecycle of a single request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    Init,
    Fetching,
    Emitting,
    Done,
    Failed,
}

/// Stateless front end: every call is an independent request.
#[derive(Clone)]
pub struct FrameGenerator {
    store: Arc<dyn SampleStore>,
    config: GeneratorConfig,
}

impl FrameGenerator {
    pub fn new(store: Arc<dyn SampleStore>, config: GeneratorConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SampleStore> {
        &self.store
    }

    /// Validate, fetch and return a run positioned at the first stride.
    pub async fn open(&self, request: &FrameRequest) -> Result<FrameRun, ReplayError> {
        self.open_padded(request, self.config.window_pad_ms).await
    }

    async fn open_padded(
        &self,
        request: &FrameRequest,
        pad_ms: u64,
    ) -> Result<FrameRun, ReplayError> {
        request.validate(self.config.max_frames_per_request)?;

        debug!(state = ?GeneratorState::Init, class = %request.class, "frame request accepted");

        let fetch_range = request.range.padded(pad_ms);
        debug!(state = ?GeneratorState::Fetching, pad_ms, "fetching window");
        let timelines = match self
            .store
            .fetch_window(&request.class, fetch_range, request.filter.as_ref())
            .await
        {
            Ok(timelines) => timelines,
            Err(e) => {
                warn!(
                    state = ?GeneratorState::Failed,
                    store = self.store.name(),
                    "windowed fetch failed: {}",
                    e
                );
                return Err(e);
            }
        };

        let run = FrameRun::new(request.clone(), timelines, self.config.despike);
        info!(
            state = ?run.state(),
            entities = run.entity_count(),
            frames = request.frame_count(),
            delta = request.delta,
            "emitting frames"
        );
        Ok(run)
    }

    /// Batch mode: every frame of the window, in order.
    pub async fn batch(&self, request: &FrameRequest) -> Result<Vec<Frame>, ReplayError> {
        Ok(self.open(request).await?.collect())
    }

    /// Incremental mode: frames are pushed into a bounded channel as soon as
    /// they are computed. Dropping the receiver ends generation early.
    ///
    /// The fetch completes before this returns, so a failing source yields
    /// an error and no frames at all.
    pub async fn incremental(
        &self,
        request: &FrameRequest,
    ) -> Result<mpsc::Receiver<Frame>, ReplayError> {
        let run = self.open(request).await?;
        let (tx, rx) = mpsc::channel(self.config.max_frames_ahead.max(1));
        tokio::spawn(pump(run, tx));
        Ok(rx)
    }

    /// A single frame at `t`, fetched with the narrower point margin.
    pub async fn frame_at(
        &self,
        t: Timestamp,
        class: EntityClass,
        filter: Option<EntityFilter>,
        channels: ChannelSelection,
        max_gap_ms: u64,
    ) -> Result<Frame, ReplayError> {
        let request = FrameRequest::window(t, t)
            .class(class)
            .filter(filter)
            .channels(channels)
            .max_gap_ms(max_gap_ms);
        let mut run = self.open_padded(&request, self.config.point_pad_ms).await?;
        Ok(run.next().unwrap_or_else(|| Frame::empty(t, channels)))
    }

    /// Padded extent of every position seen in the first 30s from `from`.
    /// An empty scan gives the fallback rectangle; a failing source is an error.
    pub async fn bounds(
        &self,
        class: &EntityClass,
        from: Timestamp,
    ) -> Result<TrackBounds, ReplayError> {
        let scan = TimeRange::new(from, from + chrono::Duration::milliseconds(BOUNDS_SCAN_MS));
        let timelines = self.store.fetch_window(class, scan, None).await?;
        debug!(entities = timelines.len(), "scanned track bounds");
        Ok(TrackBounds::for_timelines(&timelines))
    }
}

async fn pump(run: FrameRun, tx: mpsc::Sender<Frame>) {
    let mut sent = 0usize;
    for frame in run {
        if tx.send(frame).await.is_err() {
            let reason = ReplayError::StreamInterrupted;
            debug!(sent, "{}", reason);
            return;
        }
        sent += 1;
    }
    debug!(sent, "incremental generation done");
}

struct Track {
    id: EntityId,
    timeline: EntityTimeline,
    cursor: Cursor,
}

/// The `Emitting` phase of one request: an iterator of frames.
pub struct FrameRun {
    request: FrameRequest,
    tracks: Vec<Track>,
    timestamps: std::vec::IntoIter<Timestamp>,
    last_emitted: HashMap<EntityId, Channels>,
    state: GeneratorState,
}

impl FrameRun {
    /// Build a run over already-fetched timelines.
    pub fn new(request: FrameRequest, timelines: TimelineMap, despike: bool) -> Self {
        let tracks = timelines
            .into_iter()
            .filter(|(id, _)| request.filter.as_ref().map_or(true, |f| f.allows(*id)))
            .map(|(id, timeline)| Track {
                id,
                timeline: if despike { timeline.despiked() } else { timeline },
                cursor: Cursor::new(),
            })
            .collect();
        let timestamps: Vec<Timestamp> = request.timestamps().collect();

        Self {
            request,
            tracks,
            timestamps: timestamps.into_iter(),
            last_emitted: HashMap::new(),
            state: GeneratorState::Emitting,
        }
    }

    pub fn state(&self) -> GeneratorState {
        self.state
    }

    pub fn entity_count(&self) -> usize {
        self.tracks.len()
    }

    fn build(&mut self, t: Timestamp) -> Frame {
        let selection = self.request.channels;
        let mut entities = Vec::with_capacity(self.tracks.len());

        for track in &mut self.tracks {
            let Some(raw) = value_at(t, &track.timeline, &mut track.cursor, self.request.max_gap_ms)
            else {
                continue;
            };
            let channels = selection.project(raw);

            if self.request.delta {
                if let Some(prev) = self.last_emitted.get(&track.id) {
                    if prev.same_as(&channels) {
                        continue;
                    }
                }
                self.last_emitted.insert(track.id, channels);
            }
            entities.push(EntityRow {
                id: track.id,
                channels,
            });
        }

        Frame {
            t,
            fields: selection,
            entities,
        }
    }
}

impl Iterator for FrameRun {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        match self.timestamps.next() {
            Some(t) => Some(self.build(t)),
            None => {
                self.state = GeneratorState::Done;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::StaticStore;
    use crate::model::{group_samples, Sample, TimeRange};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    fn ts(ms: i64) -> Timestamp {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn sample(id: u32, ms: i64, x: f64) -> Sample {
        Sample::new(EntityId(id), ts(ms), Channels::position(x, 0.0))
    }

    fn generator(samples: Vec<Sample>) -> FrameGenerator {
        let config = GeneratorConfig {
            despike: false,
            ..GeneratorConfig::default()
        };
        FrameGenerator::new(Arc::new(StaticStore::new(group_samples(samples))), config)
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

    #[tokio::test]
    async fn test_batch_interpolates_each_stride() {
        let gen = generator(vec![sample(1, 0, 0.0), sample(1, 1000, 100.0)]);
        let request = FrameRequest::window(ts(0), ts(1000)).stride_ms(250);
        let frames = gen.batch(&request).await.unwrap();

        let xs: Vec<f64> = frames
            .iter()
            .map(|f| f.row(EntityId(1)).unwrap().channels.x)
            .collect();
        assert_eq!(xs, vec![0.0, 25.0, 50.0, 75.0, 100.0]);
    }

    #[tokio::test]
    async fn test_padding_brings_in_edge_brackets() {
        // samples only exist just outside the requested window
        let gen = generator(vec![sample(1, -400, 0.0), sample(1, 1400, 180.0)]);
        let request = FrameRequest::window(ts(0), ts(1000)).stride_ms(1000).max_gap_ms(5000);
        let frames = gen.batch(&request).await.unwrap();

        let x0 = frames[0].row(EntityId(1)).unwrap().channels.x;
        let x1 = frames[1].row(EntityId(1)).unwrap().channels.x;
        assert!((x0 - 40.0).abs() < 1e-9, "x0 = {}", x0);
        assert!((x1 - 140.0).abs() < 1e-9, "x1 = {}", x1);
    }

    #[tokio::test]
    async fn test_delta_drops_unchanged_rows() {
        let gen = generator(vec![
            sample(44, 0, 5.0),
            sample(44, 1000, 5.0),
            sample(16, 0, 0.0),
            sample(16, 1000, 10.0),
        ]);
        let request = FrameRequest::window(ts(0), ts(200)).stride_ms(100).delta(true);
        let frames = gen.batch(&request).await.unwrap();

        assert!(frames[0].row(EntityId(44)).is_some());
        assert!(frames[1].row(EntityId(44)).is_none(), "44 did not move");
        assert!(frames[1].row(EntityId(16)).is_some(), "16 moved");
        assert!(frames[2].row(EntityId(44)).is_none());
    }

    #[tokio::test]
    async fn test_delta_reemits_when_any_channel_changes() {
        let gen = generator(vec![
            Sample::new(EntityId(44), ts(0), Channels::position(5.0, 5.0).with_gear(3)),
            Sample::new(EntityId(44), ts(100), Channels::position(5.0, 5.0).with_gear(4)),
        ]);
        let request = FrameRequest::window(ts(0), ts(100))
            .stride_ms(100)
            .channels(ChannelSelection::parse("gear"))
            .delta(true);
        let frames = gen.batch(&request).await.unwrap();
        assert_eq!(frames[1].row(EntityId(44)).unwrap().channels.gear, Some(4));
    }

    #[tokio::test]
    async fn test_batch_is_deterministic() {
        let samples: Vec<Sample> = (0..40)
            .flat_map(|k| {
                [1, 44, 16].map(|id| sample(id, k * 137, (k as f64 * 3.1 + id as f64).sin() * 500.0))
            })
            .collect();
        let gen = generator(samples);
        let request = FrameRequest::window(ts(100), ts(5000)).stride_ms(100).delta(true);

        let first = gen.batch(&request).await.unwrap();
        let second = gen.batch(&request).await.unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn test_rows_respect_entity_filter() {
        let gen = generator(vec![sample(1, 0, 0.0), sample(44, 0, 0.0), sample(16, 0, 0.0)]);
        let request = FrameRequest::window(ts(0), ts(0))
            .filter(EntityFilter::parse("44,16").unwrap());
        let frames = gen.batch(&request).await.unwrap();
        let ids: Vec<u32> = frames[0].entities.iter().map(|r| r.id.0).collect();
        assert_eq!(ids, vec![16, 44]);
    }

    #[tokio::test]
    async fn test_failed_fetch_emits_nothing() {
        let gen = FrameGenerator::new(Arc::new(DownStore), GeneratorConfig::default());
        let request = FrameRequest::window(ts(0), ts(1000));

        assert!(matches!(
            gen.batch(&request).await,
            Err(ReplayError::SourceUnavailable { .. })
        ));
        assert!(gen.incremental(&request).await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_window_never_fetches() {
        let gen = FrameGenerator::new(Arc::new(DownStore), GeneratorConfig::default());
        let request = FrameRequest::window(ts(1000), ts(0));
        assert!(matches!(
            gen.batch(&request).await,
            Err(ReplayError::MalformedWindow { .. })
        ));
    }

    #[tokio::test]
    async fn test_incremental_matches_batch() {
        let gen = generator(vec![sample(1, 0, 0.0), sample(1, 1000, 100.0)]);
        let request = FrameRequest::window(ts(0), ts(1000)).stride_ms(100);

        let batch = gen.batch(&request).await.unwrap();
        let mut rx = gen.incremental(&request).await.unwrap();
        let mut streamed = Vec::new();
        while let Some(frame) = rx.recv().await {
            streamed.push(frame);
        }
        assert_eq!(batch, streamed);
    }

    #[tokio::test]
    async fn test_incremental_stops_when_consumer_leaves() {
        let gen = generator(vec![sample(1, 0, 0.0), sample(1, 1000, 100.0)]);
        let request = FrameRequest::window(ts(0), ts(1000)).stride_ms(1);

        let mut rx = gen.incremental(&request).await.unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.t, ts(0));
        drop(rx);
        // the pump task notices the closed channel on its next send and exits
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn test_frame_at_uses_point_padding() {
        let gen = generator(vec![sample(1, -250, 0.0), sample(1, 250, 50.0)]);
        let frame = gen
            .frame_at(ts(0), EntityClass::location(), None, ChannelSelection::default(), 1500)
            .await
            .unwrap();
        assert_eq!(frame.row(EntityId(1)).unwrap().channels.x, 25.0);
    }

    #[test]
    fn test_run_reports_done_after_last_frame() {
        let request = FrameRequest::window(ts(0), ts(100)).stride_ms(100);
        let mut run = FrameRun::new(request, TimelineMap::new(), false);
        assert_eq!(run.state(), GeneratorState::Emitting);
        assert_eq!(run.by_ref().count(), 2);
        assert_eq!(run.state(), GeneratorState::Done);
    }

    #[tokio::test]
    async fn test_bounds_scan_first_thirty_seconds() {
        let mut samples = vec![
            Sample::new(EntityId(1), ts(0), Channels::position(0.0, 0.0)),
            Sample::new(EntityId(1), ts(10_000), Channels::position(200.0, 100.0)),
        ];
        // outside the scan window
        samples.push(Sample::new(EntityId(1), ts(45_000), Channels::position(9000.0, 9000.0)));
        let gen = generator(samples);

        let b = gen.bounds(&EntityClass::location(), ts(0)).await.unwrap();
        assert_eq!((b.min_x, b.max_x), (-10.0, 210.0));
        assert_eq!((b.min_y, b.max_y), (-5.0, 105.0));

        let empty = gen.bounds(&EntityClass::location(), ts(100_000)).await.unwrap();
        assert_eq!(empty, TrackBounds::fallback());
    }

    #[tokio::test]
    async fn test_bounds_surface_source_failure() {
        let gen = FrameGenerator::new(Arc::new(DownStore), GeneratorConfig::default());
        let result = gen.bounds(&EntityClass::location(), ts(0)).await;
        assert!(matches!(result, Err(ReplayError::SourceUnavailable { .. })));
    }
}

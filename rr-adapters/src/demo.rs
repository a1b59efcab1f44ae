//! Demo store that synthesizes car positions for testing
//!
//! Simulates a field of cars lapping an oval with two straights and two
//! hairpins, each car at a slightly different pace. Samples arrive at ~4Hz
//! with jittered timestamps, the way a real location feed does, so the
//! server and playback client run without an upstream provider.

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use rr_core::{
    adapter::SampleStore,
    error::ReplayError,
    model::{
        Channels, EntityClass, EntityFilter, EntityId, EntityTimeline, Sample, TimeRange,
        TimelineMap, Timestamp,
    },
};
use serde::Deserialize;
use std::f64::consts::PI;
use tracing::debug;

// =============================================================================
// Track definition: an oval, traversed anticlockwise
// =============================================================================

#[derive(Clone, Copy)]
enum SegmentKind {
    Straight { from: (f64, f64), heading: f64 },
    Hairpin { center: (f64, f64), start_angle: f64 },
}

#[derive(Clone, Copy)]
struct TrackSegment {
    kind: SegmentKind,
    length: f64, // track units (decimetres)
    speed: f64,  // km/h at representative pace
}

impl TrackSegment {
    /// Seconds to traverse at representative pace
    fn duration(&self) -> f64 {
        (self.length / 10.0) / (self.speed / 3.6)
    }

    fn point_at(&self, fraction: f64) -> (f64, f64) {
        let s = self.length * fraction;
        match self.kind {
            SegmentKind::Straight { from, heading } => {
                (from.0 + s * heading.cos(), from.1 + s * heading.sin())
            }
            SegmentKind::Hairpin {
                center,
                start_angle,
            } => {
                let radius = self.length / PI;
                let angle = start_angle + PI * fraction;
                (center.0 + radius * angle.cos(), center.1 + radius * angle.sin())
            }
        }
    }
}

const STRAIGHT: f64 = 8000.0;
const RADIUS: f64 = 1800.0;

fn demo_track() -> Vec<TrackSegment> {
    let half = STRAIGHT / 2.0;
    vec![
        TrackSegment {
            kind: SegmentKind::Straight { from: (-half, -RADIUS), heading: 0.0 },
            length: STRAIGHT,
            speed: 310.0,
        },
        TrackSegment {
            kind: SegmentKind::Hairpin { center: (half, 0.0), start_angle: -PI / 2.0 },
            length: PI * RADIUS,
            speed: 140.0,
        },
        TrackSegment {
            kind: SegmentKind::Straight { from: (half, RADIUS), heading: PI },
            length: STRAIGHT,
            speed: 295.0,
        },
        TrackSegment {
            kind: SegmentKind::Hairpin { center: (-half, 0.0), start_angle: PI / 2.0 },
            length: PI * RADIUS,
            speed: 125.0,
        },
    ]
}

fn speed_to_gear(kph: f64) -> i8 {
    match kph {
        x if x < 80.0 => 2,
        x if x < 120.0 => 3,
        x if x < 160.0 => 4,
        x if x < 200.0 => 5,
        x if x < 240.0 => 6,
        x if x < 280.0 => 7,
        _ => 8,
    }
}

/// Simple deterministic noise from a seed
fn noise(seed: f64) -> f64 {
    let x = (seed * 12.9898 + 78.233).sin() * 43_758.547;
    x - x.floor()
}

/// Small jitter centered around 0
fn jitter(seed: f64, amplitude: f64) -> f64 {
    (noise(seed) - 0.5) * 2.0 * amplitude
}

// =============================================================================
// DemoStore
// =============================================================================

const GRID: [u32; 10] = [1, 11, 16, 55, 44, 63, 4, 81, 14, 18];

/// Knobs for the synthetic field
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DemoConfig {
    /// Wall-clock start of the synthetic session
    pub session_start: Timestamp,
    /// Length of the session in seconds; no samples exist outside it
    pub session_secs: u64,
    pub cars: usize,
    /// Nominal sampling interval of the feed
    pub sample_interval_ms: u64,
    /// Max timestamp jitter, either side of the nominal instant
    pub timestamp_jitter_ms: u64,
    /// Positional noise amplitude in track units
    pub position_noise: f64,
    /// One car drops off the feed for a few seconds every lap
    pub dropouts: bool,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            session_start: Utc
                .with_ymd_and_hms(2024, 3, 2, 15, 0, 0)
                .single()
                .unwrap_or_default(),
            session_secs: 2 * 60 * 60,
            cars: 10,
            sample_interval_ms: 250,
            timestamp_jitter_ms: 60,
            position_noise: 4.0,
            dropouts: true,
        }
    }
}

struct DemoCar {
    id: EntityId,
    /// > 1.0 is slower than representative pace
    pace: f64,
    /// Seconds behind the leader at session start
    start_offset: f64,
}

pub struct DemoStore {
    config: DemoConfig,
    track: Vec<TrackSegment>,
    lap_duration: f64,
    cars: Vec<DemoCar>,
}

impl DemoStore {
    pub fn new(config: DemoConfig) -> Self {
        let track = demo_track();
        let lap_duration = track.iter().map(TrackSegment::duration).sum();
        let cars = GRID
            .iter()
            .cycle()
            .take(config.cars)
            .enumerate()
            .map(|(i, &number)| DemoCar {
                id: EntityId(number + 100 * (i / GRID.len()) as u32),
                pace: 1.0 + 0.004 * i as f64,
                start_offset: 1.2 * i as f64,
            })
            .collect();
        Self {
            config,
            track,
            lap_duration,
            cars,
        }
    }

    pub fn config(&self) -> &DemoConfig {
        &self.config
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.cars.iter().map(|c| c.id)
    }

    /// Representative lap time in seconds
    pub fn lap_duration(&self) -> f64 {
        self.lap_duration
    }

    pub fn session_range(&self) -> TimeRange {
        let start = self.config.session_start;
        TimeRange::new(start, start + Duration::seconds(self.config.session_secs as i64))
    }

    fn channels_at(&self, car: &DemoCar, elapsed: f64, seed: f64) -> Channels {
        let race_time = (elapsed / car.pace - car.start_offset).max(0.0);
        let mut lap_time = race_time % self.lap_duration;

        let mut segment = &self.track[0];
        for seg in &self.track {
            segment = seg;
            if lap_time < seg.duration() {
                break;
            }
            lap_time -= seg.duration();
        }

        let fraction = (lap_time / segment.duration()).clamp(0.0, 1.0);
        let (x, y) = segment.point_at(fraction);
        let noise = self.config.position_noise;
        let speed = (segment.speed / car.pace + jitter(seed * 1.1, 2.0)).max(0.0);

        Channels::position(x + jitter(seed * 1.3, noise), y + jitter(seed * 1.7, noise))
            .with_speed(speed.round())
            .with_gear(speed_to_gear(speed))
    }

    fn in_dropout(&self, car_index: usize, elapsed: f64) -> bool {
        self.config.dropouts && car_index == 3 && {
            let lap_time = elapsed % self.lap_duration;
            (20.0..23.0).contains(&lap_time)
        }
    }

    fn timeline(&self, car_index: usize, car: &DemoCar, range: &TimeRange) -> Vec<Sample> {
        let start = self.config.session_start;
        let interval = self.config.sample_interval_ms.max(1) as i64;
        let jitter_ms = self.config.timestamp_jitter_ms as i64;
        let session_ms = self.config.session_secs as i64 * 1000;

        let from_ms = (range.from - start).num_milliseconds() - jitter_ms;
        let to_ms = (range.to - start).num_milliseconds() + jitter_ms;
        let first = from_ms.max(0).div_euclid(interval);
        let last = to_ms.min(session_ms).div_euclid(interval);

        (first..=last)
            .filter_map(|k| {
                let seed = k as f64 + 1000.0 * (car_index as f64 + 1.0);
                let offset = k * interval + jitter(seed, jitter_ms as f64).round() as i64;
                if !(0..=session_ms).contains(&offset) {
                    return None;
                }
                let t = start + Duration::milliseconds(offset);
                let elapsed = offset as f64 / 1000.0;
                (range.contains(t) && !self.in_dropout(car_index, elapsed))
                    .then(|| Sample::new(car.id, t, self.channels_at(car, elapsed, seed)))
            })
            .collect()
    }
}

impl Default for DemoStore {
    fn default() -> Self {
        Self::new(DemoConfig::default())
    }
}

#[async_trait]
impl SampleStore for DemoStore {
    fn name(&self) -> &str {
        "demo"
    }

    async fn fetch_window(
        &self,
        class: &EntityClass,
        range: TimeRange,
        filter: Option<&EntityFilter>,
    ) -> Result<TimelineMap, ReplayError> {
        if class.as_str() != EntityClass::LOCATION {
            return Err(ReplayError::UnknownEntityClass {
                class: class.to_string(),
            });
        }

        let timelines: TimelineMap = self
            .cars
            .iter()
            .enumerate()
            .filter(|(_, car)| filter.map_or(true, |f| f.allows(car.id)))
            .filter_map(|(i, car)| {
                let samples = self.timeline(i, car, &range);
                (!samples.is_empty()).then(|| (car.id, EntityTimeline::new(car.id, samples)))
            })
            .collect();

        debug!(
            entities = timelines.len(),
            samples = timelines.values().map(EntityTimeline::len).sum::<usize>(),
            "Synthesized demo window"
        );
        Ok(timelines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_is_closed_loop() {
        let track = demo_track();
        for pair in track.windows(2) {
            let end = pair[0].point_at(1.0);
            let start = pair[1].point_at(0.0);
            assert!((end.0 - start.0).abs() < 1e-6 && (end.1 - start.1).abs() < 1e-6);
        }
        let end = track[3].point_at(1.0);
        let start = track[0].point_at(0.0);
        assert!((end.0 - start.0).abs() < 1e-6 && (end.1 - start.1).abs() < 1e-6);
    }

    #[test]
    fn test_gear_rises_with_speed() {
        assert!(speed_to_gear(100.0) < speed_to_gear(300.0));
        assert_eq!(speed_to_gear(0.0), 2);
    }

    #[test]
    fn test_jitter_stays_in_amplitude() {
        for i in 0..1000 {
            let j = jitter(i as f64, 60.0);
            assert!((-60.0..=60.0).contains(&j));
        }
    }
}

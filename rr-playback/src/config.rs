//! Playback tuning

use rr_core::model::{ChannelSelection, EntityClass, EntityFilter};
use rr_core::smoothing::SmoothingConfig;
use rr_core::window::DEFAULT_GAP_MS;
use serde::Deserialize;
use std::time::Duration;

/// Slowest and fastest playback multipliers
pub const MIN_SPEED: f64 = 0.1;
pub const MAX_SPEED: f64 = 16.0;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Time between frames, in session time
    pub stride_ms: u64,
    /// Session time covered by one prefetch request
    pub chunk_ms: u64,
    /// Prefetch the next chunk once fewer frames than this are queued
    pub low_water: usize,
    /// Wait before retrying a failed prefetch
    pub retry_ms: u64,
    /// Initial speed multiplier
    pub speed: f64,
    pub max_gap_ms: u64,
    /// Ask the server to omit unchanged rows; the smoother holds them
    pub delta: bool,
    #[serde(skip)]
    pub class: EntityClass,
    #[serde(skip)]
    pub filter: Option<EntityFilter>,
    #[serde(skip)]
    pub channels: ChannelSelection,
    pub smoothing: SmoothingConfig,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            stride_ms: 200,
            chunk_ms: 4000,
            low_water: 5,
            retry_ms: 1000,
            speed: 1.0,
            max_gap_ms: DEFAULT_GAP_MS,
            delta: false,
            class: EntityClass::location(),
            filter: None,
            channels: ChannelSelection::default(),
            smoothing: SmoothingConfig::default(),
        }
    }
}

impl PlaybackConfig {
    /// Smoothing settings with the stride forced to the playback stride,
    /// so velocity caps are per emitted frame.
    pub fn smoothing(&self) -> SmoothingConfig {
        SmoothingConfig {
            stride_ms: self.stride_ms,
            ..self.smoothing.clone()
        }
    }

    /// Wall-clock time between ticks at `speed`.
    pub fn tick_interval(&self, speed: f64) -> Duration {
        let micros = self.stride_ms.max(1) as f64 * 1000.0 / clamp_speed(speed);
        Duration::from_micros(micros.max(1.0) as u64)
    }
}

/// Clamp a requested multiplier into the supported range; non-finite
/// values fall back to real time.
pub fn clamp_speed(speed: f64) -> f64 {
    if speed.is_finite() {
        speed.clamp(MIN_SPEED, MAX_SPEED)
    } else {
        1.0
    }
}

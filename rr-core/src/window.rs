//! Frame requests and their validation

use crate::error::ReplayError;
use crate::model::{ChannelSelection, EntityClass, EntityFilter, TimeRange, Timestamp};
use chrono::Duration;

pub const DEFAULT_STRIDE_MS: u64 = 200;
pub const DEFAULT_GAP_MS: u64 = 1500;

/// Everything the generator needs to produce frames for one window
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRequest {
    pub class: EntityClass,
    /// Closed window: frames at `from`, `from + stride`, ... up to and including `to`
    pub range: TimeRange,
    pub stride_ms: u64,
    pub filter: Option<EntityFilter>,
    pub channels: ChannelSelection,
    /// Omit rows unchanged since the entity's previous emitted row
    pub delta: bool,
    /// Brackets wider than this are treated as disconnected
    pub max_gap_ms: u64,
}

impl FrameRequest {
    pub fn window(from: Timestamp, to: Timestamp) -> Self {
        Self {
            class: EntityClass::location(),
            range: TimeRange::new(from, to),
            stride_ms: DEFAULT_STRIDE_MS,
            filter: None,
            channels: ChannelSelection::default(),
            delta: false,
            max_gap_ms: DEFAULT_GAP_MS,
        }
    }

    pub fn stride_ms(mut self, stride_ms: u64) -> Self {
        self.stride_ms = stride_ms;
        self
    }

    pub fn filter(mut self, filter: Option<EntityFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn channels(mut self, channels: ChannelSelection) -> Self {
        self.channels = channels;
        self
    }

    pub fn delta(mut self, delta: bool) -> Self {
        self.delta = delta;
        self
    }

    pub fn max_gap_ms(mut self, max_gap_ms: u64) -> Self {
        self.max_gap_ms = max_gap_ms;
        self
    }

    pub fn class(mut self, class: EntityClass) -> Self {
        self.class = class;
        self
    }

    /// Number of stride timestamps in the window.
    pub fn frame_count(&self) -> u64 {
        if self.stride_ms == 0 || self.range.to < self.range.from {
            return 0;
        }
        self.range.duration_ms() as u64 / self.stride_ms + 1
    }

    /// Reject windows that must never enter the pipeline.
    pub fn validate(&self, max_frames: u64) -> Result<(), ReplayError> {
        if self.stride_ms == 0 {
            return Err(ReplayError::malformed("stride_ms", "stride must be positive"));
        }
        if i64::try_from(self.stride_ms).is_err() {
            return Err(ReplayError::malformed("stride_ms", "stride is out of range"));
        }
        if self.range.to < self.range.from {
            return Err(ReplayError::malformed("to", "window ends before it starts"));
        }
        if self.max_gap_ms == 0 {
            return Err(ReplayError::malformed("gap_ms", "gap tolerance must be positive"));
        }
        let frames = self.frame_count();
        if frames > max_frames {
            return Err(ReplayError::malformed(
                "stride_ms",
                format!("window needs {} frames, limit is {}", frames, max_frames),
            ));
        }
        Ok(())
    }

    /// Stride timestamps from `from` through `to` inclusive.
    pub fn timestamps(&self) -> impl Iterator<Item = Timestamp> {
        let from = self.range.from;
        let stride = Duration::milliseconds(i64::try_from(self.stride_ms).unwrap_or(i64::MAX));
        (0..self.frame_count() as i32).map(move |k| from + stride * k)
    }
}

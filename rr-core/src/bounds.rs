//! Track extent derived from a short sample of positions

use crate::model::TimelineMap;
use serde::{Deserialize, Serialize};

/// How much of a session is sampled to find the track extent
pub const BOUNDS_SCAN_MS: i64 = 30_000;
/// Margin added on each side, as a fraction of the extent per axis
pub const BOUNDS_PAD: f64 = 0.05;
/// Half-width of the rectangle used when there is no data
pub const FALLBACK_EXTENT: f64 = 5000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackBounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl TrackBounds {
    pub fn fallback() -> Self {
        Self {
            min_x: -FALLBACK_EXTENT,
            min_y: -FALLBACK_EXTENT,
            max_x: FALLBACK_EXTENT,
            max_y: FALLBACK_EXTENT,
        }
    }

    /// Tight box around every sample, or `None` without samples.
    pub fn enclosing(timelines: &TimelineMap) -> Option<Self> {
        timelines
            .values()
            .flat_map(|tl| tl.samples())
            .map(|s| (s.channels.x, s.channels.y))
            .fold(None, |acc: Option<Self>, (x, y)| {
                Some(match acc {
                    None => Self {
                        min_x: x,
                        min_y: y,
                        max_x: x,
                        max_y: y,
                    },
                    Some(b) => Self {
                        min_x: b.min_x.min(x),
                        min_y: b.min_y.min(y),
                        max_x: b.max_x.max(x),
                        max_y: b.max_y.max(y),
                    },
                })
            })
    }

    /// Grow each axis by `fraction` of its extent on both sides.
    pub fn padded(self, fraction: f64) -> Self {
        let pad_x = self.width() * fraction;
        let pad_y = self.height() * fraction;
        Self {
            min_x: self.min_x - pad_x,
            min_y: self.min_y - pad_y,
            max_x: self.max_x + pad_x,
            max_y: self.max_y + pad_y,
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Padded box around `timelines`, or the fallback rectangle.
    pub fn for_timelines(timelines: &TimelineMap) -> Self {
        Self::enclosing(timelines)
            .map(|b| b.padded(BOUNDS_PAD))
            .unwrap_or_else(Self::fallback)
    }
}

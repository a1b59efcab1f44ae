//! Bracketing-sample interpolation with a maximum-gap policy
//!
//! Pure computation: no I/O, no session state. Each entity gets a
//! [`Cursor`] that only moves forward while query times increase, so a
//! full pass over a window costs amortized O(1) per query.

use crate::model::{Channels, EntityTimeline, Sample, Timestamp};

/// Position of the interpolation scan within one timeline.
///
/// Holds the count of samples whose timestamp is `<=` the last query time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    next: usize,
}

impl Cursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move to the bracket of `t`. Forward moves scan linearly; a query
    /// earlier than the current bracket falls back to a binary search.
    fn seek(&mut self, samples: &[Sample], t: Timestamp) {
        if self.next > samples.len() || (self.next > 0 && samples[self.next - 1].timestamp > t) {
            self.next = samples.partition_point(|s| s.timestamp <= t);
            return;
        }
        while self.next < samples.len() && samples[self.next].timestamp <= t {
            self.next += 1;
        }
    }
}

/// Estimated channels of `timeline` at `t`, or `None` if the timeline is empty.
///
/// - before the first / after the last sample: that sample, unchanged
/// - bracket no wider than `max_gap_ms`: linear blend of numeric channels,
///   discrete channels switch to the later sample from the midpoint on
/// - wider bracket: the nearer sample, unchanged (ties hold the earlier one)
pub fn value_at(
    t: Timestamp,
    timeline: &EntityTimeline,
    cursor: &mut Cursor,
    max_gap_ms: u64,
) -> Option<Channels> {
    let samples = timeline.samples();
    cursor.seek(samples, t);

    let prev = cursor.next.checked_sub(1).map(|i| &samples[i]);
    let next = samples.get(cursor.next);

    match (prev, next) {
        (None, None) => None,
        (Some(only), None) | (None, Some(only)) => Some(only.channels),
        (Some(prev), Some(next)) => Some(between(t, prev, next, max_gap_ms)),
    }
}

fn between(t: Timestamp, prev: &Sample, next: &Sample, max_gap_ms: u64) -> Channels {
    let span_us = micros_between(prev.timestamp, next.timestamp);
    if span_us <= 0.0 {
        return next.channels;
    }

    let since_prev_us = micros_between(prev.timestamp, t);
    if span_us > max_gap_ms as f64 * 1000.0 {
        // disconnected pair: never slide across the void
        let until_next_us = micros_between(t, next.timestamp);
        return if until_next_us < since_prev_us {
            next.channels
        } else {
            prev.channels
        };
    }

    let u = (since_prev_us / span_us).clamp(0.0, 1.0);
    blend(&prev.channels, &next.channels, u)
}

fn blend(a: &Channels, b: &Channels, u: f64) -> Channels {
    Channels {
        x: lerp(a.x, b.x, u),
        y: lerp(a.y, b.y, u),
        speed: match (a.speed, b.speed) {
            (Some(va), Some(vb)) => Some(lerp(va, vb, u)),
            (va, vb) => va.or(vb),
        },
        gear: if u >= 0.5 {
            b.gear.or(a.gear)
        } else {
            a.gear.or(b.gear)
        },
    }
}

fn lerp(a: f64, b: f64, u: f64) -> f64 {
    a + (b - a) * u
}

fn micros_between(from: Timestamp, to: Timestamp) -> f64 {
    (to - from)
        .num_microseconds()
        .map(|us| us as f64)
        .unwrap_or_else(|| (to - from).num_milliseconds() as f64 * 1000.0)
}

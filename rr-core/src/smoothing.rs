//! Per-entity motion smoothing for playback
//!
//! Each observed position goes through, in order:
//! 1. a One-Euro adaptive low-pass (cutoff rises with speed)
//! 2. an alpha-beta tracker (position + velocity, fixed gains)
//! 3. a deadband against the last published position
//! 4. a per-stride velocity clamp, or a hard reset when the raw jump is
//!    far beyond the clamp (teleport)
//!
//! The teleport check looks at the raw observation, so it runs before the
//! filters and keeps a data gap from dragging filter state across the track.

use crate::model::{Channels, EntityId, Frame, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::f64::consts::PI;
use tracing::{debug, warn};

/// Smoothing tuning. Values are domain-tuned, not derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingConfig {
    /// One-Euro cutoff at rest (Hz); lower = smoother when slow
    pub min_cutoff_hz: f64,
    /// One-Euro speed coefficient; higher = less lag when fast
    pub beta: f64,
    /// One-Euro derivative cutoff (Hz)
    pub derivative_cutoff_hz: f64,
    /// Tracker position gain
    pub tracker_alpha: f64,
    /// Tracker velocity gain
    pub tracker_beta: f64,
    /// Movement below this is not published
    pub deadband: f64,
    /// Largest published step per stride
    pub max_step_per_stride: f64,
    /// Raw jumps beyond `max_step_per_stride * teleport_factor` reset the filter
    pub teleport_factor: f64,
    pub stride_ms: u64,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            min_cutoff_hz: 1.2,
            beta: 0.01,
            derivative_cutoff_hz: 1.5,
            tracker_alpha: 0.85,
            tracker_beta: 0.3,
            deadband: 0.5,
            max_step_per_stride: 180.0,
            teleport_factor: 2.0,
            stride_ms: 200,
        }
    }
}

/// What the filter did with one observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOutcome {
    /// First observation: published as-is
    Initialized,
    Smoothed,
    /// Inside the deadband: previous position reused
    Held,
    /// Step limited to the per-stride cap
    Clamped,
    /// Discontinuity: state reset to the raw observation
    Teleported,
    /// Older than the entity's last observation: ignored
    Stale,
}

/// Adaptive low-pass filter: smooth at rest, responsive during motion
#[derive(Debug, Clone)]
struct OneEuroFilter {
    min_cutoff: f64,
    beta: f64,
    d_cutoff: f64,
    x_prev: f64,
    dx_prev: f64,
    t_prev: f64,
}

impl OneEuroFilter {
    fn new(config: &SmoothingConfig, x: f64, t: f64) -> Self {
        Self {
            min_cutoff: config.min_cutoff_hz,
            beta: config.beta,
            d_cutoff: config.derivative_cutoff_hz,
            x_prev: x,
            dx_prev: 0.0,
            t_prev: t,
        }
    }

    fn smoothing_factor(t_e: f64, cutoff: f64) -> f64 {
        let r = 2.0 * PI * cutoff * t_e;
        r / (r + 1.0)
    }

    /// `t` in seconds
    fn filter(&mut self, t: f64, x: f64) -> f64 {
        let t_e = t - self.t_prev;
        if t_e <= 0.0 {
            return self.x_prev;
        }

        let a_d = Self::smoothing_factor(t_e, self.d_cutoff);
        let dx = (x - self.x_prev) / t_e;
        let dx_hat = a_d * dx + (1.0 - a_d) * self.dx_prev;

        let cutoff = self.min_cutoff + self.beta * dx_hat.abs();
        let a = Self::smoothing_factor(t_e, cutoff);
        let x_hat = a * x + (1.0 - a) * self.x_prev;

        self.x_prev = x_hat;
        self.dx_prev = dx_hat;
        self.t_prev = t;
        x_hat
    }
}

/// Constant-velocity predictor corrected by fixed gains
#[derive(Debug, Clone)]
struct AlphaBetaTracker {
    alpha: f64,
    beta: f64,
    pos: (f64, f64),
    vel: (f64, f64),
}

impl AlphaBetaTracker {
    fn new(config: &SmoothingConfig, pos: (f64, f64)) -> Self {
        Self {
            alpha: config.tracker_alpha,
            beta: config.tracker_beta,
            pos,
            vel: (0.0, 0.0),
        }
    }

    /// `dt` in seconds, must be positive
    fn update(&mut self, z: (f64, f64), dt: f64) -> (f64, f64) {
        let pred = (self.pos.0 + self.vel.0 * dt, self.pos.1 + self.vel.1 * dt);
        let r = (z.0 - pred.0, z.1 - pred.1);
        self.pos = (pred.0 + self.alpha * r.0, pred.1 + self.alpha * r.1);
        self.vel = (
            self.vel.0 + self.beta / dt * r.0,
            self.vel.1 + self.beta / dt * r.1,
        );
        self.pos
    }
}

/// Mutable per-entity state, created on first observation
#[derive(Debug, Clone)]
struct FilterState {
    low_pass: (OneEuroFilter, OneEuroFilter),
    tracker: AlphaBetaTracker,
    last_t: Timestamp,
    last_raw: Channels,
    published: Channels,
}

impl FilterState {
    fn new(config: &SmoothingConfig, t: Timestamp, raw: Channels) -> Self {
        let secs = seconds(t);
        Self {
            low_pass: (
                OneEuroFilter::new(config, raw.x, secs),
                OneEuroFilter::new(config, raw.y, secs),
            ),
            tracker: AlphaBetaTracker::new(config, (raw.x, raw.y)),
            last_t: t,
            last_raw: raw,
            published: raw,
        }
    }
}

fn seconds(t: Timestamp) -> f64 {
    t.timestamp_micros() as f64 / 1_000_000.0
}

/// Smoothing filter bank for one playback session.
///
/// Owns every entity's state; `reset` is the only way time may go backwards.
#[derive(Debug, Clone, Default)]
pub struct MotionSmoother {
    config: SmoothingConfig,
    states: HashMap<EntityId, FilterState>,
}

impl MotionSmoother {
    pub fn new(config: SmoothingConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SmoothingConfig {
        &self.config
    }

    /// Feed one raw observation of `id` taken at `t`.
    pub fn observe(&mut self, id: EntityId, t: Timestamp, raw: Channels) -> FilterOutcome {
        let config = &self.config;
        let state = match self.states.entry(id) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                slot.insert(FilterState::new(config, t, raw));
                return FilterOutcome::Initialized;
            }
        };

        if t < state.last_t {
            warn!(entity = %id, "observation older than filter state ignored");
            return FilterOutcome::Stale;
        }
        if t == state.last_t {
            state.published.speed = raw.speed;
            state.published.gear = raw.gear;
            return FilterOutcome::Held;
        }

        let dt_ms = (t - state.last_t).num_milliseconds().max(1) as f64;
        let strides = (dt_ms / config.stride_ms.max(1) as f64).round().max(1.0);
        let cap = config.max_step_per_stride * strides;

        // Teleports are judged between consecutive raw observations; the
        // clamp below is judged against what was published.
        let raw_jump = raw.distance_to(&state.last_raw);
        if raw_jump > cap * config.teleport_factor {
            debug!(entity = %id, jump = raw_jump, cap, "teleport detected");
            *state = FilterState::new(config, t, raw);
            return FilterOutcome::Teleported;
        }

        let secs = seconds(t);
        let low_passed = (
            state.low_pass.0.filter(secs, raw.x),
            state.low_pass.1.filter(secs, raw.y),
        );
        let (tx, ty) = state.tracker.update(low_passed, dt_ms / 1000.0);

        state.last_t = t;
        state.last_raw = raw;
        state.published.speed = raw.speed;
        state.published.gear = raw.gear;

        let (dx, dy) = (tx - state.published.x, ty - state.published.y);
        let step = dx.hypot(dy);
        if step < config.deadband {
            FilterOutcome::Held
        } else if step > cap {
            state.published.x += dx / step * cap;
            state.published.y += dy / step * cap;
            FilterOutcome::Clamped
        } else {
            state.published.x = tx;
            state.published.y = ty;
            FilterOutcome::Smoothed
        }
    }

    /// Feed every row of a frame. Entities missing from the frame keep their
    /// last published value.
    pub fn apply(&mut self, frame: &Frame) -> Vec<(EntityId, FilterOutcome)> {
        frame
            .entities
            .iter()
            .map(|row| (row.id, self.observe(row.id, frame.t, row.channels)))
            .collect()
    }

    /// Last published value of `id`
    pub fn published(&self, id: EntityId) -> Option<Channels> {
        self.states.get(&id).map(|s| s.published)
    }

    /// Last raw observation of `id`
    pub fn last_raw(&self, id: EntityId) -> Option<Channels> {
        self.states.get(&id).map(|s| s.last_raw)
    }

    /// Every published value, ordered by entity id
    pub fn positions(&self) -> BTreeMap<EntityId, Channels> {
        self.states.iter().map(|(id, s)| (*id, s.published)).collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Forget all entities (seek / session reset).
    pub fn reset(&mut self) {
        self.states.clear();
    }
}

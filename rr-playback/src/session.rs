//! Playback session: prefetching buffer, pacing clock and smoothing
//!
//! A session is a single actor task. It owns the frame queue and the
//! smoother outright; the handle talks to it over a command channel and
//! reads its state through a `watch` snapshot. Prefetching runs in a
//! separate task that streams frames back tagged with the epoch it was
//! started in. Every seek or load bumps the epoch, cancels the in-flight
//! prefetch and clears queue and smoother in one step, so frames from an
//! older epoch are dropped on arrival and never reach the smoother.

use crate::config::{clamp_speed, PlaybackConfig};
use crate::source::FrameSource;
use futures::StreamExt;
use rr_core::{
    error::ReplayError,
    model::{Channels, EntityId, Frame, TimeRange, Timestamp},
    smoothing::{FilterOutcome, MotionSmoother},
    window::FrameRequest,
};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const COMMAND_CAPACITY: usize = 32;
const PREFETCH_CAPACITY: usize = 32;

/// A frame waiting in the playback queue
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedFrame {
    /// When the frame plays, as an offset from the start of the window
    pub due: chrono::Duration,
    pub frame: Frame,
}

/// What a presentation layer sees after every tick or command
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackSnapshot {
    pub window: Option<TimeRange>,
    /// Timestamp of the frame last handed to the smoother, or the seek target
    pub playhead: Option<Timestamp>,
    /// Playhead as an offset into the window
    pub elapsed_ms: Option<i64>,
    pub playing: bool,
    pub speed: f64,
    pub buffered: usize,
    /// The last tick found the queue empty
    pub stalled: bool,
    /// Every frame of the window has been played
    pub finished: bool,
    /// Frames played since the session started
    pub ticks: u64,
    pub last_error: Option<String>,
    /// Smoothed position of every entity seen since the last seek
    pub positions: BTreeMap<EntityId, Channels>,
}

#[derive(Debug)]
enum Command {
    Load(TimeRange),
    Play,
    Pause,
    Seek(Timestamp),
    SetSpeed(f64),
    Shutdown,
}

#[derive(Debug)]
enum Prefetched {
    Frame(Frame),
    Done(TimeRange),
    Failed(ReplayError),
}

#[derive(Debug)]
struct Tagged {
    epoch: u64,
    event: Prefetched,
}

// =============================================================================
// PlaybackHandle
// =============================================================================

/// Control surface of a running session. Dropping it stops the session.
pub struct PlaybackHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<PlaybackSnapshot>,
    task: JoinHandle<()>,
}

impl PlaybackHandle {
    /// Replace the current window; playback pauses and re-primes at `from`.
    pub async fn load(&self, from: Timestamp, to: Timestamp) -> Result<(), ReplayError> {
        if to < from {
            return Err(ReplayError::malformed("to", "window ends before it starts"));
        }
        self.send(Command::Load(TimeRange::new(from, to))).await
    }

    pub async fn play(&self) -> Result<(), ReplayError> {
        self.send(Command::Play).await
    }

    pub async fn pause(&self) -> Result<(), ReplayError> {
        self.send(Command::Pause).await
    }

    /// Jump to `t` (clamped into the window), discarding buffered frames
    /// and filter state.
    pub async fn seek(&self, t: Timestamp) -> Result<(), ReplayError> {
        self.send(Command::Seek(t)).await
    }

    /// Multiplier on real time, clamped to `[0.1, 16]`.
    pub async fn set_speed(&self, speed: f64) -> Result<(), ReplayError> {
        self.send(Command::SetSpeed(speed)).await
    }

    /// Current state (pull).
    pub fn snapshot(&self) -> PlaybackSnapshot {
        self.snapshots.borrow().clone()
    }

    /// State updates (push), at most one per tick or command.
    pub fn subscribe(&self) -> watch::Receiver<PlaybackSnapshot> {
        self.snapshots.clone()
    }

    /// Stop the session and wait for it to wind down.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Err(e) = self.task.await {
            warn!("Playback task ended abnormally: {}", e);
        }
    }

    async fn send(&self, command: Command) -> Result<(), ReplayError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ReplayError::StreamInterrupted)
    }
}

// =============================================================================
// PlaybackSession
// =============================================================================

pub struct PlaybackSession {
    source: Arc<dyn FrameSource>,
    config: PlaybackConfig,
    queue: VecDeque<BufferedFrame>,
    smoother: MotionSmoother,
    window: Option<TimeRange>,
    /// Start of the next chunk to request; `None` once nothing is left
    next_fetch: Option<Timestamp>,
    epoch: u64,
    in_flight: Option<CancellationToken>,
    retry_at: Option<Instant>,
    last_played: Option<Timestamp>,
    playhead: Option<Timestamp>,
    elapsed: Option<chrono::Duration>,
    playing: bool,
    speed: f64,
    stalled: bool,
    finished: bool,
    ticks: u64,
    last_error: Option<String>,
    events: mpsc::Sender<Tagged>,
    snapshots: watch::Sender<PlaybackSnapshot>,
}

impl PlaybackSession {
    /// Start a session reading frames from `source`. Nothing is fetched
    /// until [`PlaybackHandle::load`].
    pub fn spawn(source: Arc<dyn FrameSource>, config: PlaybackConfig) -> PlaybackHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(PREFETCH_CAPACITY);

        let speed = clamp_speed(config.speed);
        let session = PlaybackSession {
            source,
            smoother: MotionSmoother::new(config.smoothing()),
            config,
            queue: VecDeque::new(),
            window: None,
            next_fetch: None,
            epoch: 0,
            in_flight: None,
            retry_at: None,
            last_played: None,
            playhead: None,
            elapsed: None,
            playing: false,
            speed,
            stalled: false,
            finished: false,
            ticks: 0,
            last_error: None,
            events: event_tx,
            snapshots: watch::channel(PlaybackSnapshot::idle(speed)).0,
        };
        let snapshots = session.snapshots.subscribe();
        let task = tokio::spawn(session.run(command_rx, event_rx));

        PlaybackHandle {
            commands: command_tx,
            snapshots,
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut events: mpsc::Receiver<Tagged>) {
        info!(source = self.source.name(), "Playback session started");
        let mut clock: Option<Interval> = None;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => {
                        let respeed = matches!(command, Command::SetSpeed(_));
                        self.handle(command);
                        if !self.playing {
                            clock = None;
                        } else if clock.is_none() {
                            clock = self.clock(true);
                        } else if respeed {
                            clock = self.clock(false);
                        }
                    }
                },
                Some(tagged) = events.recv() => self.on_prefetched(tagged),
                _ = next_tick(&mut clock) => {
                    self.tick();
                    if !self.playing {
                        clock = None;
                    }
                }
                _ = retry_due(self.retry_at) => {
                    self.retry_at = None;
                    self.ensure_prefetch();
                }
            }
            self.publish();
        }

        self.cancel_prefetch();
        info!(ticks = self.ticks, "Playback session stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Load(window) => {
                info!(from = %window.from, to = %window.to, "Loading window");
                self.window = Some(window);
                self.reset_to(window.from);
                self.playing = false;
                self.playhead = None;
                self.elapsed = None;
                self.last_error = None;
                self.ensure_prefetch();
            }
            Command::Play => {
                if self.window.is_none() {
                    warn!("Play ignored, nothing loaded");
                    return;
                }
                self.playing = !self.finished;
            }
            Command::Pause => self.playing = false,
            Command::Seek(t) => {
                let Some(window) = self.window else {
                    warn!("Seek ignored, nothing loaded");
                    return;
                };
                let target = t.clamp(window.from, window.to);
                debug!(to = %target, epoch = self.epoch + 1, "Seeking");
                self.reset_to(target);
                self.playhead = Some(target);
                self.elapsed = Some(target - window.from);
                self.ensure_prefetch();
            }
            Command::SetSpeed(speed) => self.speed = clamp_speed(speed),
            Command::Shutdown => {}
        }
    }

    /// Drop everything fetched or filtered so far and restart from `t`.
    /// The in-flight prefetch is cancelled before any state is touched.
    fn reset_to(&mut self, t: Timestamp) {
        self.cancel_prefetch();
        self.epoch += 1;
        self.queue.clear();
        self.smoother.reset();
        self.next_fetch = Some(t);
        self.retry_at = None;
        self.last_played = None;
        self.stalled = false;
        self.finished = false;
    }

    fn cancel_prefetch(&mut self) {
        if let Some(token) = self.in_flight.take() {
            token.cancel();
        }
    }

    fn clock(&self, immediate: bool) -> Option<Interval> {
        if !self.playing {
            return None;
        }
        let period = self.config.tick_interval(self.speed);
        let start = if immediate {
            Instant::now()
        } else {
            Instant::now() + period
        };
        let mut clock = tokio::time::interval_at(start, period);
        clock.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(clock)
    }

    /// Hand the next queued frame to the smoother.
    fn tick(&mut self) {
        match self.queue.pop_front() {
            Some(buffered) => {
                let outcomes = self.smoother.apply(&buffered.frame);
                let teleports = outcomes
                    .iter()
                    .filter(|(_, o)| *o == FilterOutcome::Teleported)
                    .count();
                if teleports > 0 {
                    debug!(teleports, t = %buffered.frame.t, "Filter reset on discontinuity");
                }
                self.playhead = Some(buffered.frame.t);
                self.elapsed = Some(buffered.due);
                self.last_played = Some(buffered.frame.t);
                self.stalled = false;
                self.ticks += 1;
            }
            None if self.exhausted() => {
                info!(ticks = self.ticks, "Reached end of window");
                self.finished = true;
                self.playing = false;
            }
            None => {
                if !self.stalled {
                    debug!(playhead = ?self.playhead, "Playback stalled, waiting for frames");
                }
                self.stalled = true;
            }
        }
        self.ensure_prefetch();
    }

    /// Nothing queued, nothing coming and nothing left to ask for
    fn exhausted(&self) -> bool {
        self.in_flight.is_none()
            && self.retry_at.is_none()
            && match (self.next_fetch, self.window) {
                (Some(next), Some(window)) => next > window.to,
                _ => true,
            }
    }

    /// Start the next chunk if the queue is below the low-water mark and
    /// no prefetch is running or waiting to retry.
    fn ensure_prefetch(&mut self) {
        if self.in_flight.is_some()
            || self.retry_at.is_some()
            || self.queue.len() >= self.config.low_water
        {
            return;
        }
        let (Some(window), Some(from)) = (self.window, self.next_fetch) else {
            return;
        };
        let Some(chunk) = plan_chunk(from, window, self.config.stride_ms, self.config.chunk_ms)
        else {
            return;
        };

        let request = FrameRequest::window(chunk.from, chunk.to)
            .class(self.config.class.clone())
            .stride_ms(self.config.stride_ms)
            .filter(self.config.filter.clone())
            .channels(self.config.channels)
            .delta(self.config.delta)
            .max_gap_ms(self.config.max_gap_ms);

        debug!(epoch = self.epoch, from = %chunk.from, to = %chunk.to, "Prefetching chunk");
        let token = CancellationToken::new();
        tokio::spawn(prefetch(
            self.source.clone(),
            request,
            self.epoch,
            token.clone(),
            self.events.clone(),
        ));
        self.in_flight = Some(token);
    }

    fn on_prefetched(&mut self, tagged: Tagged) {
        if tagged.epoch != self.epoch {
            debug!(stale = tagged.epoch, current = self.epoch, "Dropped prefetch from before a reset");
            return;
        }
        let stride = chrono::Duration::milliseconds(self.config.stride_ms as i64);

        match tagged.event {
            Prefetched::Frame(frame) => {
                let newest = self
                    .queue
                    .back()
                    .map(|b| b.frame.t)
                    .or(self.last_played);
                if newest.is_some_and(|newest| frame.t <= newest) {
                    warn!(t = %frame.t, "Out-of-order frame dropped");
                    return;
                }
                let Some(window) = self.window else {
                    return;
                };
                self.next_fetch = Some(frame.t + stride);
                self.queue.push_back(BufferedFrame {
                    due: frame.t - window.from,
                    frame,
                });
            }
            Prefetched::Done(chunk) => {
                self.in_flight = None;
                self.next_fetch = Some(chunk.to + stride);
                self.last_error = None;
                self.ensure_prefetch();
            }
            Prefetched::Failed(e) => {
                self.in_flight = None;
                self.last_error = Some(e.to_string());
                if e.is_client_error() {
                    warn!("Prefetch rejected, giving up on this window: {}", e);
                    self.next_fetch = None;
                } else {
                    warn!(retry_ms = self.config.retry_ms, "Prefetch failed: {}", e);
                    self.retry_at =
                        Some(Instant::now() + std::time::Duration::from_millis(self.config.retry_ms));
                }
            }
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(PlaybackSnapshot {
            window: self.window,
            playhead: self.playhead,
            elapsed_ms: self.elapsed.map(|d| d.num_milliseconds()),
            playing: self.playing,
            speed: self.speed,
            buffered: self.queue.len(),
            stalled: self.stalled,
            finished: self.finished,
            ticks: self.ticks,
            last_error: self.last_error.clone(),
            positions: self.smoother.positions(),
        });
    }
}

impl PlaybackSnapshot {
    fn idle(speed: f64) -> Self {
        Self {
            window: None,
            playhead: None,
            elapsed_ms: None,
            playing: false,
            speed,
            buffered: 0,
            stalled: false,
            finished: false,
            ticks: 0,
            last_error: None,
            positions: BTreeMap::new(),
        }
    }
}

/// The next chunk starting at `from`: `chunk_ms` worth of strides, cut
/// at the end of the window. `None` once `from` is past the window.
pub fn plan_chunk(
    from: Timestamp,
    window: TimeRange,
    stride_ms: u64,
    chunk_ms: u64,
) -> Option<TimeRange> {
    if from > window.to {
        return None;
    }
    let span = chunk_ms.max(stride_ms).saturating_sub(stride_ms);
    let to = (from + chrono::Duration::milliseconds(span as i64)).min(window.to);
    Some(TimeRange::new(from, to))
}

async fn next_tick(clock: &mut Option<Interval>) {
    match clock {
        Some(clock) => {
            clock.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn retry_due(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn prefetch(
    source: Arc<dyn FrameSource>,
    request: FrameRequest,
    epoch: u64,
    cancel: CancellationToken,
    events: mpsc::Sender<Tagged>,
) {
    let opened = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = source.open(&request) => opened,
    };
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            let _ = events.send(Tagged { epoch, event: Prefetched::Failed(e) }).await;
            return;
        }
    };

    let mut frames = 0usize;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(epoch, frames, "Prefetch cancelled");
                return;
            }
            next = stream.next() => next,
        };
        let event = match next {
            Some(Ok(frame)) => {
                frames += 1;
                Prefetched::Frame(frame)
            }
            Some(Err(e)) => Prefetched::Failed(e),
            None => break,
        };
        let failed = matches!(event, Prefetched::Failed(_));
        if events.send(Tagged { epoch, event }).await.is_err() || failed {
            return;
        }
    }

    debug!(epoch, frames, "Chunk prefetched");
    let _ = events
        .send(Tagged {
            epoch,
            event: Prefetched::Done(request.range),
        })
        .await;
}

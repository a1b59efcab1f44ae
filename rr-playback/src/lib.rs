//! RaceReplay Playback
//!
//! Client side of a replay: pulls frames chunk by chunk ahead of the
//! playhead, releases them on a pacing clock scaled by the playback speed
//! and smooths every entity's position before it is shown.

pub mod config;
pub mod session;
pub mod source;

pub use config::PlaybackConfig;
pub use session::{PlaybackHandle, PlaybackSession, PlaybackSnapshot};
pub use source::{FrameSource, HttpFrameSource, LocalFrameSource};

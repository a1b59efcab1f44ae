//! RaceReplay Core Library
//!
//! This crate provides the sample and frame model, the sample store trait,
//! the temporal interpolation engine, the frame stream generator and the
//! motion smoothing filter used during playback.

pub mod adapter;
pub mod bounds;
pub mod error;
pub mod generator;
pub mod interpolate;
pub mod model;
pub mod smoothing;
pub mod window;

pub use adapter::{SampleStore, StaticStore};
pub use bounds::TrackBounds;
pub use error::ReplayError;
pub use generator::{FrameGenerator, FrameRun, GeneratorConfig, GeneratorState};
pub use model::{Channels, EntityId, Frame, Sample, TimeRange};
pub use smoothing::{FilterOutcome, MotionSmoother, SmoothingConfig};
pub use window::FrameRequest;

//! Error taxonomy shared by every RaceReplay crate

use thiserror::Error;

/// Errors surfaced by sample stores, the frame generator and frame sources.
///
/// A teleport is not represented here: it is an ordinary
/// [`FilterOutcome`](crate::smoothing::FilterOutcome) of the smoothing filter.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReplayError {
    /// The upstream provider failed or returned something unreadable.
    ///
    /// Recoverable: callers degrade to "no data" instead of aborting a session.
    #[error("sample source unavailable: {message}")]
    SourceUnavailable { message: String },

    /// Invalid time range, stride or gap tolerance. Rejected before any fetch.
    #[error("malformed window at '{field}': {message}")]
    MalformedWindow { field: String, message: String },

    /// The consumer went away mid-emission. Normal early termination.
    #[error("frame stream interrupted by consumer")]
    StreamInterrupted,

    /// The requested entity class is not served by the store (client error).
    #[error("unknown entity class '{class}'")]
    UnknownEntityClass { class: String },

    /// A frame or sample could not be decoded from its wire form.
    #[error("decode error: {message}")]
    Decode { message: String },
}

impl ReplayError {
    pub fn source_unavailable(message: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            message: message.into(),
        }
    }

    pub fn malformed(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedWindow {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Whether this error is the caller's fault rather than the pipeline's.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedWindow { .. } | Self::UnknownEntityClass { .. }
        )
    }
}

pub type Result<T, E = ReplayError> = std::result::Result<T, E>;

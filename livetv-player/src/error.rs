use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::adapter::AdapterKind;
use crate::mpegts::TsError;
use crate::sink::SinkError;

/// Why a single adapter could not deliver the stream.
///
/// Never crosses the session boundary on its own: the negotiator turns it into
/// an [`AdapterTransportError`] record and moves on to the next candidate.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP error: {0}")]
    Status(reqwest::StatusCode),

    #[error("Not an MPEG-TS stream: {0}")]
    NotTransportStream(#[from] TsError),

    #[error("Playlist error: {0}")]
    Playlist(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Stream ended")]
    StreamEnded,
}

/// One failed negotiation attempt, kept for diagnostics.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{kind}: {detail}")]
pub struct AdapterTransportError {
    pub kind: AdapterKind,
    pub detail: String,
}

/// Fatal outcomes surfaced to the UI layer.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum PlaybackError {
    /// No adapter passed its capability probe. Raised immediately, never time-gated.
    #[error("No supported playback method is available in this runtime")]
    UnsupportedBrowser,

    /// Every probed adapter was attached and reported a fatal error.
    #[error("All transports failed: {}", join_attempts(.0))]
    Transport(Vec<AdapterTransportError>),

    /// The negotiation deadline fired before any adapter became ready.
    #[error("Network timeout: stream not ready after {}s", .elapsed.as_secs())]
    NetworkTimeout { elapsed: Duration },

    #[error("Invalid stream source: {0}")]
    InvalidSource(String),

    #[error("HTTP client error: {0}")]
    Client(String),
}

fn join_attempts(attempts: &[AdapterTransportError]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type PlaybackResult<T> = std::result::Result<T, PlaybackError>;

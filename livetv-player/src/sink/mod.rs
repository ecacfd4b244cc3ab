//! Media sink: the shared playback target the active adapter feeds.
//!
//! Exactly one adapter may hold the sink at a time. The negotiator grants a
//! [`SinkLease`] on attach and revokes it on detach; adapters only ever write
//! through their lease.

mod file;
mod memory;

pub use file::FileSink;
pub use memory::MemorySink;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use url::Url;

use crate::adapter::AdapterKind;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink lease for {0} has been revoked")]
    Revoked(AdapterKind),

    #[error("{0} is not supported by this sink")]
    Unsupported(&'static str),

    #[error("Sink has no media loaded")]
    NotReady,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Native player error: {0}")]
    Native(String),
}

/// What the playback runtime can do. Adapters consult this in `probe()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Accepts demuxed bytes pushed by an in-process demuxer
    pub media_source: bool,
    /// Plays an HLS URL natively, without an in-process demuxer
    pub native_hls: bool,
}

impl From<&livetv_core::config::SinkConfig> for Capabilities {
    fn from(config: &livetv_core::config::SinkConfig) -> Self {
        Self {
            media_source: config.media_source,
            native_hls: config.native_hls,
        }
    }
}

/// Decode/render destination shared by all adapters of a session.
#[async_trait]
pub trait MediaSink: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Hand the decode pipeline to `kind`. Called by the negotiator only.
    fn bind(&self, kind: AdapterKind);

    /// Take the decode pipeline back and drop whatever `kind` fed into it.
    fn release(&self, kind: AdapterKind);

    /// Append demuxed stream bytes to the decode pipeline.
    fn write(&self, data: Bytes) -> Result<(), SinkError>;

    /// Let the platform's own segmented-stream player load `url`.
    ///
    /// Resolves once the platform reports the media as loaded.
    async fn open_native(&self, url: &Url) -> Result<(), SinkError> {
        let _ = url;
        Err(SinkError::Unsupported("native HLS playback"))
    }

    fn close_native(&self) {}

    /// Whether an adapter currently feeds the sink.
    fn is_ready(&self) -> bool;

    fn play(&self) -> Result<(), SinkError>;

    fn pause(&self);

    fn set_muted(&self, muted: bool);

    /// Current playback position in seconds.
    fn position(&self) -> f64;

    fn set_position(&self, seconds: f64);

    fn request_fullscreen(&self) -> Result<(), SinkError> {
        Err(SinkError::Unsupported("fullscreen"))
    }

    fn exit_fullscreen(&self) -> Result<(), SinkError> {
        Err(SinkError::Unsupported("fullscreen"))
    }
}

/// Revocable write access to the sink, held by the attached adapter.
#[derive(Clone)]
pub struct SinkLease {
    kind: AdapterKind,
    sink: Arc<dyn MediaSink>,
    held: Arc<AtomicBool>,
}

impl SinkLease {
    pub fn new(kind: AdapterKind, sink: Arc<dyn MediaSink>) -> Self {
        Self {
            kind,
            sink,
            held: Arc::new(AtomicBool::new(true)),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> AdapterKind {
        self.kind
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Every clone of this lease stops working.
    pub fn revoke(&self) {
        self.held.store(false, Ordering::SeqCst);
    }

    pub fn capabilities(&self) -> Capabilities {
        self.sink.capabilities()
    }

    pub fn write(&self, data: Bytes) -> Result<(), SinkError> {
        if !self.is_held() {
            return Err(SinkError::Revoked(self.kind));
        }
        self.sink.write(data)
    }

    pub async fn open_native(&self, url: &Url) -> Result<(), SinkError> {
        if !self.is_held() {
            return Err(SinkError::Revoked(self.kind));
        }
        self.sink.open_native(url).await
    }

    pub fn close_native(&self) {
        self.sink.close_native();
    }
}

impl std::fmt::Debug for SinkLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkLease")
            .field("kind", &self.kind)
            .field("held", &self.is_held())
            .finish()
    }
}

/// Playback clock. Advances while running, never goes below zero.
#[derive(Debug, Default)]
pub struct Playhead {
    anchor: f64,
    running_since: Option<Instant>,
}

impl Playhead {
    pub fn position(&self) -> f64 {
        self.anchor
            + self
                .running_since
                .map_or(0.0, |since| since.elapsed().as_secs_f64())
    }

    pub fn start(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(Instant::now());
        }
    }

    pub fn stop(&mut self) {
        self.anchor = self.position();
        self.running_since = None;
    }

    pub fn seek(&mut self, seconds: f64) {
        self.anchor = seconds.max(0.0);
        if self.running_since.is_some() {
            self.running_since = Some(Instant::now());
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Transport state both provided sinks keep.
#[derive(Debug, Default)]
struct ControlState {
    bound: Option<AdapterKind>,
    playing: bool,
    muted: bool,
    fullscreen: bool,
    playhead: Playhead,
}

impl ControlState {
    fn bind(&mut self, kind: AdapterKind) {
        if let Some(previous) = self.bound {
            tracing::warn!(%previous, %kind, "Sink bound while still held by another adapter");
        }
        self.bound = Some(kind);
    }

    /// Returns false when `kind` did not hold the sink.
    fn release(&mut self, kind: AdapterKind) -> bool {
        if self.bound != Some(kind) {
            return false;
        }
        self.bound = None;
        self.playing = false;
        self.playhead.reset();
        true
    }

    fn play(&mut self) -> Result<(), SinkError> {
        if self.bound.is_none() {
            return Err(SinkError::NotReady);
        }
        self.playing = true;
        self.playhead.start();
        Ok(())
    }

    fn pause(&mut self) {
        self.playing = false;
        self.playhead.stop();
    }
}

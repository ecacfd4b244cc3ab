//! Backend adapters: interchangeable ways of turning the channel endpoint into
//! media for the sink.
//!
//! Every adapter follows the same contract:
//! - `probe()` is a pure capability check against the runtime.
//! - `attach()` starts fetching/demuxing in a background task and reports
//!   progress through [`AdapterEvents`]: `ready` once, `fatal` when it gives up,
//!   `log` for anything the negotiator should ignore.
//! - `detach()` cancels that task, waits for it to finish and frees whatever the
//!   adapter held. It is idempotent.

pub mod hls;
pub mod native;
pub mod transport_stream;

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use crate::error::AdapterError;
use crate::sink::{Capabilities, SinkLease};
use crate::source::StreamSource;

pub use hls::HlsAdapter;
pub use native::NativeHlsAdapter;
pub use transport_stream::TransportStreamAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Raw MPEG-TS over a single HTTP response
    TransportStream,
    /// HLS demuxed in-process
    Hls,
    /// HLS handed to the platform's own player
    NativeHls,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TransportStream => "mpegts",
            Self::Hls => "hls",
            Self::NativeHls => "native-hls",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    /// First frame or manifest parsed successfully
    Ready,
    /// Unrecoverable demux or network error
    Fatal(String),
    /// Informational, ignored by the negotiator
    Log(String),
}

/// An adapter event stamped with the attachment that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEvent {
    pub attachment: u64,
    pub kind: AdapterKind,
    pub event: AdapterEvent,
}

pub type TaggedEventSender = mpsc::UnboundedSender<TaggedEvent>;
pub type TaggedEventReceiver = mpsc::UnboundedReceiver<TaggedEvent>;

/// Event sender handed to an adapter for one attachment.
///
/// Sends never fail from the adapter's point of view: once the session is gone
/// nobody is listening and the event is dropped.
#[derive(Debug, Clone)]
pub struct AdapterEvents {
    attachment: u64,
    kind: AdapterKind,
    tx: TaggedEventSender,
}

impl AdapterEvents {
    #[must_use]
    pub const fn new(attachment: u64, kind: AdapterKind, tx: TaggedEventSender) -> Self {
        Self { attachment, kind, tx }
    }

    #[must_use]
    pub const fn attachment(&self) -> u64 {
        self.attachment
    }

    pub fn ready(&self) {
        self.send(AdapterEvent::Ready);
    }

    pub fn fatal(&self, detail: impl Into<String>) {
        self.send(AdapterEvent::Fatal(detail.into()));
    }

    pub fn log(&self, message: impl Into<String>) {
        self.send(AdapterEvent::Log(message.into()));
    }

    fn send(&self, event: AdapterEvent) {
        let _ = self.tx.send(TaggedEvent {
            attachment: self.attachment,
            kind: self.kind,
            event,
        });
    }
}

/// Everything an adapter gets when it is attached.
pub struct AttachContext {
    pub source: StreamSource,
    pub sink: SinkLease,
    pub events: AdapterEvents,
}

#[async_trait]
pub trait BackendAdapter: Send {
    fn kind(&self) -> AdapterKind;

    /// Whether this adapter can run at all in a runtime with `capabilities`.
    fn probe(&self, capabilities: &Capabilities) -> bool;

    /// Bind to the sink and start fetching. Progress arrives via `ctx.events`.
    fn attach(&mut self, ctx: AttachContext) -> Result<(), AdapterError>;

    /// Stop all activity and release the sink. No-op when not attached.
    async fn detach(&mut self);
}

/// Background work of one attachment.
pub struct AttachedTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl AttachedTask {
    /// Spawn `work` for an attachment. An `Err` becomes the adapter's `fatal`;
    /// cancellation ends the task silently.
    pub fn spawn<F>(events: AdapterEvents, work: F) -> Self
    where
        F: Future<Output = Result<(), AdapterError>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let span = tracing::info_span!(
            "adapter",
            adapter = %events.kind,
            attachment = events.attachment
        );

        let handle = tokio::spawn(
            async move {
                tokio::select! {
                    () = token.cancelled() => debug!("Adapter task cancelled"),
                    result = work => match result {
                        Ok(()) => events.log("stream finished"),
                        Err(e) => events.fatal(e.to_string()),
                    },
                }
            }
            .instrument(span),
        );

        Self { cancel, handle }
    }

    /// Cancel and wait until the task has actually stopped.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                tracing::error!("Adapter task panicked: {e}");
            }
        }
    }
}

/// The fixed priority order: raw TS first (most tuners serve it), then HLS
/// demuxed in-process, then the platform player, which has the narrowest input
/// contract but needs no demuxer.
pub fn default_adapters(
    config: &livetv_core::Config,
    client: reqwest::Client,
) -> Vec<Box<dyn BackendAdapter>> {
    vec![
        Box::new(TransportStreamAdapter::new(
            client.clone(),
            config.transport_stream.clone(),
        )),
        Box::new(HlsAdapter::new(client, config.hls.clone())),
        Box::new(NativeHlsAdapter::new()),
    ]
}

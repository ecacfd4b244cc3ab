//! Transport negotiation: walks the adapter priority list until one reports
//! ready, guaranteeing that at most one adapter holds the sink at any instant.
//!
//! Ownership of the sink moves strictly detach-then-attach: the previous
//! adapter's `detach()` has completed, its lease is revoked and the sink is
//! released before the next adapter is bound.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::adapter::{
    AdapterEvent, AdapterEvents, AdapterKind, AttachContext, BackendAdapter, TaggedEvent,
    TaggedEventSender,
};
use crate::error::{AdapterTransportError, PlaybackError};
use crate::sink::{MediaSink, SinkLease};
use crate::source::StreamSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationStatus {
    Pending,
    Succeeded,
    Failed,
}

/// One adapter try within a negotiation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NegotiationAttempt {
    pub kind: AdapterKind,
    pub status: NegotiationStatus,
    pub detail: Option<String>,
}

/// What the session should do after a negotiator step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing changed for the session (stale or informational event)
    Ignored,
    /// An adapter is attached and the cascade is still running
    Waiting,
    Ready(AdapterKind),
    Exhausted(PlaybackError),
    /// The playing adapter gave up after it had been ready
    PostReadyFailure { kind: AdapterKind, detail: String },
}

/// The one live attachment, if any.
#[derive(Debug)]
struct Attachment {
    index: usize,
    kind: AdapterKind,
    id: u64,
    lease: SinkLease,
}

/// Holds at most one attached adapter, identified by kind and attachment id.
#[derive(Debug, Default)]
pub struct AdapterSlot {
    active: Option<Attachment>,
}

impl AdapterSlot {
    pub fn kind(&self) -> Option<AdapterKind> {
        self.active.as_ref().map(|a| a.kind)
    }

    pub fn attachment_id(&self) -> Option<u64> {
        self.active.as_ref().map(|a| a.id)
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_none()
    }

    fn holds(&self, event: &TaggedEvent) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.id == event.attachment && a.kind == event.kind)
    }
}

pub struct TransportNegotiator {
    source: StreamSource,
    adapters: Vec<Box<dyn BackendAdapter>>,
    sink: Arc<dyn MediaSink>,
    events: TaggedEventSender,
    slot: AdapterSlot,
    candidates: Vec<usize>,
    cursor: usize,
    attempts: Vec<NegotiationAttempt>,
    next_attachment: u64,
    ready: Option<AdapterKind>,
}

impl TransportNegotiator {
    pub fn new(
        source: StreamSource,
        adapters: Vec<Box<dyn BackendAdapter>>,
        sink: Arc<dyn MediaSink>,
        events: TaggedEventSender,
    ) -> Self {
        Self {
            source,
            adapters,
            sink,
            events,
            slot: AdapterSlot::default(),
            candidates: Vec::new(),
            cursor: 0,
            attempts: Vec::new(),
            next_attachment: 1,
            ready: None,
        }
    }

    pub fn attempts(&self) -> &[NegotiationAttempt] {
        &self.attempts
    }

    pub fn active(&self) -> Option<AdapterKind> {
        self.slot.kind()
    }

    pub fn slot(&self) -> &AdapterSlot {
        &self.slot
    }

    /// Start a fresh pass from the highest-priority adapter.
    ///
    /// Whatever a previous pass left attached is detached first.
    pub async fn begin(&mut self) -> Outcome {
        self.release().await;
        self.attempts.clear();
        self.cursor = 0;
        self.ready = None;

        let capabilities = self.sink.capabilities();
        self.candidates = self
            .adapters
            .iter()
            .enumerate()
            .filter(|(_, adapter)| {
                let supported = adapter.probe(&capabilities);
                if !supported {
                    debug!(adapter = %adapter.kind(), "Adapter unsupported by this runtime, skipping");
                }
                supported
            })
            .map(|(index, _)| index)
            .collect();

        if self.candidates.is_empty() {
            warn!(?capabilities, "No adapter passed its capability probe");
            return Outcome::Exhausted(PlaybackError::UnsupportedBrowser);
        }

        info!(
            channel_id = %self.source.channel_id(),
            candidates = self.candidates.len(),
            "Starting transport negotiation"
        );
        self.attach_next().await
    }

    /// Feed one adapter event into the cascade.
    pub async fn handle_event(&mut self, event: TaggedEvent) -> Outcome {
        if !self.slot.holds(&event) {
            debug!(
                adapter = %event.kind,
                attachment = event.attachment,
                event = ?event.event,
                "Dropping event from a detached adapter"
            );
            return Outcome::Ignored;
        }

        match event.event {
            AdapterEvent::Log(message) => {
                debug!(adapter = %event.kind, "{message}");
                Outcome::Ignored
            }
            AdapterEvent::Ready if self.ready.is_some() => Outcome::Ignored,
            AdapterEvent::Ready => {
                info!(adapter = %event.kind, attempt = self.attempts.len(), "Adapter ready");
                self.settle_pending(NegotiationStatus::Succeeded, None);
                self.ready = Some(event.kind);
                Outcome::Ready(event.kind)
            }
            AdapterEvent::Fatal(detail) if self.ready.is_some() => Outcome::PostReadyFailure {
                kind: event.kind,
                detail,
            },
            AdapterEvent::Fatal(detail) => {
                warn!(adapter = %event.kind, "Adapter failed: {detail}");
                self.detach_active().await;
                self.settle_pending(NegotiationStatus::Failed, Some(detail));
                self.attach_next().await
            }
        }
    }

    /// Stop the cascade because the session gave up (deadline). The active
    /// adapter is detached and its attempt recorded as failed.
    pub async fn abort(&mut self, detail: &str) -> Option<AdapterKind> {
        let kind = self.detach_active().await;
        self.settle_pending(NegotiationStatus::Failed, Some(detail.to_string()));
        self.cursor = self.candidates.len();
        kind
    }

    /// Detach whatever is attached. Safe to call any number of times.
    pub async fn release(&mut self) {
        self.detach_active().await;
    }

    async fn attach_next(&mut self) -> Outcome {
        while let Some(&index) = self.candidates.get(self.cursor) {
            self.cursor += 1;
            debug_assert!(self.slot.is_empty(), "sink still held while attaching");

            let id = self.next_attachment;
            self.next_attachment += 1;

            let adapter = &mut self.adapters[index];
            let kind = adapter.kind();
            self.sink.bind(kind);
            let lease = SinkLease::new(kind, self.sink.clone());
            self.attempts.push(NegotiationAttempt {
                kind,
                status: NegotiationStatus::Pending,
                detail: None,
            });

            debug!(adapter = %kind, attachment = id, "Attaching adapter");
            let ctx = AttachContext {
                source: self.source.clone(),
                sink: lease.clone(),
                events: AdapterEvents::new(id, kind, self.events.clone()),
            };
            match adapter.attach(ctx) {
                Ok(()) => {
                    self.slot.active = Some(Attachment {
                        index,
                        kind,
                        id,
                        lease,
                    });
                    return Outcome::Waiting;
                }
                Err(e) => {
                    warn!(adapter = %kind, "Adapter failed to attach: {e}");
                    adapter.detach().await;
                    lease.revoke();
                    self.sink.release(kind);
                    self.settle_pending(NegotiationStatus::Failed, Some(e.to_string()));
                }
            }
        }

        let failures: Vec<AdapterTransportError> = self
            .attempts
            .iter()
            .filter(|attempt| attempt.status == NegotiationStatus::Failed)
            .map(|attempt| AdapterTransportError {
                kind: attempt.kind,
                detail: attempt.detail.clone().unwrap_or_default(),
            })
            .collect();
        error!(attempts = failures.len(), "Every transport failed");
        Outcome::Exhausted(PlaybackError::Transport(failures))
    }

    async fn detach_active(&mut self) -> Option<AdapterKind> {
        let attachment = self.slot.active.take()?;
        debug!(adapter = %attachment.kind, attachment = attachment.id, "Detaching adapter");
        self.adapters[attachment.index].detach().await;
        attachment.lease.revoke();
        self.sink.release(attachment.kind);
        Some(attachment.kind)
    }

    fn settle_pending(&mut self, status: NegotiationStatus, detail: Option<String>) {
        if let Some(attempt) = self
            .attempts
            .last_mut()
            .filter(|attempt| attempt.status == NegotiationStatus::Pending)
        {
            attempt.status = status;
            attempt.detail = detail;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::TaggedEventReceiver;
    use crate::error::AdapterError;
    use crate::sink::{Capabilities, MemorySink};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    /// Records calls; optionally refuses to attach.
    struct Recording {
        kind: AdapterKind,
        supported: bool,
        refuse: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl BackendAdapter for Recording {
        fn kind(&self) -> AdapterKind {
            self.kind
        }

        fn probe(&self, _: &Capabilities) -> bool {
            self.supported
        }

        fn attach(&mut self, _ctx: AttachContext) -> Result<(), AdapterError> {
            self.log.lock().push(format!("attach {}", self.kind));
            if self.refuse {
                return Err(AdapterError::Playlist("refused".to_string()));
            }
            Ok(())
        }

        async fn detach(&mut self) {
            self.log.lock().push(format!("detach {}", self.kind));
        }
    }

    fn negotiator(
        specs: &[(AdapterKind, bool, bool)],
    ) -> (
        TransportNegotiator,
        Arc<MemorySink>,
        Arc<Mutex<Vec<String>>>,
        TaggedEventReceiver,
    ) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let adapters = specs
            .iter()
            .map(|&(kind, supported, refuse)| {
                Box::new(Recording {
                    kind,
                    supported,
                    refuse,
                    log: log.clone(),
                }) as Box<dyn BackendAdapter>
            })
            .collect();
        let sink = Arc::new(MemorySink::new(Capabilities {
            media_source: true,
            native_hls: true,
        }));
        let (tx, rx) = mpsc::unbounded_channel();
        let source = StreamSource::new("5.1", "http://tuner.local/live/5.1").unwrap();
        (
            TransportNegotiator::new(source, adapters, sink.clone(), tx),
            sink,
            log,
            rx,
        )
    }

    fn event(attachment: u64, kind: AdapterKind, event: AdapterEvent) -> TaggedEvent {
        TaggedEvent {
            attachment,
            kind,
            event,
        }
    }

    #[tokio::test]
    async fn test_no_supported_adapter_is_unsupported_browser() {
        let (mut negotiator, _, log, _rx) = negotiator(&[
            (AdapterKind::TransportStream, false, false),
            (AdapterKind::NativeHls, false, false),
        ]);
        assert_eq!(
            negotiator.begin().await,
            Outcome::Exhausted(PlaybackError::UnsupportedBrowser)
        );
        assert!(log.lock().is_empty());
        assert!(negotiator.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_fatal_detaches_before_next_attach() {
        let (mut negotiator, sink, log, _rx) = negotiator(&[
            (AdapterKind::TransportStream, true, false),
            (AdapterKind::Hls, true, false),
        ]);
        assert_eq!(negotiator.begin().await, Outcome::Waiting);
        assert_eq!(sink.bound(), Some(AdapterKind::TransportStream));

        let outcome = negotiator
            .handle_event(event(
                1,
                AdapterKind::TransportStream,
                AdapterEvent::Fatal("bad sync".to_string()),
            ))
            .await;
        assert_eq!(outcome, Outcome::Waiting);
        assert_eq!(
            *log.lock(),
            vec!["attach mpegts", "detach mpegts", "attach hls"]
        );
        assert_eq!(sink.bound(), Some(AdapterKind::Hls));
        assert_eq!(negotiator.attempts()[0].status, NegotiationStatus::Failed);
        assert_eq!(negotiator.attempts()[1].status, NegotiationStatus::Pending);
    }

    #[tokio::test]
    async fn test_synchronous_attach_error_advances_cascade() {
        let (mut negotiator, _, log, _rx) = negotiator(&[
            (AdapterKind::Hls, true, true),
            (AdapterKind::NativeHls, true, false),
        ]);
        assert_eq!(negotiator.begin().await, Outcome::Waiting);
        assert_eq!(negotiator.active(), Some(AdapterKind::NativeHls));
        assert_eq!(
            negotiator.attempts()[0].detail.as_deref(),
            Some("Playlist error: refused")
        );
        assert_eq!(
            *log.lock(),
            vec!["attach hls", "detach hls", "attach native-hls"]
        );
    }

    #[tokio::test]
    async fn test_exhaustion_aggregates_failures() {
        let (mut negotiator, sink, _, _rx) = negotiator(&[
            (AdapterKind::TransportStream, true, false),
            (AdapterKind::Hls, true, true),
        ]);
        negotiator.begin().await;
        let outcome = negotiator
            .handle_event(event(
                1,
                AdapterKind::TransportStream,
                AdapterEvent::Fatal("HTTP error: 404 Not Found".to_string()),
            ))
            .await;

        match outcome {
            Outcome::Exhausted(PlaybackError::Transport(failures)) => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].kind, AdapterKind::TransportStream);
                assert_eq!(failures[1].kind, AdapterKind::Hls);
            }
            other => panic!("expected transport error, got {other:?}"),
        }
        assert!(sink.bound().is_none());
        assert!(negotiator.slot().is_empty());
    }

    #[tokio::test]
    async fn test_stale_and_duplicate_events_are_ignored() {
        let (mut negotiator, _, _, _rx) = negotiator(&[
            (AdapterKind::TransportStream, true, false),
            (AdapterKind::Hls, true, false),
        ]);
        negotiator.begin().await;
        negotiator
            .handle_event(event(1, AdapterKind::TransportStream, AdapterEvent::Fatal("x".into())))
            .await;

        // the first attachment is gone
        let late = event(1, AdapterKind::TransportStream, AdapterEvent::Ready);
        assert_eq!(negotiator.handle_event(late).await, Outcome::Ignored);

        let ready = event(2, AdapterKind::Hls, AdapterEvent::Ready);
        assert_eq!(
            negotiator.handle_event(ready.clone()).await,
            Outcome::Ready(AdapterKind::Hls)
        );
        assert_eq!(negotiator.handle_event(ready).await, Outcome::Ignored);
        assert_eq!(
            negotiator
                .handle_event(event(2, AdapterKind::Hls, AdapterEvent::Fatal("gone".into())))
                .await,
            Outcome::PostReadyFailure {
                kind: AdapterKind::Hls,
                detail: "gone".to_string()
            }
        );
        assert_eq!(negotiator.active(), Some(AdapterKind::Hls));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (mut negotiator, sink, log, _rx) =
            negotiator(&[(AdapterKind::TransportStream, true, false)]);
        negotiator.begin().await;
        negotiator.release().await;
        negotiator.release().await;

        assert_eq!(*log.lock(), vec!["attach mpegts", "detach mpegts"]);
        assert!(sink.bound().is_none());
        assert_eq!(sink.bind_count(), 1);
    }
}

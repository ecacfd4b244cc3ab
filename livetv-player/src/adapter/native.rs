//! Platform-native segmented playback: hands the endpoint URL to the sink's own
//! HLS player instead of demuxing in-process.

use async_trait::async_trait;
use tracing::info;

use super::{AdapterKind, AttachContext, AttachedTask, BackendAdapter};
use crate::error::AdapterError;
use crate::sink::{Capabilities, SinkLease};

#[derive(Default)]
pub struct NativeHlsAdapter {
    task: Option<AttachedTask>,
    lease: Option<SinkLease>,
}

impl NativeHlsAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackendAdapter for NativeHlsAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::NativeHls
    }

    fn probe(&self, capabilities: &Capabilities) -> bool {
        capabilities.native_hls
    }

    fn attach(&mut self, ctx: AttachContext) -> Result<(), AdapterError> {
        let AttachContext { source, sink, events } = ctx;
        self.lease = Some(sink.clone());

        let ready = events.clone();
        let work = async move {
            sink.open_native(source.url()).await?;
            info!(url = %source.url(), "Native player loaded stream");
            ready.ready();
            // The platform player owns the stream from here; stay attached until detached.
            std::future::pending::<()>().await;
            Ok(())
        };
        self.task = Some(AttachedTask::spawn(events, work));
        Ok(())
    }

    async fn detach(&mut self) {
        if let Some(task) = self.task.take() {
            task.stop().await;
        }
        if let Some(lease) = self.lease.take() {
            lease.close_native();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterEvent, AdapterEvents, TaggedEvent};
    use crate::sink::{MediaSink, MemorySink};
    use crate::source::StreamSource;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn context(sink: Arc<MemorySink>) -> (AttachContext, mpsc::UnboundedReceiver<TaggedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        sink.bind(AdapterKind::NativeHls);
        let ctx = AttachContext {
            source: StreamSource::new("2.1", "http://tuner.local/live/2.1.m3u8").unwrap(),
            sink: SinkLease::new(AdapterKind::NativeHls, sink),
            events: AdapterEvents::new(3, AdapterKind::NativeHls, tx),
        };
        (ctx, rx)
    }

    #[tokio::test]
    async fn test_native_player_loads_and_closes() {
        let sink = Arc::new(MemorySink::new(Capabilities {
            media_source: false,
            native_hls: true,
        }));
        let (ctx, mut rx) = context(sink.clone());
        let mut adapter = NativeHlsAdapter::new();
        adapter.attach(ctx).unwrap();

        assert_eq!(rx.recv().await.unwrap().event, AdapterEvent::Ready);
        assert_eq!(
            sink.native_url().map(|u| u.to_string()),
            Some("http://tuner.local/live/2.1.m3u8".to_string())
        );

        adapter.detach().await;
        assert!(sink.native_url().is_none());
    }

    #[tokio::test]
    async fn test_sink_without_native_support_is_fatal() {
        let sink = Arc::new(MemorySink::new(Capabilities::default()));
        let (ctx, mut rx) = context(sink);
        let mut adapter = NativeHlsAdapter::new();
        adapter.attach(ctx).unwrap();

        match rx.recv().await.unwrap().event {
            AdapterEvent::Fatal(detail) => assert!(detail.contains("not supported")),
            other => panic!("expected fatal, got {other:?}"),
        }
        adapter.detach().await;
    }
}

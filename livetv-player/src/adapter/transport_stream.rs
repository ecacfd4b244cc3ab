//! Raw MPEG-TS adapter.
//!
//! Issues one HTTP GET against the channel endpoint and demuxes the response
//! body as a continuous transport stream. Reports ready once packet sync is
//! established and a valid program association table has been parsed, so an
//! endpoint serving a playlist or an error page fails fast instead of hanging.

use async_trait::async_trait;
use livetv_core::config::TransportStreamConfig;
use tracing::{debug, info};

use super::{AdapterEvents, AdapterKind, AttachContext, AttachedTask, BackendAdapter};
use crate::error::AdapterError;
use crate::mpegts::TsDemuxer;
use crate::sink::{Capabilities, SinkLease};
use crate::source::StreamSource;

pub struct TransportStreamAdapter {
    client: reqwest::Client,
    config: TransportStreamConfig,
    task: Option<AttachedTask>,
}

impl TransportStreamAdapter {
    #[must_use]
    pub const fn new(client: reqwest::Client, config: TransportStreamConfig) -> Self {
        Self {
            client,
            config,
            task: None,
        }
    }

    async fn stream(
        client: reqwest::Client,
        config: TransportStreamConfig,
        source: StreamSource,
        sink: SinkLease,
        events: AdapterEvents,
    ) -> Result<(), AdapterError> {
        info!(url = %source.url(), "Connecting to transport stream");

        let mut response = client.get(source.url().clone()).send().await?;
        if !response.status().is_success() {
            return Err(AdapterError::Status(response.status()));
        }

        let mut demuxer = TsDemuxer::new(config.sync_packets, config.probe_bytes);
        let mut ready = false;

        while let Some(chunk) = response.chunk().await? {
            let packets = demuxer.push(&chunk)?;

            if !ready && demuxer.programs().is_some() {
                ready = true;
                debug!(
                    programs = ?demuxer.programs(),
                    packets = demuxer.packets(),
                    "Transport stream locked"
                );
                events.ready();
            }

            if !packets.is_empty() {
                sink.write(packets)?;
            }
        }

        info!(
            packets = demuxer.packets(),
            resyncs = demuxer.resyncs(),
            "Transport stream ended"
        );
        Err(AdapterError::StreamEnded)
    }
}

#[async_trait]
impl BackendAdapter for TransportStreamAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::TransportStream
    }

    fn probe(&self, capabilities: &Capabilities) -> bool {
        capabilities.media_source
    }

    fn attach(&mut self, ctx: AttachContext) -> Result<(), AdapterError> {
        let AttachContext { source, sink, events } = ctx;
        let work = Self::stream(
            self.client.clone(),
            self.config.clone(),
            source,
            sink,
            events.clone(),
        );
        self.task = Some(AttachedTask::spawn(events, work));
        Ok(())
    }

    async fn detach(&mut self) {
        if let Some(task) = self.task.take() {
            task.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterEvent, TaggedEvent};
    use crate::mpegts::{write_packet, write_pat_packet, Program, TS_PACKET_SIZE};
    use crate::sink::{MediaSink, MemorySink};
    use bytes::BytesMut;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ts_body(packets: usize) -> Vec<u8> {
        let mut data = BytesMut::new();
        data.extend_from_slice(&write_pat_packet(
            &[Program {
                program_number: 1,
                pmt_pid: 0x1000,
            }],
            0,
        ));
        for i in 1..packets {
            data.extend_from_slice(&write_packet(0x0100, false, i as u8, b"es"));
        }
        data.to_vec()
    }

    async fn attach(
        server: &MockServer,
        sink: Arc<MemorySink>,
    ) -> (TransportStreamAdapter, mpsc::UnboundedReceiver<TaggedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut adapter =
            TransportStreamAdapter::new(reqwest::Client::new(), TransportStreamConfig::default());
        sink.bind(AdapterKind::TransportStream);
        let ctx = AttachContext {
            source: StreamSource::new("4.1", &format!("{}/live/4.1", server.uri())).unwrap(),
            sink: SinkLease::new(AdapterKind::TransportStream, sink),
            events: AdapterEvents::new(1, AdapterKind::TransportStream, tx),
        };
        adapter.attach(ctx).unwrap();
        (adapter, rx)
    }

    #[tokio::test]
    async fn test_ready_and_packets_delivered() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/live/4.1"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(ts_body(10)))
            .mount(&server)
            .await;

        let sink = Arc::new(MemorySink::new(Capabilities {
            media_source: true,
            native_hls: false,
        }));
        let (mut adapter, mut rx) = attach(&server, sink.clone()).await;

        assert_eq!(rx.recv().await.unwrap().event, AdapterEvent::Ready);
        // the body ends, which a live stream never should
        assert_eq!(
            rx.recv().await.unwrap().event,
            AdapterEvent::Fatal("Stream ended".to_string())
        );
        assert_eq!(sink.bytes_written(), (10 * TS_PACKET_SIZE) as u64);

        adapter.detach().await;
        adapter.detach().await;
    }

    #[tokio::test]
    async fn test_html_response_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html><body>Sign in to watch</body></html>".repeat(30_000)),
            )
            .mount(&server)
            .await;

        let sink = Arc::new(MemorySink::new(Capabilities::default()));
        let (mut adapter, mut rx) = attach(&server, sink.clone()).await;

        match rx.recv().await.unwrap().event {
            AdapterEvent::Fatal(detail) => assert!(detail.starts_with("Not an MPEG-TS stream")),
            other => panic!("expected fatal, got {other:?}"),
        }
        assert_eq!(sink.bytes_written(), 0);
        adapter.detach().await;
    }

    #[tokio::test]
    async fn test_http_error_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let sink = Arc::new(MemorySink::new(Capabilities::default()));
        let (mut adapter, mut rx) = attach(&server, sink).await;

        assert_eq!(
            rx.recv().await.unwrap().event,
            AdapterEvent::Fatal("HTTP error: 404 Not Found".to_string())
        );
        adapter.detach().await;
    }
}

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use url::Url;

use super::{Capabilities, ControlState, MediaSink, SinkError};
use crate::adapter::AdapterKind;

/// Keep at most this much of the stream around (8 MB)
const MAX_BUFFERED: usize = 8 * 1024 * 1024;

/// In-memory sink that keeps the tail of the stream.
///
/// Used when nothing needs to be rendered or recorded, and by tests to observe
/// exactly what the attached adapter delivered.
pub struct MemorySink {
    capabilities: Capabilities,
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    controls: ControlState,
    buffer: BytesMut,
    bytes_written: u64,
    native_url: Option<Url>,
    binds: u32,
}

impl MemorySink {
    #[must_use]
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.state.lock().bytes_written
    }

    /// The most recent bytes written, up to 8 MB.
    pub fn buffered(&self) -> Bytes {
        Bytes::copy_from_slice(&self.state.lock().buffer)
    }

    pub fn bound(&self) -> Option<AdapterKind> {
        self.state.lock().controls.bound
    }

    /// How many times the sink has been handed to an adapter.
    pub fn bind_count(&self) -> u32 {
        self.state.lock().binds
    }

    pub fn native_url(&self) -> Option<Url> {
        self.state.lock().native_url.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().controls.playing
    }

    pub fn is_muted(&self) -> bool {
        self.state.lock().controls.muted
    }

    pub fn is_fullscreen(&self) -> bool {
        self.state.lock().controls.fullscreen
    }
}

#[async_trait]
impl MediaSink for MemorySink {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn bind(&self, kind: AdapterKind) {
        let mut state = self.state.lock();
        state.controls.bind(kind);
        state.binds += 1;
    }

    fn release(&self, kind: AdapterKind) {
        let mut state = self.state.lock();
        if state.controls.release(kind) {
            state.buffer.clear();
            state.native_url = None;
        }
    }

    fn write(&self, data: Bytes) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        if state.controls.bound.is_none() {
            return Err(SinkError::NotReady);
        }
        state.bytes_written += data.len() as u64;
        state.buffer.extend_from_slice(&data);
        let excess = state.buffer.len().saturating_sub(MAX_BUFFERED);
        if excess > 0 {
            state.buffer.advance(excess);
        }
        Ok(())
    }

    async fn open_native(&self, url: &Url) -> Result<(), SinkError> {
        if !self.capabilities.native_hls {
            return Err(SinkError::Unsupported("native HLS playback"));
        }
        self.state.lock().native_url = Some(url.clone());
        Ok(())
    }

    fn close_native(&self) {
        self.state.lock().native_url = None;
    }

    fn is_ready(&self) -> bool {
        self.state.lock().controls.bound.is_some()
    }

    fn play(&self) -> Result<(), SinkError> {
        self.state.lock().controls.play()
    }

    fn pause(&self) {
        self.state.lock().controls.pause();
    }

    fn set_muted(&self, muted: bool) {
        self.state.lock().controls.muted = muted;
    }

    fn position(&self) -> f64 {
        self.state.lock().controls.playhead.position()
    }

    fn set_position(&self, seconds: f64) {
        self.state.lock().controls.playhead.seek(seconds);
    }

    fn request_fullscreen(&self) -> Result<(), SinkError> {
        self.state.lock().controls.fullscreen = true;
        Ok(())
    }

    fn exit_fullscreen(&self) -> Result<(), SinkError> {
        self.state.lock().controls.fullscreen = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> MemorySink {
        MemorySink::new(Capabilities {
            media_source: true,
            native_hls: true,
        })
    }

    #[test]
    fn test_write_requires_binding() {
        let sink = sink();
        assert!(matches!(
            sink.write(Bytes::from_static(b"x")),
            Err(SinkError::NotReady)
        ));

        sink.bind(AdapterKind::Hls);
        sink.write(Bytes::from_static(b"segment")).unwrap();
        assert_eq!(sink.bytes_written(), 7);
        assert_eq!(&sink.buffered()[..], b"segment");
    }

    #[test]
    fn test_release_by_other_adapter_is_ignored() {
        let sink = sink();
        sink.bind(AdapterKind::Hls);
        sink.write(Bytes::from_static(b"data")).unwrap();

        sink.release(AdapterKind::TransportStream);
        assert_eq!(sink.bound(), Some(AdapterKind::Hls));

        sink.release(AdapterKind::Hls);
        assert_eq!(sink.bound(), None);
        assert!(sink.buffered().is_empty());
        assert!(!sink.is_ready());
    }

    #[test]
    fn test_play_needs_loaded_media() {
        let sink = sink();
        assert!(matches!(sink.play(), Err(SinkError::NotReady)));

        sink.bind(AdapterKind::TransportStream);
        sink.play().unwrap();
        assert!(sink.is_playing());
        sink.pause();
        assert!(!sink.is_playing());
    }

    #[test]
    fn test_buffer_keeps_only_the_tail() {
        let sink = sink();
        sink.bind(AdapterKind::TransportStream);
        let chunk = Bytes::from(vec![0u8; 1024 * 1024]);
        for _ in 0..10 {
            sink.write(chunk.clone()).unwrap();
        }
        assert_eq!(sink.bytes_written(), 10 * 1024 * 1024);
        assert_eq!(sink.buffered().len(), MAX_BUFFERED);
    }

    #[tokio::test]
    async fn test_native_open_respects_capability() {
        let url = Url::parse("http://example.com/live.m3u8").unwrap();
        sink().open_native(&url).await.unwrap();

        let plain = MemorySink::new(Capabilities::default());
        assert!(matches!(
            plain.open_native(&url).await,
            Err(SinkError::Unsupported(_))
        ));
    }
}

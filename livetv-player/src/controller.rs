//! Adapter-agnostic playback controls, driven by the session once playing.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::events::{EventSender, PlayerEvent};
use crate::sink::MediaSink;

pub struct PlaybackController {
    sink: Arc<dyn MediaSink>,
    events: EventSender,
    playing: bool,
    muted: bool,
}

impl PlaybackController {
    pub fn new(sink: Arc<dyn MediaSink>, events: EventSender) -> Self {
        Self {
            sink,
            events,
            playing: false,
            muted: false,
        }
    }

    pub const fn is_playing(&self) -> bool {
        self.playing
    }

    pub const fn is_muted(&self) -> bool {
        self.muted
    }

    /// Apply the initial mute state and optionally start playback.
    /// Called once per successful negotiation.
    pub fn start(&mut self, autoplay: bool, muted: bool) {
        self.sink.set_muted(muted);
        if muted != self.muted {
            self.muted = muted;
            self.emit(PlayerEvent::MuteStateChanged { muted });
        }

        if autoplay && !self.playing {
            match self.sink.play() {
                Ok(()) => {
                    self.playing = true;
                    self.emit(PlayerEvent::PlayStateChanged { playing: true });
                }
                Err(e) => warn!("Autoplay failed: {e}"),
            }
        }
    }

    /// Forget playback state once the sink is about to be released.
    /// Every flag that flips is announced so subscribers never show stale state.
    pub fn reset(&mut self, muted: bool) {
        if self.playing {
            self.playing = false;
            self.emit(PlayerEvent::PlayStateChanged { playing: false });
        }

        self.sink.set_muted(muted);
        if self.muted != muted {
            self.muted = muted;
            self.emit(PlayerEvent::MuteStateChanged { muted });
        }
    }

    pub fn toggle_play_pause(&mut self) {
        if !self.sink.is_ready() {
            debug!("Play/pause ignored, sink not ready");
            return;
        }

        if self.playing {
            self.sink.pause();
        } else if let Err(e) = self.sink.play() {
            warn!("Failed to start playback: {e}");
            return;
        }
        self.playing = !self.playing;
        self.emit(PlayerEvent::PlayStateChanged {
            playing: self.playing,
        });
    }

    /// Move the playhead by `delta` seconds. Never goes below zero; the upper
    /// bound is up to the sink. Returns the new position.
    pub fn seek_relative(&mut self, delta: f64) -> f64 {
        if !delta.is_finite() {
            warn!(delta, "Ignoring seek by a non-finite offset");
            return self.sink.position();
        }
        let target = (self.sink.position() + delta).max(0.0);
        self.sink.set_position(target);
        debug!(delta, position = target, "Seek");
        target
    }

    pub fn toggle_mute(&mut self) {
        self.muted = !self.muted;
        self.sink.set_muted(self.muted);
        self.emit(PlayerEvent::MuteStateChanged { muted: self.muted });
    }

    pub fn request_fullscreen(&self) {
        if let Err(e) = self.sink.request_fullscreen() {
            warn!("Failed to enter fullscreen: {e}");
        }
    }

    pub fn exit_fullscreen(&self) {
        if let Err(e) = self.sink.exit_fullscreen() {
            warn!("Failed to exit fullscreen: {e}");
        }
    }

    fn emit(&self, event: PlayerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterKind;
    use crate::sink::{Capabilities, MemorySink};
    use std::time::Duration;
    use tokio::sync::broadcast;

    fn controller() -> (PlaybackController, Arc<MemorySink>, broadcast::Receiver<PlayerEvent>) {
        let sink = Arc::new(MemorySink::new(Capabilities {
            media_source: true,
            native_hls: false,
        }));
        let (tx, rx) = broadcast::channel(16);
        (PlaybackController::new(sink.clone(), tx), sink, rx)
    }

    #[test]
    fn test_play_pause_is_noop_without_media() {
        let (mut controller, sink, mut rx) = controller();
        controller.toggle_play_pause();
        assert!(!controller.is_playing());
        assert!(!sink.is_playing());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_autoplay_and_toggle() {
        let (mut controller, sink, mut rx) = controller();
        sink.bind(AdapterKind::Hls);

        controller.start(true, true);
        assert!(sink.is_playing());
        assert!(sink.is_muted());
        assert_eq!(rx.try_recv().unwrap(), PlayerEvent::MuteStateChanged { muted: true });
        assert_eq!(rx.try_recv().unwrap(), PlayerEvent::PlayStateChanged { playing: true });

        controller.toggle_play_pause();
        assert!(!sink.is_playing());
        assert_eq!(rx.try_recv().unwrap(), PlayerEvent::PlayStateChanged { playing: false });

        controller.toggle_mute();
        assert!(!sink.is_muted());
        assert_eq!(rx.try_recv().unwrap(), PlayerEvent::MuteStateChanged { muted: false });
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_clamps_at_zero() {
        let (mut controller, sink, _rx) = controller();
        sink.bind(AdapterKind::TransportStream);
        controller.start(true, false);
        tokio::time::advance(Duration::from_secs(5)).await;

        assert!((sink.position() - 5.0).abs() < 1e-6);
        assert!(controller.seek_relative(-1000.0).abs() < f64::EPSILON);
        assert!(sink.position() >= 0.0);
        assert!((controller.seek_relative(12.5) - 12.5).abs() < 1e-6);

        assert!((controller.seek_relative(f64::INFINITY) - 12.5).abs() < 1e-6);
        assert!((controller.seek_relative(f64::NAN) - 12.5).abs() < 1e-6);
        assert!(sink.position().is_finite());
    }

    #[test]
    fn test_reset_announces_flipped_state() {
        let (mut controller, sink, mut rx) = controller();
        sink.bind(AdapterKind::Hls);
        controller.start(true, true);
        while rx.try_recv().is_ok() {}

        controller.reset(false);
        assert!(!controller.is_playing());
        assert!(!controller.is_muted());
        assert!(!sink.is_muted());
        assert_eq!(rx.try_recv().unwrap(), PlayerEvent::PlayStateChanged { playing: false });
        assert_eq!(rx.try_recv().unwrap(), PlayerEvent::MuteStateChanged { muted: false });

        // nothing flips the second time
        controller.reset(false);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_fullscreen_failure_is_not_fatal() {
        struct NoFullscreen(MemorySink);

        #[async_trait::async_trait]
        impl MediaSink for NoFullscreen {
            fn capabilities(&self) -> Capabilities {
                self.0.capabilities()
            }
            fn bind(&self, kind: AdapterKind) {
                self.0.bind(kind);
            }
            fn release(&self, kind: AdapterKind) {
                self.0.release(kind);
            }
            fn write(&self, data: bytes::Bytes) -> Result<(), crate::sink::SinkError> {
                self.0.write(data)
            }
            fn is_ready(&self) -> bool {
                self.0.is_ready()
            }
            fn play(&self) -> Result<(), crate::sink::SinkError> {
                self.0.play()
            }
            fn pause(&self) {
                self.0.pause();
            }
            fn set_muted(&self, muted: bool) {
                self.0.set_muted(muted);
            }
            fn position(&self) -> f64 {
                self.0.position()
            }
            fn set_position(&self, seconds: f64) {
                self.0.set_position(seconds);
            }
        }

        let (tx, _rx) = broadcast::channel(4);
        let controller = PlaybackController::new(
            Arc::new(NoFullscreen(MemorySink::new(Capabilities::default()))),
            tx,
        );
        controller.request_fullscreen();
        controller.exit_fullscreen();
    }
}

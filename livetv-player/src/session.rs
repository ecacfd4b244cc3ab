//! Playback session: one per open live view.
//!
//! A single task owns the negotiator, the deadline, the controller and the
//! controls timer, and reacts to whichever of these is observed first:
//! user commands, adapter events, deadline expiry, controls idle timeout.
//! The first one to be observed wins; a `ready` that arrives after the deadline
//! fired belongs to an attachment that no longer exists and is dropped.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn, Instrument};

use crate::adapter::{AdapterKind, BackendAdapter, TaggedEvent, TaggedEventReceiver};
use crate::controller::PlaybackController;
use crate::controls::ControlsAutoHide;
use crate::deadline::Deadline;
use crate::error::PlaybackError;
use crate::events::{EventReceiver, EventSender, PlayerEvent};
use crate::negotiator::{NegotiationAttempt, Outcome, TransportNegotiator};
use crate::sink::MediaSink;
use crate::source::StreamSource;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub negotiation_timeout: Duration,
    pub controls_hide_delay: Duration,
    pub autoplay: bool,
    pub start_muted: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&livetv_core::config::PlayerConfig::default())
    }
}

impl From<&livetv_core::config::PlayerConfig> for SessionConfig {
    fn from(config: &livetv_core::config::PlayerConfig) -> Self {
        Self {
            negotiation_timeout: config.negotiation_timeout(),
            controls_hide_delay: config.controls_hide_delay(),
            autoplay: config.autoplay,
            start_muted: config.start_muted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Negotiating,
    Playing,
    Fatal,
}

/// Point-in-time view of a session, for diagnostics and UI state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub channel_id: String,
    pub state: SessionState,
    pub active_adapter: Option<AdapterKind>,
    pub playing: bool,
    pub muted: bool,
    pub retry_count: u32,
    pub attempts: Vec<NegotiationAttempt>,
    pub controls_visible: bool,
    pub error: Option<PlaybackError>,
}

enum Command {
    TogglePlayPause,
    ToggleMute,
    RequestFullscreen,
    ExitFullscreen,
    UserActivity,
    SeekRelative(f64, oneshot::Sender<Option<f64>>),
    Retry,
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Teardown(oneshot::Sender<()>),
}

/// Command surface of a running session. Cheap to clone.
///
/// The session tears itself down once every handle is dropped.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: EventSender,
    controls: watch::Receiver<bool>,
}

impl SessionHandle {
    /// Start a session and begin negotiating immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        source: StreamSource,
        sink: Arc<dyn MediaSink>,
        adapters: Vec<Box<dyn BackendAdapter>>,
        config: SessionConfig,
    ) -> (Self, EventReceiver) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (adapter_tx, adapter_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = broadcast::channel(EVENT_CAPACITY);

        let auto_hide = ControlsAutoHide::new(config.controls_hide_delay);
        let controls = auto_hide.subscribe();
        let span = tracing::info_span!("session", channel_id = %source.channel_id());

        let session = Session {
            negotiator: TransportNegotiator::new(source.clone(), adapters, sink.clone(), adapter_tx),
            controller: PlaybackController::new(sink, events.clone()),
            deadline: Deadline::new(config.negotiation_timeout),
            auto_hide,
            source,
            config,
            state: SessionState::Idle,
            retry_count: 0,
            error: None,
            commands: command_rx,
            adapter_events: adapter_rx,
            events: events.clone(),
        };
        tokio::spawn(session.run().instrument(span));

        (
            Self {
                commands: command_tx,
                events,
                controls,
            },
            event_rx,
        )
    }

    pub fn toggle_play_pause(&self) {
        self.send(Command::TogglePlayPause);
    }

    pub fn toggle_mute(&self) {
        self.send(Command::ToggleMute);
    }

    pub fn request_fullscreen(&self) {
        self.send(Command::RequestFullscreen);
    }

    pub fn exit_fullscreen(&self) {
        self.send(Command::ExitFullscreen);
    }

    /// Pointer movement, key press, anything that should reveal the controls.
    pub fn user_activity(&self) {
        self.send(Command::UserActivity);
    }

    /// Returns the new position, or `None` when the session is not playing.
    pub async fn seek_relative(&self, delta_seconds: f64) -> Option<f64> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::SeekRelative(delta_seconds, tx));
        rx.await.ok().flatten()
    }

    /// Cold restart: a fresh negotiation pass from the first adapter with a
    /// fresh deadline. Valid from any state.
    pub fn retry(&self) {
        self.send(Command::Retry);
    }

    /// `None` once the session has been torn down.
    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx));
        rx.await.ok()
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn controls_visible(&self) -> watch::Receiver<bool> {
        self.controls.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Release the sink, cancel both timers and stop the session.
    /// Returns once everything is released; later calls return immediately.
    pub async fn teardown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Teardown(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Session already torn down, command dropped");
        }
    }
}

struct Session {
    source: StreamSource,
    config: SessionConfig,
    negotiator: TransportNegotiator,
    controller: PlaybackController,
    deadline: Deadline,
    auto_hide: ControlsAutoHide,
    state: SessionState,
    retry_count: u32,
    error: Option<PlaybackError>,
    commands: mpsc::UnboundedReceiver<Command>,
    adapter_events: TaggedEventReceiver,
    events: EventSender,
}

impl Session {
    async fn run(mut self) {
        info!(url = %self.source.url(), "Opening live session");
        self.start_negotiation().await;

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Teardown(ack)) => {
                        self.teardown().await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All session handles dropped");
                        self.teardown().await;
                        break;
                    }
                },
                Some(event) = self.adapter_events.recv() => self.handle_adapter_event(event).await,
                elapsed = self.deadline.expired() => self.handle_timeout(elapsed).await,
                () = self.auto_hide.fired() => self.auto_hide.hide(),
            }
        }

        info!(retries = self.retry_count, "Live session closed");
    }

    async fn start_negotiation(&mut self) {
        self.state = SessionState::Negotiating;
        self.error = None;
        self.controller.reset(false);
        self.auto_hide.disable();
        self.emit(PlayerEvent::Loading);

        self.deadline.arm();
        let outcome = self.negotiator.begin().await;
        self.apply(outcome);
    }

    async fn handle_adapter_event(&mut self, event: TaggedEvent) {
        let outcome = self.negotiator.handle_event(event).await;
        self.apply(outcome);
    }

    async fn handle_timeout(&mut self, elapsed: Duration) {
        self.deadline.disarm();
        if self.state != SessionState::Negotiating {
            return;
        }

        let err = PlaybackError::NetworkTimeout { elapsed };
        let detached = self.negotiator.abort(&err.to_string()).await;
        error!(
            timeout_secs = self.deadline.timeout().as_secs(),
            elapsed_ms = elapsed.as_millis() as u64,
            torn_down = ?detached,
            "No adapter became ready in time"
        );
        self.fail(err);
    }

    fn apply(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Ignored | Outcome::Waiting => {}
            Outcome::Ready(kind) => {
                self.deadline.disarm();
                self.state = SessionState::Playing;
                info!(
                    adapter = %kind,
                    attachment = ?self.negotiator.slot().attachment_id(),
                    retries = self.retry_count,
                    "Playback ready"
                );
                self.emit(PlayerEvent::Ready { adapter: kind });
                self.controller
                    .start(self.config.autoplay, self.config.start_muted);
                self.auto_hide.enable();
            }
            Outcome::Exhausted(err) => {
                error!("Negotiation failed: {err}");
                self.fail(err);
            }
            Outcome::PostReadyFailure { kind, detail } => {
                // No reconnect once playing: the failure is reported, the session is left as is
                error!(adapter = %kind, "Adapter failed after playback started: {detail}");
            }
        }
    }

    fn fail(&mut self, err: PlaybackError) {
        self.deadline.disarm();
        self.state = SessionState::Fatal;
        self.emit(PlayerEvent::Error {
            message: err.to_string(),
        });
        self.error = Some(err);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::UserActivity => self.auto_hide.activity(),
            Command::Retry => {
                self.retry_count += 1;
                info!(retry = self.retry_count, "Retrying from the first adapter");
                self.start_negotiation().await;
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::SeekRelative(delta, reply) => {
                let position = self.playing_only("seek").then(|| {
                    self.auto_hide.activity();
                    self.controller.seek_relative(delta)
                });
                let _ = reply.send(position);
            }
            Command::TogglePlayPause if self.playing_only("play/pause") => {
                self.auto_hide.activity();
                self.controller.toggle_play_pause();
            }
            Command::ToggleMute if self.playing_only("mute") => {
                self.auto_hide.activity();
                self.controller.toggle_mute();
            }
            Command::RequestFullscreen if self.playing_only("fullscreen") => {
                self.controller.request_fullscreen();
            }
            Command::ExitFullscreen if self.playing_only("fullscreen") => {
                self.controller.exit_fullscreen();
            }
            Command::TogglePlayPause
            | Command::ToggleMute
            | Command::RequestFullscreen
            | Command::ExitFullscreen => {}
            Command::Teardown(_) => warn!("Teardown must be handled by the session loop"),
        }
    }

    fn playing_only(&self, operation: &str) -> bool {
        let playing = self.state == SessionState::Playing;
        if !playing {
            debug!(state = ?self.state, "Ignoring {operation} while not playing");
        }
        playing
    }

    async fn teardown(&mut self) {
        self.deadline.disarm();
        self.auto_hide.disable();
        self.negotiator.release().await;
        self.controller.reset(false);
        self.state = SessionState::Idle;
        debug!("Session torn down");
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            channel_id: self.source.channel_id().to_string(),
            state: self.state,
            active_adapter: self.negotiator.active(),
            playing: self.controller.is_playing(),
            muted: self.controller.is_muted(),
            retry_count: self.retry_count,
            attempts: self.negotiator.attempts().to_vec(),
            controls_visible: self.auto_hide.is_visible(),
            error: self.error.clone(),
        }
    }

    fn emit(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }
}

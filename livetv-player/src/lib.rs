// livetv-player - Live-TV playback engine
//
// Plays one continuously running channel stream whose wire format (raw MPEG-TS
// or HLS) is not known up front:
// - adapter/     - Backend adapters (raw TS demuxer, HLS demuxer, native HLS player)
// - negotiator   - Ordered fallback cascade, single live attachment
// - deadline     - Wall-clock bound on the whole cascade
// - controller   - Play/pause, seek, mute, fullscreen once playing
// - session      - Per-view event loop tying the above together
//
// Everything runs on one cooperative task; adapters suspend on network I/O only.

pub mod adapter;
pub mod controller;
pub mod controls;
pub mod deadline;
pub mod error;
pub mod events;
pub mod http;
pub mod mpegts;
pub mod negotiator;
pub mod session;
pub mod sink;
pub mod source;
pub mod timer;
mod util;

pub use adapter::{default_adapters, AdapterEvent, AdapterKind, BackendAdapter};
pub use error::{AdapterError, AdapterTransportError, PlaybackError, PlaybackResult};
pub use events::{EventReceiver, PlayerEvent};
pub use http::build_client;
pub use negotiator::{NegotiationAttempt, NegotiationStatus, TransportNegotiator};
pub use session::{SessionConfig, SessionHandle, SessionSnapshot, SessionState};
pub use sink::{Capabilities, FileSink, MediaSink, MemorySink, SinkError, SinkLease};
pub use source::StreamSource;

use std::fmt;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::adapter::AdapterKind;

/// Everything the surrounding UI layer observes from a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlayerEvent {
    /// A negotiation pass started
    Loading,
    Ready { adapter: AdapterKind },
    Error { message: String },
    PlayStateChanged { playing: bool },
    MuteStateChanged { muted: bool },
}

impl fmt::Display for PlayerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loading => write!(f, "loading"),
            Self::Ready { adapter } => write!(f, "ready via {adapter}"),
            Self::Error { message } => write!(f, "error: {message}"),
            Self::PlayStateChanged { playing } => {
                write!(f, "{}", if *playing { "playing" } else { "paused" })
            }
            Self::MuteStateChanged { muted } => {
                write!(f, "{}", if *muted { "muted" } else { "unmuted" })
            }
        }
    }
}

pub type EventSender = broadcast::Sender<PlayerEvent>;
pub type EventReceiver = broadcast::Receiver<PlayerEvent>;

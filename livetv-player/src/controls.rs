//! Controls auto-hide: shows the controls on activity and hides them after an
//! idle period while the stream is playing.
//!
//! Runs on its own [`OneShotTimer`] and never touches the negotiation deadline.

use std::time::Duration;

use tokio::sync::watch;
use tracing::trace;

use crate::timer::OneShotTimer;

#[derive(Debug)]
pub struct ControlsAutoHide {
    hide_delay: Duration,
    enabled: bool,
    timer: OneShotTimer,
    visible: watch::Sender<bool>,
}

impl ControlsAutoHide {
    /// Controls start visible with hiding disabled.
    #[must_use]
    pub fn new(hide_delay: Duration) -> Self {
        let (visible, _) = watch::channel(true);
        Self {
            hide_delay,
            enabled: false,
            timer: OneShotTimer::new(),
            visible,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.visible.subscribe()
    }

    pub fn is_visible(&self) -> bool {
        *self.visible.borrow()
    }

    /// Start hiding after idle periods. Counts as activity.
    pub fn enable(&mut self) {
        self.enabled = true;
        self.activity();
    }

    /// Stop hiding and leave the controls visible.
    pub fn disable(&mut self) {
        self.enabled = false;
        self.timer.cancel();
        self.set_visible(true);
    }

    /// User activity: show the controls and restart the idle countdown.
    pub fn activity(&mut self) {
        self.set_visible(true);
        if self.enabled {
            self.timer.schedule(self.hide_delay);
        }
    }

    pub async fn fired(&self) {
        self.timer.fired().await;
    }

    /// Called when the idle countdown fires.
    pub fn hide(&mut self) {
        self.timer.cancel();
        if self.enabled {
            trace!("Hiding idle controls");
            self.set_visible(false);
        }
    }

    fn set_visible(&self, visible: bool) {
        self.visible.send_if_modified(|current| {
            let changed = *current != visible;
            *current = visible;
            changed
        });
    }
}

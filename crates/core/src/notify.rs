//! Per-client notification channels keyed by session id.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub type NotificationSender = mpsc::UnboundedSender<NotificationEvent>;
pub type NotificationReceiver = mpsc::UnboundedReceiver<NotificationEvent>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum NotificationEvent {
    /// First message on every connection.
    Session { session_id: String },
    /// A chunk of worker stdout in arrival order. Chunks end at a newline
    /// or at whatever the worker had written so far. Valid UTF-8 is
    /// relayed unchanged; invalid byte sequences become U+FFFD.
    DetectionData { filename: String, data: String },
    DetectionComplete {
        filename: String,
        success: bool,
        exit_code: Option<i32>,
    },
}

/// Registry of live channels. At most one channel is registered per session
/// id; a newer registration replaces the older one.
#[derive(Debug, Default)]
pub struct NotificationHub {
    sessions: DashMap<String, NotificationSender>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: &str, sender: NotificationSender) {
        if self
            .sessions
            .insert(session_id.to_string(), sender)
            .is_some()
        {
            debug!(session_id = %session_id, "Replaced existing notification channel");
        }
    }

    /// Remove `sender`'s registration. A channel registered later under the
    /// same id is left in place.
    pub fn unregister(&self, session_id: &str, sender: &NotificationSender) {
        self.sessions
            .remove_if(session_id, |_, current| current.same_channel(sender));
    }

    /// Best-effort delivery. Returns whether the event was handed to a live
    /// channel; callers are free to ignore it.
    pub fn send(&self, session_id: &str, event: NotificationEvent) -> bool {
        let delivered = match self.sessions.get(session_id) {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        };
        if !delivered {
            trace!(session_id = %session_id, "Dropped notification for absent session");
        }
        delivered
    }

    pub fn is_registered(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

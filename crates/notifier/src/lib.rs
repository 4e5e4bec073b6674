//! Change-event fabric between configuration writers and gateway replicas.
//!
//! A notifier is a sender, a receiver, or both. Receivers surface a stream of
//! update events; an event may carry the changed config or be empty, meaning
//! "something changed, pull the store". Delivery is at-least-once and
//! consumers are expected to be idempotent (the state builder hashes).

pub mod composite;
pub mod http;
pub mod redis;
pub mod signal;

use std::sync::Arc;

use async_trait::async_trait;
use config::model::McpConfig;
use shared::error::CommonError;
use tokio::sync::mpsc;
use tracing::warn;

/// Bound on every watcher channel. A full channel drops the event; the
/// watcher converges on its next store read.
pub const WATCH_CHANNEL_CAPACITY: usize = 10;

/// An update event. `None` means the receiver should pull the store.
pub type UpdateEvent = Option<McpConfig>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierRole {
    Sender,
    Receiver,
    Both,
}

impl NotifierRole {
    pub fn can_send(&self) -> bool {
        matches!(self, NotifierRole::Sender | NotifierRole::Both)
    }

    pub fn can_receive(&self) -> bool {
        matches!(self, NotifierRole::Receiver | NotifierRole::Both)
    }
}

impl std::str::FromStr for NotifierRole {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sender" => Ok(NotifierRole::Sender),
            "receiver" => Ok(NotifierRole::Receiver),
            "both" => Ok(NotifierRole::Both),
            other => Err(CommonError::validation(format!(
                "unknown notifier role: {other}"
            ))),
        }
    }
}

#[async_trait]
pub trait NotifierLike: Send + Sync {
    fn role(&self) -> NotifierRole;

    /// Opens the event stream. Only valid for receiver-capable notifiers.
    async fn watch(&self) -> Result<mpsc::Receiver<UpdateEvent>, CommonError>;

    /// Pushes one update. Only valid for sender-capable notifiers. `None`
    /// tells receivers to pull the store.
    async fn notify_update(&self, cfg: Option<&McpConfig>) -> Result<(), CommonError>;
}

pub type Notifier = Arc<dyn NotifierLike>;

pub(crate) fn not_a_receiver() -> CommonError {
    CommonError::invalid_request("notifier is not configured as a receiver")
}

pub(crate) fn not_a_sender() -> CommonError {
    CommonError::invalid_request("notifier is not configured as a sender")
}

/// Non-blocking delivery into a watcher channel; a full channel drops the
/// event with a log line.
pub(crate) fn deliver(tx: &mpsc::Sender<UpdateEvent>, event: UpdateEvent) {
    if let Err(e) = tx.try_send(event) {
        warn!(error = %e, "watcher channel full or closed, dropping update event");
    }
}

//! Wraps N notifiers behind one. Watching fans in every receiver-capable
//! child onto a single stream; notifying invokes every sender-capable child
//! and reports the last failure without short-circuiting.

use async_trait::async_trait;
use config::model::McpConfig;
use shared::error::CommonError;
use tokio::sync::mpsc;
use tracing::warn;

use crate::{NotifierLike, Notifier, NotifierRole, UpdateEvent, WATCH_CHANNEL_CAPACITY, not_a_receiver};

pub struct CompositeNotifier {
    children: Vec<Notifier>,
}

impl CompositeNotifier {
    pub fn new(children: Vec<Notifier>) -> Self {
        Self { children }
    }
}

#[async_trait]
impl NotifierLike for CompositeNotifier {
    fn role(&self) -> NotifierRole {
        let can_send = self.children.iter().any(|c| c.role().can_send());
        let can_receive = self.children.iter().any(|c| c.role().can_receive());
        match (can_send, can_receive) {
            (true, true) => NotifierRole::Both,
            (true, false) => NotifierRole::Sender,
            _ => NotifierRole::Receiver,
        }
    }

    async fn watch(&self) -> Result<mpsc::Receiver<UpdateEvent>, CommonError> {
        let receivers: Vec<&Notifier> = self
            .children
            .iter()
            .filter(|c| c.role().can_receive())
            .collect();
        if receivers.is_empty() {
            return Err(not_a_receiver());
        }

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        for child in receivers {
            let mut child_rx = child.watch().await?;
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(event) = child_rx.recv().await {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            });
        }
        Ok(rx)
    }

    async fn notify_update(&self, cfg: Option<&McpConfig>) -> Result<(), CommonError> {
        let mut last_error = None;
        for child in self.children.iter().filter(|c| c.role().can_send()) {
            if let Err(e) = child.notify_update(cfg).await {
                warn!(error = %e, "composite child failed to deliver update");
                last_error = Some(e);
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

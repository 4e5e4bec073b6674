//! Process-signal notifier. The sender reads a PID from a file and delivers
//! SIGHUP; the receiver listens for SIGHUP and emits an empty event per
//! signal. Signals carry no payload, so the receiver always asks the gateway
//! to pull the store.

use std::path::PathBuf;

use async_trait::async_trait;
use config::model::McpConfig;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use shared::error::CommonError;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    NotifierLike, NotifierRole, UpdateEvent, WATCH_CHANNEL_CAPACITY, deliver, not_a_receiver,
    not_a_sender,
};

pub struct SignalNotifier {
    role: NotifierRole,
    pid_file: PathBuf,
}

impl SignalNotifier {
    pub fn new(role: NotifierRole, pid_file: impl Into<PathBuf>) -> Self {
        Self {
            role,
            pid_file: pid_file.into(),
        }
    }

    async fn read_pid(&self) -> Result<i32, CommonError> {
        let raw = tokio::fs::read_to_string(&self.pid_file).await.map_err(|e| {
            CommonError::Transport {
                msg: format!("cannot read pid file {}", self.pid_file.display()),
                source: Some(e.into()),
            }
        })?;
        raw.trim().parse::<i32>().map_err(|_| {
            CommonError::transport(format!(
                "pid file {} does not contain a decimal pid",
                self.pid_file.display()
            ))
        })
    }
}

#[async_trait]
impl NotifierLike for SignalNotifier {
    fn role(&self) -> NotifierRole {
        self.role
    }

    async fn watch(&self) -> Result<mpsc::Receiver<UpdateEvent>, CommonError> {
        if !self.role.can_receive() {
            return Err(not_a_receiver());
        }

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let mut hangups = signal(SignalKind::hangup())?;
        info!("listening for SIGHUP reload signals");

        tokio::spawn(async move {
            while hangups.recv().await.is_some() {
                debug!("received SIGHUP, emitting reload event");
                deliver(&tx, None);
                if tx.is_closed() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn notify_update(&self, _cfg: Option<&McpConfig>) -> Result<(), CommonError> {
        if !self.role.can_send() {
            return Err(not_a_sender());
        }

        let pid = self.read_pid().await?;
        kill(Pid::from_raw(pid), Signal::SIGHUP).map_err(|e| CommonError::Transport {
            msg: format!("failed to signal pid {pid}"),
            source: Some(anyhow::anyhow!(e)),
        })?;
        debug!(pid, "sent SIGHUP");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sender_fails_without_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = SignalNotifier::new(NotifierRole::Sender, dir.path().join("missing.pid"));
        let err = notifier.notify_update(None).await.unwrap_err();
        assert!(matches!(err, CommonError::Transport { .. }));
    }

    #[tokio::test]
    async fn sender_rejects_garbage_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.pid");
        tokio::fs::write(&path, "not-a-pid\n").await.unwrap();
        let notifier = SignalNotifier::new(NotifierRole::Sender, &path);
        assert!(notifier.notify_update(None).await.is_err());
    }

    #[tokio::test]
    async fn role_gating() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = SignalNotifier::new(NotifierRole::Receiver, dir.path().join("p"));
        assert!(receiver.notify_update(None).await.is_err());

        let sender = SignalNotifier::new(NotifierRole::Sender, dir.path().join("p"));
        assert!(sender.watch().await.is_err());
    }

    #[tokio::test]
    async fn receiver_emits_on_sighup() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("self.pid");
        tokio::fs::write(&pid_path, format!("{}\n", std::process::id()))
            .await
            .unwrap();

        let receiver = SignalNotifier::new(NotifierRole::Receiver, &pid_path);
        let mut events = receiver.watch().await.unwrap();

        let sender = SignalNotifier::new(NotifierRole::Sender, &pid_path);
        sender.notify_update(None).await.unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for SIGHUP event")
            .expect("watch channel closed");
        assert!(event.is_none());
    }
}

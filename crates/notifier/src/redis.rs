//! Redis stream notifier. The sender XADDs one entry trimmed to `MAXLEN = 1`
//! so only the latest message survives and late subscribers catch up to head
//! state. Each replica XREADs blocking from `$` independently, so every
//! replica sees each message once.

use async_trait::async_trait;
use config::model::McpConfig;
use redis::AsyncCommands;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use shared::error::CommonError;
use shared::primitives::WrappedChronoDateTime;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    NotifierLike, NotifierRole, UpdateEvent, WATCH_CHANNEL_CAPACITY, deliver, not_a_receiver,
    not_a_sender,
};

const BLOCK_MILLIS: usize = 5_000;
const RECONNECT_BACKOFF: std::time::Duration = std::time::Duration::from_secs(1);

pub struct RedisNotifier {
    role: NotifierRole,
    client: redis::Client,
    stream_key: String,
}

impl RedisNotifier {
    pub fn new(
        role: NotifierRole,
        url: &str,
        stream_key: impl Into<String>,
    ) -> Result<Self, CommonError> {
        let client = redis::Client::open(url).map_err(|e| CommonError::Transport {
            msg: format!("invalid redis url {url}"),
            source: Some(anyhow::anyhow!(e)),
        })?;
        Ok(Self {
            role,
            client,
            stream_key: stream_key.into(),
        })
    }
}

/// Stream entry payload: the config JSON (empty for pull events) plus the
/// send time.
pub(crate) fn encode_payload(cfg: Option<&McpConfig>) -> Result<Vec<(String, String)>, CommonError> {
    let config = match cfg {
        Some(cfg) => serde_json::to_string(cfg)?,
        None => String::new(),
    };
    Ok(vec![
        ("config".to_string(), config),
        (
            "timestamp".to_string(),
            WrappedChronoDateTime::now().unix_seconds().to_string(),
        ),
    ])
}

pub(crate) fn decode_payload(config_field: &str) -> UpdateEvent {
    if config_field.is_empty() {
        return None;
    }
    match serde_json::from_str::<McpConfig>(config_field) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            // Malformed payload still means something changed; fall back to a
            // pull event.
            warn!(error = %e, "undecodable redis payload, degrading to pull event");
            None
        }
    }
}

#[async_trait]
impl NotifierLike for RedisNotifier {
    fn role(&self) -> NotifierRole {
        self.role
    }

    async fn watch(&self) -> Result<mpsc::Receiver<UpdateEvent>, CommonError> {
        if !self.role.can_receive() {
            return Err(not_a_receiver());
        }

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let client = self.client.clone();
        let stream_key = self.stream_key.clone();

        tokio::spawn(async move {
            // `$` means "messages arriving after we subscribed"
            let mut last_id = "$".to_string();
            'reconnect: loop {
                if tx.is_closed() {
                    return;
                }
                let mut conn = match client.get_multiplexed_async_connection().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "redis watch connection failed, retrying");
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                        continue;
                    }
                };

                loop {
                    if tx.is_closed() {
                        return;
                    }
                    let options = StreamReadOptions::default().block(BLOCK_MILLIS).count(10);
                    let reply: StreamReadReply = match conn
                        .xread_options(&[stream_key.as_str()], &[last_id.as_str()], &options)
                        .await
                    {
                        Ok(reply) => reply,
                        Err(e) => {
                            warn!(error = %e, "redis xread failed, reconnecting");
                            tokio::time::sleep(RECONNECT_BACKOFF).await;
                            continue 'reconnect;
                        }
                    };

                    for key in reply.keys {
                        for entry in key.ids {
                            last_id = entry.id.clone();
                            let config_field: String = entry
                                .get("config")
                                .unwrap_or_default();
                            debug!(id = %entry.id, "redis reload message received");
                            deliver(&tx, decode_payload(&config_field));
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn notify_update(&self, cfg: Option<&McpConfig>) -> Result<(), CommonError> {
        if !self.role.can_send() {
            return Err(not_a_sender());
        }

        let payload = encode_payload(cfg)?;
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CommonError::Transport {
                msg: "redis connection failed".to_string(),
                source: Some(anyhow::anyhow!(e)),
            })?;

        // MAXLEN = 1: only the latest message is retained
        let _id: String = conn
            .xadd_maxlen(
                self.stream_key.as_str(),
                StreamMaxlen::Equals(1),
                "*",
                &payload,
            )
            .await
            .map_err(|e| CommonError::Transport {
                msg: "redis xadd failed".to_string(),
                source: Some(anyhow::anyhow!(e)),
            })?;
        debug!(stream = %self.stream_key, "published reload message");
        Ok(())
    }
}

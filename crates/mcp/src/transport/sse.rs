//! SSE transport: a long-lived GET stream carries server frames; requests are
//! POSTed back to the message endpoint the server advertises during its
//! handshake.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use config::model::McpServerConfig;
use futures::StreamExt;
use shared::error::CommonError;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::protocol::{
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, client_initialize_params,
    methods,
};
use crate::transport::TransportLike;

/// One parsed `event:`/`data:` frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental SSE parser. Frames are terminated by a blank line; `data:`
/// lines accumulate, `event:` names the frame, comment lines are skipped.
#[derive(Default)]
pub(crate) struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<SseFrame> {
        // CR never appears unescaped inside JSON payloads, so CRLF framing can
        // be normalized by dropping it.
        self.buffer.push_str(&chunk.replace('\r', ""));

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let raw: String = self.buffer.drain(..pos + 2).collect();
            let mut event = String::from("message");
            let mut data_lines: Vec<&str> = Vec::new();

            for line in raw.lines() {
                if let Some(rest) = line.strip_prefix("event:") {
                    event = rest.trim().to_string();
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
                } else if line.starts_with(':') || line.is_empty() {
                    // comment / separator
                }
            }

            if !data_lines.is_empty() {
                frames.push(SseFrame {
                    event,
                    data: data_lines.join("\n"),
                });
            }
        }
        frames
    }
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>>;

struct SseSession {
    message_url: String,
    reader: tokio::task::JoinHandle<()>,
}

pub struct SseTransport {
    config: McpServerConfig,
    call_timeout: Duration,
    client: reqwest::Client,
    state: Mutex<Option<SseSession>>,
    pending: Pending,
    running: Arc<AtomicBool>,
    needs_restart: Arc<AtomicBool>,
    next_id: AtomicU64,
}

impl SseTransport {
    pub fn new(config: McpServerConfig, call_timeout: Duration) -> Self {
        Self {
            config,
            call_timeout,
            client: reqwest::Client::new(),
            state: Mutex::new(None),
            pending: Pending::default(),
            running: Arc::new(AtomicBool::new(false)),
            needs_restart: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(1),
        }
    }

    async fn start_locked(&self, state: &mut Option<SseSession>) -> Result<(), CommonError> {
        if let Some(stale) = state.take() {
            stale.reader.abort();
        }
        self.pending.lock().await.clear();

        let mut request = self
            .client
            .get(&self.config.url)
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache");
        for (key, value) in &self.config.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| CommonError::Transport {
            msg: format!("failed to open sse stream at {}", self.config.url),
            source: Some(e.into()),
        })?;
        if !response.status().is_success() {
            return Err(CommonError::transport(format!(
                "sse endpoint {} returned {}",
                self.config.url,
                response.status()
            )));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        let mut endpoint_tx = Some(endpoint_tx);
        let pending = self.pending.clone();
        let running = self.running.clone();
        let needs_restart = self.needs_restart.clone();
        let server = self.config.name.clone();

        let reader = tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut parser = SseParser::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(server = %server, error = %e, "sse stream read failed");
                        break;
                    }
                };
                for frame in parser.feed(&String::from_utf8_lossy(&chunk)) {
                    match frame.event.as_str() {
                        "endpoint" => {
                            if let Some(tx) = endpoint_tx.take() {
                                let _ = tx.send(frame.data);
                            }
                        }
                        _ => match serde_json::from_str::<JsonRpcMessage>(&frame.data) {
                            Ok(JsonRpcMessage::Response(response)) => {
                                if let Some(key) = super::id_key(&response.id) {
                                    if let Some(tx) = pending.lock().await.remove(&key) {
                                        let _ = tx.send(response);
                                    }
                                }
                            }
                            Ok(JsonRpcMessage::Notification(n)) => {
                                trace!(server = %server, method = %n.method, "upstream notification");
                            }
                            Ok(JsonRpcMessage::Request(_)) => {}
                            Err(e) => {
                                warn!(server = %server, error = %e, "unparsable sse frame");
                            }
                        },
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
            needs_restart.store(true, Ordering::SeqCst);
            pending.lock().await.clear();
        });

        // The server must advertise the message endpoint before we can talk
        let endpoint =
            match tokio::time::timeout(self.call_timeout, endpoint_rx).await {
                Ok(Ok(endpoint)) => endpoint,
                Ok(Err(_)) => {
                    reader.abort();
                    return Err(CommonError::transport("sse stream closed before endpoint event"));
                }
                Err(_) => {
                    reader.abort();
                    return Err(CommonError::timeout("timed out waiting for sse endpoint event"));
                }
            };

        let message_url = url::Url::parse(&self.config.url)?
            .join(&endpoint)
            .map(|u| u.to_string())
            .unwrap_or(endpoint);

        self.needs_restart.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        *state = Some(SseSession {
            message_url: message_url.clone(),
            reader,
        });

        let handshake = async {
            self.send_request_raw(&message_url, methods::INITIALIZE, client_initialize_params())
                .await?;
            self.send_notification_raw(&message_url, methods::INITIALIZED)
                .await
        };
        if let Err(e) = handshake.await {
            self.running.store(false, Ordering::SeqCst);
            if let Some(session) = state.take() {
                session.reader.abort();
            }
            return Err(e);
        }

        debug!(server = %self.config.name, %message_url, "sse transport started");
        Ok(())
    }

    async fn send_request_raw(
        &self,
        message_url: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, CommonError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(serde_json::json!(id), method, params);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.to_string(), tx);

        let mut post = self.client.post(message_url).json(&request);
        for (key, value) in &self.config.headers {
            post = post.header(key.as_str(), value.as_str());
        }
        let response = match post.send().await {
            Ok(response) => response,
            Err(e) => {
                self.pending.lock().await.remove(&id.to_string());
                return Err(e.into());
            }
        };
        if !response.status().is_success() {
            self.pending.lock().await.remove(&id.to_string());
            return Err(CommonError::transport(format!(
                "message endpoint returned {}",
                response.status()
            )));
        }

        // The response travels back on the event stream
        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => Err(CommonError::transport("sse stream dropped")),
            Err(_) => {
                self.pending.lock().await.remove(&id.to_string());
                Err(CommonError::timeout(format!(
                    "{method} timed out after {:?}",
                    self.call_timeout
                )))
            }
        }
    }

    async fn send_notification_raw(
        &self,
        message_url: &str,
        method: &str,
    ) -> Result<(), CommonError> {
        let notification = JsonRpcNotification::new(method, serde_json::Value::Null);
        let mut post = self.client.post(message_url).json(&notification);
        for (key, value) in &self.config.headers {
            post = post.header(key.as_str(), value.as_str());
        }
        let response = post.send().await?;
        if !response.status().is_success() {
            return Err(CommonError::transport(format!(
                "message endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TransportLike for SseTransport {
    async fn start(&self) -> Result<(), CommonError> {
        let mut state = self.state.lock().await;
        if state.is_some() && self.running() && !self.needs_restart.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.start_locked(&mut state).await
    }

    async fn stop(&self) -> Result<(), CommonError> {
        let mut state = self.state.lock().await;
        self.running.store(false, Ordering::SeqCst);
        if let Some(session) = state.take() {
            session.reader.abort();
        }
        self.pending.lock().await.clear();
        Ok(())
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, CommonError> {
        self.start().await?;

        let message_url = {
            let state = self.state.lock().await;
            state
                .as_ref()
                .map(|s| s.message_url.clone())
                .ok_or_else(|| CommonError::transport("sse transport not started"))?
        };

        let result = self.send_request_raw(&message_url, method, params).await;
        if let Err(e) = &result {
            if e.is_transient() {
                self.needs_restart.store(true, Ordering::SeqCst);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_and_data_frames() {
        let mut parser = SseParser::new();
        let frames = parser.feed(
            "event: endpoint\ndata: /h1/message?sessionId=abc\n\nevent: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n",
        );
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event, "endpoint");
        assert_eq!(frames[0].data, "/h1/message?sessionId=abc");
        assert_eq!(frames[1].event, "message");
    }

    #[test]
    fn reassembles_split_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed("event: mess").is_empty());
        assert!(parser.feed("age\ndata: {\"a\"").is_empty());
        let frames = parser.feed(": 1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"a\": 1}");
    }

    #[test]
    fn multiline_data_joins_with_newline() {
        let mut parser = SseParser::new();
        let frames = parser.feed("data: line one\ndata: line two\n\n");
        assert_eq!(frames[0].data, "line one\nline two");
        assert_eq!(frames[0].event, "message");
    }

    #[test]
    fn crlf_framing_and_comments() {
        let mut parser = SseParser::new();
        let frames = parser.feed(": keepalive\r\n\r\ndata: x\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "x");
    }
}

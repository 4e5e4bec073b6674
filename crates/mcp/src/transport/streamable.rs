//! Streamable-HTTP transport: one POST per request. The server answers with
//! a single JSON body or with an SSE stream consumed within the same
//! response. A session id handed out on initialize is echoed on every
//! subsequent request.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use config::model::McpServerConfig;
use shared::error::CommonError;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::protocol::{
    JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, client_initialize_params, methods,
};
use crate::transport::TransportLike;

use super::sse::SseParser;

const SESSION_HEADER: &str = "Mcp-Session-Id";

pub struct StreamableHttpTransport {
    config: McpServerConfig,
    call_timeout: Duration,
    client: reqwest::Client,
    /// Session id from the initialize exchange; also the start once-guard.
    session: Mutex<Option<String>>,
    running: AtomicBool,
    needs_restart: AtomicBool,
    next_id: AtomicU64,
}

impl StreamableHttpTransport {
    pub fn new(config: McpServerConfig, call_timeout: Duration) -> Self {
        Self {
            config,
            call_timeout,
            client: reqwest::Client::new(),
            session: Mutex::new(None),
            running: AtomicBool::new(false),
            needs_restart: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    async fn post_request(
        &self,
        request: &JsonRpcRequest,
        session_id: Option<&str>,
    ) -> Result<(JsonRpcResponse, Option<String>), CommonError> {
        let mut post = self
            .client
            .post(&self.config.url)
            .header("Accept", "application/json, text/event-stream")
            .json(request);
        for (key, value) in &self.config.headers {
            post = post.header(key.as_str(), value.as_str());
        }
        if let Some(session_id) = session_id {
            post = post.header(SESSION_HEADER, session_id);
        }

        let response = tokio::time::timeout(self.call_timeout, post.send())
            .await
            .map_err(|_| {
                CommonError::timeout(format!(
                    "{} timed out after {:?}",
                    request.method, self.call_timeout
                ))
            })??;

        if !response.status().is_success() {
            return Err(CommonError::transport(format!(
                "upstream {} returned {}",
                self.config.url,
                response.status()
            )));
        }

        let granted_session = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let body = tokio::time::timeout(self.call_timeout, response.text())
            .await
            .map_err(|_| CommonError::timeout("timed out reading upstream response body"))??;

        let rpc_response = if content_type.starts_with("text/event-stream") {
            extract_response(&body, &request.id)?
        } else {
            serde_json::from_str::<JsonRpcResponse>(&body).map_err(|e| {
                CommonError::Protocol {
                    msg: "upstream response is not a json-rpc frame".to_string(),
                    source: Some(e.into()),
                }
            })?
        };

        Ok((rpc_response, granted_session))
    }

    async fn start_locked(&self, session: &mut Option<String>) -> Result<(), CommonError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(
            serde_json::json!(id),
            methods::INITIALIZE,
            client_initialize_params(),
        );
        let (response, granted_session) = self.post_request(&request, None).await?;
        response.into_result()?;

        *session = granted_session.clone();
        self.needs_restart.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        // Initialized notification; servers without session state may not
        // care, failures are non-fatal
        let notification = serde_json::json!({
            "jsonrpc": crate::protocol::JSONRPC_VERSION,
            "method": methods::INITIALIZED,
        });
        let mut post = self.client.post(&self.config.url).json(&notification);
        for (key, value) in &self.config.headers {
            post = post.header(key.as_str(), value.as_str());
        }
        if let Some(session_id) = granted_session.as_deref() {
            post = post.header(SESSION_HEADER, session_id);
        }
        if let Err(e) = post.send().await {
            warn!(server = %self.config.name, error = %e, "initialized notification failed");
        }

        debug!(server = %self.config.name, url = %self.config.url, "streamable-http transport started");
        Ok(())
    }
}

/// Drains an SSE body and returns the response frame matching the request id.
fn extract_response(
    body: &str,
    id: &serde_json::Value,
) -> Result<JsonRpcResponse, CommonError> {
    let mut parser = SseParser::new();
    // Bodies are not always newline-terminated; close the last frame
    let mut text = body.to_string();
    if !text.ends_with("\n\n") {
        text.push_str("\n\n");
    }

    let want = super::id_key(id);
    for frame in parser.feed(&text) {
        match serde_json::from_str::<JsonRpcMessage>(&frame.data) {
            Ok(JsonRpcMessage::Response(response)) if super::id_key(&response.id) == want => {
                return Ok(response);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "skipping unparsable frame in streamed response");
            }
        }
    }
    Err(CommonError::protocol(
        "streamed response ended without a matching frame",
    ))
}

#[async_trait]
impl TransportLike for StreamableHttpTransport {
    async fn start(&self) -> Result<(), CommonError> {
        let mut session = self.session.lock().await;
        if self.running() && !self.needs_restart.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.start_locked(&mut session).await
    }

    async fn stop(&self) -> Result<(), CommonError> {
        let mut session = self.session.lock().await;
        self.running.store(false, Ordering::SeqCst);
        *session = None;
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
        let session_id = self.session.lock().await.clone();

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(serde_json::json!(id), method, params);

        let result = self
            .post_request(&request, session_id.as_deref())
            .await
            .and_then(|(response, _)| response.into_result());

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
    fn extracts_matching_frame_from_streamed_body() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":5,\"result\":{\"ok\":true}}\n\n";
        let response = extract_response(body, &serde_json::json!(5)).unwrap();
        assert_eq!(response.result.unwrap()["ok"], true);
    }

    #[test]
    fn skips_notifications_before_the_response() {
        let body = concat!(
            "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{}}\n\n",
        );
        let response = extract_response(body, &serde_json::json!(2)).unwrap();
        assert!(response.result.is_some());
    }

    #[test]
    fn handles_missing_trailing_separator() {
        let body = "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}";
        assert!(extract_response(body, &serde_json::json!(1)).is_ok());
    }

    #[test]
    fn missing_frame_is_a_protocol_error() {
        let body = "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n";
        let err = extract_response(body, &serde_json::json!(9)).unwrap_err();
        assert!(matches!(err, CommonError::Protocol { .. }));
    }
}

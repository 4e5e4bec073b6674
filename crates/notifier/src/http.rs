//! HTTP callback notifier. The receiver runs its own listener exposing
//! `POST /_reload`; the sender POSTs to a peer's reload endpoint. An empty
//! body is a pull-the-store event, a JSON body carries the changed config,
//! anything else is a 400.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::post,
};
use config::model::McpConfig;
use shared::error::CommonError;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::{
    NotifierLike, NotifierRole, UpdateEvent, WATCH_CHANNEL_CAPACITY, deliver, not_a_receiver,
    not_a_sender,
};

pub const RELOAD_PATH: &str = "/_reload";

type Watchers = Arc<Mutex<Vec<mpsc::Sender<UpdateEvent>>>>;

pub struct HttpNotifier {
    role: NotifierRole,
    /// Bind address for the receiver's reload listener.
    listen_addr: Option<SocketAddr>,
    /// Peer endpoint the sender posts to.
    target_url: String,
    client: reqwest::Client,
    watchers: Watchers,
    listener_started: Mutex<bool>,
}

impl HttpNotifier {
    pub fn new(
        role: NotifierRole,
        listen_addr: Option<SocketAddr>,
        target_url: impl Into<String>,
    ) -> Self {
        Self {
            role,
            listen_addr,
            target_url: target_url.into(),
            client: reqwest::Client::new(),
            watchers: Watchers::default(),
            listener_started: Mutex::new(false),
        }
    }

    async fn ensure_listener(&self) -> Result<(), CommonError> {
        let mut started = self.listener_started.lock().await;
        if *started {
            return Ok(());
        }
        let addr = self.listen_addr.ok_or_else(|| {
            CommonError::validation("http notifier receiver requires a listen address")
        })?;

        let app = reload_router(self.watchers.clone());
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "reload callback listener started");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(error = %e, "reload callback listener terminated");
            }
        });

        *started = true;
        Ok(())
    }
}

/// Normalizes a peer URL by appending `/_reload` when it is missing.
pub fn normalize_target(url: &str) -> String {
    if url.ends_with(RELOAD_PATH) {
        url.to_string()
    } else {
        format!("{}{}", url.trim_end_matches('/'), RELOAD_PATH)
    }
}

pub(crate) fn reload_router(watchers: Watchers) -> Router {
    Router::new()
        .route(RELOAD_PATH, post(handle_reload))
        .with_state(watchers)
}

async fn handle_reload(State(watchers): State<Watchers>, body: Bytes) -> StatusCode {
    let event = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice::<McpConfig>(&body) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                warn!(error = %e, "reload callback body is not a config document");
                return StatusCode::BAD_REQUEST;
            }
        }
    };

    debug!(carries_config = event.is_some(), "reload callback received");
    let mut watchers = watchers.lock().await;
    watchers.retain(|tx| !tx.is_closed());
    for tx in watchers.iter() {
        deliver(tx, event.clone());
    }
    StatusCode::OK
}

#[async_trait]
impl NotifierLike for HttpNotifier {
    fn role(&self) -> NotifierRole {
        self.role
    }

    async fn watch(&self) -> Result<mpsc::Receiver<UpdateEvent>, CommonError> {
        if !self.role.can_receive() {
            return Err(not_a_receiver());
        }
        self.ensure_listener().await?;

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        self.watchers.lock().await.push(tx);
        Ok(rx)
    }

    async fn notify_update(&self, cfg: Option<&McpConfig>) -> Result<(), CommonError> {
        if !self.role.can_send() {
            return Err(not_a_sender());
        }

        let url = normalize_target(&self.target_url);
        let request = match cfg {
            Some(cfg) => self.client.post(&url).json(cfg),
            None => self.client.post(&url),
        };
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(CommonError::transport(format!(
                "reload callback to {url} returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use http::Request;
    use tower::ServiceExt;

    use super::*;

    #[test]
    fn target_normalization() {
        assert_eq!(
            normalize_target("http://peer:5235"),
            "http://peer:5235/_reload"
        );
        assert_eq!(
            normalize_target("http://peer:5235/"),
            "http://peer:5235/_reload"
        );
        assert_eq!(
            normalize_target("http://peer:5235/_reload"),
            "http://peer:5235/_reload"
        );
    }

    async fn post_reload(watchers: Watchers, body: &str) -> StatusCode {
        let app = reload_router(watchers);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(RELOAD_PATH)
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        response.status()
    }

    #[tokio::test]
    async fn empty_body_is_a_pull_event() {
        let watchers = Watchers::default();
        let (tx, mut rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        watchers.lock().await.push(tx);

        assert_eq!(post_reload(watchers, "").await, StatusCode::OK);
        assert_eq!(rx.recv().await, Some(None));
    }

    #[tokio::test]
    async fn json_body_carries_the_config() {
        let watchers = Watchers::default();
        let (tx, mut rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        watchers.lock().await.push(tx);

        let status = post_reload(watchers, r#"{"name": "gw", "tenant": "default"}"#).await;
        assert_eq!(status, StatusCode::OK);

        let event = rx.recv().await.unwrap().expect("expected a config payload");
        assert_eq!(event.name, "gw");
    }

    #[tokio::test]
    async fn junk_body_is_rejected() {
        let watchers = Watchers::default();
        let (tx, mut rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        watchers.lock().await.push(tx);

        let status = post_reload(watchers, "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(rx.try_recv().is_err());
    }
}

//! SSE session lifecycle.
//!
//! A session captures the runtime snapshot it was opened against and keeps
//! serving from it until the client disconnects or a later snapshot drops its
//! prefix. Each session runs one worker task over a bounded request queue, so
//! responses leave in arrival order.

use std::sync::Arc;

use dashmap::DashMap;
use mcp::protocol::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RpcError, methods,
};
use parking_lot::Mutex;
use shared::{error::CommonError, primitives::WrappedChronoDateTime};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::state::{RuntimeState, RuntimeUnit};
use crate::template::RequestContext;

/// Bound on the per-session request queue.
const REQUEST_QUEUE_CAPACITY: usize = 32;
/// Bound on the outgoing frame channel.
const FRAME_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connected,
    Initialized,
    Active,
    Closed,
}

/// One outgoing SSE frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionFrame {
    pub event: &'static str,
    pub data: String,
}

impl SessionFrame {
    pub fn endpoint(data: String) -> Self {
        Self {
            event: "endpoint",
            data,
        }
    }

    pub fn message(data: String) -> Self {
        Self {
            event: "message",
            data,
        }
    }
}

pub enum SessionInbound {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
}

pub struct Session {
    pub id: String,
    pub prefix: String,
    pub created_at: WrappedChronoDateTime,
    pub last_active: Mutex<WrappedChronoDateTime>,
    /// Snapshot captured at open; later snapshot swaps do not affect it.
    pub state: Arc<RuntimeState>,
    pub unit: Arc<RuntimeUnit>,
    pub request_meta: RequestContext,
    status: Mutex<SessionStatus>,
    frame_tx: mpsc::Sender<SessionFrame>,
    request_tx: mpsc::Sender<SessionInbound>,
}

impl Session {
    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    fn set_status(&self, status: SessionStatus) {
        *self.status.lock() = status;
    }

    pub async fn enqueue(&self, inbound: SessionInbound) -> Result<(), CommonError> {
        if self.status() == SessionStatus::Closed {
            return Err(CommonError::invalid_request("session is closed"));
        }
        *self.last_active.lock() = WrappedChronoDateTime::now();
        self.request_tx
            .send(inbound)
            .await
            .map_err(|_| CommonError::invalid_request("session worker is gone"))
    }
}

pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    dispatcher: Arc<Dispatcher>,
}

impl SessionManager {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            sessions: DashMap::new(),
            dispatcher,
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Opens a session against the captured snapshot and returns it together
    /// with its outgoing frame stream. The first frame is the message
    /// endpoint advertisement.
    pub async fn open(
        &self,
        prefix: &str,
        state: Arc<RuntimeState>,
        unit: Arc<RuntimeUnit>,
        request_meta: RequestContext,
    ) -> (Arc<Session>, mpsc::Receiver<SessionFrame>) {
        let id = uuid::Uuid::new_v4().to_string();
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);

        let session = Arc::new(Session {
            id: id.clone(),
            prefix: prefix.to_string(),
            created_at: WrappedChronoDateTime::now(),
            last_active: Mutex::new(WrappedChronoDateTime::now()),
            state,
            unit,
            request_meta,
            status: Mutex::new(SessionStatus::Connected),
            frame_tx: frame_tx.clone(),
            request_tx,
        });

        let endpoint = format!("{prefix}/message?sessionId={id}");
        let _ = frame_tx.send(SessionFrame::endpoint(endpoint)).await;

        self.sessions.insert(id.clone(), session.clone());
        self.spawn_worker(session.clone(), request_rx);
        debug!(session = %id, prefix, "session opened");

        (session, frame_rx)
    }

    fn spawn_worker(&self, session: Arc<Session>, mut request_rx: mpsc::Receiver<SessionInbound>) {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            while let Some(inbound) = request_rx.recv().await {
                match inbound {
                    SessionInbound::Notification(notification) => {
                        if notification.method == methods::INITIALIZED
                            && session.status() == SessionStatus::Initialized
                        {
                            session.set_status(SessionStatus::Active);
                        }
                    }
                    SessionInbound::Request(request) => {
                        let response = Self::handle_request(&dispatcher, &session, request).await;
                        let frame = match serde_json::to_string(&response) {
                            Ok(data) => SessionFrame::message(data),
                            Err(e) => {
                                warn!(session = %session.id, error = %e, "response serialization failed");
                                continue;
                            }
                        };
                        if session.frame_tx.send(frame).await.is_err() {
                            // Client is gone
                            break;
                        }
                    }
                }
            }
            session.set_status(SessionStatus::Closed);
        });
    }

    async fn handle_request(
        dispatcher: &Dispatcher,
        session: &Session,
        request: JsonRpcRequest,
    ) -> JsonRpcResponse {
        if request.method == methods::INITIALIZE {
            let response = dispatcher
                .dispatch_request(&session.unit, &session.request_meta, &request)
                .await;
            if response.error.is_none() && session.status() == SessionStatus::Connected {
                session.set_status(SessionStatus::Initialized);
            }
            return response;
        }

        // Everything else requires a completed initialize
        if session.status() == SessionStatus::Connected {
            return JsonRpcResponse::error(
                request.id,
                RpcError::invalid_request("session not initialized"),
            );
        }

        dispatcher
            .dispatch_request(&session.unit, &session.request_meta, &request)
            .await
    }

    /// Drops a session, e.g. when the SSE stream is torn down.
    pub fn close(&self, id: &str) {
        if let Some((_, session)) = self.sessions.remove(id) {
            session.set_status(SessionStatus::Closed);
            debug!(session = %id, "session closed");
        }
    }

    /// After a snapshot swap: sessions whose prefix vanished get a terminal
    /// error frame and are dropped; surviving sessions keep their captured
    /// snapshot.
    pub async fn close_orphaned(&self, next: &RuntimeState) {
        let orphaned: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| !next.units.contains_key(&entry.prefix))
            .map(|entry| entry.clone())
            .collect();

        for session in orphaned {
            info!(session = %session.id, prefix = %session.prefix, "closing session, prefix removed");
            let farewell = JsonRpcResponse::error(
                serde_json::Value::Null,
                RpcError::invalid_request("prefix removed from configuration; session closed"),
            );
            if let Ok(data) = serde_json::to_string(&farewell) {
                let _ = session.frame_tx.send(SessionFrame::message(data)).await;
            }
            self.close(&session.id);
        }
    }
}

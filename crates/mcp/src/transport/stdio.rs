//! Stdio transport: spawns the configured command and frames JSON-RPC
//! messages over stdin/stdout, one message per line.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use config::model::McpServerConfig;
use shared::error::CommonError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::protocol::{
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, client_initialize_params,
    methods,
};
use crate::transport::TransportLike;

/// How long stop() waits for the child to exit after stdin closes.
const STOP_GRACE: Duration = Duration::from_secs(3);

use super::id_key;

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>>;

struct ProcessHandle {
    child: Child,
    stdin_tx: mpsc::Sender<String>,
}

pub struct StdioTransport {
    config: McpServerConfig,
    call_timeout: Duration,
    /// Holds the live child; doubles as the single-flight start guard.
    state: Mutex<Option<ProcessHandle>>,
    pending: Pending,
    running: Arc<AtomicBool>,
    needs_restart: Arc<AtomicBool>,
    next_id: AtomicU64,
}

impl StdioTransport {
    pub fn new(config: McpServerConfig, call_timeout: Duration) -> Self {
        Self {
            config,
            call_timeout,
            state: Mutex::new(None),
            pending: Pending::default(),
            running: Arc::new(AtomicBool::new(false)),
            needs_restart: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(1),
        }
    }

    fn spawn_reader(&self, stdout: tokio::process::ChildStdout) {
        let pending = self.pending.clone();
        let running = self.running.clone();
        let needs_restart = self.needs_restart.clone();
        let server = self.config.name.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcMessage>(line) {
                            Ok(JsonRpcMessage::Response(response)) => {
                                if let Some(key) = id_key(&response.id) {
                                    if let Some(tx) = pending.lock().await.remove(&key) {
                                        let _ = tx.send(response);
                                    }
                                }
                            }
                            Ok(JsonRpcMessage::Notification(n)) => {
                                trace!(server = %server, method = %n.method, "upstream notification");
                            }
                            Ok(JsonRpcMessage::Request(r)) => {
                                debug!(server = %server, method = %r.method, "ignoring server-initiated request");
                            }
                            Err(e) => {
                                warn!(server = %server, error = %e, "unparsable frame from upstream");
                            }
                        }
                    }
                    Ok(None) => {
                        debug!(server = %server, "upstream process closed stdout");
                        break;
                    }
                    Err(e) => {
                        warn!(server = %server, error = %e, "upstream stdout read failed");
                        break;
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
            needs_restart.store(true, Ordering::SeqCst);
            pending.lock().await.clear();
        });
    }

    fn spawn_writer(
        &self,
        mut stdin: tokio::process::ChildStdin,
        mut message_rx: mpsc::Receiver<String>,
    ) {
        let running = self.running.clone();
        let needs_restart = self.needs_restart.clone();
        let server = self.config.name.clone();

        tokio::spawn(async move {
            while let Some(message) = message_rx.recv().await {
                let framed = format!("{message}\n");
                if let Err(e) = stdin.write_all(framed.as_bytes()).await {
                    warn!(server = %server, error = %e, "upstream stdin write failed");
                    running.store(false, Ordering::SeqCst);
                    needs_restart.store(true, Ordering::SeqCst);
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    warn!(server = %server, error = %e, "upstream stdin flush failed");
                    running.store(false, Ordering::SeqCst);
                    needs_restart.store(true, Ordering::SeqCst);
                    break;
                }
            }
            // Dropping stdin signals EOF to the child
        });
    }

    fn spawn_stderr_drain(&self, stderr: tokio::process::ChildStderr) {
        let server = self.config.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(server = %server, "upstream stderr: {line}");
            }
        });
    }

    async fn start_locked(
        &self,
        state: &mut Option<ProcessHandle>,
    ) -> Result<(), CommonError> {
        if let Some(stale) = state.take() {
            self.shutdown_handle(stale).await;
        }
        self.pending.lock().await.clear();

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CommonError::Transport {
                msg: format!("failed to spawn {}", self.config.command),
                source: Some(e.into()),
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CommonError::transport("child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CommonError::transport("child stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CommonError::transport("child stderr unavailable"))?;

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(64);
        self.spawn_reader(stdout);
        self.spawn_writer(stdin, stdin_rx);
        self.spawn_stderr_drain(stderr);

        self.needs_restart.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        *state = Some(ProcessHandle {
            child,
            stdin_tx: stdin_tx.clone(),
        });

        // MCP handshake before the transport serves calls
        let handshake = async {
            self.send_request_raw(&stdin_tx, methods::INITIALIZE, client_initialize_params())
                .await?;
            self.send_notification_raw(&stdin_tx, methods::INITIALIZED)
                .await
        };
        if let Err(e) = handshake.await {
            self.running.store(false, Ordering::SeqCst);
            if let Some(handle) = state.take() {
                self.shutdown_handle(handle).await;
            }
            return Err(e);
        }

        debug!(server = %self.config.name, command = %self.config.command, "stdio transport started");
        Ok(())
    }

    async fn shutdown_handle(&self, handle: ProcessHandle) {
        let ProcessHandle { mut child, stdin_tx } = handle;
        // Closing the writer channel drains and closes stdin
        drop(stdin_tx);
        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(server = %self.config.name, %status, "upstream process exited");
            }
            Ok(Err(e)) => {
                warn!(server = %self.config.name, error = %e, "waiting for upstream process failed");
            }
            Err(_) => {
                warn!(server = %self.config.name, "upstream process did not exit in time, killing");
                let _ = child.kill().await;
            }
        }
    }

    async fn send_request_raw(
        &self,
        stdin_tx: &mpsc::Sender<String>,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, CommonError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(serde_json::json!(id), method, params);
        let line = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.to_string(), tx);

        if stdin_tx.send(line).await.is_err() {
            self.pending.lock().await.remove(&id.to_string());
            return Err(CommonError::transport("upstream stdin channel closed"));
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => Err(CommonError::transport("upstream connection dropped")),
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
        stdin_tx: &mpsc::Sender<String>,
        method: &str,
    ) -> Result<(), CommonError> {
        let notification = JsonRpcNotification::new(method, serde_json::Value::Null);
        let line = serde_json::to_string(&notification)?;
        stdin_tx
            .send(line)
            .await
            .map_err(|_| CommonError::transport("upstream stdin channel closed"))
    }
}

#[async_trait]
impl TransportLike for StdioTransport {
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
        if let Some(handle) = state.take() {
            self.shutdown_handle(handle).await;
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

        let stdin_tx = {
            let state = self.state.lock().await;
            state
                .as_ref()
                .map(|h| h.stdin_tx.clone())
                .ok_or_else(|| CommonError::transport("stdio transport not started"))?
        };

        let result = self.send_request_raw(&stdin_tx, method, params).await;
        if let Err(e) = &result {
            if e.is_transient() {
                self.needs_restart.store(true, Ordering::SeqCst);
            }
        }
        result
    }
}

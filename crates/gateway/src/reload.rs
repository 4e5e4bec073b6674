//! Reload pipeline: watch the notifier, pull the store, merge, rebuild,
//! install. Installation is a single atomic pointer store; in-flight sessions
//! keep their captured snapshot and only sessions whose prefix disappeared
//! are closed. Failed builds keep the previous snapshot.

use std::sync::Arc;
use std::time::Duration;

use config::merge_configs;
use notifier::Notifier;
use shared::error::CommonError;
use store::ConfigStore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::session::SessionManager;
use crate::state::{RuntimeState, StateRef, build_state, stop_removed_transports};

pub struct ReloadCoordinator {
    store: ConfigStore,
    state: StateRef,
    sessions: Arc<SessionManager>,
    call_timeout: Duration,
    /// Upper bound on one rebuild; on overrun the previous snapshot stays.
    build_timeout: Duration,
}

impl ReloadCoordinator {
    pub fn new(
        store: ConfigStore,
        state: StateRef,
        sessions: Arc<SessionManager>,
        call_timeout: Duration,
        build_timeout: Duration,
    ) -> Self {
        Self {
            store,
            state,
            sessions,
            call_timeout,
            build_timeout,
        }
    }

    pub fn state(&self) -> &StateRef {
        &self.state
    }

    /// One full reload cycle. Also used for the initial load.
    pub async fn reload(&self) -> Result<(), CommonError> {
        let previous = self.state.load_full();

        let next = tokio::time::timeout(self.build_timeout, async {
            let configs = self.store.list(false).await?;
            let effective = merge_configs(&configs);
            build_state(&effective, Some(previous.as_ref()), self.call_timeout)
        })
        .await
        .map_err(|_| {
            CommonError::timeout(format!(
                "state rebuild exceeded {:?}, keeping previous snapshot",
                self.build_timeout
            ))
        })??;

        self.install(next, &previous).await;
        Ok(())
    }

    async fn install(&self, next: RuntimeState, previous: &Arc<RuntimeState>) {
        let next = Arc::new(next);
        // Atomic publish; readers never observe a torn snapshot
        self.state.store(next.clone());
        self.sessions.close_orphaned(&next).await;
        stop_removed_transports(previous, &next);
        info!(
            prefixes = next.units.len(),
            tools = next.metrics.total_tools,
            "snapshot installed"
        );
    }

    /// Runs until shutdown: one reload per notifier event. Events carrying a
    /// config are treated the same as empty ones; the store is the source of
    /// truth and rebuilds are idempotent by content hash.
    pub async fn run(&self, notifier: Notifier, shutdown: CancellationToken) {
        let mut events = match notifier.watch().await {
            Ok(events) => events,
            Err(e) => {
                error!(error = %e, "notifier watch failed, hot reload disabled");
                shutdown.cancelled().await;
                return;
            }
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("reload loop stopped");
                    return;
                }
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            info!(carries_config = event.is_some(), "reload event received");
                            if let Err(e) = self.reload().await {
                                warn!(error = %e, "reload failed, previous snapshot retained");
                            }
                        }
                        None => {
                            warn!("notifier stream closed, hot reload disabled");
                            shutdown.cancelled().await;
                            return;
                        }
                    }
                }
            }
        }
    }
}

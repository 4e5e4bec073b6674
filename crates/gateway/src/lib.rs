//! Gateway core: compiled runtime snapshots, the MCP front-end, the template
//! pipeline and the reload machinery.

pub mod capability;
pub mod dispatch;
pub mod reload;
pub mod response;
pub mod router;
pub mod session;
pub mod state;
pub mod template;

use std::sync::Arc;
use std::time::Duration;

use capability::CapabilityCache;
use dispatch::Dispatcher;
use router::GatewayService;
use session::SessionManager;
use state::{StateRef, new_state_ref};

/// Tunables for one gateway instance.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Default per-call timeout for HTTP tools and upstream proxy calls.
    pub call_timeout: Duration,
    /// Upper bound on one snapshot rebuild.
    pub build_timeout: Duration,
    pub capability_ttl: Duration,
    pub capability_max_entries: usize,
    /// Inbound header names copied onto outgoing HTTP tool requests.
    pub forward_headers: Vec<String>,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            call_timeout: mcp::transport::DEFAULT_CALL_TIMEOUT,
            build_timeout: Duration::from_secs(30),
            capability_ttl: capability::DEFAULT_TTL,
            capability_max_entries: capability::DEFAULT_MAX_ENTRIES,
            forward_headers: Vec::new(),
        }
    }
}

/// Wires the shared pieces of a gateway process together.
pub fn build_service(options: &GatewayOptions) -> (GatewayService, StateRef, Arc<CapabilityCache>) {
    let state = new_state_ref();
    let capabilities = Arc::new(CapabilityCache::new(
        options.capability_ttl,
        options.capability_max_entries,
    ));
    let dispatcher = Arc::new(Dispatcher::with_forward_headers(
        options.call_timeout,
        capabilities.clone(),
        options.forward_headers.clone(),
    ));
    let sessions = Arc::new(SessionManager::new(dispatcher.clone()));
    let service = GatewayService {
        state: state.clone(),
        sessions,
        dispatcher,
    };
    (service, state, capabilities)
}

//! Peer-to-peer synchronization of location reports.
//!
//! - [`transport`]: the network seam ([`PeerTransport`]) and its page types
//! - [`http`]: the reqwest-backed transport used in production
//! - [`peer`]: one pull + push exchange with one peer ([`PeerSyncer`])
//! - [`orchestrator`]: cycles over all peers, on a timer or on demand ([`SyncEngine`])

pub mod http;
pub mod orchestrator;
pub mod peer;
pub mod transport;

#[cfg(test)]
pub(crate) mod loopback;

pub use http::HttpTransport;
pub use orchestrator::{CycleReport, EngineSettings, EngineStatus, PeerError, SyncEngine};
pub use peer::{PeerSyncResult, PeerSyncSettings, PeerSyncer};
pub use transport::{PeerTransport, PullPage, PullQuery, PushAck, MAX_PAGE_SIZE};

use std::sync::Arc;

use crate::config::{Config, SyncConfig};
use crate::error::Result;
use crate::node::NodeIdentity;
use crate::peers::PeerDirectory;
use crate::storage::Storage;

impl From<&SyncConfig> for PeerSyncSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            page_size: config.page_size,
            push_batch_size: config.push_batch_size,
            timeout: config.peer_timeout(),
        }
    }
}

impl From<&SyncConfig> for EngineSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            enabled: config.enabled,
            interval: config.interval(),
            startup_delay: config.startup_delay(),
            max_concurrent_peers: config.max_concurrent_peers,
        }
    }
}

/// Wire up a [`SyncEngine`] talking HTTP, from configuration.
///
/// # Errors
///
/// Returns an error if the peer list cannot be loaded or the HTTP client
/// cannot be built.
pub fn build_engine(
    config: &Config,
    storage: Arc<Storage>,
    identity: &NodeIdentity,
) -> Result<Arc<SyncEngine>> {
    let peers = Arc::new(PeerDirectory::from_config(config, &storage)?);
    let transport = Arc::new(HttpTransport::new(config.sync.request_timeout())?);
    let syncer = PeerSyncer::new(
        storage,
        transport,
        identity.id(),
        PeerSyncSettings::from(&config.sync),
    );
    Ok(Arc::new(SyncEngine::new(
        syncer,
        peers,
        EngineSettings::from(&config.sync),
    )))
}

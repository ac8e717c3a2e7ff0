//! The peer list and how it is populated.
//!
//! Peers come from three places: statically configured `node_id -> address`
//! pairs, the sync log of a previous run, and discovery. Discovery asks every
//! candidate address for its node id; candidates are configured explicitly or,
//! when enabled, derived from the batman-adv originator table.
//!
//! Peers are never evicted. An unreachable peer stays in the list and is
//! retried every cycle.

use std::collections::{BTreeMap, BTreeSet};

use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{Config, DiscoveryConfig};
use crate::error::Result;
use crate::storage::Storage;
use crate::sync::PeerTransport;

/// Concurrent node-id probes during discovery.
const PROBE_CONCURRENCY: usize = 8;

/// A peer and where it was last reached.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Peer {
    /// The peer's node id.
    pub node_id: String,
    /// The peer's API address, `host:port` or a full URL.
    pub address: String,
}

/// The set of known peers, shared by the API and the sync engine.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: RwLock<BTreeMap<String, String>>,
    candidates: Vec<String>,
    discovery: Option<DiscoveryConfig>,
}

impl PeerDirectory {
    /// Create an empty directory that probes `candidates` during discovery.
    #[must_use]
    pub fn new(candidates: Vec<String>, discovery: Option<DiscoveryConfig>) -> Self {
        Self {
            peers: RwLock::new(BTreeMap::new()),
            candidates,
            discovery,
        }
    }

    /// Build a directory from configuration and the persisted sync log.
    ///
    /// Configured addresses take precedence over the ones remembered in the
    /// sync log.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync log cannot be read.
    pub fn from_config(config: &Config, storage: &Storage) -> Result<Self> {
        let discovery = config
            .discovery
            .batctl_enabled
            .then(|| config.discovery.clone());
        let directory = Self::new(config.peers.candidates.clone(), discovery);

        for entry in storage.sync_log().list()? {
            if let Some(address) = entry.last_known_address {
                directory.upsert(&entry.peer_node_id, &address);
            }
        }
        for (node_id, address) in &config.peers.known {
            directory.upsert(node_id, address);
        }

        info!(peers = directory.len(), "Peer directory loaded");
        Ok(directory)
    }

    /// Insert or update a peer. Returns whether anything changed.
    pub fn upsert(&self, node_id: &str, address: &str) -> bool {
        let mut peers = self.peers.write();
        match peers.get(node_id) {
            Some(existing) if existing == address => false,
            _ => {
                peers.insert(node_id.to_string(), address.to_string());
                true
            }
        }
    }

    /// A point-in-time copy of the peer list, ordered by node id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers
            .read()
            .iter()
            .map(|(node_id, address)| Peer {
                node_id: node_id.clone(),
                address: address.clone(),
            })
            .collect()
    }

    /// Number of known peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Whether no peers are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Probe every candidate address and record the peers that answer.
    ///
    /// Addresses that answer with `local_node_id` are ignored. Returns the
    /// number of peers that were added or moved to a new address.
    pub async fn discover(&self, transport: &dyn PeerTransport, local_node_id: &str) -> usize {
        let mut candidates: BTreeSet<String> = self.candidates.iter().cloned().collect();
        if let Some(discovery) = &self.discovery {
            candidates.extend(batctl_candidates(discovery).await);
        }
        if candidates.is_empty() {
            return 0;
        }

        let answers: Vec<(String, Result<String>)> = stream::iter(candidates)
            .map(|address| async move {
                let answer = transport.node_id(&address).await;
                (address, answer)
            })
            .buffer_unordered(PROBE_CONCURRENCY)
            .collect()
            .await;

        let mut changed = 0;
        for (address, answer) in answers {
            match answer {
                Ok(node_id) if node_id == local_node_id => {
                    debug!(address = %address, "Candidate is this node");
                }
                Ok(node_id) => {
                    if self.upsert(&node_id, &address) {
                        info!(peer = %node_id, address = %address, "Discovered peer");
                        changed += 1;
                    }
                }
                Err(e) => debug!(address = %address, "Candidate did not answer: {}", e),
            }
        }
        changed
    }
}

/// Run the originator listing command and turn its output into candidate addresses.
///
/// Failures are logged and yield no candidates. A command that outlives
/// `command_timeout` is killed.
async fn batctl_candidates(discovery: &DiscoveryConfig) -> Vec<String> {
    let run = Command::new(&discovery.batctl_command)
        .args(["o", "-f", "json"])
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(discovery.command_timeout(), run).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!(command = %discovery.batctl_command, "Failed to run batctl: {}", e);
            return Vec::new();
        }
        Err(_) => {
            warn!(
                command = %discovery.batctl_command,
                timeout_secs = discovery.command_timeout_secs,
                "batctl did not finish in time, killed"
            );
            return Vec::new();
        }
    };

    if !output.status.success() {
        warn!(
            status = %output.status,
            "batctl failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return Vec::new();
    }

    parse_originators(
        &String::from_utf8_lossy(&output.stdout),
        &discovery.link_local_prefix,
        discovery.peer_port,
    )
}

#[derive(Debug, Deserialize)]
struct Originator {
    originator: String,
}

/// Parse `batctl o -f json` output into peer addresses.
///
/// The output is either one JSON object per line or a single JSON array of
/// objects, each with an `originator` MAC address. Unparseable entries are
/// skipped. Duplicates are removed and the result is sorted.
#[must_use]
pub fn parse_originators(output: &str, prefix: &str, port: u16) -> Vec<String> {
    let trimmed = output.trim();
    let originators: Vec<Originator> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).unwrap_or_else(|e| {
            warn!("Could not parse batctl output: {}", e);
            Vec::new()
        })
    } else {
        trimmed
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(originator) => Some(originator),
                Err(e) => {
                    debug!("Skipping batctl line {:?}: {}", line, e);
                    None
                }
            })
            .collect()
    };

    let addresses: BTreeSet<String> = originators
        .iter()
        .filter_map(|o| mac_to_address(&o.originator, prefix, port))
        .collect();
    addresses.into_iter().collect()
}

/// Map a mesh MAC address to the peer's self-assigned link-local API address.
///
/// The last two bytes of the MAC become the last two octets of the IP.
#[must_use]
pub fn mac_to_address(mac: &str, prefix: &str, port: u16) -> Option<String> {
    let bytes: Vec<u8> = mac
        .split(':')
        .map(|part| u8::from_str_radix(part, 16))
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    if bytes.len() != 6 {
        return None;
    }
    Some(format!("{prefix}.{}.{}:{port}", bytes[4], bytes[5]))
}

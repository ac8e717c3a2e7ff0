//! Synchronization with a single peer.
//!
//! One exchange pulls the peer's reports into the local store (backward) and
//! pushes local reports to the peer (forward). Both directions start from the
//! watermark recorded in the sync log, inclusive, and page through rows by
//! `(created_at, id)`. Rows already present on the receiving side are dropped
//! by the idempotent insert, so re-sending the boundary row is harmless.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use super::transport::{PeerTransport, PullQuery, PushAck};
use crate::error::{Error, Result};
use crate::peers::Peer;
use crate::storage::{SinceQuery, Storage};

/// Tuning for one peer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSyncSettings {
    /// Reports requested per pull page.
    pub page_size: usize,
    /// Reports read from the local store per push batch.
    pub push_batch_size: usize,
    /// Bound on the whole exchange.
    pub timeout: Duration,
}

impl Default for PeerSyncSettings {
    fn default() -> Self {
        Self {
            page_size: 200,
            push_batch_size: 100,
            timeout: Duration::from_secs(30),
        }
    }
}

/// The outcome of syncing with one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PeerSyncResult {
    /// The peer's node id.
    pub peer_id: String,
    /// The address used.
    pub address: String,
    /// Reports the peer stored as new.
    pub pushed: usize,
    /// Reports stored locally as new.
    pub pulled: usize,
    /// Malformed rows received from the peer and dropped.
    pub rejected: usize,
    /// Why the exchange failed, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PeerSyncResult {
    fn new(peer: &Peer) -> Self {
        Self {
            peer_id: peer.node_id.clone(),
            address: peer.address.clone(),
            ..Self::default()
        }
    }

    /// Whether both directions completed.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// Reports moved in either direction.
    #[must_use]
    pub fn transferred(&self) -> usize {
        self.pushed + self.pulled
    }
}

#[derive(Debug, Default)]
struct Transfer {
    count: usize,
    rejected: usize,
    error: Option<Error>,
}

/// Runs exchanges with individual peers.
///
/// At most one exchange per peer runs at any time; a second request for a
/// busy peer fails fast instead of waiting.
#[derive(Debug)]
pub struct PeerSyncer {
    storage: Arc<Storage>,
    transport: Arc<dyn PeerTransport>,
    local_node_id: String,
    settings: PeerSyncSettings,
    in_flight: Mutex<HashSet<String>>,
}

/// Removes a peer from the in-flight set when dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    peer_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.peer_id);
    }
}

impl PeerSyncer {
    /// Create a syncer for this node.
    #[must_use]
    pub fn new(
        storage: Arc<Storage>,
        transport: Arc<dyn PeerTransport>,
        local_node_id: impl Into<String>,
        settings: PeerSyncSettings,
    ) -> Self {
        Self {
            storage,
            transport,
            local_node_id: local_node_id.into(),
            settings,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// The transport used to reach peers.
    #[must_use]
    pub fn transport(&self) -> &dyn PeerTransport {
        self.transport.as_ref()
    }

    /// This node's id.
    #[must_use]
    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    fn claim(&self, peer_id: &str) -> Option<InFlight<'_>> {
        self.in_flight
            .lock()
            .insert(peer_id.to_string())
            .then(|| InFlight {
                set: &self.in_flight,
                peer_id: peer_id.to_string(),
            })
    }

    /// Pull from and push to one peer.
    ///
    /// Failures are reported in the result, never returned: an unreachable
    /// peer is an expected condition retried on the next cycle.
    pub async fn sync_peer(&self, peer: &Peer) -> PeerSyncResult {
        let mut result = PeerSyncResult::new(peer);

        let Some(_guard) = self.claim(&peer.node_id) else {
            result.error = Some("sync already in progress".to_string());
            return result;
        };

        let entry = match self.storage.sync_log().get(&peer.node_id) {
            Ok(entry) => entry,
            Err(e) => {
                result.error = Some(e.to_string());
                return result;
            }
        };

        let exchange = async {
            tokio::join!(
                self.pull(peer, entry.last_backward_sync_at),
                self.push(peer, entry.last_forward_sync_at)
            )
        };

        let (pull, push) = match tokio::time::timeout(self.settings.timeout, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let err = Error::Timeout {
                    operation: format!(
                        "sync with {} after {}s",
                        peer.node_id,
                        self.settings.timeout.as_secs_f64()
                    ),
                };
                warn!(peer = %peer.node_id, address = %peer.address, "{}", err);
                result.error = Some(err.to_string());
                return result;
            }
        };

        result.pulled = pull.count;
        result.rejected = pull.rejected;
        result.pushed = push.count;

        let errors: Vec<String> = [("pull", pull.error), ("push", push.error)]
            .into_iter()
            .filter_map(|(direction, err)| err.map(|e| format!("{direction}: {e}")))
            .collect();

        if errors.is_empty() {
            if let Err(e) = self
                .storage
                .sync_log()
                .record_address(&peer.node_id, &peer.address)
            {
                warn!(peer = %peer.node_id, "Failed to record peer address: {}", e);
            }
        } else {
            let message = errors.join("; ");
            warn!(peer = %peer.node_id, address = %peer.address, "Sync failed: {}", message);
            result.error = Some(message);
        }

        debug!(
            peer = %peer.node_id,
            pulled = result.pulled,
            pushed = result.pushed,
            rejected = result.rejected,
            "Peer exchange finished"
        );
        result
    }

    /// Backward sync: merge the peer's reports page by page.
    ///
    /// The backward watermark advances after each fully merged page.
    async fn pull(&self, peer: &Peer, watermark: i64) -> Transfer {
        let mut transfer = Transfer::default();
        if let Err(e) = self.pull_pages(peer, watermark, &mut transfer).await {
            transfer.error = Some(Error::partial(transfer.count, e));
        }
        transfer
    }

    async fn pull_pages(&self, peer: &Peer, watermark: i64, transfer: &mut Transfer) -> Result<()> {
        let log = self.storage.sync_log();
        let mut query = PullQuery {
            since: watermark,
            after_id: None,
            limit: self.settings.page_size,
            origin: None,
        };

        loop {
            let page = self.transport.fetch_since(&peer.address, &query).await?;
            transfer.rejected += page.rejected;

            for report in &page.reports {
                match self.storage.append(report) {
                    Ok(appended) if appended.inserted => transfer.count += 1,
                    Ok(_) => {}
                    Err(e) if e.is_validation() => {
                        debug!(id = %report.id, "Rejected pulled report: {}", e);
                        transfer.rejected += 1;
                    }
                    Err(e) => return Err(e),
                }
            }

            if let Some(max) = page.max_created_at() {
                log.advance_backward(&peer.node_id, max)?;
            }
            debug!(
                peer = %peer.node_id,
                rows = page.raw_len,
                since = query.since,
                "Merged page"
            );

            // A short page is not the end: the peer may serve smaller pages
            // than asked for. Only an empty page or a stalled cursor stops.
            let Some((created_at, id)) = page.last_key else {
                return Ok(());
            };
            let current = (query.since, query.after_id.as_deref().unwrap_or(""));
            if (created_at, id.as_str()) <= current {
                warn!(peer = %peer.node_id, "Peer returned a page that does not advance, stopping");
                return Ok(());
            }
            query.since = created_at;
            query.after_id = Some(id);
        }
    }

    /// Forward sync: send local reports in order, stopping at the first failure.
    ///
    /// The forward watermark only ever covers acknowledged reports.
    async fn push(&self, peer: &Peer, watermark: i64) -> Transfer {
        let mut transfer = Transfer::default();
        let mut acked = 0;
        if let Err(e) = self.push_batches(peer, watermark, &mut transfer, &mut acked).await {
            transfer.error = Some(Error::partial(acked, e));
        }
        transfer
    }

    async fn push_batches(
        &self,
        peer: &Peer,
        watermark: i64,
        transfer: &mut Transfer,
        acked: &mut usize,
    ) -> Result<()> {
        let log = self.storage.sync_log();
        let mut query = SinceQuery {
            origin: None,
            since: watermark,
            after_id: None,
            limit: self.settings.push_batch_size,
        };

        loop {
            let batch = self.storage.get_since(&query)?;
            let Some(last) = batch.last() else {
                return Ok(());
            };
            let (next_since, next_after) = last.sync_key();
            let full = batch.len() == query.limit;

            let mut confirmed_at = None;
            let mut failure = None;
            for report in &batch {
                if report.origin_node_id == peer.node_id {
                    confirmed_at = Some(report.created_at);
                    continue;
                }
                match self.transport.push(&peer.address, report).await {
                    Ok(ack) => {
                        if ack == PushAck::Stored {
                            transfer.count += 1;
                        }
                        *acked += 1;
                        confirmed_at = Some(report.created_at);
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            if let Some(created_at) = confirmed_at {
                log.advance_forward(&peer.node_id, created_at)?;
            }
            if let Some(e) = failure {
                return Err(e);
            }
            if !full {
                return Ok(());
            }
            query.since = next_since;
            query.after_id = Some(next_after);
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::report::{EntityType, LocationReport, Metadata, Position};
    use crate::sync::loopback::LoopbackTransport;

    fn node(id: &str) -> Arc<Storage> {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        storage.metadata_get_or_insert("node_id", id).unwrap();
        storage
    }

    fn report(origin: &str, created_at: i64) -> LocationReport {
        LocationReport {
            id: Uuid::new_v4(),
            entity_id: Uuid::new_v4(),
            entity_type: EntityType::Responder,
            position: Position::new(52.5, 13.4),
            metadata: Metadata::new(),
            origin_node_id: origin.to_string(),
            created_at,
        }
    }

    fn peer_b() -> Peer {
        Peer {
            node_id: "node-b".to_string(),
            address: "b:5000".to_string(),
        }
    }

    fn syncer(local: &Arc<Storage>, transport: &Arc<LoopbackTransport>, settings: PeerSyncSettings) -> PeerSyncer {
        PeerSyncer::new(Arc::clone(local), transport.clone(), "node-a", settings)
    }

    fn small_pages() -> PeerSyncSettings {
        PeerSyncSettings {
            page_size: 2,
            push_batch_size: 2,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_round_trip_without_duplicates() {
        let a = node("node-a");
        let b = node("node-b");
        let transport = Arc::new(LoopbackTransport::new());
        transport.add_node("b:5000", "node-b", Arc::clone(&b));

        let r = report("node-a", 100);
        a.append(&r).unwrap();
        let from_b = report("node-b", 150);
        b.append(&from_b).unwrap();

        let syncer = syncer(&a, &transport, small_pages());
        let first = syncer.sync_peer(&peer_b()).await;
        assert!(first.succeeded(), "{first:?}");
        assert_eq!(first.pushed, 1);
        assert_eq!(first.pulled, 1);

        // A second exchange re-reads the boundary rows but transfers nothing new.
        let second = syncer.sync_peer(&peer_b()).await;
        assert!(second.succeeded());
        assert_eq!(second.transferred(), 0);

        let history = b.get_history(&r.entity_id, None, 10).unwrap();
        assert_eq!(history, vec![r]);
        assert_eq!(a.count().unwrap(), 2);
        assert_eq!(b.count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_backward_watermark_is_max_pulled_created_at() {
        let a = node("node-a");
        let b = node("node-b");
        let transport = Arc::new(LoopbackTransport::new());
        transport.add_node("b:5000", "node-b", Arc::clone(&b));
        for t in [10, 40, 20, 30, 50] {
            b.append(&report("node-b", t)).unwrap();
        }

        let result = syncer(&a, &transport, small_pages()).sync_peer(&peer_b()).await;

        assert!(result.succeeded());
        assert_eq!(result.pulled, 5);
        let entry = a.sync_log().get("node-b").unwrap();
        assert_eq!(entry.last_backward_sync_at, 50);
        assert_eq!(entry.last_known_address.as_deref(), Some("b:5000"));
    }

    #[tokio::test]
    async fn test_pull_pages_through_many_equal_timestamps() {
        let a = node("node-a");
        let b = node("node-b");
        let transport = Arc::new(LoopbackTransport::new());
        transport.add_node("b:5000", "node-b", Arc::clone(&b));
        for _ in 0..7 {
            b.append(&report("node-b", 77)).unwrap();
        }

        let result = syncer(&a, &transport, small_pages()).sync_peer(&peer_b()).await;
        assert!(result.succeeded());
        assert_eq!(result.pulled, 7);
        assert_eq!(a.count().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_late_report_at_watermark_is_not_lost() {
        let a = node("node-a");
        let b = node("node-b");
        let transport = Arc::new(LoopbackTransport::new());
        transport.add_node("b:5000", "node-b", Arc::clone(&b));
        b.append(&report("node-b", 500)).unwrap();

        let syncer = syncer(&a, &transport, small_pages());
        syncer.sync_peer(&peer_b()).await;

        // Another report lands at exactly the watermark timestamp.
        let late = report("node-b", 500);
        b.append(&late).unwrap();
        let result = syncer.sync_peer(&peer_b()).await;

        assert_eq!(result.pulled, 1);
        assert!(a.get(&late.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unreachable_peer_leaves_watermarks() {
        let a = node("node-a");
        let b = node("node-b");
        let transport = Arc::new(LoopbackTransport::new());
        transport.add_node("b:5000", "node-b", Arc::clone(&b));
        a.append(&report("node-a", 100)).unwrap();
        b.append(&report("node-b", 100)).unwrap();

        let log = a.sync_log();
        log.advance_forward("node-b", 7).unwrap();
        log.advance_backward("node-b", 9).unwrap();
        let before = log.get("node-b").unwrap();

        transport.set_unreachable("b:5000", true);
        let result = syncer(&a, &transport, small_pages()).sync_peer(&peer_b()).await;

        assert!(!result.succeeded());
        assert!(result.error.as_deref().unwrap().contains("pull"));
        assert!(result.error.as_deref().unwrap().contains("push"));
        assert_eq!(log.get("node-b").unwrap(), before);
        assert_eq!(b.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_partial_push_advances_to_last_ack() {
        let a = node("node-a");
        let b = node("node-b");
        let transport = Arc::new(LoopbackTransport::new());
        transport.add_node("b:5000", "node-b", Arc::clone(&b));
        for t in [100, 200, 300, 400] {
            a.append(&report("node-a", t)).unwrap();
        }
        transport.fail_push_after("b:5000", Some(2));

        let syncer = syncer(&a, &transport, small_pages());
        let result = syncer.sync_peer(&peer_b()).await;

        assert_eq!(result.pushed, 2);
        assert!(result.error.as_deref().unwrap().contains("2 record(s) confirmed"));
        assert_eq!(a.sync_log().get("node-b").unwrap().last_forward_sync_at, 200);
        assert_eq!(b.count().unwrap(), 2);

        // The remainder goes through once the peer recovers.
        transport.fail_push_after("b:5000", None);
        let retry = syncer.sync_peer(&peer_b()).await;
        assert!(retry.succeeded());
        assert_eq!(retry.pushed, 2);
        assert_eq!(b.count().unwrap(), 4);
        assert_eq!(a.sync_log().get("node-b").unwrap().last_forward_sync_at, 400);
    }

    #[tokio::test]
    async fn test_pull_keeps_paging_past_short_pages() {
        let a = node("node-a");
        let b = node("node-b");
        let transport = Arc::new(LoopbackTransport::new());
        transport.add_node("b:5000", "node-b", Arc::clone(&b));
        for t in [10, 20, 30, 40, 50] {
            b.append(&report("node-b", t)).unwrap();
        }
        // The peer serves at most 2 rows however many are asked for.
        transport.set_page_cap("b:5000", Some(2));

        let settings = PeerSyncSettings {
            page_size: 4,
            ..small_pages()
        };
        let result = syncer(&a, &transport, settings).sync_peer(&peer_b()).await;

        assert!(result.succeeded(), "{result:?}");
        assert_eq!(result.pulled, 5);
        assert_eq!(a.count().unwrap(), 5);
        assert_eq!(a.sync_log().get("node-b").unwrap().last_backward_sync_at, 50);
    }

    #[tokio::test]
    async fn test_pull_failure_keeps_watermark_at_last_merged_page() {
        let a = node("node-a");
        let b = node("node-b");
        let transport = Arc::new(LoopbackTransport::new());
        transport.add_node("b:5000", "node-b", Arc::clone(&b));
        for t in [10, 20, 30, 40, 50] {
            b.append(&report("node-b", t)).unwrap();
        }
        transport.fail_fetch_after("b:5000", Some(2));

        let syncer = syncer(&a, &transport, small_pages());
        let result = syncer.sync_peer(&peer_b()).await;

        // Pages [10, 20] and [30, 40] were merged before the third fetch failed.
        assert!(!result.succeeded());
        assert_eq!(result.pulled, 4);
        let message = result.error.as_deref().unwrap();
        assert!(message.contains("pull"), "{message}");
        assert!(message.contains("4 record(s) confirmed"), "{message}");
        assert_eq!(a.sync_log().get("node-b").unwrap().last_backward_sync_at, 40);

        transport.fail_fetch_after("b:5000", None);
        let retry = syncer.sync_peer(&peer_b()).await;
        assert!(retry.succeeded());
        assert_eq!(retry.pulled, 1);
        assert_eq!(a.count().unwrap(), 5);
        assert_eq!(a.sync_log().get("node-b").unwrap().last_backward_sync_at, 50);
    }

    #[tokio::test]
    async fn test_push_skips_reports_from_target_peer() {
        let a = node("node-a");
        let b = node("node-b");
        let transport = Arc::new(LoopbackTransport::new());
        transport.add_node("b:5000", "node-b", Arc::clone(&b));
        a.append(&report("node-b", 100)).unwrap();

        let result = syncer(&a, &transport, small_pages()).sync_peer(&peer_b()).await;

        assert!(result.succeeded());
        assert_eq!(result.pushed, 0);
        assert_eq!(transport.push_attempts("b:5000"), 0);
        assert_eq!(a.sync_log().get("node-b").unwrap().last_forward_sync_at, 100);
    }

    #[tokio::test]
    async fn test_invalid_pulled_rows_are_counted_and_skipped() {
        let a = node("node-a");
        let b = node("node-b");
        let transport = Arc::new(LoopbackTransport::new());
        transport.add_node("b:5000", "node-b", Arc::clone(&b));
        b.append(&report("node-b", 10)).unwrap();
        transport.inject_row("b:5000", serde_json::json!({"id": "junk", "created_at": 5}));

        let result = syncer(&a, &transport, small_pages()).sync_peer(&peer_b()).await;

        assert!(result.succeeded());
        assert_eq!(result.pulled, 1);
        assert_eq!(result.rejected, 1);
    }

    #[tokio::test]
    async fn test_hung_peer_times_out() {
        let a = node("node-a");
        let b = node("node-b");
        let transport = Arc::new(LoopbackTransport::new());
        transport.add_node("b:5000", "node-b", Arc::clone(&b));
        transport.set_hang("b:5000", true);

        let settings = PeerSyncSettings {
            timeout: Duration::from_millis(100),
            ..small_pages()
        };
        let result = syncer(&a, &transport, settings).sync_peer(&peer_b()).await;

        assert!(result.error.as_deref().unwrap().contains("timed out"));
        let entry = a.sync_log().get("node-b").unwrap();
        assert_eq!(entry.last_forward_sync_at, 0);
        assert_eq!(entry.last_backward_sync_at, 0);
    }

    #[tokio::test]
    async fn test_same_peer_does_not_overlap() {
        let a = node("node-a");
        let b = node("node-b");
        let transport = Arc::new(LoopbackTransport::new());
        transport.add_node("b:5000", "node-b", Arc::clone(&b));
        transport.set_hang("b:5000", true);

        let settings = PeerSyncSettings {
            timeout: Duration::from_millis(300),
            ..small_pages()
        };
        let syncer = syncer(&a, &transport, settings);
        let peer = peer_b();

        let (first, second) = tokio::join!(syncer.sync_peer(&peer), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            syncer.sync_peer(&peer).await
        });

        assert!(first.error.as_deref().unwrap().contains("timed out"));
        assert_eq!(second.error.as_deref(), Some("sync already in progress"));

        // The claim is released once the first exchange ends.
        transport.set_hang("b:5000", false);
        assert!(syncer.sync_peer(&peer).await.succeeded());
    }
}

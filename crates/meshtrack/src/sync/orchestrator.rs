//! The sync orchestrator: one cycle at a time over every known peer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::peer::{PeerSyncResult, PeerSyncer};
use crate::error::{Error, Result};
use crate::peers::PeerDirectory;

/// Scheduling and fan-out settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Whether the background scheduler runs.
    pub enabled: bool,
    /// Time between scheduled cycles.
    pub interval: Duration,
    /// Delay before the first scheduled cycle.
    pub startup_delay: Duration,
    /// Maximum peers synced at once.
    pub max_concurrent_peers: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10),
            startup_delay: Duration::from_secs(2),
            max_concurrent_peers: 4,
        }
    }
}

/// A failed peer within a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerError {
    /// The peer's node id.
    pub peer_id: String,
    /// What went wrong.
    pub message: String,
}

/// Aggregate outcome of one sync cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Peers an exchange was attempted with.
    pub attempted: usize,
    /// Peers whose exchange completed in both directions.
    pub succeeded: usize,
    /// Reports pushed plus reports pulled.
    pub total_records_transferred: usize,
    /// Reports peers stored as new.
    pub pushed: usize,
    /// Reports stored locally as new.
    pub pulled: usize,
    /// One entry per failed peer.
    pub errors: Vec<PeerError>,
    /// Per-peer detail, ordered by peer id.
    pub peers: Vec<PeerSyncResult>,
    /// When the cycle started.
    pub started_at: DateTime<Utc>,
    /// How long the cycle took.
    pub duration_ms: u64,
}

impl CycleReport {
    fn aggregate(mut results: Vec<PeerSyncResult>, started_at: DateTime<Utc>, elapsed: Duration) -> Self {
        results.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        let errors = results
            .iter()
            .filter_map(|r| {
                r.error.as_ref().map(|message| PeerError {
                    peer_id: r.peer_id.clone(),
                    message: message.clone(),
                })
            })
            .collect();

        let pushed = results.iter().map(|r| r.pushed).sum();
        let pulled = results.iter().map(|r| r.pulled).sum();

        Self {
            attempted: results.len(),
            succeeded: results.iter().filter(|r| r.succeeded()).count(),
            total_records_transferred: pushed + pulled,
            pushed,
            pulled,
            errors,
            peers: results,
            started_at,
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Scheduler state exposed to operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    /// Whether a cycle is executing right now.
    pub running: bool,
    /// Completed cycles since startup.
    pub cycle_count: u64,
    /// When the last cycle finished.
    pub last_cycle_at: Option<DateTime<Utc>>,
    /// The last cycle's aggregate.
    pub last_report: Option<CycleReport>,
}

/// Drives sync cycles, on a timer or on demand.
///
/// The timer and the manual trigger share one guard: a cycle requested while
/// another is running is refused, not queued.
#[derive(Debug)]
pub struct SyncEngine {
    syncer: PeerSyncer,
    peers: Arc<PeerDirectory>,
    settings: EngineSettings,
    cycle_guard: tokio::sync::Mutex<()>,
    status: Mutex<EngineStatus>,
}

impl SyncEngine {
    /// Create an engine.
    #[must_use]
    pub fn new(syncer: PeerSyncer, peers: Arc<PeerDirectory>, settings: EngineSettings) -> Self {
        Self {
            syncer,
            peers,
            settings,
            cycle_guard: tokio::sync::Mutex::new(()),
            status: Mutex::new(EngineStatus::default()),
        }
    }

    /// The engine's settings.
    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// The peer directory the engine syncs with.
    #[must_use]
    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    /// A copy of the current scheduler state.
    #[must_use]
    pub fn status(&self) -> EngineStatus {
        let mut status = self.status.lock().clone();
        status.running = self.cycle_guard.try_lock().is_err();
        status
    }

    /// Run one cycle: discover, then sync every known peer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CycleInProgress`] if another cycle is running.
    /// Per-peer failures are not errors; they are listed in the report.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let Ok(_guard) = self.cycle_guard.try_lock() else {
            return Err(Error::CycleInProgress);
        };

        let started_at = Utc::now();
        let clock = Instant::now();

        let discovered = self
            .peers
            .discover(self.syncer.transport(), self.syncer.local_node_id())
            .await;
        if discovered > 0 {
            debug!(discovered, "Peer list updated by discovery");
        }

        let snapshot = self.peers.snapshot();
        let results: Vec<PeerSyncResult> = stream::iter(snapshot)
            .map(|peer| async move { self.syncer.sync_peer(&peer).await })
            .buffer_unordered(self.settings.max_concurrent_peers.max(1))
            .collect()
            .await;

        let report = CycleReport::aggregate(results, started_at, clock.elapsed());

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                pushed = report.pushed,
                pulled = report.pulled,
                duration_ms = report.duration_ms,
                "Sync cycle complete"
            );
        } else {
            debug!("Sync cycle complete, no peers known");
        }

        {
            let mut status = self.status.lock();
            status.cycle_count += 1;
            status.last_cycle_at = Some(Utc::now());
            status.last_report = Some(report.clone());
        }

        Ok(report)
    }

    /// Run cycles on the configured interval until `cancel` fires.
    ///
    /// A tick that arrives while a cycle is still running is skipped.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.settings.enabled {
            info!("Scheduled sync disabled");
            return;
        }

        info!(
            interval_secs = self.settings.interval.as_secs(),
            max_concurrent_peers = self.settings.max_concurrent_peers,
            "Sync scheduler started"
        );

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(self.settings.startup_delay) => {}
        }

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.run_cycle().await {
                        Ok(_) => {}
                        Err(Error::CycleInProgress) => debug!("Cycle already running, skipping tick"),
                        Err(e) => warn!("Sync cycle failed: {}", e),
                    }
                }
            }
        }

        info!("Sync scheduler stopped");
    }
}

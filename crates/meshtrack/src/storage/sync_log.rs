//! Per-peer sync watermarks.
//!
//! Each known peer has one row recording the last address it answered on and
//! two high-water marks: how far this node has pushed to it (forward) and how
//! far it has pulled from it (backward). Watermarks never move backwards.

use rusqlite::params;
use serde::Serialize;

use super::Storage;
use crate::error::Result;

/// Sync state for one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncLogEntry {
    /// The peer's node id.
    pub peer_node_id: String,
    /// The address the peer was last reached on.
    pub last_known_address: Option<String>,
    /// `created_at` of the newest local report confirmed by the peer.
    pub last_forward_sync_at: i64,
    /// `created_at` of the newest report pulled from the peer.
    pub last_backward_sync_at: i64,
}

/// Handle to the `sync_log` table of a [`Storage`].
#[derive(Debug, Clone, Copy)]
pub struct SyncLog<'a> {
    storage: &'a Storage,
}

impl<'a> SyncLog<'a> {
    pub(super) fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    /// Get the entry for a peer, creating a zero-watermark entry on first access.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get(&self, peer_node_id: &str) -> Result<SyncLogEntry> {
        let conn = self.storage.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO sync_log (peer_node_id) VALUES (?1)",
            [peer_node_id],
        )?;
        let entry = conn.query_row(
            r"
            SELECT peer_node_id, last_known_address, last_forward_sync_at, last_backward_sync_at
            FROM sync_log WHERE peer_node_id = ?1
            ",
            [peer_node_id],
            row_to_entry,
        )?;
        Ok(entry)
    }

    /// Remember the address a peer was reached on.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn record_address(&self, peer_node_id: &str, address: &str) -> Result<()> {
        let conn = self.storage.conn.lock();
        conn.execute(
            r"
            INSERT INTO sync_log (peer_node_id, last_known_address) VALUES (?1, ?2)
            ON CONFLICT(peer_node_id) DO UPDATE SET last_known_address = excluded.last_known_address
            ",
            params![peer_node_id, address],
        )?;
        Ok(())
    }

    /// Raise the forward watermark to `created_at` if it is higher.
    ///
    /// Returns whether the stored value changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn advance_forward(&self, peer_node_id: &str, created_at: i64) -> Result<bool> {
        self.advance(peer_node_id, "last_forward_sync_at", created_at)
    }

    /// Raise the backward watermark to `created_at` if it is higher.
    ///
    /// Returns whether the stored value changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn advance_backward(&self, peer_node_id: &str, created_at: i64) -> Result<bool> {
        self.advance(peer_node_id, "last_backward_sync_at", created_at)
    }

    fn advance(&self, peer_node_id: &str, column: &'static str, created_at: i64) -> Result<bool> {
        let conn = self.storage.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO sync_log (peer_node_id) VALUES (?1)",
            [peer_node_id],
        )?;
        let changed = conn.execute(
            &format!("UPDATE sync_log SET {column} = ?2 WHERE peer_node_id = ?1 AND {column} < ?2"),
            params![peer_node_id, created_at],
        )?;
        Ok(changed > 0)
    }

    /// List every peer entry, ordered by node id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn list(&self) -> Result<Vec<SyncLogEntry>> {
        let conn = self.storage.conn.lock();
        let mut stmt = conn.prepare(
            r"
            SELECT peer_node_id, last_known_address, last_forward_sync_at, last_backward_sync_at
            FROM sync_log ORDER BY peer_node_id
            ",
        )?;
        let entries = stmt
            .query_map([], row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<SyncLogEntry> {
    Ok(SyncLogEntry {
        peer_node_id: row.get(0)?,
        last_known_address: row.get(1)?,
        last_forward_sync_at: row.get(2)?,
        last_backward_sync_at: row.get(3)?,
    })
}

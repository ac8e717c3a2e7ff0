//! Storage layer for meshtrack.
//!
//! This module provides the `SQLite`-backed Location Store: an append-only,
//! id-keyed table of location reports with latest, history, radius and
//! sync-paging queries. The per-peer [`SyncLog`] and the node metadata live
//! in the same database file.

pub mod migrations;
pub mod schema;
pub mod sync_log;

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::geo::haversine_km;
use crate::report::{EntityType, LocationReport, Metadata, Position};

pub use sync_log::{SyncLog, SyncLogEntry};

/// Columns selected for every report query, in `row_to_report` order.
const REPORT_COLUMNS: &str =
    "id, entity_id, entity_type, node_id, latitude, longitude, altitude, accuracy, created_at, metadata";

/// Storage engine for location reports.
///
/// The connection sits behind a mutex so that the insert-if-absent check is
/// atomic with respect to every other caller (local ingest and concurrent
/// peer merges).
#[derive(Debug)]
pub struct Storage {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Mutex<Connection>,
}

/// The outcome of [`Storage::append`].
#[derive(Debug, Clone, PartialEq)]
pub struct Appended {
    /// The stored row. For a duplicate id this is the row that was already there.
    pub report: LocationReport,
    /// Whether a new row was written.
    pub inserted: bool,
}

/// A report returned by a radius search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearbyReport {
    /// The latest report for the entity.
    #[serde(flatten)]
    pub report: LocationReport,
    /// Great-circle distance from the search center.
    pub distance_km: f64,
}

/// Parameters for paging reports in sync order.
///
/// Rows are returned in ascending `(created_at, id)` order. With no `after_id`
/// the lower bound is inclusive (`created_at >= since`); with one, only rows
/// strictly after `(since, after_id)` are returned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinceQuery {
    /// Restrict to reports created by this node.
    pub origin: Option<String>,
    /// Lower timestamp bound.
    pub since: i64,
    /// Keyset cursor within `since`.
    pub after_id: Option<String>,
    /// Maximum rows to return.
    pub limit: usize,
}

impl Storage {
    /// Open or create a storage database at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    /// Initializes the schema if this is a new database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening database at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        // WAL keeps readers unblocked while a peer merge is writing.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        migrations::initialize_schema(&conn)?;

        info!("Database opened successfully at {}", path.display());
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory storage instance for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;

        migrations::initialize_schema(&conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        })
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Access the per-peer sync log.
    #[must_use]
    pub fn sync_log(&self) -> SyncLog<'_> {
        SyncLog::new(self)
    }

    /// Append a report if no report with the same id exists.
    ///
    /// Appending an id that is already stored is a successful no-op; the
    /// returned [`Appended`] then carries the existing row.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed reports, or an error if the
    /// database operation fails.
    pub fn append(&self, report: &LocationReport) -> Result<Appended> {
        report.validate()?;
        let id = report.id.to_string();
        let metadata = serde_json::to_string(&report.metadata)?;

        let conn = self.conn.lock();
        let changed = conn.execute(
            r"
            INSERT OR IGNORE INTO location_reports
                (id, entity_id, entity_type, node_id, latitude, longitude,
                 altitude, accuracy, created_at, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
            params![
                id,
                report.entity_id.to_string(),
                report.entity_type.as_str(),
                report.origin_node_id,
                report.position.latitude,
                report.position.longitude,
                report.position.altitude,
                report.position.accuracy,
                report.created_at,
                metadata,
            ],
        )?;

        if changed > 0 {
            debug!(id = %id, entity = %report.entity_id, "Stored report");
            return Ok(Appended {
                report: report.clone(),
                inserted: true,
            });
        }

        debug!(id = %id, "Report already stored, ignoring");
        let existing = Self::query_by_id(&conn, &id)?
            .ok_or_else(|| Error::internal(format!("report {id} vanished after insert")))?;
        Ok(Appended {
            report: existing,
            inserted: false,
        })
    }

    /// Get a report by its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get(&self, id: &Uuid) -> Result<Option<LocationReport>> {
        let conn = self.conn.lock();
        Self::query_by_id(&conn, &id.to_string())
    }

    fn query_by_id(conn: &Connection, id: &str) -> Result<Option<LocationReport>> {
        let sql = format!("SELECT {REPORT_COLUMNS} FROM location_reports WHERE id = ?1");
        let report = conn
            .query_row(&sql, [id], Self::row_to_report)
            .optional()?;
        Ok(report)
    }

    /// Get the latest report for each entity.
    ///
    /// The latest row is the one with the greatest `created_at`, ties going
    /// to the lowest `id`. The type filter applies to that latest row.
    /// Results are ordered newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get_latest(
        &self,
        entity_type: Option<EntityType>,
        limit: usize,
    ) -> Result<Vec<LocationReport>> {
        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
        self.latest_rows(entity_type, limit_i64)
    }

    fn latest_rows(&self, entity_type: Option<EntityType>, limit: i64) -> Result<Vec<LocationReport>> {
        let sql = format!(
            r"
            SELECT {REPORT_COLUMNS} FROM (
                SELECT *, ROW_NUMBER() OVER (
                    PARTITION BY entity_id ORDER BY created_at DESC, id ASC
                ) AS row_rank
                FROM location_reports
            )
            WHERE row_rank = 1 AND (?1 IS NULL OR entity_type = ?1)
            ORDER BY created_at DESC, id ASC
            LIMIT ?2
            "
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let reports = stmt
            .query_map(
                params![entity_type.map(|t| t.as_str()), limit],
                Self::row_to_report,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(reports)
    }

    /// Get the report history of one entity, newest first.
    ///
    /// With `since`, only reports created strictly after it are returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get_history(
        &self,
        entity_id: &Uuid,
        since: Option<i64>,
        limit: usize,
    ) -> Result<Vec<LocationReport>> {
        let sql = format!(
            r"
            SELECT {REPORT_COLUMNS} FROM location_reports
            WHERE entity_id = ?1 AND (?2 IS NULL OR created_at > ?2)
            ORDER BY created_at DESC, id ASC
            LIMIT ?3
            "
        );

        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let reports = stmt
            .query_map(
                params![entity_id.to_string(), since, limit_i64],
                Self::row_to_report,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(reports)
    }

    /// Find entities whose latest position lies within `radius_km` of `center`.
    ///
    /// Results are sorted by distance, ties broken by report id.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an invalid center or radius, or an
    /// error if the database operation fails.
    pub fn get_nearby(
        &self,
        center: &Position,
        radius_km: f64,
        entity_type: Option<EntityType>,
    ) -> Result<Vec<NearbyReport>> {
        center.validate()?;
        if !radius_km.is_finite() || radius_km < 0.0 {
            return Err(Error::validation(format!(
                "radius must be a non-negative number of kilometres, got {radius_km}"
            )));
        }

        let mut nearby: Vec<NearbyReport> = self
            .latest_rows(entity_type, -1)?
            .into_iter()
            .filter_map(|report| {
                let distance_km = haversine_km(center, &report.position);
                (distance_km <= radius_km).then_some(NearbyReport {
                    report,
                    distance_km,
                })
            })
            .collect();

        nearby.sort_by(|a, b| {
            a.distance_km
                .total_cmp(&b.distance_km)
                .then_with(|| a.report.id.cmp(&b.report.id))
        });

        Ok(nearby)
    }

    /// Page reports in sync order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get_since(&self, query: &SinceQuery) -> Result<Vec<LocationReport>> {
        let sql = format!(
            r"
            SELECT {REPORT_COLUMNS} FROM location_reports
            WHERE (?1 IS NULL OR node_id = ?1)
              AND (created_at > ?2 OR (created_at = ?2 AND id > ?3))
            ORDER BY created_at ASC, id ASC
            LIMIT ?4
            "
        );

        // Every id sorts after the empty string, which makes the bound inclusive.
        let after_id = query.after_id.as_deref().unwrap_or("");
        let limit_i64 = i64::try_from(query.limit).unwrap_or(i64::MAX);

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let reports = stmt
            .query_map(
                params![query.origin, query.since, after_id, limit_i64],
                Self::row_to_report,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(reports)
    }

    /// Count total reports in storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM location_reports", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Read a value from the metadata table.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn metadata_value(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Store `value` under `key` unless a value is already present, and
    /// return whichever value ends up stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn metadata_get_or_insert(&self, key: &str, value: &str) -> Result<String> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO metadata (key, value) VALUES (?1, ?2)",
            (key, value),
        )?;
        let stored: String =
            conn.query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
                row.get(0)
            })?;
        Ok(stored)
    }

    /// Get database statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<StorageStats> {
        let conn = self.conn.lock();
        let (total_reports, distinct_entities, oldest_report, newest_report): (
            i64,
            i64,
            Option<i64>,
            Option<i64>,
        ) = conn.query_row(
            r"
            SELECT COUNT(*), COUNT(DISTINCT entity_id), MIN(created_at), MAX(created_at)
            FROM location_reports
            ",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        let known_peers: i64 =
            conn.query_row("SELECT COUNT(*) FROM sync_log", [], |row| row.get(0))?;
        drop(conn);

        let db_size_bytes = if self.path.to_string_lossy() == ":memory:" {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(StorageStats {
            total_reports,
            distinct_entities,
            oldest_report,
            newest_report,
            known_peers,
            db_size_bytes,
        })
    }

    /// Convert a database row to a `LocationReport`.
    fn row_to_report(row: &rusqlite::Row) -> rusqlite::Result<LocationReport> {
        let id: String = row.get(0)?;
        let entity_id: String = row.get(1)?;
        let entity_type: String = row.get(2)?;
        let metadata_str: String = row.get(9)?;

        let metadata: Metadata = serde_json::from_str(&metadata_str).unwrap_or_else(|e| {
            warn!("Unreadable metadata on report {}: {}, using empty map", id, e);
            Metadata::new()
        });

        Ok(LocationReport {
            id: parse_column(0, &id, |s| Uuid::parse_str(s).map_err(Into::into))?,
            entity_id: parse_column(1, &entity_id, |s| Uuid::parse_str(s).map_err(Into::into))?,
            entity_type: parse_column(2, &entity_type, |s| {
                s.parse::<EntityType>().map_err(|e| e.to_string().into())
            })?,
            origin_node_id: row.get(3)?,
            position: Position {
                latitude: row.get(4)?,
                longitude: row.get(5)?,
                altitude: row.get(6)?,
                accuracy: row.get(7)?,
            },
            created_at: row.get(8)?,
            metadata,
        })
    }
}

type BoxedError = Box<dyn std::error::Error + Send + Sync>;

fn parse_column<T>(
    index: usize,
    raw: &str,
    parse: impl FnOnce(&str) -> std::result::Result<T, BoxedError>,
) -> rusqlite::Result<T> {
    parse(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, e)
    })
}

/// Statistics about the storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    /// Total number of reports stored.
    pub total_reports: i64,
    /// Number of distinct tracked entities.
    pub distinct_entities: i64,
    /// `created_at` of the oldest report.
    pub oldest_report: Option<i64>,
    /// `created_at` of the newest report.
    pub newest_report: Option<i64>,
    /// Number of peers in the sync log.
    pub known_peers: i64,
    /// Size of the database file in bytes.
    pub db_size_bytes: u64,
}

//! `SQLite` schema definitions for meshtrack.
//!
//! This module contains the SQL statements for creating and managing
//! the database schema.

/// SQL statement to create the location reports table.
///
/// `id` is the mesh-wide report id; the primary key makes insert-if-absent
/// a single `INSERT OR IGNORE`.
pub const CREATE_REPORTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS location_reports (
    id TEXT PRIMARY KEY NOT NULL,
    entity_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    node_id TEXT NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    altitude REAL,
    accuracy REAL,
    created_at INTEGER NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
)
";

/// Index for per-entity history and latest lookups.
pub const CREATE_ENTITY_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_reports_entity ON location_reports(entity_id, created_at DESC)
";

/// Index for type filtering.
pub const CREATE_TYPE_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_reports_type ON location_reports(entity_type)
";

/// Index for sync paging by `(created_at, id)`.
pub const CREATE_SYNC_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_reports_created ON location_reports(created_at, id)
";

/// Index for origin-restricted sync paging.
pub const CREATE_NODE_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_reports_node ON location_reports(node_id, created_at)
";

/// SQL statement to create the per-peer sync log.
pub const CREATE_SYNC_LOG_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS sync_log (
    peer_node_id TEXT PRIMARY KEY NOT NULL,
    last_known_address TEXT,
    last_forward_sync_at INTEGER NOT NULL DEFAULT 0,
    last_backward_sync_at INTEGER NOT NULL DEFAULT 0
)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_REPORTS_TABLE,
    CREATE_ENTITY_INDEX,
    CREATE_TYPE_INDEX,
    CREATE_SYNC_INDEX,
    CREATE_NODE_INDEX,
    CREATE_SYNC_LOG_TABLE,
    CREATE_METADATA_TABLE,
];

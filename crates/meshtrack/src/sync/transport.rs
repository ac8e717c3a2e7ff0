//! The seam between the sync engine and the network.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::report::LocationReport;

/// Largest page the pull endpoint serves.
pub const MAX_PAGE_SIZE: usize = 1000;

/// A request for one page of a peer's reports, in sync order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullQuery {
    /// Lower `created_at` bound, inclusive unless `after_id` is set.
    pub since: i64,
    /// Keyset cursor: skip rows at `since` whose id is not greater than this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_id: Option<String>,
    /// Page size.
    pub limit: usize,
    /// Only return reports created by this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// One page of reports received from a peer.
///
/// Rows that don't form a valid report are dropped and counted in
/// `rejected`; the rest of the page is still usable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullPage {
    /// Valid reports, in the order the peer sent them.
    pub reports: Vec<LocationReport>,
    /// Rows that were dropped as malformed.
    pub rejected: usize,
    /// Number of rows the peer sent, valid or not.
    pub raw_len: usize,
    /// Greatest `(created_at, id)` key seen in the page, valid rows or not.
    pub last_key: Option<(i64, String)>,
}

impl PullPage {
    /// Build a page from raw JSON rows.
    #[must_use]
    pub fn from_rows(rows: Vec<Value>) -> Self {
        let raw_len = rows.len();
        let mut page = Self {
            raw_len,
            ..Self::default()
        };

        for row in rows {
            let key = row_key(&row);
            if key > page.last_key {
                page.last_key = key;
            }

            match serde_json::from_value::<LocationReport>(row) {
                Ok(report) if report.validate().is_ok() => page.reports.push(report),
                Ok(report) => {
                    debug!(id = %report.id, "Dropping invalid report from peer");
                    page.rejected += 1;
                }
                Err(e) => {
                    debug!("Dropping malformed row from peer: {}", e);
                    page.rejected += 1;
                }
            }
        }

        page
    }

    /// Build a page from already-typed reports.
    #[must_use]
    pub fn from_reports(reports: Vec<LocationReport>) -> Self {
        let last_key = reports.iter().map(LocationReport::sync_key).max();
        Self {
            raw_len: reports.len(),
            reports,
            rejected: 0,
            last_key,
        }
    }

    /// The newest `created_at` among the valid reports in this page.
    #[must_use]
    pub fn max_created_at(&self) -> Option<i64> {
        self.reports.iter().map(|r| r.created_at).max()
    }
}

fn row_key(row: &Value) -> Option<(i64, String)> {
    let created_at = row.get("created_at")?.as_i64()?;
    let id = row.get("id")?.as_str()?;
    Some((created_at, id.to_string()))
}

/// How a peer answered a pushed report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushAck {
    /// The peer stored it as a new row.
    Stored,
    /// The peer already had it.
    Duplicate,
}

/// Network operations the sync engine needs from a peer.
///
/// All methods take the peer's address as recorded in the peer directory.
#[async_trait]
pub trait PeerTransport: Send + Sync + std::fmt::Debug {
    /// Ask the node at `address` for its node id.
    async fn node_id(&self, address: &str) -> Result<String>;

    /// Fetch one page of the peer's reports.
    async fn fetch_since(&self, address: &str, query: &PullQuery) -> Result<PullPage>;

    /// Submit one report to the peer's ingest endpoint.
    async fn push(&self, address: &str, report: &LocationReport) -> Result<PushAck>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::report::{EntityType, Metadata, Position};

    fn report(created_at: i64) -> LocationReport {
        LocationReport {
            id: Uuid::new_v4(),
            entity_id: Uuid::new_v4(),
            entity_type: EntityType::Resource,
            position: Position::new(10.0, 20.0),
            metadata: Metadata::new(),
            origin_node_id: "node-b".to_string(),
            created_at,
        }
    }

    #[test]
    fn test_from_rows_keeps_valid_and_counts_rejected() {
        let good = report(50);
        let mut bad_position = serde_json::to_value(report(60)).unwrap();
        bad_position["position"]["lat"] = json!(200.0);
        let garbage = json!({"id": "not-a-uuid", "created_at": 70});

        let page = PullPage::from_rows(vec![serde_json::to_value(&good).unwrap(), bad_position, garbage]);

        assert_eq!(page.reports, vec![good]);
        assert_eq!(page.rejected, 2);
        assert_eq!(page.raw_len, 3);
        assert_eq!(page.last_key, Some((70, "not-a-uuid".to_string())));
        assert_eq!(page.max_created_at(), Some(50));
    }

    #[test]
    fn test_from_rows_without_keys() {
        let page = PullPage::from_rows(vec![json!({"hello": "world"})]);
        assert!(page.reports.is_empty());
        assert_eq!(page.rejected, 1);
        assert!(page.last_key.is_none());
        assert!(page.max_created_at().is_none());
    }

    #[test]
    fn test_from_reports_last_key() {
        let a = report(10);
        let b = report(30);
        let page = PullPage::from_reports(vec![a, b.clone()]);
        assert_eq!(page.last_key, Some(b.sync_key()));
        assert_eq!(page.raw_len, 2);
    }

    #[test]
    fn test_pull_query_skips_absent_cursor() {
        let query = PullQuery {
            since: 5,
            limit: 10,
            ..PullQuery::default()
        };
        let json = serde_json::to_value(&query).unwrap();
        assert!(json.get("after_id").is_none());
        assert!(json.get("origin").is_none());
    }
}

//! In-process transport for tests: peers are storages in the same process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::transport::{PeerTransport, PullPage, PullQuery, PushAck};
use crate::error::{Error, Result};
use crate::report::LocationReport;
use crate::storage::{SinceQuery, Storage};

#[derive(Debug)]
struct LoopbackNode {
    node_id: String,
    storage: Arc<Storage>,
    unreachable: bool,
    hang: bool,
    fail_push_after: Option<usize>,
    pushes_ok: usize,
    push_attempts: usize,
    fail_fetch_after: Option<usize>,
    fetches_ok: usize,
    page_cap: Option<usize>,
    extra_rows: Vec<Value>,
}

/// Routes requests straight to other nodes' storage, with failure injection.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    nodes: Mutex<HashMap<String, LoopbackNode>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, address: &str, node_id: &str, storage: Arc<Storage>) {
        self.nodes.lock().insert(
            address.to_string(),
            LoopbackNode {
                node_id: node_id.to_string(),
                storage,
                unreachable: false,
                hang: false,
                fail_push_after: None,
                pushes_ok: 0,
                push_attempts: 0,
                fail_fetch_after: None,
                fetches_ok: 0,
                page_cap: None,
                extra_rows: Vec::new(),
            },
        );
    }

    fn with_node<T>(&self, address: &str, f: impl FnOnce(&mut LoopbackNode) -> T) -> T {
        let mut nodes = self.nodes.lock();
        let node = nodes
            .get_mut(address)
            .unwrap_or_else(|| panic!("no loopback node at {address}"));
        f(node)
    }

    pub fn set_unreachable(&self, address: &str, unreachable: bool) {
        self.with_node(address, |n| n.unreachable = unreachable);
    }

    /// Make every request to `address` wait forever.
    pub fn set_hang(&self, address: &str, hang: bool) {
        self.with_node(address, |n| n.hang = hang);
    }

    /// Accept `limit` more pushes, then reject every push.
    pub fn fail_push_after(&self, address: &str, limit: Option<usize>) {
        self.with_node(address, |n| {
            n.fail_push_after = limit;
            n.pushes_ok = 0;
        });
    }

    /// Serve `limit` more pull pages, then fail every pull.
    pub fn fail_fetch_after(&self, address: &str, limit: Option<usize>) {
        self.with_node(address, |n| {
            n.fail_fetch_after = limit;
            n.fetches_ok = 0;
        });
    }

    /// Never serve more than `cap` rows per page, whatever the caller asks for.
    pub fn set_page_cap(&self, address: &str, cap: Option<usize>) {
        self.with_node(address, |n| n.page_cap = cap);
    }

    pub fn push_attempts(&self, address: &str) -> usize {
        self.with_node(address, |n| n.push_attempts)
    }

    /// Serve an extra raw row in pull responses, as a misbehaving peer would.
    pub fn inject_row(&self, address: &str, row: Value) {
        self.with_node(address, |n| n.extra_rows.push(row));
    }

    /// Resolve `address` to a node, failing or hanging as configured.
    async fn reach(&self, address: &str) -> Result<(String, Arc<Storage>)> {
        let state = {
            let nodes = self.nodes.lock();
            nodes
                .get(address)
                .map(|n| (n.node_id.clone(), Arc::clone(&n.storage), n.unreachable, n.hang))
        };
        match state {
            None | Some((_, _, true, _)) => Err(Error::network(address, "connection refused")),
            Some((_, _, _, true)) => std::future::pending().await,
            Some((node_id, storage, false, false)) => Ok((node_id, storage)),
        }
    }
}

fn row_key(row: &Value) -> (i64, String) {
    (
        row.get("created_at").and_then(Value::as_i64).unwrap_or_default(),
        row.get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    )
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn node_id(&self, address: &str) -> Result<String> {
        let (node_id, _) = self.reach(address).await?;
        Ok(node_id)
    }

    async fn fetch_since(&self, address: &str, query: &PullQuery) -> Result<PullPage> {
        let (_, storage) = self.reach(address).await?;
        let (allowed, cap) = self.with_node(address, |n| {
            let allowed = n.fail_fetch_after.map_or(true, |limit| n.fetches_ok < limit);
            if allowed {
                n.fetches_ok += 1;
            }
            (allowed, n.page_cap)
        });
        if !allowed {
            return Err(Error::network(address, "connection reset by peer"));
        }

        let limit = cap.map_or(query.limit, |cap| cap.min(query.limit));
        let reports = storage.get_since(&SinceQuery {
            origin: query.origin.clone(),
            since: query.since,
            after_id: query.after_id.clone(),
            limit,
        })?;

        let cursor = (
            query.since,
            query.after_id.clone().unwrap_or_default(),
        );
        let extra = self.with_node(address, |n| n.extra_rows.clone());

        let mut rows: Vec<Value> = reports
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<_, _>>()?;
        rows.extend(extra.into_iter().filter(|row| {
            let key = row_key(row);
            if query.after_id.is_some() {
                key > cursor
            } else {
                key.0 >= cursor.0
            }
        }));
        rows.sort_by_key(row_key);
        rows.truncate(limit);

        Ok(PullPage::from_rows(rows))
    }

    async fn push(&self, address: &str, report: &LocationReport) -> Result<PushAck> {
        let (_, storage) = self.reach(address).await?;
        let allowed = self.with_node(address, |n| {
            n.push_attempts += 1;
            let allowed = n.fail_push_after.map_or(true, |limit| n.pushes_ok < limit);
            if allowed {
                n.pushes_ok += 1;
            }
            allowed
        });
        if !allowed {
            return Err(Error::network(address, "peer answered 503 Service Unavailable"));
        }

        let appended = storage.append(report)?;
        Ok(if appended.inserted {
            PushAck::Stored
        } else {
            PushAck::Duplicate
        })
    }
}

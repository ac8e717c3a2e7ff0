//! Node identity.
//!
//! A node id is generated once, on first boot, and stored in the database
//! metadata table. Every later start reads the stored value back, so the id
//! survives restarts for as long as the database does.

use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::Storage;

/// Metadata key the node id is stored under.
pub const NODE_ID_KEY: &str = "node_id";

/// This node's stable identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    node_id: String,
}

impl NodeIdentity {
    /// Load the persisted node id, generating and storing one if none exists.
    ///
    /// A configured `override_id` wins over the stored value but is never
    /// written back, so removing it from configuration restores the
    /// generated id.
    ///
    /// # Errors
    ///
    /// Returns an error if the override is blank or the database operation fails.
    pub fn load_or_create(storage: &Storage, override_id: Option<&str>) -> Result<Self> {
        if let Some(id) = override_id {
            let id = id.trim();
            if id.is_empty() {
                return Err(Error::ConfigValidation {
                    message: "node.id must not be empty".to_string(),
                });
            }
            info!(node_id = %id, "Using configured node id");
            return Ok(Self {
                node_id: id.to_string(),
            });
        }

        let candidate = Uuid::new_v4().to_string();
        let node_id = storage.metadata_get_or_insert(NODE_ID_KEY, &candidate)?;
        if node_id == candidate {
            info!(node_id = %node_id, "Generated new node id");
        } else {
            info!(node_id = %node_id, "Loaded node id");
        }

        Ok(Self { node_id })
    }

    /// Create an identity from a known id.
    #[must_use]
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }

    /// The node id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.node_id
    }
}

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_once_and_reused() {
        let storage = Storage::open_in_memory().unwrap();
        let first = NodeIdentity::load_or_create(&storage, None).unwrap();
        let second = NodeIdentity::load_or_create(&storage, None).unwrap();

        assert_eq!(first, second);
        assert!(Uuid::parse_str(first.id()).is_ok());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.db");

        let first = {
            let storage = Storage::open(&path).unwrap();
            NodeIdentity::load_or_create(&storage, None).unwrap()
        };
        let storage = Storage::open(&path).unwrap();
        assert_eq!(NodeIdentity::load_or_create(&storage, None).unwrap(), first);
    }

    #[test]
    fn test_override_is_not_persisted() {
        let storage = Storage::open_in_memory().unwrap();
        let configured = NodeIdentity::load_or_create(&storage, Some("relay-7")).unwrap();
        assert_eq!(configured.id(), "relay-7");
        assert!(storage.metadata_value(NODE_ID_KEY).unwrap().is_none());
    }

    #[test]
    fn test_blank_override_rejected() {
        let storage = Storage::open_in_memory().unwrap();
        assert!(NodeIdentity::load_or_create(&storage, Some("  ")).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(NodeIdentity::new("node-a").to_string(), "node-a");
    }
}

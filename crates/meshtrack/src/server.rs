//! Assembling and running a node.
//!
//! A [`Node`] owns everything one meshtrack process needs: the store, its
//! identity and the sync engine. [`Node::serve`] runs the API and the sync
//! scheduler side by side until the cancellation token fires.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::{self, AppState};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::node::NodeIdentity;
use crate::storage::Storage;
use crate::sync::{self, SyncEngine};

/// A fully wired node.
#[derive(Debug)]
pub struct Node {
    config: Config,
    storage: Arc<Storage>,
    identity: NodeIdentity,
    engine: Arc<SyncEngine>,
}

impl Node {
    /// Open the database, establish the node id and build the sync engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the engine
    /// cannot be built.
    pub fn open(config: Config) -> Result<Self> {
        let storage = Arc::new(Storage::open(config.database_path())?);
        Self::with_storage(config, storage)
    }

    /// Build a node around an already opened store.
    ///
    /// # Errors
    ///
    /// Returns an error if the node id cannot be established or the engine
    /// cannot be built.
    pub fn with_storage(config: Config, storage: Arc<Storage>) -> Result<Self> {
        let identity = NodeIdentity::load_or_create(&storage, config.node.id.as_deref())?;
        let engine = sync::build_engine(&config, Arc::clone(&storage), &identity)?;
        Ok(Self {
            config,
            storage,
            identity,
            engine,
        })
    }

    /// The node's configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The node's Location Store.
    #[must_use]
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// The node's identity.
    #[must_use]
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// The node's sync engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// State for the API router.
    #[must_use]
    pub fn app_state(&self) -> AppState {
        AppState {
            storage: Arc::clone(&self.storage),
            identity: self.identity.clone(),
            engine: Arc::clone(&self.engine),
        }
    }

    /// Serve the API on `listener` and run the sync scheduler until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails.
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            node_id = %self.identity,
            address = %local_addr,
            peers = self.engine.peers().len(),
            "meshtrack node listening"
        );

        let scheduler = tokio::spawn(Arc::clone(&self.engine).run(cancel.child_token()));

        let app = api::router(self.app_state());
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(cancel.clone().cancelled_owned())
            .await;

        // The server can also stop on its own; the scheduler must not outlive it.
        cancel.cancel();
        if let Err(e) = scheduler.await {
            warn!("Sync scheduler task ended abnormally: {}", e);
        }

        served.map_err(Error::from)?;
        info!("meshtrack node stopped");
        Ok(())
    }
}

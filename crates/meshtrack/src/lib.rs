//! `meshtrack` - Location tracking for disaster-relief mesh networks
//!
//! Every node keeps its own append-only store of entity location reports and
//! serves it over HTTP. A background sync engine exchanges reports with each
//! reachable peer in both directions, so every node converges on the full set
//! of reports without any central server.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod geo;
pub mod logging;
pub mod node;
pub mod peers;
pub mod report;
pub mod server;
pub mod storage;
pub mod sync;

pub use config::Config;
pub use error::{Error, Result};
pub use logging::init_logging;
pub use node::NodeIdentity;
pub use report::{EntityType, LocationReport, Position};
pub use storage::{Storage, StorageStats};
pub use sync::SyncEngine;

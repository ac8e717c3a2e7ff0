//! Command-line interface for meshtrack.
//!
//! This module provides the CLI structure for the `meshtrack` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{ConfigCommand, OutputArgs, ServeCommand};

/// meshtrack - Location tracking for disaster-relief mesh networks
///
/// Stores entity location reports on every mesh node and keeps the nodes'
/// copies converging by syncing with every reachable peer.
#[derive(Debug, Parser)]
#[command(name = "meshtrack")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the API server and the background sync scheduler
    Serve(ServeCommand),

    /// Run one sync cycle against every known peer and exit
    Sync(OutputArgs),

    /// Show node and storage status
    Status(OutputArgs),

    /// List peers and their sync watermarks
    Peers(OutputArgs),

    /// Print this node's id
    NodeId,

    /// View or check configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        crate::logging::Verbosity::from_flags(self.quiet, self.verbose)
    }
}

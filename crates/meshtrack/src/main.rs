//! `meshtrack` - CLI for a meshtrack node
//!
//! This binary runs the node's API and sync scheduler, and offers one-shot
//! commands for syncing and inspecting a node's local state.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use meshtrack::cli::{Cli, Command, ConfigCommand, ServeCommand};
use meshtrack::server::Node;
use meshtrack::storage::Storage;
use meshtrack::{init_logging, Config, NodeIdentity};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Load configuration
    let config = Config::load_from(cli.config.clone()).context("loading configuration")?;

    // Execute the command
    match cli.command {
        Command::Serve(serve_cmd) => handle_serve(config, serve_cmd).await,
        Command::Sync(output) => handle_sync(config, output.json).await,
        Command::Status(output) => handle_status(config, output.json),
        Command::Peers(output) => handle_peers(&config, output.json),
        Command::NodeId => handle_node_id(&config),
        Command::Config(config_cmd) => handle_config(&config, config_cmd),
    }
}

async fn handle_serve(mut config: Config, cmd: ServeCommand) -> anyhow::Result<()> {
    if let Some(bind) = cmd.bind {
        config.server.bind_address = bind;
    }
    if cmd.no_sync {
        config.sync.enabled = false;
    }
    config.validate()?;

    let addr = config.bind_address()?;
    let node = Node::open(config).context("opening node")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
        }
        on_signal.cancel();
    });

    node.serve(listener, cancel).await?;
    Ok(())
}

async fn handle_sync(config: Config, json: bool) -> anyhow::Result<()> {
    let node = Node::open(config).context("opening node")?;
    let report = node.engine().run_cycle().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Sync cycle from {}", node.identity());
    println!("----------------");
    println!("Peers attempted:    {}", report.attempted);
    println!("Peers succeeded:    {}", report.succeeded);
    println!("Reports pushed:     {}", report.pushed);
    println!("Reports pulled:     {}", report.pulled);
    println!("Duration:           {} ms", report.duration_ms);
    for peer in &report.peers {
        match &peer.error {
            Some(message) => println!("  {} ({}): failed: {message}", peer.peer_id, peer.address),
            None => println!(
                "  {} ({}): pushed {}, pulled {}, rejected {}",
                peer.peer_id, peer.address, peer.pushed, peer.pulled, peer.rejected
            ),
        }
    }
    Ok(())
}

fn handle_status(config: Config, json: bool) -> anyhow::Result<()> {
    let node = Node::open(config).context("opening node")?;
    let stats = node.storage().stats()?;
    let peers = node.engine().peers().len();

    if json {
        let status = serde_json::json!({
            "node_id": node.identity().id(),
            "database_path": node.storage().path(),
            "bind_address": node.config().server.bind_address,
            "sync_enabled": node.config().sync.enabled,
            "configured_peers": peers,
            "storage": stats,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("meshtrack status");
        println!("----------------");
        println!("Node id:          {}", node.identity());
        println!("Database:         {}", node.storage().path().display());
        println!("Database size:    {} bytes", stats.db_size_bytes);
        println!("Reports:          {}", stats.total_reports);
        println!("Entities:         {}", stats.distinct_entities);
        println!("Oldest report:    {}", optional(stats.oldest_report));
        println!("Newest report:    {}", optional(stats.newest_report));
        println!("Peers known:      {peers}");
        println!("Peers synced:     {}", stats.known_peers);
    }
    Ok(())
}

fn handle_peers(config: &Config, json: bool) -> anyhow::Result<()> {
    let storage = Storage::open(config.database_path()).context("opening database")?;
    let entries = storage.sync_log().list()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No peers have been synced yet.");
        return Ok(());
    }
    println!(
        "{:<38} {:<22} {:>14} {:>14}",
        "PEER", "ADDRESS", "FORWARD", "BACKWARD"
    );
    for entry in entries {
        println!(
            "{:<38} {:<22} {:>14} {:>14}",
            entry.peer_node_id,
            entry.last_known_address.as_deref().unwrap_or("-"),
            entry.last_forward_sync_at,
            entry.last_backward_sync_at
        );
    }
    Ok(())
}

fn handle_node_id(config: &Config) -> anyhow::Result<()> {
    let storage = Storage::open(config.database_path()).context("opening database")?;
    let identity = NodeIdentity::load_or_create(&storage, config.node.id.as_deref())?;
    println!("{identity}");
    Ok(())
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Storage]");
                println!("  Database path:        {}", config.database_path().display());
                println!();
                println!("[Node]");
                println!(
                    "  Id:                   {}",
                    config.node.id.as_deref().unwrap_or("(generated)")
                );
                println!();
                println!("[Server]");
                println!("  Bind address:         {}", config.server.bind_address);
                println!();
                println!("[Sync]");
                println!("  Enabled:              {}", config.sync.enabled);
                println!("  Interval (s):         {}", config.sync.interval_secs);
                println!("  Startup delay (s):    {}", config.sync.startup_delay_secs);
                println!("  Max concurrent peers: {}", config.sync.max_concurrent_peers);
                println!("  Peer timeout (s):     {}", config.sync.peer_timeout_secs);
                println!("  Request timeout (s):  {}", config.sync.request_timeout_secs);
                println!("  Page size:            {}", config.sync.page_size);
                println!("  Push batch size:      {}", config.sync.push_batch_size);
                println!();
                println!("[Peers]");
                println!("  Known:                {}", config.peers.known.len());
                println!("  Candidates:           {}", config.peers.candidates.len());
                println!();
                println!("[Discovery]");
                println!("  batctl:               {}", config.discovery.batctl_enabled);
                println!("  Link-local prefix:    {}", config.discovery.link_local_prefix);
                println!("  Peer port:            {}", config.discovery.peer_port);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => println!("Configuration error: {e}"),
            }
        }
    }
    Ok(())
}

fn optional(value: Option<i64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

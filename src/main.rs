//! wg-peerd: WireGuard peer daemon
//!
//! This is the entry point for the daemon and its one-shot commands.
//!
//! # Usage
//!
//! ```bash
//! # Run the poll loop
//! sudo wg-peerd run
//!
//! # Manage peers
//! sudo wg-peerd add laptop > laptop.conf
//! sudo wg-peerd block <public key>
//! sudo wg-peerd list --json
//!
//! # Run with environment overrides
//! WG_PEERD_LOG_LEVEL=debug sudo wg-peerd -c /path/to/config.json run
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use wg_peerd::config::{create_default_config, load_config_with_env, Config};
use wg_peerd::driver::WgCommandDriver;
use wg_peerd::peer::{validate_endpoint, validate_wg_key, PeerError, PeerManager, PeerSnapshot};

/// WireGuard peer registry and runtime reconciliation daemon
#[derive(Debug, Parser)]
#[command(name = "wg-peerd", version)]
struct Cli {
    /// Configuration file path
    #[arg(
        short,
        long,
        global = true,
        env = "WG_PEERD_CONFIG",
        default_value = "/etc/wg-peerd/config.json"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Bring the interface up if needed and run the poll loop
    Run,
    /// Create a peer and print its client config
    Add {
        /// Peer name
        name: String,
    },
    /// Null-route a peer
    Block {
        /// Peer public key
        public_key: String,
    },
    /// Restore a blocked peer
    Unblock {
        /// Peer public key
        public_key: String,
    },
    /// Delete a peer
    Delete {
        /// Peer public key
        public_key: String,
    },
    /// List peers with their runtime state
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Print the stored client config of a peer
    ShowConfig {
        /// Peer public key
        public_key: String,
    },
    /// Restart the interface
    Restart,
    /// Report drift between registry, config file and interface
    Audit,
    /// Repair drift that can be rebuilt safely
    Repair,
    /// Write a default configuration file and exit
    GenerateConfig,
    /// Validate the configuration and exit
    Check,
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target)
        .with_writer(std::io::stderr);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Attach the machine-readable kind and any warnings to an engine error
fn peer_error(e: PeerError) -> anyhow::Error {
    for warning in e.warnings() {
        warn!("{warning}");
    }
    anyhow!("{} ({})", e.detail(), e.kind())
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
}

/// Check the parts of the configuration that only matter to clients
fn check_config(config: &Config) -> Result<()> {
    if config.interface.server_public_key.is_empty() {
        eprintln!("warning: interface.server_public_key is empty; client configs will be unusable");
    } else {
        validate_wg_key(&config.interface.server_public_key)
            .context("interface.server_public_key is not a WireGuard key")?;
    }

    if config.interface.endpoint.is_empty() {
        eprintln!("warning: interface.endpoint is empty; client configs will have no Endpoint");
    } else {
        validate_endpoint(&config.interface.endpoint).context("interface.endpoint is invalid")?;
    }

    Ok(())
}

fn print_table(peers: &[PeerSnapshot]) {
    println!(
        "{:<20} {:<15} {:<8} {:<7} {:>12} {:>12}  PUBLIC KEY",
        "NAME", "ADDRESS", "STATE", "ONLINE", "RX", "TX"
    );
    for peer in peers {
        let state = match (peer.blocked, peer.in_runtime) {
            (true, _) => "blocked",
            (false, true) => "active",
            (false, false) => "missing",
        };
        println!(
            "{:<20} {:<15} {:<8} {:<7} {:>12} {:>12}  {}",
            peer.name,
            peer.address,
            state,
            if peer.online { "yes" } else { "no" },
            peer.rx_bytes,
            peer.tx_bytes,
            peer.public_key
        );
    }
}

/// Run the poll loop until SIGINT or SIGTERM
async fn run(manager: PeerManager) -> Result<()> {
    match manager.ensure_interface_up().await {
        Ok(true) => info!("Interface was down and has been brought up"),
        Ok(false) => {}
        // Keep polling so the snapshot reports the interface as unavailable
        Err(e) => error!(error = %e, kind = %e.kind(), "Failed to bring interface up"),
    }

    let poller = Arc::clone(manager.poller());
    let poll_handle = tokio::spawn(Arc::clone(&poller).run());

    let mut snapshots = manager.subscribe();
    let mut shutdown_rx = poller.shutdown_sender().subscribe();
    let log_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    debug!(
                        peers = snapshot.peers.len(),
                        online = snapshot.online_count(),
                        interface_up = snapshot.summary.available,
                        "status snapshot"
                    );
                    if let Some(e) = &snapshot.registry_error {
                        warn!(error = %e, "status snapshot without registry data");
                    }
                }
            }
        }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
        }
        result = wait_for_sigterm() => {
            result.context("Failed to register SIGTERM handler")?;
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    poller.shutdown();
    if let Err(e) = poll_handle.await {
        warn!(error = %e, "poller task ended abnormally");
    }
    if let Err(e) = log_handle.await {
        warn!(error = %e, "snapshot logger ended abnormally");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if matches!(cli.command, Command::GenerateConfig) {
        create_default_config(&cli.config)?;
        println!("Generated default configuration at {}", cli.config.display());
        return Ok(());
    }

    let config = load_config_with_env(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    if matches!(cli.command, Command::Check) {
        check_config(&config)?;
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);
    debug!(
        version = wg_peerd::VERSION,
        config = %cli.config.display(),
        interface = %config.interface.name,
        "configuration loaded"
    );

    let driver = Arc::new(WgCommandDriver::from_config(&config.interface, &config.driver));
    let manager = PeerManager::new(&config, driver);
    manager.prepare_storage().map_err(peer_error)?;

    match cli.command {
        Command::Run => {
            info!("wg-peerd v{}", wg_peerd::VERSION);
            run(manager).await?;
        }
        Command::Add { name } => {
            let created = manager.create_peer(&name).await.map_err(peer_error)?;
            print_warnings(&created.warnings);
            eprintln!(
                "Created {} at {} (public key {})",
                created.record.name, created.record.address, created.record.public_key
            );
            print!("{}", created.bundle.render());
        }
        Command::Block { public_key } => {
            let outcome = manager.block_peer(&public_key).await.map_err(peer_error)?;
            print_warnings(&outcome.warnings);
            println!("Blocked {}", outcome.record.name);
        }
        Command::Unblock { public_key } => {
            let outcome = manager.unblock_peer(&public_key).await.map_err(peer_error)?;
            print_warnings(&outcome.warnings);
            println!("Unblocked {}", outcome.record.name);
        }
        Command::Delete { public_key } => {
            let outcome = manager.delete_peer(&public_key).await.map_err(peer_error)?;
            print_warnings(&outcome.warnings);
            println!("Deleted {}", outcome.record.name);
        }
        Command::List { json } => {
            let peers = manager.list_peers().await.map_err(peer_error)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&peers)?);
            } else {
                print_table(&peers);
            }
        }
        Command::ShowConfig { public_key } => {
            print!("{}", manager.client_config(&public_key).map_err(peer_error)?);
        }
        Command::Restart => {
            let warnings = manager.restart_interface().await.map_err(peer_error)?;
            print_warnings(&warnings);
            println!("Restarted {}", config.interface.name);
        }
        Command::Audit => {
            let report = manager.audit().await.map_err(peer_error)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_clean() {
                bail!("drift detected");
            }
        }
        Command::Repair => {
            let report = manager.repair().await.map_err(peer_error)?;
            print_warnings(&report.warnings);
            println!(
                "Adopted {} orphan block(s), re-applied {} peer(s)",
                report.adopted.len(),
                report.reapplied.len()
            );
        }
        Command::GenerateConfig | Command::Check => unreachable!("handled before logging init"),
    }

    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> std::io::Result<()> {
    // On non-Unix platforms, just wait forever
    std::future::pending::<()>().await;
    Ok(())
}

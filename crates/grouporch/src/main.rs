//! grouporchd entry point.
//!
//! Loads the configuration file, starts one group orchestrator per mastered
//! device against simulated devices and runs the daemon loop until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use sr_grouporch::audit::{init_logging, init_logging_pretty};
use sr_grouporch::config_file::GroupOrchdConfig;
use sr_grouporch::daemon::simulated::SimulatedProgrammer;
use sr_grouporch::daemon::{GroupOrchDaemon, GroupOrchDaemonConfig};
use sr_grouporch::{GroupOrchContext, GroupStore, RoutingLock};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Segment-routing group orchestrator
#[derive(Parser, Debug)]
#[command(name = "grouporchd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = "/etc/sonic/grouporchd.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Human-readable logs instead of JSON
    #[arg(long)]
    pretty_logs: bool,

    /// Heartbeat interval in milliseconds, overrides the file
    #[arg(long)]
    heartbeat_interval: Option<u64>,

    /// Verification interval in seconds, overrides the file
    #[arg(long)]
    verify_interval: Option<u64>,

    /// Devices hash over label-swapping buckets
    #[arg(long)]
    mpls_ecmp: bool,
}

async fn run(args: Args) -> Result<()> {
    let mut config = GroupOrchdConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(ms) = args.heartbeat_interval {
        config.daemon.heartbeat_interval_ms = ms;
    }
    if let Some(secs) = args.verify_interval {
        config.orch.verify_interval_secs = secs;
    }
    config.orch.mpls_ecmp |= args.mpls_ecmp;
    config.validate().context("invalid configuration")?;

    info!("Heartbeat interval: {}ms", config.daemon.heartbeat_interval_ms);
    info!("Verification interval: {}s", config.orch.verify_interval_secs);
    info!("MPLS ECMP: {}", config.orch.mpls_ecmp);
    info!(
        "Topology: {} devices, {} links, {} VLAN ports",
        config.devices.len(),
        config.links.len(),
        config.vlans.len()
    );

    let context = GroupOrchContext {
        programmer: Arc::new(SimulatedProgrammer::new()),
        device_config: Arc::new(config.device_config()),
        routing: Arc::new(config.routing_state()),
        routing_lock: RoutingLock::new(),
        store: GroupStore::new(config.daemon.member_id),
    };
    let mut daemon = GroupOrchDaemon::new(
        GroupOrchDaemonConfig {
            heartbeat_interval_ms: config.daemon.heartbeat_interval_ms,
            tombstone_horizon: config.daemon.tombstone_horizon,
        },
        config.orch_config(),
        context,
        config.topology_links(),
    );

    for device in config.devices.iter().filter(|d| d.master) {
        daemon
            .add_device(device.id.clone())
            .with_context(|| format!("starting orchestrator for {}", device.id))?;
    }
    if daemon.orch_count() == 0 {
        warn!("No mastered devices configured, running idle");
    }

    if !daemon.init().await {
        anyhow::bail!("daemon initialization failed");
    }
    daemon.spawn_verifiers();

    let handle = daemon.handle();
    let shutdown = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Received SIGINT, shutting down gracefully...");
                handle.stop();
            }
            Err(err) => error!("Failed to listen for ctrl-c: {}", err),
        }
    });

    info!("Starting event loop...");
    daemon.run().await;
    shutdown.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.pretty_logs {
        init_logging_pretty(&args.log_level);
    } else {
        init_logging(&args.log_level);
    }

    info!("Starting grouporchd");
    match run(args).await {
        Ok(()) => {
            info!("grouporchd shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("grouporchd failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

//! RTLS Node - Main entry point
//!
//! Runs the task coordinator on the configured UDP port with the JSON
//! codec, the static anchor cluster and the tag tracker.

use anyhow::Result;
use clap::Parser;
use rtls_task::{RunOptions, TaskCoordinator, TaskEvent};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use rtls_daemon::anchors::NodeClusters;
use rtls_daemon::config;
use rtls_daemon::protocol::JsonProtocol;

#[derive(Parser, Debug)]
#[command(name = "rtls-node")]
#[command(about = "Real-time location system node: UDP ingest and ToF routing")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "rtls.toml")]
    config: PathBuf,

    /// UDP listen port (overrides the configuration file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Write a default configuration file to --config and exit
    #[arg(long)]
    write_default_config: bool,

    /// Forget tracked tags on start
    #[arg(long)]
    reset_tracks: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if args.write_default_config {
        config::save_default_config(&args.config)?;
        info!(path = %args.config.display(), "Wrote default configuration");
        return Ok(());
    }

    info!("RTLS node v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = config::load_config(&args.config)?;

    if let Some(port) = args.port {
        config.task.port = port;
    }

    info!(
        bind = %config.task.bind_addr(),
        anchors = config.anchors.len(),
        "Configuration loaded"
    );

    let coordinator = TaskCoordinator::from_factory(
        config.task.clone(),
        JsonProtocol::new(config.protocol.clone()),
        &NodeClusters,
        &config.anchors,
        &config.tags,
    );

    tokio::spawn(log_events(coordinator.subscribe()));

    let options = RunOptions {
        tag_cluster: rtls_task::TagRunOptions {
            reset_tracks: args.reset_tracks,
        },
    };
    if let Some(anchors) = coordinator.run(options).await?.anchors() {
        anchors.publish();
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    coordinator.shutdown().await?;

    Ok(())
}

/// Log outward task events until the coordinator goes away
async fn log_events(mut events: tokio::sync::broadcast::Receiver<TaskEvent>) {
    loop {
        match events.recv().await {
            Ok(TaskEvent::Listening(addr)) => info!(local = %addr, "Accepting UDP traffic"),
            Ok(TaskEvent::Error(fault)) if fault.is_network() => {
                error!(error = %fault, "Network side stopped");
            }
            Ok(TaskEvent::Error(fault)) => warn!(error = %fault, "Task fault"),
            Ok(TaskEvent::Packet(packet)) => debug!(
                anchor = %packet.header.anchor_id,
                kind = %packet.payload.name(),
                "Packet"
            ),
            Ok(TaskEvent::AnchorPosition(positions)) => {
                for (anchor, p) in &positions {
                    info!(anchor = %anchor, x = p.x, y = p.y, z = p.z, "Anchor position");
                }
            }
            Err(RecvError::Lagged(missed)) => warn!(missed = missed, "Event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

// Velotrain - Main Entry Point

use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use velotrain::clock::SystemClock;
use velotrain::config::{Args, Config};
use velotrain::coordinator::Coordinator;
use velotrain::telegraph::LogTelegraph;
use velotrain::udp::UdpServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.verbose);

    info!("Starting velotrain timing filter");
    let config = Config::load(&args)?;
    if config.sync.is_none() {
        warn!("Sync master not configured");
    }
    if config.dhi.is_some() {
        info!("DHI scoreboard configured, served by external serializer");
    }

    // configuration errors are the only fatal kind
    let coordinator = Coordinator::new(
        config.clone(),
        Box::new(LogTelegraph),
        Box::new(SystemClock),
    )?;

    let (tx, rx) = mpsc::channel(256);

    let host = if config.uaddr.is_empty() {
        "0.0.0.0"
    } else {
        config.uaddr.as_str()
    };
    let addr_str = format!("{}:{}", host, config.uport);
    let udp = match addr_str.parse::<std::net::SocketAddr>() {
        Ok(addr) => match UdpServer::start(addr, tx.clone()).await {
            Ok(server) => Some(server),
            Err(e) => {
                error!("Failed to start UDP listener on {}: {}", addr, e);
                None
            }
        },
        Err(e) => {
            error!("Invalid UDP address '{}': {}", addr_str, e);
            None
        }
    };

    let handle = tokio::spawn(coordinator.run(rx));
    info!("Server ready");

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal (Ctrl+C)");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
            return Err(err.into());
        }
    }

    info!("Shutting down...");
    if let Some(server) = udp {
        server.shutdown().await;
    }
    // closing the event channel lets the coordinator publish its final
    // offline status and exit
    drop(tx);
    let _ = handle.await;

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(verbose: bool) {
    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true);

    if verbose {
        subscriber.with_max_level(tracing::Level::DEBUG).init();
        info!("Verbose logging enabled (DEBUG level)");
    } else {
        subscriber.with_max_level(tracing::Level::INFO).init();
    }
}

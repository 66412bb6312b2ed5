use anyhow::Result;
use clap::Parser;
use log::{error, info};
use tokio::signal;
use tokio::sync::watch;

use spectrum_mono::{run, Args};

/// First Ctrl-C requests a graceful shutdown, the second one exits immediately.
fn setup_signal_handler() -> watch::Receiver<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        loop {
            match signal::ctrl_c().await {
                Ok(()) => {
                    if *shutdown_tx.borrow() {
                        error!("Force exit requested - terminating immediately");
                        std::process::exit(1);
                    }
                    info!("Shutdown signal received - finishing the current cycle");
                    info!("Press Ctrl-C again to force exit");
                    let _ = shutdown_tx.send(true);
                }
                Err(err) => {
                    error!("Error setting up signal handler: {}", err);
                    break;
                }
            }
        }
    });

    shutdown_rx
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder().format_timestamp_secs().init();

    let args = Args::parse();
    let shutdown = setup_signal_handler();

    info!("System has {} CPU cores available", num_cpus::get());
    info!("Press Ctrl-C to initiate graceful shutdown, Ctrl-C again to force exit");

    run(args, shutdown).await
}

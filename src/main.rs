//! ft - File Tunnel command line

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, select};
use tracing::{error, info};

use file_tunnel::cli::Args;
use file_tunnel::{logger, Endpoint};

fn main() -> Result<()> {
    let args = Args::parse();
    let (config, role) = args.resolve().context("invalid arguments")?;

    logger::init(config.verbose, args.log_file.as_deref())?;
    info!("File Tunnel {}", env!("CARGO_PKG_VERSION"));
    let endpoint = Endpoint::start(config, role)?;

    let (interrupt_tx, interrupt_rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(());
    })
    .context("failed to install Ctrl-C handler")?;

    let failures = endpoint.failures();
    select! {
        recv(interrupt_rx) -> _ => {
            info!("interrupted, shutting down");
            endpoint.shutdown();
            Ok(())
        }
        recv(failures) -> reason => {
            let reason = reason.unwrap_or_else(|_| "event loop ended".to_string());
            error!("fatal: {reason}");
            endpoint.shutdown();
            std::process::exit(1);
        }
    }
}

//! cposd entry point.
//!
//! Starts the daemon, blocks on the termination signals, then performs the
//! ordered shutdown. A failure to construct the core state (config parse,
//! bad arguments) exits non-zero before any channel is opened; everything
//! after that is self-healing and the process runs until signaled.

use std::path::PathBuf;

use anyhow::Context;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing_subscriber::EnvFilter;

use cposd::Daemon;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = cposd_config::load_config(config_path.as_deref())
        .context("loading configuration")?;
    tracing::info!(
        device = %config.modem.device,
        gps = %format!("{}:{}", config.gps.host, config.gps.port),
        "cposd starting"
    );

    let daemon = Daemon::new(config);
    daemon.start()?;

    let mut signals =
        Signals::new([SIGHUP, SIGINT, SIGTERM]).context("installing signal handlers")?;
    tracing::info!("ready, waiting for termination signal");
    if let Some(signal) = signals.forever().next() {
        tracing::info!(signal, "termination signal received");
    }

    daemon.stop();
    Ok(())
}

//! `rfsync run`: start the configured server or client in the foreground.

use anyhow::{Context, Result};
use clap::Args;

use rfsync_daemon::{init_tracing, start_blocking};

use crate::ConfigArg;

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub config: ConfigArg,

    /// Log at debug level regardless of RUST_LOG.
    #[arg(long)]
    pub debug: bool,
}

impl RunArgs {
    pub fn run(self) -> Result<()> {
        let config = self.config.load()?;
        init_tracing(self.debug);
        tracing::info!(
            config = %self.config.path.display(),
            service = ?config.service_type,
            address = %config.address,
            root = %config.path.display(),
            "starting rfsync",
        );
        start_blocking(config).context("rfsync exited with error")
    }
}

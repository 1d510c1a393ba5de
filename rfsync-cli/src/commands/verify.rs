//! `rfsync verify`: load and validate a config file.

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use rfsync_core::{Config, ConfigError, ServiceType};

use crate::ConfigArg;

#[derive(Args, Debug)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub config: ConfigArg,
}

impl VerifyArgs {
    pub fn run(self) -> Result<()> {
        let path = &self.config.path;
        let config = Config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?;

        match config.validate() {
            Ok(()) => {}
            Err(ConfigError::Invalid(problems)) => {
                for problem in &problems {
                    eprintln!("{} {problem}", "error:".red().bold());
                }
                bail!("{} has {} problem(s)", path.display(), problems.len());
            }
            Err(err) => return Err(err).context("validation failed"),
        }

        let role = match config.service_type {
            ServiceType::Server => "server",
            ServiceType::Client => "client",
        };
        println!(
            "{} {role} {} {}",
            "ok".green().bold(),
            config.address,
            config.path.display()
        );
        Ok(())
    }
}

//! rfsync: one-way directory sync over TCP/TLS.
//!
//! # Usage
//!
//! ```text
//! rfsync run -c <config.yml> [--debug]
//! rfsync user add <name> -c <config.yml>      (password on stdin)
//! rfsync user delete <name> -c <config.yml>
//! rfsync user list -c <config.yml>
//! rfsync files -c <config.yml> [--json]
//! rfsync verify -c <config.yml>
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use commands::{files::FilesArgs, run::RunArgs, user::UserCommand, verify::VerifyArgs};
use rfsync_core::Config;

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "rfsync",
    version,
    about = "Mirror a directory tree from a server to its clients",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the server or the client described by the config file.
    Run(RunArgs),

    /// Manage the server's password file.
    User {
        #[command(subcommand)]
        command: UserCommand,
    },

    /// Print the metadata snapshot of the configured root.
    Files(FilesArgs),

    /// Validate a config file without starting anything.
    Verify(VerifyArgs),
}

// ---------------------------------------------------------------------------
// Shared --config argument
// ---------------------------------------------------------------------------

#[derive(Args, Debug, Clone)]
pub struct ConfigArg {
    /// Path to the YAML service configuration.
    #[arg(long = "config", short = 'c', value_name = "FILE")]
    pub path: PathBuf,
}

impl ConfigArg {
    /// Load and validate the config file.
    pub fn load(&self) -> Result<Config> {
        Config::load_validated(&self.path)
            .with_context(|| format!("failed to load config {}", self.path.display()))
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => args.run(),
        Commands::User { command } => commands::user::run(command),
        Commands::Files(args) => args.run(),
        Commands::Verify(args) => args.run(),
    }
}

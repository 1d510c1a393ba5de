//! `rfsync user add|delete|list`: maintain the server's password file.

use std::io::{self, BufRead};

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;

use rfsync_core::{Config, CredentialStore};

use crate::ConfigArg;

#[derive(Subcommand, Debug)]
pub enum UserCommand {
    /// Add a user; the password is read from the first line of stdin.
    Add(UserArgs),
    /// Remove a user.
    Delete(UserArgs),
    /// List known usernames.
    List(ListArgs),
}

#[derive(Args, Debug)]
pub struct UserArgs {
    /// Username: a letter followed by letters, digits or `_`.
    pub name: String,

    #[command(flatten)]
    pub config: ConfigArg,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[command(flatten)]
    pub config: ConfigArg,
}

pub fn run(command: UserCommand) -> Result<()> {
    match command {
        UserCommand::Add(args) => {
            let store = open_store(&args.config)?;
            let password = read_password(io::stdin().lock())?;
            store
                .create_user(&args.name, &password)
                .with_context(|| format!("failed to add user {}", args.name))?;
            println!("{} {}", "added".green().bold(), args.name);
        }
        UserCommand::Delete(args) => {
            let store = open_store(&args.config)?;
            let deleted = store
                .delete_user(&args.name)
                .with_context(|| format!("failed to delete user {}", args.name))?;
            if !deleted {
                bail!("no such user: {}", args.name);
            }
            println!("{} {}", "deleted".yellow().bold(), args.name);
        }
        UserCommand::List(args) => {
            let store = open_store(&args.config)?;
            let names = store.usernames();
            if names.is_empty() {
                println!("No users in {}", store.path().display());
            }
            for name in names {
                println!("{name}");
            }
        }
    }
    Ok(())
}

fn open_store(arg: &ConfigArg) -> Result<CredentialStore> {
    let config = Config::load(&arg.path)
        .with_context(|| format!("failed to load config {}", arg.path.display()))?;
    let Some(pw_file) = config.server.pw_file else {
        bail!("{} has no server.pwFile", arg.path.display());
    };
    CredentialStore::open(&pw_file)
        .with_context(|| format!("failed to open password file {}", pw_file.display()))
}

fn read_password(mut input: impl BufRead) -> Result<String> {
    let mut line = String::new();
    input
        .read_line(&mut line)
        .context("failed to read password from stdin")?;
    let password = line.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        bail!("empty password on stdin");
    }
    Ok(password.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_the_first_line_without_its_newline() {
        let password = read_password("s3cret pass\r\nignored\n".as_bytes()).unwrap();
        assert_eq!(password, "s3cret pass");
    }

    #[test]
    fn empty_password_is_refused() {
        assert!(read_password("\n".as_bytes()).is_err());
        assert!(read_password("".as_bytes()).is_err());
    }
}

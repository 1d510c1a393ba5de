//! `rfsync files`: what the metadata cache sees under the configured root.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use tabled::{settings::Style, Table, Tabled};

use rfsync_core::{FileMeta, MetadataCache};

use crate::ConfigArg;

#[derive(Args, Debug)]
pub struct FilesArgs {
    #[command(flatten)]
    pub config: ConfigArg,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct FileRow {
    #[tabled(rename = "file")]
    name: String,
    #[tabled(rename = "size")]
    size: u64,
    #[tabled(rename = "modified")]
    modified: String,
}

impl FilesArgs {
    pub fn run(self) -> Result<()> {
        let config = self.config.load()?;
        let cache = MetadataCache::new(&config.path)
            .with_context(|| format!("failed to scan {}", config.path.display()))?;
        let files = cache.list_all();

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&files).context("failed to render file list JSON")?
            );
            return Ok(());
        }

        if files.is_empty() {
            println!("No files under {}", cache.root().display());
            return Ok(());
        }
        let mut table = Table::new(files.iter().map(row));
        table.with(Style::rounded());
        println!("{table}");
        println!("{} files", files.len());
        Ok(())
    }
}

fn row(meta: &FileMeta) -> FileRow {
    FileRow {
        name: meta.name.clone(),
        size: meta.size,
        modified: format_time(meta.modify_time),
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::RunOverrides;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch, clean, then classify: the whole pipeline.
    Run(RunArgs),
    /// Fetch raw chapter pages only.
    Fetch(RunArgs),
    /// Extract and sanitize raw pages into offline chapters plus an index.
    Clean(RunArgs),
    /// Scan artifacts and write the remediation list.
    Report(ReportArgs),
    /// Re-fetch every chapter the classifier flags, then clean and report.
    Retry(RunArgs),
    Manifest {
        #[command(subcommand)]
        command: ManifestCommand,
    },
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Novel project file (YAML).
    #[arg(long)]
    pub config: PathBuf,

    /// Concurrent browser sessions (1-4).
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// First chapter number to process.
    #[arg(long)]
    pub start: Option<u32>,

    /// Last chapter number to process (inclusive).
    #[arg(long)]
    pub end: Option<u32>,

    /// Show the browser window.
    #[arg(long, default_value_t = false)]
    pub headful: bool,
}

impl RunArgs {
    pub fn overrides(&self) -> RunOverrides {
        RunOverrides {
            concurrency: self.concurrency,
            start: self.start,
            end: self.end,
            headful: self.headful,
        }
    }
}

#[derive(Debug, Args)]
pub struct ReportArgs {
    /// Novel project file (YAML).
    #[arg(long)]
    pub config: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum ManifestCommand {
    /// Convert a plain-text chapter list into a JSON manifest.
    Import(ManifestImportArgs),
}

#[derive(Debug, Args)]
pub struct ManifestImportArgs {
    /// Text file with one `Chapter <n> <title>` line per chapter.
    #[arg(long)]
    pub input: PathBuf,

    /// Novel landing URL; chapter URLs become `<base-url>/chapter-<n>-<slug>`.
    #[arg(long)]
    pub base_url: String,

    #[arg(long)]
    pub novel_id: String,

    /// Output manifest path.
    #[arg(long)]
    pub out: PathBuf,

    /// Overwrite an existing manifest.
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

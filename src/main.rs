use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser as _;
use novel_scrape::browser::BrowserFetcher;
use novel_scrape::cli::{Cli, Command, ManifestCommand, RunArgs};
use novel_scrape::config::{self, NovelConfig, RunOverrides};
use novel_scrape::pipeline::Pipeline;
use novel_scrape::scheduler::DispatchMode;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    novel_scrape::logging::init().context("init logging")?;

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        Command::Run(args) => {
            let (pipeline, fetcher) = open_with_browser(&args)?;
            let report = interruptible(pipeline.run(fetcher)).await.context("run")?;
            println!("{}", report.counts());
            print!("{}", novel_scrape::report::render_summary(&report.report.records));
        }
        Command::Fetch(args) => {
            let (pipeline, fetcher) = open_with_browser(&args)?;
            let tasks = pipeline.tasks()?;
            let summary = interruptible(pipeline.fetch(fetcher, &tasks, DispatchMode::SkipExisting))
                .await
                .context("fetch")?;
            println!(
                "fetched {}, skipped {}, failed {}",
                summary.fetched.len(),
                summary.skipped.len(),
                summary.failed.len()
            );
        }
        Command::Clean(args) => {
            let pipeline = open(&args.config, args.overrides())?;
            let tasks = pipeline.tasks()?;
            let summary = pipeline.clean(&tasks).await.context("clean")?;
            println!(
                "cleaned {}, rewritten {}, failed {}, missing {}, indexed {}",
                summary.cleaned.len(),
                summary.rewritten,
                summary.failed.len(),
                summary.missing.len(),
                summary.indexed
            );
        }
        Command::Report(args) => {
            let pipeline = open(&args.config, RunOverrides::default())?;
            let report = pipeline.report().await.context("report")?;
            print!("{}", novel_scrape::report::render_summary(&report.records));
        }
        Command::Retry(args) => {
            let (pipeline, fetcher) = open_with_browser(&args)?;
            let report = interruptible(pipeline.remediate(fetcher))
                .await
                .context("retry")?;
            println!("{}", report.counts());
            print!("{}", novel_scrape::report::render_summary(&report.report.records));
        }
        Command::Manifest {
            command: ManifestCommand::Import(args),
        } => {
            let manifest = novel_scrape::manifest::import(&args).context("manifest import")?;
            println!(
                "wrote {} chapters to {}",
                manifest.chapters.len(),
                args.out.display()
            );
        }
    }

    Ok(())
}

fn load_config(path: &Path, overrides: RunOverrides) -> anyhow::Result<NovelConfig> {
    let mut config = config::load(path)?;
    config.apply(overrides).context("apply command-line overrides")?;
    Ok(config)
}

fn open(path: &Path, overrides: RunOverrides) -> anyhow::Result<Pipeline> {
    Ok(Pipeline::new(load_config(path, overrides)?))
}

fn open_with_browser(args: &RunArgs) -> anyhow::Result<(Pipeline, Arc<BrowserFetcher>)> {
    let config = load_config(&args.config, args.overrides())?;
    let fetcher = Arc::new(BrowserFetcher::new(&config));
    Ok((Pipeline::new(config), fetcher))
}

/// Ctrl-C drops the in-flight work; every artifact is written atomically, so a
/// re-run resumes from what is already on disk.
async fn interruptible<T>(
    work: impl std::future::Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    tokio::select! {
        result = work => result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("listen for ctrl-c")?;
            anyhow::bail!("interrupted; re-run the same command to resume")
        }
    }
}

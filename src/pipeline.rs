use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context as _;

use crate::artifact_store::ArtifactStore;
use crate::challenge::ChallengeDetector;
use crate::clean::{CleanSummary, Cleaner};
use crate::config::NovelConfig;
use crate::fetch::ChapterFetcher;
use crate::formats::{ChapterTask, ErrorReport};
use crate::manifest;
use crate::report;
use crate::scheduler::{DispatchMode, FetchSummary, Scheduler};

#[derive(Debug, Clone)]
pub struct RunReport {
    pub fetch: FetchSummary,
    pub clean: CleanSummary,
    pub report: ErrorReport,
}

impl RunReport {
    /// One-line run-level counts.
    pub fn counts(&self) -> String {
        format!(
            "fetched {}, skipped {}, fetch failures {}, cleaned {}, flagged {}",
            self.fetch.fetched.len(),
            self.fetch.skipped.len(),
            self.fetch.failed.len(),
            self.clean.cleaned.len(),
            self.report.records.len()
        )
    }
}

/// One novel's pipeline, parameterized entirely by its config.
pub struct Pipeline {
    config: NovelConfig,
    store: ArtifactStore,
    detector: ChallengeDetector,
}

impl Pipeline {
    pub fn new(config: NovelConfig) -> Self {
        let store = ArtifactStore::new(config.out_dir());
        let detector = ChallengeDetector::new(&config.challenge_markers);
        Self {
            config,
            store,
            detector,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn tasks(&self) -> anyhow::Result<Vec<ChapterTask>> {
        manifest::tasks(&self.config).context("build chapter task list")
    }

    pub async fn fetch(
        &self,
        fetcher: Arc<dyn ChapterFetcher>,
        tasks: &[ChapterTask],
        mode: DispatchMode,
    ) -> anyhow::Result<FetchSummary> {
        Scheduler::new(fetcher, self.store.clone(), &self.config.fetch)
            .run(tasks, mode)
            .await
    }

    pub async fn clean(&self, tasks: &[ChapterTask]) -> anyhow::Result<CleanSummary> {
        let total = manifest::known_total(&self.config)?;
        let novel_title = self.config.display_title();
        Cleaner {
            store: &self.store,
            settings: &self.config.extract,
            detector: &self.detector,
            novel_title: &novel_title,
            total,
        }
        .run(tasks)
        .await
    }

    pub async fn report(&self) -> anyhow::Result<ErrorReport> {
        let records = report::scan(&self.store, &self.config.extract, &self.detector).await?;
        report::write_report(&self.store, records).await
    }

    /// Fetch (skipping finished chapters), clean, then classify.
    pub async fn run(&self, fetcher: Arc<dyn ChapterFetcher>) -> anyhow::Result<RunReport> {
        let tasks = self.tasks()?;
        tracing::info!(
            novel = %self.config.novel_id,
            tasks = tasks.len(),
            out = %self.store.root().display(),
            "run: fetch"
        );
        let fetch = self
            .fetch(fetcher, &tasks, DispatchMode::SkipExisting)
            .await
            .context("fetch")?;

        tracing::info!("run: clean");
        let clean = self.clean(&tasks).await.context("clean")?;

        tracing::info!("run: report");
        let report = self.report().await.context("report")?;

        Ok(RunReport {
            fetch,
            clean,
            report,
        })
    }

    /// Classifies the artifacts, force-refetches every flagged chapter in the
    /// task list, then cleans and classifies again. The same scheduler and
    /// retry controller serve whole runs and targeted passes.
    pub async fn remediate(&self, fetcher: Arc<dyn ChapterFetcher>) -> anyhow::Result<RunReport> {
        let tasks = self.tasks()?;
        let records = report::scan(&self.store, &self.config.extract, &self.detector)
            .await
            .context("scan artifacts")?;
        let flagged: BTreeSet<u32> = records.iter().map(|record| record.number).collect();
        let targets: Vec<ChapterTask> = tasks
            .iter()
            .filter(|task| flagged.contains(&task.number))
            .cloned()
            .collect();

        tracing::info!(
            flagged = flagged.len(),
            targets = targets.len(),
            "retry: fetch flagged chapters"
        );
        let fetch = if targets.is_empty() {
            FetchSummary::default()
        } else {
            self.fetch(fetcher, &targets, DispatchMode::Refetch)
                .await
                .context("fetch")?
        };

        tracing::info!("retry: clean");
        let clean = self.clean(&tasks).await.context("clean")?;

        tracing::info!("retry: report");
        let report = self.report().await.context("report")?;

        Ok(RunReport {
            fetch,
            clean,
            report,
        })
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::Semaphore;
use tokio::task::{Id as TaskId, JoinError, JoinSet};

use crate::artifact_store::{ArtifactStore, RawState};
use crate::config::{FetchSettings, Jitter, MAX_CONCURRENCY};
use crate::fetch::{ChapterFetcher, TimeoutBudget};
use crate::formats::{ChapterTask, ErrorCategory};
use crate::retry::{FinalResult, RetryPolicy, fetch_with_retry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Leave chapters with a valid raw artifact alone.
    SkipExisting,
    /// Fetch every task, overwriting whatever is on disk.
    Refetch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChapterOutcome {
    Fetched { attempts: u32 },
    Skipped,
    Failed { category: ErrorCategory, message: String },
}

/// Run-level tallies, aggregated from settled tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub fetched: Vec<u32>,
    pub skipped: Vec<u32>,
    pub failed: Vec<(u32, ErrorCategory)>,
}

impl FetchSummary {
    fn record(&mut self, number: u32, outcome: ChapterOutcome) {
        match outcome {
            ChapterOutcome::Fetched { .. } => self.fetched.push(number),
            ChapterOutcome::Skipped => self.skipped.push(number),
            ChapterOutcome::Failed { category, .. } => self.failed.push((number, category)),
        }
    }

    fn sort(&mut self) {
        self.fetched.sort_unstable();
        self.skipped.sort_unstable();
        self.failed.sort_unstable();
    }
}

pub struct Scheduler {
    fetcher: Arc<dyn ChapterFetcher>,
    store: ArtifactStore,
    policy: RetryPolicy,
    budget: TimeoutBudget,
    concurrency: usize,
    inter_task_delay: Jitter,
}

impl Scheduler {
    pub fn new(
        fetcher: Arc<dyn ChapterFetcher>,
        store: ArtifactStore,
        settings: &FetchSettings,
    ) -> Self {
        Self {
            fetcher,
            store,
            policy: RetryPolicy::from_settings(settings),
            budget: TimeoutBudget::from_settings(settings),
            concurrency: settings.concurrency.clamp(1, MAX_CONCURRENCY),
            inter_task_delay: settings.inter_task_delay,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_inter_task_delay(mut self, delay: Jitter) -> Self {
        self.inter_task_delay = delay;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.clamp(1, MAX_CONCURRENCY);
        self
    }

    pub async fn run(
        &self,
        tasks: &[ChapterTask],
        mode: DispatchMode,
    ) -> anyhow::Result<FetchSummary> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut running = JoinSet::new();
        let mut numbers: HashMap<TaskId, u32> = HashMap::new();
        let mut summary = FetchSummary::default();
        let mut dispatched = 0usize;

        tracing::info!(
            tasks = tasks.len(),
            concurrency = self.concurrency,
            ?mode,
            "fetch: start"
        );

        for task in tasks {
            if mode == DispatchMode::SkipExisting && self.has_valid_artifact(task.number).await {
                tracing::debug!(chapter = task.number, "raw artifact present; skipping");
                summary.record(task.number, ChapterOutcome::Skipped);
                continue;
            }

            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .context("scheduler semaphore closed")?;
            if dispatched > 0 {
                tokio::time::sleep(self.inter_task_delay.sample()).await;
            }
            dispatched += 1;

            let fetcher = Arc::clone(&self.fetcher);
            let store = self.store.clone();
            let policy = self.policy;
            let budget = self.budget;
            let task = task.clone();
            let number = task.number;
            let handle = running.spawn(async move {
                let _permit = permit;
                run_task(fetcher.as_ref(), &store, &task, &policy, budget).await
            });
            numbers.insert(handle.id(), number);

            while let Some(joined) = running.try_join_next_with_id() {
                settle(&mut summary, &mut numbers, joined);
            }
        }

        while let Some(joined) = running.join_next_with_id().await {
            settle(&mut summary, &mut numbers, joined);
        }

        summary.sort();
        tracing::info!(
            fetched = summary.fetched.len(),
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            "fetch: done"
        );
        Ok(summary)
    }

    async fn has_valid_artifact(&self, number: u32) -> bool {
        match self.store.raw_state(number).await {
            Ok(RawState::Valid) => true,
            Ok(RawState::Missing) => false,
            Ok(RawState::Sentinel(sentinel)) => {
                tracing::info!(
                    chapter = number,
                    category = %sentinel.category,
                    "re-queueing chapter flagged by an earlier run"
                );
                false
            }
            Err(err) => {
                tracing::warn!(chapter = number, ?err, "could not inspect raw artifact; fetching");
                false
            }
        }
    }
}

/// A chapter task that panicked or was cancelled still counts, as a
/// scrape failure.
fn settle(
    summary: &mut FetchSummary,
    numbers: &mut HashMap<TaskId, u32>,
    joined: Result<(TaskId, ChapterOutcome), JoinError>,
) {
    let (id, outcome) = match joined {
        Ok((id, outcome)) => (id, outcome),
        Err(err) => {
            tracing::error!(?err, "chapter task aborted");
            let message = format!("chapter task aborted: {err}");
            (
                err.id(),
                ChapterOutcome::Failed {
                    category: ErrorCategory::ScrapeFailure,
                    message,
                },
            )
        }
    };
    match numbers.remove(&id) {
        Some(number) => summary.record(number, outcome),
        None => tracing::error!(%id, "settled task has no chapter number"),
    }
}

async fn run_task(
    fetcher: &dyn ChapterFetcher,
    store: &ArtifactStore,
    task: &ChapterTask,
    policy: &RetryPolicy,
    budget: TimeoutBudget,
) -> ChapterOutcome {
    match fetch_with_retry(fetcher, task, policy, budget).await {
        FinalResult::Success { raw_html, attempts } => {
            match store.write_raw(task.number, &raw_html).await {
                Ok(()) => {
                    tracing::info!(
                        chapter = task.number,
                        attempts,
                        bytes = raw_html.len(),
                        "chapter fetched"
                    );
                    ChapterOutcome::Fetched { attempts }
                }
                Err(err) => {
                    tracing::error!(chapter = task.number, ?err, "persist raw artifact");
                    ChapterOutcome::Failed {
                        category: ErrorCategory::ScrapeFailure,
                        message: format!("{err:#}"),
                    }
                }
            }
        }
        FinalResult::PermanentFailure {
            task,
            category,
            last_message,
            ..
        } => {
            if let Err(err) = store.write_sentinel(&task, category, &last_message).await {
                tracing::error!(chapter = task.number, ?err, "persist sentinel artifact");
            }
            ChapterOutcome::Failed {
                category,
                message: last_message,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::artifact_store::Sentinel;
    use crate::fetch::FetchResult;
    use crate::retry::tests::ScriptedFetcher;

    fn tasks(numbers: &[u32]) -> Vec<ChapterTask> {
        numbers
            .iter()
            .map(|number| ChapterTask {
                number: *number,
                url: format!("https://example.com/chapter-{number}"),
                known_title: None,
            })
            .collect()
    }

    fn scheduler(fetcher: Arc<dyn ChapterFetcher>, store: &ArtifactStore) -> Scheduler {
        Scheduler::new(fetcher, store.clone(), &FetchSettings::default())
            .with_policy(RetryPolicy::immediate(2))
            .with_inter_task_delay(Jitter::ZERO)
    }

    #[tokio::test]
    async fn skips_valid_artifacts_and_requeues_sentinels() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = ArtifactStore::new(temp.path());
        store.write_raw(1, "<html><body>done</body></html>").await?;
        store
            .write_sentinel(&tasks(&[2])[0], ErrorCategory::ScrapeFailure, "timeout")
            .await?;

        let fetcher = Arc::new(ScriptedFetcher::default());
        let summary = scheduler(fetcher.clone(), &store)
            .run(&tasks(&[1, 2, 3]), DispatchMode::SkipExisting)
            .await?;

        assert_eq!(summary.skipped, vec![1]);
        assert_eq!(summary.fetched, vec![2, 3]);
        assert_eq!(fetcher.calls(), vec![2, 3]);
        assert_eq!(store.raw_state(2).await?, RawState::Valid);
        Ok(())
    }

    #[tokio::test]
    async fn permanent_failure_leaves_sentinel_and_run_continues() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = ArtifactStore::new(temp.path());
        let fetcher = Arc::new(
            ScriptedFetcher::default().with(2, vec![FetchResult::ContentNotFound]),
        );

        let summary = scheduler(fetcher.clone(), &store)
            .run(&tasks(&[1, 2, 3]), DispatchMode::SkipExisting)
            .await?;

        assert_eq!(summary.fetched, vec![1, 3]);
        assert_eq!(summary.failed, vec![(2, ErrorCategory::ContentMissing)]);
        assert_eq!(fetcher.calls(), vec![1, 2, 2, 3]);
        let RawState::Sentinel(Sentinel { category, .. }) = store.raw_state(2).await? else {
            panic!("expected sentinel for chapter 2");
        };
        assert_eq!(category, ErrorCategory::ContentMissing);
        Ok(())
    }

    #[tokio::test]
    async fn refetch_ignores_existing_artifacts() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = ArtifactStore::new(temp.path());
        store.write_raw(1, "old").await?;

        let fetcher = Arc::new(ScriptedFetcher::default());
        let summary = scheduler(fetcher.clone(), &store)
            .run(&tasks(&[1]), DispatchMode::Refetch)
            .await?;

        assert_eq!(summary.fetched, vec![1]);
        assert_ne!(store.read_raw(1).await?.as_deref(), Some("old"));
        Ok(())
    }

    struct SlowFetcher {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ChapterFetcher for SlowFetcher {
        async fn fetch(&self, task: &ChapterTask, _budget: TimeoutBudget) -> FetchResult {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            FetchResult::Success {
                raw_html: format!("<p>{}</p>", task.number),
            }
        }
    }

    #[tokio::test]
    async fn concurrency_is_bounded() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = ArtifactStore::new(temp.path());
        let fetcher = Arc::new(SlowFetcher {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let summary = scheduler(fetcher.clone(), &store)
            .with_concurrency(2)
            .run(&tasks(&[1, 2, 3, 4, 5, 6]), DispatchMode::SkipExisting)
            .await?;

        assert_eq!(summary.fetched, vec![1, 2, 3, 4, 5, 6]);
        assert!(fetcher.peak.load(Ordering::SeqCst) <= 2);
        Ok(())
    }

    struct PanickingFetcher;

    #[async_trait::async_trait]
    impl ChapterFetcher for PanickingFetcher {
        async fn fetch(&self, task: &ChapterTask, _budget: TimeoutBudget) -> FetchResult {
            if task.number == 2 {
                panic!("renderer crashed on chapter 2");
            }
            FetchResult::Success {
                raw_html: format!("<p>{}</p>", task.number),
            }
        }
    }

    #[tokio::test]
    async fn panicked_task_counts_as_scrape_failure() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = ArtifactStore::new(temp.path());

        let summary = scheduler(Arc::new(PanickingFetcher), &store)
            .with_concurrency(2)
            .run(&tasks(&[1, 2, 3]), DispatchMode::SkipExisting)
            .await?;

        assert_eq!(summary.fetched, vec![1, 3]);
        assert_eq!(summary.failed, vec![(2, ErrorCategory::ScrapeFailure)]);
        assert_eq!(
            summary.fetched.len() + summary.skipped.len() + summary.failed.len(),
            3
        );
        Ok(())
    }
}

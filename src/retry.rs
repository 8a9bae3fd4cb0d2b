use std::time::Duration;

use rand::Rng as _;

use crate::config::FetchSettings;
use crate::fetch::{ChapterFetcher, FetchResult, TimeoutBudget};
use crate::formats::{ChapterTask, ErrorCategory};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter: Duration,
    /// Extra wait after an attempt that ended on a bot challenge.
    pub challenge_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &FetchSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            jitter: Duration::from_millis(settings.retry_jitter_ms),
            challenge_backoff: Duration::from_millis(settings.challenge_backoff_ms),
        }
    }

    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            jitter: Duration::ZERO,
            challenge_backoff: Duration::ZERO,
        }
    }

    /// Wait before the attempt following `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32, last: &FetchResult) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = match jitter_ms {
            0 => Duration::ZERO,
            max => Duration::from_millis(rand::rng().random_range(0..=max)),
        };
        let mut delay = self.base_delay.saturating_mul(attempt) + jitter;
        if matches!(last, FetchResult::BotChallenge { .. }) {
            delay += self.challenge_backoff;
        }
        delay
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalResult {
    Success {
        raw_html: String,
        attempts: u32,
    },
    PermanentFailure {
        task: ChapterTask,
        category: ErrorCategory,
        last_message: String,
        attempts: u32,
    },
}

/// Runs the fetcher until it succeeds or the attempt budget is spent. Every
/// non-success result is retried alike; only exhaustion is terminal.
pub async fn fetch_with_retry(
    fetcher: &dyn ChapterFetcher,
    task: &ChapterTask,
    policy: &RetryPolicy,
    budget: TimeoutBudget,
) -> FinalResult {
    let mut attempt = 1;
    loop {
        tracing::info!(chapter = task.number, attempt, url = %task.url, "fetch attempt");
        let result = match fetcher.fetch(task, budget).await {
            FetchResult::Success { raw_html } => {
                return FinalResult::Success {
                    raw_html,
                    attempts: attempt,
                };
            }
            failure => failure,
        };
        let category = result
            .error_category()
            .unwrap_or(ErrorCategory::ScrapeFailure);

        let message = result.message();
        if attempt >= policy.max_attempts {
            tracing::error!(
                chapter = task.number,
                attempts = attempt,
                %category,
                %message,
                "attempt budget exhausted"
            );
            return FinalResult::PermanentFailure {
                task: task.clone(),
                category,
                last_message: message,
                attempts: attempt,
            };
        }

        let delay = policy.delay_after(attempt, &result);
        tracing::warn!(
            chapter = task.number,
            attempt,
            kind = result.kind(),
            %message,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "fetch attempt failed; retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

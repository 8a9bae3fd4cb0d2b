use std::time::Duration;

use crate::config::FetchSettings;
use crate::formats::{ChapterTask, ErrorCategory};

/// What the page looked like when a challenge outlasted the dwell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeSnapshot {
    pub title: String,
    pub marker: String,
}

/// Outcome of one fetch attempt. Every failure mode is a value; a fetcher
/// never returns an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    Success { raw_html: String },
    BotChallenge { snapshot: ChallengeSnapshot },
    ContentNotFound,
    TransientError { message: String },
}

impl FetchResult {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchResult::Success { .. } => "success",
            FetchResult::BotChallenge { .. } => "bot_challenge",
            FetchResult::ContentNotFound => "content_not_found",
            FetchResult::TransientError { .. } => "transient_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            FetchResult::Success { .. } => String::new(),
            FetchResult::BotChallenge { snapshot } => format!(
                "bot challenge persisted after dwell (marker {:?}, title {:?})",
                snapshot.marker, snapshot.title
            ),
            FetchResult::ContentNotFound => {
                "no content container appeared within the content timeout".to_owned()
            }
            FetchResult::TransientError { message } => message.clone(),
        }
    }

    /// Category recorded in the sentinel when this is the last attempt's
    /// result.
    pub fn error_category(&self) -> Option<ErrorCategory> {
        match self {
            FetchResult::Success { .. } => None,
            FetchResult::BotChallenge { .. } => Some(ErrorCategory::BotChallengeResidual),
            FetchResult::ContentNotFound => Some(ErrorCategory::ContentMissing),
            FetchResult::TransientError { .. } => Some(ErrorCategory::ScrapeFailure),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutBudget {
    pub navigation: Duration,
    pub content: Duration,
    pub fallback: Duration,
}

impl TimeoutBudget {
    pub fn from_settings(settings: &FetchSettings) -> Self {
        Self {
            navigation: Duration::from_secs(settings.navigation_timeout_secs),
            content: Duration::from_secs(settings.content_timeout_secs),
            fallback: Duration::from_secs(settings.fallback_timeout_secs),
        }
    }
}

/// Loads one chapter URL. Implementations own their session lifetime: nothing
/// may outlive a single call.
#[async_trait::async_trait]
pub trait ChapterFetcher: Send + Sync {
    async fn fetch(&self, task: &ChapterTask, budget: TimeoutBudget) -> FetchResult;
}

use std::fmt;

use serde::{Deserialize, Serialize};

/// One unit of work. Identity is `number`; the task list never holds two
/// tasks with the same number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterTask {
    pub number: u32,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub known_title: Option<String>,
}

/// `chapters.json` as written by `manifest import`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub novel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chapters: Option<usize>,
    pub chapters: Vec<ChapterDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterDescriptor {
    pub number: u32,
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ScrapeFailure,
    ContentMissing,
    BotChallengeResidual,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::ScrapeFailure => "scrape_failure",
            ErrorCategory::ContentMissing => "content_missing",
            ErrorCategory::BotChallengeResidual => "bot_challenge_residual",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "scrape_failure" => Some(ErrorCategory::ScrapeFailure),
            "content_missing" => Some(ErrorCategory::ContentMissing),
            "bot_challenge_residual" => Some(ErrorCategory::BotChallengeResidual),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub number: u32,
    pub category: ErrorCategory,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub generated_at: String,
    pub records: Vec<ErrorRecord>,
}

impl ErrorReport {
    pub fn numbers(&self) -> Vec<u32> {
        self.records.iter().map(|record| record.number).collect()
    }
}

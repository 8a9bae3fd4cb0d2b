use std::sync::LazyLock;

use anyhow::Context as _;
use chrono::SecondsFormat;
use scraper::{Html, Selector};

use crate::artifact_store::{ArtifactStore, RawState};
use crate::challenge::ChallengeDetector;
use crate::config::ExtractSettings;
use crate::extract::extract;
use crate::formats::{ChapterTask, ErrorCategory};
use crate::render::{self, ChapterPage};

static CLEAN_TITLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h1.chapter-title").expect("valid clean title selector"));

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanSummary {
    pub cleaned: Vec<u32>,
    /// Clean artifacts whose bytes actually changed.
    pub rewritten: usize,
    pub failed: Vec<(u32, ErrorCategory)>,
    pub missing: Vec<u32>,
    pub indexed: usize,
}

pub struct Cleaner<'a> {
    pub store: &'a ArtifactStore,
    pub settings: &'a ExtractSettings,
    pub detector: &'a ChallengeDetector,
    pub novel_title: &'a str,
    /// Highest known sequence number, for next-links.
    pub total: u32,
}

enum Cleaned {
    Written { changed: bool },
    Rejected(ErrorCategory, String),
    Missing,
}

impl Cleaner<'_> {
    pub async fn run(&self, tasks: &[ChapterTask]) -> anyhow::Result<CleanSummary> {
        tracing::info!(tasks = tasks.len(), "clean: start");
        let mut summary = CleanSummary::default();

        for task in tasks {
            match self.clean_one(task).await? {
                Cleaned::Written { changed } => {
                    summary.cleaned.push(task.number);
                    if changed {
                        summary.rewritten += 1;
                    }
                }
                Cleaned::Rejected(category, reason) => {
                    tracing::warn!(chapter = task.number, %category, %reason, "chapter not cleaned");
                    if self.store.remove_clean(task.number).await? {
                        tracing::info!(chapter = task.number, "removed stale clean artifact");
                    }
                    summary.failed.push((task.number, category));
                }
                Cleaned::Missing => summary.missing.push(task.number),
            }
        }

        summary.indexed = self.write_index().await?;
        tracing::info!(
            cleaned = summary.cleaned.len(),
            rewritten = summary.rewritten,
            failed = summary.failed.len(),
            missing = summary.missing.len(),
            "clean: done"
        );
        Ok(summary)
    }

    async fn clean_one(&self, task: &ChapterTask) -> anyhow::Result<Cleaned> {
        let number = task.number;
        let raw_html = match self.store.raw_state(number).await? {
            RawState::Missing => return Ok(Cleaned::Missing),
            RawState::Sentinel(sentinel) => {
                return Ok(Cleaned::Rejected(sentinel.category, sentinel.message));
            }
            RawState::Valid => self
                .store
                .read_raw(number)
                .await?
                .ok_or_else(|| anyhow::anyhow!("raw artifact vanished: chapter {number}"))?,
        };

        // Challenge text must not pass for chapter content.
        if let Some(marker) = self.detector.detect_html(&raw_html) {
            return Ok(Cleaned::Rejected(
                ErrorCategory::BotChallengeResidual,
                format!("challenge marker {marker:?}"),
            ));
        }

        let extracted = match extract(&raw_html, number, task.known_title.as_deref(), self.settings)
        {
            Ok(extracted) => extracted,
            Err(err) => return Ok(Cleaned::Rejected(ErrorCategory::ContentMissing, err.to_string())),
        };

        let extracted_at = self
            .store
            .raw_modified(number)
            .await?
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        let page = render::chapter_page(&ChapterPage {
            novel_title: self.novel_title,
            number,
            title: &extracted.title,
            body_html: &extracted.body_html,
            extracted_at: &extracted_at,
            total: self.total,
        });
        let changed = self
            .store
            .write_clean_if_changed(number, &page)
            .await
            .with_context(|| format!("write clean chapter {number}"))?;
        tracing::debug!(chapter = number, title = %extracted.title, changed, "chapter cleaned");
        Ok(Cleaned::Written { changed })
    }

    /// Lists every clean artifact on disk, so a range-limited run keeps the
    /// chapters cleaned by earlier runs in the index.
    async fn write_index(&self) -> anyhow::Result<usize> {
        let mut entries = Vec::new();
        for number in self.store.list_clean().await? {
            let Some(html) = self.store.read_clean(number).await? else {
                continue;
            };
            let title = Html::parse_document(&html)
                .select(&CLEAN_TITLE)
                .next()
                .map(|element| element.text().collect::<String>().trim().to_owned())
                .filter(|title| !title.is_empty())
                .unwrap_or_else(|| format!("Chapter {number}"));
            entries.push((number, title));
        }

        let html = render::index_page(self.novel_title, &entries);
        self.store.write_index(&html).await.context("write index")?;
        Ok(entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(number: u32, title: Option<&str>) -> ChapterTask {
        ChapterTask {
            number,
            url: format!("https://example.com/chapter-{number}"),
            known_title: title.map(str::to_owned),
        }
    }

    fn chapter_html(title: &str) -> String {
        format!(
            "<html><head><title>{title} - Site</title></head><body><div id=\"chr-content\"><p>{}</p><script>ads()</script></div></body></html>",
            "Audrey opened the curtains and looked down at the quiet street. ".repeat(12)
        )
    }

    #[tokio::test]
    async fn cleans_valid_chapters_and_drops_stale_ones() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = ArtifactStore::new(temp.path());
        let settings = ExtractSettings::default();
        let detector = ChallengeDetector::default();
        let cleaner = Cleaner {
            store: &store,
            settings: &settings,
            detector: &detector,
            novel_title: "Novel",
            total: 3,
        };

        store.write_raw(1, &chapter_html("First")).await?;
        store
            .write_raw(2, "<html><head><title>Just a moment...</title></head><body></body></html>")
            .await?;
        store.write_clean_if_changed(2, "stale").await?;
        store.write_raw(3, &chapter_html("Third")).await?;

        let tasks = vec![task(1, None), task(2, None), task(3, Some("Manifest Third")), task(4, None)];
        let summary = cleaner.run(&tasks).await?;

        assert_eq!(summary.cleaned, vec![1, 3]);
        assert_eq!(summary.failed, vec![(2, ErrorCategory::BotChallengeResidual)]);
        assert_eq!(summary.missing, vec![4]);
        assert_eq!(summary.indexed, 2);
        assert!(store.read_clean(2).await?.is_none());

        let first = store.read_clean(1).await?.expect("chapter 1 cleaned");
        assert!(first.contains("<h1 class=\"chapter-title\">First</h1>"));
        assert!(!first.contains("ads()"));

        let index = std::fs::read_to_string(store.index_path())?;
        assert!(index.contains(">First<"));
        assert!(index.contains(">Manifest Third<"));
        assert!(!index.contains("chapter_0002.html"));

        let again = cleaner.run(&tasks).await?;
        assert_eq!(again.rewritten, 0);
        Ok(())
    }

    #[tokio::test]
    async fn dialogue_resembling_challenge_text_is_cleaned_and_not_flagged() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = ArtifactStore::new(temp.path());
        let settings = ExtractSettings::default();
        let detector = ChallengeDetector::default();
        let cleaner = Cleaner {
            store: &store,
            settings: &settings,
            detector: &detector,
            novel_title: "Novel",
            total: 1,
        };

        let raw = format!(
            "<html><head><title>Chapter 1 - Site</title></head><body><div id=\"chr-content\"><p>{}</p><p>\"Wait, just a moment,\" Klein said. \"Just a moment, I need to think.\"</p><p>Verification successful, the clerk stamped the form.</p></div></body></html>",
            "The fog rolled over Tingen as the bells rang for the evening service. ".repeat(10)
        );
        store.write_raw(1, &raw).await?;

        let summary = cleaner.run(&[task(1, None)]).await?;
        assert_eq!(summary.cleaned, vec![1]);
        assert!(summary.failed.is_empty());
        let clean = store.read_clean(1).await?.expect("chapter 1 cleaned");
        assert!(clean.contains("just a moment"));

        let records = crate::report::scan(&store, &settings, &detector).await?;
        assert!(records.is_empty(), "unexpected records: {records:?}");
        Ok(())
    }
}

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::LazyLock;

use anyhow::Context as _;
use chrono::{SecondsFormat, Utc};
use scraper::{Html, Selector};

use crate::artifact_store::{ArtifactStore, parse_sentinel, write_atomic};
use crate::challenge::ChallengeDetector;
use crate::config::ExtractSettings;
use crate::extract::{ExtractError, extract};
use crate::formats::{ErrorCategory, ErrorRecord, ErrorReport};
use crate::sanitize::text_len;

static CHAPTER_CONTENT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".chapter-content").expect("valid chapter content selector"));
static BODY: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("body").expect("valid body selector"));

/// Scans raw and clean artifacts for failure signatures. Raw findings take
/// precedence; the result is sorted by sequence number with one record per
/// chapter.
pub async fn scan(
    store: &ArtifactStore,
    settings: &ExtractSettings,
    detector: &ChallengeDetector,
) -> anyhow::Result<Vec<ErrorRecord>> {
    let mut records: BTreeMap<u32, ErrorRecord> = BTreeMap::new();

    for number in store.list_raw().await? {
        let Some(html) = store.read_raw(number).await? else {
            continue;
        };
        if let Some((category, message)) = classify_raw(&html, number, settings, detector) {
            records.entry(number).or_insert(ErrorRecord {
                number,
                category,
                message,
            });
        }
    }

    for number in store.list_clean().await? {
        if records.contains_key(&number) {
            continue;
        }
        let Some(html) = store.read_clean(number).await? else {
            continue;
        };
        if let Some((category, message)) = classify_clean(&html, settings, detector) {
            records.insert(
                number,
                ErrorRecord {
                    number,
                    category,
                    message,
                },
            );
        }
    }

    let records: Vec<_> = records.into_values().collect();
    tracing::info!(flagged = records.len(), "report: scan done");
    Ok(records)
}

fn classify_raw(
    html: &str,
    number: u32,
    settings: &ExtractSettings,
    detector: &ChallengeDetector,
) -> Option<(ErrorCategory, String)> {
    if let Some(sentinel) = parse_sentinel(html) {
        let message = match sentinel.message.as_str() {
            "" => "sentinel error artifact".to_owned(),
            message => message.to_owned(),
        };
        return Some((sentinel.category, message));
    }
    if let Some(marker) = detector.detect_html(html) {
        return Some((
            ErrorCategory::BotChallengeResidual,
            format!("raw artifact contains challenge marker {marker:?}"),
        ));
    }
    match extract(html, number, None, settings) {
        Ok(_) => None,
        Err(err @ ExtractError::ContentNotFound { .. }) => {
            Some((ErrorCategory::ContentMissing, err.to_string()))
        }
    }
}

/// Cleaned pages are checked too: a challenge page that slipped past the
/// cleaner looks like content.
fn classify_clean(
    html: &str,
    settings: &ExtractSettings,
    detector: &ChallengeDetector,
) -> Option<(ErrorCategory, String)> {
    let document = Html::parse_document(html);
    let content = document
        .select(&CHAPTER_CONTENT)
        .next()
        .or_else(|| document.select(&BODY).next())?;

    let text = content.text().collect::<String>();
    if let Some(marker) = detector.page_marker(&text) {
        return Some((
            ErrorCategory::BotChallengeResidual,
            format!("clean artifact contains challenge marker {marker:?}"),
        ));
    }
    let len = text_len(content);
    if len <= settings.min_content_chars {
        return Some((
            ErrorCategory::ContentMissing,
            format!(
                "clean artifact has {len} chars of text (threshold {})",
                settings.min_content_chars
            ),
        ));
    }
    None
}

pub fn group(records: &[ErrorRecord]) -> BTreeMap<ErrorCategory, Vec<u32>> {
    let mut groups: BTreeMap<ErrorCategory, Vec<u32>> = BTreeMap::new();
    for record in records {
        groups.entry(record.category).or_default().push(record.number);
    }
    groups
}

/// Writes `report.json` and the plain retry list next to it.
pub async fn write_report(
    store: &ArtifactStore,
    records: Vec<ErrorRecord>,
) -> anyhow::Result<ErrorReport> {
    let report = ErrorReport {
        generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        records,
    };
    store
        .write_json(&store.report_path(), &report)
        .await
        .context("write report.json")?;

    let retry_list: String = report
        .numbers()
        .iter()
        .map(|number| format!("{number}\n"))
        .collect();
    write_atomic(&store.retry_list_path(), retry_list.as_bytes())
        .await
        .context("write retry list")?;
    Ok(report)
}

pub fn render_summary(records: &[ErrorRecord]) -> String {
    if records.is_empty() {
        return "no chapters need re-fetching\n".to_owned();
    }
    let mut out = format!("{} chapter(s) need re-fetching\n", records.len());
    for (category, numbers) in group(records) {
        let numbers = numbers
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "  {category}: {numbers}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::ChapterTask;
    use crate::render::{ChapterPage, chapter_page};

    fn long_text() -> String {
        "Klein adjusted his hat and stepped into the fog. ".repeat(20)
    }

    fn clean_page(body: &str) -> String {
        chapter_page(&ChapterPage {
            novel_title: "Novel",
            number: 4,
            title: "Four",
            body_html: body,
            extracted_at: "2026-01-01T00:00:00Z",
            total: 9,
        })
    }

    #[tokio::test]
    async fn scan_flags_each_failure_signature_once() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = ArtifactStore::new(temp.path());
        let good = format!("<html><body><div id=\"chr-content\"><p>{}</p></div></body></html>", long_text());

        store.write_raw(1, &good).await?;
        store
            .write_sentinel(
                &ChapterTask {
                    number: 2,
                    url: "https://example.com/2".to_owned(),
                    known_title: None,
                },
                ErrorCategory::ScrapeFailure,
                "net::ERR_TIMED_OUT",
            )
            .await?;
        store
            .write_raw(
                3,
                &format!("<html><head><title>Just a moment...</title></head><body><p>{}</p></body></html>", long_text()),
            )
            .await?;
        store.write_raw(4, &good).await?;
        store
            .write_clean_if_changed(4, &clean_page(&format!("<p>Checking your browser before accessing. {}</p>", long_text())))
            .await?;
        store
            .write_raw(5, "<html><body><div id=\"chr-content\"><p>Short.</p></div></body></html>")
            .await?;
        store.write_clean_if_changed(1, &clean_page(&format!("<p>{}</p>", long_text()))).await?;

        let records = scan(&store, &ExtractSettings::default(), &ChallengeDetector::default()).await?;
        let summary: Vec<_> = records.iter().map(|r| (r.number, r.category)).collect();
        assert_eq!(
            summary,
            vec![
                (2, ErrorCategory::ScrapeFailure),
                (3, ErrorCategory::BotChallengeResidual),
                (4, ErrorCategory::BotChallengeResidual),
                (5, ErrorCategory::ContentMissing),
            ]
        );
        assert_eq!(records[0].message, "net::ERR_TIMED_OUT");
        Ok(())
    }

    #[tokio::test]
    async fn write_report_emits_json_and_retry_list() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = ArtifactStore::new(temp.path());
        let records = vec![
            ErrorRecord {
                number: 2,
                category: ErrorCategory::ContentMissing,
                message: "short".to_owned(),
            },
            ErrorRecord {
                number: 7,
                category: ErrorCategory::ScrapeFailure,
                message: "timeout".to_owned(),
            },
        ];

        let report = write_report(&store, records).await?;
        assert_eq!(report.numbers(), vec![2, 7]);

        let json: ErrorReport =
            serde_json::from_str(&std::fs::read_to_string(store.report_path())?)?;
        assert_eq!(json.records, report.records);
        assert_eq!(std::fs::read_to_string(store.retry_list_path())?, "2\n7\n");

        let summary = render_summary(&report.records);
        assert!(summary.contains("scrape_failure: 7"));
        assert!(summary.contains("content_missing: 2"));
        Ok(())
    }
}

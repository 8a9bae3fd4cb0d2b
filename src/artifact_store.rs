use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::Context as _;
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use scraper::{Html, Selector};
use tokio::fs;

use crate::formats::{ChapterTask, ErrorCategory};
use crate::render::{self, SENTINEL_META, SentinelPage};

static CHAPTER_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^chapter_(\d+)\.html$").expect("valid chapter file regex"));
static SENTINEL_META_SELECTOR: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(&format!("meta[name=\"{SENTINEL_META}\"]")).expect("valid sentinel selector")
});
static SENTINEL_MESSAGE_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".error-message").expect("valid message selector"));

/// Markers left by older runs that wrote error stubs instead of sentinels.
const LEGACY_MARKERS: &[&str] = &["<!-- ERROR:", "ERROR: Failed to scrape"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinel {
    pub category: ErrorCategory,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawState {
    Missing,
    Valid,
    Sentinel(Sentinel),
}

/// Filesystem layout of one novel's output directory. The directory is the
/// only state shared between concurrently running chapter tasks; every write
/// replaces a whole file keyed by sequence number.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join("raw")
    }

    pub fn clean_dir(&self) -> PathBuf {
        self.root.join("clean")
    }

    pub fn raw_path(&self, number: u32) -> PathBuf {
        self.raw_dir().join(render::chapter_file_name(number))
    }

    pub fn clean_path(&self, number: u32) -> PathBuf {
        self.clean_dir().join(render::chapter_file_name(number))
    }

    pub fn index_path(&self) -> PathBuf {
        self.clean_dir().join("index.html")
    }

    pub fn report_path(&self) -> PathBuf {
        self.root.join("report.json")
    }

    pub fn retry_list_path(&self) -> PathBuf {
        self.root.join("retry_chapters.txt")
    }

    pub async fn read_raw(&self, number: u32) -> anyhow::Result<Option<String>> {
        read_optional(&self.raw_path(number)).await
    }

    pub async fn read_clean(&self, number: u32) -> anyhow::Result<Option<String>> {
        read_optional(&self.clean_path(number)).await
    }

    pub async fn raw_state(&self, number: u32) -> anyhow::Result<RawState> {
        Ok(match self.read_raw(number).await? {
            None => RawState::Missing,
            Some(html) => match parse_sentinel(&html) {
                Some(sentinel) => RawState::Sentinel(sentinel),
                None => RawState::Valid,
            },
        })
    }

    pub async fn write_raw(&self, number: u32, html: &str) -> anyhow::Result<()> {
        write_atomic(&self.raw_path(number), html.as_bytes()).await
    }

    pub async fn write_sentinel(
        &self,
        task: &ChapterTask,
        category: ErrorCategory,
        message: &str,
    ) -> anyhow::Result<()> {
        let failed_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let html = render::sentinel_page(&SentinelPage {
            number: task.number,
            url: &task.url,
            category: category.as_str(),
            message,
            failed_at: &failed_at,
        });
        write_atomic(&self.raw_path(task.number), html.as_bytes()).await
    }

    /// Returns whether the file was (re)written.
    pub async fn write_clean_if_changed(&self, number: u32, html: &str) -> anyhow::Result<bool> {
        let path = self.clean_path(number);
        write_if_changed(&path, html).await
    }

    pub async fn write_index(&self, html: &str) -> anyhow::Result<bool> {
        write_if_changed(&self.index_path(), html).await
    }

    /// Returns whether a clean artifact existed.
    pub async fn remove_clean(&self, number: u32) -> anyhow::Result<bool> {
        let path = self.clean_path(number);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("remove clean artifact: {}", path.display()))
            }
        }
    }

    pub async fn list_raw(&self) -> anyhow::Result<Vec<u32>> {
        list_chapters(&self.raw_dir()).await
    }

    pub async fn list_clean(&self) -> anyhow::Result<Vec<u32>> {
        list_chapters(&self.clean_dir()).await
    }

    pub async fn raw_modified(&self, number: u32) -> anyhow::Result<DateTime<Utc>> {
        let path = self.raw_path(number);
        let modified = fs::metadata(&path)
            .await
            .and_then(|metadata| metadata.modified())
            .with_context(|| format!("stat raw artifact: {}", path.display()))?;
        Ok(DateTime::<Utc>::from(modified))
    }

    pub async fn write_json<T: serde::Serialize>(
        &self,
        path: &Path,
        value: &T,
    ) -> anyhow::Result<()> {
        let data = serde_json::to_vec_pretty(value).context("serialize json")?;
        write_atomic(path, &data).await
    }
}

/// Recognizes both the structural sentinel and the legacy error stubs.
pub fn parse_sentinel(html: &str) -> Option<Sentinel> {
    if html.contains(SENTINEL_META) {
        let document = Html::parse_document(html);
        if let Some(meta) = document.select(&SENTINEL_META_SELECTOR).next() {
            let category = meta
                .value()
                .attr("content")
                .and_then(ErrorCategory::parse)
                .unwrap_or(ErrorCategory::ScrapeFailure);
            let message = document
                .select(&SENTINEL_MESSAGE_SELECTOR)
                .next()
                .map(|element| element.text().collect::<String>().trim().to_owned())
                .unwrap_or_default();
            return Some(Sentinel { category, message });
        }
    }

    let marker = LEGACY_MARKERS.iter().find(|marker| html.contains(**marker))?;
    let message = html
        .lines()
        .find(|line| line.contains(marker))
        .and_then(|line| line.split_once("ERROR:"))
        .map(|(_, rest)| rest.trim().trim_end_matches("-->").trim().to_owned())
        .unwrap_or_default();
    Some(Sentinel {
        category: ErrorCategory::ScrapeFailure,
        message,
    })
}

pub async fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp_path, data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}

async fn write_if_changed(path: &Path, html: &str) -> anyhow::Result<bool> {
    if read_optional(path).await?.as_deref() == Some(html) {
        return Ok(false);
    }
    write_atomic(path, html.as_bytes()).await?;
    Ok(true)
}

async fn read_optional(path: &Path) -> anyhow::Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read artifact: {}", path.display())),
    }
}

async fn list_chapters(dir: &Path) -> anyhow::Result<Vec<u32>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("read dir: {}", dir.display()));
        }
    };

    let mut numbers = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("read dir entry: {}", dir.display()))?
    {
        let name = entry.file_name();
        let Some(captures) = name.to_str().and_then(|name| CHAPTER_FILE.captures(name)) else {
            continue;
        };
        if let Ok(number) = captures[1].parse::<u32>() {
            numbers.push(number);
        }
    }
    numbers.sort_unstable();
    numbers.dedup();
    Ok(numbers)
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use rand::Rng as _;
use serde::{Deserialize, Serialize};

use crate::stealth::StealthProfile;

pub const MAX_CONCURRENCY: usize = 4;

/// Per-novel project file. One of these replaces a hand-edited copy of the
/// whole pipeline per novel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NovelConfig {
    pub novel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<ChapterRange>,
    #[serde(default)]
    pub title_overrides: BTreeMap<u32, String>,
    #[serde(default)]
    pub fetch: FetchSettings,
    #[serde(default)]
    pub extract: ExtractSettings,
    #[serde(default)]
    pub stealth: StealthProfile,
    #[serde(default)]
    pub challenge_markers: Vec<String>,

    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterRange {
    pub start: u32,
    pub end: u32,
}

impl ChapterRange {
    pub fn contains(&self, number: u32) -> bool {
        (self.start..=self.end).contains(&number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jitter {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Jitter {
    pub const ZERO: Jitter = Jitter {
        min_ms: 0,
        max_ms: 0,
    };

    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub fn sample(&self) -> Duration {
        if self.max_ms <= self.min_ms {
            return Duration::from_millis(self.min_ms);
        }
        Duration::from_millis(rand::rng().random_range(self.min_ms..=self.max_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchSettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub retry_jitter_ms: u64,
    pub challenge_dwell_ms: u64,
    pub challenge_backoff_ms: u64,
    pub concurrency: usize,
    pub inter_task_delay: Jitter,
    pub pre_navigation_delay: Jitter,
    pub settle_delay: Jitter,
    pub navigation_timeout_secs: u64,
    pub content_timeout_secs: u64,
    pub fallback_timeout_secs: u64,
    pub headless: bool,
    pub chrome_executable: Option<PathBuf>,
    pub debug_dir: Option<PathBuf>,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 5_000,
            retry_jitter_ms: 3_000,
            challenge_dwell_ms: 10_000,
            challenge_backoff_ms: 15_000,
            concurrency: 1,
            inter_task_delay: Jitter::new(3_000, 8_000),
            pre_navigation_delay: Jitter::new(1_000, 2_000),
            settle_delay: Jitter::new(2_000, 3_000),
            navigation_timeout_secs: 60,
            content_timeout_secs: 30,
            fallback_timeout_secs: 10,
            headless: true,
            chrome_executable: None,
            debug_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtractSettings {
    pub content_selectors: Vec<String>,
    pub title_selectors: Vec<String>,
    pub title_separator: String,
    pub min_content_chars: usize,
    pub min_paragraph_chars: usize,
}

impl Default for ExtractSettings {
    fn default() -> Self {
        Self {
            content_selectors: [
                "#chr-content",
                ".chr-c",
                ".chapter-content",
                ".content-area",
                ".reading-content",
                ".text-left",
                ".entry-content",
                ".novel-content",
                ".chapter-text",
                ".chapter-body",
                "#novel-content",
                "#chapter-content",
                "article",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
            title_selectors: ["h3.chr-title", ".chr-title", ".chapter-title", "h2 a"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            title_separator: " - ".to_owned(),
            min_content_chars: 500,
            min_paragraph_chars: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOverrides {
    pub concurrency: Option<usize>,
    pub start: Option<u32>,
    pub end: Option<u32>,
    pub headful: bool,
}

pub fn load(path: &Path) -> anyhow::Result<NovelConfig> {
    let yaml = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let mut config: NovelConfig = serde_yaml::from_str(&yaml)
        .with_context(|| format!("parse config: {}", path.display()))?;
    config.base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    config.validate().context("validate config")?;
    Ok(config)
}

impl NovelConfig {
    pub fn apply(&mut self, overrides: RunOverrides) -> anyhow::Result<()> {
        if let Some(concurrency) = overrides.concurrency {
            self.fetch.concurrency = concurrency;
        }
        if overrides.start.is_some() || overrides.end.is_some() {
            let current = self.range.unwrap_or(ChapterRange {
                start: 1,
                end: u32::MAX,
            });
            self.range = Some(ChapterRange {
                start: overrides.start.unwrap_or(current.start),
                end: overrides.end.unwrap_or(current.end),
            });
        }
        if overrides.headful {
            self.fetch.headless = false;
        }
        self.validate()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.novel_id.trim().is_empty() {
            anyhow::bail!("novel_id must not be empty");
        }
        if self.manifest.is_none() && self.base_url.is_none() {
            anyhow::bail!("config needs either `manifest` or `base_url`");
        }
        if self.manifest.is_none() && self.range.is_none() {
            anyhow::bail!("`base_url` needs a chapter `range`");
        }
        if let Some(range) = self.range {
            if range.start == 0 {
                anyhow::bail!("chapter range must start at 1 or later");
            }
            if range.start > range.end {
                anyhow::bail!("chapter range is inverted: {}..{}", range.start, range.end);
            }
        }
        if self.fetch.max_attempts == 0 {
            anyhow::bail!("fetch.max_attempts must be at least 1");
        }
        if self.fetch.concurrency == 0 || self.fetch.concurrency > MAX_CONCURRENCY {
            anyhow::bail!(
                "fetch.concurrency must be between 1 and {MAX_CONCURRENCY}, got {}",
                self.fetch.concurrency
            );
        }
        if !(8_000..=20_000).contains(&self.fetch.challenge_dwell_ms) {
            anyhow::bail!(
                "fetch.challenge_dwell_ms must be between 8000 and 20000, got {}",
                self.fetch.challenge_dwell_ms
            );
        }
        if self.extract.content_selectors.is_empty() {
            anyhow::bail!("extract.content_selectors must not be empty");
        }
        for selector in self
            .extract
            .content_selectors
            .iter()
            .chain(&self.extract.title_selectors)
        {
            scraper::Selector::parse(selector)
                .map_err(|err| anyhow::anyhow!("invalid css selector {selector:?}: {err}"))?;
        }
        self.stealth.validate().context("validate stealth profile")?;
        Ok(())
    }

    pub fn out_dir(&self) -> PathBuf {
        match &self.out_dir {
            Some(dir) => self.base_dir.join(dir),
            None => self.base_dir.join("out").join(&self.novel_id),
        }
    }

    pub fn manifest_path(&self) -> Option<PathBuf> {
        self.manifest.as_ref().map(|path| self.base_dir.join(path))
    }

    pub fn display_title(&self) -> String {
        match &self.title {
            Some(title) if !title.trim().is_empty() => title.trim().to_owned(),
            _ => self.novel_id.replace(['-', '_'], " "),
        }
    }

    /// Minimal in-memory config for tests and embedding.
    pub fn for_base_url(novel_id: &str, base_url: &str, range: ChapterRange) -> Self {
        Self {
            novel_id: novel_id.to_owned(),
            title: None,
            out_dir: None,
            manifest: None,
            base_url: Some(base_url.to_owned()),
            range: Some(range),
            title_overrides: BTreeMap::new(),
            fetch: FetchSettings::default(),
            extract: ExtractSettings::default(),
            stealth: StealthProfile::default(),
            challenge_markers: Vec::new(),
            base_dir: PathBuf::from("."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_applies_defaults_and_resolves_paths() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("novel.yaml");
        std::fs::write(
            &path,
            r#"
novel_id: lord-of-the-mysteries
base_url: https://novelbin.com/b/lord-of-the-mysteries/chapter-
range: { start: 1, end: 20 }
title_overrides:
  3: "The Third"
fetch:
  concurrency: 2
"#,
        )?;

        let config = load(&path)?;
        assert_eq!(config.fetch.concurrency, 2);
        assert_eq!(config.fetch.max_attempts, 3);
        assert_eq!(config.extract.min_content_chars, 500);
        assert_eq!(config.extract.content_selectors[0], "#chr-content");
        assert_eq!(config.title_overrides.get(&3).map(String::as_str), Some("The Third"));
        assert_eq!(
            config.out_dir(),
            temp.path().join("out").join("lord-of-the-mysteries")
        );
        assert_eq!(config.display_title(), "lord of the mysteries");
        Ok(())
    }

    #[test]
    fn rejects_config_without_chapter_source() {
        let mut config = NovelConfig::for_base_url(
            "n",
            "https://example.com/chapter-",
            ChapterRange { start: 1, end: 2 },
        );
        config.base_url = None;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("manifest"));
    }

    #[test]
    fn rejects_concurrency_above_cap() {
        let mut config = NovelConfig::for_base_url(
            "n",
            "https://example.com/chapter-",
            ChapterRange { start: 1, end: 2 },
        );
        let err = config
            .apply(RunOverrides {
                concurrency: Some(8),
                ..RunOverrides::default()
            })
            .unwrap_err()
            .to_string();
        assert!(err.contains("concurrency"));
    }

    #[test]
    fn rejects_invalid_selector() {
        let mut config = NovelConfig::for_base_url(
            "n",
            "https://example.com/chapter-",
            ChapterRange { start: 1, end: 2 },
        );
        config.extract.content_selectors = vec!["div[".to_owned()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn overrides_narrow_range() -> anyhow::Result<()> {
        let mut config = NovelConfig::for_base_url(
            "n",
            "https://example.com/chapter-",
            ChapterRange { start: 1, end: 50 },
        );
        config.apply(RunOverrides {
            start: Some(10),
            headful: true,
            ..RunOverrides::default()
        })?;
        assert_eq!(config.range, Some(ChapterRange { start: 10, end: 50 }));
        assert!(!config.fetch.headless);
        Ok(())
    }

    #[test]
    fn jitter_samples_within_bounds() {
        let jitter = Jitter::new(10, 20);
        for _ in 0..50 {
            let sample = jitter.sample();
            assert!(sample >= Duration::from_millis(10));
            assert!(sample <= Duration::from_millis(20));
        }
        assert_eq!(Jitter::ZERO.sample(), Duration::ZERO);
    }
}

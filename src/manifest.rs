use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Context as _;
use regex::Regex;
use url::Url;

use crate::cli::ManifestImportArgs;
use crate::config::NovelConfig;
use crate::formats::{ChapterDescriptor, ChapterTask, ManifestFile};

static CHAPTER_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)chapter\s*(\d+)").expect("valid chapter number regex"));
static CHAPTER_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(chapter|cap[ií]tulo)\s*\d+").expect("valid chapter label regex")
});
static LEADING_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-:–\s]+").expect("valid separator regex"));
static QUOTES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"['"”“’]"#).expect("valid quote regex"));
static NON_SLUG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9\s-]").expect("valid slug regex"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

pub fn load(path: &Path) -> anyhow::Result<ManifestFile> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("read manifest: {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("parse manifest: {}", path.display()))
}

/// Builds the ordered task list for a run: manifest chapters or a generated
/// URL range, filtered by the configured range, with title overrides applied.
pub fn tasks(config: &NovelConfig) -> anyhow::Result<Vec<ChapterTask>> {
    let mut tasks = source_tasks(config)?;
    if let Some(range) = config.range {
        tasks.retain(|task| range.contains(task.number));
    }
    for task in &mut tasks {
        if let Some(title) = config.title_overrides.get(&task.number) {
            task.known_title = Some(title.clone());
        }
    }

    validate_tasks(&mut tasks)?;
    Ok(tasks)
}

/// Highest sequence number the chapter source knows about, before any range
/// filter; the bound for "next" links.
pub fn known_total(config: &NovelConfig) -> anyhow::Result<u32> {
    Ok(total(&source_tasks(config)?))
}

fn source_tasks(config: &NovelConfig) -> anyhow::Result<Vec<ChapterTask>> {
    Ok(match (config.manifest_path(), &config.base_url) {
        (Some(path), _) => load(&path)?
            .chapters
            .into_iter()
            .map(|chapter| ChapterTask {
                number: chapter.number,
                url: chapter.url,
                known_title: Some(chapter.title).filter(|title| !title.trim().is_empty()),
            })
            .collect::<Vec<_>>(),
        (None, Some(base_url)) => {
            let range = config
                .range
                .ok_or_else(|| anyhow::anyhow!("`base_url` needs a chapter `range`"))?;
            (range.start..=range.end)
                .map(|number| ChapterTask {
                    number,
                    url: format!("{base_url}{number}"),
                    known_title: None,
                })
                .collect()
        }
        (None, None) => anyhow::bail!("config needs either `manifest` or `base_url`"),
    })
}

fn validate_tasks(tasks: &mut [ChapterTask]) -> anyhow::Result<()> {
    tasks.sort_by_key(|task| task.number);
    for pair in tasks.windows(2) {
        if pair[0].number == pair[1].number {
            anyhow::bail!("duplicate chapter number in task list: {}", pair[0].number);
        }
    }
    for task in tasks.iter() {
        if task.number == 0 {
            anyhow::bail!("chapter numbers start at 1: {}", task.url);
        }
        let url = Url::parse(&task.url)
            .with_context(|| format!("chapter {} has an invalid url: {}", task.number, task.url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("chapter {} url must be http/https: {}", task.number, task.url);
        }
    }
    Ok(())
}

pub fn total(tasks: &[ChapterTask]) -> u32 {
    tasks.iter().map(|task| task.number).max().unwrap_or(0)
}

pub fn import(args: &ManifestImportArgs) -> anyhow::Result<ManifestFile> {
    if args.out.exists() && !args.force {
        anyhow::bail!(
            "manifest output already exists: {} (pass --force to overwrite)",
            args.out.display()
        );
    }

    let text = std::fs::read_to_string(&args.input)
        .with_context(|| format!("read chapter list: {}", args.input.display()))?;
    let chapters = parse_chapter_list(&text, &args.base_url);
    if chapters.is_empty() {
        anyhow::bail!("no chapters found in {}", args.input.display());
    }

    let manifest = ManifestFile {
        novel_id: args.novel_id.clone(),
        base_url: Some(args.base_url.clone()),
        total_chapters: Some(chapters.len()),
        chapters,
    };

    if let Some(parent) = args.out.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create manifest dir: {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(&manifest).context("serialize manifest")?;
    std::fs::write(&args.out, json)
        .with_context(|| format!("write manifest: {}", args.out.display()))?;

    tracing::info!(
        chapters = manifest.chapters.len(),
        out = %args.out.display(),
        "manifest imported"
    );
    Ok(manifest)
}

/// One chapter per line. Lines without a chapter number or whose title is
/// empty after cleanup are dropped; the first line wins for a repeated number.
pub fn parse_chapter_list(text: &str, base_url: &str) -> Vec<ChapterDescriptor> {
    let base_url = base_url.trim_end_matches('/');
    let mut chapters = BTreeMap::new();

    for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some(number) = CHAPTER_NUMBER
            .captures(line)
            .and_then(|captures| captures[1].parse::<u32>().ok())
        else {
            continue;
        };
        let title = clean_title(line, number);
        if title.is_empty() {
            continue;
        }
        chapters.entry(number).or_insert_with(|| ChapterDescriptor {
            number,
            url: format!("{base_url}/chapter-{number}-{}", slugify(&title)),
            title,
        });
    }

    chapters.into_values().collect()
}

fn clean_title(line: &str, number: u32) -> String {
    let title = CHAPTER_LABEL.replace(line, "");
    let title = match Regex::new(&format!(r"\b{number}\b")) {
        Ok(repeated) => repeated.replace_all(&title, "").into_owned(),
        Err(_) => title.into_owned(),
    };
    let title = LEADING_SEPARATORS.replace(&title, "");
    WHITESPACE.replace_all(title.trim(), " ").into_owned()
}

fn slugify(title: &str) -> String {
    let lowered = title.to_lowercase();
    let unquoted = QUOTES.replace_all(&lowered, "");
    let kept = NON_SLUG.replace_all(&unquoted, "");
    WHITESPACE.replace_all(kept.trim(), "-").into_owned()
}

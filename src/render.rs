use html_escape::{encode_double_quoted_attribute, encode_text};

/// `<meta name=...>` that marks a raw artifact as a failed fetch.
pub const SENTINEL_META: &str = "chapter-scrape-error";

const STYLE: &str = r#"body { max-width: 46em; margin: 0 auto; padding: 1.5em; font: 1.1em/1.7 Georgia, serif; color: #222; background: #fbf8f1; }
h1 { font-size: 1.5em; line-height: 1.3; }
.chapter-nav { display: flex; justify-content: space-between; margin: 2em 0; }
.nav-button { padding: .4em .9em; border: 1px solid #bbb; border-radius: 4px; text-decoration: none; color: inherit; }
.nav-button.disabled { color: #aaa; border-color: #ddd; }
.chapter-list { list-style: none; padding: 0; }
.chapter-list li { padding: .25em 0; }
time { color: #777; font-size: .85em; }"#;

pub fn chapter_file_name(number: u32) -> String {
    format!("chapter_{number:04}.html")
}

#[derive(Debug, Clone)]
pub struct ChapterPage<'a> {
    pub novel_title: &'a str,
    pub number: u32,
    pub title: &'a str,
    pub body_html: &'a str,
    pub extracted_at: &'a str,
    /// Highest known sequence number; chapter `n + 1` gets a link iff it is
    /// within this bound.
    pub total: u32,
}

pub fn chapter_page(page: &ChapterPage<'_>) -> String {
    let nav = navigation(page.number, page.total);
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{title} - {novel}</title>
<style>
{STYLE}
</style>
</head>
<body>
<header>
<p><a href="index.html">{novel}</a></p>
<h1 class="chapter-title">{title}</h1>
<time datetime="{extracted_at}">{extracted_at}</time>
</header>
{nav}
<div class="chapter-content">
{body}
</div>
{nav}
</body>
</html>
"#,
        title = encode_text(page.title),
        novel = encode_text(page.novel_title),
        extracted_at = encode_double_quoted_attribute(page.extracted_at),
        body = page.body_html,
    )
}

fn navigation(number: u32, total: u32) -> String {
    let previous = match number.checked_sub(1).filter(|prev| *prev >= 1) {
        Some(prev) => format!(
            r#"<a class="nav-button" rel="prev" href="{}">Previous</a>"#,
            chapter_file_name(prev)
        ),
        None => r#"<span class="nav-button disabled">Previous</span>"#.to_owned(),
    };
    let next = match number.checked_add(1).filter(|next| *next <= total) {
        Some(next) => format!(
            r#"<a class="nav-button" rel="next" href="{}">Next</a>"#,
            chapter_file_name(next)
        ),
        None => r#"<span class="nav-button disabled">Next</span>"#.to_owned(),
    };
    format!(
        r#"<nav class="chapter-nav">{previous}<a class="nav-button" href="index.html">Index</a>{next}</nav>"#
    )
}

/// Index of cleaned chapters. Carries no timestamp so an unchanged chapter
/// set renders byte-identical output.
pub fn index_page(novel_title: &str, chapters: &[(u32, String)]) -> String {
    let items: String = chapters
        .iter()
        .map(|(number, title)| {
            format!(
                "<li><a href=\"{}\">{}</a></li>\n",
                chapter_file_name(*number),
                encode_text(title)
            )
        })
        .collect();
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{novel}</title>
<style>
{STYLE}
</style>
</head>
<body>
<h1>{novel}</h1>
<p class="chapter-count">{count} chapters</p>
<ol class="chapter-list">
{items}</ol>
</body>
</html>
"#,
        novel = encode_text(novel_title),
        count = chapters.len(),
    )
}

pub struct SentinelPage<'a> {
    pub number: u32,
    pub url: &'a str,
    pub category: &'a str,
    pub message: &'a str,
    pub failed_at: &'a str,
}

pub fn sentinel_page(page: &SentinelPage<'_>) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="{SENTINEL_META}" content="{category}">
<title>Chapter {number} - fetch failed</title>
</head>
<body>
<h1>Chapter {number} could not be fetched</h1>
<p class="error-message">{message}</p>
<p class="error-url"><a href="{url_attr}">{url_text}</a></p>
<p><time class="error-time" datetime="{failed_at}">{failed_at}</time></p>
</body>
</html>
"#,
        number = page.number,
        category = encode_double_quoted_attribute(page.category),
        message = encode_text(page.message),
        url_attr = encode_double_quoted_attribute(page.url),
        url_text = encode_text(page.url),
        failed_at = encode_double_quoted_attribute(page.failed_at),
    )
}

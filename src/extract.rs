use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::config::ExtractSettings;
use crate::sanitize::{sanitize, text_len};

static PLACEHOLDER_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^chapter\s*\d+$").expect("valid placeholder title regex"));
static HEADING: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h1").expect("valid heading selector"));
static PAGE_TITLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("valid title selector"));
static BODY: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("body").expect("valid body selector"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub title: String,
    pub body_html: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("no content block longer than {threshold} chars (best candidate: {best_len})")]
    ContentNotFound { best_len: usize, threshold: usize },
}

pub fn extract(
    raw_html: &str,
    number: u32,
    known_title: Option<&str>,
    settings: &ExtractSettings,
) -> Result<Extracted, ExtractError> {
    let document = Html::parse_document(raw_html);

    let body = select_body(&document, settings)?;
    let body_html = sanitize(&body.inner_html(), settings.min_paragraph_chars);
    // The classifier measures the cleaned text, so hold the cleaned body to
    // the same threshold.
    let sanitized_len = text_len(Html::parse_fragment(&body_html).root_element());
    if sanitized_len <= settings.min_content_chars {
        return Err(ExtractError::ContentNotFound {
            best_len: sanitized_len,
            threshold: settings.min_content_chars,
        });
    }

    let title = resolve_title(&document, number, known_title, settings);
    Ok(Extracted { title, body_html })
}

/// First candidate in priority order whose text passes the threshold, then the
/// whole `<body>`.
fn select_body<'a>(
    document: &'a Html,
    settings: &ExtractSettings,
) -> Result<ElementRef<'a>, ExtractError> {
    let threshold = settings.min_content_chars;
    let mut best_len = 0;

    for raw in &settings.content_selectors {
        let Ok(selector) = Selector::parse(raw) else {
            tracing::warn!(selector = %raw, "skipping invalid content selector");
            continue;
        };
        for element in document.select(&selector) {
            let len = text_len(element);
            if len > threshold {
                tracing::debug!(selector = %raw, len, "content selector matched");
                return Ok(element);
            }
            best_len = best_len.max(len);
        }
    }

    if let Some(body) = document.select(&BODY).next() {
        let len = text_len(body);
        if len > threshold {
            tracing::debug!(len, "falling back to document body");
            return Ok(body);
        }
        best_len = best_len.max(len);
    }

    Err(ExtractError::ContentNotFound {
        best_len,
        threshold,
    })
}

fn resolve_title(
    document: &Html,
    number: u32,
    known_title: Option<&str>,
    settings: &ExtractSettings,
) -> String {
    if let Some(title) = known_title.map(normalize_whitespace)
        && !title.is_empty()
        && !PLACEHOLDER_TITLE.is_match(&title)
    {
        return title;
    }

    let from_selectors = settings
        .title_selectors
        .iter()
        .filter_map(|raw| Selector::parse(raw).ok())
        .find_map(|selector| first_text(document, &selector));
    if let Some(title) = from_selectors {
        return title;
    }

    if let Some(title) = first_text(document, &HEADING) {
        return title;
    }

    let page_title = first_text(document, &PAGE_TITLE).and_then(|title| {
        let prefix = match settings.title_separator.as_str() {
            "" => title.as_str(),
            separator => title.split(separator).next().unwrap_or_default(),
        };
        let prefix = normalize_whitespace(prefix);
        (!prefix.is_empty()).then_some(prefix)
    });
    if let Some(title) = page_title {
        return title;
    }

    format!("Chapter {number}")
}

fn first_text(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .map(|element| normalize_whitespace(&element.text().collect::<String>()))
        .find(|text| !text.is_empty())
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentence_block(chars: usize) -> String {
        let sentence = "Rain tapped on the window of the rented room. ";
        sentence.repeat(chars / sentence.len() + 1)[..chars].trim_end().to_owned()
    }

    #[test]
    fn title_falls_back_to_page_title_prefix() -> anyhow::Result<()> {
        let html = format!(
            "<html><head><title>Foo - Bar</title></head><body><div class=\"chapter-content\"><p>{}</p></div></body></html>",
            sentence_block(700)
        );
        let extracted = extract(&html, 7, None, &ExtractSettings::default())?;
        assert_eq!(extracted.title, "Foo");
        Ok(())
    }

    #[test]
    fn first_qualifying_selector_wins_over_longest() -> anyhow::Result<()> {
        let long = sentence_block(600);
        let short = "Only fifty characters live inside this small box.";
        let html = format!(
            "<html><body><div class=\"chapter-content\"><p>{short}</p></div><div id=\"chr-content\"><p>{long}</p></div><article><p>{long} {long}</p></article></body></html>"
        );
        let extracted = extract(&html, 1, None, &ExtractSettings::default())?;
        assert!(extracted.body_html.contains(&long));
        assert!(!extracted.body_html.contains(short));
        assert!(!extracted.body_html.contains("<article"));
        Ok(())
    }

    #[test]
    fn title_resolution_order() -> anyhow::Result<()> {
        let body = format!("<div id=\"chr-content\"><p>{}</p></div>", sentence_block(600));
        let settings = ExtractSettings::default();

        let html = format!(
            "<html><head><title>Page - Site</title></head><body><h1>Heading</h1><h3 class=\"chr-title\">  Chapter 3:\n The Fool </h3>{body}</body></html>"
        );
        assert_eq!(extract(&html, 3, None, &settings)?.title, "Chapter 3: The Fool");
        assert_eq!(
            extract(&html, 3, Some("The Manifest Title"), &settings)?.title,
            "The Manifest Title"
        );
        assert_eq!(
            extract(&html, 3, Some("Chapter 3"), &settings)?.title,
            "Chapter 3: The Fool"
        );

        let html = format!("<html><body><h1>Heading</h1>{body}</body></html>");
        assert_eq!(extract(&html, 3, None, &settings)?.title, "Heading");

        let html = format!("<html><body>{body}</body></html>");
        assert_eq!(extract(&html, 3, None, &settings)?.title, "Chapter 3");
        Ok(())
    }

    #[test]
    fn short_page_is_content_not_found() {
        let html = "<html><body><div id=\"chr-content\"><p>Too short to be a chapter.</p></div></body></html>";
        let err = extract(html, 1, None, &ExtractSettings::default()).unwrap_err();
        assert!(matches!(
            err,
            ExtractError::ContentNotFound { threshold: 500, .. }
        ));
    }

    #[test]
    fn falls_back_to_body_when_no_selector_matches() -> anyhow::Result<()> {
        let html = format!(
            "<html><body><section><p>{}</p></section></body></html>",
            sentence_block(800)
        );
        let extracted = extract(&html, 2, None, &ExtractSettings::default())?;
        assert!(extracted.body_html.contains("<section>"));
        Ok(())
    }
}

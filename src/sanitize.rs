use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html};

/// class/id tokens of boilerplate containers (ads, comments, navigation,
/// share widgets).
static BOILERPLATE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(^|[-_])(ads?|adsbygoogle|advert|advertisement|banner|sponsor(ed)?|promo|comments?|disqus|nav|navigation|navbar|breadcrumbs?|share|social|sidebar|widget|related|pubfuture)([-_]|$)",
    )
    .expect("valid boilerplate token regex")
});

static BOILERPLATE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^pf-").expect("valid boilerplate prefix regex"));

static AD_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(^|[^a-z])(ads?|adverts?|advertisement|banners?|sponsor(ed)?|doubleclick|googlesyndication|pubfuture|promo)([^a-z]|$)",
    )
    .expect("valid ad image regex")
});

const DROPPED_TAGS: &[&str] = &["script", "style", "iframe", "noscript"];
const TEXT_BLOCK_TAGS: &[&str] = &["p", "div"];

/// Removes scripts, boilerplate containers, ad images and near-empty text
/// blocks from an HTML fragment. Runs to a fixpoint, so the output is stable
/// under a second application.
pub fn sanitize(fragment: &str, min_paragraph_chars: usize) -> String {
    let mut current = fragment.to_owned();
    loop {
        let (next, removed) = sanitize_pass(&current, min_paragraph_chars);
        current = next;
        if removed == 0 {
            return current;
        }
        tracing::trace!(removed, "sanitize pass");
    }
}

fn sanitize_pass(fragment: &str, min_paragraph_chars: usize) -> (String, usize) {
    let mut document = Html::parse_fragment(fragment);

    let doomed: Vec<_> = document
        .root_element()
        .descendants()
        .filter(|node| {
            if node.value().is_comment() {
                return true;
            }
            ElementRef::wrap(*node)
                .is_some_and(|element| should_remove(element, min_paragraph_chars))
        })
        .map(|node| node.id())
        .collect();

    let removed = doomed.len();
    for id in doomed {
        if let Some(mut node) = document.tree.get_mut(id) {
            node.detach();
        }
    }

    (document.root_element().inner_html(), removed)
}

fn should_remove(element: ElementRef<'_>, min_paragraph_chars: usize) -> bool {
    let value = element.value();
    let tag = value.name();

    if DROPPED_TAGS.contains(&tag) {
        return true;
    }
    if value.id().is_some_and(is_boilerplate_token) || value.classes().any(is_boilerplate_token)
    {
        return true;
    }
    if tag == "img" {
        let src = value.attr("src").unwrap_or_default();
        let alt = value.attr("alt").unwrap_or_default();
        return AD_IMAGE.is_match(src) || AD_IMAGE.is_match(alt);
    }
    if TEXT_BLOCK_TAGS.contains(&tag) {
        return text_len(element) < min_paragraph_chars;
    }
    false
}

fn is_boilerplate_token(token: &str) -> bool {
    BOILERPLATE_TOKEN.is_match(token) || BOILERPLATE_PREFIX.is_match(token)
}

/// Trimmed character count of an element's text.
pub fn text_len(element: ElementRef<'_>) -> usize {
    element.text().collect::<String>().trim().chars().count()
}

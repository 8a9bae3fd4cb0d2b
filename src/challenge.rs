use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};

/// Matched against the document `<title>` only. These phrases are ordinary
/// prose anywhere else on a page.
pub const TITLE_MARKERS: &[&str] = &["Just a moment"];

/// Cloudflare interstitial strings specific enough to match anywhere in the
/// page.
pub const PAGE_MARKERS: &[&str] = &[
    "cf-turnstile-response",
    "cf_challenge_response",
    "Checking your browser",
    "needs to review the security of your connection",
    "Enable JavaScript and cookies to continue",
];

const VERIFIED_BANNER: &str = "Verification successful";

static WAITING_TO_RESPOND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Waiting for \S+ to respond").expect("valid waiting-to-respond regex")
});
static CHALLENGE_FORM: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("#challenge-form, form[action*='__cf_chl'], #cf-challenge-running")
        .expect("valid challenge form selector")
});
static PAGE_TITLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("valid title selector"));

/// Case-sensitive challenge signatures shared by the fetch worker, the cleaner
/// and the error classifier. Configured extra markers count as page markers.
#[derive(Debug, Clone)]
pub struct ChallengeDetector {
    page_markers: Vec<String>,
}

impl Default for ChallengeDetector {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl ChallengeDetector {
    pub fn new(extra_markers: &[String]) -> Self {
        let page_markers = PAGE_MARKERS
            .iter()
            .map(|marker| (*marker).to_owned())
            .chain(extra_markers.iter().cloned())
            .filter(|marker| !marker.trim().is_empty())
            .collect();
        Self { page_markers }
    }

    pub fn title_marker(&self, title: &str) -> Option<&'static str> {
        TITLE_MARKERS
            .iter()
            .copied()
            .find(|marker| title.contains(marker))
    }

    /// First page marker found in `text`, or the verified banner when it sits
    /// next to the "Waiting for <host> to respond" line.
    pub fn page_marker(&self, text: &str) -> Option<&str> {
        if let Some(marker) = self
            .page_markers
            .iter()
            .find(|marker| text.contains(marker.as_str()))
        {
            return Some(marker.as_str());
        }
        (text.contains(VERIFIED_BANNER) && WAITING_TO_RESPOND.is_match(text))
            .then_some(VERIFIED_BANNER)
    }

    /// Checks a full HTML page: its `<title>` against the title markers, its
    /// markup against the page markers, and its tree for a challenge form.
    pub fn detect_html(&self, html: &str) -> Option<String> {
        let document = Html::parse_document(html);
        let title = document
            .select(&PAGE_TITLE)
            .next()
            .map(|element| element.text().collect::<String>())
            .unwrap_or_default();
        if let Some(marker) = self.title_marker(&title) {
            return Some(marker.to_owned());
        }
        if let Some(marker) = self.page_marker(html) {
            return Some(marker.to_owned());
        }
        document
            .select(&CHALLENGE_FORM)
            .next()
            .map(|_| "challenge form".to_owned())
    }
}

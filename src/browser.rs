use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    Headers, SetExtraHttpHeadersParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, NavigateParams,
};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt as _;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::challenge::ChallengeDetector;
use crate::config::{ExtractSettings, FetchSettings, NovelConfig};
use crate::fetch::{ChallengeSnapshot, ChapterFetcher, FetchResult, TimeoutBudget};
use crate::formats::ChapterTask;
use crate::stealth::{BrowserIdentity, StealthProfile};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const IDLE_WINDOW: Duration = Duration::from_millis(750);

/// Fetch worker backed by a headless Chromium. Every attempt launches a fresh
/// browser with its own throwaway profile and identity.
pub struct BrowserFetcher {
    settings: FetchSettings,
    stealth: StealthProfile,
    content_selectors: Vec<String>,
    min_content_chars: usize,
    detector: ChallengeDetector,
    chrome_executable: Option<PathBuf>,
    debug_dir: Option<PathBuf>,
}

impl BrowserFetcher {
    pub fn new(config: &NovelConfig) -> Self {
        let ExtractSettings {
            content_selectors,
            min_content_chars,
            ..
        } = &config.extract;
        let chrome_executable = config
            .fetch
            .chrome_executable
            .as_ref()
            .map(|path| config.base_dir.join(path))
            .or_else(|| std::env::var_os("CHROMIUM_PATH").map(PathBuf::from));
        Self {
            settings: config.fetch.clone(),
            stealth: config.stealth.clone(),
            content_selectors: content_selectors.clone(),
            min_content_chars: *min_content_chars,
            detector: ChallengeDetector::new(&config.challenge_markers),
            chrome_executable,
            debug_dir: config
                .fetch
                .debug_dir
                .as_ref()
                .map(|dir| config.base_dir.join(dir)),
        }
    }

    async fn drive(
        &self,
        page: &Page,
        task: &ChapterTask,
        identity: &BrowserIdentity,
        budget: TimeoutBudget,
    ) -> anyhow::Result<FetchResult> {
        self.prepare_page(page, identity).await?;

        tokio::time::sleep(self.settings.pre_navigation_delay.sample()).await;
        navigate(page, task, identity.referrer.as_deref(), budget.navigation).await?;
        self.after_navigation(page, task.number, budget).await
    }

    /// Challenge dwell and re-check, then content polling, then the snapshot.
    async fn after_navigation(
        &self,
        page: &dyn PageProbe,
        number: u32,
        budget: TimeoutBudget,
    ) -> anyhow::Result<FetchResult> {
        if let Some(snapshot) = self.challenge_snapshot(page).await? {
            tracing::warn!(
                chapter = number,
                marker = %snapshot.marker,
                dwell_ms = self.settings.challenge_dwell_ms,
                "bot challenge detected; dwelling"
            );
            tokio::time::sleep(Duration::from_millis(self.settings.challenge_dwell_ms)).await;
            if let Some(snapshot) = self.challenge_snapshot(page).await? {
                self.save_challenge_screenshot(page, number).await;
                return Ok(FetchResult::BotChallenge { snapshot });
            }
            tracing::info!(chapter = number, "bot challenge cleared");
        }

        if !self.wait_for_content(page, number, budget).await {
            return Ok(FetchResult::ContentNotFound);
        }

        tokio::time::sleep(self.settings.settle_delay.sample()).await;
        let raw_html = page.html().await.context("snapshot rendered html")?;
        Ok(FetchResult::Success { raw_html })
    }

    async fn prepare_page(&self, page: &Page, identity: &BrowserIdentity) -> anyhow::Result<()> {
        page.execute(SetUserAgentOverrideParams {
            user_agent: identity.user_agent.clone(),
            accept_language: Some(identity.accept_language.clone()),
            platform: Some(identity.platform.clone()),
            user_agent_metadata: None,
        })
        .await
        .context("override user agent")?;

        page.execute(SetExtraHttpHeadersParams::new(Headers::new(
            identity.extra_headers(),
        )))
        .await
        .context("set extra http headers")?;

        if !self.stealth.init_script.trim().is_empty() {
            page.execute(AddScriptToEvaluateOnNewDocumentParams {
                source: self.stealth.init_script.clone(),
                include_command_line_api: None,
                world_name: None,
                run_immediately: None,
            })
            .await
            .context("inject init script")?;
        }
        Ok(())
    }

    async fn challenge_snapshot(
        &self,
        page: &dyn PageProbe,
    ) -> anyhow::Result<Option<ChallengeSnapshot>> {
        let title = page.title().await?;
        if let Some(marker) = self.detector.title_marker(&title) {
            return Ok(Some(ChallengeSnapshot {
                marker: marker.to_owned(),
                title,
            }));
        }

        let html = page.html().await?;
        Ok(self
            .detector
            .detect_html(&html)
            .map(|marker| ChallengeSnapshot { title, marker }))
    }

    /// Ordered selectors first, then any sizable text block.
    async fn wait_for_content(
        &self,
        page: &dyn PageProbe,
        number: u32,
        budget: TimeoutBudget,
    ) -> bool {
        let probe = selector_probe_script(&self.content_selectors);
        if poll_until(page, &probe, budget.content).await {
            return true;
        }

        tracing::debug!(
            chapter = number,
            "no content selector matched; trying text-length fallback"
        );
        let fallback = text_block_probe_script(self.min_content_chars);
        poll_until(page, &fallback, budget.fallback).await
    }

    async fn save_challenge_screenshot(&self, page: &dyn PageProbe, number: u32) {
        let Some(dir) = &self.debug_dir else {
            return;
        };
        let path = dir.join(format!("challenge_{number:04}.png"));
        if let Err(err) = tokio::fs::create_dir_all(dir).await {
            tracing::warn!(?err, dir = %dir.display(), "create debug dir");
            return;
        }
        match page.save_screenshot(&path).await {
            Ok(()) => tracing::info!(path = %path.display(), "saved challenge screenshot"),
            Err(err) => tracing::warn!(?err, "challenge screenshot failed"),
        }
    }
}

/// The slice of a live page the worker's decisions read from.
#[async_trait::async_trait]
trait PageProbe: Send + Sync {
    async fn goto(&self, url: &str, referrer: Option<&str>) -> anyhow::Result<()>;
    async fn wait_for_navigation(&self) -> anyhow::Result<()>;
    async fn title(&self) -> anyhow::Result<String>;
    async fn html(&self) -> anyhow::Result<String>;
    async fn evaluate_bool(&self, script: &str) -> anyhow::Result<bool>;
    async fn save_screenshot(&self, path: &Path) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
impl PageProbe for Page {
    async fn goto(&self, url: &str, referrer: Option<&str>) -> anyhow::Result<()> {
        let mut builder = NavigateParams::builder().url(url);
        if let Some(referrer) = referrer {
            builder = builder.referrer(referrer);
        }
        let params = builder
            .build()
            .map_err(|err| anyhow::anyhow!("build navigate params: {err}"))?;
        Page::goto(self, params).await.context("navigate")?;
        Ok(())
    }

    async fn wait_for_navigation(&self) -> anyhow::Result<()> {
        Page::wait_for_navigation(self)
            .await
            .context("wait for navigation")?;
        Ok(())
    }

    async fn title(&self) -> anyhow::Result<String> {
        Ok(self
            .get_title()
            .await
            .context("read page title")?
            .unwrap_or_default())
    }

    async fn html(&self) -> anyhow::Result<String> {
        self.content().await.context("read page html")
    }

    async fn evaluate_bool(&self, script: &str) -> anyhow::Result<bool> {
        self.evaluate(script)
            .await
            .context("evaluate script")?
            .into_value::<bool>()
            .context("decode script result")
    }

    async fn save_screenshot(&self, path: &Path) -> anyhow::Result<()> {
        let params = ScreenshotParams::builder().full_page(true).build();
        Page::save_screenshot(self, params, path)
            .await
            .context("save screenshot")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChapterFetcher for BrowserFetcher {
    async fn fetch(&self, task: &ChapterTask, budget: TimeoutBudget) -> FetchResult {
        let identity = self.stealth.pick_identity();
        tracing::debug!(
            chapter = task.number,
            user_agent = %identity.user_agent,
            width = identity.viewport.width,
            height = identity.viewport.height,
            "launching browser session"
        );

        let mut session = match BrowserSession::launch(
            &self.settings,
            self.chrome_executable.as_ref(),
            &identity,
            budget.navigation,
        )
        .await
        {
            Ok(session) => session,
            Err(err) => {
                return FetchResult::TransientError {
                    message: format!("{err:#}"),
                };
            }
        };

        let result = match session.new_page().await {
            Ok(page) => self.drive(&page, task, &identity, budget).await,
            Err(err) => Err(err),
        };
        session.shutdown().await;

        result.unwrap_or_else(|err| FetchResult::TransientError {
            message: format!("{err:#}"),
        })
    }
}

/// One browser process plus its CDP event loop. Dropping the session aborts
/// the event loop, and chromiumoxide kills the child process on drop; the
/// profile directory goes with the `TempDir`.
struct BrowserSession {
    browser: Browser,
    handler: JoinHandle<()>,
    _profile: tempfile::TempDir,
}

impl BrowserSession {
    async fn launch(
        settings: &FetchSettings,
        chrome_executable: Option<&PathBuf>,
        identity: &BrowserIdentity,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let profile = tempfile::Builder::new()
            .prefix("novel-scrape-profile-")
            .tempdir()
            .context("create browser profile dir")?;

        let viewport = identity.viewport;
        let mut builder = BrowserConfig::builder()
            .user_data_dir(profile.path())
            .window_size(viewport.width, viewport.height)
            .viewport(Viewport {
                width: viewport.width,
                height: viewport.height,
                ..Viewport::default()
            })
            .request_timeout(request_timeout)
            .arg(format!("--user-agent={}", identity.user_agent))
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--no-sandbox")
            .arg("--mute-audio");
        if !settings.headless {
            builder = builder.with_head();
        }
        if let Some(path) = chrome_executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder
            .build()
            .map_err(|err| anyhow::anyhow!("build browser config: {err}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("launch browser")?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    tracing::trace!(?err, "browser handler event error");
                }
            }
        });

        Ok(Self {
            browser,
            handler,
            _profile: profile,
        })
    }

    async fn new_page(&self) -> anyhow::Result<Page> {
        self.browser
            .new_page("about:blank")
            .await
            .context("open blank page")
    }

    async fn shutdown(&mut self) {
        if let Err(err) = self.browser.close().await {
            tracing::debug!(?err, "close browser");
        }
        if let Err(err) = self.browser.wait().await {
            tracing::debug!(?err, "wait for browser exit");
        }
        self.handler.abort();
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

/// Cheap wait first; on failure or timeout, reload and wait for the network to
/// go quiet.
async fn navigate(
    page: &dyn PageProbe,
    task: &ChapterTask,
    referrer: Option<&str>,
    limit: Duration,
) -> anyhow::Result<()> {
    let dom_ready = tokio::time::timeout(limit, async {
        page.goto(&task.url, referrer).await?;
        wait_for_ready_state(page, &["interactive", "complete"], limit).await;
        anyhow::Ok(())
    })
    .await;
    match dom_ready {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(err)) => tracing::debug!(
            chapter = task.number,
            ?err,
            "dom-ready navigation failed; escalating to network idle"
        ),
        Err(_) => tracing::debug!(
            chapter = task.number,
            "dom-ready navigation timed out; escalating to network idle"
        ),
    }

    tokio::time::timeout(limit, async {
        page.goto(&task.url, referrer).await?;
        page.wait_for_navigation().await?;
        wait_for_ready_state(page, &["complete"], limit).await;
        tokio::time::sleep(IDLE_WINDOW).await;
        anyhow::Ok(())
    })
    .await
    .map_err(|_| anyhow::anyhow!("navigation timed out after {}s", limit.as_secs()))?
    .with_context(|| format!("load {}", task.url))
}

async fn wait_for_ready_state(page: &dyn PageProbe, accepted: &[&str], limit: Duration) {
    let script = ready_state_script(accepted);
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if let Ok(true) = page.evaluate_bool(&script).await {
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn poll_until(page: &dyn PageProbe, script: &str, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        let matched = match page.evaluate_bool(script).await {
            Ok(matched) => matched,
            Err(err) => {
                tracing::trace!(?err, "content probe failed");
                false
            }
        };
        if matched {
            return true;
        }
        if Instant::now() + POLL_INTERVAL > deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn ready_state_script(accepted: &[&str]) -> String {
    let list = serde_json::to_string(accepted).unwrap_or_else(|_| "[]".to_owned());
    format!("{list}.includes(document.readyState)")
}

fn selector_probe_script(selectors: &[String]) -> String {
    let list = serde_json::to_string(selectors).unwrap_or_else(|_| "[]".to_owned());
    format!(
        "(() => {list}.some((selector) => {{ try {{ const el = document.querySelector(selector); return !!el && el.innerText.trim().length > 0; }} catch (e) {{ return false; }} }}))()"
    )
}

fn text_block_probe_script(min_chars: usize) -> String {
    format!(
        "(() => Array.from(document.querySelectorAll('div, p, article, section')).some((el) => (el.innerText || '').trim().length > {min_chars}))()"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_probe_quotes_selectors_as_json() {
        let script = selector_probe_script(&["#chr-content".to_owned(), "div[data-x=\"y\"]".to_owned()]);
        assert!(script.starts_with("(() => [\"#chr-content\",\"div[data-x=\\\"y\\\"]\"].some("));
    }

    #[test]
    fn text_block_probe_embeds_threshold() {
        assert!(text_block_probe_script(500).contains("length > 500"));
    }

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use crate::config::{ChapterRange, Jitter};

    /// Replays titles in order (the last one repeats) and answers content
    /// probes from fixed flags.
    #[derive(Default)]
    struct ScriptedPage {
        titles: Mutex<VecDeque<String>>,
        html: String,
        selector_match: bool,
        text_block: bool,
        failing_gotos: Mutex<usize>,
        gotos: Mutex<usize>,
        navigation_waits: Mutex<usize>,
        screenshots: Mutex<Vec<PathBuf>>,
    }

    impl ScriptedPage {
        fn titled(titles: &[&str]) -> Self {
            Self {
                titles: Mutex::new(titles.iter().map(|t| (*t).to_owned()).collect()),
                html: "<html><head><title>Chapter</title></head><body><div id=\"chr-content\"><p>Text.</p></div></body></html>".to_owned(),
                ..Self::default()
            }
        }
    }

    #[async_trait::async_trait]
    impl PageProbe for ScriptedPage {
        async fn goto(&self, url: &str, _referrer: Option<&str>) -> anyhow::Result<()> {
            *self.gotos.lock().expect("lock") += 1;
            let mut failing = self.failing_gotos.lock().expect("lock");
            if *failing > 0 {
                *failing -= 1;
                anyhow::bail!("net::ERR_CONNECTION_RESET at {url}");
            }
            Ok(())
        }

        async fn wait_for_navigation(&self) -> anyhow::Result<()> {
            *self.navigation_waits.lock().expect("lock") += 1;
            Ok(())
        }

        async fn title(&self) -> anyhow::Result<String> {
            let mut titles = self.titles.lock().expect("lock");
            let title = match titles.len() {
                0 => String::new(),
                1 => titles[0].clone(),
                _ => titles.pop_front().unwrap_or_default(),
            };
            Ok(title)
        }

        async fn html(&self) -> anyhow::Result<String> {
            Ok(self.html.clone())
        }

        async fn evaluate_bool(&self, script: &str) -> anyhow::Result<bool> {
            Ok(if script.contains("document.readyState") {
                true
            } else if script.contains("querySelectorAll") {
                self.text_block
            } else {
                self.selector_match
            })
        }

        async fn save_screenshot(&self, path: &Path) -> anyhow::Result<()> {
            self.screenshots.lock().expect("lock").push(path.to_path_buf());
            Ok(())
        }
    }

    fn fetcher(base_dir: &Path) -> BrowserFetcher {
        let mut config = NovelConfig::for_base_url(
            "n",
            "https://example.com/chapter-",
            ChapterRange { start: 1, end: 1 },
        );
        config.base_dir = base_dir.to_path_buf();
        config.fetch.challenge_dwell_ms = 0;
        config.fetch.settle_delay = Jitter::ZERO;
        config.fetch.debug_dir = Some(PathBuf::from("debug"));
        BrowserFetcher::new(&config)
    }

    fn budget() -> TimeoutBudget {
        TimeoutBudget {
            navigation: Duration::from_secs(2),
            content: Duration::from_millis(10),
            fallback: Duration::from_millis(10),
        }
    }

    fn task() -> ChapterTask {
        ChapterTask {
            number: 1,
            url: "https://example.com/chapter-1".to_owned(),
            known_title: None,
        }
    }

    #[tokio::test]
    async fn challenge_that_clears_during_dwell_yields_content() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let page = ScriptedPage {
            selector_match: true,
            ..ScriptedPage::titled(&["Just a moment...", "Chapter 1 - Site"])
        };

        let result = fetcher(temp.path()).after_navigation(&page, 1, budget()).await?;
        assert!(matches!(result, FetchResult::Success { ref raw_html } if raw_html.contains("chr-content")));
        assert!(page.screenshots.lock().expect("lock").is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn persistent_challenge_is_reported_with_a_screenshot() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let page = ScriptedPage {
            selector_match: true,
            ..ScriptedPage::titled(&["Just a moment..."])
        };

        let result = fetcher(temp.path()).after_navigation(&page, 1, budget()).await?;
        match result {
            FetchResult::BotChallenge { snapshot } => {
                assert_eq!(snapshot.marker, "Just a moment");
                assert_eq!(snapshot.title, "Just a moment...");
            }
            other => panic!("expected a bot challenge, got {other:?}"),
        }
        assert_eq!(
            *page.screenshots.lock().expect("lock"),
            vec![temp.path().join("debug").join("challenge_0001.png")]
        );
        Ok(())
    }

    #[tokio::test]
    async fn text_block_fallback_accepts_unlisted_layouts() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let page = ScriptedPage {
            text_block: true,
            ..ScriptedPage::titled(&["Chapter 1 - Site"])
        };

        let result = fetcher(temp.path()).after_navigation(&page, 1, budget()).await?;
        assert!(matches!(result, FetchResult::Success { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn no_selector_and_no_text_block_is_content_not_found() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let page = ScriptedPage::titled(&["Chapter 1 - Site"]);

        let result = fetcher(temp.path()).after_navigation(&page, 1, budget()).await?;
        assert_eq!(result, FetchResult::ContentNotFound);
        Ok(())
    }

    #[tokio::test]
    async fn failed_dom_ready_navigation_escalates_to_network_idle() -> anyhow::Result<()> {
        let page = ScriptedPage::titled(&["Chapter 1 - Site"]);
        *page.failing_gotos.lock().expect("lock") = 1;

        navigate(&page, &task(), None, Duration::from_secs(2)).await?;
        assert_eq!(*page.gotos.lock().expect("lock"), 2);
        assert_eq!(*page.navigation_waits.lock().expect("lock"), 1);
        Ok(())
    }

    #[tokio::test]
    async fn navigation_fails_when_both_strategies_fail() {
        let page = ScriptedPage::titled(&["Chapter 1 - Site"]);
        *page.failing_gotos.lock().expect("lock") = 2;

        let err = navigate(&page, &task(), None, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("load https://example.com/chapter-1"));
        assert_eq!(*page.navigation_waits.lock().expect("lock"), 0);
    }

    #[test]
    fn ready_state_script_lists_accepted_states() {
        assert_eq!(
            ready_state_script(&["interactive", "complete"]),
            "[\"interactive\",\"complete\"].includes(document.readyState)"
        );
    }
}

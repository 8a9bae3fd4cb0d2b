use rand::seq::IndexedRandom as _;
use serde::{Deserialize, Serialize};

/// Injected before any page script runs. Best-effort only: a page that still
/// detects automation shows up as an ordinary bot challenge.
pub const DEFAULT_INIT_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
Object.defineProperty(navigator, 'platform', { get: () => 'Win32' });
Object.defineProperty(navigator, 'hardwareConcurrency', { get: () => 8 });
Object.defineProperty(navigator, 'deviceMemory', { get: () => 8 });
window.chrome = {
    runtime: {},
    loadTimes: function() {},
    csi: function() {},
    app: { isInstalled: false }
};
if (window.navigator.permissions && window.navigator.permissions.query) {
    const originalQuery = window.navigator.permissions.query.bind(window.navigator.permissions);
    window.navigator.permissions.query = (parameters) => (
        parameters.name === 'notifications'
            ? Promise.resolve({ state: Notification.permission })
            : originalQuery(parameters)
    );
}
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewportSize {
    pub width: u32,
    pub height: u32,
}

/// Candidate sets the fetch worker draws a browser identity from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StealthProfile {
    pub user_agents: Vec<String>,
    pub viewports: Vec<ViewportSize>,
    pub referrers: Vec<String>,
    pub accept_language: String,
    pub platform: String,
    pub init_script: String,
}

impl Default for StealthProfile {
    fn default() -> Self {
        Self {
            user_agents: [
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36 Edg/118.0.2088.76",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
            viewports: vec![
                ViewportSize { width: 1920, height: 1080 },
                ViewportSize { width: 1366, height: 768 },
                ViewportSize { width: 1536, height: 864 },
                ViewportSize { width: 1440, height: 900 },
            ],
            referrers: [
                "https://www.google.com/",
                "https://www.bing.com/",
                "https://duckduckgo.com/",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
            accept_language: "en-US,en;q=0.9".to_owned(),
            platform: "Win32".to_owned(),
            init_script: DEFAULT_INIT_SCRIPT.to_owned(),
        }
    }
}

/// The concrete identity used for one fetch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserIdentity {
    pub user_agent: String,
    pub viewport: ViewportSize,
    pub referrer: Option<String>,
    pub accept_language: String,
    pub platform: String,
}

impl StealthProfile {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.user_agents.is_empty() {
            anyhow::bail!("stealth.user_agents must not be empty");
        }
        if self.viewports.is_empty() {
            anyhow::bail!("stealth.viewports must not be empty");
        }
        if self
            .viewports
            .iter()
            .any(|viewport| viewport.width == 0 || viewport.height == 0)
        {
            anyhow::bail!("stealth.viewports must have non-zero dimensions");
        }
        Ok(())
    }

    pub fn pick_identity(&self) -> BrowserIdentity {
        let mut rng = rand::rng();
        let user_agent = self
            .user_agents
            .choose(&mut rng)
            .cloned()
            .unwrap_or_default();
        let viewport = self
            .viewports
            .choose(&mut rng)
            .copied()
            .unwrap_or(ViewportSize {
                width: 1920,
                height: 1080,
            });
        let referrer = self.referrers.choose(&mut rng).cloned();

        BrowserIdentity {
            user_agent,
            viewport,
            referrer,
            accept_language: self.accept_language.clone(),
            platform: self.platform.clone(),
        }
    }
}

impl BrowserIdentity {
    /// Headers sent with every request of the session, mimicking a browser
    /// that arrived from a search result.
    pub fn extra_headers(&self) -> serde_json::Value {
        let mut headers = serde_json::json!({
            "Accept": "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            "Accept-Language": self.accept_language,
            "Cache-Control": "no-cache",
            "Pragma": "no-cache",
            "Upgrade-Insecure-Requests": "1",
        });
        if let (Some(referrer), Some(map)) = (&self.referrer, headers.as_object_mut()) {
            map.insert(
                "Referer".to_owned(),
                serde_json::Value::String(referrer.clone()),
            );
        }
        headers
    }
}

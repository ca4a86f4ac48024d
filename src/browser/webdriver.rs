use super::{BrowserError, BrowserLauncher, Locator, LotPage};
use async_trait::async_trait;
use fantoccini::{Client, ClientBuilder, Locator as WdLocator};
use serde_json::{Map, Value, json};
use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrowserKind {
    #[default]
    Edge,
    Chrome,
}

impl BrowserKind {
    pub fn from_str(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "edge" | "msedge" => Some(Self::Edge),
            "chrome" | "chromium" => Some(Self::Chrome),
            _ => None,
        }
    }

    fn browser_name(&self) -> &'static str {
        match self {
            BrowserKind::Edge => "MicrosoftEdge",
            BrowserKind::Chrome => "chrome",
        }
    }

    fn options_key(&self) -> &'static str {
        match self {
            BrowserKind::Edge => "ms:edgeOptions",
            BrowserKind::Chrome => "goog:chromeOptions",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebDriverConfig {
    pub endpoint: String,
    pub kind: BrowserKind,
    /// Previously signed-in profiles; sessions rotate through them.
    pub profile_dirs: Vec<PathBuf>,
    pub headless: bool,
}

/// Starts browser sessions through a running msedgedriver/chromedriver.
pub struct WebDriverLauncher {
    config: WebDriverConfig,
    next_profile: AtomicUsize,
}

impl WebDriverLauncher {
    pub fn new(config: WebDriverConfig) -> Self {
        Self {
            config,
            next_profile: AtomicUsize::new(0),
        }
    }

    fn pick_profile(&self) -> Option<&Path> {
        if self.config.profile_dirs.is_empty() {
            return None;
        }
        let idx = self.next_profile.fetch_add(1, Ordering::Relaxed) % self.config.profile_dirs.len();
        self.config.profile_dirs.get(idx).map(PathBuf::as_path)
    }

    fn capabilities(&self, download_dir: &Path) -> Map<String, Value> {
        let mut args = vec![
            "--disable-blink-features=AutomationControlled".to_string(),
            "--start-maximized".to_string(),
            "--no-first-run".to_string(),
            "--no-default-browser-check".to_string(),
        ];
        if let Some(profile) = self.pick_profile() {
            args.push(format!("--user-data-dir={}", profile.display()));
        }
        if self.config.headless {
            args.push("--headless=new".to_string());
        }

        let mut caps = Map::new();
        caps.insert(
            "browserName".into(),
            Value::String(self.config.kind.browser_name().into()),
        );
        caps.insert(
            self.config.kind.options_key().into(),
            json!({
                "args": args,
                "excludeSwitches": ["enable-automation"],
                "prefs": {
                    "download.default_directory": download_dir.display().to_string(),
                    "download.prompt_for_download": false,
                    "download.directory_upgrade": true,
                    "safebrowsing.enabled": true,
                },
            }),
        );
        caps
    }
}

#[async_trait]
impl BrowserLauncher for WebDriverLauncher {
    async fn open(&self, download_dir: &Path) -> Result<Box<dyn LotPage>, BrowserError> {
        let client = ClientBuilder::native()
            .capabilities(self.capabilities(download_dir))
            .connect(&self.config.endpoint)
            .await
            .map_err(|err| BrowserError::Session(err.to_string()))?;
        debug!(target = "scout.browser", endpoint = %self.config.endpoint, "webdriver_session_open");
        Ok(Box::new(WebDriverPage {
            client,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Resolves `(kind, value)` to the first matching element in page script.
const RESOLVE_JS: &str = r#"
const [kind, value] = [arguments[0], arguments[1]];
let el = null;
if (kind === 'css') {
  el = document.querySelector(value);
} else {
  el = document.evaluate(value, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue;
}
"#;

struct WebDriverPage {
    client: Client,
    closed: AtomicBool,
}

impl WebDriverPage {
    fn ensure_open(&self) -> Result<(), BrowserError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrowserError::Closed)
        } else {
            Ok(())
        }
    }

    async fn script_on(&self, locator: &Locator, body: &str) -> Result<bool, BrowserError> {
        let (kind, value) = match locator {
            Locator::Css(sel) => ("css", sel.clone()),
            Locator::Text(_) | Locator::XPath(_) => ("xpath", xpath_for(locator)),
        };
        let script = format!("{RESOLVE_JS}\nif (!el) {{ return false; }}\n{body}\nreturn true;");
        let found = self
            .client
            .execute(&script, vec![json!(kind), json!(value)])
            .await
            .map_err(|err| BrowserError::Driver(err.to_string()))?;
        Ok(found.as_bool().unwrap_or(false))
    }
}

fn xpath_for(locator: &Locator) -> String {
    match locator {
        Locator::Css(sel) => sel.clone(),
        Locator::XPath(xpath) => xpath.clone(),
        Locator::Text(text) => {
            // XPath 1.0 has no escaping; pick the quote the text does not contain.
            let literal = if text.contains('\'') {
                format!("\"{text}\"")
            } else {
                format!("'{text}'")
            };
            format!("//*[contains(normalize-space(.), {literal}) and not(*[contains(normalize-space(.), {literal})])]")
        }
    }
}

fn wd_locator<'a>(locator: &'a Locator, xpath: &'a str) -> WdLocator<'a> {
    match locator {
        Locator::Css(sel) => WdLocator::Css(sel),
        Locator::XPath(_) | Locator::Text(_) => WdLocator::XPath(xpath),
    }
}

#[async_trait]
impl LotPage for WebDriverPage {
    async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        self.ensure_open()?;
        self.client
            .goto(url)
            .await
            .map_err(|err| BrowserError::Navigation(err.to_string()))
    }

    async fn wait_for(&self, locator: &Locator, timeout: Duration) -> Result<(), BrowserError> {
        self.ensure_open()?;
        let xpath = xpath_for(locator);
        self.client
            .wait()
            .at_most(timeout)
            .for_element(wd_locator(locator, &xpath))
            .await
            .map(|_| ())
            .map_err(|_| BrowserError::Timeout {
                locator: locator.describe(),
                timeout,
            })
    }

    async fn click(&self, locator: &Locator) -> Result<(), BrowserError> {
        self.ensure_open()?;
        let xpath = xpath_for(locator);
        let element = self
            .client
            .find(wd_locator(locator, &xpath))
            .await
            .map_err(|_| BrowserError::NotFound(locator.describe()))?;
        match element.click().await {
            Ok(()) => Ok(()),
            Err(err) => {
                // Overlays intercept native clicks on the sprite icons; dispatch it from script.
                warn!(target = "scout.browser", locator = %locator.describe(), error = %err, "native_click_failed");
                if self.script_on(locator, "el.click();").await? {
                    Ok(())
                } else {
                    Err(BrowserError::NotFound(locator.describe()))
                }
            }
        }
    }

    async fn hover(&self, locator: &Locator) -> Result<(), BrowserError> {
        self.ensure_open()?;
        let body = "['mouseover', 'mouseenter', 'mousemove'].forEach(t => el.dispatchEvent(new MouseEvent(t, { bubbles: true })));";
        if self.script_on(locator, body).await? {
            Ok(())
        } else {
            Err(BrowserError::NotFound(locator.describe()))
        }
    }

    async fn scroll_by(&self, delta_y: i64) -> Result<(), BrowserError> {
        self.ensure_open()?;
        self.client
            .execute("window.scrollBy(0, arguments[0]);", vec![json!(delta_y)])
            .await
            .map(|_| ())
            .map_err(|err| BrowserError::Driver(err.to_string()))
    }

    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError> {
        self.ensure_open()?;
        self.client
            .screenshot()
            .await
            .map_err(|err| BrowserError::Driver(err.to_string()))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.client
            .clone()
            .close()
            .await
            .map_err(|err| BrowserError::Driver(err.to_string()))
    }
}

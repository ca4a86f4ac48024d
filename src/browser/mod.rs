pub mod locators;
pub mod webdriver;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{future::Future, path::Path, time::Duration};
use thiserror::Error;

pub use locators::LocatorChains;
pub use webdriver::WebDriverLauncher;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("session could not be started: {0}")]
    Session(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("element `{0}` not found")]
    NotFound(String),
    #[error("timed out after {timeout:?} waiting for `{locator}`")]
    Timeout { locator: String, timeout: Duration },
    #[error("driver command failed: {0}")]
    Driver(String),
    #[error("session already closed")]
    Closed,
}

/// How a UI affordance is found on the listing page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locator {
    Css(String),
    /// Element whose visible text contains the value.
    Text(String),
    #[serde(rename = "xpath")]
    XPath(String),
}

impl Locator {
    pub fn css(value: &str) -> Self {
        Locator::Css(value.to_string())
    }

    pub fn text(value: &str) -> Self {
        Locator::Text(value.to_string())
    }

    pub fn xpath(value: &str) -> Self {
        Locator::XPath(value.to_string())
    }

    pub fn describe(&self) -> String {
        match self {
            Locator::Css(sel) => sel.clone(),
            Locator::Text(text) => format!("text={text}"),
            Locator::XPath(xpath) => format!("xpath={xpath}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocatorStrategy {
    pub name: String,
    /// Written as a one-key map in YAML: `locator: { css: "..." }`.
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub locator: Locator,
}

impl LocatorStrategy {
    pub fn new(name: &str, locator: Locator) -> Self {
        Self {
            name: name.to_string(),
            locator,
        }
    }
}

/// Ordered alternatives for locating one affordance, most specific first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FallbackChain {
    strategies: Vec<LocatorStrategy>,
}

impl FallbackChain {
    pub fn new(strategies: Vec<LocatorStrategy>) -> Self {
        Self { strategies }
    }

    pub fn strategies(&self) -> &[LocatorStrategy] {
        &self.strategies
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Runs `attempt` against each strategy in declared order and stops at
    /// the first success. Failures are handed to `on_miss` for logging.
    pub async fn first_success<'a, T, F, Fut>(
        &'a self,
        mut attempt: F,
        mut on_miss: impl FnMut(&LocatorStrategy, &BrowserError),
    ) -> Option<(&'a LocatorStrategy, T)>
    where
        F: FnMut(&'a LocatorStrategy) -> Fut,
        Fut: Future<Output = Result<T, BrowserError>>,
    {
        for strategy in &self.strategies {
            match attempt(strategy).await {
                Ok(value) => return Some((strategy, value)),
                Err(err) => on_miss(strategy, &err),
            }
        }
        None
    }
}

/// One live browser tab driving a listing page.
#[async_trait]
pub trait LotPage: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), BrowserError>;
    async fn wait_for(&self, locator: &Locator, timeout: Duration) -> Result<(), BrowserError>;
    async fn click(&self, locator: &Locator) -> Result<(), BrowserError>;
    async fn hover(&self, locator: &Locator) -> Result<(), BrowserError>;
    async fn scroll_by(&self, delta_y: i64) -> Result<(), BrowserError>;
    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError>;
    /// Safe to call more than once; later calls are no-ops.
    async fn close(&self) -> Result<(), BrowserError>;
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Opens a session whose file downloads land in `download_dir`.
    async fn open(&self, download_dir: &Path) -> Result<Box<dyn LotPage>, BrowserError>;
}


#[cfg(test)]
mod tests {
    use super::testing::FakePage;
    use super::*;
    use std::sync::Arc;

    fn chain() -> FallbackChain {
        FallbackChain::new(vec![
            LocatorStrategy::new("floating", Locator::css("a.floating span.icon")),
            LocatorStrategy::new("header", Locator::css("span.header.icon")),
            LocatorStrategy::new("button", Locator::css("button.icon")),
            LocatorStrategy::new("loose", Locator::css("span.icon")),
        ])
    }

    #[tokio::test]
    async fn chain_stops_at_first_success_in_priority_order() {
        let chain = chain();
        let page = Arc::new(FakePage::with_present(&[
            Locator::css("button.icon"),
            Locator::css("span.icon"),
        ]));
        let mut tried = Vec::new();
        let winner = chain
            .first_success(
                |strategy| {
                    tried.push(strategy.name.clone());
                    let page = page.clone();
                    async move {
                        page.wait_for(&strategy.locator, Duration::from_millis(5))
                            .await?;
                        page.click(&strategy.locator).await
                    }
                },
                |_, _| {},
            )
            .await
            .map(|(strategy, _)| strategy.name.clone());

        assert_eq!(winner.as_deref(), Some("button"));
        assert_eq!(tried, vec!["floating", "header", "button"]);
        assert_eq!(page.clicked(), vec![Locator::css("button.icon")]);
    }

    #[tokio::test]
    async fn exhausted_chain_reports_every_miss() {
        let chain = chain();
        let mut misses = Vec::new();
        let result: Option<(&LocatorStrategy, ())> = chain
            .first_success(
                |strategy| async move { Err(BrowserError::NotFound(strategy.locator.describe())) },
                |strategy, _| misses.push(strategy.name.clone()),
            )
            .await;
        assert!(result.is_none());
        assert_eq!(misses.len(), 4);
        assert_eq!(misses[0], "floating");
    }

    #[test]
    fn text_locators_describe_like_selectors() {
        assert_eq!(Locator::text("Download all").describe(), "text=Download all");
        assert_eq!(Locator::css("img").describe(), "img");
    }
}

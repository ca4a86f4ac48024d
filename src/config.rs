use crate::acquire::AcquireConfig;
use crate::browser::webdriver::{BrowserKind, WebDriverConfig};
use crate::estimate::{EstimatorConfig, RetryPolicy};
use crate::models::EstimateVariant;
use crate::readiness::Readiness;
use std::{path::PathBuf, time::Duration};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Everything the coordinator needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub download_dir: PathBuf,
    pub screenshot_dir: PathBuf,
    pub min_images: usize,
    pub max_images: usize,
    pub min_interval: Duration,
    pub retry_limit: u32,
    pub submit_stagger: Duration,
    pub acquire_concurrency: usize,
    pub analyze_concurrency: usize,
    pub watchdog: Duration,
    pub page_load_timeout: Duration,
    pub descriptive_folders: bool,
    pub webdriver: WebDriverConfig,
    pub locator_chains_path: Option<PathBuf>,
    pub variant: EstimateVariant,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            screenshot_dir: PathBuf::from("debug_screenshots"),
            min_images: 5,
            max_images: 5,
            min_interval: Duration::from_secs(10),
            retry_limit: 3,
            submit_stagger: Duration::from_millis(1500),
            acquire_concurrency: 3,
            analyze_concurrency: 2,
            watchdog: Duration::from_secs(45),
            page_load_timeout: Duration::from_secs(15),
            descriptive_folders: false,
            webdriver: WebDriverConfig {
                endpoint: "http://localhost:9515".into(),
                kind: BrowserKind::default(),
                profile_dirs: Vec::new(),
                headless: false,
            },
            locator_chains_path: None,
            variant: EstimateVariant::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let positive = |key: &str| get(key).and_then(|v| v.parse::<u64>().ok()).filter(|v| *v > 0);
        let flag = |key: &str| {
            get(key).map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        };

        let mut config = Self::default();
        if let Some(dir) = get("DOWNLOAD_DIR") {
            config.download_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get("SCREENSHOT_DIR") {
            config.screenshot_dir = PathBuf::from(dir);
        }
        if let Some(n) = positive("MIN_IMAGES") {
            config.min_images = n as usize;
        }
        if let Some(n) = positive("MAX_IMAGES") {
            config.max_images = n as usize;
        }
        // Zero is a valid interval: it turns pacing off.
        if let Some(interval) = get("MIN_INTERVAL_SECS")
            .and_then(|v| v.parse::<f64>().ok())
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        {
            config.min_interval = interval;
        }
        if let Some(n) = positive("RETRY_LIMIT") {
            config.retry_limit = n as u32;
        }
        if let Some(ms) = get("SUBMIT_STAGGER_MS").and_then(|v| v.parse::<u64>().ok()) {
            config.submit_stagger = Duration::from_millis(ms);
        }
        if let Some(n) = positive("ACQUIRE_CONCURRENCY") {
            config.acquire_concurrency = n as usize;
        }
        if let Some(n) = positive("ANALYZE_CONCURRENCY") {
            config.analyze_concurrency = n as usize;
        }
        if let Some(secs) = positive("ACQUIRE_WATCHDOG_SECS") {
            config.watchdog = Duration::from_secs(secs);
        }
        if let Some(secs) = positive("PAGE_LOAD_TIMEOUT_SECS") {
            config.page_load_timeout = Duration::from_secs(secs);
        }
        if let Some(on) = flag("DESCRIPTIVE_FOLDERS") {
            config.descriptive_folders = on;
        }

        if let Some(url) = get("WEBDRIVER_URL") {
            config.webdriver.endpoint = url;
        }
        if let Some(kind) = get("BROWSER_KIND") {
            config.webdriver.kind = BrowserKind::from_str(&kind).ok_or(ConfigError::Invalid {
                key: "BROWSER_KIND",
                value: kind,
            })?;
        }
        if let Some(dirs) = get("BROWSER_PROFILE_DIRS") {
            config.webdriver.profile_dirs = dirs
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Some(on) = flag("BROWSER_HEADLESS") {
            config.webdriver.headless = on;
        }
        config.locator_chains_path = get("LOCATOR_CHAINS_PATH").map(PathBuf::from);

        if let Some(variant) = get("ESTIMATE_VARIANT") {
            config.variant = parse_variant(&variant)?;
        }
        Ok(config)
    }

    pub fn readiness(&self) -> Readiness {
        Readiness::new(self.min_images)
    }

    pub fn acquire_config(&self) -> AcquireConfig {
        AcquireConfig {
            download_root: self.download_dir.clone(),
            screenshot_dir: self.screenshot_dir.clone(),
            watchdog: self.watchdog,
            load_timeout: self.page_load_timeout,
            descriptive_folders: self.descriptive_folders,
            ..AcquireConfig::default()
        }
    }

    pub fn estimator_config(&self) -> EstimatorConfig {
        EstimatorConfig {
            variant: self.variant,
            max_images: self.max_images,
            retry: RetryPolicy {
                limit: self.retry_limit,
                ..RetryPolicy::default()
            },
        }
    }
}

pub fn parse_variant(raw: &str) -> Result<EstimateVariant, ConfigError> {
    EstimateVariant::from_str(raw).ok_or(ConfigError::Invalid {
        key: "ESTIMATE_VARIANT",
        value: raw.to_string(),
    })
}

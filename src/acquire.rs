use crate::archive::{self, ArchiveError};
use crate::browser::{BrowserError, BrowserLauncher, FallbackChain, LocatorChains, LotPage};
use crate::metrics;
use crate::models::{LotHints, LotId, LotIdError, LotOutcome, lot_folder_name};
use crate::readiness::Readiness;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct AcquireConfig {
    pub download_root: PathBuf,
    pub screenshot_dir: PathBuf,
    /// Wall-clock ceiling for one browser session, from open until the
    /// archive is captured.
    pub watchdog: Duration,
    pub load_timeout: Duration,
    pub image_timeout: Duration,
    pub locator_timeout: Duration,
    pub download_all_timeout: Duration,
    pub archive_timeout: Duration,
    pub archive_poll: Duration,
    pub hover_pause: Duration,
    /// How long closing a session may take once the lot is finished.
    pub close_grace: Duration,
    pub gallery_scroll: i64,
    /// Use `<id>_<year>_<make>_<model>` instead of the bare id for folders.
    pub descriptive_folders: bool,
}

impl Default for AcquireConfig {
    fn default() -> Self {
        Self {
            download_root: PathBuf::from("downloads"),
            screenshot_dir: PathBuf::from("debug_screenshots"),
            watchdog: Duration::from_secs(45),
            load_timeout: Duration::from_secs(15),
            image_timeout: Duration::from_secs(10),
            locator_timeout: Duration::from_secs(5),
            download_all_timeout: Duration::from_secs(8),
            archive_timeout: Duration::from_secs(20),
            archive_poll: Duration::from_millis(250),
            hover_pause: Duration::from_secs(1),
            close_grace: Duration::from_secs(5),
            gallery_scroll: 3000,
            descriptive_folders: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error(transparent)]
    LotId(#[from] LotIdError),
    #[error("listing did not render: {0}")]
    Navigation(String),
    #[error("no {chain} locator matched")]
    LocatorExhausted { chain: &'static str },
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("watchdog closed the session after {0:?}")]
    Watchdog(Duration),
    #[error("browser failure: {0}")]
    Browser(#[from] BrowserError),
    #[error("filesystem failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("extraction task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireStatus {
    /// Enough images were already on disk.
    AlreadyPresent,
    Downloaded { images: usize },
}

/// Archive Acquisition Worker: one browser session per lot.
pub struct Acquirer {
    launcher: Arc<dyn BrowserLauncher>,
    chains: Arc<LocatorChains>,
    readiness: Readiness,
    config: AcquireConfig,
}

impl Acquirer {
    pub fn new(
        launcher: Arc<dyn BrowserLauncher>,
        chains: Arc<LocatorChains>,
        readiness: Readiness,
        config: AcquireConfig,
    ) -> Self {
        Self {
            launcher,
            chains,
            readiness,
            config,
        }
    }

    pub fn lot_dir(&self, id: &LotId, hints: &LotHints) -> PathBuf {
        let name = if self.config.descriptive_folders {
            lot_folder_name(id, hints)
        } else {
            lot_folder_name(id, &LotHints::default())
        };
        self.config.download_root.join(name)
    }

    /// Lot boundary: every failure is logged and folded into the outcome.
    pub async fn acquire(&self, url: &str, hints: &LotHints) -> LotOutcome {
        let started = Instant::now();
        let result = self.try_acquire(url, hints).await;
        metrics::stage_elapsed("acquire", started.elapsed().as_millis());
        match result {
            Ok(AcquireStatus::AlreadyPresent) => LotOutcome::Skipped,
            Ok(AcquireStatus::Downloaded { images }) => {
                info!(target = "scout.acquire", url, images, "lot_downloaded");
                metrics::lot_outcome("acquire", true);
                LotOutcome::Done
            }
            Err(err) => {
                warn!(target = "scout.acquire", url, error = %err, "lot_download_failed");
                metrics::lot_outcome("acquire", false);
                LotOutcome::Failed
            }
        }
    }

    pub async fn try_acquire(
        &self,
        url: &str,
        hints: &LotHints,
    ) -> Result<AcquireStatus, AcquireError> {
        let id = LotId::from_url(url)?;
        let lot_dir = self.lot_dir(&id, hints);
        if !self.readiness.needs_download(&lot_dir) {
            debug!(target = "scout.acquire", lot_id = %id, "download_skipped_images_present");
            return Ok(AcquireStatus::AlreadyPresent);
        }
        tokio::fs::create_dir_all(&lot_dir).await?;
        // Partial or stale archives from a killed session would block the capture.
        archive::clear_leftovers(&lot_dir)?;
        info!(target = "scout.acquire", lot_id = %id, dir = %lot_dir.display(), "lot_download_started");

        // The watchdog covers session creation too.
        let watchdog = sleep(self.config.watchdog);
        tokio::pin!(watchdog);

        let launcher = self.launcher.clone();
        let download_dir = lot_dir.clone();
        let mut opening = tokio::spawn(async move { launcher.open(&download_dir).await });
        let page = tokio::select! {
            opened = &mut opening => opened.map_err(|err| AcquireError::Join(err.to_string()))??,
            _ = &mut watchdog => {
                warn!(target = "scout.acquire", lot_id = %id, ceiling = ?self.config.watchdog, "watchdog_fired_during_open");
                let wait = self.config.watchdog + self.config.close_grace;
                tokio::spawn(reap_late_session(opening, wait, self.config.close_grace));
                return Err(AcquireError::Watchdog(self.config.watchdog));
            }
        };

        let captured = tokio::select! {
            result = self.drive(page.as_ref(), url, &id, &lot_dir) => result,
            _ = &mut watchdog => {
                warn!(target = "scout.acquire", lot_id = %id, ceiling = ?self.config.watchdog, "watchdog_fired");
                Err(AcquireError::Watchdog(self.config.watchdog))
            }
        };
        self.close_session(page.as_ref(), &id).await;

        // Extraction runs after the session is closed, outside the watchdog.
        let archive_path = captured?;
        let target = lot_dir.clone();
        let images = tokio::task::spawn_blocking(move || archive::extract_in_place(&archive_path, &target))
            .await
            .map_err(|err| AcquireError::Join(err.to_string()))??;
        Ok(AcquireStatus::Downloaded { images })
    }

    async fn close_session(&self, page: &dyn LotPage, id: &LotId) {
        match timeout(self.config.close_grace, page.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(target = "scout.acquire", lot_id = %id, error = %err, "session_close_failed")
            }
            Err(_) => {
                warn!(target = "scout.acquire", lot_id = %id, grace = ?self.config.close_grace, "session_close_timed_out")
            }
        }
    }

    /// Drives the listing up to a finished archive in `lot_dir`.
    async fn drive(
        &self,
        page: &dyn LotPage,
        url: &str,
        id: &LotId,
        lot_dir: &Path,
    ) -> Result<PathBuf, AcquireError> {
        page.goto(url)
            .await
            .map_err(|err| AcquireError::Navigation(err.to_string()))?;

        let rendered = self
            .await_any(page, &self.chains.content_ready, self.config.load_timeout)
            .await
            && self
                .await_any(page, &self.chains.listing_image, self.config.image_timeout)
                .await;
        if !rendered {
            self.capture(page, id, "load_fail").await;
            return Err(AcquireError::Navigation(format!(
                "lot {id} detail panel or images missing"
            )));
        }

        if let Err(err) = page.scroll_by(self.config.gallery_scroll).await {
            debug!(target = "scout.acquire", lot_id = %id, error = %err, "gallery_scroll_failed");
        }

        if !self.trigger_download(page, id).await {
            self.capture(page, id, "trigger_fail").await;
            return Err(AcquireError::LocatorExhausted {
                chain: "download_trigger",
            });
        }

        let download_all = self
            .click_chain(page, &self.chains.download_all, Some(self.config.download_all_timeout), id)
            .await;
        if download_all.is_none() {
            self.capture(page, id, "download_fail").await;
            return Err(AcquireError::LocatorExhausted {
                chain: "download_all",
            });
        }

        match archive::await_archive(lot_dir, self.config.archive_timeout, self.config.archive_poll)
            .await
        {
            Ok(path) => Ok(path),
            Err(err) => {
                self.capture(page, id, "download_fail").await;
                Err(err.into())
            }
        }
    }

    /// Walks the trigger chain; if nothing matches, hovers the gallery and
    /// walks it once more without waiting.
    async fn trigger_download(&self, page: &dyn LotPage, id: &LotId) -> bool {
        let chain = &self.chains.download_trigger;
        if self
            .click_chain(page, chain, Some(self.config.locator_timeout), id)
            .await
            .is_some()
        {
            return true;
        }

        debug!(target = "scout.acquire", lot_id = %id, "download_trigger_hover_retry");
        let hovered = self
            .chains
            .gallery
            .first_success(|strategy| page.hover(&strategy.locator), |_, _| {})
            .await;
        if hovered.is_none() {
            debug!(target = "scout.acquire", lot_id = %id, "gallery_hover_missed");
        }
        sleep(self.config.hover_pause).await;
        self.click_chain(page, chain, None, id).await.is_some()
    }

    /// First strategy in `chain` that can be (optionally awaited and) clicked.
    async fn click_chain(
        &self,
        page: &dyn LotPage,
        chain: &FallbackChain,
        wait: Option<Duration>,
        id: &LotId,
    ) -> Option<String> {
        chain
            .first_success(
                |strategy| async move {
                    if let Some(timeout) = wait {
                        page.wait_for(&strategy.locator, timeout).await?;
                    }
                    page.click(&strategy.locator).await
                },
                |strategy, err| {
                    debug!(target = "scout.acquire", lot_id = %id, strategy = %strategy.name, error = %err, "locator_missed")
                },
            )
            .await
            .map(|(strategy, ())| {
                info!(target = "scout.acquire", lot_id = %id, strategy = %strategy.name, "locator_clicked");
                strategy.name.clone()
            })
    }

    async fn await_any(&self, page: &dyn LotPage, chain: &FallbackChain, timeout: Duration) -> bool {
        chain
            .first_success(|strategy| page.wait_for(&strategy.locator, timeout), |_, _| {})
            .await
            .is_some()
    }

    async fn capture(&self, page: &dyn LotPage, id: &LotId, tag: &str) {
        let path = self.config.screenshot_dir.join(format!("{tag}_{id}.png"));
        let result = async {
            let png = page.screenshot().await.map_err(|err| err.to_string())?;
            tokio::fs::create_dir_all(&self.config.screenshot_dir)
                .await
                .map_err(|err| err.to_string())?;
            tokio::fs::write(&path, png).await.map_err(|err| err.to_string())
        }
        .await;
        match result {
            Ok(()) => info!(target = "scout.acquire", lot_id = %id, path = %path.display(), "diagnostic_screenshot_saved"),
            Err(err) => warn!(target = "scout.acquire", lot_id = %id, error = %err, "diagnostic_screenshot_failed"),
        }
    }
}

/// Closes a session whose open outlived the watchdog, once it finishes opening.
async fn reap_late_session(
    mut opening: JoinHandle<Result<Box<dyn LotPage>, BrowserError>>,
    wait: Duration,
    grace: Duration,
) {
    match timeout(wait, &mut opening).await {
        Ok(Ok(Ok(page))) => {
            let closed = timeout(grace, page.close()).await;
            debug!(target = "scout.acquire", closed = matches!(closed, Ok(Ok(()))), "late_session_reaped");
        }
        Ok(_) => {}
        Err(_) => {
            opening.abort();
            warn!(target = "scout.acquire", "late_session_abandoned");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::archive::testing::write_image_zip;
    use crate::browser::Locator;
    use crate::browser::testing::FakePage;
    use std::{path::Path, sync::Arc};

    pub fn rendered_page() -> Vec<Locator> {
        vec![
            Locator::css("div.lot-details-header"),
            Locator::css("img[src*='copart']"),
        ]
    }

    /// Listing where a late trigger strategy and the "Download all" link
    /// work; clicking the link drops an archive of `images` pictures.
    pub fn downloadable_page(archive_name: &'static str, images: usize) -> FakePage {
        let download_all = Locator::xpath("//a[contains(normalize-space(.), 'Download all')]");
        let mut present = rendered_page();
        present.push(Locator::css("button[aria-label*='Download']"));
        present.push(download_all.clone());
        let mut page = FakePage::with_present(&present);
        page.on_click.insert(
            download_all,
            Arc::new(move |dir: &Path| write_image_zip(&dir.join(archive_name), images)),
        );
        page
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{downloadable_page, rendered_page};
    use super::*;
    use crate::archive::testing::write_image_zip;
    use crate::browser::Locator;
    use crate::browser::testing::{FakeLauncher, FakePage};
    use crate::readiness::count_images;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    const URL: &str = "https://www.copart.com/lot/12345/clean-title-2019-honda-civic";

    fn config(root: &TempDir) -> AcquireConfig {
        AcquireConfig {
            download_root: root.path().join("downloads"),
            screenshot_dir: root.path().join("shots"),
            watchdog: Duration::from_secs(5),
            archive_timeout: Duration::from_secs(2),
            archive_poll: Duration::from_millis(10),
            hover_pause: Duration::from_millis(1),
            ..AcquireConfig::default()
        }
    }

    fn acquirer(launcher: Arc<FakeLauncher>, root: &TempDir) -> Acquirer {
        Acquirer::new(
            launcher,
            Arc::new(LocatorChains::default()),
            Readiness::default(),
            config(root),
        )
    }

    #[tokio::test]
    async fn downloads_and_extracts_archive() {
        let root = tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new(downloadable_page("12345.zip", 6)));
        let worker = acquirer(launcher.clone(), &root);

        let status = worker
            .try_acquire(URL, &LotHints::default())
            .await
            .expect("acquired");
        assert_eq!(status, AcquireStatus::Downloaded { images: 6 });

        let lot_dir = root.path().join("downloads/12345");
        assert_eq!(count_images(&lot_dir), 6);
        assert!(!lot_dir.join("12345.zip").exists());
        assert_eq!(
            launcher.page.clicked(),
            vec![
                Locator::css("button[aria-label*='Download']"),
                Locator::xpath("//a[contains(normalize-space(.), 'Download all')]"),
            ]
        );
        assert!(launcher.page.closed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn existing_images_skip_the_browser() {
        let root = tempdir().unwrap();
        let lot_dir = root.path().join("downloads/12345");
        fs::create_dir_all(&lot_dir).unwrap();
        for idx in 0..5 {
            fs::write(lot_dir.join(format!("{idx}.jpg")), b"x").unwrap();
        }
        let launcher = Arc::new(FakeLauncher::new(downloadable_page("12345.zip", 6)));
        let worker = acquirer(launcher.clone(), &root);

        assert_eq!(
            worker.acquire(URL, &LotHints::default()).await,
            LotOutcome::Skipped
        );
        assert_eq!(launcher.sessions(), 0);
    }

    #[tokio::test]
    async fn hover_reveals_trigger_on_second_pass() {
        let root = tempdir().unwrap();
        let mut page = downloadable_page("12345.zip", 5);
        page.present
            .get_mut()
            .unwrap()
            .remove(&Locator::css("button[aria-label*='Download']"));
        page.hover_reveals = vec![Locator::css("span.download-image-sprite-icon")];
        let launcher = Arc::new(FakeLauncher::new(page));
        let worker = acquirer(launcher.clone(), &root);

        assert_eq!(
            worker.acquire(URL, &LotHints::default()).await,
            LotOutcome::Done
        );
        assert!(launcher.page.hovers.load(std::sync::atomic::Ordering::SeqCst) >= 1);
        assert_eq!(
            launcher.page.clicked().first(),
            Some(&Locator::css("span.download-image-sprite-icon"))
        );
    }

    #[tokio::test]
    async fn unrendered_listing_fails_with_screenshot() {
        let root = tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new(FakePage::default()));
        let worker = acquirer(launcher.clone(), &root);

        let err = worker
            .try_acquire(URL, &LotHints::default())
            .await
            .expect_err("no render");
        assert!(matches!(err, AcquireError::Navigation(_)));
        assert!(root.path().join("shots/load_fail_12345.png").is_file());
        assert!(launcher.page.clicked().is_empty());
        assert!(launcher.page.closed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn exhausted_trigger_chain_is_a_lot_failure() {
        let root = tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new(FakePage::with_present(&rendered_page())));
        let worker = acquirer(launcher.clone(), &root);

        let err = worker
            .try_acquire(URL, &LotHints::default())
            .await
            .expect_err("no trigger");
        assert!(matches!(
            err,
            AcquireError::LocatorExhausted {
                chain: "download_trigger"
            }
        ));
        assert!(root.path().join("shots/trigger_fail_12345.png").is_file());
        assert_eq!(
            worker.acquire(URL, &LotHints::default()).await,
            LotOutcome::Failed
        );
    }

    #[tokio::test]
    async fn watchdog_closes_a_stuck_session() {
        let root = tempdir().unwrap();
        let page = FakePage {
            hang_on_goto: true,
            ..FakePage::default()
        };
        let launcher = Arc::new(FakeLauncher::new(page));
        let worker = Acquirer::new(
            launcher.clone(),
            Arc::new(LocatorChains::default()),
            Readiness::default(),
            AcquireConfig {
                watchdog: Duration::from_millis(50),
                ..config(&root)
            },
        );

        let started = Instant::now();
        let err = worker
            .try_acquire(URL, &LotHints::default())
            .await
            .expect_err("watchdog");
        assert!(matches!(err, AcquireError::Watchdog(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(launcher.page.closed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn watchdog_bounds_a_session_whose_close_hangs() {
        let root = tempdir().unwrap();
        let page = FakePage {
            hang_on_goto: true,
            hang_on_close: true,
            ..FakePage::default()
        };
        let worker = Acquirer::new(
            Arc::new(FakeLauncher::new(page)),
            Arc::new(LocatorChains::default()),
            Readiness::default(),
            AcquireConfig {
                watchdog: Duration::from_millis(50),
                close_grace: Duration::from_millis(50),
                ..config(&root)
            },
        );

        let result = timeout(
            Duration::from_secs(3),
            worker.try_acquire(URL, &LotHints::default()),
        )
        .await
        .expect("watchdog bounds the whole call");
        assert!(matches!(result, Err(AcquireError::Watchdog(_))));
    }

    #[tokio::test]
    async fn hung_close_keeps_the_captured_archive() {
        let root = tempdir().unwrap();
        let mut page = downloadable_page("12345.zip", 6);
        page.hang_on_close = true;
        let worker = Acquirer::new(
            Arc::new(FakeLauncher::new(page)),
            Arc::new(LocatorChains::default()),
            Readiness::default(),
            AcquireConfig {
                close_grace: Duration::from_millis(50),
                ..config(&root)
            },
        );

        let status = worker
            .try_acquire(URL, &LotHints::default())
            .await
            .expect("acquired");
        assert_eq!(status, AcquireStatus::Downloaded { images: 6 });
        assert_eq!(count_images(&root.path().join("downloads/12345")), 6);
    }

    #[tokio::test]
    async fn leftovers_from_a_killed_session_are_cleared() {
        let root = tempdir().unwrap();
        let lot_dir = root.path().join("downloads/12345");
        fs::create_dir_all(&lot_dir).unwrap();
        fs::write(lot_dir.join("12345.zip.crdownload"), b"partial").unwrap();
        write_image_zip(&lot_dir.join("00000.zip"), 1);
        let launcher = Arc::new(FakeLauncher::new(downloadable_page("12345.zip", 6)));
        let worker = acquirer(launcher, &root);

        let status = worker
            .try_acquire(URL, &LotHints::default())
            .await
            .expect("acquired");
        assert_eq!(status, AcquireStatus::Downloaded { images: 6 });
        assert!(!lot_dir.join("12345.zip.crdownload").exists());
        assert!(!lot_dir.join("00000.zip").exists());
    }

    #[tokio::test]
    async fn session_opened_after_the_watchdog_is_closed() {
        let root = tempdir().unwrap();
        let mut launcher = FakeLauncher::new(downloadable_page("12345.zip", 6));
        launcher.open_delay = Duration::from_millis(200);
        let launcher = Arc::new(launcher);
        let worker = Acquirer::new(
            launcher.clone(),
            Arc::new(LocatorChains::default()),
            Readiness::default(),
            AcquireConfig {
                watchdog: Duration::from_millis(50),
                ..config(&root)
            },
        );

        let started = Instant::now();
        let err = worker
            .try_acquire(URL, &LotHints::default())
            .await
            .expect_err("watchdog");
        assert!(matches!(err, AcquireError::Watchdog(_)));
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(!launcher.page.closed.load(std::sync::atomic::Ordering::SeqCst));

        sleep(Duration::from_millis(400)).await;
        assert!(launcher.page.closed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(launcher.page.clicked().is_empty());
    }

    #[tokio::test]
    async fn descriptive_folders_include_hints() {
        let root = tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new(FakePage::default()));
        let worker = Acquirer::new(
            launcher,
            Arc::new(LocatorChains::default()),
            Readiness::default(),
            AcquireConfig {
                descriptive_folders: true,
                ..config(&root)
            },
        );
        let hints = LotHints {
            year: Some("2019".into()),
            make: Some("HONDA".into()),
            model: Some("CIVIC EX".into()),
            mileage: None,
        };
        let dir = worker.lot_dir(&LotId::parse("12345").unwrap(), &hints);
        assert!(dir.ends_with("12345_2019_HONDA_CIVIC_EX"));
    }
}

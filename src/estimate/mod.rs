pub mod images;
pub mod parse;
pub mod prompt;

use crate::limiter::RateLimiter;
use crate::llm::{InferenceService, LlmError, MultimodalRequest};
use crate::metrics;
use crate::models::{EstimateRecord, EstimateVariant, LotHints, LotId, LotOutcome, ResaleOutlook};
use crate::readiness::{
    self, EVALUATION_FILE, REPAIR_DETAILS_FILE, RESALE_FILE, Readiness, TERMINAL_MARKER,
};
use crate::supabase::LotStore;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub use parse::{ParseError, extract_record, parse_response};

/// Phrase a text-only model uses when it cannot see the attachments.
const VISION_REFUSAL: &str = "unable to analyze images";

#[derive(Debug, Error)]
pub enum EstimateError {
    #[error("no images found for this lot")]
    NoImages,
    #[error(transparent)]
    Image(#[from] images::EncodeError),
    #[error(transparent)]
    Malformed(#[from] ParseError),
    #[error("max retries reached after {attempts} attempts: {last}")]
    MaxRetries { attempts: u32, last: String },
    #[error("filesystem failure: {0}")]
    Io(#[from] io::Error),
    #[error("encoding task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per lot, transient and otherwise.
    pub limit: u32,
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Duration,
    /// Fixed wait after a non-transient failure.
    pub pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 3,
            base: Duration::from_secs(5),
            cap: Duration::from_secs(45),
            jitter: Duration::from_secs(3),
            pause: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    /// `min(cap, base * 2^attempt)` plus uniform jitter; `attempt` starts at 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32 << attempt.min(16));
        let jitter = self.jitter.mul_f64(rand::random::<f64>());
        exp.min(self.cap) + jitter
    }

    fn wait_after(&self, attempt: u32, err: &LlmError) -> Duration {
        match err {
            LlmError::RateLimited {
                retry_after: Some(hint),
            } => self.backoff(attempt).max(*hint),
            err if err.is_transient() => self.backoff(attempt),
            _ => self.pause,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    pub variant: EstimateVariant,
    pub max_images: usize,
    pub retry: RetryPolicy,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            variant: EstimateVariant::default(),
            max_images: 5,
            retry: RetryPolicy::default(),
        }
    }
}

/// Estimation Worker: photos in, repair and resale appraisal out.
pub struct Estimator {
    service: Arc<dyn InferenceService>,
    limiter: Arc<RateLimiter>,
    store: Option<Arc<dyn LotStore>>,
    readiness: Readiness,
    config: EstimatorConfig,
}

impl Estimator {
    pub fn new(
        service: Arc<dyn InferenceService>,
        limiter: Arc<RateLimiter>,
        store: Option<Arc<dyn LotStore>>,
        readiness: Readiness,
        config: EstimatorConfig,
    ) -> Self {
        Self {
            service,
            limiter,
            store,
            readiness,
            config,
        }
    }

    /// Lot boundary: logs the outcome; an already analysed lot is `Skipped`.
    pub async fn analyze(&self, lot_dir: &Path, hints: &LotHints) -> LotOutcome {
        let started = Instant::now();
        let result = self.estimate_lot(lot_dir, hints).await;
        metrics::stage_elapsed("analyze", started.elapsed().as_millis());
        match result {
            Ok(None) => LotOutcome::Skipped,
            Ok(Some(record)) => {
                info!(
                    target = "scout.estimate",
                    dir = %lot_dir.display(),
                    repair = record.repair_cost,
                    resale = ?record.outlook.resale_value(),
                    "lot_estimated"
                );
                metrics::lot_outcome("analyze", true);
                LotOutcome::Done
            }
            Err(err) => {
                warn!(target = "scout.estimate", dir = %lot_dir.display(), error = %err, "lot_estimate_failed");
                metrics::lot_outcome("analyze", false);
                LotOutcome::Failed
            }
        }
    }

    /// `Ok(None)` when the lot already carries its terminal marker.
    pub async fn estimate_lot(
        &self,
        lot_dir: &Path,
        hints: &LotHints,
    ) -> Result<Option<EstimateRecord>, EstimateError> {
        if !self.readiness.needs_analysis(lot_dir) {
            debug!(target = "scout.estimate", dir = %lot_dir.display(), "estimate_skipped_marker_present");
            return Ok(None);
        }

        let photos = readiness::list_images(lot_dir, self.config.max_images)?;
        if photos.is_empty() {
            return Err(EstimateError::NoImages);
        }
        let image_data_urls = tokio::task::spawn_blocking(move || images::encode_all(&photos))
            .await
            .map_err(|err| EstimateError::Join(err.to_string()))??;

        let request = MultimodalRequest {
            instruction: prompt::compose(self.config.variant, hints),
            image_data_urls,
        };
        let raw = self.infer(&request, lot_dir).await?;
        let object = parse_response(&raw)?;
        let record = extract_record(&object, self.config.variant);

        write_artifacts(lot_dir, &record).await?;
        self.publish(lot_dir, &record).await;
        Ok(Some(record))
    }

    async fn infer(
        &self,
        request: &MultimodalRequest,
        lot_dir: &Path,
    ) -> Result<String, EstimateError> {
        let policy = &self.config.retry;
        let attempts = policy.limit.max(1);
        let mut last = String::new();

        for attempt in 1..=attempts {
            self.limiter.acquire_slot().await;
            let outcome = self.service.complete(request).await.and_then(|raw| {
                if raw.to_lowercase().contains(VISION_REFUSAL) {
                    Err(LlmError::InvalidResponse(
                        "model replied without vision".into(),
                    ))
                } else {
                    Ok(raw)
                }
            });

            let err = match outcome {
                Ok(raw) => return Ok(raw),
                Err(err) => err,
            };
            let transient = err.is_transient();
            metrics::inference_attempt(attempt, transient);
            let wait = policy.wait_after(attempt, &err);
            warn!(
                target = "scout.estimate",
                dir = %lot_dir.display(),
                attempt,
                transient,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "inference_attempt_failed"
            );
            last = err.to_string();
            if attempt < attempts {
                sleep(wait).await;
            }
        }

        Err(EstimateError::MaxRetries { attempts, last })
    }

    // Local artifacts are the source of truth; the store is best effort.
    async fn publish(&self, lot_dir: &Path, record: &EstimateRecord) {
        let Some(store) = &self.store else {
            debug!(target = "scout.estimate", dir = %lot_dir.display(), "store_not_configured");
            return;
        };
        let Some(lot) = lot_dir
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(LotId::from_folder)
        else {
            warn!(target = "scout.estimate", dir = %lot_dir.display(), "store_update_skipped_no_lot_id");
            return;
        };
        match store.update_estimate(&lot, record).await {
            Ok(rows) => info!(target = "scout.store", lot_id = %lot, rows, "estimate_stored"),
            Err(err) => {
                warn!(target = "scout.store", lot_id = %lot, error = %err, "estimate_store_failed")
            }
        }
    }
}

/// Writes the detail and outlook files, then the terminal marker.
pub async fn write_artifacts(lot_dir: &Path, record: &EstimateRecord) -> io::Result<()> {
    tokio::fs::write(lot_dir.join(REPAIR_DETAILS_FILE), &record.repair_detail).await?;
    let (file, body) = match &record.outlook {
        ResaleOutlook::Range {
            average, details, ..
        } => (RESALE_FILE, format!("{average:.2}\n{details}")),
        ResaleOutlook::Evaluation { score, details } => {
            (EVALUATION_FILE, format!("{score:.2}\n{details}"))
        }
    };
    tokio::fs::write(lot_dir.join(file), body).await?;

    // Rename keeps a half-written marker from ever looking complete.
    let staged: PathBuf = lot_dir.join(format!(".{TERMINAL_MARKER}.tmp"));
    tokio::fs::write(&staged, format!("{:.2}", record.repair_cost)).await?;
    tokio::fs::rename(&staged, lot_dir.join(TERMINAL_MARKER)).await
}

/// Reads a completed lot's artifacts back. `None` when the marker is absent.
///
/// Only the resale average is kept on disk, so low and high come back equal to it.
pub async fn read_artifacts(lot_dir: &Path) -> io::Result<Option<EstimateRecord>> {
    let marker = match tokio::fs::read_to_string(lot_dir.join(TERMINAL_MARKER)).await {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let repair_cost = leading_number(&marker);
    let repair_detail = read_optional(&lot_dir.join(REPAIR_DETAILS_FILE))
        .await?
        .unwrap_or_default();

    let outlook = if let Some(text) = read_optional(&lot_dir.join(EVALUATION_FILE)).await? {
        let (score, details) = split_artifact(&text);
        ResaleOutlook::Evaluation { score, details }
    } else {
        let text = read_optional(&lot_dir.join(RESALE_FILE))
            .await?
            .unwrap_or_default();
        let (average, details) = split_artifact(&text);
        ResaleOutlook::Range {
            low: average,
            high: average,
            average,
            details,
        }
    };

    Ok(Some(EstimateRecord {
        repair_cost,
        repair_detail: repair_detail.trim().to_string(),
        outlook,
    }))
}

async fn read_optional(path: &Path) -> io::Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

fn leading_number(text: &str) -> f64 {
    text.trim().parse::<f64>().ok().filter(|n| n.is_finite()).unwrap_or(0.0)
}

// "<number>\n<details>"
fn split_artifact(text: &str) -> (f64, String) {
    let (head, tail) = text.split_once('\n').unwrap_or((text, ""));
    (leading_number(head), tail.trim().to_string())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub const RESALE_REPLY: &str = "```json\n{\"repair\": {\"estimate\": 2400, \"details\": \"Replace front bumper\"}, \"resale\": {\"low\": 9000, \"high\": 11000, \"average\": 10000, \"details\": \"Clean title\"}}\n```";

    pub fn instant_retry() -> RetryPolicy {
        RetryPolicy {
            limit: 3,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(4),
            jitter: Duration::ZERO,
            pause: Duration::from_millis(1),
        }
    }

    pub fn estimator(
        service: Arc<dyn InferenceService>,
        store: Option<Arc<dyn LotStore>>,
        variant: EstimateVariant,
    ) -> Estimator {
        Estimator::new(
            service,
            Arc::new(RateLimiter::new(Duration::ZERO)),
            store,
            Readiness::default(),
            EstimatorConfig {
                variant,
                max_images: 5,
                retry: instant_retry(),
            },
        )
    }

    /// A lot directory holding `count` small PNG photos.
    pub fn photo_lot(root: &Path, name: &str, count: usize) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        for idx in 0..count {
            std::fs::write(
                dir.join(format!("{idx:02}.png")),
                crate::archive::testing::png_bytes(idx as u8),
            )
            .unwrap();
        }
        dir
    }
}

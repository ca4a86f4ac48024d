use crate::acquire::Acquirer;
use crate::config::PipelineConfig;
use crate::estimate::{self, Estimator};
use crate::limiter::RateLimiter;
use crate::metrics;
use crate::models::{LotHints, LotId, LotOutcome, RunReport, Stage, StoreRow};
use crate::readiness;
use crate::supabase::{LotStore, StoreError};
use std::{
    future::Future,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
    #[error("store query failed: {0}")]
    Store(#[from] StoreError),
    #[error("cannot list lot directories: {0}")]
    Io(#[from] io::Error),
}

/// Bounds lots in flight and spaces out when each one starts.
pub struct Admission {
    in_flight: Arc<Semaphore>,
    pacer: RateLimiter,
}

impl Admission {
    pub fn new(pool_size: usize, stagger: Duration) -> Self {
        Self {
            in_flight: Arc::new(Semaphore::new(pool_size.max(1))),
            pacer: RateLimiter::new(stagger),
        }
    }

    /// Waits for a free worker, then for the next submission slot.
    pub async fn admit(&self) -> Option<OwnedSemaphorePermit> {
        let permit = self.in_flight.clone().acquire_owned().await.ok()?;
        self.pacer.acquire_slot().await;
        Some(permit)
    }
}

/// Runs `work` over `items` under `admission`, tallying outcomes as tasks
/// finish. A task that panics counts as a failed lot.
pub async fn fan_out<T, F, Fut>(
    stage: Stage,
    admission: Admission,
    items: Vec<T>,
    work: F,
) -> RunReport
where
    T: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = LotOutcome> + Send + 'static,
{
    let started = Instant::now();
    let mut report = RunReport::new(stage);
    info!(target = "scout.pipeline", run_id = %report.run_id, stage = stage.as_str(), lots = items.len(), "run_started");

    let mut tasks = JoinSet::new();
    for item in items {
        let Some(permit) = admission.admit().await else {
            warn!(target = "scout.pipeline", run_id = %report.run_id, "admission_closed");
            break;
        };
        let job = work(item);
        tasks.spawn(async move {
            let _permit = permit;
            job.await
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => report.record(outcome),
            Err(err) => {
                warn!(target = "scout.pipeline", run_id = %report.run_id, error = %err, "lot_task_aborted");
                report.record(LotOutcome::Failed);
            }
        }
    }

    report.elapsed_ms = started.elapsed().as_millis();
    metrics::stage_elapsed(stage.as_str(), report.elapsed_ms);
    info!(
        target = "scout.pipeline",
        run_id = %report.run_id,
        stage = stage.as_str(),
        total = report.total,
        done = report.done,
        skipped = report.skipped,
        failed = report.failed,
        elapsed_ms = report.elapsed_ms as u64,
        "run_finished"
    );
    report
}

/// Pipeline Coordinator. Workers are optional so each command only needs
/// the pieces it uses.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    acquirer: Option<Arc<Acquirer>>,
    estimator: Option<Arc<Estimator>>,
    store: Option<Arc<dyn LotStore>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config: Arc::new(config),
            acquirer: None,
            estimator: None,
            store: None,
        }
    }

    pub fn with_acquirer(mut self, acquirer: Arc<Acquirer>) -> Self {
        self.acquirer = Some(acquirer);
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<Estimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn LotStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn acquirer(&self) -> Result<Arc<Acquirer>, PipelineError> {
        self.acquirer
            .clone()
            .ok_or(PipelineError::NotConfigured("browser"))
    }

    fn estimator(&self) -> Result<Arc<Estimator>, PipelineError> {
        self.estimator
            .clone()
            .ok_or(PipelineError::NotConfigured("inference service"))
    }

    fn store(&self) -> Result<Arc<dyn LotStore>, PipelineError> {
        self.store.clone().ok_or(PipelineError::NotConfigured("store"))
    }

    fn admission(&self, pool_size: usize) -> Admission {
        Admission::new(pool_size, self.config.submit_stagger)
    }

    /// Downloads photos for every store row still lacking an estimate.
    pub async fn run_acquisition(&self, limit: Option<usize>) -> Result<RunReport, PipelineError> {
        let acquirer = self.acquirer()?;
        let rows = self.store()?.fetch_pending(limit).await?;
        let admission = self.admission(self.config.acquire_concurrency);
        Ok(fan_out(Stage::Acquire, admission, rows, move |row: StoreRow| {
            let acquirer = acquirer.clone();
            row_started(Stage::Acquire, &row);
            async move { acquirer.acquire(&row.lot_url, &row.hints()).await }
        })
        .await)
    }

    /// Estimates every lot directory under the download root.
    pub async fn run_analysis(&self) -> Result<RunReport, PipelineError> {
        let estimator = self.estimator()?;
        let dirs = self.lot_directories()?;
        let admission = self.admission(self.config.analyze_concurrency);
        Ok(fan_out(Stage::Analyze, admission, dirs, move |dir: PathBuf| {
            let estimator = estimator.clone();
            async move { estimator.analyze(&dir, &LotHints::default()).await }
        })
        .await)
    }

    /// Acquire then estimate each pending row, with the row's hints in the prompt.
    pub async fn run_full(&self, limit: Option<usize>) -> Result<RunReport, PipelineError> {
        let acquirer = self.acquirer()?;
        let estimator = self.estimator()?;
        let rows = self.store()?.fetch_pending(limit).await?;
        let admission = self.admission(self.config.acquire_concurrency);
        Ok(fan_out(Stage::Full, admission, rows, move |row: StoreRow| {
            let acquirer = acquirer.clone();
            let estimator = estimator.clone();
            row_started(Stage::Full, &row);
            async move { process_lot(&acquirer, &estimator, &row.lot_url, &row.hints()).await }
        })
        .await)
    }

    /// One lot, end to end, outside any pool.
    pub async fn run_single(&self, url: &str, hints: &LotHints) -> Result<RunReport, PipelineError> {
        let acquirer = self.acquirer()?;
        let estimator = self.estimator()?;
        let url = url.to_string();
        let hints = hints.clone();
        Ok(fan_out(Stage::Full, Admission::new(1, Duration::ZERO), vec![()], move |_| {
            let acquirer = acquirer.clone();
            let estimator = estimator.clone();
            let url = url.clone();
            let hints = hints.clone();
            async move { process_lot(&acquirer, &estimator, &url, &hints).await }
        })
        .await)
    }

    /// Pushes locally completed estimates to the store again. Used after a
    /// run where the store was unreachable.
    pub async fn sync_local_results(&self) -> Result<RunReport, PipelineError> {
        let store = self.store()?;
        let dirs = self.lot_directories()?;
        let admission = Admission::new(self.config.analyze_concurrency, Duration::ZERO);
        Ok(fan_out(Stage::Sync, admission, dirs, move |dir: PathBuf| {
            let store = store.clone();
            async move { sync_lot(store.as_ref(), &dir).await }
        })
        .await)
    }

    fn lot_directories(&self) -> Result<Vec<PathBuf>, PipelineError> {
        let root = &self.config.download_dir;
        match readiness::lot_directories(root) {
            Ok(dirs) => Ok(dirs
                .into_iter()
                .filter(|dir| !is_hidden(dir))
                .collect()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(target = "scout.pipeline", root = %root.display(), "download_root_missing");
                Ok(Vec::new())
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn is_hidden(dir: &Path) -> bool {
    dir.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

fn row_started(stage: Stage, row: &StoreRow) {
    debug!(
        target = "scout.pipeline",
        stage = stage.as_str(),
        lot_inv_num = row.lot_inv_num.as_deref().unwrap_or("-"),
        url = %row.lot_url,
        "row_started"
    );
}

async fn process_lot(
    acquirer: &Acquirer,
    estimator: &Estimator,
    url: &str,
    hints: &LotHints,
) -> LotOutcome {
    let acquired = acquirer.acquire(url, hints).await;
    if acquired == LotOutcome::Failed {
        return LotOutcome::Failed;
    }
    // acquire() already rejected unparseable URLs.
    let Ok(id) = LotId::from_url(url) else {
        return LotOutcome::Failed;
    };
    let analyzed = estimator.analyze(&acquirer.lot_dir(&id, hints), hints).await;
    match (acquired, analyzed) {
        (_, LotOutcome::Failed) => LotOutcome::Failed,
        (LotOutcome::Skipped, LotOutcome::Skipped) => LotOutcome::Skipped,
        _ => LotOutcome::Done,
    }
}

async fn sync_lot(store: &dyn LotStore, dir: &Path) -> LotOutcome {
    let record = match estimate::read_artifacts(dir).await {
        Ok(Some(record)) => record,
        Ok(None) => return LotOutcome::Skipped,
        Err(err) => {
            warn!(target = "scout.store", dir = %dir.display(), error = %err, "local_result_unreadable");
            return LotOutcome::Failed;
        }
    };
    let Some(id) = dir
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(LotId::from_folder)
    else {
        warn!(target = "scout.store", dir = %dir.display(), "sync_skipped_no_lot_id");
        return LotOutcome::Failed;
    };
    match store.update_estimate(&id, &record).await {
        Ok(0) => {
            warn!(target = "scout.store", lot_id = %id, "sync_matched_no_rows");
            LotOutcome::Failed
        }
        Ok(rows) => {
            info!(target = "scout.store", lot_id = %id, rows, "estimate_synced");
            LotOutcome::Done
        }
        Err(err) => {
            warn!(target = "scout.store", lot_id = %id, error = %err, "estimate_sync_failed");
            LotOutcome::Failed
        }
    }
}

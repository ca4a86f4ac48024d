mod acquire;
mod archive;
mod browser;
mod config;
mod estimate;
mod http;
mod limiter;
mod llm;
mod metrics;
mod models;
mod pipeline;
mod readiness;
mod supabase;

use crate::acquire::Acquirer;
use crate::browser::{LocatorChains, WebDriverLauncher};
use crate::config::PipelineConfig;
use crate::estimate::Estimator;
use crate::limiter::RateLimiter;
use crate::llm::{LlmClient, LlmConfig};
use crate::models::{EstimateVariant, LotHints, RunReport};
use crate::pipeline::Pipeline;
use crate::supabase::{LotStore, SupabaseClient};
use clap::{Parser, Subcommand};
use eyre::{WrapErr, eyre};
use std::{path::PathBuf, sync::Arc};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(author, version, about = "Salvage lot photo downloader and repair/resale estimator", long_about = None)]
struct Cli {
    /// Root directory holding one folder per lot (overrides DOWNLOAD_DIR)
    #[arg(long, global = true)]
    download_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download photo archives for store rows without an estimate
    Download {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Estimate every lot folder under the download root
    Analyze {
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long, value_enum)]
        variant: Option<EstimateVariant>,
    },
    /// Download then estimate each pending store row
    Run {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long, value_enum)]
        variant: Option<EstimateVariant>,
    },
    /// Process a single listing URL end to end
    Lot {
        url: String,
        #[arg(long)]
        year: Option<String>,
        #[arg(long)]
        make: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        mileage: Option<String>,
        #[arg(long, value_enum)]
        variant: Option<EstimateVariant>,
    },
    /// Push locally completed estimates to the store
    Sync,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let report = run(cli).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run(cli: Cli) -> eyre::Result<RunReport> {
    let mut config = PipelineConfig::from_env().wrap_err("reading configuration")?;
    if let Some(dir) = cli.download_dir {
        config.download_dir = dir;
    }
    let store = build_store();

    let report = match cli.command {
        Command::Download { limit, concurrency } => {
            if let Some(n) = concurrency {
                config.acquire_concurrency = n.max(1);
            }
            let pipeline = Pipeline::new(config.clone())
                .with_acquirer(build_acquirer(&config)?)
                .with_store(require_store(store)?);
            pipeline.run_acquisition(limit).await?
        }
        Command::Analyze {
            concurrency,
            variant,
        } => {
            if let Some(n) = concurrency {
                config.analyze_concurrency = n.max(1);
            }
            if let Some(variant) = variant {
                config.variant = variant;
            }
            let pipeline =
                Pipeline::new(config.clone()).with_estimator(build_estimator(&config, store)?);
            pipeline.run_analysis().await?
        }
        Command::Run {
            limit,
            concurrency,
            variant,
        } => {
            if let Some(n) = concurrency {
                config.acquire_concurrency = n.max(1);
            }
            if let Some(variant) = variant {
                config.variant = variant;
            }
            let store = require_store(store)?;
            let pipeline = Pipeline::new(config.clone())
                .with_acquirer(build_acquirer(&config)?)
                .with_estimator(build_estimator(&config, Some(store.clone()))?)
                .with_store(store);
            pipeline.run_full(limit).await?
        }
        Command::Lot {
            url,
            year,
            make,
            model,
            mileage,
            variant,
        } => {
            if let Some(variant) = variant {
                config.variant = variant;
            }
            let hints = LotHints {
                year,
                make,
                model,
                mileage,
            };
            let pipeline = Pipeline::new(config.clone())
                .with_acquirer(build_acquirer(&config)?)
                .with_estimator(build_estimator(&config, store)?);
            pipeline.run_single(&url, &hints).await?
        }
        Command::Sync => {
            let pipeline = Pipeline::new(config.clone()).with_store(require_store(store)?);
            pipeline.sync_local_results().await?
        }
    };

    info!(target = "scout.pipeline", run_id = %report.run_id, stage = report.stage.as_str(), "report_ready");
    Ok(report)
}

fn build_store() -> Option<Arc<dyn LotStore>> {
    SupabaseClient::from_env().map(|client| Arc::new(client) as Arc<dyn LotStore>)
}

fn require_store(store: Option<Arc<dyn LotStore>>) -> eyre::Result<Arc<dyn LotStore>> {
    store.ok_or_else(|| eyre!("SUPABASE_URL and SUPABASE_SERVICE_ROLE_KEY must be set"))
}

fn build_acquirer(config: &PipelineConfig) -> eyre::Result<Arc<Acquirer>> {
    let chains = LocatorChains::load(config.locator_chains_path.as_deref())
        .wrap_err("loading locator chains")?;
    let launcher = Arc::new(WebDriverLauncher::new(config.webdriver.clone()));
    Ok(Arc::new(Acquirer::new(
        launcher,
        Arc::new(chains),
        config.readiness(),
        config.acquire_config(),
    )))
}

fn build_estimator(
    config: &PipelineConfig,
    store: Option<Arc<dyn LotStore>>,
) -> eyre::Result<Arc<Estimator>> {
    let llm = LlmConfig::from_env();
    if llm.api_key.is_none() {
        return Err(eyre!("LLM_API_KEY or OPENAI_API_KEY must be set for estimation"));
    }
    let limiter = Arc::new(RateLimiter::new(config.min_interval));
    Ok(Arc::new(Estimator::new(
        Arc::new(LlmClient::new(llm)),
        limiter,
        store,
        config.readiness(),
        config.estimator_config(),
    )))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn analyze_accepts_variant() {
        let cli = Cli::try_parse_from(["salvage-scout", "analyze", "--variant", "flip"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Analyze {
                variant: Some(EstimateVariant::Flip),
                ..
            }
        ));
    }

    #[test]
    fn lot_takes_url_and_hints() {
        let cli = Cli::try_parse_from([
            "salvage-scout",
            "--download-dir",
            "/tmp/lots",
            "lot",
            "https://www.copart.com/lot/12345/x",
            "--year",
            "2019",
        ])
        .unwrap();
        assert_eq!(cli.download_dir, Some(PathBuf::from("/tmp/lots")));
        match cli.command {
            Command::Lot { url, year, make, .. } => {
                assert_eq!(url, "https://www.copart.com/lot/12345/x");
                assert_eq!(year.as_deref(), Some("2019"));
                assert_eq!(make, None);
            }
            _ => panic!("expected lot command"),
        }
    }
}

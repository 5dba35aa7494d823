// Worker harness for the creative-metadata scraping fleet.
//
// Claims batches from the Postgres queue, drives headless Chromium
// sessions against the transparency surface, and writes classified
// outcomes back. Credentials come from the environment (DATABASE_URL,
// PROXY_API_URL, PROXY_API_TOKEN); everything else is flags.

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use adscrape::cache::{CacheOptions, ScriptCache};
use adscrape::config::{CacheStrategy, ScrapeConfig, ScrapeConfigBuilder};
use adscrape::proxy::ProxyManager;
use adscrape::queue::QueueStore;
use adscrape::worker::WorkerPool;

const EXIT_RUNTIME: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "adscrape", version, about = "Queue-driven ad-transparency creative scraper")]
struct Cli {
    /// Number of concurrent workers (each owns one browser at a time)
    #[arg(long, default_value_t = adscrape::utils::constants::DEFAULT_WORKERS)]
    max_concurrent: usize,

    /// Rows claimed per batch
    #[arg(long, default_value_t = adscrape::utils::constants::DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Total processing cap for this run (default: drain the queue)
    #[arg(long)]
    max_urls: Option<u64>,

    /// Run without any upstream proxy
    #[arg(long)]
    no_proxy: bool,

    /// Route only authenticated traffic through the proxy; fetch CDN
    /// scripts directly
    #[arg(long)]
    partial_proxy: bool,

    /// Re-acquire proxy credentials before every batch
    #[arg(long)]
    enable_rotation: bool,

    /// Debug-level logging
    #[arg(long)]
    verbose: bool,

    /// Script cache directory (default: system temp)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Dump captured payloads here for postmortems (raw bodies are
    /// never persisted otherwise)
    #[arg(long)]
    debug_dump_dir: Option<PathBuf>,

    /// Cache validation strategy
    #[arg(long, value_enum, default_value = "age-and-version")]
    cache_strategy: CacheStrategy,

    /// Release rows stuck in processing after this many minutes
    /// (0 disables the sweeper)
    #[arg(long, default_value_t = 30)]
    sweep_minutes: u64,

    /// Transparency surface origin
    #[arg(long, env = "SURFACE_ORIGIN", default_value = adscrape::utils::constants::DEFAULT_SURFACE_ORIGIN)]
    surface_origin: String,
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    // The tracing-log bridge forwards the `log` records the worker and
    // queue modules emit; one subscriber covers both facades.
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_config(cli: &Cli) -> Result<ScrapeConfig> {
    let mut builder = ScrapeConfigBuilder::new()
        .surface_origin(cli.surface_origin.clone())
        .workers(cli.max_concurrent)
        .batch_size(cli.batch_size)
        .max_urls(cli.max_urls)
        .proxy_enabled(!cli.no_proxy)
        .partial_proxy(cli.partial_proxy)
        .proxy_rotation(cli.enable_rotation)
        .cache_strategy(cli.cache_strategy)
        .debug_dump_dir(cli.debug_dump_dir.clone());
    if let Some(dir) = &cli.cache_dir {
        builder = builder.cache_dir(dir.clone());
    }
    builder.build()
}

/// Environment pieces validated before anything connects.
struct Credentials {
    database_url: String,
    proxy: Option<(String, String)>,
}

fn read_credentials(config: &ScrapeConfig) -> Result<Credentials> {
    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let proxy = if config.proxy_enabled() {
        let api_url = std::env::var("PROXY_API_URL")
            .context("PROXY_API_URL must be set (or pass --no-proxy)")?;
        let token = std::env::var("PROXY_API_TOKEN")
            .context("PROXY_API_TOKEN must be set (or pass --no-proxy)")?;
        Some((api_url, token))
    } else {
        None
    };
    Ok(Credentials {
        database_url,
        proxy,
    })
}

async fn run(cli: Cli, config: ScrapeConfig, credentials: Credentials) -> Result<bool> {
    let store = QueueStore::connect(&credentials.database_url).await?;
    let cache = ScriptCache::open(CacheOptions::from_config(&config))?;

    let proxy_manager = match credentials.proxy {
        Some((api_url, token)) => Some(Arc::new(ProxyManager::new(
            api_url,
            token,
            config.proxy_max_attempts(),
        )?)),
        None => None,
    };

    if cli.sweep_minutes > 0 {
        let sweeper_store = store.clone();
        let threshold = Duration::from_secs(cli.sweep_minutes * 60);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(threshold);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                if let Err(e) = sweeper_store.release_stuck(threshold).await {
                    warn!("sweeper pass failed: {e:#}");
                }
            }
        });
    }

    let pool = WorkerPool::new(config, store.clone(), cache, proxy_manager);
    let summary = pool.run().await;
    summary.log();

    match store.status_counts().await {
        Ok(counts) => {
            for (status, count) in counts {
                info!("queue: {count} rows {status}");
            }
        }
        Err(e) => warn!("could not read final queue counts: {e:#}"),
    }

    Ok(summary.worker_errors.is_empty())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Configuration and credential validation fail with exit code 2;
    // anything after this point is a runtime failure (1).
    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let credentials = match read_credentials(&config) {
        Ok(credentials) => credentials,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match run(cli, config, credentials).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(EXIT_RUNTIME),
        Err(e) => {
            eprintln!("runtime error: {e:#}");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

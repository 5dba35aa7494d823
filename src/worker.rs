//! Worker fleet: claim, scrape, write, repeat
//!
//! W long-running tasks share one queue store, one cache, and one proxy
//! manager. Each loop iteration claims a batch under the limit
//! discipline, runs a scraping session, then writes every result in its
//! own short transaction: a failed write on item k never blocks items
//! k+1 onward, and a short result list is paid out as explicit
//! missing-result requeues rather than silently dropped rows.

use anyhow::{Context, Result};
use log::{error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::cache::ScriptCache;
use crate::config::ScrapeConfig;
use crate::intercept::RouteStatsSnapshot;
use crate::proxy::{ProxyConfig, ProxyManager};
use crate::queue::{QueueStore, WriteDisposition};
use crate::session::{CreativeTask, ScrapingSession};
use crate::utils::constants::PROGRESS_LOG_EVERY;

/// Shared run counters; one mutex because the summary reads them
/// together.
#[derive(Debug, Clone, Default)]
pub struct RunCounters {
    pub processed: u64,
    pub completed: u64,
    pub retry: u64,
    pub bad_ad: u64,
    pub failed: u64,
    pub missing: u64,
    pub write_errors: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_bytes_saved: u64,
    pub blocked_requests: u64,
}

impl RunCounters {
    fn record(&mut self, disposition: WriteDisposition) {
        match disposition {
            WriteDisposition::Completed => self.completed += 1,
            WriteDisposition::Retry => self.retry += 1,
            WriteDisposition::BadAd => self.bad_ad += 1,
            WriteDisposition::Failed => self.failed += 1,
        }
    }

    fn absorb_cache(&mut self, stats: &RouteStatsSnapshot) {
        self.cache_hits += stats.cache_hits;
        self.cache_misses += stats.cache_misses;
        self.cache_bytes_saved += stats.bytes_saved;
        self.blocked_requests += stats.blocked_requests;
    }

    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.completed as f64 / self.processed as f64
        }
    }
}

/// Structured end-of-run summary.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub counters: RunCounters,
    pub worker_errors: Vec<String>,
}

impl RunSummary {
    /// Emit the shutdown summary in one block.
    pub fn log(&self) {
        let c = &self.counters;
        info!("run summary: {} processed, {:.1}% success", c.processed, c.success_rate() * 100.0);
        info!(
            "  outcomes: {} completed, {} retry, {} bad_ad, {} failed, {} missing, {} write errors",
            c.completed, c.retry, c.bad_ad, c.failed, c.missing, c.write_errors
        );
        info!(
            "  traffic: {} bytes in, {} bytes out, {} requests blocked",
            c.bytes_in, c.bytes_out, c.blocked_requests
        );
        info!(
            "  cache: {} hits, {} misses, {} bytes saved",
            c.cache_hits, c.cache_misses, c.cache_bytes_saved
        );
        for e in &self.worker_errors {
            error!("  worker error: {e}");
        }
    }
}

/// Claim-side accounting for `--max-urls`. Counting claims (not
/// completions) under one lock is what keeps W workers from
/// collectively over-claiming the cap.
struct LimitTracker {
    max: Option<u64>,
    claimed: u64,
}

impl LimitTracker {
    fn new(max: Option<u64>) -> Self {
        Self { max, claimed: 0 }
    }

    /// Grant up to `want` items; 0 means the cap is reached.
    fn reserve(&mut self, want: usize) -> usize {
        match self.max {
            None => want,
            Some(max) => {
                let remaining = max.saturating_sub(self.claimed) as usize;
                let grant = want.min(remaining);
                self.claimed += grant as u64;
                grant
            }
        }
    }

    /// Hand back reservations the claim didn't use (queue drained).
    fn release(&mut self, unused: usize) {
        self.claimed = self.claimed.saturating_sub(unused as u64);
    }
}

struct WorkerContext {
    config: ScrapeConfig,
    store: QueueStore,
    cache: ScriptCache,
    proxy_manager: Option<Arc<ProxyManager>>,
    counters: Mutex<RunCounters>,
    limit: Mutex<LimitTracker>,
    sessions: Semaphore,
}

/// The worker fleet for one run.
pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(
        config: ScrapeConfig,
        store: QueueStore,
        cache: ScriptCache,
        proxy_manager: Option<Arc<ProxyManager>>,
    ) -> Self {
        let limit = LimitTracker::new(config.max_urls());
        let sessions = Semaphore::new(config.workers());
        Self {
            ctx: Arc::new(WorkerContext {
                config,
                store,
                cache,
                proxy_manager,
                counters: Mutex::new(RunCounters::default()),
                limit: Mutex::new(limit),
                sessions,
            }),
        }
    }

    /// Run all workers to completion and produce the summary.
    pub async fn run(&self) -> RunSummary {
        let worker_count = self.ctx.config.workers();
        info!("starting {worker_count} workers (batch size {})", self.ctx.config.batch_size());

        let mut joins = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let ctx = Arc::clone(&self.ctx);
            joins.push(tokio::spawn(worker_loop(worker_id, ctx)));
        }

        let mut worker_errors = Vec::new();
        for (worker_id, join) in joins.into_iter().enumerate() {
            match join.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => worker_errors.push(format!("worker {worker_id}: {e:#}")),
                Err(e) => worker_errors.push(format!("worker {worker_id} panicked: {e}")),
            }
        }

        RunSummary {
            counters: self.ctx.counters.lock().clone(),
            worker_errors,
        }
    }
}

async fn worker_loop(worker_id: usize, ctx: Arc<WorkerContext>) -> Result<()> {
    let mut proxy: Option<ProxyConfig> = None;

    loop {
        // Acquisition is serialized inside the manager; rotation mode
        // re-acquires before every batch.
        if let Some(manager) = &ctx.proxy_manager
            && (proxy.is_none() || ctx.config.proxy_rotation())
        {
            proxy = Some(
                manager
                    .acquire()
                    .await
                    .context("proxy acquisition exhausted, worker exiting")?,
            );
        }

        let grant = ctx.limit.lock().reserve(ctx.config.batch_size());
        if grant == 0 {
            info!("worker {worker_id}: processing cap reached, exiting");
            return Ok(());
        }

        let batch = match ctx.store.claim_batch(grant as i64).await {
            Ok(batch) => batch,
            Err(e) => {
                ctx.limit.lock().release(grant);
                return Err(e).context("claim failed, worker exiting");
            }
        };
        ctx.limit.lock().release(grant - batch.len());
        if batch.is_empty() {
            info!("worker {worker_id}: queue drained, exiting");
            return Ok(());
        }
        info!("worker {worker_id}: claimed {} rows", batch.len());

        let tasks: Vec<CreativeTask> = batch
            .iter()
            .map(|entry| CreativeTask {
                id: entry.id,
                creative_id: entry.creative_id.clone(),
                advertiser_id: entry.advertiser_id.clone(),
            })
            .collect();

        let report = {
            let _session_permit = ctx
                .sessions
                .acquire()
                .await
                .context("session semaphore closed")?;
            let session = ScrapingSession::new(
                ctx.config.clone(),
                ctx.cache.clone(),
                proxy.clone(),
            );
            session.run_batch(&tasks).await
        };

        if report.results.len() != batch.len() {
            error!(
                "worker {worker_id}: session returned {} results for {} rows",
                report.results.len(),
                batch.len()
            );
        }

        // Every result write stands alone; the loop never short-circuits.
        for (entry, result) in batch.iter().zip(report.results.iter()) {
            match ctx.store.write_result(entry.id, result).await {
                Ok(disposition) => ctx.counters.lock().record(disposition),
                Err(e) => {
                    warn!(
                        "worker {worker_id}: result write failed for row {}: {e:#}",
                        entry.id
                    );
                    ctx.counters.lock().write_errors += 1;
                }
            }
        }

        // Rows beyond the result list (session contract violation) are
        // requeued explicitly instead of being stranded in processing.
        for entry in batch.iter().skip(report.results.len()) {
            if let Err(e) = ctx
                .store
                .mark_pending(entry.id, "missing result from scraping session - pending retry")
                .await
            {
                warn!(
                    "worker {worker_id}: missing-result requeue failed for row {}: {e:#}",
                    entry.id
                );
                ctx.counters.lock().write_errors += 1;
            } else {
                ctx.counters.lock().missing += 1;
            }
        }

        let processed_total = {
            let mut counters = ctx.counters.lock();
            counters.processed += batch.len() as u64;
            counters.bytes_in += report.traffic.bytes_in;
            counters.bytes_out += report.traffic.bytes_out;
            counters.absorb_cache(&report.head_cache_stats);
            counters.absorb_cache(&report.tail_cache_stats);
            counters.processed
        };

        if processed_total / PROGRESS_LOG_EVERY
            != (processed_total - batch.len() as u64) / PROGRESS_LOG_EVERY
        {
            let counters = ctx.counters.lock().clone();
            info!(
                "progress: {} processed ({} completed, {} retry, {} bad_ad, {} failed), cache {} hits / {} bytes saved",
                counters.processed,
                counters.completed,
                counters.retry,
                counters.bad_ad,
                counters.failed,
                counters.cache_hits,
                counters.cache_bytes_saved
            );
        }
    }
}

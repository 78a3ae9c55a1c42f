use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::fetch::fetcher::PriceFetcher;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub running: bool,
    pub interval_secs: u64,
    pub refresh_threshold_secs: u64,
}

/// Keeps the cache warm without client involvement: every tick re-fetches
/// the entries whose remaining TTL has dropped below the refresh threshold.
/// With `interval < threshold < ttl_min`, entries are always inspected
/// inside their refresh window, so healthy upstreams mean no client ever
/// sees an expired entry.
pub struct RefreshScheduler {
    fetcher: Arc<PriceFetcher>,
    interval: Duration,
    refresh_threshold: Duration,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshScheduler {
    pub fn new(fetcher: Arc<PriceFetcher>, interval: Duration, refresh_threshold: Duration) -> Self {
        RefreshScheduler {
            fetcher,
            interval,
            refresh_threshold,
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Synchronous warm-up before the service is declared ready. Seed
    /// failures are logged, never fatal: the HTTP surface starts anyway.
    pub async fn seed(&self) {
        info!("seeding price cache");
        match self.fetcher.fetch_all().await {
            Ok(outcome) if outcome.errors.is_empty() => {
                info!(keys = outcome.successes.len(), "price cache seeded");
            }
            Ok(outcome) => {
                warn!(errors = ?outcome.errors, "price cache seeded with partial results");
            }
            Err(err) => {
                error!(error = %err, "price cache seed failed");
            }
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let fetcher = Arc::clone(&self.fetcher);
        let running = Arc::clone(&self.running);
        let period = self.interval;
        let threshold = self.refresh_threshold;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // An interval's first tick fires immediately; skip it so the
            // startup seed is not duplicated.
            ticker.tick().await;

            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                Self::run_tick(&fetcher, threshold).await;
            }
        });

        *self.handle.lock().unwrap() = Some(handle);
        info!(
            interval_secs = self.interval.as_secs(),
            refresh_threshold_secs = self.refresh_threshold.as_secs(),
            "refresh scheduler started"
        );
    }

    async fn run_tick(fetcher: &Arc<PriceFetcher>, threshold: Duration) {
        let entries = fetcher.cache().entries();
        if entries.is_empty() {
            debug!("cache empty on tick; seeding");
            if let Err(err) = fetcher.fetch_all().await {
                warn!(error = %err, "seed from scheduler tick failed");
            }
            return;
        }

        let due: Vec<String> = entries
            .into_iter()
            .filter(|(key, _)| fetcher.cache().remaining_ttl(key) < threshold)
            .map(|(key, _)| key)
            .collect();
        if due.is_empty() {
            return;
        }

        debug!(keys = ?due, "refreshing near-expiry entries");
        let mut refreshes = Vec::new();
        for key in due {
            let fetcher = Arc::clone(fetcher);
            refreshes.push(tokio::spawn(async move {
                let report = fetcher.fetch_and_cache(&key).await;
                if let Some(err) = report.error {
                    // Refresh failures never fail the tick; the stale entry
                    // stays in place for the fallback path.
                    warn!(key = %key, error = %err, "scheduled refresh failed");
                }
            }));
        }
        for refresh in refreshes {
            let _ = refresh.await;
        }
    }

    /// Idempotent: the first call cancels the ticker, later calls are
    /// no-ops. In-flight per-key refreshes run to completion.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
        info!("refresh scheduler stopped");
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.running.load(Ordering::SeqCst),
            interval_secs: self.interval.as_secs(),
            refresh_threshold_secs: self.refresh_threshold.as_secs(),
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod loader;

use crate::error::{Error, Result};
use crate::fetch::{MarketQuote, PriceValue, Upstream};

/// One cache key bound to an upstream product. The configured vector is a
/// closed set, fixed at startup; its order is the deterministic order of
/// the sequential fetch tail.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PriceSourceConfig {
    /// Cache key and wire identifier, e.g. `btc`, `MSTR`.
    pub key: String,
    /// Upstream symbol, e.g. `bitcoin`, `EUR/USD`, `MSTR`.
    pub symbol: String,
    pub upstream: Upstream,
    /// Served when a key has neither a fresh nor a stale value. Substitution
    /// is logged and the key still counts as an error.
    pub fallback: PriceValue,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub port: u16,

    // Cache tuning: TTLs are drawn uniformly from [ttl_min, ttl_max] on
    // every write so refreshes never synchronise.
    pub ttl_min_secs: u64,
    pub ttl_max_secs: u64,

    // Scheduler tuning. Entries are re-fetched once their remaining TTL
    // drops below the threshold; scheduler_interval < refresh_threshold
    // guarantees every entry is inspected in time.
    pub refresh_threshold_secs: u64,
    pub scheduler_interval_secs: u64,
    pub seed_on_startup: bool,

    // Quota enforcement, keyed by upstream id. Upstreams without an entry
    // are unmetered.
    pub rate_limit_window_secs: u64,
    pub quotas: HashMap<String, u32>,

    // Retry policy: attempt k sleeps base_delay * 2^k before attempt k+1.
    pub max_retries: u32,
    pub base_delay_secs: u64,

    /// Per-attempt outbound HTTP timeout.
    pub request_timeout_secs: u64,

    pub alpha_vantage_api_key: Option<String>,

    pub coingecko_url: String,
    pub frankfurter_url: String,
    pub alpha_vantage_url: String,

    pub sources: Vec<PriceSourceConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            port: 3001,
            ttl_min_secs: 300,
            ttl_max_secs: 600,
            refresh_threshold_secs: 60,
            scheduler_interval_secs: 30,
            seed_on_startup: true,
            rate_limit_window_secs: 60,
            quotas: HashMap::from([(Upstream::AlphaVantage.id().to_string(), 5)]),
            max_retries: 5,
            base_delay_secs: 16,
            request_timeout_secs: 5,
            alpha_vantage_api_key: None,
            coingecko_url: "https://api.coingecko.com".to_string(),
            frankfurter_url: "https://api.frankfurter.app".to_string(),
            alpha_vantage_url: "https://www.alphavantage.co".to_string(),
            sources: default_sources(),
        }
    }
}

fn default_sources() -> Vec<PriceSourceConfig> {
    let equity = |key: &str, fallback: f64| PriceSourceConfig {
        key: key.to_string(),
        symbol: key.to_string(),
        upstream: Upstream::AlphaVantage,
        fallback: PriceValue::Quote(MarketQuote::price_only(fallback)),
    };

    vec![
        PriceSourceConfig {
            key: "btc".to_string(),
            symbol: "bitcoin".to_string(),
            upstream: Upstream::CoinGecko,
            fallback: PriceValue::Spot(100_000.0),
        },
        PriceSourceConfig {
            key: "eurUsd".to_string(),
            symbol: "EUR/USD".to_string(),
            upstream: Upstream::Frankfurter,
            // Calibration placeholder, not a market estimate.
            fallback: PriceValue::Spot(1.0),
        },
        equity("MSTR", 400.0),
        equity("STRF", 100.0),
        equity("STRC", 100.0),
        equity("STRK", 100.0),
        equity("STRD", 100.0),
    ]
}

impl AppConfig {
    pub fn ttl_min(&self) -> Duration {
        Duration::from_secs(self.ttl_min_secs)
    }

    pub fn ttl_max(&self) -> Duration {
        Duration::from_secs(self.ttl_max_secs)
    }

    pub fn refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.refresh_threshold_secs)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn quota_for(&self, upstream: Upstream) -> Option<u32> {
        self.quotas.get(upstream.id()).copied()
    }

    /// Upstreams with a declared quota, in a stable order.
    pub fn declared_quotas(&self) -> Vec<(Upstream, u32)> {
        Upstream::ALL
            .into_iter()
            .filter_map(|upstream| self.quota_for(upstream).map(|limit| (upstream, limit)))
            .collect()
    }

    /// Startup validation. The refresh threshold may equal `ttl_min` (the
    /// degenerate refresh-every-tick mode); inverted orderings abort.
    pub fn validate(&self) -> Result<()> {
        if self.ttl_min_secs > self.ttl_max_secs {
            return Err(Error::Config(format!(
                "ttl_min_secs ({}) must not exceed ttl_max_secs ({})",
                self.ttl_min_secs, self.ttl_max_secs
            )));
        }
        if self.refresh_threshold_secs > self.ttl_min_secs {
            return Err(Error::Config(format!(
                "refresh_threshold_secs ({}) must not exceed ttl_min_secs ({}); entries would expire before refresh",
                self.refresh_threshold_secs, self.ttl_min_secs
            )));
        }
        if self.scheduler_interval_secs >= self.refresh_threshold_secs {
            return Err(Error::Config(format!(
                "scheduler_interval_secs ({}) must be below refresh_threshold_secs ({}); entries could slip past a tick",
                self.scheduler_interval_secs, self.refresh_threshold_secs
            )));
        }
        if self.max_retries == 0 {
            return Err(Error::Config("max_retries must be at least 1".to_string()));
        }
        if self.sources.is_empty() {
            return Err(Error::Config("no price sources configured".to_string()));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.key.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate price key: {}",
                    source.key
                )));
            }
        }

        Ok(())
    }
}

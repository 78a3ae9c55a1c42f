use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use reqwest::Client;
use tracing::{debug, warn};

use crate::cache::PriceCache;
use crate::config::{AppConfig, PriceSourceConfig};
use crate::error::{Error, Result};
use crate::fetch::retry::{with_backoff, BackoffPolicy};
use crate::fetch::sources::{build_registry, PriceSource};
use crate::fetch::{AggregateOutcome, FetchReport, PriceValue};
use crate::rate_limit::RateLimiter;

/// Materialises prices for the configured keys, honouring per-upstream
/// quotas and the retry policy, and writing through to the cache. Clients
/// never see an upstream failure while any cached value exists.
pub struct PriceFetcher {
    config: AppConfig,
    cache: Arc<PriceCache>,
    limiter: Arc<RateLimiter>,
    http: Client,
    registry: HashMap<String, Arc<dyn PriceSource>>,
    policy: BackoffPolicy,
}

impl PriceFetcher {
    pub fn new(
        config: AppConfig,
        cache: Arc<PriceCache>,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;
        let registry = build_registry(&config);
        let policy = BackoffPolicy {
            max_retries: config.max_retries,
            base_delay: config.base_delay(),
        };

        Ok(PriceFetcher {
            config,
            cache,
            limiter,
            http,
            registry,
            policy,
        })
    }

    pub fn cache(&self) -> &PriceCache {
        &self.cache
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Fetches one key from its upstream and writes through to the cache.
    /// On exhausted retries the stale cache entry, if any, is served in its
    /// place; the error is reported either way.
    pub async fn fetch_and_cache(&self, key: &str) -> FetchReport {
        match self.fetch_fresh(key).await {
            Ok(value) => {
                self.cache.set(key, value.clone());
                FetchReport {
                    value: Some(value),
                    stale: false,
                    error: None,
                }
            }
            Err(err) => match self.cache.get_raw(key) {
                Some(entry) => {
                    warn!(key, error = %err, "fetch failed; serving cached entry as stale");
                    FetchReport {
                        value: Some(entry.value),
                        stale: true,
                        error: Some(err),
                    }
                }
                None => FetchReport {
                    value: None,
                    stale: false,
                    error: Some(err),
                },
            },
        }
    }

    async fn fetch_fresh(&self, key: &str) -> Result<PriceValue> {
        let source = self
            .registry
            .get(key)
            .ok_or_else(|| Error::UnknownKey(key.to_string()))?;

        let upstream = source.upstream();
        if let Some(limit) = self.config.quota_for(upstream) {
            // Quota is charged here, at dispatch of the outer call: once,
            // not per attempt, and never refunded on failure.
            if !self.limiter.admit(upstream, limit) {
                return Err(Error::QuotaExceeded(upstream.id()));
            }
        }

        with_backoff(self.policy, || source.fetch(&self.http)).await
    }

    /// Aggregates every configured key. Warm cache short-circuits with no
    /// upstream traffic; otherwise the unmetered keys are fetched
    /// concurrently and the quota-bearing keys sequentially, pausing when
    /// the window is nearly consumed. Every key is present in the result,
    /// falling back to stale entries and then to declared fallbacks.
    pub async fn fetch_all(&self) -> Result<AggregateOutcome> {
        let keys: Vec<&str> = self.config.sources.iter().map(|s| s.key.as_str()).collect();
        if let Some(snapshot) = self.cache.snapshot_if_fresh(&keys) {
            debug!("serving aggregated prices from warm cache");
            return Ok(AggregateOutcome {
                data: snapshot.into_iter().collect(),
                ttls: self.ttl_snapshot(),
                errors: Vec::new(),
                successes: keys.into_iter().map(str::to_string).collect(),
                cached: true,
                partial: false,
                stale: false,
            });
        }

        let mut data = BTreeMap::new();
        let mut errors = Vec::new();
        let mut successes = Vec::new();
        let mut any_stale = false;

        // Parallel head: the unmetered keys.
        let head: Vec<&PriceSourceConfig> = self.unmetered_sources().collect();
        let reports = join_all(
            head.iter()
                .map(|source| self.fetch_and_cache(&source.key)),
        )
        .await;
        for (source, report) in head.into_iter().zip(reports) {
            absorb_report(source, report, &mut data, &mut errors, &mut successes, &mut any_stale);
        }

        // Sequential tail: quota-bearing keys in configured order.
        let tail = self.metered_sources();
        for (idx, &source) in tail.iter().enumerate() {
            if let Some(value) = self.cache.get(&source.key) {
                data.insert(source.key.clone(), value);
                successes.push(source.key.clone());
                continue;
            }

            let report = self.fetch_and_cache(&source.key).await;
            absorb_report(source, report, &mut data, &mut errors, &mut successes, &mut any_stale);

            // One admission (or none) left in the window with keys still to
            // go: let the window slide before the next call.
            if idx + 1 < tail.len() {
                if let Some(limit) = self.config.quota_for(source.upstream) {
                    let usage = self.limiter.usage(source.upstream, limit);
                    if usage.remaining <= 1 {
                        let pause = self.config.window() / 5;
                        debug!(
                            upstream = %source.upstream,
                            pause_secs = pause.as_secs(),
                            "quota nearly exhausted; pausing sequential fetches"
                        );
                        tokio::time::sleep(pause).await;
                    }
                }
            }
        }

        let partial = !errors.is_empty();
        Ok(AggregateOutcome {
            data,
            ttls: self.ttl_snapshot(),
            errors,
            successes,
            cached: false,
            partial,
            stale: any_stale,
        })
    }

    fn unmetered_sources(&self) -> impl Iterator<Item = &PriceSourceConfig> {
        self.config
            .sources
            .iter()
            .filter(|source| self.config.quota_for(source.upstream).is_none())
    }

    fn metered_sources(&self) -> Vec<&PriceSourceConfig> {
        self.config
            .sources
            .iter()
            .filter(|source| self.config.quota_for(source.upstream).is_some())
            .collect()
    }

    fn ttl_snapshot(&self) -> BTreeMap<String, u64> {
        self.config
            .sources
            .iter()
            .map(|source| {
                (
                    source.key.clone(),
                    self.cache.remaining_ttl(&source.key).as_secs(),
                )
            })
            .collect()
    }
}

fn absorb_report(
    source: &PriceSourceConfig,
    report: FetchReport,
    data: &mut BTreeMap<String, PriceValue>,
    errors: &mut Vec<String>,
    successes: &mut Vec<String>,
    any_stale: &mut bool,
) {
    match report {
        FetchReport {
            value: Some(value),
            error: None,
            ..
        } => {
            data.insert(source.key.clone(), value);
            successes.push(source.key.clone());
        }
        FetchReport {
            value: Some(value),
            error: Some(err),
            stale,
        } => {
            if stale {
                *any_stale = true;
            }
            data.insert(source.key.clone(), value);
            errors.push(format!("{}: {}", source.key, err));
        }
        FetchReport {
            value: None, error, ..
        } => {
            let detail = error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no value produced".to_string());
            warn!(key = %source.key, error = %detail, "substituting declared fallback value");
            data.insert(source.key.clone(), source.fallback.clone());
            errors.push(format!("{}: {}", source.key, detail));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::Upstream;
    use std::collections::HashMap as StdHashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(coingecko: &str, frankfurter: &str, alpha_vantage: &str) -> AppConfig {
        AppConfig {
            max_retries: 2,
            base_delay_secs: 0,
            rate_limit_window_secs: 2,
            alpha_vantage_api_key: Some("test-key".to_string()),
            coingecko_url: coingecko.to_string(),
            frankfurter_url: frankfurter.to_string(),
            alpha_vantage_url: alpha_vantage.to_string(),
            ..AppConfig::default()
        }
    }

    fn build_fetcher(config: AppConfig) -> Arc<PriceFetcher> {
        let cache = Arc::new(PriceCache::new(config.ttl_min(), config.ttl_max()));
        let limiter = Arc::new(RateLimiter::new(config.window()));
        Arc::new(PriceFetcher::new(config, cache, limiter).unwrap())
    }

    async fn mount_coingecko(server: &MockServer, price: f64) {
        Mock::given(method("GET"))
            .and(path("/api/v3/simple/price"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(format!(r#"{{"bitcoin": {{"usd": {price}}}}}"#)),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn unknown_key_fails_without_a_value() {
        let fetcher = build_fetcher(test_config("http://127.0.0.1:1", "http://127.0.0.1:1", "http://127.0.0.1:1"));

        let report = fetcher.fetch_and_cache("DOGE").await;
        assert!(report.value.is_none());
        assert!(matches!(report.error, Some(Error::UnknownKey(_))));
    }

    #[tokio::test]
    async fn success_writes_through_to_the_cache() {
        let server = MockServer::start().await;
        mount_coingecko(&server, 101000.0).await;
        let fetcher = build_fetcher(test_config(&server.uri(), "http://127.0.0.1:1", "http://127.0.0.1:1"));

        let report = fetcher.fetch_and_cache("btc").await;
        assert_eq!(report.value, Some(PriceValue::Spot(101000.0)));
        assert!(report.error.is_none());
        assert_eq!(fetcher.cache().get("btc"), Some(PriceValue::Spot(101000.0)));
    }

    #[tokio::test]
    async fn quota_denial_makes_no_upstream_call() {
        let server = MockServer::start().await;
        let mut config = test_config("http://127.0.0.1:1", "http://127.0.0.1:1", &server.uri());
        config.quotas = StdHashMap::from([(Upstream::AlphaVantage.id().to_string(), 0)]);
        let fetcher = build_fetcher(config);

        let report = fetcher.fetch_and_cache("MSTR").await;
        assert!(report.value.is_none());
        assert!(matches!(report.error, Some(Error::QuotaExceeded(_))));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_fall_back_to_the_stale_entry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/simple/price"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let config = test_config(&server.uri(), "http://127.0.0.1:1", "http://127.0.0.1:1");
        let cache = Arc::new(PriceCache::new(Duration::ZERO, Duration::ZERO));
        let limiter = Arc::new(RateLimiter::new(config.window()));
        cache.set("btc", PriceValue::Spot(95000.0));
        assert_eq!(cache.get("btc"), None, "seeded entry must already be stale");

        let fetcher = Arc::new(PriceFetcher::new(config, cache, limiter).unwrap());
        let report = fetcher.fetch_and_cache("btc").await;

        assert_eq!(report.value, Some(PriceValue::Spot(95000.0)));
        assert!(report.stale);
        assert!(report.error.is_some());
        // Both attempts reached the upstream before falling back.
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn warm_cache_fast_path_makes_no_upstream_calls() {
        let fetcher = build_fetcher(test_config("http://127.0.0.1:1", "http://127.0.0.1:1", "http://127.0.0.1:1"));
        let sources = fetcher.config().sources.clone();
        for source in &sources {
            fetcher.cache().set(&source.key, source.fallback.clone());
        }

        let outcome = fetcher.fetch_all().await.unwrap();
        assert!(outcome.cached);
        assert!(!outcome.partial);
        assert!(!outcome.stale);
        assert_eq!(outcome.data.len(), 7);
        assert_eq!(outcome.successes.len(), 7);
        assert!(outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn sequential_tail_adopts_fresh_cache_entries() {
        let server = MockServer::start().await;
        mount_coingecko(&server, 101000.0).await;
        Mock::given(method("GET"))
            .and(path("/latest"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"rates": {"USD": 1.05}}"#),
            )
            .mount(&server)
            .await;

        let fetcher = build_fetcher(test_config(&server.uri(), &server.uri(), &server.uri()));
        for key in ["MSTR", "STRF", "STRC", "STRK", "STRD"] {
            fetcher
                .cache()
                .set(key, PriceValue::Quote(crate::fetch::MarketQuote::price_only(50.0)));
        }

        let outcome = fetcher.fetch_all().await.unwrap();
        assert!(!outcome.cached, "head keys were cold");
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.successes.len(), 7);
        // Only the two unmetered head keys hit the network.
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }
}

pub mod alpha_vantage;
pub mod coingecko;
pub mod frankfurter;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;

use crate::config::AppConfig;
use crate::error::Result;
use crate::fetch::{PriceValue, Upstream};

use alpha_vantage::AlphaVantageSource;
use coingecko::CoinGeckoSource;
use frankfurter::FrankfurterSource;

/// One upstream product bound to a cache key. Implementations are pure
/// configuration: URL template, parser, upstream identity.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// One upstream HTTP request; transport failures, non-2xx statuses and
    /// malformed payloads all raise so the retry layer can classify them.
    async fn fetch(&self, http: &Client) -> Result<PriceValue>;

    fn upstream(&self) -> Upstream;
}

/// Builds the key -> adapter registry from the configured source set.
pub fn build_registry(config: &AppConfig) -> HashMap<String, Arc<dyn PriceSource>> {
    let mut registry: HashMap<String, Arc<dyn PriceSource>> = HashMap::new();
    for source in &config.sources {
        let adapter: Arc<dyn PriceSource> = match source.upstream {
            Upstream::CoinGecko => {
                Arc::new(CoinGeckoSource::new(&config.coingecko_url, &source.symbol))
            }
            Upstream::Frankfurter => {
                Arc::new(FrankfurterSource::new(&config.frankfurter_url, &source.symbol))
            }
            Upstream::AlphaVantage => Arc::new(AlphaVantageSource::new(
                &config.alpha_vantage_url,
                &source.symbol,
                config.alpha_vantage_api_key.clone(),
            )),
        };
        registry.insert(source.key.clone(), adapter);
    }
    registry
}

pub mod fetcher;
pub mod retry;
pub mod sources;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The three upstream feeds. Exactly one adapter kind per upstream; the
/// quota (if any) is declared against this identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Upstream {
    CoinGecko,
    Frankfurter,
    AlphaVantage,
}

impl Upstream {
    pub const ALL: [Upstream; 3] = [
        Upstream::CoinGecko,
        Upstream::Frankfurter,
        Upstream::AlphaVantage,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Upstream::CoinGecko => "coingecko",
            Upstream::Frankfurter => "frankfurter",
            Upstream::AlphaVantage => "alpha_vantage",
        }
    }
}

impl std::fmt::Display for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// A price as served to clients. A scalar is not a record: the crypto and
/// FX keys serialise as bare numbers, market-data keys as quote objects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PriceValue {
    Spot(f64),
    Quote(MarketQuote),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarketQuote {
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

impl MarketQuote {
    pub fn price_only(price: f64) -> Self {
        MarketQuote {
            price,
            high: None,
            low: None,
            volume: None,
        }
    }
}

/// Outcome of a single-key fetch after retries and cache fallback.
///
/// `value` may be present together with `error`: that is the stale-cache
/// path, flagged by `stale`.
#[derive(Debug)]
pub struct FetchReport {
    pub value: Option<PriceValue>,
    pub stale: bool,
    pub error: Option<Error>,
}

/// Outcome of a batch fetch across every configured key. `data` always
/// contains every key (fresh, cached, stale, or declared fallback);
/// `errors` lists the keys that did not come back fresh.
#[derive(Clone, Debug)]
pub struct AggregateOutcome {
    pub data: BTreeMap<String, PriceValue>,
    pub ttls: BTreeMap<String, u64>,
    pub errors: Vec<String>,
    pub successes: Vec<String>,
    pub cached: bool,
    pub partial: bool,
    pub stale: bool,
}

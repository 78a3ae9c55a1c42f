use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::fetch::{PriceValue, Upstream};

use super::PriceSource;

/// Frankfurter FX rate. The symbol is a `BASE/QUOTE` pair; a bare currency
/// code is quoted against USD. No declared quota.
pub struct FrankfurterSource {
    url: String,
    quote: String,
}

impl FrankfurterSource {
    pub fn new(base_url: &str, symbol: &str) -> Self {
        let (base, quote) = symbol.split_once('/').unwrap_or((symbol, "USD"));
        FrankfurterSource {
            url: format!("{}/latest?base={}&symbols={}", base_url, base, quote),
            quote: quote.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct LatestRates {
    rates: HashMap<String, f64>,
}

#[async_trait]
impl PriceSource for FrankfurterSource {
    async fn fetch(&self, http: &Client) -> Result<PriceValue> {
        let response = http.get(&self.url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::UpstreamStatus {
                upstream: self.upstream().id(),
                status: status.as_u16(),
            });
        }

        let body: LatestRates = response.json().await.map_err(|e| Error::MalformedPayload {
            upstream: self.upstream().id(),
            detail: e.to_string(),
        })?;

        let rate = body
            .rates
            .get(&self.quote)
            .copied()
            .ok_or_else(|| Error::MalformedPayload {
                upstream: self.upstream().id(),
                detail: format!("no {} rate in response", self.quote),
            })?;

        debug!(quote = %self.quote, rate, "fx rate fetched");
        Ok(PriceValue::Spot(rate))
    }

    fn upstream(&self) -> Upstream {
        Upstream::Frankfurter
    }
}

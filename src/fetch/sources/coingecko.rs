use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::fetch::{PriceValue, Upstream};

use super::PriceSource;

/// CoinGecko spot price, USD quoted. No declared quota.
pub struct CoinGeckoSource {
    url: String,
    coin_id: String,
}

impl CoinGeckoSource {
    pub fn new(base_url: &str, coin_id: &str) -> Self {
        CoinGeckoSource {
            url: format!(
                "{}/api/v3/simple/price?ids={}&vs_currencies=usd",
                base_url, coin_id
            ),
            coin_id: coin_id.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct CoinPrices {
    usd: Option<f64>,
}

#[async_trait]
impl PriceSource for CoinGeckoSource {
    async fn fetch(&self, http: &Client) -> Result<PriceValue> {
        let response = http.get(&self.url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::UpstreamStatus {
                upstream: self.upstream().id(),
                status: status.as_u16(),
            });
        }

        let body: HashMap<String, CoinPrices> =
            response.json().await.map_err(|e| Error::MalformedPayload {
                upstream: self.upstream().id(),
                detail: e.to_string(),
            })?;

        let price = body
            .get(&self.coin_id)
            .and_then(|prices| prices.usd)
            .ok_or_else(|| Error::MalformedPayload {
                upstream: self.upstream().id(),
                detail: format!("no usd price for {}", self.coin_id),
            })?;

        debug!(coin = %self.coin_id, price, "coingecko spot fetched");
        Ok(PriceValue::Spot(price))
    }

    fn upstream(&self) -> Upstream {
        Upstream::CoinGecko
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mock_server(body: &str, status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/simple/price"))
            .respond_with(ResponseTemplate::new(status).set_body_string(body))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn parses_spot_price() {
        let server = mock_server(r#"{"bitcoin": {"usd": 101250.5}}"#, 200).await;
        let source = CoinGeckoSource::new(&server.uri(), "bitcoin");

        let value = source.fetch(&Client::new()).await.unwrap();
        assert_eq!(value, PriceValue::Spot(101250.5));
    }

    #[tokio::test]
    async fn missing_coin_is_a_malformed_payload() {
        let server = mock_server(r#"{}"#, 200).await;
        let source = CoinGeckoSource::new(&server.uri(), "bitcoin");

        let err = source.fetch(&Client::new()).await.unwrap_err();
        assert!(matches!(err, Error::MalformedPayload { .. }));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn server_error_is_a_retriable_status() {
        let server = mock_server("", 500).await;
        let source = CoinGeckoSource::new(&server.uri(), "bitcoin");

        let err = source.fetch(&Client::new()).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamStatus { status: 500, .. }));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn rate_limit_status_is_a_retriable_status() {
        let server = mock_server("", 429).await;
        let source = CoinGeckoSource::new(&server.uri(), "bitcoin");

        let err = source.fetch(&Client::new()).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamStatus { status: 429, .. }));
        assert!(err.is_retriable());
    }
}

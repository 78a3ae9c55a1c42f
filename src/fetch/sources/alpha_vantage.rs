use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::fetch::{MarketQuote, PriceValue, Upstream};

use super::PriceSource;

/// Alpha Vantage GLOBAL_QUOTE. Requires an API key and carries the
/// declared per-minute quota; throttling is signalled both as HTTP 429 and
/// as a 200 body without a quote, so both surface as transients.
pub struct AlphaVantageSource {
    base_url: String,
    symbol: String,
    api_key: Option<String>,
}

impl AlphaVantageSource {
    pub fn new(base_url: &str, symbol: &str, api_key: Option<String>) -> Self {
        AlphaVantageSource {
            base_url: base_url.to_string(),
            symbol: symbol.to_string(),
            api_key,
        }
    }
}

#[derive(Deserialize)]
struct GlobalQuoteEnvelope {
    #[serde(rename = "Global Quote")]
    quote: Option<GlobalQuote>,
}

#[derive(Deserialize)]
struct GlobalQuote {
    #[serde(rename = "05. price")]
    price: String,
    #[serde(rename = "03. high")]
    high: Option<String>,
    #[serde(rename = "04. low")]
    low: Option<String>,
    #[serde(rename = "06. volume")]
    volume: Option<String>,
}

#[async_trait]
impl PriceSource for AlphaVantageSource {
    async fn fetch(&self, http: &Client) -> Result<PriceValue> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(Error::MissingCredential("ALPHA_VANTAGE_API_KEY"))?;

        let url = format!(
            "{}/query?function=GLOBAL_QUOTE&symbol={}&apikey={}",
            self.base_url, self.symbol, api_key
        );
        let response = http.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::UpstreamStatus {
                upstream: self.upstream().id(),
                status: status.as_u16(),
            });
        }

        let envelope: GlobalQuoteEnvelope =
            response.json().await.map_err(|e| Error::MalformedPayload {
                upstream: self.upstream().id(),
                detail: e.to_string(),
            })?;

        let quote = envelope.quote.ok_or_else(|| Error::MalformedPayload {
            upstream: self.upstream().id(),
            detail: format!("no Global Quote for {}", self.symbol),
        })?;

        let price: f64 = quote.price.parse().map_err(|_| Error::MalformedPayload {
            upstream: self.upstream().id(),
            detail: format!("unparseable price {:?}", quote.price),
        })?;

        let parse_opt = |field: Option<String>| field.and_then(|raw| raw.parse().ok());

        debug!(symbol = %self.symbol, price, "market quote fetched");
        Ok(PriceValue::Quote(MarketQuote {
            price,
            high: parse_opt(quote.high),
            low: parse_opt(quote.low),
            volume: parse_opt(quote.volume),
        }))
    }

    fn upstream(&self) -> Upstream {
        Upstream::AlphaVantage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source(uri: &str) -> AlphaVantageSource {
        AlphaVantageSource::new(uri, "MSTR", Some("demo-key".to_string()))
    }

    #[tokio::test]
    async fn parses_a_full_quote() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .and(query_param("function", "GLOBAL_QUOTE"))
            .and(query_param("symbol", "MSTR"))
            .and(query_param("apikey", "demo-key"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"Global Quote": {
                    "01. symbol": "MSTR",
                    "03. high": "428.00",
                    "04. low": "412.50",
                    "05. price": "420.69",
                    "06. volume": "1534210"
                }}"#,
            ))
            .mount(&server)
            .await;

        let value = source(&server.uri()).fetch(&Client::new()).await.unwrap();
        assert_eq!(
            value,
            PriceValue::Quote(MarketQuote {
                price: 420.69,
                high: Some(428.0),
                low: Some(412.5),
                volume: Some(1_534_210.0),
            })
        );
    }

    #[tokio::test]
    async fn quote_without_optional_fields_still_parses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"Global Quote": {"05. price": "99.5"}}"#),
            )
            .mount(&server)
            .await;

        let value = source(&server.uri()).fetch(&Client::new()).await.unwrap();
        assert_eq!(value, PriceValue::Quote(MarketQuote::price_only(99.5)));
    }

    #[tokio::test]
    async fn missing_api_key_fails_without_an_upstream_call() {
        let server = MockServer::start().await;
        // No mock mounted: any request would 404 and fail the wrong way.
        let source = AlphaVantageSource::new(&server.uri(), "MSTR", None);

        let err = source.fetch(&Client::new()).await.unwrap_err();
        assert!(matches!(err, Error::MissingCredential(_)));
        assert!(!err.is_retriable());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn throttle_note_body_is_a_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"Note": "Thank you for using Alpha Vantage! Our standard API rate limit is 5 requests per minute."}"#,
            ))
            .mount(&server)
            .await;

        let err = source(&server.uri()).fetch(&Client::new()).await.unwrap_err();
        assert!(matches!(err, Error::MalformedPayload { .. }));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn unparseable_price_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"Global Quote": {"05. price": "n/a"}}"#),
            )
            .mount(&server)
            .await;

        let err = source(&server.uri()).fetch(&Client::new()).await.unwrap_err();
        assert!(matches!(err, Error::MalformedPayload { .. }));
    }

    #[tokio::test]
    async fn rate_limit_status_is_a_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let err = source(&server.uri()).fetch(&Client::new()).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamStatus { status: 429, .. }));
        assert!(err.is_retriable());
    }
}

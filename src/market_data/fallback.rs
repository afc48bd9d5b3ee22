use crate::core::{Ticker, PUBLIC_SOURCE};
use crate::exchanges::adapter::json_decimal;
use crate::exchanges::error::{GatewayError, GatewayResult};
use crate::types::{Price, Size, Symbol};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.coingecko.com";

/// Credential-free price source, used only when no exchange adapter has ever seen a symbol
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FallbackSource: Send + Sync {
    async fn fetch_ticker(&self, symbol: &Symbol) -> GatewayResult<Ticker>;
}

/// CoinGecko `simple/price` client.
///
/// Only a last price, 24h change and 24h volume are published, so bid and ask are both
/// set to the last price. Results carry the `public` source tag.
pub struct PublicPriceAggregator {
    client: Client,
    base_url: String,
    coin_ids: HashMap<String, String>,
}

impl PublicPriceAggregator {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        let coin_ids = [
            ("BTC", "bitcoin"),
            ("ETH", "ethereum"),
            ("SOL", "solana"),
            ("BNB", "binancecoin"),
            ("XRP", "ripple"),
            ("ADA", "cardano"),
            ("DOGE", "dogecoin"),
            ("DOT", "polkadot"),
            ("AVAX", "avalanche-2"),
            ("LINK", "chainlink"),
            ("LTC", "litecoin"),
            ("MATIC", "matic-network"),
        ]
        .into_iter()
        .map(|(asset, id)| (asset.to_string(), id.to_string()))
        .collect();

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            coin_ids,
        }
    }

    /// Register or override the coin id used for a base asset
    pub fn with_coin_id(mut self, asset: &str, coin_id: &str) -> Self {
        self.coin_ids
            .insert(asset.to_uppercase(), coin_id.to_string());
        self
    }

    /// Public quote currency a pair is priced in, `None` when there is none
    fn vs_currency(quote: &str) -> Option<&'static str> {
        match quote {
            "USDT" | "USDC" | "BUSD" | "FDUSD" | "TUSD" | "USD" => Some("usd"),
            "EUR" => Some("eur"),
            "BTC" => Some("btc"),
            "ETH" => Some("eth"),
            "BNB" => Some("bnb"),
            "TRY" => Some("try"),
            _ => None,
        }
    }
}

impl Default for PublicPriceAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FallbackSource for PublicPriceAggregator {
    async fn fetch_ticker(&self, symbol: &Symbol) -> GatewayResult<Ticker> {
        let coin_id = self.coin_ids.get(symbol.base()).ok_or_else(|| {
            GatewayError::invalid_response(
                PUBLIC_SOURCE,
                format!("no public price id for {}", symbol.base()),
            )
        })?;
        let vs = Self::vs_currency(symbol.quote()).ok_or_else(|| {
            GatewayError::invalid_response(
                PUBLIC_SOURCE,
                format!("no public quote currency for {}", symbol.quote()),
            )
        })?;

        let response = self
            .client
            .get(format!("{}/api/v3/simple/price", self.base_url))
            .query(&[
                ("ids", coin_id.as_str()),
                ("vs_currencies", vs),
                ("include_24hr_change", "true"),
                ("include_24hr_vol", "true"),
            ])
            .send()
            .await
            .map_err(|e| GatewayError::from_http(PUBLIC_SOURCE, e))?
            .error_for_status()
            .map_err(|e| GatewayError::from_http(PUBLIC_SOURCE, e))?;
        let json: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::invalid_response(PUBLIC_SOURCE, e.to_string()))?;

        let entry = json.get(coin_id).ok_or_else(|| {
            GatewayError::invalid_response(PUBLIC_SOURCE, format!("{} missing from response", coin_id))
        })?;
        let price = entry
            .get(vs)
            .and_then(json_decimal)
            .ok_or_else(|| GatewayError::invalid_response(PUBLIC_SOURCE, "price missing"))?;
        let change = entry
            .get(format!("{}_24h_change", vs).as_str())
            .and_then(json_decimal)
            .unwrap_or(Decimal::ZERO);
        let volume = entry
            .get(format!("{}_24h_vol", vs).as_str())
            .and_then(json_decimal)
            .unwrap_or(Decimal::ZERO);

        Ok(Ticker {
            symbol: symbol.clone(),
            price: Price::new(price),
            bid: Price::new(price),
            ask: Price::new(price),
            volume: Size::new(volume),
            change_percent: change.round_dp(4),
            timestamp: Utc::now(),
            source_exchange: PUBLIC_SOURCE.to_string(),
            raw: Some(entry.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::error::ErrorKind;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_public_ticker_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/simple/price"))
            .and(query_param("ids", "bitcoin"))
            .and(query_param("vs_currencies", "usd"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "bitcoin": { "usd": 67500.5, "usd_24h_change": -4.75, "usd_24h_vol": 1234567.0 }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let source = PublicPriceAggregator::with_base_url(&server.uri());
        let ticker = source
            .fetch_ticker(&Symbol::new("BTC", "USDT"))
            .await
            .unwrap();
        assert_eq!(ticker.source_exchange, PUBLIC_SOURCE);
        assert_eq!(ticker.price, Price::from_str("67500.5").unwrap());
        assert_eq!(ticker.bid, ticker.ask);
        assert_eq!(ticker.change_percent, Decimal::new(-475, 2));
    }

    #[tokio::test]
    async fn test_unknown_asset_is_not_requested() {
        let server = MockServer::start().await;
        let source = PublicPriceAggregator::with_base_url(&server.uri());
        let err = source
            .fetch_ticker(&Symbol::new("NOPE", "USDT"))
            .await
            .unwrap_err();
        assert_eq!(err.exchange, PUBLIC_SOURCE);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unpriced_quote_is_not_requested() {
        let server = MockServer::start().await;
        let source = PublicPriceAggregator::with_base_url(&server.uri());
        let err = source
            .fetch_ticker(&Symbol::new("ETH", "GBP"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidResponse);
        assert!(err.message.contains("GBP"));
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}

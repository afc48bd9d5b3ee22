//! Façade consumed by the HTTP layer: ticker lookup, balances, order routing and status.

use crate::config::GatewayConfig;
use crate::core::{Balance, GatewayEvent, OrderRequest, OrderResult, Ticker, PUBLIC_SOURCE};
use crate::exchanges::adapter::{ExchangeAdapter, ExchangeFeatures};
use crate::exchanges::connection_manager::ConnectionState;
use crate::exchanges::error::{GatewayError, GatewayResult};
use crate::exchanges::registry::{ExchangeRegistry, InitializationReport};
use crate::market_data::{FallbackSource, MarketDataCache, PublicPriceAggregator};
use crate::types::Symbol;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Error source used when no single exchange is at fault
const GATEWAY: &str = "gateway";

/// Per-exchange entry of [`TradingGateway::get_exchange_status`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeStatus {
    pub connected: bool,
    pub state: ConnectionState,
    /// Milliseconds
    pub latency: Option<u64>,
    pub features: Option<ExchangeFeatures>,
    pub last_update: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Result of [`TradingGateway::restart_exchange`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartOutcome {
    pub success: bool,
    pub new_primary: Option<String>,
}

/// Single entry point over every configured exchange
pub struct TradingGateway {
    registry: Arc<ExchangeRegistry>,
    cache: Arc<MarketDataCache>,
    fallback: Option<Arc<dyn FallbackSource>>,
    /// Exchange that last delivered each symbol
    last_served: DashMap<Symbol, String>,
}

impl TradingGateway {
    pub fn new(registry: Arc<ExchangeRegistry>, fallback: Option<Arc<dyn FallbackSource>>) -> Self {
        Self {
            cache: Arc::clone(registry.cache()),
            registry,
            fallback,
            last_served: DashMap::new(),
        }
    }

    /// Gateway over the built-in adapters and, when enabled, the public aggregator
    pub fn from_config(config: &GatewayConfig) -> Self {
        let cache = Arc::new(MarketDataCache::new(config.cache.freshness_window()));
        let registry = Arc::new(ExchangeRegistry::from_config(config, cache));
        let fallback = config.fallback_enabled.then(|| {
            let source = match &config.fallback_url {
                Some(url) => PublicPriceAggregator::with_base_url(url),
                None => PublicPriceAggregator::new(),
            };
            Arc::new(source) as Arc<dyn FallbackSource>
        });
        Self::new(registry, fallback)
    }

    pub fn registry(&self) -> &Arc<ExchangeRegistry> {
        &self.registry
    }

    pub async fn initialize(&self) -> InitializationReport {
        self.registry.initialize_all().await
    }

    /// Best available ticker, or `None` when no source has data.
    ///
    /// Tried in order: the freshest cached ticker among connected exchanges; a REST fetch
    /// through the exchange that last served the symbol (or the primary); the most recent
    /// stale ticker of any exchange; the public aggregator when no exchange has ever seen
    /// the symbol.
    pub async fn get_ticker(&self, symbol: &Symbol) -> Option<Ticker> {
        let connected: Vec<String> = self
            .registry
            .connected_adapters()
            .iter()
            .map(|adapter| adapter.name().to_string())
            .collect();
        if let Some(ticker) = self.cache.freshest_among(symbol, &connected) {
            self.last_served
                .insert(symbol.clone(), ticker.source_exchange.clone());
            return Some(ticker.without_raw());
        }

        let target = self
            .last_served
            .get(symbol)
            .and_then(|entry| self.registry.get_adapter(entry.value()))
            .or_else(|| {
                self.registry
                    .get_primary_exchange()
                    .and_then(|name| self.registry.get_adapter(&name))
            });
        if let Some(adapter) = target {
            match adapter.fetch_ticker(symbol).await {
                Ok(ticker) => {
                    self.last_served
                        .insert(symbol.clone(), adapter.name().to_string());
                    return Some(ticker.without_raw());
                }
                Err(e) => warn!("Ticker fetch for {} failed: {}", symbol, e),
            }
        }

        if let Some(entry) = self.cache.latest_from_exchanges(symbol) {
            debug!(
                "Serving stale {} from {} ({}ms old)",
                symbol,
                entry.ticker.source_exchange,
                entry.age().as_millis()
            );
            return Some(entry.ticker.without_raw());
        }

        if self.cache.seen_by_exchange(symbol) {
            return None;
        }
        if let Some(ticker) = self.cache.fresh(PUBLIC_SOURCE, symbol) {
            return Some(ticker.without_raw());
        }
        let fallback = self.fallback.as_ref()?;
        match fallback.fetch_ticker(symbol).await {
            Ok(mut ticker) => {
                info!("Using public price for {}", symbol);
                // cached under the public key so it never counts as exchange data
                ticker.source_exchange = PUBLIC_SOURCE.to_string();
                Some(self.cache.store(ticker).without_raw())
            }
            Err(e) => {
                warn!("Public price for {} unavailable: {}", symbol, e);
                None
            }
        }
    }

    /// Balance of one exchange, or the sum across every connected exchange
    pub async fn get_balance(&self, exchange: Option<&str>) -> GatewayResult<Balance> {
        if let Some(name) = exchange {
            let adapter = self.registry.get_adapter(name).ok_or_else(|| {
                GatewayError::not_connected(name, "exchange is not initialized")
            })?;
            return adapter.get_balance().await.map_err(|e| {
                error!("Balance on {} failed: {}", name, e);
                e
            });
        }

        let adapters = self.registry.connected_adapters();
        if adapters.is_empty() {
            return Err(GatewayError::not_connected(GATEWAY, "no exchange is connected"));
        }
        let results = join_all(adapters.iter().map(|adapter| adapter.get_balance())).await;

        let mut total = Balance::new();
        let mut first_error = None;
        let mut succeeded = 0;
        for (adapter, result) in adapters.iter().zip(results) {
            match result {
                Ok(balance) => {
                    total.merge(&balance);
                    succeeded += 1;
                }
                Err(e) => {
                    error!("Balance on {} failed: {}", adapter.name(), e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match (succeeded, first_error) {
            (0, Some(e)) => Err(e),
            _ => Ok(total),
        }
    }

    /// Route an order to the named exchange, or the primary one.
    ///
    /// Never retried and never redirected to another exchange; errors come back as raised.
    pub async fn place_order(
        &self,
        exchange: Option<&str>,
        request: &OrderRequest,
    ) -> GatewayResult<OrderResult> {
        let name = match exchange {
            Some(name) => name.trim().to_lowercase(),
            None => self.registry.get_primary_exchange().ok_or_else(|| {
                GatewayError::not_connected(GATEWAY, "no primary exchange is connected")
            })?,
        };
        let adapter = self
            .registry
            .get_adapter(&name)
            .ok_or_else(|| GatewayError::not_connected(&name, "exchange is not initialized"))?;
        adapter.create_order(request).await.map_err(|e| {
            error!("Order on {} failed: {}", name, e);
            e
        })
    }

    /// Snapshot of every configured exchange
    pub fn get_exchange_status(&self) -> BTreeMap<String, ExchangeStatus> {
        self.registry
            .get_connection_status()
            .into_iter()
            .map(|(name, health)| {
                let features = self.registry.get_adapter(&name).map(|a| a.features());
                let status = ExchangeStatus {
                    connected: health.connected,
                    state: health.state,
                    latency: health.latency_estimate,
                    features,
                    last_update: health.last_update,
                    reason: health.reason,
                };
                (name, status)
            })
            .collect()
    }

    pub async fn restart_exchange(&self, exchange: &str) -> RestartOutcome {
        let success = match self.registry.restart_exchange(exchange).await {
            Ok(connected) => connected,
            Err(e) => {
                error!("Restart of {} failed: {}", exchange, e);
                false
            }
        };
        RestartOutcome {
            success,
            new_primary: self.registry.get_primary_exchange(),
        }
    }

    /// Events of every exchange
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.registry.subscribe()
    }

    pub async fn shutdown(&self) {
        self.registry.disconnect_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdapterConfig;
    use crate::core::OrderSide;
    use crate::exchanges::error::ErrorKind;
    use crate::exchanges::mock::MockAdapterFactory;
    use crate::market_data::fallback::MockFallbackSource;
    use crate::types::{Price, Size};
    use rust_decimal::Decimal;
    use std::time::Duration;

    const KEY: &str = "abcdefghijklmnop1234";
    const SECRET: &str = "qrstuvwxyz0123456789";

    fn btc() -> Symbol {
        Symbol::new("BTC", "USDT")
    }

    fn price(s: &str) -> Price {
        Price::from_str(s).unwrap()
    }

    fn gateway(
        names: &[&str],
        factory: Arc<MockAdapterFactory>,
        fallback: Option<Arc<dyn FallbackSource>>,
    ) -> TradingGateway {
        let configs = names
            .iter()
            .map(|name| AdapterConfig::new(*name).with_credentials(KEY, SECRET))
            .collect();
        let cache = Arc::new(MarketDataCache::new(Duration::from_secs(10)));
        let registry = ExchangeRegistry::new(configs, None, cache, factory);
        TradingGateway::new(Arc::new(registry), fallback)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_cache_served_without_fetch() {
        let factory = Arc::new(MockAdapterFactory::new(|a| {
            a.with_ticker(price("67500"), Decimal::new(-475, 2))
        }));
        let gateway = gateway(&["binance"], Arc::clone(&factory), None);
        gateway.initialize().await;
        let adapter = factory.latest("binance").unwrap();

        let first = gateway.get_ticker(&btc()).await.unwrap();
        assert_eq!(first.price, price("67500"));
        assert_eq!(first.change_percent, Decimal::new(-475, 2));
        assert_eq!(adapter.fetch_calls(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        let second = gateway.get_ticker(&btc()).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(adapter.fetch_calls(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        gateway.get_ticker(&btc()).await.unwrap();
        assert_eq!(adapter.fetch_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_freshest_exchange_wins() {
        let factory = Arc::new(MockAdapterFactory::new(|a| a));
        let gateway = gateway(&["binance", "okx"], Arc::clone(&factory), None);
        gateway.initialize().await;

        factory.latest("binance").unwrap().push_ticker(btc(), price("100"));
        tokio::time::advance(Duration::from_secs(1)).await;
        factory.latest("okx").unwrap().push_ticker(btc(), price("101"));

        let ticker = gateway.get_ticker(&btc()).await.unwrap();
        assert_eq!(ticker.source_exchange, "okx");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entry_served_when_fetch_fails() {
        let factory = Arc::new(MockAdapterFactory::new(|a| {
            a.with_ticker(price("67500"), Decimal::ZERO)
        }));
        let gateway = gateway(&["binance"], Arc::clone(&factory), None);
        gateway.initialize().await;
        let adapter = factory.latest("binance").unwrap();

        gateway.get_ticker(&btc()).await.unwrap();
        adapter.set_rest_failing(true);
        tokio::time::advance(Duration::from_secs(30)).await;

        let stale = gateway.get_ticker(&btc()).await.unwrap();
        assert_eq!(stale.price, price("67500"));
        assert_eq!(adapter.fetch_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_public_fallback_only_for_unseen_symbols() {
        let mut source = MockFallbackSource::new();
        source.expect_fetch_ticker().times(1).returning(|symbol| {
            Ok(Ticker {
                symbol: symbol.clone(),
                price: Price::from_str("3200").unwrap(),
                bid: Price::from_str("3200").unwrap(),
                ask: Price::from_str("3200").unwrap(),
                volume: Size::new(Decimal::ONE),
                change_percent: Decimal::ZERO,
                timestamp: Utc::now(),
                source_exchange: PUBLIC_SOURCE.to_string(),
                raw: None,
            })
        });
        let factory = Arc::new(MockAdapterFactory::new(|a| {
            a.with_init_results(vec![Ok(false), Ok(false), Ok(false)])
        }));
        let gateway = gateway(&["binance"], factory, Some(Arc::new(source)));
        gateway.initialize().await;

        let eth = Symbol::new("ETH", "USDT");
        let ticker = gateway.get_ticker(&eth).await.unwrap();
        assert_eq!(ticker.source_exchange, PUBLIC_SOURCE);
        // second read is served from the public cache entry
        let again = gateway.get_ticker(&eth).await.unwrap();
        assert_eq!(again.price, ticker.price);
    }

    #[tokio::test(start_paused = true)]
    async fn test_public_price_keyed_as_public_whatever_its_label() {
        let mut source = MockFallbackSource::new();
        source.expect_fetch_ticker().times(1).returning(|symbol| {
            Ok(Ticker {
                symbol: symbol.clone(),
                price: Price::from_str("3200").unwrap(),
                bid: Price::from_str("3200").unwrap(),
                ask: Price::from_str("3200").unwrap(),
                volume: Size::new(Decimal::ONE),
                change_percent: Decimal::ZERO,
                timestamp: Utc::now(),
                source_exchange: "coingecko".to_string(),
                raw: None,
            })
        });
        let factory = Arc::new(MockAdapterFactory::new(|a| {
            a.with_init_results(vec![Ok(false), Ok(false), Ok(false)])
        }));
        let gateway = gateway(&["binance"], factory, Some(Arc::new(source)));
        gateway.initialize().await;

        let eth = Symbol::new("ETH", "USDT");
        let ticker = gateway.get_ticker(&eth).await.unwrap();
        assert_eq!(ticker.source_exchange, PUBLIC_SOURCE);
        assert!(gateway.cache.fresh(PUBLIC_SOURCE, &eth).is_some());
        assert!(!gateway.cache.seen_by_exchange(&eth));

        // still counts as public data on the next read
        let again = gateway.get_ticker(&eth).await.unwrap();
        assert_eq!(again.source_exchange, PUBLIC_SOURCE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpriced_fallback_is_none() {
        let mut source = MockFallbackSource::new();
        source.expect_fetch_ticker().times(1).returning(|symbol| {
            Err(GatewayError::invalid_response(
                PUBLIC_SOURCE,
                format!("no public quote currency for {}", symbol.quote()),
            ))
        });
        let factory = Arc::new(MockAdapterFactory::new(|a| {
            a.with_init_results(vec![Ok(false), Ok(false), Ok(false)])
        }));
        let gateway = gateway(&["binance"], factory, Some(Arc::new(source)));
        gateway.initialize().await;

        assert!(gateway.get_ticker(&Symbol::new("ETH", "GBP")).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_data_is_none() {
        let factory = Arc::new(MockAdapterFactory::new(|a| a));
        let gateway = gateway(&["binance"], factory, None);
        gateway.initialize().await;
        assert!(gateway.get_ticker(&btc()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_balance_aggregates_connected_exchanges() {
        let factory = Arc::new(MockAdapterFactory::new(|a| {
            let mut balance = Balance::new();
            balance.insert("USDT", Size::new(Decimal::from(100)), Size::new(Decimal::from(5)));
            a.with_balance(Ok(balance))
        }));
        let gateway = gateway(&["binance", "okx"], factory, None);
        gateway.initialize().await;

        let total = gateway.get_balance(None).await.unwrap();
        let usdt = total.get("USDT").unwrap();
        assert_eq!(usdt.free, Size::new(Decimal::from(200)));
        assert_eq!(usdt.total, Size::new(Decimal::from(210)));

        let single = gateway.get_balance(Some("okx")).await.unwrap();
        assert_eq!(single.get("USDT").unwrap().total, Size::new(Decimal::from(105)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_order_error_is_not_rerouted() {
        let factory = Arc::new(MockAdapterFactory::new(|a| {
            if a.name() == "binance" {
                a.with_order_error(GatewayError::rejected("binance", "insufficient balance"))
            } else {
                a
            }
        }));
        let gateway = gateway(&["binance", "okx"], Arc::clone(&factory), None);
        gateway.initialize().await;

        let request = OrderRequest::market(btc(), OrderSide::Buy, Size::new(Decimal::ONE));
        let err = gateway.place_order(None, &request).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::OrderRejected);
        assert_eq!(factory.latest("okx").unwrap().order_calls(), 0);

        let result = gateway.place_order(Some("okx"), &request).await.unwrap();
        assert_eq!(result.exchange, "okx");
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_reports_new_primary() {
        let factory = Arc::new(MockAdapterFactory::new(|a| a));
        let gateway = gateway(&["binance", "okx"], Arc::clone(&factory), None);
        gateway.initialize().await;

        let outcome = gateway.restart_exchange("okx").await;
        assert!(outcome.success);
        assert_eq!(outcome.new_primary.as_deref(), Some("binance"));

        let status = gateway.get_exchange_status();
        assert_eq!(status.len(), 2);
        assert!(status["okx"].connected);
        assert!(status["okx"].features.is_some());
    }
}

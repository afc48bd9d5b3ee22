//! Canonical adapter contract and the connector that implements it on top of a
//! per-exchange protocol.

use crate::config::AdapterConfig;
use crate::core::{Balance, GatewayEvent, OrderRequest, OrderResult, OrderSide, OrderType, Ticker};
use crate::exchanges::connection_manager::{ConnectionManager, ConnectionState, StreamHandler};
use crate::exchanges::error::{classify_status, GatewayError, GatewayResult};
use crate::exchanges::rate_limiter::RateLimiter;
use crate::exchanges::symbols::SymbolMapper;
use crate::exchanges::transport::StreamTransport;
use crate::market_data::MarketDataCache;
use crate::monitoring::HealthStatus;
use crate::types::{Price, Symbol};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use log::{debug, error, warn};
use reqwest::{RequestBuilder, StatusCode};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::Instant;

/// Capacity of each adapter's event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// What an adapter can do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeFeatures {
    pub rest: bool,
    pub streaming: bool,
    pub trading: bool,
    pub requires_passphrase: bool,
}

/// Canonical connectivity contract every exchange implements
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn features(&self) -> ExchangeFeatures;

    /// Validate credentials locally, check REST reachability and start the stream.
    ///
    /// `Err` is terminal (configuration or authentication); `Ok(false)` is a recoverable
    /// failure the caller may retry.
    async fn initialize(&self) -> GatewayResult<bool>;

    /// Fresh own cache entry, else a REST fetch, else the own stale entry
    async fn get_ticker(&self, symbol: &Symbol) -> Option<Arc<Ticker>>;

    /// REST fetch that also refreshes the cache
    async fn fetch_ticker(&self, symbol: &Symbol) -> GatewayResult<Arc<Ticker>>;

    async fn get_balance(&self) -> GatewayResult<Balance>;

    async fn create_order(&self, request: &OrderRequest) -> GatewayResult<OrderResult>;

    /// Idempotent full teardown
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    async fn health(&self) -> HealthStatus;

    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent>;

    /// Stream state changes, including transitions that raise no event. `None` for
    /// adapters without a stream.
    fn watch_state(&self) -> Option<watch::Receiver<ConnectionState>> {
        None
    }
}

/// Order after symbol normalization and quantity convention have been applied
#[derive(Debug, Clone, PartialEq)]
pub struct NativeOrder {
    pub symbol: Symbol,
    pub native_symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// Canonical base-asset amount, echoed back in the result
    pub amount: Decimal,
    /// Quantity field actually submitted
    pub quantity: Decimal,
    /// `quantity` is quote-asset notional rather than base-asset amount
    pub quantity_in_quote: bool,
    pub price: Option<Price>,
    pub client_order_id: String,
}

/// Exchange-specific REST half of an adapter
#[async_trait]
pub trait ExchangeProtocol: StreamHandler + 'static {
    fn name(&self) -> &str;

    fn requires_passphrase(&self) -> bool {
        false
    }

    /// Market buys are sized in quote currency
    fn market_buy_in_quote(&self) -> bool {
        false
    }

    fn symbols(&self) -> &SymbolMapper;

    async fn ping(&self) -> GatewayResult<()>;

    async fn fetch_ticker(&self, native: &str, symbol: &Symbol) -> GatewayResult<Ticker>;

    async fn fetch_balance(&self) -> GatewayResult<Balance>;

    async fn submit_order(&self, order: &NativeOrder) -> GatewayResult<OrderResult>;
}

/// [`ExchangeAdapter`] built from a protocol client, a shared cache and an optional
/// resilience-managed stream
pub struct ExchangeConnector<P: ExchangeProtocol> {
    config: AdapterConfig,
    protocol: Arc<P>,
    cache: Arc<MarketDataCache>,
    events: broadcast::Sender<GatewayEvent>,
    stream: Option<ConnectionManager>,
    limiter: Mutex<RateLimiter>,
    credentials_valid: bool,
    ready: AtomicBool,
    /// REST ping round trip in milliseconds, 0 when unknown
    latency_ms: AtomicU64,
    last_error: RwLock<Option<GatewayError>>,
}

impl<P: ExchangeProtocol> ExchangeConnector<P> {
    pub fn new(
        config: AdapterConfig,
        protocol: P,
        cache: Arc<MarketDataCache>,
        transport: Arc<dyn StreamTransport>,
    ) -> Self {
        let protocol = Arc::new(protocol);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let credentials_valid = config
            .credentials()
            .validate(protocol.requires_passphrase())
            .is_ok();

        let stream = config.streaming.then(|| {
            ConnectionManager::new(
                protocol.name(),
                config.resilience(),
                config.silent_mode,
                transport,
                Arc::clone(&protocol) as Arc<dyn StreamHandler>,
                Arc::clone(&cache),
                events.clone(),
            )
        });

        Self {
            limiter: Mutex::new(RateLimiter::per_minute(config.rate_limit_per_minute)),
            config,
            protocol,
            cache,
            events,
            stream,
            credentials_valid,
            ready: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            last_error: RwLock::new(None),
        }
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    /// Resilience manager of the stream, if streaming is enabled
    pub fn stream(&self) -> Option<&ConnectionManager> {
        self.stream.as_ref()
    }

    fn record_error(&self, error: &GatewayError) {
        if let Ok(mut slot) = self.last_error.write() {
            *slot = Some(error.clone());
        }
        let _ = self.events.send(GatewayEvent::Error(error.clone()));
    }

    async fn throttle(&self) -> GatewayResult<()> {
        self.limiter
            .lock()
            .await
            .try_acquire(Instant::now())
            .map_err(|wait| {
                GatewayError::rate_limited(
                    self.name(),
                    format!("local request budget exhausted, retry in {}ms", wait.as_millis()),
                )
            })
    }

    /// Price used to turn a base amount into quote notional
    async fn reference_price(&self, request: &OrderRequest) -> GatewayResult<Decimal> {
        if let Some(price) = request.price.filter(Price::is_positive) {
            return Ok(price.value());
        }
        let ticker = self.get_ticker(&request.symbol).await.ok_or_else(|| {
            GatewayError::invalid_response(
                self.name(),
                format!("no reference price for market buy on {}", request.symbol),
            )
        })?;
        Ok(if ticker.ask.is_positive() {
            ticker.ask.value()
        } else {
            ticker.price.value()
        })
    }

    fn check_order(&self, request: &OrderRequest) -> GatewayResult<()> {
        if !request.amount.is_positive() {
            return Err(GatewayError::rejected(
                self.name(),
                "order amount must be positive",
            ));
        }
        if request.order_type == OrderType::Limit
            && !request.price.map_or(false, |p| p.is_positive())
        {
            return Err(GatewayError::rejected(
                self.name(),
                "limit order requires a positive price",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl<P: ExchangeProtocol> ExchangeAdapter for ExchangeConnector<P> {
    fn name(&self) -> &str {
        self.protocol.name()
    }

    fn features(&self) -> ExchangeFeatures {
        ExchangeFeatures {
            rest: true,
            streaming: self.stream.is_some(),
            trading: self.credentials_valid,
            requires_passphrase: self.protocol.requires_passphrase(),
        }
    }

    async fn initialize(&self) -> GatewayResult<bool> {
        let silent = self.config.silent_mode;
        if !self.config.enabled {
            return Err(GatewayError::configuration(self.name(), "exchange is disabled"));
        }
        if let Err(e) = self
            .config
            .credentials()
            .validate(self.protocol.requires_passphrase())
        {
            let error = GatewayError::configuration(self.name(), e.to_string());
            error!("{}", error);
            self.record_error(&error);
            return Err(error);
        }

        crate::quiet_info!(
            silent,
            "Initializing {} adapter ({})",
            self.name(),
            if self.config.sandbox { "sandbox" } else { "live" }
        );

        let started = Instant::now();
        if let Err(e) = self.protocol.ping().await {
            self.record_error(&e);
            if e.is_terminal() {
                error!("{} initialization failed: {}", self.name(), e);
                return Err(e);
            }
            warn!("{} REST endpoint unreachable: {}", self.name(), e);
            return Ok(false);
        }
        let rtt = started.elapsed().as_millis().max(1) as u64;
        self.latency_ms.store(rtt, Ordering::Relaxed);
        self.ready.store(true, Ordering::SeqCst);

        if let Some(stream) = &self.stream {
            if let Err(e) = stream.connect().await {
                warn!("{} stream not up yet: {}", self.name(), e);
            }
        }

        let connected = self.is_connected();
        if connected {
            crate::quiet_info!(silent, "{} adapter ready ({}ms)", self.name(), rtt);
        }
        Ok(connected)
    }

    async fn get_ticker(&self, symbol: &Symbol) -> Option<Arc<Ticker>> {
        if let Some(ticker) = self.cache.fresh(self.name(), symbol) {
            return Some(ticker);
        }
        match self.fetch_ticker(symbol).await {
            Ok(ticker) => Some(ticker),
            Err(e) => {
                debug!("{} ticker fetch for {} failed: {}", self.name(), symbol, e);
                self.cache.get(self.name(), symbol).map(|entry| entry.ticker)
            }
        }
    }

    async fn fetch_ticker(&self, symbol: &Symbol) -> GatewayResult<Arc<Ticker>> {
        self.throttle().await?;
        let native = self.protocol.symbols().to_native(symbol);
        let ticker = self.protocol.fetch_ticker(&native, symbol).await?;
        Ok(self.cache.store(ticker))
    }

    async fn get_balance(&self) -> GatewayResult<Balance> {
        if !self.config.enabled || !self.credentials_valid {
            return Err(GatewayError::not_connected(
                self.name(),
                "balance requires an enabled adapter with credentials",
            ));
        }
        self.throttle().await?;
        self.protocol.fetch_balance().await.map_err(|e| {
            self.record_error(&e);
            e
        })
    }

    async fn create_order(&self, request: &OrderRequest) -> GatewayResult<OrderResult> {
        if !self.is_connected() {
            return Err(GatewayError::not_connected(
                self.name(),
                "cannot place orders while disconnected",
            ));
        }
        self.check_order(request)?;

        let (quantity, quantity_in_quote) = if request.order_type == OrderType::Market
            && request.side == OrderSide::Buy
            && self.protocol.market_buy_in_quote()
        {
            let reference = self.reference_price(request).await?;
            (request.amount.value() * reference, true)
        } else {
            (request.amount.value(), false)
        };

        self.throttle().await?;
        let order = NativeOrder {
            symbol: request.symbol.clone(),
            native_symbol: self.protocol.symbols().to_native(&request.symbol),
            side: request.side,
            order_type: request.order_type,
            amount: request.amount.value(),
            quantity,
            quantity_in_quote,
            price: request.price,
            client_order_id: uuid::Uuid::new_v4().simple().to_string(),
        };

        match self.protocol.submit_order(&order).await {
            Ok(result) => {
                crate::quiet_info!(
                    self.config.silent_mode,
                    "{} order {} accepted: {:?} {} {}",
                    self.name(),
                    result.order_id,
                    result.side,
                    result.amount,
                    result.symbol
                );
                Ok(result)
            }
            Err(e) => {
                error!("{} order on {} failed: {}", self.name(), request.symbol, e);
                self.record_error(&e);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) {
        self.ready.store(false, Ordering::SeqCst);
        if let Some(stream) = &self.stream {
            stream.disconnect().await;
        }
        self.cache.clear_exchange(self.name());
        crate::quiet_info!(self.config.silent_mode, "{} adapter disconnected", self.name());
    }

    fn is_connected(&self) -> bool {
        match &self.stream {
            Some(stream) => stream.state().is_live(),
            None => self.ready.load(Ordering::SeqCst) && self.credentials_valid,
        }
    }

    async fn health(&self) -> HealthStatus {
        let (state, latency, stream_error) = match &self.stream {
            Some(stream) => (
                stream.state(),
                stream.latency_ms(),
                stream.last_error().await,
            ),
            None => {
                let state = if self.ready.load(Ordering::SeqCst) {
                    ConnectionState::Connected
                } else {
                    ConnectionState::Disconnected
                };
                (state, None, None)
            }
        };
        let latency = latency.or(match self.latency_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        });
        let reason = stream_error.or_else(|| {
            self.last_error
                .read()
                .ok()
                .and_then(|slot| slot.as_ref().map(|e| e.to_string()))
        });
        HealthStatus::new(self.name(), state, self.is_connected(), latency, reason)
    }

    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    fn watch_state(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.stream.as_ref().map(ConnectionManager::watch_state)
    }
}

/// Decimal from a JSON string or number
pub fn json_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Decimal::from_str(s.trim())
            .or_else(|_| Decimal::from_scientific(s.trim()))
            .ok(),
        Value::Number(n) => {
            let text = n.to_string();
            Decimal::from_str(&text)
                .or_else(|_| Decimal::from_scientific(&text))
                .ok()
        }
        _ => None,
    }
}

/// Required decimal field, or an invalid-response error naming it
pub(crate) fn require_decimal(exchange: &str, value: &Value, field: &str) -> GatewayResult<Decimal> {
    value.get(field).and_then(json_decimal).ok_or_else(|| {
        GatewayError::invalid_response(exchange, format!("missing or malformed '{}'", field))
    })
}

/// REST client with the adapter's connection timeout applied to every request
pub(crate) fn http_client(config: &AdapterConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(config.connection_timeout())
        .build()
        .unwrap_or_default()
}

/// Base URL override from config, else the sandbox or live default
pub(crate) fn endpoint(over: &Option<String>, sandbox: bool, test: &str, live: &str) -> String {
    match over {
        Some(url) => url.trim_end_matches('/').to_string(),
        None if sandbox => test.to_string(),
        None => live.to_string(),
    }
}

/// Milliseconds since the Unix epoch, as exchanges expect in signed requests
pub(crate) fn timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn hmac_sha256(exchange: &str, secret: &str, payload: &str) -> GatewayResult<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::configuration(exchange, format!("invalid secret: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Send a request and read the body as JSON.
///
/// Transport failures are classified here. HTTP error statuses are returned alongside
/// the body so each exchange can apply its own error-code table; a non-JSON error body
/// is classified by status alone.
pub(crate) async fn send_json(
    exchange: &str,
    request: RequestBuilder,
) -> GatewayResult<(StatusCode, Value)> {
    let response = request
        .send()
        .await
        .map_err(|e| GatewayError::from_http(exchange, e))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| GatewayError::from_http(exchange, e))?;

    match serde_json::from_str::<Value>(&body) {
        Ok(json) => Ok((status, json)),
        Err(_) if !status.is_success() => Err(GatewayError::new(
            exchange,
            classify_status(status.as_u16()),
            format!("HTTP {}: {}", status.as_u16(), body.chars().take(200).collect::<String>()),
        )),
        Err(e) => Err(GatewayError::invalid_response(
            exchange,
            format!("body is not JSON: {}", e),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_decimal_accepts_strings_and_numbers() {
        assert_eq!(json_decimal(&json!("67500.10")), Some(Decimal::new(6750010, 2)));
        assert_eq!(json_decimal(&json!(-4.75)), Some(Decimal::new(-475, 2)));
        assert_eq!(json_decimal(&json!("1e-5")), Some(Decimal::new(1, 5)));
        assert_eq!(json_decimal(&json!("")), None);
        assert_eq!(json_decimal(&json!(null)), None);
    }

    #[test]
    fn test_require_decimal_names_missing_field() {
        let err = require_decimal("okx", &json!({"last": "1"}), "bidPx").unwrap_err();
        assert!(err.message.contains("bidPx"));
    }

    #[test]
    fn test_hmac_sha256_known_vector() {
        // RFC 4231 test case 2
        let mac = hmac_sha256("test", "Jefe", "what do ya want for nothing?").unwrap();
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }
}

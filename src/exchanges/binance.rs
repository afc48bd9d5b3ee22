use crate::config::AdapterConfig;
use crate::core::{Balance, OrderResult, OrderSide, OrderStatus, OrderType, Ticker};
use crate::exchanges::adapter::{
    endpoint, hmac_sha256, http_client, json_decimal, require_decimal, send_json,
    timestamp_millis, ExchangeConnector, ExchangeProtocol, NativeOrder,
};
use crate::exchanges::connection_manager::StreamHandler;
use crate::exchanges::error::{classify_status, ErrorKind, GatewayError, GatewayResult};
use crate::exchanges::symbols::{NativeStyle, SymbolMapper};
use crate::exchanges::transport::WsFrame;
use crate::security::Credentials;
use crate::types::{Price, Size, Symbol};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde_json::Value;

pub const EXCHANGE: &str = "binance";

const RECV_WINDOW_MS: u64 = 5_000;

/// Binance spot adapter
pub type BinanceAdapter = ExchangeConnector<BinanceClient>;

/// Binance spot REST client and ticker stream protocol
pub struct BinanceClient {
    /// Base URL for REST API
    rest_url: String,
    /// Base URL for WebSocket streams
    ws_url: String,
    credentials: Credentials,
    http_client: Client,
    symbols: SymbolMapper,
    /// Pairs streamed over the combined ticker stream
    subscriptions: Vec<Symbol>,
}

impl BinanceClient {
    pub fn new(config: &AdapterConfig) -> Self {
        Self {
            rest_url: endpoint(
                &config.rest_url,
                config.sandbox,
                "https://testnet.binance.vision",
                "https://api.binance.com",
            ),
            ws_url: endpoint(
                &config.ws_url,
                config.sandbox,
                "wss://testnet.binance.vision",
                "wss://stream.binance.com:9443",
            ),
            credentials: config.credentials(),
            http_client: http_client(config),
            symbols: SymbolMapper::new(NativeStyle::Concatenated),
            subscriptions: config.symbols.clone(),
        }
    }

    /// Hex HMAC-SHA256 of the query string
    fn sign(&self, query_string: &str) -> GatewayResult<String> {
        let (_, secret) = self.credentials.pair();
        Ok(hex::encode(hmac_sha256(EXCHANGE, &secret, query_string)?))
    }

    /// Append timestamp, recvWindow and signature to the parameters
    fn signed_query(&self, mut params: Vec<(&str, String)>) -> GatewayResult<String> {
        params.push(("timestamp", timestamp_millis().to_string()));
        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
        let query_string = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query_string)?;
        Ok(format!("{}&signature={}", query_string, signature))
    }

    fn api_key(&self) -> String {
        self.credentials.pair().0
    }

    fn ticker_from_rest(&self, json: &Value, symbol: &Symbol) -> GatewayResult<Ticker> {
        let close_time = json.get("closeTime").and_then(Value::as_i64);
        Ok(Ticker {
            symbol: symbol.clone(),
            price: Price::new(require_decimal(EXCHANGE, json, "lastPrice")?),
            bid: Price::new(require_decimal(EXCHANGE, json, "bidPrice")?),
            ask: Price::new(require_decimal(EXCHANGE, json, "askPrice")?),
            volume: Size::new(require_decimal(EXCHANGE, json, "volume")?),
            change_percent: require_decimal(EXCHANGE, json, "priceChangePercent")?,
            timestamp: millis_to_utc(close_time),
            source_exchange: EXCHANGE.to_string(),
            raw: Some(json.clone()),
        })
    }
}

#[async_trait]
impl ExchangeProtocol for BinanceClient {
    fn name(&self) -> &str {
        EXCHANGE
    }

    fn symbols(&self) -> &SymbolMapper {
        &self.symbols
    }

    async fn ping(&self) -> GatewayResult<()> {
        let url = format!("{}/api/v3/ping", self.rest_url);
        let (status, json) = send_json(EXCHANGE, self.http_client.get(&url)).await?;
        check_response(status, json, ErrorKind::TransientNetwork).map(|_| ())
    }

    async fn fetch_ticker(&self, native: &str, symbol: &Symbol) -> GatewayResult<Ticker> {
        let url = format!("{}/api/v3/ticker/24hr", self.rest_url);
        let request = self.http_client.get(&url).query(&[("symbol", native)]);
        let (status, json) = send_json(EXCHANGE, request).await?;
        let json = check_response(status, json, ErrorKind::InvalidResponse)?;
        self.ticker_from_rest(&json, symbol)
    }

    async fn fetch_balance(&self) -> GatewayResult<Balance> {
        let query = self.signed_query(Vec::new())?;
        let url = format!("{}/api/v3/account?{}", self.rest_url, query);
        let request = self
            .http_client
            .get(&url)
            .header("X-MBX-APIKEY", self.api_key());
        let (status, json) = send_json(EXCHANGE, request).await?;
        let json = check_response(status, json, ErrorKind::InvalidResponse)?;

        let balances = json
            .get("balances")
            .and_then(Value::as_array)
            .ok_or_else(|| GatewayError::invalid_response(EXCHANGE, "account has no balances"))?;
        let mut balance = Balance::new();
        for entry in balances {
            let Some(asset) = entry.get("asset").and_then(Value::as_str) else {
                continue;
            };
            let free = entry.get("free").and_then(json_decimal).unwrap_or_default();
            let locked = entry.get("locked").and_then(json_decimal).unwrap_or_default();
            balance.insert(asset, Size::new(free), Size::new(locked));
        }
        Ok(balance)
    }

    async fn submit_order(&self, order: &NativeOrder) -> GatewayResult<OrderResult> {
        let mut params = vec![
            ("symbol", order.native_symbol.clone()),
            (
                "side",
                match order.side {
                    OrderSide::Buy => "BUY".to_string(),
                    OrderSide::Sell => "SELL".to_string(),
                },
            ),
            (
                "type",
                match order.order_type {
                    OrderType::Market => "MARKET".to_string(),
                    OrderType::Limit => "LIMIT".to_string(),
                },
            ),
            ("quantity", order.quantity.normalize().to_string()),
            ("newClientOrderId", order.client_order_id.clone()),
        ];
        if order.order_type == OrderType::Limit {
            if let Some(price) = order.price {
                params.push(("price", price.value().normalize().to_string()));
            }
            params.push(("timeInForce", "GTC".to_string()));
        }

        let body = self.signed_query(params)?;
        let url = format!("{}/api/v3/order", self.rest_url);
        let request = self
            .http_client
            .post(&url)
            .header("X-MBX-APIKEY", self.api_key())
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body);
        let (status, json) = send_json(EXCHANGE, request).await?;
        let json = check_response(status, json, ErrorKind::OrderRejected)?;

        let order_id = json
            .get("orderId")
            .and_then(Value::as_i64)
            .map(|id| id.to_string())
            .ok_or_else(|| GatewayError::invalid_response(EXCHANGE, "invalid order ID in response"))?;

        // average fill price for market orders, limit price otherwise
        let executed = json.get("executedQty").and_then(json_decimal);
        let quote = json.get("cummulativeQuoteQty").and_then(json_decimal);
        let price = match (executed, quote) {
            (Some(qty), Some(quote)) if !qty.is_zero() => Some(Price::new(quote / qty)),
            _ => json
                .get("price")
                .and_then(json_decimal)
                .filter(|p| !p.is_zero())
                .map(Price::new)
                .or(order.price),
        };

        Ok(OrderResult {
            exchange: EXCHANGE.to_string(),
            order_id,
            symbol: order.symbol.clone(),
            side: order.side,
            amount: Size::new(order.amount),
            price,
            status: json
                .get("status")
                .and_then(Value::as_str)
                .map(parse_order_status)
                .unwrap_or(OrderStatus::New),
            timestamp: millis_to_utc(json.get("transactTime").and_then(Value::as_i64)),
        })
    }
}

impl StreamHandler for BinanceClient {
    fn stream_url(&self) -> String {
        let streams = self
            .subscriptions
            .iter()
            .map(|s| format!("{}@ticker", self.symbols.to_native(s).to_lowercase()))
            .collect::<Vec<_>>()
            .join("/");
        format!("{}/stream?streams={}", self.ws_url, streams)
    }

    fn subscribe_frames(&self) -> Vec<WsFrame> {
        // the combined stream URL already carries the subscriptions
        Vec::new()
    }

    fn ping_frame(&self) -> WsFrame {
        WsFrame::Ping(Vec::new())
    }

    fn is_pong(&self, frame: &WsFrame) -> bool {
        matches!(frame, WsFrame::Pong(_))
    }

    fn parse_ticker(&self, text: &str) -> Option<Ticker> {
        let json: Value = serde_json::from_str(text).ok()?;
        // combined streams wrap the event in {"stream": ..., "data": ...}
        let data = json.get("data").unwrap_or(&json);
        if data.get("e").and_then(Value::as_str) != Some("24hrTicker") {
            return None;
        }
        let symbol = self
            .symbols
            .from_native(data.get("s").and_then(Value::as_str)?)?;
        Some(Ticker {
            symbol,
            price: Price::new(data.get("c").and_then(json_decimal)?),
            bid: Price::new(data.get("b").and_then(json_decimal)?),
            ask: Price::new(data.get("a").and_then(json_decimal)?),
            volume: Size::new(data.get("v").and_then(json_decimal)?),
            change_percent: data.get("P").and_then(json_decimal)?,
            timestamp: millis_to_utc(data.get("E").and_then(Value::as_i64)),
            source_exchange: EXCHANGE.to_string(),
            raw: Some(data.clone()),
        })
    }
}

/// Map an HTTP status and Binance `{code, msg}` body to an error, or pass the body through
fn check_response(status: StatusCode, json: Value, fallback: ErrorKind) -> GatewayResult<Value> {
    let code = json.get("code").and_then(Value::as_i64);
    if status.is_success() && code.map_or(true, |c| c == 0) {
        return Ok(json);
    }
    let message = json
        .get("msg")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    let kind = match code {
        Some(-2014) | Some(-2015) | Some(-1022) => ErrorKind::Authentication,
        Some(-1003) | Some(-1015) => ErrorKind::RateLimit,
        Some(-1001) | Some(-1006) | Some(-1007) => ErrorKind::TransientNetwork,
        Some(-2010) | Some(-2011) | Some(-1013) | Some(-1111) | Some(-1121) => {
            ErrorKind::OrderRejected
        }
        _ if !status.is_success() => match classify_status(status.as_u16()) {
            // plain 4xx on a read path is a malformed request, not an order rejection
            ErrorKind::OrderRejected => fallback,
            kind => kind,
        },
        _ => fallback,
    };
    Err(GatewayError::new(
        EXCHANGE,
        kind,
        format!("{} (code {})", message, code.unwrap_or_default()),
    ))
}

fn parse_order_status(status: &str) -> OrderStatus {
    match status {
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" | "PENDING_CANCEL" => OrderStatus::Cancelled,
        "REJECTED" => OrderStatus::Rejected,
        "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Expired,
        _ => OrderStatus::New,
    }
}

fn millis_to_utc(millis: Option<i64>) -> DateTime<Utc> {
    millis
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

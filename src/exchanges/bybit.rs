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
use reqwest::{Client, RequestBuilder, StatusCode};
use rust_decimal::Decimal;
use serde_json::{json, Value};

pub const EXCHANGE: &str = "bybit";

const RECV_WINDOW_MS: u64 = 5_000;

/// Bybit spot adapter
pub type BybitAdapter = ExchangeConnector<BybitClient>;

/// Bybit v5 REST client and public spot ticker stream protocol
pub struct BybitClient {
    rest_url: String,
    ws_url: String,
    credentials: Credentials,
    http_client: Client,
    symbols: SymbolMapper,
    subscriptions: Vec<Symbol>,
}

impl BybitClient {
    pub fn new(config: &AdapterConfig) -> Self {
        Self {
            rest_url: endpoint(
                &config.rest_url,
                config.sandbox,
                "https://api-testnet.bybit.com",
                "https://api.bybit.com",
            ),
            ws_url: endpoint(
                &config.ws_url,
                config.sandbox,
                "wss://stream-testnet.bybit.com/v5/public/spot",
                "wss://stream.bybit.com/v5/public/spot",
            ),
            credentials: config.credentials(),
            http_client: http_client(config),
            symbols: SymbolMapper::new(NativeStyle::Concatenated),
            subscriptions: config.symbols.clone(),
        }
    }

    /// Hex HMAC-SHA256 of `timestamp + apiKey + recvWindow + payload`, where payload is
    /// the query string for GET and the JSON body for POST
    fn sign(&self, timestamp: i64, payload: &str) -> GatewayResult<String> {
        let (key, secret) = self.credentials.pair();
        let prehash = format!("{}{}{}{}", timestamp, key, RECV_WINDOW_MS, payload);
        Ok(hex::encode(hmac_sha256(EXCHANGE, &secret, &prehash)?))
    }

    fn authenticate(&self, request: RequestBuilder, payload: &str) -> GatewayResult<RequestBuilder> {
        let timestamp = timestamp_millis();
        let signature = self.sign(timestamp, payload)?;
        Ok(request
            .header("X-BAPI-API-KEY", self.credentials.pair().0)
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW_MS.to_string()))
    }

    /// Map a ticker object; spot stream tickers carry no book, so bid/ask fall back to last
    fn ticker_from(&self, data: &Value, symbol: Symbol, timestamp: Option<i64>) -> GatewayResult<Ticker> {
        let last = require_decimal(EXCHANGE, data, "lastPrice")?;
        let pcnt = data
            .get("price24hPcnt")
            .and_then(json_decimal)
            .unwrap_or(Decimal::ZERO);
        Ok(Ticker {
            symbol,
            price: Price::new(last),
            bid: Price::new(data.get("bid1Price").and_then(json_decimal).unwrap_or(last)),
            ask: Price::new(data.get("ask1Price").and_then(json_decimal).unwrap_or(last)),
            volume: Size::new(require_decimal(EXCHANGE, data, "volume24h")?),
            change_percent: (pcnt * Decimal::ONE_HUNDRED).round_dp(4),
            timestamp: millis_to_utc(timestamp),
            source_exchange: EXCHANGE.to_string(),
            raw: Some(data.clone()),
        })
    }
}

#[async_trait]
impl ExchangeProtocol for BybitClient {
    fn name(&self) -> &str {
        EXCHANGE
    }

    fn market_buy_in_quote(&self) -> bool {
        true
    }

    fn symbols(&self) -> &SymbolMapper {
        &self.symbols
    }

    async fn ping(&self) -> GatewayResult<()> {
        let url = format!("{}/v5/market/time", self.rest_url);
        let (status, json) = send_json(EXCHANGE, self.http_client.get(&url)).await?;
        check_response(status, json, ErrorKind::TransientNetwork).map(|_| ())
    }

    async fn fetch_ticker(&self, native: &str, symbol: &Symbol) -> GatewayResult<Ticker> {
        let url = format!("{}/v5/market/tickers", self.rest_url);
        let request = self
            .http_client
            .get(&url)
            .query(&[("category", "spot"), ("symbol", native)]);
        let (status, json) = send_json(EXCHANGE, request).await?;
        let json = check_response(status, json, ErrorKind::InvalidResponse)?;
        let data = json
            .pointer("/result/list/0")
            .ok_or_else(|| GatewayError::invalid_response(EXCHANGE, format!("no ticker for {}", native)))?;
        self.ticker_from(data, symbol.clone(), json.get("time").and_then(Value::as_i64))
    }

    async fn fetch_balance(&self) -> GatewayResult<Balance> {
        let query = "accountType=UNIFIED";
        let url = format!("{}/v5/account/wallet-balance?{}", self.rest_url, query);
        let request = self.authenticate(self.http_client.get(&url), query)?;
        let (status, json) = send_json(EXCHANGE, request).await?;
        let json = check_response(status, json, ErrorKind::InvalidResponse)?;

        let mut balance = Balance::new();
        let coins = json
            .pointer("/result/list/0/coin")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for coin in &coins {
            let Some(currency) = coin.get("coin").and_then(Value::as_str) else {
                continue;
            };
            let wallet = coin
                .get("walletBalance")
                .and_then(json_decimal)
                .unwrap_or_default();
            let locked = coin.get("locked").and_then(json_decimal).unwrap_or_default();
            let free = (wallet - locked).max(Decimal::ZERO);
            balance.insert(currency, Size::new(free), Size::new(locked));
        }
        Ok(balance)
    }

    async fn submit_order(&self, order: &NativeOrder) -> GatewayResult<OrderResult> {
        let mut body = json!({
            "category": "spot",
            "symbol": order.native_symbol,
            "side": match order.side {
                OrderSide::Buy => "Buy",
                OrderSide::Sell => "Sell",
            },
            "orderType": match order.order_type {
                OrderType::Market => "Market",
                OrderType::Limit => "Limit",
            },
            "qty": order.quantity.normalize().to_string(),
            "orderLinkId": order.client_order_id,
        });
        match (order.order_type, order.price) {
            (OrderType::Market, _) => {
                body["marketUnit"] = json!(if order.quantity_in_quote {
                    "quoteCoin"
                } else {
                    "baseCoin"
                });
            }
            (OrderType::Limit, Some(price)) => {
                body["price"] = json!(price.value().normalize().to_string());
                body["timeInForce"] = json!("GTC");
            }
            (OrderType::Limit, None) => {}
        }

        let payload = body.to_string();
        let url = format!("{}/v5/order/create", self.rest_url);
        let request = self.authenticate(
            self.http_client
                .post(&url)
                .header("Content-Type", "application/json")
                .body(payload.clone()),
            &payload,
        )?;
        let (status, json) = send_json(EXCHANGE, request).await?;
        let json = check_response(status, json, ErrorKind::OrderRejected)?;

        let order_id = json
            .pointer("/result/orderId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| GatewayError::invalid_response(EXCHANGE, "order response without orderId"))?;

        Ok(OrderResult {
            exchange: EXCHANGE.to_string(),
            order_id: order_id.to_string(),
            symbol: order.symbol.clone(),
            side: order.side,
            amount: Size::new(order.amount),
            price: order.price,
            status: OrderStatus::New,
            timestamp: millis_to_utc(json.get("time").and_then(Value::as_i64)),
        })
    }
}

impl StreamHandler for BybitClient {
    fn stream_url(&self) -> String {
        self.ws_url.clone()
    }

    fn subscribe_frames(&self) -> Vec<WsFrame> {
        let topics: Vec<String> = self
            .subscriptions
            .iter()
            .map(|s| format!("tickers.{}", self.symbols.to_native(s)))
            .collect();
        vec![WsFrame::Text(
            json!({ "op": "subscribe", "args": topics }).to_string(),
        )]
    }

    fn ping_frame(&self) -> WsFrame {
        WsFrame::Text(json!({ "op": "ping" }).to_string())
    }

    fn is_pong(&self, frame: &WsFrame) -> bool {
        let WsFrame::Text(text) = frame else {
            return false;
        };
        let Ok(json) = serde_json::from_str::<Value>(text) else {
            return false;
        };
        json.get("op").and_then(Value::as_str) == Some("pong")
            || json.get("ret_msg").and_then(Value::as_str) == Some("pong")
    }

    fn parse_ticker(&self, text: &str) -> Option<Ticker> {
        let json: Value = serde_json::from_str(text).ok()?;
        let topic = json.get("topic").and_then(Value::as_str)?;
        let native = topic.strip_prefix("tickers.")?;
        let symbol = self.symbols.from_native(native)?;
        let data = json.get("data")?;
        self.ticker_from(data, symbol, json.get("ts").and_then(Value::as_i64))
            .ok()
    }
}

/// Map an HTTP status and Bybit `{retCode, retMsg}` envelope to an error, or pass it through
fn check_response(status: StatusCode, json: Value, fallback: ErrorKind) -> GatewayResult<Value> {
    let code = json.get("retCode").and_then(Value::as_i64);
    if status.is_success() && code == Some(0) {
        return Ok(json);
    }
    let message = json
        .get("retMsg")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    let kind = match code {
        Some(10003) | Some(10004) | Some(10005) | Some(10007) | Some(33004) => {
            ErrorKind::Authentication
        }
        Some(10006) | Some(10018) => ErrorKind::RateLimit,
        Some(10000) | Some(10016) => ErrorKind::TransientNetwork,
        Some(170131) | Some(170130) | Some(170136) | Some(170140) => ErrorKind::OrderRejected,
        _ if !status.is_success() => match classify_status(status.as_u16()) {
            ErrorKind::OrderRejected => fallback,
            kind => kind,
        },
        _ => fallback,
    };
    Err(GatewayError::new(
        EXCHANGE,
        kind,
        format!("{} (retCode {})", message, code.unwrap_or_default()),
    ))
}

fn millis_to_utc(millis: Option<i64>) -> DateTime<Utc> {
    millis
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> BybitClient {
        let config = AdapterConfig::new(EXCHANGE)
            .with_credentials("bybit-api-key-012345", "bybit-secret-0123456789abcdef");
        BybitClient::new(&config)
    }

    #[test]
    fn test_sign_covers_timestamp_key_window_and_payload() {
        let client = client();
        let signature = client.sign(1_700_000_000_000, "accountType=UNIFIED").unwrap();
        let expected = hex::encode(
            hmac_sha256(
                EXCHANGE,
                "bybit-secret-0123456789abcdef",
                "1700000000000bybit-api-key-0123455000accountType=UNIFIED",
            )
            .unwrap(),
        );
        assert_eq!(signature, expected);
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn test_parse_stream_ticker_without_book() {
        let text = r#"{"topic":"tickers.BTCUSDT","ts":1700000000000,"type":"snapshot","data":{"symbol":"BTCUSDT","lastPrice":"67500","volume24h":"1200.5","price24hPcnt":"-0.0475"}}"#;
        let ticker = client().parse_ticker(text).unwrap();
        assert_eq!(ticker.symbol, Symbol::new("BTC", "USDT"));
        assert_eq!(ticker.bid, ticker.price);
        assert_eq!(ticker.change_percent, Decimal::new(-475, 2));
    }

    #[test]
    fn test_pong_detection() {
        let client = client();
        assert!(client.is_pong(&WsFrame::Text(
            r#"{"success":true,"ret_msg":"pong","conn_id":"abc","op":"ping"}"#.into()
        )));
        assert!(client.is_pong(&WsFrame::Text(r#"{"op":"pong","args":["1"]}"#.into())));
        assert!(!client.is_pong(&WsFrame::Pong(Vec::new())));
    }

    #[test]
    fn test_ret_code_table() {
        let err = check_response(
            StatusCode::OK,
            json!({"retCode": 170131, "retMsg": "Insufficient balance.", "result": {}}),
            ErrorKind::OrderRejected,
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::OrderRejected);

        let auth = check_response(
            StatusCode::OK,
            json!({"retCode": 10003, "retMsg": "API key is invalid."}),
            ErrorKind::InvalidResponse,
        )
        .unwrap_err();
        assert_eq!(auth.kind, ErrorKind::Authentication);
    }
}

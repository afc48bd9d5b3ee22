use crate::config::AdapterConfig;
use crate::core::{Balance, OrderResult, OrderSide, OrderStatus, OrderType, Ticker};
use crate::exchanges::adapter::{
    endpoint, hmac_sha256, http_client, json_decimal, require_decimal, send_json,
    ExchangeConnector, ExchangeProtocol, NativeOrder,
};
use crate::exchanges::connection_manager::StreamHandler;
use crate::exchanges::error::{classify_status, ErrorKind, GatewayError, GatewayResult};
use crate::exchanges::symbols::{NativeStyle, SymbolMapper};
use crate::exchanges::transport::WsFrame;
use crate::security::Credentials;
use crate::types::{Price, Size, Symbol};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};

pub const EXCHANGE: &str = "okx";

/// OKX spot adapter
pub type OkxAdapter = ExchangeConnector<OkxClient>;

/// OKX v5 REST client and public ticker stream protocol
pub struct OkxClient {
    rest_url: String,
    ws_url: String,
    credentials: Credentials,
    /// Demo trading: same REST host, flagged by header
    simulated: bool,
    http_client: Client,
    symbols: SymbolMapper,
    subscriptions: Vec<Symbol>,
}

impl OkxClient {
    pub fn new(config: &AdapterConfig) -> Self {
        Self {
            rest_url: endpoint(
                &config.rest_url,
                config.sandbox,
                "https://www.okx.com",
                "https://www.okx.com",
            ),
            ws_url: endpoint(
                &config.ws_url,
                config.sandbox,
                "wss://wspap.okx.com:8443/ws/v5/public",
                "wss://ws.okx.com:8443/ws/v5/public",
            ),
            credentials: config.credentials(),
            simulated: config.sandbox,
            http_client: http_client(config),
            symbols: SymbolMapper::new(NativeStyle::Separated("-")),
            subscriptions: config.symbols.clone(),
        }
    }

    /// Base64 HMAC-SHA256 of `timestamp + method + requestPath + body`
    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> GatewayResult<String> {
        let (_, secret) = self.credentials.pair();
        let prehash = format!("{}{}{}{}", timestamp, method, path, body);
        Ok(general_purpose::STANDARD.encode(hmac_sha256(EXCHANGE, &secret, &prehash)?))
    }

    /// Build a request; `path` includes the query string. Private calls carry the
    /// OK-ACCESS-* headers.
    fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        private: bool,
    ) -> GatewayResult<RequestBuilder> {
        let body_text = body.map(Value::to_string).unwrap_or_default();
        let mut request = self
            .http_client
            .request(method.clone(), format!("{}{}", self.rest_url, path));
        if private {
            let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            let signature = self.sign(&timestamp, method.as_str(), path, &body_text)?;
            request = request
                .header("OK-ACCESS-KEY", self.credentials.pair().0)
                .header("OK-ACCESS-SIGN", signature)
                .header("OK-ACCESS-TIMESTAMP", timestamp)
                .header("OK-ACCESS-PASSPHRASE", self.credentials.passphrase());
        }
        if self.simulated {
            request = request.header("x-simulated-trading", "1");
        }
        if body.is_some() {
            request = request
                .header("Content-Type", "application/json")
                .body(body_text);
        }
        Ok(request)
    }

    fn ticker_from(&self, data: &Value, symbol: Symbol) -> GatewayResult<Ticker> {
        let last = require_decimal(EXCHANGE, data, "last")?;
        let open = data
            .get("open24h")
            .and_then(json_decimal)
            .unwrap_or(Decimal::ZERO);
        Ok(Ticker {
            symbol,
            price: Price::new(last),
            bid: Price::new(require_decimal(EXCHANGE, data, "bidPx")?),
            ask: Price::new(require_decimal(EXCHANGE, data, "askPx")?),
            volume: Size::new(require_decimal(EXCHANGE, data, "vol24h")?),
            change_percent: change_percent(last, open),
            timestamp: millis_to_utc(data.get("ts").and_then(json_decimal)),
            source_exchange: EXCHANGE.to_string(),
            raw: Some(data.clone()),
        })
    }
}

#[async_trait]
impl ExchangeProtocol for OkxClient {
    fn name(&self) -> &str {
        EXCHANGE
    }

    fn requires_passphrase(&self) -> bool {
        true
    }

    fn market_buy_in_quote(&self) -> bool {
        true
    }

    fn symbols(&self) -> &SymbolMapper {
        &self.symbols
    }

    async fn ping(&self) -> GatewayResult<()> {
        let request = self.request(Method::GET, "/api/v5/public/time", None, false)?;
        let (status, json) = send_json(EXCHANGE, request).await?;
        check_response(status, json, ErrorKind::TransientNetwork).map(|_| ())
    }

    async fn fetch_ticker(&self, native: &str, symbol: &Symbol) -> GatewayResult<Ticker> {
        let path = format!("/api/v5/market/ticker?instId={}", native);
        let request = self.request(Method::GET, &path, None, false)?;
        let (status, json) = send_json(EXCHANGE, request).await?;
        let data = first_data(check_response(status, json, ErrorKind::InvalidResponse)?)?;
        self.ticker_from(&data, symbol.clone())
    }

    async fn fetch_balance(&self) -> GatewayResult<Balance> {
        let request = self.request(Method::GET, "/api/v5/account/balance", None, true)?;
        let (status, json) = send_json(EXCHANGE, request).await?;
        let data = first_data(check_response(status, json, ErrorKind::InvalidResponse)?)?;

        let mut balance = Balance::new();
        let details = data
            .get("details")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for entry in &details {
            let Some(currency) = entry.get("ccy").and_then(Value::as_str) else {
                continue;
            };
            let free = entry.get("availBal").and_then(json_decimal).unwrap_or_default();
            let locked = entry.get("frozenBal").and_then(json_decimal).unwrap_or_default();
            balance.insert(currency, Size::new(free), Size::new(locked));
        }
        Ok(balance)
    }

    async fn submit_order(&self, order: &NativeOrder) -> GatewayResult<OrderResult> {
        let mut body = json!({
            "instId": order.native_symbol,
            "tdMode": "cash",
            "side": match order.side {
                OrderSide::Buy => "buy",
                OrderSide::Sell => "sell",
            },
            "ordType": match order.order_type {
                OrderType::Market => "market",
                OrderType::Limit => "limit",
            },
            "sz": order.quantity.normalize().to_string(),
            "clOrdId": order.client_order_id,
        });
        if order.order_type == OrderType::Market {
            body["tgtCcy"] = json!(if order.quantity_in_quote {
                "quote_ccy"
            } else {
                "base_ccy"
            });
        }
        if let (OrderType::Limit, Some(price)) = (order.order_type, order.price) {
            body["px"] = json!(price.value().normalize().to_string());
        }

        let request = self.request(Method::POST, "/api/v5/trade/order", Some(&body), true)?;
        let (status, json) = send_json(EXCHANGE, request).await?;
        let data = first_data(check_response(status, json, ErrorKind::OrderRejected)?)?;

        let order_id = data
            .get("ordId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| GatewayError::invalid_response(EXCHANGE, "order response without ordId"))?;

        Ok(OrderResult {
            exchange: EXCHANGE.to_string(),
            order_id: order_id.to_string(),
            symbol: order.symbol.clone(),
            side: order.side,
            amount: Size::new(order.amount),
            price: order.price,
            status: OrderStatus::New,
            timestamp: millis_to_utc(data.get("ts").and_then(json_decimal)),
        })
    }
}

impl StreamHandler for OkxClient {
    fn stream_url(&self) -> String {
        self.ws_url.clone()
    }

    fn subscribe_frames(&self) -> Vec<WsFrame> {
        let args: Vec<Value> = self
            .subscriptions
            .iter()
            .map(|s| json!({ "channel": "tickers", "instId": self.symbols.to_native(s) }))
            .collect();
        vec![WsFrame::Text(
            json!({ "op": "subscribe", "args": args }).to_string(),
        )]
    }

    fn ping_frame(&self) -> WsFrame {
        WsFrame::Text("ping".to_string())
    }

    fn is_pong(&self, frame: &WsFrame) -> bool {
        matches!(frame, WsFrame::Text(text) if text == "pong")
    }

    fn parse_ticker(&self, text: &str) -> Option<Ticker> {
        let json: Value = serde_json::from_str(text).ok()?;
        let arg = json.get("arg")?;
        if arg.get("channel").and_then(Value::as_str) != Some("tickers") {
            return None;
        }
        let data = json.get("data")?.as_array()?.first()?;
        let symbol = self
            .symbols
            .from_native(data.get("instId").and_then(Value::as_str)?)?;
        self.ticker_from(data, symbol).ok()
    }
}

/// Map an HTTP status and OKX `{code, msg, data}` envelope to an error, or pass it through.
/// Order endpoints report per-order failures in `data[0].sCode`.
fn check_response(status: StatusCode, json: Value, fallback: ErrorKind) -> GatewayResult<Value> {
    let code = json
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let item = json
        .get("data")
        .and_then(Value::as_array)
        .and_then(|d| d.first());
    let s_code = item
        .and_then(|d| d.get("sCode"))
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty() && *c != "0");

    if status.is_success() && code == "0" && s_code.is_none() {
        return Ok(json);
    }

    let effective = s_code.unwrap_or(code.as_str());
    let message = item
        .and_then(|d| d.get("sMsg"))
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .or_else(|| json.get("msg").and_then(Value::as_str))
        .unwrap_or("unknown error");
    let kind = match effective {
        "50100" | "50101" | "50102" | "50103" | "50104" | "50105" | "50111" | "50112"
        | "50113" | "50114" => ErrorKind::Authentication,
        "50011" | "50061" => ErrorKind::RateLimit,
        "50001" | "50004" | "50013" | "50026" => ErrorKind::TransientNetwork,
        "51000" | "51001" | "51008" | "51020" | "51119" | "51121" => ErrorKind::OrderRejected,
        _ if !status.is_success() => match classify_status(status.as_u16()) {
            ErrorKind::OrderRejected => fallback,
            kind => kind,
        },
        _ => fallback,
    };
    Err(GatewayError::new(
        EXCHANGE,
        kind,
        format!("{} (code {})", message, effective),
    ))
}

fn first_data(json: Value) -> GatewayResult<Value> {
    json.get("data")
        .and_then(Value::as_array)
        .and_then(|d| d.first())
        .cloned()
        .ok_or_else(|| GatewayError::invalid_response(EXCHANGE, "response without data"))
}

/// 24h change in percent from last and open prices
fn change_percent(last: Decimal, open: Decimal) -> Decimal {
    if open.is_zero() {
        return Decimal::ZERO;
    }
    ((last - open) / open * Decimal::ONE_HUNDRED).round_dp(4)
}

/// OKX sends millisecond timestamps as strings
fn millis_to_utc(millis: Option<Decimal>) -> DateTime<Utc> {
    millis
        .and_then(|ms| ms.trunc().to_i64())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> OkxClient {
        let config = AdapterConfig::new(EXCHANGE)
            .with_credentials("okx-api-key-0123456789", "okx-secret-0123456789abcdef")
            .with_passphrase("pass");
        OkxClient::new(&config)
    }

    #[test]
    fn test_sign_is_base64_of_prehash() {
        let client = client();
        let signature = client
            .sign("2020-12-08T09:08:57.715Z", "GET", "/api/v5/account/balance", "")
            .unwrap();
        let expected = general_purpose::STANDARD.encode(
            hmac_sha256(
                EXCHANGE,
                "okx-secret-0123456789abcdef",
                "2020-12-08T09:08:57.715ZGET/api/v5/account/balance",
            )
            .unwrap(),
        );
        assert_eq!(signature, expected);
        assert_eq!(general_purpose::STANDARD.decode(signature).unwrap().len(), 32);
    }

    #[test]
    fn test_change_percent_from_open() {
        let change = change_percent(Decimal::new(67500, 0), Decimal::new(70866, 0));
        assert_eq!(change, Decimal::new(-47498, 4));
        assert_eq!(change_percent(Decimal::ONE, Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_subscribe_and_parse_stream_ticker() {
        let client = client();
        let frames = client.subscribe_frames();
        let WsFrame::Text(subscribe) = &frames[0] else {
            panic!("expected text frame");
        };
        assert!(subscribe.contains(r#""instId":"BTC-USDT""#));

        let text = r#"{"arg":{"channel":"tickers","instId":"ETH-USDT"},"data":[{"instId":"ETH-USDT","last":"3500.5","bidPx":"3500.4","askPx":"3500.6","vol24h":"1000","open24h":"3400","ts":"1700000000000"}]}"#;
        let ticker = client.parse_ticker(text).unwrap();
        assert_eq!(ticker.symbol, Symbol::new("ETH", "USDT"));
        assert_eq!(ticker.ask, Price::new(Decimal::new(35006, 1)));
        assert!(client.is_pong(&WsFrame::Text("pong".into())));
        assert!(client.parse_ticker("pong").is_none());
    }

    #[test]
    fn test_order_error_uses_s_code() {
        let body = json!({
            "code": "1",
            "msg": "Operation failed.",
            "data": [{"ordId": "", "sCode": "51008", "sMsg": "Order failed. Insufficient USDT balance in account."}]
        });
        let err = check_response(StatusCode::OK, body, ErrorKind::OrderRejected).unwrap_err();
        assert_eq!(err.kind, ErrorKind::OrderRejected);
        assert!(err.message.contains("Insufficient USDT"));

        let auth = check_response(
            StatusCode::UNAUTHORIZED,
            json!({"code": "50113", "msg": "Invalid Sign", "data": []}),
            ErrorKind::InvalidResponse,
        )
        .unwrap_err();
        assert_eq!(auth.kind, ErrorKind::Authentication);
    }
}

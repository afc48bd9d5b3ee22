pub mod config;
pub mod core;
pub mod exchanges;
pub mod gateway;
pub mod logging;
pub mod market_data;
pub mod monitoring;
pub mod realtime;
pub mod security;
pub mod types;

pub use crate::config::{AdapterConfig, CacheConfig, GatewayConfig, ResilienceConfig};
pub use crate::core::{
    AssetBalance, Balance, GatewayEvent, OrderRequest, OrderResult, OrderSide, OrderStatus,
    OrderType, Ticker,
};
pub use crate::exchanges::{
    ConnectionState, ErrorKind, ExchangeAdapter, ExchangeRegistry, GatewayError, GatewayResult,
    InitializationReport,
};
pub use crate::gateway::{ExchangeStatus, RestartOutcome, TradingGateway};
pub use crate::logging::init_logging;
pub use crate::market_data::MarketDataCache;
pub use crate::monitoring::HealthStatus;
pub use crate::types::{Price, Size, Symbol};

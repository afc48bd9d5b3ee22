//! Exchange connectivity: adapters, their streaming resilience layer and the registry.

pub mod adapter;
pub mod binance;
pub mod bybit;
pub mod connection_manager;
pub mod error;
pub mod mock;
pub mod okx;
pub mod rate_limiter;
pub mod registry;
pub mod symbols;
pub mod transport;

pub use adapter::{ExchangeAdapter, ExchangeConnector, ExchangeFeatures, ExchangeProtocol};
pub use binance::{BinanceAdapter, BinanceClient};
pub use bybit::{BybitAdapter, BybitClient};
pub use connection_manager::{ConnectionManager, ConnectionState, ConnectionStateMachine};
pub use error::{ErrorKind, GatewayError, GatewayResult};
pub use mock::{MockAdapterFactory, MockExchangeAdapter, MockStreamHandler, MockTransport};
pub use okx::{OkxAdapter, OkxClient};
pub use registry::{AdapterFactory, DefaultAdapterFactory, ExchangeRegistry, InitializationReport};
pub use transport::{StreamTransport, TungsteniteTransport, WsFrame};

pub mod events;

pub use events::{
    AssetBalance, Balance, GatewayEvent, OrderRequest, OrderResult, OrderSide, OrderStatus,
    OrderType, Ticker, PUBLIC_SOURCE,
};

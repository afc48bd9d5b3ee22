pub mod cache;
pub mod fallback;

pub use cache::{CachedTicker, MarketDataCache};
pub use fallback::{FallbackSource, PublicPriceAggregator};

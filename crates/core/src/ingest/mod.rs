pub mod cached;
pub mod provider;
pub mod types;

pub use cached::CachedMarketData;
pub use provider::{HttpMarketData, MarketData};

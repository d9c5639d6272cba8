// Layer 1 - Data Connectors for Binance Futures
// Rate-limited REST snapshots and decoded event stream sources

pub mod memory_source;
pub mod rate_limiter;
pub mod rest_client;
pub mod stream;

// Re-export commonly used items for convenience
pub use memory_source::{CallCounts, InMemoryMarketData};
pub use rate_limiter::{RateLimitError, RateLimiter, RateLimiterStats, TierInfo};
pub use rest_client::{BinanceRestClient, MarketDataSource, RestClientError, RestClientStats};
pub use stream::{
    ChannelSource, ChannelSourceStats, EventStreamSource, StreamError, StreamKind,
    StreamRequest, StreamSubscription,
};

// Market Cache - Locally synchronized Binance futures market data
// Rate-limited REST baselines reconciled with ordered stream events

pub mod core;
pub mod layer1;
pub mod layer2;

pub use crate::core::{
    setup_logging, setup_logging_from_config, Candlestick, DepthEvent, KlineInterval,
    OrderBookSnapshot, OutOfSync, OutOfSyncReason, PriceLevel, SyncStatus, TradeRecord,
};
pub use crate::layer1::{
    BinanceRestClient, ChannelSource, EventStreamSource, InMemoryMarketData, MarketDataSource,
    RateLimiter, StreamRequest,
};
pub use crate::layer2::{
    CandlestickCache, OrderBookCache, OrderBookSettings, SyncError, TradeKind, TradeWindowCache,
    UnifiedMetrics,
};

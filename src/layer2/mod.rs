// Layer 2 - Ordered Dispatch & Synchronized Caches
// Pure Rust - applies stream events in order and keeps caches consistent with REST baselines

pub mod dispatcher;
pub mod orderbook;
pub mod trades;
pub mod candles;
pub mod metrics;

// Re-export commonly used items
pub use dispatcher::{
    ApplyEvent, ApplyOutcome, DispatcherStats, OrderedDispatcher, SyncError, UpdateCallback,
};
pub use orderbook::{
    OrderBookCache, OrderBookMode, OrderBookSettings, OrderBookStats, OrderBookSummary,
    OrderBookSync,
};
pub use trades::{
    TradeKind, TradeWindowCache, TradeWindowStats, TradeWindowSummary, TradeWindowSync,
    DEFAULT_TRADE_WINDOW,
};
pub use candles::{CandleSeriesStats, CandleSeriesSync, CandlestickCache, DEFAULT_CANDLE_WINDOW};
pub use metrics::UnifiedMetrics;

// In-Memory Market Data Source
// Scripted REST responses for replay and tests; same weights and limiter as the live client

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::types::{Candlestick, KlineInterval, OrderBookSnapshot, TradeRecord};
use crate::layer1::rate_limiter::{RateLimitError, RateLimiter};
use crate::layer1::rest_client::{
    depth_weight, klines_weight, MarketDataSource, RestClientError, AGG_TRADES_WEIGHT, TRADES_WEIGHT,
};

type Scripted<T> = Mutex<VecDeque<Result<T, String>>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub order_book: u32,
    pub trades: u32,
    pub aggregate_trades: u32,
    pub candles: u32,
}

impl fmt::Display for CallCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CallCounts(depth={}, trades={}, aggTrades={}, klines={})",
            self.order_book, self.trades, self.aggregate_trades, self.candles
        )
    }
}

/// `MarketDataSource` answering from queues of scripted responses.
///
/// Each call pops the next response for its kind; an empty queue answers
/// with an API error. Results are truncated to the requested limit the way
/// the exchange does (most recent entries kept).
pub struct InMemoryMarketData {
    limiter: Option<Arc<RateLimiter>>,
    latency: Duration,
    order_books: Scripted<OrderBookSnapshot>,
    trades: Scripted<Vec<TradeRecord>>,
    aggregate_trades: Scripted<Vec<TradeRecord>>,
    candles: Scripted<Vec<Candlestick>>,
    calls: Mutex<CallCounts>,
}

impl InMemoryMarketData {
    pub fn new() -> Self {
        Self {
            limiter: None,
            latency: Duration::ZERO,
            order_books: Mutex::new(VecDeque::new()),
            trades: Mutex::new(VecDeque::new()),
            aggregate_trades: Mutex::new(VecDeque::new()),
            candles: Mutex::new(VecDeque::new()),
            calls: Mutex::new(CallCounts::default()),
        }
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Simulated round-trip time; the wait observes cancellation
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn push_order_book(&self, snapshot: OrderBookSnapshot) {
        self.order_books.lock().push_back(Ok(snapshot));
    }

    pub fn push_order_book_error(&self, message: &str) {
        self.order_books.lock().push_back(Err(message.to_string()));
    }

    pub fn push_trades(&self, trades: Vec<TradeRecord>) {
        self.trades.lock().push_back(Ok(trades));
    }

    pub fn push_trades_error(&self, message: &str) {
        self.trades.lock().push_back(Err(message.to_string()));
    }

    pub fn push_aggregate_trades(&self, trades: Vec<TradeRecord>) {
        self.aggregate_trades.lock().push_back(Ok(trades));
    }

    pub fn push_aggregate_trades_error(&self, message: &str) {
        self.aggregate_trades.lock().push_back(Err(message.to_string()));
    }

    pub fn push_candles(&self, candles: Vec<Candlestick>) {
        self.candles.lock().push_back(Ok(candles));
    }

    pub fn push_candles_error(&self, message: &str) {
        self.candles.lock().push_back(Err(message.to_string()));
    }

    pub fn call_counts(&self) -> CallCounts {
        *self.calls.lock()
    }

    async fn admit(&self, weight: u32, cancel: &CancellationToken) -> Result<(), RestClientError> {
        if let Some(limiter) = &self.limiter {
            limiter.delay(weight, cancel).await.map_err(|e| match e {
                RateLimitError::Cancelled => RestClientError::Cancelled,
                other => RestClientError::RateLimit(other),
            })?;
        }

        if !self.latency.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(RestClientError::Cancelled),
                _ = tokio::time::sleep(self.latency) => {}
            }
        } else if cancel.is_cancelled() {
            return Err(RestClientError::Cancelled);
        }
        Ok(())
    }

    fn pop_response<T>(queue: &Scripted<T>, endpoint: &str) -> Result<T, RestClientError> {
        match queue.lock().pop_front() {
            Some(Ok(value)) => Ok(value),
            Some(Err(message)) => Err(RestClientError::Api { code: -1000, message }),
            None => {
                debug!(endpoint = endpoint, "No scripted response");
                Err(RestClientError::Api {
                    code: -1000,
                    message: format!("no scripted response for {}", endpoint),
                })
            }
        }
    }
}

impl Default for InMemoryMarketData {
    fn default() -> Self {
        Self::new()
    }
}

fn keep_last<T>(mut items: Vec<T>, limit: u32) -> Vec<T> {
    let limit = limit as usize;
    if items.len() > limit {
        items.drain(..items.len() - limit);
    }
    items
}

#[async_trait]
impl MarketDataSource for InMemoryMarketData {
    async fn fetch_order_book(
        &self,
        _symbol: &str,
        depth: u32,
        cancel: &CancellationToken,
    ) -> Result<OrderBookSnapshot, RestClientError> {
        self.calls.lock().order_book += 1;
        self.admit(depth_weight(depth), cancel).await?;

        let mut snapshot = Self::pop_response(&self.order_books, "depth")?;
        snapshot.bids.truncate(depth as usize);
        snapshot.asks.truncate(depth as usize);
        Ok(snapshot)
    }

    async fn fetch_recent_trades(
        &self,
        _symbol: &str,
        limit: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<TradeRecord>, RestClientError> {
        self.calls.lock().trades += 1;
        self.admit(TRADES_WEIGHT, cancel).await?;
        Ok(keep_last(Self::pop_response(&self.trades, "trades")?, limit))
    }

    async fn fetch_recent_aggregate_trades(
        &self,
        _symbol: &str,
        limit: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<TradeRecord>, RestClientError> {
        self.calls.lock().aggregate_trades += 1;
        self.admit(AGG_TRADES_WEIGHT, cancel).await?;
        Ok(keep_last(Self::pop_response(&self.aggregate_trades, "aggTrades")?, limit))
    }

    async fn fetch_recent_candlesticks(
        &self,
        _symbol: &str,
        _interval: KlineInterval,
        limit: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<Candlestick>, RestClientError> {
        self.calls.lock().candles += 1;
        self.admit(klines_weight(limit), cancel).await?;
        Ok(keep_last(Self::pop_response(&self.candles, "klines")?, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PriceLevel;

    fn trades(ids: std::ops::RangeInclusive<i64>) -> Vec<TradeRecord> {
        ids.map(|id| TradeRecord::new("BTCUSDT", id, 100.0, 1.0, id * 1000, false))
            .collect()
    }

    #[tokio::test]
    async fn test_scripted_responses_in_order() {
        let source = InMemoryMarketData::new();
        source.push_trades(trades(1..=3));
        source.push_trades_error("teapot");
        let cancel = CancellationToken::new();

        let first = source.fetch_recent_trades("BTCUSDT", 10, &cancel).await.unwrap();
        assert_eq!(first.len(), 3);

        let second = source.fetch_recent_trades("BTCUSDT", 10, &cancel).await;
        assert!(matches!(second, Err(RestClientError::Api { .. })));

        let third = source.fetch_recent_trades("BTCUSDT", 10, &cancel).await;
        assert!(third.is_err());
        assert_eq!(source.call_counts().trades, 3);
    }

    #[tokio::test]
    async fn test_aggregate_trades_scripted_error() {
        let source = InMemoryMarketData::new();
        source.push_aggregate_trades_error("maintenance");
        source.push_aggregate_trades(trades(5..=6));
        let cancel = CancellationToken::new();

        let failed = source.fetch_recent_aggregate_trades("BTCUSDT", 10, &cancel).await;
        assert!(matches!(failed, Err(RestClientError::Api { code: -1000, .. })));

        let ok = source.fetch_recent_aggregate_trades("BTCUSDT", 10, &cancel).await.unwrap();
        assert_eq!(ok.len(), 2);
        assert_eq!(source.call_counts().aggregate_trades, 2);
    }

    #[tokio::test]
    async fn test_limit_keeps_most_recent() {
        let source = InMemoryMarketData::new();
        source.push_trades(trades(1..=10));
        let cancel = CancellationToken::new();

        let result = source.fetch_recent_trades("BTCUSDT", 4, &cancel).await.unwrap();
        let ids: Vec<i64> = result.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![7, 8, 9, 10]);
    }

    #[tokio::test]
    async fn test_depth_truncated() {
        let source = InMemoryMarketData::new();
        let bids = (0..10).map(|i| PriceLevel::new(100.0 - i as f64, 1.0)).collect();
        source.push_order_book(OrderBookSnapshot::new("BTCUSDT".to_string(), 1, bids, vec![], 0));

        let snapshot = source
            .fetch_order_book("BTCUSDT", 5, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(snapshot.bids.len(), 5);
        assert_eq!(snapshot.bids[0].price, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_pass_through_rate_limiter() {
        let limiter = Arc::new(RateLimiter::new());
        limiter.configure("weight", 10, Duration::from_secs(1)).unwrap();
        let source = InMemoryMarketData::new().with_rate_limiter(Arc::clone(&limiter));
        source.push_trades(trades(1..=1));
        source.push_trades(trades(1..=1));
        source.push_trades(trades(1..=1));
        let cancel = CancellationToken::new();

        let start = tokio::time::Instant::now();
        for _ in 0..3 {
            source.fetch_recent_trades("BTCUSDT", 1, &cancel).await.unwrap();
        }
        // weight 5 each: the third call waits for the window
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(limiter.get_stats().admitted_weight, 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_observes_cancellation() {
        let source = InMemoryMarketData::new().with_latency(Duration::from_secs(5));
        source.push_candles(vec![]);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result = source
            .fetch_recent_candlesticks("BTCUSDT", KlineInterval::OneMinute, 10, &cancel)
            .await;
        assert!(matches!(result, Err(RestClientError::Cancelled)));
    }
}

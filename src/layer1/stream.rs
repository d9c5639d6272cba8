// Event Stream Sources
// Decoded market events delivered per stream name over unbounded channels

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::types::KlineInterval;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Invalid stream request: {0}")]
    InvalidRequest(String),
}

// ============================================================================
// Stream Requests
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Diff depth stream, or top-N partial depth when `levels` is set
    Depth { levels: Option<u32> },
    Trades,
    AggregateTrades,
    Candles { interval: KlineInterval },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamRequest {
    pub symbol: String,
    pub kind: StreamKind,
}

impl StreamRequest {
    pub fn new(symbol: &str, kind: StreamKind) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            kind,
        }
    }

    pub fn depth(symbol: &str) -> Self {
        Self::new(symbol, StreamKind::Depth { levels: None })
    }

    pub fn partial_depth(symbol: &str, levels: u32) -> Self {
        Self::new(symbol, StreamKind::Depth { levels: Some(levels) })
    }

    pub fn trades(symbol: &str) -> Self {
        Self::new(symbol, StreamKind::Trades)
    }

    pub fn aggregate_trades(symbol: &str) -> Self {
        Self::new(symbol, StreamKind::AggregateTrades)
    }

    pub fn candles(symbol: &str, interval: KlineInterval) -> Self {
        Self::new(symbol, StreamKind::Candles { interval })
    }

    /// Exchange stream name, e.g. `btcusdt@depth@100ms` or `btcusdt@kline_1m`
    pub fn stream_name(&self) -> String {
        let symbol = self.symbol.to_lowercase();
        match self.kind {
            StreamKind::Depth { levels: None } => format!("{}@depth@100ms", symbol),
            StreamKind::Depth { levels: Some(n) } => format!("{}@depth{}@100ms", symbol, n),
            StreamKind::Trades => format!("{}@trade", symbol),
            StreamKind::AggregateTrades => format!("{}@aggTrade", symbol),
            StreamKind::Candles { interval } => format!("{}@kline_{}", symbol, interval),
        }
    }
}

impl fmt::Display for StreamRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stream_name())
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Live feed of decoded events for one stream.
///
/// `multiplexed` is set when the underlying connection carries other streams
/// too, so delivery order across reconnects is not guaranteed per stream.
/// Cancelling `cancel` (or dropping `events`) ends the subscription.
pub struct StreamSubscription<E> {
    pub stream_name: String,
    pub events: mpsc::UnboundedReceiver<E>,
    pub multiplexed: bool,
    pub cancel: CancellationToken,
}

impl<E> StreamSubscription<E> {
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.events.close();
    }
}

#[async_trait]
pub trait EventStreamSource<E: Send + 'static>: Send + Sync {
    async fn subscribe(&self, request: &StreamRequest) -> Result<StreamSubscription<E>, StreamError>;
}

// ============================================================================
// Channel Source
// ============================================================================

struct Route<E> {
    tx: mpsc::UnboundedSender<E>,
    cancel: CancellationToken,
}

impl<E> Route<E> {
    fn is_live(&self) -> bool {
        !self.tx.is_closed() && !self.cancel.is_cancelled()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChannelSourceStats {
    pub subscriptions_opened: u64,
    pub events_published: u64,
    pub events_delivered: u64,
}

/// In-process stream source: producers publish already-decoded events by
/// stream name and every live subscription to that name receives a copy.
pub struct ChannelSource<E> {
    multiplexed: bool,
    routes: RwLock<HashMap<String, Vec<Route<E>>>>,
    stats: RwLock<ChannelSourceStats>,
}

impl<E: Clone + Send + 'static> ChannelSource<E> {
    /// One connection per stream
    pub fn new() -> Self {
        Self::with_multiplexing(false)
    }

    /// Combined connection; subscriptions are flagged as multiplexed
    pub fn combined() -> Self {
        Self::with_multiplexing(true)
    }

    fn with_multiplexing(multiplexed: bool) -> Self {
        Self {
            multiplexed,
            routes: RwLock::new(HashMap::new()),
            stats: RwLock::new(ChannelSourceStats::default()),
        }
    }

    /// Deliver `event` to every live subscription of `stream_name`.
    /// Returns the number of subscriptions reached.
    pub fn publish(&self, stream_name: &str, event: E) -> usize {
        let mut routes = self.routes.write();
        let delivered = match routes.get_mut(stream_name) {
            Some(list) => {
                list.retain(|route| route.is_live());
                list.iter()
                    .filter(|route| route.tx.send(event.clone()).is_ok())
                    .count()
            }
            None => 0,
        };
        drop(routes);

        let mut stats = self.stats.write();
        stats.events_published += 1;
        stats.events_delivered += delivered as u64;
        delivered
    }

    /// End every subscription of `stream_name`
    pub fn close(&self, stream_name: &str) {
        if let Some(list) = self.routes.write().remove(stream_name) {
            for route in list {
                route.cancel.cancel();
            }
            info!(stream = stream_name, "Stream closed");
        }
    }

    pub fn subscriber_count(&self, stream_name: &str) -> usize {
        self.routes
            .read()
            .get(stream_name)
            .map(|list| list.iter().filter(|route| route.is_live()).count())
            .unwrap_or(0)
    }

    pub fn get_stats(&self) -> ChannelSourceStats {
        self.stats.read().clone()
    }
}

impl<E: Clone + Send + 'static> Default for ChannelSource<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E: Clone + Send + 'static> EventStreamSource<E> for ChannelSource<E> {
    async fn subscribe(&self, request: &StreamRequest) -> Result<StreamSubscription<E>, StreamError> {
        if request.symbol.trim().is_empty() {
            return Err(StreamError::InvalidRequest("symbol must not be empty".to_string()));
        }

        let stream_name = request.stream_name();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        self.routes
            .write()
            .entry(stream_name.clone())
            .or_default()
            .push(Route { tx, cancel: cancel.clone() });
        self.stats.write().subscriptions_opened += 1;

        debug!(stream = %stream_name, multiplexed = self.multiplexed, "Stream subscribed");

        Ok(StreamSubscription {
            stream_name,
            events: rx,
            multiplexed: self.multiplexed,
            cancel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_names() {
        assert_eq!(StreamRequest::depth("BTCUSDT").stream_name(), "btcusdt@depth@100ms");
        assert_eq!(StreamRequest::partial_depth("btcusdt", 20).stream_name(), "btcusdt@depth20@100ms");
        assert_eq!(StreamRequest::trades("ETHUSDT").stream_name(), "ethusdt@trade");
        assert_eq!(StreamRequest::aggregate_trades("ETHUSDT").stream_name(), "ethusdt@aggTrade");
        assert_eq!(
            StreamRequest::candles("BTCUSDT", KlineInterval::OneMonth).stream_name(),
            "btcusdt@kline_1M"
        );
    }

    #[tokio::test]
    async fn test_publish_routes_by_name() {
        let source: ChannelSource<u64> = ChannelSource::new();
        let mut trades = source.subscribe(&StreamRequest::trades("BTCUSDT")).await.unwrap();
        let mut depth = source.subscribe(&StreamRequest::depth("BTCUSDT")).await.unwrap();
        assert!(!trades.multiplexed);

        assert_eq!(source.publish("btcusdt@trade", 1), 1);
        assert_eq!(source.publish("btcusdt@depth@100ms", 2), 1);
        assert_eq!(source.publish("btcusdt@aggTrade", 3), 0);

        assert_eq!(trades.events.recv().await, Some(1));
        assert_eq!(depth.events.recv().await, Some(2));
        assert!(trades.events.try_recv().is_err());

        let stats = source.get_stats();
        assert_eq!(stats.subscriptions_opened, 2);
        assert_eq!(stats.events_published, 3);
        assert_eq!(stats.events_delivered, 2);
    }

    #[tokio::test]
    async fn test_combined_source_marks_multiplexed() {
        let source: ChannelSource<u64> = ChannelSource::combined();
        let subscription = source.subscribe(&StreamRequest::depth("BTCUSDT")).await.unwrap();
        assert!(subscription.multiplexed);
    }

    #[tokio::test]
    async fn test_closed_subscription_is_pruned() {
        let source: ChannelSource<u64> = ChannelSource::new();
        let mut first = source.subscribe(&StreamRequest::trades("BTCUSDT")).await.unwrap();
        let second = source.subscribe(&StreamRequest::trades("BTCUSDT")).await.unwrap();
        assert_eq!(source.subscriber_count("btcusdt@trade"), 2);

        first.close();
        drop(second);
        assert_eq!(source.subscriber_count("btcusdt@trade"), 0);
        assert_eq!(source.publish("btcusdt@trade", 7), 0);
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let source: ChannelSource<u64> = ChannelSource::new();
        let mut subscription = source.subscribe(&StreamRequest::trades("BTCUSDT")).await.unwrap();

        source.publish("btcusdt@trade", 1);
        source.close("btcusdt@trade");

        assert!(subscription.cancel.is_cancelled());
        assert_eq!(subscription.events.recv().await, Some(1));
        assert_eq!(subscription.events.recv().await, None);
    }

    #[tokio::test]
    async fn test_empty_symbol_rejected() {
        let source: ChannelSource<u64> = ChannelSource::new();
        let result = source.subscribe(&StreamRequest::trades("  ")).await;
        assert!(matches!(result, Err(StreamError::InvalidRequest(_))));
    }
}

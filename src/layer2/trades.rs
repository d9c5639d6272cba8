// Trade Window Cache
// Bounded, gap-checked FIFO of recent trades (plain or aggregated)

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::CacheConfig;
use crate::core::events::{ListenerId, OutOfSync, OutOfSyncReason, Subscribers};
use crate::core::types::{SyncStatus, TradeRecord};
use crate::layer1::rest_client::{MarketDataSource, RestClientError, MAX_TRADES_LIMIT};
use crate::layer1::stream::{EventStreamSource, StreamRequest};
use crate::layer2::dispatcher::{
    ApplyEvent, ApplyOutcome, DispatcherStats, OrderedDispatcher, SyncError, UpdateCallback,
};

pub const DEFAULT_TRADE_WINDOW: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeKind {
    Trades,
    AggregateTrades,
}

impl TradeKind {
    fn source(&self) -> &'static str {
        match self {
            TradeKind::Trades => "trades",
            TradeKind::AggregateTrades => "aggTrades",
        }
    }
}

impl fmt::Display for TradeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.source())
    }
}

/// Sort by id, drop duplicates and keep only the longest run of consecutive
/// ids ending at the newest trade, capped at `limit` entries.
fn contiguous_tail(mut trades: Vec<TradeRecord>, limit: usize) -> VecDeque<TradeRecord> {
    trades.sort_by_key(|t| t.id);
    trades.dedup_by_key(|t| t.id);

    let mut start = trades.len().saturating_sub(1);
    while start > 0 && trades[start - 1].id + 1 == trades[start].id {
        start -= 1;
    }
    let start = start.max(trades.len().saturating_sub(limit));

    trades.drain(..start);
    trades.into()
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone, Default)]
struct TradeCounters {
    resyncs: u64,
    resync_failures: u64,
    gaps_detected: u64,
    trades_applied: u64,
    stale_ignored: u64,
    persistent_gaps: u64,
}

#[derive(Debug, Clone)]
pub struct TradeWindowStats {
    pub symbol: String,
    pub kind: TradeKind,
    pub status: SyncStatus,
    pub window_size: usize,
    pub len: usize,
    pub resyncs: u64,
    pub resync_failures: u64,
    pub gaps_detected: u64,
    pub trades_applied: u64,
    pub stale_ignored: u64,
    pub persistent_gaps: u64,
}

impl fmt::Display for TradeWindowStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TradeWindow({} {}, status={}, len={}/{}, resyncs={}, gaps={}, applied={}, stale={})",
            self.symbol,
            self.kind,
            self.status,
            self.len,
            self.window_size,
            self.resyncs,
            self.gaps_detected,
            self.trades_applied,
            self.stale_ignored
        )
    }
}

/// Volume profile of the current window
#[derive(Debug, Clone, PartialEq)]
pub struct TradeWindowSummary {
    pub count: usize,
    pub first_id: Option<i64>,
    pub last_id: Option<i64>,
    pub last_price: Option<f64>,
    pub vwap: Option<f64>,
    pub buy_volume: f64,
    pub sell_volume: f64,
}

impl TradeWindowSummary {
    fn from_window(window: &VecDeque<TradeRecord>) -> Self {
        let mut notional = 0.0;
        let mut buy_volume = 0.0;
        let mut sell_volume = 0.0;
        for trade in window {
            notional += trade.notional();
            if trade.is_buyer_maker {
                sell_volume += trade.quantity;
            } else {
                buy_volume += trade.quantity;
            }
        }
        let volume = buy_volume + sell_volume;

        Self {
            count: window.len(),
            first_id: window.front().map(|t| t.id),
            last_id: window.back().map(|t| t.id),
            last_price: window.back().map(|t| t.price),
            vwap: if volume > 0.0 { Some(notional / volume) } else { None },
            buy_volume,
            sell_volume,
        }
    }

    /// Taker buy minus taker sell volume
    pub fn delta(&self) -> f64 {
        self.buy_volume - self.sell_volume
    }
}

// ============================================================================
// Apply logic
// ============================================================================

struct WindowState {
    status: SyncStatus,
    trades: VecDeque<TradeRecord>,
}

pub struct TradeWindowSync {
    symbol: String,
    kind: TradeKind,
    limit: usize,
    rest: Arc<dyn MarketDataSource>,
    state: RwLock<WindowState>,
    out_of_sync: Subscribers<OutOfSync>,
    stats: RwLock<TradeCounters>,
}

impl TradeWindowSync {
    fn new(symbol: &str, kind: TradeKind, limit: usize, rest: Arc<dyn MarketDataSource>) -> Self {
        Self {
            symbol: symbol.to_string(),
            kind,
            limit,
            rest,
            state: RwLock::new(WindowState {
                status: SyncStatus::Empty,
                trades: VecDeque::with_capacity(limit + 1),
            }),
            out_of_sync: Subscribers::new("trades.out_of_sync"),
            stats: RwLock::new(TradeCounters::default()),
        }
    }

    fn reset(&self) {
        let mut state = self.state.write();
        state.trades.clear();
        state.status = SyncStatus::Empty;
    }

    fn copy(&self) -> Arc<Vec<TradeRecord>> {
        Arc::new(self.state.read().trades.iter().cloned().collect())
    }

    /// Push the contiguous successor and evict from the front
    fn push(&self, event: TradeRecord) -> Arc<Vec<TradeRecord>> {
        let snapshot: Arc<Vec<TradeRecord>> = {
            let mut state = self.state.write();
            state.trades.push_back(event);
            while state.trades.len() > self.limit {
                state.trades.pop_front();
            }
            state.status = SyncStatus::Synced;
            Arc::new(state.trades.iter().cloned().collect())
        };
        self.stats.write().trades_applied += 1;
        snapshot
    }

    async fn fetch(&self, cancel: &CancellationToken) -> Result<Vec<TradeRecord>, RestClientError> {
        let limit = self.limit as u32;
        match self.kind {
            TradeKind::Trades => self.rest.fetch_recent_trades(&self.symbol, limit, cancel).await,
            TradeKind::AggregateTrades => {
                self.rest
                    .fetch_recent_aggregate_trades(&self.symbol, limit, cancel)
                    .await
            }
        }
    }

    async fn resync(
        &self,
        event: TradeRecord,
        reason: OutOfSyncReason,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome<Arc<Vec<TradeRecord>>>, SyncError> {
        self.out_of_sync
            .publish(OutOfSync::new(&self.symbol, self.kind.source(), reason));
        self.state.write().status = SyncStatus::Synchronizing;

        let fetched = match self.fetch(cancel).await {
            Ok(trades) => trades,
            Err(e) if e.is_cancelled() => {
                self.reset();
                return Err(SyncError::Cancelled);
            }
            Err(e) => {
                self.reset();
                self.stats.write().resync_failures += 1;
                warn!(symbol = %self.symbol, kind = %self.kind, error = %e, "Trade resync failed");
                return Ok(ApplyOutcome::ResyncRequired);
            }
        };

        let window = contiguous_tail(fetched, self.limit);
        self.stats.write().resyncs += 1;
        info!(
            symbol = %self.symbol,
            kind = %self.kind,
            trades = window.len(),
            first_id = window.front().map(|t| t.id),
            last_id = window.back().map(|t| t.id),
            "Trade window rebuilt"
        );

        let tail = window.back().map(|t| t.id);
        {
            let mut state = self.state.write();
            state.trades = window;
            state.status = SyncStatus::Synced;
        }

        match tail {
            Some(tail) if event.id <= tail => Ok(ApplyOutcome::Applied(self.copy())),
            Some(tail) if event.id == tail + 1 => Ok(ApplyOutcome::Applied(self.push(event))),
            // Nothing traded yet: the event itself starts the window
            None => Ok(ApplyOutcome::Applied(self.push(event))),
            Some(tail) => {
                self.stats.write().persistent_gaps += 1;
                warn!(
                    symbol = %self.symbol,
                    kind = %self.kind,
                    rest_tail = tail,
                    event_id = event.id,
                    "Still gapped after resync, waiting for next event"
                );
                self.reset();
                Ok(ApplyOutcome::Ignored)
            }
        }
    }
}

#[async_trait]
impl ApplyEvent for TradeWindowSync {
    type Event = TradeRecord;
    type Snapshot = Arc<Vec<TradeRecord>>;

    async fn apply_event(
        &self,
        event: TradeRecord,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome<Arc<Vec<TradeRecord>>>, SyncError> {
        if event.symbol != self.symbol {
            return Ok(ApplyOutcome::Ignored);
        }

        let tail = self.state.read().trades.back().map(|t| t.id);
        match tail {
            Some(tail) if event.id <= tail => {
                self.stats.write().stale_ignored += 1;
                debug!(symbol = %self.symbol, id = event.id, tail = tail, "Stale trade");
                Ok(ApplyOutcome::Ignored)
            }
            Some(tail) if event.id == tail + 1 => Ok(ApplyOutcome::Applied(self.push(event))),
            Some(tail) => {
                self.stats.write().gaps_detected += 1;
                warn!(
                    symbol = %self.symbol,
                    kind = %self.kind,
                    expected = tail + 1,
                    received = event.id,
                    "Trade gap detected, resyncing"
                );
                let reason = OutOfSyncReason::Gap {
                    expected: (tail + 1) as u64,
                    received: event.id as u64,
                };
                self.resync(event, reason, cancel).await
            }
            None => self.resync(event, OutOfSyncReason::Initial, cancel).await,
        }
    }
}

// ============================================================================
// Trade Window Cache
// ============================================================================

/// The most recent N trades of one symbol, ids strictly consecutive
pub struct TradeWindowCache {
    window: Arc<TradeWindowSync>,
    dispatcher: OrderedDispatcher<TradeWindowSync>,
}

impl TradeWindowCache {
    /// `window_size` 0 selects the default (500); at most 1000
    pub fn new(
        symbol: &str,
        kind: TradeKind,
        window_size: usize,
        rest: Arc<dyn MarketDataSource>,
    ) -> Result<Self, SyncError> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(SyncError::InvalidArgument("symbol must not be empty".to_string()));
        }
        let limit = match window_size {
            0 => DEFAULT_TRADE_WINDOW,
            n if n > MAX_TRADES_LIMIT as usize => {
                return Err(SyncError::InvalidArgument(format!(
                    "trade window must not exceed {}, got {}",
                    MAX_TRADES_LIMIT, n
                )))
            }
            n => n,
        };

        info!(symbol = %symbol, kind = %kind, window = limit, "TradeWindowCache initialized");

        let window = Arc::new(TradeWindowSync::new(&symbol, kind, limit, rest));
        let dispatcher = OrderedDispatcher::new(&format!("{}:{}", kind, symbol), Arc::clone(&window));
        Ok(Self { window, dispatcher })
    }

    /// Window size taken from `CacheConfig::trade_window`
    pub fn from_config(
        symbol: &str,
        kind: TradeKind,
        config: &CacheConfig,
        rest: Arc<dyn MarketDataSource>,
    ) -> Result<Self, SyncError> {
        Self::new(symbol, kind, config.trade_window, rest)
    }

    pub fn symbol(&self) -> &str {
        &self.window.symbol
    }

    pub fn kind(&self) -> TradeKind {
        self.window.kind
    }

    pub fn window_size(&self) -> usize {
        self.window.limit
    }

    pub async fn subscribe<S>(
        &self,
        source: &S,
        callback: Option<UpdateCallback<Arc<Vec<TradeRecord>>>>,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError>
    where
        S: EventStreamSource<TradeRecord> + ?Sized,
    {
        if self.dispatcher.is_linked() {
            return Err(SyncError::InvalidState(format!(
                "{} window for {} is already subscribed",
                self.window.kind, self.window.symbol
            )));
        }

        let request = match self.window.kind {
            TradeKind::Trades => StreamRequest::trades(&self.window.symbol),
            TradeKind::AggregateTrades => StreamRequest::aggregate_trades(&self.window.symbol),
        };
        let subscription = source.subscribe(&request).await?;

        // An old consumer may still be mid-apply after a parent cancel
        self.dispatcher.join_cancelled().await;
        self.window.reset();
        self.dispatcher.link(subscription, callback, cancel).await
    }

    pub async fn unsubscribe(&self) -> bool {
        let was_linked = self.dispatcher.unlink().await;
        self.window.reset();
        was_linked
    }

    pub fn post(&self, event: TradeRecord) -> Result<(), SyncError> {
        self.dispatcher.post(event)
    }

    pub fn on_update<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&Arc<Vec<TradeRecord>>) + Send + Sync + 'static,
    {
        self.dispatcher.on_update(callback)
    }

    pub fn updates(&self) -> broadcast::Receiver<Arc<Vec<TradeRecord>>> {
        self.dispatcher.updates()
    }

    pub fn on_out_of_sync<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&OutOfSync) + Send + Sync + 'static,
    {
        self.window.out_of_sync.subscribe(callback)
    }

    pub fn out_of_sync_events(&self) -> broadcast::Receiver<OutOfSync> {
        self.window.out_of_sync.subscribe_channel()
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.dispatcher.remove_listener(id) || self.window.out_of_sync.unsubscribe(id)
    }

    /// Oldest first
    pub fn trades(&self) -> Vec<TradeRecord> {
        self.window.state.read().trades.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<TradeRecord> {
        self.window.state.read().trades.back().cloned()
    }

    pub fn len(&self) -> usize {
        self.window.state.read().trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self) -> SyncStatus {
        self.window.state.read().status
    }

    pub fn summary(&self) -> TradeWindowSummary {
        TradeWindowSummary::from_window(&self.window.state.read().trades)
    }

    pub fn stats(&self) -> TradeWindowStats {
        let counters = self.window.stats.read().clone();
        let state = self.window.state.read();
        TradeWindowStats {
            symbol: self.window.symbol.clone(),
            kind: self.window.kind,
            status: state.status,
            window_size: self.window.limit,
            len: state.trades.len(),
            resyncs: counters.resyncs,
            resync_failures: counters.resync_failures,
            gaps_detected: counters.gaps_detected,
            trades_applied: counters.trades_applied,
            stale_ignored: counters.stale_ignored,
            persistent_gaps: counters.persistent_gaps,
        }
    }

    pub fn dispatcher_stats(&self) -> DispatcherStats {
        self.dispatcher.get_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer1::memory_source::InMemoryMarketData;

    fn trade(id: i64) -> TradeRecord {
        TradeRecord::new("BTCUSDT", id, 100.0 + id as f64, 1.0, id * 1000, id % 2 == 0)
    }

    fn trades(ids: std::ops::RangeInclusive<i64>) -> Vec<TradeRecord> {
        ids.map(trade).collect()
    }

    fn ids(window: &[TradeRecord]) -> Vec<i64> {
        window.iter().map(|t| t.id).collect()
    }

    fn applied(outcome: ApplyOutcome<Arc<Vec<TradeRecord>>>) -> Vec<i64> {
        match outcome {
            ApplyOutcome::Applied(window) => ids(&window),
            other => panic!("expected Applied, got {:?}", other),
        }
    }

    fn sync(limit: usize, rest: Arc<InMemoryMarketData>) -> TradeWindowSync {
        TradeWindowSync::new("BTCUSDT", TradeKind::Trades, limit, rest)
    }

    #[test]
    fn test_contiguous_tail() {
        let mut raw = trades(1..=3);
        raw.extend(trades(7..=10));
        raw.push(trade(9));
        raw.reverse();

        assert_eq!(ids(&Vec::from(contiguous_tail(raw.clone(), 10))), vec![7, 8, 9, 10]);
        assert_eq!(ids(&Vec::from(contiguous_tail(raw, 2))), vec![9, 10]);
        assert!(contiguous_tail(vec![], 5).is_empty());
    }

    #[test]
    fn test_window_size_validation() {
        let rest = Arc::new(InMemoryMarketData::new());
        let cache = TradeWindowCache::new("btcusdt", TradeKind::Trades, 0, rest.clone()).unwrap();
        assert_eq!(cache.window_size(), DEFAULT_TRADE_WINDOW);
        assert_eq!(cache.symbol(), "BTCUSDT");

        let result = TradeWindowCache::new("BTCUSDT", TradeKind::Trades, 1001, rest);
        assert!(matches!(result, Err(SyncError::InvalidArgument(_))));
    }

    #[test]
    fn test_from_config_window() {
        let rest = Arc::new(InMemoryMarketData::new());
        let mut config = CacheConfig::default();
        config.trade_window = 250;
        let cache = TradeWindowCache::from_config("BTCUSDT", TradeKind::AggregateTrades, &config, rest.clone()).unwrap();
        assert_eq!(cache.window_size(), 250);
        assert_eq!(cache.kind(), TradeKind::AggregateTrades);

        config.trade_window = 0;
        let cache = TradeWindowCache::from_config("BTCUSDT", TradeKind::Trades, &config, rest).unwrap();
        assert_eq!(cache.window_size(), DEFAULT_TRADE_WINDOW);
    }

    #[tokio::test]
    async fn test_seed_then_gap_resync() {
        let rest = Arc::new(InMemoryMarketData::new());
        rest.push_trades(trades(10..=14));
        rest.push_trades(trades(12..=20));
        let window = sync(5, rest.clone());
        let cancel = CancellationToken::new();

        // First event seeds from REST; 14 is already covered
        assert_eq!(applied(window.apply_event(trade(14), &cancel).await.unwrap()), vec![10, 11, 12, 13, 14]);
        assert_eq!(applied(window.apply_event(trade(15), &cancel).await.unwrap()), vec![11, 12, 13, 14, 15]);
        assert_eq!(applied(window.apply_event(trade(20), &cancel).await.unwrap()), vec![16, 17, 18, 19, 20]);

        assert_eq!(rest.call_counts().trades, 2);
        let stats = window.stats.read().clone();
        assert_eq!(stats.resyncs, 2);
        assert_eq!(stats.gaps_detected, 1);
    }

    #[tokio::test]
    async fn test_seed_contiguous_successor_pushed() {
        let rest = Arc::new(InMemoryMarketData::new());
        rest.push_trades(trades(1..=3));
        let window = sync(3, rest);

        let outcome = window.apply_event(trade(4), &CancellationToken::new()).await.unwrap();
        assert_eq!(applied(outcome), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_stale_trade_ignored() {
        let rest = Arc::new(InMemoryMarketData::new());
        rest.push_trades(trades(1..=5));
        let window = sync(10, rest);
        let cancel = CancellationToken::new();

        applied(window.apply_event(trade(5), &cancel).await.unwrap());
        assert_eq!(window.apply_event(trade(3), &cancel).await.unwrap(), ApplyOutcome::Ignored);
        assert_eq!(window.apply_event(trade(5), &cancel).await.unwrap(), ApplyOutcome::Ignored);
        assert_eq!(window.state.read().trades.len(), 5);
    }

    #[tokio::test]
    async fn test_persistent_gap_resets_window() {
        let rest = Arc::new(InMemoryMarketData::new());
        rest.push_trades(trades(1..=5));
        rest.push_trades(trades(1..=5));
        let window = sync(5, rest.clone());
        let cancel = CancellationToken::new();

        applied(window.apply_event(trade(5), &cancel).await.unwrap());
        let outcome = window.apply_event(trade(9), &cancel).await.unwrap();

        assert_eq!(outcome, ApplyOutcome::Ignored);
        assert!(window.state.read().trades.is_empty());
        assert_eq!(window.state.read().status, SyncStatus::Empty);
        assert_eq!(rest.call_counts().trades, 2);
    }

    #[tokio::test]
    async fn test_rest_failure_requires_resync() {
        let rest = Arc::new(InMemoryMarketData::new());
        rest.push_trades_error("busy");
        rest.push_trades(trades(1..=2));
        let window = sync(5, rest);
        let cancel = CancellationToken::new();

        assert_eq!(window.apply_event(trade(2), &cancel).await.unwrap(), ApplyOutcome::ResyncRequired);
        assert!(window.state.read().trades.is_empty());

        // Next event retries
        assert_eq!(applied(window.apply_event(trade(3), &cancel).await.unwrap()), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_empty_rest_result_starts_window() {
        let rest = Arc::new(InMemoryMarketData::new());
        rest.push_trades(vec![]);
        let window = sync(5, rest);

        let outcome = window.apply_event(trade(42), &CancellationToken::new()).await.unwrap();
        assert_eq!(applied(outcome), vec![42]);
    }

    #[tokio::test]
    async fn test_aggregate_kind_uses_agg_endpoint() {
        let rest = Arc::new(InMemoryMarketData::new());
        rest.push_aggregate_trades(trades(1..=3));
        let window = TradeWindowSync::new("BTCUSDT", TradeKind::AggregateTrades, 5, rest.clone());

        applied(window.apply_event(trade(3), &CancellationToken::new()).await.unwrap());
        let counts = rest.call_counts();
        assert_eq!(counts.aggregate_trades, 1);
        assert_eq!(counts.trades, 0);
    }

    #[test]
    fn test_summary_volume_split() {
        let window: VecDeque<TradeRecord> = trades(1..=4).into();
        let summary = TradeWindowSummary::from_window(&window);

        assert_eq!(summary.count, 4);
        assert_eq!(summary.buy_volume, 2.0);
        assert_eq!(summary.sell_volume, 2.0);
        assert_eq!(summary.delta(), 0.0);
        assert_eq!(summary.vwap, Some(102.5));
        assert_eq!(summary.last_id, Some(4));
    }
}

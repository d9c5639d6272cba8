// Order Book Cache
// Snapshot + diff reconciliation with gap detection, or top-N replacement in partial mode

use async_trait::async_trait;
use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::CacheConfig;
use crate::core::events::{ListenerId, OutOfSync, OutOfSyncReason, Subscribers};
use crate::core::types::{DepthEvent, OrderBookSnapshot, PriceLevel, SyncStatus};
use crate::layer1::rest_client::{MarketDataSource, MAX_DEPTH_LIMIT};
use crate::layer1::stream::{EventStreamSource, StreamRequest};
use crate::layer2::dispatcher::{
    ApplyEvent, ApplyOutcome, DispatcherStats, OrderedDispatcher, SyncError, UpdateCallback,
};

type Price = OrderedFloat<f64>;
type Quantity = f64;

const SOURCE: &str = "orderbook";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBookMode {
    /// Full diff stream reconciled against REST snapshots
    Diff,
    /// Top-N pushes replacing the book wholesale (5, 10 or 20 levels)
    Partial { levels: u32 },
}

impl fmt::Display for OrderBookMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderBookMode::Diff => write!(f, "diff"),
            OrderBookMode::Partial { levels } => write!(f, "partial({})", levels),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderBookSettings {
    pub mode: OrderBookMode,
    pub snapshot_depth: u32,
    pub gap_retry_delay: Duration,
}

impl OrderBookSettings {
    pub fn diff() -> Self {
        Self {
            mode: OrderBookMode::Diff,
            snapshot_depth: MAX_DEPTH_LIMIT,
            gap_retry_delay: Duration::from_millis(1000),
        }
    }

    pub fn partial(levels: u32) -> Self {
        Self {
            mode: OrderBookMode::Partial { levels },
            ..Self::diff()
        }
    }

    /// Diff-mode settings from the cache section of the config
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            mode: OrderBookMode::Diff,
            snapshot_depth: config.orderbook_snapshot_depth,
            gap_retry_delay: Duration::from_millis(config.gap_retry_delay_ms),
        }
    }

    /// Partial-depth settings using the configured level count
    pub fn partial_from_config(config: &CacheConfig) -> Self {
        Self {
            mode: OrderBookMode::Partial { levels: config.partial_depth_levels },
            ..Self::from_config(config)
        }
    }

    fn validate(&self) -> Result<(), SyncError> {
        if let OrderBookMode::Partial { levels } = self.mode {
            if !matches!(levels, 5 | 10 | 20) {
                return Err(SyncError::InvalidArgument(format!(
                    "partial depth levels must be 5, 10 or 20, got {}",
                    levels
                )));
            }
        }
        if self.snapshot_depth == 0 || self.snapshot_depth > MAX_DEPTH_LIMIT {
            return Err(SyncError::InvalidArgument(format!(
                "snapshot depth must be between 1 and {}, got {}",
                MAX_DEPTH_LIMIT, self.snapshot_depth
            )));
        }
        Ok(())
    }
}

impl Default for OrderBookSettings {
    fn default() -> Self {
        Self::diff()
    }
}

// ============================================================================
// Book state
// ============================================================================

struct BookState {
    status: SyncStatus,
    last_update_id: u64,
    last_update_time: i64,
    // BTreeMap keeps entries sorted automatically
    bids: BTreeMap<Price, Quantity>,
    asks: BTreeMap<Price, Quantity>,
}

impl BookState {
    fn new() -> Self {
        Self {
            status: SyncStatus::Empty,
            last_update_id: 0,
            last_update_time: 0,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
        }
    }

    fn reset(&mut self) {
        self.status = SyncStatus::Empty;
        self.last_update_id = 0;
        self.last_update_time = 0;
        self.bids.clear();
        self.asks.clear();
    }

    fn adopt(&mut self, snapshot: &OrderBookSnapshot) {
        fill(&mut self.bids, &snapshot.bids);
        fill(&mut self.asks, &snapshot.asks);
        self.last_update_id = snapshot.last_update_id;
        self.last_update_time = snapshot.timestamp;
        self.status = SyncStatus::Synced;
    }

    fn merge(&mut self, event: &DepthEvent) {
        apply_levels(&mut self.bids, &event.bids);
        apply_levels(&mut self.asks, &event.asks);
        self.last_update_id = event.last_update_id;
        self.last_update_time = event_time(event);
    }

    fn replace(&mut self, event: &DepthEvent, levels: usize) {
        fill(&mut self.bids, &event.bids);
        fill(&mut self.asks, &event.asks);
        while self.bids.len() > levels {
            self.bids.pop_first();
        }
        while self.asks.len() > levels {
            self.asks.pop_last();
        }
        self.last_update_id = event.last_update_id;
        self.last_update_time = event_time(event);
        self.status = SyncStatus::Synced;
    }

    fn top_bids(&self, n: usize) -> Vec<PriceLevel> {
        self.bids
            .iter()
            .rev()
            .take(n)
            .map(|(price, &qty)| PriceLevel::new(price.0, qty))
            .collect()
    }

    fn top_asks(&self, n: usize) -> Vec<PriceLevel> {
        self.asks
            .iter()
            .take(n)
            .map(|(price, &qty)| PriceLevel::new(price.0, qty))
            .collect()
    }

    fn snapshot(&self, symbol: &str) -> OrderBookSnapshot {
        OrderBookSnapshot::new(
            symbol.to_string(),
            self.last_update_id,
            self.top_bids(usize::MAX),
            self.top_asks(usize::MAX),
            self.last_update_time,
        )
    }
}

fn fill(side: &mut BTreeMap<Price, Quantity>, levels: &[PriceLevel]) {
    side.clear();
    for level in levels.iter().filter(|l| !l.is_removal()) {
        side.insert(OrderedFloat(level.price), level.quantity);
    }
}

fn apply_levels(side: &mut BTreeMap<Price, Quantity>, levels: &[PriceLevel]) {
    for level in levels {
        let price_key = OrderedFloat(level.price);
        if level.is_removal() {
            side.remove(&price_key);
        } else {
            side.insert(price_key, level.quantity);
        }
    }
}

fn event_time(event: &DepthEvent) -> i64 {
    if event.event_time > 0 {
        event.event_time
    } else {
        chrono::Utc::now().timestamp_millis()
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone, Default)]
struct BookCounters {
    snapshots_fetched: u64,
    snapshot_failures: u64,
    gaps_detected: u64,
    diffs_applied: u64,
    stale_ignored: u64,
    replacements: u64,
}

#[derive(Debug, Clone)]
pub struct OrderBookStats {
    pub symbol: String,
    pub mode: OrderBookMode,
    pub status: SyncStatus,
    pub last_update_id: u64,
    pub snapshots_fetched: u64,
    pub snapshot_failures: u64,
    pub gaps_detected: u64,
    pub diffs_applied: u64,
    pub stale_ignored: u64,
    pub replacements: u64,
}

impl fmt::Display for OrderBookStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OrderBook({}, mode={}, status={}, u={}, snapshots={}, failures={}, gaps={}, diffs={}, stale={})",
            self.symbol,
            self.mode,
            self.status,
            self.last_update_id,
            self.snapshots_fetched,
            self.snapshot_failures,
            self.gaps_detected,
            self.diffs_applied,
            self.stale_ignored
        )
    }
}

/// Order book summary
#[derive(Debug, Clone)]
pub struct OrderBookSummary {
    pub symbol: String,
    pub mode: OrderBookMode,
    pub status: SyncStatus,
    pub last_update_id: u64,
    pub bid_levels: usize,
    pub ask_levels: usize,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub spread_bps: Option<f64>,
}

// ============================================================================
// Apply logic
// ============================================================================

/// Owns the book and implements the per-event transition run by the dispatcher
pub struct OrderBookSync {
    symbol: String,
    settings: OrderBookSettings,
    rest: Arc<dyn MarketDataSource>,
    state: RwLock<BookState>,
    out_of_sync: Subscribers<OutOfSync>,
    stats: RwLock<BookCounters>,
}

impl OrderBookSync {
    fn new(symbol: &str, settings: OrderBookSettings, rest: Arc<dyn MarketDataSource>) -> Self {
        Self {
            symbol: symbol.to_string(),
            settings,
            rest,
            state: RwLock::new(BookState::new()),
            out_of_sync: Subscribers::new("orderbook.out_of_sync"),
            stats: RwLock::new(BookCounters::default()),
        }
    }

    fn current(&self) -> Arc<OrderBookSnapshot> {
        Arc::new(self.state.read().snapshot(&self.symbol))
    }

    fn reset(&self) {
        self.state.write().reset();
    }

    /// Fetch a snapshot and adopt it; on failure the book is reset to Empty
    async fn resync(&self, cancel: &CancellationToken) -> Result<bool, SyncError> {
        self.state.write().status = SyncStatus::Synchronizing;

        match self
            .rest
            .fetch_order_book(&self.symbol, self.settings.snapshot_depth, cancel)
            .await
        {
            Ok(snapshot) => {
                self.state.write().adopt(&snapshot);
                self.stats.write().snapshots_fetched += 1;
                info!(
                    symbol = %self.symbol,
                    last_update_id = snapshot.last_update_id,
                    bid_levels = snapshot.bids.len(),
                    ask_levels = snapshot.asks.len(),
                    "Order book snapshot adopted"
                );
                Ok(true)
            }
            Err(e) if e.is_cancelled() => {
                self.reset();
                Err(SyncError::Cancelled)
            }
            Err(e) => {
                self.reset();
                self.stats.write().snapshot_failures += 1;
                warn!(symbol = %self.symbol, error = %e, "Order book snapshot failed");
                Ok(false)
            }
        }
    }

    fn announce(&self, reason: OutOfSyncReason) {
        self.out_of_sync.publish(OutOfSync::new(&self.symbol, SOURCE, reason));
    }

    async fn apply_diff(
        &self,
        event: DepthEvent,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome<Arc<OrderBookSnapshot>>, SyncError> {
        let mut resynced = false;

        if self.state.read().status == SyncStatus::Empty {
            self.announce(OutOfSyncReason::Initial);
            if !self.resync(cancel).await? {
                return Ok(ApplyOutcome::ResyncRequired);
            }
            resynced = true;
        }

        let last = self.state.read().last_update_id;
        if event.last_update_id <= last {
            if resynced {
                return Ok(ApplyOutcome::Applied(self.current()));
            }
            self.stats.write().stale_ignored += 1;
            debug!(symbol = %self.symbol, u = event.last_update_id, book = last, "Stale depth event");
            return Ok(ApplyOutcome::Ignored);
        }

        if event.first_update_id > last + 1 {
            self.stats.write().gaps_detected += 1;
            warn!(
                symbol = %self.symbol,
                expected = last + 1,
                received = event.first_update_id,
                "Depth gap detected, resyncing"
            );
            self.announce(OutOfSyncReason::Gap {
                expected: last + 1,
                received: event.first_update_id,
            });
            self.state.write().status = SyncStatus::Synchronizing;

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.reset();
                    return Err(SyncError::Cancelled);
                }
                _ = tokio::time::sleep(self.settings.gap_retry_delay) => {}
            }

            if !self.resync(cancel).await? {
                return Ok(ApplyOutcome::ResyncRequired);
            }

            let last = self.state.read().last_update_id;
            if event.last_update_id <= last {
                return Ok(ApplyOutcome::Applied(self.current()));
            }
            if event.first_update_id > last + 1 {
                warn!(
                    symbol = %self.symbol,
                    snapshot = last,
                    first = event.first_update_id,
                    "Still gapped after resync, waiting for next event"
                );
                self.reset();
                return Ok(ApplyOutcome::Ignored);
            }
        }

        let snapshot = {
            let mut state = self.state.write();
            state.merge(&event);
            state.snapshot(&self.symbol)
        };
        self.stats.write().diffs_applied += 1;
        Ok(ApplyOutcome::Applied(Arc::new(snapshot)))
    }

    fn apply_partial(&self, event: DepthEvent, levels: u32) -> ApplyOutcome<Arc<OrderBookSnapshot>> {
        let snapshot = {
            let mut state = self.state.write();
            if state.status != SyncStatus::Empty && event.last_update_id <= state.last_update_id {
                drop(state);
                self.stats.write().stale_ignored += 1;
                return ApplyOutcome::Ignored;
            }
            state.replace(&event, levels as usize);
            state.snapshot(&self.symbol)
        };
        self.stats.write().replacements += 1;
        ApplyOutcome::Applied(Arc::new(snapshot))
    }
}

#[async_trait]
impl ApplyEvent for OrderBookSync {
    type Event = DepthEvent;
    type Snapshot = Arc<OrderBookSnapshot>;

    async fn apply_event(
        &self,
        event: DepthEvent,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome<Arc<OrderBookSnapshot>>, SyncError> {
        if event.symbol != self.symbol {
            debug!(symbol = %self.symbol, event_symbol = %event.symbol, "Ignoring depth event for other symbol");
            return Ok(ApplyOutcome::Ignored);
        }

        match self.settings.mode {
            OrderBookMode::Diff => self.apply_diff(event, cancel).await,
            OrderBookMode::Partial { levels } => Ok(self.apply_partial(event, levels)),
        }
    }

    fn requires_exclusive_stream(&self) -> bool {
        self.settings.mode == OrderBookMode::Diff
    }
}

// ============================================================================
// Order Book Cache
// ============================================================================

/// Locally synchronized order book for one symbol
pub struct OrderBookCache {
    book: Arc<OrderBookSync>,
    dispatcher: OrderedDispatcher<OrderBookSync>,
}

impl OrderBookCache {
    pub fn new(
        symbol: &str,
        settings: OrderBookSettings,
        rest: Arc<dyn MarketDataSource>,
    ) -> Result<Self, SyncError> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(SyncError::InvalidArgument("symbol must not be empty".to_string()));
        }
        settings.validate()?;

        info!(symbol = %symbol, mode = %settings.mode, "OrderBookCache initialized");

        let book = Arc::new(OrderBookSync::new(&symbol, settings, rest));
        let dispatcher = OrderedDispatcher::new(&format!("orderbook:{}", symbol), Arc::clone(&book));
        Ok(Self { book, dispatcher })
    }

    pub fn symbol(&self) -> &str {
        &self.book.symbol
    }

    pub fn mode(&self) -> OrderBookMode {
        self.book.settings.mode
    }

    /// Open the depth stream for this symbol and start applying events.
    /// The book starts empty; the first diff event triggers the REST snapshot.
    pub async fn subscribe<S>(
        &self,
        source: &S,
        callback: Option<UpdateCallback<Arc<OrderBookSnapshot>>>,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError>
    where
        S: EventStreamSource<DepthEvent> + ?Sized,
    {
        if self.dispatcher.is_linked() {
            return Err(SyncError::InvalidState(format!(
                "order book {} is already subscribed",
                self.book.symbol
            )));
        }

        let request = match self.book.settings.mode {
            OrderBookMode::Diff => StreamRequest::depth(&self.book.symbol),
            OrderBookMode::Partial { levels } => StreamRequest::partial_depth(&self.book.symbol, levels),
        };
        let subscription = source.subscribe(&request).await?;

        // An old consumer may still be mid-apply after a parent cancel
        self.dispatcher.join_cancelled().await;
        self.book.reset();
        self.dispatcher.link(subscription, callback, cancel).await
    }

    /// Stop applying events and discard the book
    pub async fn unsubscribe(&self) -> bool {
        let was_linked = self.dispatcher.unlink().await;
        self.book.reset();
        was_linked
    }

    /// Inject a decoded event directly (e.g. from a replay)
    pub fn post(&self, event: DepthEvent) -> Result<(), SyncError> {
        self.dispatcher.post(event)
    }

    pub fn on_update<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&Arc<OrderBookSnapshot>) + Send + Sync + 'static,
    {
        self.dispatcher.on_update(callback)
    }

    pub fn updates(&self) -> broadcast::Receiver<Arc<OrderBookSnapshot>> {
        self.dispatcher.updates()
    }

    pub fn on_out_of_sync<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&OutOfSync) + Send + Sync + 'static,
    {
        self.book.out_of_sync.subscribe(callback)
    }

    pub fn out_of_sync_events(&self) -> broadcast::Receiver<OutOfSync> {
        self.book.out_of_sync.subscribe_channel()
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.dispatcher.remove_listener(id) || self.book.out_of_sync.unsubscribe(id)
    }

    pub fn order_book(&self) -> OrderBookSnapshot {
        self.book.state.read().snapshot(&self.book.symbol)
    }

    /// Get top N bid levels
    pub fn top_bids(&self, n: usize) -> Vec<PriceLevel> {
        self.book.state.read().top_bids(n)
    }

    /// Get top N ask levels
    pub fn top_asks(&self, n: usize) -> Vec<PriceLevel> {
        self.book.state.read().top_asks(n)
    }

    pub fn status(&self) -> SyncStatus {
        self.book.state.read().status
    }

    pub fn summary(&self) -> OrderBookSummary {
        let state = self.book.state.read();
        let best_bid = state.bids.keys().next_back().map(|p| p.0);
        let best_ask = state.asks.keys().next().map(|p| p.0);
        let spread_bps = match (best_bid, best_ask) {
            (Some(bid), Some(ask)) if bid + ask > 0.0 => Some((ask - bid) / ((bid + ask) / 2.0) * 10_000.0),
            _ => None,
        };

        OrderBookSummary {
            symbol: self.book.symbol.clone(),
            mode: self.book.settings.mode,
            status: state.status,
            last_update_id: state.last_update_id,
            bid_levels: state.bids.len(),
            ask_levels: state.asks.len(),
            best_bid,
            best_ask,
            spread_bps,
        }
    }

    pub fn stats(&self) -> OrderBookStats {
        let counters = self.book.stats.read().clone();
        let state = self.book.state.read();
        OrderBookStats {
            symbol: self.book.symbol.clone(),
            mode: self.book.settings.mode,
            status: state.status,
            last_update_id: state.last_update_id,
            snapshots_fetched: counters.snapshots_fetched,
            snapshot_failures: counters.snapshot_failures,
            gaps_detected: counters.gaps_detected,
            diffs_applied: counters.diffs_applied,
            stale_ignored: counters.stale_ignored,
            replacements: counters.replacements,
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
    use crate::layer1::stream::ChannelSource;

    fn level(price: f64, quantity: f64) -> PriceLevel {
        PriceLevel::new(price, quantity)
    }

    fn snapshot(last_update_id: u64) -> OrderBookSnapshot {
        OrderBookSnapshot::new(
            "BTCUSDT".to_string(),
            last_update_id,
            vec![level(10000.0, 1.0), level(9999.0, 2.0)],
            vec![level(10010.0, 1.5), level(10011.0, 3.0)],
            1,
        )
    }

    fn book(settings: OrderBookSettings, rest: Arc<InMemoryMarketData>) -> Arc<OrderBookSync> {
        Arc::new(OrderBookSync::new("BTCUSDT", settings, rest))
    }

    fn applied(outcome: ApplyOutcome<Arc<OrderBookSnapshot>>) -> Arc<OrderBookSnapshot> {
        match outcome {
            ApplyOutcome::Applied(snapshot) => snapshot,
            other => panic!("expected Applied, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_settings() {
        let rest = Arc::new(InMemoryMarketData::new());
        let result = OrderBookCache::new("BTCUSDT", OrderBookSettings::partial(15), rest.clone());
        assert!(matches!(result, Err(SyncError::InvalidArgument(_))));

        let result = OrderBookCache::new("  ", OrderBookSettings::diff(), rest);
        assert!(matches!(result, Err(SyncError::InvalidArgument(_))));
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = CacheConfig::default();
        config.orderbook_snapshot_depth = 500;
        config.gap_retry_delay_ms = 250;
        config.partial_depth_levels = 10;

        let diff = OrderBookSettings::from_config(&config);
        assert_eq!(diff.mode, OrderBookMode::Diff);
        assert_eq!(diff.snapshot_depth, 500);
        assert_eq!(diff.gap_retry_delay, Duration::from_millis(250));

        let partial = OrderBookSettings::partial_from_config(&config);
        assert_eq!(partial.mode, OrderBookMode::Partial { levels: 10 });
        assert_eq!(partial.gap_retry_delay, Duration::from_millis(250));

        let rest = Arc::new(InMemoryMarketData::new());
        let cache = OrderBookCache::new("BTCUSDT", partial, rest.clone()).unwrap();
        assert_eq!(cache.mode(), OrderBookMode::Partial { levels: 10 });

        config.partial_depth_levels = 7;
        let result = OrderBookCache::new("BTCUSDT", OrderBookSettings::partial_from_config(&config), rest);
        assert!(matches!(result, Err(SyncError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_snapshot_then_diff() {
        let rest = Arc::new(InMemoryMarketData::new());
        rest.push_order_book(snapshot(100));
        let ob = book(OrderBookSettings::diff(), rest.clone());
        let cancel = CancellationToken::new();

        let event = DepthEvent::new(
            "BTCUSDT",
            101,
            105,
            vec![level(10000.0, 0.0)],
            vec![level(10010.0, 2.0)],
        );
        let result = applied(ob.apply_event(event, &cancel).await.unwrap());

        assert_eq!(result.last_update_id, 105);
        assert_eq!(result.best_bid().unwrap().price, 9999.0);
        assert_eq!(result.best_ask().unwrap().quantity, 2.0);
        assert_eq!(rest.call_counts().order_book, 1);
        assert_eq!(ob.state.read().status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_stale_event_ignored() {
        let rest = Arc::new(InMemoryMarketData::new());
        rest.push_order_book(snapshot(100));
        let ob = book(OrderBookSettings::diff(), rest);
        let cancel = CancellationToken::new();

        // Covered by the snapshot fetched while handling it
        let first = DepthEvent::new("BTCUSDT", 90, 95, vec![level(1.0, 1.0)], vec![]);
        let result = applied(ob.apply_event(first, &cancel).await.unwrap());
        assert_eq!(result.last_update_id, 100);

        let replay = DepthEvent::new("BTCUSDT", 96, 100, vec![level(1.0, 1.0)], vec![]);
        let outcome = ob.apply_event(replay, &cancel).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Ignored);
        assert_eq!(ob.state.read().bids.len(), 2);
        assert_eq!(ob.stats.read().stale_ignored, 1);
    }

    #[tokio::test]
    async fn test_snapshot_failure_requires_resync() {
        let rest = Arc::new(InMemoryMarketData::new());
        rest.push_order_book_error("maintenance");
        let ob = book(OrderBookSettings::diff(), rest);

        let event = DepthEvent::new("BTCUSDT", 1, 2, vec![], vec![]);
        let outcome = ob.apply_event(event, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::ResyncRequired);
        assert_eq!(ob.state.read().status, SyncStatus::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_triggers_single_resync() {
        let rest = Arc::new(InMemoryMarketData::new());
        rest.push_order_book(snapshot(100));
        rest.push_order_book(snapshot(120));
        let ob = book(OrderBookSettings::diff(), rest.clone());
        let cancel = CancellationToken::new();
        let gaps = Arc::new(RwLock::new(Vec::new()));
        let gaps_clone = Arc::clone(&gaps);
        ob.out_of_sync.subscribe(move |event: &OutOfSync| gaps_clone.write().push(event.reason));

        applied(ob.apply_event(DepthEvent::new("BTCUSDT", 101, 101, vec![], vec![]), &cancel).await.unwrap());

        let started = tokio::time::Instant::now();
        let gapped = DepthEvent::new("BTCUSDT", 110, 121, vec![level(9000.0, 4.0)], vec![]);
        let result = applied(ob.apply_event(gapped, &cancel).await.unwrap());

        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert_eq!(result.last_update_id, 121);
        assert_eq!(result.bids.len(), 3);
        assert_eq!(rest.call_counts().order_book, 2);
        assert_eq!(
            *gaps.read(),
            vec![
                OutOfSyncReason::Initial,
                OutOfSyncReason::Gap { expected: 102, received: 110 }
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_still_gapped_after_resync_resets() {
        let rest = Arc::new(InMemoryMarketData::new());
        rest.push_order_book(snapshot(100));
        rest.push_order_book(snapshot(105));
        let ob = book(OrderBookSettings::diff(), rest.clone());
        let cancel = CancellationToken::new();

        applied(ob.apply_event(DepthEvent::new("BTCUSDT", 101, 101, vec![], vec![]), &cancel).await.unwrap());
        let outcome = ob
            .apply_event(DepthEvent::new("BTCUSDT", 110, 112, vec![], vec![]), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome, ApplyOutcome::Ignored);
        assert_eq!(ob.state.read().status, SyncStatus::Empty);
        assert_eq!(rest.call_counts().order_book, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_wait_observes_cancellation() {
        let rest = Arc::new(InMemoryMarketData::new());
        rest.push_order_book(snapshot(100));
        let ob = book(OrderBookSettings::diff(), rest.clone());
        let cancel = CancellationToken::new();

        applied(ob.apply_event(DepthEvent::new("BTCUSDT", 101, 101, vec![], vec![]), &cancel).await.unwrap());

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });
        let result = ob
            .apply_event(DepthEvent::new("BTCUSDT", 150, 151, vec![], vec![]), &cancel)
            .await;

        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert_eq!(rest.call_counts().order_book, 1);
    }

    #[tokio::test]
    async fn test_partial_mode_replaces_and_truncates() {
        let rest = Arc::new(InMemoryMarketData::new());
        let ob = book(OrderBookSettings::partial(5), rest.clone());
        let cancel = CancellationToken::new();

        let bids: Vec<PriceLevel> = (0..8).map(|i| level(100.0 - i as f64, 1.0)).collect();
        let asks: Vec<PriceLevel> = (0..8).map(|i| level(101.0 + i as f64, 1.0)).collect();
        let result = applied(
            ob.apply_event(DepthEvent::new("BTCUSDT", 0, 50, bids, asks), &cancel)
                .await
                .unwrap(),
        );
        assert_eq!(result.bids.len(), 5);
        assert_eq!(result.bids[0].price, 100.0);
        assert_eq!(result.asks.len(), 5);
        assert_eq!(result.asks[4].price, 105.0);

        let older = DepthEvent::new("BTCUSDT", 0, 49, vec![level(1.0, 1.0)], vec![]);
        assert_eq!(ob.apply_event(older, &cancel).await.unwrap(), ApplyOutcome::Ignored);

        let newer = DepthEvent::new("BTCUSDT", 0, 51, vec![level(99.5, 2.0)], vec![level(100.5, 2.0)]);
        let result = applied(ob.apply_event(newer, &cancel).await.unwrap());
        assert_eq!(result.bids, vec![level(99.5, 2.0)]);
        assert_eq!(rest.call_counts().order_book, 0);
        assert!(!ob.requires_exclusive_stream());
    }

    #[tokio::test]
    async fn test_foreign_symbol_ignored() {
        let rest = Arc::new(InMemoryMarketData::new());
        let ob = book(OrderBookSettings::diff(), rest.clone());
        let event = DepthEvent::new("ETHUSDT", 1, 2, vec![], vec![]);

        let outcome = ob.apply_event(event, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Ignored);
        assert_eq!(rest.call_counts().order_book, 0);
    }

    #[tokio::test]
    async fn test_diff_cache_rejects_multiplexed_source() {
        let rest = Arc::new(InMemoryMarketData::new());
        let cache = OrderBookCache::new("btcusdt", OrderBookSettings::diff(), rest).unwrap();
        let combined: ChannelSource<DepthEvent> = ChannelSource::combined();

        let result = cache.subscribe(&combined, None, &CancellationToken::new()).await;
        assert!(matches!(result, Err(SyncError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_partial_cache_accepts_multiplexed_source() {
        let rest = Arc::new(InMemoryMarketData::new());
        let cache = OrderBookCache::new("btcusdt", OrderBookSettings::partial(10), rest).unwrap();
        let combined: ChannelSource<DepthEvent> = ChannelSource::combined();
        let cancel = CancellationToken::new();

        cache.subscribe(&combined, None, &cancel).await.unwrap();
        let mut updates = cache.updates();
        combined.publish(
            "btcusdt@depth10@100ms",
            DepthEvent::new("BTCUSDT", 0, 7, vec![level(10.0, 1.0)], vec![level(11.0, 1.0)]),
        );

        let snapshot = updates.recv().await.unwrap();
        assert_eq!(snapshot.last_update_id, 7);
        assert_eq!(cache.summary().best_ask, Some(11.0));
        assert!(cache.unsubscribe().await);
        assert_eq!(cache.status(), SyncStatus::Empty);
    }
}

// Candlestick Cache
// Bounded series of OHLC bars keyed by open time; upserts are idempotent

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::CacheConfig;
use crate::core::events::ListenerId;
use crate::core::types::{Candlestick, KlineInterval, SyncStatus};
use crate::layer1::rest_client::{MarketDataSource, MAX_KLINES_LIMIT};
use crate::layer1::stream::{EventStreamSource, StreamRequest};
use crate::layer2::dispatcher::{
    ApplyEvent, ApplyOutcome, DispatcherStats, OrderedDispatcher, SyncError, UpdateCallback,
};

pub const DEFAULT_CANDLE_WINDOW: usize = 500;

#[derive(Debug, Clone, Default)]
struct CandleCounters {
    seeds: u64,
    seed_failures: u64,
    replaced: u64,
    appended: u64,
    inserted: u64,
    too_old: u64,
}

#[derive(Debug, Clone)]
pub struct CandleSeriesStats {
    pub symbol: String,
    pub interval: KlineInterval,
    pub status: SyncStatus,
    pub window_size: usize,
    pub len: usize,
    pub seeds: u64,
    pub seed_failures: u64,
    pub replaced: u64,
    pub appended: u64,
    pub inserted: u64,
    pub too_old: u64,
}

impl fmt::Display for CandleSeriesStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Candles({} {}, status={}, len={}/{}, seeds={}, replaced={}, appended={}, inserted={})",
            self.symbol,
            self.interval,
            self.status,
            self.len,
            self.window_size,
            self.seeds,
            self.replaced,
            self.appended,
            self.inserted
        )
    }
}

enum Upsert {
    Replaced,
    Appended,
    Inserted,
    TooOld,
}

struct SeriesState {
    status: SyncStatus,
    candles: VecDeque<Candlestick>,
}

impl SeriesState {
    fn evict(&mut self, limit: usize) {
        while self.candles.len() > limit {
            self.candles.pop_front();
        }
    }

    fn upsert(&mut self, candle: Candlestick, limit: usize) -> Upsert {
        let len = self.candles.len();
        match self.candles.binary_search_by_key(&candle.open_time, |c| c.open_time) {
            Ok(index) => {
                self.candles[index] = candle;
                Upsert::Replaced
            }
            Err(index) if index == len => {
                self.candles.push_back(candle);
                self.evict(limit);
                Upsert::Appended
            }
            Err(0) if len >= limit => Upsert::TooOld,
            Err(index) => {
                self.candles.insert(index, candle);
                self.evict(limit);
                Upsert::Inserted
            }
        }
    }
}

// ============================================================================
// Apply logic
// ============================================================================

pub struct CandleSeriesSync {
    symbol: String,
    interval: KlineInterval,
    limit: usize,
    rest: Arc<dyn MarketDataSource>,
    state: RwLock<SeriesState>,
    stats: RwLock<CandleCounters>,
}

impl CandleSeriesSync {
    fn new(symbol: &str, interval: KlineInterval, limit: usize, rest: Arc<dyn MarketDataSource>) -> Self {
        Self {
            symbol: symbol.to_string(),
            interval,
            limit,
            rest,
            state: RwLock::new(SeriesState {
                status: SyncStatus::Empty,
                candles: VecDeque::with_capacity(limit + 1),
            }),
            stats: RwLock::new(CandleCounters::default()),
        }
    }

    fn reset(&self) {
        let mut state = self.state.write();
        state.candles.clear();
        state.status = SyncStatus::Empty;
    }

    /// Returns false when the REST call failed
    async fn seed(&self, cancel: &CancellationToken) -> Result<bool, SyncError> {
        self.state.write().status = SyncStatus::Synchronizing;

        let fetched = match self
            .rest
            .fetch_recent_candlesticks(&self.symbol, self.interval, self.limit as u32, cancel)
            .await
        {
            Ok(candles) => candles,
            Err(e) if e.is_cancelled() => {
                self.reset();
                return Err(SyncError::Cancelled);
            }
            Err(e) => {
                self.reset();
                self.stats.write().seed_failures += 1;
                warn!(symbol = %self.symbol, interval = %self.interval, error = %e, "Candle seed failed");
                return Ok(false);
            }
        };

        let mut state = self.state.write();
        for candle in fetched
            .into_iter()
            .filter(|c| c.interval == self.interval)
        {
            state.upsert(candle, self.limit);
        }
        state.status = SyncStatus::Synced;
        let seeded = state.candles.len();
        drop(state);

        self.stats.write().seeds += 1;
        info!(symbol = %self.symbol, interval = %self.interval, candles = seeded, "Candle series seeded");
        Ok(true)
    }
}

#[async_trait]
impl ApplyEvent for CandleSeriesSync {
    type Event = Candlestick;
    type Snapshot = Arc<Vec<Candlestick>>;

    async fn apply_event(
        &self,
        event: Candlestick,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome<Arc<Vec<Candlestick>>>, SyncError> {
        if event.symbol != self.symbol || event.interval != self.interval {
            debug!(
                symbol = %self.symbol,
                event_symbol = %event.symbol,
                event_interval = %event.interval,
                "Ignoring candle for other series"
            );
            return Ok(ApplyOutcome::Ignored);
        }

        let empty = self.state.read().status == SyncStatus::Empty;
        if empty && !self.seed(cancel).await? {
            return Ok(ApplyOutcome::ResyncRequired);
        }

        let open_time = event.open_time;
        let (result, snapshot) = {
            let mut state = self.state.write();
            let result = state.upsert(event, self.limit);
            let snapshot: Arc<Vec<Candlestick>> = Arc::new(state.candles.iter().cloned().collect());
            (result, snapshot)
        };

        let mut stats = self.stats.write();
        match result {
            Upsert::Replaced => stats.replaced += 1,
            Upsert::Appended => stats.appended += 1,
            Upsert::Inserted => stats.inserted += 1,
            Upsert::TooOld => {
                stats.too_old += 1;
                debug!(symbol = %self.symbol, open_time = open_time, "Candle older than full window");
                return Ok(ApplyOutcome::Ignored);
            }
        }
        Ok(ApplyOutcome::Applied(snapshot))
    }
}

// ============================================================================
// Candlestick Cache
// ============================================================================

/// The most recent N bars of one (symbol, interval) series, ascending by open time
pub struct CandlestickCache {
    series: Arc<CandleSeriesSync>,
    dispatcher: OrderedDispatcher<CandleSeriesSync>,
}

impl CandlestickCache {
    /// `window_size` 0 selects the default (500); at most 1500
    pub fn new(
        symbol: &str,
        interval: KlineInterval,
        window_size: usize,
        rest: Arc<dyn MarketDataSource>,
    ) -> Result<Self, SyncError> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(SyncError::InvalidArgument("symbol must not be empty".to_string()));
        }
        let limit = match window_size {
            0 => DEFAULT_CANDLE_WINDOW,
            n if n > MAX_KLINES_LIMIT as usize => {
                return Err(SyncError::InvalidArgument(format!(
                    "candle window must not exceed {}, got {}",
                    MAX_KLINES_LIMIT, n
                )))
            }
            n => n,
        };

        info!(symbol = %symbol, interval = %interval, window = limit, "CandlestickCache initialized");

        let series = Arc::new(CandleSeriesSync::new(&symbol, interval, limit, rest));
        let dispatcher = OrderedDispatcher::new(&format!("klines:{}:{}", symbol, interval), Arc::clone(&series));
        Ok(Self { series, dispatcher })
    }

    /// Window size taken from `CacheConfig::candle_window`
    pub fn from_config(
        symbol: &str,
        interval: KlineInterval,
        config: &CacheConfig,
        rest: Arc<dyn MarketDataSource>,
    ) -> Result<Self, SyncError> {
        Self::new(symbol, interval, config.candle_window, rest)
    }

    pub fn symbol(&self) -> &str {
        &self.series.symbol
    }

    pub fn interval(&self) -> KlineInterval {
        self.series.interval
    }

    pub fn window_size(&self) -> usize {
        self.series.limit
    }

    pub async fn subscribe<S>(
        &self,
        source: &S,
        callback: Option<UpdateCallback<Arc<Vec<Candlestick>>>>,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError>
    where
        S: EventStreamSource<Candlestick> + ?Sized,
    {
        if self.dispatcher.is_linked() {
            return Err(SyncError::InvalidState(format!(
                "candles {} {} already subscribed",
                self.series.symbol, self.series.interval
            )));
        }

        let request = StreamRequest::candles(&self.series.symbol, self.series.interval);
        let subscription = source.subscribe(&request).await?;

        // An old consumer may still be mid-apply after a parent cancel
        self.dispatcher.join_cancelled().await;
        self.series.reset();
        self.dispatcher.link(subscription, callback, cancel).await
    }

    pub async fn unsubscribe(&self) -> bool {
        let was_linked = self.dispatcher.unlink().await;
        self.series.reset();
        was_linked
    }

    pub fn post(&self, event: Candlestick) -> Result<(), SyncError> {
        self.dispatcher.post(event)
    }

    pub fn on_update<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&Arc<Vec<Candlestick>>) + Send + Sync + 'static,
    {
        self.dispatcher.on_update(callback)
    }

    pub fn updates(&self) -> broadcast::Receiver<Arc<Vec<Candlestick>>> {
        self.dispatcher.updates()
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.dispatcher.remove_listener(id)
    }

    pub fn candles(&self) -> Vec<Candlestick> {
        self.series.state.read().candles.iter().cloned().collect()
    }

    pub fn get(&self, open_time: i64) -> Option<Candlestick> {
        let state = self.series.state.read();
        state
            .candles
            .binary_search_by_key(&open_time, |c| c.open_time)
            .ok()
            .map(|index| state.candles[index].clone())
    }

    pub fn latest(&self) -> Option<Candlestick> {
        self.series.state.read().candles.back().cloned()
    }

    /// Most recent bar the exchange has marked final
    pub fn last_closed(&self) -> Option<Candlestick> {
        self.series
            .state
            .read()
            .candles
            .iter()
            .rev()
            .find(|c| c.is_final)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.series.state.read().candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self) -> SyncStatus {
        self.series.state.read().status
    }

    pub fn stats(&self) -> CandleSeriesStats {
        let counters = self.series.stats.read().clone();
        let state = self.series.state.read();
        CandleSeriesStats {
            symbol: self.series.symbol.clone(),
            interval: self.series.interval,
            status: state.status,
            window_size: self.series.limit,
            len: state.candles.len(),
            seeds: counters.seeds,
            seed_failures: counters.seed_failures,
            replaced: counters.replaced,
            appended: counters.appended,
            inserted: counters.inserted,
            too_old: counters.too_old,
        }
    }

    pub fn dispatcher_stats(&self) -> DispatcherStats {
        self.dispatcher.get_stats()
    }
}

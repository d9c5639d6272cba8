// Unified Metrics - Collects and formats stats from all cache components
// Aggregates existing per-component stats into a single view

use std::fmt;
use tracing::info;

use crate::layer1::rate_limiter::RateLimiterStats;
use crate::layer1::rest_client::RestClientStats;
use crate::layer2::candles::{CandleSeriesStats, CandlestickCache};
use crate::layer2::dispatcher::DispatcherStats;
use crate::layer2::orderbook::{OrderBookCache, OrderBookStats};
use crate::layer2::trades::{TradeWindowCache, TradeWindowStats};

/// Unified metrics snapshot from the limiter, REST client and every cache
#[derive(Debug, Clone, Default)]
pub struct UnifiedMetrics {
    pub limiter: Option<RateLimiterStats>,
    pub rest: Option<RestClientStats>,
    pub dispatchers: Vec<DispatcherStats>,
    pub order_books: Vec<OrderBookStats>,
    pub trade_windows: Vec<TradeWindowStats>,
    pub candle_series: Vec<CandleSeriesStats>,
}

impl UnifiedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate_limiter(mut self, stats: RateLimiterStats) -> Self {
        self.limiter = Some(stats);
        self
    }

    pub fn with_rest_client(mut self, stats: RestClientStats) -> Self {
        self.rest = Some(stats);
        self
    }

    pub fn with_order_book(mut self, cache: &OrderBookCache) -> Self {
        self.order_books.push(cache.stats());
        self.dispatchers.push(cache.dispatcher_stats());
        self
    }

    pub fn with_trade_window(mut self, cache: &TradeWindowCache) -> Self {
        self.trade_windows.push(cache.stats());
        self.dispatchers.push(cache.dispatcher_stats());
        self
    }

    pub fn with_candle_series(mut self, cache: &CandlestickCache) -> Self {
        self.candle_series.push(cache.stats());
        self.dispatchers.push(cache.dispatcher_stats());
        self
    }

    /// Events that produced a new snapshot, across all dispatchers
    pub fn total_applied(&self) -> u64 {
        self.dispatchers.iter().map(|d| d.applied).sum()
    }

    /// Events still queued or in flight
    pub fn total_pending(&self) -> u64 {
        self.dispatchers.iter().map(|d| d.pending()).sum()
    }

    /// REST snapshot fetches performed by the caches
    pub fn total_resyncs(&self) -> u64 {
        let books: u64 = self.order_books.iter().map(|b| b.snapshots_fetched).sum();
        let trades: u64 = self.trade_windows.iter().map(|t| t.resyncs).sum();
        let candles: u64 = self.candle_series.iter().map(|c| c.seeds).sum();
        books + trades + candles
    }

    /// Total gaps detected by sequence-checked caches
    pub fn total_gaps(&self) -> u64 {
        let books: u64 = self.order_books.iter().map(|b| b.gaps_detected).sum();
        let trades: u64 = self.trade_windows.iter().map(|t| t.gaps_detected).sum();
        books + trades
    }

    /// Total errors across all components
    pub fn total_errors(&self) -> u64 {
        let rest_errs = self.rest.as_ref().map(|r| r.requests_failed).unwrap_or(0);
        let dispatch_errs: u64 = self.dispatchers.iter().map(|d| d.failed).sum();
        rest_errs + dispatch_errs
    }

    /// REST success rate as a percentage (0-100)
    pub fn rest_success_percent(&self) -> f64 {
        self.rest.as_ref().map(|r| r.success_rate * 100.0).unwrap_or(0.0)
    }

    /// Print detailed multi-line report
    pub fn print_report(&self) {
        info!("=== UNIFIED METRICS ===");

        if let Some(l) = &self.limiter {
            info!("  RateLimiter:  calls={} weight={} delayed={} total_delay={:.3}s tiers={}",
                l.admitted_calls, l.admitted_weight, l.delayed_calls,
                l.total_delay.as_secs_f64(), l.tier_count);
        }

        if let Some(r) = &self.rest {
            info!("  REST:         sent={} ok={} fail={} cancelled={} rate={:.2}%",
                r.requests_sent, r.requests_succeeded, r.requests_failed,
                r.requests_cancelled, r.success_rate * 100.0);
        }

        for d in &self.dispatchers {
            info!("  Dispatcher:   {} linked={} applied={} ignored={} resync={} failed={} dropped={} pending={}",
                d.name, d.is_linked, d.applied, d.ignored, d.resync_required,
                d.failed, d.dropped, d.pending());
        }

        for b in &self.order_books {
            info!("  OrderBook:    {} [{}] status={} u={} snapshots={} gaps={} diffs={}",
                b.symbol, b.mode, b.status, b.last_update_id,
                b.snapshots_fetched, b.gaps_detected, b.diffs_applied);
        }

        for t in &self.trade_windows {
            info!("  Trades:       {} [{}] status={} len={}/{} resyncs={} gaps={}",
                t.symbol, t.kind, t.status, t.len, t.window_size, t.resyncs, t.gaps_detected);
        }

        for c in &self.candle_series {
            info!("  Candles:      {} [{}] status={} len={}/{} appended={} replaced={}",
                c.symbol, c.interval, c.status, c.len, c.window_size, c.appended, c.replaced);
        }
    }

    /// Print compact single-line stats for periodic logging
    pub fn print_compact(&self, elapsed_secs: u64) {
        let weight = self.limiter.as_ref().map(|l| l.admitted_weight).unwrap_or(0);
        let delayed = self.limiter.as_ref().map(|l| l.delayed_calls).unwrap_or(0);

        info!("[{:>3}s] applied={} pending={} | resyncs={} gaps={} errs={} | weight={} delayed={} rest_ok={:.1}%",
            elapsed_secs,
            self.total_applied(), self.total_pending(),
            self.total_resyncs(), self.total_gaps(), self.total_errors(),
            weight, delayed, self.rest_success_percent());
    }
}

impl fmt::Display for UnifiedMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UnifiedMetrics(caches={}, applied={}, resyncs={}, errors={})",
            self.dispatchers.len(),
            self.total_applied(),
            self.total_resyncs(),
            self.total_errors()
        )
    }
}

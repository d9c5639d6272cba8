// Core Type Definitions for the Market Cache
// Domain values shared by the REST client, stream sources and caches

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

impl FromStr for OrderSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(OrderSide::Buy),
            "SELL" => Ok(OrderSide::Sell),
            _ => Err(format!("Invalid order side: {}", s)),
        }
    }
}

/// Synchronization state of a cache against its REST baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Empty,
    Synchronizing,
    Synced,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Kline intervals supported by Binance USDⓈ-M futures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KlineInterval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "3m")]
    ThreeMinutes,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "2h")]
    TwoHours,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "8h")]
    EightHours,
    #[serde(rename = "12h")]
    TwelveHours,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "3d")]
    ThreeDays,
    #[serde(rename = "1w")]
    OneWeek,
    #[serde(rename = "1M")]
    OneMonth,
}

impl KlineInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            KlineInterval::OneMinute => "1m",
            KlineInterval::ThreeMinutes => "3m",
            KlineInterval::FiveMinutes => "5m",
            KlineInterval::FifteenMinutes => "15m",
            KlineInterval::ThirtyMinutes => "30m",
            KlineInterval::OneHour => "1h",
            KlineInterval::TwoHours => "2h",
            KlineInterval::FourHours => "4h",
            KlineInterval::SixHours => "6h",
            KlineInterval::EightHours => "8h",
            KlineInterval::TwelveHours => "12h",
            KlineInterval::OneDay => "1d",
            KlineInterval::ThreeDays => "3d",
            KlineInterval::OneWeek => "1w",
            KlineInterval::OneMonth => "1M",
        }
    }

    /// Nominal bar length in milliseconds (a month is counted as 30 days)
    pub fn duration_ms(&self) -> i64 {
        const MINUTE: i64 = 60_000;
        match self {
            KlineInterval::OneMinute => MINUTE,
            KlineInterval::ThreeMinutes => 3 * MINUTE,
            KlineInterval::FiveMinutes => 5 * MINUTE,
            KlineInterval::FifteenMinutes => 15 * MINUTE,
            KlineInterval::ThirtyMinutes => 30 * MINUTE,
            KlineInterval::OneHour => 60 * MINUTE,
            KlineInterval::TwoHours => 120 * MINUTE,
            KlineInterval::FourHours => 240 * MINUTE,
            KlineInterval::SixHours => 360 * MINUTE,
            KlineInterval::EightHours => 480 * MINUTE,
            KlineInterval::TwelveHours => 720 * MINUTE,
            KlineInterval::OneDay => 1_440 * MINUTE,
            KlineInterval::ThreeDays => 4_320 * MINUTE,
            KlineInterval::OneWeek => 10_080 * MINUTE,
            KlineInterval::OneMonth => 43_200 * MINUTE,
        }
    }
}

impl fmt::Display for KlineInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KlineInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // "1M" (month) and "1m" (minute) differ only by case
        match s {
            "1m" => Ok(KlineInterval::OneMinute),
            "3m" => Ok(KlineInterval::ThreeMinutes),
            "5m" => Ok(KlineInterval::FiveMinutes),
            "15m" => Ok(KlineInterval::FifteenMinutes),
            "30m" => Ok(KlineInterval::ThirtyMinutes),
            "1h" => Ok(KlineInterval::OneHour),
            "2h" => Ok(KlineInterval::TwoHours),
            "4h" => Ok(KlineInterval::FourHours),
            "6h" => Ok(KlineInterval::SixHours),
            "8h" => Ok(KlineInterval::EightHours),
            "12h" => Ok(KlineInterval::TwelveHours),
            "1d" => Ok(KlineInterval::OneDay),
            "3d" => Ok(KlineInterval::ThreeDays),
            "1w" => Ok(KlineInterval::OneWeek),
            "1M" => Ok(KlineInterval::OneMonth),
            _ => Err(format!("Invalid kline interval: {}", s)),
        }
    }
}

// ============================================================================
// PriceLevel
// ============================================================================

/// A price level [price, quantity]; quantity 0 marks a removal in a diff
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub quantity: f64,
}

impl PriceLevel {
    pub fn new(price: f64, quantity: f64) -> Self {
        Self { price, quantity }
    }

    pub fn is_removal(&self) -> bool {
        self.quantity == 0.0
    }

    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }
}

impl fmt::Display for PriceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PriceLevel(price={:.2}, qty={:.4})", self.price, self.quantity)
    }
}

// ============================================================================
// OrderBookSnapshot
// ============================================================================

/// Immutable copy of an order book: bids best-first (descending), asks
/// best-first (ascending)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub timestamp: i64,
}

impl OrderBookSnapshot {
    pub fn new(
        symbol: String,
        last_update_id: u64,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        timestamp: i64,
    ) -> Self {
        Self {
            symbol,
            last_update_id,
            bids,
            asks,
            timestamp,
        }
    }

    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    pub fn mid_price(&self) -> Option<f64> {
        let best_bid = self.best_bid()?;
        let best_ask = self.best_ask()?;
        Some((best_bid.price + best_ask.price) / 2.0)
    }

    pub fn spread(&self) -> Option<f64> {
        let best_bid = self.best_bid()?;
        let best_ask = self.best_ask()?;
        Some(best_ask.price - best_bid.price)
    }

    pub fn spread_bps(&self) -> Option<f64> {
        let mid = self.mid_price()?;
        if mid == 0.0 {
            return None;
        }
        Some(self.spread()? / mid * 10_000.0)
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

impl fmt::Display for OrderBookSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OrderBookSnapshot(symbol={}, update_id={}, bids={}, asks={})",
            self.symbol, self.last_update_id, self.bids.len(), self.asks.len()
        )
    }
}

// ============================================================================
// DepthEvent
// ============================================================================

/// Decoded depth stream event (diff, or a top-N push in partial-depth mode)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthEvent {
    pub symbol: String,
    pub event_time: i64,
    pub first_update_id: u64,
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl DepthEvent {
    pub fn new(
        symbol: &str,
        first_update_id: u64,
        last_update_id: u64,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
    ) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            event_time: 0,
            first_update_id,
            last_update_id,
            bids,
            asks,
        }
    }
}

impl fmt::Display for DepthEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DepthEvent(symbol={}, U={}, u={}, bids={}, asks={})",
            self.symbol,
            self.first_update_id,
            self.last_update_id,
            self.bids.len(),
            self.asks.len()
        )
    }
}

// ============================================================================
// TradeRecord
// ============================================================================

/// A plain or aggregated trade. `id` is the sequence key used for gap checks;
/// aggregated trades also carry the range of constituent trade ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub id: i64,
    pub price: f64,
    pub quantity: f64,
    pub timestamp: i64, // milliseconds
    pub is_buyer_maker: bool,
    pub first_trade_id: Option<i64>,
    pub last_trade_id: Option<i64>,
}

impl TradeRecord {
    pub fn new(symbol: &str, id: i64, price: f64, quantity: f64, timestamp: i64, is_buyer_maker: bool) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            id,
            price,
            quantity,
            timestamp,
            is_buyer_maker,
            first_trade_id: None,
            last_trade_id: None,
        }
    }

    pub fn side(&self) -> OrderSide {
        if self.is_buyer_maker {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        }
    }

    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }
}

impl fmt::Display for TradeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Trade(symbol={}, id={}, price={:.2}, qty={:.4}, side={})",
            self.symbol, self.id, self.price, self.quantity, self.side()
        )
    }
}

// ============================================================================
// Candlestick
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candlestick {
    pub symbol: String,
    pub interval: KlineInterval,
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trade_count: u64,
    pub taker_buy_volume: f64,
    pub taker_buy_quote_volume: f64,
    pub is_final: bool,
}

impl Candlestick {
    /// Flat bar at `price`, useful for seeding and tests
    pub fn flat(symbol: &str, interval: KlineInterval, open_time: i64, price: f64) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            interval,
            open_time,
            close_time: open_time + interval.duration_ms() - 1,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
            quote_volume: 0.0,
            trade_count: 0,
            taker_buy_volume: 0.0,
            taker_buy_quote_volume: 0.0,
            is_final: false,
        }
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }
}

impl fmt::Display for Candlestick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Candlestick(symbol={}, interval={}, t={}, O={:.2}, H={:.2}, L={:.2}, C={:.2}, final={})",
            self.symbol, self.interval, self.open_time, self.open, self.high, self.low, self.close, self.is_final
        )
    }
}

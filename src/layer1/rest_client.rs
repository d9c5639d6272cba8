// REST Client for Binance Futures market data
// Rate-limited snapshot source used by the caches to resync

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::config::BinanceConfig;
use crate::core::types::{Candlestick, KlineInterval, OrderBookSnapshot, PriceLevel, TradeRecord};
use crate::layer1::rate_limiter::{RateLimitError, RateLimiter};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum RestClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Malformed response: {0}")]
    Parse(String),
    #[error("Rate limiter error: {0}")]
    RateLimit(#[from] RateLimitError),
    #[error("Request cancelled")]
    Cancelled,
}

impl RestClientError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            RestClientError::Cancelled | RestClientError::RateLimit(RateLimitError::Cancelled)
        )
    }
}

// ============================================================================
// Request weights (Binance USDⓈ-M futures)
// ============================================================================

pub const TRADES_WEIGHT: u32 = 5;
pub const AGG_TRADES_WEIGHT: u32 = 20;

pub const MAX_DEPTH_LIMIT: u32 = 1000;
pub const MAX_TRADES_LIMIT: u32 = 1000;
pub const MAX_KLINES_LIMIT: u32 = 1500;

pub fn depth_weight(limit: u32) -> u32 {
    match limit {
        0..=50 => 2,
        51..=100 => 5,
        101..=500 => 10,
        _ => 20,
    }
}

pub fn klines_weight(limit: u32) -> u32 {
    match limit {
        0..=99 => 1,
        100..=499 => 2,
        500..=1000 => 5,
        _ => 10,
    }
}

// ============================================================================
// Market Data Source
// ============================================================================

/// Authoritative snapshot source. Every call is rate limited and observes
/// `cancel`; a failure means "resync not yet successful".
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch_order_book(
        &self,
        symbol: &str,
        depth: u32,
        cancel: &CancellationToken,
    ) -> Result<OrderBookSnapshot, RestClientError>;

    async fn fetch_recent_trades(
        &self,
        symbol: &str,
        limit: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<TradeRecord>, RestClientError>;

    async fn fetch_recent_aggregate_trades(
        &self,
        symbol: &str,
        limit: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<TradeRecord>, RestClientError>;

    async fn fetch_recent_candlesticks(
        &self,
        symbol: &str,
        interval: KlineInterval,
        limit: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<Candlestick>, RestClientError>;
}

// ============================================================================
// Raw response payloads
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawDepth {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    #[serde(rename = "E", default)]
    event_time: i64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    id: i64,
    price: String,
    qty: String,
    time: i64,
    #[serde(rename = "isBuyerMaker")]
    is_buyer_maker: bool,
}

#[derive(Debug, Deserialize)]
struct RawAggTrade {
    #[serde(rename = "a")]
    agg_id: i64,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    qty: String,
    #[serde(rename = "f")]
    first_trade_id: i64,
    #[serde(rename = "l")]
    last_trade_id: i64,
    #[serde(rename = "T")]
    time: i64,
    #[serde(rename = "m")]
    is_buyer_maker: bool,
}

/// open time, O, H, L, C, volume, close time, quote volume, trades,
/// taker buy base, taker buy quote, unused
type RawKline = (
    i64,
    String,
    String,
    String,
    String,
    String,
    i64,
    String,
    u64,
    String,
    String,
    String,
);

#[derive(Debug, Deserialize)]
struct RawApiError {
    code: i64,
    msg: String,
}

fn parse_decimal(field: &str, value: &str) -> Result<f64, RestClientError> {
    value
        .parse::<f64>()
        .map_err(|_| RestClientError::Parse(format!("{} is not a number: {:?}", field, value)))
}

fn parse_levels(raw: &[[String; 2]]) -> Result<Vec<PriceLevel>, RestClientError> {
    let mut levels = Vec::with_capacity(raw.len());
    for [price, qty] in raw {
        let level = PriceLevel::new(parse_decimal("price", price)?, parse_decimal("qty", qty)?);
        if !level.is_removal() {
            levels.push(level);
        }
    }
    Ok(levels)
}

fn parse_depth(symbol: &str, raw: RawDepth) -> Result<OrderBookSnapshot, RestClientError> {
    let mut bids = parse_levels(&raw.bids)?;
    let mut asks = parse_levels(&raw.asks)?;
    bids.sort_by(|a, b| b.price.total_cmp(&a.price));
    asks.sort_by(|a, b| a.price.total_cmp(&b.price));

    let timestamp = if raw.event_time > 0 {
        raw.event_time
    } else {
        chrono::Utc::now().timestamp_millis()
    };

    Ok(OrderBookSnapshot::new(
        symbol.to_uppercase(),
        raw.last_update_id,
        bids,
        asks,
        timestamp,
    ))
}

fn parse_trades(symbol: &str, raw: Vec<RawTrade>) -> Result<Vec<TradeRecord>, RestClientError> {
    raw.into_iter()
        .map(|t| -> Result<TradeRecord, RestClientError> {
            Ok(TradeRecord::new(
                symbol,
                t.id,
                parse_decimal("price", &t.price)?,
                parse_decimal("qty", &t.qty)?,
                t.time,
                t.is_buyer_maker,
            ))
        })
        .collect()
}

fn parse_agg_trades(symbol: &str, raw: Vec<RawAggTrade>) -> Result<Vec<TradeRecord>, RestClientError> {
    raw.into_iter()
        .map(|t| -> Result<TradeRecord, RestClientError> {
            let mut trade = TradeRecord::new(
                symbol,
                t.agg_id,
                parse_decimal("p", &t.price)?,
                parse_decimal("q", &t.qty)?,
                t.time,
                t.is_buyer_maker,
            );
            trade.first_trade_id = Some(t.first_trade_id);
            trade.last_trade_id = Some(t.last_trade_id);
            Ok(trade)
        })
        .collect()
}

fn parse_klines(
    symbol: &str,
    interval: KlineInterval,
    raw: Vec<RawKline>,
    now_ms: i64,
) -> Result<Vec<Candlestick>, RestClientError> {
    raw.into_iter()
        .map(|k| -> Result<Candlestick, RestClientError> {
            Ok(Candlestick {
                symbol: symbol.to_uppercase(),
                interval,
                open_time: k.0,
                open: parse_decimal("open", &k.1)?,
                high: parse_decimal("high", &k.2)?,
                low: parse_decimal("low", &k.3)?,
                close: parse_decimal("close", &k.4)?,
                volume: parse_decimal("volume", &k.5)?,
                close_time: k.6,
                quote_volume: parse_decimal("quote_volume", &k.7)?,
                trade_count: k.8,
                taker_buy_volume: parse_decimal("taker_buy_volume", &k.9)?,
                taker_buy_quote_volume: parse_decimal("taker_buy_quote_volume", &k.10)?,
                is_final: k.6 < now_ms,
            })
        })
        .collect()
}

// ============================================================================
// Client Statistics
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientCounters {
    requests_sent: u64,
    requests_succeeded: u64,
    requests_failed: u64,
    requests_cancelled: u64,
}

#[derive(Debug, Clone)]
pub struct RestClientStats {
    pub requests_sent: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub requests_cancelled: u64,
    pub success_rate: f64,
}

impl fmt::Display for RestClientStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RestClientStats(sent={}, ok={}, fail={}, cancelled={}, rate={:.2}%)",
            self.requests_sent,
            self.requests_succeeded,
            self.requests_failed,
            self.requests_cancelled,
            self.success_rate * 100.0
        )
    }
}

// ============================================================================
// Binance REST Client
// ============================================================================

/// Public market-data endpoints of Binance USDⓈ-M futures.
///
/// Every request first passes the shared [`RateLimiter`] with its documented
/// weight. There are no retries: a failed snapshot is retried by the cache on
/// the next qualifying event.
pub struct BinanceRestClient {
    base_url: String,
    client: Client,
    limiter: Arc<RateLimiter>,
    stats: RwLock<ClientCounters>,
}

impl BinanceRestClient {
    pub fn new(base_url: &str, timeout_seconds: u64, limiter: Arc<RateLimiter>) -> Result<Self, RestClientError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            limiter,
            stats: RwLock::new(ClientCounters::default()),
        })
    }

    pub fn from_config(config: &BinanceConfig, limiter: Arc<RateLimiter>) -> Result<Self, RestClientError> {
        Self::new(&config.base_url, config.request_timeout_seconds, limiter)
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Rate-limited GET; the limiter wait and the HTTP exchange both observe `cancel`
    async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
        weight: u32,
        cancel: &CancellationToken,
    ) -> Result<T, RestClientError> {
        match self.limiter.delay(weight, cancel).await {
            Ok(_) => {}
            Err(RateLimitError::Cancelled) => {
                self.stats.write().requests_cancelled += 1;
                return Err(RestClientError::Cancelled);
            }
            Err(e) => return Err(e.into()),
        }

        let url = format!("{}{}", self.base_url, endpoint);
        self.stats.write().requests_sent += 1;
        debug!(endpoint = endpoint, weight = weight, "Sending request");

        let exchange = async {
            let response = self.client.get(&url).query(params).send().await?;
            let status = response.status();
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, body))
        };

        let (status, body) = tokio::select! {
            _ = cancel.cancelled() => {
                self.stats.write().requests_cancelled += 1;
                return Err(RestClientError::Cancelled);
            }
            result = exchange => match result {
                Ok(pair) => pair,
                Err(e) => {
                    self.stats.write().requests_failed += 1;
                    warn!(endpoint = endpoint, error = %e, "Request failed");
                    return Err(RestClientError::Http(e));
                }
            },
        };

        if !status.is_success() {
            self.stats.write().requests_failed += 1;
            let (code, message) = match serde_json::from_str::<RawApiError>(&body) {
                Ok(api) => (api.code, api.msg),
                Err(_) => (status.as_u16() as i64, body),
            };
            warn!(endpoint = endpoint, code = code, message = %message, "API error");
            return Err(RestClientError::Api { code, message });
        }

        match serde_json::from_str::<T>(&body) {
            Ok(value) => {
                self.stats.write().requests_succeeded += 1;
                Ok(value)
            }
            Err(e) => {
                self.stats.write().requests_failed += 1;
                warn!(endpoint = endpoint, error = %e, "Undecodable response");
                Err(RestClientError::Json(e))
            }
        }
    }

    pub fn get_stats(&self) -> RestClientStats {
        let stats = self.stats.read();
        let finished = stats.requests_succeeded + stats.requests_failed;
        RestClientStats {
            requests_sent: stats.requests_sent,
            requests_succeeded: stats.requests_succeeded,
            requests_failed: stats.requests_failed,
            requests_cancelled: stats.requests_cancelled,
            success_rate: if finished > 0 {
                stats.requests_succeeded as f64 / finished as f64
            } else {
                0.0
            },
        }
    }
}

#[async_trait]
impl MarketDataSource for BinanceRestClient {
    async fn fetch_order_book(
        &self,
        symbol: &str,
        depth: u32,
        cancel: &CancellationToken,
    ) -> Result<OrderBookSnapshot, RestClientError> {
        let depth = depth.clamp(1, MAX_DEPTH_LIMIT);
        let params = [("symbol", symbol.to_uppercase()), ("limit", depth.to_string())];
        let raw: RawDepth = self.get("/fapi/v1/depth", &params, depth_weight(depth), cancel).await?;
        parse_depth(symbol, raw)
    }

    async fn fetch_recent_trades(
        &self,
        symbol: &str,
        limit: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<TradeRecord>, RestClientError> {
        let limit = limit.clamp(1, MAX_TRADES_LIMIT);
        let params = [("symbol", symbol.to_uppercase()), ("limit", limit.to_string())];
        let raw: Vec<RawTrade> = self.get("/fapi/v1/trades", &params, TRADES_WEIGHT, cancel).await?;
        parse_trades(symbol, raw)
    }

    async fn fetch_recent_aggregate_trades(
        &self,
        symbol: &str,
        limit: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<TradeRecord>, RestClientError> {
        let limit = limit.clamp(1, MAX_TRADES_LIMIT);
        let params = [("symbol", symbol.to_uppercase()), ("limit", limit.to_string())];
        let raw: Vec<RawAggTrade> = self.get("/fapi/v1/aggTrades", &params, AGG_TRADES_WEIGHT, cancel).await?;
        parse_agg_trades(symbol, raw)
    }

    async fn fetch_recent_candlesticks(
        &self,
        symbol: &str,
        interval: KlineInterval,
        limit: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<Candlestick>, RestClientError> {
        let limit = limit.clamp(1, MAX_KLINES_LIMIT);
        let params = [
            ("symbol", symbol.to_uppercase()),
            ("interval", interval.as_str().to_string()),
            ("limit", limit.to_string()),
        ];
        let raw: Vec<RawKline> = self.get("/fapi/v1/klines", &params, klines_weight(limit), cancel).await?;
        parse_klines(symbol, interval, raw, chrono::Utc::now().timestamp_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> BinanceRestClient {
        BinanceRestClient::new(
            "https://testnet.binancefuture.com/",
            10,
            Arc::new(RateLimiter::binance_futures()),
        )
        .unwrap()
    }

    #[test]
    fn test_request_weights() {
        assert_eq!(depth_weight(5), 2);
        assert_eq!(depth_weight(50), 2);
        assert_eq!(depth_weight(100), 5);
        assert_eq!(depth_weight(500), 10);
        assert_eq!(depth_weight(1000), 20);

        assert_eq!(klines_weight(99), 1);
        assert_eq!(klines_weight(100), 2);
        assert_eq!(klines_weight(500), 5);
        assert_eq!(klines_weight(1500), 10);
    }

    #[test]
    fn test_parse_depth_sorts_and_drops_zero() {
        let body = r#"{
            "lastUpdateId": 1027024,
            "E": 1589436922972,
            "T": 1589436922959,
            "bids": [["9999.0", "1.0"], ["10000.0", "2.5"], ["9998.0", "0.0"]],
            "asks": [["10011.0", "1.0"], ["10010.0", "3.0"]]
        }"#;
        let raw: RawDepth = serde_json::from_str(body).unwrap();
        let snapshot = parse_depth("btcusdt", raw).unwrap();

        assert_eq!(snapshot.symbol, "BTCUSDT");
        assert_eq!(snapshot.last_update_id, 1027024);
        assert_eq!(snapshot.timestamp, 1589436922972);
        assert_eq!(snapshot.bids.len(), 2);
        assert_eq!(snapshot.best_bid().unwrap().price, 10000.0);
        assert_eq!(snapshot.best_ask().unwrap().price, 10010.0);
    }

    #[test]
    fn test_parse_depth_rejects_bad_number() {
        let body = r#"{"lastUpdateId": 1, "bids": [["abc", "1.0"]], "asks": []}"#;
        let raw: RawDepth = serde_json::from_str(body).unwrap();
        assert!(matches!(parse_depth("BTCUSDT", raw), Err(RestClientError::Parse(_))));
    }

    #[test]
    fn test_parse_trades() {
        let body = r#"[
            {"id": 28457, "price": "4.00000100", "qty": "12.00000000", "quoteQty": "48.00",
             "time": 1499865549590, "isBuyerMaker": true}
        ]"#;
        let raw: Vec<RawTrade> = serde_json::from_str(body).unwrap();
        let trades = parse_trades("BTCUSDT", raw).unwrap();

        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].id, 28457);
        assert_eq!(trades[0].quantity, 12.0);
        assert!(trades[0].first_trade_id.is_none());
    }

    #[test]
    fn test_parse_agg_trades() {
        let body = r#"[
            {"a": 26129, "p": "0.01633102", "q": "4.70443515", "f": 27781, "l": 27783,
             "T": 1498793709153, "m": false}
        ]"#;
        let raw: Vec<RawAggTrade> = serde_json::from_str(body).unwrap();
        let trades = parse_agg_trades("BTCUSDT", raw).unwrap();

        assert_eq!(trades[0].id, 26129);
        assert_eq!(trades[0].first_trade_id, Some(27781));
        assert_eq!(trades[0].last_trade_id, Some(27783));
        assert!(!trades[0].is_buyer_maker);
    }

    #[test]
    fn test_parse_klines_marks_open_bar() {
        let body = r#"[
            [60000, "1.0", "2.0", "0.5", "1.5", "100.0", 119999, "150.0", 42, "60.0", "90.0", "0"],
            [120000, "1.5", "1.6", "1.4", "1.45", "10.0", 179999, "14.5", 7, "5.0", "7.2", "0"]
        ]"#;
        let raw: Vec<RawKline> = serde_json::from_str(body).unwrap();
        let candles = parse_klines("BTCUSDT", KlineInterval::OneMinute, raw, 150_000).unwrap();

        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].open_time, 60_000);
        assert_eq!(candles[0].high, 2.0);
        assert_eq!(candles[0].trade_count, 42);
        assert!(candles[0].is_final);
        assert!(!candles[1].is_final);
    }

    #[test]
    fn test_client_creation_from_config() {
        let config = BinanceConfig::default();
        let limiter = Arc::new(RateLimiter::from_config(&config).unwrap());
        let client = BinanceRestClient::from_config(&config, limiter);
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let client = test_client();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = client.fetch_order_book("BTCUSDT", 1000, &cancel).await;
        assert!(matches!(result, Err(RestClientError::Cancelled)));

        let stats = client.get_stats();
        assert_eq!(stats.requests_sent, 0);
        assert_eq!(stats.requests_cancelled, 1);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[test]
    fn test_cancellation_classification() {
        assert!(RestClientError::Cancelled.is_cancelled());
        assert!(RestClientError::from(RateLimitError::Cancelled).is_cancelled());
        assert!(!RestClientError::Parse("x".to_string()).is_cancelled());
    }
}

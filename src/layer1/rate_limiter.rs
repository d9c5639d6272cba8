// Rate Limiter - multi-tier sliding window admission for REST calls
// One Arc<RateLimiter> is shared by every client so all resyncs are paced together

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::config::BinanceConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Cancelled while waiting for admission")]
    Cancelled,
}

/// One (count, duration) rule with the timestamps it has admitted
struct Tier {
    id: String,
    count: u32,
    duration: Duration,
    admitted: VecDeque<Instant>,
}

impl Tier {
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.admitted.front() {
            if now.duration_since(oldest) >= self.duration {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time until `weight` more units fit; zero when they fit now.
    /// A weight above `count` fits once the window is empty.
    fn wait_for(&self, now: Instant, weight: usize) -> Duration {
        let len = self.admitted.len();
        let excess = (len + weight).saturating_sub(self.count as usize);
        if excess == 0 || len == 0 {
            return Duration::ZERO;
        }

        let must_expire = self.admitted[excess.min(len) - 1];
        (must_expire + self.duration).saturating_duration_since(now)
    }

    fn admit(&mut self, now: Instant, weight: usize) {
        for _ in 0..weight.min(self.count as usize) {
            self.admitted.push_back(now);
        }
    }
}

/// Configured tier as reported by [`RateLimiter::tiers`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierInfo {
    pub id: String,
    pub count: u32,
    pub duration: Duration,
    pub in_window: usize,
}

#[derive(Debug, Clone, Default)]
struct LimiterCounters {
    admitted_calls: u64,
    admitted_weight: u64,
    delayed_calls: u64,
    total_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub admitted_calls: u64,
    pub admitted_weight: u64,
    pub delayed_calls: u64,
    pub total_delay: Duration,
    pub tier_count: usize,
}

impl fmt::Display for RateLimiterStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RateLimiterStats(calls={}, weight={}, delayed={}, total_delay={:.3}s, tiers={})",
            self.admitted_calls,
            self.admitted_weight,
            self.delayed_calls,
            self.total_delay.as_secs_f64(),
            self.tier_count
        )
    }
}

/// Sliding-window rate limiter; a call is admitted only when every tier
/// admits it. All tier state sits behind one mutex, never held across an await.
pub struct RateLimiter {
    tiers: Mutex<Vec<Tier>>,
    stats: Mutex<LimiterCounters>,
}

impl RateLimiter {
    /// Limiter with no tiers (admits everything until configured)
    pub fn new() -> Self {
        Self {
            tiers: Mutex::new(Vec::new()),
            stats: Mutex::new(LimiterCounters::default()),
        }
    }

    /// Binance USDⓈ-M futures public limit: 2400 request weight per minute
    pub fn binance_futures() -> Self {
        let limiter = Self::new();
        limiter.install("request_weight", 2400, Duration::from_secs(60));
        limiter
    }

    pub fn from_config(config: &BinanceConfig) -> Result<Self, RateLimitError> {
        let limiter = Self::new();
        for tier in &config.rate_limit_tiers {
            limiter.configure(&tier.id, tier.count, Duration::from_millis(tier.duration_ms))?;
        }
        Ok(limiter)
    }

    /// Register or replace a tier. Replacing keeps the admission history.
    pub fn configure(&self, tier_id: &str, count: u32, duration: Duration) -> Result<(), RateLimitError> {
        if count == 0 {
            return Err(RateLimitError::InvalidArgument(format!(
                "tier '{}' count must be > 0",
                tier_id
            )));
        }
        if duration.is_zero() {
            return Err(RateLimitError::InvalidArgument(format!(
                "tier '{}' duration must be > 0",
                tier_id
            )));
        }

        self.install(tier_id, count, duration);
        info!(tier = tier_id, count = count, duration_ms = duration.as_millis() as u64, "Rate limit tier configured");
        Ok(())
    }

    fn install(&self, tier_id: &str, count: u32, duration: Duration) {
        let mut tiers = self.tiers.lock();
        match tiers.iter_mut().find(|t| t.id == tier_id) {
            Some(tier) => {
                tier.count = count;
                tier.duration = duration;
            }
            None => tiers.push(Tier {
                id: tier_id.to_string(),
                count,
                duration,
                admitted: VecDeque::with_capacity(count as usize),
            }),
        }
    }

    pub fn remove(&self, tier_id: &str) -> bool {
        let mut tiers = self.tiers.lock();
        let before = tiers.len();
        tiers.retain(|t| t.id != tier_id);
        before != tiers.len()
    }

    pub fn tiers(&self) -> Vec<TierInfo> {
        let mut tiers = self.tiers.lock();
        let now = Instant::now();
        tiers
            .iter_mut()
            .map(|tier| {
                tier.prune(now);
                TierInfo {
                    id: tier.id.clone(),
                    count: tier.count,
                    duration: tier.duration,
                    in_window: tier.admitted.len(),
                }
            })
            .collect()
    }

    /// Wait until `weight` units are admissible under every tier, then record
    /// the admission in all tiers at once. Returns the time spent waiting.
    pub async fn delay(&self, weight: u32, cancel: &CancellationToken) -> Result<Duration, RateLimitError> {
        let weight = weight.max(1) as usize;
        let started = Instant::now();
        let mut was_delayed = false;

        loop {
            if cancel.is_cancelled() {
                return Err(RateLimitError::Cancelled);
            }

            let wait = {
                let mut tiers = self.tiers.lock();
                let now = Instant::now();
                let mut wait = Duration::ZERO;
                for tier in tiers.iter_mut() {
                    tier.prune(now);
                    wait = wait.max(tier.wait_for(now, weight));
                }
                if wait.is_zero() {
                    for tier in tiers.iter_mut() {
                        tier.admit(now, weight);
                    }
                }
                wait
            };

            if wait.is_zero() {
                let waited = started.elapsed();
                let mut stats = self.stats.lock();
                stats.admitted_calls += 1;
                stats.admitted_weight += weight as u64;
                if was_delayed {
                    stats.delayed_calls += 1;
                    stats.total_delay += waited;
                }
                return Ok(waited);
            }

            was_delayed = true;
            debug!(weight = weight, wait_ms = wait.as_millis() as u64, "Rate limit reached, delaying request");

            tokio::select! {
                _ = cancel.cancelled() => return Err(RateLimitError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    pub fn get_stats(&self) -> RateLimiterStats {
        let stats = self.stats.lock();
        RateLimiterStats {
            admitted_calls: stats.admitted_calls,
            admitted_weight: stats.admitted_weight,
            delayed_calls: stats.delayed_calls,
            total_delay: stats.total_delay,
            tier_count: self.tiers.lock().len(),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

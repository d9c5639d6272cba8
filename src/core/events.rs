// Event System for the Market Cache
// Typed callback registry + tokio broadcast fan-out for cache notifications

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Handle returned when registering a callback; pass it back to unsubscribe
pub type ListenerId = Uuid;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

// ============================================================================
// Out-of-sync notification
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutOfSyncReason {
    /// Cache had no state yet (first event or after a reset)
    Initial,
    /// Incoming sequence id skipped past the expected one
    Gap { expected: u64, received: u64 },
}

impl fmt::Display for OutOfSyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutOfSyncReason::Initial => write!(f, "initial"),
            OutOfSyncReason::Gap { expected, received } => {
                write!(f, "gap(expected={}, received={})", expected, received)
            }
        }
    }
}

/// Fired by a cache before it attempts a REST resync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutOfSync {
    pub symbol: String,
    pub source: String,
    pub reason: OutOfSyncReason,
    pub timestamp: i64,
}

impl OutOfSync {
    pub fn new(symbol: &str, source: &str, reason: OutOfSyncReason) -> Self {
        Self {
            symbol: symbol.to_string(),
            source: source.to_string(),
            reason,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

impl fmt::Display for OutOfSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OutOfSync(symbol={}, source={}, reason={})",
            self.symbol, self.source, self.reason
        )
    }
}

// ============================================================================
// Subscribers
// ============================================================================

#[derive(Debug, Clone, Default)]
struct SubscriberCounters {
    total_published: u64,
    total_delivered: u64,
    callback_panics: u64,
}

/// Snapshot of registry statistics
#[derive(Debug, Clone)]
pub struct SubscriberStats {
    pub total_published: u64,
    pub total_delivered: u64,
    pub callback_panics: u64,
    pub subscriber_count: usize,
    pub channel_receivers: usize,
}

impl fmt::Display for SubscriberStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SubscriberStats(published={}, delivered={}, panics={}, callbacks={}, receivers={})",
            self.total_published,
            self.total_delivered,
            self.callback_panics,
            self.subscriber_count,
            self.channel_receivers
        )
    }
}

/// Callback registry with a parallel broadcast channel.
///
/// `publish` copies the registered callbacks out of the lock before invoking
/// them, so callbacks may subscribe/unsubscribe from inside a notification and
/// each registered callback sees a given value at most once.
pub struct Subscribers<T: Clone + Send + 'static> {
    name: String,
    callbacks: RwLock<Vec<(ListenerId, Callback<T>)>>,
    tx: broadcast::Sender<T>,
    stats: RwLock<SubscriberCounters>,
}

impl<T: Clone + Send + 'static> Subscribers<T> {
    pub fn new(name: &str) -> Self {
        Self::with_capacity(name, 1024)
    }

    pub fn with_capacity(name: &str, channel_capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(channel_capacity.max(1));

        Self {
            name: name.to_string(),
            callbacks: RwLock::new(Vec::new()),
            tx,
            stats: RwLock::new(SubscriberCounters::default()),
        }
    }

    /// Register a callback invoked on every publish
    pub fn subscribe<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.callbacks.write().push((id, Arc::new(callback)));
        debug!(registry = %self.name, listener = %id, "Listener registered");
        id
    }

    /// Remove a callback; returns false if the id was unknown
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        before != callbacks.len()
    }

    /// Get a receiver for all values published from now on
    pub fn subscribe_channel(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Deliver `value` to every registered callback and channel receiver
    pub fn publish(&self, value: T) {
        let callbacks: Vec<Callback<T>> = self
            .callbacks
            .read()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        let mut delivered = 0u64;
        let mut panics = 0u64;
        for callback in &callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(&value))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    panics += 1;
                    warn!(registry = %self.name, "Listener panicked");
                }
            }
        }

        // No receivers is fine
        let _ = self.tx.send(value);

        let mut stats = self.stats.write();
        stats.total_published += 1;
        stats.total_delivered += delivered;
        stats.callback_panics += panics;
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().len()
    }

    pub fn get_stats(&self) -> SubscriberStats {
        let stats = self.stats.read();
        SubscriberStats {
            total_published: stats.total_published,
            total_delivered: stats.total_delivered,
            callback_panics: stats.callback_panics,
            subscriber_count: self.callbacks.read().len(),
            channel_receivers: self.tx.receiver_count(),
        }
    }
}

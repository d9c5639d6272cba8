// Ordered Event Dispatcher
// Unbounded FIFO + single consumer task; events are applied strictly in arrival order

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::events::{ListenerId, Subscribers};
use crate::layer1::rest_client::RestClientError;
use crate::layer1::stream::{StreamError, StreamSubscription};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Not linked to an event stream")]
    NotLinked,
    #[error("REST error: {0}")]
    Rest(#[from] RestClientError),
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),
    #[error("Cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            SyncError::Cancelled => true,
            SyncError::Rest(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

// ============================================================================
// Apply contract
// ============================================================================

/// Result of applying one event to a cache
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome<S> {
    /// State changed; carries an immutable copy for subscribers
    Applied(S),
    /// Stale, duplicate or foreign event; state unchanged
    Ignored,
    /// Resync could not be completed; retried on the next qualifying event
    ResyncRequired,
}

/// Per-event state transition run by the dispatcher's single consumer.
///
/// `apply_event` may suspend (REST resync, rate limiter, gap delay) and must
/// observe `cancel` while doing so.
#[async_trait]
pub trait ApplyEvent: Send + Sync + 'static {
    type Event: Send + 'static;
    type Snapshot: Clone + Send + Sync + 'static;

    async fn apply_event(
        &self,
        event: Self::Event,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome<Self::Snapshot>, SyncError>;

    /// True when sequence-sensitive state cannot tolerate a multiplexed stream
    fn requires_exclusive_stream(&self) -> bool {
        false
    }
}

/// Callback attached with a link; invoked before the broadcast listeners
pub type UpdateCallback<S> = Arc<dyn Fn(&S) + Send + Sync>;

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone, Default)]
struct DispatchCounters {
    posted: u64,
    received: u64,
    applied: u64,
    ignored: u64,
    resync_required: u64,
    failed: u64,
    dropped: u64,
    links: u64,
}

#[derive(Debug, Clone)]
pub struct DispatcherStats {
    pub name: String,
    pub is_linked: bool,
    pub posted: u64,
    pub received: u64,
    pub applied: u64,
    pub ignored: u64,
    pub resync_required: u64,
    pub failed: u64,
    pub dropped: u64,
    pub links: u64,
}

impl DispatcherStats {
    pub fn pending(&self) -> u64 {
        self.posted.saturating_sub(self.received + self.dropped)
    }
}

impl fmt::Display for DispatcherStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Dispatcher({}, linked={}, received={}, applied={}, ignored={}, resync={}, failed={}, dropped={})",
            self.name,
            self.is_linked,
            self.received,
            self.applied,
            self.ignored,
            self.resync_required,
            self.failed,
            self.dropped
        )
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

struct Link<E> {
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<E>,
    forwarder: JoinHandle<()>,
    consumer: JoinHandle<()>,
}

/// Serializes event application for one handler.
///
/// Producers (the linked stream and [`post`](Self::post)) never block. One
/// consumer task applies queued events one at a time; while an apply is
/// suspended new events keep queuing behind it.
pub struct OrderedDispatcher<H: ApplyEvent> {
    name: String,
    handler: Arc<H>,
    link: Mutex<Option<Link<H::Event>>>,
    updates: Arc<Subscribers<H::Snapshot>>,
    stats: Arc<RwLock<DispatchCounters>>,
}

impl<H: ApplyEvent> OrderedDispatcher<H> {
    pub fn new(name: &str, handler: Arc<H>) -> Self {
        Self {
            name: name.to_string(),
            handler,
            link: Mutex::new(None),
            updates: Arc::new(Subscribers::new(name)),
            stats: Arc::new(RwLock::new(DispatchCounters::default())),
        }
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Attach the upstream subscription and start the consumer.
    ///
    /// The link lives until [`unlink`](Self::unlink) or until `cancel` fires.
    /// A link left behind by a cancelled parent token is joined first, so the
    /// old consumer has finished before the new one starts.
    pub async fn link(
        &self,
        subscription: StreamSubscription<H::Event>,
        callback: Option<UpdateCallback<H::Snapshot>>,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        self.join_cancelled().await;

        let mut slot = self.link.lock();

        if slot.is_some() {
            return Err(SyncError::InvalidState(format!(
                "{} is already linked to a stream",
                self.name
            )));
        }
        if subscription.multiplexed && self.handler.requires_exclusive_stream() {
            return Err(SyncError::InvalidState(format!(
                "{} requires an exclusive stream, got multiplexed '{}'",
                self.name, subscription.stream_name
            )));
        }

        let link_cancel = cancel.child_token();
        let (tx, rx) = mpsc::unbounded_channel();
        let stream_name = subscription.stream_name.clone();

        let forwarder = tokio::spawn(forward(
            subscription,
            tx.clone(),
            link_cancel.clone(),
            Arc::clone(&self.stats),
        ));
        let consumer = tokio::spawn(consume(
            self.name.clone(),
            Arc::clone(&self.handler),
            rx,
            link_cancel.clone(),
            callback,
            Arc::clone(&self.updates),
            Arc::clone(&self.stats),
        ));

        *slot = Some(Link {
            cancel: link_cancel,
            tx,
            forwarder,
            consumer,
        });
        self.stats.write().links += 1;

        info!(dispatcher = %self.name, stream = %stream_name, "Dispatcher linked");
        Ok(())
    }

    /// Wait for the tasks of a link whose token was cancelled and clear it.
    /// Returns false when there was no such link.
    pub async fn join_cancelled(&self) -> bool {
        let stale = {
            let mut slot = self.link.lock();
            match slot.as_ref() {
                Some(existing) if existing.cancel.is_cancelled() => slot.take(),
                _ => None,
            }
        };
        let Some(stale) = stale else {
            return false;
        };

        debug!(dispatcher = %self.name, "Joining cancelled link");
        self.join(stale).await;
        true
    }

    /// Stop the consumer, drop whatever is still queued and wait for the
    /// tasks to exit. Returns false when nothing was linked.
    pub async fn unlink(&self) -> bool {
        let link = self.link.lock().take();
        let Some(link) = link else {
            return false;
        };

        self.join(link).await;
        info!(dispatcher = %self.name, "Dispatcher unlinked");
        true
    }

    async fn join(&self, link: Link<H::Event>) {
        link.cancel.cancel();
        drop(link.tx);

        if let Err(e) = link.forwarder.await {
            warn!(dispatcher = %self.name, error = %e, "Forwarder task ended abnormally");
        }
        if let Err(e) = link.consumer.await {
            warn!(dispatcher = %self.name, error = %e, "Consumer task ended abnormally");
        }
    }

    /// Enqueue an event; never blocks
    pub fn post(&self, event: H::Event) -> Result<(), SyncError> {
        let slot = self.link.lock();
        let link = slot.as_ref().ok_or(SyncError::NotLinked)?;
        if link.cancel.is_cancelled() {
            return Err(SyncError::NotLinked);
        }

        link.tx.send(event).map_err(|_| SyncError::NotLinked)?;
        self.stats.write().posted += 1;
        Ok(())
    }

    pub fn is_linked(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .map(|link| !link.cancel.is_cancelled())
            .unwrap_or(false)
    }

    pub fn on_update<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&H::Snapshot) + Send + Sync + 'static,
    {
        self.updates.subscribe(callback)
    }

    pub fn updates(&self) -> broadcast::Receiver<H::Snapshot> {
        self.updates.subscribe_channel()
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.updates.unsubscribe(id)
    }

    pub fn get_stats(&self) -> DispatcherStats {
        let is_linked = self.is_linked();
        let stats = self.stats.read();
        DispatcherStats {
            name: self.name.clone(),
            is_linked,
            posted: stats.posted,
            received: stats.received,
            applied: stats.applied,
            ignored: stats.ignored,
            resync_required: stats.resync_required,
            failed: stats.failed,
            dropped: stats.dropped,
            links: stats.links,
        }
    }
}

impl<H: ApplyEvent> Drop for OrderedDispatcher<H> {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.cancel.cancel();
        }
    }
}

// ============================================================================
// Tasks
// ============================================================================

async fn forward<E: Send + 'static>(
    mut subscription: StreamSubscription<E>,
    tx: mpsc::UnboundedSender<E>,
    cancel: CancellationToken,
    stats: Arc<RwLock<DispatchCounters>>,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = subscription.cancel.cancelled() => break,
            event = subscription.events.recv() => match event {
                Some(event) => {
                    if tx.send(event).is_err() {
                        break;
                    }
                    stats.write().posted += 1;
                }
                None => break,
            },
        }
    }

    debug!(stream = %subscription.stream_name, "Stream forwarder stopped");
    subscription.close();
}

async fn consume<H: ApplyEvent>(
    name: String,
    handler: Arc<H>,
    mut rx: mpsc::UnboundedReceiver<H::Event>,
    cancel: CancellationToken,
    callback: Option<UpdateCallback<H::Snapshot>>,
    updates: Arc<Subscribers<H::Snapshot>>,
    stats: Arc<RwLock<DispatchCounters>>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        stats.write().received += 1;

        let result = AssertUnwindSafe(handler.apply_event(event, &cancel))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(ApplyOutcome::Applied(snapshot))) => {
                stats.write().applied += 1;
                if cancel.is_cancelled() {
                    break;
                }
                if let Some(callback) = &callback {
                    if catch_unwind(AssertUnwindSafe(|| callback(&snapshot))).is_err() {
                        warn!(dispatcher = %name, "Update callback panicked");
                    }
                }
                updates.publish(snapshot);
            }
            Ok(Ok(ApplyOutcome::Ignored)) => {
                stats.write().ignored += 1;
            }
            Ok(Ok(ApplyOutcome::ResyncRequired)) => {
                stats.write().resync_required += 1;
            }
            Ok(Err(e)) if e.is_cancelled() => break,
            Ok(Err(e)) => {
                stats.write().failed += 1;
                warn!(dispatcher = %name, error = %e, "Failed to apply event");
            }
            Err(panic) => {
                stats.write().failed += 1;
                warn!(dispatcher = %name, panic = %panic_message(panic.as_ref()), "Apply panicked");
            }
        }
    }

    rx.close();
    let mut dropped = 0u64;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        debug!(dispatcher = %name, dropped = dropped, "Queued events dropped on unlink");
    }
    stats.write().dropped += dropped;
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

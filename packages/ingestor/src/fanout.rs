//! Realtime Fan-out
//!
//! Broadcasts newly stored transactions to connected dashboard sessions. The
//! subscriber registry is owned here and handed to the transport layer by
//! reference; membership changes only on connect and disconnect and is never
//! persisted. Delivery is best-effort: a subscriber whose buffer is full or
//! closed is evicted without affecting the others.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::publisher::{PublishError, Publisher, RealtimeMessage};
use crate::transaction::Transaction;

/// Messages buffered per subscriber before it counts as a failed write
pub const SUBSCRIBER_BUFFER: usize = 64;

/// How long a broadcast waits on the Redis mirror before giving up on it
pub const MIRROR_TIMEOUT: Duration = Duration::from_secs(2);

/// Transport-independent handle for one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Outcome of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Subscribers the message was queued for
    pub delivered: usize,
    /// Subscribers evicted because the write failed
    pub evicted: usize,
    /// Whether the Redis mirror accepted the message
    pub mirrored: bool,
}

/// Set of live subscribers
#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<SubscriberId, mpsc::Sender<String>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber; the receiver yields serialized messages
    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<String>) {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        (id, rx)
    }

    /// Remove a subscriber; returns whether it was still registered
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue `payload` for every subscriber, evicting those that cannot take it.
    ///
    /// # Returns
    /// `(delivered, evicted)` counts
    pub fn send_all(&self, payload: &str) -> (usize, usize) {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|id, sender| match sender.try_send(payload.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Evicting subscriber {}: buffer full", id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Evicting subscriber {}: connection closed", id);
                false
            }
        });
        let delivered = subscribers.len();
        (delivered, before - delivered)
    }
}

/// Fan-out component: the subscriber registry plus an optional Redis mirror
pub struct FanOut {
    registry: SubscriberRegistry,
    mirror: Option<Publisher>,
    mirror_timeout: Duration,
}

impl Default for FanOut {
    fn default() -> Self {
        Self::new()
    }
}

impl FanOut {
    /// Fan-out to websocket subscribers only
    pub fn new() -> Self {
        Self {
            registry: SubscriberRegistry::new(),
            mirror: None,
            mirror_timeout: MIRROR_TIMEOUT,
        }
    }

    /// Fan-out that also mirrors every message to Redis
    pub fn with_mirror(mirror: Publisher) -> Self {
        Self {
            registry: SubscriberRegistry::new(),
            mirror: Some(mirror),
            mirror_timeout: MIRROR_TIMEOUT,
        }
    }

    /// Override how long a broadcast waits on the Redis mirror
    pub fn mirror_timeout(mut self, timeout: Duration) -> Self {
        self.mirror_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<String>) {
        let (id, rx) = self.registry.subscribe();
        info!("Subscriber {} connected ({} live)", id, self.registry.len());
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.registry.unsubscribe(id) {
            info!("Subscriber {} disconnected ({} live)", id, self.registry.len());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    /// Broadcast a stored transaction to every live subscriber.
    ///
    /// Must only be called after the store confirmed the insert.
    pub async fn broadcast(&self, transaction: &Transaction) -> BroadcastReport {
        let message = RealtimeMessage::NewPix(transaction.clone());
        let payload = match message.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode realtime message for {}: {}", transaction.transaction_id, e);
                return BroadcastReport::default();
            }
        };

        let (delivered, evicted) = self.registry.send_all(&payload);

        let mirrored = match &self.mirror {
            Some(publisher) => match bounded_publish(
                publisher.publish_message(&message),
                self.mirror_timeout,
            )
            .await
            {
                Ok(_) => true,
                Err(e) => {
                    warn!(
                        "Redis mirror publish to {} failed for {}: {}",
                        publisher.channel(),
                        transaction.transaction_id,
                        e
                    );
                    false
                }
            },
            None => false,
        };

        debug!(
            transaction_id = %transaction.transaction_id,
            delivered, evicted, mirrored, "broadcast complete"
        );
        BroadcastReport {
            delivered,
            evicted,
            mirrored,
        }
    }
}

/// Await a mirror publish for at most `timeout`
///
/// The websocket subscribers have already been served by the time this runs;
/// a stalled Redis must not hold up the ingest that triggered the broadcast.
async fn bounded_publish<F>(publish: F, timeout: Duration) -> Result<i64, PublishError>
where
    F: Future<Output = Result<i64, PublishError>>,
{
    tokio::time::timeout(timeout, publish)
        .await
        .unwrap_or(Err(PublishError::Timeout(timeout)))
}

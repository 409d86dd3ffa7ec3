use std::collections::{BTreeSet, HashMap};

use tokio::sync::mpsc;

/// Per-subscriber queue capacity. A producer that falls this far behind is
/// dropped rather than stalling the publisher.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 32;

/// Identifies one live subscriber.
pub type SubscriberId = u64;

/// A producer's end of the distribution channel.
///
/// Yields one asset key per needed cover. The receiver closes when the
/// subscriber is dropped from the channel (overflow or unsubscribe).
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub rx: mpsc::Receiver<String>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Publish/subscribe fan-out of newly needed asset keys.
///
/// Every subscriber receives every newly needed key (at-least-once
/// broadcast). Late joiners are replayed the currently announced set.
#[derive(Debug, Default)]
pub struct CoverChannel {
    subscribers: HashMap<SubscriberId, mpsc::Sender<String>>,
    next_id: SubscriberId,
    announced: BTreeSet<String>,
}

impl CoverChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber and queue every announced key for it.
    pub fn subscribe(&mut self) -> Subscription {
        let capacity = SUBSCRIBER_QUEUE_CAPACITY.max(self.announced.len());
        let (tx, rx) = mpsc::channel(capacity);
        for key in &self.announced {
            // Cannot fail: the queue is empty and sized for the backlog.
            let _ = tx.try_send(key.clone());
        }

        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.insert(id, tx);
        tracing::debug!(subscriber = id, backlog = self.announced.len(), "cover subscriber joined");

        Subscription { id, rx }
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        let removed = self.subscribers.remove(&id).is_some();
        if removed {
            tracing::debug!(subscriber = id, "cover subscriber left");
        }
        removed
    }

    /// Publish the keys in `needed` that were not announced before, then
    /// remember `needed` as the announced set. Returns the number of newly
    /// announced keys.
    pub fn notify_needed_changed(&mut self, needed: &BTreeSet<String>) -> usize {
        let fresh: Vec<String> = needed.difference(&self.announced).cloned().collect();
        for key in &fresh {
            self.publish(key);
        }
        let count = fresh.len();
        self.announced = needed.clone();
        count
    }

    /// Forget the announced set. Subscribers stay connected.
    pub fn reset(&mut self) {
        self.announced.clear();
    }

    pub fn announced(&self) -> &BTreeSet<String> {
        &self.announced
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn publish(&mut self, key: &str) {
        self.subscribers.retain(|id, tx| match tx.try_send(key.to_owned()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(subscriber = *id, "cover subscriber queue full, dropping subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(subscriber = *id, "cover subscriber gone");
                false
            }
        });
    }
}

//! Live status fan-out
//!
//! Every observer gets its own bounded queue. Publishing never waits: an
//! observer whose queue is full is evicted and must reconnect for a fresh
//! snapshot. Dropping a [`Subscription`] deregisters it immediately.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wirewarp_proto::LiveMessage;

struct ObserverSlot {
    tx: mpsc::Sender<LiveMessage>,
    evicted: CancellationToken,
}

/// Broadcast set of connected observers
pub struct StatusHub {
    observers: Arc<DashMap<u64, ObserverSlot>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl StatusHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            observers: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Join the broadcast set. Anything published after this call is queued
    /// for the new observer.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        let evicted = CancellationToken::new();

        self.observers.insert(
            id,
            ObserverSlot {
                tx,
                evicted: evicted.clone(),
            },
        );
        debug!(observer_id = id, "Observer subscribed");

        Subscription {
            id,
            rx,
            evicted,
            observers: self.observers.clone(),
        }
    }

    /// Queue a message for every observer without blocking
    pub fn publish(&self, message: LiveMessage) {
        let mut dead = Vec::new();

        for slot in self.observers.iter() {
            match slot.tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        observer_id = *slot.key(),
                        capacity = self.capacity,
                        "Observer queue full, forcing disconnect"
                    );
                    dead.push(*slot.key());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*slot.key()),
            }
        }

        for id in dead {
            if let Some((_, slot)) = self.observers.remove(&id) {
                slot.evicted.cancel();
            }
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}

/// One observer's membership in the broadcast set
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<LiveMessage>,
    evicted: CancellationToken,
    observers: Arc<DashMap<u64, ObserverSlot>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next queued message; `None` once the observer has been evicted
    pub async fn recv(&mut self) -> Option<LiveMessage> {
        tokio::select! {
            biased;
            _ = self.evicted.cancelled() => None,
            msg = self.rx.recv() => msg,
        }
    }

    /// Already-queued message, if any
    pub fn try_recv(&mut self) -> Option<LiveMessage> {
        if self.evicted.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.observers.remove(&self.id).is_some() {
            debug!(observer_id = self.id, "Observer unsubscribed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn removed() -> LiveMessage {
        LiveMessage::AgentRemoved {
            agent_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_all_observers() {
        let hub = StatusHub::new(8);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        let msg = removed();
        hub.publish(msg.clone());

        assert_eq!(a.recv().await, Some(msg.clone()));
        assert_eq!(b.recv().await, Some(msg));
    }

    #[tokio::test]
    async fn test_overflow_evicts_only_the_slow_observer() {
        let hub = StatusHub::new(2);
        let mut slow = hub.subscribe();
        let mut fast = hub.subscribe();

        for _ in 0..2 {
            hub.publish(removed());
            assert!(fast.recv().await.is_some());
        }
        hub.publish(removed());

        assert!(slow.is_evicted());
        assert_eq!(slow.recv().await, None);
        assert!(!fast.is_evicted());
        assert!(fast.recv().await.is_some());
        assert_eq!(hub.observer_count(), 1);
    }

    #[tokio::test]
    async fn test_drop_deregisters_synchronously() {
        let hub = StatusHub::new(4);
        let sub = hub.subscribe();
        assert_eq!(hub.observer_count(), 1);

        drop(sub);
        assert_eq!(hub.observer_count(), 0);

        // Nothing left to deliver to
        hub.publish(removed());
    }
}

//! Fan-out of [`Event`]s to every connected subscriber.
//!
//! Each subscriber owns the receiving half of a small bounded queue; the hub
//! keeps the sending halves in a registry. Subscribing, unsubscribing and
//! broadcasting all take the same lock, so a broadcast works on one consistent
//! snapshot of the registry and a removed subscriber is never delivered to.
//!
//! Delivery never waits on a subscriber:
//! * a closed queue means the subscriber went away, and it is removed during
//!   the same broadcast pass;
//! * a full queue still holds an undelivered event, and since every event
//!   tells the subscriber to re-read the credential, the new one is coalesced
//!   into it.
//!
//! The hub keeps no history. A consumer that was not subscribed while a
//! broadcast happened learns about the new credential the next time it asks
//! for one.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::events::Event;

/// Identifies a subscriber within its hub.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Receiving end handed out by [`NotificationHub::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Waits for the next event.
    ///
    /// Returns `None` once the hub has dropped this subscriber.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

#[derive(Debug, Default)]
struct Registry {
    next_id: u64,
    subscribers: HashMap<SubscriberId, mpsc::Sender<Event>>,
}

#[derive(Debug)]
pub struct NotificationHub {
    registry: Mutex<Registry>,
    capacity: usize,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHub {
    /// Events a subscriber can have queued before new ones are coalesced.
    const DEFAULT_CAPACITY: usize = 8;

    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Creates a hub whose subscribers queue up to `capacity` events.
    ///
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);

        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let id = SubscriberId(registry.next_id);
        registry.next_id += 1;
        registry.subscribers.insert(id, tx);
        debug!("subscriber {id} registered ({} total)", registry.subscribers.len());

        Subscription { id, rx }
    }

    /// Removes a subscriber. Returns whether it was still registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = registry.subscribers.remove(&id).is_some();
        if removed {
            debug!("subscriber {id} removed ({} left)", registry.subscribers.len());
        }

        removed
    }

    /// Delivers `event` to every registered subscriber.
    ///
    /// Returns the number of subscribers that have the event queued afterwards.
    pub fn broadcast(&self, event: Event) -> usize {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);

        registry.subscribers.retain(|id, tx| match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!("subscriber {id} has {event} pending already");
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!("subscriber {id} disconnected; removing");
                false
            }
        });

        let delivered = registry.subscribers.len();
        debug!("broadcast {event} to {delivered} subscriber(s)");
        delivered
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .len()
    }
}

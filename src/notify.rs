use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::DomainEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Fan-out of committed domain events to in-process collaborators
/// (billing, notifications, monitoring). Per-apartment channels plus one
/// firehose that sees everything. Delivery is best-effort: a lagging or
/// absent subscriber never affects the transaction that produced the event.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<DomainEvent>>,
    all: broadcast::Sender<DomainEvent>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Events for one apartment. Creates the channel if needed and drops
    /// channels whose subscribers have all gone away.
    pub fn subscribe(&self, apartment_id: Ulid) -> broadcast::Receiver<DomainEvent> {
        self.prune();
        self.channels
            .entry(apartment_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Events for every apartment.
    pub fn subscribe_all(&self) -> broadcast::Receiver<DomainEvent> {
        self.all.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, event: &DomainEvent) {
        let apartment_id = event.apartment_id();
        let orphaned = self
            .channels
            .get(&apartment_id)
            .is_some_and(|sender| sender.send(event.clone()).is_err());
        if orphaned {
            self.channels
                .remove_if(&apartment_id, |_, sender| sender.receiver_count() == 0);
        }
        let _ = self.all.send(event.clone());
    }

    pub fn remove(&self, apartment_id: &Ulid) {
        self.channels.remove(apartment_id);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

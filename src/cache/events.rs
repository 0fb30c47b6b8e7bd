//! Change notification.
//!
//! Defines change events, the subscription capability the dispatcher wires into,
//! and `ChangeBus`, an in-process notifier for hosts without their own signal
//! mechanism.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use metrics::counter;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::domain::{ChangeKind, EntityInstance, EntityType};

const METRIC_CHANGE_EVENT: &str = "viewcache_change_event_total";

/// Monotonic epoch for ordering events within this process.
pub type Epoch = u64;

pub type SubscriptionId = u64;

/// Notification that an entity instance was created, updated, or deleted.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    /// Unique identifier for idempotency (UUIDv4).
    pub id: Uuid,
    pub epoch: Epoch,
    pub kind: ChangeKind,
    pub instance: EntityInstance,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, instance: EntityInstance, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            kind,
            instance,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Receiver of change events. Handlers are fire-and-forget: they report their own
/// failures and never fail the publisher.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn handle(&self, event: &ChangeEvent);
}

/// Capability to subscribe handlers to change events of one entity type.
pub trait ChangeNotifier: Send + Sync {
    fn subscribe(
        &self,
        entity_type: &EntityType,
        kinds: &BTreeSet<ChangeKind>,
        handler: Arc<dyn ChangeHandler>,
    ) -> SubscriptionId;
}

struct Subscriber {
    id: SubscriptionId,
    kinds: BTreeSet<ChangeKind>,
    handler: Arc<dyn ChangeHandler>,
}

/// In-process change notifier.
///
/// `publish` awaits every matching handler concurrently, so a write path that
/// publishes sees its invalidations done when the call returns.
pub struct ChangeBus {
    subscribers: DashMap<String, Vec<Subscriber>>,
    epoch_counter: AtomicU64,
    subscription_counter: AtomicU64,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            epoch_counter: AtomicU64::new(0),
            subscription_counter: AtomicU64::new(0),
        }
    }

    /// Get the next epoch number.
    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Publish a change and deliver it to every subscribed handler.
    ///
    /// Returns the number of handlers notified.
    pub async fn publish(&self, kind: ChangeKind, instance: EntityInstance) -> usize {
        let event = ChangeEvent::new(kind, instance, self.next_epoch());
        self.dispatch(&event).await
    }

    /// Deliver an already-built event.
    pub async fn dispatch(&self, event: &ChangeEvent) -> usize {
        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_kind = %event.kind,
            entity = %event.instance,
            "Change event published"
        );
        counter!(METRIC_CHANGE_EVENT, "kind" => event.kind.as_str()).increment(1);

        let handlers: Vec<Arc<dyn ChangeHandler>> = self
            .subscribers
            .get(event.instance.entity_tag())
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter(|subscriber| subscriber.kinds.contains(&event.kind))
                    .map(|subscriber| Arc::clone(&subscriber.handler))
                    .collect()
            })
            .unwrap_or_default();

        join_all(handlers.iter().map(|handler| handler.handle(event))).await;
        handlers.len()
    }

    pub async fn created(&self, instance: EntityInstance) -> usize {
        self.publish(ChangeKind::Created, instance).await
    }

    pub async fn updated(&self, instance: EntityInstance) -> usize {
        self.publish(ChangeKind::Updated, instance).await
    }

    pub async fn deleted(&self, instance: EntityInstance) -> usize {
        self.publish(ChangeKind::Deleted, instance).await
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        for mut entry in self.subscribers.iter_mut() {
            let before = entry.len();
            entry.retain(|subscriber| subscriber.id != id);
            removed |= entry.len() != before;
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.iter().map(|entry| entry.len()).sum()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier for ChangeBus {
    fn subscribe(
        &self,
        entity_type: &EntityType,
        kinds: &BTreeSet<ChangeKind>,
        handler: Arc<dyn ChangeHandler>,
    ) -> SubscriptionId {
        let id = self.subscription_counter.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .entry(entity_type.tag().to_string())
            .or_default()
            .push(Subscriber {
                id,
                kinds: kinds.clone(),
                handler,
            });
        id
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(ChangeKind, String)>>,
    }

    #[async_trait]
    impl ChangeHandler for Recorder {
        async fn handle(&self, event: &ChangeEvent) {
            self.seen
                .lock()
                .expect("recorder lock")
                .push((event.kind, event.instance.id().to_string()));
        }
    }

    fn post() -> EntityType {
        EntityType::new("Post")
    }

    #[test]
    fn event_creation() {
        let event = ChangeEvent::new(ChangeKind::Updated, EntityInstance::new(&post(), "7"), 42);
        assert_eq!(event.epoch, 42);
        assert_eq!(event.kind, ChangeKind::Updated);
        assert!(!event.id.is_nil());
    }

    #[test]
    fn epoch_monotonicity() {
        let bus = ChangeBus::new();
        let e1 = bus.next_epoch();
        let e2 = bus.next_epoch();
        assert!(e1 < e2);
    }

    #[tokio::test]
    async fn delivers_only_subscribed_kinds_and_types() {
        let bus = ChangeBus::new();
        let recorder = Arc::new(Recorder::default());
        bus.subscribe(
            &post(),
            &BTreeSet::from([ChangeKind::Updated]),
            recorder.clone(),
        );

        assert_eq!(bus.updated(EntityInstance::new(&post(), "7")).await, 1);
        assert_eq!(bus.created(EntityInstance::new(&post(), "8")).await, 0);
        assert_eq!(
            bus.updated(EntityInstance::new(&EntityType::new("Comment"), "1"))
                .await,
            0
        );

        let seen = recorder.seen.lock().expect("recorder lock").clone();
        assert_eq!(seen, vec![(ChangeKind::Updated, "7".to_string())]);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = ChangeBus::new();
        let recorder = Arc::new(Recorder::default());
        let id = bus.subscribe(
            &post(),
            &BTreeSet::from(ChangeKind::ALL),
            recorder.clone(),
        );
        assert_eq!(bus.subscriber_count(), 1);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.deleted(EntityInstance::new(&post(), "7")).await, 0);
        assert!(recorder.seen.lock().expect("recorder lock").is_empty());
    }
}

//! In-process broadcast of change events over bounded per-subscriber
//! queues.
//!
//! Producers never block: a full queue drops its oldest event and the loss
//! is stamped on the subscriber's next delivery.
use crate::utils::now_ms;
use shared::{ChangeEvent, SubscriptionFilter};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// One received event plus how many older events were dropped before it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub event: ChangeEvent,
    pub dropped: u64,
}

struct SubscriberQueue {
    filter: SubscriptionFilter,
    queue: Mutex<VecDeque<ChangeEvent>>,
    dropped: AtomicU64,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

pub struct SubscriptionBus {
    subscribers: Mutex<HashMap<u64, Arc<SubscriberQueue>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl SubscriptionBus {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            capacity: capacity.max(1),
        })
    }

    pub fn subscribe(self: &Arc<Self>, filter: SubscriptionFilter) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue {
            filter,
            queue: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity: self.capacity,
        });
        self.subscribers.lock().unwrap().insert(id, queue.clone());
        Subscription {
            id,
            queue,
            bus: self.clone(),
        }
    }

    /// Fans the event out to every matching subscriber without blocking.
    pub fn publish(&self, event: &ChangeEvent) {
        let subscribers: Vec<Arc<SubscriberQueue>> =
            self.subscribers.lock().unwrap().values().cloned().collect();
        for subscriber in subscribers {
            if subscriber.closed.load(Ordering::SeqCst) {
                continue;
            }
            if !subscriber.filter.matches(event) {
                continue;
            }
            {
                let mut queue = subscriber.queue.lock().unwrap();
                if queue.len() == subscriber.capacity {
                    queue.pop_front();
                    subscriber.dropped.fetch_add(1, Ordering::SeqCst);
                }
                queue.push_back(event.clone());
            }
            subscriber.notify.notify_one();
        }
    }

    /// Delivers the final `Shutdown` event and closes every queue.
    pub fn shutdown(&self) {
        self.publish(&ChangeEvent::Shutdown {
            timestamp_ms: now_ms(),
        });
        let mut subscribers = self.subscribers.lock().unwrap();
        for subscriber in subscribers.values() {
            subscriber.closed.store(true, Ordering::SeqCst);
            subscriber.notify.notify_one();
        }
        subscribers.clear();
    }

    fn unsubscribe(&self, id: u64) {
        if let Some(subscriber) = self.subscribers.lock().unwrap().remove(&id) {
            subscriber.closed.store(true, Ordering::SeqCst);
            subscriber.notify.notify_one();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

/// Handle to one subscriber's event stream. Dropping it unregisters the
/// subscriber and releases its queue.
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    bus: Arc<SubscriptionBus>,
}

impl Subscription {
    /// Next event in FIFO order, or `None` once closed and drained.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            let notified = self.queue.notify.notified();
            if let Some(event) = self.queue.queue.lock().unwrap().pop_front() {
                let dropped = self.queue.dropped.swap(0, Ordering::SeqCst);
                return Some(Delivery { event, dropped });
            }
            if self.queue.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    /// Non-blocking variant; `None` means empty, not closed.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        let event = self.queue.queue.lock().unwrap().pop_front()?;
        let dropped = self.queue.dropped.swap(0, Ordering::SeqCst);
        Some(Delivery { event, dropped })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::EventKind;
    use shared::event::ChangeSource;
    use shared::Value;

    fn changed(name: &str, v: i64) -> ChangeEvent {
        ChangeEvent::PropertyChanged {
            name: name.to_string(),
            old_value: None,
            new_value: Value::Int(v),
            timestamp_ms: now_ms(),
            source: ChangeSource::Monitor,
        }
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = SubscriptionBus::new(16);
        let mut sub = bus.subscribe(SubscriptionFilter::All);
        bus.publish(&changed("a", 1));
        bus.publish(&changed("b", 2));
        assert_eq!(sub.recv().await.unwrap().event.property_name(), Some("a"));
        assert_eq!(sub.recv().await.unwrap().event.property_name(), Some("b"));
    }

    #[tokio::test]
    async fn filters_route_per_subscriber() {
        let bus = SubscriptionBus::new(16);
        let mut hp_only = bus.subscribe(SubscriptionFilter::Properties(vec!["hp".into()]));
        let mut kinds = bus.subscribe(SubscriptionFilter::Kinds(vec![EventKind::MapperLoaded]));

        bus.publish(&changed("hp", 1));
        bus.publish(&changed("mp", 2));
        bus.publish(&ChangeEvent::MapperLoaded {
            name: "red".into(),
            timestamp_ms: 0,
        });

        assert_eq!(hp_only.try_recv().unwrap().event.property_name(), Some("hp"));
        assert!(hp_only.try_recv().is_none(), "mp and MapperLoaded filtered");
        assert_eq!(kinds.try_recv().unwrap().event.kind(), EventKind::MapperLoaded);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_stamps_next_delivery() {
        let bus = SubscriptionBus::new(2);
        let mut sub = bus.subscribe(SubscriptionFilter::All);
        bus.publish(&changed("x", 1));
        bus.publish(&changed("x", 2));
        bus.publish(&changed("x", 3));
        bus.publish(&changed("x", 4));

        let delivery = sub.recv().await.unwrap();
        assert_eq!(delivery.dropped, 2, "events 1 and 2 were evicted");
        let ChangeEvent::PropertyChanged { new_value, .. } = delivery.event else {
            panic!("wrong kind");
        };
        assert_eq!(new_value, Value::Int(3), "oldest went first");
    }

    #[tokio::test]
    async fn shutdown_is_the_final_delivery() {
        let bus = SubscriptionBus::new(16);
        let mut sub = bus.subscribe(SubscriptionFilter::Properties(vec!["hp".into()]));
        bus.publish(&changed("hp", 1));
        bus.shutdown();

        assert_eq!(
            sub.recv().await.unwrap().event.kind(),
            EventKind::PropertyChanged
        );
        assert_eq!(sub.recv().await.unwrap().event.kind(), EventKind::Shutdown);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn a_full_subscriber_does_not_block_publishers_or_peers() {
        let bus = SubscriptionBus::new(1);
        let mut slow = bus.subscribe(SubscriptionFilter::All);
        let mut live = bus.subscribe(SubscriptionFilter::All);

        for i in 0..100 {
            bus.publish(&changed("x", i));
        }

        // The slow subscriber kept only the newest event.
        let delivery = slow.recv().await.unwrap();
        assert_eq!(delivery.dropped, 99);
        // The peer with the same capacity saw the same newest event,
        // independently.
        assert!(live.recv().await.is_some());
    }

    #[tokio::test]
    async fn dropping_a_subscription_unregisters_it() {
        let bus = SubscriptionBus::new(4);
        let sub = bus.subscribe(SubscriptionFilter::All);
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }
}

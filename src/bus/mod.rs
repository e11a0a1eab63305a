//! Topic-agnostic pub/sub decoupling producers (runner, phases, agents) from
//! consumers (CLI output, persistence pipeline, kanban engine).
//!
//! Standard subscribers get a bounded queue (default 1024); when it is full
//! the oldest event is dropped and the subscription's drop counter is
//! incremented, so a slow consumer can never stall a producer. Priority
//! subscribers invert the deal: the producer awaits queue capacity, so events
//! feeding the persistence pipeline are never lost.
//!
//! Delivery order to each subscriber equals publication order as that
//! subscriber observed it; there is no cross-subscriber ordering guarantee.

mod events;

pub use events::{BusEvent, BusEventKind, EventFilter};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc};

const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const PRIORITY_QUEUE_CAPACITY: usize = 8192;

/// One standard subscriber's queue. Drop-oldest on overflow.
struct DropOldestQueue {
    buffer: Mutex<VecDeque<BusEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl DropOldestQueue {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::new()),
            capacity,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn push(&self, event: BusEvent) {
        {
            let mut buffer = match self.buffer.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if buffer.len() >= self.capacity {
                buffer.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buffer.push_back(event);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<BusEvent> {
        let mut buffer = match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        buffer.pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

enum Delivery {
    Standard(Arc<DropOldestQueue>),
    Priority(mpsc::Sender<BusEvent>),
}

struct SubscriberSlot {
    id: u64,
    filter: EventFilter,
    project_id: Option<String>,
    delivery: Delivery,
}

/// A handle for consuming events. Dropping it detaches the subscriber.
pub struct Subscription {
    id: u64,
    bus: EventBus,
    inner: SubscriptionInner,
}

enum SubscriptionInner {
    Standard(Arc<DropOldestQueue>),
    Priority(mpsc::Receiver<BusEvent>),
}

impl Subscription {
    /// Receive the next event. Returns `None` once cancelled and drained.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        match &mut self.inner {
            SubscriptionInner::Priority(rx) => rx.recv().await,
            SubscriptionInner::Standard(queue) => loop {
                if let Some(event) = queue.pop() {
                    return Some(event);
                }
                if queue.closed.load(Ordering::SeqCst) {
                    return None;
                }
                queue.notify.notified().await;
            },
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        match &mut self.inner {
            SubscriptionInner::Priority(rx) => rx.try_recv().ok(),
            SubscriptionInner::Standard(queue) => queue.pop(),
        }
    }

    /// Events dropped from this subscription's queue to keep it bounded.
    /// Always zero for priority subscriptions.
    pub fn dropped(&self) -> u64 {
        match &self.inner {
            SubscriptionInner::Standard(queue) => queue.dropped.load(Ordering::Relaxed),
            SubscriptionInner::Priority(_) => 0,
        }
    }

    /// Detach from the bus and close the queue. Buffered events remain
    /// readable; after the drain, `recv` returns `None`.
    pub fn cancel(&mut self) {
        self.bus.remove_subscriber(self.id);
        if let SubscriptionInner::Standard(queue) = &self.inner {
            queue.close();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.remove_subscriber(self.id);
    }
}

/// The process-wide event bus. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    subscribers: Mutex<Vec<SubscriberSlot>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Publish an event to every matching subscriber.
    ///
    /// Non-blocking for standard subscribers. Awaits capacity on priority
    /// queues, so publishing suspends while the persistence pipeline is
    /// behind — and returns promptly if a priority subscriber goes away.
    pub async fn publish(&self, event: BusEvent) {
        let priority_targets: Vec<mpsc::Sender<BusEvent>> = {
            let subscribers = self.lock_subscribers();
            let mut targets = Vec::new();
            for slot in subscribers.iter() {
                if !slot_matches(slot, &event) {
                    continue;
                }
                match &slot.delivery {
                    Delivery::Standard(queue) => queue.push(event.clone()),
                    Delivery::Priority(tx) => targets.push(tx.clone()),
                }
            }
            targets
        };

        for tx in priority_targets {
            // A closed receiver just means the subscriber is gone.
            let _ = tx.send(event.clone()).await;
        }
    }

    /// Subscribe with a bounded drop-oldest queue.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.subscribe_with_capacity(filter, None, DEFAULT_QUEUE_CAPACITY)
    }

    /// Subscribe with a queue the producer must wait on. For consumers that
    /// must not lose events (the persistence pipeline).
    pub fn subscribe_priority(&self, filter: EventFilter) -> Subscription {
        let (tx, rx) = mpsc::channel(PRIORITY_QUEUE_CAPACITY);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock_subscribers().push(SubscriberSlot {
            id,
            filter,
            project_id: None,
            delivery: Delivery::Priority(tx),
        });
        Subscription {
            id,
            bus: self.clone(),
            inner: SubscriptionInner::Priority(rx),
        }
    }

    /// Standard subscription additionally filtered to one project.
    pub fn subscribe_for_project(&self, project_id: &str, filter: EventFilter) -> Subscription {
        self.subscribe_with_capacity(filter, Some(project_id.to_string()), DEFAULT_QUEUE_CAPACITY)
    }

    /// Standard subscription with an explicit queue capacity.
    pub fn subscribe_with_capacity(
        &self,
        filter: EventFilter,
        project_id: Option<String>,
        capacity: usize,
    ) -> Subscription {
        let queue = Arc::new(DropOldestQueue::new(capacity));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock_subscribers().push(SubscriberSlot {
            id,
            filter,
            project_id,
            delivery: Delivery::Standard(Arc::clone(&queue)),
        });
        Subscription {
            id,
            bus: self.clone(),
            inner: SubscriptionInner::Standard(queue),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    fn remove_subscriber(&self, id: u64) {
        self.lock_subscribers().retain(|slot| slot.id != id);
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<SubscriberSlot>> {
        match self.inner.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn slot_matches(slot: &SubscriberSlot, event: &BusEvent) -> bool {
    if let Some(ref project) = slot.project_id {
        if &event.project_id != project {
            return false;
        }
    }
    slot.filter.matches(event)
}

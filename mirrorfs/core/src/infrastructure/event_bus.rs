// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Fan-out of File Change Events
//
// Publishers hand events to a bounded queue. A single dispatcher task drains
// the queue and matches each event against the subscriber registry, which is
// keyed by the root-relative directory each observer is scoped to. Every match
// receives its own copy, re-expressed relative to its root, through a bounded
// per-subscriber buffer. A full buffer drops the event for that subscriber
// only, so one slow observer never stalls the others.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::config::EventBusConfig;
use crate::domain::events::{EventPublisher, FileEvent};

/// Event bus for publishing file events and subscribing by root directory
#[derive(Clone)]
pub struct EventBus {
    queue: mpsc::Sender<FileEvent>,
    registry: Arc<SubscriberRegistry>,
}

impl EventBus {
    /// Create the bus and spawn its dispatcher on the current runtime.
    ///
    /// The dispatcher exits once every `EventBus` handle has been dropped and
    /// the queue is drained.
    pub fn start(config: &EventBusConfig) -> (Self, JoinHandle<()>) {
        let (queue, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let registry = Arc::new(SubscriberRegistry::new(config.subscriber_buffer.max(1)));
        let dispatcher = tokio::spawn(dispatch_loop(receiver, registry.clone()));
        (Self { queue, registry }, dispatcher)
    }

    /// Open an observation stream for everything under `root`.
    pub fn subscribe(&self, root: &str) -> Subscription {
        self.registry.register(root)
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    /// Deliveries dropped because a subscriber buffer was full
    pub fn dropped_deliveries(&self) -> u64 {
        self.registry.dropped.load(Ordering::Relaxed)
    }
}

impl EventPublisher for EventBus {
    fn publish(&self, event: FileEvent) {
        let Some(event) = event.visible() else {
            debug!("Not publishing event for hidden file");
            return;
        };
        debug!(event = %event, "Publishing event");

        match self.queue.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                // Queue is saturated: wait for the dispatcher off the caller's path
                let queue = self.queue.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            if queue.send(event).await.is_err() {
                                warn!("Event bus closed while publishing");
                            }
                        });
                    }
                    Err(_) => {
                        if queue.blocking_send(event).is_err() {
                            warn!("Event bus closed while publishing");
                        }
                    }
                }
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                warn!(event = %event, "Event bus closed; dropping event");
            }
        }
    }
}

async fn dispatch_loop(mut receiver: mpsc::Receiver<FileEvent>, registry: Arc<SubscriberRegistry>) {
    info!("Event dispatcher started");
    while let Some(event) = receiver.recv().await {
        let delivered = registry.dispatch(&event);
        if delivered == 0 {
            debug!(event = %event, "No observers registered for event");
        }
    }
    info!("Event dispatcher stopped");
}

struct SubscriberSlot {
    id: u64,
    sender: mpsc::Sender<FileEvent>,
}

/// Live observation channels keyed by root directory.
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<String, Vec<SubscriberSlot>>>,
    next_id: AtomicU64,
    buffer: usize,
    dropped: AtomicU64,
}

impl SubscriberRegistry {
    fn new(buffer: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer,
            dropped: AtomicU64::new(0),
        }
    }

    fn register(self: &Arc<Self>, root: &str) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.subscribers
            .write()
            .entry(root.to_string())
            .or_default()
            .push(SubscriberSlot { id, sender });
        debug!(root = %root, id, "Observer registered");

        Subscription {
            id,
            root: root.to_string(),
            receiver,
            registry: Arc::downgrade(self),
        }
    }

    fn deregister(&self, root: &str, id: u64) {
        let mut subscribers = self.subscribers.write();
        if let Some(slots) = subscribers.get_mut(root) {
            slots.retain(|slot| slot.id != id);
            if slots.is_empty() {
                subscribers.remove(root);
            }
        }
        debug!(root = %root, id, "Observer deregistered");
    }

    fn len(&self) -> usize {
        self.subscribers.read().values().map(Vec::len).sum()
    }

    /// Fan `event` out to every subscriber whose root contains it.
    fn dispatch(&self, event: &FileEvent) -> usize {
        let subscribers = self.subscribers.read();
        let mut delivered = 0;

        for (root, slots) in subscribers.iter() {
            let Some(relative) = event.relative_to(root) else {
                continue;
            };
            for slot in slots {
                match slot.sender.try_send(relative.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(root = %root, id = slot.id, event = %relative, "Observer buffer full; event dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(root = %root, id = slot.id, "Observer gone before deregistration");
                    }
                }
            }
        }
        delivered
    }
}

/// A registered observer. Dropping it removes the registry entry.
pub struct Subscription {
    id: u64,
    root: String,
    receiver: mpsc::Receiver<FileEvent>,
    registry: Weak<SubscriberRegistry>,
}

impl Subscription {
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Receive the next event, `None` once the bus has shut down.
    pub async fn recv(&mut self) -> Option<FileEvent> {
        self.receiver.recv().await
    }
}

impl Stream for Subscription {
    type Item = FileEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<FileEvent>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(&self.root, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::FileEventKind;
    use std::time::Duration;
    use tokio::time::timeout;

    fn bus() -> EventBus {
        EventBus::start(&EventBusConfig::default()).0
    }

    #[tokio::test]
    async fn test_event_reaches_subscriber_under_root() {
        let bus = bus();
        let mut sub = bus.subscribe("/orgA/deptB");

        bus.publish(FileEvent::add("/orgA/deptB/x/y", 0o100644));

        let event = timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert_eq!(event.kind, FileEventKind::Add);
        assert_eq!(event.path, "/x/y");
    }

    #[tokio::test]
    async fn test_unrelated_and_sibling_roots_are_isolated() {
        let bus = bus();
        let mut target = bus.subscribe("/org/dept1");
        let mut unrelated = bus.subscribe("/orgC/deptD");
        let mut sibling = bus.subscribe("/org/dept10");

        bus.publish(FileEvent::modify("/org/dept1/a.txt", 0o100644));

        assert!(timeout(Duration::from_secs(1), target.recv()).await.unwrap().is_some());
        assert!(timeout(Duration::from_millis(100), unrelated.recv()).await.is_err());
        assert!(timeout(Duration::from_millis(100), sibling.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_ancestor_subscriber_also_receives() {
        let bus = bus();
        let mut org = bus.subscribe("/org");
        bus.publish(FileEvent::delete("/org/dept1/a.txt", 0o100644));
        let event = timeout(Duration::from_secs(1), org.recv()).await.unwrap().unwrap();
        assert_eq!(event.path, "/dept1/a.txt");
    }

    #[tokio::test]
    async fn test_hidden_files_are_not_published() {
        let bus = bus();
        let mut sub = bus.subscribe("/org/d");
        bus.publish(FileEvent::add("/org/d/.a.txt.swp", 0o100644));
        bus.publish(FileEvent::add("/org/d/a.txt", 0o100644));

        let event = timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert_eq!(event.path, "/a.txt");
    }

    #[tokio::test]
    async fn test_dropping_subscription_deregisters() {
        let bus = bus();
        let sub = bus.subscribe("/org/d");
        let other = bus.subscribe("/org/d");
        assert_eq!(bus.subscriber_count(), 2);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 1);
        drop(other);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_full_subscriber_does_not_stall_others() {
        let config = EventBusConfig {
            queue_capacity: 16,
            subscriber_buffer: 1,
        };
        let (bus, _dispatcher) = EventBus::start(&config);
        let _stalled = bus.subscribe("/org/d");
        let mut healthy = bus.subscribe("/org");

        bus.publish(FileEvent::add("/org/d/1", 0o100644));
        let first = timeout(Duration::from_secs(1), healthy.recv()).await.unwrap().unwrap();
        assert_eq!(first.path, "/d/1");

        bus.publish(FileEvent::add("/org/d/2", 0o100644));
        let second = timeout(Duration::from_secs(1), healthy.recv()).await.unwrap().unwrap();
        assert_eq!(second.path, "/d/2");

        assert_eq!(bus.dropped_deliveries(), 1);
    }
}

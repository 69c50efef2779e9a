//! Subscription registry for normalized protocol events.
//!
//! Handlers are kept per event name in registration order, plus a catch-all list.
//! Every registration hands back a [`Subscription`] that removes exactly that
//! handler when disposed. Dropping a `Subscription` leaves the handler in place.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use tokio::{sync::oneshot, time::timeout};

use crate::{lock, protocol::ProtocolEvent, BridgeError, Result};

pub type EventHandler = Arc<dyn Fn(&ProtocolEvent) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    next_id: u64,
    by_event: HashMap<String, Vec<(u64, EventHandler)>>,
    any: Vec<(u64, EventHandler)>,
}

#[derive(Debug, Clone)]
enum Slot {
    Event(String, u64),
    Any(u64),
}

pub struct Subscription {
    handlers: Weak<Mutex<Handlers>>,
    slot: Slot,
}

impl Subscription {
    pub fn dispose(self) {
        let Some(handlers) = self.handlers.upgrade() else {
            return;
        };
        let mut handlers = lock(&handlers);
        match &self.slot {
            Slot::Event(name, id) => {
                if let Some(list) = handlers.by_event.get_mut(name) {
                    list.retain(|(existing, _)| existing != id);
                    if list.is_empty() {
                        handlers.by_event.remove(name);
                    }
                }
            }
            Slot::Any(id) => handlers.any.retain(|(existing, _)| existing != id),
        }
    }
}

#[derive(Default, Clone)]
pub struct EventRegistry {
    handlers: Arc<Mutex<Handlers>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, event: &str, handler: EventHandler) -> Subscription {
        let mut handlers = lock(&self.handlers);
        handlers.next_id += 1;
        let id = handlers.next_id;
        handlers
            .by_event
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        Subscription {
            handlers: Arc::downgrade(&self.handlers),
            slot: Slot::Event(event.to_string(), id),
        }
    }

    pub fn on_any(&self, handler: EventHandler) -> Subscription {
        let mut handlers = lock(&self.handlers);
        handlers.next_id += 1;
        let id = handlers.next_id;
        handlers.any.push((id, handler));
        Subscription {
            handlers: Arc::downgrade(&self.handlers),
            slot: Slot::Any(id),
        }
    }

    /// Delivers `event` to named handlers first, then catch-all handlers.
    ///
    /// The handler lists are snapshotted before delivery, so a handler may
    /// subscribe or dispose without deadlocking.
    pub fn dispatch(&self, event: &ProtocolEvent) {
        let (named, any) = {
            let handlers = lock(&self.handlers);
            let named: Vec<EventHandler> = handlers
                .by_event
                .get(&event.event)
                .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default();
            let any: Vec<EventHandler> = handlers.any.iter().map(|(_, h)| h.clone()).collect();
            (named, any)
        };

        for handler in named {
            handler(event);
        }
        for handler in any {
            handler(event);
        }
    }

    /// Resolves on the next `event`, or fails after `wait_timeout`.
    /// The temporary handler is removed either way.
    pub async fn wait_for(&self, event: &str, wait_timeout: Duration) -> Result<ProtocolEvent> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let subscription = self.on(
            event,
            Arc::new(move |received: &ProtocolEvent| {
                if let Some(tx) = lock(&tx).take() {
                    let _ = tx.send(received.clone());
                }
            }),
        );

        let outcome = timeout(wait_timeout, rx).await;
        subscription.dispose();

        match outcome {
            Ok(Ok(received)) => Ok(received),
            Ok(Err(_)) => Err(BridgeError::Adapter(format!(
                "event listeners released while waiting for \"{event}\""
            ))),
            Err(_) => Err(BridgeError::timeout(format!("event \"{event}\""), wait_timeout)),
        }
    }

    /// Resolves on the next event whose name is in `events`.
    ///
    /// Listens as a catch-all registered after existing ones, so handlers that
    /// fold events into state have already run when this resolves.
    pub async fn wait_for_any(&self, events: &[&str], wait_timeout: Duration) -> Result<ProtocolEvent> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let wanted: Vec<String> = events.iter().map(|e| e.to_string()).collect();
        let subscription = self.on_any(Arc::new(move |received: &ProtocolEvent| {
            if !wanted.contains(&received.event) {
                return;
            }
            if let Some(tx) = lock(&tx).take() {
                let _ = tx.send(received.clone());
            }
        }));

        let outcome = timeout(wait_timeout, rx).await;
        subscription.dispose();

        match outcome {
            Ok(Ok(received)) => Ok(received),
            Ok(Err(_)) => Err(BridgeError::Adapter(
                "event listeners released while waiting".to_string(),
            )),
            Err(_) => Err(BridgeError::timeout(
                format!("one of {}", events.join(", ")),
                wait_timeout,
            )),
        }
    }

    pub fn catch_all_count(&self) -> usize {
        lock(&self.handlers).any.len()
    }

    pub fn handler_count(&self, event: &str) -> usize {
        lock(&self.handlers)
            .by_event
            .get(event)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

//! Publish/subscribe fan-out of [`BusEvent`]s to observers.

pub mod event;

pub use event::{BusEvent, BusMessage, SessionStatus};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::types::ProjectId;

/// Subscription key matching every event type.
pub const WILDCARD: &str = "*";

/// Callback invoked for each delivered event.
pub type EventHandler = Arc<dyn Fn(&BusMessage) + Send + Sync>;

/// Event bus contract used by the processor and the permission engine.
pub trait EventBus: Send + Sync {
    /// Publish `event` for `project` to every matching subscriber.
    fn publish(&self, project: &ProjectId, event: BusEvent);

    /// Subscribe to one event type, or to all of them with [`WILDCARD`].
    fn subscribe(&self, event_type: &str, handler: EventHandler) -> Subscription;
}

/// Handle returned by [`EventBus::subscribe`].
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Stop receiving events.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

type HandlerTable = HashMap<String, Vec<(u64, EventHandler)>>;

/// In-process bus delivering events synchronously on the publishing task.
#[derive(Default)]
pub struct InProcessBus {
    handlers: Arc<RwLock<HandlerTable>>,
    next_id: AtomicU64,
    seq: AtomicU64,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn matching(&self, event_type: &str) -> Vec<EventHandler> {
        let Ok(table) = self.handlers.read() else {
            return Vec::new();
        };
        [event_type, WILDCARD]
            .iter()
            .filter_map(|key| table.get(*key))
            .flat_map(|entries| entries.iter().map(|(_, handler)| handler.clone()))
            .collect()
    }
}

impl EventBus for InProcessBus {
    fn publish(&self, project: &ProjectId, event: BusEvent) {
        let handlers = self.matching(event.event_type());
        if handlers.is_empty() {
            return;
        }
        let message = BusMessage {
            project: project.clone(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            timestamp: chrono::Utc::now(),
            event,
        };
        for handler in handlers {
            handler(&message);
        }
    }

    fn subscribe(&self, event_type: &str, handler: EventHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut table) = self.handlers.write() {
            table
                .entry(event_type.to_string())
                .or_default()
                .push((id, handler));
        }
        let table: Weak<RwLock<HandlerTable>> = Arc::downgrade(&self.handlers);
        let key = event_type.to_string();
        Subscription::new(move || {
            let Some(handlers) = table.upgrade() else {
                return;
            };
            if let Ok(mut table) = handlers.write() {
                if let Some(entries) = table.get_mut(&key) {
                    entries.retain(|(entry, _)| *entry != id);
                    if entries.is_empty() {
                        table.remove(&key);
                    }
                }
            };
        })
    }
}

/// Subscribe and receive events as a stream instead of a callback.
pub fn subscribe_stream(
    bus: &dyn EventBus,
    event_type: &str,
) -> (Subscription, UnboundedReceiverStream<BusMessage>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let subscription = bus.subscribe(
        event_type,
        Arc::new(move |message: &BusMessage| {
            let _ = tx.send(message.clone());
        }),
    );
    (subscription, UnboundedReceiverStream::new(rx))
}

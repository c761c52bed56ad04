//! Event bus for debate observation
//!
//! Every subscriber owns an unbounded queue. Publishing never blocks the
//! debate task and never drops an event: a subscriber that reads late
//! still receives everything published since it subscribed, in order.
//! Streamed-text updates are already rate-bounded by the flush interval,
//! so a backlog grows with the length of the debate and nothing else.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;

use super::types::{DebateEvent, EventKind};

/// Error type for event bus operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventBusError {
    #[error("Channel closed")]
    ChannelClosed,
}

/// Result type for event bus operations
pub type EventBusResult<T> = Result<T, EventBusError>;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Event bus with one lossless queue per subscriber
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DebateEvent>>>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<DebateEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish an event to all subscribers, returning how many received it
    ///
    /// Delivery happens under the bus lock, so concurrent publishers are
    /// seen in the same order by every subscriber.
    pub fn publish(&self, event: DebateEvent) -> usize {
        let event_type = event.event_type();
        let mut subscribers = self.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        let count = subscribers.len();
        debug!(event_type, receivers = count, "Event published");
        count
    }

    /// Subscribe to receive every event published from now on
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        Subscription { receiver: rx }
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    /// Check if the bus has any subscribers
    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }
}

/// Receiving end of one subscriber's queue.
///
/// Closed once the bus is dropped and the backlog is drained.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<DebateEvent>,
}

impl Subscription {
    /// Receive the next event, waiting if none is queued
    pub async fn recv(&mut self) -> EventBusResult<DebateEvent> {
        self.receiver.recv().await.ok_or(EventBusError::ChannelClosed)
    }

    /// Take the next queued event without waiting
    pub fn try_recv(&mut self) -> Option<DebateEvent> {
        self.receiver.try_recv().ok()
    }
}

/// Publishes events on behalf of one session.
#[derive(Clone)]
pub struct SessionEmitter {
    bus: SharedEventBus,
    session_id: String,
}

impl SessionEmitter {
    pub fn new(bus: SharedEventBus, session_id: impl Into<String>) -> Self {
        Self {
            bus,
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn emit(&self, kind: EventKind) {
        self.bus.publish(DebateEvent::new(self.session_id.clone(), kind));
    }
}

/// Event filter for selective subscription
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by session ID
    pub session_id: Option<String>,
    /// Filter by event types
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    /// Create a new empty filter (matches all events)
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by session ID
    pub fn session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    /// Filter by event types
    pub fn types(mut self, event_types: Vec<&str>) -> Self {
        self.event_types = Some(event_types.into_iter().map(String::from).collect());
        self
    }

    /// Check if an event matches this filter
    pub fn matches(&self, event: &DebateEvent) -> bool {
        if let Some(ref sid) = self.session_id {
            if &event.session_id != sid {
                return false;
            }
        }

        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        true
    }
}

/// Filtered event receiver that only yields matching events
pub struct FilteredReceiver {
    receiver: Subscription,
    filter: EventFilter,
}

impl FilteredReceiver {
    /// Create a new filtered receiver
    pub fn new(receiver: Subscription, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// Receive the next matching event
    pub async fn recv(&mut self) -> EventBusResult<DebateEvent> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// Take the next queued matching event without waiting
    pub fn try_recv(&mut self) -> Option<DebateEvent> {
        while let Some(event) = self.receiver.try_recv() {
            if self.filter.matches(&event) {
                return Some(event);
            }
        }
        None
    }
}

/// Extension trait for subscribing with filters
pub trait EventBusExt {
    /// Subscribe with a filter
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver;
}

impl EventBusExt for EventBus {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}

impl EventBusExt for SharedEventBus {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}

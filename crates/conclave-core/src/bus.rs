use crate::event::{CoordinationEvent, EventEnvelope};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

/// In-process publish/subscribe channel for [`CoordinationEvent`]s.
///
/// Each subscriber owns a bounded ring of `capacity` envelopes. Publishing
/// never blocks: a subscriber that falls behind loses its oldest envelopes
/// and is told how many on its next receive.
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
    /// Stamping and sending happen under this lock so `seq` order is
    /// delivery order.
    seq: Mutex<u64>,
    capacity: usize,
}

/// What a subscriber gets from [`EventSubscription::recv`].
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    /// The next envelope, in publish order.
    Event(EventEnvelope),
    /// This many envelopes were dropped because the subscriber lagged.
    Lagged(u64),
}

/// A single consumer's view of the bus.
pub struct EventSubscription {
    rx: broadcast::Receiver<EventEnvelope>,
}

impl EventBus {
    /// Create a bus whose subscribers buffer at most `capacity` envelopes.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            seq: Mutex::new(0),
            capacity,
        }
    }

    /// Stamp and publish an event. Returns the assigned sequence number.
    pub fn publish(&self, event: CoordinationEvent) -> u64 {
        let mut last = self.seq.lock();
        *last += 1;
        let seq = *last;
        trace!(seq, topic = event.topic(), "bus publish");
        let envelope = EventEnvelope {
            seq,
            at: Utc::now(),
            event,
        };
        // No subscribers is not an error: events are observational.
        let _ = self.tx.send(envelope);
        seq
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Sequence number of the last published event (0 if none).
    pub fn last_seq(&self) -> u64 {
        *self.seq.lock()
    }

    /// Per-subscriber buffer size.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::config::EventBusConfig::default().capacity)
    }
}

impl EventSubscription {
    /// Wait for the next message. `None` once the bus is dropped.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        match self.rx.recv().await {
            Ok(envelope) => Some(BusMessage::Event(envelope)),
            Err(broadcast::error::RecvError::Lagged(n)) => Some(BusMessage::Lagged(n)),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Non-blocking receive. `None` when nothing is buffered or the bus is gone.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        match self.rx.try_recv() {
            Ok(envelope) => Some(BusMessage::Event(envelope)),
            Err(broadcast::error::TryRecvError::Lagged(n)) => Some(BusMessage::Lagged(n)),
            Err(_) => None,
        }
    }
}

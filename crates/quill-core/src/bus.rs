use tokio::sync::broadcast;
use tracing::trace;

use crate::event::BusEvent;

/// Per-subscriber buffer size. A subscriber that falls further behind than
/// this loses its oldest events and sees a `bus.dropped` marker.
pub const BUS_CAPACITY: usize = 256;

/// In-process typed pub/sub. Publishing is synchronous fan-out into
/// per-subscriber ring buffers; delivery order per subscriber is publish
/// order. Cloning shares the channel.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<BusEvent>,
}

impl Bus {
    pub fn new() -> Self {
        Self::with_capacity(BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fan out to all subscribers. Subscriber failures never reach the
    /// publisher; an empty bus is not an error.
    pub fn publish(&self, event: BusEvent) {
        if self.tx.send(event).is_err() {
            trace!("no bus subscribers — event dropped");
        }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
            filter: None,
        }
    }

    /// Subscribe to events whose dotted type name starts with `prefix`
    /// (e.g. `"session."` or the exact `"message.part.updated"`).
    /// `bus.dropped` markers are always delivered.
    pub fn subscribe_filtered(&self, prefix: impl Into<String>) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
            filter: Some(prefix.into()),
        }
    }

    /// Raw receiver for bridges that need a `futures::Stream`
    /// (`tokio_stream::wrappers::BroadcastStream`).
    pub fn subscribe_raw(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber's view of the bus.
pub struct EventStream {
    rx: broadcast::Receiver<BusEvent>,
    filter: Option<String>,
}

impl EventStream {
    /// Next matching event; `None` once the bus is gone. Overflow surfaces
    /// as a single `BusEvent::Dropped { count }` before delivery resumes.
    pub async fn next(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Some(BusEvent::Dropped { count });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant used by tests to drain what has arrived so far.
    pub fn try_next(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(count)) => {
                    return Some(BusEvent::Dropped { count });
                }
                Err(_) => return None,
            }
        }
    }

    fn matches(&self, event: &BusEvent) -> bool {
        match &self.filter {
            None => true,
            Some(prefix) => event.event_type().starts_with(prefix.as_str()),
        }
    }
}

//! Tokio broadcast bus for produced identity-change events.
//!
//! The bus is owned by the service container and handed to the services
//! that emit events; there is no process-wide instance.

use crate::models::IdentityChangeEvent;
use tokio::sync::broadcast;

/// Default number of buffered events per subscriber.
pub const DEFAULT_EVENT_BUS_CAPACITY: usize = 1024;

/// Broadcast bus for [`IdentityChangeEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<IdentityChangeEvent>,
}

/// Receiver that only yields events matching a predicate.
pub struct FilteredReceiver<F> {
    receiver: broadcast::Receiver<IdentityChangeEvent>,
    predicate: F,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUS_CAPACITY)
    }
}

impl EventBus {
    /// Creates a bus with the given buffer capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to every subscriber.
    ///
    /// Publishing never fails; with no subscriber the event is only counted.
    pub fn publish(&self, event: IdentityChangeEvent) {
        let event_type = event.event_type();
        metrics::counter!("dedup_events_published_total", "event_type" => event_type)
            .increment(1);
        if self.sender.send(event).is_err() {
            tracing::debug!(event_type, "No subscriber for identity change event");
        }
    }

    /// Subscribes to every event.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<IdentityChangeEvent> {
        self.sender.subscribe()
    }

    /// Subscribes to events of one type (`MARKED_SUSPICIOUS`, `EXCLUDED`, ...).
    #[must_use]
    pub fn subscribe_event_type(
        &self,
        event_type: &'static str,
    ) -> FilteredReceiver<impl Fn(&IdentityChangeEvent) -> bool> {
        FilteredReceiver {
            receiver: self.sender.subscribe(),
            predicate: move |event: &IdentityChangeEvent| event.event_type() == event_type,
        }
    }
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&IdentityChangeEvent) -> bool,
{
    /// Receives the next matching event.
    ///
    /// # Errors
    ///
    /// Returns [`broadcast::error::RecvError::Closed`] once every sender is gone.
    pub async fn recv(&mut self) -> Result<IdentityChangeEvent, broadcast::error::RecvError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if (self.predicate)(&event) => return Ok(event),
                Ok(_) => {},
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    metrics::counter!("dedup_event_bus_lagged_total").increment(skipped);
                },
                Err(err) => return Err(err),
            }
        }
    }

    /// Returns the next matching event already buffered, if any.
    pub fn try_recv(&mut self) -> Option<IdentityChangeEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if (self.predicate)(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {},
                Err(_) => return None,
            }
        }
    }
}

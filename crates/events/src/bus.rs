//! Event bus for state-change notifications.

use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::StateEvent;
use crate::types::EventId;

/// Pattern for filtering events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPattern {
    /// Match all events.
    All,
    /// Match only events that change state.
    StateChanges,
}

impl EventPattern {
    /// Check if an event matches this pattern.
    pub fn matches(&self, event: &StateEvent) -> bool {
        match self {
            Self::All => true,
            Self::StateChanges => event.changes_state(),
        }
    }
}

/// Subscription handle for receiving events.
///
/// Events that do not match the subscription's pattern are skipped.
pub struct EventSubscription {
    receiver: broadcast::Receiver<StateEvent>,
    pattern: EventPattern,
}

impl EventSubscription {
    /// Receive the next matching event.
    ///
    /// Cancel safe: an event is only lost if it did not match.
    ///
    /// # Errors
    ///
    /// `Error::Lagged` if the subscriber fell behind, `Error::ChannelClosed`
    /// once the bus is gone.
    pub async fn recv(&mut self) -> Result<StateEvent> {
        loop {
            let event = self.receiver.recv().await.map_err(|e| match e {
                broadcast::error::RecvError::Lagged(skipped) => Error::Lagged { skipped },
                broadcast::error::RecvError::Closed => Error::ChannelClosed,
            })?;
            if self.pattern.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// Take the next queued matching event without waiting.
    ///
    /// `Ok(None)` when nothing matching is queued.
    ///
    /// # Errors
    ///
    /// `Error::Lagged` if the subscriber fell behind, `Error::ChannelClosed`
    /// once the bus is gone.
    pub fn try_recv(&mut self) -> Result<Option<StateEvent>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.pattern.matches(&event) => return Ok(Some(event)),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    return Err(Error::Lagged { skipped });
                }
                Err(broadcast::error::TryRecvError::Closed) => return Err(Error::ChannelClosed),
            }
        }
    }

    /// The pattern this subscription filters by.
    pub fn pattern(&self) -> EventPattern {
        self.pattern
    }
}

/// Event bus for publishing and subscribing to state changes.
pub struct EventBus {
    broadcast: broadcast::Sender<StateEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        let (broadcast, _) = broadcast::channel(1000);
        Self { broadcast }
    }

    /// Publish an event to every subscriber.
    pub async fn publish(&self, event: StateEvent) -> EventId {
        let event_id = event.event_id();

        debug!(
            event_id = %event_id,
            event_type = event.event_type(),
            app_id = ?event.app_id(),
            "Publishing event"
        );

        // No receivers is fine: nobody is listening yet.
        let _ = self.broadcast.send(event);

        event_id
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> EventSubscription {
        self.subscribe_with_pattern(EventPattern::All)
    }

    /// Subscribe to events matching a pattern.
    pub fn subscribe_with_pattern(&self, pattern: EventPattern) -> EventSubscription {
        EventSubscription {
            receiver: self.broadcast.subscribe(),
            pattern,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

//! State-change channel for the reconciliation loop.
//!
//! Components that mutate observed device state (the step executor, the
//! target-state writer) publish a [`StateEvent`] on the [`EventBus`]; the
//! reconciliation loop subscribes with [`EventPattern::StateChanges`] and
//! re-runs inference when something changed instead of waiting for its
//! next tick.
//!
//! # Example
//!
//! ```ignore
//! use stevedore_events::{EventBus, StateEvent};
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = EventBus::new();
//!     let mut sub = bus.subscribe();
//!
//!     bus.publish(StateEvent::step_completed(Some(1), "start")).await;
//!
//!     let event = sub.recv().await;
//!     println!("Received: {:?}", event.map(|e| e.event_type()));
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod bus;
pub mod error;
pub mod event;
pub mod types;

pub use bus::{EventBus, EventPattern, EventSubscription};
pub use error::{Error, Result};
pub use event::StateEvent;
pub use types::EventId;

//! Archery build event stream.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`BuildEvent`]: one completed output line, or the terminal `finish`
//!   signal, of a single build.
//! - [`BuildSubscription`]: a receiver that only yields one build's events
//!   and reports dropped lines as a [`Delivery::Missed`] gap.

pub mod bus;

pub use bus::{BuildEvent, BuildSubscription, Delivery, EventBus};

//! # Lifecycle events published by the container.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};

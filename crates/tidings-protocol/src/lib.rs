//! Shared event model for the tidings engine and the tools built on it.
//!
//! Everything here is plain data: the [`Event`] record that flows through the
//! bus, the closed [`Value`] payload type, and the well-known [`EventKind`]
//! names producers use.

pub mod event_bus;
pub mod value;

pub use event_bus::{Event, EventKind};
pub use value::Value;

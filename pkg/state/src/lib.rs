//! Key-value state store and its watch event log.

pub mod client;
pub mod watch;

pub use client::StateStore;
pub use watch::{EventLog, EventType, WatchEvent};

//! Observer side of the WireWarp live status channel
//!
//! [`LiveObserver`] keeps one WebSocket connection to the control plane's
//! live endpoint, reconnecting after a fixed delay, and folds every message
//! into an [`AgentCache`]. A full snapshot arrives on each connect, so any
//! deltas missed while disconnected are repaired on reconnect.

pub mod cache;
pub mod client;
pub mod error;

pub use cache::AgentCache;
pub use client::{ConnectionState, LiveObserver, ObserverConfig};
pub use error::ObserverError;

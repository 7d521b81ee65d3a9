//! Streaming ingestion for implant telemetry
//!
//! This crate turns deliveries from the telemetry session into one ordered,
//! append-only log: channel adapters and the health sampler produce entries,
//! the multiplexer fans them in, and the log sink persists them.

pub mod adapters;
pub mod error;
pub mod health;
pub mod mux;
pub mod sink;

// Re-export commonly used types
pub use adapters::*;
pub use error::*;
pub use health::*;
pub use mux::*;
pub use sink::*;

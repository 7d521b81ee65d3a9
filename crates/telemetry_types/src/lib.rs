//! Shared types for the implant telemetry logger
//!
//! This crate contains the data model used throughout the system: relay and
//! device records, sample batches, log entries, connection states and the
//! sensing-configuration values pushed to the implanted device.

pub mod event;
pub mod config;
pub mod data;
pub mod error;

// Re-export commonly used types
pub use event::*;
pub use config::*;
pub use data::*;
pub use error::*;

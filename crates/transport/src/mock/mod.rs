//! Simulated relay and implanted device.
//!
//! Used by the daemon's `--mock` mode and by tests that need to script
//! connection failures or inject sample batches.

pub mod driver;
pub mod signal_generator;

pub use driver::{MockHandle, MockScript, MockTransport, SensingWrite, SessionOutcome};

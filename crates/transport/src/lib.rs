pub mod types;
pub mod mock;

// Re-export the main types that users need
pub use types::{RelayLink, RelayManager};
pub use mock::{MockHandle, MockScript, MockTransport, SensingWrite, SessionOutcome};

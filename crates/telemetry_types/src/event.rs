//! Connection states and progress events
//!
//! The connection manager publishes [`ConnectionEvent`] values for logging and
//! UI purposes. Nothing inside the system makes decisions based on them.

use std::fmt;

use crate::data::{DiscoveredDevice, RelayInstrument};
use crate::error::ConnectionError;

/// State of the connection manager. Transitions are the only permitted mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Idle,
    ScanningForRelays,
    RelayBondingCheck,
    ConnectingRelay,
    DiscoveringDevice,
    OpeningSession,
    Connected,
    TornDown,
    /// Terminal failure, reachable from any state.
    Failed(ConnectionError),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => f.write_str("Idle"),
            ConnectionState::ScanningForRelays => f.write_str("ScanningForRelays"),
            ConnectionState::RelayBondingCheck => f.write_str("RelayBondingCheck"),
            ConnectionState::ConnectingRelay => f.write_str("ConnectingRelay"),
            ConnectionState::DiscoveringDevice => f.write_str("DiscoveringDevice"),
            ConnectionState::OpeningSession => f.write_str("OpeningSession"),
            ConnectionState::Connected => f.write_str("Connected"),
            ConnectionState::TornDown => f.write_str("TornDown"),
            ConnectionState::Failed(reason) => write!(f, "Failed({})", reason),
        }
    }
}

/// Human-readable progress reported while establishing a session.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    RelaysFound(Vec<RelayInstrument>),
    RelayConnectResult { serial_number: String, connected: bool },
    DevicesDiscovered(Vec<DiscoveredDevice>),
    /// A session start failed with an initialization error and will be retried.
    SessionAttemptFailed { attempt: u32, reason: String },
    SessionOpened { attempts: u32, warnings: String },
}

//! Traits describing the telemetry transport boundary
//!
//! The vendor SDK that actually talks to relays and implanted devices lives
//! behind these two traits. [`RelayManager`] mirrors the host-side registry of
//! relays; [`RelayLink`] is the handle to one connected relay, and once a
//! session is started on it, the live session with the implanted device.

use flume::Receiver;

use telemetry_types::{
    AccelSampleRate, ConnectWarnings, DiscoveredDevice, FftSettings, GeneralInfo, GroupNumber,
    MiscSettings, PowerSettings, RelayInstrument, SampleBatch, SenseStates, StreamKind,
    StreamSelection, TherapyGroup, TimeDomainChannel, TransportError,
};

/// Host-side registry of relay units.
pub trait RelayManager: Send + 'static {
    /// Scan USB for relays that are plugged in but not yet bonded, and bond them.
    fn scan_usb(&mut self) -> Result<(), TransportError>;

    /// List the relays in the local registry, in registry order, with their
    /// bonding status.
    fn known_relays(&mut self) -> Result<Vec<RelayInstrument>, TransportError>;

    /// Connect to one bonded relay.
    fn connect(&mut self, relay: &RelayInstrument) -> Result<Box<dyn RelayLink>, TransportError>;

    /// Dispose a link created by [`RelayManager::connect`], closing any session on it.
    fn dispose(&mut self, link: Box<dyn RelayLink>);

    /// Release the manager's own resources.
    fn shutdown(&mut self);
}

/// A connected relay and, after [`RelayLink::start_session`] succeeds, the
/// live session with the implanted device.
///
/// Everything that takes `&self` is safe to call while streaming; it is the
/// read-only capability lent out during the session's lifetime.
pub trait RelayLink: Send {
    fn relay(&self) -> &RelayInstrument;

    /// Poll for implanted devices within range. An empty list is not an error.
    fn discover(&mut self) -> Result<Vec<DiscoveredDevice>, TransportError>;

    /// Start a session with a discovered device.
    fn start_session(&mut self, device: &DiscoveredDevice) -> Result<ConnectWarnings, TransportError>;

    fn read_general_info(&self) -> Result<GeneralInfo, TransportError>;

    fn read_therapy_group(&self, group: GroupNumber) -> Result<TherapyGroup, TransportError>;

    fn write_time_domain_channels(&self, channels: &[TimeDomainChannel]) -> Result<(), TransportError>;

    fn write_fft_settings(&self, fft: &FftSettings) -> Result<(), TransportError>;

    fn write_power_channels(&self, power: &PowerSettings) -> Result<(), TransportError>;

    fn write_misc_settings(&self, misc: &MiscSettings) -> Result<(), TransportError>;

    fn write_accel_settings(&self, rate: AccelSampleRate) -> Result<(), TransportError>;

    fn write_sense_states(&self, states: SenseStates) -> Result<(), TransportError>;

    fn enable_streams(&self, streams: &StreamSelection) -> Result<(), TransportError>;

    fn disable_streams(&self) -> Result<(), TransportError>;

    /// Register for deliveries of one stream.
    ///
    /// The transport pushes every delivery onto the returned queue without
    /// blocking. The queue disconnects when the link is disposed.
    fn subscribe(&self, kind: StreamKind) -> Result<Receiver<SampleBatch>, TransportError>;
}

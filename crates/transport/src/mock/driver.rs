use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, Sender};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use telemetry_types::{
    AccelSampleRate, BondingStatus, ConnectWarnings, DiscoveredDevice, FftSettings, GeneralInfo, GroupNumber,
    MiscSettings, PowerSettings, RelayInstrument, SampleBatch, SenseStates, StreamKind,
    StreamSelection, TherapyGroup, TherapyProgram, TimeDomainChannel, TransportError,
};

use super::signal_generator::{SignalGenerator, SignalPlan};
use crate::types::{RelayLink, RelayManager};

/// Outcome of one simulated session-start attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionOutcome {
    Success,
    InitializationError,
    Rejected(u16),
}

/// One kind of write the session accepts, used for failure injection and
/// for inspecting what was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensingWrite {
    TimeDomain,
    Fft,
    Power,
    Misc,
    Accel,
    SenseStates,
    EnableStreams,
    DisableStreams,
}

impl SensingWrite {
    fn is_configuration(&self) -> bool {
        matches!(
            self,
            SensingWrite::TimeDomain
                | SensingWrite::Fft
                | SensingWrite::Power
                | SensingWrite::Misc
                | SensingWrite::Accel
        )
    }
}

/// Behaviour of the simulated relay and implanted device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MockScript {
    /// Relays already in the bonded registry.
    pub bonded_relays: Vec<String>,
    /// Relays plugged in over USB. They are listed unbonded until a USB scan
    /// bonds them.
    pub usb_relays: Vec<String>,
    /// Make USB scans fail, leaving plugged relays unbonded.
    pub usb_bonding_fails: bool,
    /// Bonded relays that refuse connections.
    pub unreachable_relays: Vec<String>,
    pub device_serial: String,
    /// Number of discovery polls that find nothing before the device shows up.
    pub empty_discovery_polls: u32,
    /// Outcomes of successive session-start attempts; success once exhausted.
    pub session_outcomes: VecDeque<SessionOutcome>,
    pub failing_writes: Vec<SensingWrite>,
    /// Run a generator thread that streams synthetic data while streaming is enabled.
    pub generate_data: bool,
    pub active_group: GroupNumber,
    pub therapy_group: TherapyGroup,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            bonded_relays: vec!["MOCK-RELAY-01".to_string()],
            usb_relays: Vec::new(),
            usb_bonding_fails: false,
            unreachable_relays: Vec::new(),
            device_serial: "MOCK-INS-01".to_string(),
            empty_discovery_polls: 2,
            session_outcomes: VecDeque::from([SessionOutcome::InitializationError]),
            failing_writes: Vec::new(),
            generate_data: true,
            active_group: GroupNumber::A,
            therapy_group: TherapyGroup {
                rate_hz: 130.0,
                programs: vec![
                    TherapyProgram { amplitude_ma: 2.5 },
                    TherapyProgram { amplitude_ma: 0.0 },
                    TherapyProgram { amplitude_ma: 0.0 },
                    TherapyProgram { amplitude_ma: 0.0 },
                ],
            },
        }
    }
}

#[derive(Default)]
struct WrittenConfig {
    time_domain: Option<Vec<TimeDomainChannel>>,
    power: Option<PowerSettings>,
    misc: Option<MiscSettings>,
    accel: Option<AccelSampleRate>,
}

struct GeneratorThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl GeneratorThread {
    fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.handle.join().is_err() {
            warn!("Mock generator thread panicked");
        }
    }
}

/// Internal state shared by the manager, its links and test handles.
struct MockInner {
    script: MockScript,
    registry: Vec<RelayInstrument>,
    connect_attempts: Vec<String>,
    discovery_polls: u32,
    session_attempts: u32,
    session_open: bool,
    live_links: u32,
    disposed_links: u32,
    manager_shut_down: bool,
    writes: Vec<SensingWrite>,
    sense_states: SenseStates,
    streams: Option<StreamSelection>,
    written: WrittenConfig,
    subscribers: HashMap<StreamKind, Vec<Sender<SampleBatch>>>,
    generator: Option<GeneratorThread>,
}

type SharedInner = Arc<Mutex<MockInner>>;

fn lock(inner: &SharedInner) -> MutexGuard<'_, MockInner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockInner {
    /// Delivers a batch to every subscriber of its stream, dropping closed queues.
    fn deliver(&mut self, batch: SampleBatch) -> usize {
        let streaming = self
            .streams
            .map(|s| s.includes(batch.kind))
            .unwrap_or(false);
        if !streaming {
            return 0;
        }
        let Some(senders) = self.subscribers.get_mut(&batch.kind) else {
            return 0;
        };
        senders.retain(|tx| tx.send(batch.clone()).is_ok());
        senders.len()
    }

    fn signal_plan(&self) -> SignalPlan {
        let streams = self.streams.unwrap_or_default();
        let td = self.written.time_domain.clone().unwrap_or_default();
        let td_channels: Vec<u8> = td
            .iter()
            .enumerate()
            .filter(|(_, ch)| ch.sample_rate.hz().is_some())
            .map(|(i, _)| i as u8)
            .collect();
        let td_rate_hz = if streams.time_domain && self.sense_states.lfp {
            td.iter().find_map(|ch| ch.sample_rate.hz())
        } else {
            None
        };
        let power_bands = match (&self.written.power, streams.power && self.sense_states.power) {
            (Some(power), true) => power
                .band_enables
                .iter()
                .map(|e| e.channel * 2 + e.band)
                .collect(),
            _ => Vec::new(),
        };
        let accel_rate_hz = if streams.accelerometer {
            self.written.accel.and_then(|rate| rate.hz())
        } else {
            None
        };

        SignalPlan {
            frame_ms: self.written.misc.as_ref().map_or(100, |m| m.streaming_frame_ms),
            td_channels,
            td_rate_hz,
            power_bands,
            accel_rate_hz,
        }
    }
}

/// A simulated relay registry standing in for the vendor SDK.
pub struct MockTransport {
    inner: SharedInner,
}

/// Inspection and injection handle onto a [`MockTransport`].
#[derive(Clone)]
pub struct MockHandle {
    inner: SharedInner,
}

impl MockTransport {
    pub fn new(script: MockScript) -> (Self, MockHandle) {
        let registry = script
            .bonded_relays
            .iter()
            .map(RelayInstrument::bonded)
            .chain(script.usb_relays.iter().map(RelayInstrument::unbonded))
            .collect();
        let inner = Arc::new(Mutex::new(MockInner {
            script,
            registry,
            connect_attempts: Vec::new(),
            discovery_polls: 0,
            session_attempts: 0,
            session_open: false,
            live_links: 0,
            disposed_links: 0,
            manager_shut_down: false,
            writes: Vec::new(),
            sense_states: SenseStates::none(),
            streams: None,
            written: WrittenConfig::default(),
            subscribers: HashMap::new(),
            generator: None,
        }));
        info!("MockTransport created");
        (
            Self {
                inner: inner.clone(),
            },
            MockHandle { inner },
        )
    }
}

impl RelayManager for MockTransport {
    fn scan_usb(&mut self) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        if inner.script.usb_bonding_fails {
            return Err(TransportError::Link("USB bonding failed".to_string()));
        }
        for relay in inner.registry.iter_mut().filter(|r| !r.is_bonded()) {
            info!("Bonded relay {} over USB", relay.serial_number);
            relay.bonding = BondingStatus::Bonded;
        }
        Ok(())
    }

    fn known_relays(&mut self) -> Result<Vec<RelayInstrument>, TransportError> {
        Ok(lock(&self.inner).registry.clone())
    }

    fn connect(&mut self, relay: &RelayInstrument) -> Result<Box<dyn RelayLink>, TransportError> {
        let mut inner = lock(&self.inner);
        inner.connect_attempts.push(relay.serial_number.clone());
        if inner.script.unreachable_relays.contains(&relay.serial_number) {
            return Err(TransportError::Link(format!(
                "relay {} did not respond",
                relay.serial_number
            )));
        }
        inner.live_links += 1;
        Ok(Box::new(MockLink {
            relay: relay.clone(),
            inner: self.inner.clone(),
        }))
    }

    fn dispose(&mut self, link: Box<dyn RelayLink>) {
        let generator = {
            let mut inner = lock(&self.inner);
            inner.session_open = false;
            inner.streams = None;
            inner.subscribers.clear();
            inner.live_links = inner.live_links.saturating_sub(1);
            inner.disposed_links += 1;
            inner.generator.take()
        };
        if let Some(generator) = generator {
            generator.stop();
        }
        debug!("Disposed link to relay {}", link.relay().serial_number);
    }

    fn shutdown(&mut self) {
        lock(&self.inner).manager_shut_down = true;
        info!("MockTransport shutdown complete");
    }
}

struct MockLink {
    relay: RelayInstrument,
    inner: SharedInner,
}

impl MockLink {
    fn record_write(&self, write: SensingWrite) -> Result<MutexGuard<'_, MockInner>, TransportError> {
        let mut inner = lock(&self.inner);
        if !inner.session_open {
            return Err(TransportError::Link("no session is open".to_string()));
        }
        inner.writes.push(write);
        if write.is_configuration() && inner.streams.is_some() {
            return Err(TransportError::Rejected {
                code: 0x1B,
                descriptor: "sensing configuration cannot change while streaming".to_string(),
            });
        }
        if inner.script.failing_writes.contains(&write) {
            return Err(TransportError::Rejected {
                code: 0x0B,
                descriptor: format!("{:?} write rejected", write),
            });
        }
        Ok(inner)
    }
}

impl RelayLink for MockLink {
    fn relay(&self) -> &RelayInstrument {
        &self.relay
    }

    fn discover(&mut self) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let mut inner = lock(&self.inner);
        inner.discovery_polls += 1;
        if inner.discovery_polls <= inner.script.empty_discovery_polls {
            return Ok(Vec::new());
        }
        Ok(vec![DiscoveredDevice {
            serial_number: inner.script.device_serial.clone(),
            rssi: Some(-48),
        }])
    }

    fn start_session(&mut self, device: &DiscoveredDevice) -> Result<ConnectWarnings, TransportError> {
        let mut inner = lock(&self.inner);
        inner.session_attempts += 1;
        let outcome = inner
            .script
            .session_outcomes
            .pop_front()
            .unwrap_or(SessionOutcome::Success);
        debug!(
            "Session attempt {} with {}: {:?}",
            inner.session_attempts, device.serial_number, outcome
        );
        match outcome {
            SessionOutcome::Success => {
                inner.session_open = true;
                Ok(ConnectWarnings::default())
            }
            SessionOutcome::InitializationError => Err(TransportError::Initialization(
                "telemetry handshake timed out".to_string(),
            )),
            SessionOutcome::Rejected(code) => Err(TransportError::Rejected {
                code,
                descriptor: "incompatible device firmware".to_string(),
            }),
        }
    }

    fn read_general_info(&self) -> Result<GeneralInfo, TransportError> {
        let inner = lock(&self.inner);
        if !inner.session_open {
            return Err(TransportError::Link("no session is open".to_string()));
        }
        Ok(GeneralInfo {
            active_group: inner.script.active_group,
        })
    }

    fn read_therapy_group(&self, _group: GroupNumber) -> Result<TherapyGroup, TransportError> {
        let inner = lock(&self.inner);
        if !inner.session_open {
            return Err(TransportError::Link("no session is open".to_string()));
        }
        Ok(inner.script.therapy_group.clone())
    }

    fn write_time_domain_channels(&self, channels: &[TimeDomainChannel]) -> Result<(), TransportError> {
        let mut inner = self.record_write(SensingWrite::TimeDomain)?;
        inner.written.time_domain = Some(channels.to_vec());
        Ok(())
    }

    fn write_fft_settings(&self, _fft: &FftSettings) -> Result<(), TransportError> {
        self.record_write(SensingWrite::Fft).map(|_| ())
    }

    fn write_power_channels(&self, power: &PowerSettings) -> Result<(), TransportError> {
        let mut inner = self.record_write(SensingWrite::Power)?;
        inner.written.power = Some(power.clone());
        Ok(())
    }

    fn write_misc_settings(&self, misc: &MiscSettings) -> Result<(), TransportError> {
        let mut inner = self.record_write(SensingWrite::Misc)?;
        inner.written.misc = Some(misc.clone());
        Ok(())
    }

    fn write_accel_settings(&self, rate: AccelSampleRate) -> Result<(), TransportError> {
        let mut inner = self.record_write(SensingWrite::Accel)?;
        inner.written.accel = Some(rate);
        Ok(())
    }

    fn write_sense_states(&self, states: SenseStates) -> Result<(), TransportError> {
        let mut inner = self.record_write(SensingWrite::SenseStates)?;
        inner.sense_states = states;
        Ok(())
    }

    fn enable_streams(&self, streams: &StreamSelection) -> Result<(), TransportError> {
        let mut inner = self.record_write(SensingWrite::EnableStreams)?;
        inner.streams = Some(*streams);
        if !inner.script.generate_data || inner.generator.is_some() {
            return Ok(());
        }

        let plan = inner.signal_plan();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let shared = self.inner.clone();
        let handle = thread::Builder::new()
            .name("mock_stream".into())
            .spawn(move || run_generator(shared, plan, stop_clone))
            .map_err(|e| TransportError::Link(format!("failed to start stream thread: {}", e)))?;
        inner.generator = Some(GeneratorThread { stop, handle });
        Ok(())
    }

    fn disable_streams(&self) -> Result<(), TransportError> {
        let generator = {
            let mut inner = self.record_write(SensingWrite::DisableStreams)?;
            inner.streams = None;
            inner.generator.take()
        };
        if let Some(generator) = generator {
            generator.stop();
        }
        Ok(())
    }

    fn subscribe(&self, kind: StreamKind) -> Result<Receiver<SampleBatch>, TransportError> {
        let mut inner = lock(&self.inner);
        if !inner.session_open {
            return Err(TransportError::Link("no session is open".to_string()));
        }
        let (tx, rx) = flume::unbounded();
        inner.subscribers.entry(kind).or_default().push(tx);
        Ok(rx)
    }
}

fn run_generator(shared: SharedInner, plan: SignalPlan, stop: Arc<AtomicBool>) {
    info!("Mock stream thread started: {:?}", plan);
    let frame = Duration::from_millis(plan.frame_ms as u64);
    let mut generator = SignalGenerator::new(plan);

    while !stop.load(Ordering::Relaxed) {
        thread::sleep(frame);
        let batches = [
            generator.time_domain_frame(),
            generator.power_frame(),
            generator.accel_frame(),
        ];
        let mut inner = lock(&shared);
        for batch in batches.into_iter().flatten() {
            inner.deliver(batch);
        }
    }
    info!("Mock stream thread stopped");
}

impl MockHandle {
    /// Pushes a batch to the subscribers of its stream, as the transport would
    /// on a delivery. Returns how many subscribers received it; nothing is
    /// delivered unless that stream is enabled.
    pub fn push_batch(&self, batch: SampleBatch) -> usize {
        lock(&self.inner).deliver(batch)
    }

    pub fn subscriber_count(&self, kind: StreamKind) -> usize {
        lock(&self.inner).subscribers.get(&kind).map_or(0, Vec::len)
    }

    pub fn connect_attempts(&self) -> Vec<String> {
        lock(&self.inner).connect_attempts.clone()
    }

    pub fn discovery_polls(&self) -> u32 {
        lock(&self.inner).discovery_polls
    }

    pub fn session_attempts(&self) -> u32 {
        lock(&self.inner).session_attempts
    }

    pub fn session_open(&self) -> bool {
        lock(&self.inner).session_open
    }

    pub fn live_links(&self) -> u32 {
        lock(&self.inner).live_links
    }

    pub fn disposed_links(&self) -> u32 {
        lock(&self.inner).disposed_links
    }

    pub fn manager_shut_down(&self) -> bool {
        lock(&self.inner).manager_shut_down
    }

    pub fn writes(&self) -> Vec<SensingWrite> {
        lock(&self.inner).writes.clone()
    }

    pub fn sense_states(&self) -> SenseStates {
        lock(&self.inner).sense_states
    }

    pub fn streaming(&self) -> bool {
        lock(&self.inner).streams.is_some()
    }
}

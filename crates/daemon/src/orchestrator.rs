//! Drives one recording session from connection to teardown.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pipeline::{
    spawn_adapter, AdapterHandle, AdapterStats, ChannelStats, HealthProbe, HealthSampler,
    HealthStats, Multiplexer, Selection,
};
use relay_transport::RelayLink;
use telemetry_types::{
    ChannelTag, ConnectionError, ConnectionState, SenseStates, SensingConfig, StreamKind,
    StreamSelection,
};

use crate::config::DaemonConfig;
use crate::connection_manager::ConnectionManager;
use crate::shutdown::StopSignal;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("failed to connect: {0}")]
    Connect(#[from] ConnectionError),

    #[error("failed to configure sensing")]
    SensingConfiguration,

    #[error("failed to start worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// What the orchestrator needs from the daemon configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub time_domain_channel: u8,
    pub health_period: Duration,
    pub sensing: SensingConfig,
    pub sense_states: SenseStates,
    pub streams: StreamSelection,
}

impl From<&DaemonConfig> for SessionSettings {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            time_domain_channel: config.time_domain_channel,
            health_period: config.health_period(),
            sensing: config.sensing.clone(),
            sense_states: config.sense_states,
            streams: config.streams,
        }
    }
}

impl SessionSettings {
    /// Adapters to attach, one per enabled stream.
    pub fn selections(&self) -> Vec<Selection> {
        let mut selections = Vec::new();
        if self.streams.time_domain {
            selections.push(Selection::TimeDomain {
                channel: self.time_domain_channel,
            });
        }
        if self.streams.power {
            selections.push(Selection::Power);
        }
        if self.streams.accelerometer {
            selections.push(Selection::Accelerometer);
        }
        selections
    }
}

/// Summary of a finished session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub final_state: ConnectionState,
    pub initialization_retries: u32,
    pub adapters: Vec<(StreamKind, AdapterStats)>,
    pub health: HealthStats,
    pub channels: BTreeMap<ChannelTag, ChannelStats>,
}

pub struct SessionOrchestrator<P: HealthProbe> {
    settings: SessionSettings,
    mux: Multiplexer,
    probe: P,
    stop: StopSignal,
}

impl<P: HealthProbe> SessionOrchestrator<P> {
    pub fn new(settings: SessionSettings, mux: Multiplexer, probe: P, stop: StopSignal) -> Self {
        Self {
            settings,
            mux,
            probe,
            stop,
        }
    }

    /// Runs the session to completion. The connection is torn down on every
    /// path out of this call; the log sink is left open.
    pub fn run(self, connection: &mut ConnectionManager) -> Result<SessionReport, OrchestratorError> {
        let Self {
            settings,
            mux,
            probe,
            stop,
        } = self;

        info!("Starting initialization process");
        if let Err(e) = connection.connect() {
            connection.teardown();
            return Err(e.into());
        }

        let result = match connection.session() {
            Some(link) => stream(link, &settings, &mux, probe, &stop),
            None => Err(OrchestratorError::Connect(ConnectionError::NotConnected)),
        };
        connection.teardown();

        let (adapters, health) = result?;
        info!("Teardown complete");
        Ok(SessionReport {
            final_state: connection.state().clone(),
            initialization_retries: connection.initialization_retries(),
            adapters,
            health,
            channels: mux.stats(),
        })
    }
}

type StreamOutcome = (Vec<(StreamKind, AdapterStats)>, HealthStats);

fn stream<P: HealthProbe>(
    link: &dyn RelayLink,
    settings: &SessionSettings,
    mux: &Multiplexer,
    probe: P,
    stop: &StopSignal,
) -> Result<StreamOutcome, OrchestratorError> {
    print_active_group(link);

    info!("Configuring sensing");
    if !configure_sensing(link, &settings.sensing) {
        error!("Failed to configure sensing");
        return Err(OrchestratorError::SensingConfiguration);
    }

    info!("Enabling sensing and streaming");
    if let Err(e) = link.write_sense_states(settings.sense_states) {
        warn!("Writing sense states failed: {}", e);
    }
    if let Err(e) = link.enable_streams(&settings.streams) {
        warn!("Enabling streams failed: {}", e);
    }

    let adapter_cancel = CancellationToken::new();
    let mut adapters = Vec::new();
    let sampler = attach(link, settings, mux, probe, &adapter_cancel, &mut adapters);
    if sampler.is_ok() {
        info!(
            "Streaming with {} adapter(s); press Enter or Ctrl-C to stop",
            adapters.len()
        );
        stop.wait();
        info!("Stop requested; teardown started");
    }

    if let Err(e) = link.disable_streams() {
        warn!("Disabling streams failed: {}", e);
    }
    if let Err(e) = link.write_sense_states(SenseStates::none()) {
        warn!("Turning sensing off failed: {}", e);
    }

    adapter_cancel.cancel();
    let adapter_stats = adapters
        .into_iter()
        .map(|handle| (handle.kind(), handle.join()))
        .collect();
    let health = sampler?.stop();

    if let Err(e) = mux.flush() {
        warn!("Flushing the log failed: {}", e);
    }
    Ok((adapter_stats, health))
}

/// Subscribes and starts one adapter per enabled stream, then the health
/// sampler. Adapters started before a failure are left in `adapters`.
fn attach<P: HealthProbe>(
    link: &dyn RelayLink,
    settings: &SessionSettings,
    mux: &Multiplexer,
    probe: P,
    cancel: &CancellationToken,
    adapters: &mut Vec<AdapterHandle>,
) -> std::io::Result<HealthSampler> {
    for selection in settings.selections() {
        let rx = match link.subscribe(selection.kind()) {
            Ok(rx) => rx,
            Err(e) => {
                warn!("Subscribing to {} failed: {}", selection.kind(), e);
                continue;
            }
        };
        adapters.push(spawn_adapter(selection, rx, mux, cancel.clone())?);
    }
    HealthSampler::spawn(probe, mux.writer(ChannelTag::Health), settings.health_period)
}

/// Logs the active therapy group. Failures are reported and ignored.
pub fn print_active_group(link: &dyn RelayLink) {
    info!("Querying settings of the active therapy group");
    let info = match link.read_general_info() {
        Ok(info) => info,
        Err(e) => {
            warn!("Reading device information failed: {}", e);
            return;
        }
    };
    match link.read_therapy_group(info.active_group) {
        Ok(group) => {
            info!("Active group {:?}: rate {} Hz", info.active_group, group.rate_hz);
            for (i, program) in group.programs.iter().enumerate() {
                info!("  program {} amplitude {} mA", i, program.amplitude_ma);
            }
        }
        Err(e) => warn!("Reading therapy group {:?} failed: {}", info.active_group, e),
    }
}

/// Turns streaming and sensing off, then writes the five sensing blocks.
///
/// Every block is attempted even after a failure; the result is true only
/// when all five were accepted.
pub fn configure_sensing(link: &dyn RelayLink, sensing: &SensingConfig) -> bool {
    if let Err(e) = link.disable_streams() {
        warn!("Disabling streams before configuration failed: {}", e);
    }
    if let Err(e) = link.write_sense_states(SenseStates::none()) {
        warn!("Turning sensing off before configuration failed: {}", e);
    }

    let writes = [
        ("time-domain channels", link.write_time_domain_channels(&sensing.time_domain)),
        ("FFT settings", link.write_fft_settings(&sensing.fft)),
        ("power channels", link.write_power_channels(&sensing.power)),
        ("misc settings", link.write_misc_settings(&sensing.misc)),
        ("accelerometer settings", link.write_accel_settings(sensing.accel)),
    ];

    let mut ok = true;
    for (name, result) in writes {
        match result {
            Ok(()) => info!("Wrote {}", name),
            Err(e) => {
                warn!("Writing {} failed: {}", name, e);
                ok = false;
            }
        }
    }
    ok
}

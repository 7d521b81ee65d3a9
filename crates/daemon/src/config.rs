use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::info;

use pipeline::{BatteryProbe, LogSinkConfig};
use relay_transport::MockScript;
use telemetry_types::{ConfigError, SenseStates, SensingConfig, StreamSelection};

/// Bounds on a polling loop. A field left unset imposes no bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub max_duration_ms: Option<u64>,
    /// Pause between attempts.
    pub poll_interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded(0)
    }
}

impl RetryPolicy {
    pub fn unbounded(poll_interval_ms: u64) -> Self {
        Self {
            max_attempts: None,
            max_duration_ms: None,
            poll_interval_ms,
        }
    }

    pub fn max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Self::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Whether another attempt may follow `attempts` completed ones.
    pub fn allows_retry(&self, attempts: u32, started: Instant) -> bool {
        if let Some(max) = self.max_attempts {
            if attempts >= max {
                return false;
            }
        }
        if let Some(max_ms) = self.max_duration_ms {
            if started.elapsed() >= Duration::from_millis(max_ms) {
                return false;
            }
        }
        true
    }
}

/// Configuration for the daemon
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Project identifier reported when the transport is created.
    pub project_id: String,
    pub log: LogSinkConfig,
    /// Period of the health sampler in seconds
    pub health_period_secs: u64,
    pub battery_capacity_path: PathBuf,
    /// Time-domain channel recorded to the log
    pub time_domain_channel: u8,
    pub discovery: RetryPolicy,
    pub session_open: RetryPolicy,
    pub sensing: SensingConfig,
    pub sense_states: SenseStates,
    pub streams: StreamSelection,
    /// Behaviour of the simulated transport used with `--mock`
    pub mock: MockScript,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            project_id: "TelemetryLogger".to_string(),
            log: LogSinkConfig::default(),
            health_period_secs: 20 * 60,
            battery_capacity_path: PathBuf::from(BatteryProbe::DEFAULT_CAPACITY_PATH),
            time_domain_channel: 0,
            discovery: RetryPolicy::unbounded(1000),
            session_open: RetryPolicy::unbounded(0),
            sensing: SensingConfig::default(),
            sense_states: SenseStates::default(),
            streams: StreamSelection::default(),
            mock: MockScript::default(),
        }
    }
}

impl DaemonConfig {
    pub fn health_period(&self) -> Duration {
        Duration::from_secs(self.health_period_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sensing.validate()?;
        if self.health_period_secs == 0 {
            return Err(ConfigError::Invalid(
                "health_period_secs must be greater than zero".to_string(),
            ));
        }
        let channel = self
            .sensing
            .time_domain
            .get(self.time_domain_channel as usize)
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "time_domain_channel {} does not exist",
                    self.time_domain_channel
                ))
            })?;
        if self.streams.time_domain && channel.sample_rate.hz().is_none() {
            return Err(ConfigError::Invalid(format!(
                "time_domain_channel {} is disabled in the sensing configuration",
                self.time_domain_channel
            )));
        }
        Ok(())
    }
}

/// Load daemon configuration from a JSON file, or the defaults when no path is given.
pub fn load_config(path: Option<&Path>) -> Result<DaemonConfig, ConfigError> {
    let Some(path) = path else {
        info!("No configuration file given; using defaults");
        return Ok(DaemonConfig::default());
    };

    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let config: DaemonConfig = serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

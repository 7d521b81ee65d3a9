//! Periodic health sampling
//!
//! A timer thread reads a [`HealthProbe`] once per period and writes the
//! reading as a `Health` entry. It runs independently of streaming.

use std::fs;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Local;
use flume::{RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::error::HealthError;
use crate::mux::ChannelWriter;

pub const DEFAULT_HEALTH_PERIOD: Duration = Duration::from_secs(20 * 60);

/// Source of one scalar health reading.
pub trait HealthProbe: Send + 'static {
    fn read(&mut self) -> Result<f64, HealthError>;
}

impl<F> HealthProbe for F
where
    F: FnMut() -> Result<f64, HealthError> + Send + 'static,
{
    fn read(&mut self) -> Result<f64, HealthError> {
        self()
    }
}

/// Host battery charge as a fraction in `[0, 1]`, read from the kernel's
/// power-supply class.
pub struct BatteryProbe {
    capacity_path: PathBuf,
}

impl BatteryProbe {
    pub const DEFAULT_CAPACITY_PATH: &'static str = "/sys/class/power_supply/BAT0/capacity";

    pub fn new(capacity_path: impl Into<PathBuf>) -> Self {
        Self {
            capacity_path: capacity_path.into(),
        }
    }
}

impl Default for BatteryProbe {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY_PATH)
    }
}

impl HealthProbe for BatteryProbe {
    fn read(&mut self) -> Result<f64, HealthError> {
        let raw = fs::read_to_string(&self.capacity_path).map_err(|e| {
            HealthError::Unavailable(format!("{}: {}", self.capacity_path.display(), e))
        })?;
        let percent: f64 = raw
            .trim()
            .parse()
            .map_err(|_| HealthError::Parse { raw: raw.trim().to_string() })?;
        Ok((percent / 100.0).clamp(0.0, 1.0))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthStats {
    pub ticks: u64,
    pub written: u64,
    pub failed_reads: u64,
    pub failed_writes: u64,
}

/// Handle to a running health sampler thread.
pub struct HealthSampler {
    stop_tx: Sender<()>,
    handle: JoinHandle<HealthStats>,
}

impl HealthSampler {
    /// Starts sampling. The first reading is taken one full period after start.
    pub fn spawn<P: HealthProbe>(
        mut probe: P,
        mut writer: ChannelWriter,
        period: Duration,
    ) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = flume::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("health_sampler".into())
            .spawn(move || {
                info!("Health sampler started with period {:?}", period);
                let mut stats = HealthStats::default();
                loop {
                    match stop_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    stats.ticks += 1;
                    match probe.read() {
                        Ok(value) => match writer.write(Local::now(), value) {
                            Ok(()) => stats.written += 1,
                            Err(_) => stats.failed_writes += 1,
                        },
                        Err(e) => {
                            warn!("Health reading skipped: {}", e);
                            stats.failed_reads += 1;
                        }
                    }
                    debug!("Health tick {}", stats.ticks);
                }
                info!("Health sampler stopped after {} tick(s)", stats.ticks);
                stats
            })?;
        Ok(Self { stop_tx, handle })
    }

    /// Stops the timer and waits for the thread.
    pub fn stop(self) -> HealthStats {
        let _ = self.stop_tx.try_send(());
        drop(self.stop_tx);
        match self.handle.join() {
            Ok(stats) => stats,
            Err(_) => {
                warn!("Health sampler thread panicked");
                HealthStats::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::test_support::MemorySink;
    use crate::mux::Multiplexer;
    use std::sync::Arc;
    use telemetry_types::ChannelTag;
    use tempfile::tempdir;

    #[test]
    fn battery_probe_reads_capacity_fraction() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("capacity");
        fs::write(&path, "87\n").unwrap();
        let mut probe = BatteryProbe::new(&path);
        assert!((probe.read().unwrap() - 0.87).abs() < 1e-9);

        fs::write(&path, "unknown\n").unwrap();
        assert!(matches!(probe.read(), Err(HealthError::Parse { .. })));
    }

    #[test]
    fn missing_battery_is_unavailable() {
        let mut probe = BatteryProbe::new("/nonexistent/power_supply/capacity");
        assert!(matches!(probe.read(), Err(HealthError::Unavailable(_))));
    }

    #[test]
    fn sampler_writes_one_entry_per_tick() {
        let sink = Arc::new(MemorySink::default());
        let mux = Multiplexer::new(sink.clone());
        let mut level = 1.0;
        let probe = move || -> Result<f64, HealthError> {
            level -= 0.01;
            Ok(level)
        };

        let sampler =
            HealthSampler::spawn(probe, mux.writer(ChannelTag::Health), Duration::from_millis(20))
                .unwrap();
        thread::sleep(Duration::from_millis(150));
        let stats = sampler.stop();

        assert!(stats.ticks >= 2, "only {} ticks", stats.ticks);
        assert_eq!(stats.written, stats.ticks);
        let entries = sink.entries();
        assert_eq!(entries.len() as u64, stats.written);
        assert!(entries.iter().all(|e| e.tag == ChannelTag::Health));
        assert!(entries.windows(2).all(|w| w[0].value > w[1].value));
    }

    #[test]
    fn failed_reads_skip_the_tick() {
        let sink = Arc::new(MemorySink::default());
        let mux = Multiplexer::new(sink.clone());
        let probe = || -> Result<f64, HealthError> {
            Err(HealthError::Unavailable("no battery".to_string()))
        };

        let sampler =
            HealthSampler::spawn(probe, mux.writer(ChannelTag::Health), Duration::from_millis(10))
                .unwrap();
        thread::sleep(Duration::from_millis(60));
        let stats = sampler.stop();

        assert!(stats.failed_reads >= 1);
        assert_eq!(stats.written, 0);
        assert!(sink.entries().is_empty());
    }

    #[test]
    fn stop_before_first_period_writes_nothing() {
        let sink = Arc::new(MemorySink::default());
        let mux = Multiplexer::new(sink.clone());
        let sampler = HealthSampler::spawn(
            || -> Result<f64, HealthError> { Ok(0.5) },
            mux.writer(ChannelTag::Health),
            DEFAULT_HEALTH_PERIOD,
        )
        .unwrap();
        assert_eq!(sampler.stop().ticks, 0);
    }
}

//! Sensing-configuration values pushed to the implanted device
//!
//! These are plain values; the transport is responsible for encoding them.
//! Defaults reproduce the reference recording setup: two time-domain channels
//! at 250 Hz, a 1024-point FFT, four power channels and a 32 Hz accelerometer.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Time-domain sample rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TdSampleRate {
    Disabled,
    Hz250,
    Hz500,
    Hz1000,
}

impl TdSampleRate {
    pub fn hz(&self) -> Option<u32> {
        match self {
            TdSampleRate::Disabled => None,
            TdSampleRate::Hz250 => Some(250),
            TdSampleRate::Hz500 => Some(500),
            TdSampleRate::Hz1000 => Some(1000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EvokedResponse {
    Standard,
    Evoked0Input,
    Evoked1Input,
}

/// First-stage low-pass filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LowPassStage1 {
    Hz50,
    Hz100,
    Hz450,
}

/// Second-stage low-pass filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LowPassStage2 {
    Hz100,
    Hz160,
    Hz350,
    Hz1700,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HighPass {
    Hz0_85,
    Hz1_2,
    Hz3_3,
    Hz8_6,
}

/// Configuration of one time-domain sensing channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeDomainChannel {
    pub sample_rate: TdSampleRate,
    /// Electrode mux input on the positive side (0-7).
    pub mux_plus: u8,
    /// Electrode mux input on the negative side (0-7).
    pub mux_minus: u8,
    pub evoked_response: EvokedResponse,
    pub low_pass_1: LowPassStage1,
    pub low_pass_2: LowPassStage2,
    pub high_pass: HighPass,
}

impl TimeDomainChannel {
    fn new(sample_rate: TdSampleRate, mux_plus: u8, mux_minus: u8) -> Self {
        Self {
            sample_rate,
            mux_plus,
            mux_minus,
            evoked_response: EvokedResponse::Standard,
            low_pass_1: LowPassStage1::Hz100,
            low_pass_2: LowPassStage2::Hz100,
            high_pass: HighPass::Hz0_85,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FftSize {
    Size64,
    Size256,
    Size1024,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FftWindow {
    Hann100,
    Hann50,
    Hann25,
}

/// Spectral-window settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FftSettings {
    pub size: FftSize,
    pub interval_ms: u16,
    pub window: FftWindow,
}

impl Default for FftSettings {
    fn default() -> Self {
        Self {
            size: FftSize::Size1024,
            interval_ms: 100,
            window: FftWindow::Hann100,
        }
    }
}

/// Two power bands on one time-domain channel, expressed as FFT bin ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerChannel {
    pub band0_lower: u16,
    pub band0_upper: u16,
    pub band1_lower: u16,
    pub band1_upper: u16,
}

impl Default for PowerChannel {
    fn default() -> Self {
        Self {
            band0_lower: 5,
            band0_upper: 10,
            band1_lower: 20,
            band1_upper: 30,
        }
    }
}

/// Enables one band of one power channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandEnable {
    pub channel: u8,
    pub band: u8,
}

/// Power-band definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSettings {
    pub band_enables: Vec<BandEnable>,
    pub channels: Vec<PowerChannel>,
}

impl Default for PowerSettings {
    fn default() -> Self {
        Self {
            band_enables: vec![
                BandEnable { channel: 0, band: 0 },
                BandEnable { channel: 0, band: 1 },
                BandEnable { channel: 1, band: 1 },
            ],
            channels: vec![PowerChannel::default(); 4],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Bridging {
    None,
    Bridge0To2,
    Bridge1To3,
}

/// Miscellaneous sensing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiscSettings {
    /// Streaming frame period; deliveries arrive roughly once per frame.
    pub streaming_frame_ms: u16,
    /// Loop-recording trigger mask, zero for none.
    pub loop_recording_triggers: u16,
    pub loop_recording_post_buffer_ms: u16,
    pub bridging: Bridging,
}

impl Default for MiscSettings {
    fn default() -> Self {
        Self {
            streaming_frame_ms: 100,
            loop_recording_triggers: 0,
            loop_recording_post_buffer_ms: 53,
            bridging: Bridging::None,
        }
    }
}

const STREAMING_FRAME_PERIODS_MS: [u16; 8] = [30, 40, 50, 60, 70, 80, 90, 100];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccelSampleRate {
    Disabled,
    Hz4,
    Hz8,
    Hz16,
    Hz32,
    Hz64,
}

impl AccelSampleRate {
    pub fn hz(&self) -> Option<u32> {
        match self {
            AccelSampleRate::Disabled => None,
            AccelSampleRate::Hz4 => Some(4),
            AccelSampleRate::Hz8 => Some(8),
            AccelSampleRate::Hz16 => Some(16),
            AccelSampleRate::Hz32 => Some(32),
            AccelSampleRate::Hz64 => Some(64),
        }
    }
}

/// Complete sensing configuration, written as five independent sub-writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensingConfig {
    pub time_domain: Vec<TimeDomainChannel>,
    pub fft: FftSettings,
    pub power: PowerSettings,
    pub misc: MiscSettings,
    pub accel: AccelSampleRate,
}

impl Default for SensingConfig {
    fn default() -> Self {
        Self {
            time_domain: vec![
                TimeDomainChannel::new(TdSampleRate::Hz250, 0, 2),
                TimeDomainChannel::new(TdSampleRate::Hz250, 4, 6),
                TimeDomainChannel::new(TdSampleRate::Disabled, 0, 2),
                TimeDomainChannel::new(TdSampleRate::Disabled, 1, 3),
            ],
            fft: FftSettings::default(),
            power: PowerSettings::default(),
            misc: MiscSettings::default(),
            accel: AccelSampleRate::Hz32,
        }
    }
}

impl SensingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.time_domain.len() != 4 {
            return Err(ConfigError::Invalid(format!(
                "expected 4 time-domain channels, got {}",
                self.time_domain.len()
            )));
        }
        for (i, ch) in self.time_domain.iter().enumerate() {
            if ch.mux_plus > 7 || ch.mux_minus > 7 {
                return Err(ConfigError::Invalid(format!(
                    "time-domain channel {} uses a mux input outside 0-7",
                    i
                )));
            }
        }
        let enabled_rates: Vec<u32> = self
            .time_domain
            .iter()
            .filter_map(|ch| ch.sample_rate.hz())
            .collect();
        if enabled_rates.windows(2).any(|w| w[0] != w[1]) {
            return Err(ConfigError::Invalid(
                "all enabled time-domain channels must share one sample rate".to_string(),
            ));
        }
        if self.power.channels.len() != 4 {
            return Err(ConfigError::Invalid(format!(
                "expected 4 power channels, got {}",
                self.power.channels.len()
            )));
        }
        for e in &self.power.band_enables {
            if e.channel > 3 || e.band > 1 {
                return Err(ConfigError::Invalid(format!(
                    "band enable out of range: channel {} band {}",
                    e.channel, e.band
                )));
            }
        }
        for (i, ch) in self.power.channels.iter().enumerate() {
            if ch.band0_lower > ch.band0_upper || ch.band1_lower > ch.band1_upper {
                return Err(ConfigError::Invalid(format!(
                    "power channel {} has an inverted band",
                    i
                )));
            }
        }
        if !STREAMING_FRAME_PERIODS_MS.contains(&self.misc.streaming_frame_ms) {
            return Err(ConfigError::Invalid(format!(
                "unsupported streaming frame period {} ms",
                self.misc.streaming_frame_ms
            )));
        }
        Ok(())
    }
}

/// Which sensing blocks run on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenseStates {
    pub lfp: bool,
    pub fft: bool,
    pub power: bool,
}

impl SenseStates {
    pub fn none() -> Self {
        Self {
            lfp: false,
            fft: false,
            power: false,
        }
    }

    pub fn is_none(&self) -> bool {
        !(self.lfp || self.fft || self.power)
    }
}

impl Default for SenseStates {
    fn default() -> Self {
        Self {
            lfp: true,
            fft: true,
            power: true,
        }
    }
}

/// Which streams the device sends to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSelection {
    pub time_domain: bool,
    pub fft: bool,
    pub power: bool,
    pub detection: bool,
    pub adaptive_state: bool,
    pub accelerometer: bool,
    pub time_sync: bool,
    pub loop_record_markers: bool,
}

impl StreamSelection {
    pub fn includes(&self, kind: crate::data::StreamKind) -> bool {
        use crate::data::StreamKind;
        match kind {
            StreamKind::TimeDomain => self.time_domain,
            StreamKind::Power => self.power,
            StreamKind::Accelerometer => self.accelerometer,
        }
    }
}

impl Default for StreamSelection {
    fn default() -> Self {
        Self {
            time_domain: true,
            fft: false,
            power: true,
            detection: false,
            adaptive_state: false,
            accelerometer: true,
            time_sync: true,
            loop_record_markers: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sensing_config_is_valid() {
        SensingConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_mixed_time_domain_rates() {
        let mut config = SensingConfig::default();
        config.time_domain[1].sample_rate = TdSampleRate::Hz500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_frame_period() {
        let mut config = SensingConfig::default();
        config.misc.streaming_frame_ms = 45;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: SensingConfig =
            serde_json::from_str(r#"{ "accel": "hz64" }"#).unwrap();
        assert_eq!(config.accel, AccelSampleRate::Hz64);
        assert_eq!(config.time_domain.len(), 4);
        assert_eq!(config.fft, FftSettings::default());
    }
}

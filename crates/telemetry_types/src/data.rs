use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Bonding state of a relay as reported by the local registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BondingStatus {
    Bonded,
    Unbonded,
}

/// A relay unit known to the transport layer.
///
/// Read from the transport's registry and never modified afterwards; the
/// relay itself is owned by the transport and referenced here by serial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInstrument {
    pub serial_number: String,
    pub bonding: BondingStatus,
}

impl RelayInstrument {
    pub fn bonded(serial_number: impl Into<String>) -> Self {
        Self {
            serial_number: serial_number.into(),
            bonding: BondingStatus::Bonded,
        }
    }

    pub fn unbonded(serial_number: impl Into<String>) -> Self {
        Self {
            serial_number: serial_number.into(),
            bonding: BondingStatus::Unbonded,
        }
    }

    pub fn is_bonded(&self) -> bool {
        self.bonding == BondingStatus::Bonded
    }
}

/// An implanted device seen during one discovery poll.
///
/// Discovery results carry no identity guarantee across polls; treat every
/// record as fresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub serial_number: String,
    /// Received signal strength at discovery time, when the transport reports it.
    pub rssi: Option<i16>,
}

impl fmt::Display for DiscoveredDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rssi {
            Some(rssi) => write!(f, "{} (rssi {})", self.serial_number, rssi),
            None => f.write_str(&self.serial_number),
        }
    }
}

/// Non-fatal warnings reported alongside a successful session start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectWarnings(pub Vec<String>);

impl fmt::Display for ConnectWarnings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("None")
        } else {
            f.write_str(&self.0.join(", "))
        }
    }
}

/// The physiological streams the implanted device can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StreamKind {
    TimeDomain,
    Power,
    Accelerometer,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamKind::TimeDomain => "time-domain",
            StreamKind::Power => "power",
            StreamKind::Accelerometer => "accelerometer",
        };
        f.write_str(name)
    }
}

/// Accelerometer axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

/// Sub-channel key inside a [`SampleBatch`].
///
/// Time-domain batches are keyed by channel index, power batches by band
/// index and accelerometer batches by axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SubChannel {
    Index(u8),
    Axis(Axis),
}

/// One delivery from the transport for a single stream.
///
/// The number of samples per sub-channel follows the transport's framing and
/// varies from batch to batch. Consumers must never assume a fixed length.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBatch {
    pub kind: StreamKind,
    /// Producer-local packet counter, increasing by one per delivery.
    pub sequence: u64,
    pub channels: BTreeMap<SubChannel, Vec<f64>>,
}

impl SampleBatch {
    pub fn new(kind: StreamKind, sequence: u64) -> Self {
        Self {
            kind,
            sequence,
            channels: BTreeMap::new(),
        }
    }

    pub fn with_channel(mut self, sub: SubChannel, samples: Vec<f64>) -> Self {
        self.channels.insert(sub, samples);
        self
    }

    pub fn samples(&self, sub: SubChannel) -> Option<&[f64]> {
        self.channels.get(&sub).map(Vec::as_slice)
    }
}

/// Identity of the channel an entry belongs to, as written in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelTag {
    TimeDomain,
    Power,
    Accel(Axis),
    Health,
}

impl fmt::Display for ChannelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ChannelTag::TimeDomain => "TD",
            ChannelTag::Power => "Power",
            ChannelTag::Accel(Axis::X) => "AccelX",
            ChannelTag::Accel(Axis::Y) => "AccelY",
            ChannelTag::Accel(Axis::Z) => "AccelZ",
            ChannelTag::Health => "Health",
        };
        f.write_str(tag)
    }
}

/// The atomic unit written to the log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub tag: ChannelTag,
    pub value: f64,
}

impl LogEntry {
    /// Renders the entry as one log line, without the trailing newline.
    pub fn to_line(&self) -> String {
        format!("{}, {}, {}", format_timestamp(&self.timestamp), self.tag, self.value)
    }
}

/// Formats a timestamp as `yyyyMMddHHmmssffff` (ten-thousandths of a second).
pub fn format_timestamp(ts: &DateTime<Local>) -> String {
    let ten_thousandths = (ts.timestamp_subsec_micros() / 100).min(9999);
    format!("{}{:04}", ts.format("%Y%m%d%H%M%S"), ten_thousandths)
}

/// Therapy group slot on the implanted device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupNumber {
    A,
    B,
    C,
    D,
}

/// Result of a general interrogation of the implanted device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralInfo {
    pub active_group: GroupNumber,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TherapyProgram {
    pub amplitude_ma: f64,
}

/// Stimulation parameters of one therapy group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TherapyGroup {
    pub rate_hz: f64,
    pub programs: Vec<TherapyProgram>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamp_has_ten_thousandths_resolution() {
        let ts = Local
            .with_ymd_and_hms(2024, 7, 30, 13, 3, 9)
            .unwrap()
            .checked_add_signed(chrono::Duration::microseconds(123_456))
            .unwrap();
        assert_eq!(format_timestamp(&ts), "202407301303091234");
    }

    #[test]
    fn log_line_layout() {
        let ts = Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let entry = LogEntry {
            timestamp: ts,
            tag: ChannelTag::Accel(Axis::Y),
            value: -0.25,
        };
        assert_eq!(entry.to_line(), "202401020304050000, AccelY, -0.25");
    }

    #[test]
    fn missing_sub_channel_is_none() {
        let batch = SampleBatch::new(StreamKind::TimeDomain, 0)
            .with_channel(SubChannel::Index(1), vec![1.0, 2.0]);
        assert!(batch.samples(SubChannel::Index(0)).is_none());
        assert_eq!(batch.samples(SubChannel::Index(1)), Some(&[1.0, 2.0][..]));
    }
}

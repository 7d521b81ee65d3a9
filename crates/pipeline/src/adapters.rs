//! Streaming channel adapters
//!
//! One adapter thread per stream drains the delivery queue obtained from the
//! session and turns each [`SampleBatch`] into log entries. Adapters never
//! touch the session itself.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Local;
use flume::{Receiver, RecvTimeoutError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use telemetry_types::{Axis, ChannelTag, SampleBatch, StreamKind, SubChannel};

use crate::mux::{ChannelWriter, Multiplexer};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Which sub-channels an adapter extracts from each delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// One configured time-domain channel; a fresh timestamp per sample.
    TimeDomain { channel: u8 },
    /// Every band present in the delivery, sharing one timestamp.
    Power,
    /// X, then Y, then Z, sharing one timestamp.
    Accelerometer,
}

impl Selection {
    pub fn kind(&self) -> StreamKind {
        match self {
            Selection::TimeDomain { .. } => StreamKind::TimeDomain,
            Selection::Power => StreamKind::Power,
            Selection::Accelerometer => StreamKind::Accelerometer,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterStats {
    pub batches: u64,
    /// Deliveries without the selected sub-channel.
    pub skipped: u64,
    pub written: u64,
    pub failed: u64,
}

/// Converts deliveries into log entries for one stream.
pub struct ChannelAdapter {
    selection: Selection,
    writers: Vec<ChannelWriter>,
    stats: AdapterStats,
}

impl ChannelAdapter {
    pub fn new(selection: Selection, mux: &Multiplexer) -> Self {
        let writers = match selection {
            Selection::TimeDomain { .. } => vec![mux.writer(ChannelTag::TimeDomain)],
            Selection::Power => vec![mux.writer(ChannelTag::Power)],
            Selection::Accelerometer => [Axis::X, Axis::Y, Axis::Z]
                .into_iter()
                .map(|axis| mux.writer(ChannelTag::Accel(axis)))
                .collect(),
        };
        Self {
            selection,
            writers,
            stats: AdapterStats::default(),
        }
    }

    pub fn stats(&self) -> AdapterStats {
        self.stats
    }

    /// Processes one delivery. Write failures are counted and do not stop
    /// the remaining samples.
    pub fn handle_batch(&mut self, batch: &SampleBatch) {
        self.stats.batches += 1;
        if batch.kind != self.selection.kind() {
            warn!(
                "Adapter for {} received a {} batch; ignoring",
                self.selection.kind(),
                batch.kind
            );
            self.stats.skipped += 1;
            return;
        }

        match self.selection {
            Selection::TimeDomain { channel } => {
                let Some(samples) = batch.samples(SubChannel::Index(channel)) else {
                    trace!("TD batch {} has no channel {}", batch.sequence, channel);
                    self.stats.skipped += 1;
                    return;
                };
                let writer = &mut self.writers[0];
                for &value in samples {
                    tally(&mut self.stats, writer.write(Local::now(), value).is_ok());
                }
            }
            Selection::Power => {
                if batch.channels.is_empty() {
                    self.stats.skipped += 1;
                    return;
                }
                let timestamp = Local::now();
                let writer = &mut self.writers[0];
                for samples in batch.channels.values() {
                    for &value in samples {
                        tally(&mut self.stats, writer.write(timestamp, value).is_ok());
                    }
                }
            }
            Selection::Accelerometer => {
                let timestamp = Local::now();
                let mut any_axis = false;
                for (writer, axis) in self.writers.iter_mut().zip([Axis::X, Axis::Y, Axis::Z]) {
                    let Some(samples) = batch.samples(SubChannel::Axis(axis)) else {
                        continue;
                    };
                    any_axis = true;
                    for &value in samples {
                        tally(&mut self.stats, writer.write(timestamp, value).is_ok());
                    }
                }
                if !any_axis {
                    self.stats.skipped += 1;
                }
            }
        }
    }

    /// Drains `rx` until `cancel` fires or the queue disconnects. Deliveries
    /// already queued when cancellation is observed are still processed.
    pub fn run(mut self, rx: Receiver<SampleBatch>, cancel: CancellationToken) -> AdapterStats {
        info!("{} adapter started", self.selection.kind());
        while !cancel.is_cancelled() {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(batch) => self.handle_batch(&batch),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("{} queue disconnected", self.selection.kind());
                    break;
                }
            }
        }
        for batch in rx.try_iter() {
            self.handle_batch(&batch);
        }
        info!(
            "{} adapter stopped: {} batches, {} written, {} failed, {} skipped",
            self.selection.kind(),
            self.stats.batches,
            self.stats.written,
            self.stats.failed,
            self.stats.skipped
        );
        self.stats
    }
}

fn tally(stats: &mut AdapterStats, ok: bool) {
    if ok {
        stats.written += 1;
    } else {
        stats.failed += 1;
    }
}

/// A running adapter thread.
pub struct AdapterHandle {
    kind: StreamKind,
    handle: JoinHandle<AdapterStats>,
}

impl AdapterHandle {
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Waits for the thread to exit. Cancel its token first.
    pub fn join(self) -> AdapterStats {
        match self.handle.join() {
            Ok(stats) => stats,
            Err(_) => {
                warn!("{} adapter thread panicked", self.kind);
                AdapterStats::default()
            }
        }
    }
}

/// Starts an adapter thread draining `rx`.
pub fn spawn_adapter(
    selection: Selection,
    rx: Receiver<SampleBatch>,
    mux: &Multiplexer,
    cancel: CancellationToken,
) -> std::io::Result<AdapterHandle> {
    let adapter = ChannelAdapter::new(selection, mux);
    let kind = selection.kind();
    let handle = thread::Builder::new()
        .name(format!("{}_adapter", kind))
        .spawn(move || adapter.run(rx, cancel))?;
    Ok(AdapterHandle { kind, handle })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::test_support::MemorySink;
    use std::sync::Arc;

    fn td_batch(seq: u64, channel: u8, n: usize) -> SampleBatch {
        SampleBatch::new(StreamKind::TimeDomain, seq)
            .with_channel(SubChannel::Index(channel), (0..n).map(|i| i as f64).collect())
    }

    #[test]
    fn time_domain_writes_every_sample_in_order() {
        let sink = Arc::new(MemorySink::default());
        let mux = Multiplexer::new(sink.clone());
        let mut adapter = ChannelAdapter::new(Selection::TimeDomain { channel: 0 }, &mux);

        adapter.handle_batch(&td_batch(0, 0, 50));

        let entries = sink.entries();
        assert_eq!(entries.len(), 50);
        assert!(entries.iter().all(|e| e.tag == ChannelTag::TimeDomain));
        let values: Vec<f64> = entries.iter().map(|e| e.value).collect();
        assert_eq!(values, (0..50).map(|i| i as f64).collect::<Vec<_>>());
        assert!(entries.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn missing_channel_writes_nothing() {
        let sink = Arc::new(MemorySink::default());
        let mux = Multiplexer::new(sink.clone());
        let mut adapter = ChannelAdapter::new(Selection::TimeDomain { channel: 0 }, &mux);

        adapter.handle_batch(&td_batch(0, 1, 50));

        assert!(sink.entries().is_empty());
        assert_eq!(adapter.stats().skipped, 1);
    }

    #[test]
    fn one_failed_write_does_not_stop_the_batch() {
        let sink = Arc::new(MemorySink::failing_on(vec![7]));
        let mux = Multiplexer::new(sink.clone());
        let mut adapter = ChannelAdapter::new(Selection::TimeDomain { channel: 0 }, &mux);

        adapter.handle_batch(&td_batch(0, 0, 20));
        adapter.handle_batch(&td_batch(1, 0, 5));

        assert_eq!(sink.entries().len(), 24);
        let stats = adapter.stats();
        assert_eq!((stats.written, stats.failed), (24, 1));
    }

    #[test]
    fn power_writes_all_bands_with_one_timestamp() {
        let sink = Arc::new(MemorySink::default());
        let mux = Multiplexer::new(sink.clone());
        let mut adapter = ChannelAdapter::new(Selection::Power, &mux);

        let batch = SampleBatch::new(StreamKind::Power, 0)
            .with_channel(SubChannel::Index(0), vec![10.0])
            .with_channel(SubChannel::Index(1), vec![11.0])
            .with_channel(SubChannel::Index(3), vec![13.0]);
        adapter.handle_batch(&batch);

        let entries = sink.entries();
        let values: Vec<f64> = entries.iter().map(|e| e.value).collect();
        assert_eq!(values, vec![10.0, 11.0, 13.0]);
        assert!(entries.iter().all(|e| e.timestamp == entries[0].timestamp));
    }

    #[test]
    fn accelerometer_writes_x_then_y_then_z() {
        let sink = Arc::new(MemorySink::default());
        let mux = Multiplexer::new(sink.clone());
        let mut adapter = ChannelAdapter::new(Selection::Accelerometer, &mux);

        let batch = SampleBatch::new(StreamKind::Accelerometer, 0)
            .with_channel(SubChannel::Axis(Axis::Z), vec![1.0, 1.1])
            .with_channel(SubChannel::Axis(Axis::X), vec![0.1, 0.2])
            .with_channel(SubChannel::Axis(Axis::Y), vec![-0.1, -0.2]);
        adapter.handle_batch(&batch);

        let tags: Vec<String> = sink.entries().iter().map(|e| e.tag.to_string()).collect();
        assert_eq!(tags, ["AccelX", "AccelX", "AccelY", "AccelY", "AccelZ", "AccelZ"]);
    }

    #[test]
    fn thread_drains_queue_and_stops_on_disconnect() {
        let sink = Arc::new(MemorySink::default());
        let mux = Multiplexer::new(sink.clone());
        let (tx, rx) = flume::unbounded();
        let handle = spawn_adapter(
            Selection::TimeDomain { channel: 2 },
            rx,
            &mux,
            CancellationToken::new(),
        )
        .unwrap();

        for seq in 0..4 {
            tx.send(td_batch(seq, 2, 10)).unwrap();
        }
        drop(tx);

        let stats = handle.join();
        assert_eq!(stats.batches, 4);
        assert_eq!(stats.written, 40);
        assert_eq!(sink.entries().len(), 40);
    }
}

//! Sample multiplexer
//!
//! Every producer (adapter or health sampler) writes through its own
//! [`ChannelWriter`]. Entries from one writer reach the sink in the order they
//! were written, and their timestamps never go backwards even if the wall
//! clock does. Entries from different writers interleave in arrival order.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use tracing::warn;

use telemetry_types::{ChannelTag, LogEntry};

use crate::error::SinkResult;
use crate::sink::LogSink;

/// Per-tag counters reported at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub written: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    written: AtomicU64,
    failed: AtomicU64,
}

/// Fan-in point between producers and the log sink.
#[derive(Clone)]
pub struct Multiplexer {
    sink: Arc<dyn LogSink>,
    counters: Arc<Mutex<BTreeMap<ChannelTag, Arc<Counters>>>>,
}

impl Multiplexer {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            sink,
            counters: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    fn counters_for(&self, tag: ChannelTag) -> Arc<Counters> {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        counters.entry(tag).or_default().clone()
    }

    /// Creates a writer for one producer. Several writers may share a tag;
    /// they share its counters.
    pub fn writer(&self, tag: ChannelTag) -> ChannelWriter {
        ChannelWriter {
            tag,
            sink: self.sink.clone(),
            counters: self.counters_for(tag),
            last_timestamp: None,
        }
    }

    pub fn stats(&self) -> BTreeMap<ChannelTag, ChannelStats> {
        let counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        counters
            .iter()
            .map(|(tag, c)| {
                (
                    *tag,
                    ChannelStats {
                        written: c.written.load(Ordering::Relaxed),
                        failed: c.failed.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }

    pub fn flush(&self) -> SinkResult<()> {
        self.sink.flush()
    }
}

fn record(counters: &Counters, result: SinkResult<()>) -> SinkResult<()> {
    match &result {
        Ok(()) => counters.written.fetch_add(1, Ordering::Relaxed),
        Err(_) => counters.failed.fetch_add(1, Ordering::Relaxed),
    };
    result
}

/// One producer's handle onto the multiplexer.
pub struct ChannelWriter {
    tag: ChannelTag,
    sink: Arc<dyn LogSink>,
    counters: Arc<Counters>,
    last_timestamp: Option<DateTime<Local>>,
}

impl ChannelWriter {
    /// Appends one value. A failed append is counted and returned; the writer
    /// stays usable.
    pub fn write(&mut self, timestamp: DateTime<Local>, value: f64) -> SinkResult<()> {
        let timestamp = match self.last_timestamp {
            Some(last) if timestamp < last => last,
            _ => timestamp,
        };
        self.last_timestamp = Some(timestamp);

        let entry = LogEntry {
            timestamp,
            tag: self.tag,
            value,
        };
        let result = record(&self.counters, self.sink.append(&entry));
        if let Err(e) = &result {
            warn!(tag = %self.tag, "Dropped log entry: {}", e);
        }
        result
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::MemorySink;
    use super::*;
    use chrono::Duration;
    use std::thread;
    use telemetry_types::Axis;

    #[test]
    fn timestamps_never_go_backwards_per_writer() {
        let sink = Arc::new(MemorySink::default());
        let mux = Multiplexer::new(sink.clone());
        let mut writer = mux.writer(ChannelTag::TimeDomain);

        let now = Local::now();
        writer.write(now, 1.0).unwrap();
        writer.write(now - Duration::seconds(5), 2.0).unwrap();
        writer.write(now + Duration::seconds(1), 3.0).unwrap();

        let entries = sink.entries();
        assert_eq!(entries[1].timestamp, now);
        assert!(entries.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn failure_is_counted_and_writer_continues() {
        let sink = Arc::new(MemorySink::failing_on(vec![2]));
        let mux = Multiplexer::new(sink.clone());
        let mut writer = mux.writer(ChannelTag::Health);

        assert!(writer.write(Local::now(), 0.9).is_ok());
        assert!(writer.write(Local::now(), 0.8).is_err());
        assert!(writer.write(Local::now(), 0.7).is_ok());

        assert_eq!(sink.entries().len(), 2);
        assert_eq!(
            mux.stats()[&ChannelTag::Health],
            ChannelStats {
                written: 2,
                failed: 1
            }
        );
    }

    #[test]
    fn concurrent_producers_keep_their_own_order() {
        let sink = Arc::new(MemorySink::default());
        let mux = Multiplexer::new(sink.clone());

        let handles: Vec<_> = [Axis::X, Axis::Y, Axis::Z]
            .into_iter()
            .map(|axis| {
                let mut writer = mux.writer(ChannelTag::Accel(axis));
                thread::spawn(move || {
                    for i in 0..200 {
                        writer.write(Local::now(), i as f64).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let entries = sink.entries();
        assert_eq!(entries.len(), 600);
        for axis in [Axis::X, Axis::Y, Axis::Z] {
            let values: Vec<f64> = entries
                .iter()
                .filter(|e| e.tag == ChannelTag::Accel(axis))
                .map(|e| e.value)
                .collect();
            let expected: Vec<f64> = (0..200).map(|i| i as f64).collect();
            assert_eq!(values, expected);
        }
    }
}

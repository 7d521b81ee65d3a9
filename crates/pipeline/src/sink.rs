//! Append-only log sink for telemetry entries.

use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use telemetry_types::LogEntry;

use crate::error::{SinkError, SinkResult};

/// Durable destination for log entries.
///
/// Implementations serialize concurrent appends internally; callers from any
/// thread may share one sink.
pub trait LogSink: Send + Sync {
    /// Append one entry as a single line. Never panics.
    fn append(&self, entry: &LogEntry) -> SinkResult<()>;

    /// Push buffered lines to durable storage.
    fn flush(&self) -> SinkResult<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSinkConfig {
    pub path: PathBuf,
    /// Flush after every line instead of buffering.
    pub flush_each_entry: bool,
    /// Extend an existing file instead of truncating it.
    pub append: bool,
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("telemetry_log.txt"),
            flush_each_entry: false,
            append: true,
        }
    }
}

/// A sink that writes `timestamp, tag, value` lines to a text file.
pub struct FileLogSink {
    path: PathBuf,
    flush_each_entry: bool,
    writer: Mutex<BufWriter<File>>,
}

impl FileLogSink {
    pub fn open(config: &LogSinkConfig) -> SinkResult<Self> {
        let open_err = |source| SinkError::Open {
            path: config.path.display().to_string(),
            source,
        };

        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                create_dir_all(parent).map_err(open_err)?;
            }
        }

        let file = if config.append {
            OpenOptions::new().create(true).append(true).open(&config.path)
        } else {
            File::create(&config.path)
        }
        .map_err(open_err)?;

        info!(
            path = %config.path.display(),
            append = config.append,
            flush_each_entry = config.flush_each_entry,
            "Opened telemetry log"
        );

        Ok(Self {
            path: config.path.clone(),
            flush_each_entry: config.flush_each_entry,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    fn writer(&self) -> SinkResult<MutexGuard<'_, BufWriter<File>>> {
        self.writer
            .lock()
            .map_err(|_| SinkError::WriteFailure("log writer lock poisoned".to_string()))
    }
}

impl LogSink for FileLogSink {
    fn append(&self, entry: &LogEntry) -> SinkResult<()> {
        let line = entry.to_line();
        let mut writer = self.writer()?;
        writeln!(writer, "{}", line)
            .map_err(|e| SinkError::WriteFailure(format!("failed to write log line: {}", e)))?;
        if self.flush_each_entry {
            writer
                .flush()
                .map_err(|e| SinkError::WriteFailure(format!("failed to flush log: {}", e)))?;
        }
        Ok(())
    }

    fn flush(&self) -> SinkResult<()> {
        self.writer()?
            .flush()
            .map_err(|e| SinkError::WriteFailure(format!("failed to flush log: {}", e)))
    }
}

impl Drop for FileLogSink {
    fn drop(&mut self) {
        if let Ok(writer) = self.writer.get_mut() {
            if let Err(e) = writer.flush() {
                debug!("Final flush of {} failed: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};
    use std::fs;
    use telemetry_types::ChannelTag;
    use tempfile::tempdir;

    fn entry(value: f64) -> LogEntry {
        LogEntry {
            timestamp: Local.with_ymd_and_hms(2024, 7, 30, 13, 30, 0).unwrap(),
            tag: ChannelTag::Power,
            value,
        }
    }

    #[test]
    fn writes_one_line_per_entry() {
        let dir = tempdir().unwrap();
        let config = LogSinkConfig {
            path: dir.path().join("nested").join("log.txt"),
            flush_each_entry: true,
            append: true,
        };
        let sink = FileLogSink::open(&config).unwrap();
        sink.append(&entry(1.5)).unwrap();
        sink.append(&entry(2.0)).unwrap();

        let contents = fs::read_to_string(&config.path).unwrap();
        assert_eq!(
            contents,
            "202407301330000000, Power, 1.5\n202407301330000000, Power, 2\n"
        );
    }

    #[test]
    fn append_mode_extends_existing_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.txt");
        fs::write(&path, "earlier\n").unwrap();

        let config = LogSinkConfig {
            path: path.clone(),
            ..LogSinkConfig::default()
        };
        {
            let sink = FileLogSink::open(&config).unwrap();
            sink.append(&entry(3.0)).unwrap();
        }
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("earlier\n"));
        assert!(contents.ends_with(", Power, 3\n"));
    }

    #[test]
    fn truncate_mode_starts_fresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.txt");
        fs::write(&path, "earlier\n").unwrap();

        let sink = FileLogSink::open(&LogSinkConfig {
            path: path.clone(),
            flush_each_entry: false,
            append: false,
        })
        .unwrap();
        sink.append(&entry(4.0)).unwrap();
        sink.flush().unwrap();
        assert!(!fs::read_to_string(&path).unwrap().contains("earlier"));
    }
}

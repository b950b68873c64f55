use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::GalvoError;
use crate::raster::ScanEvent;

/// Consecutive failed flushes tolerated before the log gives up
const MAX_FLUSH_FAILURES: usize = 10;

/// One line of the event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ScanEvent,
}

/// Buffered JSON-lines writer for scan events
///
/// Records are appended to the file in batches of `buffer_size`. A failing
/// disk does not abort a running scan: failed flushes keep their records
/// buffered and only after repeated failures is an error returned.
#[derive(Debug)]
pub struct EventLog {
    buffer: Vec<EventRecord>,
    buffer_size: usize,
    file_path: PathBuf,
    flush_failures: usize,
    written: usize,
}

impl EventLog {
    pub fn new<P: Into<PathBuf>>(file_path: P, buffer_size: usize) -> Self {
        let mut file_path = file_path.into();
        if file_path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            file_path.set_extension("jsonl");
        }
        let buffer_size = buffer_size.max(1);

        Self {
            buffer: Vec::with_capacity(buffer_size),
            buffer_size,
            file_path,
            flush_failures: 0,
            written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Records pending in memory
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Records that have reached the file
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn add(&mut self, event: ScanEvent) -> Result<(), GalvoError> {
        self.buffer.push(EventRecord {
            timestamp: Utc::now(),
            event,
        });

        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), GalvoError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        match self.write_buffer() {
            Ok(()) => {
                self.flush_failures = 0;
                self.written += self.buffer.len();
                self.buffer.clear();
                Ok(())
            }
            Err(e) => {
                self.flush_failures += 1;
                error!(
                    "Event log flush failure {}/{}: {}",
                    self.flush_failures, MAX_FLUSH_FAILURES, e
                );
                if self.flush_failures % 3 == 0 {
                    warn!(
                        "Event log at {:?} keeps failing to flush, {} records buffered",
                        self.file_path,
                        self.buffer.len()
                    );
                }
                if self.flush_failures >= MAX_FLUSH_FAILURES {
                    return Err(GalvoError::Io {
                        source: std::io::Error::other(e.to_string()),
                        context: format!(
                            "Too many consecutive flush failures ({}) for {:?}",
                            MAX_FLUSH_FAILURES, self.file_path
                        ),
                    });
                }
                Ok(())
            }
        }
    }

    fn write_buffer(&self) -> Result<(), GalvoError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
            .map_err(|source| GalvoError::Io {
                source,
                context: format!("Could not open event log at {:?}", self.file_path),
            })?;

        let mut writer = BufWriter::new(file);
        for record in &self.buffer {
            let line = serde_json::to_string(record)?;
            writeln!(writer, "{line}")?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Drain `events` into the log until every sender has hung up
    ///
    /// Meant to run on its own thread next to a raster scan.
    pub fn record_until_closed(
        &mut self,
        events: Receiver<ScanEvent>,
    ) -> Result<usize, GalvoError> {
        let mut count = 0;
        for event in events {
            self.add(event)?;
            count += 1;
        }
        self.flush()?;
        info!("Recorded {count} scan events to {:?}", self.file_path);
        Ok(count)
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Read back an event log written by [`EventLog`]
pub fn read_event_log<P: AsRef<Path>>(path: P) -> Result<Vec<EventRecord>, GalvoError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| GalvoError::Io {
        source,
        context: format!("Could not read event log at {path:?}"),
    })?;

    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(GalvoError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VoltagePair;
    use crossbeam_channel::unbounded;

    fn temp_log_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("galvo-scan-{}-{name}.jsonl", std::process::id()))
    }

    fn pixel(index: usize) -> ScanEvent {
        ScanEvent::Pixel {
            index,
            row: 0,
            column: index,
            position: VoltagePair::new(index as f64 * 0.1, 0.0),
            start_us: index as u64 * 100,
            dwell_us: 100,
        }
    }

    #[test]
    fn test_extension_is_forced_to_jsonl() {
        let log = EventLog::new("/tmp/scan-events.txt", 4);
        assert_eq!(log.path(), Path::new("/tmp/scan-events.jsonl"));
    }

    #[test]
    fn test_buffer_flushes_when_full() {
        let path = temp_log_path("buffered");
        let _ = std::fs::remove_file(&path);

        let mut log = EventLog::new(&path, 2);
        log.add(pixel(0)).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.written(), 0);

        log.add(pixel(1)).unwrap();
        assert!(log.is_empty());
        assert_eq!(log.written(), 2);

        let records = read_event_log(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].event, pixel(1));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_records_channel_until_closed() {
        let path = temp_log_path("channel");
        let _ = std::fs::remove_file(&path);

        let (tx, rx) = unbounded();
        tx.send(ScanEvent::Started {
            columns: 2,
            rows: 1,
            mode: Default::default(),
            integration_time_us: 100.0,
        })
        .unwrap();
        tx.send(pixel(0)).unwrap();
        tx.send(ScanEvent::Finished {
            pixels: 1,
            cancelled: false,
        })
        .unwrap();
        drop(tx);

        let mut log = EventLog::new(&path, 64);
        assert_eq!(log.record_until_closed(rx).unwrap(), 3);

        let content = std::fs::read_to_string(&path).unwrap();
        let first = content.lines().next().unwrap();
        assert!(first.contains("\"event\":\"started\""));
        assert!(first.contains("\"timestamp\""));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_unwritable_path_is_tolerated_then_reported() {
        let mut log = EventLog::new("/nonexistent-dir/galvo/events", 1);
        for i in 0..MAX_FLUSH_FAILURES - 1 {
            assert!(log.add(pixel(i)).is_ok());
        }
        assert_eq!(log.len(), MAX_FLUSH_FAILURES - 1);
        assert!(matches!(log.add(pixel(99)), Err(GalvoError::Io { .. })));
    }
}

//! Warning capture for unit tests.
//!
//! One logger serves the whole test binary; records are tagged with the
//! thread that logged them so parallel tests only see their own.

use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;
use std::sync::OnceLock;
use std::thread::{self, ThreadId};

struct CaptureLogger {
    records: Mutex<Vec<(ThreadId, String)>>,
}

impl Log for CaptureLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Warn
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.records
                .lock()
                .push((thread::current().id(), record.args().to_string()));
        }
    }

    fn flush(&self) {}
}

static LOGGER: OnceLock<CaptureLogger> = OnceLock::new();

fn logger() -> &'static CaptureLogger {
    LOGGER.get_or_init(|| CaptureLogger {
        records: Mutex::new(Vec::new()),
    })
}

/// Start capturing warnings for the calling thread, dropping earlier ones
pub fn capture() {
    let logger = logger();
    if log::set_logger(logger).is_ok() {
        log::set_max_level(LevelFilter::Warn);
    }
    let id = thread::current().id();
    logger.records.lock().retain(|(thread, _)| *thread != id);
}

/// Warnings and errors logged by the calling thread since [`capture`]
pub fn warnings() -> Vec<String> {
    let id = thread::current().id();
    logger()
        .records
        .lock()
        .iter()
        .filter(|(thread, _)| *thread == id)
        .map(|(_, message)| message.clone())
        .collect()
}

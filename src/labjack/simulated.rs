use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::interface::DaqInterface;
use super::registers;
use crate::error::GalvoError;

/// One call into the simulated device, in the order it happened
#[derive(Debug, Clone, PartialEq)]
pub enum DaqOp {
    /// A single-register write
    Write { channel: String, value: f64 },
    /// A multi-register write issued as one transaction
    Batch(Vec<(String, f64)>),
    Close,
}

/// Shared record of everything written to a [`SimulatedDaq`]
///
/// Cloning the journal keeps a view onto the same record, so a test can keep
/// one while the device itself is moved into a controller or another thread.
#[derive(Debug, Clone, Default)]
pub struct DaqJournal {
    ops: Arc<Mutex<Vec<DaqOp>>>,
}

impl DaqJournal {
    fn push(&self, op: DaqOp) {
        self.ops.lock().push(op);
    }

    pub fn ops(&self) -> Vec<DaqOp> {
        self.ops.lock().clone()
    }

    /// Every paired (batched) write as `(first value, second value)`
    pub fn pairs(&self) -> Vec<(f64, f64)> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                DaqOp::Batch(writes) if writes.len() == 2 => Some((writes[0].1, writes[1].1)),
                _ => None,
            })
            .collect()
    }

    /// Values written to `channel` through single writes
    pub fn writes_to(&self, channel: &str) -> Vec<f64> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                DaqOp::Write { channel: c, value } if c == channel => Some(*value),
                _ => None,
            })
            .collect()
    }

    pub fn closed(&self) -> bool {
        self.ops.lock().iter().any(|op| matches!(op, DaqOp::Close))
    }

    pub fn clear(&self) {
        self.ops.lock().clear();
    }
}

/// In-memory stand-in for the T7, used for dry runs and tests
///
/// Register names are validated against the T7 map. Reads return the last
/// value written to that register, or a preset value.
#[derive(Debug, Default)]
pub struct SimulatedDaq {
    registers: HashMap<String, f64>,
    journal: DaqJournal,
    closed: bool,
    fail_on_close: bool,
}

impl SimulatedDaq {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn journal(&self) -> DaqJournal {
        self.journal.clone()
    }

    /// Preset the value returned when `channel` is read
    pub fn with_register(mut self, channel: &str, value: f64) -> Self {
        self.registers.insert(channel.to_ascii_uppercase(), value);
        self
    }

    /// Make `close` report a release failure
    pub fn failing_close(mut self) -> Self {
        self.fail_on_close = true;
        self
    }

    pub fn register(&self, channel: &str) -> Option<f64> {
        self.registers.get(&channel.to_ascii_uppercase()).copied()
    }

    fn ensure_open(&self) -> Result<(), GalvoError> {
        if self.closed {
            Err(GalvoError::DeviceClosed)
        } else {
            Ok(())
        }
    }

    fn store(&mut self, channel: &str, value: f64) -> Result<(), GalvoError> {
        registers::lookup(channel)?;
        self.registers.insert(channel.to_ascii_uppercase(), value);
        Ok(())
    }
}

impl DaqInterface for SimulatedDaq {
    fn write_name(&mut self, channel: &str, value: f64) -> Result<(), GalvoError> {
        self.ensure_open()?;
        self.store(channel, value)?;
        self.journal.push(DaqOp::Write {
            channel: channel.to_string(),
            value,
        });
        Ok(())
    }

    fn write_names(&mut self, writes: &[(&str, f64)]) -> Result<(), GalvoError> {
        self.ensure_open()?;
        for (channel, _) in writes {
            registers::lookup(channel)?;
        }
        for (channel, value) in writes {
            self.store(channel, *value)?;
        }
        self.journal.push(DaqOp::Batch(
            writes
                .iter()
                .map(|(channel, value)| (channel.to_string(), *value))
                .collect(),
        ));
        Ok(())
    }

    fn read_name(&mut self, channel: &str) -> Result<f64, GalvoError> {
        self.ensure_open()?;
        registers::lookup(channel)?;
        Ok(self.register(channel).unwrap_or(0.0))
    }

    fn close(&mut self) -> Result<(), GalvoError> {
        self.ensure_open()?;
        self.closed = true;
        self.journal.push(DaqOp::Close);
        debug!("Simulated DAQ closed");
        if self.fail_on_close {
            return Err(GalvoError::Release("simulated release failure".to_string()));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed
    }
}

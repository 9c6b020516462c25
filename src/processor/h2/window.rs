//! Flow-control windows.
//!
//! Receive windows track what a peer may still send us and decide when to
//! announce more credit; send windows track what we may still relay to a
//! peer and gate DATA proxying.

use thiserror::Error;

use super::frame::MAX_WINDOW;
use crate::processor::ProcessError;

pub const DEFAULT_WINDOW: i64 = 65_535;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("{len} bytes exceed the flow-control window of {available}")]
    Exceeded { len: usize, available: i64 },
    #[error("window update overflows the flow-control window")]
    Overflow,
    #[error("window update with zero increment")]
    ZeroIncrement,
}

impl From<FlowError> for ProcessError {
    fn from(err: FlowError) -> Self {
        ProcessError::Violation(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvWindow {
    initial: i64,
    available: i64,
}

impl RecvWindow {
    pub fn new(initial: i64) -> Self {
        Self {
            initial,
            available: initial,
        }
    }

    pub fn available(&self) -> i64 {
        self.available
    }

    /// Account for `len` received bytes. Returns the increment to announce
    /// once the window drops below half of its initial value.
    pub fn consume(&mut self, len: usize) -> Result<Option<u32>, FlowError> {
        let n = len as i64;
        if n > self.available {
            return Err(FlowError::Exceeded {
                len,
                available: self.available,
            });
        }
        self.available -= n;
        if self.available < self.initial / 2 {
            let increment = self.initial - self.available;
            self.available = self.initial;
            return Ok(Some(increment as u32));
        }
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWindow {
    available: i64,
}

impl SendWindow {
    pub fn new(initial: i64) -> Self {
        Self { available: initial }
    }

    /// Bytes that may be sent now; never negative.
    pub fn capacity(&self) -> usize {
        self.available.max(0) as usize
    }

    pub fn consume(&mut self, len: usize) {
        self.available -= len as i64;
    }

    pub fn grant(&mut self, increment: u32) -> Result<(), FlowError> {
        if increment == 0 {
            return Err(FlowError::ZeroIncrement);
        }
        let next = self.available + i64::from(increment);
        if next > MAX_WINDOW {
            return Err(FlowError::Overflow);
        }
        self.available = next;
        Ok(())
    }

    /// Apply a change of SETTINGS_INITIAL_WINDOW_SIZE; may go negative.
    pub fn adjust(&mut self, delta: i64) -> Result<(), FlowError> {
        let next = self.available + delta;
        if next > MAX_WINDOW {
            return Err(FlowError::Overflow);
        }
        self.available = next;
        Ok(())
    }
}

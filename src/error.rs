use thiserror::Error;

use crate::scheduler::SchedulerError;

/// Failure of a single device transaction. None of these are fatal; the
/// caller decides whether to retry.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Timeout on read!")]
    Timeout,
    #[error("{0}")]
    Nack(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("response checksum {actual:08X}!={expected:08X}")]
    Checksum { expected: u32, actual: u32 },
    #[error("invalid frequency {0}")]
    InvalidFrequency(f64),
    #[error("unknown band {0}m")]
    UnknownBand(u16),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("serial i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    /// Errors that point at a protocol mismatch rather than a transient fault.
    pub fn is_protocol(&self) -> bool {
        matches!(self, DeviceError::Malformed(_) | DeviceError::Checksum { .. })
    }
}

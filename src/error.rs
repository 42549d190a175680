//! Driver-wide error taxonomy.
//!
//! Every fallible operation in this crate returns one of five kinds
//! (plus `NoSuchOperation`, for control operations the node surface does
//! not recognise). Internal invariant violations — ring corruption,
//! missing acks, unexpected firmware state — are logged at the point of
//! detection and converted to `IoError` here; nothing is retried
//! automatically except the bounded reset/firmware-update polls.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    InvalidArgument,
    Busy,
    TryAgain,
    IoError,
    RestartRequired,
    NoSuchOperation,
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::Busy => write!(f, "board busy (command ignored by firmware)"),
            Self::TryAgain => write!(f, "try again (non-blocking call would block)"),
            Self::IoError => write!(f, "I/O error"),
            Self::RestartRequired => write!(f, "interrupted, restart the call"),
            Self::NoSuchOperation => write!(f, "no such operation"),
        }
    }
}

impl std::error::Error for DriverError {}

pub type Result<T> = std::result::Result<T, DriverError>;

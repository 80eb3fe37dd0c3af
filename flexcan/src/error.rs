use core::fmt;

/// Errors reported by the driver
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// An argument is out of range: slot outside of the range valid for the
    /// operation, payload longer than 8 bytes, mask wider than the
    /// identifier, unreachable bitrate, ...
    InvalidParam,
    /// The controller has not been initialized, or has been deinitialized
    NotInitialized,
    /// The transmit buffer still holds a frame whose completion has not been
    /// observed
    Busy,
    /// The hardware did not reach the expected state before the deadline
    Timeout,
    /// Nothing to receive
    NoMessage,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidParam => f.write_str("invalid parameter"),
            Error::NotInitialized => f.write_str("controller not initialized"),
            Error::Busy => f.write_str("message buffer busy"),
            Error::Timeout => f.write_str("timed out waiting for the controller"),
            Error::NoMessage => f.write_str("no message available"),
        }
    }
}

impl embedded_can::Error for Error {
    fn kind(&self) -> embedded_can::ErrorKind {
        embedded_can::ErrorKind::Other
    }
}

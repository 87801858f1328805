use thiserror::Error;

// Errors raised by the device connection core.
//
// Transport failures inside the read loop or on write never reach callers
// through this type; they only show up as `connected == false`. A device NAK
// is reported as a `false` command result, not as an error.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    // The read loop stopped before the device finished its prelude.
    #[error("connection closed before the handshake completed")]
    HandshakeIncomplete,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("invalid preset index {0}")]
    InvalidPresetIndex(i64),

    #[error("preset {0} does not exist")]
    PresetNotFound(usize),

    #[error("index {index} is out of range for {property} (length {len})")]
    IndexOutOfRange {
        property: &'static str,
        index: usize,
        len: usize,
    },

    #[error("monitor {0} does not exist")]
    UnknownMonitor(usize),
}

pub type Result<T> = std::result::Result<T, BackendError>;

impl BackendError {
    pub(crate) fn violation(message: impl Into<String>) -> Self {
        BackendError::ProtocolViolation(message.into())
    }
}

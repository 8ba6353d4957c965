//! Custom error types for the rig.
//!
//! This module defines the primary error type, `RigError`, for the entire crate.
//! Using the `thiserror` crate, it provides one consistent way to surface failures
//! from device transports, configuration checks, safety interlocks and the recorder.
//!
//! ## Error Taxonomy
//!
//! Every error maps onto exactly one [`ErrorKind`]. The kind is what the experiment
//! engine branches on; the message is what the operator reads.
//!
//! - **`CommunicationTimeout`**: a device did not answer within its bound, or its
//!   transport failed. Recoverable only through an explicit reconnect.
//! - **`Configuration`**: invalid parameters or program text. Rejected before a run.
//! - **`SafetyViolation`**: a threshold breach. Leads to a controlled stop.
//! - **`SensorDisconnected`**: a 4–20 mA loop under threshold. Not fatal.
//! - **`RecorderIo`**: the data file could not be written.
//!
//! Raw transport errors (`std::io::Error`, timeouts) are classified into a
//! [`DeviceError`] at the device boundary and never travel further unclassified.

use crate::hardware::connection::DeviceId;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type RigResult<T> = std::result::Result<T, RigError>;

/// Classification shared by every error the core can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Device did not respond within its bound or its transport failed.
    CommunicationTimeout,
    /// Invalid parameters, program syntax or command in the wrong state.
    Configuration,
    /// A safety threshold was breached.
    SafetyViolation,
    /// A transmitter reported a loop current below the disconnect threshold.
    SensorDisconnected,
    /// The recorder could not write its file.
    RecorderIo,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CommunicationTimeout => write!(f, "communication_timeout"),
            Self::Configuration => write!(f, "configuration"),
            Self::SafetyViolation => write!(f, "safety_violation"),
            Self::SensorDisconnected => write!(f, "sensor_disconnected"),
            Self::RecorderIo => write!(f, "recorder_io"),
        }
    }
}

/// Error raised by a single device, already classified.
#[derive(Error, Debug, Clone)]
#[error("Device '{device}' {kind} error: {message}")]
pub struct DeviceError {
    /// The device that failed.
    pub device: DeviceId,
    /// Classification of the failure.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl DeviceError {
    /// Create a new device error.
    pub fn new(device: DeviceId, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            device,
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for the most common case: the device stopped answering.
    pub fn timeout(device: DeviceId, message: impl Into<String>) -> Self {
        Self::new(device, ErrorKind::CommunicationTimeout, message)
    }
}

/// Failures of the measurement recorder.
#[derive(Error, Debug)]
pub enum RecorderError {
    /// Underlying file I/O failed (disk full, permission denied, locked file).
    #[error("Recorder I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The CSV writer or reader failed.
    #[error("Recorder CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The metadata sidecar could not be serialized or parsed.
    #[error("Recorder metadata error: {0}")]
    Json(#[from] serde_json::Error),

    /// `append` or `end_session` was called without an open session.
    #[error("No recording session is open")]
    SessionClosed,

    /// `begin_session` was called while a session is still open.
    #[error("A recording session is already open at {0}")]
    SessionAlreadyOpen(String),

    /// A record's elapsed time went backwards.
    #[error("Record elapsed time {got:.3}s precedes last written {last:.3}s")]
    OutOfOrder {
        /// Elapsed time of the last row on disk.
        last: f64,
        /// Elapsed time of the rejected row.
        got: f64,
    },

    /// Session metadata failed validation.
    #[error("Invalid session metadata: {0}")]
    InvalidMetadata(String),

    /// A row read back from disk could not be parsed.
    #[error("Malformed record at line {line}: {message}")]
    Malformed {
        /// Line in the file (1-based).
        line: u64,
        /// What was wrong with it.
        message: String,
    },
}

/// Primary error type of the crate.
#[derive(Error, Debug)]
pub enum RigError {
    /// A device failed; see the embedded kind.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Invalid parameters or program text.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A command was issued in a state that does not allow it.
    #[error("Invalid engine state: {0}")]
    InvalidState(String),

    /// A safety threshold was breached.
    #[error("Safety violation: {0}")]
    SafetyViolation(String),

    /// A sensor's loop current dropped below the disconnect threshold.
    #[error("Sensor '{0}' disconnected")]
    SensorDisconnected(DeviceId),

    /// The recorder failed.
    #[error(transparent)]
    Recorder(#[from] RecorderError),
}

impl RigError {
    /// Map this error onto the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RigError::Device(err) => err.kind,
            RigError::Configuration(_) | RigError::InvalidState(_) => ErrorKind::Configuration,
            RigError::SafetyViolation(_) => ErrorKind::SafetyViolation,
            RigError::SensorDisconnected(_) => ErrorKind::SensorDisconnected,
            RigError::Recorder(_) => ErrorKind::RecorderIo,
        }
    }

    /// The device this error is attributed to, if any.
    pub fn device(&self) -> Option<DeviceId> {
        match self {
            RigError::Device(err) => Some(err.device),
            RigError::SensorDisconnected(id) => Some(*id),
            _ => None,
        }
    }

    /// Shorthand for configuration errors.
    pub fn config(message: impl Into<String>) -> Self {
        RigError::Configuration(message.into())
    }
}

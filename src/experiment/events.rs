//! Events published by the engine.
//!
//! The channel is bounded. When the consumer falls behind, new events are
//! dropped and counted rather than stalling the sampling loop.

use super::state::{EngineState, StopReason};
use crate::error::ErrorKind;
use crate::hardware::connection::{ConnectionState, DeviceId};
use crate::hardware::facade::SensorReadings;
use crate::recorder::MeasurementRecord;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Something observers may want to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    /// Emitted every tick.
    Progress {
        /// Seconds since the session base.
        elapsed: f64,
        /// Seconds left in the program, when known.
        remaining: Option<f64>,
        /// Sensor values of this tick.
        readings: SensorReadings,
    },
    /// The engine changed state.
    StatusChanged {
        /// New state.
        state: EngineState,
        /// Why, when leaving `Running`.
        reason: Option<StopReason>,
    },
    /// A device changed connection state.
    Connectivity {
        /// The device.
        device: DeviceId,
        /// Its new state.
        state: ConnectionState,
    },
    /// A row reached the data file.
    RecordAppended(MeasurementRecord),
    /// A session was closed.
    Completed {
        /// Its data file.
        path: Option<PathBuf>,
    },
    /// The run aborted.
    Error {
        /// Error class.
        kind: ErrorKind,
        /// Detail.
        message: String,
    },
    /// A non-fatal condition.
    Warning {
        /// Error class.
        kind: ErrorKind,
        /// Detail.
        message: String,
    },
}

/// Sending half of the event channel.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<EngineEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// Create a channel of `capacity` events.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Publish without waiting.
    pub fn emit(&self, event: EngineEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(dropped, event = ?event, "Event channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Events dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

//! Connection state shared by every device.
//!
//! A [`DeviceLink`] owns the transport handle of one device together with its
//! [`ConnectionState`]. All state changes go through the link so that the three
//! states stay mutually exclusive and a failed I/O can never leave a device
//! reporting `Connected`.

use crate::error::{DeviceError, ErrorKind};
use crate::hardware::simulation::FaultPlan;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Identity of every device on the rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceId {
    /// Syringe pump.
    Pump,
    /// Source-measure unit.
    Smu,
    /// Data-acquisition board.
    DaqBoard,
    /// Pressure transducer on ai0.
    PressureSensor,
    /// Temperature transmitter on ai1.
    TemperatureSensor,
    /// Flow meter on ai2.
    FlowSensor,
    /// Level transmitter on ai3.
    LevelSensor,
}

impl DeviceId {
    /// Every device, in facade order.
    pub const ALL: [DeviceId; 7] = [
        DeviceId::Pump,
        DeviceId::Smu,
        DeviceId::DaqBoard,
        DeviceId::PressureSensor,
        DeviceId::TemperatureSensor,
        DeviceId::FlowSensor,
        DeviceId::LevelSensor,
    ];

    /// Stable snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceId::Pump => "pump",
            DeviceId::Smu => "smu",
            DeviceId::DaqBoard => "daq_board",
            DeviceId::PressureSensor => "pressure_sensor",
            DeviceId::TemperatureSensor => "temperature_sensor",
            DeviceId::FlowSensor => "flow_sensor",
            DeviceId::LevelSensor => "level_sensor",
        }
    }

    /// Whether this device is an analog sensor read through the DAQ board.
    pub fn is_sensor(&self) -> bool {
        matches!(
            self,
            DeviceId::PressureSensor
                | DeviceId::TemperatureSensor
                | DeviceId::FlowSensor
                | DeviceId::LevelSensor
        )
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pump" => Ok(DeviceId::Pump),
            "smu" => Ok(DeviceId::Smu),
            "daq" | "daq_board" | "board" => Ok(DeviceId::DaqBoard),
            "pressure" | "pressure_sensor" => Ok(DeviceId::PressureSensor),
            "temperature" | "temperature_sensor" => Ok(DeviceId::TemperatureSensor),
            "flow" | "flow_sensor" => Ok(DeviceId::FlowSensor),
            "level" | "level_sensor" => Ok(DeviceId::LevelSensor),
            other => Err(format!("Unknown device '{other}'")),
        }
    }
}

/// Connection state of a device.
///
/// ```text
/// Disconnected ──connect ok──> Connected ──health check fails──> Disconnected
///      │                            │
///      └──connect fails──> SimulationMode <──reconnect exhausted──┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No usable transport; operations fail with `CommunicationTimeout`.
    Disconnected,
    /// Real hardware answered its last query.
    Connected,
    /// Synthetic data stands in for the hardware.
    SimulationMode,
}

impl ConnectionState {
    /// Whether operations can currently succeed.
    pub fn is_usable(&self) -> bool {
        !matches!(self, ConnectionState::Disconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::SimulationMode => write!(f, "Simulation"),
        }
    }
}

/// Outcome of a `connect()` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionResult {
    /// Device that was connected.
    pub device: DeviceId,
    /// State after the attempt.
    pub state: ConnectionState,
    /// Identity string or the reason for falling back to simulation.
    pub detail: String,
}

/// Broadcast whenever a device changes connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityChange {
    /// The device whose state changed.
    pub device: DeviceId,
    /// Its new state.
    pub state: ConnectionState,
}

/// Opens the real transport of a device.
///
/// Implemented by serial ports, TCP sockets and DAQ backends. Test code
/// implements it to script connection failures.
#[async_trait]
pub trait Connector<H>: Send + Sync {
    /// Open a fresh handle to the hardware.
    async fn open(&self) -> std::io::Result<H>;

    /// Short human-readable description (port name, address).
    fn describe(&self) -> String;
}

/// State and transport handle of a single device.
pub struct DeviceLink<H> {
    id: DeviceId,
    state: RwLock<ConnectionState>,
    handle: Mutex<Option<H>>,
    connector: RwLock<Option<Arc<dyn Connector<H>>>>,
    faults: FaultPlan,
    notifier: RwLock<Option<broadcast::Sender<ConnectivityChange>>>,
}

impl<H: Send> DeviceLink<H> {
    /// Create a link with no handle. Without a connector the device can only
    /// run in simulation.
    pub fn new(id: DeviceId, connector: Option<Arc<dyn Connector<H>>>) -> Self {
        Self {
            id,
            state: RwLock::new(ConnectionState::Disconnected),
            handle: Mutex::new(None),
            connector: RwLock::new(connector),
            faults: FaultPlan::none(),
            notifier: RwLock::new(None),
        }
    }

    /// Attach a fault plan consulted on every simulated operation.
    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    /// Publish state changes on the given channel.
    pub fn set_notifier(&self, tx: broadcast::Sender<ConnectivityChange>) {
        *self.notifier.write() = Some(tx);
    }

    /// Replace the connector used by future connection attempts.
    pub fn set_connector(&self, connector: Option<Arc<dyn Connector<H>>>) {
        *self.connector.write() = connector;
    }

    /// Device identity.
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Description of the configured connector, if any.
    pub fn describe(&self) -> Option<String> {
        self.connector.read().as_ref().map(|c| c.describe())
    }

    fn set_state(&self, new_state: ConnectionState) {
        let changed = {
            let mut state = self.state.write();
            let changed = *state != new_state;
            *state = new_state;
            changed
        };
        if changed {
            debug!(device = %self.id, state = %new_state, "Connection state changed");
            if let Some(tx) = self.notifier.read().as_ref() {
                // No subscribers is fine.
                let _ = tx.send(ConnectivityChange {
                    device: self.id,
                    state: new_state,
                });
            }
        }
    }

    /// Try to open the real transport. Does not fall back to simulation.
    pub async fn open(&self) -> Result<(), DeviceError> {
        let connector = self.connector.read().clone();
        let Some(connector) = connector else {
            return Err(DeviceError::new(
                self.id,
                ErrorKind::Configuration,
                "no hardware connector configured",
            ));
        };

        let mut guard = self.handle.lock().await;
        guard.take();
        match connector.open().await {
            Ok(handle) => {
                *guard = Some(handle);
                self.set_state(ConnectionState::Connected);
                info!(device = %self.id, via = %connector.describe(), "Device connected");
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(DeviceError::timeout(
                    self.id,
                    format!("failed to open {}: {}", connector.describe(), e),
                ))
            }
        }
    }

    /// Drop any real handle and serve synthetic data from now on.
    pub async fn enter_simulation(&self) {
        self.handle.lock().await.take();
        self.faults.reset();
        self.set_state(ConnectionState::SimulationMode);
        info!(device = %self.id, "Device running in simulation mode");
    }

    /// Close the transport and mark the device disconnected.
    pub async fn close(&self) {
        self.handle.lock().await.take();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Lock the link for one operation.
    ///
    /// In simulation the fault plan is consulted first; an injected fault
    /// disconnects the device exactly like a real transport failure.
    pub async fn session(&self, operation: &'static str) -> Result<LinkSession<'_, H>, DeviceError> {
        let guard = self.handle.lock().await;
        match self.state() {
            ConnectionState::Disconnected => Err(DeviceError::timeout(
                self.id,
                format!("{operation}: device is disconnected"),
            )),
            ConnectionState::SimulationMode => {
                let session = LinkSession { link: self, guard };
                match self.faults.check(self.id, operation) {
                    Ok(()) => Ok(session),
                    Err(err) => Err(session.fail(err)),
                }
            }
            ConnectionState::Connected if guard.is_none() => {
                drop(guard);
                self.set_state(ConnectionState::Disconnected);
                Err(DeviceError::timeout(
                    self.id,
                    format!("{operation}: transport handle missing"),
                ))
            }
            ConnectionState::Connected => Ok(LinkSession { link: self, guard }),
        }
    }
}

/// Exclusive access to a device's transport for one operation.
pub struct LinkSession<'a, H> {
    link: &'a DeviceLink<H>,
    guard: MutexGuard<'a, Option<H>>,
}

impl<'a, H: Send> LinkSession<'a, H> {
    /// The real transport, or `None` when the device is simulated.
    pub fn handle(&mut self) -> Option<&mut H> {
        self.guard.as_mut()
    }

    /// Record a failed operation: close the transport, mark the device
    /// disconnected and hand the error back for propagation.
    pub fn fail(mut self, err: DeviceError) -> DeviceError {
        self.guard.take();
        drop(self.guard);
        warn!(device = %self.link.id, error = %err, "Device marked disconnected");
        self.link.set_state(ConnectionState::Disconnected);
        err
    }
}

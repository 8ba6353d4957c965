//! Device capability traits.
//!
//! Every piece of rig hardware implements [`Device`] (lifecycle and health) plus
//! exactly one operational capability:
//!
//! - the pump implements [`Pump`]
//! - the SMU implements [`SourceMeasure`]
//! - the DAQ board implements [`DaqBoard`]
//! - each analog channel implements [`AnalogSensor`]
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Returns classified errors (`RigResult`), never raw transport errors
//! - Behaves identically in real and simulation mode from the caller's side
//!
//! Setters clamp out-of-range requests to the device limits and report it
//! through [`Clamped`] instead of failing.

use crate::error::{DeviceError, RigResult};
use crate::hardware::connection::{ConnectionResult, ConnectionState, DeviceId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

/// A value after boundary clamping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clamped<T> {
    /// What the caller asked for.
    pub requested: T,
    /// What the device was actually given.
    pub applied: T,
}

impl Clamped<f64> {
    /// Clamp `requested` into `[min, max]`, logging a warning when it moves.
    pub fn within(device: DeviceId, what: &str, requested: f64, min: f64, max: f64) -> Self {
        let applied = requested.clamp(min, max);
        if applied != requested {
            warn!(
                device = %device,
                requested,
                applied,
                "{} {} outside [{}, {}], clamped",
                what,
                requested,
                min,
                max
            );
        }
        Self { requested, applied }
    }

    /// Whether the requested value had to be changed.
    pub fn was_clamped(&self) -> bool {
        self.applied != self.requested
    }
}

/// Lifecycle and health contract shared by every device.
///
/// # Contract
/// - `connect` never fails: it ends in `Connected` or `SimulationMode`
/// - `health_check` sends a real query when connected; a failure closes the
///   transport and leaves the device `Disconnected`
/// - a device is never `Connected` and simulated at the same time
#[async_trait]
pub trait Device: Send + Sync {
    /// Identity of this device.
    fn id(&self) -> DeviceId;

    /// Current connection state.
    fn connection_state(&self) -> ConnectionState;

    /// Open the real transport without falling back.
    async fn try_open(&self) -> Result<String, DeviceError>;

    /// Switch to synthetic data.
    async fn enter_simulation(&self);

    /// Release the transport.
    async fn disconnect(&self);

    /// Active round-trip query with a bounded timeout.
    async fn health_check(&self) -> bool;

    /// Put outputs into their safe state (pump stopped, SMU output off).
    ///
    /// # Default Implementation
    /// Devices without outputs have nothing to do.
    async fn stop_output(&self) -> RigResult<()> {
        Ok(())
    }

    /// Connect to real hardware, or fall back to simulation.
    async fn connect(&self) -> ConnectionResult {
        match self.try_open().await {
            Ok(identity) => ConnectionResult {
                device: self.id(),
                state: ConnectionState::Connected,
                detail: identity,
            },
            Err(err) => {
                info!(device = %self.id(), reason = %err.message, "Falling back to simulation");
                self.enter_simulation().await;
                ConnectionResult {
                    device: self.id(),
                    state: ConnectionState::SimulationMode,
                    detail: err.message,
                }
            }
        }
    }
}

/// Pump telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PumpStatus {
    /// Delivered flow (ml/min).
    pub flow: f64,
    /// Line pressure (bar).
    pub pressure: f64,
    /// Motor speed.
    pub rpm: f64,
}

/// Capability: flow delivery.
///
/// # Contract
/// - `set_flow_rate` clamps to `[0, MAX_FLOW_RATE]`
/// - `stop` must succeed on a healthy device even if it is already stopped
#[async_trait]
pub trait Pump: Device {
    /// Command a new flow rate (ml/min).
    async fn set_flow_rate(&self, ml_per_min: f64) -> RigResult<Clamped<f64>>;

    /// Start delivering at the current setpoint.
    async fn start(&self) -> RigResult<()>;

    /// Stop delivering.
    async fn stop(&self) -> RigResult<()>;

    /// Read flow, pressure and speed.
    async fn read_status(&self) -> RigResult<PumpStatus>;

    /// Last commanded setpoint (after clamping).
    fn setpoint(&self) -> f64;

    /// Whether the pump was last commanded to run.
    fn is_running(&self) -> bool;
}

/// Source function of the SMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceMode {
    /// Source voltage, measure current.
    Voltage,
    /// Source current, measure voltage.
    Current,
}

/// One SMU reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SmuReading {
    /// Sourced or measured voltage (V).
    pub voltage: f64,
    /// Measured or sourced current (A).
    pub current: f64,
}

/// Capability: source and measure.
///
/// # Contract
/// - `configure_source_mode` clamps the compliance limit
/// - `set_level` clamps to the source range
/// - `output_off` sources zero before disabling the output
#[async_trait]
pub trait SourceMeasure: Device {
    /// Configure the source function, compliance limit and source range.
    async fn configure_source_mode(
        &self,
        mode: SourceMode,
        limit: f64,
        range: Option<f64>,
    ) -> RigResult<Clamped<f64>>;

    /// Enable the output.
    async fn output_on(&self) -> RigResult<()>;

    /// Zero the source and disable the output.
    async fn output_off(&self) -> RigResult<()>;

    /// Set the source level (V or A depending on mode).
    async fn set_level(&self, value: f64) -> RigResult<Clamped<f64>>;

    /// Read back the programmed source voltage.
    async fn source_voltage(&self) -> RigResult<f64>;

    /// Measure voltage and current.
    async fn measure(&self) -> RigResult<SmuReading>;

    /// Whether the output was last commanded on.
    fn is_output_on(&self) -> bool;
}

/// Valve path on the fluidic manifold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValveSelection {
    /// Sample path.
    #[default]
    Main,
    /// Rinse path.
    Rinsing,
}

impl fmt::Display for ValveSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValveSelection::Main => write!(f, "main"),
            ValveSelection::Rinsing => write!(f, "rinsing"),
        }
    }
}

impl FromStr for ValveSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "main" => Ok(ValveSelection::Main),
            "rinsing" | "rinse" => Ok(ValveSelection::Rinsing),
            other => Err(format!("unknown valve '{other}' (expected main or rinsing)")),
        }
    }
}

/// Raw result of an analog input read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AnalogRead {
    /// Voltage measured by real hardware.
    Volts(f64),
    /// The board is simulated; the sensor supplies its own synthetic value.
    Simulated,
}

/// Capability: analog and digital I/O.
#[async_trait]
pub trait DaqBoard: Device {
    /// Read one analog input channel.
    async fn read_analog(&self, channel: u8) -> RigResult<AnalogRead>;

    /// Drive the analog output, clamped to the DAC range.
    async fn set_analog_output(&self, volts: f64) -> RigResult<Clamped<f64>>;

    /// Open exactly one valve line.
    async fn set_valve(&self, valve: ValveSelection) -> RigResult<()>;

    /// Drive the heating plate toward a temperature (°C).
    async fn set_heater_temperature(&self, celsius: f64) -> RigResult<Clamped<f64>>;
}

/// Capability: a physical quantity derived from one board channel.
///
/// # Contract
/// - `Ok(None)` means the transmitter is disconnected (no data), never zero
/// - `Err` means the board itself failed
#[async_trait]
pub trait AnalogSensor: Device {
    /// Read the current value in engineering units.
    async fn read_value(&self) -> RigResult<Option<f64>>;

    /// Last non-null value read.
    fn last_good(&self) -> Option<f64>;
}

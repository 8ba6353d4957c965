//! Hardware layer: device drivers, simulation and the facade.
//!
//! - `capabilities`: the `Device` contract and per-device capability traits
//! - `connection`: connection state and the link that owns a transport handle
//! - `transport`: line-oriented serial/TCP transports for ASCII instruments
//! - `pump`, `smu`, `daq_board`, `sensors`: concrete drivers
//! - `simulation`: synthetic signals and fault injection
//! - `reconnect`: forced reconnection with bounded retry
//! - `facade`: the single owner the experiment engine talks to

pub mod capabilities;
pub mod connection;
pub mod daq_board;
pub mod facade;
pub mod pump;
pub mod reconnect;
pub mod sensors;
pub mod simulation;
pub mod smu;
pub mod transport;

pub use capabilities::{
    AnalogRead, AnalogSensor, Clamped, DaqBoard, Device, Pump, PumpStatus, SmuReading,
    SourceMeasure, SourceMode, ValveSelection,
};
pub use connection::{ConnectionResult, ConnectionState, ConnectivityChange, DeviceId};
pub use daq_board::{BenchBoard, DaqBackend, DaqBoardDriver};
pub use facade::{ConnectionReport, HardwareFacade, HardwareFacadeBuilder, SensorReadings};
pub use pump::VapourtecPump;
pub use reconnect::{ReconnectOutcome, RetryPolicy};
pub use sensors::ChannelSensor;
pub use simulation::{FaultPlan, FaultScenario, FlowSetpoint};
pub use smu::Keithley2450;

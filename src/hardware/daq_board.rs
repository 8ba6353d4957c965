//! USB DAQ board (MCC USB-1408FS-Plus class).
//!
//! - 4 single-ended analog inputs, ±10 V
//! - one 12-bit analog output, 0–5 V, driving the heating plate controller
//! - digital port A: line 0 opens the main valve, line 1 the rinsing valve
//!
//! The vendor library is reached through [`DaqBackend`]. [`BenchBackend`] is a
//! loopback backend whose inputs are set from the outside, used on the bench
//! and in tests.

use crate::error::{DeviceError, RigError, RigResult};
use crate::hardware::capabilities::{AnalogRead, Clamped, DaqBoard, Device, ValveSelection};
use crate::hardware::connection::{ConnectionState, Connector, DeviceId, DeviceLink};
use crate::hardware::simulation::FaultPlan;
use crate::limits::{
    ADC_RANGE_VOLTS, DAC_MAX_COUNT, DAC_MAX_VOLTS, DAC_MIN_VOLTS, HEATER_BASE_TEMPERATURE,
    HEATER_DEGREES_PER_VOLT,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::io;
use std::sync::Arc;
use tracing::info;

/// Number of analog input channels.
pub const ANALOG_INPUTS: u8 = 4;

/// Digital line driving the main valve.
pub const MAIN_VALVE_LINE: u8 = 0;

/// Digital line driving the rinsing valve.
pub const RINSING_VALVE_LINE: u8 = 1;

/// Low-level access to a DAQ board.
///
/// Calls are short and blocking, as vendor libraries are.
pub trait DaqBackend: Send {
    /// Read one analog input in volts.
    fn read_voltage(&mut self, channel: u8) -> io::Result<f64>;

    /// Write a raw DAC count to an analog output.
    fn write_dac(&mut self, channel: u8, count: u16) -> io::Result<()>;

    /// Drive one digital output line.
    fn write_digital(&mut self, line: u8, high: bool) -> io::Result<()>;

    /// Board identity (product name or serial number).
    fn identify(&mut self) -> io::Result<String>;
}

/// Type-erased backend handle stored by the board link.
pub type DynBackend = Box<dyn DaqBackend>;

/// Convert volts to a 12-bit DAC count over 0–5 V.
pub fn volts_to_dac_count(volts: f64) -> u16 {
    let fraction = (volts.clamp(DAC_MIN_VOLTS, DAC_MAX_VOLTS) - DAC_MIN_VOLTS)
        / (DAC_MAX_VOLTS - DAC_MIN_VOLTS);
    (fraction * f64::from(DAC_MAX_COUNT)).round() as u16
}

/// Heater control voltage for a target temperature, before clamping.
pub fn heater_volts_for(celsius: f64) -> f64 {
    (celsius - HEATER_BASE_TEMPERATURE) / HEATER_DEGREES_PER_VOLT
}

#[derive(Debug, Clone)]
struct BenchState {
    inputs: [f64; ANALOG_INPUTS as usize],
    dac_count: Option<u16>,
    lines: [bool; 8],
    unplugged: bool,
    opens: u32,
}

/// Loopback board on the bench.
///
/// Clones share state, so a test keeps one clone to drive inputs and inspect
/// outputs while the driver owns another.
#[derive(Debug, Clone)]
pub struct BenchBoard {
    state: Arc<Mutex<BenchState>>,
}

impl BenchBoard {
    /// A plugged-in board with all inputs at 0 V.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BenchState {
                inputs: [0.0; ANALOG_INPUTS as usize],
                dac_count: None,
                lines: [false; 8],
                unplugged: false,
                opens: 0,
            })),
        }
    }

    /// Set the voltage seen on an analog input.
    pub fn set_input(&self, channel: u8, volts: f64) {
        if let Some(slot) = self.state.lock().inputs.get_mut(usize::from(channel)) {
            *slot = volts;
        }
    }

    /// Last DAC count written.
    pub fn dac_count(&self) -> Option<u16> {
        self.state.lock().dac_count
    }

    /// State of a digital line.
    pub fn line(&self, line: u8) -> bool {
        self.state
            .lock()
            .lines
            .get(usize::from(line))
            .copied()
            .unwrap_or(false)
    }

    /// Simulate pulling the USB cable (or plugging it back).
    pub fn set_unplugged(&self, unplugged: bool) {
        self.state.lock().unplugged = unplugged;
    }

    /// How many times the board was opened.
    pub fn open_count(&self) -> u32 {
        self.state.lock().opens
    }

    /// Connector handing out backends attached to this board.
    pub fn connector(&self) -> Arc<dyn Connector<DynBackend>> {
        Arc::new(BenchConnector {
            board: self.clone(),
        })
    }

    fn check_plugged(state: &BenchState) -> io::Result<()> {
        if state.unplugged {
            Err(io::Error::new(io::ErrorKind::NotConnected, "board unplugged"))
        } else {
            Ok(())
        }
    }
}

impl Default for BenchBoard {
    fn default() -> Self {
        Self::new()
    }
}

/// Backend view of a [`BenchBoard`].
pub struct BenchBackend {
    board: BenchBoard,
}

impl DaqBackend for BenchBackend {
    fn read_voltage(&mut self, channel: u8) -> io::Result<f64> {
        let state = self.board.state.lock();
        BenchBoard::check_plugged(&state)?;
        state
            .inputs
            .get(usize::from(channel))
            .map(|v| v.clamp(-ADC_RANGE_VOLTS, ADC_RANGE_VOLTS))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no such channel"))
    }

    fn write_dac(&mut self, _channel: u8, count: u16) -> io::Result<()> {
        let mut state = self.board.state.lock();
        BenchBoard::check_plugged(&state)?;
        state.dac_count = Some(count);
        Ok(())
    }

    fn write_digital(&mut self, line: u8, high: bool) -> io::Result<()> {
        let mut state = self.board.state.lock();
        BenchBoard::check_plugged(&state)?;
        let slot = state
            .lines
            .get_mut(usize::from(line))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no such line"))?;
        *slot = high;
        Ok(())
    }

    fn identify(&mut self) -> io::Result<String> {
        let state = self.board.state.lock();
        BenchBoard::check_plugged(&state)?;
        Ok("USB-1408FS-Plus (bench loopback)".to_string())
    }
}

/// Opens [`BenchBackend`]s.
pub struct BenchConnector {
    board: BenchBoard,
}

#[async_trait]
impl Connector<DynBackend> for BenchConnector {
    async fn open(&self) -> io::Result<DynBackend> {
        let mut state = self.board.state.lock();
        state.opens += 1;
        BenchBoard::check_plugged(&state)?;
        Ok(Box::new(BenchBackend {
            board: self.board.clone(),
        }))
    }

    fn describe(&self) -> String {
        "bench loopback board".into()
    }
}

#[derive(Debug, Clone, Copy)]
struct OutputState {
    valve: Option<ValveSelection>,
    analog_out: f64,
}

/// DAQ board driver with simulation fallback.
pub struct DaqBoardDriver {
    link: DeviceLink<DynBackend>,
    outputs: RwLock<OutputState>,
}

impl DaqBoardDriver {
    /// Create a board driver. `connector` is `None` for a simulation-only board.
    pub fn new(connector: Option<Arc<dyn Connector<DynBackend>>>) -> Self {
        Self {
            link: DeviceLink::new(DeviceId::DaqBoard, connector),
            outputs: RwLock::new(OutputState {
                valve: None,
                analog_out: 0.0,
            }),
        }
    }

    /// Inject faults into simulated operation.
    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.link = self.link.with_faults(faults);
        self
    }

    /// The underlying link.
    pub fn link(&self) -> &DeviceLink<DynBackend> {
        &self.link
    }

    /// Valve path last selected.
    pub fn valve(&self) -> Option<ValveSelection> {
        self.outputs.read().valve
    }

    /// Analog output voltage last written.
    pub fn analog_output(&self) -> f64 {
        self.outputs.read().analog_out
    }

    /// Run one backend call inside a link session. `None` in simulation.
    async fn with_backend<T: Send>(
        &self,
        operation: &'static str,
        call: impl FnOnce(&mut dyn DaqBackend) -> io::Result<T> + Send,
    ) -> RigResult<Option<T>> {
        let mut session = self.link.session(operation).await?;
        let Some(backend) = session.handle() else {
            return Ok(None);
        };
        match call(&mut **backend) {
            Ok(value) => Ok(Some(value)),
            Err(e) => Err(session
                .fail(DeviceError::timeout(
                    DeviceId::DaqBoard,
                    format!("{operation}: {e}"),
                ))
                .into()),
        }
    }
}

#[async_trait]
impl Device for DaqBoardDriver {
    fn id(&self) -> DeviceId {
        DeviceId::DaqBoard
    }

    fn connection_state(&self) -> ConnectionState {
        self.link.state()
    }

    async fn try_open(&self) -> Result<String, DeviceError> {
        self.link.open().await?;
        match self.with_backend("identify", |b| b.identify()).await {
            Ok(Some(identity)) => Ok(identity),
            Ok(None) => Ok("simulated board".to_string()),
            Err(RigError::Device(err)) => Err(err),
            Err(other) => Err(DeviceError::timeout(DeviceId::DaqBoard, other.to_string())),
        }
    }

    async fn enter_simulation(&self) {
        self.link.enter_simulation().await;
    }

    async fn disconnect(&self) {
        self.link.close().await;
    }

    async fn health_check(&self) -> bool {
        self.with_backend("health_check", |b| b.identify())
            .await
            .is_ok()
    }
}

#[async_trait]
impl DaqBoard for DaqBoardDriver {
    async fn read_analog(&self, channel: u8) -> RigResult<AnalogRead> {
        if channel >= ANALOG_INPUTS {
            return Err(RigError::config(format!(
                "analog input ai{channel} does not exist (board has {ANALOG_INPUTS})"
            )));
        }
        let volts = self
            .with_backend("read_analog", move |b| b.read_voltage(channel))
            .await?;
        Ok(volts.map_or(AnalogRead::Simulated, AnalogRead::Volts))
    }

    async fn set_analog_output(&self, volts: f64) -> RigResult<Clamped<f64>> {
        if !volts.is_finite() {
            return Err(RigError::config(format!("output voltage {volts} is not a number")));
        }
        let clamped = Clamped::within(
            DeviceId::DaqBoard,
            "analog output",
            volts,
            DAC_MIN_VOLTS,
            DAC_MAX_VOLTS,
        );
        let count = volts_to_dac_count(clamped.applied);
        self.with_backend("set_analog_output", move |b| b.write_dac(0, count))
            .await?;
        self.outputs.write().analog_out = clamped.applied;
        Ok(clamped)
    }

    async fn set_valve(&self, valve: ValveSelection) -> RigResult<()> {
        let main = valve == ValveSelection::Main;
        self.with_backend("set_valve", move |b| {
            // Close before open so both lines are never high together.
            if main {
                b.write_digital(RINSING_VALVE_LINE, false)?;
                b.write_digital(MAIN_VALVE_LINE, true)
            } else {
                b.write_digital(MAIN_VALVE_LINE, false)?;
                b.write_digital(RINSING_VALVE_LINE, true)
            }
        })
        .await?;
        self.outputs.write().valve = Some(valve);
        info!(valve = %valve, "Valve path selected");
        Ok(())
    }

    async fn set_heater_temperature(&self, celsius: f64) -> RigResult<Clamped<f64>> {
        if !celsius.is_finite() {
            return Err(RigError::config(format!(
                "heater target {celsius} is not a number"
            )));
        }
        let volts = self.set_analog_output(heater_volts_for(celsius)).await?;
        let applied = HEATER_BASE_TEMPERATURE + volts.applied * HEATER_DEGREES_PER_VOLT;
        info!(target = celsius, applied, volts = volts.applied, "Heater setpoint");
        Ok(Clamped {
            requested: celsius,
            applied,
        })
    }
}

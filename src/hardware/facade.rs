//! Single owner of every device on the rig.
//!
//! The experiment engine only talks to [`HardwareFacade`]; it never sees a
//! raw driver. Every transport-touching call may fail with
//! `CommunicationTimeout`, in which case the offending device has already
//! been marked `Disconnected`. The facade does not retry behind the caller's
//! back: recovery is an explicit [`HardwareFacade::reconnect`].

use crate::config::RigConfig;
use crate::error::{RigError, RigResult};
use crate::hardware::capabilities::{
    AnalogSensor, Clamped, DaqBoard, Device, Pump, PumpStatus, SmuReading, SourceMeasure,
    SourceMode, ValveSelection,
};
use crate::hardware::connection::{
    ConnectionResult, ConnectionState, ConnectivityChange, Connector, DeviceId,
};
use crate::hardware::daq_board::{DaqBoardDriver, DynBackend};
use crate::hardware::pump::VapourtecPump;
use crate::hardware::reconnect::{reconnect_device, ReconnectGate, ReconnectOutcome, RetryPolicy};
use crate::hardware::sensors::ChannelSensor;
use crate::hardware::simulation::{FaultPlan, FlowSetpoint};
use crate::hardware::smu::Keithley2450;
use crate::hardware::transport::{DynTransport, Endpoint};
use crate::limits::{DEFAULT_FLOW_RATE, DEVICE_IO_TIMEOUT, SMU_MAX_VOLTAGE};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const CONNECTIVITY_CHANNEL_CAPACITY: usize = 64;

/// Latest value of every analog sensor. `None` means no data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorReadings {
    /// Line pressure (bar).
    pub pressure: Option<f64>,
    /// Plate temperature (°C).
    pub temperature: Option<f64>,
    /// Measured flow (ml/min).
    pub flow: Option<f64>,
    /// Reservoir level (fraction 0–1).
    pub level: Option<f64>,
}

/// Outcome of [`HardwareFacade::connect_all`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionReport {
    /// One entry per device, in [`DeviceId::ALL`] order.
    pub results: Vec<ConnectionResult>,
}

impl ConnectionReport {
    /// State reported for one device.
    pub fn state_of(&self, device: DeviceId) -> Option<ConnectionState> {
        self.results
            .iter()
            .find(|r| r.device == device)
            .map(|r| r.state)
    }

    /// Whether every device ended up simulated.
    pub fn all_simulated(&self) -> bool {
        self.results
            .iter()
            .all(|r| r.state == ConnectionState::SimulationMode)
    }

    /// Devices running on real hardware.
    pub fn connected(&self) -> Vec<DeviceId> {
        self.results
            .iter()
            .filter(|r| r.state == ConnectionState::Connected)
            .map(|r| r.device)
            .collect()
    }
}

/// Builder for [`HardwareFacade`].
#[derive(Default)]
pub struct HardwareFacadeBuilder {
    pump_connector: Option<Arc<dyn Connector<DynTransport>>>,
    smu_connector: Option<Arc<dyn Connector<DynTransport>>>,
    board_connector: Option<Arc<dyn Connector<DynBackend>>>,
    pump_faults: FaultPlan,
    smu_faults: FaultPlan,
    board_faults: FaultPlan,
    retry_policy: RetryPolicy,
    initial_flow: Option<f64>,
}

impl HardwareFacadeBuilder {
    /// Transport to the pump.
    pub fn pump_connector(mut self, connector: Arc<dyn Connector<DynTransport>>) -> Self {
        self.pump_connector = Some(connector);
        self
    }

    /// Transport to the SMU.
    pub fn smu_connector(mut self, connector: Arc<dyn Connector<DynTransport>>) -> Self {
        self.smu_connector = Some(connector);
        self
    }

    /// Backend of the DAQ board.
    pub fn board_connector(mut self, connector: Arc<dyn Connector<DynBackend>>) -> Self {
        self.board_connector = Some(connector);
        self
    }

    /// Faults injected into the simulated pump.
    pub fn pump_faults(mut self, faults: FaultPlan) -> Self {
        self.pump_faults = faults;
        self
    }

    /// Faults injected into the simulated SMU.
    pub fn smu_faults(mut self, faults: FaultPlan) -> Self {
        self.smu_faults = faults;
        self
    }

    /// Faults injected into the simulated DAQ board (and so every sensor).
    pub fn board_faults(mut self, faults: FaultPlan) -> Self {
        self.board_faults = faults;
        self
    }

    /// Retry policy for forced reconnects.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Flow setpoint before any step sets one.
    pub fn initial_flow(mut self, ml_per_min: f64) -> Self {
        self.initial_flow = Some(ml_per_min);
        self
    }

    /// Assemble the facade. Nothing is opened until `connect_all`.
    pub fn build(self) -> HardwareFacade {
        let setpoint = FlowSetpoint::new(self.initial_flow.unwrap_or(DEFAULT_FLOW_RATE));
        let pump =
            VapourtecPump::new(self.pump_connector, setpoint.clone()).with_faults(self.pump_faults);
        let smu = Keithley2450::new(self.smu_connector).with_faults(self.smu_faults);
        let board =
            Arc::new(DaqBoardDriver::new(self.board_connector).with_faults(self.board_faults));

        let (connectivity, _) = broadcast::channel(CONNECTIVITY_CHANNEL_CAPACITY);
        pump.link().set_notifier(connectivity.clone());
        smu.link().set_notifier(connectivity.clone());
        board.link().set_notifier(connectivity.clone());

        HardwareFacade {
            pressure: ChannelSensor::pressure(board.clone()),
            temperature: ChannelSensor::temperature(board.clone()),
            flow: ChannelSensor::flow(board.clone(), setpoint),
            level: ChannelSensor::level(board.clone()),
            pump,
            smu,
            board,
            policy: self.retry_policy,
            gate: ReconnectGate::new(),
            connectivity,
        }
    }
}

/// Owns the pump, the SMU, the DAQ board and the four sensors.
pub struct HardwareFacade {
    pump: VapourtecPump,
    smu: Keithley2450,
    board: Arc<DaqBoardDriver>,
    pressure: ChannelSensor,
    temperature: ChannelSensor,
    flow: ChannelSensor,
    level: ChannelSensor,
    policy: RetryPolicy,
    gate: ReconnectGate,
    connectivity: broadcast::Sender<ConnectivityChange>,
}

impl HardwareFacade {
    /// Start building a facade.
    pub fn builder() -> HardwareFacadeBuilder {
        HardwareFacadeBuilder::default()
    }

    /// A facade with no hardware connectors: everything simulates.
    pub fn simulated() -> Self {
        Self::builder().build()
    }

    /// Build from configuration. Devices marked `simulate`, or without a
    /// port/resource, get no connector.
    pub fn from_config(config: &RigConfig) -> RigResult<Self> {
        let mut builder = Self::builder().retry_policy(RetryPolicy {
            max_attempts: config.reconnect.max_attempts,
            cooldown: Duration::from_millis(config.reconnect.cooldown_ms),
        });

        if !config.pump.simulate && !config.pump.port.trim().is_empty() {
            let endpoint = Endpoint::parse(&config.pump.port, config.pump.baud_rate)
                .map_err(|e| RigError::config(format!("pump.port: {e}")))?;
            builder = builder
                .pump_connector(endpoint.connector(Duration::from_millis(config.pump.timeout_ms)));
        }
        if !config.smu.simulate && !config.smu.resource.trim().is_empty() {
            let endpoint = Endpoint::parse(&config.smu.resource, 9600)
                .map_err(|e| RigError::config(format!("smu.resource: {e}")))?;
            builder = builder
                .smu_connector(endpoint.connector(Duration::from_millis(config.smu.timeout_ms)));
        }
        Ok(builder.build())
    }

    fn device(&self, id: DeviceId) -> &dyn Device {
        match id {
            DeviceId::Pump => &self.pump,
            DeviceId::Smu => &self.smu,
            DeviceId::DaqBoard => self.board.as_ref(),
            DeviceId::PressureSensor => &self.pressure,
            DeviceId::TemperatureSensor => &self.temperature,
            DeviceId::FlowSensor => &self.flow,
            DeviceId::LevelSensor => &self.level,
        }
    }

    /// The pump driver.
    pub fn pump(&self) -> &VapourtecPump {
        &self.pump
    }

    /// The SMU driver.
    pub fn smu(&self) -> &Keithley2450 {
        &self.smu
    }

    /// The DAQ board driver.
    pub fn board(&self) -> &DaqBoardDriver {
        &self.board
    }

    /// Connect every device, falling back to simulation per device.
    pub async fn connect_all(&self) -> ConnectionReport {
        let mut results = vec![
            self.pump.connect().await,
            self.smu.connect().await,
            self.board.connect().await,
        ];
        for sensor in [&self.pressure, &self.temperature, &self.flow, &self.level] {
            let detail = match sensor.try_open().await {
                Ok(detail) => detail,
                Err(_) => format!("ai{} follows the DAQ board", sensor.channel()),
            };
            results.push(ConnectionResult {
                device: sensor.id(),
                state: sensor.connection_state(),
                detail,
            });
        }
        let report = ConnectionReport { results };
        info!(
            connected = ?report.connected(),
            all_simulated = report.all_simulated(),
            "Hardware connection complete"
        );
        report
    }

    /// Command a new flow rate, clamped to the pump limits.
    pub async fn set_flow(&self, ml_per_min: f64) -> RigResult<Clamped<f64>> {
        self.pump.set_flow_rate(ml_per_min).await
    }

    /// Select the valve path.
    pub async fn set_valve_path(&self, valve: ValveSelection) -> RigResult<()> {
        self.board.set_valve(valve).await
    }

    /// Start the pump at the current setpoint.
    pub async fn start_pump(&self) -> RigResult<()> {
        self.pump.start().await
    }

    /// Stop the pump.
    pub async fn stop_pump(&self) -> RigResult<()> {
        self.pump.stop().await
    }

    /// Drive the heating plate toward a temperature.
    pub async fn set_temperature(&self, celsius: f64) -> RigResult<Clamped<f64>> {
        self.board.set_heater_temperature(celsius).await
    }

    /// Voltage-source configuration for I-V work, output enabled.
    pub async fn configure_smu_for_iv_sweep(
        &self,
        current_limit: f64,
        voltage_range: f64,
    ) -> RigResult<Clamped<f64>> {
        let range = voltage_range.abs().min(SMU_MAX_VOLTAGE);
        let limit = self
            .smu
            .configure_source_mode(SourceMode::Voltage, current_limit, Some(range))
            .await?;
        self.smu.output_on().await?;
        Ok(limit)
    }

    /// Set the SMU source voltage.
    pub async fn smu_set_voltage(&self, volts: f64) -> RigResult<Clamped<f64>> {
        self.smu.set_level(volts).await
    }

    /// Read back the programmed source voltage.
    pub async fn smu_source_voltage(&self) -> RigResult<f64> {
        self.smu.source_voltage().await
    }

    /// Measure voltage and current.
    pub async fn measure(&self) -> RigResult<SmuReading> {
        self.smu.measure().await
    }

    /// Zero the source and disable the SMU output.
    pub async fn smu_off(&self) -> RigResult<()> {
        self.smu.output_off().await
    }

    /// Read pump telemetry.
    pub async fn read_pump_status(&self) -> RigResult<PumpStatus> {
        self.pump.read_status().await
    }

    /// Read all four sensors. A board failure fails the whole read.
    pub async fn read_all_sensors(&self) -> RigResult<SensorReadings> {
        Ok(SensorReadings {
            pressure: self.pressure.read_value().await?,
            temperature: self.temperature.read_value().await?,
            flow: self.flow.read_value().await?,
            level: self.level.read_value().await?,
        })
    }

    /// Stop the pump and turn the SMU off. Best effort: every device is
    /// tried and the failures are returned.
    pub async fn safe_shutdown(&self) -> Vec<RigError> {
        let mut errors = Vec::new();
        for device in [&self.pump as &dyn Device, &self.smu as &dyn Device] {
            if !device.connection_state().is_usable() {
                debug!(device = %device.id(), "Skipping safe stop of disconnected device");
                continue;
            }
            if let Err(err) = device.stop_output().await {
                warn!(device = %device.id(), error = %err, "Safe stop failed");
                errors.push(err);
            }
        }
        errors
    }

    /// Connection state of every device, in [`DeviceId::ALL`] order.
    pub fn connection_states(&self) -> Vec<(DeviceId, ConnectionState)> {
        DeviceId::ALL
            .iter()
            .map(|id| (*id, self.device(*id).connection_state()))
            .collect()
    }

    /// Connection state of one device.
    pub fn state_of(&self, id: DeviceId) -> ConnectionState {
        self.device(id).connection_state()
    }

    /// Receive every connection state change.
    pub fn subscribe_connectivity(&self) -> broadcast::Receiver<ConnectivityChange> {
        self.connectivity.subscribe()
    }

    /// Forced reconnect with bounded retry. Sensors reconnect their board.
    ///
    /// Single-flight per device: a concurrent request for the same device
    /// returns [`ReconnectOutcome::AlreadyInProgress`] immediately.
    pub async fn reconnect(&self, id: DeviceId) -> ReconnectOutcome {
        let target = if id.is_sensor() { DeviceId::DaqBoard } else { id };
        let Some(_guard) = self.gate.try_acquire(target) else {
            info!(device = %target, "Reconnect already in progress");
            return ReconnectOutcome::AlreadyInProgress;
        };
        reconnect_device(self.device(target), &self.policy).await
    }

    /// Active health check of one device.
    pub async fn health_check(&self, id: DeviceId) -> bool {
        self.device(id).health_check().await
    }

    /// Try each candidate resource until one answers `*IDN?` as a 2450.
    ///
    /// The SMU keeps the first working connector. With no match it runs in
    /// simulation.
    pub async fn autodetect_smu(&self, candidates: &[String]) -> Option<String> {
        for candidate in candidates {
            let endpoint = match Endpoint::parse(candidate, 9600) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    debug!(candidate = %candidate, error = %e, "Skipping candidate");
                    continue;
                }
            };
            self.smu
                .link()
                .set_connector(Some(endpoint.connector(DEVICE_IO_TIMEOUT)));
            match self.smu.try_open().await {
                Ok(idn) => {
                    info!(resource = %candidate, identity = %idn, "SMU found");
                    return Some(candidate.clone());
                }
                Err(err) => debug!(candidate = %candidate, error = %err.message, "Not an SMU"),
            }
        }
        warn!(tried = candidates.len(), "No SMU found, simulating");
        self.smu.link().set_connector(None);
        self.smu.enter_simulation().await;
        None
    }

    /// Put outputs in their safe state and release every transport.
    pub async fn disconnect_all(&self) {
        for err in self.safe_shutdown().await {
            debug!(error = %err, "Ignored during disconnect");
        }
        join_all(DeviceId::ALL.iter().map(|id| self.device(*id).disconnect())).await;
        info!("All hardware disconnected");
    }

    /// Current pump setpoint (ml/min).
    pub fn flow_setpoint(&self) -> f64 {
        self.pump.setpoint()
    }

    /// Whether the pump was last commanded to run.
    pub fn pump_running(&self) -> bool {
        self.pump.is_running()
    }

    /// Whether the SMU output was last commanded on.
    pub fn smu_output_on(&self) -> bool {
        self.smu.is_output_on()
    }
}

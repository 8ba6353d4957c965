//! Vapourtec-style syringe pump driver.
//!
//! Serial protocol (9600 8N1, CRLF):
//!
//! | Command          | Reply                           |
//! |------------------|---------------------------------|
//! | `SET_FLOW <x>`   | none                            |
//! | `GET_STATUS`     | `<flow>,<pressure>,<rpm>`       |
//! | `STOP`           | none                            |
//!
//! The status reply is also accepted whitespace-separated and with
//! `key=value` prefixes. `GET_STATUS` doubles as the health-check query.

use crate::error::{DeviceError, ErrorKind, RigError, RigResult};
use crate::hardware::capabilities::{Clamped, Device, Pump, PumpStatus};
use crate::hardware::connection::{ConnectionState, Connector, DeviceId, DeviceLink};
use crate::hardware::simulation::{sine, FaultPlan, FlowSetpoint};
use crate::hardware::transport::DynTransport;
use crate::limits::MAX_FLOW_RATE;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::info;

/// Syringe pump with simulation fallback.
pub struct VapourtecPump {
    link: DeviceLink<DynTransport>,
    setpoint: FlowSetpoint,
    running: AtomicBool,
    epoch: Instant,
    last_status: RwLock<Option<PumpStatus>>,
}

impl VapourtecPump {
    /// Create a pump. `connector` is `None` for a simulation-only pump.
    pub fn new(connector: Option<Arc<dyn Connector<DynTransport>>>, setpoint: FlowSetpoint) -> Self {
        Self {
            link: DeviceLink::new(DeviceId::Pump, connector),
            setpoint,
            running: AtomicBool::new(false),
            epoch: Instant::now(),
            last_status: RwLock::new(None),
        }
    }

    /// Inject faults into simulated operation.
    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.link = self.link.with_faults(faults);
        self
    }

    /// The underlying link (state, notifier).
    pub fn link(&self) -> &DeviceLink<DynTransport> {
        &self.link
    }

    /// Handle to the shared setpoint, for sensors that track it.
    pub fn setpoint_handle(&self) -> FlowSetpoint {
        self.setpoint.clone()
    }

    /// Last status successfully read.
    pub fn last_status(&self) -> Option<PumpStatus> {
        *self.last_status.read()
    }

    fn simulate_status(&self) -> PumpStatus {
        let now = Instant::now();
        let t = now.duration_since(self.epoch).as_secs_f64();
        if !self.running.load(Ordering::SeqCst) {
            return PumpStatus {
                flow: 0.0,
                pressure: 8.0 + sine(1.5, 12.0, PI / 4.0, t) * 0.1,
                rpm: 0.0,
            };
        }
        let sp = self.setpoint.target();
        let flow = self.setpoint.value_at(now) + sine(0.005 * sp, 25.0, 0.0, t);
        PumpStatus {
            flow: flow.max(0.0),
            pressure: 8.0 + 2.0 * sp + sine(1.5, 12.0, PI / 4.0, t),
            rpm: (300.0 + 100.0 * sp + sine(20.0, 18.0, 0.0, t)).round(),
        }
    }

    async fn send(&self, operation: &'static str, command: String) -> RigResult<()> {
        let mut session = self.link.session(operation).await?;
        let Some(port) = session.handle() else {
            return Ok(());
        };
        match port.write_line(&command).await {
            Ok(()) => Ok(()),
            Err(e) => Err(session
                .fail(DeviceError::timeout(DeviceId::Pump, format!("{operation}: {e}")))
                .into()),
        }
    }
}

/// Parse a `GET_STATUS` reply.
pub fn parse_status(reply: &str) -> Option<PumpStatus> {
    let values: Vec<f64> = reply
        .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .filter_map(|part| {
            let value = part.split_once('=').map_or(part, |(_, v)| v);
            value.trim().parse::<f64>().ok()
        })
        .collect();
    match values.as_slice() {
        [flow, pressure, rpm, ..] => Some(PumpStatus {
            flow: *flow,
            pressure: *pressure,
            rpm: *rpm,
        }),
        _ => None,
    }
}

#[async_trait]
impl Device for VapourtecPump {
    fn id(&self) -> DeviceId {
        DeviceId::Pump
    }

    fn connection_state(&self) -> ConnectionState {
        self.link.state()
    }

    async fn try_open(&self) -> Result<String, DeviceError> {
        self.link.open().await?;
        if self.health_check().await {
            Ok(self.link.describe().unwrap_or_else(|| "pump".into()))
        } else {
            Err(DeviceError::timeout(
                DeviceId::Pump,
                "pump opened but did not answer GET_STATUS",
            ))
        }
    }

    async fn enter_simulation(&self) {
        self.link.enter_simulation().await;
    }

    async fn disconnect(&self) {
        self.link.close().await;
    }

    async fn health_check(&self) -> bool {
        let Ok(mut session) = self.link.session("health_check").await else {
            return false;
        };
        let Some(port) = session.handle() else {
            return true;
        };
        match port.query("GET_STATUS").await {
            Ok(reply) if parse_status(&reply).is_some() => true,
            Ok(reply) => {
                session.fail(DeviceError::timeout(
                    DeviceId::Pump,
                    format!("health check: unparseable status '{reply}'"),
                ));
                false
            }
            Err(e) => {
                session.fail(DeviceError::timeout(DeviceId::Pump, format!("health check: {e}")));
                false
            }
        }
    }

    async fn stop_output(&self) -> RigResult<()> {
        self.stop().await
    }
}

#[async_trait]
impl Pump for VapourtecPump {
    async fn set_flow_rate(&self, ml_per_min: f64) -> RigResult<Clamped<f64>> {
        if !ml_per_min.is_finite() {
            return Err(RigError::config(format!("flow rate {ml_per_min} is not a number")));
        }
        let clamped = Clamped::within(DeviceId::Pump, "flow rate", ml_per_min, 0.0, MAX_FLOW_RATE);
        if self.running.load(Ordering::SeqCst) {
            self.send("set_flow", format!("SET_FLOW {}", clamped.applied))
                .await?;
        }
        self.setpoint.set(clamped.applied);
        info!(flow = clamped.applied, "Pump setpoint updated");
        Ok(clamped)
    }

    async fn start(&self) -> RigResult<()> {
        let sp = self.setpoint.target();
        self.send("start", format!("SET_FLOW {sp}")).await?;
        if !self.running.swap(true, Ordering::SeqCst) {
            self.setpoint.ramp_from(0.0);
        }
        info!(flow = sp, "Pump started");
        Ok(())
    }

    async fn stop(&self) -> RigResult<()> {
        self.send("stop", "STOP".to_string()).await?;
        self.running.store(false, Ordering::SeqCst);
        info!("Pump stopped");
        Ok(())
    }

    async fn read_status(&self) -> RigResult<PumpStatus> {
        let mut session = self.link.session("read_status").await?;
        let status = match session.handle() {
            None => self.simulate_status(),
            Some(port) => match port.query("GET_STATUS").await {
                Ok(reply) => match parse_status(&reply) {
                    Some(status) => status,
                    None => {
                        return Err(session
                            .fail(DeviceError::new(
                                DeviceId::Pump,
                                ErrorKind::CommunicationTimeout,
                                format!("unparseable status '{reply}'"),
                            ))
                            .into())
                    }
                },
                Err(e) => {
                    return Err(session
                        .fail(DeviceError::timeout(DeviceId::Pump, format!("read_status: {e}")))
                        .into())
                }
            },
        };
        *self.last_status.write() = Some(status);
        Ok(status)
    }

    fn setpoint(&self) -> f64 {
        self.setpoint.target()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

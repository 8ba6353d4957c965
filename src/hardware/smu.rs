//! Keithley 2450 source-measure unit over SCPI.
//!
//! The instrument is reached through a raw socket (`tcp://host:5025`) or a
//! serial port; both are line transports. Query replies may carry several
//! comma-separated fields, only the first one is used.
//!
//! In simulation the SMU acts as an ideal resistor with
//! [`SIMULATED_DUT_CONDUCTANCE`]: `I = V · G` while the output is on.

use crate::error::{DeviceError, ErrorKind, RigError, RigResult};
use crate::hardware::capabilities::{Clamped, Device, SmuReading, SourceMeasure, SourceMode};
use crate::hardware::connection::{ConnectionState, Connector, DeviceId, DeviceLink};
use crate::hardware::simulation::FaultPlan;
use crate::hardware::transport::DynTransport;
use crate::limits::{
    DEFAULT_CURRENT_LIMIT, SIMULATED_DUT_CONDUCTANCE, SMU_MAX_CURRENT_LIMIT, SMU_MAX_VOLTAGE,
    SMU_MIN_CURRENT_LIMIT,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Whether an `*IDN?` reply identifies a supported instrument.
pub fn is_supported_identity(idn: &str) -> bool {
    let upper = idn.to_uppercase();
    upper.contains("2450") || upper.contains("KEITHLEY")
}

/// Parse the first numeric field of a SCPI reply.
pub fn parse_scpi_number(reply: &str) -> Option<f64> {
    reply
        .split(',')
        .next()
        .and_then(|field| field.trim().parse::<f64>().ok())
}

#[derive(Debug, Clone, Copy)]
struct SourceSettings {
    mode: SourceMode,
    limit: f64,
    level: f64,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            mode: SourceMode::Voltage,
            limit: DEFAULT_CURRENT_LIMIT,
            level: 0.0,
        }
    }
}

/// Keithley 2450 driver with simulation fallback.
pub struct Keithley2450 {
    link: DeviceLink<DynTransport>,
    output_on: AtomicBool,
    settings: RwLock<SourceSettings>,
    last_reading: RwLock<Option<SmuReading>>,
}

impl Keithley2450 {
    /// Create an SMU. `connector` is `None` for a simulation-only instrument.
    pub fn new(connector: Option<Arc<dyn Connector<DynTransport>>>) -> Self {
        Self {
            link: DeviceLink::new(DeviceId::Smu, connector),
            output_on: AtomicBool::new(false),
            settings: RwLock::new(SourceSettings::default()),
            last_reading: RwLock::new(None),
        }
    }

    /// Inject faults into simulated operation.
    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.link = self.link.with_faults(faults);
        self
    }

    /// The underlying link.
    pub fn link(&self) -> &DeviceLink<DynTransport> {
        &self.link
    }

    /// Last reading successfully taken.
    pub fn last_reading(&self) -> Option<SmuReading> {
        *self.last_reading.read()
    }

    /// Currently configured source mode.
    pub fn source_mode(&self) -> SourceMode {
        self.settings.read().mode
    }

    /// Compliance limit applied by the last configuration.
    pub fn compliance_limit(&self) -> f64 {
        self.settings.read().limit
    }

    /// Query `*IDN?` on the open transport.
    pub async fn identify(&self) -> RigResult<String> {
        let mut session = self.link.session("identify").await?;
        let Some(port) = session.handle() else {
            return Ok("KEITHLEY INSTRUMENTS,MODEL 2450,SIMULATED,0".to_string());
        };
        match port.query("*IDN?").await {
            Ok(idn) => Ok(idn),
            Err(e) => Err(session
                .fail(DeviceError::timeout(DeviceId::Smu, format!("*IDN?: {e}")))
                .into()),
        }
    }

    /// Write a batch of commands in one session. Stops at the first failure.
    async fn write_all(&self, operation: &'static str, commands: &[String]) -> RigResult<()> {
        let mut session = self.link.session(operation).await?;
        let Some(port) = session.handle() else {
            return Ok(());
        };
        for command in commands {
            if let Err(e) = port.write_line(command).await {
                return Err(session
                    .fail(DeviceError::timeout(
                        DeviceId::Smu,
                        format!("{operation}: '{command}': {e}"),
                    ))
                    .into());
            }
        }
        Ok(())
    }

    fn simulate_reading(&self) -> SmuReading {
        let settings = *self.settings.read();
        if !self.output_on.load(Ordering::SeqCst) {
            return SmuReading {
                voltage: 0.0,
                current: 0.0,
            };
        }
        match settings.mode {
            SourceMode::Voltage => SmuReading {
                voltage: settings.level,
                current: settings.level * SIMULATED_DUT_CONDUCTANCE,
            },
            SourceMode::Current => SmuReading {
                voltage: settings.level / SIMULATED_DUT_CONDUCTANCE,
                current: settings.level,
            },
        }
    }
}

fn unparseable(what: &str, reply: &str) -> DeviceError {
    DeviceError::new(
        DeviceId::Smu,
        ErrorKind::CommunicationTimeout,
        format!("unparseable {what} reply '{reply}'"),
    )
}

#[async_trait]
impl Device for Keithley2450 {
    fn id(&self) -> DeviceId {
        DeviceId::Smu
    }

    fn connection_state(&self) -> ConnectionState {
        self.link.state()
    }

    async fn try_open(&self) -> Result<String, DeviceError> {
        self.link.open().await?;
        let idn = match self.identify().await {
            Ok(idn) => idn,
            Err(RigError::Device(err)) => return Err(err),
            Err(other) => return Err(DeviceError::timeout(DeviceId::Smu, other.to_string())),
        };
        if is_supported_identity(&idn) {
            Ok(idn)
        } else {
            self.link.close().await;
            Err(DeviceError::new(
                DeviceId::Smu,
                ErrorKind::Configuration,
                format!("unexpected instrument '{idn}'"),
            ))
        }
    }

    async fn enter_simulation(&self) {
        self.output_on.store(false, Ordering::SeqCst);
        *self.settings.write() = SourceSettings::default();
        self.link.enter_simulation().await;
    }

    async fn disconnect(&self) {
        self.link.close().await;
    }

    async fn health_check(&self) -> bool {
        match self.identify().await {
            Ok(idn) if is_supported_identity(&idn) => true,
            Ok(idn) => {
                warn!(identity = %idn, "Health check answered by an unexpected instrument");
                self.link.close().await;
                false
            }
            Err(_) => false,
        }
    }

    async fn stop_output(&self) -> RigResult<()> {
        self.output_off().await
    }
}

#[async_trait]
impl SourceMeasure for Keithley2450 {
    async fn configure_source_mode(
        &self,
        mode: SourceMode,
        limit: f64,
        range: Option<f64>,
    ) -> RigResult<Clamped<f64>> {
        if !limit.is_finite() {
            return Err(RigError::config(format!("compliance limit {limit} is not a number")));
        }
        let (limit, commands) = match mode {
            SourceMode::Voltage => {
                let limit = Clamped::within(
                    DeviceId::Smu,
                    "current limit",
                    limit,
                    SMU_MIN_CURRENT_LIMIT,
                    SMU_MAX_CURRENT_LIMIT,
                );
                let range = range.map_or(SMU_MAX_VOLTAGE, |r| r.abs().min(SMU_MAX_VOLTAGE));
                let commands = vec![
                    "*RST".to_string(),
                    "SOUR:FUNC VOLT".to_string(),
                    format!("SOUR:VOLT:RANG {range}"),
                    format!("SOUR:VOLT:ILIM {}", limit.applied),
                    "SENS:FUNC \"CURR\"".to_string(),
                    format!("SENS:CURR:RANG {}", limit.applied),
                    "SENS:CURR:NPLC 1".to_string(),
                    "SENS:CURR:APER 0.1".to_string(),
                ];
                (limit, commands)
            }
            SourceMode::Current => {
                let limit =
                    Clamped::within(DeviceId::Smu, "voltage limit", limit, 0.0, SMU_MAX_VOLTAGE);
                let commands = vec![
                    "*RST".to_string(),
                    "SOUR:FUNC CURR".to_string(),
                    format!("SOUR:CURR:VLIM {}", limit.applied),
                    "SENS:FUNC \"VOLT\"".to_string(),
                ];
                (limit, commands)
            }
        };
        self.write_all("configure_source_mode", &commands).await?;
        // *RST turns the output off.
        self.output_on.store(false, Ordering::SeqCst);
        *self.settings.write() = SourceSettings {
            mode,
            limit: limit.applied,
            level: 0.0,
        };
        info!(?mode, limit = limit.applied, "SMU source configured");
        Ok(limit)
    }

    async fn output_on(&self) -> RigResult<()> {
        self.write_all("output_on", &["OUTP ON".to_string()]).await?;
        self.output_on.store(true, Ordering::SeqCst);
        info!("SMU output on");
        Ok(())
    }

    async fn output_off(&self) -> RigResult<()> {
        let zero = match self.source_mode() {
            SourceMode::Voltage => "SOUR:VOLT 0",
            SourceMode::Current => "SOUR:CURR 0",
        };
        self.write_all("output_off", &[zero.to_string(), "OUTP OFF".to_string()])
            .await?;
        self.settings.write().level = 0.0;
        self.output_on.store(false, Ordering::SeqCst);
        info!("SMU output off");
        Ok(())
    }

    async fn set_level(&self, value: f64) -> RigResult<Clamped<f64>> {
        if !value.is_finite() {
            return Err(RigError::config(format!("source level {value} is not a number")));
        }
        let settings = *self.settings.read();
        let (clamped, command) = match settings.mode {
            SourceMode::Voltage => {
                let c = Clamped::within(
                    DeviceId::Smu,
                    "source voltage",
                    value,
                    -SMU_MAX_VOLTAGE,
                    SMU_MAX_VOLTAGE,
                );
                (c, format!("SOUR:VOLT {}", c.applied))
            }
            SourceMode::Current => {
                let c = Clamped::within(
                    DeviceId::Smu,
                    "source current",
                    value,
                    -SMU_MAX_CURRENT_LIMIT,
                    SMU_MAX_CURRENT_LIMIT,
                );
                (c, format!("SOUR:CURR {}", c.applied))
            }
        };
        self.write_all("set_level", &[command]).await?;
        self.settings.write().level = clamped.applied;
        debug!(level = clamped.applied, "SMU level set");
        Ok(clamped)
    }

    async fn source_voltage(&self) -> RigResult<f64> {
        let mut session = self.link.session("source_voltage").await?;
        let Some(port) = session.handle() else {
            return Ok(self.simulate_reading().voltage);
        };
        match port.query("SOUR:VOLT?").await {
            Ok(reply) => match parse_scpi_number(&reply) {
                Some(volts) => Ok(volts),
                None => Err(session.fail(unparseable("SOUR:VOLT?", &reply)).into()),
            },
            Err(e) => Err(session
                .fail(DeviceError::timeout(DeviceId::Smu, format!("SOUR:VOLT?: {e}")))
                .into()),
        }
    }

    async fn measure(&self) -> RigResult<SmuReading> {
        let mut session = self.link.session("measure").await?;
        let reading = match session.handle() {
            None => self.simulate_reading(),
            Some(port) => {
                let current = match port.query("MEAS:CURR?").await {
                    Ok(reply) => match parse_scpi_number(&reply) {
                        Some(value) => value,
                        None => return Err(session.fail(unparseable("MEAS:CURR?", &reply)).into()),
                    },
                    Err(e) => {
                        return Err(session
                            .fail(DeviceError::timeout(DeviceId::Smu, format!("MEAS:CURR?: {e}")))
                            .into())
                    }
                };
                let voltage = match port.query("SOUR:VOLT?").await {
                    Ok(reply) => match parse_scpi_number(&reply) {
                        Some(value) => value,
                        None => return Err(session.fail(unparseable("SOUR:VOLT?", &reply)).into()),
                    },
                    Err(e) => {
                        return Err(session
                            .fail(DeviceError::timeout(DeviceId::Smu, format!("SOUR:VOLT?: {e}")))
                            .into())
                    }
                };
                SmuReading { voltage, current }
            }
        };
        *self.last_reading.write() = Some(reading);
        Ok(reading)
    }

    fn is_output_on(&self) -> bool {
        self.output_on.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::transport::LineTransport;
    use std::io;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Connector handing out one pre-built duplex end.
    struct DuplexConnector {
        host: parking_lot::Mutex<Option<DuplexStream>>,
    }

    #[async_trait]
    impl Connector<DynTransport> for DuplexConnector {
        async fn open(&self) -> io::Result<DynTransport> {
            let stream = self
                .host
                .lock()
                .take()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "already opened"))?;
            Ok(Box::new(LineTransport::new(stream, "duplex-smu")))
        }

        fn describe(&self) -> String {
            "duplex-smu".into()
        }
    }

    /// A fake 2450 that answers queries and records every command.
    fn spawn_fake_2450(device: DuplexStream) -> tokio::task::JoinHandle<Vec<String>> {
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(device);
            let mut lines = BufReader::new(read).lines();
            let mut seen = Vec::new();
            let mut volts = 0.0_f64;
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_string();
                if let Some(v) = line.strip_prefix("SOUR:VOLT ") {
                    volts = v.parse().unwrap_or(0.0);
                }
                let reply = match line.as_str() {
                    "*IDN?" => Some("KEITHLEY INSTRUMENTS,MODEL 2450,04096331,1.7.3c".to_string()),
                    "MEAS:CURR?" => Some(format!("{:e},+0.000000E+00", volts * 1e-3)),
                    "SOUR:VOLT?" => Some(format!("{volts:e}")),
                    _ => None,
                };
                seen.push(line);
                if let Some(reply) = reply {
                    if write.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
            seen
        })
    }

    /// A fake instrument answering each query with the next scripted reply.
    fn spawn_scripted_instrument(
        device: DuplexStream,
        replies: Vec<&'static str>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(device);
            let mut lines = BufReader::new(read).lines();
            let mut replies = replies.into_iter();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().ends_with('?') {
                    continue;
                }
                let reply = replies.next().unwrap_or("ERR");
                if write.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                    break;
                }
            }
        })
    }

    fn duplex_smu(host: DuplexStream) -> Keithley2450 {
        Keithley2450::new(Some(Arc::new(DuplexConnector {
            host: parking_lot::Mutex::new(Some(host)),
        })))
    }

    #[test]
    fn identity_and_number_parsing() {
        assert!(is_supported_identity("KEITHLEY INSTRUMENTS,MODEL 2450"));
        assert!(is_supported_identity("model 2450"));
        assert!(!is_supported_identity("AGILENT 34401A"));
        assert_eq!(parse_scpi_number("+1.000000E-03,+2.0"), Some(1e-3));
        assert_eq!(parse_scpi_number("garbage"), None);
    }

    #[tokio::test]
    async fn simulated_smu_behaves_like_a_resistor() {
        let smu = Keithley2450::new(None);
        assert_eq!(smu.connect().await.state, ConnectionState::SimulationMode);

        smu.configure_source_mode(SourceMode::Voltage, 0.1, Some(2.0))
            .await
            .unwrap();
        smu.output_on().await.unwrap();
        smu.set_level(1.5).await.unwrap();
        let reading = smu.measure().await.unwrap();
        assert_eq!(reading.voltage, 1.5);
        assert!((reading.current - 0.15).abs() < 1e-12);
        assert_eq!(smu.source_voltage().await.unwrap(), 1.5);

        smu.output_off().await.unwrap();
        assert!(!smu.is_output_on());
        assert_eq!(smu.measure().await.unwrap().current, 0.0);
    }

    #[tokio::test]
    async fn limits_are_clamped() {
        let smu = Keithley2450::new(None);
        smu.connect().await;
        let limit = smu
            .configure_source_mode(SourceMode::Voltage, 5.0, None)
            .await
            .unwrap();
        assert_eq!(limit.applied, SMU_MAX_CURRENT_LIMIT);
        assert_eq!(smu.set_level(500.0).await.unwrap().applied, SMU_MAX_VOLTAGE);
    }

    #[tokio::test]
    async fn real_session_speaks_scpi() {
        let (host, device) = tokio::io::duplex(4096);
        let fake = spawn_fake_2450(device);
        let smu = Keithley2450::new(Some(Arc::new(DuplexConnector {
            host: parking_lot::Mutex::new(Some(host)),
        })));

        let result = smu.connect().await;
        assert_eq!(result.state, ConnectionState::Connected);
        assert!(result.detail.contains("2450"));

        smu.configure_source_mode(SourceMode::Voltage, 0.01, Some(2.0))
            .await
            .unwrap();
        smu.output_on().await.unwrap();
        smu.set_level(1.0).await.unwrap();
        let reading = smu.measure().await.unwrap();
        assert_eq!(reading.voltage, 1.0);
        assert!((reading.current - 1e-3).abs() < 1e-12);
        smu.output_off().await.unwrap();
        assert!(smu.health_check().await);

        smu.disconnect().await;
        let seen = fake.await.unwrap();
        let position = |cmd: &str| seen.iter().position(|s| s == cmd);
        assert!(position("SOUR:FUNC VOLT").is_some());
        assert!(position("SOUR:VOLT:ILIM 0.01").is_some());
        assert!(position("SENS:CURR:NPLC 1").is_some());
        let zero = seen.iter().rposition(|s| s == "SOUR:VOLT 0").unwrap();
        let off = position("OUTP OFF").unwrap();
        assert!(zero < off, "source must be zeroed before output off");
    }

    #[tokio::test]
    async fn lost_instrument_is_marked_disconnected() {
        let (host, device) = tokio::io::duplex(4096);
        let fake = spawn_fake_2450(device);
        let smu = Keithley2450::new(Some(Arc::new(DuplexConnector {
            host: parking_lot::Mutex::new(Some(host)),
        })));
        assert_eq!(smu.connect().await.state, ConnectionState::Connected);

        fake.abort();
        let _ = fake.await;

        let err = smu.measure().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommunicationTimeout);
        assert_eq!(smu.connection_state(), ConnectionState::Disconnected);
        assert!(!smu.health_check().await);
    }

    #[tokio::test]
    async fn garbled_measurement_disconnects_the_instrument() {
        let (host, device) = tokio::io::duplex(4096);
        let _fake = spawn_scripted_instrument(device, vec!["KEITHLEY INSTRUMENTS,MODEL 2450,1,1", "ERR"]);
        let smu = duplex_smu(host);
        assert_eq!(smu.connect().await.state, ConnectionState::Connected);

        let err = smu.measure().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommunicationTimeout);
        assert_eq!(smu.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn garbled_source_readback_disconnects_the_instrument() {
        let (host, device) = tokio::io::duplex(4096);
        let _fake = spawn_scripted_instrument(device, vec!["KEITHLEY INSTRUMENTS,MODEL 2450,1,1", "ERR"]);
        let smu = duplex_smu(host);
        assert_eq!(smu.connect().await.state, ConnectionState::Connected);

        let err = smu.source_voltage().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommunicationTimeout);
        assert_eq!(smu.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn foreign_identity_fails_health_check_and_disconnects() {
        let (host, device) = tokio::io::duplex(4096);
        let _fake = spawn_scripted_instrument(
            device,
            vec!["KEITHLEY INSTRUMENTS,MODEL 2450,1,1", "AGILENT 34401A"],
        );
        let smu = duplex_smu(host);
        assert_eq!(smu.connect().await.state, ConnectionState::Connected);

        assert!(!smu.health_check().await);
        assert_eq!(smu.connection_state(), ConnectionState::Disconnected);
    }
}

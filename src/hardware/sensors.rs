//! Analog sensors read through the DAQ board.
//!
//! | Channel | Quantity    | Signal            | Conversion             |
//! |---------|-------------|-------------------|------------------------|
//! | ai0     | pressure    | 0–10 V            | `V · 100` bar          |
//! | ai1     | temperature | 4–20 mA on 250 Ω  | 20–120 °C              |
//! | ai2     | flow        | 0–5 V             | `V · 2` ml/min         |
//! | ai3     | level       | 4–20 mA on 250 Ω  | 0–1 fraction           |
//!
//! A sensor has no transport of its own: its connection state is the board's.
//! Loop-powered transmitters below [`LOOP_DISCONNECT_MA`] read as `None`.

use crate::error::{DeviceError, RigResult};
use crate::hardware::capabilities::{AnalogRead, AnalogSensor, DaqBoard, Device};
use crate::hardware::connection::{ConnectionState, DeviceId};
use crate::hardware::daq_board::DaqBoardDriver;
use crate::hardware::simulation::{sine, FlowSetpoint};
use crate::limits::{LOOP_DISCONNECT_MA, LOOP_MAX_MA, LOOP_MIN_MA, LOOP_SHUNT_OHMS};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

/// What a channel measures and how its voltage converts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorKind {
    /// Linear voltage output, `value = V · scale`.
    Linear {
        /// Engineering units per volt.
        scale: f64,
    },
    /// 4–20 mA transmitter mapped onto `[low, high]`.
    CurrentLoop {
        /// Value at 4 mA.
        low: f64,
        /// Value at 20 mA.
        high: f64,
    },
}

impl SensorKind {
    /// Convert a raw channel voltage. `None` for an open current loop.
    pub fn convert(&self, volts: f64) -> Option<f64> {
        match *self {
            SensorKind::Linear { scale } => Some(volts * scale),
            SensorKind::CurrentLoop { low, high } => loop_value(volts, low, high),
        }
    }
}

/// Loop current in mA for the voltage across the shunt.
pub fn loop_milliamps(volts: f64) -> f64 {
    volts / LOOP_SHUNT_OHMS * 1000.0
}

/// Map a 4–20 mA loop voltage onto `[low, high]`.
pub fn loop_value(volts: f64, low: f64, high: f64) -> Option<f64> {
    let ma = loop_milliamps(volts);
    if ma < LOOP_DISCONNECT_MA {
        return None;
    }
    let fraction = ((ma - LOOP_MIN_MA) / (LOOP_MAX_MA - LOOP_MIN_MA)).clamp(0.0, 1.0);
    Some(low + fraction * (high - low))
}

/// Synthetic signal of a simulated channel.
enum Synthetic {
    Pressure,
    Temperature,
    Flow(FlowSetpoint),
    Level,
}

impl Synthetic {
    fn value(&self, t: f64, now: Instant) -> f64 {
        match self {
            Synthetic::Pressure => (1.5 + sine(0.8, 20.0, 0.0, t)).max(0.1),
            Synthetic::Temperature => (25.0 + sine(5.0, 45.0, 0.0, t)).clamp(20.0, 50.0),
            Synthetic::Flow(setpoint) => {
                let sp = setpoint.target();
                (setpoint.value_at(now) + sine(0.005 * sp, 25.0, 0.0, t)).max(0.1)
            }
            Synthetic::Level => (0.5 + sine(0.3, 60.0, 0.0, t)).clamp(0.05, 0.95),
        }
    }
}

/// One analog quantity on one board channel.
pub struct ChannelSensor {
    id: DeviceId,
    channel: u8,
    kind: SensorKind,
    synthetic: Synthetic,
    board: Arc<DaqBoardDriver>,
    epoch: Instant,
    last_good: RwLock<Option<f64>>,
}

impl ChannelSensor {
    fn new(
        id: DeviceId,
        channel: u8,
        kind: SensorKind,
        synthetic: Synthetic,
        board: Arc<DaqBoardDriver>,
    ) -> Self {
        Self {
            id,
            channel,
            kind,
            synthetic,
            board,
            epoch: Instant::now(),
            last_good: RwLock::new(None),
        }
    }

    /// Pressure transducer on ai0.
    pub fn pressure(board: Arc<DaqBoardDriver>) -> Self {
        Self::new(
            DeviceId::PressureSensor,
            0,
            SensorKind::Linear { scale: 100.0 },
            Synthetic::Pressure,
            board,
        )
    }

    /// Temperature transmitter on ai1.
    pub fn temperature(board: Arc<DaqBoardDriver>) -> Self {
        Self::new(
            DeviceId::TemperatureSensor,
            1,
            SensorKind::CurrentLoop {
                low: 20.0,
                high: 120.0,
            },
            Synthetic::Temperature,
            board,
        )
    }

    /// Flow meter on ai2. In simulation it follows `setpoint`.
    pub fn flow(board: Arc<DaqBoardDriver>, setpoint: FlowSetpoint) -> Self {
        Self::new(
            DeviceId::FlowSensor,
            2,
            SensorKind::Linear { scale: 2.0 },
            Synthetic::Flow(setpoint),
            board,
        )
    }

    /// Level transmitter on ai3.
    pub fn level(board: Arc<DaqBoardDriver>) -> Self {
        Self::new(
            DeviceId::LevelSensor,
            3,
            SensorKind::CurrentLoop { low: 0.0, high: 1.0 },
            Synthetic::Level,
            board,
        )
    }

    /// Board input channel.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Conversion applied to real readings.
    pub fn kind(&self) -> SensorKind {
        self.kind
    }
}

#[async_trait]
impl Device for ChannelSensor {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn connection_state(&self) -> ConnectionState {
        self.board.connection_state()
    }

    async fn try_open(&self) -> Result<String, DeviceError> {
        match self.board.connection_state() {
            ConnectionState::Connected => Ok(format!("ai{} on DAQ board", self.channel)),
            state => Err(DeviceError::timeout(
                self.id,
                format!("DAQ board is {state}"),
            )),
        }
    }

    // Simulation is decided by the board.
    async fn enter_simulation(&self) {}

    async fn disconnect(&self) {}

    async fn health_check(&self) -> bool {
        self.board.health_check().await
    }
}

#[async_trait]
impl AnalogSensor for ChannelSensor {
    async fn read_value(&self) -> RigResult<Option<f64>> {
        let value = match self.board.read_analog(self.channel).await? {
            AnalogRead::Volts(volts) => {
                let value = self.kind.convert(volts);
                if value.is_none() {
                    debug!(
                        sensor = %self.id,
                        milliamps = loop_milliamps(volts),
                        "Loop current below threshold"
                    );
                }
                value
            }
            AnalogRead::Simulated => {
                let now = Instant::now();
                let t = now.duration_since(self.epoch).as_secs_f64();
                Some(self.synthetic.value(t, now))
            }
        };
        if value.is_some() {
            *self.last_good.write() = value;
        }
        Ok(value)
    }

    fn last_good(&self) -> Option<f64> {
        *self.last_good.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::daq_board::BenchBoard;
    use std::time::Duration;

    async fn bench() -> (BenchBoard, Arc<DaqBoardDriver>) {
        let bench = BenchBoard::new();
        let board = Arc::new(DaqBoardDriver::new(Some(bench.connector())));
        board.connect().await;
        (bench, board)
    }

    /// Shunt voltage for a loop current.
    fn volts_for_ma(ma: f64) -> f64 {
        ma / 1000.0 * LOOP_SHUNT_OHMS
    }

    #[test]
    fn loop_mapping_covers_span() {
        assert_eq!(loop_value(volts_for_ma(4.0), 20.0, 120.0), Some(20.0));
        assert_eq!(loop_value(volts_for_ma(20.0), 20.0, 120.0), Some(120.0));
        let mid = loop_value(volts_for_ma(12.0), 0.0, 1.0).unwrap();
        assert!((mid - 0.5).abs() < 1e-9);
        // Between disconnect threshold and 4 mA clamps to the low end.
        assert_eq!(loop_value(volts_for_ma(3.8), 0.0, 1.0), Some(0.0));
        assert_eq!(loop_value(volts_for_ma(3.0), 0.0, 1.0), None);
    }

    #[tokio::test]
    async fn open_temperature_loop_reads_null_and_keeps_last_good() {
        let (bench, board) = bench().await;
        let sensor = ChannelSensor::temperature(board);

        bench.set_input(1, volts_for_ma(8.0));
        let good = sensor.read_value().await.unwrap().unwrap();
        assert!((good - 45.0).abs() < 1e-9);

        bench.set_input(1, volts_for_ma(3.0));
        assert_eq!(sensor.read_value().await.unwrap(), None);
        assert_eq!(sensor.last_good(), Some(good));
        assert_eq!(sensor.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn linear_channels_scale_volts() {
        let (bench, board) = bench().await;
        let pressure = ChannelSensor::pressure(board.clone());
        let flow = ChannelSensor::flow(board, FlowSetpoint::default());
        bench.set_input(0, 0.02);
        bench.set_input(2, 0.75);
        assert_eq!(pressure.read_value().await.unwrap(), Some(2.0));
        assert_eq!(flow.read_value().await.unwrap(), Some(1.5));
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_sensors_stay_in_bounds() {
        let board = Arc::new(DaqBoardDriver::new(None));
        board.connect().await;
        let setpoint = FlowSetpoint::new(1.5);
        let sensors = [
            ChannelSensor::pressure(board.clone()),
            ChannelSensor::temperature(board.clone()),
            ChannelSensor::flow(board.clone(), setpoint),
            ChannelSensor::level(board.clone()),
        ];
        for _ in 0..120 {
            let p = sensors[0].read_value().await.unwrap().unwrap();
            let t = sensors[1].read_value().await.unwrap().unwrap();
            let f = sensors[2].read_value().await.unwrap().unwrap();
            let l = sensors[3].read_value().await.unwrap().unwrap();
            assert!((0.1..=2.3).contains(&p));
            assert!((20.0..=50.0).contains(&t));
            assert!((f - 1.5).abs() <= 0.0076);
            assert!((0.05..=0.95).contains(&l));
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(sensors[3].connection_state(), ConnectionState::SimulationMode);
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_flow_tracks_shared_setpoint() {
        let board = Arc::new(DaqBoardDriver::new(None));
        board.connect().await;
        let setpoint = FlowSetpoint::new(0.5);
        let sensor = ChannelSensor::flow(board, setpoint.clone());

        setpoint.set(3.0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        let flow = sensor.read_value().await.unwrap().unwrap();
        assert!((flow - 3.0).abs() <= 0.016, "flow {flow}");
    }
}

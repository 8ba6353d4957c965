//! In-memory time series shared between the engine and its observers.
//!
//! Every channel lives under one lock so that a snapshot is always a
//! consistent cut: all channels have the same length. The lock is a
//! `parking_lot::Mutex` and is never held across an `.await`.

use crate::recorder::MeasurementRecord;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A plotted quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Commanded flow.
    FlowSetpoint,
    /// Flow reported by the pump.
    PumpFlow,
    /// Line pressure.
    Pressure,
    /// Plate temperature.
    Temperature,
    /// Reservoir level.
    Level,
    /// SMU voltage.
    Voltage,
    /// SMU current.
    Current,
}

/// Consistent copy of every channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferSnapshot {
    /// Elapsed time of each sample.
    pub time: Vec<f64>,
    /// Commanded flow.
    pub flow_setpoint: Vec<Option<f64>>,
    /// Pump flow.
    pub pump_flow: Vec<Option<f64>>,
    /// Pressure.
    pub pressure: Vec<Option<f64>>,
    /// Temperature.
    pub temperature: Vec<Option<f64>>,
    /// Level.
    pub level: Vec<Option<f64>>,
    /// SMU voltage.
    pub voltage: Vec<Option<f64>>,
    /// SMU current.
    pub current: Vec<Option<f64>>,
}

impl BufferSnapshot {
    /// Number of samples.
    pub fn len(&self) -> usize {
        self.time.len()
    }

    /// Whether no sample was recorded.
    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Values of one channel.
    pub fn channel(&self, channel: Channel) -> &[Option<f64>] {
        match channel {
            Channel::FlowSetpoint => &self.flow_setpoint,
            Channel::PumpFlow => &self.pump_flow,
            Channel::Pressure => &self.pressure,
            Channel::Temperature => &self.temperature,
            Channel::Level => &self.level,
            Channel::Voltage => &self.voltage,
            Channel::Current => &self.current,
        }
    }
}

/// Mean and spread of a channel over its non-null samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    /// Samples that had a value.
    pub count: usize,
    /// Arithmetic mean.
    pub mean: f64,
    /// Sample standard deviation (n − 1); 0 for a single sample.
    pub std_dev: f64,
}

/// Mean and sample standard deviation, skipping nulls. `None` if every value
/// is null.
pub fn channel_stats(values: &[Option<f64>]) -> Option<ChannelStats> {
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    let count = present.len();
    if count == 0 {
        return None;
    }
    let mean = present.iter().sum::<f64>() / count as f64;
    let std_dev = if count > 1 {
        let ss: f64 = present.iter().map(|v| (v - mean).powi(2)).sum();
        (ss / (count - 1) as f64).sqrt()
    } else {
        0.0
    };
    Some(ChannelStats {
        count,
        mean,
        std_dev,
    })
}

/// Shared measurement buffers.
#[derive(Debug, Default)]
pub struct MeasurementBuffers {
    inner: Mutex<BufferSnapshot>,
}

impl MeasurementBuffers {
    /// Empty buffers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one record to every channel.
    pub fn push(&self, record: &MeasurementRecord) {
        let mut b = self.inner.lock();
        b.time.push(record.elapsed);
        b.flow_setpoint.push(Some(record.flow_setpoint));
        b.pump_flow.push(record.pump_flow);
        b.pressure.push(record.pressure);
        b.temperature.push(record.temperature);
        b.level.push(record.level);
        b.voltage.push(record.voltage);
        b.current.push(record.current);
    }

    /// Copy of every channel taken under a single lock acquisition.
    pub fn snapshot(&self) -> BufferSnapshot {
        self.inner.lock().clone()
    }

    /// Number of samples held.
    pub fn len(&self) -> usize {
        self.inner.lock().time.len()
    }

    /// Whether no sample is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every sample.
    pub fn clear(&self) {
        *self.inner.lock() = BufferSnapshot::default();
    }

    /// Statistics of one channel.
    pub fn stats(&self, channel: Channel) -> Option<ChannelStats> {
        channel_stats(self.inner.lock().channel(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::facade::SensorReadings;

    fn record(elapsed: f64, temperature: Option<f64>) -> MeasurementRecord {
        MeasurementRecord::from_readings(
            elapsed,
            1.0,
            Some(1.0),
            &SensorReadings {
                pressure: Some(2.0),
                temperature,
                flow: Some(1.0),
                level: Some(0.5),
            },
            "step 1",
        )
    }

    #[test]
    fn nulls_are_excluded_from_statistics() {
        let buffers = MeasurementBuffers::new();
        buffers.push(&record(0.0, Some(20.0)));
        buffers.push(&record(1.0, None));
        buffers.push(&record(2.0, Some(30.0)));

        let stats = buffers.stats(Channel::Temperature).unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.mean, 25.0);
        assert!((stats.std_dev - 50.0_f64.sqrt()).abs() < 1e-12);

        assert!(buffers.stats(Channel::Voltage).is_none());
        assert_eq!(buffers.stats(Channel::Level).unwrap().std_dev, 0.0);
    }

    #[test]
    fn snapshot_channels_share_one_length() {
        let buffers = MeasurementBuffers::new();
        for i in 0..5 {
            buffers.push(&record(f64::from(i), None));
        }
        let snap = buffers.snapshot();
        assert_eq!(snap.len(), 5);
        assert_eq!(snap.temperature.len(), 5);
        assert_eq!(snap.temperature[0], None);
        assert_eq!(snap.channel(Channel::Pressure)[4], Some(2.0));

        buffers.clear();
        assert!(buffers.is_empty());
        assert_eq!(snap.len(), 5);
    }

    #[test]
    fn single_sample_has_zero_spread() {
        let stats = channel_stats(&[None, Some(4.0)]).unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.std_dev, 0.0);
    }
}

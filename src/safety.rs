//! Safety interlocks evaluated on every sampling tick.
//!
//! Checks run in a fixed order and the first failure wins:
//!
//! 1. reservoir level must be at least `min_level_fraction`
//! 2. line pressure must not exceed `max_pressure`
//! 3. plate temperature must not exceed `max_temperature`
//!
//! A missing reading (`None`) passes its check; the verdict lists it so the
//! caller can warn about the blind spot.

use crate::hardware::connection::DeviceId;
use crate::hardware::facade::SensorReadings;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Immutable safety limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafetyThresholds {
    /// Lowest acceptable reservoir level (fraction 0–1).
    pub min_level_fraction: f64,
    /// Highest acceptable pressure (bar).
    pub max_pressure: f64,
    /// Highest acceptable temperature (°C).
    pub max_temperature: f64,
}

impl Default for SafetyThresholds {
    fn default() -> Self {
        Self {
            min_level_fraction: 0.05,
            max_pressure: 100.0,
            max_temperature: 100.0,
        }
    }
}

/// Which limit was breached, with the offending value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ViolationReason {
    /// Reservoir nearly empty.
    LevelTooLow {
        /// Measured level.
        level: f64,
        /// Configured minimum.
        min: f64,
    },
    /// Over-pressure.
    PressureTooHigh {
        /// Measured pressure.
        pressure: f64,
        /// Configured maximum.
        max: f64,
    },
    /// Over-temperature.
    TemperatureTooHigh {
        /// Measured temperature.
        temperature: f64,
        /// Configured maximum.
        max: f64,
    },
}

impl fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationReason::LevelTooLow { level, min } => {
                write!(f, "level {level:.3} below minimum {min:.3}")
            }
            ViolationReason::PressureTooHigh { pressure, max } => {
                write!(f, "pressure {pressure:.2} bar above maximum {max:.2} bar")
            }
            ViolationReason::TemperatureTooHigh { temperature, max } => {
                write!(f, "temperature {temperature:.1} °C above maximum {max:.1} °C")
            }
        }
    }
}

/// Result of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum SafetyVerdict {
    /// Every available reading is within limits.
    Ok {
        /// Sensors whose check was skipped for lack of data.
        unchecked: Vec<DeviceId>,
    },
    /// A limit was breached; the run must stop now.
    Violation(ViolationReason),
}

impl SafetyVerdict {
    /// Whether the run may continue.
    pub fn is_ok(&self) -> bool {
        matches!(self, SafetyVerdict::Ok { .. })
    }
}

/// Stateless evaluator over [`SafetyThresholds`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetyMonitor {
    thresholds: SafetyThresholds,
}

impl SafetyMonitor {
    /// Monitor enforcing `thresholds`.
    pub fn new(thresholds: SafetyThresholds) -> Self {
        Self { thresholds }
    }

    /// Limits in force.
    pub fn thresholds(&self) -> SafetyThresholds {
        self.thresholds
    }

    /// Evaluate one set of readings. Never fails.
    pub fn evaluate(&self, readings: &SensorReadings) -> SafetyVerdict {
        let t = &self.thresholds;
        let mut unchecked = Vec::new();

        match readings.level {
            Some(level) if level < t.min_level_fraction => {
                return SafetyVerdict::Violation(ViolationReason::LevelTooLow {
                    level,
                    min: t.min_level_fraction,
                })
            }
            Some(_) => {}
            None => unchecked.push(DeviceId::LevelSensor),
        }

        match readings.pressure {
            Some(pressure) if pressure > t.max_pressure => {
                return SafetyVerdict::Violation(ViolationReason::PressureTooHigh {
                    pressure,
                    max: t.max_pressure,
                })
            }
            Some(_) => {}
            None => unchecked.push(DeviceId::PressureSensor),
        }

        match readings.temperature {
            Some(temperature) if temperature > t.max_temperature => {
                return SafetyVerdict::Violation(ViolationReason::TemperatureTooHigh {
                    temperature,
                    max: t.max_temperature,
                })
            }
            Some(_) => {}
            None => unchecked.push(DeviceId::TemperatureSensor),
        }

        SafetyVerdict::Ok { unchecked }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readings(level: f64, pressure: f64, temperature: f64) -> SensorReadings {
        SensorReadings {
            pressure: Some(pressure),
            temperature: Some(temperature),
            flow: Some(1.5),
            level: Some(level),
        }
    }

    #[test]
    fn nominal_readings_pass() {
        let monitor = SafetyMonitor::default();
        assert_eq!(
            monitor.evaluate(&readings(0.5, 2.0, 25.0)),
            SafetyVerdict::Ok { unchecked: vec![] }
        );
    }

    #[test]
    fn low_level_is_a_violation() {
        let monitor = SafetyMonitor::default();
        let verdict = monitor.evaluate(&readings(0.02, 2.0, 25.0));
        assert_eq!(
            verdict,
            SafetyVerdict::Violation(ViolationReason::LevelTooLow {
                level: 0.02,
                min: 0.05
            })
        );
    }

    #[test]
    fn level_is_checked_before_pressure_and_temperature() {
        let monitor = SafetyMonitor::default();
        let verdict = monitor.evaluate(&readings(0.01, 500.0, 500.0));
        assert!(matches!(
            verdict,
            SafetyVerdict::Violation(ViolationReason::LevelTooLow { .. })
        ));

        let verdict = monitor.evaluate(&readings(0.5, 500.0, 500.0));
        assert!(matches!(
            verdict,
            SafetyVerdict::Violation(ViolationReason::PressureTooHigh { .. })
        ));
    }

    #[test]
    fn limits_are_inclusive() {
        let monitor = SafetyMonitor::default();
        assert!(monitor.evaluate(&readings(0.05, 100.0, 100.0)).is_ok());
        assert!(!monitor.evaluate(&readings(0.05, 100.0, 100.1)).is_ok());
    }

    #[test]
    fn missing_readings_pass_and_are_reported() {
        let monitor = SafetyMonitor::default();
        let verdict = monitor.evaluate(&SensorReadings {
            pressure: Some(2.0),
            temperature: None,
            flow: None,
            level: None,
        });
        assert_eq!(
            verdict,
            SafetyVerdict::Ok {
                unchecked: vec![DeviceId::LevelSensor, DeviceId::TemperatureSensor]
            }
        );
    }
}

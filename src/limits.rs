//! Shared physical limits and timing constants for the rig.
//!
//! This module centralizes:
//! - Device output limits enforced at the driver boundary (pump, SMU, DAC)
//! - 4–20 mA transmitter thresholds
//! - Sampling, settle and reconnect timing defaults
//!
//! Using centralized constants keeps clamping behavior identical across the
//! real and simulated code paths.

use std::time::Duration;

// =============================================================================
// Pump
// =============================================================================

/// Hard ceiling for the pump flow setpoint (ml/min).
///
/// Enforced by the pump driver regardless of what the engine requests.
pub const MAX_FLOW_RATE: f64 = 5.0;

/// Default flow setpoint used when nothing else is configured (ml/min).
pub const DEFAULT_FLOW_RATE: f64 = 1.5;

/// Time constant of the simulated pump's approach to a new setpoint.
pub const PUMP_TRANSITION_TAU_SECS: f64 = 0.8;

/// Window after a setpoint change during which the simulated flow is still
/// transitioning.
pub const PUMP_TRANSITION_WINDOW_SECS: f64 = 3.0;

// =============================================================================
// Source-measure unit
// =============================================================================

/// Largest voltage magnitude the SMU may source (V).
pub const SMU_MAX_VOLTAGE: f64 = 210.0;

/// Largest current compliance the SMU accepts (A).
pub const SMU_MAX_CURRENT_LIMIT: f64 = 1.05;

/// Smallest current compliance the SMU accepts (A).
pub const SMU_MIN_CURRENT_LIMIT: f64 = 1e-8;

/// Default current compliance (A).
pub const DEFAULT_CURRENT_LIMIT: f64 = 0.1;

/// Conductance of the simulated device under test (S).
pub const SIMULATED_DUT_CONDUCTANCE: f64 = 0.1;

// =============================================================================
// DAQ board
// =============================================================================

/// Analog output range of the board's DAC (V).
pub const DAC_MIN_VOLTS: f64 = 0.0;
/// Upper end of the DAC output range (V).
pub const DAC_MAX_VOLTS: f64 = 5.0;
/// Full-scale count of the 12-bit DAC.
pub const DAC_MAX_COUNT: u16 = 4095;

/// Bipolar analog input range (±V).
pub const ADC_RANGE_VOLTS: f64 = 10.0;

/// Heating plate: degrees per DAC volt and the zero-volt temperature.
pub const HEATER_DEGREES_PER_VOLT: f64 = 16.0;
/// Plate temperature at 0 V output (°C).
pub const HEATER_BASE_TEMPERATURE: f64 = 20.0;

// =============================================================================
// 4–20 mA transmitters
// =============================================================================

/// Loop current below which a transmitter is considered disconnected (mA).
pub const LOOP_DISCONNECT_MA: f64 = 3.5;
/// Loop current at the bottom of the measurement span (mA).
pub const LOOP_MIN_MA: f64 = 4.0;
/// Loop current at the top of the measurement span (mA).
pub const LOOP_MAX_MA: f64 = 20.0;
/// Shunt resistor converting loop current to board voltage (Ω).
pub const LOOP_SHUNT_OHMS: f64 = 250.0;

// =============================================================================
// Engine timing
// =============================================================================

/// Sampling interval for timed program steps.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Lower bound on the I-V sample interval, whatever the requested rate.
pub const MIN_IV_SAMPLE_INTERVAL: Duration = Duration::from_millis(20);

/// Default settle delay between setting a sweep voltage and measuring.
pub const SWEEP_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Tolerance used when deciding whether a voltage jump reached its target (V).
pub const JUMP_TOLERANCE: f64 = 1e-6;

/// Default jump size for write programs (V).
pub const DEFAULT_JUMP_SIZE: f64 = 0.1;

/// Default sample rate for write programs (samples/s).
pub const DEFAULT_SAMPLE_RATE: f64 = 3.0;

/// Capacity of the engine's outbound event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Device I/O and recovery
// =============================================================================

/// Bound on any single device query, including health checks.
pub const DEVICE_IO_TIMEOUT: Duration = Duration::from_secs(1);

/// Number of re-initialization attempts made by a forced reconnect.
pub const RECONNECT_ATTEMPTS: u32 = 2;

/// Cooldown between reconnect attempts, covering device boot-up lag.
pub const RECONNECT_COOLDOWN: Duration = Duration::from_secs(2);

/// Minimum spacing between repeated warnings of the same class.
pub const WARNING_RATE_LIMIT: Duration = Duration::from_secs(10);

/// Compute the I-V sample interval for a requested rate.
///
/// Non-positive or non-finite rates fall back to the floor.
pub fn iv_sample_interval(samples_per_sec: f64) -> Duration {
    if !samples_per_sec.is_finite() || samples_per_sec <= 0.0 {
        return MIN_IV_SAMPLE_INTERVAL;
    }
    Duration::from_secs_f64(1.0 / samples_per_sec).max(MIN_IV_SAMPLE_INTERVAL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iv_interval_respects_floor() {
        assert_eq!(iv_sample_interval(100.0), MIN_IV_SAMPLE_INTERVAL);
        assert_eq!(iv_sample_interval(0.0), MIN_IV_SAMPLE_INTERVAL);
        assert_eq!(iv_sample_interval(2.0), Duration::from_millis(500));
    }
}

//! Simulation support shared by the device drivers.
//!
//! - [`FlowSetpoint`]: the pump setpoint with its smooth transition curve. The
//!   pump owns it and the flow sensor receives a clone at construction, so the
//!   two simulated values track each other without shared globals.
//! - [`FaultPlan`]: scripted and random failures for simulated devices, used to
//!   exercise the disconnect and abort paths without hardware.
//! - Small waveform helpers for bounded, smooth synthetic signals.

use crate::error::DeviceError;
use crate::hardware::connection::DeviceId;
use crate::limits::{PUMP_TRANSITION_TAU_SECS, PUMP_TRANSITION_WINDOW_SECS};
use parking_lot::{Mutex, RwLock};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::Arc;
use tokio::time::Instant;

/// `amplitude · sin(2π·t/period + phase)`
pub fn sine(amplitude: f64, period_secs: f64, phase: f64, t_secs: f64) -> f64 {
    amplitude * (2.0 * PI * t_secs / period_secs + phase).sin()
}

/// Exponential approach used by the pump and flow sensor after a setpoint change.
pub fn transition(previous: f64, target: f64, secs_since_change: f64) -> f64 {
    if secs_since_change >= PUMP_TRANSITION_WINDOW_SECS {
        return target;
    }
    let factor = 1.0 - (-secs_since_change.max(0.0) / PUMP_TRANSITION_TAU_SECS).exp();
    previous + (target - previous) * factor
}

#[derive(Debug, Clone, Copy)]
struct SetpointState {
    previous: f64,
    target: f64,
    changed_at: Instant,
}

/// Shared flow setpoint handle.
///
/// Cloning yields another handle to the same setpoint.
#[derive(Debug, Clone)]
pub struct FlowSetpoint {
    inner: Arc<RwLock<SetpointState>>,
}

impl FlowSetpoint {
    /// Create a setpoint already settled at `initial`.
    pub fn new(initial: f64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(SetpointState {
                previous: initial,
                target: initial,
                changed_at: Instant::now(),
            })),
        }
    }

    /// Commanded value.
    pub fn target(&self) -> f64 {
        self.inner.read().target
    }

    /// Move to a new target, starting the transition from wherever the
    /// simulated value currently is.
    pub fn set(&self, target: f64) {
        let now = Instant::now();
        let mut state = self.inner.write();
        let current = transition(
            state.previous,
            state.target,
            now.duration_since(state.changed_at).as_secs_f64(),
        );
        *state = SetpointState {
            previous: current,
            target,
            changed_at: now,
        };
    }

    /// Restart the transition from `from` toward the existing target.
    pub fn ramp_from(&self, from: f64) {
        let mut state = self.inner.write();
        state.previous = from;
        state.changed_at = Instant::now();
    }

    /// Simulated value at `now`.
    pub fn value_at(&self, now: Instant) -> f64 {
        let state = *self.inner.read();
        transition(
            state.previous,
            state.target,
            now.saturating_duration_since(state.changed_at).as_secs_f64(),
        )
    }
}

impl Default for FlowSetpoint {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// A scripted failure.
#[derive(Debug, Clone)]
pub enum FaultScenario {
    /// Let `count` calls of `operation` succeed, fail every call after that.
    FailAfterN {
        /// Operation name, as passed by the driver.
        operation: &'static str,
        /// Number of successful calls before failures start.
        count: u32,
    },
    /// Every call of `operation` times out.
    Timeout {
        /// Operation name.
        operation: &'static str,
    },
    /// The first operation loses the link; all later ones fail too.
    CommunicationLoss,
}

#[derive(Default, Debug)]
struct FaultState {
    counts: HashMap<&'static str, u32>,
    communication_lost: bool,
}

/// Fault injection for simulated devices.
///
/// Cloning shares the counters.
#[derive(Clone)]
pub struct FaultPlan {
    scenarios: Arc<Vec<FaultScenario>>,
    failure_rate: f64,
    rng: Arc<Mutex<ChaCha8Rng>>,
    state: Arc<Mutex<FaultState>>,
}

impl std::fmt::Debug for FaultPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultPlan")
            .field("scenarios", &self.scenarios)
            .field("failure_rate", &self.failure_rate)
            .finish()
    }
}

impl FaultPlan {
    /// No injected faults.
    pub fn none() -> Self {
        Self::scenarios(Vec::new())
    }

    /// A single scripted fault.
    pub fn scenario(scenario: FaultScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Several scripted faults, checked in order.
    pub fn scenarios(scenarios: Vec<FaultScenario>) -> Self {
        Self {
            scenarios: Arc::new(scenarios),
            failure_rate: 0.0,
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(0))),
            state: Arc::new(Mutex::new(FaultState::default())),
        }
    }

    /// Uniform random failures with a fixed seed for reproducibility.
    pub fn random(rate: f64, seed: u64) -> Self {
        Self {
            failure_rate: rate.clamp(0.0, 1.0),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
            ..Self::none()
        }
    }

    /// Decide whether `operation` on `device` fails.
    pub fn check(&self, device: DeviceId, operation: &'static str) -> Result<(), DeviceError> {
        let mut state = self.state.lock();

        if state.communication_lost {
            return Err(DeviceError::timeout(device, "communication lost"));
        }

        for scenario in self.scenarios.iter() {
            match scenario {
                FaultScenario::FailAfterN { operation: op, count } if *op == operation => {
                    let calls = state.counts.entry(operation).or_insert(0);
                    *calls += 1;
                    if *calls > *count {
                        return Err(DeviceError::timeout(
                            device,
                            format!("injected failure of '{operation}' after {count} calls"),
                        ));
                    }
                }
                FaultScenario::Timeout { operation: op } if *op == operation => {
                    return Err(DeviceError::timeout(
                        device,
                        format!("'{operation}' timed out"),
                    ));
                }
                FaultScenario::CommunicationLoss => {
                    state.communication_lost = true;
                    return Err(DeviceError::timeout(device, "communication lost"));
                }
                _ => {}
            }
        }

        if self.failure_rate > 0.0 && self.rng.lock().gen::<f64>() < self.failure_rate {
            return Err(DeviceError::timeout(
                device,
                format!("random failure of '{operation}'"),
            ));
        }

        Ok(())
    }

    /// Clear counters and lost-link flags.
    pub fn reset(&self) {
        *self.state.lock() = FaultState::default();
    }
}

impl Default for FaultPlan {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn transition_settles_after_window() {
        assert_eq!(transition(0.0, 2.0, 0.0), 0.0);
        let mid = transition(0.0, 2.0, 0.8);
        assert!(mid > 1.2 && mid < 1.3, "one time constant: {mid}");
        assert_eq!(transition(0.0, 2.0, 3.0), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn setpoint_handle_is_shared_between_clones() {
        let pump_side = FlowSetpoint::new(0.0);
        let sensor_side = pump_side.clone();
        pump_side.set(1.5);
        assert_eq!(sensor_side.target(), 1.5);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(sensor_side.value_at(Instant::now()), 1.5);
    }

    #[test]
    fn fail_after_n_counts_per_operation() {
        let plan = FaultPlan::scenario(FaultScenario::FailAfterN {
            operation: "read",
            count: 2,
        });
        assert!(plan.check(DeviceId::Pump, "read").is_ok());
        assert!(plan.check(DeviceId::Pump, "write").is_ok());
        assert!(plan.check(DeviceId::Pump, "read").is_ok());
        assert!(plan.check(DeviceId::Pump, "read").is_err());

        plan.reset();
        assert!(plan.check(DeviceId::Pump, "read").is_ok());
    }

    #[test]
    fn communication_loss_is_sticky() {
        let plan = FaultPlan::scenario(FaultScenario::CommunicationLoss);
        assert!(plan.check(DeviceId::Smu, "measure").is_err());
        assert!(plan.check(DeviceId::Smu, "identify").is_err());
    }

    #[test]
    fn random_failures_are_reproducible() {
        let a = FaultPlan::random(0.5, 7);
        let b = FaultPlan::random(0.5, 7);
        let run = |plan: &FaultPlan| {
            (0..200)
                .map(|_| plan.check(DeviceId::DaqBoard, "read").is_err())
                .collect::<Vec<_>>()
        };
        let failures_a = run(&a);
        assert_eq!(failures_a, run(&b));
        let count = failures_a.iter().filter(|f| **f).count();
        assert!(count > 60 && count < 140, "got {count} failures");
    }
}

//! Engine state machine and run status.

use crate::hardware::connection::DeviceId;
use crate::safety::ViolationReason;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Lifecycle of the experiment engine.
///
/// ```text
/// Idle ──start──> Running ──stop──> Stopping ──> Paused ──start──> Running
///                    │                              │
///                    └──fault/violation──> Stopping ──> Idle
///                    └──completed──────────────────────> Idle
///                                         Paused ──finish──> Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EngineState {
    /// No run and no open session.
    #[default]
    Idle,
    /// A run is sampling.
    Running,
    /// Outputs are being brought to a safe state.
    Stopping,
    /// The run was stopped by the operator; the session stays open.
    Paused,
}

impl EngineState {
    /// Check if a new run can start (fresh or resumed).
    pub fn can_start(&self) -> bool {
        matches!(self, EngineState::Idle | EngineState::Paused)
    }

    /// Check if there is a run to stop. `ExperimentEngine::stop` treats
    /// `Paused` as already stopped.
    pub fn can_stop(&self) -> bool {
        matches!(self, EngineState::Running)
    }

    /// Check if the session can be finished.
    pub fn can_finish(&self) -> bool {
        matches!(self, EngineState::Running | EngineState::Paused)
    }

    /// Whether a run task is active.
    pub fn is_active(&self) -> bool {
        matches!(self, EngineState::Running | EngineState::Stopping)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => write!(f, "Idle"),
            EngineState::Running => write!(f, "Running"),
            EngineState::Stopping => write!(f, "Stopping"),
            EngineState::Paused => write!(f, "Paused"),
        }
    }
}

/// Why the engine left `Running`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StopReason {
    /// Every step ran to its end.
    Completed,
    /// The operator stopped the run.
    UserStop,
    /// The operator finished the session.
    Finished,
    /// A safety limit was breached.
    SafetyViolation(ViolationReason),
    /// A device failed mid-run.
    HardwareFault {
        /// Device that failed.
        device: Option<DeviceId>,
        /// Error text.
        message: String,
    },
    /// The data file could not be written.
    RecorderFault(String),
}

impl StopReason {
    /// Whether the run ended on an error.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            StopReason::SafetyViolation(_)
                | StopReason::HardwareFault { .. }
                | StopReason::RecorderFault(_)
        )
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Completed => write!(f, "completed"),
            StopReason::UserStop => write!(f, "stopped by user"),
            StopReason::Finished => write!(f, "finished"),
            StopReason::SafetyViolation(reason) => write!(f, "safety violation: {reason}"),
            StopReason::HardwareFault {
                device: Some(device),
                message,
            } => write!(f, "{device} fault: {message}"),
            StopReason::HardwareFault {
                device: None,
                message,
            } => write!(f, "hardware fault: {message}"),
            StopReason::RecorderFault(message) => write!(f, "recorder fault: {message}"),
        }
    }
}

/// What kind of run is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunKind {
    /// Step program.
    Program {
        /// Whether a step drives the SMU.
        smu: bool,
    },
    /// I-V sweep.
    Sweep,
    /// Voltage write program.
    WriteProgram,
}

impl RunKind {
    /// Whether this kind of run talks to `device` on every tick.
    ///
    /// Every run samples the pump and the sensors; only SMU runs use the SMU.
    pub fn uses(&self, device: DeviceId) -> bool {
        match device {
            DeviceId::Smu => !matches!(self, RunKind::Program { smu: false }),
            _ => true,
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunKind::Program { .. } => write!(f, "program"),
            RunKind::Sweep => write!(f, "sweep"),
            RunKind::WriteProgram => write!(f, "write program"),
        }
    }
}

/// Snapshot of the engine for observers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    /// Current state.
    pub state: EngineState,
    /// Kind of the current or last run.
    pub run_kind: Option<RunKind>,
    /// Index of the step in progress.
    pub step_index: Option<usize>,
    /// Label of the step in progress.
    pub step_label: Option<String>,
    /// Why the last run stopped.
    pub last_reason: Option<StopReason>,
    /// Data file of the open or last session.
    pub session_path: Option<PathBuf>,
}

//! Experiment orchestration.
//!
//! - [`program`]: steps, sweeps, write targets and their text syntax
//! - [`state`]: engine state machine and status
//! - [`events`]: what the engine publishes
//! - [`engine`]: the engine itself

pub mod engine;
pub mod events;
pub mod program;
pub mod state;

pub use engine::{EngineSettings, ExperimentEngine};
pub use events::EngineEvent;
pub use program::{
    parse_program, parse_write_program, ExperimentProgram, ParsedProgram, Step, SweepSpec,
    TimedStep, VoltageTarget, WriteSettings,
};
pub use state::{EngineState, EngineStatus, RunKind, StopReason};

//! # Fluidic Rig Control Library
//!
//! Control and data recording for a bench fluidic rig: a syringe pump, a
//! source-measure unit, a small DAQ board driving the heater and valves, and
//! four analog sensors (pressure, temperature, flow, liquid level).
//!
//! ## Crate Structure
//!
//! - **`hardware`**: device drivers, simulation, reconnection and the
//!   [`HardwareFacade`] that owns every device.
//! - **`safety`**: threshold checks over sensor readings.
//! - **`recorder`**: CSV sessions with JSON metadata sidecars.
//! - **`buffers`**: in-memory history for live plotting and statistics.
//! - **`experiment`**: programs, I-V sweeps, write programs and the
//!   [`ExperimentEngine`] that runs them.
//! - **`config`**: layered TOML/environment configuration.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: the crate error types.
//! - **`health`**: rate limiting for repeated warnings.
//! - **`limits`**: hardware limits and timing constants.
//!
//! Every device falls back to a simulation when it has no port configured
//! or fails to connect, so the whole stack runs on a laptop:
//!
//! ```no_run
//! use fluidic_rig::experiment::{ExperimentEngine, ExperimentProgram, TimedStep, EngineSettings};
//! use fluidic_rig::hardware::{HardwareFacade, ValveSelection};
//! use fluidic_rig::recorder::{Recorder, RecorderSettings};
//! use fluidic_rig::safety::SafetyThresholds;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let facade = Arc::new(HardwareFacade::simulated());
//! facade.connect_all().await;
//! let (engine, _events) = ExperimentEngine::new(
//!     facade,
//!     SafetyThresholds::default(),
//!     Recorder::new(RecorderSettings::default()),
//!     EngineSettings::default(),
//! );
//! engine.start(ExperimentProgram::timed(vec![TimedStep {
//!     duration_secs: 10.0,
//!     flow_rate: 1.5,
//!     valve: ValveSelection::Main,
//!     target_temperature: None,
//! }]))?;
//! let status = engine.wait().await;
//! println!("{:?}", status.session_path);
//! # Ok(())
//! # }
//! ```

pub mod buffers;
pub mod config;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod health;
pub mod limits;
pub mod logging;
pub mod recorder;
pub mod safety;

pub use error::{ErrorKind, RigError, RigResult};
pub use experiment::{EngineEvent, EngineState, ExperimentEngine, ExperimentProgram};
pub use hardware::HardwareFacade;
pub use recorder::{MeasurementRecord, Recorder};

//! Forced reconnection through the engine and the facade.

use fluidic_rig::experiment::{
    EngineSettings, ExperimentEngine, ExperimentProgram, StopReason, SweepSpec, TimedStep,
};
use fluidic_rig::hardware::{
    BenchBoard, ConnectionState, DeviceId, HardwareFacade, ReconnectOutcome, RetryPolicy,
    ValveSelection,
};
use fluidic_rig::recorder::{Recorder, RecorderSettings};
use fluidic_rig::safety::SafetyThresholds;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

/// Nominal inputs: 2 bar, 25 °C, 1.5 ml/min, level 0.5.
fn bench() -> BenchBoard {
    let board = BenchBoard::new();
    board.set_input(0, 0.02);
    board.set_input(1, 1.2);
    board.set_input(2, 0.75);
    board.set_input(3, 3.0);
    board
}

fn engine(facade: Arc<HardwareFacade>, dir: &TempDir) -> ExperimentEngine {
    let (engine, _events) = ExperimentEngine::new(
        facade,
        SafetyThresholds::default(),
        Recorder::new(RecorderSettings {
            data_dir: dir.path().to_path_buf(),
            ..RecorderSettings::default()
        }),
        EngineSettings::default(),
    );
    engine
}

#[tokio::test(start_paused = true)]
async fn board_comes_back_after_being_replugged() {
    let board = bench();
    let facade = Arc::new(
        HardwareFacade::builder()
            .board_connector(board.connector())
            .retry_policy(RetryPolicy {
                max_attempts: 3,
                cooldown: Duration::from_millis(500),
            })
            .build(),
    );
    facade.connect_all().await;
    let dir = TempDir::new().unwrap();
    let engine = engine(facade.clone(), &dir);

    board.set_unplugged(true);
    assert!(facade.read_all_sensors().await.is_err());
    assert_eq!(facade.state_of(DeviceId::DaqBoard), ConnectionState::Disconnected);

    board.set_unplugged(false);
    let outcome = engine
        .request_hardware_reconnect(DeviceId::DaqBoard)
        .unwrap()
        .await
        .unwrap();
    assert_eq!(outcome, ReconnectOutcome::Connected { attempts: 1 });
    assert_eq!(facade.state_of(DeviceId::PressureSensor), ConnectionState::Connected);
    let readings = facade.read_all_sensors().await.unwrap();
    assert!(readings.level.is_some_and(|l| (l - 0.5).abs() < 1e-6));
}

#[tokio::test(start_paused = true)]
async fn retry_count_follows_the_policy() {
    let board = bench();
    let facade = Arc::new(
        HardwareFacade::builder()
            .board_connector(board.connector())
            .retry_policy(RetryPolicy {
                max_attempts: 3,
                cooldown: Duration::from_millis(500),
            })
            .build(),
    );
    facade.connect_all().await;
    board.set_unplugged(true);
    let opens_before = board.open_count();

    let outcome = facade.reconnect(DeviceId::TemperatureSensor).await;
    assert_eq!(outcome, ReconnectOutcome::FellBackToSimulation { attempts: 3 });
    assert_eq!(board.open_count() - opens_before, 3);
    for id in [
        DeviceId::DaqBoard,
        DeviceId::PressureSensor,
        DeviceId::TemperatureSensor,
        DeviceId::FlowSensor,
        DeviceId::LevelSensor,
    ] {
        assert_eq!(facade.state_of(id), ConnectionState::SimulationMode, "{id}");
    }
}

#[tokio::test(start_paused = true)]
async fn smu_reconnect_is_allowed_during_a_flow_program() {
    let facade = Arc::new(HardwareFacade::simulated());
    facade.connect_all().await;
    let dir = TempDir::new().unwrap();
    let engine = engine(facade.clone(), &dir);

    engine
        .start(ExperimentProgram::timed(vec![TimedStep {
            duration_secs: 3.0,
            flow_rate: 1.0,
            valve: ValveSelection::Main,
            target_temperature: None,
        }]))
        .unwrap();
    tokio::task::yield_now().await;

    assert_err!(engine.request_hardware_reconnect(DeviceId::Pump));
    assert_err!(engine.request_hardware_reconnect(DeviceId::LevelSensor));
    // A flow-only program never talks to the SMU.
    let smu = assert_ok!(engine.request_hardware_reconnect(DeviceId::Smu));
    assert!(matches!(
        smu.await.unwrap(),
        ReconnectOutcome::Connected { .. } | ReconnectOutcome::FellBackToSimulation { .. }
    ));

    let status = engine.wait().await;
    assert_eq!(status.last_reason, Some(StopReason::Completed));
}

#[tokio::test(start_paused = true)]
async fn smu_reconnect_is_refused_during_a_sweep() {
    let facade = Arc::new(HardwareFacade::simulated());
    facade.connect_all().await;
    let dir = TempDir::new().unwrap();
    let engine = engine(facade.clone(), &dir);

    engine
        .run_iv_sweep(SweepSpec {
            start: 0.0,
            end: 1.0,
            step: 0.25,
            current_limit: 0.1,
        })
        .unwrap();
    assert_err!(engine.request_hardware_reconnect(DeviceId::Smu));
    engine.wait().await;

    // Idle again: allowed.
    assert_ok!(engine.request_hardware_reconnect(DeviceId::Smu));
}

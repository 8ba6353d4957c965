//! End-to-end runs through the public API on simulated hardware.

use fluidic_rig::config::RigConfig;
use fluidic_rig::experiment::{
    parse_program, parse_write_program, EngineEvent, EngineState, ExperimentEngine,
    ExperimentProgram, Step, StopReason, SweepSpec, TimedStep, WriteSettings,
};
use fluidic_rig::hardware::{HardwareFacade, ValveSelection};
use fluidic_rig::recorder::{read_metadata, read_records, Recorder, SessionMetadata};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;

const CONFIG: &str = r#"
[application]
name = "Workflow Test"
log_level = "debug"

[pump]
simulate = true

[smu]
simulate = true
default_current_limit = 0.05

[recorder]
delimiter = ";"

[reconnect]
max_attempts = 1
cooldown_ms = 10
"#;

/// Engine built the way the CLI builds it, writing into `dir`.
async fn engine_from_config(dir: &TempDir) -> (ExperimentEngine, mpsc::Receiver<EngineEvent>, RigConfig) {
    let path = dir.path().join("rig.toml");
    std::fs::write(&path, CONFIG).expect("write config");
    let mut config = RigConfig::load_from(&path).expect("load config");
    config.recorder.data_dir = dir.path().join("data");
    config.validate().expect("valid config");

    let facade = Arc::new(HardwareFacade::from_config(&config).expect("facade"));
    let report = facade.connect_all().await;
    assert!(report.all_simulated());

    let recorder = Recorder::new(config.recorder_settings().expect("recorder settings"));
    let (engine, events) = ExperimentEngine::new(
        facade,
        config.safety_thresholds(),
        recorder,
        config.engine_settings(),
    );
    (engine, events, config)
}

#[tokio::test(start_paused = true)]
async fn parsed_program_runs_and_records_with_metadata() {
    let dir = TempDir::new().unwrap();
    let (engine, mut events, config) = engine_from_config(&dir).await;
    assert_eq!(config.application.name, "Workflow Test");

    let parsed = parse_program(
        "# flush then rinse\n\
         step 1: flow=1.0, duration=2\n\
         step 2: flow=9, duration=2, valve=rinsing\n",
    )
    .unwrap();
    assert_eq!(parsed.warnings.len(), 1);

    let mut metadata = SessionMetadata::named("flush_check");
    metadata.tags = vec!["flow".into(), "baseline".into()];
    engine.set_session_metadata(metadata);
    engine.start(parsed.program).unwrap();
    let status = engine.wait().await;

    assert_eq!(status.state, EngineState::Idle);
    assert_eq!(status.last_reason, Some(StopReason::Completed));
    let path = status.session_path.expect("session file");
    assert!(path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("flush_check_")));

    let records = read_records(&path, b';').unwrap();
    assert_eq!(records.len(), 4);
    let ids: Vec<u64> = records.iter().map(|r| r.measurement_id).collect();
    assert_eq!(ids, [1, 2, 3, 4]);
    assert_eq!(records[0].flow_setpoint, 1.0);
    assert_eq!(records[3].flow_setpoint, 5.0);
    assert_eq!(records[3].step_label, "step 2");
    assert!(records.iter().all(|r| r.voltage.is_none()));

    let sidecar = read_metadata(&path).unwrap().expect("sidecar");
    assert_eq!(sidecar.metadata.name.as_deref(), Some("flush_check"));
    assert_eq!(sidecar.metadata.tags, ["flow", "baseline"]);
    assert!(sidecar.metadata.start_timestamp.is_some());

    let mut saw_completed = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::Completed { path: Some(done) } = &event {
            assert_eq!(done, &path);
            saw_completed = true;
        }
    }
    assert!(saw_completed);
}

#[tokio::test(start_paused = true)]
async fn mixed_program_labels_sweep_points_by_step() {
    let dir = TempDir::new().unwrap();
    let (engine, _events, _config) = engine_from_config(&dir).await;

    let program = ExperimentProgram {
        steps: vec![
            Step::Timed(TimedStep {
                duration_secs: 1.0,
                flow_rate: 2.0,
                valve: ValveSelection::Main,
                target_temperature: None,
            }),
            Step::Sweep(SweepSpec {
                start: 0.0,
                end: 1.0,
                step: 0.5,
                current_limit: 0.01,
            }),
        ],
        write: WriteSettings::default(),
    };
    engine.start(program).unwrap();
    let status = engine.wait().await;
    assert_eq!(status.last_reason, Some(StopReason::Completed));
    assert!(!engine.facade().smu_output_on());
    assert!(!engine.facade().pump_running());

    let records = read_records(&status.session_path.unwrap(), b';').unwrap();
    let labels: Vec<&str> = records.iter().map(|r| r.step_label.as_str()).collect();
    assert_eq!(
        labels,
        [
            "step 1",
            "step 2 sweep 1/3",
            "step 2 sweep 2/3",
            "step 2 sweep 3/3"
        ]
    );
    let voltages: Vec<f64> = records[1..].iter().filter_map(|r| r.voltage).collect();
    assert_eq!(voltages.len(), 3);
    for (got, want) in voltages.iter().zip([0.0, 0.5, 1.0]) {
        assert!((got - want).abs() < 1e-9, "{voltages:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn write_program_walks_up_then_down() {
    let dir = TempDir::new().unwrap();
    let (engine, _events, config) = engine_from_config(&dir).await;

    let targets = parse_write_program("up: voltage=0.2\ndown: voltage=-0.2\n").unwrap();
    engine
        .run_iv_write_program(
            targets,
            WriteSettings {
                current_limit: config.smu.default_current_limit,
                jump_size: 0.2,
                sample_rate: 5.0,
            },
        )
        .unwrap();
    let status = engine.wait().await;
    assert_eq!(status.last_reason, Some(StopReason::Completed));

    let records = read_records(&status.session_path.unwrap(), b';').unwrap();
    let labels: Vec<&str> = records.iter().map(|r| r.step_label.as_str()).collect();
    assert_eq!(labels, ["1/2", "1/2", "2/2", "2/2", "2/2"]);
    let voltages: Vec<f64> = records.iter().filter_map(|r| r.voltage).collect();
    for (got, want) in voltages.iter().zip([0.2, 0.2, 0.0, -0.2, -0.2]) {
        assert!((got - want).abs() < 1e-9, "{voltages:?}");
    }
    for pair in voltages.windows(2) {
        assert!((pair[1] - pair[0]).abs() <= 0.2 + 1e-9);
    }
    assert_eq!(records[4].target_voltage, Some(-0.2));
}

#[tokio::test(start_paused = true)]
async fn finish_after_stop_closes_the_session() {
    let dir = TempDir::new().unwrap();
    let (engine, _events, _config) = engine_from_config(&dir).await;

    engine
        .start(ExperimentProgram::timed(vec![TimedStep {
            duration_secs: 60.0,
            flow_rate: 1.5,
            valve: ValveSelection::Main,
            target_temperature: Some(30.0),
        }]))
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
    engine.stop().await.unwrap();
    assert_eq!(engine.state(), EngineState::Paused);

    let path = engine.finish().await.unwrap().expect("session file");
    let status = engine.status();
    assert_eq!(status.state, EngineState::Idle);
    assert_eq!(status.last_reason, Some(StopReason::Finished));
    assert_eq!(read_records(&path, b';').unwrap().len(), 3);

    // A new start opens a fresh file.
    engine
        .start(ExperimentProgram::timed(vec![TimedStep {
            duration_secs: 1.0,
            flow_rate: 1.5,
            valve: ValveSelection::Main,
            target_temperature: None,
        }]))
        .unwrap();
    let next = engine.wait().await.session_path.unwrap();
    assert_ne!(next, path);
    let records = read_records(&next, b';').unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].measurement_id, 1);
}

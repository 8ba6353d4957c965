//! Data file layout as seen by downstream tools.

use fluidic_rig::hardware::SensorReadings;
use fluidic_rig::recorder::{
    read_metadata, read_records, MeasurementRecord, Recorder, RecorderSettings, SessionMetadata,
    CSV_HEADER, FLOW_UPDATE_LABEL,
};
use tempfile::TempDir;

fn recorder(dir: &TempDir, delimiter: u8) -> Recorder {
    Recorder::new(RecorderSettings {
        data_dir: dir.path().join("runs"),
        delimiter,
        ..RecorderSettings::default()
    })
}

fn readings(level: Option<f64>) -> SensorReadings {
    SensorReadings {
        pressure: Some(1.25),
        temperature: Some(24.5),
        flow: Some(1.5),
        level,
    }
}

#[test]
fn file_without_metadata_starts_with_the_header() {
    let dir = TempDir::new().unwrap();
    let mut rec = recorder(&dir, b',');
    let handle = rec.begin_session(None).unwrap();
    assert!(handle.metadata_path.is_none());
    assert!(handle
        .path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("experiment_data_") && n.ends_with(".csv")));

    rec.append(MeasurementRecord::from_readings(0.0, 1.5, Some(1.49), &readings(Some(0.6)), "step 1"))
        .unwrap();
    rec.end_session().unwrap();

    let text = std::fs::read_to_string(&handle.path).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some(CSV_HEADER.join(",").as_str()));
    let row = lines.next().unwrap();
    assert!(row.starts_with("1,0.0,1.5,1.49,1.25,24.5,0.6,step 1,"));
    assert!(row.ends_with(",,"));
    assert_eq!(lines.next(), None);
}

#[test]
fn metadata_sidecar_matches_the_comment_block() {
    let dir = TempDir::new().unwrap();
    let mut rec = recorder(&dir, b'\t');
    let handle = rec
        .begin_session(Some(SessionMetadata {
            name: Some("  cell_7  ".into()),
            description: "first fill\nafter cleaning".into(),
            tags: vec!["fill".into(), " ".into()],
            operator: Some("bench-a".into()),
            start_timestamp: None,
        }))
        .unwrap();

    let metadata = handle.metadata.clone().unwrap();
    assert_eq!(metadata.name.as_deref(), Some("cell_7"));
    assert_eq!(metadata.description, "first fill after cleaning");
    assert_eq!(metadata.tags, ["fill"]);

    let sidecar = read_metadata(&handle.path).unwrap().unwrap();
    assert!(handle.metadata_path.as_ref().is_some_and(|p| p.exists()));
    assert_eq!(sidecar.run_id, handle.run_id);
    assert_eq!(
        Some(sidecar.data_file.as_str()),
        handle.path.file_name().and_then(|n| n.to_str())
    );
    assert_eq!(sidecar.metadata, metadata);

    let text = std::fs::read_to_string(&handle.path).unwrap();
    assert!(text.starts_with("# Experiment Metadata\n# name: cell_7\n"));
    assert!(text.contains(&format!("# run_id: {}\n", handle.run_id)));
}

#[test]
fn flow_change_rows_and_nulls_read_back() {
    let dir = TempDir::new().unwrap();
    let mut rec = recorder(&dir, b';');
    let handle = rec.begin_session(Some(SessionMetadata::named("flow"))).unwrap();

    rec.append(MeasurementRecord::from_readings(0.0, 1.0, None, &readings(None), "step 1"))
        .unwrap();
    rec.log_flow_change(0.4, 2.0, Some(1.0), &readings(Some(0.5)))
        .unwrap();
    rec.append(MeasurementRecord::from_readings(1.0, 2.0, Some(1.9), &readings(Some(0.5)), "step 1"))
        .unwrap();
    assert_eq!(rec.record_count(), 3);
    assert_eq!(rec.last_elapsed(), Some(1.0));
    rec.end_session().unwrap();
    assert!(!rec.is_open());

    let records = read_records(&handle.path, b';').unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].level, None);
    assert_eq!(records[0].pump_flow, None);
    assert_eq!(records[1].step_label, FLOW_UPDATE_LABEL);
    assert_eq!(records[1].flow_setpoint, 2.0);
    assert_eq!(records[2].measurement_id, 3);
    assert_eq!(records[2].pump_flow, Some(1.9));
}

#[test]
fn sessions_in_the_same_second_do_not_overwrite() {
    let dir = TempDir::new().unwrap();
    let mut rec = recorder(&dir, b',');
    let first = rec.begin_session(Some(SessionMetadata::named("dup"))).unwrap();
    rec.end_session().unwrap();
    let second = rec.begin_session(Some(SessionMetadata::named("dup"))).unwrap();
    rec.end_session().unwrap();

    assert_ne!(first.path, second.path);
    assert_ne!(first.metadata_path, second.metadata_path);
    assert!(first.path.exists() && second.path.exists());
}

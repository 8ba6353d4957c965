//! Append-only CSV recorder.
//!
//! One file per recording session:
//!
//! ```text
//! # Experiment Metadata
//! # name: calibration_run
//! # tags: flow,baseline
//! #
//! measurement_id,time,flow_setpoint,pump_flow_read,...
//! 1,0.0,1.5,1.49,...
//! ```
//!
//! The metadata block and the header are written exactly once, before any
//! data row. Every append is flushed, so a crash loses at most the row being
//! written. Missing values are written as empty fields and read back as `None`.
//!
//! The recorder never closes itself on error; its owner decides when a
//! session ends.

use crate::error::RecorderError;
use crate::hardware::facade::SensorReadings;
use chrono::{DateTime, Local};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Column order of every data file.
pub const CSV_HEADER: [&str; 11] = [
    "measurement_id",
    "time",
    "flow_setpoint",
    "pump_flow_read",
    "pressure_read",
    "temp_read",
    "level_read",
    "program_step",
    "voltage",
    "current",
    "target_voltage",
];

/// Step label of rows logged for a mid-run flow change.
pub const FLOW_UPDATE_LABEL: &str = "FLOW_UPDATE";

const DEFAULT_BASE_NAME: &str = "experiment_data";

#[allow(clippy::expect_used)]
static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex"));

/// One row of the data file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    /// 1-based counter within the session. Assigned on append.
    pub measurement_id: u64,
    /// Seconds since the session base.
    #[serde(rename = "time")]
    pub elapsed: f64,
    /// Commanded flow (ml/min).
    pub flow_setpoint: f64,
    /// Flow reported by the pump.
    #[serde(rename = "pump_flow_read")]
    pub pump_flow: Option<f64>,
    /// Line pressure (bar).
    #[serde(rename = "pressure_read")]
    pub pressure: Option<f64>,
    /// Plate temperature (°C).
    #[serde(rename = "temp_read")]
    pub temperature: Option<f64>,
    /// Reservoir level (fraction).
    #[serde(rename = "level_read")]
    pub level: Option<f64>,
    /// Step label, e.g. `step 2`, `3/5`, `sweep 4/9`, `FLOW_UPDATE`.
    #[serde(rename = "program_step")]
    pub step_label: String,
    /// SMU voltage.
    pub voltage: Option<f64>,
    /// SMU current.
    pub current: Option<f64>,
    /// Target of the running voltage jump program.
    pub target_voltage: Option<f64>,
}

impl MeasurementRecord {
    /// A row carrying sensor readings and no SMU data.
    pub fn from_readings(
        elapsed: f64,
        flow_setpoint: f64,
        pump_flow: Option<f64>,
        readings: &SensorReadings,
        step_label: impl Into<String>,
    ) -> Self {
        Self {
            measurement_id: 0,
            elapsed,
            flow_setpoint,
            pump_flow,
            pressure: readings.pressure,
            temperature: readings.temperature,
            level: readings.level,
            step_label: step_label.into(),
            voltage: None,
            current: None,
            target_voltage: None,
        }
    }
}

/// Descriptive metadata of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Short name, `[A-Za-z0-9_-]+`. Used as the file name prefix.
    pub name: Option<String>,
    /// Free text.
    #[serde(default)]
    pub description: String,
    /// Search tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Who ran it.
    pub operator: Option<String>,
    /// Filled in at `begin_session` when absent.
    pub start_timestamp: Option<DateTime<Local>>,
}

impl SessionMetadata {
    /// Metadata with only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Validate and normalize: trims fields, drops empty tags.
    pub fn normalized(self) -> Result<Self, RecorderError> {
        let name = self
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        if let Some(name) = &name {
            if !NAME_PATTERN.is_match(name) {
                return Err(RecorderError::InvalidMetadata(format!(
                    "name '{name}' may only contain letters, digits, '_' and '-'"
                )));
            }
        }
        let tags = self
            .tags
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        Ok(Self {
            name,
            description: single_line(self.description.trim()),
            tags,
            operator: self
                .operator
                .map(|o| single_line(o.trim()))
                .filter(|o| !o.is_empty()),
            start_timestamp: self.start_timestamp,
        })
    }

    fn block_lines(&self, run_id: &Uuid) -> Vec<String> {
        let mut lines = vec!["# Experiment Metadata".to_string()];
        if let Some(name) = &self.name {
            lines.push(format!("# name: {name}"));
        }
        if !self.description.is_empty() {
            lines.push(format!("# description: {}", self.description));
        }
        if !self.tags.is_empty() {
            lines.push(format!("# tags: {}", self.tags.join(",")));
        }
        if let Some(operator) = &self.operator {
            lines.push(format!("# operator: {operator}"));
        }
        if let Some(ts) = &self.start_timestamp {
            lines.push(format!("# start_timestamp: {}", ts.to_rfc3339()));
        }
        lines.push(format!("# run_id: {run_id}"));
        lines.push("#".to_string());
        lines
    }
}

fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

/// Contents of the `<base>_metadata.json` sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSidecar {
    /// Unique id of the session.
    pub run_id: Uuid,
    /// File name of the data file.
    pub data_file: String,
    /// Session metadata.
    #[serde(flatten)]
    pub metadata: SessionMetadata,
}

/// Where and how files are written.
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderSettings {
    /// Directory for data files; created on demand.
    pub data_dir: PathBuf,
    /// Field delimiter.
    pub delimiter: u8,
    /// chrono format of the file name timestamp.
    pub timestamp_format: String,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            delimiter: b',',
            timestamp_format: "%Y%m%d_%H%M%S".to_string(),
        }
    }
}

/// Identity of an open or closed session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionHandle {
    /// Unique id of the session.
    pub run_id: Uuid,
    /// Path of the data file.
    pub path: PathBuf,
    /// Path of the metadata sidecar, when metadata was given.
    pub metadata_path: Option<PathBuf>,
    /// Normalized metadata.
    pub metadata: Option<SessionMetadata>,
}

struct OpenSession {
    handle: SessionHandle,
    writer: csv::Writer<File>,
    last_elapsed: Option<f64>,
    count: u64,
}

/// Writes measurement rows for one session at a time.
pub struct Recorder {
    settings: RecorderSettings,
    session: Option<OpenSession>,
}

impl Recorder {
    /// Create a recorder. Nothing touches the disk until `begin_session`.
    pub fn new(settings: RecorderSettings) -> Self {
        Self {
            settings,
            session: None,
        }
    }

    /// Settings in use.
    pub fn settings(&self) -> &RecorderSettings {
        &self.settings
    }

    /// Open a new session file and write its metadata block and header.
    pub fn begin_session(
        &mut self,
        metadata: Option<SessionMetadata>,
    ) -> Result<SessionHandle, RecorderError> {
        if let Some(open) = &self.session {
            return Err(RecorderError::SessionAlreadyOpen(
                open.handle.path.display().to_string(),
            ));
        }
        let metadata = metadata
            .map(|m| {
                m.normalized().map(|mut m| {
                    m.start_timestamp.get_or_insert_with(Local::now);
                    m
                })
            })
            .transpose()?;

        std::fs::create_dir_all(&self.settings.data_dir)?;
        let prefix = metadata
            .as_ref()
            .and_then(|m| m.name.clone())
            .unwrap_or_else(|| DEFAULT_BASE_NAME.to_string());
        let stamp = Local::now().format(&self.settings.timestamp_format).to_string();
        let (mut file, base) = create_unique(&self.settings.data_dir, &format!("{prefix}_{stamp}"))?;
        let path = self.settings.data_dir.join(format!("{base}.csv"));
        let run_id = Uuid::new_v4();

        if let Some(metadata) = &metadata {
            for line in metadata.block_lines(&run_id) {
                writeln!(file, "{line}")?;
            }
        }

        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.settings.delimiter)
            .has_headers(false)
            .from_writer(file);
        writer.write_record(CSV_HEADER)?;
        writer.flush()?;

        let metadata_path = match &metadata {
            Some(metadata) => {
                let sidecar_path = self.settings.data_dir.join(format!("{base}_metadata.json"));
                let sidecar = SessionSidecar {
                    run_id,
                    data_file: format!("{base}.csv"),
                    metadata: metadata.clone(),
                };
                std::fs::write(&sidecar_path, serde_json::to_string_pretty(&sidecar)?)?;
                Some(sidecar_path)
            }
            None => None,
        };

        let handle = SessionHandle {
            run_id,
            path,
            metadata_path,
            metadata,
        };
        info!(path = %handle.path.display(), run_id = %run_id, "Recording session started");
        self.session = Some(OpenSession {
            handle: handle.clone(),
            writer,
            last_elapsed: None,
            count: 0,
        });
        Ok(handle)
    }

    /// Append one row. Assigns and returns the stored `measurement_id`.
    ///
    /// Rejects rows whose elapsed time precedes the last written one; nothing
    /// is written in that case.
    pub fn append(&mut self, mut record: MeasurementRecord) -> Result<MeasurementRecord, RecorderError> {
        let session = self.session.as_mut().ok_or(RecorderError::SessionClosed)?;
        if let Some(last) = session.last_elapsed {
            if record.elapsed < last {
                return Err(RecorderError::OutOfOrder {
                    last,
                    got: record.elapsed,
                });
            }
        }
        record.measurement_id = session.count + 1;
        session.writer.serialize(&record)?;
        session.writer.flush()?;
        session.count += 1;
        session.last_elapsed = Some(record.elapsed);
        debug!(id = record.measurement_id, elapsed = record.elapsed, step = %record.step_label, "Row appended");
        Ok(record)
    }

    /// Append a `FLOW_UPDATE` row for a setpoint change.
    pub fn log_flow_change(
        &mut self,
        elapsed: f64,
        new_setpoint: f64,
        pump_flow: Option<f64>,
        readings: &SensorReadings,
    ) -> Result<MeasurementRecord, RecorderError> {
        self.append(MeasurementRecord::from_readings(
            elapsed,
            new_setpoint,
            pump_flow,
            readings,
            FLOW_UPDATE_LABEL,
        ))
    }

    /// Flush and close the session. Later appends fail.
    pub fn end_session(&mut self) -> Result<SessionHandle, RecorderError> {
        let mut session = self.session.take().ok_or(RecorderError::SessionClosed)?;
        session.writer.flush()?;
        info!(
            path = %session.handle.path.display(),
            records = session.count,
            "Recording session closed"
        );
        Ok(session.handle)
    }

    /// Flush buffered rows without closing.
    pub fn flush(&mut self) -> Result<(), RecorderError> {
        match self.session.as_mut() {
            Some(session) => Ok(session.writer.flush()?),
            None => Ok(()),
        }
    }

    /// Elapsed time of the last row written in the open session.
    pub fn last_elapsed(&self) -> Option<f64> {
        self.session.as_ref().and_then(|s| s.last_elapsed)
    }

    /// Rows written in the open session.
    pub fn record_count(&self) -> u64 {
        self.session.as_ref().map_or(0, |s| s.count)
    }

    /// Whether a session is open.
    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Handle of the open session.
    pub fn current_session(&self) -> Option<&SessionHandle> {
        self.session.as_ref().map(|s| &s.handle)
    }

    /// Point the open session at a read-only handle so later writes fail.
    #[cfg(test)]
    pub(crate) fn make_unwritable(&mut self) -> Result<(), RecorderError> {
        if let Some(session) = self.session.as_mut() {
            let file = File::open(&session.handle.path)?;
            session.writer = csv::WriterBuilder::new()
                .delimiter(self.settings.delimiter)
                .has_headers(false)
                .from_writer(file);
        }
        Ok(())
    }
}

/// Create `<dir>/<stem>.csv`, or `<stem>_N.csv` when taken. Returns the file
/// and the base name used.
fn create_unique(dir: &Path, stem: &str) -> Result<(File, String), RecorderError> {
    let mut n = 0u32;
    loop {
        let base = if n == 0 {
            stem.to_string()
        } else {
            format!("{stem}_{n}")
        };
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(format!("{base}.csv")))
        {
            Ok(file) => return Ok((file, base)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Read a data file back, skipping the metadata block.
pub fn read_records(path: &Path, delimiter: u8) -> Result<Vec<MeasurementRecord>, RecorderError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .comment(Some(b'#'))
        .has_headers(true)
        .from_path(path)?;
    let mut records = Vec::new();
    for (index, row) in reader.deserialize::<MeasurementRecord>().enumerate() {
        let record = row.map_err(|e| RecorderError::Malformed {
            line: e
                .position()
                .map_or(index as u64 + 2, |p| p.line()),
            message: e.to_string(),
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Read the metadata sidecar of a data file, if one exists.
pub fn read_metadata(data_path: &Path) -> Result<Option<SessionSidecar>, RecorderError> {
    let Some(stem) = data_path.file_stem().and_then(|s| s.to_str()) else {
        return Ok(None);
    };
    let sidecar = data_path.with_file_name(format!("{stem}_metadata.json"));
    if !sidecar.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(sidecar)?;
    Ok(Some(serde_json::from_str(&text)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn recorder_in(dir: &TempDir) -> Recorder {
        Recorder::new(RecorderSettings {
            data_dir: dir.path().join("runs"),
            ..RecorderSettings::default()
        })
    }

    fn row(elapsed: f64, temperature: Option<f64>) -> MeasurementRecord {
        MeasurementRecord::from_readings(
            elapsed,
            1.5,
            Some(1.49),
            &SensorReadings {
                pressure: Some(1.2),
                temperature,
                flow: Some(1.5),
                level: Some(0.6),
            },
            "step 1",
        )
    }

    #[test]
    fn metadata_block_and_header_precede_rows() {
        let dir = TempDir::new().unwrap();
        let mut recorder = recorder_in(&dir);
        let handle = recorder
            .begin_session(Some(SessionMetadata {
                name: Some("calibration_run".into()),
                description: "two\nlines".into(),
                tags: vec![" flow ".into(), "".into(), "baseline".into()],
                operator: Some("ops".into()),
                start_timestamp: None,
            }))
            .unwrap();
        recorder.append(row(0.0, Some(25.0))).unwrap();
        recorder.end_session().unwrap();

        let name = handle.path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("calibration_run_") && name.ends_with(".csv"));

        let text = std::fs::read_to_string(&handle.path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "# Experiment Metadata");
        assert!(lines.contains(&"# description: two lines"));
        assert!(lines.contains(&"# tags: flow,baseline"));
        let header_at = lines.iter().position(|l| l.starts_with("measurement_id")).unwrap();
        assert_eq!(lines[header_at - 1], "#");
        assert_eq!(lines[header_at], CSV_HEADER.join(","));
        assert_eq!(lines.len(), header_at + 2);

        let sidecar = read_metadata(&handle.path).unwrap().unwrap();
        assert_eq!(sidecar.run_id, handle.run_id);
        assert_eq!(sidecar.metadata.tags, vec!["flow", "baseline"]);
        assert!(sidecar.metadata.start_timestamp.is_some());
    }

    #[test]
    fn append_after_end_fails() {
        let dir = TempDir::new().unwrap();
        let mut recorder = recorder_in(&dir);
        recorder.begin_session(None).unwrap();
        recorder.end_session().unwrap();
        assert!(matches!(
            recorder.append(row(1.0, None)),
            Err(RecorderError::SessionClosed)
        ));
        assert!(recorder.end_session().is_err());
    }

    #[test]
    fn out_of_order_rows_are_rejected_without_writing() {
        let dir = TempDir::new().unwrap();
        let mut recorder = recorder_in(&dir);
        let handle = recorder.begin_session(None).unwrap();
        recorder.append(row(2.0, None)).unwrap();
        recorder.append(row(2.0, None)).unwrap();
        let err = recorder.append(row(1.0, None)).unwrap_err();
        assert!(matches!(err, RecorderError::OutOfOrder { .. }));
        assert_eq!(recorder.record_count(), 2);
        assert_eq!(recorder.last_elapsed(), Some(2.0));

        recorder.end_session().unwrap();
        assert_eq!(read_records(&handle.path, b',').unwrap().len(), 2);
    }

    #[test]
    fn name_collisions_get_a_suffix() {
        let dir = TempDir::new().unwrap();
        let mut recorder = Recorder::new(RecorderSettings {
            data_dir: dir.path().to_path_buf(),
            timestamp_format: "fixed".into(),
            ..RecorderSettings::default()
        });
        let first = recorder.begin_session(None).unwrap();
        recorder.end_session().unwrap();
        let second = recorder.begin_session(None).unwrap();
        recorder.end_session().unwrap();
        assert_eq!(first.path, dir.path().join("experiment_data_fixed.csv"));
        assert_eq!(second.path, dir.path().join("experiment_data_fixed_1.csv"));
    }

    #[test]
    fn invalid_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let mut recorder = recorder_in(&dir);
        let err = recorder
            .begin_session(Some(SessionMetadata::named("bad name!")))
            .unwrap_err();
        assert!(matches!(err, RecorderError::InvalidMetadata(_)));
        assert!(!recorder.is_open());
    }

    #[test]
    fn nulls_round_trip_as_blanks() {
        let dir = TempDir::new().unwrap();
        let mut recorder = Recorder::new(RecorderSettings {
            data_dir: dir.path().to_path_buf(),
            delimiter: b';',
            ..RecorderSettings::default()
        });
        let handle = recorder.begin_session(Some(SessionMetadata::named("nulls"))).unwrap();
        let written = vec![
            recorder.append(row(0.0, None)).unwrap(),
            recorder
                .log_flow_change(0.5, 2.0, None, &SensorReadings::default())
                .unwrap(),
            recorder.append(row(1.0, Some(31.25))).unwrap(),
        ];
        recorder.end_session().unwrap();

        let text = std::fs::read_to_string(&handle.path).unwrap();
        assert!(text.contains("1;0.0;1.5;1.49;1.2;;0.6;step 1;;;"));

        let read = read_records(&handle.path, b';').unwrap();
        assert_eq!(read, written);
        assert_eq!(read[1].step_label, FLOW_UPDATE_LABEL);
        assert_eq!(read[1].measurement_id, 2);
    }
}

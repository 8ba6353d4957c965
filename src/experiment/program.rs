//! Experiment programs and their text syntax.
//!
//! A timed program is written one step per line:
//!
//! ```text
//! # rinse, then sample at 40 °C
//! step 1: flow=2.0, duration=30, valve=rinsing
//! step 2: flow=1.5, duration=120, valve=main, temp=40
//! ```
//!
//! A voltage write program lists targets:
//!
//! ```text
//! set: voltage=1.0
//! reset: voltage=-1.0
//! ```

use crate::error::{RigError, RigResult};
use crate::hardware::capabilities::ValveSelection;
use crate::limits::{
    DEFAULT_CURRENT_LIMIT, DEFAULT_JUMP_SIZE, DEFAULT_SAMPLE_RATE, JUMP_TOLERANCE, MAX_FLOW_RATE,
    SMU_MAX_CURRENT_LIMIT, SMU_MAX_VOLTAGE,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Constant-flow step with a fixed duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedStep {
    /// How long to hold the step (s).
    pub duration_secs: f64,
    /// Pump flow (ml/min).
    pub flow_rate: f64,
    /// Valve path.
    #[serde(default)]
    pub valve: ValveSelection,
    /// Heating plate target (°C), if any.
    pub target_temperature: Option<f64>,
}

/// One target of a voltage write program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoltageTarget {
    /// Name given in the program text.
    pub label: String,
    /// Voltage to reach (V).
    pub voltage: f64,
}

/// Linear I-V sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSpec {
    /// First voltage (V).
    pub start: f64,
    /// Last voltage (V), reached only if it lies on the step grid.
    pub end: f64,
    /// Step magnitude (V), > 0. Direction follows `end - start`.
    pub step: f64,
    /// Compliance current (A).
    pub current_limit: f64,
}

impl SweepSpec {
    /// Reject impossible sweeps.
    pub fn validate(&self) -> RigResult<()> {
        if !(self.step.is_finite() && self.step > 0.0) {
            return Err(RigError::config(format!(
                "sweep step must be > 0, got {}",
                self.step
            )));
        }
        for (name, v) in [("start", self.start), ("end", self.end)] {
            if !v.is_finite() || v.abs() > SMU_MAX_VOLTAGE {
                return Err(RigError::config(format!(
                    "sweep {name} {v} V outside ±{SMU_MAX_VOLTAGE} V"
                )));
            }
        }
        validate_current_limit(self.current_limit)
    }

    /// Voltages visited, from start toward end in steps of `step`.
    pub fn points(&self) -> Vec<f64> {
        let span = self.end - self.start;
        let direction = if span < 0.0 { -1.0 } else { 1.0 };
        let count = (span.abs() / self.step + 1e-9).floor() as usize + 1;
        (0..count)
            .map(|i| self.start + direction * self.step * i as f64)
            .collect()
    }

    /// Source range needed to cover the sweep.
    pub fn voltage_range(&self) -> f64 {
        self.start.abs().max(self.end.abs())
    }
}

fn validate_current_limit(limit: f64) -> RigResult<()> {
    if limit.is_finite() && limit > 0.0 && limit <= SMU_MAX_CURRENT_LIMIT {
        Ok(())
    } else {
        Err(RigError::config(format!(
            "current limit {limit} A outside (0, {SMU_MAX_CURRENT_LIMIT}] A"
        )))
    }
}

/// Settings of a voltage write run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteSettings {
    /// Compliance current (A).
    pub current_limit: f64,
    /// Largest voltage change per jump (V).
    pub jump_size: f64,
    /// Measurements per second.
    pub sample_rate: f64,
}

impl Default for WriteSettings {
    fn default() -> Self {
        Self {
            current_limit: DEFAULT_CURRENT_LIMIT,
            jump_size: DEFAULT_JUMP_SIZE,
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}

impl WriteSettings {
    /// Reject impossible settings.
    pub fn validate(&self) -> RigResult<()> {
        validate_current_limit(self.current_limit)?;
        if !(self.jump_size.is_finite() && self.jump_size > 0.0) {
            return Err(RigError::config(format!(
                "jump size must be > 0, got {}",
                self.jump_size
            )));
        }
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(RigError::config(format!(
                "sample rate must be > 0, got {}",
                self.sample_rate
            )));
        }
        Ok(())
    }
}

/// One step of a program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Step {
    /// Hold a flow for a duration.
    Timed(TimedStep),
    /// Jump the SMU to a voltage.
    VoltageTarget(VoltageTarget),
    /// Run an I-V sweep.
    Sweep(SweepSpec),
}

impl Step {
    /// Whether the step drives the SMU.
    pub fn uses_smu(&self) -> bool {
        !matches!(self, Step::Timed(_))
    }
}

/// Ordered list of steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentProgram {
    /// Steps in execution order.
    pub steps: Vec<Step>,
    /// Settings for `VoltageTarget` steps.
    #[serde(default)]
    pub write: WriteSettings,
}

impl ExperimentProgram {
    /// Program made of timed steps only.
    pub fn timed(steps: Vec<TimedStep>) -> Self {
        Self {
            steps: steps.into_iter().map(Step::Timed).collect(),
            write: WriteSettings::default(),
        }
    }

    /// Check every step before a run starts.
    pub fn validate(&self) -> RigResult<()> {
        if self.steps.is_empty() {
            return Err(RigError::config("program has no steps"));
        }
        for (i, step) in self.steps.iter().enumerate() {
            let n = i + 1;
            match step {
                Step::Timed(t) => {
                    if !(t.duration_secs.is_finite() && t.duration_secs > 0.0) {
                        return Err(RigError::config(format!(
                            "step {n}: duration must be > 0, got {}",
                            t.duration_secs
                        )));
                    }
                    if !(0.0..=MAX_FLOW_RATE).contains(&t.flow_rate) {
                        return Err(RigError::config(format!(
                            "step {n}: flow {} outside [0, {MAX_FLOW_RATE}] ml/min",
                            t.flow_rate
                        )));
                    }
                    if t.target_temperature.is_some_and(|c| !c.is_finite()) {
                        return Err(RigError::config(format!("step {n}: invalid temperature")));
                    }
                }
                Step::VoltageTarget(v) => {
                    if !v.voltage.is_finite() || v.voltage.abs() > SMU_MAX_VOLTAGE {
                        return Err(RigError::config(format!(
                            "step {n}: voltage {} outside ±{SMU_MAX_VOLTAGE} V",
                            v.voltage
                        )));
                    }
                }
                Step::Sweep(s) => s
                    .validate()
                    .map_err(|e| RigError::config(format!("step {n}: {e}")))?,
            }
        }
        if self.steps.iter().any(|s| matches!(s, Step::VoltageTarget(_))) {
            self.write.validate()?;
        }
        Ok(())
    }

    /// Sum of the timed step durations (s).
    pub fn total_duration(&self) -> f64 {
        self.steps
            .iter()
            .map(|s| match s {
                Step::Timed(t) => t.duration_secs,
                _ => 0.0,
            })
            .sum()
    }

    /// Whether any step drives the SMU.
    pub fn uses_smu(&self) -> bool {
        self.steps.iter().any(Step::uses_smu)
    }
}

/// Next voltage on the way from `current` to `target`, at most `jump` away.
pub fn next_jump(current: f64, target: f64, jump: f64) -> f64 {
    let diff = target - current;
    if diff.abs() <= JUMP_TOLERANCE || diff.abs() <= jump {
        target
    } else {
        current + jump * diff.signum()
    }
}

/// Every voltage visited from `start` to `target`, excluding `start`.
pub fn jump_sequence(start: f64, target: f64, jump: f64) -> Vec<f64> {
    let mut visited = Vec::new();
    let mut current = start;
    while (target - current).abs() > JUMP_TOLERANCE {
        current = next_jump(current, target, jump);
        visited.push(current);
    }
    visited
}

/// Parsed program text with any non-fatal warnings.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedProgram {
    /// The program.
    pub program: ExperimentProgram,
    /// Adjustments made while parsing (e.g. clamped flows).
    pub warnings: Vec<String>,
}

fn line_error(line: usize, message: impl std::fmt::Display) -> RigError {
    RigError::config(format!("line {line}: {message}"))
}

fn parse_number(line: usize, key: &str, value: &str) -> RigResult<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| line_error(line, format!("{key}='{value}' is not a number")))
}

/// Parse `step N: flow=..., duration=..., valve=..., temp=...` lines.
///
/// Blank lines and `#` comments are ignored. Flows outside the pump range
/// are clamped with a warning.
pub fn parse_program(text: &str) -> RigResult<ParsedProgram> {
    let mut steps = Vec::new();
    let mut warnings = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (head, body) = line
            .split_once(':')
            .ok_or_else(|| line_error(line_no, "expected 'step N: key=value, ...'"))?;
        let head = head.trim().to_lowercase();
        let number = head
            .strip_prefix("step")
            .map(str::trim)
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| line_error(line_no, format!("expected 'step N', got '{head}'")))?;

        let mut flow = None;
        let mut duration = None;
        let mut valve = ValveSelection::Main;
        let mut temperature = None;
        for pair in body.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| line_error(line_no, format!("expected key=value, got '{pair}'")))?;
            let key = key.trim().to_lowercase();
            match key.as_str() {
                "flow" => flow = Some(parse_number(line_no, &key, value)?),
                "duration" => duration = Some(parse_number(line_no, &key, value)?),
                "valve" => valve = value.parse().map_err(|e| line_error(line_no, e))?,
                "temp" | "temperature" => {
                    temperature = Some(parse_number(line_no, &key, value)?)
                }
                other => return Err(line_error(line_no, format!("unknown key '{other}'"))),
            }
        }

        let flow = flow.ok_or_else(|| line_error(line_no, "missing flow"))?;
        let duration = duration.ok_or_else(|| line_error(line_no, "missing duration"))?;
        if duration <= 0.0 {
            return Err(line_error(line_no, format!("duration must be > 0, got {duration}")));
        }
        let clamped = flow.clamp(0.0, MAX_FLOW_RATE);
        if clamped != flow {
            let message = format!(
                "line {line_no}: step {number} flow {flow} clamped to {clamped} ml/min"
            );
            warn!("{message}");
            warnings.push(message);
        }
        steps.push(TimedStep {
            duration_secs: duration,
            flow_rate: clamped,
            valve,
            target_temperature: temperature,
        });
    }

    if steps.is_empty() {
        return Err(RigError::config("program has no steps"));
    }
    Ok(ParsedProgram {
        program: ExperimentProgram::timed(steps),
        warnings,
    })
}

/// Parse `label: voltage=X` lines.
pub fn parse_write_program(text: &str) -> RigResult<Vec<VoltageTarget>> {
    let mut targets = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (label, body) = line
            .split_once(':')
            .ok_or_else(|| line_error(line_no, "expected 'label: voltage=X'"))?;
        let (key, value) = body
            .split_once('=')
            .ok_or_else(|| line_error(line_no, "expected 'voltage=X'"))?;
        if !key.trim().eq_ignore_ascii_case("voltage") {
            return Err(line_error(line_no, format!("unknown key '{}'", key.trim())));
        }
        let voltage = parse_number(line_no, "voltage", value)?;
        if voltage.abs() > SMU_MAX_VOLTAGE {
            return Err(line_error(
                line_no,
                format!("voltage {voltage} outside ±{SMU_MAX_VOLTAGE} V"),
            ));
        }
        targets.push(VoltageTarget {
            label: label.trim().to_string(),
            voltage,
        });
    }
    if targets.is_empty() {
        return Err(RigError::config("write program has no voltage targets"));
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn sweep(start: f64, end: f64, step: f64) -> SweepSpec {
        SweepSpec {
            start,
            end,
            step,
            current_limit: 0.1,
        }
    }

    #[test]
    fn sweep_points_are_inclusive_in_either_direction() {
        let up = sweep(-2.0, 2.0, 0.5).points();
        assert_eq!(up.len(), 9);
        assert_eq!(up[0], -2.0);
        assert_eq!(up[8], 2.0);

        let down = sweep(1.0, -1.0, 0.5).points();
        assert_eq!(down, vec![1.0, 0.5, 0.0, -0.5, -1.0]);

        // End off the grid is not appended.
        assert_eq!(sweep(0.0, 1.0, 0.3).points().len(), 4);
        assert_eq!(sweep(0.5, 0.5, 0.1).points(), vec![0.5]);
    }

    #[test]
    fn sweep_validation() {
        assert!(sweep(0.0, 1.0, 0.0).validate().is_err());
        assert!(sweep(0.0, 300.0, 1.0).validate().is_err());
        assert!(SweepSpec {
            current_limit: 2.0,
            ..sweep(0.0, 1.0, 0.1)
        }
        .validate()
        .is_err());
        assert!(sweep(0.0, 1.0, 0.1).validate().is_ok());
    }

    #[test]
    fn jumps_never_exceed_jump_size() {
        let visited = jump_sequence(0.0, 1.0, 0.3);
        assert_eq!(visited.len(), 4);
        for (got, want) in visited.iter().zip([0.3, 0.6, 0.9, 1.0]) {
            assert!((got - want).abs() < 1e-9, "{visited:?}");
        }
        assert_eq!(*visited.last().unwrap(), 1.0);

        assert_eq!(jump_sequence(1.0, 0.0, 0.5), vec![0.5, 0.0]);
        assert!(jump_sequence(0.4, 0.4 + 1e-7, 0.1).is_empty());
    }

    #[test]
    fn program_text_parses() {
        let parsed = parse_program(
            "# comment\n\nstep 1: flow=2.0, duration=30, valve=rinsing\nSTEP 2: Flow=1.5, Duration=120, temp=40\n",
        )
        .unwrap();
        assert!(parsed.warnings.is_empty());
        let steps = &parsed.program.steps;
        assert_eq!(steps.len(), 2);
        assert_eq!(
            steps[1],
            Step::Timed(TimedStep {
                duration_secs: 120.0,
                flow_rate: 1.5,
                valve: ValveSelection::Main,
                target_temperature: Some(40.0),
            })
        );
        assert_eq!(parsed.program.total_duration(), 150.0);
    }

    #[test]
    fn out_of_range_flow_is_clamped_with_warning() {
        let parsed = parse_program("step 1: flow=6.0, duration=10").unwrap();
        assert_eq!(parsed.warnings.len(), 1);
        match &parsed.program.steps[0] {
            Step::Timed(t) => assert_eq!(t.flow_rate, MAX_FLOW_RATE),
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn program_errors_carry_line_numbers() {
        let cases = [
            ("step 1: duration=10", "line 1"),
            ("\nstep 1: flow=1", "line 2"),
            ("step 1: flow=1, duration=0", "line 1"),
            ("step 1: flow=1, duration=5, valve=drain", "line 1"),
            ("flow=1, duration=5", "line 1"),
            ("step 1: flow=abc, duration=5", "line 1"),
        ];
        for (text, line) in cases {
            let err = parse_program(text).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration);
            assert!(err.to_string().contains(line), "{text}: {err}");
        }
        assert!(parse_program("# only comments").is_err());
    }

    #[test]
    fn write_program_parses() {
        let targets = parse_write_program("# write\nset: voltage=1.0\nreset: Voltage=-1.5\n").unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[1].label, "reset");
        assert_eq!(targets[1].voltage, -1.5);
        assert!(parse_write_program("# nothing").is_err());
        assert!(parse_write_program("set: current=1").is_err());
    }

    #[test]
    fn program_validation() {
        assert!(ExperimentProgram::default().validate().is_err());
        let bad = ExperimentProgram::timed(vec![TimedStep {
            duration_secs: -1.0,
            flow_rate: 1.0,
            valve: ValveSelection::Main,
            target_temperature: None,
        }]);
        assert!(bad.validate().is_err());
    }
}

//! Experiment engine: runs programs, sweeps and write programs against the
//! [`HardwareFacade`], one run at a time.
//!
//! Every run samples on a fixed cadence. One tick:
//!
//! 1. applies a queued flow change (logged as a `FLOW_UPDATE` row)
//! 2. reads all sensors and evaluates the safety interlocks
//! 3. reads pump telemetry
//! 4. writes the row to the recorder, then the buffers, then publishes it
//!
//! A safety violation, device failure or recorder failure aborts the run:
//! outputs go to their safe state, the session is closed and the engine
//! returns to `Idle` with the reason. An operator stop pauses instead and
//! keeps the session open so the next `start` resumes it.

use super::events::{EngineEvent, EventSender};
use super::program::{next_jump, ExperimentProgram, Step, SweepSpec, TimedStep, VoltageTarget, WriteSettings};
use super::state::{EngineState, EngineStatus, RunKind, StopReason};
use crate::buffers::MeasurementBuffers;
use crate::error::{ErrorKind, RecorderError, RigError, RigResult};
use crate::hardware::capabilities::{Clamped, SmuReading};
use crate::hardware::connection::DeviceId;
use crate::hardware::facade::{HardwareFacade, SensorReadings};
use crate::hardware::reconnect::ReconnectOutcome;
use crate::health::WarningLimiter;
use crate::limits::{
    iv_sample_interval, EVENT_CHANNEL_CAPACITY, JUMP_TOLERANCE, SAMPLE_INTERVAL, SWEEP_SETTLE_DELAY,
};
use crate::recorder::{MeasurementRecord, Recorder, SessionMetadata};
use crate::safety::{SafetyMonitor, SafetyThresholds, SafetyVerdict, ViolationReason};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Engine timing.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Tick period of timed steps.
    pub sample_interval: Duration,
    /// Delay between setting a sweep voltage and measuring.
    pub sweep_settle: Duration,
    /// Capacity of the event channel.
    pub event_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sample_interval: SAMPLE_INTERVAL,
            sweep_settle: SWEEP_SETTLE_DELAY,
            event_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation of one run.
#[derive(Debug, Clone, Default)]
struct CancelFlag {
    inner: Arc<CancelInner>,
}

impl CancelFlag {
    fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`. Returns `true` if cancelled meanwhile.
    async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_cancelled(),
            _ = &mut notified => true,
        }
    }
}

#[derive(Debug)]
struct RunFailure {
    reason: StopReason,
    kind: ErrorKind,
    message: String,
}

impl RunFailure {
    fn safety(reason: ViolationReason) -> Self {
        Self {
            message: reason.to_string(),
            reason: StopReason::SafetyViolation(reason),
            kind: ErrorKind::SafetyViolation,
        }
    }
}

/// Why a run body returned early.
#[derive(Debug)]
enum Interrupt {
    Cancelled,
    Failed(RunFailure),
}

impl From<RigError> for Interrupt {
    fn from(err: RigError) -> Self {
        let reason = match &err {
            RigError::Recorder(e) => StopReason::RecorderFault(e.to_string()),
            other => StopReason::HardwareFault {
                device: other.device(),
                message: other.to_string(),
            },
        };
        Interrupt::Failed(RunFailure {
            reason,
            kind: err.kind(),
            message: err.to_string(),
        })
    }
}

impl From<RecorderError> for Interrupt {
    fn from(err: RecorderError) -> Self {
        RigError::from(err).into()
    }
}

type RunResult<T = ()> = Result<T, Interrupt>;

struct Inner {
    facade: Arc<HardwareFacade>,
    safety: SafetyMonitor,
    recorder: Mutex<Recorder>,
    buffers: Arc<MeasurementBuffers>,
    events: EventSender,
    settings: EngineSettings,
    warnings: WarningLimiter,
    status: RwLock<EngineStatus>,
    state_tx: watch::Sender<EngineState>,
    cancel: Mutex<CancelFlag>,
    task: Mutex<Option<JoinHandle<()>>>,
    pending_flow: Mutex<Option<f64>>,
    metadata: Mutex<Option<SessionMetadata>>,
    base: Mutex<Option<Instant>>,
}

/// Runs experiments. Cheap to clone; clones drive the same engine.
#[derive(Clone)]
pub struct ExperimentEngine {
    inner: Arc<Inner>,
}

impl ExperimentEngine {
    /// Create an engine and the receiving end of its event channel.
    ///
    /// When called inside a Tokio runtime, connectivity changes of the
    /// facade are forwarded as [`EngineEvent::Connectivity`].
    pub fn new(
        facade: Arc<HardwareFacade>,
        thresholds: SafetyThresholds,
        recorder: Recorder,
        settings: EngineSettings,
    ) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (events, rx) = EventSender::channel(settings.event_capacity);
        let (state_tx, _) = watch::channel(EngineState::Idle);

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let mut changes = facade.subscribe_connectivity();
            let events = events.clone();
            runtime.spawn(async move {
                loop {
                    match changes.recv().await {
                        Ok(change) => events.emit(EngineEvent::Connectivity {
                            device: change.device,
                            state: change.state,
                        }),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            debug!(missed, "Connectivity forwarder lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }

        let inner = Inner {
            facade,
            safety: SafetyMonitor::new(thresholds),
            recorder: Mutex::new(recorder),
            buffers: Arc::new(MeasurementBuffers::new()),
            events,
            settings,
            warnings: WarningLimiter::default(),
            status: RwLock::new(EngineStatus::default()),
            state_tx,
            cancel: Mutex::new(CancelFlag::default()),
            task: Mutex::new(None),
            pending_flow: Mutex::new(None),
            metadata: Mutex::new(None),
            base: Mutex::new(None),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Current status.
    pub fn status(&self) -> EngineStatus {
        self.inner.status.read().clone()
    }

    /// Current state.
    pub fn state(&self) -> EngineState {
        self.inner.state()
    }

    /// Live measurement buffers.
    pub fn buffers(&self) -> Arc<MeasurementBuffers> {
        self.inner.buffers.clone()
    }

    /// The hardware this engine drives.
    pub fn facade(&self) -> &Arc<HardwareFacade> {
        &self.inner.facade
    }

    /// Events dropped because the consumer fell behind.
    pub fn dropped_events(&self) -> u64 {
        self.inner.events.dropped()
    }

    /// Metadata for the next session opened by a fresh start.
    pub fn set_session_metadata(&self, metadata: SessionMetadata) {
        *self.inner.metadata.lock() = Some(metadata);
    }

    /// Start a program, or resume the paused session with it.
    pub fn start(&self, program: ExperimentProgram) -> RigResult<()> {
        program.validate()?;
        let kind = RunKind::Program {
            smu: program.uses_smu(),
        };
        let cancel = self.inner.begin_run(kind)?;
        info!(
            steps = program.steps.len(),
            total_secs = program.total_duration(),
            "Program started"
        );
        self.spawn_run(cancel, move |inner, cancel| async move {
            inner.execute_program(&program, &cancel).await
        });
        Ok(())
    }

    /// Start an I-V sweep.
    pub fn run_iv_sweep(&self, spec: SweepSpec) -> RigResult<()> {
        spec.validate()?;
        let cancel = self.inner.begin_run(RunKind::Sweep)?;
        info!(
            start = spec.start,
            end = spec.end,
            step = spec.step,
            points = spec.points().len(),
            "I-V sweep started"
        );
        self.spawn_run(cancel, move |inner, cancel| async move {
            inner.execute_sweep(&spec, &cancel).await
        });
        Ok(())
    }

    /// Walk the SMU through `targets` in jumps of at most `settings.jump_size`.
    pub fn run_iv_write_program(
        &self,
        targets: Vec<VoltageTarget>,
        settings: WriteSettings,
    ) -> RigResult<()> {
        if targets.is_empty() {
            return Err(RigError::config("write program has no voltage targets"));
        }
        settings.validate()?;
        let cancel = self.inner.begin_run(RunKind::WriteProgram)?;
        info!(
            targets = targets.len(),
            jump = settings.jump_size,
            rate = settings.sample_rate,
            "Write program started"
        );
        self.spawn_run(cancel, move |inner, cancel| async move {
            inner.execute_write(&targets, &settings, &cancel).await
        });
        Ok(())
    }

    /// Stop the running run. Outputs go safe and the session stays open.
    ///
    /// Stopping a paused engine changes nothing. Any other state without a
    /// run is rejected with [`RigError::InvalidState`].
    pub async fn stop(&self) -> RigResult<()> {
        if self.inner.state() == EngineState::Paused {
            debug!("Stop requested while already paused");
            return Ok(());
        }
        self.inner.claim(EngineState::can_stop, "stop")?;
        self.inner.cancel.lock().cancel();
        self.inner.join_task().await;

        if self.inner.state() != EngineState::Stopping {
            debug!("Run ended on its own while stopping");
            return Ok(());
        }
        self.inner.shutdown_outputs().await;
        if let Err(err) = self.inner.recorder.lock().flush() {
            warn!(error = %err, "Flush on stop failed");
        }
        self.inner
            .set_state(EngineState::Paused, Some(StopReason::UserStop));
        info!("Run stopped, session kept open");
        Ok(())
    }

    /// Stop any run and close the session. Returns the data file.
    pub async fn finish(&self) -> RigResult<Option<PathBuf>> {
        let previous = self.inner.claim(EngineState::can_finish, "finish")?;
        if previous == EngineState::Running {
            self.inner.cancel.lock().cancel();
            self.inner.join_task().await;
            if self.inner.state() != EngineState::Stopping {
                return Ok(self.inner.status.read().session_path.clone());
            }
        }
        self.inner.shutdown_outputs().await;
        let path = self.inner.close_session();
        self.inner.events.emit(EngineEvent::Completed { path: path.clone() });
        self.inner
            .set_state(EngineState::Idle, Some(StopReason::Finished));
        info!(path = ?path, "Session finished");
        Ok(path)
    }

    /// Change the pump flow. While running, the change is applied on the
    /// next tick; otherwise immediately.
    pub async fn update_flow_rate(&self, ml_per_min: f64) -> RigResult<()> {
        if !ml_per_min.is_finite() {
            return Err(RigError::config(format!(
                "flow rate {ml_per_min} is not a number"
            )));
        }
        if self.state() == EngineState::Running {
            *self.inner.pending_flow.lock() = Some(ml_per_min);
            info!(flow = ml_per_min, "Flow change queued for next tick");
            return Ok(());
        }
        let applied = self.inner.facade.set_flow(ml_per_min).await?;
        self.inner.warn_if_clamped(&applied, "flow rate");
        Ok(())
    }

    /// Reconnect a device in the background.
    ///
    /// Refused while a run is using the device.
    pub fn request_hardware_reconnect(
        &self,
        device: DeviceId,
    ) -> RigResult<JoinHandle<ReconnectOutcome>> {
        let status = self.status();
        if status.state.is_active() {
            if let Some(kind) = status.run_kind.filter(|kind| kind.uses(device)) {
                return Err(RigError::config(format!(
                    "cannot reconnect {device} while a {kind} is running"
                )));
            }
        }
        let facade = self.inner.facade.clone();
        Ok(tokio::spawn(async move { facade.reconnect(device).await }))
    }

    /// Wait until no run is active and return the final status.
    pub async fn wait(&self) -> EngineStatus {
        let mut rx = self.inner.state_tx.subscribe();
        if rx.wait_for(|state| !state.is_active()).await.is_err() {
            debug!("State channel closed while waiting");
        }
        self.status()
    }

    fn spawn_run<F, Fut>(&self, cancel: CancelFlag, body: F)
    where
        F: FnOnce(Arc<Inner>, CancelFlag) -> Fut,
        Fut: Future<Output = RunResult> + Send + 'static,
    {
        let inner = self.inner.clone();
        let run = body(inner.clone(), cancel);
        let handle = tokio::spawn(async move {
            let result = run.await;
            inner.conclude(result).await;
        });
        *self.inner.task.lock() = Some(handle);
    }
}

impl Inner {
    fn state(&self) -> EngineState {
        self.status.read().state
    }

    fn set_state(&self, state: EngineState, reason: Option<StopReason>) {
        {
            let mut status = self.status.write();
            status.state = state;
            if reason.is_some() {
                status.last_reason = reason.clone();
            }
        }
        self.state_tx.send_replace(state);
        info!(state = %state, reason = ?reason.as_ref().map(ToString::to_string), "Engine state changed");
        self.events.emit(EngineEvent::StatusChanged { state, reason });
    }

    /// Move to `Stopping` if `allowed` holds for the current state. Returns
    /// the state it left.
    fn claim(&self, allowed: fn(&EngineState) -> bool, what: &str) -> RigResult<EngineState> {
        let previous = {
            let mut status = self.status.write();
            if !allowed(&status.state) {
                return Err(RigError::InvalidState(format!(
                    "cannot {what} while {}",
                    status.state
                )));
            }
            std::mem::replace(&mut status.state, EngineState::Stopping)
        };
        self.state_tx.send_replace(EngineState::Stopping);
        self.events.emit(EngineEvent::StatusChanged {
            state: EngineState::Stopping,
            reason: None,
        });
        Ok(previous)
    }

    /// Claim `Running` and open or resume the session.
    fn begin_run(&self, kind: RunKind) -> RigResult<CancelFlag> {
        let previous = {
            let mut status = self.status.write();
            if !status.state.can_start() {
                return Err(RigError::InvalidState(format!(
                    "cannot start a {kind} while {}",
                    status.state
                )));
            }
            let previous = status.state;
            status.state = EngineState::Running;
            status.run_kind = Some(kind);
            status.step_index = None;
            status.step_label = None;
            status.last_reason = None;
            previous
        };

        if let Err(err) = self.open_or_resume_session() {
            self.status.write().state = previous;
            return Err(err);
        }

        let cancel = CancelFlag::default();
        *self.cancel.lock() = cancel.clone();
        self.state_tx.send_replace(EngineState::Running);
        self.events.emit(EngineEvent::StatusChanged {
            state: EngineState::Running,
            reason: None,
        });
        Ok(cancel)
    }

    fn open_or_resume_session(&self) -> RigResult<()> {
        let mut recorder = self.recorder.lock();
        if recorder.is_open() {
            let last = recorder.last_elapsed().unwrap_or(0.0);
            let now = Instant::now();
            let base = now
                .checked_sub(Duration::from_secs_f64(last))
                .unwrap_or(now);
            *self.base.lock() = Some(base);
            info!(resume_at = last, "Resuming session");
            return Ok(());
        }

        let metadata = self.metadata.lock().clone();
        let handle = recorder.begin_session(metadata)?;
        self.metadata.lock().take();
        self.buffers.clear();
        self.warnings.reset();
        *self.base.lock() = Some(Instant::now());
        self.status.write().session_path = Some(handle.path);
        Ok(())
    }

    fn elapsed(&self) -> f64 {
        self.base
            .lock()
            .map_or(0.0, |base| base.elapsed().as_secs_f64())
    }

    fn enter_step(&self, index: usize, label: &str) {
        let mut status = self.status.write();
        status.step_index = Some(index);
        status.step_label = Some(label.to_string());
    }

    async fn join_task(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(error = %err, "Run task ended abnormally");
            }
        }
    }

    async fn shutdown_outputs(&self) {
        for err in self.facade.safe_shutdown().await {
            warn!(error = %err, "Output could not be made safe");
        }
    }

    fn close_session(&self) -> Option<PathBuf> {
        *self.base.lock() = None;
        *self.pending_flow.lock() = None;
        let mut recorder = self.recorder.lock();
        if !recorder.is_open() {
            return None;
        }
        if let Err(err) = recorder.flush() {
            warn!(error = %err, "Final flush failed");
        }
        match recorder.end_session() {
            Ok(handle) => Some(handle.path),
            Err(err) => {
                warn!(error = %err, "Could not close session");
                None
            }
        }
    }

    async fn conclude(&self, result: RunResult) {
        match result {
            Ok(()) => {
                self.shutdown_outputs().await;
                let path = self.close_session();
                info!(path = ?path, "Run completed");
                self.events.emit(EngineEvent::Completed { path });
                self.set_state(EngineState::Idle, Some(StopReason::Completed));
            }
            Err(Interrupt::Cancelled) => debug!("Run task cancelled"),
            Err(Interrupt::Failed(failure)) => {
                error!(reason = %failure.reason, "Run aborted");
                self.set_state(EngineState::Stopping, None);
                self.shutdown_outputs().await;
                self.close_session();
                self.events.emit(EngineEvent::Error {
                    kind: failure.kind,
                    message: failure.message,
                });
                self.set_state(EngineState::Idle, Some(failure.reason));
            }
        }
    }

    fn warn(&self, kind: ErrorKind, message: String) {
        warn!(kind = %kind, "{message}");
        self.events.emit(EngineEvent::Warning { kind, message });
    }

    fn warn_if_clamped(&self, clamped: &Clamped<f64>, what: &str) {
        if clamped.was_clamped() {
            self.warn(
                ErrorKind::Configuration,
                format!(
                    "{what} {} clamped to {}",
                    clamped.requested, clamped.applied
                ),
            );
        }
    }

    /// One sampling tick. Returns the stored row.
    async fn sample(
        &self,
        cancel: &CancelFlag,
        label: &str,
        smu: Option<SmuReading>,
        target_voltage: Option<f64>,
        remaining: Option<f64>,
    ) -> RunResult<MeasurementRecord> {
        if cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }

        let pending = self.pending_flow.lock().take();
        let flow_change = match pending {
            Some(requested) => {
                let applied = self.facade.set_flow(requested).await?;
                self.warn_if_clamped(&applied, "flow rate");
                Some(applied.applied)
            }
            None => None,
        };

        let readings = self.facade.read_all_sensors().await?;
        match self.safety.evaluate(&readings) {
            SafetyVerdict::Violation(reason) => {
                return Err(Interrupt::Failed(RunFailure::safety(reason)))
            }
            SafetyVerdict::Ok { unchecked } => {
                for device in unchecked {
                    if let Some(suppressed) = self.warnings.should_emit(device.as_str()) {
                        self.warn(
                            ErrorKind::SensorDisconnected,
                            format!(
                                "{device} has no reading, its interlock is skipped ({suppressed} repeats suppressed)"
                            ),
                        );
                    }
                }
            }
        }

        let pump = self.facade.read_pump_status().await?;
        let elapsed = self.elapsed();
        let mut record = MeasurementRecord::from_readings(
            elapsed,
            self.facade.flow_setpoint(),
            Some(pump.flow),
            &readings,
            label,
        );
        if let Some(reading) = smu {
            record.voltage = Some(reading.voltage);
            record.current = Some(reading.current);
        }
        record.target_voltage = target_voltage;

        let (flow_row, record) = self.write_rows(flow_change, &readings, pump.flow, record)?;
        if let Some(row) = flow_row {
            self.events.emit(EngineEvent::RecordAppended(row));
        }
        self.buffers.push(&record);
        self.events.emit(EngineEvent::RecordAppended(record.clone()));
        self.events.emit(EngineEvent::Progress {
            elapsed,
            remaining,
            readings,
        });
        Ok(record)
    }

    fn write_rows(
        &self,
        flow_change: Option<f64>,
        readings: &SensorReadings,
        pump_flow: f64,
        record: MeasurementRecord,
    ) -> Result<(Option<MeasurementRecord>, MeasurementRecord), RecorderError> {
        let mut recorder = self.recorder.lock();
        let flow_row = match flow_change {
            Some(setpoint) => Some(recorder.log_flow_change(
                record.elapsed,
                setpoint,
                Some(pump_flow),
                readings,
            )?),
            None => None,
        };
        let record = recorder.append(record)?;
        Ok((flow_row, record))
    }

    async fn execute_program(&self, program: &ExperimentProgram, cancel: &CancelFlag) -> RunResult {
        let total = program.total_duration();
        let mut done = 0.0;
        let mut smu_voltage: Option<f64> = None;
        let write_range = program
            .steps
            .iter()
            .filter_map(|step| match step {
                Step::VoltageTarget(target) => Some(target.voltage.abs()),
                _ => None,
            })
            .fold(0.0, f64::max);

        for (index, step) in program.steps.iter().enumerate() {
            let label = format!("step {}", index + 1);
            self.enter_step(index, &label);
            debug!(step = index + 1, "Entering step");
            match step {
                Step::Timed(timed) => {
                    self.run_timed_step(timed, &label, total, done, cancel).await?;
                    done += timed.duration_secs;
                }
                Step::VoltageTarget(target) => {
                    let current = match smu_voltage {
                        Some(v) => v,
                        None => {
                            self.facade
                                .configure_smu_for_iv_sweep(program.write.current_limit, write_range)
                                .await?;
                            self.start_voltage(target.voltage).await
                        }
                    };
                    let reached = self
                        .drive_to(target.voltage, current, &label, &program.write, cancel)
                        .await?;
                    smu_voltage = Some(reached);
                }
                Step::Sweep(spec) => {
                    self.sweep_points(spec, Some(&label), cancel).await?;
                    smu_voltage = None;
                }
            }
        }
        Ok(())
    }

    async fn run_timed_step(
        &self,
        step: &TimedStep,
        label: &str,
        total: f64,
        done_before: f64,
        cancel: &CancelFlag,
    ) -> RunResult {
        self.facade.set_valve_path(step.valve).await?;
        let flow = self.facade.set_flow(step.flow_rate).await?;
        self.warn_if_clamped(&flow, "flow rate");
        self.facade.start_pump().await?;
        if let Some(celsius) = step.target_temperature {
            let applied = self.facade.set_temperature(celsius).await?;
            self.warn_if_clamped(&applied, "plate temperature");
        }

        let step_start = self.elapsed();
        loop {
            let spent = self.elapsed() - step_start;
            let remaining = (total - done_before - spent).max(0.0);
            self.sample(cancel, label, None, None, Some(remaining)).await?;
            if cancel.sleep(self.settings.sample_interval).await {
                return Err(Interrupt::Cancelled);
            }
            if self.elapsed() - step_start >= step.duration_secs - 1e-9 {
                return Ok(());
            }
        }
    }

    async fn execute_sweep(&self, spec: &SweepSpec, cancel: &CancelFlag) -> RunResult {
        self.sweep_points(spec, None, cancel).await
    }

    /// Configure the SMU, visit every sweep point, then turn the output off.
    async fn sweep_points(&self, spec: &SweepSpec, label: Option<&str>, cancel: &CancelFlag) -> RunResult {
        self.facade
            .configure_smu_for_iv_sweep(spec.current_limit, spec.voltage_range())
            .await?;
        let points = spec.points();
        let count = points.len();
        for (i, volts) in points.into_iter().enumerate() {
            let point_label = match label {
                Some(step) => format!("{step} sweep {}/{count}", i + 1),
                None => format!("sweep {}/{count}", i + 1),
            };
            if label.is_none() {
                self.enter_step(i, &point_label);
            }
            self.facade.smu_set_voltage(volts).await?;
            if cancel.sleep(self.settings.sweep_settle).await {
                return Err(Interrupt::Cancelled);
            }
            let reading = self.facade.measure().await?;
            self.sample(cancel, &point_label, Some(reading), None, None)
                .await?;
        }
        self.facade.smu_off().await?;
        Ok(())
    }

    async fn execute_write(
        &self,
        targets: &[VoltageTarget],
        settings: &WriteSettings,
        cancel: &CancelFlag,
    ) -> RunResult {
        let range = targets.iter().map(|t| t.voltage.abs()).fold(0.0, f64::max);
        self.facade
            .configure_smu_for_iv_sweep(settings.current_limit, range)
            .await?;
        let first = targets.first().map_or(0.0, |t| t.voltage);
        let mut current = self.start_voltage(first).await;

        let count = targets.len();
        for (i, target) in targets.iter().enumerate() {
            let label = format!("{}/{count}", i + 1);
            self.enter_step(i, &label);
            info!(target = %target.label, voltage = target.voltage, "Writing target");
            current = self
                .drive_to(target.voltage, current, &label, settings, cancel)
                .await?;
        }
        self.facade.smu_off().await?;
        Ok(())
    }

    /// Measured SMU voltage, or `fallback` when it cannot be read.
    async fn start_voltage(&self, fallback: f64) -> f64 {
        match self.facade.measure().await {
            Ok(reading) if reading.voltage.is_finite() => reading.voltage,
            Ok(_) => fallback,
            Err(err) => {
                warn!(error = %err, "Could not read start voltage");
                fallback
            }
        }
    }

    /// Jump from `current` to `target`, measuring after each jump and once
    /// more at the target. Returns the voltage reached.
    async fn drive_to(
        &self,
        target: f64,
        mut current: f64,
        label: &str,
        settings: &WriteSettings,
        cancel: &CancelFlag,
    ) -> RunResult<f64> {
        let interval = iv_sample_interval(settings.sample_rate);
        while (target - current).abs() > JUMP_TOLERANCE {
            current = next_jump(current, target, settings.jump_size);
            self.facade.smu_set_voltage(current).await?;
            self.measure_and_sample(target, label, interval, cancel)
                .await?;
        }
        self.measure_and_sample(target, label, interval, cancel)
            .await?;
        Ok(current)
    }

    async fn measure_and_sample(
        &self,
        target: f64,
        label: &str,
        interval: Duration,
        cancel: &CancelFlag,
    ) -> RunResult {
        if cancel.sleep(interval).await {
            return Err(Interrupt::Cancelled);
        }
        let reading = self.facade.measure().await?;
        self.sample(cancel, label, Some(reading), Some(target), None)
            .await?;
        Ok(())
    }
}

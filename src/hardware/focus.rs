//! Closed-Loop Focus Controller
//!
//! Combines an [`Amt22`] encoder and an [`L6470`] driver into a focus axis that can be
//! sent to a normalized position in `[0, 1]` of its travel range.
//!
//! # Motion Task
//!
//! `move_to_position` only records the target and makes sure a background task is
//! running; it never waits for the move. The task (one thread, `focus-motion`) loops:
//!
//! 1. Read driver status. Any fault disables the bridges and ends the move as failed.
//! 2. Read the encoder. Transport or checksum errors end the move as failed.
//! 3. Compare with the target: forward, reverse or stop.
//! 4. Refuse to drive further into the safety margin at either end of travel.
//! 5. Stop: soft HiZ and end the move as succeeded. Otherwise (re)issue `Run` only
//!    when the direction changed or the motor has stopped.
//! 6. Sleep `round(1000 / update_rate)` ms (half to even, so above 2000 Hz there is no
//!    pause), then honour a stop request if one arrived.
//!
//! A newer target replaces the old one while the task is running (last write wins).
//! Every task ends with exactly one [`MotionOutcome`], delivered to subscribers and to
//! the completion callback.
//!
//! # Example
//!
//! ```
//! use focus_daq::adapters::SpiBus;
//! use focus_daq::diagnostics::TracingSink;
//! use focus_daq::hardware::amt22::{Amt22, EncoderResolution};
//! use focus_daq::hardware::focus::{FocusController, FocusSettings, MotionOutcome};
//! use focus_daq::hardware::l6470::L6470;
//! use focus_daq::hardware::mock::SimulatedFocuser;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let sim = SimulatedFocuser::new(10, 8).with_step_per_poll(10);
//! let bus = SpiBus::new("sim", sim.clone());
//! let encoder = Amt22::new(&bus, 10, EncoderResolution::Bits14)?;
//! let driver = L6470::new(&bus, 8, 1.8, 1.5)?;
//!
//! let settings = FocusSettings {
//!     lower_bound: 0,
//!     upper_bound: 1000,
//!     safety_threshold: 10,
//!     update_rate_hz: 500,
//!     ..FocusSettings::default()
//! };
//! let focus = FocusController::new(encoder, driver, settings, Arc::new(TracingSink))?;
//!
//! let mut finished = focus.subscribe();
//! focus.move_to_position(0.5, 60.0)?;
//! let outcome = tokio::time::timeout(Duration::from_secs(5), finished.recv()).await??;
//! assert_eq!(outcome, MotionOutcome::Succeeded);
//! assert_eq!(sim.encoder_position(), 500);
//! # Ok(())
//! # }
//! ```

use crate::adapters::{ChannelConfig, SpiBus};
use crate::config::{FocusConfig, FocusDaqConfig};
use crate::diagnostics::DiagnosticSink;
use crate::error::{FocusError, FocusResult};
use crate::hardware::amt22::{Amt22, EncoderResolution};
use crate::hardware::l6470::L6470;
use crate::hardware::l6470_protocol::{MicrostepMode, MotorActivity, MotorDirection};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

const OUTCOME_CHANNEL_CAPACITY: usize = 16;

/// Terminal result of one motion task.
#[derive(Debug, Clone, PartialEq)]
pub enum MotionOutcome {
    /// Target reached, travel limit reached, or stopped on request.
    Succeeded,
    /// The move was abandoned; the motor has been put in HiZ where possible.
    Failed(FocusError),
}

impl MotionOutcome {
    /// Whether the move ended without error.
    pub fn is_success(&self) -> bool {
        matches!(self, MotionOutcome::Succeeded)
    }
}

/// What `dispose` had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposeStatus {
    /// The motion task (if any) stopped on its own.
    Completed,
    /// The motion task ignored the stop request; a soft HiZ was forced.
    TimedOut,
    /// Nothing to do.
    AlreadyDisposed,
}

/// Decision taken on one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionAction {
    /// Drive towards higher encoder ticks.
    Forward,
    /// Drive towards lower encoder ticks.
    Reverse,
    /// Target reached or limit hit.
    Stop,
}

/// Direction needed to get from `current` to `target`.
pub fn desired_action(target: i32, current: i32) -> MotionAction {
    match target.cmp(&current) {
        std::cmp::Ordering::Greater => MotionAction::Forward,
        std::cmp::Ordering::Less => MotionAction::Reverse,
        std::cmp::Ordering::Equal => MotionAction::Stop,
    }
}

/// Pause between loop iterations for a poll rate, rounded half to even.
///
/// Rates of 2000 Hz and above give zero: the loop then polls back to back, paced
/// only by its bus transfers.
pub fn loop_delay(update_rate_hz: u32) -> Duration {
    let ms = (1000.0 / f64::from(update_rate_hz.max(1))).round_ties_even();
    Duration::from_millis(ms as u64)
}

/// Travel range and loop timing of a focus axis.
#[derive(Debug, Clone, PartialEq)]
pub struct FocusSettings {
    /// Encoder tick of normalized position 0
    pub lower_bound: u16,
    /// Encoder tick of normalized position 1
    pub upper_bound: u16,
    /// Ticks kept clear of each bound. Not checked against the range.
    pub safety_threshold: u16,
    /// Loop iterations per second
    pub update_rate_hz: u32,
    /// How long `dispose` waits for the motion task
    pub dispose_timeout: Duration,
}

impl Default for FocusSettings {
    fn default() -> Self {
        Self {
            lower_bound: 0,
            upper_bound: 0x3FFF,
            safety_threshold: 500,
            update_rate_hz: 50,
            dispose_timeout: Duration::from_millis(500),
        }
    }
}

impl From<&FocusConfig> for FocusSettings {
    fn from(config: &FocusConfig) -> Self {
        Self {
            lower_bound: config.lower_bound,
            upper_bound: config.upper_bound,
            safety_threshold: config.safety_threshold,
            update_rate_hz: config.update_rate_hz,
            dispose_timeout: Duration::from_millis(config.dispose_timeout_ms),
        }
    }
}

impl FocusSettings {
    /// Reject an empty travel range or a zero poll rate.
    pub fn validate(&self) -> FocusResult<()> {
        if self.lower_bound >= self.upper_bound {
            return Err(FocusError::Configuration(format!(
                "lower_bound ({}) must be below upper_bound ({})",
                self.lower_bound, self.upper_bound
            )));
        }
        if self.update_rate_hz == 0 {
            return Err(FocusError::Configuration(
                "update_rate_hz must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Encoder tick for a normalized position (clamped to `[0, 1]`), rounded half to
    /// even.
    pub fn denormalize(&self, position: f64) -> i32 {
        let span = f64::from(self.upper_bound) - f64::from(self.lower_bound);
        (position.clamp(0.0, 1.0) * span + f64::from(self.lower_bound)).round_ties_even() as i32
    }

    /// Normalized position of an encoder tick, clamped to `[0, 1]`.
    pub fn normalize(&self, tick: u16) -> f64 {
        let span = f64::from(self.upper_bound) - f64::from(self.lower_bound);
        ((f64::from(tick) - f64::from(self.lower_bound)) / span).clamp(0.0, 1.0)
    }

    /// Replace `action` with `Stop` when it would drive into a safety margin.
    pub fn limit(&self, action: MotionAction, current: i32) -> MotionAction {
        let upper_limit = i32::from(self.upper_bound) - i32::from(self.safety_threshold);
        let lower_limit = i32::from(self.lower_bound) + i32::from(self.safety_threshold);
        match action {
            MotionAction::Forward if current >= upper_limit => MotionAction::Stop,
            MotionAction::Reverse if current <= lower_limit => MotionAction::Stop,
            other => other,
        }
    }
}

struct MotionState {
    target_tick: i32,
    max_rpm: f64,
    /// Bumped on every new target so the task can tell a stale decision.
    generation: u64,
    running: bool,
    stop_requested: bool,
    disposed: bool,
    update_rate_hz: u32,
}

type CompletionCallback = Arc<dyn Fn(&MotionOutcome) + Send + Sync>;

struct Shared {
    encoder: Mutex<Amt22>,
    driver: Mutex<L6470>,
    // Lock order: state before driver / encoder.
    state: Mutex<MotionState>,
    wake: Condvar,
    settings: FocusSettings,
    sink: Arc<dyn DiagnosticSink>,
    outcome_tx: broadcast::Sender<MotionOutcome>,
    callback: Mutex<Option<CompletionCallback>>,
    tasks_started: AtomicU64,
}

/// Closed-loop focus axis.
///
/// Dropping the controller disposes it.
pub struct FocusController {
    shared: Arc<Shared>,
}

impl fmt::Debug for FocusController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FocusController")
            .field("settings", &self.shared.settings)
            .field("is_moving", &self.is_moving())
            .finish()
    }
}

impl FocusController {
    /// Take ownership of an encoder and driver and build the axis.
    ///
    /// # Errors
    /// `FocusError::Configuration` if the settings describe an empty range or a zero
    /// poll rate.
    pub fn new(
        encoder: Amt22,
        driver: L6470,
        settings: FocusSettings,
        sink: Arc<dyn DiagnosticSink>,
    ) -> FocusResult<Self> {
        settings.validate()?;
        let (outcome_tx, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);

        Ok(Self {
            shared: Arc::new(Shared {
                encoder: Mutex::new(encoder),
                driver: Mutex::new(driver),
                state: Mutex::new(MotionState {
                    target_tick: i32::from(settings.lower_bound),
                    max_rpm: 0.0,
                    generation: 0,
                    running: false,
                    stop_requested: false,
                    disposed: false,
                    update_rate_hz: settings.update_rate_hz,
                }),
                wake: Condvar::new(),
                settings,
                sink,
                outcome_tx,
                callback: Mutex::new(None),
                tasks_started: AtomicU64::new(0),
            }),
        })
    }

    /// Open both devices on `bus` as described by `config` and build the axis.
    pub fn open(
        bus: &SpiBus,
        config: &FocusDaqConfig,
        sink: Arc<dyn DiagnosticSink>,
    ) -> FocusResult<Self> {
        let resolution = EncoderResolution::from_bits(config.encoder.resolution_bits)
            .ok_or_else(|| {
                FocusError::Configuration(format!(
                    "unsupported encoder resolution: {} bits",
                    config.encoder.resolution_bits
                ))
            })?;

        let encoder = Amt22::with_config(
            bus,
            ChannelConfig {
                bit_rate_hz: config.encoder.bit_rate_hz,
                ..ChannelConfig::amt22(config.encoder.chip_select)
            },
            resolution,
        )?;
        let driver = L6470::with_config(
            bus,
            ChannelConfig {
                bit_rate_hz: config.driver.bit_rate_hz,
                ..ChannelConfig::l6470(config.driver.chip_select)
            },
            config.driver.step_angle_deg,
            config.driver.max_current_a,
        )?;

        Self::new(encoder, driver, FocusSettings::from(&config.focus), sink)
    }

    /// Send the focus towards `position` (0 = lower bound, 1 = upper bound).
    ///
    /// Out-of-range positions are clamped. Returns immediately; the result arrives
    /// through [`subscribe`](Self::subscribe) or the completion callback. A move
    /// already in progress is retargeted instead of starting a second task.
    ///
    /// # Errors
    /// - `FocusError::InvalidArgument` for a NaN position or a non-positive speed
    /// - `FocusError::Disposed` after `dispose`
    /// - `FocusError::MotionTask` if the task thread could not be spawned
    pub fn move_to_position(&self, position: f64, max_rpm: f64) -> FocusResult<()> {
        if position.is_nan() {
            return Err(FocusError::InvalidArgument(
                "focus position must be a number".to_string(),
            ));
        }
        if !(max_rpm.is_finite() && max_rpm > 0.0) {
            return Err(FocusError::InvalidArgument(format!(
                "max RPM must be positive, got {max_rpm}"
            )));
        }

        let position = position.clamp(0.0, 1.0);
        let target = self.shared.settings.denormalize(position);

        let mut state = self.shared.state.lock();
        if state.disposed {
            return Err(FocusError::Disposed);
        }
        state.target_tick = target;
        state.max_rpm = max_rpm;
        state.generation = state.generation.wrapping_add(1);
        state.stop_requested = false;

        self.shared.sink.info(&format!(
            "Moving focus to {position:.3} (encoder tick {target}) at up to {max_rpm} RPM."
        ));

        if state.running {
            return Ok(());
        }

        let shared = self.shared.clone();
        let spawned = std::thread::Builder::new()
            .name("focus-motion".to_string())
            .spawn(move || run_motion_task(&shared));
        match spawned {
            Ok(_) => {
                state.running = true;
                self.shared.tasks_started.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => Err(FocusError::MotionTask(e.to_string())),
        }
    }

    /// Ask the running move (if any) to stop at its next iteration.
    ///
    /// The move then ends with [`MotionOutcome::Succeeded`]. A later
    /// `move_to_position` cancels a stop that has not been honoured yet.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        if state.running {
            state.stop_requested = true;
            self.shared.wake.notify_all();
        }
    }

    /// Current normalized position, read live from the encoder and clamped to `[0, 1]`.
    pub fn position(&self) -> FocusResult<f64> {
        self.ensure_open()?;
        let tick = self.shared.encoder.lock().position()?;
        Ok(self.shared.settings.normalize(tick))
    }

    /// Microstepping read back from the driver.
    pub fn microstep_mode(&self) -> FocusResult<MicrostepMode> {
        self.ensure_open()?;
        self.shared.driver.lock().microstep_mode()
    }

    /// Change microstepping. This disables the bridges while it runs.
    pub fn set_microstep_mode(&self, mode: MicrostepMode) -> FocusResult<()> {
        self.ensure_open()?;
        self.shared.driver.lock().set_microstep_mode(mode)
    }

    /// Loop iterations per second.
    pub fn encoder_update_rate(&self) -> u32 {
        self.shared.state.lock().update_rate_hz
    }

    /// Change the loop rate. Takes effect on the next iteration.
    ///
    /// # Errors
    /// `FocusError::InvalidArgument` for 0.
    pub fn set_encoder_update_rate(&self, update_rate_hz: u32) -> FocusResult<()> {
        if update_rate_hz == 0 {
            return Err(FocusError::InvalidArgument(
                "encoder update rate must be at least 1 Hz".to_string(),
            ));
        }
        self.shared.state.lock().update_rate_hz = update_rate_hz;
        Ok(())
    }

    /// Receive every future [`MotionOutcome`].
    pub fn subscribe(&self) -> broadcast::Receiver<MotionOutcome> {
        self.shared.outcome_tx.subscribe()
    }

    /// Register a callback run once per finished move, on the motion thread.
    pub fn set_completion_callback<F>(&self, callback: F)
    where
        F: Fn(&MotionOutcome) + Send + Sync + 'static,
    {
        *self.shared.callback.lock() = Some(Arc::new(callback));
    }

    /// Whether a motion task is running.
    pub fn is_moving(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Number of motion tasks started so far.
    pub fn motion_tasks_started(&self) -> u64 {
        self.shared.tasks_started.load(Ordering::SeqCst)
    }

    /// Travel range and timing.
    pub fn settings(&self) -> &FocusSettings {
        &self.shared.settings
    }

    /// Stop any move and release both devices.
    ///
    /// Waits up to the dispose timeout for the motion task. If it is still running
    /// after that (stuck in a bus transfer), the timeout is reported to the
    /// diagnostic sink and a soft HiZ is attempted, giving up if the driver or the
    /// bus stays busy for another timeout. The devices are then released by the
    /// motion task when its transfer returns. So `dispose` returns within twice the
    /// dispose timeout. Never fails; later calls do nothing.
    pub fn dispose(&self) -> DisposeStatus {
        let timeout = self.shared.settings.dispose_timeout;
        let deadline = Instant::now() + timeout;

        let mut state = self.shared.state.lock();
        if state.disposed {
            return DisposeStatus::AlreadyDisposed;
        }
        state.disposed = true;
        state.stop_requested = true;
        self.shared.wake.notify_all();

        while state.running {
            if self.shared.wake.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        let timed_out = state.running;
        drop(state);

        if timed_out {
            self.shared
                .sink
                .error(&FocusError::DisposalTimeout(timeout).to_string());
            self.force_soft_hiz(timeout);
            return DisposeStatus::TimedOut;
        }

        self.shared.release_devices();
        self.shared.sink.debug("Focus controller disposed.");
        DisposeStatus::Completed
    }

    /// Soft HiZ sent past a stuck motion task, bounded by `budget`.
    fn force_soft_hiz(&self, budget: Duration) {
        let deadline = Instant::now() + budget;
        let Some(driver) = self.shared.driver.try_lock_for(budget) else {
            self.shared.sink.error(&format!(
                "Forced soft HiZ skipped: driver still in use after {budget:?}"
            ));
            return;
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if let Err(e) = driver.soft_hiz_within(remaining) {
            self.shared
                .sink
                .error(&format!("Forced soft HiZ failed: {e}"));
        }
    }

    fn ensure_open(&self) -> FocusResult<()> {
        if self.shared.state.lock().disposed {
            Err(FocusError::Disposed)
        } else {
            Ok(())
        }
    }
}

impl Drop for FocusController {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn run_motion_task(shared: &Shared) {
    let outcome = shared.motion_loop();
    if shared.state.lock().disposed {
        // dispose may have given up waiting; it leaves the devices to us.
        shared.release_devices();
    }
    shared.publish(outcome);
}

impl Shared {
    fn motion_loop(&self) -> MotionOutcome {
        loop {
            let (target, max_rpm, generation, delay) = {
                let state = self.state.lock();
                (
                    state.target_tick,
                    state.max_rpm,
                    state.generation,
                    loop_delay(state.update_rate_hz),
                )
            };

            let status = match self.driver.lock().status() {
                Ok(status) => status,
                Err(e) => return self.abort(e),
            };
            if let Some(fault) = status.fault() {
                return self.abort(fault.into());
            }

            let current = match self.encoder.lock().position() {
                Ok(tick) => i32::from(tick),
                Err(e) => return self.abort(e),
            };

            let wanted = desired_action(target, current);
            let action = self.settings.limit(wanted, current);
            if action != wanted {
                self.sink.info(&format!(
                    "Focus at encoder tick {current} is inside the safety margin; stopping."
                ));
            }

            let direction = match action {
                MotionAction::Forward => MotorDirection::Forward,
                MotionAction::Reverse => MotorDirection::Reverse,
                MotionAction::Stop => {
                    let mut state = self.state.lock();
                    if state.generation != generation {
                        // Retargeted since this iteration sampled; keep going.
                        continue;
                    }
                    let result = self.driver.lock().soft_hiz();
                    state.running = false;
                    drop(state);
                    return match result {
                        Ok(()) => {
                            self.sink
                                .info(&format!("Focus stopped at encoder tick {current}."));
                            MotionOutcome::Succeeded
                        }
                        Err(e) => self.report_failure(e),
                    };
                }
            };

            {
                let mut driver = self.driver.lock();
                if driver.direction() != direction || status.activity == MotorActivity::Stopped {
                    driver.set_direction(direction);
                    driver.set_speed_rpm(max_rpm);
                    tracing::debug!(
                        ?direction,
                        max_rpm,
                        current,
                        target,
                        "Starting focus motor"
                    );
                    if let Err(e) = driver.run() {
                        drop(driver);
                        return self.abort(e);
                    }
                }
            }

            let mut state = self.state.lock();
            if !state.stop_requested {
                let _ = self.wake.wait_for(&mut state, delay);
            }
            if state.stop_requested {
                let result = self.driver.lock().soft_hiz();
                state.running = false;
                drop(state);
                return match result {
                    Ok(()) => {
                        self.sink.info("Focus move stopped on request.");
                        MotionOutcome::Succeeded
                    }
                    Err(e) => self.report_failure(e),
                };
            }
        }
    }

    /// Close both channels. Idempotent.
    fn release_devices(&self) {
        self.encoder.lock().close();
        self.driver.lock().close();
    }

    /// End the task after an error: best-effort soft HiZ, then clear the marker.
    fn abort(&self, error: FocusError) -> MotionOutcome {
        if let Err(e) = self.driver.lock().soft_hiz() {
            self.sink
                .error(&format!("Soft HiZ after failure did not go through: {e}"));
        }
        self.state.lock().running = false;
        self.report_failure(error)
    }

    fn report_failure(&self, error: FocusError) -> MotionOutcome {
        self.sink.error(&format!("Focus move failed: {error}"));
        MotionOutcome::Failed(error)
    }

    fn publish(&self, outcome: MotionOutcome) {
        self.wake.notify_all();
        // No subscribers is fine.
        let _ = self.outcome_tx.send(outcome.clone());
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(&outcome);
        }
    }
}

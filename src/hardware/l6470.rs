//! ST L6470 dSPIN Stepper Driver
//!
//! Moves the frames built in [`super::l6470_protocol`] over a shared-bus channel.
//! The device is configured once at construction (overcurrent tier, 1/16
//! microstepping, speed limits, CONFIG) and then driven with `Run` / stop / HiZ
//! commands.
//!
//! # Example Usage
//!
//! ```
//! use focus_daq::adapters::SpiBus;
//! use focus_daq::hardware::l6470::L6470;
//! use focus_daq::hardware::l6470_protocol::MotorDirection;
//! use focus_daq::hardware::mock::SimulatedFocuser;
//!
//! let bus = SpiBus::new("sim", SimulatedFocuser::new(10, 8));
//! let mut driver = L6470::new(&bus, 8, 1.8, 1.5).unwrap();
//!
//! driver.set_speed_rpm(60.0);
//! driver.set_direction(MotorDirection::Forward);
//! driver.run().unwrap();
//! assert!(driver.status().unwrap().busy);
//! driver.soft_hiz().unwrap();
//! ```

use crate::adapters::{ChannelConfig, SpiBus, SpiChannel};
use crate::error::{FocusError, FocusResult};
use crate::hardware::l6470_protocol::{
    acceleration_ticks, decode_absolute_position, full_step_speed_ticks, get_param_frame,
    payload_value, run_frame, run_speed_ticks, set_param_frame, speed_ticks_to_rpm,
    ConfigRegister, DriverStatus, MicrostepMode, MotorDirection, OvercurrentThreshold,
    PwmFrequency, Register, CMD_GET_STATUS, CMD_HARD_HIZ, CMD_HARD_STOP, CMD_SOFT_HIZ,
    CMD_SOFT_STOP,
};
use std::time::{Duration, Instant};

/// MAX_SPEED written at construction: the highest setting.
const DEFAULT_MAX_SPEED: u32 = 0x03FF;
/// Speed above which microstepping is dropped, in RPM.
const DEFAULT_FULL_STEP_SPEED_RPM: f64 = 300.0;
/// Acceleration and deceleration, in RPM/s.
const DEFAULT_ACCELERATION_RPM_S: f64 = 500.0;

const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

/// L6470 stepper driver on one chip select of a shared bus.
#[derive(Debug)]
pub struct L6470 {
    channel: SpiChannel,
    /// Degrees per full step of the attached motor
    step_angle_deg: f64,
    /// Speed used by the next `run()`, in RPM
    speed_rpm: f64,
    /// Direction used by the next `run()`
    direction: MotorDirection,
    config: ConfigRegister,
    settle_timeout: Duration,
}

impl L6470 {
    /// Open and initialise the driver with the standard L6470 bus settings.
    ///
    /// # Arguments
    /// * `bus` - Shared bus the driver is wired to
    /// * `chip_select` - Chip-select line of the driver
    /// * `step_angle_deg` - Degrees per full step of the motor (1.8 for most)
    /// * `max_current_a` - Motor current rating, used to pick the overcurrent tier
    ///
    /// # Errors
    /// Any transport failure while writing the initial registers.
    pub fn new(
        bus: &SpiBus,
        chip_select: u8,
        step_angle_deg: f64,
        max_current_a: f64,
    ) -> FocusResult<Self> {
        Self::with_config(
            bus,
            ChannelConfig::l6470(chip_select),
            step_angle_deg,
            max_current_a,
        )
    }

    /// Open and initialise the driver with custom bus settings.
    pub fn with_config(
        bus: &SpiBus,
        config: ChannelConfig,
        step_angle_deg: f64,
        max_current_a: f64,
    ) -> FocusResult<Self> {
        let mut driver = Self::attach(bus, config, step_angle_deg)?;
        driver.initialize(max_current_a)?;
        Ok(driver)
    }

    /// Open the driver without writing any register.
    ///
    /// For inspecting or stopping a driver that is already configured: STEP_MODE,
    /// speeds and CONFIG keep whatever the device holds. `config()` reports the
    /// default CONFIG until `set_config` is called.
    pub fn attach(bus: &SpiBus, config: ChannelConfig, step_angle_deg: f64) -> FocusResult<Self> {
        if !(step_angle_deg.is_finite() && step_angle_deg > 0.0) {
            return Err(FocusError::InvalidArgument(format!(
                "step angle must be positive, got {step_angle_deg}"
            )));
        }

        let channel = bus.open_channel(config)?;
        Ok(Self {
            channel,
            step_angle_deg,
            speed_rpm: 0.0,
            direction: MotorDirection::Forward,
            config: ConfigRegister::default(),
            settle_timeout: DEFAULT_SETTLE_TIMEOUT,
        })
    }

    fn initialize(&mut self, max_current_a: f64) -> FocusResult<()> {
        self.set_overcurrent_threshold(max_current_a)?;
        // SYNC_EN = 0, SYNC_SEL = 0
        self.set_param(Register::StepMode, u32::from(MicrostepMode::Sixteenth.code()))?;
        self.set_param(Register::MaximumSpeed, DEFAULT_MAX_SPEED)?;
        self.set_full_step_speed(DEFAULT_FULL_STEP_SPEED_RPM)?;
        self.set_acceleration(DEFAULT_ACCELERATION_RPM_S)?;
        self.set_deceleration(DEFAULT_ACCELERATION_RPM_S)?;
        self.set_config(self.config)?;

        tracing::debug!(
            chip_select = self.channel.chip_select(),
            step_angle_deg = self.step_angle_deg,
            max_current_a,
            "L6470 initialised"
        );
        Ok(())
    }

    /// How long `set_microstep_mode` waits for the bridges to disable.
    pub fn with_settle_timeout(mut self, timeout: Duration) -> Self {
        self.settle_timeout = timeout;
        self
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Read and decode the STATUS word. Reading clears the latched fault flags.
    pub fn status(&self) -> FocusResult<DriverStatus> {
        let mut buffer = [CMD_GET_STATUS, 0, 0];
        self.channel.transfer(&mut buffer)?;
        Ok(DriverStatus::from_word(u16::from_be_bytes([
            buffer[1], buffer[2],
        ])))
    }

    /// Run at the configured speed and direction until told otherwise.
    pub fn run(&self) -> FocusResult<()> {
        let ticks = run_speed_ticks(self.speed_rpm, self.step_angle_deg);
        let mut buffer = run_frame(self.direction, ticks);
        tracing::trace!(
            chip_select = self.channel.chip_select(),
            direction = ?self.direction,
            speed_rpm = self.speed_rpm,
            ticks,
            "L6470 run"
        );
        self.channel.transfer(&mut buffer)?;
        Ok(())
    }

    /// Decelerate to a stop and hold position.
    pub fn soft_stop(&self) -> FocusResult<()> {
        self.command(CMD_SOFT_STOP)
    }

    /// Stop immediately and hold position.
    pub fn hard_stop(&self) -> FocusResult<()> {
        self.command(CMD_HARD_STOP)
    }

    /// Decelerate, then put the bridges in high impedance.
    pub fn soft_hiz(&self) -> FocusResult<()> {
        self.command(CMD_SOFT_HIZ)
    }

    /// `soft_hiz` that gives up with `TransportError::BusBusy` if the bus is not
    /// free within `timeout`.
    pub fn soft_hiz_within(&self, timeout: Duration) -> FocusResult<()> {
        let mut buffer = [CMD_SOFT_HIZ];
        self.channel.transfer_within(&mut buffer, timeout)?;
        Ok(())
    }

    /// Put the bridges in high impedance immediately.
    pub fn hard_hiz(&self) -> FocusResult<()> {
        self.command(CMD_HARD_HIZ)
    }

    fn command(&self, command: u8) -> FocusResult<()> {
        let mut buffer = [command];
        self.channel.transfer(&mut buffer)?;
        Ok(())
    }

    /// Change microstepping.
    ///
    /// STEP_MODE can only be written with the bridges disabled, so this issues a
    /// soft HiZ and polls every 10 ms until the driver is neither busy nor driving.
    ///
    /// # Errors
    /// `FocusError::Timeout` if the driver has not settled within the settle timeout.
    pub fn set_microstep_mode(&self, mode: MicrostepMode) -> FocusResult<()> {
        self.soft_hiz()?;

        let deadline = Instant::now() + self.settle_timeout;
        loop {
            let status = self.status()?;
            if !status.busy && !status.bridges_active {
                break;
            }
            if Instant::now() >= deadline {
                return Err(FocusError::Timeout(format!(
                    "driver did not enter HiZ within {:?} before changing step mode",
                    self.settle_timeout
                )));
            }
            std::thread::sleep(SETTLE_POLL_INTERVAL);
        }

        self.set_param(Register::StepMode, u32::from(mode.code()))?;
        tracing::debug!(chip_select = self.channel.chip_select(), ?mode, "Microstep mode set");
        Ok(())
    }

    /// Current microstepping, read back from STEP_MODE.
    pub fn microstep_mode(&self) -> FocusResult<MicrostepMode> {
        let code = self.get_param(Register::StepMode)?;
        Ok(MicrostepMode::from_code(code as u8))
    }

    // ------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------

    /// Read a register. The value is right-aligned to the register width.
    pub fn get_param(&self, register: Register) -> FocusResult<u32> {
        let mut buffer = get_param_frame(register);
        self.channel.transfer(&mut buffer)?;
        Ok(payload_value(&buffer[1..]))
    }

    /// Write a register. Bits above the register width are dropped.
    pub fn set_param(&self, register: Register, value: u32) -> FocusResult<()> {
        let mut buffer = set_param_frame(register, value);
        tracing::trace!(?register, value, "L6470 set_param");
        self.channel.transfer(&mut buffer)?;
        Ok(())
    }

    /// Pick and write the overcurrent tier for a motor rated at `max_current_a`.
    pub fn set_overcurrent_threshold(&self, max_current_a: f64) -> FocusResult<()> {
        let threshold = OvercurrentThreshold::from_max_current(max_current_a);
        self.set_param(Register::OvercurrentThreshold, u32::from(threshold.code()))
    }

    /// Speed above which the driver switches to full steps, in RPM.
    pub fn set_full_step_speed(&self, rpm: f64) -> FocusResult<()> {
        let ticks = full_step_speed_ticks(rpm, self.step_angle_deg);
        self.set_param(Register::FullStepSpeed, u32::from(ticks))
    }

    /// Acceleration in RPM/s.
    pub fn set_acceleration(&self, rpm_per_s: f64) -> FocusResult<()> {
        let ticks = acceleration_ticks(rpm_per_s, self.step_angle_deg);
        self.set_param(Register::Acceleration, u32::from(ticks))
    }

    /// Deceleration in RPM/s.
    pub fn set_deceleration(&self, rpm_per_s: f64) -> FocusResult<()> {
        let ticks = acceleration_ticks(rpm_per_s, self.step_angle_deg);
        self.set_param(Register::Deceleration, u32::from(ticks))
    }

    /// Write the whole CONFIG register.
    pub fn set_config(&mut self, config: ConfigRegister) -> FocusResult<()> {
        self.set_param(Register::Configuration, u32::from(config.bits()))?;
        self.config = config;
        Ok(())
    }

    /// Change the bridge PWM frequency, keeping the rest of CONFIG.
    pub fn set_pwm_frequency(&mut self, frequency: PwmFrequency) -> FocusResult<()> {
        self.set_config(self.config.with_pwm_frequency(frequency))
    }

    /// Last CONFIG value written.
    pub fn config(&self) -> ConfigRegister {
        self.config
    }

    /// Signed microstep count from ABS_POS.
    pub fn absolute_position(&self) -> FocusResult<i32> {
        let raw = self.get_param(Register::AbsolutePosition)?;
        Ok(decode_absolute_position(raw))
    }

    /// Speed the motor is actually turning at, in RPM.
    pub fn current_speed_rpm(&self) -> FocusResult<f64> {
        let ticks = self.get_param(Register::CurrentSpeed)?;
        Ok(speed_ticks_to_rpm(ticks, self.step_angle_deg))
    }

    // ------------------------------------------------------------------
    // Run settings
    // ------------------------------------------------------------------

    /// Speed for the next `run()`, in RPM.
    pub fn set_speed_rpm(&mut self, rpm: f64) {
        self.speed_rpm = rpm;
    }

    /// Speed for the next `run()`, in RPM.
    pub fn speed_rpm(&self) -> f64 {
        self.speed_rpm
    }

    /// Direction for the next `run()`.
    pub fn set_direction(&mut self, direction: MotorDirection) {
        self.direction = direction;
    }

    /// Direction of the last `run()` or the one queued for the next.
    pub fn direction(&self) -> MotorDirection {
        self.direction
    }

    /// Degrees per full step.
    pub fn step_angle_deg(&self) -> f64 {
        self.step_angle_deg
    }

    /// Release the chip select. Idempotent.
    pub fn close(&mut self) {
        self.channel.close();
    }

    /// Whether the underlying channel is still open.
    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{BusCommand, SimulatedFocuser};

    fn open() -> (SimulatedFocuser, L6470) {
        let sim = SimulatedFocuser::new(10, 8);
        let bus = SpiBus::new("sim", sim.clone());
        let driver = L6470::new(&bus, 8, 1.8, 1.5).unwrap();
        (sim, driver)
    }

    #[test]
    fn test_initialisation_writes_defaults() {
        let (sim, _driver) = open();

        assert_eq!(sim.register(Register::OvercurrentThreshold), 3);
        assert_eq!(sim.register(Register::StepMode), 4);
        assert_eq!(sim.register(Register::MaximumSpeed), 0x03FF);
        assert_eq!(sim.register(Register::FullStepSpeed), 66);
        assert_eq!(sim.register(Register::Acceleration), 115);
        assert_eq!(sim.register(Register::Deceleration), 115);
        assert_eq!(sim.register(Register::Configuration), 0x1FA0);
    }

    #[test]
    fn test_run_sends_direction_and_speed() {
        let (sim, mut driver) = open();
        sim.clear_command_log();

        driver.set_speed_rpm(60.0);
        driver.set_direction(MotorDirection::Reverse);
        driver.run().unwrap();

        assert_eq!(
            sim.command_log(),
            vec![BusCommand::Run {
                direction: MotorDirection::Reverse,
                speed_ticks: 13422,
            }]
        );
    }

    #[test]
    fn test_stop_and_hiz_commands() {
        let (sim, driver) = open();
        sim.clear_command_log();

        driver.soft_stop().unwrap();
        driver.hard_stop().unwrap();
        driver.soft_hiz().unwrap();
        driver.hard_hiz().unwrap();

        assert_eq!(
            sim.command_log(),
            vec![
                BusCommand::SoftStop,
                BusCommand::HardStop,
                BusCommand::SoftHiZ,
                BusCommand::HardHiZ,
            ]
        );
    }

    #[test]
    fn test_set_microstep_mode_waits_for_hiz() {
        let (sim, mut driver) = open();
        driver.set_speed_rpm(30.0);
        driver.run().unwrap();
        sim.clear_command_log();

        driver.set_microstep_mode(MicrostepMode::Quarter).unwrap();

        let log = sim.command_log();
        assert_eq!(log.first(), Some(&BusCommand::SoftHiZ));
        assert!(log.contains(&BusCommand::GetStatus));
        assert_eq!(
            log.last(),
            Some(&BusCommand::SetParam(Register::StepMode, 0b010))
        );
        assert_eq!(driver.microstep_mode().unwrap(), MicrostepMode::Quarter);
    }

    #[test]
    fn test_set_microstep_mode_times_out() {
        let (sim, driver) = open();
        let driver = driver.with_settle_timeout(Duration::from_millis(50));
        sim.set_stuck_busy(true);

        let err = driver.set_microstep_mode(MicrostepMode::Half).unwrap_err();
        assert!(matches!(err, FocusError::Timeout(_)));
        assert_eq!(sim.register(Register::StepMode), 4);
    }

    #[test]
    fn test_pwm_frequency_keeps_other_config_bits() {
        let (sim, mut driver) = open();
        driver.set_pwm_frequency(PwmFrequency::Khz19_531).unwrap();
        assert_eq!(sim.register(Register::Configuration), 0x03A0);
    }

    #[test]
    fn test_attach_leaves_registers_alone() {
        let sim = SimulatedFocuser::new(10, 8);
        let bus = SpiBus::new("sim", sim.clone());
        {
            let driver = L6470::new(&bus, 8, 1.8, 1.5).unwrap();
            driver.set_microstep_mode(MicrostepMode::Quarter).unwrap();
        }
        sim.clear_command_log();

        let driver = L6470::attach(&bus, ChannelConfig::l6470(8), 1.8).unwrap();

        assert!(sim.command_log().is_empty());
        assert_eq!(driver.microstep_mode().unwrap(), MicrostepMode::Quarter);
        assert_eq!(sim.register(Register::StepMode), u32::from(MicrostepMode::Quarter.code()));
    }

    #[test]
    fn test_soft_hiz_within_on_idle_bus() {
        let (sim, driver) = open();
        sim.clear_command_log();

        driver.soft_hiz_within(Duration::from_millis(50)).unwrap();

        assert_eq!(sim.command_log(), vec![BusCommand::SoftHiZ]);
    }

    #[test]
    fn test_rejects_invalid_step_angle() {
        let bus = SpiBus::new("sim", SimulatedFocuser::new(10, 8));
        let err = L6470::new(&bus, 8, 0.0, 1.0).unwrap_err();
        assert!(matches!(err, FocusError::InvalidArgument(_)));
        assert!(!bus.is_claimed(8));
    }
}

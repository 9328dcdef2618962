//! ST L6470 dSPIN Wire Protocol
//!
//! Reference: L6470 datasheet DocID16737 Rev 9
//!
//! Protocol Overview:
//! - Transport: SPI mode 3, up to 5 MHz (run at 4 MHz here)
//! - Command byte first, then the payload or response bytes, MSB first
//! - Registers are 8, 16 or 24 bits wide; narrower fields are right-aligned
//!
//! This module holds everything that is pure data: register table, command bytes,
//! status-word decoding, bit-field enums and the RPM / current conversions. The
//! device type in [`super::l6470`] only moves these bytes over a channel.
//!
//! Every bit-field enum maps to its wire value through an explicit `match`, never
//! through its declaration order.

use crate::error::DriverFault;
use serde::{Deserialize, Serialize};

/// `GetStatus`: returns the 16-bit status word and clears the latched flags.
pub const CMD_GET_STATUS: u8 = 0b1101_0000;
/// `Run`: low bit is the direction, followed by a 20-bit speed.
pub const CMD_RUN: u8 = 0b0101_0000;
/// `SoftStop`: decelerate to zero and hold.
pub const CMD_SOFT_STOP: u8 = 0b1011_0000;
/// `HardStop`: stop immediately and hold.
pub const CMD_HARD_STOP: u8 = 0b1011_1000;
/// `SoftHiZ`: decelerate, then disable the bridges.
pub const CMD_SOFT_HIZ: u8 = 0b1010_0000;
/// `HardHiZ`: disable the bridges immediately.
pub const CMD_HARD_HIZ: u8 = 0b1010_1000;
/// `GetParam`: OR'd with the 5-bit register address.
pub const CMD_GET_PARAM: u8 = 0b0010_0000;
/// `SetParam`: OR'd with the 5-bit register address.
pub const CMD_SET_PARAM: u8 = 0b0000_0000;

const REGISTER_ADDRESS_MASK: u8 = 0b0001_1111;

/// Largest value of the 20-bit `Run` speed field.
pub const MAX_RUN_SPEED_TICKS: u32 = 0xF_FFFF;
/// Largest value of the 10-bit `FS_SPD` field.
pub const MAX_FULL_STEP_SPEED_TICKS: u16 = 0x03FF;
/// Largest value of the 12-bit `ACC` / `DEC` fields.
pub const MAX_ACCELERATION_TICKS: u16 = 0x0FFF;

/// Value width of a register on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterWidth {
    /// One payload byte
    Bits8,
    /// Two payload bytes
    Bits16,
    /// Three payload bytes
    Bits24,
}

impl RegisterWidth {
    /// Number of payload bytes following the command byte.
    pub fn byte_count(self) -> usize {
        match self {
            RegisterWidth::Bits8 => 1,
            RegisterWidth::Bits16 => 2,
            RegisterWidth::Bits24 => 3,
        }
    }

    /// Largest value that fits in the payload.
    pub fn max_value(self) -> u32 {
        match self {
            RegisterWidth::Bits8 => 0xFF,
            RegisterWidth::Bits16 => 0xFFFF,
            RegisterWidth::Bits24 => 0xFF_FFFF,
        }
    }
}

/// Addressable driver registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    /// ABS_POS, 22-bit two's complement microstep count
    AbsolutePosition,
    /// EL_POS
    ElectricalPosition,
    /// MARK
    MarkPosition,
    /// SPEED, read-only
    CurrentSpeed,
    /// ACC
    Acceleration,
    /// DEC
    Deceleration,
    /// MAX_SPEED
    MaximumSpeed,
    /// MIN_SPEED
    MinimumSpeed,
    /// KVAL_HOLD
    HoldingKVal,
    /// KVAL_RUN
    ConstantSpeedKVal,
    /// KVAL_ACC
    AccelerationStartingKVal,
    /// KVAL_DEC
    DecelerationStartingKVal,
    /// INT_SPEED
    IntersectSpeed,
    /// ST_SLP
    StartSlope,
    /// FN_SLP_ACC
    AccelerationFinalSlope,
    /// FN_SLP_DEC
    DecelerationFinalSlope,
    /// K_THERM
    ThermalCompensationFactor,
    /// ADC_OUT, read-only
    AdcOutput,
    /// OCD_TH
    OvercurrentThreshold,
    /// STALL_TH
    StallThreshold,
    /// FS_SPD
    FullStepSpeed,
    /// STEP_MODE
    StepMode,
    /// ALARM_EN
    AlarmEnables,
    /// CONFIG
    Configuration,
    /// STATUS, read-only
    Status,
}

impl Register {
    /// Every register, in address order.
    pub const ALL: [Register; 25] = [
        Register::AbsolutePosition,
        Register::ElectricalPosition,
        Register::MarkPosition,
        Register::CurrentSpeed,
        Register::Acceleration,
        Register::Deceleration,
        Register::MaximumSpeed,
        Register::MinimumSpeed,
        Register::HoldingKVal,
        Register::ConstantSpeedKVal,
        Register::AccelerationStartingKVal,
        Register::DecelerationStartingKVal,
        Register::IntersectSpeed,
        Register::StartSlope,
        Register::AccelerationFinalSlope,
        Register::DecelerationFinalSlope,
        Register::ThermalCompensationFactor,
        Register::AdcOutput,
        Register::OvercurrentThreshold,
        Register::StallThreshold,
        Register::FullStepSpeed,
        Register::StepMode,
        Register::AlarmEnables,
        Register::Configuration,
        Register::Status,
    ];

    /// 5-bit register address.
    pub fn address(self) -> u8 {
        match self {
            Register::AbsolutePosition => 0x01,
            Register::ElectricalPosition => 0x02,
            Register::MarkPosition => 0x03,
            Register::CurrentSpeed => 0x04,
            Register::Acceleration => 0x05,
            Register::Deceleration => 0x06,
            Register::MaximumSpeed => 0x07,
            Register::MinimumSpeed => 0x08,
            Register::HoldingKVal => 0x09,
            Register::ConstantSpeedKVal => 0x0A,
            Register::AccelerationStartingKVal => 0x0B,
            Register::DecelerationStartingKVal => 0x0C,
            Register::IntersectSpeed => 0x0D,
            Register::StartSlope => 0x0E,
            Register::AccelerationFinalSlope => 0x0F,
            Register::DecelerationFinalSlope => 0x10,
            Register::ThermalCompensationFactor => 0x11,
            Register::AdcOutput => 0x12,
            Register::OvercurrentThreshold => 0x13,
            Register::StallThreshold => 0x14,
            Register::FullStepSpeed => 0x15,
            Register::StepMode => 0x16,
            Register::AlarmEnables => 0x17,
            Register::Configuration => 0x18,
            Register::Status => 0x19,
        }
    }

    /// Width of the register value on the wire.
    pub fn width(self) -> RegisterWidth {
        match self {
            Register::AbsolutePosition
            | Register::MarkPosition
            | Register::CurrentSpeed => RegisterWidth::Bits24,
            Register::ElectricalPosition
            | Register::Acceleration
            | Register::Deceleration
            | Register::MaximumSpeed
            | Register::MinimumSpeed
            | Register::IntersectSpeed
            | Register::FullStepSpeed
            | Register::Configuration
            | Register::Status => RegisterWidth::Bits16,
            Register::HoldingKVal
            | Register::ConstantSpeedKVal
            | Register::AccelerationStartingKVal
            | Register::DecelerationStartingKVal
            | Register::StartSlope
            | Register::AccelerationFinalSlope
            | Register::DecelerationFinalSlope
            | Register::ThermalCompensationFactor
            | Register::AdcOutput
            | Register::OvercurrentThreshold
            | Register::StallThreshold
            | Register::StepMode
            | Register::AlarmEnables => RegisterWidth::Bits8,
        }
    }

    /// Look a register up by its 5-bit address.
    pub fn from_address(address: u8) -> Option<Register> {
        Register::ALL
            .into_iter()
            .find(|register| register.address() == address & REGISTER_ADDRESS_MASK)
    }
}

/// Frame for `GetParam(register)`: command byte plus zeroed response slots.
pub fn get_param_frame(register: Register) -> Vec<u8> {
    let mut frame = vec![0u8; 1 + register.width().byte_count()];
    frame[0] = CMD_GET_PARAM | register.address();
    frame
}

/// Frame for `SetParam(register, value)`. Bits above the register width are dropped.
pub fn set_param_frame(register: Register, value: u32) -> Vec<u8> {
    let count = register.width().byte_count();
    let mut frame = Vec::with_capacity(1 + count);
    frame.push(CMD_SET_PARAM | register.address());
    for i in (0..count).rev() {
        frame.push((value >> (8 * i)) as u8);
    }
    frame
}

/// Assemble the MSB-first payload that follows the command byte.
pub fn payload_value(payload: &[u8]) -> u32 {
    payload
        .iter()
        .fold(0u32, |acc, &byte| (acc << 8) | u32::from(byte))
}

/// Frame for `Run(direction, speed)`. The speed is clamped to 20 bits.
pub fn run_frame(direction: MotorDirection, speed_ticks: u32) -> [u8; 4] {
    let speed = speed_ticks.min(MAX_RUN_SPEED_TICKS);
    [
        CMD_RUN | direction.bit(),
        (speed >> 16) as u8,
        (speed >> 8) as u8,
        speed as u8,
    ]
}

/// Microstep subdivision, written to the STEP_SEL field of STEP_MODE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MicrostepMode {
    /// Full step
    Full,
    /// 1/2 step
    Half,
    /// 1/4 microstep
    Quarter,
    /// 1/8 microstep
    Eighth,
    /// 1/16 microstep
    Sixteenth,
    /// 1/32 microstep
    ThirtySecond,
    /// 1/64 microstep
    SixtyFourth,
    /// 1/128 microstep
    OneTwentyEighth,
}

impl MicrostepMode {
    /// 3-bit STEP_SEL code.
    pub fn code(self) -> u8 {
        match self {
            MicrostepMode::Full => 0b000,
            MicrostepMode::Half => 0b001,
            MicrostepMode::Quarter => 0b010,
            MicrostepMode::Eighth => 0b011,
            MicrostepMode::Sixteenth => 0b100,
            MicrostepMode::ThirtySecond => 0b101,
            MicrostepMode::SixtyFourth => 0b110,
            MicrostepMode::OneTwentyEighth => 0b111,
        }
    }

    /// Decode STEP_SEL (bits 2..0 of STEP_MODE); the SYNC bits are ignored.
    pub fn from_code(code: u8) -> MicrostepMode {
        match code & 0b111 {
            0b000 => MicrostepMode::Full,
            0b001 => MicrostepMode::Half,
            0b010 => MicrostepMode::Quarter,
            0b011 => MicrostepMode::Eighth,
            0b100 => MicrostepMode::Sixteenth,
            0b101 => MicrostepMode::ThirtySecond,
            0b110 => MicrostepMode::SixtyFourth,
            _ => MicrostepMode::OneTwentyEighth,
        }
    }

    /// Microsteps per full step.
    pub fn microsteps(self) -> u16 {
        1 << self.code()
    }

    /// Parse the divisor form used on the command line ("1", "2", ... "128").
    pub fn from_microsteps(microsteps: u16) -> Option<MicrostepMode> {
        (0..8u8)
            .map(MicrostepMode::from_code)
            .find(|mode| mode.microsteps() == microsteps)
    }
}

/// Bridge PWM frequency with the 16 MHz internal oscillator.
///
/// The 6-bit code is `F_PWM_INT` (bits 5..3) and `F_PWM_DEC` (bits 2..0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum PwmFrequency {
    Khz2_790,
    Khz3_255,
    Khz3_348,
    Khz3_906,
    Khz4_464,
    Khz4_557,
    Khz4_688,
    Khz4_883,
    Khz5_208,
    Khz5_469,
    Khz5_580,
    Khz5_859,
    Khz6_250,
    Khz6_510,
    Khz6_696,
    Khz6_836,
    Khz7_813,
    Khz8_929,
    Khz9_115,
    Khz9_375,
    Khz9_766,
    Khz10_417,
    Khz10_938,
    Khz11_719,
    Khz12_500,
    Khz13_021,
    Khz13_672,
    Khz15_625,
    Khz18_229,
    Khz19_531,
    Khz20_833,
    Khz23_438,
    Khz27_344,
    Khz31_250,
    Khz39_063,
    Khz46_875,
    Khz54_688,
    Khz62_500,
}

impl PwmFrequency {
    /// 6-bit `F_PWM_INT | F_PWM_DEC` code.
    pub fn code(self) -> u8 {
        match self {
            PwmFrequency::Khz2_790 => 0b110000,
            PwmFrequency::Khz3_255 => 0b101000,
            PwmFrequency::Khz3_348 => 0b110001,
            PwmFrequency::Khz3_906 => 0b100000,
            PwmFrequency::Khz4_464 => 0b110011,
            PwmFrequency::Khz4_557 => 0b101010,
            PwmFrequency::Khz4_688 => 0b100001,
            PwmFrequency::Khz4_883 => 0b011000,
            PwmFrequency::Khz5_208 => 0b101011,
            PwmFrequency::Khz5_469 => 0b100010,
            PwmFrequency::Khz5_580 => 0b110100,
            PwmFrequency::Khz5_859 => 0b011001,
            PwmFrequency::Khz6_250 => 0b100011,
            PwmFrequency::Khz6_510 => 0b010000,
            PwmFrequency::Khz6_696 => 0b110101,
            PwmFrequency::Khz6_836 => 0b011010,
            PwmFrequency::Khz7_813 => 0b010001,
            PwmFrequency::Khz8_929 => 0b110111,
            PwmFrequency::Khz9_115 => 0b010010,
            PwmFrequency::Khz9_375 => 0b100101,
            PwmFrequency::Khz9_766 => 0b001000,
            PwmFrequency::Khz10_417 => 0b010011,
            PwmFrequency::Khz10_938 => 0b100110,
            PwmFrequency::Khz11_719 => 0b001001,
            PwmFrequency::Khz12_500 => 0b100111,
            PwmFrequency::Khz13_021 => 0b010100,
            PwmFrequency::Khz13_672 => 0b001010,
            PwmFrequency::Khz15_625 => 0b001011,
            PwmFrequency::Khz18_229 => 0b010110,
            PwmFrequency::Khz19_531 => 0b000000,
            PwmFrequency::Khz20_833 => 0b010111,
            PwmFrequency::Khz23_438 => 0b000001,
            PwmFrequency::Khz27_344 => 0b000010,
            PwmFrequency::Khz31_250 => 0b000011,
            PwmFrequency::Khz39_063 => 0b000100,
            PwmFrequency::Khz46_875 => 0b000101,
            PwmFrequency::Khz54_688 => 0b000110,
            PwmFrequency::Khz62_500 => 0b000111,
        }
    }
}

/// Output slew rate, the POW_SR field of CONFIG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlewRate {
    /// 320 V/µs
    Standard,
    /// 75 V/µs
    Low,
    /// 110 V/µs
    Medium,
    /// 260 V/µs, best torque at speed
    MaxTorque,
}

impl SlewRate {
    /// 2-bit POW_SR code.
    pub fn code(self) -> u8 {
        match self {
            SlewRate::Standard => 0b00,
            SlewRate::Low => 0b01,
            SlewRate::Medium => 0b10,
            SlewRate::MaxTorque => 0b11,
        }
    }
}

/// Overcurrent detection threshold: tier `i` trips at `0.375 * (i + 1)` A.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OvercurrentThreshold(u8);

impl OvercurrentThreshold {
    const STEP_A: f64 = 0.375;
    const MAX_TIER: u8 = 15;

    /// Lowest tier whose threshold is at least `max_current_a`.
    ///
    /// Requests under 0.375 A get tier 0 and requests over 6 A get tier 15; the
    /// driver cannot protect or drive outside that range.
    pub fn from_max_current(max_current_a: f64) -> Self {
        let tier = (0..=Self::MAX_TIER)
            .find(|&i| Self::STEP_A * f64::from(i + 1) >= max_current_a)
            .unwrap_or(Self::MAX_TIER);
        Self(tier)
    }

    /// Tier index, the raw OCD_TH value.
    pub fn code(self) -> u8 {
        self.0
    }

    /// Trip current in amps.
    pub fn amps(self) -> f64 {
        Self::STEP_A * f64::from(self.0 + 1)
    }
}

/// Rotation direction, the low bit of `Run` and bit 4 of STATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotorDirection {
    /// DIR = 0
    Reverse,
    /// DIR = 1
    Forward,
}

impl MotorDirection {
    /// Wire bit.
    pub fn bit(self) -> u8 {
        match self {
            MotorDirection::Reverse => 0,
            MotorDirection::Forward => 1,
        }
    }

    fn from_bit(bit: bool) -> Self {
        if bit {
            MotorDirection::Forward
        } else {
            MotorDirection::Reverse
        }
    }
}

/// MOT_STATUS field of STATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorActivity {
    /// 00
    Stopped,
    /// 01
    Accelerating,
    /// 10
    Decelerating,
    /// 11
    ConstantSpeed,
}

impl MotorActivity {
    /// 2-bit MOT_STATUS code.
    pub fn code(self) -> u8 {
        match self {
            MotorActivity::Stopped => 0b00,
            MotorActivity::Accelerating => 0b01,
            MotorActivity::Decelerating => 0b10,
            MotorActivity::ConstantSpeed => 0b11,
        }
    }

    fn from_code(code: u8) -> Self {
        match code & 0b11 {
            0b00 => MotorActivity::Stopped,
            0b01 => MotorActivity::Accelerating,
            0b10 => MotorActivity::Decelerating,
            _ => MotorActivity::ConstantSpeed,
        }
    }
}

// STATUS bit positions.
const SCK_MOD: u16 = 15;
const STEP_LOSS_B: u16 = 14;
const STEP_LOSS_A: u16 = 13;
const OCD: u16 = 12;
const TH_SD: u16 = 11;
const TH_WRN: u16 = 10;
const UVLO: u16 = 9;
const WRONG_CMD: u16 = 8;
const NOTPERF_CMD: u16 = 7;
const MOT_STATUS: u16 = 5;
const DIR: u16 = 4;
const SW_EVN: u16 = 3;
const SW_F: u16 = 2;
const BUSY: u16 = 1;
const HIZ: u16 = 0;

/// Decoded STATUS word, with each flag already converted to "true means the condition
/// is present".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverStatus {
    /// Step-clock mode is active (bit 15, active high)
    pub step_clock_mode: bool,
    /// Bridge B lost steps (bit 14, active low)
    pub bridge_b_stalled: bool,
    /// Bridge A lost steps (bit 13, active low)
    pub bridge_a_stalled: bool,
    /// Overcurrent detected (bit 12, active low)
    pub overcurrent: bool,
    /// Thermal shutdown (bit 11, active low)
    pub thermal_shutdown: bool,
    /// Thermal warning (bit 10, active low)
    pub thermal_warning: bool,
    /// Undervoltage lockout (bit 9, active low)
    pub undervoltage: bool,
    /// Last command was not recognised (bit 8, active high)
    pub unknown_command: bool,
    /// Last command could not be performed (bit 7, active high)
    pub last_command_failed: bool,
    /// Motor activity (bits 6..5)
    pub activity: MotorActivity,
    /// Current direction (bit 4)
    pub direction: MotorDirection,
    /// Switch turn-on event latched (bit 3, active high)
    pub kill_switch_triggered: bool,
    /// Switch input is closed (bit 2, high = closed)
    pub kill_switch_active: bool,
    /// A positioning command is executing (bit 1, active low)
    pub busy: bool,
    /// Bridges are enabled; bit 0 is HiZ, so this is its inverse
    pub bridges_active: bool,
}

impl DriverStatus {
    /// Decode a raw STATUS word.
    pub fn from_word(word: u16) -> Self {
        let bit = |n: u16| (word >> n) & 1 == 1;
        Self {
            step_clock_mode: bit(SCK_MOD),
            bridge_b_stalled: !bit(STEP_LOSS_B),
            bridge_a_stalled: !bit(STEP_LOSS_A),
            overcurrent: !bit(OCD),
            thermal_shutdown: !bit(TH_SD),
            thermal_warning: !bit(TH_WRN),
            undervoltage: !bit(UVLO),
            unknown_command: bit(WRONG_CMD),
            last_command_failed: bit(NOTPERF_CMD),
            activity: MotorActivity::from_code((word >> MOT_STATUS) as u8),
            direction: MotorDirection::from_bit(bit(DIR)),
            kill_switch_triggered: bit(SW_EVN),
            kill_switch_active: bit(SW_F),
            busy: !bit(BUSY),
            bridges_active: !bit(HIZ),
        }
    }

    /// Re-encode into the raw STATUS word, applying each bit's polarity.
    pub fn to_word(&self) -> u16 {
        let set = |on: bool, n: u16| u16::from(on) << n;
        set(self.step_clock_mode, SCK_MOD)
            | set(!self.bridge_b_stalled, STEP_LOSS_B)
            | set(!self.bridge_a_stalled, STEP_LOSS_A)
            | set(!self.overcurrent, OCD)
            | set(!self.thermal_shutdown, TH_SD)
            | set(!self.thermal_warning, TH_WRN)
            | set(!self.undervoltage, UVLO)
            | set(self.unknown_command, WRONG_CMD)
            | set(self.last_command_failed, NOTPERF_CMD)
            | (u16::from(self.activity.code()) << MOT_STATUS)
            | (u16::from(self.direction.bit()) << DIR)
            | set(self.kill_switch_triggered, SW_EVN)
            | set(self.kill_switch_active, SW_F)
            | set(!self.busy, BUSY)
            | set(!self.bridges_active, HIZ)
    }

    /// First fault present, checked in the order A stall, B stall, overcurrent,
    /// thermal shutdown, undervoltage. Thermal warning is not a fault.
    pub fn fault(&self) -> Option<DriverFault> {
        if self.bridge_a_stalled {
            Some(DriverFault::BridgeAStalled)
        } else if self.bridge_b_stalled {
            Some(DriverFault::BridgeBStalled)
        } else if self.overcurrent {
            Some(DriverFault::Overcurrent)
        } else if self.thermal_shutdown {
            Some(DriverFault::ThermalShutdown)
        } else if self.undervoltage {
            Some(DriverFault::Undervoltage)
        } else {
            None
        }
    }
}

/// CONFIG register contents. Defaults match what the driver is initialised with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigRegister {
    /// EN_VSCOMP, bit 5
    pub voltage_compensation: bool,
    /// OC_SD, bit 7
    pub overcurrent_shutdown: bool,
    /// POW_SR, bits 9..8
    pub slew_rate: SlewRate,
    /// F_PWM_INT / F_PWM_DEC, bits 15..10
    pub pwm_frequency: PwmFrequency,
}

impl Default for ConfigRegister {
    fn default() -> Self {
        Self {
            voltage_compensation: true,
            overcurrent_shutdown: true,
            slew_rate: SlewRate::MaxTorque,
            pwm_frequency: PwmFrequency::Khz62_500,
        }
    }
}

impl ConfigRegister {
    /// Set EN_VSCOMP.
    pub fn with_voltage_compensation(mut self, enabled: bool) -> Self {
        self.voltage_compensation = enabled;
        self
    }

    /// Set OC_SD.
    pub fn with_overcurrent_shutdown(mut self, enabled: bool) -> Self {
        self.overcurrent_shutdown = enabled;
        self
    }

    /// Set POW_SR.
    pub fn with_slew_rate(mut self, slew_rate: SlewRate) -> Self {
        self.slew_rate = slew_rate;
        self
    }

    /// Set the PWM frequency.
    pub fn with_pwm_frequency(mut self, pwm_frequency: PwmFrequency) -> Self {
        self.pwm_frequency = pwm_frequency;
        self
    }

    /// Register value. OSC_SEL / EXT_CLK stay 0 (16 MHz internal) and SW_MODE stays 0
    /// (hard stop on switch).
    pub fn bits(&self) -> u16 {
        (u16::from(self.voltage_compensation) << 5)
            | (u16::from(self.overcurrent_shutdown) << 7)
            | (u16::from(self.slew_rate.code()) << 8)
            | (u16::from(self.pwm_frequency.code()) << 10)
    }
}

fn steps_per_second(rpm: f64, step_angle_deg: f64) -> f64 {
    let steps_per_rev = 360.0 / step_angle_deg;
    rpm / 60.0 * steps_per_rev
}

/// Round half to even, then saturate to `[0, max]`.
fn to_ticks(value: f64, max: u32) -> u32 {
    // NaN falls through the clamp and casts to 0.
    value.round_ties_even().clamp(0.0, f64::from(max)) as u32
}

/// `Run` speed field for `rpm`: `round(steps/s * 67.108864 + 0.5)`, 20 bits.
pub fn run_speed_ticks(rpm: f64, step_angle_deg: f64) -> u32 {
    let sps = steps_per_second(rpm, step_angle_deg);
    to_ticks(sps * 67.108864 + 0.5, MAX_RUN_SPEED_TICKS)
}

/// FS_SPD field for `rpm`: `round(steps/s * 0.065536)`, 10 bits.
pub fn full_step_speed_ticks(rpm: f64, step_angle_deg: f64) -> u16 {
    let sps = steps_per_second(rpm, step_angle_deg);
    to_ticks(sps * 0.065536, u32::from(MAX_FULL_STEP_SPEED_TICKS)) as u16
}

/// ACC / DEC field for `rpm_per_s`: `round(steps/s² * 0.068719476736 + 0.5)`, 12 bits.
pub fn acceleration_ticks(rpm_per_s: f64, step_angle_deg: f64) -> u16 {
    let sps = steps_per_second(rpm_per_s, step_angle_deg);
    to_ticks(sps * 0.068719476736 + 0.5, u32::from(MAX_ACCELERATION_TICKS)) as u16
}

/// Convert a SPEED register reading back to RPM.
pub fn speed_ticks_to_rpm(ticks: u32, step_angle_deg: f64) -> f64 {
    let sps = f64::from(ticks) / 67.108864;
    sps * 60.0 * step_angle_deg / 360.0
}

/// Sign-extend the 22-bit ABS_POS value.
pub fn decode_absolute_position(raw: u32) -> i32 {
    ((raw << 10) as i32) >> 10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_every_word() {
        for word in 0..=u16::MAX {
            assert_eq!(DriverStatus::from_word(word).to_word(), word);
        }
    }

    #[test]
    fn test_status_polarity() {
        // All active-low flags high, nothing latched, bridges in HiZ, not busy.
        let idle = DriverStatus::from_word(0b0111_1110_0000_0011);
        assert_eq!(idle.fault(), None);
        assert!(!idle.busy);
        assert!(!idle.bridges_active);
        assert!(!idle.thermal_warning);
        assert_eq!(idle.activity, MotorActivity::Stopped);
        assert_eq!(idle.direction, MotorDirection::Reverse);

        let running = DriverStatus::from_word(0b0111_1110_0111_0000);
        assert!(running.busy);
        assert!(running.bridges_active);
        assert_eq!(running.activity, MotorActivity::ConstantSpeed);
        assert_eq!(running.direction, MotorDirection::Forward);
    }

    #[test]
    fn test_fault_priority() {
        let healthy = 0b0111_1110_0000_0011u16;

        let both_stalled = healthy & !(1 << 13) & !(1 << 14);
        assert_eq!(
            DriverStatus::from_word(both_stalled).fault(),
            Some(DriverFault::BridgeAStalled)
        );

        let b_and_uvlo = healthy & !(1 << 14) & !(1 << 9);
        assert_eq!(
            DriverStatus::from_word(b_and_uvlo).fault(),
            Some(DriverFault::BridgeBStalled)
        );

        assert_eq!(
            DriverStatus::from_word(healthy & !(1 << 12)).fault(),
            Some(DriverFault::Overcurrent)
        );
        assert_eq!(
            DriverStatus::from_word(healthy & !(1 << 11)).fault(),
            Some(DriverFault::ThermalShutdown)
        );
        assert_eq!(
            DriverStatus::from_word(healthy & !(1 << 9)).fault(),
            Some(DriverFault::Undervoltage)
        );
        assert_eq!(DriverStatus::from_word(healthy & !(1 << 10)).fault(), None);
    }

    #[test]
    fn test_register_table() {
        for register in Register::ALL {
            assert_eq!(Register::from_address(register.address()), Some(register));
        }
        assert_eq!(Register::from_address(0x00), None);
        assert_eq!(Register::from_address(0x1A), None);

        assert_eq!(Register::AbsolutePosition.width(), RegisterWidth::Bits24);
        assert_eq!(Register::CurrentSpeed.width(), RegisterWidth::Bits24);
        assert_eq!(Register::Configuration.width(), RegisterWidth::Bits16);
        assert_eq!(Register::StepMode.width(), RegisterWidth::Bits8);
        assert_eq!(Register::Status.address(), 0x19);
    }

    #[test]
    fn test_frames_are_msb_first() {
        assert_eq!(
            set_param_frame(Register::Configuration, 0x1FA0),
            vec![0x18, 0x1F, 0xA0]
        );
        assert_eq!(
            set_param_frame(Register::MarkPosition, 0x12_3456),
            vec![0x03, 0x12, 0x34, 0x56]
        );
        assert_eq!(set_param_frame(Register::StepMode, 0x104), vec![0x16, 0x04]);
        assert_eq!(get_param_frame(Register::Status), vec![0x39, 0x00, 0x00]);
        assert_eq!(payload_value(&[0x12, 0x34, 0x56]), 0x12_3456);
    }

    #[test]
    fn test_run_frame() {
        assert_eq!(
            run_frame(MotorDirection::Forward, 0x0346E),
            [0x51, 0x00, 0x34, 0x6E]
        );
        assert_eq!(
            run_frame(MotorDirection::Reverse, u32::MAX),
            [0x50, 0x0F, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_conversions_for_1_8_degree_motor() {
        assert_eq!(full_step_speed_ticks(300.0, 1.8), 66);
        assert_eq!(acceleration_ticks(500.0, 1.8), 115);
        assert_eq!(run_speed_ticks(60.0, 1.8), 13422);
        assert!((speed_ticks_to_rpm(13422, 1.8) - 60.0).abs() < 0.01);
    }

    #[test]
    fn test_conversions_round_half_to_even() {
        // 0.5 exactly: rounds down to the even neighbour.
        assert_eq!(run_speed_ticks(0.0, 1.8), 0);
        assert_eq!(acceleration_ticks(0.0, 1.8), 0);
        assert_eq!(full_step_speed_ticks(2.288818359375, 1.8), 0);
        // 1.5 exactly: rounds up to 2.
        assert_eq!(full_step_speed_ticks(3.0 * 2.288818359375, 1.8), 2);
    }

    #[test]
    fn test_conversions_saturate_and_clamp() {
        assert_eq!(full_step_speed_ticks(1_000_000.0, 1.8), 0x3FF);
        assert_eq!(acceleration_ticks(1_000_000.0, 1.8), 0xFFF);
        assert_eq!(run_speed_ticks(1_000_000.0, 1.8), 0xFFFFF);

        assert_eq!(full_step_speed_ticks(-10.0, 1.8), 0);
        assert_eq!(run_speed_ticks(-10.0, 1.8), 0);
        assert_eq!(acceleration_ticks(f64::NAN, 1.8), 0);
    }

    #[test]
    fn test_conversions_monotonic() {
        let mut last = (0, 0, 0);
        for rpm in 0..5000 {
            let rpm = f64::from(rpm) * 0.7;
            let now = (
                run_speed_ticks(rpm, 1.8),
                full_step_speed_ticks(rpm, 1.8),
                acceleration_ticks(rpm, 1.8),
            );
            assert!(now.0 >= last.0 && now.1 >= last.1 && now.2 >= last.2);
            last = now;
        }
    }

    #[test]
    fn test_overcurrent_tiers() {
        assert_eq!(OvercurrentThreshold::from_max_current(1.5).code(), 3);
        assert_eq!(OvercurrentThreshold::from_max_current(0.1).code(), 0);
        assert_eq!(OvercurrentThreshold::from_max_current(10.0).code(), 15);
        assert_eq!(OvercurrentThreshold::from_max_current(0.376).code(), 1);
        assert_eq!(OvercurrentThreshold::from_max_current(6.0).code(), 15);
        assert!((OvercurrentThreshold::from_max_current(1.5).amps() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_config_register_default() {
        assert_eq!(ConfigRegister::default().bits(), 0x1FA0);
        let quiet = ConfigRegister::default()
            .with_slew_rate(SlewRate::Standard)
            .with_pwm_frequency(PwmFrequency::Khz19_531)
            .with_voltage_compensation(false);
        assert_eq!(quiet.bits(), 0x0080);
        assert_eq!(
            ConfigRegister::default()
                .with_overcurrent_shutdown(false)
                .bits(),
            0x1F20
        );
    }

    #[test]
    fn test_microstep_codes() {
        assert_eq!(MicrostepMode::Sixteenth.code(), 4);
        assert_eq!(MicrostepMode::Sixteenth.microsteps(), 16);
        assert_eq!(MicrostepMode::from_code(0xF4), MicrostepMode::Sixteenth);
        assert_eq!(
            MicrostepMode::from_microsteps(128),
            Some(MicrostepMode::OneTwentyEighth)
        );
        assert_eq!(MicrostepMode::from_microsteps(3), None);
    }

    #[test]
    fn test_absolute_position_sign_extension() {
        assert_eq!(decode_absolute_position(0x00_0010), 16);
        assert_eq!(decode_absolute_position(0x3F_FFFF), -1);
        assert_eq!(decode_absolute_position(0x20_0000), -2_097_152);
    }
}

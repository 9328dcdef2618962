//! Simulated Focuser Hardware
//!
//! Provides a simulated SPI bus carrying one AMT22 encoder and one L6470 driver, for
//! testing and for running `focusctl --simulate` without the instrument attached.
//!
//! The simulator decodes the real wire bytes of both protocols, so everything above
//! [`BusBackend`] runs unmodified against it.
//!
//! # Simulated Mechanism
//!
//! - The focus shaft moves `step_per_poll` encoder ticks each time the driver is
//!   polled with `GetStatus` while a `Run` is active (forward = increasing ticks)
//! - Position is clamped to the 14-bit encoder range
//! - `SoftHiZ` / `HardHiZ` stop the shaft and disable the bridges immediately
//!
//! # Failure Injection
//!
//! - Driver faults, latched until the next `GetStatus` reports them
//! - Encoder checksum corruption for the next N reads
//! - Transfer failures for the next N transfers on a chip select
//! - Slow transfers (a fixed delay inside every exchange)
//! - A driver that never leaves the busy state

use crate::adapters::{BusBackend, ChannelConfig};
use crate::error::{DriverFault, TransportError};
use crate::hardware::amt22::{encode_response, CMD_READ_POSITION, CMD_RESET, CMD_SET_ZERO};
use crate::hardware::l6470_protocol::{
    decode_absolute_position, payload_value, DriverStatus, MotorActivity, MotorDirection,
    Register, CMD_GET_PARAM, CMD_GET_STATUS, CMD_HARD_HIZ, CMD_HARD_STOP, CMD_RUN,
    CMD_SOFT_HIZ, CMD_SOFT_STOP,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

const ENCODER_MAX: i32 = 0x3FFF;
const ABS_POS_MASK: u32 = 0x3F_FFFF;
/// Entries kept by the command log before the oldest are dropped.
pub const DEFAULT_LOG_CAPACITY: usize = 4096;

/// One decoded exchange, as recorded in the command log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusCommand {
    /// Encoder position read
    EncoderRead,
    /// Encoder reset
    EncoderReset,
    /// Encoder set-zero
    EncoderSetZero,
    /// Driver `GetStatus`
    GetStatus,
    /// Driver `Run`
    Run {
        /// Direction bit of the command
        direction: MotorDirection,
        /// 20-bit speed field
        speed_ticks: u32,
    },
    /// Driver `SoftStop`
    SoftStop,
    /// Driver `HardStop`
    HardStop,
    /// Driver `SoftHiZ`
    SoftHiZ,
    /// Driver `HardHiZ`
    HardHiZ,
    /// Driver `GetParam`
    GetParam(Register),
    /// Driver `SetParam` with the value as written
    SetParam(Register, u32),
    /// Anything the simulator did not recognise: command byte and raw bytes
    Unknown(u8, Vec<u8>),
}

struct SimState {
    encoder_position: i32,
    step_per_poll: i32,
    registers: HashMap<Register, u32>,
    absolute_position: i32,
    running: bool,
    hiz: bool,
    direction: MotorDirection,
    speed_ticks: u32,
    latched_fault: Option<DriverFault>,
    stuck_busy: bool,
    corrupt_reads: u32,
    failing_transfers: HashMap<u8, u32>,
    transfer_delay: Duration,
    log: CommandLog,
}

/// Most recent exchanges, oldest first.
struct CommandLog {
    entries: VecDeque<BusCommand>,
    capacity: usize,
}

impl CommandLog {
    fn push(&mut self, command: BusCommand) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(command);
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Simulated encoder + driver pair on one bus.
///
/// Cloning shares the simulation, so a test can keep a handle while the bus owns
/// another.
///
/// # Example
///
/// ```
/// use focus_daq::adapters::SpiBus;
/// use focus_daq::hardware::mock::SimulatedFocuser;
///
/// let sim = SimulatedFocuser::new(10, 8).with_step_per_poll(4);
/// sim.set_encoder_position(2000);
/// let bus = SpiBus::new("sim", sim.clone());
/// assert_eq!(sim.encoder_position(), 2000);
/// ```
#[derive(Clone)]
pub struct SimulatedFocuser {
    encoder_cs: u8,
    driver_cs: u8,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedFocuser {
    /// Create a simulator with the encoder at tick 0 and the driver in HiZ.
    ///
    /// # Arguments
    /// * `encoder_cs` - Chip select the encoder answers on
    /// * `driver_cs` - Chip select the driver answers on
    pub fn new(encoder_cs: u8, driver_cs: u8) -> Self {
        Self {
            encoder_cs,
            driver_cs,
            state: Arc::new(Mutex::new(SimState {
                encoder_position: 0,
                step_per_poll: 1,
                registers: HashMap::new(),
                absolute_position: 0,
                running: false,
                hiz: true,
                direction: MotorDirection::Forward,
                speed_ticks: 0,
                latched_fault: None,
                stuck_busy: false,
                corrupt_reads: 0,
                failing_transfers: HashMap::new(),
                transfer_delay: Duration::ZERO,
                log: CommandLog {
                    entries: VecDeque::new(),
                    capacity: DEFAULT_LOG_CAPACITY,
                },
            })),
        }
    }

    /// Encoder ticks moved per driver poll while running.
    pub fn with_step_per_poll(self, ticks: u16) -> Self {
        self.state.lock().step_per_poll = i32::from(ticks);
        self
    }

    /// Keep at most `capacity` log entries. Zero turns logging off.
    pub fn with_log_capacity(self, capacity: usize) -> Self {
        {
            let mut state = self.state.lock();
            state.log.capacity = capacity;
            while state.log.entries.len() > capacity {
                state.log.entries.pop_front();
            }
        }
        self
    }

    /// Place the shaft at a raw 14-bit encoder position.
    pub fn set_encoder_position(&self, ticks: u16) {
        self.state.lock().encoder_position = i32::from(ticks).min(ENCODER_MAX);
    }

    /// Raw 14-bit encoder position.
    pub fn encoder_position(&self) -> u16 {
        self.state.lock().encoder_position as u16
    }

    /// Last value written to a register (0 if never written).
    pub fn register(&self, register: Register) -> u32 {
        self.state
            .lock()
            .registers
            .get(&register)
            .copied()
            .unwrap_or(0)
    }

    /// Whether a `Run` is active.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Whether the bridges are in high impedance.
    pub fn is_hiz(&self) -> bool {
        self.state.lock().hiz
    }

    /// Latch a fault; the next `GetStatus` reports it and clears it.
    pub fn inject_fault(&self, fault: DriverFault) {
        self.state.lock().latched_fault = Some(fault);
    }

    /// Flip a data bit in the next `count` encoder responses.
    pub fn corrupt_next_encoder_reads(&self, count: u32) {
        self.state.lock().corrupt_reads = count;
    }

    /// Fail the next `count` transfers on `chip_select`.
    pub fn fail_next_transfers(&self, chip_select: u8, count: u32) {
        self.state
            .lock()
            .failing_transfers
            .insert(chip_select, count);
    }

    /// Delay every transfer by `delay` while holding the bus.
    pub fn set_transfer_delay(&self, delay: Duration) {
        self.state.lock().transfer_delay = delay;
    }

    /// Keep the driver reporting busy with active bridges.
    pub fn set_stuck_busy(&self, stuck: bool) {
        self.state.lock().stuck_busy = stuck;
    }

    /// Decoded exchanges since creation or the last clear, up to the log capacity.
    pub fn command_log(&self) -> Vec<BusCommand> {
        self.state.lock().log.entries.iter().cloned().collect()
    }

    /// Empty the command log.
    pub fn clear_command_log(&self) {
        self.state.lock().log.clear();
    }

    fn encoder_exchange(state: &mut SimState, buffer: &mut [u8]) {
        if buffer.len() != 2 {
            let first = buffer.first().copied().unwrap_or_default();
            state.log.push(BusCommand::Unknown(first, buffer.to_vec()));
            buffer.fill(0xFF);
            return;
        }
        let command = buffer[1];

        // The device answers every exchange with its position.
        let mut word = encode_response(state.encoder_position as u16);
        if state.corrupt_reads > 0 {
            state.corrupt_reads -= 1;
            word ^= 0x0001;
        }

        match command {
            CMD_READ_POSITION => state.log.push(BusCommand::EncoderRead),
            CMD_RESET => state.log.push(BusCommand::EncoderReset),
            CMD_SET_ZERO => {
                state.encoder_position = 0;
                state.log.push(BusCommand::EncoderSetZero);
            }
            other => state
                .log
                .push(BusCommand::Unknown(other, buffer.to_vec())),
        }

        buffer.copy_from_slice(&word.to_be_bytes());
    }

    fn driver_exchange(state: &mut SimState, buffer: &mut [u8]) {
        let Some(&command) = buffer.first() else {
            return;
        };

        match command {
            CMD_GET_STATUS if buffer.len() == 3 => {
                state.advance();
                let word = state.status().to_word();
                state.latched_fault = None;
                buffer[1..].copy_from_slice(&word.to_be_bytes());
                state.log.push(BusCommand::GetStatus);
            }
            c if c & 0xFE == CMD_RUN && buffer.len() == 4 => {
                let direction = if c & 1 == 1 {
                    MotorDirection::Forward
                } else {
                    MotorDirection::Reverse
                };
                let speed_ticks = payload_value(&buffer[1..]);
                state.running = true;
                state.hiz = false;
                state.direction = direction;
                state.speed_ticks = speed_ticks;
                state.log.push(BusCommand::Run {
                    direction,
                    speed_ticks,
                });
            }
            CMD_SOFT_STOP | CMD_HARD_STOP => {
                state.running = false;
                state.hiz = false;
                state.log.push(if command == CMD_SOFT_STOP {
                    BusCommand::SoftStop
                } else {
                    BusCommand::HardStop
                });
            }
            CMD_SOFT_HIZ | CMD_HARD_HIZ => {
                state.running = false;
                state.hiz = true;
                state.log.push(if command == CMD_SOFT_HIZ {
                    BusCommand::SoftHiZ
                } else {
                    BusCommand::HardHiZ
                });
            }
            c if c & 0xE0 == CMD_GET_PARAM => match Register::from_address(c) {
                Some(register) if buffer.len() == 1 + register.width().byte_count() => {
                    let value = state.read_register(register);
                    let count = buffer.len() - 1;
                    for (i, byte) in buffer[1..].iter_mut().enumerate() {
                        *byte = (value >> (8 * (count - 1 - i))) as u8;
                    }
                    state.log.push(BusCommand::GetParam(register));
                }
                _ => state
                    .log
                    .push(BusCommand::Unknown(c, buffer.to_vec())),
            },
            c if c & 0xE0 == 0 && c != 0 => match Register::from_address(c) {
                Some(register) if buffer.len() == 1 + register.width().byte_count() => {
                    let value = payload_value(&buffer[1..]);
                    state.write_register(register, value);
                    state.log.push(BusCommand::SetParam(register, value));
                }
                _ => state
                    .log
                    .push(BusCommand::Unknown(c, buffer.to_vec())),
            },
            other => state
                .log
                .push(BusCommand::Unknown(other, buffer.to_vec())),
        }
    }
}

impl SimState {
    fn advance(&mut self) {
        if !self.running {
            return;
        }
        let step = match self.direction {
            MotorDirection::Forward => self.step_per_poll,
            MotorDirection::Reverse => -self.step_per_poll,
        };
        self.encoder_position = (self.encoder_position + step).clamp(0, ENCODER_MAX);
        self.absolute_position = decode_absolute_position(
            (self.absolute_position.wrapping_add(step) as u32) & ABS_POS_MASK,
        );
    }

    fn status(&self) -> DriverStatus {
        let fault = self.latched_fault;
        DriverStatus {
            step_clock_mode: false,
            bridge_b_stalled: fault == Some(DriverFault::BridgeBStalled),
            bridge_a_stalled: fault == Some(DriverFault::BridgeAStalled),
            overcurrent: fault == Some(DriverFault::Overcurrent),
            thermal_shutdown: fault == Some(DriverFault::ThermalShutdown),
            thermal_warning: false,
            undervoltage: fault == Some(DriverFault::Undervoltage),
            unknown_command: false,
            last_command_failed: false,
            activity: if self.running {
                MotorActivity::ConstantSpeed
            } else {
                MotorActivity::Stopped
            },
            direction: self.direction,
            kill_switch_triggered: false,
            kill_switch_active: false,
            busy: self.running || self.stuck_busy,
            bridges_active: !self.hiz || self.stuck_busy,
        }
    }

    fn read_register(&self, register: Register) -> u32 {
        match register {
            Register::Status => u32::from(self.status().to_word()),
            Register::AbsolutePosition => (self.absolute_position as u32) & ABS_POS_MASK,
            Register::CurrentSpeed if self.running => self.speed_ticks,
            Register::CurrentSpeed => 0,
            other => self.registers.get(&other).copied().unwrap_or(0),
        }
    }

    fn write_register(&mut self, register: Register, value: u32) {
        let value = value & register.width().max_value();
        if register == Register::AbsolutePosition {
            self.absolute_position = decode_absolute_position(value & ABS_POS_MASK);
        }
        self.registers.insert(register, value);
    }
}

impl BusBackend for SimulatedFocuser {
    fn claim(&mut self, config: &ChannelConfig) -> Result<(), TransportError> {
        if config.chip_select == self.encoder_cs || config.chip_select == self.driver_cs {
            Ok(())
        } else {
            Err(TransportError::Endpoint {
                chip_select: config.chip_select,
                message: "no simulated device on this chip select".to_string(),
            })
        }
    }

    fn transfer(
        &mut self,
        config: &ChannelConfig,
        buffer: &mut [u8],
    ) -> Result<(), TransportError> {
        let delay = self.state.lock().transfer_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = self.state.lock();
        if let Some(remaining) = state.failing_transfers.get_mut(&config.chip_select) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Transfer {
                    chip_select: config.chip_select,
                    message: "Input/output error (5)".to_string(),
                });
            }
        }

        if config.chip_select == self.encoder_cs {
            Self::encoder_exchange(&mut state, buffer);
        } else if config.chip_select == self.driver_cs {
            Self::driver_exchange(&mut state, buffer);
        }
        Ok(())
    }

    fn release(&mut self, _chip_select: u8) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SpiBus;
    use crate::hardware::amt22::{Amt22, EncoderResolution};
    use crate::hardware::l6470::L6470;

    #[test]
    fn test_shaft_moves_while_running() {
        let sim = SimulatedFocuser::new(10, 8).with_step_per_poll(5);
        sim.set_encoder_position(100);
        let bus = SpiBus::new("sim", sim.clone());
        let mut driver = L6470::new(&bus, 8, 1.8, 1.0).unwrap();
        let encoder = Amt22::new(&bus, 10, EncoderResolution::Bits14).unwrap();

        driver.set_speed_rpm(30.0);
        driver.set_direction(MotorDirection::Reverse);
        driver.run().unwrap();
        driver.status().unwrap();
        driver.status().unwrap();
        assert_eq!(encoder.position().unwrap(), 90);
        assert_eq!(driver.absolute_position().unwrap(), -10);

        driver.soft_hiz().unwrap();
        driver.status().unwrap();
        assert_eq!(encoder.position().unwrap(), 90);
        assert!(sim.is_hiz());
    }

    #[test]
    fn test_command_log_keeps_newest_entries() {
        let sim = SimulatedFocuser::new(10, 8).with_log_capacity(3);
        let bus = SpiBus::new("sim", sim.clone());
        let driver = L6470::attach(&bus, ChannelConfig::l6470(8), 1.8).unwrap();

        for _ in 0..10 {
            driver.status().unwrap();
        }
        driver.soft_stop().unwrap();
        driver.hard_hiz().unwrap();

        assert_eq!(
            sim.command_log(),
            vec![
                BusCommand::GetStatus,
                BusCommand::SoftStop,
                BusCommand::HardHiZ,
            ]
        );
    }

    #[test]
    fn test_zero_log_capacity_records_nothing() {
        let sim = SimulatedFocuser::new(10, 8).with_log_capacity(0);
        let bus = SpiBus::new("sim", sim.clone());
        let driver = L6470::new(&bus, 8, 1.8, 1.0).unwrap();

        driver.status().unwrap();

        assert!(sim.command_log().is_empty());
    }

    #[test]
    fn test_fault_is_latched_until_read() {
        let sim = SimulatedFocuser::new(10, 8);
        let bus = SpiBus::new("sim", sim.clone());
        let driver = L6470::new(&bus, 8, 1.8, 1.0).unwrap();

        sim.inject_fault(DriverFault::ThermalShutdown);
        assert_eq!(
            driver.status().unwrap().fault(),
            Some(DriverFault::ThermalShutdown)
        );
        assert_eq!(driver.status().unwrap().fault(), None);
    }

    #[test]
    fn test_failed_transfers_only_hit_their_chip_select() {
        let sim = SimulatedFocuser::new(10, 8);
        let bus = SpiBus::new("sim", sim.clone());
        let driver = L6470::new(&bus, 8, 1.8, 1.0).unwrap();
        let encoder = Amt22::new(&bus, 10, EncoderResolution::Bits14).unwrap();

        sim.fail_next_transfers(10, 1);
        assert!(driver.status().is_ok());
        assert!(encoder.position().is_err());
        assert!(encoder.position().is_ok());
    }

    #[test]
    fn test_unknown_chip_select_cannot_be_claimed() {
        let bus = SpiBus::new("sim", SimulatedFocuser::new(10, 8));
        let err = Amt22::new(&bus, 3, EncoderResolution::Bits14).unwrap_err();
        assert!(err.to_string().contains("no simulated device"));
    }
}

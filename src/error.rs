//! Error types for the focuser control stack.
//!
//! Errors are layered the same way the hardware is:
//!
//! - **`TransportError`**: the SPI transfer itself failed (device missing, ioctl failure,
//!   chip select already claimed, channel already closed). Never retried internally.
//! - **`ChecksumError`**: an AMT22 response failed one of its two parity bits. The
//!   caller may simply read again.
//! - **`DriverFault`**: one of the L6470 fault flags (stall, overcurrent, thermal
//!   shutdown, undervoltage) was raised while a move was in progress.
//! - **`FocusError`**: the crate-level error that every public operation returns. It
//!   wraps the three errors above with `#[from]` so `?` works across layers, and adds
//!   configuration, argument, timeout and lifecycle errors.
//!
//! All of these are `Clone` because a failed move is reported as a
//! [`MotionOutcome`](crate::hardware::focus::MotionOutcome) over a broadcast channel.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type FocusResult<T> = std::result::Result<T, FocusError>;

/// A bus-level transfer failure, carrying the native diagnostic text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("SPI bus '{bus}' could not be opened: {message}")]
    Open { bus: String, message: String },

    #[error("chip select {chip_select} is already claimed on this bus")]
    EndpointInUse { chip_select: u8 },

    #[error("chip select {chip_select} could not be configured: {message}")]
    Endpoint { chip_select: u8, message: String },

    #[error("SPI transfer on chip select {chip_select} failed: {message}")]
    Transfer { chip_select: u8, message: String },

    #[error("SPI channel for chip select {chip_select} is closed")]
    Closed { chip_select: u8 },

    #[error("SPI bus stayed busy for {waited:?}; chip select {chip_select} not addressed")]
    BusBusy { chip_select: u8, waited: Duration },
}

/// Which AMT22 parity bit rejected a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParityBit {
    /// K1, bit 15, covering the odd data bits.
    Odd,
    /// K0, bit 14, covering the even data bits.
    Even,
}

/// An encoder response that failed its parity check.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{bit:?} checksum bit failed (0x{high:02X}, 0x{low:02X})")]
pub struct ChecksumError {
    pub bit: ParityBit,
    pub high: u8,
    pub low: u8,
}

/// Hardware fault conditions reported in the L6470 status word.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverFault {
    #[error("Focus motor bridge A is stalled.")]
    BridgeAStalled,

    #[error("Focus motor bridge B is stalled.")]
    BridgeBStalled,

    #[error("Focus motor exceeded its current limit.")]
    Overcurrent,

    #[error("Focus motor driver overheated.")]
    ThermalShutdown,

    #[error("Focus motor fell below its motor voltage threshold.")]
    Undervoltage,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FocusError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Encoder checksum error: {0}")]
    Checksum(#[from] ChecksumError),

    #[error("Driver fault: {0}")]
    DriverFault(#[from] DriverFault),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Motion task could not be started: {0}")]
    MotionTask(String),

    #[error("Focus controller has been disposed")]
    Disposed,

    #[error("Motion task did not stop within {0:?}; forced a soft HiZ")]
    DisposalTimeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FocusError::from(TransportError::Transfer {
            chip_select: 8,
            message: "Broken pipe (32)".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "Transport error: SPI transfer on chip select 8 failed: Broken pipe (32)"
        );
    }

    #[test]
    fn test_checksum_error_names_bit_and_bytes() {
        let err = ChecksumError {
            bit: ParityBit::Even,
            high: 0x3f,
            low: 0x0a,
        };
        assert_eq!(err.to_string(), "Even checksum bit failed (0x3F, 0x0A)");
    }

    #[test]
    fn test_driver_fault_converts_with_question_mark() {
        fn check() -> FocusResult<()> {
            Err(DriverFault::Overcurrent)?
        }
        let err = check().unwrap_err();
        assert!(err.to_string().contains("exceeded its current limit"));
    }
}

//! Shared SPI Bus with Per-Device Chip-Select Channels
//!
//! Several devices (here an L6470 driver and an AMT22 encoder) hang off one physical
//! SPI bus and are told apart by their chip-select line. Any two transfers that
//! overlap on that bus corrupt each other's framing, so every transfer on every
//! channel goes through one lock owned by the [`SpiBus`].
//!
//! - [`SpiBus`] is the bus manager. It owns the [`BusBackend`] (the native bus) behind
//!   an `Arc<Mutex<..>>` that doubles as the transfer lock, and hands out channels.
//! - [`SpiChannel`] is one chip-select endpoint. It is created by
//!   [`SpiBus::open_channel`], claims its chip select exclusively, and releases it
//!   exactly once on [`SpiChannel::close`] or drop.
//!
//! # Example
//!
//! ```
//! use focus_daq::adapters::{ChannelConfig, SpiBus};
//! use focus_daq::hardware::mock::SimulatedFocuser;
//!
//! let sim = SimulatedFocuser::new(10, 8);
//! let bus = SpiBus::new("sim", sim.clone());
//!
//! let mut encoder = bus.open_channel(ChannelConfig::amt22(10)).unwrap();
//! let mut buffer = [0u8; 2];
//! encoder.transfer(&mut buffer).unwrap();
//! encoder.close();
//! ```

use crate::error::TransportError;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// SPI clock polarity / phase combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiMode {
    /// CPOL = 0, CPHA = 0
    Mode0,
    /// CPOL = 0, CPHA = 1
    Mode1,
    /// CPOL = 1, CPHA = 0
    Mode2,
    /// CPOL = 1, CPHA = 1
    Mode3,
}

impl SpiMode {
    /// The two mode bits as the kernel expects them (CPOL = bit 1, CPHA = bit 0).
    pub fn bits(self) -> u8 {
        match self {
            SpiMode::Mode0 => 0b00,
            SpiMode::Mode1 => 0b01,
            SpiMode::Mode2 => 0b10,
            SpiMode::Mode3 => 0b11,
        }
    }

    /// Idle level of the clock line for this mode.
    pub fn clock_idles_high(self) -> bool {
        self.bits() & 0b10 != 0
    }
}

/// Per-transfer delays, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferTiming {
    /// Delay between asserting chip select and clocking the first byte.
    pub before_transfer_us: u8,
    /// Delay between consecutive bytes. Zero sends the buffer as one burst.
    pub between_bytes_us: u8,
    /// Delay between the last byte and releasing chip select.
    pub after_transfer_us: u8,
    /// Delay after releasing chip select before the bus is handed to anyone else.
    pub between_transfers_us: u8,
}

/// Everything needed to address one device on the shared bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Chip-select line (BCM GPIO number on the Raspberry Pi backend).
    pub chip_select: u8,
    /// Clock rate in Hz.
    pub bit_rate_hz: u32,
    /// Clock polarity / phase.
    pub mode: SpiMode,
    /// Per-transfer delays.
    pub timing: TransferTiming,
}

impl ChannelConfig {
    /// Start a builder for a custom endpoint.
    pub fn builder(chip_select: u8) -> ChannelConfigBuilder {
        ChannelConfigBuilder::new(chip_select)
    }

    /// Settings for an AMT22 absolute encoder: 1 MHz, mode 0, 3/3/40/3 µs.
    pub fn amt22(chip_select: u8) -> Self {
        Self::builder(chip_select)
            .with_bit_rate(1_000_000)
            .with_mode(SpiMode::Mode0)
            .with_timing(TransferTiming {
                before_transfer_us: 3,
                between_bytes_us: 3,
                after_transfer_us: 40,
                between_transfers_us: 3,
            })
            .build()
    }

    /// Settings for an L6470 stepper driver: 4 MHz, mode 3, 1/0/1/1 µs.
    pub fn l6470(chip_select: u8) -> Self {
        Self::builder(chip_select)
            .with_bit_rate(4_000_000)
            .with_mode(SpiMode::Mode3)
            .with_timing(TransferTiming {
                before_transfer_us: 1,
                between_bytes_us: 0,
                after_transfer_us: 1,
                between_transfers_us: 1,
            })
            .build()
    }
}

/// Builder for [`ChannelConfig`].
///
/// Defaults: 1 MHz, mode 0, no delays.
pub struct ChannelConfigBuilder {
    chip_select: u8,
    bit_rate_hz: u32,
    mode: SpiMode,
    timing: TransferTiming,
}

impl ChannelConfigBuilder {
    /// Create a builder for the given chip-select line.
    pub fn new(chip_select: u8) -> Self {
        Self {
            chip_select,
            bit_rate_hz: 1_000_000,
            mode: SpiMode::Mode0,
            timing: TransferTiming::default(),
        }
    }

    /// Set the clock rate in Hz.
    pub fn with_bit_rate(mut self, bit_rate_hz: u32) -> Self {
        self.bit_rate_hz = bit_rate_hz;
        self
    }

    /// Set the SPI mode.
    pub fn with_mode(mut self, mode: SpiMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the per-transfer delays.
    pub fn with_timing(mut self, timing: TransferTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Finish the configuration.
    pub fn build(self) -> ChannelConfig {
        ChannelConfig {
            chip_select: self.chip_select,
            bit_rate_hz: self.bit_rate_hz,
            mode: self.mode,
            timing: self.timing,
        }
    }
}

/// The native side of a bus: whatever actually clocks bytes out.
///
/// Implementations never need their own locking; [`SpiBus`] serializes every call.
pub trait BusBackend: Send {
    /// Prepare the chip-select line for `config` (e.g. drive it high / deselected).
    fn claim(&mut self, config: &ChannelConfig) -> Result<(), TransportError>;

    /// Full-duplex transfer: write `buffer`, then overwrite it with the response.
    fn transfer(&mut self, config: &ChannelConfig, buffer: &mut [u8])
        -> Result<(), TransportError>;

    /// Give the chip-select line back. Called exactly once per successful claim.
    fn release(&mut self, chip_select: u8);
}

struct BusInner {
    backend: Box<dyn BusBackend>,
    claimed: HashSet<u8>,
}

/// Bus manager: owns the native bus and the lock every transfer goes through.
#[derive(Clone)]
pub struct SpiBus {
    name: Arc<str>,
    inner: Arc<Mutex<BusInner>>,
}

impl fmt::Debug for SpiBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpiBus").field("name", &self.name).finish()
    }
}

impl SpiBus {
    /// Wrap a backend as a shared bus.
    ///
    /// # Arguments
    /// * `name` - Label used in logs and errors (e.g. "/dev/spidev0.0")
    /// * `backend` - The native bus implementation
    pub fn new(name: impl Into<String>, backend: impl BusBackend + 'static) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name.as_str()),
            inner: Arc::new(Mutex::new(BusInner {
                backend: Box::new(backend),
                claimed: HashSet::new(),
            })),
        }
    }

    /// Open the Linux spidev bus at `device` with software chip select.
    #[cfg(all(feature = "instrument_spi", target_os = "linux"))]
    pub fn open_spidev(device: &str) -> Result<Self, TransportError> {
        let backend = crate::adapters::spidev_backend::SpidevBackend::open(device)?;
        Ok(Self::new(device, backend))
    }

    /// Claim a chip select and return a channel bound to it.
    ///
    /// # Errors
    /// - `TransportError::EndpointInUse` if another open channel holds the chip select
    /// - Whatever the backend reports while configuring the line
    pub fn open_channel(&self, config: ChannelConfig) -> Result<SpiChannel, TransportError> {
        let mut inner = self.inner.lock();

        if inner.claimed.contains(&config.chip_select) {
            return Err(TransportError::EndpointInUse {
                chip_select: config.chip_select,
            });
        }

        inner.backend.claim(&config)?;
        inner.claimed.insert(config.chip_select);

        tracing::debug!(
            bus = %self.name,
            chip_select = config.chip_select,
            bit_rate_hz = config.bit_rate_hz,
            mode = ?config.mode,
            "Opened SPI channel"
        );

        Ok(SpiChannel {
            bus_name: self.name.clone(),
            inner: self.inner.clone(),
            config,
            open: true,
        })
    }

    /// Whether a chip select is currently claimed by an open channel.
    pub fn is_claimed(&self, chip_select: u8) -> bool {
        self.inner.lock().claimed.contains(&chip_select)
    }

    /// Bus label.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One chip-select endpoint on a shared [`SpiBus`].
pub struct SpiChannel {
    bus_name: Arc<str>,
    inner: Arc<Mutex<BusInner>>,
    config: ChannelConfig,
    open: bool,
}

impl fmt::Debug for SpiChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpiChannel")
            .field("bus", &self.bus_name)
            .field("config", &self.config)
            .field("open", &self.open)
            .finish()
    }
}

impl SpiChannel {
    /// Exchange `buffer` with the device, in place.
    ///
    /// Blocks until the bus is free. The response overwrites `buffer` and always has
    /// the same length. Failures are returned as-is; nothing is retried here.
    pub fn transfer(&self, buffer: &mut [u8]) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed {
                chip_select: self.config.chip_select,
            });
        }

        let mut inner = self.inner.lock();
        tracing::trace!(chip_select = self.config.chip_select, tx = ?buffer, "SPI transfer");
        inner.backend.transfer(&self.config, buffer)?;
        tracing::trace!(chip_select = self.config.chip_select, rx = ?buffer, "SPI response");
        Ok(())
    }

    /// Like [`transfer`](Self::transfer), but gives up with
    /// `TransportError::BusBusy` if the bus is not free within `timeout`.
    pub fn transfer_within(
        &self,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed {
                chip_select: self.config.chip_select,
            });
        }

        let Some(mut inner) = self.inner.try_lock_for(timeout) else {
            return Err(TransportError::BusBusy {
                chip_select: self.config.chip_select,
                waited: timeout,
            });
        };
        tracing::trace!(chip_select = self.config.chip_select, tx = ?buffer, "SPI transfer");
        inner.backend.transfer(&self.config, buffer)?;
        tracing::trace!(chip_select = self.config.chip_select, rx = ?buffer, "SPI response");
        Ok(())
    }

    /// Release the chip select. Safe to call more than once.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        let mut inner = self.inner.lock();
        inner.claimed.remove(&self.config.chip_select);
        inner.backend.release(self.config.chip_select);

        tracing::debug!(
            bus = %self.bus_name,
            chip_select = self.config.chip_select,
            "Closed SPI channel"
        );
    }

    /// Whether the channel still holds its chip select.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Chip-select line of this channel.
    pub fn chip_select(&self) -> u8 {
        self.config.chip_select
    }

    /// Endpoint settings.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }
}

impl Drop for SpiChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Echo backend that counts overlapping transfers.
    #[derive(Clone, Default)]
    struct EchoBackend {
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        released: Arc<Mutex<Vec<u8>>>,
        fail_transfers: bool,
    }

    impl BusBackend for EchoBackend {
        fn claim(&mut self, _config: &ChannelConfig) -> Result<(), TransportError> {
            Ok(())
        }

        fn transfer(
            &mut self,
            config: &ChannelConfig,
            buffer: &mut [u8],
        ) -> Result<(), TransportError> {
            if self.fail_transfers {
                return Err(TransportError::Transfer {
                    chip_select: config.chip_select,
                    message: "Input/output error (5)".to_string(),
                });
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1));
            for byte in buffer.iter_mut() {
                *byte = !*byte;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        fn release(&mut self, chip_select: u8) {
            self.released.lock().push(chip_select);
        }
    }

    #[test]
    fn test_transfer_overwrites_buffer_in_place() {
        let bus = SpiBus::new("test", EchoBackend::default());
        let channel = bus.open_channel(ChannelConfig::amt22(5)).unwrap();

        let mut buffer = [0x00, 0xF0];
        channel.transfer(&mut buffer).unwrap();
        assert_eq!(buffer, [0xFF, 0x0F]);
    }

    #[test]
    fn test_chip_select_is_exclusive() {
        let bus = SpiBus::new("test", EchoBackend::default());
        let first = bus.open_channel(ChannelConfig::amt22(5)).unwrap();

        let second = bus.open_channel(ChannelConfig::l6470(5));
        assert_eq!(
            second.unwrap_err(),
            TransportError::EndpointInUse { chip_select: 5 }
        );

        drop(first);
        assert!(!bus.is_claimed(5));
        assert!(bus.open_channel(ChannelConfig::l6470(5)).is_ok());
    }

    #[test]
    fn test_close_is_idempotent_and_releases_once() {
        let backend = EchoBackend::default();
        let released = backend.released.clone();
        let bus = SpiBus::new("test", backend);

        let mut channel = bus.open_channel(ChannelConfig::l6470(7)).unwrap();
        channel.close();
        channel.close();
        drop(channel);

        assert_eq!(*released.lock(), vec![7]);
    }

    #[test]
    fn test_transfer_after_close_fails() {
        let bus = SpiBus::new("test", EchoBackend::default());
        let mut channel = bus.open_channel(ChannelConfig::l6470(7)).unwrap();
        channel.close();

        let mut buffer = [0u8; 2];
        assert_eq!(
            channel.transfer(&mut buffer).unwrap_err(),
            TransportError::Closed { chip_select: 7 }
        );
    }

    #[test]
    fn test_transfer_error_is_propagated() {
        let backend = EchoBackend {
            fail_transfers: true,
            ..Default::default()
        };
        let bus = SpiBus::new("test", backend);
        let channel = bus.open_channel(ChannelConfig::amt22(3)).unwrap();

        let mut buffer = [0u8; 2];
        let err = channel.transfer(&mut buffer).unwrap_err();
        assert!(err.to_string().contains("Input/output error"));
    }

    #[test]
    fn test_transfers_never_overlap_across_channels() {
        let backend = EchoBackend::default();
        let max_in_flight = backend.max_in_flight.clone();
        let bus = SpiBus::new("test", backend);

        let encoder = Arc::new(bus.open_channel(ChannelConfig::amt22(1)).unwrap());
        let driver = Arc::new(bus.open_channel(ChannelConfig::l6470(2)).unwrap());

        let handles: Vec<_> = [encoder, driver]
            .into_iter()
            .map(|channel| {
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        let mut buffer = [0u8; 3];
                        channel.transfer(&mut buffer).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_transfer_within_gives_up_on_busy_bus() {
        let bus = SpiBus::new("test", EchoBackend::default());
        let channel = bus.open_channel(ChannelConfig::l6470(2)).unwrap();

        let held = bus.inner.lock();
        let start = std::time::Instant::now();
        let mut buffer = [0u8; 1];
        let err = channel
            .transfer_within(&mut buffer, Duration::from_millis(20))
            .unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(
            err,
            TransportError::BusBusy {
                chip_select: 2,
                waited: Duration::from_millis(20)
            }
        );

        drop(held);
        channel
            .transfer_within(&mut buffer, Duration::from_millis(20))
            .unwrap();
        assert_eq!(buffer, [0xFF]);
    }

    #[test]
    fn test_device_presets() {
        let amt = ChannelConfig::amt22(10);
        assert_eq!(amt.bit_rate_hz, 1_000_000);
        assert_eq!(amt.mode, SpiMode::Mode0);
        assert_eq!(amt.timing.after_transfer_us, 40);

        let l6470 = ChannelConfig::l6470(8);
        assert_eq!(l6470.bit_rate_hz, 4_000_000);
        assert_eq!(l6470.mode, SpiMode::Mode3);
        assert!(l6470.mode.clock_idles_high());
        assert_eq!(l6470.timing.between_bytes_us, 0);
    }
}

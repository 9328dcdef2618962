//! Linux spidev backend with software chip select.
//!
//! The Pi only has two hardware chip-select lines, so the bus is opened with
//! `SPI_NO_CS` and each device gets its own GPIO output driven by hand. When a
//! transfer needs a different mode than the previous one, the mode is switched and a
//! throwaway byte is clocked with no chip select asserted, so the clock line settles
//! at the new polarity before the device is selected.

use crate::adapters::spi_bus::{BusBackend, ChannelConfig, SpiMode};
use crate::error::TransportError;
use rppal::gpio::{Gpio, OutputPin};
use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};
use std::collections::HashMap;
use std::time::Duration;

/// spidev bus plus the GPIO lines used as chip selects.
pub struct SpidevBackend {
    device: String,
    spi: Spidev,
    gpio: Gpio,
    pins: HashMap<u8, OutputPin>,
    current_mode: Option<SpiMode>,
}

impl SpidevBackend {
    /// Open `device` (e.g. `/dev/spidev0.0`) with 8-bit words and no hardware CS.
    pub fn open(device: &str) -> Result<Self, TransportError> {
        let open_err = |message: String| TransportError::Open {
            bus: device.to_string(),
            message,
        };

        let mut spi = Spidev::open(device).map_err(|e| open_err(e.to_string()))?;
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .mode(mode_flags(SpiMode::Mode0))
            .build();
        spi.configure(&options)
            .map_err(|e| open_err(format!("setting bits-per-word failed: {e}")))?;

        let gpio = Gpio::new().map_err(|e| open_err(format!("GPIO setup failed: {e}")))?;

        tracing::info!(device, "Opened spidev bus with software chip select");

        Ok(Self {
            device: device.to_string(),
            spi,
            gpio,
            pins: HashMap::new(),
            current_mode: Some(SpiMode::Mode0),
        })
    }

    fn apply_mode(&mut self, config: &ChannelConfig) -> Result<(), TransportError> {
        if self.current_mode == Some(config.mode) {
            return Ok(());
        }
        let options = SpidevOptions::new().mode(mode_flags(config.mode)).build();
        self.spi
            .configure(&options)
            .map_err(|e| TransportError::Endpoint {
                chip_select: config.chip_select,
                message: format!("setting SPI mode failed: {e}"),
            })?;
        self.current_mode = Some(config.mode);

        // Nothing is selected, so this only moves the clock to its idle level.
        let tx = [0u8];
        let mut rx = [0u8];
        let mut dummy = SpidevTransfer::read_write(&tx, &mut rx);
        dummy.speed_hz = config.bit_rate_hz;
        if let Err(e) = self.spi.transfer(&mut dummy) {
            tracing::warn!(device = %self.device, error = %e, "Clock settle transfer failed");
        }
        Ok(())
    }

    fn clock_bytes(
        &mut self,
        config: &ChannelConfig,
        buffer: &mut [u8],
    ) -> Result<(), TransportError> {
        let transfer_err = |e: std::io::Error| TransportError::Transfer {
            chip_select: config.chip_select,
            message: format!("{e} ({})", e.raw_os_error().unwrap_or_default()),
        };

        if config.timing.between_bytes_us == 0 {
            let tx = buffer.to_vec();
            let mut transfer = SpidevTransfer::read_write(&tx, buffer);
            transfer.speed_hz = config.bit_rate_hz;
            return self.spi.transfer(&mut transfer).map_err(transfer_err);
        }

        for byte in buffer.iter_mut() {
            let tx = [*byte];
            let mut rx = [0u8];
            let mut transfer = SpidevTransfer::read_write(&tx, &mut rx);
            transfer.speed_hz = config.bit_rate_hz;
            self.spi.transfer(&mut transfer).map_err(transfer_err)?;
            *byte = rx[0];
            delay_us(config.timing.between_bytes_us);
        }
        Ok(())
    }
}

impl BusBackend for SpidevBackend {
    fn claim(&mut self, config: &ChannelConfig) -> Result<(), TransportError> {
        let pin = self
            .gpio
            .get(config.chip_select)
            .map_err(|e| TransportError::Endpoint {
                chip_select: config.chip_select,
                message: e.to_string(),
            })?
            .into_output_high();
        self.pins.insert(config.chip_select, pin);
        Ok(())
    }

    fn transfer(
        &mut self,
        config: &ChannelConfig,
        buffer: &mut [u8],
    ) -> Result<(), TransportError> {
        self.apply_mode(config)?;

        let Some(pin) = self.pins.get_mut(&config.chip_select) else {
            return Err(TransportError::Closed {
                chip_select: config.chip_select,
            });
        };
        pin.set_low();
        delay_us(config.timing.before_transfer_us);

        let result = self.clock_bytes(config, buffer);

        if result.is_ok() {
            delay_us(config.timing.after_transfer_us);
        }
        if let Some(pin) = self.pins.get_mut(&config.chip_select) {
            pin.set_high();
        }
        result?;

        delay_us(config.timing.between_transfers_us);
        Ok(())
    }

    fn release(&mut self, chip_select: u8) {
        // Dropping the OutputPin resets the line to its previous state.
        if let Some(mut pin) = self.pins.remove(&chip_select) {
            pin.set_high();
        }
    }
}

fn mode_flags(mode: SpiMode) -> SpiModeFlags {
    let base = match mode {
        SpiMode::Mode0 => SpiModeFlags::SPI_MODE_0,
        SpiMode::Mode1 => SpiModeFlags::SPI_MODE_1,
        SpiMode::Mode2 => SpiModeFlags::SPI_MODE_2,
        SpiMode::Mode3 => SpiModeFlags::SPI_MODE_3,
    };
    base | SpiModeFlags::SPI_NO_CS
}

fn delay_us(us: u8) {
    if us > 0 {
        std::thread::sleep(Duration::from_micros(u64::from(us)));
    }
}

//! Bus adapter implementations
//!
//! This module provides the shared SPI bus abstraction and its native backends.
//! Device drivers in [`crate::hardware`] only ever see an [`SpiChannel`].

pub mod spi_bus;
#[cfg(all(feature = "instrument_spi", target_os = "linux"))]
pub mod spidev_backend;

pub use spi_bus::{
    BusBackend, ChannelConfig, ChannelConfigBuilder, SpiBus, SpiChannel, SpiMode, TransferTiming,
};
#[cfg(all(feature = "instrument_spi", target_os = "linux"))]
pub use spidev_backend::SpidevBackend;

//! Core library for the focus_daq focuser controller.
//!
//! This library contains the shared SPI bus, the AMT22 encoder and L6470 stepper
//! driver protocols, and the closed-loop focus controller built on them. It is used
//! by the `focusctl` command line tool and by any application embedding a focus axis.

pub mod adapters;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod hardware;
pub mod tracing_setup;

pub use error::{FocusError, FocusResult};

//! Focuser hardware drivers
//!
//! - [`amt22`]: absolute encoder
//! - [`l6470_protocol`] and [`l6470`]: stepper driver wire format and device
//! - [`focus`]: closed-loop focus axis combining the two
//! - [`mock`]: simulated encoder + driver bus for tests and `--simulate`

pub mod amt22;
pub mod focus;
pub mod l6470;
pub mod l6470_protocol;
pub mod mock;

pub use amt22::{Amt22, EncoderResolution};
pub use focus::{DisposeStatus, FocusController, FocusSettings, MotionOutcome};
pub use l6470::L6470;
pub use l6470_protocol::{DriverStatus, MicrostepMode, MotorDirection};

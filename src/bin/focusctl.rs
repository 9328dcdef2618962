//! focusctl - command line front-end for the focuser
//!
//! Talks to the L6470 driver and AMT22 encoder directly for the raw commands and
//! drives the closed-loop controller for `move`. `--simulate` (or `bus.simulate`
//! in the config) runs everything against the simulated focuser.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use focus_daq::adapters::{ChannelConfig, SpiBus};
use focus_daq::config::FocusDaqConfig;
use focus_daq::diagnostics::TracingSink;
use focus_daq::hardware::amt22::{Amt22, EncoderResolution};
use focus_daq::hardware::focus::{FocusController, FocusSettings, MotionOutcome};
use focus_daq::hardware::l6470::L6470;
use focus_daq::hardware::l6470_protocol::{MicrostepMode, MotorDirection};
use focus_daq::hardware::mock::SimulatedFocuser;
use focus_daq::tracing_setup::{self, OutputFormat, TracingConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Simulated runs poll fast so a move across the range finishes in seconds.
const SIMULATED_UPDATE_RATE_HZ: u32 = 1000;

#[derive(Parser)]
#[command(name = "focusctl", about = "Motorized focuser control", version)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "config/focus.toml")]
    config: PathBuf,

    /// Use the simulated focuser instead of the SPI bus
    #[arg(long)]
    simulate: bool,

    /// Log output format (pretty, compact, json)
    #[arg(long, default_value = "compact")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the decoded driver status register
    Status,
    /// Print the encoder position
    Position,
    /// Move the focus to a normalized position and wait for the result
    Move {
        /// Target position, 0 (lower bound) to 1 (upper bound)
        position: f64,
        /// Speed limit; defaults to focus.default_max_rpm
        #[arg(long)]
        rpm: Option<f64>,
        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Run the motor at constant speed until another command stops it
    Run {
        /// Rotation direction
        #[arg(value_enum)]
        direction: DirectionArg,
        /// Speed in RPM
        #[arg(long)]
        rpm: f64,
    },
    /// Decelerate to a stop, holding position
    SoftStop,
    /// Stop immediately, holding position
    HardStop,
    /// Decelerate, then disable the bridges
    SoftHiz,
    /// Disable the bridges immediately
    HardHiz,
    /// Show or change microstepping (1, 2, 4, ... 128) without resetting the driver
    Microstep {
        /// Microsteps per full step
        microsteps: Option<u16>,
    },
    /// Make the current shaft angle the encoder's zero
    Zero,
    /// Restart the encoder
    ResetEncoder,
}

#[derive(Clone, Copy, ValueEnum)]
enum DirectionArg {
    Forward,
    Reverse,
}

impl From<DirectionArg> for MotorDirection {
    fn from(direction: DirectionArg) -> Self {
        match direction {
            DirectionArg::Forward => MotorDirection::Forward,
            DirectionArg::Reverse => MotorDirection::Reverse,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = FocusDaqConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if cli.simulate {
        config.bus.simulate = true;
    }

    let level = tracing_setup::parse_log_level(&config.application.log_level)
        .map_err(|e| anyhow!(e))?;
    tracing_setup::init(TracingConfig::new(level).with_format(cli.log_format))
        .map_err(|e| anyhow!(e))?;

    info!(
        device = %config.bus.device,
        simulate = config.bus.simulate,
        "{} starting",
        config.application.name
    );

    let bus = open_bus(&config)?;

    match cli.command {
        Commands::Move {
            position,
            rpm,
            timeout_secs,
        } => {
            let rpm = rpm.unwrap_or(config.focus.default_max_rpm);
            move_focus(&bus, &config, position, rpm, Duration::from_secs(timeout_secs)).await
        }
        Commands::Position => {
            let encoder = open_encoder(&bus, &config)?;
            let tick = encoder.position()?;
            let normalized = FocusSettings::from(&config.focus).normalize(tick);
            println!("encoder tick {tick} (normalized {normalized:.4})");
            Ok(())
        }
        Commands::ResetEncoder => {
            open_encoder(&bus, &config)?.reset()?;
            println!("encoder reset");
            Ok(())
        }
        Commands::Zero => {
            let encoder = open_encoder(&bus, &config)?;
            encoder.set_zero_position()?;
            println!("zero set, encoder now reads {}", encoder.position()?);
            Ok(())
        }
        Commands::Status => {
            let driver = attach_driver(&bus, &config)?;
            let status = driver.status()?;
            println!("{status:#?}");
            if let Some(fault) = status.fault() {
                println!("fault: {fault}");
            }
            Ok(())
        }
        Commands::Run { direction, rpm } => {
            let mut driver = open_driver(&bus, &config)?;
            driver.set_direction(direction.into());
            driver.set_speed_rpm(rpm);
            driver.run()?;
            println!("running {:?} at {rpm} RPM", driver.direction());
            Ok(())
        }
        Commands::SoftStop => {
            attach_driver(&bus, &config)?.soft_stop()?;
            Ok(())
        }
        Commands::HardStop => {
            attach_driver(&bus, &config)?.hard_stop()?;
            Ok(())
        }
        Commands::SoftHiz => {
            attach_driver(&bus, &config)?.soft_hiz()?;
            Ok(())
        }
        Commands::HardHiz => {
            attach_driver(&bus, &config)?.hard_hiz()?;
            Ok(())
        }
        Commands::Microstep { microsteps } => {
            let driver = attach_driver(&bus, &config)?;
            if let Some(microsteps) = microsteps {
                let mode = MicrostepMode::from_microsteps(microsteps).ok_or_else(|| {
                    anyhow!("{microsteps} is not a supported microstep count (1, 2, 4 ... 128)")
                })?;
                driver.set_microstep_mode(mode)?;
            }
            let mode = driver.microstep_mode()?;
            println!("{} microsteps per step ({mode:?})", mode.microsteps());
            Ok(())
        }
    }
}

fn open_bus(config: &FocusDaqConfig) -> Result<SpiBus> {
    if config.bus.simulate {
        let sim = SimulatedFocuser::new(config.encoder.chip_select, config.driver.chip_select);
        let midpoint = (u32::from(config.focus.lower_bound) + u32::from(config.focus.upper_bound)) / 2;
        sim.set_encoder_position(u16::try_from(midpoint)?);
        return Ok(SpiBus::new("simulated", sim));
    }
    open_hardware_bus(&config.bus.device)
}

#[cfg(all(feature = "instrument_spi", target_os = "linux"))]
fn open_hardware_bus(device: &str) -> Result<SpiBus> {
    SpiBus::open_spidev(device).with_context(|| format!("opening {device}"))
}

#[cfg(not(all(feature = "instrument_spi", target_os = "linux")))]
fn open_hardware_bus(device: &str) -> Result<SpiBus> {
    bail!(
        "cannot open {device}: built without the `instrument_spi` feature \
         (rebuild with --features instrument_spi or pass --simulate)"
    )
}

fn open_encoder(bus: &SpiBus, config: &FocusDaqConfig) -> Result<Amt22> {
    let resolution = EncoderResolution::from_bits(config.encoder.resolution_bits)
        .ok_or_else(|| anyhow!("unsupported encoder resolution"))?;
    Ok(Amt22::new(bus, config.encoder.chip_select, resolution)?)
}

fn open_driver(bus: &SpiBus, config: &FocusDaqConfig) -> Result<L6470> {
    Ok(L6470::new(
        bus,
        config.driver.chip_select,
        config.driver.step_angle_deg,
        config.driver.max_current_a,
    )?)
}

/// Driver as the device has it configured, for commands that must not reset it.
fn attach_driver(bus: &SpiBus, config: &FocusDaqConfig) -> Result<L6470> {
    Ok(L6470::attach(
        bus,
        ChannelConfig {
            bit_rate_hz: config.driver.bit_rate_hz,
            ..ChannelConfig::l6470(config.driver.chip_select)
        },
        config.driver.step_angle_deg,
    )?)
}

async fn move_focus(
    bus: &SpiBus,
    config: &FocusDaqConfig,
    position: f64,
    rpm: f64,
    timeout: Duration,
) -> Result<()> {
    let focus = FocusController::open(bus, config, Arc::new(TracingSink))?;
    if config.bus.simulate {
        focus.set_encoder_update_rate(SIMULATED_UPDATE_RATE_HZ)?;
    }

    let mut finished = focus.subscribe();
    focus.move_to_position(position, rpm)?;

    let outcome = tokio::select! {
        result = tokio::time::timeout(timeout, finished.recv()) => {
            match result {
                Ok(outcome) => outcome?,
                Err(_) => {
                    focus.dispose();
                    bail!("move did not finish within {}s", timeout.as_secs());
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping focus");
            focus.stop();
            finished.recv().await?
        }
    };

    match outcome {
        MotionOutcome::Succeeded => {
            println!("focus at {:.4}", focus.position()?);
            focus.dispose();
            Ok(())
        }
        MotionOutcome::Failed(e) => {
            focus.dispose();
            Err(e).context("focus move failed")
        }
    }
}

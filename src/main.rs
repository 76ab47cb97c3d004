//! A utility for programming lattice FPGAs and their configuration flash.
//! The documentation for configuration and programming can be found here:
//! https://www.latticesemi.com/view_document?document_id=46502
//!
//! Pins are driven either directly from a Raspberry Pi's GPIO header or through a USB
//! bridge microcontroller. For the Pi, which is likely a 32-bit arm architecture (the
//! architecture may vary model-to-model), build with
//! `cross build --release --target armv7-unknown-linux-musleabihf`, or whatever the correct
//! target may be for the intended device.

mod bridge;
mod config;
mod error;
mod flash;
mod gpio;
mod pin;
mod profile;
mod spi;
mod spi_nor;
mod sram;
#[cfg(test)]
mod testing;

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::ProgressBar;

use bridge::{Bridge, BridgeSpi, UsbPipe};
use config::Settings;
use error::Error;
use flash::FlashProgrammer;
use gpio::LocalGpio;
use pin::{Direction, PinAssignment, PinTransport};
use profile::{BackendKind, Profile};
use spi::{BitBangSpi, LineRole, SpiBus};
use sram::ConfigSequencer;

/// Program a lattice FPGA's SRAM or its SPI configuration flash.
///
/// Documentation: https://www.latticesemi.com/view_document?document_id=46502
///
/// The default wiring for the local backend is:
///
/// - CS: GPIO 25
/// - MOSI: GPIO 9 (flash input, FPGA output)
/// - MISO: GPIO 10 (flash output, FPGA input)
/// - SCK: GPIO 11
/// - CRESET: GPIO 23
/// - CDONE: GPIO 24
///
/// The bridge backend defaults to CS 9, MOSI 8, MISO 11, SCK 10, CDONE 2 and CRESET 3.
/// Use --profile for other boards.
///
/// WARNING: writing to flash erases 4K blocks starting at the offset.
#[derive(Parser)]
#[command(author, version, long_about, verbatim_doc_comment)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// How the pins are driven
    #[arg(short, long, value_enum, default_value_t = BackendKind::Local, global = true)]
    backend: BackendKind,

    /// Select the bridge at BUS:ADDR instead of the first one found
    #[arg(long, value_name = "BUS:ADDR", value_parser = parse_location, global = true)]
    usb: Option<(u8, u8)>,

    /// USB transfer timeout in milliseconds
    #[arg(long, default_value = "5000", global = true)]
    usb_timeout: u64,

    /// Board pin map
    #[arg(short, long, value_enum, default_value_t = Profile::Default, global = true)]
    profile: Profile,

    /// Flash a module through the Werkzeug PMOD
    ///
    /// Only affects flash operations.
    #[arg(short, long, global = true)]
    werkzeug: bool,

    /// Reset the FPGA afterwards so it configures itself from flash
    #[arg(short, long, global = true)]
    reset: bool,

    /// Prompt for the reset button during SRAM configuration
    #[arg(short, long, global = true)]
    manual_reset: bool,

    /// Fail when CDONE stays low or verify finds a mismatch
    #[arg(long, global = true)]
    strict: bool,

    /// Give up after this many polls of the flash busy flag
    #[arg(long, global = true)]
    busy_poll_limit: Option<u32>,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    #[command(flatten)]
    Device(Operation),

    /// Read a GPIO, or drive it when a value is given
    Gpio {
        pin: u8,
        #[arg(value_parser = clap::value_parser!(u8).range(0..=1))]
        value: Option<u8>,
    },

    /// Send a raw command frame to the bridge (all values hex)
    Cmd {
        #[arg(value_parser = parse_hex_byte)]
        op: u8,
        #[arg(value_parser = parse_hex_byte, default_value = "0")]
        arg1: u8,
        #[arg(value_parser = parse_hex_byte, default_value = "0")]
        arg2: u8,
        #[arg(value_parser = parse_hex_byte, default_value = "0")]
        arg3: u8,
    },
}

/// Operations that claim the SPI pins and drive RESET/DONE.
#[derive(Subcommand)]
enum Operation {
    /// Write a bitstream to FPGA SRAM
    Sram { image: PathBuf },

    /// Write an image to flash starting at OFFSET (hex)
    Flash {
        image: PathBuf,
        #[arg(value_parser = parse_hex, default_value = "0")]
        offset: u32,
    },

    /// Dump SIZE bytes of flash from OFFSET (both hex) to a file
    Dump {
        output: PathBuf,
        #[arg(value_parser = parse_hex, default_value = "0")]
        offset: u32,
        #[arg(value_parser = parse_hex, default_value = "100000")]
        size: u32,
    },

    /// Compare flash contents at OFFSET (hex) against an image
    Verify {
        image: PathBuf,
        #[arg(value_parser = parse_hex, default_value = "0")]
        offset: u32,
    },

    /// Bulk erase the entire flash
    Erase,

    /// Hold the FPGA in reset and print CDONE every 500 ms
    Watch {
        /// Stop after this many samples
        #[arg(long)]
        samples: Option<u32>,
    },
}

impl Operation {
    fn is_flash(&self) -> bool {
        matches!(
            self,
            Operation::Flash { .. }
                | Operation::Dump { .. }
                | Operation::Verify { .. }
                | Operation::Erase
        )
    }

    fn role(&self) -> LineRole {
        match self {
            Operation::Sram { .. } => LineRole::Configuration,
            _ => LineRole::Flash,
        }
    }
}

/// An operation with its input read and its output created.
enum Job {
    Sram(Vec<u8>),
    Flash { image: Vec<u8>, offset: u32 },
    Dump {
        sink: BufWriter<File>,
        offset: u32,
        size: usize,
    },
    Verify { image: Vec<u8>, offset: u32 },
    Erase,
    Watch(Option<u32>),
}

impl Job {
    /// Open every file the operation needs. Runs before any device is opened.
    fn prepare(operation: &Operation) -> Result<Self, Error> {
        Ok(match operation {
            Operation::Sram { image } => Job::Sram(load_image(image)?),
            Operation::Flash { image, offset } => Job::Flash {
                image: load_image(image)?,
                offset: *offset,
            },
            Operation::Dump {
                output,
                offset,
                size,
            } => {
                let file = File::create(output).map_err(|source| Error::File {
                    path: output.clone(),
                    source,
                })?;
                Job::Dump {
                    sink: BufWriter::new(file),
                    offset: *offset,
                    size: *size as usize,
                }
            }
            Operation::Verify { image, offset } => Job::Verify {
                image: load_image(image)?,
                offset: *offset,
            },
            Operation::Erase => Job::Erase,
            Operation::Watch { samples } => Job::Watch(*samples),
        })
    }
}

/// Parse a hex value, with or without the 0x prefix
fn parse_hex(s: &str) -> Result<u32, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|e| format!("Invalid hex value: {}", e))
}

fn parse_hex_byte(s: &str) -> Result<u8, String> {
    let value = parse_hex(s)?;
    u8::try_from(value).map_err(|_| format!("{:#x} does not fit in a byte", value))
}

fn parse_location(s: &str) -> Result<(u8, u8), String> {
    let (bus, address) = s
        .split_once(':')
        .ok_or_else(|| format!("expected BUS:ADDR, got {s}"))?;
    let bus = bus.parse().map_err(|e| format!("Invalid bus: {}", e))?;
    let address = address.parse().map_err(|e| format!("Invalid address: {}", e))?;
    Ok((bus, address))
}

fn open_bridge(cli: &Cli) -> Result<Bridge<UsbPipe>> {
    let timeout = Duration::from_millis(cli.usb_timeout);
    let pipe =
        UsbPipe::open(cli.usb, timeout).with_context(|| "Failed to open the USB bridge")?;
    Ok(Bridge::new(pipe))
}

/// The pin transport chosen for this run.
enum Backend {
    Local(LocalGpio),
    Bridge(Bridge<UsbPipe>),
}

impl Backend {
    fn open(cli: &Cli, pins: &[u8]) -> Result<Self> {
        match cli.backend {
            BackendKind::Local => {
                let gpio = LocalGpio::new(pins).with_context(|| "Failed to acquire GPIO")?;
                Ok(Backend::Local(gpio))
            }
            BackendKind::Bridge => Ok(Backend::Bridge(open_bridge(cli)?)),
        }
    }

    fn spi(&mut self, pins: &PinAssignment, role: LineRole) -> Box<dyn SpiBus + '_> {
        match self {
            Backend::Local(gpio) => Box::new(BitBangSpi::new(gpio, pins, role)),
            Backend::Bridge(bridge) => Box::new(BridgeSpi::new(bridge, pins, role)),
        }
    }

    fn pins(&mut self) -> &mut dyn PinTransport {
        match self {
            Backend::Local(gpio) => gpio,
            Backend::Bridge(bridge) => bridge,
        }
    }
}

fn settings(cli: &Cli) -> Settings {
    Settings {
        strict: cli.strict,
        manual_reset: cli.manual_reset,
        busy_poll_limit: cli.busy_poll_limit,
        ..Default::default()
    }
}

fn progress_bar(cli: &Cli) -> ProgressBar {
    // Debug output interleaves with the bar
    if cli.verbose > 0 {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(0)
    }
}

fn load_image(path: &Path) -> Result<Vec<u8>, Error> {
    let image = std::fs::read(path).map_err(|source| Error::File {
        path: path.to_owned(),
        source,
    })?;
    log::info!("file size: {}", image.len());
    Ok(image)
}

/// Read or drive one pin without claiming the SPI pins.
fn gpio(cli: &Cli, pin: u8, value: Option<u8>) -> Result<()> {
    let mut backend = Backend::open(cli, &[pin])?;
    let io = backend.pins();
    match value {
        Some(value) => {
            io.set_direction(pin, Direction::Output)?;
            io.write(pin, value != 0)?;
            log::info!("write gpio #{} val: {:#04x}", pin, value);
        }
        None => {
            io.set_direction(pin, Direction::Input)?;
            let value = io.read(pin)?;
            log::info!("read gpio #{} val: {:#04x}", pin, value as u8);
        }
    }
    Ok(())
}

fn raw_command(cli: &Cli, op: u8, args: [u8; 3]) -> Result<()> {
    if cli.backend != BackendKind::Bridge {
        bail!("raw commands need the bridge backend");
    }
    let mut bridge = open_bridge(cli)?;
    log::debug!(
        "send cmd [{:02x} {:02x} {:02x} {:02x}]",
        op,
        args[0],
        args[1],
        args[2]
    );
    bridge.command(op, args)?;
    Ok(())
}

fn operate(cli: &Cli, bus: &mut dyn SpiBus, pins: PinAssignment, job: Job) -> Result<()> {
    let settings = settings(cli);

    match job {
        Job::Sram(image) => {
            let mut sequencer =
                ConfigSequencer::new(bus, pins, settings).with_progress(progress_bar(cli));
            if sequencer.load(&image)?.done {
                log::info!("FPGA configured.");
            }
        }
        Job::Flash { image, offset } => {
            FlashProgrammer::new(bus, pins, settings)
                .with_progress(progress_bar(cli))
                .program(&image, offset)?;
        }
        Job::Dump {
            mut sink,
            offset,
            size,
        } => {
            FlashProgrammer::new(bus, pins, settings)
                .with_progress(progress_bar(cli))
                .read(offset, size, &mut sink)?;
        }
        Job::Verify { image, offset } => {
            let report = FlashProgrammer::new(bus, pins, settings)
                .with_progress(progress_bar(cli))
                .verify(&image, offset)?;
            if report.count() > 0 {
                log::warn!("first mismatch @ {:#08x}", report.mismatches[0]);
            }
        }
        Job::Erase => {
            FlashProgrammer::new(bus, pins, settings).bulk_erase()?;
        }
        Job::Watch(samples) => {
            ConfigSequencer::new(bus, pins, settings)
                .watch_done(Duration::from_millis(500), samples)?;
        }
    }
    Ok(())
}

/// Optionally reboot the FPGA, then give the pins back.
fn finish(cli: &Cli, backend: &mut Backend, pins: PinAssignment, role: LineRole) -> Result<()> {
    if cli.reset {
        let mut bus = backend.spi(&pins, role);
        ConfigSequencer::new(&mut *bus, pins, settings(cli)).reboot()?;
    }

    match backend {
        Backend::Bridge(bridge) if cli.profile.hands_off() => {
            bridge.init(bridge::init::HANDOFF)?;
        }
        backend => backend.spi(&pins, role).release()?,
    }
    Ok(())
}

fn device(cli: &Cli, operation: &Operation) -> Result<()> {
    // A missing image must fail before any pin changes state
    let job = Job::prepare(operation)?;

    let mut pins = cli.profile.pins(cli.backend);
    if cli.werkzeug && operation.is_flash() {
        pins = profile::werkzeug(pins);
    }
    let role = operation.role();
    log::debug!("pins: {:?}", pins);

    let mut backend = Backend::open(cli, &pins.all())?;

    let result = {
        let mut bus = backend.spi(&pins, role);
        operate(cli, &mut *bus, pins, job)
    };
    let cleanup = finish(cli, &mut backend, pins, role);

    match (result, cleanup) {
        (Ok(_), Ok(_)) => Ok(()),
        (Err(e), Ok(_)) => Err(e),
        (Ok(_), Err(e)) => Err(e.context("Operation succeeded, but failed to release the device")),
        (Err(e), Err(r)) => {
            log::error!("And failed to release the device: {r:#}");
            Err(e)
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Device(operation) => device(cli, operation),
        Command::Gpio { pin, value } => gpio(cli, *pin, *value),
        Command::Cmd {
            op,
            arg1,
            arg2,
            arg3,
        } => raw_command(cli, *op, [*arg1, *arg2, *arg3]),
    }
}

fn log_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_filter(cli.verbose)),
    )
    .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

//! Error types shared by the transports and the flash/SRAM sequencers.

use std::path::PathBuf;
use thiserror::Error;

/// Failures of the pin or USB transport underneath the SPI layer.
///
/// None of these are retried; they abort the running operation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// USB enumeration, open or bulk transfer failed
    #[error("USB transfer failed: {0}")]
    Usb(#[from] rusb::Error),

    /// Local GPIO peripheral or pin could not be acquired
    #[error("GPIO access failed: {0}")]
    Gpio(#[from] rppal::gpio::Error),

    /// No bridge device matched the vendor/product ID (and bus/address, if pinned)
    #[error("no bridge device found{}", location_suffix(.0))]
    NoDevice(Option<(u8, u8)>),

    /// A bulk transfer moved fewer bytes than the frame requires
    #[error("short USB transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },

    /// The local backend was asked to drive a pin it never registered
    #[error("GPIO {0} was not registered with the local backend")]
    UnregisteredPin(u8),
}

fn location_suffix(location: &Option<(u8, u8)>) -> String {
    match location {
        Some((bus, address)) => format!(" at bus {bus} address {address}"),
        None => String::new(),
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The image could not be read, or the dump could not be written
    #[error("unable to access {}: {source}", .path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A page kept failing read-back verification until its retry budget ran out
    #[error("failed to write page at {address:#08x} after {attempts} attempts")]
    WriteVerifyFailed { address: u32, attempts: u32 },

    /// Standalone verify found differing blocks (strict mode only)
    #[error("{count} block(s) differ from the image")]
    VerifyMismatch { count: usize },

    /// The flash busy flag did not clear within the configured poll limit
    #[error("flash still busy after {polls} status polls")]
    BusyTimeout { polls: u32 },

    /// CDONE stayed low after streaming the bitstream (strict mode only)
    #[error("FPGA did not assert CDONE after configuration")]
    ConfigurationFailed,

    #[error("address {0:#x} is outside the 24-bit flash address space")]
    AddressOutOfRange(u32),

    #[error("page data must not exceed 256 bytes, got {0}")]
    PageOverflow(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<rusb::Error> for Error {
    fn from(e: rusb::Error) -> Self {
        Self::Transport(e.into())
    }
}

impl From<rppal::gpio::Error> for Error {
    fn from(e: rppal::gpio::Error) -> Self {
        Self::Transport(e.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

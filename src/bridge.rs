//! Relay transport through a USB-attached bridge microcontroller.
//!
//! Every request is one 64-byte frame on the bulk OUT endpoint:
//!
//! ```text
//! +--------+--------+----------+----------------------+
//! | opcode | length | reserved | payload (60 bytes)   |
//! +--------+--------+----------+----------------------+
//! ```
//!
//! Plain commands carry up to three argument bytes in the length and
//! reserved positions. Requests that return data are answered with one
//! 64-byte read on the bulk IN endpoint before the next request is sent.

use std::time::Duration;

use rusb::{DeviceHandle, GlobalContext};

use crate::error::{Result, TransportError};
use crate::pin::{Direction, PinAssignment, PinTransport};
use crate::spi::{LineRole, SpiBus};

pub const BRIDGE_VID: u16 = 0x2E8A;
pub const BRIDGE_PID: u16 = 0x1025;

const WRITE_EP: u8 = 0x01;
const READ_EP: u8 = 0x82;

pub const FRAME_LEN: usize = 64;
/// Largest SPI write carried by one frame
pub const WRITE_CHUNK: usize = 60;
/// Largest SPI read answered by one reply
pub const READ_CHUNK: usize = 64;

pub mod opcode {
    pub const INIT: u8 = 0x01;
    pub const GPIO_SET_DIR: u8 = 0x10;
    pub const GPIO_GET: u8 = 0x20;
    pub const GPIO_PUT: u8 = 0x21;
    pub const SPI_READ: u8 = 0x80;
    pub const SPI_WRITE: u8 = 0x81;
    pub const CFG_PIO_SPI: u8 = 0x8F;
}

/// Arguments to [`opcode::INIT`]
pub mod init {
    pub const DEFAULT: u8 = 0;
    /// Let go of the SPI pins
    pub const RELEASE: u8 = 1;
    /// Prepare the SPI engine for flash access
    pub const FLASH: u8 = 2;
    /// Hand the board back to its own firmware (bonbon, keks)
    pub const HANDOFF: u8 = 3;
}

/// One fixed-size request frame.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame([u8; FRAME_LEN]);

impl Frame {
    pub fn command(opcode: u8, args: [u8; 3]) -> Self {
        let mut frame = [0u8; FRAME_LEN];
        frame[0] = opcode;
        frame[1..4].copy_from_slice(&args);
        Self(frame)
    }

    /// An SPI write carrying the first 60 bytes of `payload`.
    fn spi_write(payload: &[u8]) -> Self {
        let len = payload.len().min(WRITE_CHUNK);
        let mut frame = [0u8; FRAME_LEN];
        frame[0] = opcode::SPI_WRITE;
        frame[1] = len as u8;
        frame[4..4 + len].copy_from_slice(&payload[..len]);
        Self(frame)
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:02x?}]", &self.0[..8])
    }
}

/// The pair of bulk endpoints frames travel over.
pub trait BulkPipe {
    fn send(&mut self, frame: &Frame) -> Result<()>;

    /// Read one reply; returns the number of bytes received.
    fn receive(&mut self, buf: &mut [u8; FRAME_LEN]) -> Result<usize>;
}

/// A claimed bridge device on the USB bus.
pub struct UsbPipe {
    handle: DeviceHandle<GlobalContext>,
    timeout: Duration,
}

impl UsbPipe {
    /// Open the first attached bridge, or the one at `location` (bus, address).
    pub fn open(location: Option<(u8, u8)>, timeout: Duration) -> Result<Self> {
        log::info!("devices found:");

        let mut chosen = None;
        let mut found = 0;
        for device in rusb::devices()?.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            if desc.vendor_id() != BRIDGE_VID || desc.product_id() != BRIDGE_PID {
                continue;
            }

            let (bus, address) = (device.bus_number(), device.address());
            log::info!(
                " vendor {:04x} id {:04x} serial {} bus {} addr {}",
                desc.vendor_id(),
                desc.product_id(),
                desc.serial_number_string_index().unwrap_or(0),
                bus,
                address
            );
            found += 1;

            if chosen.is_none() && location.map_or(true, |l| l == (bus, address)) {
                chosen = Some(device);
            }
        }

        if found == 0 {
            log::info!("none.");
        }

        let device = chosen.ok_or(TransportError::NoDevice(location))?;
        log::info!("using bus {} addr {}", device.bus_number(), device.address());

        let mut handle = device.open()?;
        // Not every platform can detach kernel drivers; the claim below
        // reports the real problem if one is bound
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            log::debug!("auto-detach unavailable: {}", e);
        }
        handle.claim_interface(0)?;

        Ok(Self { handle, timeout })
    }
}

impl BulkPipe for UsbPipe {
    fn send(&mut self, frame: &Frame) -> Result<()> {
        let written = self
            .handle
            .write_bulk(WRITE_EP, frame.as_bytes(), self.timeout)?;
        if written != FRAME_LEN {
            return Err(TransportError::ShortTransfer {
                expected: FRAME_LEN,
                actual: written,
            }
            .into());
        }
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8; FRAME_LEN]) -> Result<usize> {
        Ok(self.handle.read_bulk(READ_EP, buf, self.timeout)?)
    }
}

/// Command layer of the bridge protocol.
pub struct Bridge<P> {
    pipe: P,
}

impl<P: BulkPipe> Bridge<P> {
    pub fn new(pipe: P) -> Self {
        Self { pipe }
    }

    /// Send an arbitrary command frame.
    pub fn command(&mut self, opcode: u8, args: [u8; 3]) -> Result<()> {
        let frame = Frame::command(opcode, args);
        log::trace!("send cmd {:?}", frame);
        self.pipe.send(&frame)
    }

    pub fn init(&mut self, mode: u8) -> Result<()> {
        self.command(opcode::INIT, [mode, 0, 0])
    }

    /// Route the bridge's SPI engine to the given pins.
    pub fn configure_spi(&mut self, sck: u8, mosi: u8, miso: u8) -> Result<()> {
        self.command(opcode::CFG_PIO_SPI, [sck, mosi, miso])
    }

    /// Write `data` in frames of at most 60 bytes, one transfer each.
    pub fn spi_write(&mut self, data: &[u8]) -> Result<()> {
        for (i, chunk) in data.chunks(WRITE_CHUNK).enumerate() {
            log::trace!("spi_write: [{}/{}]", i * WRITE_CHUNK, data.len());
            self.pipe.send(&Frame::spi_write(chunk))?;
        }
        Ok(())
    }

    /// Clock `count` zero bytes, framed like [`Bridge::spi_write`].
    pub fn spi_dummy(&mut self, count: usize) -> Result<()> {
        const ZEROES: [u8; WRITE_CHUNK] = [0; WRITE_CHUNK];

        let mut remaining = count;
        while remaining > 0 {
            let len = remaining.min(WRITE_CHUNK);
            self.pipe.send(&Frame::spi_write(&ZEROES[..len]))?;
            remaining -= len;
        }
        Ok(())
    }

    /// Fill `buf` with SPI reads of at most 64 bytes, one request per reply.
    pub fn spi_read(&mut self, buf: &mut [u8]) -> Result<()> {
        for chunk in buf.chunks_mut(READ_CHUNK) {
            self.command(opcode::SPI_READ, [chunk.len() as u8, 0, 0])?;
            let reply = self.reply(chunk.len())?;
            chunk.copy_from_slice(&reply[..chunk.len()]);
        }
        Ok(())
    }

    fn reply(&mut self, expected: usize) -> Result<[u8; FRAME_LEN]> {
        let mut buf = [0u8; FRAME_LEN];
        let actual = self.pipe.receive(&mut buf)?;
        log::trace!("reply: {} bytes", actual);
        if actual < expected {
            return Err(TransportError::ShortTransfer { expected, actual }.into());
        }
        Ok(buf)
    }
}

impl<P: BulkPipe> PinTransport for Bridge<P> {
    fn set_direction(&mut self, pin: u8, direction: Direction) -> Result<()> {
        let dir = match direction {
            Direction::Input => 0,
            Direction::Output => 1,
        };
        self.command(opcode::GPIO_SET_DIR, [pin, dir, 0])
    }

    fn write(&mut self, pin: u8, high: bool) -> Result<()> {
        self.command(opcode::GPIO_PUT, [pin, high as u8, 0])
    }

    fn read(&mut self, pin: u8) -> Result<bool> {
        self.command(opcode::GPIO_GET, [pin, 0, 0])?;
        Ok(self.reply(1)?[0] != 0)
    }
}

/// SPI over the bridge: chip select by GPIO, data shifted by the bridge.
pub struct BridgeSpi<'a, P> {
    bridge: &'a mut Bridge<P>,
    pins: PinAssignment,
    role: LineRole,
}

impl<'a, P: BulkPipe> BridgeSpi<'a, P> {
    pub fn new(bridge: &'a mut Bridge<P>, pins: &PinAssignment, role: LineRole) -> Self {
        Self {
            bridge,
            pins: *pins,
            role,
        }
    }
}

impl<P: BulkPipe> SpiBus for BridgeSpi<'_, P> {
    fn claim(&mut self) -> Result<()> {
        let PinAssignment {
            cs, sck, mosi, miso, ..
        } = self.pins;

        self.bridge.init(init::DEFAULT)?;
        match self.role {
            LineRole::Flash => {
                self.bridge.init(init::FLASH)?;
                self.bridge.configure_spi(sck, mosi, miso)?;
            }
            LineRole::Configuration => {
                self.bridge.set_direction(miso, Direction::Output)?;
                self.bridge.set_direction(mosi, Direction::Input)?;
            }
        }
        self.bridge.set_direction(cs, Direction::Output)?;
        self.bridge.write(cs, true)
    }

    fn release(&mut self) -> Result<()> {
        self.bridge.init(init::RELEASE)?;
        for pin in [self.pins.sck, self.pins.mosi, self.pins.miso, self.pins.cs] {
            self.bridge.set_direction(pin, Direction::Input)?;
        }
        Ok(())
    }

    fn set_cs(&mut self, high: bool) -> Result<()> {
        self.bridge.write(self.pins.cs, high)
    }

    fn send_command(&mut self, command: u8) -> Result<()> {
        log::trace!(" spi_cmd [{:02x}]", command);
        self.bridge.spi_write(&[command])
    }

    fn send_address(&mut self, address: u32) -> Result<()> {
        let bytes = [(address >> 16) as u8, (address >> 8) as u8, address as u8];
        log::trace!(" spi_addr [{:02x?}]", bytes);
        self.bridge.spi_write(&bytes)
    }

    fn send_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.bridge.spi_write(data)
    }

    fn send_dummy(&mut self, count: usize) -> Result<()> {
        self.bridge.spi_dummy(count)
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        self.bridge.spi_read(buf)
    }

    fn pins(&mut self) -> &mut dyn PinTransport {
        &mut *self.bridge
    }
}

//! Byte-level SPI on top of a [`PinTransport`].
//!
//! The host is always the SPI master. What changes between operations is
//! which of the two shared data pins it drives: the flash listens on `mosi`,
//! while the FPGA in slave configuration mode listens on `miso`.

use crate::error::Result;
use crate::pin::{Direction, PinAssignment, PinTransport};

/// Which device the host talks to over the shared data pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineRole {
    /// SPI NOR flash access; the host drives `mosi`
    Flash,
    /// FPGA SRAM configuration; the host drives `miso`
    Configuration,
}

/// A chip-select framed SPI byte stream.
///
/// Implementations shift MSB first and sample on the rising clock edge.
pub trait SpiBus {
    /// Configure the SPI pins for this bus's role.
    fn claim(&mut self) -> Result<()>;

    /// Return the SPI pins to inputs so the FPGA can use them.
    fn release(&mut self) -> Result<()>;

    /// Drive the active-low chip select.
    fn set_cs(&mut self, high: bool) -> Result<()>;

    fn send_command(&mut self, command: u8) -> Result<()>;

    /// Shift a 24-bit flash address.
    fn send_address(&mut self, address: u32) -> Result<()>;

    fn send_bytes(&mut self, data: &[u8]) -> Result<()>;

    /// Clock `count` bytes without meaningful data.
    fn send_dummy(&mut self, count: usize) -> Result<()>;

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()>;

    fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8];
        self.read_bytes(&mut byte)?;
        Ok(byte[0])
    }

    /// The pin transport underneath, for the RESET and DONE lines.
    fn pins(&mut self) -> &mut dyn PinTransport;
}

impl<B: SpiBus + ?Sized> SpiBus for &mut B {
    fn claim(&mut self) -> Result<()> {
        (**self).claim()
    }

    fn release(&mut self) -> Result<()> {
        (**self).release()
    }

    fn set_cs(&mut self, high: bool) -> Result<()> {
        (**self).set_cs(high)
    }

    fn send_command(&mut self, command: u8) -> Result<()> {
        (**self).send_command(command)
    }

    fn send_address(&mut self, address: u32) -> Result<()> {
        (**self).send_address(address)
    }

    fn send_bytes(&mut self, data: &[u8]) -> Result<()> {
        (**self).send_bytes(data)
    }

    fn send_dummy(&mut self, count: usize) -> Result<()> {
        (**self).send_dummy(count)
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        (**self).read_bytes(buf)
    }

    fn read_byte(&mut self) -> Result<u8> {
        (**self).read_byte()
    }

    fn pins(&mut self) -> &mut dyn PinTransport {
        (**self).pins()
    }
}

/// SPI master that toggles every clock edge through individual pin writes.
pub struct BitBangSpi<T> {
    transport: T,
    cs: u8,
    sck: u8,
    output: u8,
    input: u8,
}

impl<T: PinTransport> BitBangSpi<T> {
    /// The role is fixed here; a bus never swaps lines mid-transfer.
    pub fn new(transport: T, pins: &PinAssignment, role: LineRole) -> Self {
        let (output, input) = match role {
            LineRole::Flash => (pins.mosi, pins.miso),
            LineRole::Configuration => (pins.miso, pins.mosi),
        };

        Self {
            transport,
            cs: pins.cs,
            sck: pins.sck,
            output,
            input,
        }
    }

    fn shift_out(&mut self, value: u32, bits: u32) -> Result<()> {
        for i in (0..bits).rev() {
            self.transport.write(self.sck, false)?;
            self.transport.write(self.output, (value >> i) & 1 != 0)?;
            self.transport.write(self.sck, true)?;
        }
        Ok(())
    }

    fn shift_in(&mut self) -> Result<u8> {
        let mut byte = 0u8;
        for i in (0..8).rev() {
            self.transport.write(self.sck, false)?;
            self.transport.write(self.sck, true)?;
            if self.transport.read(self.input)? {
                byte |= 1 << i;
            }
        }
        Ok(byte)
    }
}

impl<T: PinTransport> SpiBus for BitBangSpi<T> {
    fn claim(&mut self) -> Result<()> {
        self.transport.set_direction(self.cs, Direction::Output)?;
        self.transport.set_direction(self.sck, Direction::Output)?;
        self.transport.set_direction(self.output, Direction::Output)?;
        self.transport.set_direction(self.input, Direction::Input)?;
        self.transport.write(self.cs, true)?;
        self.transport.write(self.sck, false)
    }

    fn release(&mut self) -> Result<()> {
        for pin in [self.sck, self.output, self.input, self.cs] {
            self.transport.set_direction(pin, Direction::Input)?;
        }
        Ok(())
    }

    fn set_cs(&mut self, high: bool) -> Result<()> {
        self.transport.write(self.cs, high)
    }

    fn send_command(&mut self, command: u8) -> Result<()> {
        self.shift_out(command.into(), 8)
    }

    fn send_address(&mut self, address: u32) -> Result<()> {
        self.shift_out(address, 24)
    }

    fn send_bytes(&mut self, data: &[u8]) -> Result<()> {
        for &byte in data {
            self.shift_out(byte.into(), 8)?;
        }
        Ok(())
    }

    fn send_dummy(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.shift_out(0, 8)?;
        }
        Ok(())
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        for byte in buf.iter_mut() {
            *byte = self.shift_in()?;
        }
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8> {
        self.shift_in()
    }

    fn pins(&mut self) -> &mut dyn PinTransport {
        &mut self.transport
    }
}

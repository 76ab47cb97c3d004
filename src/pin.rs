//! Single-pin digital I/O, the layer every backend has to provide.

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// Direction/level control over individual GPIO pins.
///
/// Every call is one synchronous round trip to the hardware; nothing is
/// buffered. `write` is only meaningful on a pin previously set to
/// [`Direction::Output`], which the local backend does not check.
pub trait PinTransport {
    fn set_direction(&mut self, pin: u8, direction: Direction) -> Result<()>;

    fn write(&mut self, pin: u8, high: bool) -> Result<()>;

    fn read(&mut self, pin: u8) -> Result<bool>;
}

impl<T: PinTransport + ?Sized> PinTransport for &mut T {
    fn set_direction(&mut self, pin: u8, direction: Direction) -> Result<()> {
        (**self).set_direction(pin, direction)
    }

    fn write(&mut self, pin: u8, high: bool) -> Result<()> {
        (**self).write(pin, high)
    }

    fn read(&mut self, pin: u8) -> Result<bool> {
        (**self).read(pin)
    }
}

/// Which GPIO carries each signal between the host and the FPGA board.
///
/// Data lines are named from the flash's point of view: the host drives
/// `mosi` and samples `miso` while talking to the flash. During SRAM
/// configuration the FPGA is the SPI slave on the same pair and the roles
/// swap (see [`crate::spi::LineRole`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinAssignment {
    pub cs: u8,
    pub sck: u8,
    pub mosi: u8,
    pub miso: u8,
    pub reset: u8,
    pub done: u8,
}

impl PinAssignment {
    /// Every pin a run may touch, for backends that register pins up front.
    pub fn all(&self) -> [u8; 6] {
        [
            self.cs, self.sck, self.mosi, self.miso, self.reset, self.done,
        ]
    }
}

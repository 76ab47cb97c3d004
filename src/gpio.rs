//! Direct GPIO access through the Raspberry Pi's peripheral registers.

use std::collections::HashMap;

use rppal::gpio::{Gpio, IoPin, Level, Mode};

use crate::error::{Result, TransportError};
use crate::pin::{Direction, PinTransport};

/// Pins acquired from the local GPIO controller.
///
/// All pins are acquired when the backend is created, so a pin that is busy
/// or missing fails the run before any line is driven.
pub struct LocalGpio {
    pins: HashMap<u8, IoPin>,
}

impl LocalGpio {
    pub fn new(pins: &[u8]) -> Result<Self> {
        let gpio = Gpio::new()?;

        let mut acquired = HashMap::with_capacity(pins.len());
        for &number in pins {
            if acquired.contains_key(&number) {
                continue;
            }
            let mut pin = gpio.get(number)?.into_io(Mode::Input);
            // Leave lines where we put them on exit, so a held reset stays held
            pin.set_reset_on_drop(false);
            acquired.insert(number, pin);
        }

        log::debug!("Acquired local GPIO pins {:?}", pins);

        Ok(Self { pins: acquired })
    }

    fn pin(&mut self, number: u8) -> Result<&mut IoPin> {
        self.pins
            .get_mut(&number)
            .ok_or_else(|| TransportError::UnregisteredPin(number).into())
    }
}

impl PinTransport for LocalGpio {
    fn set_direction(&mut self, pin: u8, direction: Direction) -> Result<()> {
        let mode = match direction {
            Direction::Input => Mode::Input,
            Direction::Output => Mode::Output,
        };
        self.pin(pin)?.set_mode(mode);
        Ok(())
    }

    fn write(&mut self, pin: u8, high: bool) -> Result<()> {
        self.pin(pin)?.write(high.into());
        Ok(())
    }

    fn read(&mut self, pin: u8) -> Result<bool> {
        Ok(self.pin(pin)?.read() == Level::High)
    }
}

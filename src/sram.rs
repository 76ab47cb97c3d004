//! Loading a bitstream straight into the FPGA's configuration SRAM.
//!
//! The FPGA samples its SPI chip select when it leaves reset. Holding CS low
//! through the reset release puts it in SPI slave configuration mode, where
//! it accepts a bitstream from the host instead of reading its own flash.
//! The documentation for the sequence can be found here:
//! https://www.latticesemi.com/view_document?document_id=46502

use std::time::Duration;

use indicatif::ProgressBar;

use crate::config::{delay, Settings};
use crate::error::{Error, Result};
use crate::pin::{Direction, PinAssignment};
use crate::spi::SpiBus;

/// Dummy bytes clocked after the bitstream so the device can finish its
/// internal start-up (at least 49 clocks are required).
const TRAILING_DUMMY_BYTES: usize = 14;

/// Final state of CDONE after a configuration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigOutcome {
    pub done: bool,
}

/// Drives RESET/DONE and streams bitstreams over an [`SpiBus`] claimed in
/// the configuration role.
pub struct ConfigSequencer<B> {
    bus: B,
    pins: PinAssignment,
    settings: Settings,
    bar: ProgressBar,
}

impl<B: SpiBus> ConfigSequencer<B> {
    pub fn new(bus: B, pins: PinAssignment, settings: Settings) -> Self {
        Self {
            bus,
            pins,
            settings,
            bar: ProgressBar::hidden(),
        }
    }

    pub fn with_progress(mut self, bar: ProgressBar) -> Self {
        self.bar = bar;
        self
    }

    /// Reset the FPGA into slave configuration mode and stream `bitstream`.
    ///
    /// A low CDONE afterwards is only logged unless strict mode is set.
    pub fn load(&mut self, bitstream: &[u8]) -> Result<ConfigOutcome> {
        let timing = self.settings.timing;
        let PinAssignment {
            reset, done, sck, ..
        } = self.pins;

        log::info!("writing to sram ...");

        self.bus.claim()?;
        let pins = self.bus.pins();
        pins.set_direction(reset, Direction::Output)?;
        pins.set_direction(done, Direction::Input)?;

        if self.settings.manual_reset {
            log::info!("press reset button now");
        }

        // CS low while the FPGA comes out of reset selects slave mode
        self.bus.set_cs(false)?;
        self.bus.pins().write(reset, false)?;
        delay(timing.reset_hold);
        self.log_done()?;

        if self.settings.manual_reset {
            delay(timing.manual_reset_pause);
            log::info!("release reset button now");
            delay(timing.manual_reset_pause);
        }

        self.bus.pins().write(reset, true)?;
        delay(timing.reset_hold);
        self.log_done()?;

        // One byte with CS high primes the clock before the bitstream
        self.bus.set_cs(true)?;
        self.bus.pins().write(sck, true)?;
        self.bus.send_dummy(1)?;
        self.bus.set_cs(false)?;

        self.bar.set_length(bitstream.len() as u64);
        self.bar.set_position(0);
        for block in bitstream.chunks(4096) {
            self.bus.send_bytes(block)?;
            self.bar.inc(block.len() as u64);
        }
        self.bar.finish();

        self.bus.set_cs(true)?;
        self.bus.send_dummy(TRAILING_DUMMY_BYTES)?;

        delay(timing.done_wait);
        let done = self.log_done()?;

        if !done {
            if self.settings.strict {
                return Err(Error::ConfigurationFailed);
            }
            log::warn!("CDONE is low; the FPGA did not accept the bitstream");
        }

        Ok(ConfigOutcome { done })
    }

    /// Pulse RESET with the SPI pins released so the FPGA configures itself
    /// from flash. Returns the final CDONE level.
    pub fn reboot(&mut self) -> Result<bool> {
        let timing = self.settings.timing;
        let PinAssignment { reset, done, .. } = self.pins;

        log::info!("resetting FPGA");

        self.bus.release()?;
        let pins = self.bus.pins();
        pins.set_direction(reset, Direction::Output)?;
        pins.set_direction(done, Direction::Input)?;
        self.log_done()?;

        self.bus.pins().write(reset, false)?;
        delay(timing.reboot_pulse);
        self.bus.pins().write(reset, true)?;
        delay(timing.reboot_pulse);

        self.log_done()?;
        delay(timing.reboot_pulse);
        self.log_done()
    }

    /// Hold the FPGA in reset and report CDONE every `interval`.
    ///
    /// Runs forever when `samples` is `None`.
    pub fn watch_done(&mut self, interval: Duration, samples: Option<u32>) -> Result<()> {
        let PinAssignment { reset, done, .. } = self.pins;

        let pins = self.bus.pins();
        pins.set_direction(reset, Direction::Output)?;
        pins.set_direction(done, Direction::Input)?;
        pins.write(reset, false)?;
        log::info!("test mode; holding in reset");

        let mut taken = 0;
        while samples.map_or(true, |limit| taken < limit) {
            self.log_done()?;
            taken += 1;
            delay(interval);
        }
        Ok(())
    }

    fn log_done(&mut self) -> Result<bool> {
        let done = self.bus.pins().read(self.pins.done)?;
        log::info!("cdone: {}", done as u8);
        Ok(done)
    }
}

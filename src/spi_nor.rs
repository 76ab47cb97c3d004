//! SPI NOR flash command sequences.

use crate::config::{delay, Settings, Timing};
use crate::error::{Error, Result};
use crate::spi::SpiBus;

pub const PAGE_SIZE: usize = 256;
pub const SECTOR_SIZE: u32 = 4096;
const ADDRESS_LIMIT: u32 = 1 << 24;

/// Status register bit 0: erase or program in progress
const STATUS_BUSY: u8 = 0x01;

/// The fixed command set spoken to the configuration flash.
pub struct FlashProtocol<B> {
    bus: B,
    timing: Timing,
    busy_poll_limit: Option<u32>,
}

impl<B: SpiBus> FlashProtocol<B> {
    const PROGRAM: u8 = 0x02;
    const READ: u8 = 0x03;
    const READ_STATUS_1: u8 = 0x05;
    const WRITE_ENABLE: u8 = 0x06;
    const SECTOR_ERASE: u8 = 0x20;
    const GLOBAL_UNLOCK: u8 = 0x98;
    const JEDEC_ID: u8 = 0x9F;
    const WAKE: u8 = 0xAB;
    const CHIP_ERASE: u8 = 0xC7;

    pub fn new(bus: B, settings: &Settings) -> Self {
        Self {
            bus,
            timing: settings.timing,
            busy_poll_limit: settings.busy_poll_limit,
        }
    }

    pub fn bus(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn read_status(&mut self) -> Result<u8> {
        self.bus.set_cs(false)?;
        self.bus.send_command(Self::READ_STATUS_1)?;
        let status = self.bus.read_byte()?;
        self.bus.set_cs(true)?;
        Ok(status)
    }

    /// Poll the status register until the busy bit clears.
    pub fn wait_ready(&mut self) -> Result<()> {
        let mut polls = 0u32;
        while self.read_status()? & STATUS_BUSY != 0 {
            polls += 1;
            if let Some(limit) = self.busy_poll_limit {
                if polls >= limit {
                    return Err(Error::BusyTimeout { polls });
                }
            }
            delay(self.timing.busy_poll_interval);
        }
        Ok(())
    }

    /// CS-bracketed single opcode followed by the settle delay.
    ///
    /// Used for commands whose effect no status bit reports.
    fn settled_command(&mut self, command: u8) -> Result<()> {
        self.bus.set_cs(false)?;
        delay(self.timing.cs_setup);
        self.bus.send_command(command)?;
        delay(self.timing.cs_setup);
        self.bus.set_cs(true)?;
        delay(self.timing.command_settle);
        Ok(())
    }

    pub fn write_enable(&mut self) -> Result<()> {
        self.settled_command(Self::WRITE_ENABLE)
    }

    pub fn release_power_down(&mut self) -> Result<()> {
        self.settled_command(Self::WAKE)
    }

    /// Clear the block protection bits that would otherwise make erase and
    /// program silently do nothing.
    pub fn global_unlock(&mut self) -> Result<()> {
        self.settled_command(Self::GLOBAL_UNLOCK)
    }

    /// Erase the 4 KiB sector containing `address`.
    pub fn sector_erase(&mut self, address: u32) -> Result<()> {
        check_address(address)?;
        let address = address & !(SECTOR_SIZE - 1);

        self.write_enable()?;
        self.bus.set_cs(false)?;
        delay(self.timing.cs_setup);
        self.bus.send_command(Self::SECTOR_ERASE)?;
        self.bus.send_address(address)?;
        delay(self.timing.cs_setup);
        self.bus.set_cs(true)?;

        self.wait_ready()
    }

    pub fn page_program(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if data.len() > PAGE_SIZE {
            return Err(Error::PageOverflow(data.len()));
        }
        check_address(address)?;

        self.write_enable()?;
        self.bus.set_cs(false)?;
        self.bus.send_command(Self::PROGRAM)?;
        self.bus.send_address(address)?;
        self.bus.send_bytes(data)?;
        self.bus.set_cs(true)?;

        self.wait_ready()
    }

    /// Erase the whole chip. This can take tens of seconds.
    pub fn bulk_erase(&mut self) -> Result<()> {
        self.write_enable()?;
        self.bus.set_cs(false)?;
        delay(self.timing.cs_setup);
        self.bus.send_command(Self::CHIP_ERASE)?;
        delay(self.timing.cs_setup);
        self.bus.set_cs(true)?;

        self.wait_ready()
    }

    pub fn jedec_id(&mut self) -> Result<[u8; 5]> {
        let mut id = [0u8; 5];
        self.bus.set_cs(false)?;
        self.bus.send_command(Self::JEDEC_ID)?;
        self.bus.read_bytes(&mut id)?;
        self.bus.set_cs(true)?;
        Ok(id)
    }

    pub fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        check_address(address)?;

        self.bus.set_cs(false)?;
        self.bus.send_command(Self::READ)?;
        self.bus.send_address(address)?;
        self.bus.read_bytes(buf)?;
        self.bus.set_cs(true)?;
        Ok(())
    }
}

pub fn check_address(address: u32) -> Result<()> {
    if address >= ADDRESS_LIMIT {
        return Err(Error::AddressOutOfRange(address));
    }
    Ok(())
}

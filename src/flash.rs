//! Whole-image flash operations: program with verify, dump, verify, erase.
//!
//! Every operation first holds the FPGA in reset so it lets go of the flash,
//! then wakes the flash from deep power-down.

use std::io::Write;

use indicatif::ProgressBar;

use crate::config::{delay, Settings};
use crate::error::{Error, Result};
use crate::pin::{Direction, PinAssignment};
use crate::spi::SpiBus;
use crate::spi_nor::{check_address, FlashProtocol, PAGE_SIZE, SECTOR_SIZE};

/// Offsets of the blocks that differed during a standalone verify.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    /// Image-relative offset of each mismatching block
    pub mismatches: Vec<u32>,
}

impl VerifyReport {
    pub fn count(&self) -> usize {
        self.mismatches.len()
    }
}

pub struct FlashProgrammer<B> {
    nor: FlashProtocol<B>,
    pins: PinAssignment,
    settings: Settings,
    bar: ProgressBar,
}

impl<B: SpiBus> FlashProgrammer<B> {
    pub fn new(bus: B, pins: PinAssignment, settings: Settings) -> Self {
        Self {
            nor: FlashProtocol::new(bus, &settings),
            pins,
            settings,
            bar: ProgressBar::hidden(),
        }
    }

    /// Report progress of program, verify and dump through `bar`.
    pub fn with_progress(mut self, bar: ProgressBar) -> Self {
        self.bar = bar;
        self
    }

    /// Write `image` at `offset`, verifying every page as it goes.
    ///
    /// Sectors are erased first. A page that fails read-back is programmed
    /// again up to the retry budget; running out aborts with whatever has
    /// been written so far left in place.
    pub fn program(&mut self, image: &[u8], offset: u32) -> Result<()> {
        check_range(offset, image.len())?;
        let (start, sectors) = erase_span(offset, image.len());
        check_range(start, sectors as usize * SECTOR_SIZE as usize)?;

        self.hold_fpga()?;
        self.wake(true)?;

        self.erase_range(offset, image.len())?;

        log::info!("writing {} bytes @ {:#08x} ...", image.len(), offset);
        self.bar.set_length(image.len() as u64);
        self.bar.set_position(0);

        for (i, page) in image.chunks(PAGE_SIZE).enumerate() {
            let address = offset + (i * PAGE_SIZE) as u32;
            self.program_page(address, page)?;
            self.bar.inc(page.len() as u64);
        }
        self.bar.finish();

        log::info!("done writing.");
        self.log_status()
    }

    /// Erase the sectors an image of `len` bytes at `offset` lands in.
    ///
    /// Always erases one sector beyond `len / 4096`, which also covers the
    /// tail of an image that does not start on a sector boundary.
    /// The whole span is checked against the address space before the
    /// first sector is touched.
    pub fn erase_range(&mut self, offset: u32, len: usize) -> Result<()> {
        let (start, sectors) = erase_span(offset, len);
        check_range(start, sectors as usize * SECTOR_SIZE as usize)?;

        log::info!(
            "erasing flash from {:#08x} to {:#08x} ...",
            start,
            start + sectors * SECTOR_SIZE
        );

        for sector in 0..sectors {
            let address = start + sector * SECTOR_SIZE;
            log::debug!(" erasing 4K flash at {:#08x} ...", address);
            self.nor.sector_erase(address)?;
        }
        Ok(())
    }

    fn program_page(&mut self, address: u32, page: &[u8]) -> Result<()> {
        let mut readback = [0u8; PAGE_SIZE];
        let readback = &mut readback[..page.len()];
        let attempts = self.settings.page_retries;

        for attempt in 1..=attempts {
            log::debug!(" writing {} bytes @ {:#08x}", page.len(), address);

            // Each program consumes the write enable latch, so a retry
            // goes through page_program's write enable again
            self.nor.page_program(address, page)?;
            self.nor.read(address, readback)?;

            if readback == page {
                return Ok(());
            }
            log::warn!(
                "verify failed @ {:#08x} (attempt {}/{}); retrying",
                address,
                attempt,
                attempts
            );
        }

        Err(Error::WriteVerifyFailed { address, attempts })
    }

    /// Dump `size` bytes starting at `offset` into `sink`.
    pub fn read(&mut self, offset: u32, size: usize, sink: &mut impl Write) -> Result<()> {
        check_range(offset, size)?;

        self.hold_fpga()?;
        self.wake(false)?;
        self.log_id()?;

        log::info!("reading {} bytes @ {:#08x}", size, offset);
        self.bar.set_length(size as u64);
        self.bar.set_position(0);

        let mut chunk = [0u8; PAGE_SIZE];
        let mut done = 0;
        while done < size {
            let len = PAGE_SIZE.min(size - done);
            let address = offset + done as u32;
            log::debug!(" reading from {:#08x}", address);

            self.nor.read(address, &mut chunk[..len])?;
            sink.write_all(&chunk[..len])?;

            done += len;
            self.bar.inc(len as u64);
        }
        self.bar.finish();

        sink.flush()?;
        Ok(())
    }

    /// Compare the flash against `image`, block by block.
    ///
    /// Every differing block is logged and counted; a mismatch never stops
    /// the scan. In strict mode a non-zero count is returned as an error.
    pub fn verify(&mut self, image: &[u8], offset: u32) -> Result<VerifyReport> {
        check_range(offset, image.len())?;

        self.hold_fpga()?;
        self.wake(false)?;
        self.log_id()?;

        log::info!("verifying {} bytes @ {:#08x}", image.len(), offset);
        self.bar.set_length(image.len() as u64);
        self.bar.set_position(0);

        let mut report = VerifyReport::default();
        let mut flash = [0u8; PAGE_SIZE];

        for (i, expected) in image.chunks(PAGE_SIZE).enumerate() {
            let relative = (i * PAGE_SIZE) as u32;
            let flash = &mut flash[..expected.len()];
            self.nor.read(offset + relative, flash)?;

            if flash != expected {
                log::warn!(" *** mismatch @ {:#08x}", relative);
                log::info!("   FILE: {}", hex(expected));
                log::info!("  FLASH: {}", hex(flash));
                report.mismatches.push(relative);
            }
            self.bar.inc(expected.len() as u64);
        }
        self.bar.finish();

        log::info!("block mismatches: {}", report.count());

        if self.settings.strict && report.count() > 0 {
            return Err(Error::VerifyMismatch {
                count: report.count(),
            });
        }
        Ok(report)
    }

    /// Erase the entire chip.
    pub fn bulk_erase(&mut self) -> Result<()> {
        self.hold_fpga()?;
        self.wake(true)?;

        log::info!("erasing flash ...");
        self.nor.bulk_erase()?;
        log::info!("done erasing.");
        Ok(())
    }

    /// Keep the FPGA in reset so it tri-states its side of the flash bus.
    fn hold_fpga(&mut self) -> Result<()> {
        let cs_setup = self.nor.timing().cs_setup;
        let (reset, done) = (self.pins.reset, self.pins.done);

        let bus = self.nor.bus();
        bus.claim()?;
        let pins = bus.pins();
        pins.set_direction(reset, Direction::Output)?;
        pins.set_direction(done, Direction::Input)?;
        pins.write(reset, false)?;
        delay(cs_setup);

        bus.set_cs(true)?;
        delay(cs_setup);
        Ok(())
    }

    /// Bring the flash out of deep power-down, optionally lifting block protection.
    fn wake(&mut self, unlock: bool) -> Result<()> {
        self.log_status()?;

        log::info!("exiting power down mode");
        self.nor.release_power_down()?;
        self.log_status()?;

        if unlock {
            self.nor.write_enable()?;
            self.log_status()?;

            log::info!("global block unlock ...");
            self.nor.global_unlock()?;
            self.log_status()?;
        }
        Ok(())
    }

    fn log_status(&mut self) -> Result<()> {
        let status = self.nor.read_status()?;
        log::info!(" flash status: {:#04x}", status);
        Ok(())
    }

    fn log_id(&mut self) -> Result<()> {
        let id = self.nor.jedec_id()?;
        log::info!("flash id: {}", hex(&id));
        Ok(())
    }
}

/// First sector and sector count covering `len` bytes at `offset`.
fn erase_span(offset: u32, len: usize) -> (u32, u32) {
    let start = offset & !(SECTOR_SIZE - 1);
    let sectors = (len / SECTOR_SIZE as usize) as u32 + 1;
    (start, sectors)
}

fn check_range(offset: u32, len: usize) -> Result<()> {
    check_address(offset)?;
    if len > 0 {
        let last = u32::try_from(len - 1)
            .ok()
            .and_then(|l| offset.checked_add(l))
            .ok_or(Error::AddressOutOfRange(u32::MAX))?;
        check_address(last)?;
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SimFlash, PINS};

    fn programmer(flash: &mut SimFlash) -> FlashProgrammer<&mut SimFlash> {
        FlashProgrammer::new(flash, PINS, Settings::instant())
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_erase_count_is_one_past_block_count() {
        for (len, expected) in [(0usize, 1usize), (100, 1), (4096, 2), (10000, 3)] {
            let mut flash = SimFlash::new(0x10000);
            programmer(&mut flash).program(&pattern(len), 0).unwrap();

            assert_eq!(flash.count(0x20), expected, "image length {len}");

            let first_program = flash.opcodes().iter().position(|&op| op == 0x02);
            let last_erase = flash.opcodes().iter().rposition(|&op| op == 0x20);
            if let Some(first_program) = first_program {
                assert!(last_erase.unwrap() < first_program);
            }
        }
    }

    #[test]
    fn test_erase_starts_at_sector_boundary() {
        let mut flash = SimFlash::new(0x10000);
        programmer(&mut flash).program(&pattern(300), 0x1100).unwrap();

        let erases: Vec<_> = flash
            .transactions
            .iter()
            .filter(|t| t.opcode == 0x20)
            .map(|t| t.address)
            .collect();
        assert_eq!(erases, vec![Some(0x1000)]);
        assert_eq!(&flash.memory[0x1100..0x1100 + 300], &pattern(300)[..]);
    }

    #[test]
    fn test_program_writes_image() {
        let image = pattern(10000);
        let mut flash = SimFlash::new(0x20000);
        flash.memory.fill(0x00);

        programmer(&mut flash).program(&image, 0x4000).unwrap();

        assert_eq!(&flash.memory[0x4000..0x4000 + image.len()], &image[..]);
        // 39 full pages and one 16 byte tail
        assert_eq!(flash.count(0x02), 40);
        let tail = flash
            .transactions
            .iter()
            .filter(|t| t.opcode == 0x02)
            .last()
            .unwrap();
        assert_eq!(tail.address, Some(0x4000 + 39 * 256));
        assert_eq!(tail.data_len, 16);
    }

    #[test]
    fn test_program_holds_fpga_in_reset() {
        let mut flash = SimFlash::new(0x10000);
        programmer(&mut flash).program(&pattern(10), 0).unwrap();

        assert_eq!(flash.pins.level(PINS.reset), Some(false));
        assert_eq!(flash.pins.direction(PINS.done), Some(Direction::Input));

        let ops = flash.opcodes();
        let wake = ops.iter().position(|&op| op == 0xAB).unwrap();
        let unlock = ops.iter().position(|&op| op == 0x98).unwrap();
        let erase = ops.iter().position(|&op| op == 0x20).unwrap();
        assert!(wake < unlock && unlock < erase);
    }

    #[test]
    fn test_page_that_never_verifies_aborts_after_16_attempts() {
        let mut flash = SimFlash::new(0x10000);
        flash.drop_programs(0x100, u32::MAX);

        let result = programmer(&mut flash).program(&pattern(1024), 0);

        assert!(matches!(
            result,
            Err(Error::WriteVerifyFailed {
                address: 0x100,
                attempts: 16
            })
        ));
        let attempts = flash
            .transactions
            .iter()
            .filter(|t| t.opcode == 0x02 && t.address == Some(0x100))
            .count();
        assert_eq!(attempts, 16);
        // Earlier pages stay written, later ones are never attempted
        assert_eq!(&flash.memory[..256], &pattern(1024)[..256]);
        assert_eq!(flash.count(0x02), 17);
    }

    #[test]
    fn test_page_that_verifies_on_retry_succeeds() {
        let image = pattern(512);
        let mut flash = SimFlash::new(0x10000);
        flash.drop_programs(0x200, 1);

        programmer(&mut flash).program(&image, 0x100).unwrap();

        assert_eq!(&flash.memory[0x100..0x300], &image[..]);
        let attempts = flash
            .transactions
            .iter()
            .filter(|t| t.opcode == 0x02 && t.address == Some(0x200))
            .count();
        assert_eq!(attempts, 2);

        // The retry re-enables writes before programming again
        let ops: Vec<_> = flash
            .transactions
            .iter()
            .filter(|t| t.opcode != 0x05)
            .map(|t| (t.opcode, t.address))
            .collect();
        let first = ops.iter().position(|op| *op == (0x02, Some(0x200))).unwrap();
        assert_eq!(ops[first + 1], (0x03, Some(0x200)));
        assert_eq!(ops[first + 2], (0x06, None));
        assert_eq!(ops[first + 3], (0x02, Some(0x200)));
    }

    #[test]
    fn test_verify_clean_image() {
        let image = pattern(1000);
        let mut flash = SimFlash::new(0x10000);
        flash.memory[0x800..0x800 + 1000].copy_from_slice(&image);

        let report = programmer(&mut flash).verify(&image, 0x800).unwrap();
        assert_eq!(report.count(), 0);
    }

    #[test]
    fn test_verify_counts_every_mismatching_block() {
        let image = pattern(2048);
        let mut flash = SimFlash::new(0x10000);
        flash.memory[..2048].copy_from_slice(&image);
        flash.memory[10] ^= 0xFF;
        flash.memory[3 * 256 + 255] ^= 0x01;
        flash.memory[7 * 256] ^= 0x80;

        let report = programmer(&mut flash).verify(&image, 0).unwrap();
        assert_eq!(report.mismatches, vec![0, 3 * 256, 7 * 256]);
        // Every block is read even after the first mismatch
        assert_eq!(flash.count(0x03), 8);
        // Verify never writes
        assert_eq!(flash.count(0x02), 0);
        assert_eq!(flash.count(0x20), 0);
    }

    #[test]
    fn test_strict_verify_fails_on_mismatch() {
        let image = pattern(512);
        let mut flash = SimFlash::new(0x10000);
        let settings = Settings {
            strict: true,
            ..Settings::instant()
        };

        let result = FlashProgrammer::new(&mut flash, PINS, settings).verify(&image, 0);
        assert!(matches!(result, Err(Error::VerifyMismatch { count: 2 })));
    }

    #[test]
    fn test_read_appends_chunks_in_order() {
        let mut flash = SimFlash::new(0x10000);
        let contents = pattern(0x1000);
        flash.memory[0x3000..0x4000].copy_from_slice(&contents);

        let mut out = Vec::new();
        programmer(&mut flash).read(0x3000, 300, &mut out).unwrap();

        assert_eq!(out, &contents[..300]);
        let reads: Vec<_> = flash
            .transactions
            .iter()
            .filter(|t| t.opcode == 0x03)
            .map(|t| t.address)
            .collect();
        assert_eq!(reads, vec![Some(0x3000), Some(0x3100)]);
        assert_eq!(flash.count(0x9F), 1);
    }

    #[test]
    fn test_bulk_erase() {
        let mut flash = SimFlash::new(0x10000);
        flash.memory.fill(0x00);

        programmer(&mut flash).bulk_erase().unwrap();

        assert!(flash.memory.iter().all(|&b| b == 0xFF));
        let ops = flash.opcodes();
        let erase = ops.iter().position(|&op| op == 0xC7).unwrap();
        assert_eq!(ops[erase - 1], 0x06);
        assert!(ops[..erase].contains(&0x98));
    }

    #[test]
    fn test_trailing_erase_sector_past_end_is_rejected_up_front() {
        let mut flash = SimFlash::new(1 << 24);
        let result = programmer(&mut flash).program(&[0xA5; 4096], 0xFF_F000);

        assert!(matches!(result, Err(Error::AddressOutOfRange(_))));
        // Nothing was erased or written, and the FPGA was never held
        assert!(flash.transactions.is_empty());
        assert!(flash.pins.ops().is_empty());
    }

    #[test]
    fn test_image_in_last_sector_fits() {
        let mut flash = SimFlash::new(1 << 24);
        programmer(&mut flash)
            .program(&pattern(100), 0xFF_F000)
            .unwrap();

        assert_eq!(flash.count(0x20), 1);
        assert_eq!(&flash.memory[0xFF_F000..0xFF_F000 + 100], &pattern(100)[..]);
    }

    #[test]
    fn test_erase_range_checks_whole_span_first() {
        let mut flash = SimFlash::new(1 << 24);
        let result = programmer(&mut flash).erase_range(0xFF_E000, 8192);

        assert!(matches!(result, Err(Error::AddressOutOfRange(_))));
        assert_eq!(flash.count(0x20), 0);
    }

    #[test]
    fn test_image_past_end_of_address_space() {
        let mut flash = SimFlash::new(0x1000);
        let result = programmer(&mut flash).program(&[0u8; 512], 0xFF_FF00);
        assert!(matches!(result, Err(Error::AddressOutOfRange(_))));
        assert!(flash.transactions.is_empty());
    }
}

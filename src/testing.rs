//! In-memory stand-ins for the hardware, used by the unit tests.

use std::collections::{HashMap, VecDeque};

use crate::bridge::{BulkPipe, Frame, FRAME_LEN};
use crate::error::Result;
use crate::pin::{Direction, PinAssignment, PinTransport};
use crate::spi::SpiBus;

pub const PINS: PinAssignment = PinAssignment {
    cs: 9,
    sck: 10,
    mosi: 8,
    miso: 11,
    reset: 3,
    done: 2,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOp {
    SetDirection(u8, Direction),
    Write(u8, bool),
    Read(u8),
}

/// Records every pin operation and serves scripted input levels.
///
/// In loopback mode, each rising SCK edge shifts the level of one pin into a
/// FIFO that reads of another pin drain, like a one-wire shift register.
#[derive(Default)]
pub struct MockPins {
    ops: Vec<PinOp>,
    levels: HashMap<u8, bool>,
    directions: HashMap<u8, Direction>,
    scripted: HashMap<u8, VecDeque<bool>>,
    loopback: Option<(u8, u8, u8)>,
    shifted: VecDeque<bool>,
}

impl MockPins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loopback(clock: u8, from: u8, to: u8) -> Self {
        Self {
            loopback: Some((clock, from, to)),
            ..Self::default()
        }
    }

    /// Queue levels returned by successive reads of `pin`. The last level sticks.
    pub fn script(&mut self, pin: u8, levels: &[bool]) {
        self.scripted.entry(pin).or_default().extend(levels);
    }

    pub fn ops(&self) -> &[PinOp] {
        &self.ops
    }

    pub fn direction(&self, pin: u8) -> Option<Direction> {
        self.directions.get(&pin).copied()
    }

    pub fn level(&self, pin: u8) -> Option<bool> {
        self.levels.get(&pin).copied()
    }

    /// Levels of `data` at each write of SCK high.
    pub fn sampled_bits(&self, sck: u8, data: u8) -> Vec<bool> {
        let mut level = false;
        let mut bits = Vec::new();
        for op in &self.ops {
            match *op {
                PinOp::Write(pin, high) if pin == data => level = high,
                PinOp::Write(pin, true) if pin == sck => bits.push(level),
                _ => {}
            }
        }
        bits
    }

    /// Bytes shifted on `data` while CS was low, MSB first.
    pub fn sampled_bytes(&self, cs: u8, sck: u8, data: u8) -> Vec<u8> {
        let mut level = false;
        let mut selected = false;
        let mut bits = Vec::new();
        for op in &self.ops {
            match *op {
                PinOp::Write(pin, high) if pin == cs => selected = !high,
                PinOp::Write(pin, high) if pin == data => level = high,
                PinOp::Write(pin, true) if pin == sck && selected => bits.push(level),
                _ => {}
            }
        }
        bits.chunks_exact(8)
            .map(|bits| bits.iter().fold(0u8, |acc, &b| (acc << 1) | b as u8))
            .collect()
    }
}

impl PinTransport for MockPins {
    fn set_direction(&mut self, pin: u8, direction: Direction) -> Result<()> {
        self.ops.push(PinOp::SetDirection(pin, direction));
        self.directions.insert(pin, direction);
        Ok(())
    }

    fn write(&mut self, pin: u8, high: bool) -> Result<()> {
        self.ops.push(PinOp::Write(pin, high));
        self.levels.insert(pin, high);
        if let Some((clock, from, _)) = self.loopback {
            if high && pin == clock {
                let level = self.levels.get(&from).copied().unwrap_or(false);
                self.shifted.push_back(level);
            }
        }
        Ok(())
    }

    fn read(&mut self, pin: u8) -> Result<bool> {
        self.ops.push(PinOp::Read(pin));
        if let Some((_, _, to)) = self.loopback {
            if pin == to {
                return Ok(self.shifted.pop_front().unwrap_or(false));
            }
        }
        if let Some(queue) = self.scripted.get_mut(&pin) {
            if queue.len() > 1 {
                return Ok(queue.pop_front().unwrap_or(false));
            }
            return Ok(queue.front().copied().unwrap_or(false));
        }
        Ok(self.levels.get(&pin).copied().unwrap_or(false))
    }
}

/// One completed chip-select transaction seen by [`SimFlash`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub opcode: u8,
    pub address: Option<u32>,
    pub data_len: usize,
}

/// A byte-level model of a 3-byte-address SPI NOR flash.
///
/// Erased memory reads 0xFF, programs only clear bits, erase and program need
/// the write enable latch, and each completed erase or program reports busy
/// for `busy_polls` status reads.
pub struct SimFlash {
    pub memory: Vec<u8>,
    pub pins: MockPins,
    pub transactions: Vec<Transaction>,
    pub jedec: [u8; 5],
    pub busy_polls: u32,
    /// Remaining programs to silently drop, keyed by page address
    pub dropped_programs: HashMap<u32, u32>,
    pub stuck_busy: bool,
    selected: bool,
    opcode: Option<u8>,
    address: Option<u32>,
    data: Vec<u8>,
    cursor: usize,
    write_enabled: bool,
    busy_remaining: u32,
}

impl SimFlash {
    pub fn new(size: usize) -> Self {
        Self {
            memory: vec![0xFF; size],
            pins: MockPins::new(),
            transactions: Vec::new(),
            jedec: [0xEF, 0x40, 0x18, 0x00, 0x00],
            busy_polls: 2,
            dropped_programs: HashMap::new(),
            stuck_busy: false,
            selected: false,
            opcode: None,
            address: None,
            data: Vec::new(),
            cursor: 0,
            write_enabled: false,
            busy_remaining: 0,
        }
    }

    /// Drop the next `count` programs of the page at `address`.
    pub fn drop_programs(&mut self, address: u32, count: u32) {
        self.dropped_programs.insert(address, count);
    }

    pub fn opcodes(&self) -> Vec<u8> {
        self.transactions.iter().map(|t| t.opcode).collect()
    }

    pub fn count(&self, opcode: u8) -> usize {
        self.transactions
            .iter()
            .filter(|t| t.opcode == opcode)
            .count()
    }

    fn finish(&mut self) {
        let Some(opcode) = self.opcode.take() else {
            return;
        };
        let address = self.address.take();
        let data = std::mem::take(&mut self.data);
        self.transactions.push(Transaction {
            opcode,
            address,
            data_len: data.len(),
        });

        match opcode {
            0x06 => self.write_enabled = true,
            0x20 if self.write_enabled => {
                let start = (address.unwrap_or(0) & !0xFFF) as usize;
                self.memory[start..start + 4096].fill(0xFF);
                self.complete_write();
            }
            0xC7 if self.write_enabled => {
                self.memory.fill(0xFF);
                self.complete_write();
            }
            0x02 if self.write_enabled => {
                let address = address.unwrap_or(0);
                if let Some(remaining) = self.dropped_programs.get_mut(&address) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        self.complete_write();
                        return;
                    }
                }
                let page = address & !0xFF;
                for (i, byte) in data.iter().enumerate() {
                    let target = (page + ((address + i as u32) & 0xFF)) as usize;
                    self.memory[target] &= byte;
                }
                self.complete_write();
            }
            _ => {}
        }
    }

    fn complete_write(&mut self) {
        self.write_enabled = false;
        self.busy_remaining = self.busy_polls;
    }

    fn status(&mut self) -> u8 {
        let busy = self.stuck_busy || self.busy_remaining > 0;
        self.busy_remaining = self.busy_remaining.saturating_sub(1);
        (busy as u8) | ((self.write_enabled as u8) << 1)
    }
}

impl SpiBus for SimFlash {
    fn claim(&mut self) -> Result<()> {
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_cs(&mut self, high: bool) -> Result<()> {
        self.pins.write(PINS.cs, high)?;
        if high && self.selected {
            self.finish();
        }
        if !high && !self.selected {
            self.opcode = None;
            self.address = None;
            self.data.clear();
            self.cursor = 0;
        }
        self.selected = !high;
        Ok(())
    }

    fn send_command(&mut self, command: u8) -> Result<()> {
        match self.opcode {
            None => self.opcode = Some(command),
            Some(_) => self.data.push(command),
        }
        Ok(())
    }

    fn send_address(&mut self, address: u32) -> Result<()> {
        self.address = Some(address & 0xFF_FFFF);
        Ok(())
    }

    fn send_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn send_dummy(&mut self, count: usize) -> Result<()> {
        self.data.extend(std::iter::repeat(0).take(count));
        Ok(())
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        for byte in buf.iter_mut() {
            *byte = match self.opcode {
                Some(0x05) => self.status(),
                Some(0x03) => {
                    let address = self.address.unwrap_or(0) as usize + self.cursor;
                    self.memory.get(address).copied().unwrap_or(0xFF)
                }
                Some(0x9F) => self.jedec[self.cursor % self.jedec.len()],
                _ => 0xFF,
            };
            self.cursor += 1;
        }
        Ok(())
    }

    fn pins(&mut self) -> &mut dyn PinTransport {
        &mut self.pins
    }
}

/// Records every frame sent and answers reads from a queue.
#[derive(Default)]
pub struct RecordingPipe {
    pub sent: Vec<Frame>,
    pub replies: VecDeque<Vec<u8>>,
}

impl RecordingPipe {
    pub fn reply_with(&mut self, bytes: &[u8]) {
        self.replies.push_back(bytes.to_vec());
    }
}

impl BulkPipe for RecordingPipe {
    fn send(&mut self, frame: &Frame) -> Result<()> {
        self.sent.push(frame.clone());
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8; FRAME_LEN]) -> Result<usize> {
        let reply = self.replies.pop_front().unwrap_or_else(|| vec![0; FRAME_LEN]);
        buf[..reply.len()].copy_from_slice(&reply);
        Ok(reply.len())
    }
}

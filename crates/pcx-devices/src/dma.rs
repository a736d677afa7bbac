//! Intel 8237A DMA controller.
//!
//! Four channels per controller; address and count registers are programmed
//! a byte at a time through a shared low/high flip-flop. Transfers run as an
//! explicit trampoline: a step either completes synchronously and the loop
//! continues, or the device reports [`DmaFetch::Pending`] and the controller
//! parks the channel until [`Dma8237::resume_fetch`] re-enters the same
//! advance logic. Masking a channel cancels an in-flight step; the resume
//! path re-checks the mask before touching memory.

use pcx_io_snapshot::{
    IoSnapshot, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, warn};

pub const DMA0_BASE: u16 = 0x00;
pub const DMA1_BASE: u16 = 0xC0;
pub const DMA0_PAGES: [u16; 4] = [0x87, 0x83, 0x81, 0x82];
pub const DMA1_PAGES: [u16; 4] = [0x8F, 0x8B, 0x89, 0x8A];

const REG_STATUS_COMMAND: u16 = 0x8;
const REG_REQUEST: u16 = 0x9;
const REG_MASK_SINGLE: u16 = 0xA;
const REG_MODE: u16 = 0xB;
const REG_CLEAR_FLIPFLOP: u16 = 0xC;
const REG_TEMP_MASTER_CLEAR: u16 = 0xD;
const REG_CLEAR_MASK: u16 = 0xE;
const REG_MASK_ALL: u16 = 0xF;

const MODE_TYPE: u8 = 0x0C;
const MODE_TYPE_VERIFY: u8 = 0x00;
const MODE_TYPE_WRITE: u8 = 0x04;
const MODE_TYPE_READ: u8 = 0x08;
const MODE_AUTOINIT: u8 = 0x10;
const MODE_DECREMENT: u8 = 0x20;

const COMMAND_DISABLE: u8 = 0x04;

/// Byte read and write access to guest physical memory.
pub trait DmaMemory {
    fn read_byte(&mut self, addr: u32) -> u8;
    fn write_byte(&mut self, addr: u32, value: u8);
}

/// Outcome of asking a device for the next write-type transfer byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaFetch {
    Byte(u8),
    /// The device has run out of data; the controller synthesizes 0xFF.
    Exhausted,
    /// The device will answer later through [`Dma8237::resume_fetch`].
    Pending,
}

/// Outcome of handing a device a read-type transfer byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaStore {
    Accepted,
    /// The device cannot accept more data. Recorded, not fatal.
    Rejected,
}

/// A device backend bound to one DMA channel at a time.
pub trait DmaDevice {
    /// Next byte for a write-type (device to memory) transfer.
    fn fetch(&mut self) -> DmaFetch;
    /// Consumes a byte of a read-type (memory to device) transfer.
    fn store(&mut self, value: u8) -> DmaStore;
}

type DoneCallback = Box<dyn FnOnce(bool)>;

struct DmaChannel {
    masked: bool,
    page: u8,
    mode: u8,
    base_addr: [u8; 2],
    cur_addr: [u8; 2],
    base_count: [u8; 2],
    cur_count: [u8; 2],
    err: bool,
    /// A write-type fetch is outstanding; the device owes us a resume.
    in_flight: bool,
    device: Option<Rc<RefCell<dyn DmaDevice>>>,
    done: Option<DoneCallback>,
}

impl Default for DmaChannel {
    fn default() -> Self {
        Self {
            masked: true, // channels come up masked after reset
            page: 0,
            mode: 0,
            base_addr: [0; 2],
            cur_addr: [0; 2],
            base_count: [0; 2],
            cur_count: [0; 2],
            err: false,
            in_flight: false,
            device: None,
            done: None,
        }
    }
}

impl DmaChannel {
    fn phys_addr(&self) -> u32 {
        (u32::from(self.page) << 16) | u32::from(u16::from_le_bytes(self.cur_addr))
    }
}

enum StepOutcome {
    Continue,
    TerminalCount,
}

pub struct Dma8237 {
    command: u8,
    status: u8,
    request: u8,
    temp: u8,
    flipflop: bool,
    channels: [DmaChannel; 4],
    base: u16,
    /// Register stride: 1 on the first controller, 2 on the second.
    stride: u16,
    page_ports: [u16; 4],
    memory: Rc<RefCell<dyn DmaMemory>>,
}

impl Dma8237 {
    pub fn new(
        base: u16,
        stride: u16,
        page_ports: [u16; 4],
        memory: Rc<RefCell<dyn DmaMemory>>,
    ) -> Self {
        Self {
            command: 0,
            status: 0,
            request: 0,
            temp: 0,
            flipflop: false,
            channels: Default::default(),
            base,
            stride: stride.max(1),
            page_ports,
            memory,
        }
    }

    /// Primary controller at ports 0x00-0x0F with pages 0x87/0x83/0x81/0x82.
    pub fn primary(memory: Rc<RefCell<dyn DmaMemory>>) -> Self {
        Self::new(DMA0_BASE, 1, DMA0_PAGES, memory)
    }

    /// Secondary controller at ports 0xC0-0xDF (stride 2) with its own pages.
    pub fn secondary(memory: Rc<RefCell<dyn DmaMemory>>) -> Self {
        Self::new(DMA1_BASE, 2, DMA1_PAGES, memory)
    }

    pub fn handles(&self, port: u16) -> bool {
        self.reg_for_port(port).is_some() || self.page_ports.contains(&port)
    }

    fn reg_for_port(&self, port: u16) -> Option<u16> {
        let off = port.wrapping_sub(self.base);
        if off < 0x10 * self.stride && off % self.stride == 0 {
            Some(off / self.stride)
        } else {
            None
        }
    }

    /// Binds a device to a channel. Resets the completion slot and error
    /// flag; the previous binding (and any pending callback) is dropped.
    pub fn connect(&mut self, channel: usize, device: Rc<RefCell<dyn DmaDevice>>) {
        let ch = &mut self.channels[channel];
        ch.device = Some(device);
        ch.done = None;
        ch.err = false;
        ch.in_flight = false;
    }

    /// Registers a completion callback and starts the transfer if the
    /// channel is unmasked. The callback receives `true` on a clean
    /// terminal count, `false` if any step recorded an error.
    pub fn request(&mut self, channel: usize, done: impl FnOnce(bool) + 'static) {
        self.channels[channel].done = Some(Box::new(done));
        self.request |= 1 << channel;
        self.run_channel(channel);
    }

    pub fn write_port(&mut self, port: u16, value: u8) {
        if let Some(idx) = self.page_ports.iter().position(|&p| p == port) {
            self.channels[idx].page = value;
            return;
        }
        let Some(reg) = self.reg_for_port(port) else {
            return;
        };
        match reg {
            0..=7 => {
                let ch = &mut self.channels[usize::from(reg) / 2];
                let half = usize::from(self.flipflop);
                self.flipflop = !self.flipflop;
                if reg % 2 == 0 {
                    ch.base_addr[half] = value;
                    ch.cur_addr[half] = value;
                } else {
                    ch.base_count[half] = value;
                    ch.cur_count[half] = value;
                }
            }
            REG_STATUS_COMMAND => self.command = value,
            REG_REQUEST => {
                let channel = usize::from(value & 3);
                if value & 0x04 != 0 {
                    self.request |= 1 << channel;
                    self.run_channel(channel);
                } else {
                    self.request &= !(1 << channel);
                }
            }
            REG_MASK_SINGLE => {
                let channel = usize::from(value & 3);
                let mask = value & 0x04 != 0;
                self.channels[channel].masked = mask;
                if !mask {
                    self.run_channel(channel);
                }
            }
            REG_MODE => {
                self.channels[usize::from(value & 3)].mode = value;
            }
            REG_CLEAR_FLIPFLOP => self.flipflop = false,
            REG_TEMP_MASTER_CLEAR => self.master_clear(),
            REG_CLEAR_MASK => {
                for channel in 0..4 {
                    self.channels[channel].masked = false;
                    self.run_channel(channel);
                }
            }
            REG_MASK_ALL => {
                for channel in 0..4 {
                    self.channels[channel].masked = value & (1 << channel) != 0;
                }
                for channel in 0..4 {
                    if !self.channels[channel].masked {
                        self.run_channel(channel);
                    }
                }
            }
            _ => {}
        }
    }

    pub fn read_port(&mut self, port: u16) -> u8 {
        if let Some(idx) = self.page_ports.iter().position(|&p| p == port) {
            return self.channels[idx].page;
        }
        let Some(reg) = self.reg_for_port(port) else {
            return 0xFF;
        };
        match reg {
            0..=7 => {
                let ch = &self.channels[usize::from(reg) / 2];
                let half = usize::from(self.flipflop);
                self.flipflop = !self.flipflop;
                if reg % 2 == 0 {
                    ch.cur_addr[half]
                } else {
                    ch.cur_count[half]
                }
            }
            REG_STATUS_COMMAND => {
                // TC bits clear on read. Channel 0 runs DRAM refresh on a
                // real board and perpetually reports terminal count, which
                // memory-test firmware polls for.
                let value = self.status | (self.request << 4) | 0x01;
                self.status = 0;
                value
            }
            REG_TEMP_MASTER_CLEAR => self.temp,
            _ => 0xFF,
        }
    }

    /// Master clear: resets controller registers, clears the flip-flop and
    /// masks every channel. Programmed address/count/page values survive.
    pub fn master_clear(&mut self) {
        self.command = 0;
        self.status = 0;
        self.request = 0;
        self.temp = 0;
        self.flipflop = false;
        for ch in &mut self.channels {
            ch.masked = true;
            ch.in_flight = false;
        }
    }

    fn transfer_enabled(&self, channel: usize) -> bool {
        self.command & COMMAND_DISABLE == 0 && !self.channels[channel].masked
    }

    /// A channel only moves bytes once something asked it to: a bound
    /// device or a software request. Unmasking an idle channel is inert.
    fn wants_transfer(&self, channel: usize) -> bool {
        self.request & (1 << channel) != 0 || self.channels[channel].device.is_some()
    }

    /// Runs transfer steps until terminal count, a pending device fetch, or
    /// the channel becomes ineligible.
    fn run_channel(&mut self, channel: usize) {
        while self.transfer_enabled(channel) && self.wants_transfer(channel) {
            if self.channels[channel].in_flight {
                // The device still owes a byte; nothing to do until resume.
                return;
            }
            let mode = self.channels[channel].mode;
            let addr = self.channels[channel].phys_addr();
            match mode & MODE_TYPE {
                MODE_TYPE_WRITE => {
                    let Some(device) = self.channels[channel].device.clone() else {
                        warn!(channel, "write-type DMA with no device, synthesizing 0xFF");
                        self.channels[channel].err = true;
                        self.memory.borrow_mut().write_byte(addr, 0xFF);
                        if self.finish_step(channel) {
                            return;
                        }
                        continue;
                    };
                    let fetched = device.borrow_mut().fetch();
                    match fetched {
                        DmaFetch::Byte(byte) => {
                            self.memory.borrow_mut().write_byte(addr, byte);
                        }
                        DmaFetch::Exhausted => {
                            warn!(channel, "DMA device out of data, synthesizing 0xFF");
                            self.channels[channel].err = true;
                            self.memory.borrow_mut().write_byte(addr, 0xFF);
                        }
                        DmaFetch::Pending => {
                            self.channels[channel].in_flight = true;
                            return;
                        }
                    }
                }
                MODE_TYPE_READ => {
                    let byte = self.memory.borrow_mut().read_byte(addr);
                    match self.channels[channel].device.clone() {
                        Some(device) => {
                            if device.borrow_mut().store(byte) == DmaStore::Rejected {
                                self.channels[channel].err = true;
                            }
                        }
                        None => self.channels[channel].err = true,
                    }
                }
                MODE_TYPE_VERIFY => {}
                other => {
                    debug!(channel, mode = other, "cascade DMA mode ignored");
                    return;
                }
            }
            if self.finish_step(channel) {
                return;
            }
        }
    }

    /// Device completion for a fetch that previously answered `Pending`.
    /// Re-enters the transfer loop from the top; a channel masked since the
    /// fetch was issued drops the byte without touching memory.
    pub fn resume_fetch(&mut self, channel: usize, fetched: DmaFetch) {
        let ch = &mut self.channels[channel];
        if !ch.in_flight {
            debug!(channel, "DMA resume with no fetch outstanding, ignored");
            return;
        }
        ch.in_flight = false;
        if ch.masked {
            return;
        }
        let addr = ch.phys_addr();
        match fetched {
            DmaFetch::Byte(byte) => self.memory.borrow_mut().write_byte(addr, byte),
            DmaFetch::Exhausted => {
                warn!(channel, "DMA device out of data, synthesizing 0xFF");
                self.channels[channel].err = true;
                self.memory.borrow_mut().write_byte(addr, 0xFF);
            }
            DmaFetch::Pending => {
                self.channels[channel].in_flight = true;
                return;
            }
        }
        if !self.finish_step(channel) {
            self.run_channel(channel);
        }
    }

    /// Advances address and count after a transferred byte. Returns `true`
    /// when the channel reached terminal count and the loop must stop.
    fn finish_step(&mut self, channel: usize) -> bool {
        let ch = &mut self.channels[channel];
        let addr = u16::from_le_bytes(ch.cur_addr);
        ch.cur_addr = if ch.mode & MODE_DECREMENT != 0 {
            addr.wrapping_sub(1)
        } else {
            addr.wrapping_add(1)
        }
        .to_le_bytes();

        let count = u16::from_le_bytes(ch.cur_count);
        if count != 0 {
            ch.cur_count = (count - 1).to_le_bytes();
            return false;
        }

        // Count would go to -1: terminal count.
        self.status |= 1 << channel;
        self.request &= !(1 << channel);
        let ch = &mut self.channels[channel];
        if ch.mode & MODE_AUTOINIT != 0 {
            ch.cur_addr = ch.base_addr;
            ch.cur_count = ch.base_count;
            true
        } else {
            ch.masked = true;
            ch.device = None;
            let err = ch.err;
            if let Some(done) = ch.done.take() {
                done(!err);
            }
            true
        }
    }
}

impl IoSnapshot for Dma8237 {
    const DEVICE_ID: [u8; 4] = *b"DMA7";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.put_u8(0x0001, self.command);
        w.put_u8(0x0002, self.status);
        w.put_u8(0x0003, self.request);
        w.put_u8(0x0004, self.temp);
        w.put_bool(0x0005, self.flipflop);
        w.put_u16(0x0006, self.base);
        w.put_u16(0x0007, self.stride);
        for (i, ch) in self.channels.iter().enumerate() {
            let tag = 0x0100 * (i as u16 + 1);
            w.put_bool(tag, ch.masked);
            w.put_u8(tag + 1, ch.page);
            w.put_u8(tag + 2, ch.mode);
            w.put_bytes(tag + 3, &ch.base_addr);
            w.put_bytes(tag + 4, &ch.cur_addr);
            w.put_bytes(tag + 5, &ch.base_count);
            w.put_bytes(tag + 6, &ch.cur_count);
            w.put_bool(tag + 7, ch.err);
            w.put_bool(tag + 8, ch.in_flight);
        }
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID, Self::DEVICE_VERSION)?;
        self.command = r.u8(0x0001)?;
        self.status = r.u8(0x0002)?;
        self.request = r.u8(0x0003)?;
        self.temp = r.u8(0x0004)?;
        self.flipflop = r.bool(0x0005)?;
        self.base = r.u16(0x0006)?;
        self.stride = r.u16(0x0007)?.max(1);
        for (i, ch) in self.channels.iter_mut().enumerate() {
            let tag = 0x0100 * (i as u16 + 1);
            ch.masked = r.bool(tag)?;
            ch.page = r.u8(tag + 1)?;
            ch.mode = r.u8(tag + 2)?;
            ch.base_addr = r.bytes::<2>(tag + 3)?;
            ch.cur_addr = r.bytes::<2>(tag + 4)?;
            ch.base_count = r.bytes::<2>(tag + 5)?;
            ch.cur_count = r.bytes::<2>(tag + 6)?;
            ch.err = r.bool(tag + 7)?;
            ch.in_flight = r.bool(tag + 8)?;
            // Device bindings and completion callbacks do not survive a
            // snapshot; backends reconnect after restore.
            ch.device = None;
            ch.done = None;
        }
        Ok(())
    }
}

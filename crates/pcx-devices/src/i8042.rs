//! Intel 8042 keyboard controller, plus the reduced 8041 analog used by
//! earlier machines.
//!
//! The controller mediates between the CPU (data/status/command ports), the
//! attached keyboard device, and two system lines it happens to own on a PC:
//! the A20 gate and the reset line, both driven through its output port.

use crate::irq::IrqLine;
use bitflags::bitflags;
use pcx_io_snapshot::{
    IoSnapshot, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, warn};

pub const KBC_DATA: u16 = 0x60;
pub const KBC_STATUS: u16 = 0x64;

bitflags! {
    /// 8042 status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KbcStatus: u8 {
        const OUTPUT_FULL = 0x01;
        const INPUT_FULL = 0x02;
        const SYSTEM_FLAG = 0x04;
        const COMMAND_FLAG = 0x08;
        const UNLOCKED = 0x10;
        const TIMEOUT = 0x40;
        const PARITY_ERROR = 0x80;
    }
}

// Command-data ("command byte") bits, read/written via commands 0x20/0x60.
const CMD_DATA_IRQ_ENABLE: u8 = 0x01;
const CMD_DATA_SYSTEM_FLAG: u8 = 0x04;
const CMD_DATA_NO_CLOCK: u8 = 0x10;
const CMD_DATA_TRANSLATE: u8 = 0x40;

// Output port bits.
const OUTPUT_PORT_NO_RESET: u8 = 0x01;
const OUTPUT_PORT_A20: u8 = 0x02;
const OUTPUT_PORT_OUTPUT_FULL: u8 = 0x10;

// Controller commands (written to the command port).
const CMD_READ_COMMAND_BYTE: u8 = 0x20;
const CMD_WRITE_COMMAND_BYTE: u8 = 0x60;
const CMD_SELF_TEST: u8 = 0xAA;
const CMD_INTERFACE_TEST: u8 = 0xAB;
const CMD_DISABLE_KEYBOARD: u8 = 0xAD;
const CMD_ENABLE_KEYBOARD: u8 = 0xAE;
const CMD_READ_INPUT_PORT: u8 = 0xC0;
const CMD_READ_OUTPUT_PORT: u8 = 0xD0;
const CMD_WRITE_OUTPUT_PORT: u8 = 0xD1;
const CMD_READ_TEST_BITS: u8 = 0xE0;

const SELF_TEST_OK: u8 = 0x55;
const INTERFACE_TEST_OK: u8 = 0x00;

/// Scan-code source attached to the controller's keyboard port.
pub trait KeyboardDevice {
    /// Next pending scan code, if any.
    fn read_scan_code(&mut self) -> Option<u8>;
    /// Drops all pending scan codes.
    fn flush(&mut self);
    /// Interface state pushed down by the controller. A held `inhibit`
    /// parks the data line (the device buffers instead of sending); a low
    /// `clock` stops the interface entirely.
    fn set_enabled(&mut self, inhibit: bool, clock: bool);
    /// A data byte the controller passed through as a direct command.
    fn send_byte(&mut self, byte: u8);
}

/// System lines the keyboard controller drives: the A20 gate and the two
/// reset flavors (CPU-register-only versus full machine).
pub trait SystemControlSink {
    fn set_a20(&mut self, enabled: bool);
    fn request_cpu_reset(&mut self);
    fn request_full_reset(&mut self);
}

pub struct I8042 {
    status: KbcStatus,
    input_buffer: u8,
    output_buffer: u8,
    command_byte: u8,
    input_port: u8,
    output_port: u8,
    pending_command: Option<u8>,
    /// Hides OUTPUT_FULL from exactly one status poll. Firmware that
    /// flushes the output buffer right after issuing a command would
    /// otherwise discard the real response.
    output_delay: bool,
    keyboard: Option<Rc<RefCell<dyn KeyboardDevice>>>,
    system: Option<Box<dyn SystemControlSink>>,
    irq: Option<Box<dyn IrqLine>>,
}

impl I8042 {
    pub fn new() -> Self {
        Self {
            status: KbcStatus::SYSTEM_FLAG | KbcStatus::UNLOCKED,
            input_buffer: 0,
            output_buffer: 0,
            command_byte: CMD_DATA_IRQ_ENABLE | CMD_DATA_SYSTEM_FLAG | CMD_DATA_TRANSLATE,
            input_port: 0xFF,
            output_port: OUTPUT_PORT_NO_RESET | OUTPUT_PORT_A20,
            pending_command: None,
            output_delay: false,
            keyboard: None,
            system: None,
            irq: None,
        }
    }

    pub fn connect_keyboard(&mut self, keyboard: Rc<RefCell<dyn KeyboardDevice>>) {
        self.keyboard = Some(keyboard);
    }

    pub fn connect_system(&mut self, system: impl SystemControlSink + 'static) {
        self.system = Some(Box::new(system));
    }

    /// Connects the IRQ1 line. Model-specific acknowledgment delay is the
    /// line implementation's concern.
    pub fn connect_irq(&mut self, line: impl IrqLine + 'static) {
        self.irq = Some(Box::new(line));
    }

    fn clocking_enabled(&self) -> bool {
        self.command_byte & CMD_DATA_NO_CLOCK == 0
    }

    fn push_keyboard_enable(&mut self) {
        let clock = self.clocking_enabled();
        let inhibit = !self.status.contains(KbcStatus::UNLOCKED);
        if let Some(keyboard) = self.keyboard.as_ref() {
            keyboard.borrow_mut().set_enabled(inhibit, clock);
        }
    }

    fn set_irq_level(&mut self, level: bool) {
        if let Some(irq) = self.irq.as_ref() {
            irq.set_level(level);
        }
    }

    /// Places a controller response in the output buffer. Responses travel
    /// the delayed path: the next status poll still reports "empty".
    fn respond(&mut self, byte: u8) {
        self.output_buffer = byte;
        self.status.insert(KbcStatus::OUTPUT_FULL);
        self.output_delay = true;
    }

    /// Accepts a scan code when clocking is on and the buffer is free.
    /// Returns `true` if the byte was taken.
    fn accept_scan_code(&mut self, byte: u8) -> bool {
        if !self.clocking_enabled() || self.status.contains(KbcStatus::OUTPUT_FULL) {
            return false;
        }
        self.output_buffer = byte;
        self.status.insert(KbcStatus::OUTPUT_FULL);
        if self.command_byte & CMD_DATA_IRQ_ENABLE != 0 {
            self.set_irq_level(true);
        }
        true
    }

    /// Pulls the next pending byte out of the keyboard device if the
    /// controller can take it. Call after injecting input host-side.
    pub fn poll_keyboard(&mut self) {
        if !self.clocking_enabled() || self.status.contains(KbcStatus::OUTPUT_FULL) {
            return;
        }
        let Some(keyboard) = self.keyboard.clone() else {
            return;
        };
        let byte = keyboard.borrow_mut().read_scan_code();
        if let Some(byte) = byte {
            self.accept_scan_code(byte);
        }
    }

    pub fn read_port(&mut self, port: u16) -> u8 {
        match port {
            KBC_DATA => self.read_data(),
            KBC_STATUS => self.read_status(),
            _ => 0xFF,
        }
    }

    pub fn write_port(&mut self, port: u16, value: u8) {
        match port {
            KBC_DATA => self.write_data(value),
            KBC_STATUS => self.write_command(value),
            _ => {}
        }
    }

    fn read_status(&mut self) -> u8 {
        let mut status = self.status;
        if self.output_delay {
            // Held back for exactly this one poll.
            self.output_delay = false;
            status.remove(KbcStatus::OUTPUT_FULL);
        }
        status.bits()
    }

    fn read_data(&mut self) -> u8 {
        let byte = self.output_buffer;
        self.status.remove(KbcStatus::OUTPUT_FULL);
        self.output_delay = false;
        self.set_irq_level(false);
        // A freed buffer may immediately admit the next scan code.
        self.poll_keyboard();
        byte
    }

    fn write_command(&mut self, command: u8) {
        self.status.insert(KbcStatus::COMMAND_FLAG);
        match command {
            CMD_READ_COMMAND_BYTE => self.respond(self.command_byte),
            CMD_WRITE_COMMAND_BYTE | CMD_WRITE_OUTPUT_PORT => {
                self.pending_command = Some(command);
            }
            CMD_INTERFACE_TEST => self.respond(INTERFACE_TEST_OK),
            CMD_SELF_TEST => {
                if let Some(keyboard) = self.keyboard.as_ref() {
                    keyboard.borrow_mut().flush();
                }
                self.command_byte |= CMD_DATA_NO_CLOCK;
                self.push_keyboard_enable();
                self.status.insert(KbcStatus::SYSTEM_FLAG);
                self.output_port =
                    OUTPUT_PORT_NO_RESET | (self.output_port & OUTPUT_PORT_A20);
                self.respond(SELF_TEST_OK);
            }
            CMD_DISABLE_KEYBOARD => {
                self.command_byte |= CMD_DATA_NO_CLOCK;
                self.push_keyboard_enable();
            }
            CMD_ENABLE_KEYBOARD => {
                self.command_byte &= !CMD_DATA_NO_CLOCK;
                self.push_keyboard_enable();
                self.poll_keyboard();
            }
            CMD_READ_INPUT_PORT => self.respond(self.input_port),
            CMD_READ_OUTPUT_PORT => {
                let mut value = self.output_port;
                if self.status.contains(KbcStatus::OUTPUT_FULL) {
                    value |= OUTPUT_PORT_OUTPUT_FULL;
                }
                self.respond(value);
            }
            CMD_READ_TEST_BITS => {
                // Clock and data lines idle high when not inhibited.
                self.respond(if self.clocking_enabled() { 0x03 } else { 0x00 });
            }
            0xF0..=0xFF => {
                // Pulse output-port lines: a clear bit in the low nibble is
                // pulsed low. Line 0 is the CPU reset.
                if command & 0x01 == 0 {
                    if let Some(system) = self.system.as_mut() {
                        system.request_cpu_reset();
                    }
                }
            }
            other => {
                debug!(command = other, "unrecognized 8042 command ignored");
            }
        }
    }

    fn write_data(&mut self, value: u8) {
        self.input_buffer = value;
        self.status.remove(KbcStatus::COMMAND_FLAG);
        match self.pending_command.take() {
            Some(CMD_WRITE_COMMAND_BYTE) => {
                self.command_byte = value;
                self.status
                    .set(KbcStatus::SYSTEM_FLAG, value & CMD_DATA_SYSTEM_FLAG != 0);
                self.push_keyboard_enable();
                self.poll_keyboard();
            }
            Some(CMD_WRITE_OUTPUT_PORT) => self.write_output_port(value),
            Some(other) => {
                debug!(command = other, "8042 command ignored its data byte");
            }
            None => {
                // Direct keyboard command; responses surface like scan codes.
                if let Some(keyboard) = self.keyboard.clone() {
                    keyboard.borrow_mut().send_byte(value);
                }
                self.poll_keyboard();
            }
        }
    }

    fn write_output_port(&mut self, value: u8) {
        let previous = self.output_port;
        self.output_port = value;
        if let Some(system) = self.system.as_mut() {
            system.set_a20(value & OUTPUT_PORT_A20 != 0);
        }
        if previous & OUTPUT_PORT_NO_RESET != 0 && value & OUTPUT_PORT_NO_RESET == 0 {
            warn!("8042 output port cleared the reset-inhibit bit, resetting machine");
            if let Some(system) = self.system.as_mut() {
                system.request_full_reset();
            }
        }
    }
}

impl Default for I8042 {
    fn default() -> Self {
        Self::new()
    }
}

impl IoSnapshot for I8042 {
    const DEVICE_ID: [u8; 4] = *b"KBC2";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.put_u8(0x0001, self.status.bits());
        w.put_u8(0x0002, self.input_buffer);
        w.put_u8(0x0003, self.output_buffer);
        w.put_u8(0x0004, self.command_byte);
        w.put_u8(0x0005, self.input_port);
        w.put_u8(0x0006, self.output_port);
        w.put_u8(0x0007, self.pending_command.unwrap_or(0));
        w.put_bool(0x0008, self.pending_command.is_some());
        w.put_bool(0x0009, self.output_delay);
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID, Self::DEVICE_VERSION)?;
        self.status = KbcStatus::from_bits_truncate(r.u8(0x0001)?);
        self.input_buffer = r.u8(0x0002)?;
        self.output_buffer = r.u8(0x0003)?;
        self.command_byte = r.u8(0x0004)?;
        self.input_port = r.u8(0x0005)?;
        self.output_port = r.u8(0x0006)?;
        let pending = r.u8(0x0007)?;
        self.pending_command = r.bool(0x0008)?.then_some(pending);
        self.output_delay = r.bool(0x0009)?;
        Ok(())
    }
}

/// The 8041-based controller of earlier machines: one data port holding the
/// latest scan code, cleared and gated through system-control-port bits
/// rather than a command protocol.
pub struct Kbc8041 {
    scan_code: u8,
    has_data: bool,
    clock_enabled: bool,
    keyboard: Option<Rc<RefCell<dyn KeyboardDevice>>>,
    irq: Option<Box<dyn IrqLine>>,
}

impl Kbc8041 {
    pub fn new() -> Self {
        Self {
            scan_code: 0,
            has_data: false,
            clock_enabled: true,
            keyboard: None,
            irq: None,
        }
    }

    pub fn connect_keyboard(&mut self, keyboard: Rc<RefCell<dyn KeyboardDevice>>) {
        self.keyboard = Some(keyboard);
    }

    pub fn connect_irq(&mut self, line: impl IrqLine + 'static) {
        self.irq = Some(Box::new(line));
    }

    /// Data port read: the latched scan code stays visible until cleared
    /// through the system control port.
    pub fn read_data(&self) -> u8 {
        self.scan_code
    }

    /// System control port bits: bit 7 clears the latched code, bit 6 low
    /// holds the keyboard clock.
    pub fn set_control(&mut self, clear: bool, clock_enabled: bool) {
        if clear && self.has_data {
            self.has_data = false;
            self.scan_code = 0;
            if let Some(irq) = self.irq.as_ref() {
                irq.set_level(false);
            }
        }
        self.clock_enabled = clock_enabled;
        if let Some(keyboard) = self.keyboard.as_ref() {
            // A held clear bit doubles as the data-line inhibit.
            keyboard.borrow_mut().set_enabled(clear, clock_enabled);
        }
        if clock_enabled && !clear {
            self.poll_keyboard();
        }
    }

    pub fn poll_keyboard(&mut self) {
        if !self.clock_enabled || self.has_data {
            return;
        }
        let Some(keyboard) = self.keyboard.clone() else {
            return;
        };
        let byte = keyboard.borrow_mut().read_scan_code();
        if let Some(byte) = byte {
            self.scan_code = byte;
            self.has_data = true;
            if let Some(irq) = self.irq.as_ref() {
                irq.set_level(true);
            }
        }
    }
}

impl Default for Kbc8041 {
    fn default() -> Self {
        Self::new()
    }
}

impl IoSnapshot for Kbc8041 {
    const DEVICE_ID: [u8; 4] = *b"KBC1";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.put_u8(0x0001, self.scan_code);
        w.put_bool(0x0002, self.has_data);
        w.put_bool(0x0003, self.clock_enabled);
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID, Self::DEVICE_VERSION)?;
        self.scan_code = r.u8(0x0001)?;
        self.has_data = r.bool(0x0002)?;
        self.clock_enabled = r.bool(0x0003)?;
        Ok(())
    }
}

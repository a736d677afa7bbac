//! ChipSet facade: owns the peripheral complement of a PC-class machine and
//! wires it to the port I/O bus, the interrupt controller, and the CPU
//! core's instruction-burst loop.
//!
//! The machine model is resolved once at construction and decides which
//! sub-components exist: a basic 5150/5160 carries one PIC, one DMA
//! controller and 8041-class keyboard logic; the AT adds the slave PIC, the
//! second DMA controller, the 8042 and the RTC/CMOS.

#![forbid(unsafe_code)]

mod model;

pub use model::{DipSwitches, MachineModel};
pub use pcx_devices::pic8259::VectorPoll;
pub use pcx_platform::ResetKind;

use pcx_devices::dma::{Dma8237, DmaDevice, DmaFetch, DmaMemory, DMA0_PAGES, DMA1_PAGES};
use pcx_devices::i8042::{I8042, Kbc8041, KeyboardDevice, SystemControlSink, KBC_DATA, KBC_STATUS};
use pcx_devices::irq::IrqLine;
use pcx_devices::pic8259::{DualPic8259, MASTER_CMD, MASTER_DATA, SLAVE_CMD, SLAVE_DATA};
use pcx_devices::pit8253::{Pit8253, PIT_CH0, PIT_HZ};
use pcx_devices::rtc_cmos::{RtcCmos, RtcDateTime, RTC_DATA, RTC_INDEX};
use pcx_platform::{A20GateHandle, CycleClock, IoPortBus, PlatformResetSink, PortIoDevice, ResetLatch};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::{debug, warn};

pub const SYSTEM_CONTROL_PORT: u16 = 0x61;
pub const SWITCH_PORT: u16 = 0x62;
pub const NMI_MASK_PORT: u16 = 0xA0;
pub const FPU_CLEAR_PORT: u16 = 0xF0;
pub const FPU_RESET_PORT: u16 = 0xF1;

const PIT2_BASE: u16 = 0x48;

// System control port bits.
const PORT61_GATE2: u8 = 0x01;
const PORT61_SPEAKER_DATA: u8 = 0x02;
const PORT61_SW2_SELECT: u8 = 0x08;
const PORT61_REFRESH: u8 = 0x10;
const PORT61_KBD_CLOCK: u8 = 0x40;
const PORT61_KBD_CLEAR: u8 = 0x80;

#[derive(Debug, Clone)]
pub struct ChipsetConfig {
    pub model: MachineModel,
    /// CPU clock; the shared cycle counter advances at this rate.
    pub cpu_hz: u64,
    pub dip: DipSwitches,
    pub rtc_datetime: RtcDateTime,
    /// Registers a second timer bank at ports 0x48-0x4B.
    pub dual_pit: bool,
}

impl Default for ChipsetConfig {
    fn default() -> Self {
        Self {
            model: MachineModel::Pc5150,
            cpu_hz: 4_772_727,
            dip: DipSwitches::default(),
            rtc_datetime: RtcDateTime::default(),
            dual_pit: false,
        }
    }
}

impl ChipsetConfig {
    pub fn at() -> Self {
        Self {
            model: MachineModel::At5170,
            cpu_hz: 6_000_000,
            ..Self::default()
        }
    }
}

fn replicate(byte: u8, size: u8) -> u32 {
    match size {
        1 => u32::from(byte),
        2 => u32::from(u16::from_le_bytes([byte, byte])),
        _ => u32::from_le_bytes([byte, byte, byte, byte]),
    }
}

/// Asserting the line latches an interrupt request on the PIC, carrying the
/// device's acknowledgment delay; deasserting withdraws it.
struct PicIrqLine {
    pic: Rc<RefCell<DualPic8259>>,
    irq: u8,
    delay: u32,
}

impl IrqLine for PicIrqLine {
    fn set_level(&self, level: bool) {
        let mut pic = self.pic.borrow_mut();
        if level {
            pic.set_irq(self.irq, self.delay);
        } else {
            pic.clear_irq(self.irq);
        }
    }
}

/// Bridges the 8042's system lines onto the platform's A20 handle and
/// reset latch.
struct ChipsetSystemControl {
    a20: A20GateHandle,
    reset: ResetLatch,
}

impl SystemControlSink for ChipsetSystemControl {
    fn set_a20(&mut self, enabled: bool) {
        self.a20.set_enabled(enabled);
    }

    fn request_cpu_reset(&mut self) {
        self.reset.request_reset(ResetKind::Cpu);
    }

    fn request_full_reset(&mut self) {
        self.reset.request_reset(ResetKind::System);
    }
}

struct PicPorts(Rc<RefCell<DualPic8259>>);

impl PortIoDevice for PicPorts {
    fn read(&mut self, port: u16, size: u8) -> u32 {
        replicate(self.0.borrow_mut().port_read_u8(port), size)
    }

    fn write(&mut self, port: u16, _size: u8, value: u32) {
        self.0.borrow_mut().port_write_u8(port, value as u8);
    }
}

struct PitPorts(Rc<RefCell<Pit8253>>);

impl PortIoDevice for PitPorts {
    fn read(&mut self, port: u16, size: u8) -> u32 {
        replicate(self.0.borrow_mut().read_port(port), size)
    }

    fn write(&mut self, port: u16, _size: u8, value: u32) {
        self.0.borrow_mut().write_port(port, value as u8);
    }
}

struct DmaPorts(Rc<RefCell<Dma8237>>);

impl PortIoDevice for DmaPorts {
    fn read(&mut self, port: u16, size: u8) -> u32 {
        replicate(self.0.borrow_mut().read_port(port), size)
    }

    fn write(&mut self, port: u16, _size: u8, value: u32) {
        self.0.borrow_mut().write_port(port, value as u8);
    }
}

struct RtcPorts(Rc<RefCell<RtcCmos>>);

impl PortIoDevice for RtcPorts {
    fn read(&mut self, port: u16, size: u8) -> u32 {
        replicate(self.0.borrow_mut().read_port(port), size)
    }

    fn write(&mut self, port: u16, _size: u8, value: u32) {
        self.0.borrow_mut().write_port(port, value as u8);
    }
}

struct I8042Ports(Rc<RefCell<I8042>>);

impl PortIoDevice for I8042Ports {
    fn read(&mut self, port: u16, size: u8) -> u32 {
        replicate(self.0.borrow_mut().read_port(port), size)
    }

    fn write(&mut self, port: u16, _size: u8, value: u32) {
        self.0.borrow_mut().write_port(port, value as u8);
    }
}

/// Basic-model port 0x60: the 8041's scan-code latch, or the SW1 block
/// while the keyboard-clear bit is held high.
struct Kbc8041Port {
    kbc: Rc<RefCell<Kbc8041>>,
    port61: Rc<Cell<u8>>,
    sw1: u8,
}

impl PortIoDevice for Kbc8041Port {
    fn read(&mut self, _port: u16, size: u8) -> u32 {
        let byte = if self.port61.get() & PORT61_KBD_CLEAR != 0 {
            self.sw1
        } else {
            self.kbc.borrow().read_data()
        };
        replicate(byte, size)
    }

    fn write(&mut self, _port: u16, _size: u8, value: u32) {
        debug!(value, "write to read-only keyboard data port ignored");
    }
}

/// Basic-model port 0x62: one SW2 nibble at a time, selected through the
/// system control port.
struct SwitchPort {
    port61: Rc<Cell<u8>>,
    sw2: u8,
}

impl PortIoDevice for SwitchPort {
    fn read(&mut self, _port: u16, size: u8) -> u32 {
        let nibble = if self.port61.get() & PORT61_SW2_SELECT != 0 {
            self.sw2 >> 4
        } else {
            self.sw2 & 0x0F
        };
        replicate(nibble, size)
    }

    fn write(&mut self, _port: u16, _size: u8, _value: u32) {}
}

/// System control port 0x61. Bit 0 gates PIT timer 2, bit 1 is the speaker
/// data line; the refresh-detect bit flips on every read because firmware
/// spins on it to measure DRAM refresh. On basic models bits 6/7 drive the
/// 8041's clock and clear lines.
struct SystemControlPort {
    value: Rc<Cell<u8>>,
    refresh: bool,
    pit: Rc<RefCell<Pit8253>>,
    kbc8041: Option<Rc<RefCell<Kbc8041>>>,
}

impl PortIoDevice for SystemControlPort {
    fn read(&mut self, _port: u16, size: u8) -> u32 {
        self.refresh = !self.refresh;
        let mut byte = self.value.get() & !PORT61_REFRESH;
        if self.refresh {
            byte |= PORT61_REFRESH;
        }
        replicate(byte, size)
    }

    fn write(&mut self, _port: u16, _size: u8, value: u32) {
        let value = value as u8;
        self.value.set(value);
        self.pit.borrow_mut().set_gate2(value & PORT61_GATE2 != 0);
        if let Some(kbc) = self.kbc8041.as_ref() {
            kbc.borrow_mut().set_control(
                value & PORT61_KBD_CLEAR != 0,
                value & PORT61_KBD_CLOCK != 0,
            );
        }
    }
}

/// Pre-AT NMI mask port: bit 7 enables NMI delivery.
struct NmiMaskPort(Rc<Cell<bool>>);

impl PortIoDevice for NmiMaskPort {
    fn read(&mut self, _port: u16, size: u8) -> u32 {
        replicate(0xFF, size)
    }

    fn write(&mut self, _port: u16, _size: u8, value: u32) {
        self.0.set(value as u8 & 0x80 != 0);
    }
}

/// FPU busy-latch clear/reset ports. The coprocessor itself lives outside
/// this layer; the write only needs to be absorbed.
struct FpuPort;

impl PortIoDevice for FpuPort {
    fn read(&mut self, _port: u16, size: u8) -> u32 {
        replicate(0xFF, size)
    }

    fn write(&mut self, port: u16, _size: u8, _value: u32) {
        debug!(port, "FPU busy latch cleared");
    }
}

/// The peripheral chipset of one machine.
pub struct Chipset {
    pub io: IoPortBus,
    model: MachineModel,
    clock: CycleClock,
    a20: A20GateHandle,
    reset: ResetLatch,
    pic: Rc<RefCell<DualPic8259>>,
    pit: Rc<RefCell<Pit8253>>,
    pit2: Option<Rc<RefCell<Pit8253>>>,
    dma: Rc<RefCell<Dma8237>>,
    dma2: Option<Rc<RefCell<Dma8237>>>,
    rtc: Option<Rc<RefCell<RtcCmos>>>,
    i8042: Option<Rc<RefCell<I8042>>>,
    kbc8041: Option<Rc<RefCell<Kbc8041>>>,
    port61: Rc<Cell<u8>>,
    nmi_port_enabled: Rc<Cell<bool>>,
}

impl Chipset {
    pub fn new(config: ChipsetConfig, memory: Rc<RefCell<dyn DmaMemory>>) -> Self {
        let model = config.model;
        let clock = CycleClock::new();
        let a20 = A20GateHandle::default();
        let reset = ResetLatch::new();
        let mut io = IoPortBus::new();

        let pic = Rc::new(RefCell::new(DualPic8259::new()));
        io.register(MASTER_CMD, Box::new(PicPorts(pic.clone())));
        io.register(MASTER_DATA, Box::new(PicPorts(pic.clone())));
        if model.has_second_pic() {
            io.register(SLAVE_CMD, Box::new(PicPorts(pic.clone())));
            io.register(SLAVE_DATA, Box::new(PicPorts(pic.clone())));
        }

        let cycles_per_tick = (config.cpu_hz / PIT_HZ).max(1);
        let pit = Rc::new(RefCell::new(Pit8253::new(clock.clone(), cycles_per_tick)));
        {
            let pic = pic.clone();
            pit.borrow_mut()
                .connect_irq0(move || pic.borrow_mut().set_irq(0, 0));
        }
        for port in PIT_CH0..PIT_CH0 + 4 {
            io.register(port, Box::new(PitPorts(pit.clone())));
        }
        let pit2 = config.dual_pit.then(|| {
            let bank = Rc::new(RefCell::new(
                Pit8253::new(clock.clone(), cycles_per_tick).with_base(PIT2_BASE),
            ));
            for port in PIT2_BASE..PIT2_BASE + 4 {
                io.register(port, Box::new(PitPorts(bank.clone())));
            }
            bank
        });

        let dma = Rc::new(RefCell::new(Dma8237::primary(memory.clone())));
        for reg in 0..0x10 {
            io.register(reg, Box::new(DmaPorts(dma.clone())));
        }
        for page in DMA0_PAGES {
            io.register(page, Box::new(DmaPorts(dma.clone())));
        }
        let dma2 = model.has_second_dma().then(|| {
            let ctrl = Rc::new(RefCell::new(Dma8237::secondary(memory)));
            for reg in 0..0x10u16 {
                io.register(0xC0 + reg * 2, Box::new(DmaPorts(ctrl.clone())));
            }
            for page in DMA1_PAGES {
                io.register(page, Box::new(DmaPorts(ctrl.clone())));
            }
            ctrl
        });

        let rtc = model.has_rtc().then(|| {
            let mut rtc = RtcCmos::new(clock.clone(), config.cpu_hz, config.rtc_datetime);
            rtc.connect_irq(PicIrqLine {
                pic: pic.clone(),
                irq: 8,
                delay: 0,
            });
            // Firmware reads the switch block back as the CMOS equipment byte.
            rtc.set_config_byte(0x14, config.dip.sw1);
            let rtc = Rc::new(RefCell::new(rtc));
            io.register(RTC_INDEX, Box::new(RtcPorts(rtc.clone())));
            io.register(RTC_DATA, Box::new(RtcPorts(rtc.clone())));
            rtc
        });

        let port61_value = Rc::new(Cell::new(0));
        let nmi_port_enabled = Rc::new(Cell::new(false));

        let mut i8042 = None;
        let mut kbc8041 = None;
        if model.has_8042() {
            let mut kbc = I8042::new();
            kbc.connect_system(ChipsetSystemControl {
                a20: a20.clone(),
                reset: reset.clone(),
            });
            kbc.connect_irq(PicIrqLine {
                pic: pic.clone(),
                irq: 1,
                delay: model.keyboard_irq_delay(),
            });
            let kbc = Rc::new(RefCell::new(kbc));
            io.register(KBC_DATA, Box::new(I8042Ports(kbc.clone())));
            io.register(KBC_STATUS, Box::new(I8042Ports(kbc.clone())));
            i8042 = Some(kbc);
        } else {
            let mut kbc = Kbc8041::new();
            kbc.connect_irq(PicIrqLine {
                pic: pic.clone(),
                irq: 1,
                delay: model.keyboard_irq_delay(),
            });
            let kbc = Rc::new(RefCell::new(kbc));
            io.register(
                KBC_DATA,
                Box::new(Kbc8041Port {
                    kbc: kbc.clone(),
                    port61: port61_value.clone(),
                    sw1: config.dip.sw1,
                }),
            );
            io.register(
                SWITCH_PORT,
                Box::new(SwitchPort {
                    port61: port61_value.clone(),
                    sw2: config.dip.sw2,
                }),
            );
            io.register(NMI_MASK_PORT, Box::new(NmiMaskPort(nmi_port_enabled.clone())));
            kbc8041 = Some(kbc);
        }

        io.register(
            SYSTEM_CONTROL_PORT,
            Box::new(SystemControlPort {
                value: port61_value.clone(),
                refresh: false,
                pit: pit.clone(),
                kbc8041: kbc8041.clone(),
            }),
        );

        if model.is_extended() {
            io.register(FPU_CLEAR_PORT, Box::new(FpuPort));
            io.register(FPU_RESET_PORT, Box::new(FpuPort));
        }

        Self {
            io,
            model,
            clock,
            a20,
            reset,
            pic,
            pit,
            pit2,
            dma,
            dma2,
            rtc,
            i8042,
            kbc8041,
            port61: port61_value,
            nmi_port_enabled,
        }
    }

    pub fn model(&self) -> MachineModel {
        self.model
    }

    /// Shared cycle counter; the CPU core advances it as it executes.
    pub fn clock(&self) -> CycleClock {
        self.clock.clone()
    }

    pub fn a20(&self) -> A20GateHandle {
        self.a20.clone()
    }

    /// Takes a pending reset request raised from inside a port handler.
    pub fn take_reset_request(&self) -> Option<ResetKind> {
        self.reset.take()
    }

    /// Call once per instruction burst: recomputes every timer model from
    /// the cycle counter and fires whatever interrupts came due.
    pub fn update_all_timers(&mut self) {
        self.pit.borrow_mut().update();
        if let Some(pit2) = self.pit2.as_ref() {
            pit2.borrow_mut().update();
        }
        if let Some(rtc) = self.rtc.as_ref() {
            rtc.borrow_mut().update();
        }
    }

    /// Bounds the CPU's next burst so execution lands exactly on the next
    /// timer or RTC-periodic event.
    pub fn get_cycle_limit(&self, requested: u64) -> u64 {
        let mut limit = self.pit.borrow().cycle_limit(requested);
        if let Some(pit2) = self.pit2.as_ref() {
            limit = pit2.borrow().cycle_limit(limit);
        }
        if let Some(rtc) = self.rtc.as_ref() {
            limit = rtc.borrow().cycle_limit(limit);
        }
        limit.max(1)
    }

    /// Whether `irq` can currently reach the CPU (unmasked on its
    /// controller and, for slave lines, cascaded through the master).
    pub fn check_irq_mask(&self, irq: u8) -> bool {
        self.pic.borrow().irq_enabled(irq)
    }

    pub fn set_irq(&self, irq: u8, delay: u32) {
        self.pic.borrow_mut().set_irq(irq, delay);
    }

    pub fn clear_irq(&self, irq: u8) {
        self.pic.borrow_mut().clear_irq(irq);
    }

    pub fn int_asserted(&self) -> bool {
        self.pic.borrow().int_asserted()
    }

    /// Resolves the highest-priority pending interrupt into a vector, or
    /// reports that the CPU should retry after the acknowledgment delay.
    pub fn resolve_vector(&self) -> VectorPoll {
        self.pic.borrow_mut().resolve_vector()
    }

    fn dma_for_channel(&self, channel: usize) -> Option<(&Rc<RefCell<Dma8237>>, usize)> {
        if channel < 4 {
            Some((&self.dma, channel))
        } else {
            match self.dma2.as_ref() {
                Some(ctrl) => Some((ctrl, channel - 4)),
                None => {
                    warn!(channel, "16-bit DMA channel on a machine without a second controller");
                    None
                }
            }
        }
    }

    /// Binds a device to DMA channel 0-3 (primary) or 4-7 (secondary).
    pub fn connect_dma(&self, channel: usize, device: Rc<RefCell<dyn DmaDevice>>) {
        if let Some((ctrl, ch)) = self.dma_for_channel(channel) {
            ctrl.borrow_mut().connect(ch, device);
        }
    }

    pub fn request_dma(&self, channel: usize, done: impl FnOnce(bool) + 'static) {
        match self.dma_for_channel(channel) {
            Some((ctrl, ch)) => ctrl.borrow_mut().request(ch, done),
            None => done(false),
        }
    }

    /// Completion of a device fetch that answered `Pending`.
    pub fn resume_dma_fetch(&self, channel: usize, fetched: DmaFetch) {
        if let Some((ctrl, ch)) = self.dma_for_channel(channel) {
            ctrl.borrow_mut().resume_fetch(ch, fetched);
        }
    }

    pub fn connect_keyboard(&self, keyboard: Rc<RefCell<dyn KeyboardDevice>>) {
        if let Some(kbc) = self.i8042.as_ref() {
            kbc.borrow_mut().connect_keyboard(keyboard);
        } else if let Some(kbc) = self.kbc8041.as_ref() {
            kbc.borrow_mut().connect_keyboard(keyboard);
        }
    }

    /// Call after injecting host input so the controller can latch the next
    /// pending scan code.
    pub fn poll_keyboard(&self) {
        if let Some(kbc) = self.i8042.as_ref() {
            kbc.borrow_mut().poll_keyboard();
        } else if let Some(kbc) = self.kbc8041.as_ref() {
            kbc.borrow_mut().poll_keyboard();
        }
    }

    /// PC speaker drive: PIT timer 2 output gated by the speaker-data bit.
    pub fn speaker_output(&self) -> bool {
        self.port61.get() & PORT61_SPEAKER_DATA != 0 && self.pit.borrow_mut().output(2)
    }

    /// NMI delivery gate: the dedicated mask port on basic models, CMOS
    /// address bit 7 on extended ones.
    pub fn nmi_enabled(&self) -> bool {
        match self.rtc.as_ref() {
            Some(rtc) => !rtc.borrow().nmi_masked(),
            None => self.nmi_port_enabled.get(),
        }
    }

    pub fn pic(&self) -> Rc<RefCell<DualPic8259>> {
        self.pic.clone()
    }

    pub fn pit(&self) -> Rc<RefCell<Pit8253>> {
        self.pit.clone()
    }

    pub fn dma(&self) -> Rc<RefCell<Dma8237>> {
        self.dma.clone()
    }

    pub fn secondary_dma(&self) -> Option<Rc<RefCell<Dma8237>>> {
        self.dma2.clone()
    }

    pub fn rtc(&self) -> Option<Rc<RefCell<RtcCmos>>> {
        self.rtc.clone()
    }

    pub fn i8042(&self) -> Option<Rc<RefCell<I8042>>> {
        self.i8042.clone()
    }

    pub fn kbc8041(&self) -> Option<Rc<RefCell<Kbc8041>>> {
        self.kbc8041.clone()
    }
}

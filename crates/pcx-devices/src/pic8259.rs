//! Intel 8259A programmable interrupt controller.
//!
//! Models the full ICW/OCW command-word protocol at register granularity:
//! IMR/IRR/ISR, the rotating lowest-priority pointer, special mask mode,
//! poll mode, and the master/slave cascade. A configurable acknowledgment
//! delay (counted in CPU instructions) lets callers reproduce firmware that
//! enables interrupts a few instructions before it is ready to take one.

use pcx_io_snapshot::{
    IoSnapshot, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use tracing::debug;

pub const MASTER_CMD: u16 = 0x20;
pub const MASTER_DATA: u16 = 0x21;
pub const SLAVE_CMD: u16 = 0xA0;
pub const SLAVE_DATA: u16 = 0xA1;

/// The master IR line the slave controller cascades through.
const CASCADE_IR: u8 = 2;

const ICW1_INIT: u8 = 0x10;
const ICW1_SINGLE: u8 = 0x02;
const ICW1_ICW4: u8 = 0x01;

const OCW2_OP_MASK: u8 = 0xE0;
const OCW2_EOI: u8 = 0x20;
const OCW2_EOI_SPECIFIC: u8 = 0x60;
const OCW2_EOI_ROTATE: u8 = 0xA0;
const OCW2_SET_PRIORITY: u8 = 0xC0;
const OCW2_EOI_SPECIFIC_ROTATE: u8 = 0xE0;

const OCW3_ESMM: u8 = 0x40;
const OCW3_SMM: u8 = 0x20;
const OCW3_POLL: u8 = 0x04;
const OCW3_RR: u8 = 0x02;
const OCW3_RIS: u8 = 0x01;

/// Outcome of asking the PIC pair for the next interrupt vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorPoll {
    /// Deliver this vector; the corresponding ISR bit is now in service.
    Vector(u8),
    /// Nothing deliverable; no state was mutated.
    None,
    /// An acknowledgment delay is still pending; ask again next instruction.
    Retry,
}

/// One 8259A. Master/slave composition lives in [`DualPic8259`].
#[derive(Debug, Clone)]
struct Pic8259 {
    icw: [u8; 4],
    /// Next ICW slot expected while an initialization sequence is open
    /// (1..=3); 0 when operational.
    icw_state: u8,
    imr: u8,
    irr: u8,
    isr: u8,
    /// Lowest-priority rotation pointer; priority order starts one past it.
    ir_low: u8,
    read_isr: bool,
    special_mask: bool,
    poll_pending: bool,
    /// Pending acknowledgment delay, in CPU instructions.
    delay: u32,
}

impl Pic8259 {
    fn new() -> Self {
        Self {
            icw: [0; 4],
            icw_state: 0,
            imr: 0,
            irr: 0,
            isr: 0,
            ir_low: 7,
            read_isr: false,
            special_mask: false,
            poll_pending: false,
            delay: 0,
        }
    }

    fn single(&self) -> bool {
        self.icw[0] & ICW1_SINGLE != 0
    }

    fn vector_base(&self) -> u8 {
        self.icw[1]
    }

    /// IR levels in priority order: highest first, starting one past the
    /// lowest-priority pointer and wrapping.
    fn priority_order(&self) -> impl Iterator<Item = u8> {
        let first = (self.ir_low + 1) & 7;
        (0..8u8).map(move |n| (first + n) & 7)
    }

    fn begin_init(&mut self, icw1: u8) {
        // ICW1 deliberately clears the mask register: everything is unmasked
        // until firmware programs OCW1. It also resets priority rotation,
        // special mask mode, and the OCW3 read target (IRR).
        self.icw = [icw1, 0, 0, 0];
        self.icw_state = 1;
        self.imr = 0;
        self.irr = 0;
        self.isr = 0;
        self.ir_low = 7;
        self.read_isr = false;
        self.special_mask = false;
        self.poll_pending = false;
        self.delay = 0;
    }

    /// Consumes one byte of an open initialization sequence (ICW2..ICW4).
    fn continue_init(&mut self, value: u8) {
        match self.icw_state {
            1 => {
                self.icw[1] = value & 0xF8;
                self.icw_state = if self.single() {
                    if self.icw[0] & ICW1_ICW4 != 0 {
                        3
                    } else {
                        0
                    }
                } else {
                    2
                };
            }
            2 => {
                self.icw[2] = value;
                self.icw_state = if self.icw[0] & ICW1_ICW4 != 0 { 3 } else { 0 };
            }
            3 => {
                self.icw[3] = value;
                self.icw_state = 0;
            }
            _ => unreachable!("continue_init called while operational"),
        }
    }

    fn write_ocw2(&mut self, value: u8) {
        let level = value & 0x07;
        match value & OCW2_OP_MASK {
            OCW2_EOI => self.eoi_non_specific(false),
            OCW2_EOI_ROTATE => self.eoi_non_specific(true),
            OCW2_EOI_SPECIFIC => self.eoi_specific(level, false),
            OCW2_EOI_SPECIFIC_ROTATE => self.eoi_specific(level, true),
            OCW2_SET_PRIORITY => self.ir_low = level,
            op => {
                // Automatic-EOI rotation modes; nothing in the modeled
                // machines programs them.
                debug!(op, "ignoring unsupported OCW2 operation");
            }
        }
    }

    /// Non-specific EOI: clears the first in-service bit found in priority
    /// order. An EOI with nothing in service is a firmware anomaly; it is
    /// logged and no bit is cleared.
    fn eoi_non_specific(&mut self, rotate: bool) {
        for ir in self.priority_order() {
            let bit = 1u8 << ir;
            if self.isr & bit != 0 {
                self.isr &= !bit;
                if rotate {
                    self.ir_low = ir;
                }
                return;
            }
        }
        debug!("EOI with no interrupt in service");
    }

    fn eoi_specific(&mut self, level: u8, rotate: bool) {
        let bit = 1u8 << level;
        if self.isr & bit == 0 {
            debug!(level, "specific EOI for interrupt not in service");
        }
        self.isr &= !bit;
        if rotate {
            self.ir_low = level;
        }
    }

    fn write_ocw3(&mut self, value: u8) {
        if value & OCW3_ESMM != 0 {
            self.special_mask = value & OCW3_SMM != 0;
        }
        if value & OCW3_POLL != 0 {
            self.poll_pending = true;
        }
        if value & OCW3_RR != 0 {
            self.read_isr = value & OCW3_RIS != 0;
        }
    }

    /// Highest-priority deliverable request, honoring in-service blocking
    /// and special mask mode. Does not mutate state.
    fn pending_ir(&self) -> Option<u8> {
        for ir in self.priority_order() {
            let bit = 1u8 << ir;
            if self.isr & bit != 0 {
                // An in-service level blocks itself and everything below it,
                // unless special mask mode hides IMR-masked levels.
                if self.special_mask && self.imr & bit != 0 {
                    continue;
                }
                return None;
            }
            if self.irr & !self.imr & bit != 0 {
                return Some(ir);
            }
        }
        None
    }

    /// Moves `ir` from requested to in-service. One indivisible step, so
    /// `ISR & IRR` never has the bit asserted in both during delivery.
    fn acknowledge(&mut self, ir: u8) {
        let bit = 1u8 << ir;
        self.isr |= bit;
        self.irr &= !bit;
    }

    fn read_cmd(&mut self) -> u8 {
        if self.poll_pending {
            self.poll_pending = false;
            return match self.pending_ir() {
                Some(ir) => {
                    self.acknowledge(ir);
                    0x80 | ir
                }
                None => 0,
            };
        }
        if self.read_isr {
            self.isr
        } else {
            self.irr
        }
    }
}

/// Master/slave 8259A pair presenting a single interrupt line to the CPU.
///
/// Basic (single-PIC) machines simply never wire anything to IRQ 8..15; the
/// slave stays uninitialized and inert.
pub struct DualPic8259 {
    master: Pic8259,
    slave: Pic8259,
    /// Ack delay applied when an OCW1 write exposes a pending request, in
    /// CPU instructions. Zero on most models.
    mask_write_delay: u32,
}

impl DualPic8259 {
    pub fn new() -> Self {
        Self {
            master: Pic8259::new(),
            slave: Pic8259::new(),
            mask_write_delay: 0,
        }
    }

    pub fn with_mask_write_delay(mut self, instructions: u32) -> Self {
        self.mask_write_delay = instructions;
        self
    }

    fn controller_mut(&mut self, port: u16) -> (&mut Pic8259, bool) {
        match port {
            MASTER_CMD | MASTER_DATA => (&mut self.master, true),
            _ => (&mut self.slave, false),
        }
    }

    pub fn port_write_u8(&mut self, port: u16, value: u8) {
        let is_cmd = matches!(port, MASTER_CMD | SLAVE_CMD);
        let delay = self.mask_write_delay;
        let (pic, _) = self.controller_mut(port);

        if is_cmd {
            if value & ICW1_INIT != 0 {
                pic.begin_init(value);
            } else if value & 0x08 != 0 {
                pic.write_ocw3(value);
            } else {
                pic.write_ocw2(value);
            }
        } else if pic.icw_state != 0 {
            pic.continue_init(value);
        } else {
            // OCW1. Unmasking a latched request may deliver with a model
            // specific delay, matching firmware that is not yet ready to be
            // interrupted.
            let unmasked_pending = pic.irr & pic.imr & !value != 0;
            pic.imr = value;
            if unmasked_pending {
                pic.delay = pic.delay.max(delay);
            }
        }
        self.reconcile();
    }

    pub fn port_read_u8(&mut self, port: u16) -> u8 {
        match port {
            MASTER_CMD => {
                let v = self.master.read_cmd();
                self.reconcile();
                v
            }
            SLAVE_CMD => {
                let v = self.slave.read_cmd();
                self.reconcile();
                v
            }
            MASTER_DATA => self.master.imr,
            _ => self.slave.imr,
        }
    }

    /// Latches an interrupt request, optionally with an acknowledgment delay
    /// in CPU instructions.
    pub fn set_irq(&mut self, irq: u8, delay: u32) {
        let (pic, bit) = self.line_mut(irq);
        pic.irr |= bit;
        pic.delay = pic.delay.max(delay);
        self.reconcile();
    }

    pub fn clear_irq(&mut self, irq: u8) {
        let (pic, bit) = self.line_mut(irq);
        pic.irr &= !bit;
        self.reconcile();
    }

    fn line_mut(&mut self, irq: u8) -> (&mut Pic8259, u8) {
        if irq < 8 {
            (&mut self.master, 1 << irq)
        } else {
            (&mut self.slave, 1 << (irq - 8))
        }
    }

    /// True if `irq` is unmasked all the way to the CPU (slave lines also
    /// require the cascade line unmasked on the master).
    pub fn irq_enabled(&self, irq: u8) -> bool {
        if irq < 8 {
            self.master.imr & (1 << irq) == 0
        } else {
            self.slave.imr & (1 << (irq - 8)) == 0
                && self.master.imr & (1 << CASCADE_IR) == 0
        }
    }

    /// Reflects the slave's pending-unmasked-unserviced state into the
    /// master's cascade request line. Called after every IRR/ISR mutation,
    /// before the CPU-visible interrupt line is recomputed.
    fn reconcile(&mut self) {
        if self.master.single() {
            return;
        }
        let bit = 1u8 << CASCADE_IR;
        if self.slave.pending_ir().is_some() {
            self.master.irr |= bit;
        } else if self.slave.irr & !self.slave.imr == 0 {
            // Only withdraw the cascade request when the slave has nothing
            // latched; a blocked-but-latched request keeps the line up.
            self.master.irr &= !bit;
        }
    }

    /// Whether the INTR line to the CPU is asserted (ignoring any pending
    /// acknowledgment delay).
    pub fn int_asserted(&self) -> bool {
        self.master.pending_ir().is_some()
    }

    /// Resolves the next interrupt vector.
    ///
    /// While an acknowledgment delay is pending this reports
    /// [`VectorPoll::Retry`] without mutating interrupt state, decrementing
    /// the delay by one instruction.
    pub fn resolve_vector(&mut self) -> VectorPoll {
        if self.master.delay > 0 {
            self.master.delay -= 1;
            return VectorPoll::Retry;
        }

        let Some(ir) = self.master.pending_ir() else {
            return VectorPoll::None;
        };

        if ir == CASCADE_IR && !self.master.single() {
            if self.slave.delay > 0 {
                self.slave.delay -= 1;
                return VectorPoll::Retry;
            }
            let Some(slave_ir) = self.slave.pending_ir() else {
                // Spurious cascade: the slave withdrew its request.
                self.reconcile();
                return VectorPoll::None;
            };
            self.slave.acknowledge(slave_ir);
            self.master.acknowledge(CASCADE_IR);
            let vector = self.slave.vector_base() + slave_ir;
            self.reconcile();
            return VectorPoll::Vector(vector);
        }

        self.master.acknowledge(ir);
        let vector = self.master.vector_base() + ir;
        self.reconcile();
        VectorPoll::Vector(vector)
    }
}

impl Default for DualPic8259 {
    fn default() -> Self {
        Self::new()
    }
}

impl IoSnapshot for DualPic8259 {
    const DEVICE_ID: [u8; 4] = *b"PIC2";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        for (i, pic) in [&self.master, &self.slave].into_iter().enumerate() {
            let base = 0x0100 * (i as u16 + 1);
            w.put_bytes(base, &pic.icw);
            w.put_u8(base + 1, pic.icw_state);
            w.put_u8(base + 2, pic.imr);
            w.put_u8(base + 3, pic.irr);
            w.put_u8(base + 4, pic.isr);
            w.put_u8(base + 5, pic.ir_low);
            w.put_bool(base + 6, pic.read_isr);
            w.put_bool(base + 7, pic.special_mask);
            w.put_bool(base + 8, pic.poll_pending);
            w.put_u32(base + 9, pic.delay);
        }
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID, Self::DEVICE_VERSION)?;
        for (i, pic) in [&mut self.master, &mut self.slave].into_iter().enumerate() {
            let base = 0x0100 * (i as u16 + 1);
            pic.icw = r.bytes::<4>(base)?;
            pic.icw_state = r.u8(base + 1)?;
            pic.imr = r.u8(base + 2)?;
            pic.irr = r.u8(base + 3)?;
            pic.isr = r.u8(base + 4)?;
            pic.ir_low = r.u8(base + 5)?;
            pic.read_isr = r.bool(base + 6)?;
            pic.special_mask = r.bool(base + 7)?;
            pic.poll_pending = r.bool(base + 8)?;
            pic.delay = r.u32(base + 9)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_legacy_pc(pic: &mut DualPic8259) {
        // Master: base 0x20, slave on IRQ2, 8086 mode.
        pic.port_write_u8(MASTER_CMD, 0x11);
        pic.port_write_u8(MASTER_DATA, 0x20);
        pic.port_write_u8(MASTER_DATA, 0x04);
        pic.port_write_u8(MASTER_DATA, 0x01);

        // Slave: base 0x28, cascade identity 2, 8086 mode.
        pic.port_write_u8(SLAVE_CMD, 0x11);
        pic.port_write_u8(SLAVE_DATA, 0x28);
        pic.port_write_u8(SLAVE_DATA, 0x02);
        pic.port_write_u8(SLAVE_DATA, 0x01);
    }

    fn eoi(pic: &mut DualPic8259) {
        pic.port_write_u8(MASTER_CMD, 0x20);
    }

    #[test]
    fn icw1_clears_mask_and_state() {
        let mut pic = DualPic8259::new();
        init_legacy_pc(&mut pic);
        pic.port_write_u8(MASTER_DATA, 0xFF);
        pic.set_irq(3, 0);

        // Re-initialization unmasks everything and drops the latched request.
        pic.port_write_u8(MASTER_CMD, 0x11);
        pic.port_write_u8(MASTER_DATA, 0x20);
        pic.port_write_u8(MASTER_DATA, 0x04);
        pic.port_write_u8(MASTER_DATA, 0x01);

        assert_eq!(pic.port_read_u8(MASTER_DATA), 0x00);
        assert_eq!(pic.resolve_vector(), VectorPoll::None);
    }

    #[test]
    fn priority_order_starts_past_lowest_priority_pointer() {
        let mut pic = DualPic8259::new();
        init_legacy_pc(&mut pic);

        // IRQ2 is the cascade on a dual configuration; use a fresh single
        // controller config to pin the documented {2,5,7} ordering.
        pic.port_write_u8(MASTER_CMD, 0x13); // init, single, ICW4
        pic.port_write_u8(MASTER_DATA, 0x20);
        pic.port_write_u8(MASTER_DATA, 0x01);

        pic.set_irq(5, 0);
        pic.set_irq(2, 0);
        pic.set_irq(7, 0);

        assert_eq!(pic.resolve_vector(), VectorPoll::Vector(0x22));
        // IRQ2 in service blocks the rest until EOI.
        assert_eq!(pic.resolve_vector(), VectorPoll::None);
        eoi(&mut pic);
        assert_eq!(pic.resolve_vector(), VectorPoll::Vector(0x25));
        eoi(&mut pic);
        assert_eq!(pic.resolve_vector(), VectorPoll::Vector(0x27));
        eoi(&mut pic);
        assert_eq!(pic.resolve_vector(), VectorPoll::None);
    }

    #[test]
    fn masked_requests_stay_latched() {
        let mut pic = DualPic8259::new();
        init_legacy_pc(&mut pic);

        pic.port_write_u8(MASTER_DATA, 0x02);
        pic.set_irq(1, 0);
        assert_eq!(pic.resolve_vector(), VectorPoll::None);

        pic.port_write_u8(MASTER_DATA, 0x00);
        assert_eq!(pic.resolve_vector(), VectorPoll::Vector(0x21));
    }

    #[test]
    fn ack_delay_reports_retry_without_mutation() {
        let mut pic = DualPic8259::new();
        init_legacy_pc(&mut pic);

        pic.set_irq(0, 2);
        assert_eq!(pic.resolve_vector(), VectorPoll::Retry);
        assert_eq!(pic.resolve_vector(), VectorPoll::Retry);
        assert_eq!(pic.resolve_vector(), VectorPoll::Vector(0x20));

        // ISR now holds IRQ0; IRR is clear.
        pic.port_write_u8(MASTER_CMD, 0x0B);
        assert_eq!(pic.port_read_u8(MASTER_CMD), 0x01);
        pic.port_write_u8(MASTER_CMD, 0x0A);
        assert_eq!(pic.port_read_u8(MASTER_CMD), 0x00);
    }

    #[test]
    fn slave_requests_cascade_through_master_irq2() {
        let mut pic = DualPic8259::new();
        init_legacy_pc(&mut pic);

        pic.set_irq(8, 0);
        assert!(pic.int_asserted());
        assert_eq!(pic.resolve_vector(), VectorPoll::Vector(0x28));

        // Both the slave ISR bit and the master cascade bit are in service.
        pic.port_write_u8(SLAVE_CMD, 0x0B);
        assert_eq!(pic.port_read_u8(SLAVE_CMD), 0x01);
        pic.port_write_u8(MASTER_CMD, 0x0B);
        assert_eq!(pic.port_read_u8(MASTER_CMD), 0x04);

        // EOI slave then master.
        pic.port_write_u8(SLAVE_CMD, 0x20);
        pic.port_write_u8(MASTER_CMD, 0x20);
        assert_eq!(pic.resolve_vector(), VectorPoll::None);
    }

    #[test]
    fn specific_eoi_clears_only_the_addressed_level() {
        let mut pic = DualPic8259::new();
        init_legacy_pc(&mut pic);

        pic.set_irq(1, 0);
        assert_eq!(pic.resolve_vector(), VectorPoll::Vector(0x21));
        pic.set_irq(4, 0);

        // Specific EOI for level 4 (not in service) is an anomaly; level 1
        // must remain in service.
        pic.port_write_u8(MASTER_CMD, 0x64);
        pic.port_write_u8(MASTER_CMD, 0x0B);
        assert_eq!(pic.port_read_u8(MASTER_CMD), 0x02);

        pic.port_write_u8(MASTER_CMD, 0x61);
        assert_eq!(pic.resolve_vector(), VectorPoll::Vector(0x24));
    }

    #[test]
    fn rotate_on_eoi_moves_the_priority_point() {
        let mut pic = DualPic8259::new();
        init_legacy_pc(&mut pic);

        pic.set_irq(0, 0);
        assert_eq!(pic.resolve_vector(), VectorPoll::Vector(0x20));
        // Rotate on non-specific EOI: IRQ0 becomes lowest priority.
        pic.port_write_u8(MASTER_CMD, 0xA0);

        pic.set_irq(0, 0);
        pic.set_irq(1, 0);
        assert_eq!(pic.resolve_vector(), VectorPoll::Vector(0x21));
    }

    #[test]
    fn unexpected_eoi_is_ignored() {
        let mut pic = DualPic8259::new();
        init_legacy_pc(&mut pic);

        pic.set_irq(6, 0);
        pic.port_write_u8(MASTER_CMD, 0x20);

        // The latched (not yet in-service) request must survive.
        assert_eq!(pic.resolve_vector(), VectorPoll::Vector(0x26));
    }

    #[test]
    fn poll_command_acknowledges_highest_pending() {
        let mut pic = DualPic8259::new();
        init_legacy_pc(&mut pic);

        pic.set_irq(3, 0);
        pic.port_write_u8(MASTER_CMD, 0x0C);
        assert_eq!(pic.port_read_u8(MASTER_CMD), 0x83);

        // Poll consumed the request and put it in service.
        pic.port_write_u8(MASTER_CMD, 0x0B);
        assert_eq!(pic.port_read_u8(MASTER_CMD), 0x08);
    }

    #[test]
    fn special_mask_lets_masked_in_service_levels_unblock_others() {
        let mut pic = DualPic8259::new();
        init_legacy_pc(&mut pic);

        pic.set_irq(1, 0);
        assert_eq!(pic.resolve_vector(), VectorPoll::Vector(0x21));

        // Mask level 1 and enter special mask mode; a lower-priority request
        // becomes deliverable despite level 1 being in service.
        pic.port_write_u8(MASTER_DATA, 0x02);
        pic.port_write_u8(MASTER_CMD, 0x68);
        pic.set_irq(5, 0);
        assert_eq!(pic.resolve_vector(), VectorPoll::Vector(0x25));
    }

    #[test]
    fn snapshot_roundtrip_preserves_delivery_state() {
        let mut pic = DualPic8259::new();
        init_legacy_pc(&mut pic);
        pic.set_irq(0, 1);
        pic.set_irq(9, 0);
        assert_eq!(pic.save_state(), pic.save_state());

        let mut restored = DualPic8259::new();
        restored.load_state(&pic.save_state()).unwrap();

        assert_eq!(restored.resolve_vector(), VectorPoll::Retry);
        assert_eq!(restored.resolve_vector(), VectorPoll::Vector(0x20));
        pic.resolve_vector();
        assert_eq!(pic.resolve_vector(), VectorPoll::Vector(0x20));
    }
}

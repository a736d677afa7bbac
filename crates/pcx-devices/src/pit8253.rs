//! Intel 8253/8254 programmable interval timer.
//!
//! Counters are never ticked in real time: decrementing every 838ns of
//! emulated time would dominate the whole emulator. Instead each timer
//! records the CPU cycle count at which its countdown began and recomputes
//! the current count on demand from `(now - cycles_start) / cycles_per_tick`.
//! Modes 0, 2 and 3 are behaviorally modeled; the remaining modes are
//! accepted, reported verbatim by the read-back status, and counted like
//! their nearest modeled mode.

use pcx_io_snapshot::{
    IoSnapshot, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use pcx_platform::CycleClock;
use tracing::debug;

/// PIT input clock, Hz. The tick rate is fixed by a crystal, independent of
/// the CPU clock.
pub const PIT_HZ: u64 = 1_193_182;

pub const PIT_CH0: u16 = 0x40;
pub const PIT_CH1: u16 = 0x41;
pub const PIT_CH2: u16 = 0x42;
pub const PIT_CMD: u16 = 0x43;

const RW_LATCH: u8 = 0;
const RW_LSB: u8 = 1;
const RW_MSB: u8 = 2;
const RW_BOTH: u8 = 3;

const STATUS_OUT: u8 = 0x80;
const STATUS_NULL_COUNT: u8 = 0x40;

fn bcd_to_bin(byte: u8) -> u32 {
    u32::from(byte >> 4) * 10 + u32::from(byte & 0x0F)
}

fn bin_to_bcd(value: u32) -> u8 {
    (((value / 10) as u8) << 4) | ((value % 10) as u8)
}

/// Decodes a count byte pair. A programmed count of zero means the maximum:
/// 65536 binary, 10000 BCD.
fn pair_value(pair: [u8; 2], bcd: bool) -> u64 {
    let v = if bcd {
        bcd_to_bin(pair[1]) * 100 + bcd_to_bin(pair[0])
    } else {
        u32::from(u16::from_le_bytes(pair))
    };
    match v {
        0 if bcd => 10_000,
        0 => 65_536,
        v => u64::from(v),
    }
}

fn value_to_pair(value: u64, bcd: bool) -> [u8; 2] {
    if bcd {
        let v = (value % 10_000) as u32;
        [bin_to_bcd(v % 100), bin_to_bcd(v / 100)]
    } else {
        ((value % 65_536) as u16).to_le_bytes()
    }
}

#[derive(Debug, Clone)]
struct PitTimer {
    mode: u8,
    bcd: bool,
    rw: u8,
    count_init: [u8; 2],
    count_current: [u8; 2],
    count_latched: [u8; 2],
    /// Read/write position within the 1-or-2-byte I/O protocol.
    /// Invariant: `count_index <= count_bytes`.
    count_index: usize,
    count_bytes: usize,
    latched_count: bool,
    latched_status: bool,
    status_latch: u8,
    null_count: bool,
    out: bool,
    counting: bool,
    gate: bool,
    fired: bool,
    /// Cycle count at which the current countdown was anchored.
    cycles_start: u64,
    /// Committed initial count at the anchor (1..=65536 / 10000).
    start_value: u64,
}

impl PitTimer {
    fn new() -> Self {
        Self {
            mode: 0,
            bcd: false,
            rw: RW_BOTH,
            count_init: [0; 2],
            count_current: [0; 2],
            count_latched: [0; 2],
            count_index: 0,
            count_bytes: 2,
            latched_count: false,
            latched_status: false,
            status_latch: 0,
            null_count: true,
            out: false,
            counting: false,
            gate: true,
            fired: false,
            cycles_start: 0,
            start_value: 65_536,
        }
    }

    /// Behavioral mode: 1 counts like 0; 4/5/6 like 2; 7 like 3.
    fn modeled_mode(&self) -> u8 {
        match self.mode {
            0 | 1 => 0,
            3 | 7 => 3,
            _ => 2,
        }
    }

    fn program(&mut self, mode: u8, bcd: bool, rw: u8) {
        self.mode = mode;
        self.bcd = bcd;
        self.rw = rw;
        self.count_index = 0;
        self.count_bytes = if rw == RW_BOTH { 2 } else { 1 };
        self.latched_count = false;
        self.latched_status = false;
        self.null_count = true;
        self.counting = false;
        self.fired = false;
        // Mode 0 drives OUT low on the control write; the periodic modes
        // idle high until counting begins.
        self.out = self.modeled_mode() != 0;
        if !matches!(mode, 0 | 2 | 3) {
            debug!(mode, "PIT mode not behaviorally modeled");
        }
    }

    fn write_count_byte(&mut self, value: u8, now: u64) {
        if self.count_index >= self.count_bytes {
            self.count_index = 0;
        }
        match self.rw {
            RW_LSB => self.count_init = [value, 0],
            RW_MSB => self.count_init = [0, value],
            _ => self.count_init[self.count_index] = value,
        }
        self.count_index += 1;
        self.null_count = true;
        if self.count_index == self.count_bytes {
            self.count_index = 0;
            self.commit_count(now);
        }
    }

    /// A fully written count either (re)starts the countdown immediately
    /// (timer stopped, or modes 0/4) or is picked up at the next reload
    /// boundary without disturbing the current countdown.
    fn commit_count(&mut self, now: u64) {
        self.null_count = false;
        if !self.counting || self.mode == 0 || self.mode == 4 {
            self.start(now);
        }
    }

    fn start(&mut self, now: u64) {
        self.cycles_start = now;
        self.start_value = pair_value(self.count_init, self.bcd);
        self.count_current = self.count_init;
        self.counting = true;
        self.fired = false;
        self.out = self.modeled_mode() != 0;
    }

    /// Recomputes the current count from elapsed cycles. Returns `true` if
    /// timer-interrupt conditions were met since the previous update.
    fn update(&mut self, now: u64, cycles_per_tick: u64) -> bool {
        if !self.counting || !self.gate {
            return false;
        }
        let ticks = now.saturating_sub(self.cycles_start) / cycles_per_tick;
        match self.modeled_mode() {
            0 => {
                if ticks >= self.start_value {
                    self.count_current = value_to_pair(0, self.bcd);
                    self.out = true;
                    self.counting = false;
                    if !self.fired {
                        self.fired = true;
                        return true;
                    }
                } else {
                    self.count_current = value_to_pair(self.start_value - ticks, self.bcd);
                }
                false
            }
            2 => {
                let mut fired = false;
                let mut period = self.start_value;
                if ticks >= period {
                    // Reload: re-anchor at the most recent boundary,
                    // adjusted for overshoot, picking up any count written
                    // mid-period.
                    let periods = ticks / period;
                    self.cycles_start += periods * period * cycles_per_tick;
                    self.start_value = pair_value(self.count_init, self.bcd);
                    fired = true;
                    period = self.start_value;
                    let left = now.saturating_sub(self.cycles_start) / cycles_per_tick;
                    if left >= period {
                        // A shortened reload value can leave us past further
                        // boundaries; fold them into the anchor.
                        self.cycles_start += (left / period) * period * cycles_per_tick;
                    }
                }
                let left = now.saturating_sub(self.cycles_start) / cycles_per_tick;
                self.count_current = value_to_pair(period - left, self.bcd);
                self.out = true;
                fired
            }
            _ => {
                // Mode 3: the count decrements at twice the tick rate and
                // OUT flips each time it runs out; one full OUT cycle
                // consumes exactly `start_value` input ticks.
                let mut fired = false;
                let period = self.start_value;
                let eff = ticks * 2;
                let pairs = eff / period / 2;
                if pairs > 0 {
                    self.cycles_start += pairs * period * cycles_per_tick;
                    self.start_value = pair_value(self.count_init, self.bcd);
                    fired = true;
                }
                let period = self.start_value;
                let eff = now.saturating_sub(self.cycles_start) / cycles_per_tick * 2;
                self.out = (eff / period) % 2 == 0;
                self.count_current = value_to_pair(period - eff % period, self.bcd);
                fired
            }
        }
    }

    /// Cycles until this timer's next interrupt-relevant event, or `None`
    /// if no event is scheduled.
    fn cycles_to_event(&self, now: u64, cycles_per_tick: u64) -> Option<u64> {
        if !self.counting || !self.gate {
            return None;
        }
        let elapsed = now.saturating_sub(self.cycles_start);
        let total = match self.modeled_mode() {
            0 => {
                if self.fired {
                    return None;
                }
                return (self.start_value * cycles_per_tick)
                    .checked_sub(elapsed)
                    .map(|c| c.max(1))
                    .or(Some(1));
            }
            // Modes 2 and 3 both fire on full-period boundaries from the
            // anchor (mode 3's high-going transition lands there).
            _ => self.start_value * cycles_per_tick,
        };
        let next = total - elapsed % total;
        Some(next.max(1))
    }

    fn latch_count(&mut self) {
        if !self.latched_count {
            self.count_latched = self.count_current;
            self.latched_count = true;
        }
    }

    fn latch_status(&mut self) {
        if !self.latched_status {
            let mut status = (self.rw << 4) | (self.mode << 1) | u8::from(self.bcd);
            if self.out {
                status |= STATUS_OUT;
            }
            if self.null_count {
                status |= STATUS_NULL_COUNT;
            }
            self.status_latch = status;
            self.latched_status = true;
        }
    }

    fn read_byte(&mut self) -> u8 {
        if self.latched_status {
            self.latched_status = false;
            return self.status_latch;
        }
        if self.latched_count {
            let byte = self.count_latched[self.count_index];
            self.count_index += 1;
            if self.count_index >= self.count_bytes {
                self.count_index = 0;
                self.latched_count = false;
            }
            return byte;
        }
        let byte = match self.rw {
            RW_LSB => self.count_current[0],
            RW_MSB => self.count_current[1],
            _ => self.count_current[self.count_index],
        };
        self.count_index += 1;
        if self.count_index >= self.count_bytes {
            self.count_index = 0;
        }
        byte
    }

    fn set_gate(&mut self, level: bool, now: u64, cycles_per_tick: u64) {
        if self.gate == level {
            return;
        }
        if !level {
            // Freeze the visible count at the moment the gate drops.
            self.update(now, cycles_per_tick);
        }
        self.gate = level;
        if level && self.counting {
            // Rising gate reloads and restarts the countdown.
            self.start(now);
        }
    }
}

/// One bank of three counters. Timer 0 drives the interrupt line, timer 2
/// gates the speaker. Dual-PIT machines instantiate a second bank at its
/// own base port.
pub struct Pit8253 {
    timers: [PitTimer; 3],
    clock: CycleClock,
    cycles_per_tick: u64,
    base: u16,
    irq0: Option<Box<dyn FnMut()>>,
}

impl Pit8253 {
    pub fn new(clock: CycleClock, cycles_per_tick: u64) -> Self {
        Self {
            timers: [PitTimer::new(), PitTimer::new(), PitTimer::new()],
            clock,
            cycles_per_tick: cycles_per_tick.max(1),
            base: PIT_CH0,
            irq0: None,
        }
    }

    pub fn with_base(mut self, base: u16) -> Self {
        self.base = base;
        self
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    /// Connects the timer-0 interrupt output (IRQ0 on the primary bank).
    pub fn connect_irq0(&mut self, f: impl FnMut() + 'static) {
        self.irq0 = Some(Box::new(f));
    }

    fn timer_index(&self, port: u16) -> Option<usize> {
        let idx = port.wrapping_sub(self.base);
        (idx < 3).then_some(usize::from(idx))
    }

    /// Recomputes one timer, routing a timer-0 fire to the interrupt line.
    fn update_timer(&mut self, idx: usize, now: u64) {
        let fired = self.timers[idx].update(now, self.cycles_per_tick);
        if idx == 0 && fired {
            if let Some(irq0) = self.irq0.as_mut() {
                irq0();
            }
        }
    }

    pub fn write_port(&mut self, port: u16, value: u8) {
        let now = self.clock.now_cycles();
        if port == self.base + 3 {
            self.write_control(value, now);
            return;
        }
        if let Some(idx) = self.timer_index(port) {
            self.update_timer(idx, now);
            self.timers[idx].write_count_byte(value, now);
        }
    }

    fn write_control(&mut self, value: u8, now: u64) {
        let sel = value >> 6;
        if sel == 3 {
            // 8254 read-back: latch status and/or count for each selected
            // timer without disturbing counting.
            let latch_count = value & 0x20 == 0;
            let latch_status = value & 0x10 == 0;
            for idx in 0..3 {
                if value & (0x02 << idx) == 0 {
                    continue;
                }
                self.update_timer(idx, now);
                let timer = &mut self.timers[idx];
                if latch_status {
                    timer.latch_status();
                }
                if latch_count {
                    timer.latch_count();
                }
            }
            return;
        }

        let rw = (value >> 4) & 3;
        self.update_timer(usize::from(sel), now);
        let timer = &mut self.timers[usize::from(sel)];
        if rw == RW_LATCH {
            timer.latch_count();
            return;
        }
        timer.program((value >> 1) & 7, value & 1 != 0, rw);
    }

    pub fn read_port(&mut self, port: u16) -> u8 {
        if port == self.base + 3 {
            // The control port is write-only.
            return 0xFF;
        }
        let now = self.clock.now_cycles();
        match self.timer_index(port) {
            Some(idx) => {
                if !self.timers[idx].latched_count && !self.timers[idx].latched_status {
                    self.update_timer(idx, now);
                }
                self.timers[idx].read_byte()
            }
            None => 0xFF,
        }
    }

    /// Recomputes all three counters from the current cycle count, firing
    /// the timer-0 interrupt callback if its output demanded one.
    pub fn update(&mut self) {
        let now = self.clock.now_cycles();
        for idx in 0..3 {
            self.update_timer(idx, now);
        }
    }

    /// Current OUT level of a timer (recomputed on demand).
    pub fn output(&mut self, idx: usize) -> bool {
        self.update();
        self.timers[idx].out
    }

    /// Gate input for timer 2 (speaker gate, system control port bit 0).
    pub fn set_gate2(&mut self, level: bool) {
        let now = self.clock.now_cycles();
        let cpt = self.cycles_per_tick;
        self.timers[2].set_gate(level, now, cpt);
    }

    pub fn gate2(&self) -> bool {
        self.timers[2].gate
    }

    /// Bounds a requested CPU burst so execution lands exactly on timer 0's
    /// next interrupt event.
    pub fn cycle_limit(&self, requested: u64) -> u64 {
        let now = self.clock.now_cycles();
        match self.timers[0].cycles_to_event(now, self.cycles_per_tick) {
            Some(next) => requested.min(next),
            None => requested,
        }
    }
}

impl IoSnapshot for Pit8253 {
    const DEVICE_ID: [u8; 4] = *b"PIT3";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.put_u16(0x0001, self.base);
        w.put_u64(0x0002, self.cycles_per_tick);
        for (i, t) in self.timers.iter().enumerate() {
            let base = 0x0100 * (i as u16 + 1);
            w.put_u8(base, t.mode);
            w.put_bool(base + 1, t.bcd);
            w.put_u8(base + 2, t.rw);
            w.put_bytes(base + 3, &t.count_init);
            w.put_bytes(base + 4, &t.count_current);
            w.put_bytes(base + 5, &t.count_latched);
            w.put_u8(base + 6, t.count_index as u8);
            w.put_u8(base + 7, t.count_bytes as u8);
            w.put_bool(base + 8, t.latched_count);
            w.put_bool(base + 9, t.latched_status);
            w.put_u8(base + 10, t.status_latch);
            w.put_bool(base + 11, t.null_count);
            w.put_bool(base + 12, t.out);
            w.put_bool(base + 13, t.counting);
            w.put_bool(base + 14, t.gate);
            w.put_bool(base + 15, t.fired);
            w.put_u64(base + 16, t.cycles_start);
            w.put_u64(base + 17, t.start_value);
        }
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID, Self::DEVICE_VERSION)?;
        self.base = r.u16(0x0001)?;
        self.cycles_per_tick = r.u64(0x0002)?.max(1);
        for (i, t) in self.timers.iter_mut().enumerate() {
            let base = 0x0100 * (i as u16 + 1);
            t.mode = r.u8(base)?;
            t.bcd = r.bool(base + 1)?;
            t.rw = r.u8(base + 2)?;
            t.count_init = r.bytes::<2>(base + 3)?;
            t.count_current = r.bytes::<2>(base + 4)?;
            t.count_latched = r.bytes::<2>(base + 5)?;
            t.count_index = usize::from(r.u8(base + 6)?);
            t.count_bytes = usize::from(r.u8(base + 7)?).clamp(1, 2);
            t.count_index = t.count_index.min(t.count_bytes);
            t.latched_count = r.bool(base + 8)?;
            t.latched_status = r.bool(base + 9)?;
            t.status_latch = r.u8(base + 10)?;
            t.null_count = r.bool(base + 11)?;
            t.out = r.bool(base + 12)?;
            t.counting = r.bool(base + 13)?;
            t.gate = r.bool(base + 14)?;
            t.fired = r.bool(base + 15)?;
            t.cycles_start = r.u64(base + 16)?;
            t.start_value = r.u64(base + 17)?.max(1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    const CPT: u64 = 4; // 4.77 MHz CPU / 1.193 MHz PIT input

    fn pit_with_counter() -> (Pit8253, CycleClock, Rc<Cell<u32>>) {
        let clock = CycleClock::new();
        let mut pit = Pit8253::new(clock.clone(), CPT);
        let fired = Rc::new(Cell::new(0u32));
        let fired_clone = fired.clone();
        pit.connect_irq0(move || fired_clone.set(fired_clone.get() + 1));
        (pit, clock, fired)
    }

    fn program(pit: &mut Pit8253, control: u8, divisor: u16) {
        pit.write_port(PIT_CMD, control);
        pit.write_port(PIT_CH0, (divisor & 0xFF) as u8);
        if control & 0x30 == 0x30 {
            pit.write_port(PIT_CH0, (divisor >> 8) as u8);
        }
    }

    fn read_count(pit: &mut Pit8253) -> u16 {
        let lo = pit.read_port(PIT_CH0);
        let hi = pit.read_port(PIT_CH0);
        u16::from_le_bytes([lo, hi])
    }

    #[test]
    fn mode0_fires_once_and_stops() {
        let (mut pit, clock, fired) = pit_with_counter();
        program(&mut pit, 0x30, 100); // ch0, lo/hi, mode 0

        clock.advance(99 * CPT);
        pit.update();
        assert_eq!(fired.get(), 0);
        assert!(!pit.output(0));

        clock.advance(10 * CPT);
        pit.update();
        assert_eq!(fired.get(), 1);
        assert!(pit.output(0));

        clock.advance(1000 * CPT);
        pit.update();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn mode2_fires_each_reload() {
        let (mut pit, clock, fired) = pit_with_counter();
        program(&mut pit, 0x34, 10); // mode 2

        for expected in 1..=3 {
            clock.advance(10 * CPT);
            pit.update();
            assert_eq!(fired.get(), expected);
        }
    }

    #[test]
    fn mode2_current_count_recomputes_from_cycles() {
        let (mut pit, clock, _) = pit_with_counter();
        program(&mut pit, 0x34, 1000);

        clock.advance(250 * CPT);
        assert_eq!(read_count(&mut pit), 750);
        clock.advance(500 * CPT);
        assert_eq!(read_count(&mut pit), 250);
    }

    #[test]
    fn latched_count_is_stable_until_fully_read() {
        let (mut pit, clock, _) = pit_with_counter();
        program(&mut pit, 0x34, 1000);

        clock.advance(100 * CPT);
        pit.write_port(PIT_CMD, 0x00); // latch ch0
        clock.advance(400 * CPT);

        // The latch holds the count from latch time despite elapsed cycles.
        let lo = pit.read_port(PIT_CH0);
        clock.advance(100 * CPT);
        let hi = pit.read_port(PIT_CH0);
        assert_eq!(u16::from_le_bytes([lo, hi]), 900);

        // Un-latched reads now track elapsed time again.
        assert_eq!(read_count(&mut pit), 1000 - 600);
    }

    #[test]
    fn readback_latches_status_and_count() {
        let (mut pit, clock, _) = pit_with_counter();
        program(&mut pit, 0x34, 200);
        clock.advance(50 * CPT);

        pit.write_port(PIT_CMD, 0xC2); // read-back: status+count, ch0
        let status = pit.read_port(PIT_CH0);
        assert_eq!(status & 0x0E, 0x04); // mode 2
        assert_eq!(status & 0x30, 0x30); // lo/hi access
        assert_ne!(status & STATUS_OUT, 0); // mode 2 output idles high
        assert_eq!(status & STATUS_NULL_COUNT, 0);
        assert_eq!(read_count(&mut pit), 150);
    }

    #[test]
    fn new_count_while_counting_waits_for_reload_boundary() {
        let (mut pit, clock, fired) = pit_with_counter();
        program(&mut pit, 0x34, 100);
        clock.advance(50 * CPT);
        pit.update();

        // Mid-period rewrite must not disturb the current countdown.
        pit.write_port(PIT_CH0, 10);
        pit.write_port(PIT_CH0, 0);
        clock.advance(25 * CPT);
        pit.update();
        assert_eq!(fired.get(), 0);

        // The old period completes on schedule, then the new divisor rules.
        clock.advance(25 * CPT);
        pit.update();
        assert_eq!(fired.get(), 1);
        clock.advance(10 * CPT);
        pit.update();
        assert_eq!(fired.get(), 2);
    }

    #[test]
    fn mode3_output_is_a_square_wave() {
        let (mut pit, clock, fired) = pit_with_counter();
        program(&mut pit, 0x36, 100); // mode 3

        assert!(pit.output(0));
        clock.advance(50 * CPT);
        assert!(!pit.output(0)); // low half after N/2 ticks
        clock.advance(50 * CPT);
        assert!(pit.output(0)); // high-going transition after N ticks
        pit.update();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn lsb_only_access_writes_and_reads_one_byte() {
        let (mut pit, clock, fired) = pit_with_counter();
        pit.write_port(PIT_CMD, 0x14); // lo-only, mode 2
        pit.write_port(PIT_CH0, 50);

        clock.advance(50 * CPT);
        pit.update();
        assert_eq!(fired.get(), 1);
        clock.advance(20 * CPT);
        assert_eq!(pit.read_port(PIT_CH0), 30);
    }

    #[test]
    fn bcd_counts_decimal() {
        let (mut pit, clock, _) = pit_with_counter();
        pit.write_port(PIT_CMD, 0x35); // lo/hi, mode 2, BCD
        pit.write_port(PIT_CH0, 0x00);
        pit.write_port(PIT_CH0, 0x05); // 500 decimal

        clock.advance(123 * CPT);
        let lo = pit.read_port(PIT_CH0);
        let hi = pit.read_port(PIT_CH0);
        assert_eq!((lo, hi), (0x77, 0x03)); // 377 in packed BCD
    }

    #[test]
    fn gate2_freezes_and_restarts_timer2() {
        let clock = CycleClock::new();
        let mut pit = Pit8253::new(clock.clone(), CPT);
        pit.write_port(PIT_CMD, 0xB6); // ch2, lo/hi, mode 3
        pit.write_port(PIT_CH2, 100);
        pit.write_port(PIT_CH2, 0);

        clock.advance(30 * CPT);
        pit.set_gate2(false);
        clock.advance(1000 * CPT);

        pit.write_port(PIT_CMD, 0x80); // latch ch2
        let lo = pit.read_port(PIT_CH2);
        let hi = pit.read_port(PIT_CH2);
        assert_eq!(u16::from_le_bytes([lo, hi]), 40); // frozen at 100 - 30*2

        // Rising gate reloads the full count.
        pit.set_gate2(true);
        clock.advance(10 * CPT);
        pit.write_port(PIT_CMD, 0x80);
        let lo = pit.read_port(PIT_CH2);
        let hi = pit.read_port(PIT_CH2);
        assert_eq!(u16::from_le_bytes([lo, hi]), 80);
    }

    #[test]
    fn cycle_limit_lands_on_next_timer0_event() {
        let (mut pit, clock, _) = pit_with_counter();
        program(&mut pit, 0x34, 100);

        assert_eq!(pit.cycle_limit(10_000), 100 * CPT);
        clock.advance(30 * CPT);
        assert_eq!(pit.cycle_limit(10_000), 70 * CPT);
        assert_eq!(pit.cycle_limit(8), 8);
    }

    #[test]
    fn snapshot_roundtrip_preserves_write_phase() {
        let clock = CycleClock::new();
        let mut pit = Pit8253::new(clock.clone(), CPT);
        pit.write_port(PIT_CMD, 0x34);
        pit.write_port(PIT_CH0, 10); // low byte only: not committed yet

        assert_eq!(pit.save_state(), pit.save_state());
        let mut restored = Pit8253::new(clock.clone(), CPT);
        restored.load_state(&pit.save_state()).unwrap();

        clock.advance(100 * CPT);
        restored.update();
        assert_eq!(restored.cycle_limit(1_000_000), 1_000_000); // still idle

        restored.write_port(PIT_CH0, 0); // commit divisor 10
        clock.advance(10 * CPT);
        restored.update();
        assert!(restored.cycle_limit(1_000_000) <= 10 * CPT);
    }
}

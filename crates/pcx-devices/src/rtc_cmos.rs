//! MC146818A real-time clock and 64-byte CMOS register file.
//!
//! The RTC image (registers 0x00-0x09) is always kept in binary, 24-hour
//! form internally; BCD and 12-hour encodings selected by status register B
//! are applied on the way through the data port. The once-per-second update
//! chain is driven by the shared cycle clock, the same on-demand delta
//! computation the timer bank uses, so the device stays deterministic and
//! snapshot-exact.

use crate::irq::IrqLine;
use pcx_io_snapshot::{
    IoSnapshot, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use pcx_platform::CycleClock;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub const RTC_INDEX: u16 = 0x70;
pub const RTC_DATA: u16 = 0x71;

pub const REG_SECONDS: u8 = 0x00;
pub const REG_SECONDS_ALARM: u8 = 0x01;
pub const REG_MINUTES: u8 = 0x02;
pub const REG_MINUTES_ALARM: u8 = 0x03;
pub const REG_HOURS: u8 = 0x04;
pub const REG_HOURS_ALARM: u8 = 0x05;
pub const REG_WEEKDAY: u8 = 0x06;
pub const REG_DAY: u8 = 0x07;
pub const REG_MONTH: u8 = 0x08;
pub const REG_YEAR: u8 = 0x09;
pub const REG_STATUS_A: u8 = 0x0A;
pub const REG_STATUS_B: u8 = 0x0B;
pub const REG_STATUS_C: u8 = 0x0C;
pub const REG_STATUS_D: u8 = 0x0D;
pub const REG_DIAGNOSTIC: u8 = 0x0E;
pub const REG_CENTURY: u8 = 0x32;

const STATUSA_UIP: u8 = 0x80;
const STATUSA_RATE: u8 = 0x0F;

const STATUSB_SET: u8 = 0x80;
const STATUSB_PIE: u8 = 0x40;
const STATUSB_AIE: u8 = 0x20;
const STATUSB_UIE: u8 = 0x10;
const STATUSB_BINARY: u8 = 0x04;
const STATUSB_HOUR24: u8 = 0x02;

const STATUSC_IRQF: u8 = 0x80;
const STATUSC_PF: u8 = 0x40;
const STATUSC_AF: u8 = 0x20;
const STATUSC_UF: u8 = 0x10;

const STATUSD_VRT: u8 = 0x80;

/// Alarm bytes at or above this value match any time component.
const ALARM_DONT_CARE: u8 = 0xC0;

/// Checksummed configuration range; the sum is stored big-endian at
/// 0x2E/0x2F.
const CHECKSUM_FIRST: u8 = 0x10;
const CHECKSUM_LAST: u8 = 0x2D;
const CHECKSUM_HI: u8 = 0x2E;
const CHECKSUM_LO: u8 = 0x2F;

/// The rate-select bits are modeled as a fixed 1024 Hz periodic source
/// whenever they are non-zero.
const PERIODIC_HZ: u64 = 1024;

const CMOS_SIZE: usize = 0x40;

fn bin_to_bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}

fn bcd_to_bin(byte: u8) -> u8 {
    (byte >> 4) * 10 + (byte & 0x0F)
}

fn month_length(month: u8, year: u16) -> u8 {
    match month {
        2 if year % 4 == 0 && (year % 100 != 0 || year % 400 == 0) => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

/// Initial wall-clock value for the RTC image. Binary, 24-hour, full year;
/// weekday is 1-based with Sunday = 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcDateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub weekday: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl RtcDateTime {
    /// Host wall-clock time (UTC). Falls back to [`Default`] when the host
    /// clock is unreadable or outside the representable 1980-2099 window.
    pub fn host_now() -> Self {
        let secs = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => elapsed.as_secs(),
            Err(_) => return Self::default(),
        };
        let days = (secs / 86_400) as i64;
        let tod = secs % 86_400;

        // Civil-from-days, era-based.
        let z = days + 719_468;
        let era = z.div_euclid(146_097);
        let doe = z.rem_euclid(146_097);
        let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        let day = (doy - (153 * mp + 2) / 5 + 1) as u8;
        let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u8;
        let year = (yoe + era * 400 + i64::from(month <= 2)) as u16;

        let datetime = Self {
            year,
            month,
            day,
            // 1970-01-01 was a Thursday; Sunday = 1.
            weekday: ((days + 4).rem_euclid(7) + 1) as u8,
            hour: (tod / 3_600) as u8,
            minute: (tod / 60 % 60) as u8,
            second: (tod % 60) as u8,
        };
        if datetime.is_valid() {
            datetime
        } else {
            Self::default()
        }
    }

    fn is_valid(&self) -> bool {
        (1980..=2099).contains(&self.year)
            && (1..=12).contains(&self.month)
            && (1..=month_length(self.month, self.year)).contains(&self.day)
            && (1..=7).contains(&self.weekday)
            && self.hour < 24
            && self.minute < 60
            && self.second < 60
    }
}

impl Default for RtcDateTime {
    /// Tuesday, 1980-01-01 00:00:00.
    fn default() -> Self {
        Self {
            year: 1980,
            month: 1,
            day: 1,
            weekday: 3,
            hour: 0,
            minute: 0,
            second: 0,
        }
    }
}

pub struct RtcCmos {
    cmos: [u8; CMOS_SIZE],
    index: u8,
    nmi_masked: bool,
    clock: CycleClock,
    cycles_per_second: u64,
    /// Cycle count at the start of the current RTC second.
    second_anchor: u64,
    /// Cycle count of the most recent periodic-interrupt boundary.
    periodic_anchor: u64,
    /// Heartbeat some firmware polls for: flipped on every status-A read.
    uip: bool,
    irq: Option<Box<dyn IrqLine>>,
}

impl RtcCmos {
    pub fn new(clock: CycleClock, cycles_per_second: u64, datetime: RtcDateTime) -> Self {
        let datetime = if datetime.is_valid() {
            datetime
        } else {
            warn!(?datetime, "invalid RTC date, substituting the host clock");
            RtcDateTime::host_now()
        };
        let now = clock.now_cycles();
        let mut rtc = Self {
            cmos: [0; CMOS_SIZE],
            index: REG_STATUS_D,
            nmi_masked: false,
            clock,
            cycles_per_second: cycles_per_second.max(1),
            second_anchor: now,
            periodic_anchor: now,
            uip: false,
            irq: None,
        };
        rtc.cmos[REG_SECONDS as usize] = datetime.second;
        rtc.cmos[REG_MINUTES as usize] = datetime.minute;
        rtc.cmos[REG_HOURS as usize] = datetime.hour;
        rtc.cmos[REG_WEEKDAY as usize] = datetime.weekday;
        rtc.cmos[REG_DAY as usize] = datetime.day;
        rtc.cmos[REG_MONTH as usize] = datetime.month;
        rtc.cmos[REG_YEAR as usize] = (datetime.year % 100) as u8;
        rtc.cmos[REG_CENTURY as usize] = bin_to_bcd((datetime.year / 100) as u8);
        rtc.cmos[REG_STATUS_A as usize] = 0x26; // divider on, 1024 Hz rate
        rtc.cmos[REG_STATUS_B as usize] = STATUSB_HOUR24;
        rtc.cmos[REG_STATUS_D as usize] = STATUSD_VRT;
        rtc.recompute_checksum();
        rtc
    }

    /// Connects the IRQ8 line into the interrupt controller.
    pub fn connect_irq(&mut self, line: impl IrqLine + 'static) {
        self.irq = Some(Box::new(line));
    }

    /// Seeds a configuration byte (memory size, drive types, equipment)
    /// without going through the port protocol. Keeps the checksum valid.
    pub fn set_config_byte(&mut self, reg: u8, value: u8) {
        if usize::from(reg) >= CMOS_SIZE {
            return;
        }
        self.cmos[usize::from(reg)] = value;
        self.recompute_checksum();
    }

    pub fn config_byte(&self, reg: u8) -> u8 {
        self.cmos.get(usize::from(reg)).copied().unwrap_or(0xFF)
    }

    /// Writes on the index port also carry the NMI mask in bit 7.
    pub fn nmi_masked(&self) -> bool {
        self.nmi_masked
    }

    pub fn write_port(&mut self, port: u16, value: u8) {
        if port == RTC_INDEX {
            self.nmi_masked = value & 0x80 != 0;
            let index = value & 0x7F;
            if usize::from(index) >= CMOS_SIZE {
                debug!(index, "out-of-range CMOS address");
            }
            self.index = index % CMOS_SIZE as u8;
        } else {
            self.write_data(value);
        }
    }

    pub fn read_port(&mut self, port: u16) -> u8 {
        if port == RTC_INDEX {
            // The index register is write-only on the original part.
            0xFF
        } else {
            self.read_data()
        }
    }

    fn hour12(&self) -> bool {
        self.cmos[REG_STATUS_B as usize] & STATUSB_HOUR24 == 0
    }

    fn bcd(&self) -> bool {
        self.cmos[REG_STATUS_B as usize] & STATUSB_BINARY == 0
    }

    /// Converts an internal binary/24-hour RTC byte to the status-B
    /// presentation encoding.
    fn get_rtc_byte(&self, reg: u8) -> u8 {
        let value = self.cmos[usize::from(reg)];
        if matches!(reg, REG_SECONDS_ALARM | REG_MINUTES_ALARM | REG_HOURS_ALARM)
            && value >= ALARM_DONT_CARE
        {
            return value;
        }
        let mut pm = false;
        let mut value = value;
        if matches!(reg, REG_HOURS | REG_HOURS_ALARM) && self.hour12() {
            // Midnight presents as 12 AM, noon as 12 PM.
            if value == 0 {
                value = 12;
            } else if value >= 12 {
                pm = true;
                if value > 12 {
                    value -= 12;
                }
            }
        }
        if self.bcd() {
            value = bin_to_bcd(value);
        }
        if pm {
            value |= 0x80;
        }
        value
    }

    /// Inverse of [`Self::get_rtc_byte`]: decodes a presentation byte into
    /// internal binary/24-hour form.
    fn set_rtc_byte(&mut self, reg: u8, byte: u8) {
        if matches!(reg, REG_SECONDS_ALARM | REG_MINUTES_ALARM | REG_HOURS_ALARM)
            && byte >= ALARM_DONT_CARE
        {
            self.cmos[usize::from(reg)] = byte;
            return;
        }
        let hours = matches!(reg, REG_HOURS | REG_HOURS_ALARM);
        let pm = hours && self.hour12() && byte & 0x80 != 0;
        let mut value = if hours && self.hour12() { byte & 0x7F } else { byte };
        if self.bcd() {
            value = bcd_to_bin(value);
        }
        if hours && self.hour12() {
            if value == 12 {
                value = if pm { 12 } else { 0 };
            } else if pm {
                value += 12;
            }
        }
        self.cmos[usize::from(reg)] = value;
    }

    fn write_data(&mut self, value: u8) {
        let reg = self.index;
        match reg {
            REG_SECONDS..=REG_YEAR => self.set_rtc_byte(reg, value),
            REG_STATUS_A => {
                // UIP is read-only.
                self.cmos[usize::from(reg)] = value & !STATUSA_UIP;
            }
            REG_STATUS_B => {
                let was_set = self.cmos[usize::from(reg)] & STATUSB_SET != 0;
                self.cmos[usize::from(reg)] = value;
                if !was_set && value & STATUSB_SET != 0 {
                    // Software is reprogramming the clock; restart the
                    // current second so the first post-SET update lands a
                    // full second later.
                    self.second_anchor = self.clock.now_cycles();
                }
                self.sync_irq();
            }
            REG_STATUS_C | REG_STATUS_D => {
                debug!(reg, "write to read-only RTC status register ignored");
            }
            _ => {
                self.cmos[usize::from(reg)] = value;
                if (CHECKSUM_FIRST..=CHECKSUM_LAST).contains(&reg) {
                    self.recompute_checksum();
                }
            }
        }
    }

    fn read_data(&mut self) -> u8 {
        self.update();
        let reg = self.index;
        match reg {
            REG_SECONDS..=REG_YEAR => self.get_rtc_byte(reg),
            REG_STATUS_A => {
                let mut value = self.cmos[usize::from(reg)] & !STATUSA_UIP;
                if self.uip {
                    value |= STATUSA_UIP;
                }
                self.uip = !self.uip;
                value
            }
            REG_STATUS_C => {
                // Reading status C acknowledges every pending source.
                let value = self.cmos[usize::from(reg)];
                self.cmos[usize::from(reg)] = 0;
                self.sync_irq();
                value
            }
            _ => self.cmos[usize::from(reg)],
        }
    }

    fn recompute_checksum(&mut self) {
        let sum: u16 = (usize::from(CHECKSUM_FIRST)..=usize::from(CHECKSUM_LAST))
            .map(|i| u16::from(self.cmos[i]))
            .sum();
        self.cmos[usize::from(CHECKSUM_HI)] = (sum >> 8) as u8;
        self.cmos[usize::from(CHECKSUM_LO)] = sum as u8;
    }

    fn alarm_component_matches(&self, alarm_reg: u8, time_reg: u8) -> bool {
        let alarm = self.cmos[usize::from(alarm_reg)];
        alarm >= ALARM_DONT_CARE || alarm == self.cmos[usize::from(time_reg)]
    }

    fn tick_second(&mut self) {
        let mut flags = STATUSC_UF;

        let sec = &mut self.cmos[REG_SECONDS as usize];
        *sec += 1;
        if *sec >= 60 {
            *sec = 0;
            let min = &mut self.cmos[REG_MINUTES as usize];
            *min += 1;
            if *min >= 60 {
                *min = 0;
                let hour = &mut self.cmos[REG_HOURS as usize];
                *hour += 1;
                if *hour >= 24 {
                    *hour = 0;
                    self.tick_day();
                }
            }
        }

        if self.alarm_component_matches(REG_SECONDS_ALARM, REG_SECONDS)
            && self.alarm_component_matches(REG_MINUTES_ALARM, REG_MINUTES)
            && self.alarm_component_matches(REG_HOURS_ALARM, REG_HOURS)
        {
            flags |= STATUSC_AF;
        }
        self.cmos[REG_STATUS_C as usize] |= flags;
    }

    fn tick_day(&mut self) {
        let weekday = &mut self.cmos[REG_WEEKDAY as usize];
        *weekday = *weekday % 7 + 1;

        let year = u16::from(bcd_to_bin(self.cmos[REG_CENTURY as usize])) * 100
            + u16::from(self.cmos[REG_YEAR as usize]);
        let month = self.cmos[REG_MONTH as usize];
        let day = &mut self.cmos[REG_DAY as usize];
        *day += 1;
        if *day <= month_length(month, year) {
            return;
        }
        *day = 1;
        let month = &mut self.cmos[REG_MONTH as usize];
        *month += 1;
        if *month <= 12 {
            return;
        }
        *month = 1;
        let year = &mut self.cmos[REG_YEAR as usize];
        *year += 1;
        if *year < 100 {
            return;
        }
        *year = 0;
        let century = &mut self.cmos[REG_CENTURY as usize];
        *century = bin_to_bcd(bcd_to_bin(*century) + 1);
    }

    fn periodic_enabled(&self) -> bool {
        self.cmos[REG_STATUS_A as usize] & STATUSA_RATE != 0
    }

    /// Recomputes the clock from elapsed cycles: advances whole seconds
    /// through the update chain (suppressed while SET is asserted) and
    /// accounts periodic-interrupt boundaries, then refreshes the IRQ line.
    pub fn update(&mut self) {
        let now = self.clock.now_cycles();
        let cps = self.cycles_per_second;

        let seconds = now.saturating_sub(self.second_anchor) / cps;
        if seconds > 0 {
            self.second_anchor += seconds * cps;
            if self.cmos[REG_STATUS_B as usize] & STATUSB_SET == 0 {
                for _ in 0..seconds {
                    self.tick_second();
                }
            }
        }

        let period = (cps / PERIODIC_HZ).max(1);
        let crossings = now.saturating_sub(self.periodic_anchor) / period;
        if crossings > 0 {
            self.periodic_anchor += crossings * period;
            if self.periodic_enabled() {
                self.cmos[REG_STATUS_C as usize] |= STATUSC_PF;
            }
        }

        self.sync_irq();
    }

    /// Bounds a requested CPU burst so execution lands on the next periodic
    /// interrupt boundary when the periodic interrupt is armed.
    pub fn cycle_limit(&self, requested: u64) -> u64 {
        if !self.periodic_enabled() || self.cmos[REG_STATUS_B as usize] & STATUSB_PIE == 0 {
            return requested;
        }
        let period = (self.cycles_per_second / PERIODIC_HZ).max(1);
        let elapsed = self.clock.now_cycles().saturating_sub(self.periodic_anchor);
        let next = (period - elapsed % period).max(1);
        requested.min(next)
    }

    fn sync_irq(&mut self) {
        let flags = self.cmos[REG_STATUS_C as usize];
        let enables = self.cmos[REG_STATUS_B as usize];
        let active = flags & enables & (STATUSC_PF | STATUSC_AF | STATUSC_UF) != 0;
        if active {
            self.cmos[REG_STATUS_C as usize] |= STATUSC_IRQF;
        } else {
            self.cmos[REG_STATUS_C as usize] &= !STATUSC_IRQF;
        }
        if let Some(irq) = self.irq.as_ref() {
            irq.set_level(active);
        }
    }
}

impl IoSnapshot for RtcCmos {
    const DEVICE_ID: [u8; 4] = *b"RTCC";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.put_bytes(0x0001, &self.cmos);
        w.put_u8(0x0002, self.index);
        w.put_bool(0x0003, self.nmi_masked);
        w.put_u64(0x0004, self.cycles_per_second);
        w.put_u64(0x0005, self.second_anchor);
        w.put_u64(0x0006, self.periodic_anchor);
        w.put_bool(0x0007, self.uip);
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID, Self::DEVICE_VERSION)?;
        self.cmos = r.bytes::<CMOS_SIZE>(0x0001)?;
        self.index = r.u8(0x0002)? % CMOS_SIZE as u8;
        self.nmi_masked = r.bool(0x0003)?;
        self.cycles_per_second = r.u64(0x0004)?.max(1);
        self.second_anchor = r.u64(0x0005)?;
        self.periodic_anchor = r.u64(0x0006)?;
        self.uip = r.bool(0x0007)?;
        self.sync_irq();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irq::testing::RecordedIrq;

    const CPS: u64 = 1_000_000;

    fn rtc_at(datetime: RtcDateTime) -> (RtcCmos, CycleClock) {
        let clock = CycleClock::new();
        let rtc = RtcCmos::new(clock.clone(), CPS, datetime);
        (rtc, clock)
    }

    fn read_reg(rtc: &mut RtcCmos, reg: u8) -> u8 {
        rtc.write_port(RTC_INDEX, reg);
        rtc.read_port(RTC_DATA)
    }

    fn write_reg(rtc: &mut RtcCmos, reg: u8, value: u8) {
        rtc.write_port(RTC_INDEX, reg);
        rtc.write_port(RTC_DATA, value);
    }

    #[test]
    fn rtc_byte_roundtrips_under_all_encodings() {
        let (mut rtc, _clock) = rtc_at(RtcDateTime::default());
        for status_b in [0x00, STATUSB_BINARY, STATUSB_HOUR24, STATUSB_BINARY | STATUSB_HOUR24] {
            write_reg(&mut rtc, REG_STATUS_B, status_b | STATUSB_SET);
            for hour in 0..24 {
                rtc.cmos[REG_HOURS as usize] = hour;
                let presented = rtc.get_rtc_byte(REG_HOURS);
                rtc.set_rtc_byte(REG_HOURS, presented);
                assert_eq!(rtc.cmos[REG_HOURS as usize], hour, "status B {status_b:#04x}");
            }
            for second in 0..60 {
                rtc.cmos[REG_SECONDS as usize] = second;
                let presented = rtc.get_rtc_byte(REG_SECONDS);
                rtc.set_rtc_byte(REG_SECONDS, presented);
                assert_eq!(rtc.cmos[REG_SECONDS as usize], second);
            }
        }
    }

    #[test]
    fn noon_and_midnight_present_as_twelve() {
        let (mut rtc, _clock) = rtc_at(RtcDateTime::default());
        write_reg(&mut rtc, REG_STATUS_B, STATUSB_SET); // BCD, 12-hour

        rtc.cmos[REG_HOURS as usize] = 0;
        assert_eq!(rtc.get_rtc_byte(REG_HOURS), 0x12); // 12 AM
        rtc.cmos[REG_HOURS as usize] = 12;
        assert_eq!(rtc.get_rtc_byte(REG_HOURS), 0x92); // 12 PM
        rtc.cmos[REG_HOURS as usize] = 21;
        assert_eq!(rtc.get_rtc_byte(REG_HOURS), 0x89); // 9 PM
    }

    #[test]
    fn seconds_advance_from_cycle_deltas() {
        let start = RtcDateTime {
            hour: 23,
            minute: 59,
            second: 58,
            ..RtcDateTime::default()
        };
        let (mut rtc, clock) = rtc_at(start);

        clock.advance(2 * CPS);
        // Default presentation is BCD.
        assert_eq!(read_reg(&mut rtc, REG_SECONDS), 0x00);
        assert_eq!(read_reg(&mut rtc, REG_HOURS), 0x00);
        assert_eq!(read_reg(&mut rtc, REG_DAY), 0x02);
        assert_eq!(read_reg(&mut rtc, REG_WEEKDAY), 0x04);
    }

    #[test]
    fn month_rollover_honors_leap_years() {
        let start = RtcDateTime {
            year: 1980, // leap year
            month: 2,
            day: 28,
            weekday: 5,
            hour: 23,
            minute: 59,
            second: 59,
            ..RtcDateTime::default()
        };
        let (mut rtc, clock) = rtc_at(start);

        clock.advance(CPS);
        assert_eq!(read_reg(&mut rtc, REG_DAY), 0x29);
        assert_eq!(read_reg(&mut rtc, REG_MONTH), 0x02);

        clock.advance(24 * 3600 * CPS);
        assert_eq!(read_reg(&mut rtc, REG_DAY), 0x01);
        assert_eq!(read_reg(&mut rtc, REG_MONTH), 0x03);
    }

    #[test]
    fn set_bit_suppresses_updates() {
        let (mut rtc, clock) = rtc_at(RtcDateTime::default());
        write_reg(&mut rtc, REG_STATUS_B, STATUSB_SET | STATUSB_HOUR24);
        write_reg(&mut rtc, REG_SECONDS, 0x30);

        clock.advance(10 * CPS);
        assert_eq!(read_reg(&mut rtc, REG_SECONDS), 0x30);

        write_reg(&mut rtc, REG_STATUS_B, STATUSB_HOUR24);
        clock.advance(CPS);
        assert_eq!(read_reg(&mut rtc, REG_SECONDS), 0x31);
    }

    #[test]
    fn alarm_fires_and_status_c_read_acknowledges() {
        let irq = RecordedIrq::new();
        let (mut rtc, clock) = rtc_at(RtcDateTime::default());
        rtc.connect_irq(irq.clone());

        // Alarm at 00:00:02 with enables on; don't-care would also match.
        write_reg(&mut rtc, REG_SECONDS_ALARM, 0x02);
        write_reg(&mut rtc, REG_MINUTES_ALARM, 0xFF);
        write_reg(&mut rtc, REG_HOURS_ALARM, 0xFF);
        write_reg(&mut rtc, REG_STATUS_B, STATUSB_HOUR24 | STATUSB_AIE);

        clock.advance(CPS);
        rtc.update();
        assert!(!irq.level());

        clock.advance(CPS);
        rtc.update();
        assert!(irq.level());

        let status_c = read_reg(&mut rtc, REG_STATUS_C);
        assert_eq!(status_c & (STATUSC_IRQF | STATUSC_AF), STATUSC_IRQF | STATUSC_AF);
        assert!(!irq.level());
        assert_eq!(read_reg(&mut rtc, REG_STATUS_C), 0);
    }

    #[test]
    fn periodic_interrupt_runs_at_1024_hz() {
        let irq = RecordedIrq::new();
        let (mut rtc, clock) = rtc_at(RtcDateTime::default());
        rtc.connect_irq(irq.clone());
        write_reg(&mut rtc, REG_STATUS_B, STATUSB_HOUR24 | STATUSB_PIE);

        let period = CPS / 1024;
        assert_eq!(rtc.cycle_limit(1_000_000), period);

        clock.advance(period - 1);
        rtc.update();
        assert!(!irq.level());
        assert_eq!(rtc.cycle_limit(1_000_000), 1);

        clock.advance(1);
        rtc.update();
        assert!(irq.level());
        let status_c = read_reg(&mut rtc, REG_STATUS_C);
        assert_eq!(status_c & STATUSC_PF, STATUSC_PF);
    }

    #[test]
    fn update_interrupt_gates_through_uie() {
        let irq = RecordedIrq::new();
        let (mut rtc, clock) = rtc_at(RtcDateTime::default());
        rtc.connect_irq(irq.clone());

        clock.advance(CPS);
        rtc.update();
        assert!(!irq.level()); // UF set but UIE clear
        assert_ne!(read_reg(&mut rtc, REG_STATUS_C) & STATUSC_UF, 0);

        write_reg(&mut rtc, REG_STATUS_B, STATUSB_HOUR24 | STATUSB_UIE);
        clock.advance(CPS);
        rtc.update();
        assert!(irq.level());
    }

    #[test]
    fn status_a_read_toggles_update_in_progress() {
        let (mut rtc, _clock) = rtc_at(RtcDateTime::default());
        let first = read_reg(&mut rtc, REG_STATUS_A) & STATUSA_UIP;
        let second = read_reg(&mut rtc, REG_STATUS_A) & STATUSA_UIP;
        assert_ne!(first, second);
    }

    #[test]
    fn config_writes_maintain_the_checksum() {
        let (mut rtc, _clock) = rtc_at(RtcDateTime::default());
        write_reg(&mut rtc, 0x15, 0x80);
        write_reg(&mut rtc, 0x2D, 0x40);

        let sum: u16 = (0x10..=0x2Du8)
            .map(|reg| u16::from(read_reg(&mut rtc, reg)))
            .sum();
        let stored = u16::from_be_bytes([
            read_reg(&mut rtc, CHECKSUM_HI),
            read_reg(&mut rtc, CHECKSUM_LO),
        ]);
        assert_eq!(sum, stored);
    }

    #[test]
    fn out_of_range_index_wraps_safely() {
        let (mut rtc, _clock) = rtc_at(RtcDateTime::default());
        rtc.write_port(RTC_INDEX, 0x7F); // masked into range
        rtc.write_port(RTC_DATA, 0xAA);
        assert!(!rtc.nmi_masked());
        rtc.write_port(RTC_INDEX, 0x80 | REG_DIAGNOSTIC);
        assert!(rtc.nmi_masked());
    }

    #[test]
    fn invalid_datetime_substitutes_a_real_date() {
        assert!(RtcDateTime::host_now().is_valid());

        let bad = RtcDateTime {
            month: 13,
            ..RtcDateTime::default()
        };
        let (rtc, _clock) = rtc_at(bad);
        assert!((1..=12).contains(&rtc.config_byte(REG_MONTH)));
        assert!((1..=31).contains(&rtc.config_byte(REG_DAY)));
    }

    #[test]
    fn snapshot_restores_pending_flags_and_anchors() {
        let irq = RecordedIrq::new();
        let (mut rtc, clock) = rtc_at(RtcDateTime::default());
        write_reg(&mut rtc, REG_STATUS_B, STATUSB_HOUR24 | STATUSB_UIE);
        clock.advance(CPS + CPS / 2);
        rtc.update();

        assert_eq!(rtc.save_state(), rtc.save_state());

        let mut restored = RtcCmos::new(clock.clone(), CPS, RtcDateTime::default());
        restored.connect_irq(irq.clone());
        restored.load_state(&rtc.save_state()).unwrap();
        assert!(irq.level()); // pending update flag re-asserts on restore

        // Half a second of the current second already elapsed.
        clock.advance(CPS / 2);
        restored.update();
        assert_eq!(read_reg(&mut restored, REG_SECONDS), 0x02);
    }
}

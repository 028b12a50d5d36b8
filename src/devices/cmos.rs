//! CMOS RTC (Real Time Clock) device emulation.
//!
//! The CMOS RTC is accessed via I/O ports 0x70 (index) and 0x71 (data).
//! The guest writes a register index to port 0x70, then reads/writes
//! the register value from/to port 0x71.
//!
//! The clock follows host wall-clock time from the moment the device is
//! created. While the VM is paused the clock is frozen, so a guest resumed
//! after a pause (or after migration) does not see time jump forward.
//! Status Register A never reports "update in progress", which keeps the
//! kernel from spinning in its RTC read loop.
//!
//! Reference: <https://wiki.osdev.org/CMOS>

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::trace;
use std::io::{self, Read, Write};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// CMOS I/O port for the index register.
pub const CMOS_PORT_INDEX: u16 = 0x70;

/// CMOS I/O port for the data register.
pub const CMOS_PORT_DATA: u16 = 0x71;

const REG_SECONDS: u8 = 0x00;
const REG_MINUTES: u8 = 0x02;
const REG_HOURS: u8 = 0x04;
const REG_WEEKDAY: u8 = 0x06;
const REG_DAY: u8 = 0x07;
const REG_MONTH: u8 = 0x08;
const REG_YEAR: u8 = 0x09;
const REG_CENTURY: u8 = 0x32;

/// Status Register A - bit 7 is UIP (Update In Progress).
const REG_STATUS_A: u8 = 0x0A;

/// Status Register B - format and interrupt control.
const REG_STATUS_B: u8 = 0x0B;

/// Status Register C - interrupt flags (read clears).
const REG_STATUS_C: u8 = 0x0C;

/// Status Register D - bit 7 indicates valid RAM/time.
const REG_STATUS_D: u8 = 0x0D;

/// Status Register B bits.
const STATUS_B_24H: u8 = 0x02;
const STATUS_B_BINARY: u8 = 0x04;

const CMOS_RAM_SIZE: usize = 128;

/// Broken-down calendar time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DateTime {
    year: i64,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
    /// 1 = Sunday.
    weekday: u8,
}

impl DateTime {
    fn from_unix(secs: i64) -> Self {
        let days = secs.div_euclid(86_400);
        let rem = secs.rem_euclid(86_400);

        // Days to civil date, proleptic Gregorian calendar.
        let z = days + 719_468;
        let era = z.div_euclid(146_097);
        let doe = z.rem_euclid(146_097);
        let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        let day = (doy - (153 * mp + 2) / 5 + 1) as u8;
        let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u8;
        let year = yoe + era * 400 + i64::from(month <= 2);

        Self {
            year,
            month,
            day,
            hour: (rem / 3600) as u8,
            minute: (rem % 3600 / 60) as u8,
            second: (rem % 60) as u8,
            // 1970-01-01 was a Thursday.
            weekday: ((days + 4).rem_euclid(7) + 1) as u8,
        }
    }
}

fn to_bcd(v: u8) -> u8 {
    ((v / 10) << 4) | (v % 10)
}

/// CMOS RTC device.
pub struct Cmos {
    /// Currently selected register index.
    index: u8,
    ram: [u8; CMOS_RAM_SIZE],
    /// Guest time in seconds since the epoch at `anchor`.
    base: i64,
    anchor: Instant,
    /// Guest time while the clock is frozen.
    frozen: Option<i64>,
}

impl Cmos {
    pub const SNAPSHOT_LEN: usize = 1 + CMOS_RAM_SIZE + 8;

    /// Create a new CMOS device running on host time.
    pub fn new() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self::with_time(now)
    }

    fn with_time(secs: i64) -> Self {
        let mut ram = [0u8; CMOS_RAM_SIZE];
        ram[REG_STATUS_B as usize] = STATUS_B_24H;
        Self {
            index: 0,
            ram,
            base: secs,
            anchor: Instant::now(),
            frozen: None,
        }
    }

    fn now(&self) -> i64 {
        self.frozen
            .unwrap_or_else(|| self.base + self.anchor.elapsed().as_secs() as i64)
    }

    /// Stop the clock.
    pub fn freeze(&mut self) {
        if self.frozen.is_none() {
            self.frozen = Some(self.now());
        }
    }

    /// Restart the clock from where it was frozen.
    pub fn thaw(&mut self) {
        if let Some(t) = self.frozen.take() {
            self.base = t;
            self.anchor = Instant::now();
        }
    }

    fn encode(&self, v: u8) -> u8 {
        if self.ram[REG_STATUS_B as usize] & STATUS_B_BINARY != 0 {
            v
        } else {
            to_bcd(v)
        }
    }

    fn encode_hour(&self, hour: u8) -> u8 {
        if self.ram[REG_STATUS_B as usize] & STATUS_B_24H != 0 {
            return self.encode(hour);
        }
        let pm = hour >= 12;
        let h12 = match hour % 12 {
            0 => 12,
            h => h,
        };
        self.encode(h12) | if pm { 0x80 } else { 0 }
    }

    /// Write to CMOS (port 0x70 or 0x71).
    ///
    /// Port 0x70: Sets the register index (lower 7 bits, bit 7 is NMI mask).
    /// Port 0x71: Writes to the selected register.
    pub fn write(&mut self, port: u16, value: u8) {
        match port {
            CMOS_PORT_INDEX => self.index = value & 0x7F,
            CMOS_PORT_DATA => match self.index {
                REG_SECONDS | REG_MINUTES | REG_HOURS | REG_WEEKDAY | REG_DAY | REG_MONTH
                | REG_YEAR | REG_CENTURY => {
                    trace!("cmos: ignoring clock write {:#x}={:#x}", self.index, value)
                }
                REG_STATUS_A | REG_STATUS_C | REG_STATUS_D => {}
                i => self.ram[i as usize] = value,
            },
            _ => {}
        }
    }

    /// Read from CMOS (port 0x71).
    ///
    /// Returns the value of the currently selected register.
    pub fn read(&self, port: u16) -> u8 {
        if port != CMOS_PORT_DATA {
            return 0xFF;
        }

        let t = DateTime::from_unix(self.now());
        match self.index {
            REG_SECONDS => self.encode(t.second),
            REG_MINUTES => self.encode(t.minute),
            REG_HOURS => self.encode_hour(t.hour),
            REG_WEEKDAY => self.encode(t.weekday),
            REG_DAY => self.encode(t.day),
            REG_MONTH => self.encode(t.month),
            REG_YEAR => self.encode(t.year.rem_euclid(100) as u8),
            REG_CENTURY => self.encode(t.year.div_euclid(100) as u8),

            // UIP=0, standard divider and rate
            REG_STATUS_A => 0x26,
            REG_STATUS_C => 0x00,
            // Valid RAM and time
            REG_STATUS_D => 0x80,

            i => self.ram[i as usize],
        }
    }

    pub fn save(&self, w: &mut dyn Write) -> io::Result<()> {
        w.write_u8(self.index)?;
        w.write_all(&self.ram)?;
        w.write_i64::<LittleEndian>(self.now())
    }

    pub fn restore(&mut self, r: &mut dyn Read) -> io::Result<()> {
        self.index = r.read_u8()? & 0x7F;
        r.read_exact(&mut self.ram)?;
        let t = r.read_i64::<LittleEndian>()?;
        if self.frozen.is_some() {
            self.frozen = Some(t);
        } else {
            self.base = t;
            self.anchor = Instant::now();
        }
        Ok(())
    }
}

impl Default for Cmos {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_reg(cmos: &mut Cmos, reg: u8) -> u8 {
        cmos.write(CMOS_PORT_INDEX, reg);
        cmos.read(CMOS_PORT_DATA)
    }

    #[test]
    fn test_date_conversion() {
        // 2024-02-29 13:45:07 UTC, a Thursday.
        let t = DateTime::from_unix(1_709_214_307);
        assert_eq!((t.year, t.month, t.day), (2024, 2, 29));
        assert_eq!((t.hour, t.minute, t.second), (13, 45, 7));
        assert_eq!(t.weekday, 5);
    }

    #[test]
    fn test_bcd_registers() {
        let mut cmos = Cmos::with_time(1_709_214_307);
        cmos.freeze();
        assert_eq!(read_reg(&mut cmos, REG_HOURS), 0x13);
        assert_eq!(read_reg(&mut cmos, REG_MINUTES), 0x45);
        assert_eq!(read_reg(&mut cmos, REG_YEAR), 0x24);
        assert_eq!(read_reg(&mut cmos, REG_CENTURY), 0x20);
        assert_eq!(read_reg(&mut cmos, REG_MONTH), 0x02);
    }

    #[test]
    fn test_binary_and_12h_mode() {
        let mut cmos = Cmos::with_time(1_709_214_307);
        cmos.freeze();
        cmos.write(CMOS_PORT_INDEX, REG_STATUS_B);
        cmos.write(CMOS_PORT_DATA, STATUS_B_BINARY);
        assert_eq!(read_reg(&mut cmos, REG_MINUTES), 45);
        assert_eq!(read_reg(&mut cmos, REG_HOURS), 0x80 | 1);
    }

    #[test]
    fn test_update_not_in_progress() {
        let mut cmos = Cmos::new();
        assert_eq!(read_reg(&mut cmos, REG_STATUS_A) & 0x80, 0);
        assert_eq!(read_reg(&mut cmos, REG_STATUS_D), 0x80);
    }

    #[test]
    fn test_nvram_is_kept() {
        let mut cmos = Cmos::new();
        cmos.write(CMOS_PORT_INDEX, 0x40);
        cmos.write(CMOS_PORT_DATA, 0x5a);
        assert_eq!(read_reg(&mut cmos, 0x40), 0x5a);
    }

    #[test]
    fn test_frozen_clock_does_not_advance() {
        let mut cmos = Cmos::with_time(1000);
        cmos.freeze();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert_eq!(cmos.now(), 1000);
        cmos.thaw();
        assert!(cmos.now() - 1000 <= 1);
    }

    #[test]
    fn test_snapshot_carries_guest_time() {
        let mut cmos = Cmos::with_time(5_000_000);
        cmos.freeze();
        cmos.write(CMOS_PORT_INDEX, 0x41);
        cmos.write(CMOS_PORT_DATA, 0x07);

        let mut buf = Vec::new();
        cmos.save(&mut buf).unwrap();
        assert_eq!(buf.len(), Cmos::SNAPSHOT_LEN);

        let mut other = Cmos::with_time(0);
        other.freeze();
        other.restore(&mut buf.as_slice()).unwrap();
        assert_eq!(other.now(), 5_000_000);
        assert_eq!(read_reg(&mut other, 0x41), 0x07);
    }
}

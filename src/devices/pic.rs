//! Dual 8259 programmable interrupt controller.
//!
//! The primary PIC sits at ports 0x20/0x21 and the secondary at 0xa0/0xa1,
//! cascaded through IRQ 2 of the primary. Only the x86 edge-triggered mode
//! that PC operating systems program is emulated: an asserted IRQ latches a
//! request that stays pending until the CPU acknowledges it.
//!
//! Reference: Intel 8259A datasheet.

use log::{trace, warn};
use std::io::{self, Read, Write};

pub const PIC_PRIMARY_COMMAND: u16 = 0x20;
pub const PIC_PRIMARY_DATA: u16 = 0x21;
pub const PIC_SECONDARY_COMMAND: u16 = 0xa0;
pub const PIC_SECONDARY_DATA: u16 = 0xa1;

/// IRQ on the primary that the secondary is chained to.
const CASCADE_IRQ: u8 = 2;

const IRQ_MASK: u8 = 0b111;
const SPURIOUS_IRQ: u8 = 7;

/// Command port bits.
const ICW1_INIT: u8 = 1 << 4;
const OCW3_SELECT: u8 = 1 << 3;
const ICW4_AEOI: u8 = 1 << 1;

/// OCW2 command field (R, SL, EOI).
const OCW2_EOI: u8 = 1 << 5;
const OCW2_SPECIFIC: u8 = 1 << 6;

/// OCW3 read register command.
const OCW3_RR: u8 = 1 << 1;
const OCW3_RIS: u8 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitStage {
    Uninitialized = 0,
    ExpectingIcw2 = 1,
    ExpectingIcw3 = 2,
    ExpectingIcw4 = 3,
    Initialized = 4,
}

impl InitStage {
    fn from_u8(v: u8) -> io::Result<Self> {
        Ok(match v {
            0 => Self::Uninitialized,
            1 => Self::ExpectingIcw2,
            2 => Self::ExpectingIcw3,
            3 => Self::ExpectingIcw4,
            4 => Self::Initialized,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid PIC init stage {v}"),
                ))
            }
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Chip {
    primary: bool,
    init: InitStage,
    /// ICW4 was requested by ICW1.
    icw4_needed: bool,
    /// Vector base from ICW2; the low three bits are zero.
    vector_base: u8,
    /// Interrupt request register.
    irr: u8,
    /// In-service register.
    isr: u8,
    /// Interrupt mask register (OCW1).
    imr: u8,
    /// Command port reads return ISR instead of IRR.
    read_isr: bool,
    auto_eoi: bool,
}

impl Chip {
    const SNAPSHOT_LEN: usize = 8;

    fn new(primary: bool) -> Self {
        Self {
            primary,
            init: InitStage::Uninitialized,
            icw4_needed: false,
            vector_base: if primary { 0x08 } else { 0x70 },
            irr: 0,
            isr: 0,
            imr: 0,
            read_isr: false,
            auto_eoi: false,
        }
    }

    /// Requests that are unmasked and of higher priority than anything in
    /// service.
    fn ready(&self) -> u8 {
        let highest_isr = self.isr & self.isr.wrapping_neg();
        let higher = highest_isr.wrapping_sub(1);
        self.irr & !self.imr & higher
    }

    fn pending_line(&self) -> Option<u8> {
        match self.ready() {
            0 => None,
            m => Some(m.trailing_zeros() as u8),
        }
    }

    /// Move the highest-priority request into service and return its line.
    fn acknowledge(&mut self) -> Option<u8> {
        let n = self.pending_line()?;
        let bit = 1 << n;
        self.irr &= !bit;
        if !self.auto_eoi {
            self.isr |= bit;
        }
        Some(n)
    }

    fn vector(&self, line: u8) -> u8 {
        self.vector_base | (line & IRQ_MASK)
    }

    fn eoi(&mut self, line: Option<u8>) {
        let bit = match line {
            Some(n) => 1 << n,
            // Non-specific: the highest-priority interrupt in service.
            None => self.isr & self.isr.wrapping_neg(),
        };
        self.isr &= !bit;
    }

    fn read_command(&self) -> u8 {
        if self.read_isr {
            self.isr
        } else {
            self.irr
        }
    }

    fn write_command(&mut self, value: u8) {
        if value & ICW1_INIT != 0 {
            let irr = self.irr;
            *self = Self::new(self.primary);
            self.irr = irr;
            self.icw4_needed = value & 1 != 0;
            self.init = InitStage::ExpectingIcw2;
            return;
        }

        if value & OCW3_SELECT != 0 {
            if value & OCW3_RR != 0 {
                self.read_isr = value & OCW3_RIS != 0;
            }
            return;
        }

        // OCW2
        match (value & OCW2_SPECIFIC != 0, value & OCW2_EOI != 0) {
            (true, true) => self.eoi(Some(value & IRQ_MASK)),
            (false, true) => self.eoi(None),
            _ => trace!("pic: ignoring OCW2 {:#x}", value),
        }
    }

    fn write_data(&mut self, value: u8) {
        match self.init {
            InitStage::Uninitialized | InitStage::Initialized => self.imr = value,
            InitStage::ExpectingIcw2 => {
                self.vector_base = value & !IRQ_MASK;
                self.init = InitStage::ExpectingIcw3;
            }
            InitStage::ExpectingIcw3 => {
                let expected = if self.primary {
                    1 << CASCADE_IRQ
                } else {
                    CASCADE_IRQ
                };
                if value != expected {
                    warn!("pic: unexpected ICW3 {:#x}", value);
                }
                self.init = if self.icw4_needed {
                    InitStage::ExpectingIcw4
                } else {
                    InitStage::Initialized
                };
            }
            InitStage::ExpectingIcw4 => {
                self.auto_eoi = value & ICW4_AEOI != 0;
                self.init = InitStage::Initialized;
            }
        }
    }

    fn save(&self, w: &mut dyn Write) -> io::Result<()> {
        w.write_all(&[
            self.init as u8,
            self.icw4_needed as u8,
            self.vector_base,
            self.irr,
            self.isr,
            self.imr,
            self.read_isr as u8,
            self.auto_eoi as u8,
        ])
    }

    fn restore(&mut self, r: &mut dyn Read) -> io::Result<()> {
        let mut b = [0u8; Self::SNAPSHOT_LEN];
        r.read_exact(&mut b)?;
        self.init = InitStage::from_u8(b[0])?;
        self.icw4_needed = b[1] != 0;
        self.vector_base = b[2] & !IRQ_MASK;
        self.irr = b[3];
        self.isr = b[4];
        self.imr = b[5];
        self.read_isr = b[6] != 0;
        self.auto_eoi = b[7] != 0;
        Ok(())
    }
}

/// Primary and secondary 8259.
#[derive(Debug, Clone)]
pub struct Pic {
    chips: [Chip; 2],
}

impl Pic {
    pub const SNAPSHOT_LEN: usize = 2 * Chip::SNAPSHOT_LEN;

    pub fn new() -> Self {
        Self {
            chips: [Chip::new(true), Chip::new(false)],
        }
    }

    pub fn handles(port: u16) -> bool {
        matches!(
            port,
            PIC_PRIMARY_COMMAND | PIC_PRIMARY_DATA | PIC_SECONDARY_COMMAND | PIC_SECONDARY_DATA
        )
    }

    /// Propagate the secondary's output onto the primary's cascade line.
    fn sync_cascade(&mut self) {
        if self.chips[1].pending_line().is_some() {
            self.chips[0].irr |= 1 << CASCADE_IRQ;
        } else {
            self.chips[0].irr &= !(1 << CASCADE_IRQ);
        }
    }

    /// Latch an edge on `irq` (0-15).
    pub fn assert_irq(&mut self, irq: u8) {
        match irq {
            0..=7 => self.chips[0].irr |= 1 << irq,
            8..=15 => self.chips[1].irr |= 1 << (irq - 8),
            _ => warn!("pic: irq {} out of range", irq),
        }
        self.sync_cascade();
    }

    /// An interrupt is ready to be delivered to the CPU.
    pub fn pending(&self) -> bool {
        self.chips[0].pending_line().is_some()
    }

    /// Vector the next acknowledge would return, without acknowledging.
    pub fn peek_vector(&self) -> Option<u8> {
        let line = self.chips[0].pending_line()?;
        if line == CASCADE_IRQ {
            let n = self.chips[1].pending_line().unwrap_or(SPURIOUS_IRQ);
            Some(self.chips[1].vector(n))
        } else {
            Some(self.chips[0].vector(line))
        }
    }

    /// The CPU's interrupt acknowledge cycle: returns the vector to inject.
    pub fn acknowledge(&mut self) -> Option<u8> {
        let line = self.chips[0].acknowledge()?;
        let vector = if line == CASCADE_IRQ {
            match self.chips[1].acknowledge() {
                Some(n) => self.chips[1].vector(n),
                None => self.chips[1].vector(SPURIOUS_IRQ),
            }
        } else {
            self.chips[0].vector(line)
        };
        self.sync_cascade();
        Some(vector)
    }

    pub fn read(&self, port: u16) -> u8 {
        match port {
            PIC_PRIMARY_COMMAND => self.chips[0].read_command(),
            PIC_PRIMARY_DATA => self.chips[0].imr,
            PIC_SECONDARY_COMMAND => self.chips[1].read_command(),
            PIC_SECONDARY_DATA => self.chips[1].imr,
            _ => 0xff,
        }
    }

    pub fn write(&mut self, port: u16, value: u8) {
        match port {
            PIC_PRIMARY_COMMAND => self.chips[0].write_command(value),
            PIC_PRIMARY_DATA => self.chips[0].write_data(value),
            PIC_SECONDARY_COMMAND => self.chips[1].write_command(value),
            PIC_SECONDARY_DATA => self.chips[1].write_data(value),
            _ => {}
        }
        self.sync_cascade();
    }

    pub fn save(&self, w: &mut dyn Write) -> io::Result<()> {
        self.chips[0].save(w)?;
        self.chips[1].save(w)
    }

    pub fn restore(&mut self, r: &mut dyn Read) -> io::Result<()> {
        self.chips[0].restore(r)?;
        self.chips[1].restore(r)
    }
}

impl Default for Pic {
    fn default() -> Self {
        Self::new()
    }
}

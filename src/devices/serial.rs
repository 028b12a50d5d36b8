//! 8250 UART serial port emulation.
//!
//! Implements the COM1 UART used as the guest console. Output goes to the
//! configured console writer; input is not implemented, so the receive
//! buffer is always empty.
//!
//! Transmission completes instantly, so the only interrupt the UART raises is
//! "transmitter holding register empty", after each transmitted byte or when
//! the guest enables that interrupt.

use log::warn;
use std::io::{self, Read, Write};

/// I/O port range for COM1 serial port.
pub const SERIAL_COM1_BASE: u16 = 0x3f8;
pub const SERIAL_COM1_END: u16 = 0x3ff;

/// IRQ line of COM1.
pub const SERIAL_COM1_IRQ: u8 = 4;

/// 8250 UART register offsets
mod regs {
    /// Transmit Holding Register (write) / Receive Buffer Register (read)
    pub const THR_RBR: u16 = 0;
    /// Interrupt Enable Register
    pub const IER: u16 = 1;
    /// Interrupt Identification Register (read) / FIFO Control Register (write)
    pub const IIR_FCR: u16 = 2;
    pub const LCR: u16 = 3;
    pub const MCR: u16 = 4;
    pub const LSR: u16 = 5;
    pub const MSR: u16 = 6;
    pub const SCR: u16 = 7;
}

/// Line Status Register bits
mod lsr {
    /// Transmitter Holding Register Empty
    pub const THRE: u8 = 0x20;
    /// Transmitter Empty
    pub const TEMT: u8 = 0x40;
}

/// Interrupt Identification Register values
mod iir {
    pub const NO_INT: u8 = 0x01;
    pub const THR_EMPTY: u8 = 0x02;
}

/// Interrupt Enable Register bits
mod ier {
    /// Transmitter holding register empty interrupt
    pub const ETBEI: u8 = 0x02;
}

const LCR_DLAB: u8 = 0x80;
/// Modem control loopback mode.
const MCR_LOOP: u8 = 0x10;

/// 8250 UART serial port.
pub struct Serial {
    out: Box<dyn Write + Send>,
    ier: u8,
    lcr: u8,
    mcr: u8,
    scr: u8,
    fcr: u8,
    dll: u8,
    dlh: u8,
    /// A THR-empty interrupt is waiting to be identified by the guest.
    thre_pending: bool,
}

impl Serial {
    pub const SNAPSHOT_LEN: usize = 8;

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out,
            ier: 0,
            lcr: 0,
            mcr: 0,
            scr: 0,
            fcr: 0,
            dll: 0,
            dlh: 0,
            thre_pending: false,
        }
    }

    pub fn handles(port: u16) -> bool {
        (SERIAL_COM1_BASE..=SERIAL_COM1_END).contains(&port)
    }

    /// Whether the interrupt line should be raised.
    pub fn interrupt(&self) -> bool {
        self.thre_pending && self.ier & ier::ETBEI != 0
    }

    /// Handle a read from the serial port.
    /// `offset` is the register offset from the base port (0-7).
    pub fn read(&mut self, offset: u16) -> u8 {
        let dlab = self.lcr & LCR_DLAB != 0;

        match offset {
            regs::THR_RBR if dlab => self.dll,
            regs::THR_RBR => 0,
            regs::IER if dlab => self.dlh,
            regs::IER => self.ier,
            regs::IIR_FCR => {
                if self.interrupt() {
                    // Identifying the THRE interrupt clears it.
                    self.thre_pending = false;
                    iir::THR_EMPTY
                } else {
                    iir::NO_INT
                }
            }
            regs::LCR => self.lcr,
            regs::MCR => self.mcr,
            // Always ready to transmit, no data to receive
            regs::LSR => lsr::THRE | lsr::TEMT,
            // Carrier Detect, Clear To Send, Data Set Ready
            regs::MSR => 0xb0,
            regs::SCR => self.scr,
            _ => 0,
        }
    }

    /// Handle a write to the serial port.
    /// `offset` is the register offset from the base port (0-7).
    pub fn write(&mut self, offset: u16, value: u8) {
        let dlab = self.lcr & LCR_DLAB != 0;

        match offset {
            regs::THR_RBR if dlab => self.dll = value,
            regs::THR_RBR => {
                if self.mcr & MCR_LOOP == 0 {
                    if let Err(e) = self.out.write_all(&[value]).and_then(|_| self.out.flush()) {
                        warn!("serial: console write failed: {}", e);
                    }
                }
                self.thre_pending = true;
            }
            regs::IER if dlab => self.dlh = value,
            regs::IER => {
                let enabling = value & ier::ETBEI != 0 && self.ier & ier::ETBEI == 0;
                self.ier = value & 0x0f;
                if enabling {
                    self.thre_pending = true;
                }
            }
            regs::IIR_FCR => self.fcr = value,
            regs::LCR => self.lcr = value,
            regs::MCR => self.mcr = value,
            regs::SCR => self.scr = value,
            _ => {}
        }
    }

    pub fn save(&self, w: &mut dyn Write) -> io::Result<()> {
        w.write_all(&[
            self.ier,
            self.lcr,
            self.mcr,
            self.scr,
            self.fcr,
            self.dll,
            self.dlh,
            self.thre_pending as u8,
        ])
    }

    pub fn restore(&mut self, r: &mut dyn Read) -> io::Result<()> {
        let mut b = [0u8; Self::SNAPSHOT_LEN];
        r.read_exact(&mut b)?;
        self.ier = b[0];
        self.lcr = b[1];
        self.mcr = b[2];
        self.scr = b[3];
        self.fcr = b[4];
        self.dll = b[5];
        self.dlh = b[6];
        self.thre_pending = b[7] != 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Console writer that keeps everything written to it.
    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn serial() -> (Serial, Capture) {
        let cap = Capture::default();
        (Serial::new(Box::new(cap.clone())), cap)
    }

    #[test]
    fn test_lsr_always_ready() {
        let (mut serial, _) = serial();
        let lsr = serial.read(regs::LSR);
        assert_eq!(lsr & lsr::THRE, lsr::THRE, "THRE should be set");
        assert_eq!(lsr & lsr::TEMT, lsr::TEMT, "TEMT should be set");
    }

    #[test]
    fn test_output_reaches_console() {
        let (mut serial, cap) = serial();
        for b in b"ok\n" {
            serial.write(regs::THR_RBR, *b);
        }
        assert_eq!(cap.0.lock().unwrap().as_slice(), b"ok\n");
    }

    #[test]
    fn test_loopback_suppresses_output() {
        let (mut serial, cap) = serial();
        serial.write(regs::MCR, MCR_LOOP);
        serial.write(regs::THR_RBR, b'x');
        assert!(cap.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_dlab_mode() {
        let (mut serial, _) = serial();

        serial.write(regs::LCR, LCR_DLAB);
        serial.write(regs::THR_RBR, 0x01); // DLL
        serial.write(regs::IER, 0x00); // DLH
        assert_eq!(serial.read(regs::THR_RBR), 0x01);
        assert_eq!(serial.read(regs::IER), 0x00);

        serial.write(regs::LCR, 0x03);
        serial.write(regs::IER, 0x05);
        assert_eq!(serial.read(regs::IER), 0x05);
        assert_eq!(serial.read(regs::LCR), 0x03);
    }

    #[test]
    fn test_thre_interrupt() {
        let (mut serial, _) = serial();
        assert_eq!(serial.read(regs::IIR_FCR), iir::NO_INT);

        serial.write(regs::IER, ier::ETBEI);
        assert!(serial.interrupt());
        assert_eq!(serial.read(regs::IIR_FCR), iir::THR_EMPTY);
        assert!(!serial.interrupt());

        serial.write(regs::THR_RBR, b'a');
        assert!(serial.interrupt());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let (mut serial, _) = serial();
        serial.write(regs::SCR, 0x42);
        serial.write(regs::IER, ier::ETBEI);

        let mut buf = Vec::new();
        serial.save(&mut buf).unwrap();

        let (mut other, _) = self::serial();
        other.restore(&mut buf.as_slice()).unwrap();
        assert_eq!(other.read(regs::SCR), 0x42);
        assert!(other.interrupt());
    }
}

//! Architectural vCPU state exchanged with the hypervisor.
//!
//! These records are backend-neutral: the KVM backend converts them to and
//! from `kvm_regs`/`kvm_sregs`/MSR lists, and the migration stream writes them
//! as fixed-size little-endian records.

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

bitflags! {
    /// Register groups selected by a read or write.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RegisterMask: u32 {
        /// General purpose registers, RIP and RFLAGS.
        const GPRS = 1 << 0;
        /// Segment registers and descriptor tables.
        const SREGS = 1 << 1;
        /// Control registers.
        const CRS = 1 << 2;
        /// Model-specific registers.
        const MSRS = 1 << 3;
        /// Debug registers.
        const DRS = 1 << 4;
        const ALL = Self::GPRS.bits()
            | Self::SREGS.bits()
            | Self::CRS.bits()
            | Self::MSRS.bits()
            | Self::DRS.bits();
    }
}

bitflags! {
    /// VM-parameter fields selected by a read or write.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmParamMask: u32 {
        /// Guest physical address of the paravirtual system-time page.
        const PVCLOCK_SYSTEM_TIME = 1 << 0;
        /// Guest physical address of the paravirtual wall-clock page.
        const PVCLOCK_WALL_CLOCK = 1 << 1;
        /// Time stamp counter.
        const TSC = 1 << 2;
        const ALL = Self::PVCLOCK_SYSTEM_TIME.bits()
            | Self::PVCLOCK_WALL_CLOCK.bits()
            | Self::TSC.bits();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Gprs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

impl Gprs {
    fn fields(&self) -> [u64; 18] {
        [
            self.rax, self.rbx, self.rcx, self.rdx, self.rsi, self.rdi, self.rsp, self.rbp,
            self.r8, self.r9, self.r10, self.r11, self.r12, self.r13, self.r14, self.r15,
            self.rip, self.rflags,
        ]
    }

    fn from_fields(f: [u64; 18]) -> Self {
        Self {
            rax: f[0],
            rbx: f[1],
            rcx: f[2],
            rdx: f[3],
            rsi: f[4],
            rdi: f[5],
            rsp: f[6],
            rbp: f[7],
            r8: f[8],
            r9: f[9],
            r10: f[10],
            r11: f[11],
            r12: f[12],
            r13: f[13],
            r14: f[14],
            r15: f[15],
            rip: f[16],
            rflags: f[17],
        }
    }
}

/// Segment attribute bits, in the VMX access-rights layout.
pub mod seg_attr {
    pub const TYPE_MASK: u32 = 0xf;
    /// Code or data (as opposed to system) descriptor.
    pub const S: u32 = 1 << 4;
    pub const DPL_SHIFT: u32 = 5;
    pub const DPL_MASK: u32 = 0x3 << DPL_SHIFT;
    pub const P: u32 = 1 << 7;
    pub const AVL: u32 = 1 << 12;
    /// 64-bit code segment.
    pub const L: u32 = 1 << 13;
    pub const DB: u32 = 1 << 14;
    pub const G: u32 = 1 << 15;
    pub const UNUSABLE: u32 = 1 << 16;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    pub selector: u16,
    pub limit: u32,
    /// See [`seg_attr`].
    pub attributes: u32,
    pub base: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentRegisters {
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
    pub ldtr: Segment,
    pub tr: Segment,
}

impl SegmentRegisters {
    fn all(&self) -> [&Segment; 8] {
        [&self.cs, &self.ds, &self.es, &self.fs, &self.gs, &self.ss, &self.ldtr, &self.tr]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlRegisters {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelSpecificRegisters {
    pub efer: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub sfmask: u64,
    pub kernel_gs_base: u64,
    pub misc_enable: u64,
    pub apic_base: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugRegisters {
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,
}

/// Complete register state of one vCPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VcpuRegisterState {
    pub gprs: Gprs,
    pub segments: SegmentRegisters,
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,
    pub crs: ControlRegisters,
    pub msrs: ModelSpecificRegisters,
    pub drs: DebugRegisters,
}

const SEGMENT_LEN: usize = 2 + 4 + 4 + 8;
const TABLE_LEN: usize = 8 + 2;

impl VcpuRegisterState {
    /// Size of one encoded register record.
    pub const ENCODED_LEN: usize =
        18 * 8 + 8 * SEGMENT_LEN + 2 * TABLE_LEN + 5 * 8 + 8 * 8 + 6 * 8;

    /// Copy the groups selected by `mask` from `other`.
    pub fn merge(&mut self, mask: RegisterMask, other: &Self) {
        if mask.contains(RegisterMask::GPRS) {
            self.gprs = other.gprs;
        }
        if mask.contains(RegisterMask::SREGS) {
            self.segments = other.segments;
            self.gdtr = other.gdtr;
            self.idtr = other.idtr;
        }
        if mask.contains(RegisterMask::CRS) {
            self.crs = other.crs;
        }
        if mask.contains(RegisterMask::MSRS) {
            self.msrs = other.msrs;
        }
        if mask.contains(RegisterMask::DRS) {
            self.drs = other.drs;
        }
    }

    /// Write the fixed-size little-endian record.
    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        let mut buf = Vec::with_capacity(Self::ENCODED_LEN);
        for v in self.gprs.fields() {
            buf.write_u64::<LittleEndian>(v)?;
        }
        for s in self.segments.all() {
            buf.write_u16::<LittleEndian>(s.selector)?;
            buf.write_u32::<LittleEndian>(s.limit)?;
            buf.write_u32::<LittleEndian>(s.attributes)?;
            buf.write_u64::<LittleEndian>(s.base)?;
        }
        for t in [&self.gdtr, &self.idtr] {
            buf.write_u64::<LittleEndian>(t.base)?;
            buf.write_u16::<LittleEndian>(t.limit)?;
        }
        let c = &self.crs;
        for v in [c.cr0, c.cr2, c.cr3, c.cr4, c.cr8] {
            buf.write_u64::<LittleEndian>(v)?;
        }
        let m = &self.msrs;
        for v in [
            m.efer,
            m.star,
            m.lstar,
            m.cstar,
            m.sfmask,
            m.kernel_gs_base,
            m.misc_enable,
            m.apic_base,
        ] {
            buf.write_u64::<LittleEndian>(v)?;
        }
        let d = &self.drs;
        for v in [d.dr0, d.dr1, d.dr2, d.dr3, d.dr6, d.dr7] {
            buf.write_u64::<LittleEndian>(v)?;
        }
        debug_assert_eq!(buf.len(), Self::ENCODED_LEN);
        w.write_all(&buf)
    }

    /// Read one fixed-size record. A short read is an error.
    pub fn read_from<R: Read + ?Sized>(r: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; Self::ENCODED_LEN];
        r.read_exact(&mut buf)?;
        let mut r = &buf[..];

        let mut gprs = [0u64; 18];
        for v in gprs.iter_mut() {
            *v = r.read_u64::<LittleEndian>()?;
        }

        let mut segment = || -> io::Result<Segment> {
            Ok(Segment {
                selector: r.read_u16::<LittleEndian>()?,
                limit: r.read_u32::<LittleEndian>()?,
                attributes: r.read_u32::<LittleEndian>()?,
                base: r.read_u64::<LittleEndian>()?,
            })
        };
        let segments = SegmentRegisters {
            cs: segment()?,
            ds: segment()?,
            es: segment()?,
            fs: segment()?,
            gs: segment()?,
            ss: segment()?,
            ldtr: segment()?,
            tr: segment()?,
        };

        let mut table = || -> io::Result<DescriptorTable> {
            Ok(DescriptorTable {
                base: r.read_u64::<LittleEndian>()?,
                limit: r.read_u16::<LittleEndian>()?,
            })
        };
        let gdtr = table()?;
        let idtr = table()?;

        let mut next = || r.read_u64::<LittleEndian>();
        let crs = ControlRegisters {
            cr0: next()?,
            cr2: next()?,
            cr3: next()?,
            cr4: next()?,
            cr8: next()?,
        };
        let msrs = ModelSpecificRegisters {
            efer: next()?,
            star: next()?,
            lstar: next()?,
            cstar: next()?,
            sfmask: next()?,
            kernel_gs_base: next()?,
            misc_enable: next()?,
            apic_base: next()?,
        };
        let drs = DebugRegisters {
            dr0: next()?,
            dr1: next()?,
            dr2: next()?,
            dr3: next()?,
            dr6: next()?,
            dr7: next()?,
        };

        Ok(Self {
            gprs: Gprs::from_fields(gprs),
            segments,
            gdtr,
            idtr,
            crs,
            msrs,
            drs,
        })
    }
}

/// Per-vCPU VM parameters (paravirtual clock and TSC).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmParamState {
    pub pvclock_system_gpa: u64,
    pub pvclock_wall_clock_gpa: u64,
    pub tsc: u64,
}

impl VmParamState {
    pub const ENCODED_LEN: usize = 3 * 8;

    pub fn merge(&mut self, mask: VmParamMask, other: &Self) {
        if mask.contains(VmParamMask::PVCLOCK_SYSTEM_TIME) {
            self.pvclock_system_gpa = other.pvclock_system_gpa;
        }
        if mask.contains(VmParamMask::PVCLOCK_WALL_CLOCK) {
            self.pvclock_wall_clock_gpa = other.pvclock_wall_clock_gpa;
        }
        if mask.contains(VmParamMask::TSC) {
            self.tsc = other.tsc;
        }
    }

    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        let mut buf = [0u8; Self::ENCODED_LEN];
        let mut cursor = &mut buf[..];
        cursor.write_u64::<LittleEndian>(self.pvclock_system_gpa)?;
        cursor.write_u64::<LittleEndian>(self.pvclock_wall_clock_gpa)?;
        cursor.write_u64::<LittleEndian>(self.tsc)?;
        w.write_all(&buf)
    }

    pub fn read_from<R: Read + ?Sized>(r: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; Self::ENCODED_LEN];
        r.read_exact(&mut buf)?;
        let mut r = &buf[..];
        Ok(Self {
            pvclock_system_gpa: r.read_u64::<LittleEndian>()?,
            pvclock_wall_clock_gpa: r.read_u64::<LittleEndian>()?,
            tsc: r.read_u64::<LittleEndian>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VcpuRegisterState {
        let mut s = VcpuRegisterState::default();
        s.gprs.rax = 0x1111;
        s.gprs.rip = 0x10_0200;
        s.gprs.rflags = 0x2;
        s.segments.cs = Segment {
            selector: 0x10,
            limit: 0xfffff,
            attributes: 0xb | seg_attr::S | seg_attr::P | seg_attr::L | seg_attr::G,
            base: 0,
        };
        s.segments.tr.selector = 0x20;
        s.gdtr = DescriptorTable { base: 0x500, limit: 0x27 };
        s.crs.cr3 = 0x9000;
        s.msrs.efer = 0x500;
        s.drs.dr7 = 0x400;
        s
    }

    #[test]
    fn test_register_record_is_fixed_size() {
        let mut buf = Vec::new();
        sample().write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), VcpuRegisterState::ENCODED_LEN);

        let decoded = VcpuRegisterState::read_from(&mut &buf[..]).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_register_record_short_read() {
        let mut buf = Vec::new();
        sample().write_to(&mut buf).unwrap();
        buf.truncate(VcpuRegisterState::ENCODED_LEN - 1);
        let err = VcpuRegisterState::read_from(&mut &buf[..]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_merge_only_copies_masked_groups() {
        let mut base = VcpuRegisterState::default();
        base.merge(RegisterMask::GPRS | RegisterMask::CRS, &sample());
        assert_eq!(base.gprs.rip, 0x10_0200);
        assert_eq!(base.crs.cr3, 0x9000);
        assert_eq!(base.segments.cs, Segment::default());
        assert_eq!(base.msrs.efer, 0);
    }

    #[test]
    fn test_vm_params_merge() {
        let mut p = VmParamState::default();
        let other = VmParamState {
            pvclock_system_gpa: 0x1000,
            pvclock_wall_clock_gpa: 0x2000,
            tsc: 99,
        };
        p.merge(VmParamMask::TSC, &other);
        assert_eq!(p, VmParamState { tsc: 99, ..Default::default() });
    }
}

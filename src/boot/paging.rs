//! Long-mode CPU state for the boot vCPU.
//!
//! The 64-bit Linux entry point expects paging on, PAE on and EFER.LME/LMA
//! set, with `__BOOT_CS` (0x10) and `__BOOT_DS` (0x18) loaded. The tables
//! written here identity-map the low 1GB with 2MB pages:
//!
//! ```text
//! CR3 = 0x9000  PML4[0]  -> 0xa000
//!               PDPT[0]  -> 0xb000
//!               PD[0..512] = n * 2MB | P | RW | PS
//! ```
//!
//! The GDT holds null, an unused slot, code, data and a TSS descriptor
//! whose base is 0; TR only needs a loadable selector. The IDT is empty.

use super::layout;
use super::BootError;
use crate::hypervisor::{
    ControlRegisters, DescriptorTable, Gprs, ModelSpecificRegisters, Segment, SegmentRegisters,
    VcpuRegisterState,
};
use crate::memory::GuestMemory;

const PML4_START: u64 = 0x9000;
const PDPTE_START: u64 = 0xa000;
const PDE_START: u64 = 0xb000;

/// Present and writable.
const PTE_PRESENT_RW: u64 = 0x03;
/// Present, writable, 2MB page.
const PDE_HUGE: u64 = 0x83;

const X86_CR0_PE: u64 = 0x1;
const X86_CR0_PG: u64 = 0x8000_0000;
/// CR0 after reset: ET, CD and NW.
const X86_CR0_RESET: u64 = 0x6000_0010;
const X86_CR4_PAE: u64 = 0x20;
const EFER_LME: u64 = 0x100;
const EFER_LMA: u64 = 0x400;

const GDT_CODE: u16 = 2;
const GDT_DATA: u16 = 3;
const GDT_TSS: u16 = 4;

const GDT_TABLE: [u64; 5] = [
    gdt_entry(0, 0, 0),
    gdt_entry(0, 0, 0),
    gdt_entry(0xa09b, 0, 0xfffff), // __BOOT_CS: 64-bit execute/read
    gdt_entry(0xc093, 0, 0xfffff), // __BOOT_DS: read/write
    gdt_entry(0x808b, 0, 0xfffff), // busy TSS
];

const PDE_ENTRIES: [u64; 512] = {
    let mut entries = [0u64; 512];
    let mut i = 0;
    while i < 512 {
        entries[i] = ((i as u64) << 21) | PDE_HUGE;
        i += 1;
    }
    entries
};

/// Write the identity map of the low 1GB.
pub fn setup_page_tables(memory: &GuestMemory) -> Result<(), BootError> {
    memory.write_u64(PML4_START, PDPTE_START | PTE_PRESENT_RW)?;
    memory.write_u64(PDPTE_START, PDE_START | PTE_PRESENT_RW)?;
    let table: Vec<u8> = PDE_ENTRIES.iter().flat_map(|e| e.to_le_bytes()).collect();
    memory.write(PDE_START, &table)?;
    Ok(())
}

const fn gdt_entry(flags: u16, base: u32, limit: u32) -> u64 {
    ((base as u64 & 0xff00_0000) << 32)
        | ((base as u64 & 0x00ff_ffff) << 16)
        | (limit as u64 & 0x0000_ffff)
        | (((limit as u64 & 0x000f_0000) >> 16) << 48)
        | ((flags as u64) << 40)
}

/// Build a segment register from a GDT entry.
///
/// The access byte and flags nibble of the descriptor line up with the
/// VMX access-rights layout once shifted down by 40 bits.
fn segment_from_gdt(entry: u64, table_index: u16) -> Segment {
    Segment {
        base: ((entry >> 16) & 0xff_ffff) | (((entry >> 56) & 0xff) << 24),
        limit: ((entry & 0xffff) | (((entry >> 48) & 0xf) << 16)) as u32,
        selector: table_index * 8,
        attributes: ((entry >> 40) & 0xf0ff) as u32,
    }
}

pub fn setup_gdt_idt(memory: &GuestMemory) -> Result<(), BootError> {
    let gdt: Vec<u8> = GDT_TABLE.iter().flat_map(|e| e.to_le_bytes()).collect();
    memory.write(layout::GDT_START, &gdt)?;
    memory.write_u64(layout::IDT_START, 0)?;
    Ok(())
}

/// Registers at the 64-bit entry point: RIP at `startup_64`, RSI at the
/// zero page, interrupts off.
pub fn boot_registers() -> VcpuRegisterState {
    let code = segment_from_gdt(GDT_TABLE[GDT_CODE as usize], GDT_CODE);
    let data = segment_from_gdt(GDT_TABLE[GDT_DATA as usize], GDT_DATA);
    let tss = segment_from_gdt(GDT_TABLE[GDT_TSS as usize], GDT_TSS);

    VcpuRegisterState {
        gprs: Gprs {
            rflags: 0x2,
            rip: layout::HIMEM_START + 0x200,
            rsp: layout::BOOT_STACK_POINTER,
            rbp: layout::BOOT_STACK_POINTER,
            rsi: layout::BOOT_PARAMS_START,
            ..Default::default()
        },
        segments: SegmentRegisters {
            cs: code,
            ds: data,
            es: data,
            fs: data,
            gs: data,
            ss: data,
            tr: tss,
            ..Default::default()
        },
        gdtr: DescriptorTable {
            base: layout::GDT_START,
            limit: (std::mem::size_of_val(&GDT_TABLE) - 1) as u16,
        },
        idtr: DescriptorTable {
            base: layout::IDT_START,
            limit: 0,
        },
        crs: ControlRegisters {
            cr0: X86_CR0_RESET | X86_CR0_PE | X86_CR0_PG,
            cr3: PML4_START,
            cr4: X86_CR4_PAE,
            ..Default::default()
        },
        msrs: ModelSpecificRegisters {
            efer: EFER_LME | EFER_LMA,
            ..Default::default()
        },
        ..Default::default()
    }
}

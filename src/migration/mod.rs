//! VM state dump and restore.
//!
//! A dump is a single stream:
//!
//! ```text
//! ┌──────────────┐
//! │ header       │  magic, version, ncpus, memory range table
//! ├──────────────┤
//! │ registers    │  one record per vCPU, in vCPU index order
//! ├──────────────┤
//! │ memory       │  every RAM range in table order, 4 KiB chunks
//! ├──────────────┤
//! │ device state │  port-I/O devices (fixed size)
//! ├──────────────┤
//! │ bus state    │  MMIO bus devices in registration order
//! ├──────────────┤
//! │ vm params    │  one record per vCPU, in vCPU index order
//! └──────────────┘
//! ```
//!
//! The sender pauses the VM before reading any guest state and terminates it
//! once the dump is complete. A receiving process reads the header first to
//! rebuild the memory layout, then restores each section in stream order.

use crate::config::{MAX_MEM_RANGES, MAX_VCPUS};
use crate::hypervisor::{
    Hypervisor, HypervisorError, RegisterMask, VcpuRegisterState, VmId, VmParamMask,
    VmParamState,
};
use crate::memory::{GuestMemory, MemoryError, MemoryRange, MemoryType, PAGE_SIZE};
use crate::sync::SyncError;
use crate::vm::runtime::VmRuntime;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info, warn};
use std::io::{self, Read, Write};
use thiserror::Error;

const DUMP_MAGIC: &[u8; 8] = b"CARBONVM";
const DUMP_VERSION: u32 = 1;

const KIND_RAM: u32 = 0;
const KIND_MMIO: u32 = 1;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Migration stream I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("Not a VM dump")]
    BadMagic,

    #[error("Unsupported dump version {0}")]
    Version(u32),

    #[error("Invalid dump header: {0}")]
    Header(String),

    #[error("Failed to access vCPU {vcpu} state: {source}")]
    Vcpu {
        vcpu: u32,
        #[source]
        source: HypervisorError,
    },

    #[error("Failed to access guest memory: {0}")]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Device emulation state carried in a dump.
pub trait DeviceState {
    fn save_devices(&self, w: &mut dyn Write) -> io::Result<()>;
    fn restore_devices(&self, r: &mut dyn Read) -> io::Result<()>;
    fn save_bus(&self, w: &mut dyn Write) -> io::Result<()>;
    fn restore_bus(&self, r: &mut dyn Read) -> io::Result<()>;
}

/// First section of every dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpHeader {
    pub ncpus: u32,
    /// Memory layout; host addresses are not carried.
    pub ranges: Vec<MemoryRange>,
}

impl DumpHeader {
    pub fn new(ncpus: u32, ranges: &[MemoryRange]) -> Self {
        Self {
            ncpus,
            ranges: ranges
                .iter()
                .map(|r| MemoryRange { host_addr: 0, ..*r })
                .collect(),
        }
    }

    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(DUMP_MAGIC)?;
        w.write_u32::<LittleEndian>(DUMP_VERSION)?;
        w.write_u32::<LittleEndian>(self.ncpus)?;
        w.write_u32::<LittleEndian>(self.ranges.len() as u32)?;
        for r in &self.ranges {
            w.write_u64::<LittleEndian>(r.gpa)?;
            w.write_u64::<LittleEndian>(r.size)?;
            w.write_u32::<LittleEndian>(match r.kind {
                MemoryType::Ram => KIND_RAM,
                MemoryType::Mmio => KIND_MMIO,
            })?;
        }
        Ok(())
    }

    /// Read and validate a header. Nothing is applied until the whole header
    /// has been accepted.
    pub fn read_from<R: Read + ?Sized>(r: &mut R) -> Result<Self, MigrationError> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != DUMP_MAGIC {
            return Err(MigrationError::BadMagic);
        }
        let version = r.read_u32::<LittleEndian>()?;
        if version != DUMP_VERSION {
            return Err(MigrationError::Version(version));
        }

        let ncpus = r.read_u32::<LittleEndian>()?;
        if ncpus == 0 || ncpus as usize > MAX_VCPUS {
            return Err(MigrationError::Header(format!("{} vcpus", ncpus)));
        }
        let nranges = r.read_u32::<LittleEndian>()?;
        if nranges == 0 || nranges as usize > MAX_MEM_RANGES {
            return Err(MigrationError::Header(format!("{} memory ranges", nranges)));
        }

        let mut ranges = Vec::with_capacity(nranges as usize);
        for _ in 0..nranges {
            let gpa = r.read_u64::<LittleEndian>()?;
            let size = r.read_u64::<LittleEndian>()?;
            let range = match r.read_u32::<LittleEndian>()? {
                KIND_RAM => MemoryRange::ram(gpa, size),
                KIND_MMIO => MemoryRange::mmio(gpa, size),
                kind => {
                    return Err(MigrationError::Header(format!(
                        "memory range kind {}",
                        kind
                    )))
                }
            };
            if size == 0 || size % PAGE_SIZE != 0 {
                return Err(MigrationError::Header(format!(
                    "memory range {:#x} size {:#x}",
                    gpa, size
                )));
            }
            ranges.push(range);
        }
        Ok(Self { ncpus, ranges })
    }
}

/// Dump the running VM to `w`.
///
/// The VM is paused first. If the dump fails the VM is unpaused and keeps
/// running; once the dump is complete the VM is terminated.
pub fn send<W: Write>(
    w: &mut W,
    runtime: &VmRuntime,
    memory: &GuestMemory,
    devices: &dyn DeviceState,
) -> Result<(), MigrationError> {
    let header = DumpHeader::new(runtime.ncpus(), memory.ranges());
    header.write_to(w)?;

    runtime.pause()?;
    if let Err(e) = dump_state(w, runtime, memory, devices) {
        warn!("vm {}: dump failed, resuming: {}", runtime.vm_id(), e);
        runtime.unpause()?;
        return Err(e);
    }

    info!("vm {}: dump complete", runtime.vm_id());
    if let Err(e) = runtime.terminate() {
        warn!("vm {}: failed to terminate after dump: {}", runtime.vm_id(), e);
    }
    Ok(())
}

fn dump_state<W: Write>(
    w: &mut W,
    runtime: &VmRuntime,
    memory: &GuestMemory,
    devices: &dyn DeviceState,
) -> Result<(), MigrationError> {
    let hv = runtime.hypervisor();
    let vm = runtime.vm_id();

    for vcpu in 0..runtime.ncpus() {
        let regs = hv
            .read_registers(vm, vcpu, RegisterMask::ALL)
            .map_err(|source| MigrationError::Vcpu { vcpu, source })?;
        regs.write_to(w)?;
    }
    debug!("vm {}: wrote {} register record(s)", vm, runtime.ncpus());

    dump_memory(w, memory)?;

    devices.save_devices(w)?;
    devices.save_bus(w)?;

    for vcpu in 0..runtime.ncpus() {
        let params = hv
            .read_vm_params(vm, vcpu, VmParamMask::ALL)
            .map_err(|source| MigrationError::Vcpu { vcpu, source })?;
        params.write_to(w)?;
    }

    w.flush()?;
    Ok(())
}

fn dump_memory<W: Write>(w: &mut W, memory: &GuestMemory) -> Result<(), MigrationError> {
    let mut page = [0u8; PAGE_SIZE as usize];
    for range in memory.ranges().iter().filter(|r| r.is_ram()) {
        let mut offset = 0;
        while offset < range.size {
            memory.read(range.gpa + offset, &mut page)?;
            w.write_all(&page)?;
            offset += PAGE_SIZE;
        }
        debug!("dumped {:#x}-{:#x}", range.gpa, range.end());
    }
    Ok(())
}

/// Read the register records of a dump, in vCPU index order.
pub fn read_registers<R: Read>(
    r: &mut R,
    ncpus: u32,
) -> Result<Vec<VcpuRegisterState>, MigrationError> {
    (0..ncpus)
        .map(|_| VcpuRegisterState::read_from(r).map_err(MigrationError::from))
        .collect()
}

/// Fill guest RAM from the memory section of a dump.
pub fn restore_memory<R: Read>(r: &mut R, memory: &GuestMemory) -> Result<(), MigrationError> {
    let mut page = [0u8; PAGE_SIZE as usize];
    for range in memory.ranges().iter().filter(|r| r.is_ram()) {
        let mut offset = 0;
        while offset < range.size {
            r.read_exact(&mut page)?;
            memory.write(range.gpa + offset, &page)?;
            offset += PAGE_SIZE;
        }
    }
    Ok(())
}

/// Restore the device and bus sections of a dump.
pub fn restore_devices<R: Read>(r: &mut R, devices: &dyn DeviceState) -> Result<(), MigrationError> {
    devices.restore_devices(r)?;
    devices.restore_bus(r)?;
    Ok(())
}

/// Read the VM-parameter records of a dump, in vCPU index order.
///
/// They are applied once the vCPUs have been reset, since a reset clears
/// the TSC.
pub fn read_vm_params<R: Read>(r: &mut R, ncpus: u32) -> Result<Vec<VmParamState>, MigrationError> {
    (0..ncpus)
        .map(|_| VmParamState::read_from(r).map_err(MigrationError::from))
        .collect()
}

/// Load restored VM parameters into the hypervisor.
pub fn apply_vm_params(
    hv: &dyn Hypervisor,
    vm: VmId,
    params: &[VmParamState],
) -> Result<(), MigrationError> {
    for (vcpu, p) in (0u32..).zip(params) {
        hv.write_vm_params(vm, vcpu, VmParamMask::ALL, p)
            .map_err(|source| MigrationError::Vcpu { vcpu, source })?;
    }
    Ok(())
}

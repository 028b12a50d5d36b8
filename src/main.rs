//! carbon-vm - the per-guest VM process.
//!
//! One process runs exactly one VM: it creates the guest in KVM, runs one
//! thread per vCPU plus an event thread serving the parent's control socket,
//! and exits with an errno-style status once the guest is gone.
//!
//! This VMM requires Linux with KVM support. It will not run on other platforms.

#[cfg(target_os = "linux")]
mod boot;
#[cfg(target_os = "linux")]
mod config;
#[cfg(target_os = "linux")]
mod control;
#[cfg(target_os = "linux")]
mod devices;
#[cfg(target_os = "linux")]
mod hypervisor;
#[cfg(target_os = "linux")]
mod memory;
#[cfg(target_os = "linux")]
mod migration;
#[cfg(target_os = "linux")]
mod sev;
#[cfg(target_os = "linux")]
mod sync;
#[cfg(target_os = "linux")]
mod vcpu;
#[cfg(target_os = "linux")]
mod vm;

use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "carbon-vm")]
#[command(about = "Run one virtual machine under KVM")]
struct Args {
    /// VM name
    #[arg(short, long, default_value = "vm")]
    name: String,

    /// Number of vCPUs
    #[arg(long, default_value = "1")]
    cpus: u32,

    /// Memory size in megabytes
    #[arg(short, long, default_value = "512")]
    memory: u64,

    /// Path to the Linux kernel bzImage
    #[arg(short, long, required_unless_present = "receive")]
    kernel: Option<PathBuf>,

    /// Kernel command line
    #[arg(short, long, default_value = "console=ttyS0")]
    cmdline: String,

    /// Disk image (repeat for more disks)
    #[arg(short, long)]
    disk: Vec<PathBuf>,

    /// Add a network interface (repeat for more)
    #[arg(long, action = ArgAction::Count)]
    nic: u8,

    /// Console device or file (stdout if unset)
    #[arg(long)]
    console: Option<PathBuf>,

    /// Inherited descriptor of the control socket to the parent
    #[arg(long)]
    control_fd: Option<i32>,

    /// Restore the VM from a migration stream instead of booting a kernel
    #[arg(long, conflicts_with = "kernel")]
    receive: Option<PathBuf>,

    /// Run the guest with SEV encrypted memory
    #[arg(long)]
    sev: bool,

    /// PSP device used for SEV
    #[arg(long, default_value = "/dev/sev")]
    psp: PathBuf,

    /// More logging (-v info, -vv debug, -vvv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();
    run(args)
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> ExitCode {
    env_logger::Builder::new()
        .filter_level(control::verbosity_level(i32::from(args.verbose)))
        .parse_default_env()
        .init();

    match start(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}

#[cfg(target_os = "linux")]
fn start(args: Args) -> Result<(), vm::VmError> {
    use boot::LinuxLoader;
    use config::{ConfigError, VmConfig};
    use control::ControlChannel;
    use hypervisor::kvm::KvmHypervisor;
    use sev::{ConfidentialCompute, PspDevice, SevError};
    use std::fs::{File, OpenOptions};
    use std::io::{self, BufReader, Write};
    use std::os::fd::FromRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use vm::{Boot, Vm, VmError};

    let open = |what| move |source| VmError::Open { what, source };

    let config = VmConfig {
        name: args.name,
        ncpus: args.cpus,
        memory: config::memory_map_mib(args.memory)?,
        kernel: args.kernel,
        cmdline: args.cmdline,
        disks: args.disk,
        nics: usize::from(args.nic),
        sev: args.sev,
    };

    let hypervisor = Arc::new(KvmHypervisor::new().map_err(VmError::KernelDenied)?);

    let cc = if config.sev {
        let psp = PspDevice::open(&args.psp).map_err(SevError::from)?;
        ConfidentialCompute::new(Box::new(psp))
    } else {
        ConfidentialCompute::disabled()
    };

    let console: Box<dyn Write + Send> = match &args.console {
        Some(path) => Box::new(
            OpenOptions::new()
                .write(true)
                .create(true)
                .append(true)
                .open(path)
                .map_err(open("console"))?,
        ),
        None => Box::new(io::stdout()),
    };

    // Without a parent the other end of the socket is held here, so the VM
    // runs until the guest stops it.
    let mut _standalone = None;
    let control = match args.control_fd {
        // SAFETY: the parent handed this descriptor to us and nothing else in
        // this process uses it.
        Some(fd) => ControlChannel::new(unsafe { UnixStream::from_raw_fd(fd) }),
        None => {
            let (ours, theirs) = UnixStream::pair().map_err(open("control socket"))?;
            _standalone = Some(theirs);
            ControlChannel::new(ours)
        }
    };

    let vm = Vm::new(config.clone(), hypervisor, control, console, cc);
    match (&args.receive, &config.kernel) {
        (Some(path), _) => {
            let mut stream = BufReader::new(File::open(path).map_err(open("migration stream"))?);
            vm.start(Boot::Received(&mut stream))
        }
        (None, Some(kernel)) => {
            let loader = LinuxLoader::new(kernel, config.cmdline.as_str());
            vm.start(Boot::Image(&loader))
        }
        (None, None) => Err(ConfigError::NoKernel.into()),
    }
}

#[cfg(not(target_os = "linux"))]
fn run(_args: Args) -> ExitCode {
    eprintln!("carbon-vm requires Linux with KVM support. This platform is not supported.");
    ExitCode::FAILURE
}

//! virtiod: user-space virtio-mmio device daemon for a partitioning
//! hypervisor.
//!
//! The hypervisor kernel module traps guest MMIO accesses to virtio device
//! regions and forwards them through a shared-memory mailbox; this daemon
//! emulates the devices (block, network, console) for non-root zones and
//! injects their interrupts back through the kernel. See the `bridge` module
//! for the kernel interface and `dispatch` for the main loop.
//!
//! This daemon requires Linux: the kernel module's character device is its
//! whole world.

#[cfg(target_os = "linux")]
mod bridge;
#[cfg(target_os = "linux")]
mod devices;
#[cfg(target_os = "linux")]
mod dispatch;
#[cfg(target_os = "linux")]
mod event;
#[cfg(target_os = "linux")]
mod memory;

use clap::Parser;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "virtiod")]
#[command(about = "User-space virtio-mmio device daemon for a partitioning hypervisor")]
struct Args {
    /// Device declaration, repeatable: TYPE,key=value,...
    ///
    /// TYPE is one of blk|net|console. Keys: addr/len (hex, mandatory),
    /// irq/zone_id (decimal, mandatory), img (blk only), tap (net only).
    #[arg(short = 'd', long = "device", value_name = "SPEC")]
    device: Vec<String>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    if let Err(err) = run(args) {
        log::error!("{err}");
        let mut source = err.source();
        while let Some(cause) = source {
            log::error!("  caused by: {cause}");
            source = cause.source();
        }
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    use std::sync::Arc;

    use bridge::Bridge;
    use devices::{DeviceSpec, DeviceTable, VirtioDevice};
    use dispatch::Dispatcher;
    use event::EventMonitor;
    use memory::GuestMemory;
    use nix::sys::signal::SigSet;

    // Block every signal before any thread exists; the dispatcher takes the
    // wakeup and termination signals off a sigwait set instead.
    SigSet::all().thread_set_mask()?;

    let bridge = Bridge::open()?;
    let mem = GuestMemory::map(bridge.window_file()?)?;

    let mut table = DeviceTable::new();
    for decl in &args.device {
        let spec: DeviceSpec = decl.parse()?;
        table.add(VirtioDevice::from_spec(&spec)?)?;
    }
    if table.is_empty() {
        log::warn!("no devices declared, serving probe reads only");
    }

    // Tell the kernel which guest-physical regions to trap.
    bridge.publish_mmio_addrs(&table.mmio_bases());

    let bridge = Arc::new(bridge);
    let mem = Arc::new(mem);
    let devices = Arc::new(table);

    let monitor = EventMonitor::spawn(
        devices.iter().cloned().collect(),
        Arc::clone(&mem),
        Arc::clone(&bridge),
    )?;

    let dispatcher = Dispatcher::new(Arc::clone(&bridge), Arc::clone(&mem), Arc::clone(&devices));
    let result = dispatcher.run();

    // Stop the monitor before back-ends close the fds it watches.
    monitor.shutdown();
    for dev in devices.iter() {
        dev.teardown();
    }
    log::info!("virtiod exiting");
    result.map_err(Into::into)
}

#[cfg(not(target_os = "linux"))]
fn run(_args: Args) -> Result<(), Box<dyn std::error::Error>> {
    Err("virtiod requires Linux; the hypervisor kernel interface is not available on this platform."
        .into())
}

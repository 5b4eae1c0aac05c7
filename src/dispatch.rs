//! Request dispatcher: the daemon's single-threaded main loop.
//!
//! The kernel raises `SIGHVI` when it appends a trapped MMIO access to the
//! request ring. The dispatcher drains the ring inline (register access and
//! queue handlers run on this thread) and parks in `sigwait` when idle.
//!
//! Going idle is a two-phase hand-off to avoid the lost-wakeup race: spin for
//! a while rechecking the ring, publish `need_wakeup = 1`, nap briefly, then
//! recheck once more. If the kernel enqueued between the last spin check and
//! the wakeup publication, the final recheck catches it; otherwise the kernel
//! sees `need_wakeup` and signals us out of `sigwait`.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, trace, warn};
use nix::sys::signal::{SigSet, Signal};

use crate::bridge::shmem::DeviceReq;
use crate::bridge::Bridge;
use crate::devices::{mmio, DeviceTable};
use crate::memory::GuestMemory;

/// Wakeup signal raised by the kernel module.
pub const SIGHVI: Signal = Signal::SIGUSR1;

/// Empty-ring spins before publishing `need_wakeup` and napping.
const SPIN_LIMIT: u64 = 10_000_000;

/// Nap length of the idle hand-off.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Device MMIO regions are carved out of 4 KiB pages; a request that matches
/// no device is probed with its page offset.
const PROBE_OFFSET_MASK: u64 = 0xfff;

pub struct Dispatcher {
    bridge: Arc<Bridge>,
    mem: Arc<GuestMemory>,
    devices: Arc<DeviceTable>,
}

impl Dispatcher {
    pub fn new(bridge: Arc<Bridge>, mem: Arc<GuestMemory>, devices: Arc<DeviceTable>) -> Self {
        Self {
            bridge,
            mem,
            devices,
        }
    }

    /// Serve requests until `SIGTERM`. The caller must have blocked all
    /// signals process-wide before any thread was spawned.
    pub fn run(&self) -> Result<(), nix::Error> {
        let mut wait_set = SigSet::empty();
        wait_set.add(SIGHVI);
        wait_set.add(Signal::SIGTERM);

        self.bridge.set_need_wakeup(true);
        info!("dispatcher ready ({} devices)", self.devices.len());
        loop {
            let sig = wait_set.wait()?;
            match sig {
                Signal::SIGTERM => {
                    info!("SIGTERM received, shutting down");
                    return Ok(());
                }
                s if s == SIGHVI => self.drain(),
                other => warn!("unexpected signal {other}"),
            }
        }
    }

    /// Drain the request ring, then run the spin / publish-wakeup / nap idle
    /// hand-off before going back to `sigwait`.
    fn drain(&self) {
        let mut spins: u64 = 0;
        loop {
            if !self.bridge.req_is_empty() {
                spins = 0;
                self.bridge.set_need_wakeup(false);
                let req = self.bridge.req_head();
                self.handle(&req);
                self.bridge.advance_req_front();
            } else {
                spins += 1;
                if spins < SPIN_LIMIT {
                    std::hint::spin_loop();
                    continue;
                }
                spins = 0;
                self.bridge.set_need_wakeup(true);
                std::thread::sleep(IDLE_SLEEP);
                fence(Ordering::Acquire);
                if self.bridge.req_is_empty() {
                    return;
                }
            }
        }
    }

    /// Route one trapped access to its device and, for control-path
    /// requests, publish the completion for the trapping vCPU.
    pub fn handle(&self, req: &DeviceReq) {
        let mut value = 0u64;
        match self.devices.find(req.src_zone, req.address) {
            Some(dev) => {
                let offset = req.address - dev.base_addr;
                if req.is_write != 0 {
                    dev.mmio_write(offset, req.size, req.value, &self.mem, &self.bridge);
                } else {
                    value = dev.mmio_read(offset, req.size);
                    trace!(
                        "zone {} read {:#x}+{:#x} -> {value:#x}",
                        req.src_zone,
                        dev.base_addr,
                        offset
                    );
                }
            }
            None => {
                warn!(
                    "no device for zone {} address {:#x}",
                    req.src_zone, req.address
                );
                if req.is_write == 0 {
                    value = mmio::probe_read(req.address & PROBE_OFFSET_MASK);
                }
            }
        }
        if req.need_interrupt == 0 {
            self.bridge.complete_cfg(req.src_cpu, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::mmio::{
        MMIO_DEVICE_ID, MMIO_MAGIC_VALUE, MMIO_QUEUE_NUM, MMIO_QUEUE_NUM_MAX, MMIO_QUEUE_SEL,
        VIRT_MAGIC,
    };
    use crate::devices::testing::{spec, StubBackend};
    use crate::devices::{DeviceKind, DeviceTable, VirtioDevice, VIRTIO_ID_BLOCK};
    use crate::memory::NON_ROOT_PHYS_START;

    const DEV_BASE: u64 = 0xa000_0000;

    fn dispatcher() -> Dispatcher {
        let mut table = DeviceTable::new();
        let mut s = spec(DeviceKind::Block);
        s.addr = DEV_BASE;
        let mut stub = StubBackend::new();
        stub.sizes = &[64, 64];
        table
            .add(VirtioDevice::with_backend(&s, Box::new(stub)))
            .unwrap();
        Dispatcher::new(
            Arc::new(Bridge::for_tests()),
            Arc::new(GuestMemory::anon(NON_ROOT_PHYS_START, 0x10000).unwrap()),
            Arc::new(table),
        )
    }

    fn read_req(cpu: u64, zone: u32, address: u64) -> DeviceReq {
        DeviceReq {
            src_cpu: cpu,
            address,
            value: 0,
            size: 4,
            src_zone: zone,
            is_write: 0,
            need_interrupt: 0,
            ..Default::default()
        }
    }

    fn write_req(cpu: u64, zone: u32, address: u64, value: u64) -> DeviceReq {
        DeviceReq {
            src_cpu: cpu,
            address,
            value,
            size: 4,
            src_zone: zone,
            is_write: 1,
            need_interrupt: 0,
            ..Default::default()
        }
    }

    #[test]
    fn read_routes_to_the_device_and_completes() {
        let d = dispatcher();
        d.handle(&read_req(2, 1, DEV_BASE + MMIO_MAGIC_VALUE));
        assert_eq!(d.bridge.cfg_value(2), u64::from(VIRT_MAGIC));
        assert_eq!(d.bridge.cfg_flag(2), 1);

        d.handle(&read_req(2, 1, DEV_BASE + MMIO_DEVICE_ID));
        assert_eq!(d.bridge.cfg_value(2), u64::from(VIRTIO_ID_BLOCK));
        assert_eq!(d.bridge.cfg_flag(2), 2);
    }

    #[test]
    fn write_reaches_the_register_file() {
        let d = dispatcher();
        d.handle(&write_req(0, 1, DEV_BASE + MMIO_QUEUE_SEL, 1));
        d.handle(&write_req(0, 1, DEV_BASE + MMIO_QUEUE_NUM, 32));
        d.handle(&read_req(0, 1, DEV_BASE + MMIO_QUEUE_NUM_MAX));
        assert_eq!(d.bridge.cfg_value(0), 64);
        // writes with need_interrupt == 0 complete the cfg slot too
        assert_eq!(d.bridge.cfg_flag(0), 3);

        let dev = d.devices.find(1, DEV_BASE).unwrap();
        let inner = dev.lock_inner();
        assert_eq!(inner.regs.queue_sel, 1);
        assert_eq!(inner.vqs[1].num, 32);
    }

    #[test]
    fn unmatched_probe_reads_the_null_device() {
        let d = dispatcher();
        // magic value offset within an unclaimed page
        d.handle(&read_req(3, 7, 0xb000_0000));
        assert_eq!(d.bridge.cfg_value(3), u64::from(VIRT_MAGIC));
        assert_eq!(d.bridge.cfg_flag(3), 1);

        // queue-num-max offset of an unclaimed page reads as zero
        d.handle(&read_req(3, 7, 0xb000_0000 + MMIO_QUEUE_NUM_MAX));
        assert_eq!(d.bridge.cfg_value(3), 0);
        assert_eq!(d.bridge.cfg_flag(3), 2);
    }

    #[test]
    fn unmatched_write_is_dropped() {
        let d = dispatcher();
        d.handle(&write_req(0, 7, 0xb000_0000, 0xdead));
        // still completed so the vCPU is released
        assert_eq!(d.bridge.cfg_flag(0), 1);
        assert_eq!(d.bridge.cfg_value(0), 0);
    }

    #[test]
    fn drain_consumes_the_ring_and_republishes_wakeup() {
        let d = dispatcher();
        d.bridge.push_request(read_req(1, 1, DEV_BASE + MMIO_MAGIC_VALUE));
        d.bridge.push_request(read_req(1, 1, DEV_BASE + MMIO_DEVICE_ID));
        d.drain();
        assert!(d.bridge.req_is_empty());
        assert_eq!(d.bridge.cfg_flag(1), 2);
        assert_eq!(d.bridge.need_wakeup(), 1);
    }
}

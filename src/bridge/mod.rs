//! Kernel control surface.
//!
//! The hypervisor kernel module is reached through the `/dev/hvisor`
//! character device: one `INIT_VIRTIO` ioctl after opening, an `mmap` at
//! offset 0 for the [`VirtioBridge`] mailbox, a second `mmap` for the guest
//! memory window (see `memory`), and a `FINISH_REQ` ioctl every time a new
//! response is published.
//!
//! All mailbox fields shared with the kernel are read and written through
//! volatile accesses paired with explicit fences, mirroring the barrier
//! discipline the kernel side uses. The request ring is consumed only by the
//! dispatcher thread; the response ring may be fed by any back-end thread and
//! is serialized by `res_lock`.

pub mod shmem;

use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::os::fd::AsRawFd;
use std::ptr::{addr_of, addr_of_mut, NonNull};
use std::sync::atomic::{fence, Ordering};
use std::sync::Mutex;

use log::{error, info, warn};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use thiserror::Error;

use shmem::{
    queue_empty, queue_full, ring_next, DeviceReq, VirtioBridge, MAX_CPUS, MAX_DEVS, MMAP_SIZE,
};

/// Path of the kernel module's character device.
pub const HVISOR_DEV: &str = "/dev/hvisor";

mod ioctl {
    const HVISOR_MAGIC: u8 = b'H';
    nix::ioctl_none!(init_virtio, HVISOR_MAGIC, 0);
    nix::ioctl_none!(finish_req, HVISOR_MAGIC, 1);
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to open {HVISOR_DEV}: {0}")]
    Open(#[source] std::io::Error),

    #[error("INIT_VIRTIO ioctl failed: {0}")]
    InitVirtio(#[source] nix::Error),

    #[error("failed to map the virtio bridge: {0}")]
    MapBridge(#[source] nix::Error),

    #[error("failed to duplicate the kernel fd: {0}")]
    CloneFd(#[source] std::io::Error),

    #[error("FINISH_REQ ioctl failed: {0}")]
    FinishReq(#[source] nix::Error),
}

/// Handle to the kernel module: the device fd plus the mapped mailbox.
pub struct Bridge {
    /// `None` only for the in-process mailbox used by tests.
    fd: Option<File>,
    shm: NonNull<VirtioBridge>,
    mapped: bool,
    res_lock: Mutex<()>,
}

// SAFETY: the mailbox is only touched through volatile accesses; the response
// ring, the one multi-producer side, is serialized by `res_lock`.
unsafe impl Send for Bridge {}
unsafe impl Sync for Bridge {}

impl Bridge {
    /// Open the kernel device, announce ourselves and map the mailbox.
    pub fn open() -> Result<Self, BridgeError> {
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .open(HVISOR_DEV)
            .map_err(BridgeError::Open)?;

        // SAFETY: fd is a freshly opened hvisor device.
        unsafe { ioctl::init_virtio(fd.as_raw_fd()) }.map_err(BridgeError::InitVirtio)?;

        let len = NonZeroUsize::new(MMAP_SIZE).expect("MMAP_SIZE is non-zero");
        // SAFETY: mapping a kernel-provided region; no existing Rust object
        // aliases it.
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        }
        .map_err(BridgeError::MapBridge)?;

        info!("virtio bridge mapped at {:p}", ptr.as_ptr());
        Ok(Self {
            fd: Some(fd),
            shm: ptr.cast(),
            mapped: true,
            res_lock: Mutex::new(()),
        })
    }

    /// An in-process mailbox with no kernel behind it.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        // SAFETY: VirtioBridge is a POD for which all-zeroes is a valid state.
        let boxed: Box<VirtioBridge> = Box::new(unsafe { std::mem::zeroed() });
        Self {
            fd: None,
            shm: NonNull::new(Box::into_raw(boxed)).expect("box is non-null"),
            mapped: false,
            res_lock: Mutex::new(()),
        }
    }

    /// Duplicate the kernel fd for mapping the guest-memory window.
    pub fn window_file(&self) -> Result<File, BridgeError> {
        let fd = self
            .fd
            .as_ref()
            .expect("window_file is never called on a test bridge");
        fd.try_clone().map_err(BridgeError::CloneFd)
    }

    fn shm_ptr(&self) -> *mut VirtioBridge {
        self.shm.as_ptr()
    }

    // ------------------------------------------------------------------
    // Request ring (kernel produces, dispatcher consumes)
    // ------------------------------------------------------------------

    pub fn req_is_empty(&self) -> bool {
        let p = self.shm_ptr();
        // SAFETY: in-bounds volatile reads of the mapped mailbox.
        unsafe {
            queue_empty(
                addr_of!((*p).req_front).read_volatile(),
                addr_of!((*p).req_rear).read_volatile(),
            )
        }
    }

    /// Copy out the request at the head of the ring. Only meaningful when the
    /// ring is non-empty.
    pub fn req_head(&self) -> DeviceReq {
        let p = self.shm_ptr();
        // SAFETY: front is masked to the ring capacity.
        unsafe {
            let front = addr_of!((*p).req_front).read_volatile() as usize & (shmem::MAX_REQ - 1);
            addr_of!((*p).req_list[front]).read_volatile()
        }
    }

    /// Consume the head request: advance `req_front` and publish the advance.
    pub fn advance_req_front(&self) {
        let p = self.shm_ptr();
        // SAFETY: in-bounds volatile accesses.
        unsafe {
            let front = addr_of!((*p).req_front).read_volatile();
            addr_of_mut!((*p).req_front).write_volatile(ring_next(front));
        }
        fence(Ordering::Release);
    }

    /// Tell the kernel whether it must raise the wakeup signal for new work.
    pub fn set_need_wakeup(&self, on: bool) {
        let p = self.shm_ptr();
        // SAFETY: in-bounds volatile write.
        unsafe { addr_of_mut!((*p).need_wakeup).write_volatile(u8::from(on)) };
        fence(Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Config completion slots
    // ------------------------------------------------------------------

    /// Publish the result of a control-path access for `cpu`. The kernel polls
    /// the matching `cfg_flags` sequence counter.
    pub fn complete_cfg(&self, cpu: u64, value: u64) {
        let Ok(cpu) = usize::try_from(cpu) else {
            error!("config completion for impossible cpu {cpu}");
            return;
        };
        if cpu >= MAX_CPUS {
            error!("config completion for out-of-range cpu {cpu}");
            return;
        }
        let p = self.shm_ptr();
        // SAFETY: cpu is bounds-checked above.
        unsafe {
            addr_of_mut!((*p).cfg_values[cpu]).write_volatile(value);
            fence(Ordering::Release);
            let seq = addr_of!((*p).cfg_flags[cpu]).read_volatile();
            addr_of_mut!((*p).cfg_flags[cpu]).write_volatile(seq.wrapping_add(1));
        }
        fence(Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Response ring (any thread produces, kernel consumes)
    // ------------------------------------------------------------------

    /// Queue an interrupt for the kernel to deliver. Blocks (spinning) while
    /// the ring is full; the kernel drains `res_front` independently of
    /// `res_lock`, so waiting under the lock cannot deadlock.
    pub fn push_response(&self, target_zone: u32, irq_id: u32) {
        let _guard = self.res_lock.lock().expect("response ring lock poisoned");
        let p = self.shm_ptr();
        // SAFETY: in-bounds volatile accesses; rear is masked to capacity.
        unsafe {
            loop {
                let front = addr_of!((*p).res_front).read_volatile();
                let rear = addr_of!((*p).res_rear).read_volatile();
                if !queue_full(front, rear) {
                    break;
                }
                std::hint::spin_loop();
            }
            let rear = addr_of!((*p).res_rear).read_volatile();
            let slot = rear as usize & (shmem::MAX_REQ - 1);
            addr_of_mut!((*p).res_list[slot].target_zone).write_volatile(target_zone);
            addr_of_mut!((*p).res_list[slot].irq_id).write_volatile(irq_id);
            fence(Ordering::Release);
            addr_of_mut!((*p).res_rear).write_volatile(ring_next(rear));
        }
        fence(Ordering::Release);
    }

    /// Notify the kernel that a new response is pending.
    pub fn finish_req(&self) -> Result<(), BridgeError> {
        let Some(fd) = self.fd.as_ref() else {
            return Ok(());
        };
        // SAFETY: fd is the open hvisor device.
        unsafe { ioctl::finish_req(fd.as_raw_fd()) }
            .map(drop)
            .map_err(BridgeError::FinishReq)
    }

    // ------------------------------------------------------------------
    // Device advertisement
    // ------------------------------------------------------------------

    /// Hand the kernel the list of guest-physical regions it should trap.
    pub fn publish_mmio_addrs(&self, addrs: &[u64]) {
        if addrs.len() > MAX_DEVS {
            warn!("truncating mmio address list to {MAX_DEVS} entries");
        }
        let p = self.shm_ptr();
        // SAFETY: index bounded by MAX_DEVS.
        unsafe {
            for (i, addr) in addrs.iter().take(MAX_DEVS).enumerate() {
                addr_of_mut!((*p).mmio_addrs[i]).write_volatile(*addr);
            }
            fence(Ordering::Release);
            addr_of_mut!((*p).mmio_avail).write_volatile(1);
        }
        fence(Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Test-side kernel emulation
    // ------------------------------------------------------------------

    /// Play the kernel's producer role: append a request to the ring.
    #[cfg(test)]
    pub(crate) fn push_request(&self, req: DeviceReq) {
        let p = self.shm_ptr();
        // SAFETY: test mailbox, single-threaded producer.
        unsafe {
            let rear = addr_of!((*p).req_rear).read_volatile();
            addr_of_mut!((*p).req_list[rear as usize & (shmem::MAX_REQ - 1)]).write_volatile(req);
            addr_of_mut!((*p).req_rear).write_volatile(ring_next(rear));
        }
    }

    #[cfg(test)]
    pub(crate) fn res_rear(&self) -> u32 {
        // SAFETY: in-bounds volatile read.
        unsafe { addr_of!((*self.shm_ptr()).res_rear).read_volatile() }
    }

    #[cfg(test)]
    pub(crate) fn res_slot(&self, idx: u32) -> shmem::DeviceRes {
        // SAFETY: index masked to capacity.
        unsafe { addr_of!((*self.shm_ptr()).res_list[idx as usize & (shmem::MAX_REQ - 1)]).read_volatile() }
    }

    #[cfg(test)]
    pub(crate) fn cfg_flag(&self, cpu: usize) -> u32 {
        // SAFETY: tests index within MAX_CPUS.
        unsafe { addr_of!((*self.shm_ptr()).cfg_flags[cpu]).read_volatile() }
    }

    #[cfg(test)]
    pub(crate) fn cfg_value(&self, cpu: usize) -> u64 {
        // SAFETY: tests index within MAX_CPUS.
        unsafe { addr_of!((*self.shm_ptr()).cfg_values[cpu]).read_volatile() }
    }

    #[cfg(test)]
    pub(crate) fn need_wakeup(&self) -> u8 {
        // SAFETY: in-bounds volatile read.
        unsafe { addr_of!((*self.shm_ptr()).need_wakeup).read_volatile() }
    }

    #[cfg(test)]
    pub(crate) fn mmio_addr(&self, idx: usize) -> u64 {
        // SAFETY: tests index within MAX_DEVS.
        unsafe { addr_of!((*self.shm_ptr()).mmio_addrs[idx]).read_volatile() }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if self.mapped {
            // SAFETY: shm is the start of an MMAP_SIZE mapping we own.
            if let Err(e) = unsafe { munmap(self.shm.cast(), MMAP_SIZE) } {
                warn!("failed to unmap virtio bridge: {e}");
            }
        } else {
            // SAFETY: allocated via Box::into_raw in for_tests().
            drop(unsafe { Box::from_raw(self.shm.as_ptr()) });
        }
    }
}

//! Guest-memory window for the non-root zone.
//!
//! The kernel module maps the zone's physical memory into the daemon as one
//! contiguous read-write window starting at `NON_ROOT_PHYS_START`, obtained
//! by mmapping `/dev/hvisor` at that file offset. Everything the virtqueue
//! engine dereferences (descriptor tables, rings, data buffers) lives in
//! this window, addressed by guest-physical address.
//!
//! The wrapper narrows `vm_memory::GuestMemoryMmap` to this use case and adds
//! the window clamp the descriptor walkers rely on: every access is checked
//! against `[base, base + size)` before it reaches guest memory, so a hostile
//! descriptor cannot point the daemon at its own heap.

use std::fs::File;

use log::info;
use thiserror::Error;
use vm_memory::{
    ByteValued, Bytes, FileOffset, GuestAddress, GuestMemory as GuestMemoryTrait,
    GuestMemoryError, GuestMemoryMmap,
};

/// Guest-physical base of the non-root zone's memory.
pub const NON_ROOT_PHYS_START: u64 = 0x5000_0000;

/// Size of the non-root zone's memory window.
pub const NON_ROOT_PHYS_SIZE: u64 = 0x3000_0000;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("failed to map the guest window: {0}")]
    Map(#[source] vm_memory::Error),

    #[error("guest address {addr:#x} (+{len:#x}) outside the non-root window")]
    OutOfWindow { addr: u64, len: u64 },

    #[error("guest memory access at {addr:#x} failed: {source}")]
    Access {
        addr: u64,
        #[source]
        source: GuestMemoryError,
    },
}

/// The mapped window, addressed by guest-physical address.
pub struct GuestMemory {
    inner: GuestMemoryMmap,
    base: u64,
    size: u64,
}

impl GuestMemory {
    /// Map the non-root window from the kernel device fd.
    pub fn map(file: File) -> Result<Self, MemoryError> {
        let ranges = vec![(
            GuestAddress(NON_ROOT_PHYS_START),
            NON_ROOT_PHYS_SIZE as usize,
            Some(FileOffset::new(file, NON_ROOT_PHYS_START)),
        )];
        let inner = GuestMemoryMmap::from_ranges_with_files(ranges).map_err(MemoryError::Map)?;
        let mem = Self {
            inner,
            base: NON_ROOT_PHYS_START,
            size: NON_ROOT_PHYS_SIZE,
        };
        let host = mem.hva(NON_ROOT_PHYS_START)?;
        info!(
            "guest window {:#x}+{:#x} mapped at {host:p}",
            NON_ROOT_PHYS_START, NON_ROOT_PHYS_SIZE
        );
        Ok(mem)
    }

    /// An anonymous window with the same addressing, for running without the
    /// kernel module (tests).
    pub fn anon(base: u64, size: usize) -> Result<Self, MemoryError> {
        let inner = GuestMemoryMmap::from_ranges(&[(GuestAddress(base), size)])
            .map_err(MemoryError::Map)?;
        Ok(Self {
            inner,
            base,
            size: size as u64,
        })
    }

    /// Whether `[addr, addr + len)` lies entirely inside the window.
    pub fn check_range(&self, addr: u64, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.base && end <= self.base + self.size,
            None => false,
        }
    }

    fn clamp(&self, addr: u64, len: u64) -> Result<GuestAddress, MemoryError> {
        if self.check_range(addr, len) {
            Ok(GuestAddress(addr))
        } else {
            Err(MemoryError::OutOfWindow { addr, len })
        }
    }

    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let ga = self.clamp(addr, buf.len() as u64)?;
        self.inner
            .read_slice(buf, ga)
            .map_err(|source| MemoryError::Access { addr, source })
    }

    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        let ga = self.clamp(addr, data.len() as u64)?;
        self.inner
            .write_slice(data, ga)
            .map_err(|source| MemoryError::Access { addr, source })
    }

    /// Read a plain-old-data value at a guest-physical address.
    pub fn read_obj<T: ByteValued>(&self, addr: u64) -> Result<T, MemoryError> {
        let ga = self.clamp(addr, std::mem::size_of::<T>() as u64)?;
        self.inner
            .read_obj(ga)
            .map_err(|source| MemoryError::Access { addr, source })
    }

    /// Write a plain-old-data value at a guest-physical address.
    pub fn write_obj<T: ByteValued>(&self, addr: u64, val: T) -> Result<(), MemoryError> {
        let ga = self.clamp(addr, std::mem::size_of::<T>() as u64)?;
        self.inner
            .write_obj(val, ga)
            .map_err(|source| MemoryError::Access { addr, source })
    }

    /// Resolve a guest-physical address to a host-virtual pointer.
    pub fn hva(&self, addr: u64) -> Result<*mut u8, MemoryError> {
        self.clamp(addr, 1)?;
        self.inner
            .get_host_address(GuestAddress(addr))
            .map_err(|source| MemoryError::Access { addr, source })
    }
}

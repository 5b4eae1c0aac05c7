//! Virtqueue engine: descriptor-chain traversal and used-ring publication.
//!
//! A virtqueue is the standard virtio ring triplet living in guest memory:
//!
//! ```text
//! desc_table:  [ Descriptor; num ]          16 bytes each
//! avail_ring:  flags u16 | idx u16 | ring[num] u16 | used_event u16
//! used_ring:   flags u16 | idx u16 | ring[num] {id u32, len u32} | avail_event u16
//! ```
//!
//! The driver owns the descriptor table and the avail ring; the device owns
//! the used ring. `num` is always a power of two, so ring positions are the
//! free-running 16-bit indices masked with `num - 1`.
//!
//! The walker turns one available chain into a scatter-gather vector of
//! window-checked guest buffers. Chains are bounded by `num` links, may
//! contain a single level of indirection, and every buffer is validated
//! against the guest window before it is handed to a back-end.

use std::num::Wrapping;
use std::sync::atomic::{fence, Ordering};

use thiserror::Error;
use vm_memory::ByteValued;

use crate::memory::{GuestMemory, MemoryError};

pub const VIRTQ_DESC_F_NEXT: u16 = 0x1;
pub const VIRTQ_DESC_F_WRITE: u16 = 0x2;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 0x4;

/// Used-ring flag: the device does not want avail notifications.
pub const VIRTQ_USED_F_NO_NOTIFY: u16 = 0x1;

/// Avail-ring flag: the driver does not want completion interrupts.
pub const VIRTQ_AVAIL_F_NO_INTERRUPT: u16 = 0x1;

const DESC_SIZE: u64 = 16;
const USED_ELEM_SIZE: u64 = 8;
/// Offset of the `idx` field in both the avail and used ring headers.
const RING_IDX_OFFSET: u64 = 2;
/// Offset of the first ring element past the `flags`/`idx` header.
const RING_HDR_SIZE: u64 = 4;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is not ready")]
    NotReady,

    #[error("queue size {0} is invalid")]
    BadSize(u16),

    #[error("descriptor index {0} out of bounds")]
    BadDescIndex(u16),

    #[error("descriptor chain exceeds queue size {0}")]
    ChainTooLong(u16),

    #[error("descriptor buffer {addr:#x}+{len:#x} outside the guest window")]
    BufferOutOfWindow { addr: u64, len: u32 },

    #[error("indirect table length {0:#x} is not a multiple of the descriptor size")]
    BadIndirectLen(u32),

    #[error("indirect descriptor index {0} out of table bounds")]
    BadIndirectIndex(u32),

    #[error("indirect table declares {declared} entries but the chain walks {walked}")]
    IndirectLenMismatch { declared: u32, walked: u32 },

    #[error("nested indirect descriptor")]
    NestedIndirect,

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// A virtqueue descriptor as laid out in guest memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

// SAFETY: POD with no padding.
unsafe impl ByteValued for Descriptor {}

/// A used-ring element as laid out in guest memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UsedElem {
    pub id: u32,
    pub len: u32,
}

// SAFETY: POD with no padding.
unsafe impl ByteValued for UsedElem {}

/// One window-checked guest buffer of a descriptor chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    /// Guest-physical address of the buffer.
    pub addr: u64,
    pub len: u32,
    /// Device-writable (readable descriptors precede writable ones by
    /// convention; back-ends rely on the order, the walker does not).
    pub write: bool,
}

/// A dequeued descriptor chain: the head index to publish back on the used
/// ring plus the flattened buffer list.
#[derive(Debug)]
pub struct DescChain {
    pub head: u16,
    pub sg: Vec<SgEntry>,
}

impl DescChain {
    /// Gather the device-readable bytes of the chain, skipping the first
    /// `skip` bytes of the readable stream (protocol headers).
    pub fn read_payload(&self, mem: &GuestMemory, mut skip: usize) -> Result<Vec<u8>, QueueError> {
        let mut out = Vec::new();
        for e in self.sg.iter().filter(|e| !e.write) {
            let len = e.len as usize;
            if skip >= len {
                skip -= len;
                continue;
            }
            let mut buf = vec![0u8; len];
            mem.read(e.addr, &mut buf)?;
            out.extend_from_slice(&buf[skip..]);
            skip = 0;
        }
        Ok(out)
    }

    /// Scatter `data` into the device-writable buffers of the chain. Returns
    /// the number of bytes that fit.
    pub fn write_payload(&self, mem: &GuestMemory, data: &[u8]) -> Result<u32, QueueError> {
        let mut off = 0usize;
        for e in self.sg.iter().filter(|e| e.write) {
            if off == data.len() {
                break;
            }
            let n = (e.len as usize).min(data.len() - off);
            mem.write(e.addr, &data[off..off + n])?;
            off += n;
        }
        Ok(off as u32)
    }
}

/// Device-side state of one virtqueue.
#[derive(Debug)]
pub struct VirtQueue {
    /// Index of this queue within its device. Survives reset.
    pub vq_idx: u16,
    /// Largest queue size the device offers. Survives reset.
    pub num_max: u16,
    /// Queue size programmed by the driver.
    pub num: u16,
    pub ready: bool,
    /// Guest-physical ring addresses, each assembled from two 32-bit writes.
    pub desc_table: u64,
    pub avail_ring: u64,
    pub used_ring: u64,
    /// Position of the next chain to dequeue from the avail ring.
    pub last_avail_idx: Wrapping<u16>,
    /// Used index at the time of the last interrupt decision.
    pub last_used_idx: Wrapping<u16>,
    pub event_idx_enabled: bool,
}

impl VirtQueue {
    pub fn new(vq_idx: u16, num_max: u16) -> Self {
        Self {
            vq_idx,
            num_max,
            num: 0,
            ready: false,
            desc_table: 0,
            avail_ring: 0,
            used_ring: 0,
            last_avail_idx: Wrapping(0),
            last_used_idx: Wrapping(0),
            event_idx_enabled: false,
        }
    }

    /// Device reset: clear everything except the queue's identity and the
    /// offered maximum.
    pub fn reset(&mut self) {
        *self = Self::new(self.vq_idx, self.num_max);
    }

    fn checked_num(&self) -> Result<u16, QueueError> {
        if !self.ready {
            return Err(QueueError::NotReady);
        }
        let num = self.num;
        if num == 0 || !num.is_power_of_two() || num > self.num_max {
            return Err(QueueError::BadSize(num));
        }
        Ok(num)
    }

    /// Whether the driver has published chains we have not dequeued yet.
    pub fn pending(&self, mem: &GuestMemory) -> Result<bool, QueueError> {
        self.checked_num()?;
        fence(Ordering::Acquire);
        let avail_idx: u16 = mem.read_obj(self.avail_ring + RING_IDX_OFFSET)?;
        Ok(avail_idx != self.last_avail_idx.0)
    }

    /// Dequeue the next available descriptor chain, if any.
    ///
    /// `extra` reserves additional scatter-gather capacity for back-ends that
    /// append buffers of their own.
    pub fn pop_chain(
        &mut self,
        mem: &GuestMemory,
        extra: usize,
    ) -> Result<Option<DescChain>, QueueError> {
        let num = self.checked_num()?;
        fence(Ordering::Acquire);
        let avail_idx: u16 = mem.read_obj(self.avail_ring + RING_IDX_OFFSET)?;
        if avail_idx == self.last_avail_idx.0 {
            return Ok(None);
        }

        let mask = u64::from(num - 1);
        let slot = self.avail_ring + RING_HDR_SIZE + 2 * (u64::from(self.last_avail_idx.0) & mask);
        let head: u16 = mem.read_obj(slot)?;
        self.last_avail_idx += Wrapping(1);

        let mut sg = Vec::with_capacity(4 + extra);
        let mut followed: u32 = 0;
        let mut next = head;
        loop {
            if next >= num {
                return Err(QueueError::BadDescIndex(next));
            }
            followed += 1;
            if followed > u32::from(num) {
                return Err(QueueError::ChainTooLong(num));
            }
            let desc: Descriptor = mem.read_obj(self.desc_table + DESC_SIZE * u64::from(next))?;
            if desc.flags & VIRTQ_DESC_F_INDIRECT != 0 {
                walk_indirect(mem, &desc, &mut sg)?;
            } else {
                push_entry(mem, &desc, &mut sg)?;
            }
            if desc.flags & VIRTQ_DESC_F_NEXT == 0 {
                break;
            }
            next = desc.next;
        }
        Ok(Some(DescChain { head, sg }))
    }

    /// Publish a completion: used element first, index increment second, each
    /// side fenced so the driver observes them in order.
    pub fn push_used(&mut self, mem: &GuestMemory, head: u16, iolen: u32) -> Result<(), QueueError> {
        if self.num == 0 {
            return Err(QueueError::BadSize(0));
        }
        let mask = u64::from(self.num - 1);
        fence(Ordering::Release);
        let idx: u16 = mem.read_obj(self.used_ring + RING_IDX_OFFSET)?;
        let slot = self.used_ring + RING_HDR_SIZE + USED_ELEM_SIZE * (u64::from(idx) & mask);
        mem.write_obj(
            slot,
            UsedElem {
                id: u32::from(head),
                len: iolen,
            },
        )?;
        mem.write_obj(self.used_ring + RING_IDX_OFFSET, idx.wrapping_add(1))?;
        fence(Ordering::Release);
        Ok(())
    }

    /// Guest address of the avail-event slot (tail of the used ring).
    fn avail_event_addr(&self) -> u64 {
        self.used_ring + RING_HDR_SIZE + USED_ELEM_SIZE * u64::from(self.num)
    }

    /// Guest address of the used-event slot (tail of the avail ring).
    fn used_event_addr(&self) -> u64 {
        self.avail_ring + RING_HDR_SIZE + 2 * u64::from(self.num)
    }

    /// Ask the driver to stop notifying while we are already draining the
    /// queue.
    pub fn suppress_notify(&self, mem: &GuestMemory) -> Result<(), QueueError> {
        if self.event_idx_enabled {
            mem.write_obj(self.avail_event_addr(), self.last_avail_idx.0.wrapping_sub(1))?;
        } else {
            let flags: u16 = mem.read_obj(self.used_ring)?;
            mem.write_obj(self.used_ring, flags | VIRTQ_USED_F_NO_NOTIFY)?;
        }
        fence(Ordering::Release);
        Ok(())
    }

    /// Re-arm driver notifications after the queue has run dry.
    pub fn restore_notify(&self, mem: &GuestMemory) -> Result<(), QueueError> {
        if self.event_idx_enabled {
            let avail_idx: u16 = mem.read_obj(self.avail_ring + RING_IDX_OFFSET)?;
            mem.write_obj(self.avail_event_addr(), avail_idx)?;
        } else {
            let flags: u16 = mem.read_obj(self.used_ring)?;
            mem.write_obj(self.used_ring, flags & !VIRTQ_USED_F_NO_NOTIFY)?;
        }
        fence(Ordering::Release);
        Ok(())
    }

    /// Decide whether the completions published since the last call warrant a
    /// guest interrupt, and advance the interrupt bookmark either way.
    pub fn needs_irq(&mut self, mem: &GuestMemory) -> Result<bool, QueueError> {
        let new = Wrapping(mem.read_obj::<u16>(self.used_ring + RING_IDX_OFFSET)?);
        let old = self.last_used_idx;
        self.last_used_idx = new;
        if new == old {
            return Ok(false);
        }
        if self.event_idx_enabled {
            let event: u16 = mem.read_obj(self.used_event_addr())?;
            Ok(vring_need_event(event, new.0, old.0))
        } else {
            let flags: u16 = mem.read_obj(self.avail_ring)?;
            Ok(flags & VIRTQ_AVAIL_F_NO_INTERRUPT == 0)
        }
    }
}

fn push_entry(
    mem: &GuestMemory,
    desc: &Descriptor,
    sg: &mut Vec<SgEntry>,
) -> Result<(), QueueError> {
    if !mem.check_range(desc.addr, u64::from(desc.len)) {
        return Err(QueueError::BufferOutOfWindow {
            addr: desc.addr,
            len: desc.len,
        });
    }
    sg.push(SgEntry {
        addr: desc.addr,
        len: desc.len,
        write: desc.flags & VIRTQ_DESC_F_WRITE != 0,
    });
    Ok(())
}

/// Walk a one-level indirect table. The declared table length must be
/// consumed exactly by the sub-chain.
fn walk_indirect(
    mem: &GuestMemory,
    desc: &Descriptor,
    sg: &mut Vec<SgEntry>,
) -> Result<(), QueueError> {
    if desc.len == 0 || u64::from(desc.len) % DESC_SIZE != 0 {
        return Err(QueueError::BadIndirectLen(desc.len));
    }
    if !mem.check_range(desc.addr, u64::from(desc.len)) {
        return Err(QueueError::BufferOutOfWindow {
            addr: desc.addr,
            len: desc.len,
        });
    }
    let table = desc.addr;
    let table_len = desc.len / DESC_SIZE as u32;
    let mut next: u32 = 0;
    let mut walked: u32 = 0;
    loop {
        if next >= table_len {
            return Err(QueueError::BadIndirectIndex(next));
        }
        if walked == table_len {
            return Err(QueueError::IndirectLenMismatch {
                declared: table_len,
                walked: walked + 1,
            });
        }
        let ind: Descriptor = mem.read_obj(table + DESC_SIZE * u64::from(next))?;
        if ind.flags & VIRTQ_DESC_F_INDIRECT != 0 {
            return Err(QueueError::NestedIndirect);
        }
        push_entry(mem, &ind, sg)?;
        walked += 1;
        if ind.flags & VIRTQ_DESC_F_NEXT == 0 {
            break;
        }
        next = u32::from(ind.next);
    }
    if walked != table_len {
        return Err(QueueError::IndirectLenMismatch {
            declared: table_len,
            walked,
        });
    }
    Ok(())
}

/// The standard virtio interrupt-coalescing predicate: does moving the used
/// index from `old` to `new` cross the driver's `event` bookmark?
pub fn vring_need_event(event: u16, new: u16, old: u16) -> bool {
    new.wrapping_sub(event).wrapping_sub(1) < new.wrapping_sub(old)
}

//! Virtio-mmio version 2 register model.
//!
//! One register file per device, driven entirely from trapped guest accesses
//! forwarded by the dispatcher. Accesses below `CONFIG` (0x100) must be
//! exactly 4 bytes wide; anything else is a guest programming error that is
//! logged and dropped. Accesses at or above `CONFIG` are forwarded to the
//! back-end's config structure.
//!
//! The register file also implements the probe path: when the dispatcher has
//! no device for a trapped address, reads go through [`probe_read`] so a
//! guest scanning for devices still sees the magic/version/vendor constants
//! and zeroes everywhere else instead of wedging its vCPU.
//!
//! Reference: <https://docs.oasis-open.org/virtio/virtio/v1.1/virtio-v1.1.html>

use log::{debug, error, trace, warn};

use super::{DeviceInner, QueueCtx};

// ============================================================================
// Register offsets (virtio-mmio v2)
// ============================================================================

pub const MMIO_MAGIC_VALUE: u64 = 0x000;
pub const MMIO_VERSION: u64 = 0x004;
pub const MMIO_DEVICE_ID: u64 = 0x008;
pub const MMIO_VENDOR_ID: u64 = 0x00c;
pub const MMIO_DEVICE_FEATURES: u64 = 0x010;
pub const MMIO_DEVICE_FEATURES_SEL: u64 = 0x014;
pub const MMIO_DRIVER_FEATURES: u64 = 0x020;
pub const MMIO_DRIVER_FEATURES_SEL: u64 = 0x024;
pub const MMIO_QUEUE_SEL: u64 = 0x030;
pub const MMIO_QUEUE_NUM_MAX: u64 = 0x034;
pub const MMIO_QUEUE_NUM: u64 = 0x038;
pub const MMIO_QUEUE_READY: u64 = 0x044;
pub const MMIO_QUEUE_NOTIFY: u64 = 0x050;
pub const MMIO_INTERRUPT_STATUS: u64 = 0x060;
pub const MMIO_INTERRUPT_ACK: u64 = 0x064;
pub const MMIO_STATUS: u64 = 0x070;
pub const MMIO_QUEUE_DESC_LOW: u64 = 0x080;
pub const MMIO_QUEUE_DESC_HIGH: u64 = 0x084;
pub const MMIO_QUEUE_AVAIL_LOW: u64 = 0x090;
pub const MMIO_QUEUE_AVAIL_HIGH: u64 = 0x094;
pub const MMIO_QUEUE_USED_LOW: u64 = 0x0a0;
pub const MMIO_QUEUE_USED_HIGH: u64 = 0x0a4;
pub const MMIO_CONFIG_GENERATION: u64 = 0x0fc;
pub const MMIO_CONFIG: u64 = 0x100;

// ============================================================================
// Constants
// ============================================================================

/// Magic value "virt" (little-endian).
pub const VIRT_MAGIC: u32 = 0x7472_6976;

/// MMIO protocol version we implement.
pub const VIRT_VERSION: u32 = 2;

/// Our vendor ID (arbitrary, not registered).
pub const VIRT_VENDOR: u32 = 0x0;

/// Used-ring interrupt cause bit of `INTERRUPT_STATUS`.
pub const VIRTIO_MMIO_INT_VRING: u32 = 0x1;

/// `VIRTIO_F_VERSION_1`: the device speaks the modern interface.
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

/// `VIRTIO_RING_F_EVENT_IDX`: per-event notification indices.
pub const VIRTIO_RING_F_EVENT_IDX: u64 = 1 << 29;

/// Feature bits every device advertises regardless of class.
pub const COMMON_FEATURES: u64 = VIRTIO_F_VERSION_1 | VIRTIO_RING_F_EVENT_IDX;

// Device status bits, for log decoding only.
const STATUS_ACKNOWLEDGE: u64 = 1;
const STATUS_DRIVER: u64 = 2;
const STATUS_DRIVER_OK: u64 = 4;
const STATUS_FEATURES_OK: u64 = 8;

/// Per-device register state.
#[derive(Debug, Clone)]
pub struct VirtMmioRegs {
    pub device_id: u32,
    pub dev_feature: u64,
    pub drv_feature: u64,
    pub dev_feature_sel: u32,
    pub drv_feature_sel: u32,
    pub queue_sel: u32,
    pub status: u32,
    pub interrupt_status: u32,
    /// In-flight interrupts sharing the `VRING` status bit; see
    /// `INTERRUPT_ACK`.
    pub interrupt_count: u32,
    pub generation: u32,
}

impl VirtMmioRegs {
    pub fn new(device_id: u32, dev_feature: u64) -> Self {
        Self {
            device_id,
            dev_feature,
            drv_feature: 0,
            dev_feature_sel: 0,
            drv_feature_sel: 0,
            queue_sel: 0,
            status: 0,
            interrupt_status: 0,
            interrupt_count: 0,
            generation: 0,
        }
    }

    /// Device reset: clear the negotiated and interrupt state, keep identity
    /// and the offered features.
    pub fn reset(&mut self) {
        self.status = 0;
        self.interrupt_status = 0;
        self.interrupt_count = 0;
        self.queue_sel = 0;
    }
}

/// Read path for addresses no device claims. Guests probing empty slots see
/// the transport constants and zeroes, never a fault.
pub fn probe_read(offset: u64) -> u64 {
    match offset {
        MMIO_MAGIC_VALUE => u64::from(VIRT_MAGIC),
        MMIO_VERSION => u64::from(VIRT_VERSION),
        MMIO_VENDOR_ID => u64::from(VIRT_VENDOR),
        _ => 0,
    }
}

/// Handle a register read at `offset`.
pub fn mmio_read(dev: &DeviceInner, offset: u64, size: u32) -> u64 {
    if offset >= MMIO_CONFIG {
        return config_read(dev, offset - MMIO_CONFIG, size);
    }
    if size != 4 {
        error!("mmio read at {offset:#x}: bad access width {size}");
        return 0;
    }
    let regs = &dev.regs;
    match offset {
        MMIO_MAGIC_VALUE => u64::from(VIRT_MAGIC),
        MMIO_VERSION => u64::from(VIRT_VERSION),
        MMIO_DEVICE_ID => u64::from(regs.device_id),
        MMIO_VENDOR_ID => u64::from(VIRT_VENDOR),
        MMIO_DEVICE_FEATURES => {
            if regs.dev_feature_sel != 0 {
                regs.dev_feature >> 32
            } else {
                regs.dev_feature & 0xffff_ffff
            }
        }
        MMIO_QUEUE_NUM_MAX => dev
            .vqs
            .get(regs.queue_sel as usize)
            .map_or(0, |vq| u64::from(vq.num_max)),
        MMIO_QUEUE_READY => dev
            .vqs
            .get(regs.queue_sel as usize)
            .map_or(0, |vq| u64::from(vq.ready)),
        MMIO_INTERRUPT_STATUS => {
            if regs.interrupt_status == 0 {
                debug!("interrupt status read while no interrupt is pending");
            }
            u64::from(regs.interrupt_status)
        }
        MMIO_STATUS => u64::from(regs.status),
        MMIO_CONFIG_GENERATION => u64::from(regs.generation),
        MMIO_DEVICE_FEATURES_SEL
        | MMIO_DRIVER_FEATURES
        | MMIO_DRIVER_FEATURES_SEL
        | MMIO_QUEUE_SEL
        | MMIO_QUEUE_NUM
        | MMIO_QUEUE_NOTIFY
        | MMIO_INTERRUPT_ACK
        | MMIO_QUEUE_DESC_LOW
        | MMIO_QUEUE_DESC_HIGH
        | MMIO_QUEUE_AVAIL_LOW
        | MMIO_QUEUE_AVAIL_HIGH
        | MMIO_QUEUE_USED_LOW
        | MMIO_QUEUE_USED_HIGH => {
            warn!("read of write-only register {offset:#x}");
            0
        }
        _ => {
            warn!("read of unknown register {offset:#x}");
            0
        }
    }
}

fn config_read(dev: &DeviceInner, off: u64, size: u32) -> u64 {
    let cfg = dev.backend.config();
    let off = off as usize;
    let mut value = 0u64;
    for i in 0..(size as usize).min(8) {
        if let Some(b) = cfg.get(off + i) {
            value |= u64::from(*b) << (8 * i);
        }
    }
    trace!("config read at +{off:#x}/{size} -> {value:#x}");
    value
}

/// Handle a register write at `offset`.
pub fn mmio_write(dev: &mut DeviceInner, ctx: &QueueCtx<'_>, offset: u64, size: u32, value: u64) {
    if offset >= MMIO_CONFIG {
        warn!("write to read-only config space at {offset:#x}");
        return;
    }
    if size != 4 {
        error!("mmio write at {offset:#x}: bad access width {size}");
        return;
    }
    let DeviceInner { regs, vqs, backend } = dev;
    match offset {
        MMIO_DEVICE_FEATURES_SEL => {
            regs.dev_feature_sel = u32::from(value != 0);
        }
        MMIO_DRIVER_FEATURES => {
            if regs.drv_feature_sel != 0 {
                regs.drv_feature |= value << 32;
            } else {
                regs.drv_feature |= value & 0xffff_ffff;
            }
            if regs.drv_feature & VIRTIO_RING_F_EVENT_IDX != 0 {
                for vq in vqs.iter_mut() {
                    vq.event_idx_enabled = true;
                }
            }
        }
        MMIO_DRIVER_FEATURES_SEL => {
            regs.drv_feature_sel = u32::from(value != 0);
        }
        MMIO_QUEUE_SEL => {
            if (value as usize) < vqs.len() {
                regs.queue_sel = value as u32;
            } else {
                warn!("queue select {value} out of range");
            }
        }
        MMIO_QUEUE_NUM => {
            let vq = &mut vqs[regs.queue_sel as usize];
            let num = value as u16;
            if u64::from(num) == value && num.is_power_of_two() && num <= vq.num_max {
                vq.num = num;
            } else {
                warn!("queue {} size {value} rejected (max {})", vq.vq_idx, vq.num_max);
            }
        }
        MMIO_QUEUE_READY => {
            let vq = &mut vqs[regs.queue_sel as usize];
            vq.ready = value != 0;
            if vq.ready {
                debug!(
                    "queue {} ready: num={} desc={:#x} avail={:#x} used={:#x}",
                    vq.vq_idx, vq.num, vq.desc_table, vq.avail_ring, vq.used_ring
                );
            }
        }
        MMIO_QUEUE_NOTIFY => {
            if (value as usize) < vqs.len() {
                if let Err(e) = backend.notify(value as u16, vqs, regs, ctx) {
                    warn!("queue {value} notify failed: {e}");
                }
            } else {
                warn!("notify for queue {value} out of range");
            }
        }
        MMIO_INTERRUPT_ACK => {
            let value = value as u32;
            if value == regs.interrupt_status {
                if regs.interrupt_count > 0 {
                    regs.interrupt_count -= 1;
                }
                if regs.interrupt_count == 0 {
                    regs.interrupt_status &= !value;
                }
            } else {
                warn!(
                    "interrupt ack {value:#x} does not match status {:#x}",
                    regs.interrupt_status
                );
                regs.interrupt_status &= !value;
            }
        }
        MMIO_STATUS => {
            regs.status = value as u32;
            if value == 0 {
                debug!("device reset");
                regs.reset();
                for vq in vqs.iter_mut() {
                    vq.reset();
                }
            } else {
                let mut flags = Vec::new();
                if value & STATUS_ACKNOWLEDGE != 0 {
                    flags.push("ACK");
                }
                if value & STATUS_DRIVER != 0 {
                    flags.push("DRIVER");
                }
                if value & STATUS_FEATURES_OK != 0 {
                    flags.push("FEATURES_OK");
                }
                if value & STATUS_DRIVER_OK != 0 {
                    flags.push("DRIVER_OK");
                }
                debug!("status: {} ({value:#x})", flags.join("|"));
            }
        }
        MMIO_QUEUE_DESC_LOW => {
            vqs[regs.queue_sel as usize].desc_table |= value & 0xffff_ffff;
        }
        MMIO_QUEUE_DESC_HIGH => {
            let vq = &mut vqs[regs.queue_sel as usize];
            vq.desc_table |= value << 32;
            trace!("queue {} descriptor table at {:#x}", vq.vq_idx, vq.desc_table);
        }
        MMIO_QUEUE_AVAIL_LOW => {
            vqs[regs.queue_sel as usize].avail_ring |= value & 0xffff_ffff;
        }
        MMIO_QUEUE_AVAIL_HIGH => {
            let vq = &mut vqs[regs.queue_sel as usize];
            vq.avail_ring |= value << 32;
            trace!("queue {} avail ring at {:#x}", vq.vq_idx, vq.avail_ring);
        }
        MMIO_QUEUE_USED_LOW => {
            vqs[regs.queue_sel as usize].used_ring |= value & 0xffff_ffff;
        }
        MMIO_QUEUE_USED_HIGH => {
            let vq = &mut vqs[regs.queue_sel as usize];
            vq.used_ring |= value << 32;
            trace!("queue {} used ring at {:#x}", vq.vq_idx, vq.used_ring);
        }
        MMIO_MAGIC_VALUE
        | MMIO_VERSION
        | MMIO_DEVICE_ID
        | MMIO_VENDOR_ID
        | MMIO_DEVICE_FEATURES
        | MMIO_QUEUE_NUM_MAX
        | MMIO_INTERRUPT_STATUS
        | MMIO_CONFIG_GENERATION => {
            warn!("write to read-only register {offset:#x}");
        }
        _ => {
            warn!("write to unknown register {offset:#x}");
        }
    }
}

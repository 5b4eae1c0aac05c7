//! Virtio device infrastructure.
//!
//! Every emulated device is a [`VirtioDevice`]: an immutable identity (zone,
//! MMIO region, interrupt line) plus mutexed state holding the register file,
//! the virtqueues and the class back-end. The dispatcher thread and the event
//! monitor both funnel through that mutex, which is what guarantees a single
//! walker per virtqueue.
//!
//! Back-ends plug in through [`VirtioBackend`]: a queue-notify handler called
//! from the MMIO write path, an optional poll fd + input handler for devices
//! fed by the event monitor, the device config bytes, and a teardown hook.
//! Completions flow back to the guest through [`QueueCtx::deliver_irq`],
//! which applies the queue's interrupt-suppression rules and publishes the
//! interrupt to the kernel.
//!
//! Devices are declared on the command line as comma-separated specs:
//!
//! ```text
//! blk,addr=0xa003c00,len=0x1000,irq=78,zone_id=1,img=/var/lib/zone1.img
//! net,addr=0xa003600,len=0x1000,irq=75,zone_id=1,tap=tap0
//! console,addr=0xa003800,len=0x1000,irq=76,zone_id=1
//! ```

pub mod blk;
pub mod console;
pub mod mmio;
pub mod net;
pub mod queue;

use std::fmt;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use log::{error, info, warn};
use thiserror::Error;

use crate::bridge::shmem::MAX_DEVS;
use crate::bridge::Bridge;
use crate::memory::GuestMemory;
use mmio::{VirtMmioRegs, COMMON_FEATURES, VIRTIO_MMIO_INT_VRING};
use queue::{QueueError, VirtQueue};

/// Virtio device type tags (virtio spec §5).
pub const VIRTIO_ID_NET: u32 = 1;
pub const VIRTIO_ID_BLOCK: u32 = 2;
pub const VIRTIO_ID_CONSOLE: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Block,
    Net,
    Console,
}

impl DeviceKind {
    pub fn device_id(self) -> u32 {
        match self {
            DeviceKind::Block => VIRTIO_ID_BLOCK,
            DeviceKind::Net => VIRTIO_ID_NET,
            DeviceKind::Console => VIRTIO_ID_CONSOLE,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceKind::Block => "blk",
            DeviceKind::Net => "net",
            DeviceKind::Console => "console",
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("unknown device type {0:?}")]
    UnknownKind(String),

    #[error("unknown option {0:?}")]
    UnknownOption(String),

    #[error("option {0:?} is missing a value")]
    MissingValue(String),

    #[error("bad value {value:?} for {field}")]
    BadNumber { field: &'static str, value: String },

    #[error("missing or zero mandatory field {0:?}")]
    MissingField(&'static str),

    #[error("option {option:?} is not valid for {kind} devices")]
    OptionNotAllowed {
        option: &'static str,
        kind: DeviceKind,
    },
}

/// A parsed `--device` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub kind: DeviceKind,
    pub addr: u64,
    pub len: u64,
    pub irq: u32,
    pub zone_id: u32,
    pub img: Option<PathBuf>,
    pub tap: Option<String>,
}

fn parse_hex(field: &'static str, value: &str) -> Result<u64, SpecError> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u64::from_str_radix(digits, 16).map_err(|_| SpecError::BadNumber {
        field,
        value: value.to_string(),
    })
}

fn parse_dec(field: &'static str, value: &str) -> Result<u32, SpecError> {
    value.parse().map_err(|_| SpecError::BadNumber {
        field,
        value: value.to_string(),
    })
}

impl FromStr for DeviceSpec {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, SpecError> {
        let mut parts = s.split(',');
        let kind = match parts.next() {
            Some("blk") => DeviceKind::Block,
            Some("net") => DeviceKind::Net,
            Some("console") => DeviceKind::Console,
            other => return Err(SpecError::UnknownKind(other.unwrap_or("").to_string())),
        };

        let mut spec = DeviceSpec {
            kind,
            addr: 0,
            len: 0,
            irq: 0,
            zone_id: 0,
            img: None,
            tap: None,
        };

        for part in parts {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| SpecError::MissingValue(part.to_string()))?;
            match key {
                "addr" => spec.addr = parse_hex("addr", value)?,
                "len" => spec.len = parse_hex("len", value)?,
                "irq" => spec.irq = parse_dec("irq", value)?,
                "zone_id" => spec.zone_id = parse_dec("zone_id", value)?,
                "img" => {
                    if kind != DeviceKind::Block {
                        return Err(SpecError::OptionNotAllowed { option: "img", kind });
                    }
                    spec.img = Some(PathBuf::from(value));
                }
                "tap" => {
                    if kind != DeviceKind::Net {
                        return Err(SpecError::OptionNotAllowed { option: "tap", kind });
                    }
                    spec.tap = Some(value.to_string());
                }
                other => return Err(SpecError::UnknownOption(other.to_string())),
            }
        }

        if spec.addr == 0 {
            return Err(SpecError::MissingField("addr"));
        }
        if spec.len == 0 {
            return Err(SpecError::MissingField("len"));
        }
        if spec.irq == 0 {
            return Err(SpecError::MissingField("irq"));
        }
        if spec.zone_id == 0 {
            return Err(SpecError::MissingField("zone_id"));
        }
        Ok(spec)
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("failed to open image {path:?}: {source}")]
    OpenImage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open tap {name:?}: {source}")]
    OpenTap {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to allocate console pty: {0}")]
    OpenPty(#[source] nix::Error),

    #[error("device table is full ({MAX_DEVS} devices)")]
    TableFull,
}

/// What a queue handler needs to publish completions back to its guest.
pub struct QueueCtx<'a> {
    pub mem: &'a GuestMemory,
    pub bridge: &'a Bridge,
    pub zone_id: u32,
    pub irq_id: u32,
}

impl QueueCtx<'_> {
    /// Raise a guest interrupt for any completions published on `vq` since
    /// the last call, honoring the queue's suppression rules.
    pub fn deliver_irq(
        &self,
        regs: &mut VirtMmioRegs,
        vq: &mut VirtQueue,
    ) -> Result<(), QueueError> {
        if !vq.needs_irq(self.mem)? {
            return Ok(());
        }
        self.bridge.push_response(self.zone_id, self.irq_id);
        regs.interrupt_status |= VIRTIO_MMIO_INT_VRING;
        regs.interrupt_count += 1;
        if let Err(e) = self.bridge.finish_req() {
            error!("failed to signal response to the kernel: {e}");
        }
        Ok(())
    }
}

/// A device-class implementation behind the transport core.
pub trait VirtioBackend: Send {
    /// Device-class feature bits, ORed into the always-advertised common set.
    fn device_features(&self) -> u64;

    /// Offered maximum size for each queue, in queue-index order.
    fn queue_sizes(&self) -> &'static [u16];

    /// Device-specific config structure, exposed to the guest from the
    /// `CONFIG` offset upward.
    fn config(&self) -> &[u8];

    /// Queue-notify handler: drain queue `q` and publish completions.
    fn notify(
        &mut self,
        q: u16,
        vqs: &mut [VirtQueue],
        regs: &mut VirtMmioRegs,
        ctx: &QueueCtx<'_>,
    ) -> Result<(), DeviceError>;

    /// Readable fd the event monitor should watch, if the device consumes
    /// asynchronous host-side input.
    fn poll_fd(&self) -> Option<RawFd> {
        None
    }

    /// Drain asynchronous input after `poll_fd` became readable.
    fn poll_in(
        &mut self,
        vqs: &mut [VirtQueue],
        regs: &mut VirtMmioRegs,
        ctx: &QueueCtx<'_>,
    ) -> Result<(), DeviceError> {
        let _ = (vqs, regs, ctx);
        Ok(())
    }

    /// Release host resources at daemon shutdown.
    fn teardown(&mut self) {}
}

/// Mutable device state, serialized by the device mutex.
pub struct DeviceInner {
    pub regs: VirtMmioRegs,
    pub vqs: Vec<VirtQueue>,
    pub backend: Box<dyn VirtioBackend>,
}

/// One emulated virtio-mmio device instance.
pub struct VirtioDevice {
    pub kind: DeviceKind,
    pub zone_id: u32,
    pub base_addr: u64,
    pub len: u64,
    pub irq_id: u32,
    inner: Mutex<DeviceInner>,
}

impl VirtioDevice {
    /// Build a device from a parsed declaration, opening its host resources.
    pub fn from_spec(spec: &DeviceSpec) -> Result<Self, DeviceError> {
        let backend: Box<dyn VirtioBackend> = match spec.kind {
            DeviceKind::Block => {
                let img = spec.img.as_ref().ok_or(SpecError::MissingField("img"))?;
                Box::new(blk::Blk::open(img)?)
            }
            DeviceKind::Net => {
                let tap = spec.tap.as_ref().ok_or(SpecError::MissingField("tap"))?;
                Box::new(net::Net::open(tap)?)
            }
            DeviceKind::Console => Box::new(console::Console::open()?),
        };
        Ok(Self::with_backend(spec, backend))
    }

    /// Assemble a device around an already-open back-end.
    pub fn with_backend(spec: &DeviceSpec, backend: Box<dyn VirtioBackend>) -> Self {
        let vqs = backend
            .queue_sizes()
            .iter()
            .enumerate()
            .map(|(i, &max)| VirtQueue::new(i as u16, max))
            .collect();
        let regs = VirtMmioRegs::new(
            spec.kind.device_id(),
            COMMON_FEATURES | backend.device_features(),
        );
        info!(
            "created {} device for zone {}: mmio {:#x}+{:#x}, irq {}",
            spec.kind, spec.zone_id, spec.addr, spec.len, spec.irq
        );
        Self {
            kind: spec.kind,
            zone_id: spec.zone_id,
            base_addr: spec.addr,
            len: spec.len,
            irq_id: spec.irq,
            inner: Mutex::new(DeviceInner { regs, vqs, backend }),
        }
    }

    /// Whether this device owns `addr` for the given zone.
    pub fn contains(&self, zone_id: u32, addr: u64) -> bool {
        self.zone_id == zone_id && addr >= self.base_addr && addr < self.base_addr + self.len
    }

    pub fn mmio_read(&self, offset: u64, size: u32) -> u64 {
        let inner = self.inner.lock().expect("device state lock poisoned");
        mmio::mmio_read(&inner, offset, size)
    }

    pub fn mmio_write(
        &self,
        offset: u64,
        size: u32,
        value: u64,
        mem: &GuestMemory,
        bridge: &Bridge,
    ) {
        let ctx = QueueCtx {
            mem,
            bridge,
            zone_id: self.zone_id,
            irq_id: self.irq_id,
        };
        let mut inner = self.inner.lock().expect("device state lock poisoned");
        mmio::mmio_write(&mut inner, &ctx, offset, size, value);
    }

    /// The back-end's poll fd, for event-monitor registration.
    pub fn poll_fd(&self) -> Option<RawFd> {
        let inner = self.inner.lock().expect("device state lock poisoned");
        inner.backend.poll_fd()
    }

    /// Run the back-end's input handler (event-monitor context).
    pub fn poll_input(&self, mem: &GuestMemory, bridge: &Bridge) {
        let ctx = QueueCtx {
            mem,
            bridge,
            zone_id: self.zone_id,
            irq_id: self.irq_id,
        };
        let mut inner = self.inner.lock().expect("device state lock poisoned");
        let DeviceInner { regs, vqs, backend } = &mut *inner;
        if let Err(e) = backend.poll_in(vqs, regs, &ctx) {
            warn!("{} device: input handling failed: {e}", self.kind);
        }
    }

    pub fn teardown(&self) {
        let mut inner = self.inner.lock().expect("device state lock poisoned");
        inner.backend.teardown();
        info!("{} device for zone {} closed", self.kind, self.zone_id);
    }

    #[cfg(test)]
    pub(crate) fn lock_inner(&self) -> std::sync::MutexGuard<'_, DeviceInner> {
        self.inner.lock().unwrap()
    }
}

/// The process-wide device table, populated before the dispatcher starts and
/// immutable afterwards.
#[derive(Default)]
pub struct DeviceTable {
    devices: Vec<Arc<VirtioDevice>>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, dev: VirtioDevice) -> Result<(), DeviceError> {
        if self.devices.len() == MAX_DEVS {
            return Err(DeviceError::TableFull);
        }
        self.devices.push(Arc::new(dev));
        Ok(())
    }

    pub fn find(&self, zone_id: u32, addr: u64) -> Option<&Arc<VirtioDevice>> {
        self.devices.iter().find(|d| d.contains(zone_id, addr))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<VirtioDevice>> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// MMIO bases in registration order, for the kernel advertisement.
    pub fn mmio_bases(&self) -> Vec<u64> {
        self.devices.iter().map(|d| d.base_addr).collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::testing::{spec, StubBackend};
    use crate::memory::NON_ROOT_PHYS_START;
    use std::num::Wrapping;

    #[test]
    fn parses_full_block_spec() {
        let spec: DeviceSpec = "blk,addr=0xa003c00,len=0x1000,irq=78,zone_id=1,img=/tmp/d.img"
            .parse()
            .unwrap();
        assert_eq!(spec.kind, DeviceKind::Block);
        assert_eq!(spec.addr, 0xa003c00);
        assert_eq!(spec.len, 0x1000);
        assert_eq!(spec.irq, 78);
        assert_eq!(spec.zone_id, 1);
        assert_eq!(spec.img.as_deref(), Some(std::path::Path::new("/tmp/d.img")));
    }

    #[test]
    fn hex_prefix_is_optional() {
        let spec: DeviceSpec = "console,addr=a0038000,len=1000,irq=76,zone_id=2"
            .parse()
            .unwrap();
        assert_eq!(spec.addr, 0xa003_8000);
        assert_eq!(spec.len, 0x1000);
    }

    #[test]
    fn rejects_unknown_kind_and_option() {
        assert_eq!(
            "disk,addr=1,len=1,irq=1,zone_id=1".parse::<DeviceSpec>(),
            Err(SpecError::UnknownKind("disk".to_string()))
        );
        assert_eq!(
            "blk,addr=1,len=1,irq=1,zone_id=1,foo=bar".parse::<DeviceSpec>(),
            Err(SpecError::UnknownOption("foo".to_string()))
        );
    }

    #[test]
    fn rejects_missing_mandatory_fields() {
        assert_eq!(
            "blk,len=1,irq=1,zone_id=1".parse::<DeviceSpec>(),
            Err(SpecError::MissingField("addr"))
        );
        assert_eq!(
            "blk,addr=1,len=1,zone_id=1".parse::<DeviceSpec>(),
            Err(SpecError::MissingField("irq"))
        );
        // explicit zeroes count as missing
        assert_eq!(
            "blk,addr=1,len=1,irq=0,zone_id=1".parse::<DeviceSpec>(),
            Err(SpecError::MissingField("irq"))
        );
    }

    #[test]
    fn rejects_cross_class_options() {
        assert_eq!(
            "net,addr=1,len=1,irq=1,zone_id=1,img=/x".parse::<DeviceSpec>(),
            Err(SpecError::OptionNotAllowed { option: "img", kind: DeviceKind::Net })
        );
        assert_eq!(
            "console,addr=1,len=1,irq=1,zone_id=1,tap=t0".parse::<DeviceSpec>(),
            Err(SpecError::OptionNotAllowed { option: "tap", kind: DeviceKind::Console })
        );
    }

    #[test]
    fn rejects_malformed_numbers() {
        assert!(matches!(
            "blk,addr=zzz,len=1,irq=1,zone_id=1".parse::<DeviceSpec>(),
            Err(SpecError::BadNumber { field: "addr", .. })
        ));
        assert!(matches!(
            "blk,addr=1,len=1,irq=ten,zone_id=1".parse::<DeviceSpec>(),
            Err(SpecError::BadNumber { field: "irq", .. })
        ));
    }

    #[test]
    fn table_routes_by_zone_and_range() {
        let mut table = DeviceTable::new();
        let mut s = spec(DeviceKind::Block);
        s.zone_id = 1;
        table
            .add(VirtioDevice::with_backend(&s, Box::new(StubBackend::new())))
            .unwrap();
        s.addr = 0xa000_1000;
        s.zone_id = 2;
        table
            .add(VirtioDevice::with_backend(&s, Box::new(StubBackend::new())))
            .unwrap();

        assert!(table.find(1, 0xa000_0000).is_some());
        assert!(table.find(1, 0xa000_0fff).is_some());
        assert!(table.find(1, 0xa000_1000).is_none()); // other zone's region
        assert!(table.find(2, 0xa000_1000).is_some());
        assert!(table.find(1, 0x9fff_ffff).is_none());
        assert_eq!(table.mmio_bases(), vec![0xa000_0000, 0xa000_1000]);
    }

    #[test]
    fn table_is_bounded() {
        let mut table = DeviceTable::new();
        for i in 0..MAX_DEVS {
            let mut s = spec(DeviceKind::Block);
            s.addr = 0xa000_0000 + (i as u64) * 0x1000;
            table
                .add(VirtioDevice::with_backend(&s, Box::new(StubBackend::new())))
                .unwrap();
        }
        let s = spec(DeviceKind::Block);
        assert!(matches!(
            table.add(VirtioDevice::with_backend(&s, Box::new(StubBackend::new()))),
            Err(DeviceError::TableFull)
        ));
    }

    #[test]
    fn deliver_irq_publishes_and_accounts() {
        let mem = GuestMemory::anon(NON_ROOT_PHYS_START, 0x10000).unwrap();
        let bridge = Bridge::for_tests();
        let ctx = QueueCtx { mem: &mem, bridge: &bridge, zone_id: 1, irq_id: 78 };

        let mut regs = VirtMmioRegs::new(VIRTIO_ID_BLOCK, COMMON_FEATURES);
        let mut vq = VirtQueue::new(0, 64);
        vq.num = 64;
        vq.ready = true;
        vq.desc_table = NON_ROOT_PHYS_START;
        vq.avail_ring = NON_ROOT_PHYS_START + 0x1000;
        vq.used_ring = NON_ROOT_PHYS_START + 0x2000;

        // nothing new: no response
        ctx.deliver_irq(&mut regs, &mut vq).unwrap();
        assert_eq!(bridge.res_rear(), 0);

        vq.push_used(&mem, 0, 1).unwrap();
        ctx.deliver_irq(&mut regs, &mut vq).unwrap();
        assert_eq!(bridge.res_rear(), 1);
        assert_eq!(bridge.res_slot(0).irq_id, 78);
        assert_eq!(bridge.res_slot(0).target_zone, 1);
        assert_eq!(regs.interrupt_status, VIRTIO_MMIO_INT_VRING);
        assert_eq!(regs.interrupt_count, 1);
        assert_eq!(vq.last_used_idx, Wrapping(1));
    }
}

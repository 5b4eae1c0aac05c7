//! Block device back-end, backed by a raw image file.
//!
//! Each request is one descriptor chain:
//!
//! 1. 16-byte header (device-readable): type, reserved, starting sector
//! 2. data buffers (readable for writes, writable for reads)
//! 3. 1-byte status (device-writable): 0=OK, 1=IOERR, 2=UNSUPP
//!
//! I/O errors never kill the daemon; they surface to the guest as the status
//! byte, with the used-ring `len` reduced to what was actually transferred.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use log::{debug, info, warn};
use vm_memory::ByteValued;

use super::mmio::VirtMmioRegs;
use super::queue::{DescChain, SgEntry, VirtQueue};
use super::{DeviceError, QueueCtx, VirtioBackend};
use crate::memory::GuestMemory;

/// Sector size fixed by the virtio-blk protocol.
const SECTOR_SIZE: u64 = 512;

// Feature bits (virtio spec 5.2.3).
const VIRTIO_BLK_F_SIZE_MAX: u64 = 1 << 1;
const VIRTIO_BLK_F_SEG_MAX: u64 = 1 << 2;
const VIRTIO_BLK_F_BLK_SIZE: u64 = 1 << 6;
const VIRTIO_BLK_F_FLUSH: u64 = 1 << 9;

// Request types.
const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_T_FLUSH: u32 = 4;
const VIRTIO_BLK_T_GET_ID: u32 = 8;

// Status codes.
const VIRTIO_BLK_S_OK: u8 = 0;
const VIRTIO_BLK_S_IOERR: u8 = 1;
const VIRTIO_BLK_S_UNSUPP: u8 = 2;

/// Largest single segment we accept.
const SIZE_MAX: u32 = 1024 * 1024;
/// Largest number of data segments per request (queue minus header/status).
const SEG_MAX: u32 = 510;

/// Serial string returned for `GET_ID`, at most 20 bytes.
const DEVICE_ID: &[u8] = b"virtiod-blk";

const QUEUE_SIZES: &[u16] = &[512];

/// Device config space (virtio spec 5.2.4), exposed from `CONFIG` upward.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct BlkConfig {
    capacity: u64,
    size_max: u32,
    seg_max: u32,
    geometry: [u8; 4],
    blk_size: u32,
}

// SAFETY: POD with no padding.
unsafe impl ByteValued for BlkConfig {}

/// Request header at the front of every chain.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct BlkReqHeader {
    req_type: u32,
    reserved: u32,
    sector: u64,
}

// SAFETY: POD with no padding.
unsafe impl ByteValued for BlkReqHeader {}

pub struct Blk {
    disk: File,
    /// Capacity in sectors.
    capacity: u64,
    config: BlkConfig,
    requests: u64,
}

impl Blk {
    /// Open a raw image read-write and size the device from it.
    pub fn open(path: &Path) -> Result<Self, DeviceError> {
        let disk = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| DeviceError::OpenImage {
                path: path.to_path_buf(),
                source,
            })?;
        let bytes = disk
            .metadata()
            .map_err(|source| DeviceError::OpenImage {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        let capacity = bytes / SECTOR_SIZE;
        info!("block image {path:?}: {capacity} sectors ({bytes} bytes)");
        Ok(Self {
            disk,
            capacity,
            config: BlkConfig {
                capacity,
                size_max: SIZE_MAX,
                seg_max: SEG_MAX,
                geometry: [0; 4],
                blk_size: SECTOR_SIZE as u32,
            },
            requests: 0,
        })
    }

    /// Process one chain; returns the used-ring `len` (bytes written to the
    /// guest, including the status byte).
    fn handle_request(&mut self, mem: &GuestMemory, chain: &DescChain) -> u32 {
        self.requests += 1;
        let sg = &chain.sg;
        if sg.len() < 2 {
            warn!("block request with only {} descriptors", sg.len());
            return 0;
        }
        let header_desc = &sg[0];
        if header_desc.write || (header_desc.len as usize) < std::mem::size_of::<BlkReqHeader>() {
            warn!("malformed block request header descriptor");
            return 0;
        }
        let header: BlkReqHeader = match mem.read_obj(header_desc.addr) {
            Ok(h) => h,
            Err(e) => {
                warn!("failed to read block request header: {e}");
                return 0;
            }
        };
        let status_desc = sg[sg.len() - 1];
        if !status_desc.write || status_desc.len < 1 {
            warn!("block status descriptor is not writable");
            return 0;
        }

        let data = &sg[1..sg.len() - 1];
        let mut written = 0u32;
        let status = match header.req_type {
            VIRTIO_BLK_T_IN => self.read_sectors(mem, header.sector, data, &mut written),
            VIRTIO_BLK_T_OUT => self.write_sectors(mem, header.sector, data),
            VIRTIO_BLK_T_FLUSH => self.flush(),
            VIRTIO_BLK_T_GET_ID => self.copy_device_id(mem, data, &mut written),
            other => {
                warn!("unsupported block request type {other}");
                VIRTIO_BLK_S_UNSUPP
            }
        };

        if let Err(e) = mem.write(status_desc.addr, &[status]) {
            warn!("failed to write block status: {e}");
            return written;
        }
        debug!(
            "block request #{}: type={} sector={} status={} len={}",
            self.requests,
            header.req_type,
            header.sector,
            status,
            written + 1
        );
        written + 1
    }

    fn in_capacity(&self, sector: u64, len: usize) -> bool {
        sector
            .checked_mul(SECTOR_SIZE)
            .and_then(|off| off.checked_add(len as u64))
            .is_some_and(|end| end <= self.capacity * SECTOR_SIZE)
    }

    fn read_sectors(
        &self,
        mem: &GuestMemory,
        mut sector: u64,
        data: &[SgEntry],
        written: &mut u32,
    ) -> u8 {
        for desc in data.iter().filter(|d| d.write) {
            let len = desc.len as usize;
            if !self.in_capacity(sector, len) {
                warn!("block read past capacity at sector {sector}");
                return VIRTIO_BLK_S_IOERR;
            }
            let mut buf = vec![0u8; len];
            if let Err(e) = self.disk.read_exact_at(&mut buf, sector * SECTOR_SIZE) {
                warn!("block read error at sector {sector}: {e}");
                return VIRTIO_BLK_S_IOERR;
            }
            if let Err(e) = mem.write(desc.addr, &buf) {
                warn!("failed to copy block data to the guest: {e}");
                return VIRTIO_BLK_S_IOERR;
            }
            *written += desc.len;
            sector += len as u64 / SECTOR_SIZE;
        }
        VIRTIO_BLK_S_OK
    }

    fn write_sectors(&self, mem: &GuestMemory, mut sector: u64, data: &[SgEntry]) -> u8 {
        for desc in data.iter().filter(|d| !d.write) {
            let len = desc.len as usize;
            if !self.in_capacity(sector, len) {
                warn!("block write past capacity at sector {sector}");
                return VIRTIO_BLK_S_IOERR;
            }
            let mut buf = vec![0u8; len];
            if let Err(e) = mem.read(desc.addr, &mut buf) {
                warn!("failed to copy block data from the guest: {e}");
                return VIRTIO_BLK_S_IOERR;
            }
            if let Err(e) = self.disk.write_all_at(&buf, sector * SECTOR_SIZE) {
                warn!("block write error at sector {sector}: {e}");
                return VIRTIO_BLK_S_IOERR;
            }
            sector += len as u64 / SECTOR_SIZE;
        }
        VIRTIO_BLK_S_OK
    }

    fn flush(&self) -> u8 {
        match self.disk.sync_all() {
            Ok(()) => VIRTIO_BLK_S_OK,
            Err(e) => {
                warn!("block flush error: {e}");
                VIRTIO_BLK_S_IOERR
            }
        }
    }

    fn copy_device_id(&self, mem: &GuestMemory, data: &[SgEntry], written: &mut u32) -> u8 {
        let Some(desc) = data.iter().find(|d| d.write) else {
            return VIRTIO_BLK_S_IOERR;
        };
        let mut id = [0u8; 20];
        id[..DEVICE_ID.len()].copy_from_slice(DEVICE_ID);
        let n = (desc.len as usize).min(id.len());
        if mem.write(desc.addr, &id[..n]).is_err() {
            return VIRTIO_BLK_S_IOERR;
        }
        *written += n as u32;
        VIRTIO_BLK_S_OK
    }
}

impl VirtioBackend for Blk {
    fn device_features(&self) -> u64 {
        VIRTIO_BLK_F_SIZE_MAX | VIRTIO_BLK_F_SEG_MAX | VIRTIO_BLK_F_BLK_SIZE | VIRTIO_BLK_F_FLUSH
    }

    fn queue_sizes(&self) -> &'static [u16] {
        QUEUE_SIZES
    }

    fn config(&self) -> &[u8] {
        self.config.as_slice()
    }

    fn notify(
        &mut self,
        q: u16,
        vqs: &mut [VirtQueue],
        regs: &mut VirtMmioRegs,
        ctx: &QueueCtx<'_>,
    ) -> Result<(), DeviceError> {
        if q != 0 {
            warn!("block notify for unexpected queue {q}");
            return Ok(());
        }
        let vq = &mut vqs[0];
        loop {
            vq.suppress_notify(ctx.mem)?;
            while let Some(chain) = vq.pop_chain(ctx.mem, 0)? {
                let len = self.handle_request(ctx.mem, &chain);
                vq.push_used(ctx.mem, chain.head, len)?;
            }
            vq.restore_notify(ctx.mem)?;
            // a request may have slipped in between the final pop and the
            // notification re-enable
            if !vq.pending(ctx.mem)? {
                break;
            }
        }
        ctx.deliver_irq(regs, vq)?;
        Ok(())
    }

    fn teardown(&mut self) {
        if let Err(e) = self.disk.sync_all() {
            warn!("block image sync at shutdown failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Bridge;
    use crate::devices::mmio::COMMON_FEATURES;
    use crate::devices::queue::{Descriptor, UsedElem, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};
    use crate::devices::VIRTIO_ID_BLOCK;
    use crate::memory::NON_ROOT_PHYS_START;
    use std::io::Write;

    const BASE: u64 = NON_ROOT_PHYS_START;
    const DESC: u64 = BASE + 0x1000;
    const AVAIL: u64 = BASE + 0x2000;
    const USED: u64 = BASE + 0x3000;
    const HDR: u64 = BASE + 0x8000;
    const DATA: u64 = BASE + 0x9000;
    const STATUS: u64 = BASE + 0xf000;

    struct Fixture {
        mem: GuestMemory,
        bridge: Bridge,
        vqs: Vec<VirtQueue>,
        regs: VirtMmioRegs,
        blk: Blk,
        _img: tempfile::NamedTempFile,
    }

    fn fixture(img_len: usize) -> Fixture {
        let mem = GuestMemory::anon(BASE, 0x10_0000).unwrap();
        let mut img = tempfile::NamedTempFile::new().unwrap();
        let content: Vec<u8> = (0..img_len).map(|i| (i % 251) as u8).collect();
        img.write_all(&content).unwrap();
        img.flush().unwrap();
        let blk = Blk::open(img.path()).unwrap();

        let mut vq = VirtQueue::new(0, 512);
        vq.num = 64;
        vq.ready = true;
        vq.desc_table = DESC;
        vq.avail_ring = AVAIL;
        vq.used_ring = USED;

        Fixture {
            mem,
            bridge: Bridge::for_tests(),
            vqs: vec![vq],
            regs: VirtMmioRegs::new(VIRTIO_ID_BLOCK, COMMON_FEATURES),
            blk,
            _img: img,
        }
    }

    impl Fixture {
        fn put_desc(&self, i: u16, addr: u64, len: u32, flags: u16, next: u16) {
            self.mem
                .write_obj(DESC + 16 * u64::from(i), Descriptor { addr, len, flags, next })
                .unwrap();
        }

        fn publish(&self, heads: &[u16]) {
            for (i, head) in heads.iter().enumerate() {
                self.mem.write_obj(AVAIL + 4 + 2 * i as u64, *head).unwrap();
            }
            self.mem
                .write_obj::<u16>(AVAIL + 2, heads.len() as u16)
                .unwrap();
        }

        fn header(&self, req_type: u32, sector: u64) {
            self.mem
                .write_obj(HDR, BlkReqHeader { req_type, reserved: 0, sector })
                .unwrap();
        }

        fn kick(&mut self) {
            let ctx = QueueCtx {
                mem: &self.mem,
                bridge: &self.bridge,
                zone_id: 1,
                irq_id: 78,
            };
            self.blk
                .notify(0, &mut self.vqs, &mut self.regs, &ctx)
                .unwrap();
        }

        fn used(&self, slot: u64) -> UsedElem {
            self.mem.read_obj(USED + 4 + 8 * slot).unwrap()
        }

        fn used_idx(&self) -> u16 {
            self.mem.read_obj(USED + 2).unwrap()
        }

        fn status(&self) -> u8 {
            let mut b = [0u8; 1];
            self.mem.read(STATUS, &mut b).unwrap();
            b[0]
        }
    }

    fn three_desc_chain(f: &Fixture, data_len: u32, data_writable: bool) {
        let mut data_flags = VIRTQ_DESC_F_NEXT;
        if data_writable {
            data_flags |= VIRTQ_DESC_F_WRITE;
        }
        f.put_desc(0, HDR, 16, VIRTQ_DESC_F_NEXT, 1);
        f.put_desc(1, DATA, data_len, data_flags, 2);
        f.put_desc(2, STATUS, 1, VIRTQ_DESC_F_WRITE, 0);
        f.publish(&[0]);
    }

    #[test]
    fn empty_queue_kick_is_a_no_op() {
        let mut f = fixture(0x4000);
        f.kick();
        assert_eq!(f.used_idx(), 0);
        assert_eq!(f.bridge.res_rear(), 0);
    }

    #[test]
    fn read_request_fills_guest_buffer() {
        let mut f = fixture(0x4000);
        f.header(VIRTIO_BLK_T_IN, 0);
        three_desc_chain(&f, 4096, true);
        f.kick();

        assert_eq!(f.used_idx(), 1);
        let elem = f.used(0);
        assert_eq!(elem.id, 0);
        assert_eq!(elem.len, 4097);
        assert_eq!(f.status(), VIRTIO_BLK_S_OK);

        let mut buf = vec![0u8; 4096];
        f.mem.read(DATA, &mut buf).unwrap();
        let expect: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
        assert_eq!(buf, expect);

        // one interrupt for the device's irq line
        assert_eq!(f.bridge.res_rear(), 1);
        assert_eq!(f.bridge.res_slot(0).irq_id, 78);
        assert_eq!(f.regs.interrupt_count, 1);
    }

    #[test]
    fn read_at_an_offset_sector() {
        let mut f = fixture(0x4000);
        f.header(VIRTIO_BLK_T_IN, 2);
        three_desc_chain(&f, 512, true);
        f.kick();

        let mut buf = vec![0u8; 512];
        f.mem.read(DATA, &mut buf).unwrap();
        let expect: Vec<u8> = (1024..1536).map(|i| (i % 251) as u8).collect();
        assert_eq!(buf, expect);
    }

    #[test]
    fn write_request_reaches_the_image() {
        let mut f = fixture(0x4000);
        f.mem.write(DATA, &[0xaa; 512]).unwrap();
        f.header(VIRTIO_BLK_T_OUT, 1);
        three_desc_chain(&f, 512, false);
        f.kick();

        assert_eq!(f.status(), VIRTIO_BLK_S_OK);
        // status byte only
        assert_eq!(f.used(0).len, 1);
        let mut on_disk = vec![0u8; 512];
        f.blk.disk.read_exact_at(&mut on_disk, 512).unwrap();
        assert_eq!(on_disk, vec![0xaa; 512]);
    }

    #[test]
    fn out_of_range_sector_is_an_io_error() {
        let mut f = fixture(0x1000); // 8 sectors
        f.header(VIRTIO_BLK_T_IN, 7);
        three_desc_chain(&f, 1024, true);
        f.kick();
        assert_eq!(f.status(), VIRTIO_BLK_S_IOERR);
        assert_eq!(f.used(0).len, 1);
    }

    #[test]
    fn unsupported_type_reports_unsupp() {
        let mut f = fixture(0x1000);
        f.header(0x77, 0);
        three_desc_chain(&f, 512, true);
        f.kick();
        assert_eq!(f.status(), VIRTIO_BLK_S_UNSUPP);
    }

    #[test]
    fn flush_succeeds() {
        let mut f = fixture(0x1000);
        f.header(VIRTIO_BLK_T_FLUSH, 0);
        f.put_desc(0, HDR, 16, VIRTQ_DESC_F_NEXT, 1);
        f.put_desc(1, STATUS, 1, VIRTQ_DESC_F_WRITE, 0);
        f.publish(&[0]);
        f.kick();
        assert_eq!(f.status(), VIRTIO_BLK_S_OK);
        assert_eq!(f.used(0).len, 1);
    }

    #[test]
    fn get_id_returns_the_serial() {
        let mut f = fixture(0x1000);
        f.header(VIRTIO_BLK_T_GET_ID, 0);
        three_desc_chain(&f, 20, true);
        f.kick();
        assert_eq!(f.status(), VIRTIO_BLK_S_OK);
        assert_eq!(f.used(0).len, 21);
        let mut buf = vec![0u8; 20];
        f.mem.read(DATA, &mut buf).unwrap();
        assert!(buf.starts_with(DEVICE_ID));
    }

    #[test]
    fn short_chain_completes_with_zero_len() {
        let mut f = fixture(0x1000);
        f.put_desc(0, HDR, 16, 0, 0);
        f.publish(&[0]);
        f.kick();
        assert_eq!(f.used_idx(), 1);
        assert_eq!(f.used(0).len, 0);
    }

    #[test]
    fn two_requests_in_one_kick() {
        let mut f = fixture(0x4000);
        f.header(VIRTIO_BLK_T_IN, 0);
        three_desc_chain(&f, 512, true);
        // second chain at descriptors 3..=5
        f.mem
            .write_obj(HDR + 0x100, BlkReqHeader { req_type: VIRTIO_BLK_T_IN, reserved: 0, sector: 1 })
            .unwrap();
        f.put_desc(3, HDR + 0x100, 16, VIRTQ_DESC_F_NEXT, 4);
        f.put_desc(4, DATA + 0x1000, 512, VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE, 5);
        f.put_desc(5, STATUS + 1, 1, VIRTQ_DESC_F_WRITE, 0);
        f.publish(&[0, 3]);

        f.kick();
        assert_eq!(f.used_idx(), 2);
        assert_eq!(f.used(0).id, 0);
        assert_eq!(f.used(1).id, 3);
        // both completions collapse into a single interrupt decision
        assert_eq!(f.bridge.res_rear(), 1);
    }
}

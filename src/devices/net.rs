//! Network back-end over a host tap interface.
//!
//! Queue 0 receives (tap → guest), queue 1 transmits (guest → tap). Every
//! frame on the wire is preceded in the chain by a 12-byte virtio-net header;
//! we run with no offloads, so the header is zeroed on receive and skipped on
//! transmit.
//!
//! The tap fd is non-blocking and registered with the event monitor. Frames
//! that arrive before the driver has primed the receive queue are read and
//! dropped, which also keeps the level-triggered monitor from spinning.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;

use log::{debug, info, trace, warn};
use vm_memory::ByteValued;

use super::mmio::VirtMmioRegs;
use super::queue::VirtQueue;
use super::{DeviceError, QueueCtx, VirtioBackend};

const TUN_PATH: &str = "/dev/net/tun";

const QUEUE_RX: u16 = 0;
const QUEUE_TX: u16 = 1;
const QUEUE_SIZES: &[u16] = &[256, 256];

// Feature bits (virtio spec 5.1.3).
const VIRTIO_NET_F_MAC: u64 = 1 << 5;
const VIRTIO_NET_F_STATUS: u64 = 1 << 16;

const VIRTIO_NET_S_LINK_UP: u16 = 1;

/// Fixed MAC handed to the guest; a deployment knob in the making.
const DEFAULT_MAC: [u8; 6] = [0x00, 0x16, 0x3e, 0x10, 0x10, 0x10];

/// Enough for a max-size ethernet frame without offloads.
const FRAME_BUF: usize = 65536;

/// Device config space (virtio spec 5.1.4).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct NetConfig {
    mac: [u8; 6],
    status: u16,
    max_virtqueue_pairs: u16,
    mtu: u16,
}

// SAFETY: POD with no padding.
unsafe impl ByteValued for NetConfig {}

/// The virtio-net header preceding every frame (modern layout, 12 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct NetHdr {
    flags: u8,
    gso_type: u8,
    hdr_len: u16,
    gso_size: u16,
    csum_start: u16,
    csum_offset: u16,
    num_buffers: u16,
}

// SAFETY: POD with no padding.
unsafe impl ByteValued for NetHdr {}

const NET_HDR_LEN: usize = std::mem::size_of::<NetHdr>();

mod tun_ioctl {
    nix::ioctl_write_ptr_bad!(tun_set_iff, libc::TUNSETIFF, libc::ifreq);
}

pub struct Net {
    tap: File,
    config: NetConfig,
    /// The driver has kicked the receive queue at least once.
    rx_ready: bool,
}

impl Net {
    /// Attach to an existing tap interface by name.
    pub fn open(name: &str) -> Result<Self, DeviceError> {
        let open_err = |source| DeviceError::OpenTap {
            name: name.to_string(),
            source,
        };

        let tap = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(TUN_PATH)
            .map_err(open_err)?;

        // SAFETY: zeroed ifreq is a valid request template.
        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        if name.len() >= ifr.ifr_name.len() {
            return Err(open_err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "interface name too long",
            )));
        }
        for (dst, src) in ifr.ifr_name.iter_mut().zip(name.bytes()) {
            *dst = src as libc::c_char;
        }
        ifr.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short;

        // SAFETY: fd is the open tun device and ifr is a valid ifreq.
        unsafe { tun_ioctl::tun_set_iff(tap.as_raw_fd(), &ifr) }
            .map_err(|e| open_err(std::io::Error::from(e)))?;

        info!("tap {name} attached");
        Ok(Self {
            tap,
            config: NetConfig {
                mac: DEFAULT_MAC,
                status: VIRTIO_NET_S_LINK_UP,
                max_virtqueue_pairs: 1,
                mtu: 1500,
            },
            rx_ready: false,
        })
    }

    /// Guest → tap: flush every pending transmit chain.
    fn drain_tx(&mut self, vq: &mut VirtQueue, ctx: &QueueCtx<'_>) -> Result<(), DeviceError> {
        loop {
            vq.suppress_notify(ctx.mem)?;
            while let Some(chain) = vq.pop_chain(ctx.mem, 0)? {
                let frame = chain.read_payload(ctx.mem, NET_HDR_LEN)?;
                if frame.is_empty() {
                    warn!("transmit chain without a frame");
                } else {
                    match (&self.tap).write(&frame) {
                        Ok(n) if n < frame.len() => warn!("partial frame write to tap"),
                        Ok(_) => trace!("sent {}-byte frame", frame.len()),
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            debug!("tap backpressure, {}-byte frame dropped", frame.len());
                        }
                        Err(e) => warn!("tap write error: {e}"),
                    }
                }
                vq.push_used(ctx.mem, chain.head, 0)?;
            }
            vq.restore_notify(ctx.mem)?;
            if !vq.pending(ctx.mem)? {
                break;
            }
        }
        Ok(())
    }

    /// Tap → guest: deliver frames into receive buffers. Returns whether any
    /// completion was published.
    fn drain_rx(&mut self, vq: &mut VirtQueue, ctx: &QueueCtx<'_>) -> Result<bool, DeviceError> {
        let mut published = false;
        let mut frame = vec![0u8; FRAME_BUF];
        loop {
            let n = match (&self.tap).read(&mut frame) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("tap read error: {e}");
                    break;
                }
            };
            if !self.rx_ready || !vq.ready {
                trace!("dropping {n}-byte frame, receive queue not primed");
                continue;
            }
            let Some(chain) = vq.pop_chain(ctx.mem, 0)? else {
                debug!("no receive buffers, dropping {n}-byte frame");
                continue;
            };
            let hdr = NetHdr {
                num_buffers: 1,
                ..Default::default()
            };
            let mut payload = Vec::with_capacity(NET_HDR_LEN + n);
            payload.extend_from_slice(hdr.as_slice());
            payload.extend_from_slice(&frame[..n]);
            let written = chain.write_payload(ctx.mem, &payload)?;
            if (written as usize) < payload.len() {
                warn!("receive buffers too small, frame truncated");
            }
            vq.push_used(ctx.mem, chain.head, written)?;
            published = true;
        }
        Ok(published)
    }
}

impl VirtioBackend for Net {
    fn device_features(&self) -> u64 {
        VIRTIO_NET_F_MAC | VIRTIO_NET_F_STATUS
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
        match q {
            QUEUE_RX => {
                self.rx_ready = true;
                let vq = &mut vqs[QUEUE_RX as usize];
                if self.drain_rx(vq, ctx)? {
                    ctx.deliver_irq(regs, vq)?;
                }
            }
            QUEUE_TX => {
                let vq = &mut vqs[QUEUE_TX as usize];
                self.drain_tx(vq, ctx)?;
                ctx.deliver_irq(regs, vq)?;
            }
            other => warn!("net notify for unexpected queue {other}"),
        }
        Ok(())
    }

    fn poll_fd(&self) -> Option<RawFd> {
        Some(self.tap.as_raw_fd())
    }

    fn poll_in(
        &mut self,
        vqs: &mut [VirtQueue],
        regs: &mut VirtMmioRegs,
        ctx: &QueueCtx<'_>,
    ) -> Result<(), DeviceError> {
        let vq = &mut vqs[QUEUE_RX as usize];
        if self.drain_rx(vq, ctx)? {
            ctx.deliver_irq(regs, vq)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Bridge;
    use crate::devices::mmio::COMMON_FEATURES;
    use crate::devices::queue::{Descriptor, UsedElem, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};
    use crate::devices::VIRTIO_ID_NET;
    use crate::memory::{GuestMemory, NON_ROOT_PHYS_START};
    use std::io::Seek;
    use std::os::unix::fs::FileExt;

    const BASE: u64 = NON_ROOT_PHYS_START;
    const DESC: u64 = BASE + 0x1000;
    const AVAIL: u64 = BASE + 0x2000;
    const USED: u64 = BASE + 0x3000;
    const DATA: u64 = BASE + 0x20000;

    /// A Net instance whose "tap" is a plain temp file, enough to exercise
    /// the queue plumbing.
    fn file_net() -> (Net, File) {
        let tmp = tempfile::tempfile().unwrap();
        let tap = tmp.try_clone().unwrap();
        (
            Net {
                tap,
                config: NetConfig::default(),
                rx_ready: false,
            },
            tmp,
        )
    }

    fn queue_pair() -> Vec<VirtQueue> {
        let mut vqs: Vec<VirtQueue> = (0..2).map(|i| VirtQueue::new(i, 256)).collect();
        for vq in &mut vqs {
            vq.num = 16;
            vq.ready = true;
            // give each queue its own stretch of guest memory
            let off = 0x6000 * u64::from(vq.vq_idx);
            vq.desc_table = DESC + off;
            vq.avail_ring = AVAIL + off;
            vq.used_ring = USED + off;
        }
        vqs
    }

    fn publish(mem: &GuestMemory, vq: &VirtQueue, heads: &[u16]) {
        for (i, head) in heads.iter().enumerate() {
            mem.write_obj(vq.avail_ring + 4 + 2 * i as u64, *head).unwrap();
        }
        mem.write_obj::<u16>(vq.avail_ring + 2, heads.len() as u16).unwrap();
    }

    #[test]
    fn header_and_config_layouts() {
        assert_eq!(NET_HDR_LEN, 12);
        assert_eq!(std::mem::size_of::<NetConfig>(), 12);
    }

    #[test]
    fn transmit_skips_the_header() {
        let mem = GuestMemory::anon(BASE, 0x10_0000).unwrap();
        let bridge = Bridge::for_tests();
        let (mut net, mut file) = file_net();
        let mut vqs = queue_pair();
        let mut regs = VirtMmioRegs::new(VIRTIO_ID_NET, COMMON_FEATURES);

        // chain: [12-byte header + frame] all readable
        let mut buf = vec![0u8; NET_HDR_LEN];
        buf.extend_from_slice(b"ethernet-frame");
        mem.write(DATA, &buf).unwrap();
        let tx = &vqs[1];
        mem.write_obj(
            tx.desc_table,
            Descriptor { addr: DATA, len: buf.len() as u32, flags: 0, next: 0 },
        )
        .unwrap();
        publish(&mem, tx, &[0]);

        let ctx = QueueCtx { mem: &mem, bridge: &bridge, zone_id: 1, irq_id: 75 };
        net.notify(QUEUE_TX, &mut vqs, &mut regs, &ctx).unwrap();

        let mut written = Vec::new();
        file.rewind().unwrap();
        file.read_to_end(&mut written).unwrap();
        assert_eq!(written, b"ethernet-frame");

        let elem: UsedElem = mem.read_obj(vqs[1].used_ring + 4).unwrap();
        assert_eq!(elem.id, 0);
        assert_eq!(elem.len, 0);
        assert_eq!(bridge.res_rear(), 1);
    }

    #[test]
    fn receive_prepends_the_header() {
        let mem = GuestMemory::anon(BASE, 0x10_0000).unwrap();
        let bridge = Bridge::for_tests();
        let (mut net, file) = file_net();
        // the "wire" holds one incoming frame
        file.write_all_at(b"incoming", 0).unwrap();
        net.rx_ready = true;

        let mut vqs = queue_pair();
        let mut regs = VirtMmioRegs::new(VIRTIO_ID_NET, COMMON_FEATURES);

        let rx_data = DATA + 0x4000;
        let rx = &vqs[0];
        mem.write_obj(
            rx.desc_table,
            Descriptor { addr: rx_data, len: 256, flags: VIRTQ_DESC_F_WRITE, next: 0 },
        )
        .unwrap();
        publish(&mem, rx, &[0]);

        let ctx = QueueCtx { mem: &mem, bridge: &bridge, zone_id: 1, irq_id: 75 };
        net.poll_in(&mut vqs, &mut regs, &ctx).unwrap();

        let elem: UsedElem = mem.read_obj(vqs[0].used_ring + 4).unwrap();
        assert_eq!(elem.len as usize, NET_HDR_LEN + 8);

        let hdr: NetHdr = mem.read_obj(rx_data).unwrap();
        assert_eq!(hdr.num_buffers, 1);
        assert_eq!(hdr.flags, 0);
        let mut frame = [0u8; 8];
        mem.read(rx_data + NET_HDR_LEN as u64, &mut frame).unwrap();
        assert_eq!(&frame, b"incoming");
        assert_eq!(bridge.res_rear(), 1);
    }

    #[test]
    fn frames_are_dropped_until_rx_is_primed() {
        let mem = GuestMemory::anon(BASE, 0x10_0000).unwrap();
        let bridge = Bridge::for_tests();
        let (mut net, file) = file_net();
        file.write_all_at(b"early-frame", 0).unwrap();

        let mut vqs = queue_pair();
        let mut regs = VirtMmioRegs::new(VIRTIO_ID_NET, COMMON_FEATURES);
        let ctx = QueueCtx { mem: &mem, bridge: &bridge, zone_id: 1, irq_id: 75 };
        net.poll_in(&mut vqs, &mut regs, &ctx).unwrap();

        // nothing published, no interrupt
        assert_eq!(mem.read_obj::<u16>(vqs[0].used_ring + 2).unwrap(), 0);
        assert_eq!(bridge.res_rear(), 0);
    }

    #[test]
    fn multi_descriptor_chain_is_gathered_for_tx() {
        let mem = GuestMemory::anon(BASE, 0x10_0000).unwrap();
        let bridge = Bridge::for_tests();
        let (mut net, mut file) = file_net();
        let mut vqs = queue_pair();
        let mut regs = VirtMmioRegs::new(VIRTIO_ID_NET, COMMON_FEATURES);

        // header in its own descriptor, frame split across two more
        let hdr = NetHdr::default();
        mem.write(DATA, hdr.as_slice()).unwrap();
        mem.write(DATA + 0x100, b"abc").unwrap();
        mem.write(DATA + 0x200, b"defg").unwrap();
        let tx_desc = vqs[1].desc_table;
        mem.write_obj(tx_desc, Descriptor { addr: DATA, len: 12, flags: VIRTQ_DESC_F_NEXT, next: 1 }).unwrap();
        mem.write_obj(tx_desc + 16, Descriptor { addr: DATA + 0x100, len: 3, flags: VIRTQ_DESC_F_NEXT, next: 2 }).unwrap();
        mem.write_obj(tx_desc + 32, Descriptor { addr: DATA + 0x200, len: 4, flags: 0, next: 0 }).unwrap();
        publish(&mem, &vqs[1], &[0]);

        let ctx = QueueCtx { mem: &mem, bridge: &bridge, zone_id: 1, irq_id: 75 };
        net.notify(QUEUE_TX, &mut vqs, &mut regs, &ctx).unwrap();

        let mut written = Vec::new();
        file.rewind().unwrap();
        file.read_to_end(&mut written).unwrap();
        assert_eq!(written, b"abcdefg");
    }
}

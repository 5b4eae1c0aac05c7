//! Console back-end over a pseudo-terminal.
//!
//! The daemon allocates a pty pair per console device and logs the slave
//! path so an operator can attach a terminal to the zone. Queue 0 carries
//! host → guest bytes, queue 1 guest → host.
//!
//! Bytes arriving on the master before the driver has kicked the receive
//! queue once are discarded; the guest is not booted yet and there is nowhere
//! to put them.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use log::{debug, info, trace, warn};
use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use vm_memory::ByteValued;

use super::mmio::VirtMmioRegs;
use super::queue::VirtQueue;
use super::{DeviceError, QueueCtx, VirtioBackend};

const QUEUE_RX: u16 = 0;
const QUEUE_TX: u16 = 1;
const QUEUE_SIZES: &[u16] = &[64, 64];

/// `VIRTIO_CONSOLE_F_SIZE`: the config space carries a terminal geometry.
const VIRTIO_CONSOLE_F_SIZE: u64 = 1 << 0;

/// Device config space (virtio spec 5.3.4).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct ConsoleConfig {
    cols: u16,
    rows: u16,
    max_nr_ports: u32,
    emerg_wr: u32,
}

// SAFETY: POD with no padding.
unsafe impl ByteValued for ConsoleConfig {}

pub struct Console {
    master: File,
    config: ConsoleConfig,
    /// The driver has kicked the receive queue at least once.
    rx_ready: bool,
}

impl Console {
    /// Allocate the pty pair and publish the slave path to the operator.
    pub fn open() -> Result<Self, DeviceError> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK)
            .map_err(DeviceError::OpenPty)?;
        grantpt(&master).map_err(DeviceError::OpenPty)?;
        unlockpt(&master).map_err(DeviceError::OpenPty)?;
        let slave = ptsname_r(&master).map_err(DeviceError::OpenPty)?;
        info!("console attached, connect to {slave}");

        // SAFETY: we take sole ownership of the pty master fd.
        let master = unsafe { File::from_raw_fd(master.into_raw_fd()) };
        Ok(Self {
            master,
            config: ConsoleConfig {
                cols: 80,
                rows: 25,
                max_nr_ports: 1,
                emerg_wr: 0,
            },
            rx_ready: false,
        })
    }

    /// Guest → host: copy transmit chains out to the master side.
    fn drain_tx(&mut self, vq: &mut VirtQueue, ctx: &QueueCtx<'_>) -> Result<(), DeviceError> {
        loop {
            vq.suppress_notify(ctx.mem)?;
            while let Some(chain) = vq.pop_chain(ctx.mem, 0)? {
                let bytes = chain.read_payload(ctx.mem, 0)?;
                match (&self.master).write(&bytes) {
                    Ok(n) if n < bytes.len() => debug!("console output truncated, pty full"),
                    Ok(_) => trace!("console: {} bytes out", bytes.len()),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        debug!("console output dropped, no reader on the pty");
                    }
                    Err(e) => warn!("console write error: {e}"),
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

    /// Host → guest: feed master-side input into receive buffers. Returns
    /// whether any completion was published.
    fn drain_rx(&mut self, vq: &mut VirtQueue, ctx: &QueueCtx<'_>) -> Result<bool, DeviceError> {
        let mut published = false;
        let mut buf = [0u8; 4096];
        loop {
            let n = match (&self.master).read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("console read error: {e}");
                    break;
                }
            };
            if !self.rx_ready || !vq.ready {
                trace!("console input dropped, receive queue not primed");
                continue;
            }
            let Some(chain) = vq.pop_chain(ctx.mem, 0)? else {
                debug!("console input dropped, no receive buffers");
                continue;
            };
            let written = chain.write_payload(ctx.mem, &buf[..n])?;
            vq.push_used(ctx.mem, chain.head, written)?;
            published = true;
        }
        Ok(published)
    }
}

impl VirtioBackend for Console {
    fn device_features(&self) -> u64 {
        VIRTIO_CONSOLE_F_SIZE
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
            other => warn!("console notify for unexpected queue {other}"),
        }
        Ok(())
    }

    fn poll_fd(&self) -> Option<RawFd> {
        Some(self.master.as_raw_fd())
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

//! Event monitor for back-ends with asynchronous host-side input.
//!
//! One epoll thread watches the poll fds the back-ends expose (tap, pty
//! master). A readable fd locks the owning device and runs its input handler,
//! which fills receive buffers and injects interrupts through the same path
//! the dispatcher uses. A self-pipe wakes the thread for shutdown; teardown
//! signals it and joins before any back-end releases its fd.

use std::fs::File;
use std::io::Write;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, error, warn};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use thiserror::Error;

use crate::bridge::Bridge;
use crate::devices::VirtioDevice;
use crate::memory::GuestMemory;

/// Token reserved for the shutdown pipe.
const STOP_TOKEN: u64 = u64::MAX;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("failed to create the event poller: {0}")]
    Epoll(#[source] nix::Error),

    #[error("failed to create the shutdown pipe: {0}")]
    Pipe(#[source] nix::Error),

    #[error("failed to spawn the event monitor thread: {0}")]
    Spawn(#[source] std::io::Error),
}

pub struct EventMonitor {
    stop_tx: File,
    handle: Option<JoinHandle<()>>,
}

impl EventMonitor {
    /// Register every device that exposes a poll fd and start the thread.
    pub fn spawn(
        devices: Vec<Arc<VirtioDevice>>,
        mem: Arc<GuestMemory>,
        bridge: Arc<Bridge>,
    ) -> Result<Self, EventError> {
        let (stop_rx, stop_tx) = nix::unistd::pipe().map_err(EventError::Pipe)?;
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(EventError::Epoll)?;
        epoll
            .add(&stop_rx, EpollEvent::new(EpollFlags::EPOLLIN, STOP_TOKEN))
            .map_err(EventError::Epoll)?;

        let mut watched = Vec::new();
        for dev in devices {
            let Some(fd) = dev.poll_fd() else { continue };
            let token = watched.len() as u64;
            // SAFETY: the fd is owned by the device back-end, which outlives
            // this thread (shutdown joins the monitor before teardown runs).
            epoll
                .add(
                    unsafe { BorrowedFd::borrow_raw(fd) },
                    EpollEvent::new(EpollFlags::EPOLLIN, token),
                )
                .map_err(EventError::Epoll)?;
            debug!("monitoring {} device input on fd {fd}", dev.kind);
            watched.push(dev);
        }

        let handle = std::thread::Builder::new()
            .name("virtiod-events".into())
            .spawn(move || {
                // keep the read end alive for the lifetime of the thread
                let _stop_rx = stop_rx;
                let mut events = [EpollEvent::empty(); 16];
                loop {
                    let n = match epoll.wait(&mut events, EpollTimeout::NONE) {
                        Ok(n) => n,
                        Err(nix::errno::Errno::EINTR) => continue,
                        Err(e) => {
                            error!("event monitor wait failed: {e}");
                            return;
                        }
                    };
                    for ev in &events[..n] {
                        let token = ev.data();
                        if token == STOP_TOKEN {
                            debug!("event monitor stopping");
                            return;
                        }
                        if let Some(dev) = watched.get(token as usize) {
                            dev.poll_input(&mem, &bridge);
                        }
                    }
                }
            })
            .map_err(EventError::Spawn)?;

        Ok(Self {
            stop_tx: File::from(stop_tx),
            handle: Some(handle),
        })
    }

    /// Wake the thread and wait for it to exit.
    pub fn shutdown(mut self) {
        if let Err(e) = self.stop_tx.write_all(&[1]) {
            warn!("failed to signal the event monitor: {e}");
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("event monitor thread panicked");
            }
        }
    }
}

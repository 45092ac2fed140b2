//! Virtual Interface
//!
//! Wraps the OS-provided TUN-style descriptor: raw IP packets are read
//! from it (outbound traffic) and written to it (inbound traffic).
//!
//! The OS side of establishing the interface (permission consent,
//! address/route/DNS programming) belongs to an [`InterfaceBuilder`];
//! this module only needs it to say "here is a descriptor" or "no".

use crate::config::InterfaceSpec;
use crate::packet::Packet;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};

/// Largest packet a single interface read can return
pub const READ_BUFFER_LEN: usize = 32767;

/// A live virtual interface.
///
/// `read_packet` and `write_packet` are called from different threads at
/// the same time; `close` may race with both.
pub trait VirtualInterface: Send + Sync {
    /// Read one packet.
    ///
    /// Blocks until data arrives or the probe interval elapses. A
    /// zero-length packet is a liveness probe, never a terminal result.
    /// Returns [`InterfaceError::Closed`] once the interface is closed.
    fn read_packet(&self) -> Result<Packet, InterfaceError>;

    /// Write one packet.
    fn write_packet(&self, packet: &Packet) -> Result<(), InterfaceError>;

    /// Release the descriptor. Calling it again is a no-op.
    fn close(&self);

    /// Whether `close` has been called
    fn is_closed(&self) -> bool;

    /// The layout this interface was established with
    fn spec(&self) -> &InterfaceSpec;
}

/// The OS collaborator that establishes the interface
pub trait InterfaceBuilder: Send + Sync {
    /// Establish an interface for `spec`.
    ///
    /// Fails with [`InterfaceError::Unavailable`] when the OS declines.
    fn establish(&self, spec: &InterfaceSpec) -> Result<Arc<dyn VirtualInterface>, InterfaceError>;
}

/// Interface backed by a platform descriptor
pub struct FdInterface {
    spec: InterfaceSpec,
    /// Readers and writers hold their own clone, so the descriptor number
    /// is never reused while a call is in flight.
    file: RwLock<Option<Arc<File>>>,
    closed: AtomicBool,
    read_probe: Duration,
}

impl FdInterface {
    /// Wrap an established descriptor
    pub fn new(fd: OwnedFd, spec: InterfaceSpec, read_probe: Duration) -> Self {
        Self {
            spec,
            file: RwLock::new(Some(Arc::new(File::from(fd)))),
            closed: AtomicBool::new(false),
            read_probe,
        }
    }

    fn current(&self) -> Result<Arc<File>, InterfaceError> {
        self.file
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(InterfaceError::Closed)
    }

    fn probe_timeout(&self) -> PollTimeout {
        let ms = self.read_probe.as_millis().clamp(1, u128::from(u16::MAX)) as u16;
        PollTimeout::from(ms)
    }
}

impl VirtualInterface for FdInterface {
    fn read_packet(&self) -> Result<Packet, InterfaceError> {
        let file = self.current()?;

        let (ready, revents) = {
            let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
            let ready = poll(&mut fds, self.probe_timeout());
            (ready, fds[0].revents().unwrap_or(PollFlags::empty()))
        };
        match ready {
            Ok(0) | Err(Errno::EINTR) => return Ok(Packet::empty()),
            Ok(_) => {}
            Err(errno) => return Err(InterfaceError::Io(errno.into())),
        }

        if revents.contains(PollFlags::POLLNVAL) {
            return Err(InterfaceError::Closed);
        }
        if revents.contains(PollFlags::POLLERR) {
            return Err(InterfaceError::Io(io::Error::other("descriptor reported POLLERR")));
        }
        if revents.contains(PollFlags::POLLHUP) && !revents.contains(PollFlags::POLLIN) {
            return Err(InterfaceError::Closed);
        }

        let mut buf = [0u8; READ_BUFFER_LEN];
        match (&*file).read(&mut buf) {
            // Readable with nothing to read: the other end is gone
            Ok(0) => Err(InterfaceError::Closed),
            Ok(n) => Ok(Packet::from(&buf[..n])),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                Ok(Packet::empty())
            }
            Err(e) => Err(InterfaceError::Io(e)),
        }
    }

    fn write_packet(&self, packet: &Packet) -> Result<(), InterfaceError> {
        let file = self.current()?;
        let written = (&*file).write(packet.as_bytes())?;
        if written != packet.len() {
            return Err(InterfaceError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {} of {} bytes", written, packet.len()),
            )));
        }
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.file.write().unwrap_or_else(PoisonError::into_inner).take();
        debug!("Virtual interface closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn spec(&self) -> &InterfaceSpec {
        &self.spec
    }
}

impl Drop for FdInterface {
    fn drop(&mut self) {
        self.close();
    }
}

/// Hands out a single descriptor inherited from a privileged parent
///
/// The parent has already programmed address, route and DNS; this
/// builder only wraps the descriptor. It can be consumed once.
pub struct InheritedFdBuilder {
    fd: Mutex<Option<OwnedFd>>,
    read_probe: Duration,
}

impl InheritedFdBuilder {
    pub fn new(fd: OwnedFd, read_probe: Duration) -> Self {
        Self {
            fd: Mutex::new(Some(fd)),
            read_probe,
        }
    }
}

impl InterfaceBuilder for InheritedFdBuilder {
    fn establish(&self, spec: &InterfaceSpec) -> Result<Arc<dyn VirtualInterface>, InterfaceError> {
        let fd = self
            .fd
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| InterfaceError::Unavailable("inherited descriptor already consumed".into()))?;

        info!(
            "Virtual interface established: {} route {} mtu {} dns {}",
            spec.address, spec.route, spec.mtu, spec.dns
        );
        Ok(Arc::new(FdInterface::new(fd, spec.clone(), self.read_probe)))
    }
}

/// Interface errors
#[derive(Debug, thiserror::Error)]
pub enum InterfaceError {
    #[error("Interface unavailable: {0}")]
    Unavailable(String),

    #[error("Interface closed")]
    Closed,

    #[error("Interface IO error: {0}")]
    Io(#[from] io::Error),
}

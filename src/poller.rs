//! `Poller`: the platform readiness-notification abstraction, plus the
//! default Linux `epoll`-backed implementation.
//!
//! `EpollPoller` always keeps a self-pipe's read end in the watched set,
//! so another thread's `interrupt()` can wake a blocked `poll()` even
//! when no registered fd is otherwise ready.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::unistd::{pipe, read, write};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub fn none() -> Self {
        Interest { read: false, write: false }
    }

    pub fn read_only() -> Self {
        Interest { read: true, write: false }
    }
}

/// What the poller observed for one ready descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

/// Platform readiness notification, with a self-pipe interrupt always in
/// the watched set so `interrupt()` can wake a blocked `poll()` from any
/// thread. Implementations must tolerate watches being added/removed
/// from within the readiness callbacks `poll()`'s caller runs in
/// response to one of its own results (see `EventDispatcher::dispatch`).
pub trait Poller: Send {
    /// Wait up to `timeout` (`None` = forever) for readiness, or an
    /// interrupt. Returns the ready set, or `None` if interrupted.
    fn poll(&mut self, timeout: Option<Duration>) -> Result<Option<Vec<Readiness>>>;
    fn interrupt(&self);
    fn add(&mut self, fd: RawFd, interest: Interest) -> Result<()>;
    fn remove(&mut self, fd: RawFd) -> Result<()>;
    fn set_interest(&mut self, fd: RawFd, interest: Interest) -> Result<()>;
}

pub struct EpollPoller {
    epoll: Epoll,
    interrupt_read: RawFd,
    interrupt_write: RawFd,
}

impl EpollPoller {
    pub fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::empty())?;
        let (read_fd, write_fd) = pipe()?;
        nix::fcntl::fcntl(read_fd, nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK))?;
        nix::fcntl::fcntl(write_fd, nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK))?;
        let interrupt_read: RawFd = {
            use std::os::unix::io::IntoRawFd;
            read_fd.into_raw_fd()
        };
        let interrupt_write: RawFd = {
            use std::os::unix::io::IntoRawFd;
            write_fd.into_raw_fd()
        };
        epoll.add(
            unsafe { std::os::fd::BorrowedFd::borrow_raw(interrupt_read) },
            EpollEvent::new(EpollFlags::EPOLLIN, interrupt_read as u64),
        )?;
        Ok(EpollPoller { epoll, interrupt_read, interrupt_write })
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout: Option<Duration>) -> Result<Option<Vec<Readiness>>> {
        let mut events = [EpollEvent::empty(); 64];
        let timeout: EpollTimeout = match timeout {
            Some(d) => EpollTimeout::try_from(d.as_millis() as isize).unwrap_or(EpollTimeout::NONE),
            None => EpollTimeout::NONE,
        };
        let n = self.epoll.wait(&mut events, timeout)?;

        let mut out = Vec::with_capacity(n);
        for evt in &events[..n] {
            let fd = evt.data() as RawFd;
            if fd == self.interrupt_read {
                let mut buf = [0u8; 64];
                while matches!(read(self.interrupt_read, &mut buf), Ok(n) if n > 0) {}
                return Ok(None);
            }
            let flags = evt.events();
            out.push(Readiness {
                fd,
                readable: flags.contains(EpollFlags::EPOLLIN),
                writable: flags.contains(EpollFlags::EPOLLOUT),
            });
        }
        Ok(Some(out))
    }

    fn interrupt(&self) {
        let _ = write(unsafe { std::os::fd::BorrowedFd::borrow_raw(self.interrupt_write) }, b"I");
    }

    fn add(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        let mut flags = EpollFlags::empty();
        if interest.read {
            flags |= EpollFlags::EPOLLIN;
        }
        if interest.write {
            flags |= EpollFlags::EPOLLOUT;
        }
        self.epoll.add(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, EpollEvent::new(flags, fd as u64))?;
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> Result<()> {
        self.epoll.delete(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) })?;
        Ok(())
    }

    fn set_interest(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        let mut flags = EpollFlags::empty();
        if interest.read {
            flags |= EpollFlags::EPOLLIN;
        }
        if interest.write {
            flags |= EpollFlags::EPOLLOUT;
        }
        self.epoll.modify(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, &mut EpollEvent::new(flags, fd as u64))?;
        Ok(())
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.interrupt_read);
        let _ = nix::unistd::close(self.interrupt_write);
    }
}

/// Tracks which descriptors are watched and what readiness each one
/// wants, independent of the concrete `Poller`.
pub struct WatchTable {
    watches: HashMap<RawFd, Interest>,
}

impl WatchTable {
    pub fn new() -> Self {
        WatchTable { watches: HashMap::new() }
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.watches.contains_key(&fd)
    }

    pub fn insert(&mut self, fd: RawFd, interest: Interest) {
        self.watches.insert(fd, interest);
    }

    pub fn remove(&mut self, fd: RawFd) {
        self.watches.remove(&fd);
    }
}

impl Default for WatchTable {
    fn default() -> Self {
        Self::new()
    }
}

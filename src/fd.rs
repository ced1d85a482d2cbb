//! A tiny owning wrapper around a raw Unix file descriptor.
//!
//! `Message` holds a `Vec<OwnedFd>` for descriptors that arrived with an
//! inbound message; dropping an unclaimed one closes it, so a descriptor
//! can never leak just because the application never read it out.

use std::os::unix::io::RawFd;

#[derive(Debug)]
pub struct OwnedFd(Option<RawFd>);

impl OwnedFd {
    pub fn new(fd: RawFd) -> Self {
        OwnedFd(Some(fd))
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.0.expect("fd already taken")
    }

    /// Give up ownership, returning the raw descriptor without closing it.
    pub fn into_raw_fd(mut self) -> RawFd {
        self.0.take().expect("fd already taken")
    }
}

impl Drop for OwnedFd {
    fn drop(&mut self) {
        if let Some(fd) = self.0.take() {
            #[cfg(unix)]
            {
                let _ = nix::unistd::close(fd);
            }
            #[cfg(not(unix))]
            {
                let _ = fd;
            }
        }
    }
}

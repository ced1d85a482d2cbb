//! `Transport`: non-blocking byte+fd I/O over a local Unix socket or a
//! TCP loopback connection.
//!
//! `UnixTransport` passes file descriptors alongside bytes via
//! `sendmsg`/`recvmsg` ancillary data (`SCM_RIGHTS`), capped at a fixed
//! count per call; `TcpTransport` carries bytes only. Both are
//! non-blocking (`MSG_DONTWAIT`), reporting `WouldBlock` rather than
//! parking a thread.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::RawFd;
use std::path::Path;

use nix::sys::socket::{
    accept, bind, connect, listen, recvmsg, sendmsg, socket, AddressFamily, ControlMessage, ControlMessageOwned,
    MsgFlags, SockFlag, SockType, UnixAddr,
};
use nix::sys::uio::{IoSlice, IoSliceMut};
use nix::unistd::close;

use crate::error::{Error, Result};
use crate::fd::OwnedFd;
use crate::message::MAX_UNIX_FDS;

/// Outcome of a non-blocking read: either progress was made, the
/// connection reached EOF, or there was nothing to read right now.
pub enum ReadOutcome {
    Data { bytes: usize, fds: Vec<OwnedFd> },
    Eof,
    WouldBlock,
}

/// Outcome of a non-blocking write.
pub enum WriteOutcome {
    Wrote(usize),
    WouldBlock,
}

pub trait Transport: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome>;
    fn write(&mut self, buf: &[u8], fds: &[RawFd]) -> Result<WriteOutcome>;
    fn close(&mut self) -> Result<()>;
    fn is_open(&self) -> bool;
    fn as_raw_fd(&self) -> RawFd;
    fn supports_fd_passing(&self) -> bool {
        true
    }
}

fn io_err(e: nix::Error) -> Error {
    Error::Connection(io::Error::from(e))
}

/// A connected `AF_UNIX` `SOCK_STREAM` socket, optionally bound to the
/// Linux abstract namespace, with SCM_RIGHTS fd passing.
pub struct UnixTransport {
    fd: RawFd,
    open: bool,
}

impl UnixTransport {
    fn from_raw(fd: RawFd) -> Result<Self> {
        nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK)).map_err(io_err)?;
        Ok(UnixTransport { fd, open: true })
    }

    pub fn connect_path(path: &Path) -> Result<Self> {
        let fd = socket(AddressFamily::Unix, SockType::Stream, SockFlag::empty(), None).map_err(io_err)?;
        let addr = UnixAddr::new(path).map_err(io_err)?;
        if let Err(e) = connect(fd, &addr) {
            let _ = close(fd);
            return Err(io_err(e));
        }
        Self::from_raw(fd)
    }

    /// Linux abstract-namespace socket: `name` does not touch the
    /// filesystem, matching the `unix:abstract=` address key.
    pub fn connect_abstract(name: &str) -> Result<Self> {
        let fd = socket(AddressFamily::Unix, SockType::Stream, SockFlag::empty(), None).map_err(io_err)?;
        let addr = UnixAddr::new_abstract(name.as_bytes()).map_err(io_err)?;
        if let Err(e) = connect(fd, &addr) {
            let _ = close(fd);
            return Err(io_err(e));
        }
        Self::from_raw(fd)
    }

    pub fn listen_path(path: &Path, backlog: usize) -> Result<RawFd> {
        let fd = socket(AddressFamily::Unix, SockType::Stream, SockFlag::empty(), None).map_err(io_err)?;
        let addr = UnixAddr::new(path).map_err(io_err)?;
        bind(fd, &addr).map_err(io_err)?;
        listen(fd, backlog).map_err(io_err)?;
        Ok(fd)
    }

    pub fn accept(listen_fd: RawFd) -> Result<Self> {
        let fd = accept(listen_fd).map_err(io_err)?;
        Self::from_raw(fd)
    }
}

impl Transport for UnixTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        if buf.is_empty() {
            return Ok(ReadOutcome::WouldBlock);
        }
        let mut iov = [IoSliceMut::new(buf)];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_UNIX_FDS]);
        loop {
            match recvmsg::<()>(self.fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::MSG_DONTWAIT) {
                Ok(msg) => {
                    let n = msg.bytes;
                    if n == 0 {
                        self.open = false;
                        return Ok(ReadOutcome::Eof);
                    }
                    let mut fds = Vec::new();
                    for cmsg in msg.cmsgs() {
                        if let ControlMessageOwned::ScmRights(raw) = cmsg {
                            fds.extend(raw.into_iter().map(OwnedFd::new));
                        }
                    }
                    return Ok(ReadOutcome::Data { bytes: n, fds });
                }
                Err(nix::Error::EINTR) => continue,
                Err(nix::Error::EAGAIN) => return Ok(ReadOutcome::WouldBlock),
                Err(e) => {
                    self.open = false;
                    return Err(io_err(e));
                }
            }
        }
    }

    fn write(&mut self, buf: &[u8], fds: &[RawFd]) -> Result<WriteOutcome> {
        if fds.len() > MAX_UNIX_FDS {
            return Err(Error::SendingTooManyUnixFds);
        }
        let iov = [IoSlice::new(buf)];
        let cmsgs = if fds.is_empty() { vec![] } else { vec![ControlMessage::ScmRights(fds)] };
        loop {
            match sendmsg::<()>(self.fd, &iov, &cmsgs, MsgFlags::MSG_DONTWAIT, None) {
                Ok(n) => return Ok(WriteOutcome::Wrote(n)),
                Err(nix::Error::EINTR) => continue,
                Err(nix::Error::EAGAIN) => return Ok(WriteOutcome::WouldBlock),
                Err(e) => {
                    self.open = false;
                    return Err(io_err(e));
                }
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            close(self.fd).map_err(io_err)?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for UnixTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// A connected TCP stream, used for `tcp:host=...,port=...`. No fd
/// passing — a `Message` with descriptors cannot be sent over this
/// transport.
pub struct TcpTransport {
    stream: TcpStream,
    open: bool,
}

impl TcpTransport {
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).map_err(Error::Connection)?;
        Self::from_stream(stream)
    }

    /// Wrap a stream handed back by `TcpListener::accept`, matching
    /// `IpServer::notifyRead`'s `FD_CLOEXEC`-only accept (we additionally
    /// set `O_NONBLOCK`/`TCP_NODELAY` the way `connect` does, since both
    /// sides of this crate's transports are always non-blocking).
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nonblocking(true).map_err(Error::Connection)?;
        stream.set_nodelay(true).map_err(Error::Connection)?;
        Ok(TcpTransport { stream, open: true })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.stream.local_addr().map_err(Error::Connection)
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        use std::io::Read;
        match self.stream.read(buf) {
            Ok(0) => {
                self.open = false;
                Ok(ReadOutcome::Eof)
            }
            Ok(n) => Ok(ReadOutcome::Data { bytes: n, fds: Vec::new() }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(e) => {
                self.open = false;
                Err(Error::Connection(e))
            }
        }
    }

    fn write(&mut self, buf: &[u8], fds: &[RawFd]) -> Result<WriteOutcome> {
        if !fds.is_empty() {
            return Err(Error::Connection(io::Error::new(io::ErrorKind::Unsupported, "tcp transport cannot pass file descriptors")));
        }
        use std::io::Write;
        match self.stream.write(buf) {
            Ok(n) => Ok(WriteOutcome::Wrote(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(WriteOutcome::WouldBlock),
            Err(e) => {
                self.open = false;
                Err(Error::Connection(e))
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn as_raw_fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        self.stream.as_raw_fd()
    }

    fn supports_fd_passing(&self) -> bool {
        false
    }
}

/// The local process's effective uid, used to build the `AUTH EXTERNAL`
/// line regardless of which transport kind is in use.
pub fn effective_uid() -> u32 {
    nix::unistd::geteuid().as_raw()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    #[test]
    fn unix_transport_round_trip() {
        let dir = std::env::temp_dir().join(format!("busline-test-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&dir);
        let listener = UnixListener::bind(&dir).unwrap();
        listener.set_nonblocking(true).unwrap();

        let mut client = UnixTransport::connect_path(&dir).unwrap();

        // accept via std to keep the test simple; the accepted fd is handed to our Transport.
        let mut accepted = None;
        for _ in 0..1000 {
            match listener.accept() {
                Ok((stream, _)) => {
                    accepted = Some(stream);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::yield_now(),
                Err(e) => panic!("accept failed: {e}"),
            }
        }
        let accepted = accepted.expect("server should have accepted a connection");
        use std::os::unix::io::IntoRawFd;
        let mut server = UnixTransport::from_raw(accepted.into_raw_fd()).unwrap();

        match client.write(b"ping", &[]).unwrap() {
            WriteOutcome::Wrote(n) => assert_eq!(n, 4),
            WriteOutcome::WouldBlock => panic!("write should not block for 4 bytes"),
        }

        let mut buf = [0u8; 16];
        let mut got = ReadOutcome::WouldBlock;
        for _ in 0..1000 {
            got = server.read(&mut buf).unwrap();
            if matches!(got, ReadOutcome::Data { .. }) {
                break;
            }
            std::thread::yield_now();
        }
        match got {
            ReadOutcome::Data { bytes, fds } => {
                assert_eq!(&buf[..bytes], b"ping");
                assert!(fds.is_empty());
            }
            _ => panic!("expected data"),
        }

        let _ = std::fs::remove_file(&dir);
    }

    #[test]
    fn tcp_transport_rejects_fds() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpTransport::connect(addr).unwrap();
        assert!(!client.supports_fd_passing());
        let err = client.write(b"x", &[3]).unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }
}

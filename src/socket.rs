//! Non-blocking TCP primitives with a uniform error taxonomy.
//!
//! Every socket is created non-blocking. Calls that would ordinarily block
//! return `Err` with `ErrorKind::WouldBlock`/`InProgress`; the caller re-arms
//! the event core for the relevant readiness and retries.

use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::addr::SocketAddress;
use crate::error::{Error, ErrorKind, Result};

/// A non-blocking TCP socket, bound and possibly connected or listening.
pub struct SocketHandle {
    inner: Socket,
}

impl SocketHandle {
    fn domain_for(addr: SocketAddress) -> Domain {
        if addr.host.is_v6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        }
    }

    /// Creates a non-blocking socket bound to `local`. Port 0 means ephemeral.
    pub fn create_bound(local: SocketAddress) -> Result<Self> {
        let socket = Socket::new(Self::domain_for(local), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        socket.bind(&SockAddr::from(std::net::SocketAddr::from(local)))?;
        Ok(Self { inner: socket })
    }

    /// As `create_bound`, plus `listen` with the platform's maximum backlog.
    pub fn create_listener(local: SocketAddress) -> Result<Self> {
        let handle = Self::create_bound(local)?;
        handle.inner.listen(libc::SOMAXCONN)?;
        Ok(handle)
    }

    /// Begins a non-blocking connect. `Ok(())` means the connection
    /// completed synchronously (rare, usually loopback); `Err` carrying
    /// `ErrorKind::InProgress` is the normal async path and the caller must
    /// arm write-readiness and later call `pending_error`.
    pub fn connect(&self, remote: SocketAddress) -> Result<()> {
        match self.inner.connect(&SockAddr::from(std::net::SocketAddr::from(remote))) {
            Ok(()) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Accepts one pending connection, or `Err(WouldBlock)` if none pending.
    pub fn accept(&self) -> Result<(Self, SocketAddress)> {
        let (socket, sockaddr) = self.inner.accept()?;
        socket.set_nonblocking(true)?;
        let addr = sockaddr
            .as_socket()
            .ok_or_else(|| Error::new(ErrorKind::Generic, "accepted socket has no address"))?;
        Ok((Self { inner: socket }, addr.into()))
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        match (&self.inner).read(buf) {
            Ok(n) => Ok(n),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        match (&self.inner).write(buf) {
            Ok(n) => Ok(n),
            Err(e) => Err(e.into()),
        }
    }

    /// Inspects `SO_ERROR` to finalize an in-progress connect.
    pub fn pending_error(&self) -> Result<()> {
        match self.inner.take_error()? {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    pub fn local_address(&self) -> Result<SocketAddress> {
        let sockaddr = self.inner.local_addr()?;
        let addr = sockaddr
            .as_socket()
            .ok_or_else(|| Error::new(ErrorKind::Generic, "local socket has no address"))?;
        Ok(addr.into())
    }

    /// Shuts down the write half, used to forward peer EOF transparently.
    pub fn shutdown_write(&self) -> Result<()> {
        self.inner.shutdown(std::net::Shutdown::Write)?;
        Ok(())
    }

    /// Closing is infallible and idempotent: dropping the handle closes the
    /// underlying fd exactly once regardless of how many times this is called.
    pub fn close(self) {
        drop(self);
    }
}

impl AsRawFd for SocketHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

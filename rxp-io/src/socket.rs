//! UDP socket wrapper for RxP
//!
//! Blocking datagram socket with a read timeout. The timeout is the poll
//! interval of every loop that reads from the socket: a read that times out
//! returns `Ok(None)` so the caller can check whether it should keep going.

use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use thiserror::Error;

/// Socket errors
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid socket address")]
    InvalidAddress,
}

/// RxP datagram socket
#[derive(Debug)]
pub struct RxpSocket {
    inner: UdpSocket,
    local_addr: SocketAddr,
}

impl RxpSocket {
    /// Create a socket bound to `addr`
    ///
    /// Port 0 lets the OS pick a port; [`RxpSocket::local_addr`] reports the
    /// resolved address.
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;

        let local_addr = socket
            .local_addr()?
            .as_socket()
            .ok_or(SocketError::InvalidAddress)?;

        tracing::debug!("Bound UDP socket on {}", local_addr);

        Ok(RxpSocket {
            inner: socket.into(),
            local_addr,
        })
    }

    /// Set how long a read blocks before returning `Ok(None)`
    ///
    /// `None` blocks indefinitely.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), SocketError> {
        self.inner.set_read_timeout(timeout)?;
        Ok(())
    }

    /// The address this socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send one datagram to `target`
    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, SocketError> {
        Ok(self.inner.send_to(buf, target)?)
    }

    /// Receive one datagram
    ///
    /// Returns `Ok(None)` when the read timeout elapses with nothing to read.
    /// Bytes beyond `buf.len()` are discarded by the OS.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, SocketError> {
        match self.inner.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if is_timeout(&e) => Ok(None),
            Err(e) => Err(SocketError::Io(e)),
        }
    }
}

/// Whether an I/O error is the read timeout expiring
///
/// Unix reports `WouldBlock`, Windows reports `TimedOut`.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

//! Per-probe UDP socket wrapper.
//!
//! [`ProbeSocket`] is a thin wrapper around a non-blocking
//! `std::net::UdpSocket`.  Every probe owns a dedicated socket for its whole
//! round trip: the echo responder answers the exact ephemeral source port the
//! probe left from, so the socket is the correlation key and must stay open
//! (and individually readable) until the probe's bucket closes.
//!
//! All protocol logic lives elsewhere; this module owns only byte I/O.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};

/// Replies are bare decimal sequence strings; 64 bytes is ample.
const RECV_BUF: usize = 64;

/// A non-blocking UDP socket bound to one source port for one probe.
#[derive(Debug)]
pub struct ProbeSocket {
    /// Address this socket is bound to (the probe's source port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl ProbeSocket {
    /// Bind a new non-blocking socket to `port` on all interfaces.
    ///
    /// `SO_REUSEADDR` is set before the bind: the rotation revisits a port
    /// while earlier probes on it are still inside their grace window, and
    /// those sockets must coexist.  Replies are correlated by the sequence
    /// number in the payload, so same-port delivery stays unambiguous.
    ///
    /// An `AddrInUse` error (a foreign process owns the port) means the
    /// rotation should skip it; the caller decides (see the engine's send
    /// loop).
    pub fn bind(port: u16) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
        socket.set_nonblocking(true)?;
        let inner: UdpSocket = socket.into();
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// Send one probe payload (the decimal form of `seq`) to `dest`.
    ///
    /// Returns the number of payload bytes on the wire.
    pub fn send_probe(&self, seq: u32, dest: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(seq.to_string().as_bytes(), dest)
    }

    /// Non-blocking read of one reply datagram.
    ///
    /// Returns `Ok(Some(payload))` when a datagram was waiting,
    /// `Ok(None)` when the socket has nothing ready (`WouldBlock`).
    pub fn try_recv(&self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = [0u8; RECV_BUF];
        match self.inner.recv(&mut buf) {
            Ok(n) => Ok(Some(buf[..n].to_vec())),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(unix)]
impl AsRawFd for ProbeSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

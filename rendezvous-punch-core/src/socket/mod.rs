//! The single UDP socket a peer punches, handshakes and exchanges data on.
//!
//! [`PunchSocket`] is shared behind an `Arc` once a connection is
//! established: `send_to` and `recv_from` both take `&self`, so one task can
//! send while another receives without additional locking.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::Protocol;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::error::{Error, Result};

pub(crate) fn bind_udp_ops(addr: SocketAddr, only_v6: bool) -> io::Result<socket2::Socket> {
    let socket = if addr.is_ipv4() {
        socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(Protocol::UDP),
        )?
    } else {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV6,
            socket2::Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.set_only_v6(only_v6)?;
        socket
    };
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

/// Bind a non-blocking UDP socket. Port `0` picks an ephemeral port.
pub fn bind_udp(addr: SocketAddr) -> io::Result<socket2::Socket> {
    bind_udp_ops(addr, false).map_err(|e| {
        io::Error::new(e.kind(), format!("bind_udp {addr}: {e}"))
    })
}

#[derive(Debug)]
pub struct PunchSocket {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl PunchSocket {
    /// Must be called from within a tokio runtime.
    pub fn bind(addr: SocketAddr) -> Result<PunchSocket> {
        let socket = bind_udp(addr)?;
        let socket = UdpSocket::from_std(socket.into())?;
        let local_addr = socket.local_addr()?;
        log::debug!("bind punch socket {local_addr}");
        Ok(Self { socket, local_addr })
    }
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
    /// The local port the rendezvous record advertises.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }
    pub async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(buf, addr).await?)
    }
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }
    /// `None` waits without bound; `Some` fails with [`Error::Timeout`].
    pub async fn recv_from_timeout(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<(usize, SocketAddr)> {
        match timeout {
            None => self.recv_from(buf).await,
            Some(timeout) => tokio::time::timeout(timeout, self.recv_from(buf))
                .await
                .map_err(|_| Error::Timeout)?,
        }
    }
    pub async fn recv_from_until(
        &self,
        buf: &mut [u8],
        deadline: Instant,
    ) -> Result<(usize, SocketAddr)> {
        tokio::time::timeout_at(deadline, self.recv_from(buf))
            .await
            .map_err(|_| Error::Timeout)?
    }
}

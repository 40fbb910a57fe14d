//! Transport module - stream and datagram adapters over tokio sockets.
//!
//! Provides:
//! - [`TcpSocket`] - byte-stream socket (TCP, and Unix domain sockets on Unix)
//! - [`UdpSocket`] - datagram socket with per-packet destinations
//!
//! Each connected or bound socket is serviced by one driver task that owns
//! the OS socket. Handles only lock the engine, enqueue work and wake the
//! driver.

mod datagram;
mod stream;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use serde::Serialize;
use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use tokio::time::{Duration, Instant};

use crate::config::SocketConfig;
use crate::error::{Result, SocketError};

pub use datagram::UdpSocket;
pub use stream::TcpSocket;

/// Transport model of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Byte stream (TCP, Unix domain socket).
    Stream,
    /// Datagrams (UDP).
    Datagram,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stream => f.write_str("stream"),
            TransportKind::Datagram => f.write_str("datagram"),
        }
    }
}

/// Check that `port` fits in `0..=65535`.
pub fn validate_port(port: u32) -> Result<u16> {
    u16::try_from(port).map_err(|_| SocketError::InvalidPort(port))
}

/// Wildcard IPv4 address on `port`.
pub(crate) fn any_addr(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
}

/// Resolve `host:port`, taking the first address.
pub(crate) async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("no address found for {}:{}", host, port),
            )
            .into()
        })
}

/// Stand-in deadline for `select!` branches that are disabled.
pub(crate) fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}

/// Bind a listening TCP socket synchronously with the configured options.
///
/// Must be called from within a tokio runtime.
pub(crate) fn bind_tcp_listener(
    addr: SocketAddr,
    config: &SocketConfig,
) -> Result<tokio::net::TcpListener> {
    let socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(config.reuse_address)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.listen_backlog)?;

    let listener: std::net::TcpListener = socket.into();
    Ok(tokio::net::TcpListener::from_std(listener)?)
}

/// Bind a UDP socket synchronously with the configured options.
///
/// Must be called from within a tokio runtime.
pub(crate) fn bind_udp_socket(
    addr: SocketAddr,
    config: &SocketConfig,
) -> Result<tokio::net::UdpSocket> {
    let socket = RawSocket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(config.reuse_address)?;
    socket.set_broadcast(config.broadcast)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    let udp: std::net::UdpSocket = socket.into();
    Ok(tokio::net::UdpSocket::from_std(udp)?)
}

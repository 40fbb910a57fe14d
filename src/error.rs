//! Error types for tagsock.

use std::sync::Arc;

use thiserror::Error;

use crate::transport::TransportKind;

/// Main error type for all socket operations.
///
/// The type is `Clone` because a single connection failure is fanned out to
/// every operation that was still queued when it happened.
#[derive(Debug, Clone, Error)]
pub enum SocketError {
    /// Empty delimiter or zero exact length.
    #[error("Invalid framing spec: {0}")]
    InvalidFramingSpec(&'static str),

    /// Framing spec that the transport cannot honor (e.g. a delimiter on UDP).
    #[error("Framing spec {spec} is not supported on {transport} sockets")]
    UnsupportedFramingSpec {
        spec: &'static str,
        transport: TransportKind,
    },

    /// The active operation exceeded its deadline.
    #[error("Operation timed out")]
    TimedOut,

    /// Peer closed, local close, or the socket is no longer serviceable.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Lower-layer I/O failure (refused, unreachable, reset, ...).
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Port outside `0..=65535`.
    #[error("Invalid port {0}: must be within 0-65535")]
    InvalidPort(u32),

    /// `connect`/`listen` called on a socket that already left `Unconnected`.
    #[error("Socket is already connected or listening")]
    AlreadyConnected,

    /// Datagram write with no destination and no connected peer.
    #[error("No destination address for datagram")]
    MissingDestination,

    /// Read or write on a listening socket that has no connected clients.
    #[error("Listening socket has no connected clients")]
    NoClients,
}

impl From<std::io::Error> for SocketError {
    fn from(err: std::io::Error) -> Self {
        SocketError::Io(Arc::new(err))
    }
}

/// Result type alias using SocketError.
pub type Result<T> = std::result::Result<T, SocketError>;

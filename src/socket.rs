//! The capability shared by stream and datagram sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use crate::engine::{SocketState, Timeout};
use crate::error::Result;
use crate::event::{Callback, SocketEvent, Tag};
use crate::framing::FramingSpec;
use crate::transport::TransportKind;

/// Snapshot of a socket's state, as reported by [`Socket::info`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SocketInfo {
    pub kind: TransportKind,
    pub state: SocketState,
    pub listening: bool,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
    pub unix_path: Option<String>,
    pub default_timeout: Option<Duration>,
    /// Live accepted clients for a listener; 1 or 0 otherwise.
    pub connections: usize,
    pub pending_reads: usize,
    pub pending_writes: usize,
    /// Stream bytes or datagrams held for future reads.
    pub buffered: usize,
}

/// Tag-annotated asynchronous socket.
///
/// Every method returns immediately. Outcomes of reads and writes arrive
/// later as [`SocketEvent`]s carrying the tag supplied here.
///
/// # Example
///
/// ```ignore
/// use tagsock::{FramingSpec, Socket, SocketEvent, TcpSocket};
///
/// let socket = TcpSocket::new();
/// socket.set_callback(|event| {
///     if let SocketEvent::DataRead { data, tag, .. } = event {
///         println!("{}: {:?}", tag, data);
///     }
/// });
/// socket.connect("example.com", 80)?;
/// socket.write("HEAD / HTTP/1.0\r\n\r\n", 1)?;
/// socket.read("\r\n\r\n", 1)?;
/// ```
pub trait Socket {
    /// Transport model of this socket.
    fn kind(&self) -> TransportKind;

    /// Queue a read with an explicit timeout.
    fn read_with_timeout(
        &self,
        spec: FramingSpec,
        tag: impl Into<Tag>,
        timeout: Timeout,
    ) -> Result<&Self>;

    /// Queue a read that uses the socket's default timeout.
    fn read(&self, spec: impl Into<FramingSpec>, tag: impl Into<Tag>) -> Result<&Self> {
        self.read_with_timeout(spec.into(), tag, Timeout::Default)
    }

    /// Queue a write with an explicit timeout.
    fn write_with_timeout(
        &self,
        payload: impl Into<Bytes>,
        tag: impl Into<Tag>,
        timeout: Timeout,
    ) -> Result<&Self>;

    /// Queue a write that uses the socket's default timeout.
    fn write(&self, payload: impl Into<Bytes>, tag: impl Into<Tag>) -> Result<&Self> {
        self.write_with_timeout(payload, tag, Timeout::Default)
    }

    /// Default timeout for operations that become active from now on.
    fn set_timeout(&self, timeout: Option<Duration>) -> &Self;

    /// Seconds-based variant of [`Socket::set_timeout`]; negative disables it.
    fn set_timeout_secs(&self, secs: f64) -> &Self {
        self.set_timeout(crate::engine::secs_to_duration(secs))
    }

    fn timeout(&self) -> Option<Duration>;

    /// Replace the event callback (shared form).
    fn set_shared_callback(&self, callback: Option<Callback>) -> &Self;

    /// Replace the event callback.
    fn set_callback<F>(&self, callback: F) -> &Self
    where
        F: Fn(SocketEvent) + Send + Sync + 'static,
    {
        self.set_shared_callback(Some(Arc::new(callback)))
    }

    /// Remove the event callback. Later events are dropped.
    fn clear_callback(&self) -> &Self {
        self.set_shared_callback(None)
    }

    /// Cancel everything pending and disconnect.
    fn close(&self);

    fn state(&self) -> SocketState;

    fn is_connected(&self) -> bool {
        self.state() == SocketState::Connected
    }

    fn info(&self) -> SocketInfo;
}

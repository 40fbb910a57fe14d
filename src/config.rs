//! Socket configuration and the process-wide default timeout.
//!
//! A [`SocketConfig`] is captured by value when a socket is created. The
//! process-wide default timeout only seeds new configs; changing it never
//! reaches sockets that already exist.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use tagsock::config::{self, SocketConfig};
//!
//! config::set_default_timeout(Some(Duration::from_secs(30)));
//! let cfg = SocketConfig::default().with_read_chunk_size(16 * 1024);
//! assert_eq!(cfg.default_timeout, Some(Duration::from_secs(30)));
//! config::set_default_timeout(None);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default chunk size for a single transport read (64KB).
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

/// Default cap on bytes buffered while no read is active (1MB).
pub const DEFAULT_MAX_READ_AHEAD: usize = 1024 * 1024;

/// Default maximum datagram size.
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 65_536;

/// Default listen backlog.
pub const DEFAULT_LISTEN_BACKLOG: i32 = 128;

/// Sentinel meaning "no timeout" in [`DEFAULT_TIMEOUT_NANOS`].
const NO_TIMEOUT: u64 = u64::MAX;

static DEFAULT_TIMEOUT_NANOS: AtomicU64 = AtomicU64::new(NO_TIMEOUT);

/// Set the default timeout picked up by configs created from now on.
pub fn set_default_timeout(timeout: Option<Duration>) {
    let nanos = timeout.map_or(NO_TIMEOUT, |d| {
        u64::try_from(d.as_nanos()).unwrap_or(NO_TIMEOUT - 1)
    });
    DEFAULT_TIMEOUT_NANOS.store(nanos, Ordering::Release);
}

/// Current process-wide default timeout. Initially `None` (no timeout).
pub fn default_timeout() -> Option<Duration> {
    match DEFAULT_TIMEOUT_NANOS.load(Ordering::Acquire) {
        NO_TIMEOUT => None,
        nanos => Some(Duration::from_nanos(nanos)),
    }
}

/// Per-socket configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Timeout for operations enqueued without an explicit one. `None` disables it.
    pub default_timeout: Option<Duration>,
    /// Bytes requested from the transport per read call.
    pub read_chunk_size: usize,
    /// Stop reading from the transport when this many bytes are buffered
    /// and no read is active.
    pub max_read_ahead: usize,
    /// Receive buffer size for one datagram.
    pub max_datagram_size: usize,
    /// Datagrams kept while no read is active. 0 drops them.
    pub datagram_backlog: usize,
    /// Pending-connection backlog for listeners.
    pub listen_backlog: i32,
    /// Set `SO_REUSEADDR` on listening and bound sockets.
    pub reuse_address: bool,
    /// Enable `SO_BROADCAST` on datagram sockets.
    pub broadcast: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_timeout(),
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_read_ahead: DEFAULT_MAX_READ_AHEAD,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            datagram_backlog: 0,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            reuse_address: true,
            broadcast: false,
        }
    }
}

impl SocketConfig {
    /// Create a config seeded from the process-wide defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the socket default timeout.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the per-call read size.
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    /// Set the read-ahead cap.
    pub fn with_max_read_ahead(mut self, size: usize) -> Self {
        self.max_read_ahead = size;
        self
    }

    /// Set the datagram receive size.
    pub fn with_max_datagram_size(mut self, size: usize) -> Self {
        self.max_datagram_size = size.max(1);
        self
    }

    /// Keep up to `count` unread datagrams.
    pub fn with_datagram_backlog(mut self, count: usize) -> Self {
        self.datagram_backlog = count;
        self
    }

    /// Set the listen backlog.
    pub fn with_listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    /// Toggle `SO_REUSEADDR`.
    pub fn with_reuse_address(mut self, reuse: bool) -> Self {
        self.reuse_address = reuse;
        self
    }

    /// Toggle `SO_BROADCAST`.
    pub fn with_broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    /// Read size actually requested from the transport. A zero read size
    /// (possible through deserialization) falls back to the default.
    pub fn effective_read_chunk_size(&self) -> usize {
        match self.read_chunk_size {
            0 => DEFAULT_READ_CHUNK_SIZE,
            size => size,
        }
    }

    /// Datagram receive buffer size, with zero mapped to the default.
    pub fn effective_max_datagram_size(&self) -> usize {
        match self.max_datagram_size {
            0 => DEFAULT_MAX_DATAGRAM_SIZE,
            size => size,
        }
    }
}

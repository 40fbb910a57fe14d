//! Tags, socket events, and the callback dispatcher.
//!
//! Every completed operation and every connection-level change becomes one
//! [`SocketEvent`]. Events are handed to the socket's single registered
//! callback, which can be replaced at any time; the dispatcher snapshots the
//! current callback for each event, so a replacement takes effect from the
//! next dispatch.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;

use crate::error::SocketError;
use crate::transport::TcpSocket;

/// Opaque caller-provided token echoed back with an operation's outcome.
///
/// The library never interprets a tag beyond cloning it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Tag {
    /// No tag was supplied.
    #[default]
    Untagged,
    /// Integer tag.
    Int(i64),
    /// String tag.
    Text(Arc<str>),
}

impl From<i64> for Tag {
    fn from(value: i64) -> Self {
        Tag::Int(value)
    }
}

impl From<i32> for Tag {
    fn from(value: i32) -> Self {
        Tag::Int(value.into())
    }
}

impl From<&str> for Tag {
    fn from(value: &str) -> Self {
        Tag::Text(Arc::from(value))
    }
}

impl From<String> for Tag {
    fn from(value: String) -> Self {
        Tag::Text(Arc::from(value))
    }
}

impl From<()> for Tag {
    fn from(_: ()) -> Self {
        Tag::Untagged
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Untagged => f.write_str("-"),
            Tag::Int(value) => write!(f, "{}", value),
            Tag::Text(value) => f.write_str(value),
        }
    }
}

/// Event delivered to a socket's callback.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// Connect finished, listener started, or UDP socket bound.
    Connected,
    /// A listening socket accepted a peer; `socket` is the new connection.
    ///
    /// The new connection starts with the listener's callback, so its events
    /// look like the listener's own. Give it a callback of its own from this
    /// handler: the connection delivers nothing before this event has been
    /// handled.
    Accepted {
        socket: TcpSocket,
        peer: Option<SocketAddr>,
    },
    /// A read completed with a full frame.
    DataRead {
        data: Bytes,
        tag: Tag,
        /// Sender of the datagram (UDP only).
        from: Option<SocketAddr>,
    },
    /// The whole payload of a write was accepted by the transport.
    WriteComplete { tag: Tag },
    /// The socket reached its terminal state.
    Disconnected { reason: SocketError },
    /// An operation (`tag` set) or the connection (`tag` unset) failed.
    Error {
        reason: SocketError,
        tag: Option<Tag>,
    },
}

impl SocketEvent {
    /// Tag of the operation this event answers, if any.
    pub fn tag(&self) -> Option<&Tag> {
        match self {
            SocketEvent::DataRead { tag, .. } | SocketEvent::WriteComplete { tag } => Some(tag),
            SocketEvent::Error { tag, .. } => tag.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn data(data: Bytes, tag: Tag, from: Option<SocketAddr>) -> Self {
        SocketEvent::DataRead { data, tag, from }
    }

    pub(crate) fn op_failed(reason: SocketError, tag: Tag) -> Self {
        SocketEvent::Error {
            reason,
            tag: Some(tag),
        }
    }
}

/// Shared callback type.
pub type Callback = Arc<dyn Fn(SocketEvent) + Send + Sync + 'static>;

/// Holds the socket's current callback and delivers events to it.
#[derive(Default)]
pub struct Dispatcher {
    callback: Mutex<Option<Callback>>,
}

impl Dispatcher {
    /// Create a dispatcher with an optional initial callback.
    pub fn new(callback: Option<Callback>) -> Self {
        Self {
            callback: Mutex::new(callback),
        }
    }

    /// Replace the callback. Effective from the next dispatch.
    pub fn set(&self, callback: Option<Callback>) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = callback;
    }

    /// Snapshot of the current callback.
    pub fn current(&self) -> Option<Callback> {
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Deliver one event to the callback that is current right now.
    ///
    /// The lock is released before the callback runs, so the callback may
    /// replace itself.
    pub fn dispatch(&self, event: SocketEvent) {
        match self.current() {
            Some(callback) => callback(event),
            None => tracing::debug!("No callback set, dropping event {:?}", event),
        }
    }

    /// Deliver events in order, re-reading the callback before each one.
    pub fn dispatch_all(&self, events: impl IntoIterator<Item = SocketEvent>) {
        for event in events {
            self.dispatch(event);
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("has_callback", &self.current().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_tag_conversions() {
        assert_eq!(Tag::from(7), Tag::Int(7));
        assert_eq!(Tag::from("req"), Tag::Text(Arc::from("req")));
        assert_eq!(Tag::from(()), Tag::Untagged);
        assert_eq!(Tag::default(), Tag::Untagged);
        assert_eq!(Tag::from(-1i64).to_string(), "-1");
    }

    #[test]
    fn test_event_tag_accessor() {
        let read = SocketEvent::data(Bytes::from_static(b"x"), Tag::from(1), None);
        assert_eq!(read.tag(), Some(&Tag::Int(1)));

        let failed = SocketEvent::Error {
            reason: SocketError::ConnectionClosed,
            tag: None,
        };
        assert_eq!(failed.tag(), None);
        assert_eq!(SocketEvent::Connected.tag(), None);
    }

    #[test]
    fn test_dispatch_without_callback_is_dropped() {
        let dispatcher = Dispatcher::default();
        dispatcher.dispatch(SocketEvent::Connected);
        assert!(dispatcher.current().is_none());
    }

    #[test]
    fn test_callback_replaced_mid_batch() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let dispatcher = Arc::new(Dispatcher::default());

        let second_counter = second.clone();
        let replacement: Callback = Arc::new(move |_| {
            second_counter.fetch_add(1, Ordering::SeqCst);
        });

        let first_counter = first.clone();
        let weak = Arc::downgrade(&dispatcher);
        dispatcher.set(Some(Arc::new(move |_| {
            first_counter.fetch_add(1, Ordering::SeqCst);
            if let Some(d) = weak.upgrade() {
                d.set(Some(replacement.clone()));
            }
        })));

        dispatcher.dispatch_all([
            SocketEvent::Connected,
            SocketEvent::WriteComplete { tag: Tag::Int(1) },
            SocketEvent::WriteComplete { tag: Tag::Int(2) },
        ]);

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }
}

//! # tagsock
//!
//! Tag-annotated asynchronous TCP and UDP sockets on top of tokio.
//!
//! Reads and writes are queued per socket and complete in order. Each one
//! carries a caller-chosen [`Tag`] that comes back in the [`SocketEvent`]
//! reporting its outcome, so one callback can tell replies apart.
//!
//! ## Architecture
//!
//! - **Framing** ([`framing`]): turns a byte stream into frames by
//!   delimiter, exact length, whole datagram, or end of stream
//! - **Engine** ([`engine`]): operation queues, per-operation timeouts and
//!   the socket state machine, independent of the transport
//! - **Transport** ([`transport`]): one driver task per socket feeding the
//!   engine from a TCP, Unix or UDP socket
//! - **Events** ([`event`]): outcomes delivered to a replaceable callback
//!
//! ## Example
//!
//! ```ignore
//! use tagsock::{Socket, SocketEvent, TcpSocket};
//!
//! #[tokio::main]
//! async fn main() -> tagsock::Result<()> {
//!     let socket = TcpSocket::new();
//!     socket.set_callback(|event| match event {
//!         SocketEvent::DataRead { data, tag, .. } => println!("[{}] {:?}", tag, data),
//!         other => println!("{:?}", other),
//!     });
//!
//!     socket
//!         .connect("example.com", 80)?
//!         .write("HEAD / HTTP/1.0\r\nHost: example.com\r\n\r\n", "request")?
//!         .read("\r\n\r\n", "headers")?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(2)).await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod framing;
pub mod socket;
pub mod transport;

pub use config::SocketConfig;
pub use engine::{SocketState, Timeout};
pub use error::{Result, SocketError};
pub use event::{Callback, SocketEvent, Tag};
pub use framing::FramingSpec;
pub use socket::{Socket, SocketInfo};
pub use transport::{TcpSocket, TransportKind, UdpSocket};

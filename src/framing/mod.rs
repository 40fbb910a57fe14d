//! Framing module - framing specs and the stream receive buffer.
//!
//! - [`FramingSpec`] - delimiter, exact length, one datagram, or read-to-EOF
//! - [`ReceiveBuffer`] - accumulates stream bytes and extracts frames

mod buffer;
mod spec;

pub use buffer::{scan_frame, FrameScan, ReceiveBuffer, DEFAULT_BUFFER_CAPACITY};
pub use spec::FramingSpec;

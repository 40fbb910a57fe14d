//! Framing specs: how a read decides that a frame is complete.

use bytes::Bytes;

use crate::error::{Result, SocketError};
use crate::transport::TransportKind;

/// Policy describing how to detect a complete frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramingSpec {
    /// Frame ends at the first occurrence of the delimiter (delimiter included).
    Delimiter(Bytes),
    /// Frame is exactly `n` bytes.
    ExactLength(usize),
    /// Next datagram in full.
    OneMessage,
    /// Every byte until the peer closes the stream.
    ToEof,
}

impl FramingSpec {
    /// Delimiter framing from anything byte-like (`"\r\n"`, `b"\0"`, `Vec<u8>`...).
    pub fn delimiter(delimiter: impl AsRef<[u8]>) -> Self {
        FramingSpec::Delimiter(Bytes::copy_from_slice(delimiter.as_ref()))
    }

    /// Line framing (`\n`).
    pub fn line() -> Self {
        FramingSpec::Delimiter(Bytes::from_static(b"\n"))
    }

    /// Exact-length framing.
    pub fn exact(len: usize) -> Self {
        FramingSpec::ExactLength(len)
    }

    /// Short variant name, used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            FramingSpec::Delimiter(_) => "Delimiter",
            FramingSpec::ExactLength(_) => "ExactLength",
            FramingSpec::OneMessage => "OneMessage",
            FramingSpec::ToEof => "ToEof",
        }
    }

    /// Reject malformed specs: empty delimiter or zero length.
    pub fn validate(&self) -> Result<()> {
        match self {
            FramingSpec::Delimiter(d) if d.is_empty() => {
                Err(SocketError::InvalidFramingSpec("empty delimiter"))
            }
            FramingSpec::ExactLength(0) => {
                Err(SocketError::InvalidFramingSpec("exact length must be positive"))
            }
            _ => Ok(()),
        }
    }

    /// Validate the spec and check that `transport` can honor it.
    pub fn check_for(&self, transport: TransportKind) -> Result<()> {
        self.validate()?;

        let supported = match transport {
            TransportKind::Stream => !matches!(self, FramingSpec::OneMessage),
            TransportKind::Datagram => matches!(self, FramingSpec::OneMessage),
        };

        if supported {
            Ok(())
        } else {
            Err(SocketError::UnsupportedFramingSpec {
                spec: self.name(),
                transport,
            })
        }
    }
}

impl From<&'static str> for FramingSpec {
    fn from(delimiter: &'static str) -> Self {
        FramingSpec::Delimiter(Bytes::from_static(delimiter.as_bytes()))
    }
}

impl From<usize> for FramingSpec {
    fn from(len: usize) -> Self {
        FramingSpec::ExactLength(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_delimiter_rejected() {
        let err = FramingSpec::delimiter("").validate().unwrap_err();
        assert!(matches!(err, SocketError::InvalidFramingSpec(_)));
    }

    #[test]
    fn test_zero_length_rejected() {
        let err = FramingSpec::exact(0).validate().unwrap_err();
        assert!(matches!(err, SocketError::InvalidFramingSpec(_)));
    }

    #[test]
    fn test_stream_support() {
        assert!(FramingSpec::line().check_for(TransportKind::Stream).is_ok());
        assert!(FramingSpec::exact(4).check_for(TransportKind::Stream).is_ok());
        assert!(FramingSpec::ToEof.check_for(TransportKind::Stream).is_ok());
        assert!(matches!(
            FramingSpec::OneMessage.check_for(TransportKind::Stream),
            Err(SocketError::UnsupportedFramingSpec { spec: "OneMessage", .. })
        ));
    }

    #[test]
    fn test_datagram_support() {
        assert!(FramingSpec::OneMessage
            .check_for(TransportKind::Datagram)
            .is_ok());
        for spec in [FramingSpec::line(), FramingSpec::exact(8), FramingSpec::ToEof] {
            assert!(matches!(
                spec.check_for(TransportKind::Datagram),
                Err(SocketError::UnsupportedFramingSpec { .. })
            ));
        }
    }

    #[test]
    fn test_invalid_reported_before_unsupported() {
        let err = FramingSpec::delimiter(b"")
            .check_for(TransportKind::Datagram)
            .unwrap_err();
        assert!(matches!(err, SocketError::InvalidFramingSpec(_)));
    }

    #[test]
    fn test_conversions() {
        assert_eq!(FramingSpec::from("\r\n"), FramingSpec::delimiter(b"\r\n"));
        assert_eq!(FramingSpec::from(16usize), FramingSpec::ExactLength(16));
    }
}

//! Byte-stream transports
//!
//! A transport hands out its read and write halves once each. A
//! [`Connection`](super::Connection) takes both at construction, drives the
//! reader from its read loop and writes commands through the writer.

use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Readable half of a transport
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writable half of a transport
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Abstraction for meter communication channels (serial, Bluetooth SPP, pipes)
pub trait Transport: Send {
    /// Take the readable source. `None` if the transport is not open or the
    /// reader was already taken.
    fn take_reader(&mut self) -> Option<BoxedReader>;

    /// Take the writable sink. `None` if the transport is not open or the
    /// writer was already taken.
    fn take_writer(&mut self) -> Option<BoxedWriter>;

    /// Release the underlying device
    fn close(&mut self) -> io::Result<()>;

    /// Human-readable name for logs
    fn name(&self) -> &str {
        "transport"
    }
}

/// Transport over any async byte stream
pub struct StreamTransport {
    name: String,
    reader: Option<BoxedReader>,
    writer: Option<BoxedWriter>,
}

impl StreamTransport {
    /// Wrap a bidirectional stream
    pub fn new<S>(name: impl Into<String>, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(name, Box::new(reader), Box::new(writer))
    }

    /// Build from separate halves
    pub fn from_parts(name: impl Into<String>, reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            name: name.into(),
            reader: Some(reader),
            writer: Some(writer),
        }
    }

    /// A transport that was never opened
    pub fn closed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reader: None,
            writer: None,
        }
    }
}

impl Transport for StreamTransport {
    fn take_reader(&mut self) -> Option<BoxedReader> {
        self.reader.take()
    }

    fn take_writer(&mut self) -> Option<BoxedWriter> {
        self.writer.take()
    }

    fn close(&mut self) -> io::Result<()> {
        // Halves held by the connection close the stream when dropped.
        self.reader = None;
        self.writer = None;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_halves_taken_once() {
        let (a, _b) = tokio::io::duplex(64);
        let mut transport = StreamTransport::new("pipe", a);
        assert_eq!(transport.name(), "pipe");
        assert!(transport.take_reader().is_some());
        assert!(transport.take_reader().is_none());
        assert!(transport.take_writer().is_some());
        assert!(transport.take_writer().is_none());
    }

    #[test]
    fn test_closed_transport_has_no_halves() {
        let mut transport = StreamTransport::closed("nothing");
        assert!(transport.take_reader().is_none());
        assert!(transport.take_writer().is_none());
        assert!(transport.close().is_ok());
    }
}

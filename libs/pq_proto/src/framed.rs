//! Provides `Framed` -- writing/flushing and reading Postgres messages to/from
//! the async stream based on (and buffered with) BytesMut. All functions are
//! cancellation safe.
//!
//! It is similar to what tokio_util::codec::Framed with appropriate codec
//! provides, but the read and write buffers are under our control, short reads
//! just loop, and error messages carry protocol context.

use bytes::{Buf, BytesMut};
use std::io::{self, ErrorKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{BeMessage, FeMessage, ProtocolError};

const INITIAL_CAPACITY: usize = 8 * 1024;

/// Error on postgres connection: either IO (physical transport error) or
/// protocol violation.
#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Wraps async io `stream`, providing messages to write/flush + read Postgres
/// messages.
pub struct Framed<S> {
    stream: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<S> Framed<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            write_buf: BytesMut::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Get a shared reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Extract the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + Unpin> Framed<S> {
    /// Read the next backend message. Returns Ok(None) on clean EOF. EOF in
    /// the middle of a message is an error.
    pub async fn read_message(&mut self) -> Result<Option<BeMessage>, ConnectionError> {
        loop {
            if let Some(msg) = BeMessage::parse(&mut self.read_buf)? {
                return Ok(Some(msg));
            }
            // If we can't build a frame yet, try to read more data and try again.
            // Make sure we've got room for at least one byte to read to ensure
            // that we don't get a spurious 0 that looks like EOF.
            self.read_buf.reserve(1);
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                if self.read_buf.has_remaining() {
                    return Err(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "EOF with unprocessed data in the buffer",
                    )
                    .into());
                } else {
                    return Ok(None); // clean EOF
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> Framed<S> {
    /// Write next message to the output buffer; doesn't flush.
    pub fn write_message(&mut self, msg: &FeMessage<'_>) {
        msg.write(&mut self.write_buf);
    }

    /// Flush out the buffer. This function is cancellation safe: it can be
    /// interrupted and flushing will be continued in the next call.
    pub async fn flush(&mut self) -> Result<(), io::Error> {
        while self.write_buf.has_remaining() {
            let bytes_written = self.stream.write(self.write_buf.chunk()).await?;
            if bytes_written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "failed to write message",
                ));
            }
            self.write_buf.advance(bytes_written);
        }
        self.write_buf.clear();
        self.stream.flush().await
    }

    /// Write a message and flush it out.
    pub async fn send(&mut self, msg: &FeMessage<'_>) -> Result<(), io::Error> {
        self.write_message(msg);
        self.flush().await
    }

    /// Flush out the buffer and shutdown the stream.
    pub async fn shutdown(&mut self) -> Result<(), io::Error> {
        self.flush().await?;
        self.stream.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[tokio::test]
    async fn read_message_across_short_reads() {
        // CopyDone split over two reads through a duplex pipe.
        let (client, mut server) = tokio::io::duplex(4);
        let mut framed = Framed::new(client);

        let write = async {
            let mut buf = BytesMut::new();
            buf.put_u8(b'c');
            buf.put_u32(4);
            server.write_all(&buf).await.unwrap();
            drop(server);
        };
        let (msg, ()) = tokio::join!(framed.read_message(), write);
        assert_eq!(msg.unwrap(), Some(BeMessage::CopyDone));
        assert_eq!(framed.read_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn eof_mid_message_is_an_error() {
        let (client, mut server) = tokio::io::duplex(16);
        let mut framed = Framed::new(client);
        server.write_all(&[b'd', 0, 0, 0, 10]).await.unwrap();
        drop(server);
        assert!(framed.read_message().await.is_err());
    }
}

//! Low-level record connection.
//!
//! Frames a duplex byte stream into [`Record`]s. Reads happen on one task
//! (the multiplexer's dispatch loop); writes go through a cloneable
//! [`RecordWriter`] so request tasks can write concurrently.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::error::{FcgiError, Result};
use crate::protocol::{Record, RecordBuffer};
use crate::writer::RecordWriter;

/// Boxed read half of a transport.
pub type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// One FastCGI connection over an already-accepted stream.
pub struct Connection {
    reader: BoxedReader,
    buffer: RecordBuffer,
    writer: RecordWriter,
}

impl Connection {
    /// Wrap a duplex stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: Box::new(read_half),
            buffer: RecordBuffer::new(),
            writer: RecordWriter::new(write_half),
        }
    }

    /// Read the next record.
    ///
    /// Returns `Ok(None)` when the peer closed the stream at a record
    /// boundary. A malformed header or a stream ending mid-record closes the
    /// connection and returns a protocol error.
    ///
    /// Cancel safe: bytes already received stay buffered.
    pub async fn read(&mut self) -> Result<Option<Record>> {
        if self.writer.is_closed() {
            return Err(FcgiError::ConnectionClosed);
        }

        loop {
            match self.buffer.next_record() {
                Ok(Some(record)) => return Ok(Some(record)),
                Ok(None) => {}
                Err(e) => {
                    self.close().await;
                    return Err(e);
                }
            }

            let n = match self.reader.read_buf(self.buffer.buf_mut()).await {
                Ok(n) => n,
                Err(e) => {
                    self.close().await;
                    return Err(e.into());
                }
            };
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let pending = self.buffer.len();
                self.close().await;
                return Err(FcgiError::protocol(format!(
                    "Incomplete record at end of stream ({} bytes buffered)",
                    pending
                )));
            }
        }
    }

    /// Write one record.
    pub async fn write(&self, record: &Record) -> Result<()> {
        self.writer.write(record).await
    }

    /// Cloneable handle to the write side.
    pub fn writer(&self) -> RecordWriter {
        self.writer.clone()
    }

    /// True once the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.writer.is_closed()
    }

    /// Close the connection. Idempotent.
    pub async fn close(&self) {
        self.writer.close().await;
    }
}

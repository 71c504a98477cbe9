//! Shared, serialized record writer.
//!
//! Every open request and the multiplexer itself write to the same
//! transport. [`RecordWriter`] is a cheaply cloneable handle around the
//! write half; one `tokio::sync::Mutex` makes each record (header, payload,
//! padding) land on the wire as a unit.
//!
//! # Architecture
//!
//! ```text
//! Multiplexer ─┐
//! Request 1   ─┼─► RecordWriter (Mutex) ─► write half
//! Request N   ─┘
//! ```
//!
//! Closing is idempotent and shuts the transport down exactly once. A write
//! blocked on a peer that stopped reading is interrupted by `close()`.

use std::io::IoSlice;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};

use crate::error::{FcgiError, Result};
use crate::protocol::{Record, HEADER_SIZE};

/// Boxed write half of a transport.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Padding source; padding content is unspecified, zeros are used.
const PADDING: [u8; 8] = [0u8; 8];

/// A record ready to be written to the transport.
#[derive(Debug)]
pub struct OutboundRecord {
    /// Pre-encoded header (8 bytes).
    pub header: [u8; HEADER_SIZE],
    /// Payload bytes.
    pub payload: Bytes,
    /// Number of padding bytes after the payload.
    pub padding: usize,
}

impl OutboundRecord {
    /// Encode a record for writing.
    ///
    /// Fails if the payload does not fit into one record.
    pub fn new(record: &Record) -> Result<Self> {
        let header = record.header()?;
        Ok(Self {
            header: header.encode(),
            payload: record.payload.clone(),
            padding: header.padding_length as usize,
        })
    }

    /// Total size of this record on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len() + self.padding
    }

    fn slices(&self) -> [&[u8]; 3] {
        [&self.header[..], &self.payload[..], &PADDING[..self.padding]]
    }
}

struct WriterInner {
    /// `None` once the transport has been shut down.
    io: Mutex<Option<BoxedWriter>>,
    /// Flips to `true` exactly once, on close.
    closed: watch::Sender<bool>,
}

/// Handle for writing records to a shared transport.
#[derive(Clone)]
pub struct RecordWriter {
    inner: Arc<WriterInner>,
}

impl RecordWriter {
    /// Wrap the write half of a transport.
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(WriterInner {
                io: Mutex::new(Some(Box::new(writer))),
                closed,
            }),
        }
    }

    /// True once `close()` was called or a write failed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Write one record atomically with respect to other writers.
    ///
    /// Fails with `ConnectionClosed` immediately if the writer is closed.
    /// A transport error closes the writer.
    pub async fn write(&self, record: &Record) -> Result<()> {
        let out = OutboundRecord::new(record)?;
        let mut closed_rx = self.inner.closed.subscribe();

        let mut guard = self.inner.io.lock().await;
        if self.is_closed() {
            return Err(FcgiError::ConnectionClosed);
        }
        let Some(io) = guard.as_mut() else {
            return Err(FcgiError::ConnectionClosed);
        };

        let result = tokio::select! {
            res = write_record(io, &out) => res,
            _ = wait_closed(&mut closed_rx) => Err(FcgiError::ConnectionClosed),
        };

        if let Err(e) = result {
            if self.inner.closed.send_replace(true) {
                return Err(e);
            }
            tracing::debug!("Closing connection after write error: {}", e);
            if let Some(mut io) = guard.take() {
                let _ = io.shutdown().await;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Close the transport. Idempotent.
    pub async fn close(&self) {
        self.inner.closed.send_replace(true);
        let mut guard = self.inner.io.lock().await;
        if let Some(mut io) = guard.take() {
            let _ = io.shutdown().await;
        }
    }
}

/// Resolve once the close flag is set.
async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    loop {
        let closed = *rx.borrow_and_update();
        if closed || rx.changed().await.is_err() {
            return;
        }
    }
}

/// Write one record using scatter/gather I/O (write_vectored).
async fn write_record<W>(writer: &mut W, record: &OutboundRecord) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let total_size = record.size();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(record, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(FcgiError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data not yet written.
fn build_remaining_slices(record: &OutboundRecord, skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(3);
    let mut offset = 0;

    for part in record.slices() {
        let end = offset + part.len();
        if !part.is_empty() && skip_bytes < end {
            let start_in_part = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&part[start_in_part..]));
        }
        offset = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RecordBuffer, RecordType};
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    fn stdout_record(request_id: u16, payload: &'static [u8]) -> Record {
        Record::new(RecordType::Stdout, request_id, Bytes::from_static(payload))
    }

    #[test]
    fn test_outbound_record_size() {
        let out = OutboundRecord::new(&stdout_record(1, b"hello")).unwrap();
        assert_eq!(out.padding, 3);
        assert_eq!(out.size(), HEADER_SIZE + 8);
    }

    #[test]
    fn test_build_remaining_slices_no_skip() {
        let out = OutboundRecord::new(&stdout_record(1, b"hello")).unwrap();
        let slices = build_remaining_slices(&out, 0);
        assert_eq!(slices.len(), 3);
    }

    #[test]
    fn test_build_remaining_slices_partial_header() {
        let out = OutboundRecord::new(&stdout_record(1, b"hello")).unwrap();
        let slices = build_remaining_slices(&out, 5);
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0].len(), HEADER_SIZE - 5);
        assert_eq!(slices[1].len(), 5);
        assert_eq!(slices[2].len(), 3);
    }

    #[test]
    fn test_build_remaining_slices_into_padding() {
        let out = OutboundRecord::new(&stdout_record(1, b"hello")).unwrap();
        let slices = build_remaining_slices(&out, HEADER_SIZE + 6);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), 2);
    }

    #[test]
    fn test_build_remaining_slices_empty_payload() {
        let out = OutboundRecord::new(&stdout_record(1, b"")).unwrap();
        let slices = build_remaining_slices(&out, 0);
        assert_eq!(slices.len(), 1);
    }

    #[tokio::test]
    async fn test_write_record_to_cursor() {
        let mut buf = Cursor::new(Vec::new());
        let out = OutboundRecord::new(&stdout_record(9, b"abc")).unwrap();

        write_record(&mut buf, &out).await.unwrap();

        let written = buf.into_inner();
        assert_eq!(written.len(), 16);
        let records = RecordBuffer::new().push(&written).unwrap();
        assert_eq!(records[0].payload(), b"abc");
        assert_eq!(records[0].request_id, 9);
    }

    #[tokio::test]
    async fn test_writer_sends_records_in_order() {
        let (client, mut server) = duplex(4096);
        let writer = RecordWriter::new(client);

        for i in 1..=10u16 {
            writer.write(&stdout_record(i, b"chunk")).await.unwrap();
        }

        let mut buf = vec![0u8; 160];
        server.read_exact(&mut buf).await.unwrap();
        let records = RecordBuffer::new().push(&buf).unwrap();
        let ids: Vec<u16> = records.iter().map(|r| r.request_id).collect();
        assert_eq!(ids, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_interleave_records() {
        let (client, mut server) = duplex(64);
        let writer = RecordWriter::new(client);

        let mut tasks = Vec::new();
        for id in 1..=4u16 {
            let writer = writer.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..5 {
                    let payload = Bytes::from(vec![id as u8; 100]);
                    let record = Record::new(RecordType::Stdout, id, payload);
                    writer.write(&record).await.unwrap();
                }
            }));
        }

        let reader = tokio::spawn(async move {
            let mut buffer = RecordBuffer::new();
            let mut records = Vec::new();
            let mut chunk = [0u8; 256];
            while records.len() < 20 {
                let n = server.read(&mut chunk).await.unwrap();
                records.extend(buffer.push(&chunk[..n]).unwrap());
            }
            records
        });

        for task in tasks {
            task.await.unwrap();
        }
        let records = reader.await.unwrap();
        for record in records {
            assert!(record.payload().iter().all(|&b| b == record.request_id as u8));
        }
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (client, _server) = duplex(4096);
        let writer = RecordWriter::new(client);

        writer.close().await;
        writer.close().await;

        assert!(writer.is_closed());
        let err = writer.write(&stdout_record(1, b"x")).await.unwrap_err();
        assert!(matches!(err, FcgiError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_close_interrupts_blocked_write() {
        let (client, _server) = duplex(16);
        let writer = RecordWriter::new(client);

        let blocked = {
            let writer = writer.clone();
            tokio::spawn(async move {
                let record = Record::new(RecordType::Stdout, 1, Bytes::from(vec![0u8; 1024]));
                writer.write(&record).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(FcgiError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_transport_error_closes_writer() {
        let (client, server) = duplex(4096);
        drop(server);
        let writer = RecordWriter::new(client);

        assert!(writer.write(&stdout_record(1, b"x")).await.is_err());
        assert!(writer.is_closed());
    }
}
